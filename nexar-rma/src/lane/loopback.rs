use super::{CompletionToken, LaneAttributes, LaneCompletion, LaneStatus, RmaLane};
use crate::error::{Result, RmaError};
use crate::md::{HostMd, MdKey};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Kind of operation a lane performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    PutShort,
    GetShort,
    PutBcopy,
    GetBcopy,
    PutZcopy,
    GetZcopy,
}

/// One operation accepted by a `LoopbackLane`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneOp {
    pub kind: OpKind,
    pub remote_addr: u64,
    pub length: usize,
}

struct Deferred {
    token: CompletionToken,
    src: u64,
    dst: u64,
    length: usize,
    error: Option<String>,
}

#[derive(Default)]
struct LoopbackState {
    deferred: VecDeque<Deferred>,
    /// Completions reported per `poll`; 0 means all.
    poll_batch: usize,
    no_resource: usize,
    /// Operations admitted before `no_resource` takes effect.
    no_resource_skip: usize,
    issue_error: Option<String>,
    completion_error: Option<String>,
    immediate_zcopy: bool,
    ops: Vec<LaneOp>,
}

/// In-process lane: "remote" memory lives in this process and is guarded by
/// keys registered with a `HostMd`.
///
/// Short and buffered-copy operations copy immediately. Zero-copy fragments
/// copy when `poll` reports them, so a request sees its completions only
/// after driving progress. Clones share state, so tests keep a clone to
/// inspect and inject faults after handing one to an endpoint.
#[derive(Clone)]
pub struct LoopbackLane {
    attrs: LaneAttributes,
    local: Arc<HostMd>,
    remote: Arc<HostMd>,
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackLane {
    /// `local` validates zero-copy keys of local buffers; `remote` validates
    /// remote key material.
    pub fn new(attrs: LaneAttributes, local: Arc<HostMd>, remote: Arc<HostMd>) -> Self {
        Self {
            attrs,
            local,
            remote,
            state: Arc::new(Mutex::new(LoopbackState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report at most `n` completions per `poll` (0 = unlimited).
    pub fn set_poll_batch(&self, n: usize) {
        self.lock().poll_batch = n;
    }

    /// Complete zero-copy fragments inline (`LaneStatus::Done`).
    pub fn set_immediate_zcopy(&self, enabled: bool) {
        self.lock().immediate_zcopy = enabled;
    }

    /// Fail the next `n` operations with `NoResource`.
    pub fn inject_no_resource(&self, n: usize) {
        self.inject_no_resource_after(0, n);
    }

    /// Admit `skip` more operations, then fail the `n` after them with
    /// `NoResource`.
    pub fn inject_no_resource_after(&self, skip: usize, n: usize) {
        let mut state = self.lock();
        state.no_resource_skip = skip;
        state.no_resource = n;
    }

    /// Fail the next operation at issue time with a transport error.
    pub fn inject_issue_error(&self, message: &str) {
        self.lock().issue_error = Some(message.to_string());
    }

    /// Complete the next zero-copy fragment with a transport error.
    pub fn inject_completion_error(&self, message: &str) {
        self.lock().completion_error = Some(message.to_string());
    }

    /// Operations accepted so far, in issue order.
    pub fn ops(&self) -> Vec<LaneOp> {
        self.lock().ops.clone()
    }

    pub fn count(&self, kind: OpKind) -> usize {
        self.lock().ops.iter().filter(|op| op.kind == kind).count()
    }

    /// Zero-copy fragments issued but not yet reported.
    pub fn outstanding(&self) -> usize {
        self.lock().deferred.len()
    }

    /// Gate every operation on injected faults and remote access rights.
    fn admit(&self, kind: OpKind, remote_addr: u64, length: usize, rkey: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if state.no_resource > 0 {
            if state.no_resource_skip > 0 {
                state.no_resource_skip -= 1;
            } else {
                state.no_resource -= 1;
                return Err(RmaError::NoResource);
            }
        }
        if let Some(message) = state.issue_error.take() {
            return Err(RmaError::transport(message));
        }
        if !self.remote.validate_rkey(rkey, remote_addr, length) {
            return Err(RmaError::transport(format!(
                "remote access violation: {length} bytes at {remote_addr:#x}"
            )));
        }
        state.ops.push(LaneOp {
            kind,
            remote_addr,
            length,
        });
        tracing::trace!(?kind, remote_addr, length, "loopback op");
        Ok(())
    }

    fn check_short(length: usize, max: usize) -> Result<()> {
        if length > max {
            return Err(RmaError::invalid_param(format!(
                "{length} bytes exceeds the short limit {max}"
            )));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn zcopy(
        &mut self,
        kind: OpKind,
        src: u64,
        dst: u64,
        length: usize,
        local: (u64, MdKey),
        remote_addr: u64,
        rkey: &[u8],
        token: CompletionToken,
    ) -> Result<LaneStatus> {
        let (buffer, local_key) = local;
        if !self.local.key_covers(local_key, buffer, length) {
            return Err(RmaError::transport(format!(
                "local key {} does not cover {length} bytes at {buffer:#x}",
                local_key.0
            )));
        }
        self.admit(kind, remote_addr, length, rkey)?;
        let mut state = self.lock();
        let error = state.completion_error.take();
        if state.immediate_zcopy && error.is_none() {
            drop(state);
            // SAFETY: caller of put_zcopy/get_zcopy guarantees both ranges.
            unsafe { copy(src, dst, length) };
            return Ok(LaneStatus::Done);
        }
        state.deferred.push_back(Deferred {
            token,
            src,
            dst,
            length,
            error,
        });
        Ok(LaneStatus::InProgress)
    }
}

/// Copy between raw addresses; ranges may overlap.
unsafe fn copy(src: u64, dst: u64, length: usize) {
    if length > 0 {
        unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, length) };
    }
}

impl RmaLane for LoopbackLane {
    fn attributes(&self) -> &LaneAttributes {
        &self.attrs
    }

    unsafe fn put_short(
        &mut self,
        buffer: u64,
        length: usize,
        remote_addr: u64,
        rkey: &[u8],
    ) -> Result<()> {
        Self::check_short(length, self.attrs.max_put_short)?;
        self.admit(OpKind::PutShort, remote_addr, length, rkey)?;
        unsafe { copy(buffer, remote_addr, length) };
        Ok(())
    }

    unsafe fn get_short(
        &mut self,
        buffer: u64,
        length: usize,
        remote_addr: u64,
        rkey: &[u8],
    ) -> Result<()> {
        Self::check_short(length, self.attrs.max_get_short)?;
        self.admit(OpKind::GetShort, remote_addr, length, rkey)?;
        unsafe { copy(remote_addr, buffer, length) };
        Ok(())
    }

    fn put_bcopy(&mut self, payload: &[u8], remote_addr: u64, rkey: &[u8]) -> Result<()> {
        self.admit(OpKind::PutBcopy, remote_addr, payload.len(), rkey)?;
        // SAFETY: `admit` checked the remote range against a live registration.
        unsafe { copy(payload.as_ptr() as u64, remote_addr, payload.len()) };
        Ok(())
    }

    fn get_bcopy(&mut self, dest: &mut [u8], remote_addr: u64, rkey: &[u8]) -> Result<()> {
        self.admit(OpKind::GetBcopy, remote_addr, dest.len(), rkey)?;
        // SAFETY: `admit` checked the remote range against a live registration.
        unsafe { copy(remote_addr, dest.as_mut_ptr() as u64, dest.len()) };
        Ok(())
    }

    unsafe fn put_zcopy(
        &mut self,
        buffer: u64,
        length: usize,
        local_key: MdKey,
        remote_addr: u64,
        rkey: &[u8],
        token: CompletionToken,
    ) -> Result<LaneStatus> {
        self.zcopy(
            OpKind::PutZcopy,
            buffer,
            remote_addr,
            length,
            (buffer, local_key),
            remote_addr,
            rkey,
            token,
        )
    }

    unsafe fn get_zcopy(
        &mut self,
        buffer: u64,
        length: usize,
        local_key: MdKey,
        remote_addr: u64,
        rkey: &[u8],
        token: CompletionToken,
    ) -> Result<LaneStatus> {
        self.zcopy(
            OpKind::GetZcopy,
            remote_addr,
            buffer,
            length,
            (buffer, local_key),
            remote_addr,
            rkey,
            token,
        )
    }

    fn poll(&mut self, out: &mut Vec<LaneCompletion>) -> usize {
        let mut state = self.lock();
        let n = match state.poll_batch {
            0 => state.deferred.len(),
            batch => batch.min(state.deferred.len()),
        };
        let ready: Vec<Deferred> = state.deferred.drain(..n).collect();
        drop(state);
        for d in ready {
            let status = match d.error {
                Some(message) => Err(RmaError::transport(message)),
                None => {
                    // SAFETY: the issuer keeps both ranges valid until this
                    // completion is reported.
                    unsafe { copy(d.src, d.dst, d.length) };
                    Ok(())
                }
            };
            out.push(LaneCompletion {
                token: d.token,
                status,
            });
        }
        n
    }
}

impl std::fmt::Debug for LoopbackLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackLane")
            .field("md", &self.attrs.md)
            .field("rkey_md", &self.attrs.rkey_md)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
