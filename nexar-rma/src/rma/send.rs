use super::{
    Callback, Engine, Finished, Protocol, RegSource, RegWindow, RequestId, RmaOp, RmaRequest,
};
use crate::config::Features;
use crate::endpoint::{EndpointId, Rkey};
use crate::error::{Result, RmaError};
use crate::lane::{CompletionToken, LaneStatus};
use crate::md::RegFlags;
use crate::memory::{MemHandleFlags, MemMapping, Registry};
use crate::types::{Datatype, MdIndex, MdMap, MemoryType};
use crate::worker::Context;
use std::sync::Arc;

/// Optional arguments of `put_nbx` / `get_nbx`.
#[derive(Default)]
pub struct RequestParams {
    pub callback: Option<Callback>,
    /// Complete inline or fail with `NoResource`; never create a request.
    pub force_imm_cmpl: bool,
    /// Never complete inline; always report through the callback.
    pub no_imm_cmpl: bool,
    /// `count` is in elements of this datatype instead of bytes.
    pub datatype: Option<Datatype>,
    /// Memory type of the local buffer (host when unset).
    pub mem_type: Option<MemoryType>,
    /// Registration covering the local buffer, used instead of the cache.
    pub memh: Option<MemMapping>,
}

impl RequestParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_complete(mut self, f: impl FnOnce(Result<()>) + Send + 'static) -> Self {
        self.callback = Some(Box::new(f));
        self
    }

    pub fn force_imm_cmpl(mut self) -> Self {
        self.force_imm_cmpl = true;
        self
    }

    pub fn no_imm_cmpl(mut self) -> Self {
        self.no_imm_cmpl = true;
        self
    }

    pub fn datatype(mut self, datatype: Datatype) -> Self {
        self.datatype = Some(datatype);
        self
    }

    pub fn mem_type(mut self, mem_type: MemoryType) -> Self {
        self.mem_type = Some(mem_type);
        self
    }

    pub fn memh(mut self, memh: MemMapping) -> Self {
        self.memh = Some(memh);
        self
    }
}

impl std::fmt::Debug for RequestParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestParams")
            .field("callback", &self.callback.is_some())
            .field("force_imm_cmpl", &self.force_imm_cmpl)
            .field("no_imm_cmpl", &self.no_imm_cmpl)
            .field("datatype", &self.datatype)
            .field("mem_type", &self.mem_type)
            .field("memh", &self.memh)
            .finish()
    }
}

/// Outcome of a successful `put_nbx` / `get_nbx` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmaStatus {
    /// Completed before returning. The callback is not invoked.
    Done,
    /// The callback fires once the request completes.
    InProgress(RequestId),
}

/// One PUT/GET call.
pub(crate) struct Transfer<'a> {
    pub(crate) op: RmaOp,
    pub(crate) ep: EndpointId,
    pub(crate) buffer: u64,
    pub(crate) count: usize,
    pub(crate) remote_addr: u64,
    pub(crate) rkey: &'a Rkey,
}

/// Where `issue` left a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Issued {
    /// The lane ran out of send resources; the request must be parked.
    NoResource,
    /// Fully issued (or failed) with zero-copy fragments still in flight.
    InFlight,
    Complete,
}

impl Engine {
    /// Start a transfer. Requests that complete during the call are pushed to
    /// `finished` only when the caller asked for `no_imm_cmpl`; otherwise
    /// their status is returned directly.
    ///
    /// # Safety
    /// `t.buffer` must be valid for the access `t.op` implies, for the byte
    /// length of the transfer, until the request completes.
    pub(crate) unsafe fn submit(
        &mut self,
        context: &Context,
        t: Transfer<'_>,
        params: RequestParams,
        finished: &mut Vec<Finished>,
    ) -> Result<RmaStatus> {
        if !context.params().features.contains(Features::RMA) {
            return Err(RmaError::invalid_param("context was created without RMA"));
        }
        if t.rkey.ep != t.ep {
            return Err(RmaError::invalid_param(format!(
                "rkey was unpacked for {}, not {}",
                t.rkey.ep, t.ep
            )));
        }
        let length = match params.datatype {
            None => t.count,
            Some(dt) => dt.length(t.count).ok_or_else(|| {
                RmaError::invalid_param(format!("{} elements of {dt:?} overflow", t.count))
            })?,
        };
        if length == 0 {
            return Ok(RmaStatus::Done);
        }
        if t.buffer == 0 {
            return Err(RmaError::invalid_param(format!("null buffer for {length} bytes")));
        }

        let cfg = t.rkey.config;
        let mem_type = params.mem_type.unwrap_or(MemoryType::Host);
        let (max_short, zcopy_thresh) = match t.op {
            RmaOp::Put => (cfg.max_put_short, cfg.put_zcopy_thresh),
            RmaOp::Get => (cfg.max_get_short, cfg.get_zcopy_thresh),
        };
        let ep = self.endpoint_mut(t.ep)?;

        let fast_path = params.datatype.is_none()
            && !params.no_imm_cmpl
            && length <= max_short
            && mem_type.is_accessible_from_cpu()
            && !ep.fence_required()
            && ep.pending.is_empty();
        if fast_path {
            let lane = ep.lane_mut(cfg.lane)?;
            // SAFETY: the caller guarantees `t.buffer` for `length` bytes.
            let res = unsafe {
                match t.op {
                    RmaOp::Put => lane.put_short(t.buffer, length, t.remote_addr, &t.rkey.material),
                    RmaOp::Get => lane.get_short(t.buffer, length, t.remote_addr, &t.rkey.material),
                }
            };
            match res {
                Ok(()) => {
                    ep.mark_unflushed(cfg.lane);
                    tracing::trace!(ep = %t.ep, op = ?t.op, length, "short");
                    return Ok(RmaStatus::Done);
                }
                Err(RmaError::NoResource) if params.force_imm_cmpl => {
                    return Err(RmaError::NoResource);
                }
                Err(RmaError::NoResource) => {
                    tracing::trace!(ep = %t.ep, length, "short path out of resources, using a request");
                }
                Err(e) => return Err(e),
            }
        } else if params.force_imm_cmpl {
            return Err(RmaError::NoResource);
        }

        let protocol = if !mem_type.is_accessible_from_cpu() {
            Protocol::Zcopy
        } else if length <= max_short {
            Protocol::Short
        } else if length < zcopy_thresh {
            Protocol::Bcopy
        } else {
            Protocol::Zcopy
        };
        let zcopy_md_map = ep.zcopy_md_map(t.rkey.md_map());
        let lane_md = ep.lane_mut(cfg.lane)?.attributes().md;

        let mut req = RmaRequest::new(
            t.op,
            protocol,
            t.ep,
            cfg.lane,
            t.buffer,
            length,
            t.remote_addr,
            Arc::clone(&t.rkey.material),
        );
        req.callback = params.callback;
        let id = self.requests.insert(req)?;

        if protocol == Protocol::Zcopy
            && let Err(e) = self.register(context, id, zcopy_md_map, lane_md, mem_type, params.memh)
        {
            self.requests.remove(id);
            return Err(e);
        }

        let ep = self.endpoint_mut(t.ep)?;
        if ep.fence_required() {
            ep.take_fence();
        }
        if !ep.pending.is_empty() {
            ep.park(id);
            if let Some(req) = self.requests.get_mut(id) {
                req.start();
            }
            tracing::trace!(ep = %t.ep, %id, "queued behind pending requests");
            return Ok(RmaStatus::InProgress(id));
        }

        tracing::trace!(ep = %t.ep, %id, op = ?t.op, ?protocol, length, "request");
        match self.issue(id)? {
            Issued::NoResource => {
                self.endpoint_mut(t.ep)?.park(id);
                Ok(RmaStatus::InProgress(id))
            }
            Issued::InFlight => Ok(RmaStatus::InProgress(id)),
            Issued::Complete => {
                let done = self.finalize(context, id)?;
                if params.no_imm_cmpl {
                    finished.push(done);
                    Ok(RmaStatus::InProgress(id))
                } else {
                    done.status.map(|()| RmaStatus::Done)
                }
            }
        }
    }

    /// Register the request's buffer for zero-copy and record the local key
    /// of the lane's domain.
    fn register(
        &mut self,
        context: &Context,
        id: RequestId,
        md_map: MdMap,
        lane_md: MdIndex,
        mem_type: MemoryType,
        memh: Option<MemMapping>,
    ) -> Result<()> {
        let Some(req) = self.requests.get_mut(id) else {
            return Err(RmaError::invalid_param(format!("unknown request {id}")));
        };
        let access = match req.op {
            RmaOp::Put => RegFlags::LOCAL_READ,
            RmaOp::Get => RegFlags::LOCAL_WRITE,
        };
        let length = req.length();
        let mut registry = context.registry()?;

        let (reg, key) = match memh {
            Some(m) => {
                let covers = registry
                    .mapping(m)
                    .is_some_and(|h| h.contains(req.buffer, length));
                if !covers {
                    return Err(RmaError::invalid_param(format!(
                        "{length} bytes at {:#x} are outside the supplied memory handle",
                        req.buffer
                    )));
                }
                registry.ensure_mapped(m, md_map, access)?;
                let key = registry.mapping_backing(m).and_then(|h| h.key(lane_md));
                (RegSource::User(m), key)
            }
            None => {
                let limit = context.mds().max_reg_len(md_map).max(1);
                if length > limit {
                    let windows = register_windows(
                        &mut registry,
                        req.buffer,
                        length,
                        limit,
                        mem_type,
                        md_map,
                        access,
                        lane_md,
                    )?;
                    let key = windows.first().map(|w| w.key);
                    (RegSource::Windows(windows), key)
                } else {
                    let memref = registry.acquire(
                        req.buffer,
                        length,
                        mem_type,
                        md_map,
                        access,
                        MemHandleFlags::empty(),
                    )?;
                    let key = registry.key(&memref, lane_md);
                    (RegSource::Owned(memref), key)
                }
            }
        };

        req.reg = reg;
        match key {
            Some(k) => {
                req.local_key = Some(k);
                Ok(())
            }
            None => {
                for memref in std::mem::replace(&mut req.reg, RegSource::None).into_owned() {
                    registry.release(memref)?;
                }
                Err(RmaError::invalid_param(format!(
                    "buffer at {:#x} has no key on md {lane_md}",
                    req.buffer
                )))
            }
        }
    }

    /// Issue fragments until the request is fully issued, fails, or the lane
    /// runs out of send resources.
    pub(crate) fn issue(&mut self, id: RequestId) -> Result<Issued> {
        let Engine {
            endpoints,
            requests,
            bcopy,
            ..
        } = self;
        let Some(req) = requests.get_mut(id) else {
            return Err(RmaError::invalid_param(format!("unknown request {id}")));
        };
        req.start();
        let lane_idx = req.lane;
        let Some(ep) = endpoints.get_mut(req.ep.0) else {
            return Err(RmaError::invalid_param(format!("unknown endpoint {}", req.ep)));
        };
        let lane = ep.lane_mut(lane_idx)?;
        let attrs = lane.attributes();
        let max_frag = match (req.protocol, req.op) {
            (Protocol::Short, _) => usize::MAX,
            (Protocol::Bcopy, _) => attrs.max_bcopy.min(bcopy.chunk_bytes()),
            (Protocol::Zcopy, RmaOp::Put) => attrs.max_put_zcopy,
            (Protocol::Zcopy, RmaOp::Get) => attrs.max_get_zcopy,
        }
        .max(1);

        let mut issued_any = false;
        let mut out_of_resources = false;
        while !req.is_issue_done() {
            let mut frag = req.length().min(max_frag);
            let key = match req.protocol {
                Protocol::Zcopy => req.zcopy_key().map(|(key, window)| {
                    frag = frag.min(window);
                    key
                }),
                _ => None,
            };
            // SAFETY: `submit`'s caller keeps the buffer valid until the
            // request completes, and fragments never leave its range.
            let res = unsafe {
                match (req.protocol, req.op) {
                    (Protocol::Short, RmaOp::Put) => lane
                        .put_short(req.buffer, frag, req.remote_addr, &req.rkey)
                        .map(|()| (frag, false)),
                    (Protocol::Short, RmaOp::Get) => lane
                        .get_short(req.buffer, frag, req.remote_addr, &req.rkey)
                        .map(|()| (frag, false)),
                    (Protocol::Bcopy, op) => {
                        let mut chunk = bcopy.checkout(frag);
                        let n = chunk.len();
                        if n == 0 {
                            Err(RmaError::NoMemory {
                                what: "bounce buffer",
                            })
                        } else if op == RmaOp::Put {
                            std::ptr::copy_nonoverlapping(
                                req.buffer as *const u8,
                                chunk.as_mut_ptr(),
                                n,
                            );
                            lane.put_bcopy(&chunk, req.remote_addr, &req.rkey)
                                .map(|()| (n, false))
                        } else {
                            lane.get_bcopy(&mut chunk, req.remote_addr, &req.rkey)
                                .map(|()| {
                                    std::ptr::copy_nonoverlapping(
                                        chunk.as_ptr(),
                                        req.buffer as *mut u8,
                                        n,
                                    );
                                    (n, false)
                                })
                        }
                    }
                    (Protocol::Zcopy, op) => match key {
                        Some(key) => {
                            let token = CompletionToken {
                                request: id,
                                length: frag,
                            };
                            let status = if op == RmaOp::Put {
                                lane.put_zcopy(req.buffer, frag, key, req.remote_addr, &req.rkey, token)
                            } else {
                                lane.get_zcopy(req.buffer, frag, key, req.remote_addr, &req.rkey, token)
                            };
                            status.map(|s| (frag, s == LaneStatus::InProgress))
                        }
                        None => Err(RmaError::invalid_param(format!(
                            "{id} has no registration for zero-copy"
                        ))),
                    },
                }
            };
            match res {
                Ok((sent, in_flight)) => {
                    req.fragment_issued(sent, in_flight);
                    issued_any = true;
                }
                Err(RmaError::NoResource) => {
                    out_of_resources = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(%id, op = ?req.op, remote_addr = req.remote_addr, "fragment failed: {e}");
                    req.record_error(e);
                }
            }
        }

        if issued_any {
            ep.mark_unflushed(lane_idx);
        }
        if out_of_resources {
            tracing::trace!(%id, left = req.length(), "lane out of resources");
            return Ok(Issued::NoResource);
        }
        req.issue_finished();
        Ok(if req.is_complete() {
            Issued::Complete
        } else {
            Issued::InFlight
        })
    }
}

/// Register `[buffer, buffer + length)` as consecutive windows of at most
/// `limit` bytes. On failure every window acquired so far is released.
#[allow(clippy::too_many_arguments)]
fn register_windows(
    registry: &mut Registry,
    buffer: u64,
    length: usize,
    limit: usize,
    mem_type: MemoryType,
    md_map: MdMap,
    access: RegFlags,
    lane_md: MdIndex,
) -> Result<Vec<RegWindow>> {
    let end = buffer + length as u64;
    let mut windows: Vec<RegWindow> = Vec::with_capacity(length.div_ceil(limit));
    let mut start = buffer;
    while start < end {
        let len = ((end - start) as usize).min(limit);
        let acquired = registry
            .acquire(start, len, mem_type, md_map, access, MemHandleFlags::empty())
            .and_then(|memref| match registry.key(&memref, lane_md) {
                Some(key) => Ok((memref, key)),
                None => {
                    let _ = registry.release(memref);
                    Err(RmaError::invalid_param(format!(
                        "buffer at {start:#x} has no key on md {lane_md}"
                    )))
                }
            });
        match acquired {
            Ok((memref, key)) => windows.push(RegWindow {
                end: start + len as u64,
                memref,
                key,
            }),
            Err(e) => {
                for w in windows {
                    if let Err(release) = registry.release(w.memref) {
                        tracing::warn!(address = start, "failed to release window: {release}");
                    }
                }
                return Err(e);
            }
        }
        start += len as u64;
    }
    tracing::debug!(address = buffer, length, limit, windows = windows.len(), "registered in windows");
    Ok(windows)
}
