use crate::endpoint::EndpointId;
use crate::error::{Result, RmaError};
use crate::md::MdKey;
use crate::memory::{MemMapping, MemRef};
use std::sync::Arc;

/// User completion, invoked exactly once with the aggregated status.
pub type Callback = Box<dyn FnOnce(Result<()>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RmaOp {
    Put,
    Get,
}

/// How a request moves its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Inline in the work request.
    Short,
    /// Staged through bounce buffers; completes synchronously.
    Bcopy,
    /// Directly against registered user memory.
    Zcopy,
}

/// Lifecycle of a request.
///
/// `Fragmenting` covers issuance, including time spent parked on the
/// endpoint's pending queue. A request moves to `Completing` once nothing is
/// left to issue (or issuing failed) and is released when its in-flight
/// fragments drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Init,
    Fragmenting,
    Completing,
    Released,
}

/// Registration a zero-copy request holds on its buffer.
pub(crate) enum RegSource {
    None,
    /// Acquired for this request and released when it completes.
    Owned(MemRef),
    /// One registration per window of at most the domains' maximum
    /// registration length, in address order.
    Windows(Vec<RegWindow>),
    /// Supplied by the caller; the caller owns its lifetime.
    User(MemMapping),
}

impl RegSource {
    /// Registrations the request must release when it completes.
    pub(crate) fn into_owned(self) -> Vec<MemRef> {
        match self {
            RegSource::Owned(memref) => vec![memref],
            RegSource::Windows(windows) => windows.into_iter().map(|w| w.memref).collect(),
            RegSource::None | RegSource::User(_) => Vec::new(),
        }
    }
}

/// A registered slice of a request buffer ending at `end`.
pub(crate) struct RegWindow {
    pub(crate) end: u64,
    pub(crate) memref: MemRef,
    pub(crate) key: MdKey,
}

/// Snapshot of a request's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestProgress {
    pub op: RmaOp,
    pub protocol: Protocol,
    pub state: RequestState,
    /// Bytes not yet handed to the lane.
    pub unissued: usize,
    /// Bytes not yet acknowledged.
    pub remaining: usize,
    /// Zero-copy fragments issued and not yet completed.
    pub outstanding: usize,
}

pub(crate) struct RmaRequest {
    pub(crate) op: RmaOp,
    pub(crate) protocol: Protocol,
    state: RequestState,
    pub(crate) ep: EndpointId,
    pub(crate) lane: usize,
    pub(crate) buffer: u64,
    pub(crate) remote_addr: u64,
    length: usize,
    total: usize,
    acked: usize,
    comp_count: usize,
    pub(crate) rkey: Arc<[u8]>,
    pub(crate) reg: RegSource,
    pub(crate) local_key: Option<MdKey>,
    error: Option<RmaError>,
    pub(crate) callback: Option<Callback>,
}

impl RmaRequest {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        op: RmaOp,
        protocol: Protocol,
        ep: EndpointId,
        lane: usize,
        buffer: u64,
        length: usize,
        remote_addr: u64,
        rkey: Arc<[u8]>,
    ) -> Self {
        Self {
            op,
            protocol,
            state: RequestState::Init,
            ep,
            lane,
            buffer,
            remote_addr,
            length,
            total: length,
            acked: 0,
            comp_count: 0,
            rkey,
            reg: RegSource::None,
            local_key: None,
            error: None,
            callback: None,
        }
    }

    /// Bytes not yet issued.
    pub(crate) fn length(&self) -> usize {
        self.length
    }

    pub(crate) fn state(&self) -> RequestState {
        self.state
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.comp_count
    }

    /// Local key for the next zero-copy fragment, and how many bytes from
    /// the current position it covers.
    pub(crate) fn zcopy_key(&self) -> Option<(MdKey, usize)> {
        match &self.reg {
            RegSource::Windows(windows) => windows
                .iter()
                .find(|w| w.end > self.buffer)
                .map(|w| (w.key, (w.end - self.buffer) as usize)),
            _ => self.local_key.map(|k| (k, usize::MAX)),
        }
    }

    /// Nothing more will be issued.
    pub(crate) fn is_issue_done(&self) -> bool {
        self.length == 0 || self.error.is_some()
    }

    pub(crate) fn progress(&self) -> RequestProgress {
        RequestProgress {
            op: self.op,
            protocol: self.protocol,
            state: self.state,
            unissued: self.length,
            remaining: self.total - self.acked,
            outstanding: self.comp_count,
        }
    }

    pub(crate) fn start(&mut self) {
        if self.state == RequestState::Init {
            self.state = RequestState::Fragmenting;
        }
    }

    /// Account for a fragment of `frag` bytes handed to the lane. `in_flight`
    /// fragments hold the completion counter until the lane reports them.
    pub(crate) fn fragment_issued(&mut self, frag: usize, in_flight: bool) {
        assert!(
            frag <= self.length,
            "fragment of {frag} bytes exceeds the {} left to issue",
            self.length
        );
        self.length -= frag;
        self.buffer += frag as u64;
        self.remote_addr += frag as u64;
        if in_flight {
            self.comp_count += 1;
        } else {
            self.acked += frag;
        }
    }

    /// An in-flight fragment finished. Returns `false` if nothing was in
    /// flight, in which case the completion is ignored.
    pub(crate) fn fragment_completed(&mut self, frag: usize, status: Result<()>) -> bool {
        if self.comp_count == 0 {
            return false;
        }
        self.comp_count -= 1;
        match status {
            Ok(()) => self.acked += frag,
            Err(e) => self.record_error(e),
        }
        true
    }

    /// Keep the first failure; later ones are logged and dropped.
    pub(crate) fn record_error(&mut self, e: RmaError) {
        if self.error.is_none() {
            self.error = Some(e);
        } else {
            tracing::debug!(op = ?self.op, "dropping secondary fragment error: {e}");
        }
    }

    /// Issuance is over; move to `Completing`.
    pub(crate) fn issue_finished(&mut self) {
        if matches!(self.state, RequestState::Init | RequestState::Fragmenting) {
            self.state = RequestState::Completing;
        }
    }

    /// Every issued byte is accounted for and no more will be issued.
    pub(crate) fn is_complete(&self) -> bool {
        self.state == RequestState::Completing && self.comp_count == 0 && self.is_issue_done()
    }

    /// Final status: the first error, or success.
    pub(crate) fn take_status(&mut self) -> Result<()> {
        self.state = RequestState::Released;
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for RmaRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RmaRequest")
            .field("op", &self.op)
            .field("protocol", &self.protocol)
            .field("state", &self.state)
            .field("ep", &self.ep)
            .field("lane", &self.lane)
            .field("length", &self.length)
            .field("total", &self.total)
            .field("comp_count", &self.comp_count)
            .field("failed", &self.error.is_some())
            .finish_non_exhaustive()
    }
}
