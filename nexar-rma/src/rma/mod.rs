//! One-sided PUT/GET request engine.
//!
//! Small transfers go inline without a request object. Everything else is
//! tracked as an [`RmaRequest`] drawn from a fixed pool: fragmented over the
//! chosen lane (short, bounce-buffered copy or zero-copy against registered
//! user memory), parked on the endpoint when the lane runs out of send
//! resources, and completed once nothing is left to issue and every
//! zero-copy fragment has been acknowledged.
//!
//! The engine itself is single threaded. `Worker` wraps it in a mutex and
//! runs user callbacks only after leaving the critical section.

mod completion;
mod pool;
mod request;
mod send;

pub use pool::RequestId;
pub use request::{Callback, Protocol, RequestProgress, RequestState, RmaOp};
pub use send::{RequestParams, RmaStatus};

pub(crate) use request::{RegSource, RegWindow, RmaRequest};
pub(crate) use send::Transfer;

use crate::config::RmaConfig;
use crate::endpoint::{Endpoint, EndpointId};
use crate::error::{Result, RmaError};
use crate::lane::LaneCompletion;
use crate::memory::BcopyPool;
use pool::RequestPool;
use std::sync::Arc;

/// A request that reached its end; the callback runs outside the lock.
pub(crate) struct Finished {
    pub(crate) id: RequestId,
    pub(crate) callback: Option<Callback>,
    pub(crate) status: Result<()>,
}

impl Finished {
    pub(crate) fn invoke(self) {
        match self.callback {
            Some(cb) => cb(self.status),
            None => {
                if let Err(e) = self.status {
                    tracing::debug!(id = %self.id, "request without callback failed: {e}");
                }
            }
        }
    }
}

/// Per-worker engine state. Every method runs inside the worker's critical
/// section.
pub(crate) struct Engine {
    pub(crate) endpoints: Vec<Endpoint>,
    pub(crate) requests: RequestPool,
    bcopy: Arc<BcopyPool>,
    completions: Vec<LaneCompletion>,
}

impl Engine {
    pub(crate) fn new(config: &RmaConfig) -> Self {
        Self {
            endpoints: Vec::new(),
            requests: RequestPool::new(config.request_pool_size),
            bcopy: BcopyPool::new(config.bcopy_pool_size, config.bcopy_chunk_bytes),
            completions: Vec::new(),
        }
    }

    pub(crate) fn endpoint_mut(&mut self, ep: EndpointId) -> Result<&mut Endpoint> {
        self.endpoints
            .get_mut(ep.0)
            .ok_or_else(|| RmaError::invalid_param(format!("unknown endpoint {ep}")))
    }

    pub(crate) fn endpoint(&self, ep: EndpointId) -> Result<&Endpoint> {
        self.endpoints
            .get(ep.0)
            .ok_or_else(|| RmaError::invalid_param(format!("unknown endpoint {ep}")))
    }

    pub(crate) fn request(&self, id: RequestId) -> Option<&RmaRequest> {
        self.requests.get(id)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.requests.len()
    }
}
