use super::send::Issued;
use super::{Engine, Finished, RegSource, RequestId};
use crate::error::{Result, RmaError};
use crate::lane::LaneCompletion;
use crate::worker::Context;

impl Engine {
    /// One progress step: poll every lane, apply the completions, then retry
    /// parked requests. Returns the number of lane completions seen.
    pub(crate) fn progress(&mut self, context: &Context, finished: &mut Vec<Finished>) -> usize {
        let mut completions = std::mem::take(&mut self.completions);
        for ep in &mut self.endpoints {
            for lane in ep.lanes_mut() {
                lane.poll(&mut completions);
            }
        }
        let polled = completions.len();
        for c in completions.drain(..) {
            self.fragment_complete(context, c, finished);
        }
        self.completions = completions;
        self.resume_pending(context, finished);
        polled
    }

    /// Apply one zero-copy completion. Completions for released requests, or
    /// beyond the number of fragments in flight, are dropped.
    pub(crate) fn fragment_complete(
        &mut self,
        context: &Context,
        completion: LaneCompletion,
        finished: &mut Vec<Finished>,
    ) {
        let id = completion.token.request;
        let Some(req) = self.requests.get_mut(id) else {
            tracing::warn!(%id, "dropping completion for a released request");
            return;
        };
        if let Err(e) = &completion.status {
            tracing::debug!(%id, length = completion.token.length, "fragment completed with error: {e}");
        }
        if !req.fragment_completed(completion.token.length, completion.status) {
            tracing::warn!(%id, "dropping duplicate completion");
            return;
        }
        if req.is_complete() {
            match self.finalize(context, id) {
                Ok(done) => finished.push(done),
                Err(e) => tracing::warn!(%id, "cannot finalize request: {e}"),
            }
        }
    }

    fn resume_pending(&mut self, context: &Context, finished: &mut Vec<Finished>) {
        for ep in 0..self.endpoints.len() {
            while let Some(&id) = self.endpoints[ep].pending.front() {
                let outcome = self.issue(id);
                if matches!(outcome, Ok(Issued::NoResource)) {
                    break;
                }
                self.endpoints[ep].pending.pop_front();
                match outcome {
                    Ok(Issued::Complete) => match self.finalize(context, id) {
                        Ok(done) => finished.push(done),
                        Err(e) => tracing::warn!(%id, "cannot finalize request: {e}"),
                    },
                    Ok(_) => {}
                    Err(e) => tracing::warn!(%id, "dropping pending request: {e}"),
                }
            }
        }
    }

    /// Release a completed request: drop its buffer registration and hand
    /// back the callback with the aggregated status.
    pub(crate) fn finalize(&mut self, context: &Context, id: RequestId) -> Result<Finished> {
        let Some(mut req) = self.requests.remove(id) else {
            return Err(RmaError::invalid_param(format!("unknown request {id}")));
        };
        let mut status = req.take_status();
        let owned = std::mem::replace(&mut req.reg, RegSource::None).into_owned();
        if !owned.is_empty() {
            let released = context
                .registry()
                .and_then(|mut r| {
                    // Release every window; the first failure is reported.
                    owned
                        .into_iter()
                        .map(|memref| r.release(memref))
                        .fold(Ok(()), |acc, res| acc.and(res))
                });
            if let Err(e) = released {
                tracing::warn!(%id, "failed to release request buffer: {e}");
                if status.is_ok() {
                    status = Err(e);
                }
            }
        }
        tracing::trace!(%id, ok = status.is_ok(), "request complete");
        Ok(Finished {
            id,
            callback: req.callback.take(),
            status,
        })
    }
}
