//! Context and worker: the public entry points of the RMA core.
//!
//! A [`Context`] owns the memory domains and the registration cache shared by
//! all of its workers. A [`Worker`] owns endpoints and in-flight requests and
//! is driven by explicit [`Worker::progress`] calls; nothing runs in the
//! background.

use crate::config::{ContextParams, RmaConfig};
use crate::endpoint::{Endpoint, EndpointId, EndpointParams, Rkey};
use crate::error::{Result, RmaError};
use crate::lane::{RegistrationCost, RmaLane};
use crate::md::{InvalidateGuard, MdSet, MemoryDomain};
use crate::memory::{MapParams, MemMapping, Registry};
use crate::rkey::RemoteKey;
use crate::rma::{
    Engine, Finished, RequestId, RequestParams, RequestProgress, RmaOp, RmaStatus, Transfer,
};
use crate::types::{MdIndex, MdMap, MemoryType};
use std::sync::{Arc, Mutex, MutexGuard};

/// What `Context::mem_query` reports about a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub address: u64,
    pub length: usize,
    pub mem_type: MemoryType,
    /// Domains the mapping is registered with.
    pub md_map: MdMap,
}

/// Memory domains, configuration and the registration cache.
pub struct Context {
    params: ContextParams,
    config: RmaConfig,
    mds: MdSet,
    registry: Mutex<Registry>,
}

impl Context {
    pub fn new(
        params: ContextParams,
        config: RmaConfig,
        mds: Vec<Arc<dyn MemoryDomain>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let mds = MdSet::new(mds)?;
        let registry = Registry::new(mds.clone(), &config);
        tracing::debug!(
            name = %params.name,
            features = ?params.features,
            mds = ?mds,
            rcache = config.rcache_enabled,
            "context created"
        );
        Ok(Arc::new(Self {
            params,
            config,
            mds,
            registry: Mutex::new(registry),
        }))
    }

    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    pub fn config(&self) -> &RmaConfig {
        &self.config
    }

    pub fn mds(&self) -> &MdSet {
        &self.mds
    }

    /// Enter the registry's critical section.
    pub fn registry(&self) -> Result<MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|_| RmaError::LockPoisoned("registry"))
    }

    /// Cost charged for registering a zero-copy buffer on `md`.
    pub(crate) fn registration_cost(&self, md: MdIndex) -> Result<RegistrationCost> {
        if self.config.rcache_enabled {
            Ok(RegistrationCost::Cached(self.config.rcache_overhead))
        } else {
            Ok(RegistrationCost::Uncached(self.mds.md(md)?.attributes().reg_cost))
        }
    }

    /// Register (and optionally allocate) memory for remote access.
    pub fn mem_map(&self, params: &MapParams) -> Result<MemMapping> {
        self.registry()?.map(params)
    }

    pub fn mem_unmap(&self, mapping: MemMapping) -> Result<()> {
        self.registry()?.unmap(mapping)
    }

    pub fn mem_query(&self, mapping: MemMapping) -> Result<MemInfo> {
        let registry = self.registry()?;
        let (Some(view), Some(backing)) =
            (registry.mapping(mapping), registry.mapping_backing(mapping))
        else {
            return Err(RmaError::invalid_param(format!("unknown mapping {}", mapping.id())));
        };
        Ok(MemInfo {
            address: view.address(),
            length: view.length(),
            mem_type: view.mem_type(),
            md_map: backing.md_map(),
        })
    }

    /// Pack the remote key a peer needs to access `mapping`.
    pub fn rkey_pack(&self, mapping: MemMapping) -> Result<Vec<u8>> {
        let registry = self.registry()?;
        let Some(backing) = registry.mapping_backing(mapping) else {
            return Err(RmaError::invalid_param(format!("unknown mapping {}", mapping.id())));
        };
        let mut rkey = RemoteKey::new(backing.mem_type());
        for (md, key) in backing.keys().iter() {
            let material = self.mds.md(md)?.pack_rkey(key).map_err(|e| e.at(md))?;
            rkey.insert(md, material)?;
        }
        Ok(rkey.pack())
    }

    /// Drop `mapping`'s registrations on `md_map`. `on_complete` runs once
    /// every domain has finished, possibly before this returns.
    pub fn mem_invalidate(
        &self,
        mapping: MemMapping,
        md_map: MdMap,
        on_complete: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let guard = InvalidateGuard::new(on_complete);
        let res = self.registry()?.invalidate_mapping(mapping, md_map, &guard);
        // Registry lock is released here, before the completion can run.
        drop(guard);
        res
    }

    /// Stop relying on global virtual addressing for `mapping` on `md_map`.
    pub fn mem_disable_auto_registration(&self, mapping: MemMapping, md_map: MdMap) -> Result<()> {
        self.registry()?
            .disable_mapping_auto_registration(mapping, md_map)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("params", &self.params)
            .field("config", &self.config)
            .field("mds", &self.mds)
            .finish_non_exhaustive()
    }
}

/// Owns endpoints and the requests issued on them.
///
/// All methods take `&self`; the worker serializes them internally, so a
/// worker may be shared between threads. User callbacks run after the
/// worker's lock is released and may call back into the worker.
pub struct Worker {
    context: Arc<Context>,
    engine: Mutex<Engine>,
}

impl Worker {
    pub fn new(context: Arc<Context>) -> Self {
        let engine = Engine::new(context.config());
        Self {
            context,
            engine: Mutex::new(engine),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    fn engine(&self) -> Result<MutexGuard<'_, Engine>> {
        self.engine
            .lock()
            .map_err(|_| RmaError::LockPoisoned("worker"))
    }

    pub fn create_endpoint(
        &self,
        lanes: Vec<Box<dyn RmaLane>>,
        params: EndpointParams,
    ) -> Result<EndpointId> {
        let mut engine = self.engine()?;
        let id = EndpointId(engine.endpoints.len());
        let ep = Endpoint::new(id, lanes, params, &self.context)?;
        tracing::debug!(ep = %id, fence = params.fence, "endpoint created");
        engine.endpoints.push(ep);
        Ok(id)
    }

    /// Switch strong ordering on or off for every later operation.
    pub fn set_fence(&self, ep: EndpointId, enabled: bool) -> Result<()> {
        self.engine()?.endpoint_mut(ep)?.set_fence_mode(enabled);
        Ok(())
    }

    /// Order the next operation on `ep` after all earlier ones.
    pub fn fence(&self, ep: EndpointId) -> Result<()> {
        self.engine()?.endpoint_mut(ep)?.fence();
        Ok(())
    }

    /// Lanes with inline operations issued since the last ordering point.
    pub fn unflushed_lanes(&self, ep: EndpointId) -> Result<u64> {
        Ok(self.engine()?.endpoint(ep)?.unflushed_lanes())
    }

    /// Unpack a peer's remote key for use on `ep`.
    pub fn rkey_unpack(&self, ep: EndpointId, packed: &[u8]) -> Result<Rkey> {
        let key = RemoteKey::unpack(packed)?;
        self.engine()?.endpoint_mut(ep)?.resolve_rkey(key, &self.context)
    }

    /// Run `submit` in the critical section, then the callbacks outside it.
    #[allow(clippy::too_many_arguments)]
    unsafe fn transfer(
        &self,
        op: RmaOp,
        ep: EndpointId,
        buffer: u64,
        count: usize,
        remote_addr: u64,
        rkey: &Rkey,
        params: RequestParams,
    ) -> Result<RmaStatus> {
        let mut finished = Vec::new();
        let res = {
            let mut engine = self.engine()?;
            let t = Transfer {
                op,
                ep,
                buffer,
                count,
                remote_addr,
                rkey,
            };
            // SAFETY: forwarded from the caller.
            unsafe { engine.submit(&self.context, t, params, &mut finished) }
        };
        run_callbacks(finished);
        res
    }

    /// Write `count` bytes (or datatype elements) from `buffer` to
    /// `remote_addr`.
    ///
    /// # Safety
    /// `buffer` must be valid for reads of the transfer length until the
    /// call returns `Done`, or until the request completes.
    pub unsafe fn put_nbx(
        &self,
        ep: EndpointId,
        buffer: u64,
        count: usize,
        remote_addr: u64,
        rkey: &Rkey,
        params: RequestParams,
    ) -> Result<RmaStatus> {
        unsafe { self.transfer(RmaOp::Put, ep, buffer, count, remote_addr, rkey, params) }
    }

    /// Read `count` bytes (or datatype elements) from `remote_addr` into
    /// `buffer`.
    ///
    /// # Safety
    /// `buffer` must be valid for writes of the transfer length until the
    /// call returns `Done`, or until the request completes.
    pub unsafe fn get_nbx(
        &self,
        ep: EndpointId,
        buffer: u64,
        count: usize,
        remote_addr: u64,
        rkey: &Rkey,
        params: RequestParams,
    ) -> Result<RmaStatus> {
        unsafe { self.transfer(RmaOp::Get, ep, buffer, count, remote_addr, rkey, params) }
    }

    /// `put_nbx` without a completion handle. Track completion with
    /// [`Worker::outstanding`] or [`Worker::wait_all`].
    ///
    /// # Safety
    /// As for [`Worker::put_nbx`].
    pub unsafe fn put_nbi(
        &self,
        ep: EndpointId,
        buffer: u64,
        length: usize,
        remote_addr: u64,
        rkey: &Rkey,
    ) -> Result<()> {
        unsafe { self.put_nbx(ep, buffer, length, remote_addr, rkey, RequestParams::default()) }
            .map(|_| ())
    }

    /// `get_nbx` without a completion handle.
    ///
    /// # Safety
    /// As for [`Worker::get_nbx`].
    pub unsafe fn get_nbi(
        &self,
        ep: EndpointId,
        buffer: u64,
        length: usize,
        remote_addr: u64,
        rkey: &Rkey,
    ) -> Result<()> {
        unsafe { self.get_nbx(ep, buffer, length, remote_addr, rkey, RequestParams::default()) }
            .map(|_| ())
    }

    /// Drive one progress step. Returns the number of lane completions seen.
    pub fn progress(&self) -> Result<usize> {
        let mut finished = Vec::new();
        let polled = self.engine()?.progress(&self.context, &mut finished);
        run_callbacks(finished);
        Ok(polled)
    }

    pub fn is_in_flight(&self, id: RequestId) -> Result<bool> {
        Ok(self.engine()?.request(id).is_some())
    }

    /// Counters of an in-flight request; `None` once it has completed.
    pub fn request_progress(&self, id: RequestId) -> Result<Option<RequestProgress>> {
        Ok(self.engine()?.request(id).map(|r| r.progress()))
    }

    /// Requests issued on this worker that have not completed.
    pub fn outstanding(&self) -> Result<usize> {
        Ok(self.engine()?.in_flight())
    }

    /// Drive progress until `id` completes.
    pub async fn wait(&self, id: RequestId) -> Result<()> {
        while self.is_in_flight(id)? {
            self.progress()?;
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    /// Drive progress until every request on this worker completes.
    pub async fn wait_all(&self) -> Result<()> {
        while self.outstanding()? > 0 {
            self.progress()?;
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("context", &self.context.params.name)
            .finish_non_exhaustive()
    }
}

fn run_callbacks(finished: Vec<Finished>) {
    for f in finished {
        f.invoke();
    }
}
