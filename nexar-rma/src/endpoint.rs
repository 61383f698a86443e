use crate::error::{Result, RmaError};
use crate::lane::RmaLane;
use crate::rkey::{RemoteKey, RkeyConfig};
use crate::rma::RequestId;
use crate::types::{MAX_MDS, MdMap, MemoryType};
use crate::worker::Context;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Endpoint handle, local to the worker that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub(crate) usize);

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ep#{}", self.0)
    }
}

/// Maximum lanes per endpoint (one bit each in `unflushed_lanes`).
pub const MAX_LANES: usize = 64;

#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointParams {
    /// Order every operation after the ones before it. Disables the inline
    /// fast path.
    pub fence: bool,
}

/// A remote key resolved for one endpoint.
#[derive(Debug, Clone)]
pub struct Rkey {
    pub(crate) ep: EndpointId,
    key: RemoteKey,
    pub(crate) config: RkeyConfig,
    /// Material for the lane's remote domain.
    pub(crate) material: Arc<[u8]>,
}

impl Rkey {
    pub fn endpoint(&self) -> EndpointId {
        self.ep
    }

    pub fn md_map(&self) -> MdMap {
        self.key.md_map()
    }

    pub fn mem_type(&self) -> MemoryType {
        self.key.mem_type()
    }

    pub fn config(&self) -> &RkeyConfig {
        &self.config
    }
}

pub(crate) struct Endpoint {
    id: EndpointId,
    lanes: Vec<Box<dyn RmaLane>>,
    fence_mode: bool,
    fence_pending: bool,
    unflushed_lanes: u64,
    rkey_configs: HashMap<(MdMap, MemoryType), RkeyConfig>,
    /// Requests waiting for send resources, in issue order.
    pub(crate) pending: VecDeque<RequestId>,
}

impl Endpoint {
    pub(crate) fn new(
        id: EndpointId,
        lanes: Vec<Box<dyn RmaLane>>,
        params: EndpointParams,
        context: &Context,
    ) -> Result<Self> {
        if lanes.is_empty() || lanes.len() > MAX_LANES {
            return Err(RmaError::invalid_param(format!(
                "endpoint needs 1..={MAX_LANES} lanes, got {}",
                lanes.len()
            )));
        }
        for (i, lane) in lanes.iter().enumerate() {
            let attrs = lane.attributes();
            if context.mds().get(attrs.md).is_none() {
                return Err(RmaError::invalid_param(format!(
                    "lane {i} uses md {}, context has {}",
                    attrs.md,
                    context.mds().len()
                )));
            }
            if attrs.rkey_md as usize >= MAX_MDS {
                return Err(RmaError::invalid_param(format!(
                    "lane {i} consumes remote md {}, max is {}",
                    attrs.rkey_md,
                    MAX_MDS - 1
                )));
            }
        }
        Ok(Self {
            id,
            lanes,
            fence_mode: params.fence,
            fence_pending: false,
            unflushed_lanes: 0,
            rkey_configs: HashMap::new(),
            pending: VecDeque::new(),
        })
    }

    pub(crate) fn lane_mut(&mut self, lane: usize) -> Result<&mut dyn RmaLane> {
        match self.lanes.get_mut(lane) {
            Some(l) => Ok(l.as_mut()),
            None => Err(RmaError::invalid_param(format!("{} has no lane {lane}", self.id))),
        }
    }

    pub(crate) fn lanes_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn RmaLane>> {
        self.lanes.iter_mut()
    }

    pub(crate) fn set_fence_mode(&mut self, enabled: bool) {
        self.fence_mode = enabled;
    }

    /// Order the next operation after everything issued so far.
    pub(crate) fn fence(&mut self) {
        if self.unflushed_lanes != 0 {
            self.fence_pending = true;
        }
    }

    pub(crate) fn fence_required(&self) -> bool {
        self.fence_mode || self.fence_pending
    }

    /// A request-based operation now carries the ordering.
    pub(crate) fn take_fence(&mut self) {
        self.fence_pending = false;
        self.unflushed_lanes = 0;
    }

    pub(crate) fn mark_unflushed(&mut self, lane: usize) {
        self.unflushed_lanes |= 1 << lane;
    }

    pub(crate) fn unflushed_lanes(&self) -> u64 {
        self.unflushed_lanes
    }

    /// Park a request until send resources free up.
    pub(crate) fn park(&mut self, id: RequestId) {
        if !self.pending.contains(&id) {
            self.pending.push_back(id);
        }
    }

    /// Resolve a remote key: pick the fastest lane that can consume it and
    /// derive the protocol limits for that lane.
    pub(crate) fn resolve_rkey(&mut self, key: RemoteKey, context: &Context) -> Result<Rkey> {
        let cache_key = (key.md_map(), key.mem_type());
        let config = match self.rkey_configs.get(&cache_key) {
            Some(cfg) => *cfg,
            None => {
                let cfg = self.build_rkey_config(&key, context)?;
                self.rkey_configs.insert(cache_key, cfg);
                cfg
            }
        };
        let material: Arc<[u8]> = key
            .material(config.rkey_md)
            .map(Arc::from)
            .ok_or(RmaError::Unreachable {
                md_map: key.md_map().bits(),
            })?;
        Ok(Rkey {
            ep: self.id,
            key,
            config,
            material,
        })
    }

    fn build_rkey_config(&self, key: &RemoteKey, context: &Context) -> Result<RkeyConfig> {
        let mut best: Option<(usize, f64)> = None;
        for (i, lane) in self.lanes.iter().enumerate() {
            let attrs = lane.attributes();
            if !key.md_map().contains(attrs.rkey_md) {
                continue;
            }
            match best {
                Some((_, bw)) if bw >= attrs.zcopy_bandwidth => {}
                _ => best = Some((i, attrs.zcopy_bandwidth)),
            }
        }
        let Some((lane, _)) = best else {
            return Err(RmaError::Unreachable {
                md_map: key.md_map().bits(),
            });
        };

        let attrs = self.lanes[lane].attributes();
        let inline = context.mds().md(attrs.md)?.query_max_inline_size();
        let cost = context.registration_cost(attrs.md)?;
        let cfg = RkeyConfig {
            lane,
            rkey_md: attrs.rkey_md,
            max_put_short: attrs.max_put_short.min(inline),
            max_get_short: attrs.max_get_short.min(inline),
            put_zcopy_thresh: attrs.put_zcopy_thresh.resolve(attrs, cost),
            get_zcopy_thresh: attrs.get_zcopy_thresh.resolve(attrs, cost),
        };
        tracing::debug!(
            ep = %self.id,
            md_map = %key.md_map(),
            mem_type = %key.mem_type(),
            ?cfg,
            "resolved rkey config"
        );
        Ok(cfg)
    }

    /// Domains a zero-copy buffer is registered with for `rkey_md_map`: the
    /// local domain of every lane that can consume the remote key.
    pub(crate) fn zcopy_md_map(&self, rkey_md_map: MdMap) -> MdMap {
        self.lanes
            .iter()
            .map(|l| l.attributes())
            .filter(|a| rkey_md_map.contains(a.rkey_md))
            .map(|a| a.md)
            .collect()
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("lanes", &self.lanes.len())
            .field("fence_mode", &self.fence_mode)
            .field("fence_pending", &self.fence_pending)
            .field("unflushed_lanes", &format_args!("{:#x}", self.unflushed_lanes))
            .field("pending", &self.pending.len())
            .finish()
    }
}
