use nexar_rma::lane::LoopbackLane;
use nexar_rma::{
    Context, ContextParams, EndpointId, EndpointParams, HostMd, LaneAttributes, MapParams,
    MdIndex, MdMap, MemMapping, MemoryDomain, RequestParams, Result, Rkey, RmaConfig, RmaLane,
    Worker,
};
use std::sync::{Arc, Mutex};

/// A worker with one endpoint whose lane `i` connects local domain `i` to the
/// peer's domain `i`.
pub struct Pair {
    pub local: Vec<Arc<HostMd>>,
    pub remote: Vec<Arc<HostMd>>,
    pub ctx: Arc<Context>,
    pub peer: Arc<Context>,
    pub worker: Worker,
    pub ep: EndpointId,
    /// Clones of the endpoint's lanes, for inspection and fault injection.
    pub lanes: Vec<LoopbackLane>,
}

fn domains(prefix: &str, n: usize) -> Vec<Arc<HostMd>> {
    (0..n)
        .map(|i| Arc::new(HostMd::new(&format!("{prefix}{i}"))))
        .collect()
}

fn context(mds: &[Arc<HostMd>], config: RmaConfig) -> Arc<Context> {
    Context::new(
        ContextParams::default(),
        config,
        mds.iter()
            .map(|m| Arc::clone(m) as Arc<dyn MemoryDomain>)
            .collect(),
    )
    .unwrap()
}

/// Build a pair with `n` domains per side. `attrs` adjusts each lane.
pub fn pair_with(n: usize, config: RmaConfig, attrs: impl Fn(&mut LaneAttributes)) -> Pair {
    pair_from(domains("local", n), domains("remote", n), config, attrs)
}

pub fn pair_from(
    local: Vec<Arc<HostMd>>,
    remote: Vec<Arc<HostMd>>,
    config: RmaConfig,
    attrs: impl Fn(&mut LaneAttributes),
) -> Pair {
    let ctx = context(&local, config);
    let peer = context(&remote, RmaConfig::default());
    let worker = Worker::new(Arc::clone(&ctx));

    let lanes: Vec<LoopbackLane> = (0..local.len())
        .map(|i| {
            let mut a = LaneAttributes::new(i as MdIndex);
            attrs(&mut a);
            LoopbackLane::new(a, Arc::clone(&local[i]), Arc::clone(&remote[i]))
        })
        .collect();
    let boxed: Vec<Box<dyn RmaLane>> = lanes
        .iter()
        .map(|l| Box::new(l.clone()) as Box<dyn RmaLane>)
        .collect();
    let ep = worker
        .create_endpoint(boxed, EndpointParams::default())
        .unwrap();

    Pair {
        local,
        remote,
        ctx,
        peer,
        worker,
        ep,
        lanes,
    }
}

pub fn pair(n: usize) -> Pair {
    pair_with(n, RmaConfig::default(), |_| {})
}

/// Registration cache off, so every zero-copy request registers and
/// deregisters its own buffer.
pub fn uncached() -> RmaConfig {
    RmaConfig {
        rcache_enabled: false,
        ..RmaConfig::default()
    }
}

impl Pair {
    /// Register `buf` on the peer with `md_map` and unpack its key locally.
    pub fn expose(&self, buf: &mut [u8], md_map: MdMap) -> (MemMapping, Rkey) {
        let m = self
            .peer
            .mem_map(&MapParams::new(buf.as_mut_ptr() as u64, buf.len()).with_md_map(md_map))
            .unwrap();
        let packed = self.peer.rkey_pack(m).unwrap();
        let rkey = self.worker.rkey_unpack(self.ep, &packed).unwrap();
        (m, rkey)
    }

    pub fn expose_all(&self, buf: &mut [u8]) -> Rkey {
        self.expose(buf, MdMap::first(self.remote.len())).1
    }
}

/// Records every callback invocation.
#[derive(Clone, Default)]
pub struct Completions(Arc<Mutex<Vec<Result<()>>>>);

impl Completions {
    pub fn params(&self) -> RequestParams {
        let sink = Arc::clone(&self.0);
        RequestParams::new().on_complete(move |status| sink.lock().unwrap().push(status))
    }

    pub fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn take(&self) -> Vec<Result<()>> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}
