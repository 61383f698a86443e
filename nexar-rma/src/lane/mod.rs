//! Transport lanes: the hardware operations the request engine issues.

mod loopback;

pub use loopback::{LaneOp, LoopbackLane, OpKind};

use crate::error::Result;
use crate::md::{MdKey, RegCost};
use crate::rma::RequestId;
use crate::types::MdIndex;
use std::time::Duration;

/// Zero-copy switch-over point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    Fixed(usize),
    /// Derived from bandwidths and registration cost.
    Auto,
}

/// Static capabilities of a lane.
#[derive(Debug, Clone)]
pub struct LaneAttributes {
    /// Domain local buffers must be registered with for zero-copy.
    pub md: MdIndex,
    /// Domain whose remote key material the lane consumes.
    pub rkey_md: MdIndex,
    pub max_put_short: usize,
    pub max_get_short: usize,
    /// Largest buffered-copy fragment.
    pub max_bcopy: usize,
    /// Largest zero-copy fragment.
    pub max_put_zcopy: usize,
    pub max_get_zcopy: usize,
    pub put_zcopy_thresh: Threshold,
    pub get_zcopy_thresh: Threshold,
    /// Bytes per second.
    pub bcopy_bandwidth: f64,
    pub zcopy_bandwidth: f64,
}

impl LaneAttributes {
    /// Attributes of a lane on `md` with no size limits worth noting.
    pub fn new(md: MdIndex) -> Self {
        Self {
            md,
            rkey_md: md,
            max_put_short: 64,
            max_get_short: 64,
            max_bcopy: 8 * 1024,
            max_put_zcopy: usize::MAX,
            max_get_zcopy: usize::MAX,
            put_zcopy_thresh: Threshold::Auto,
            get_zcopy_thresh: Threshold::Auto,
            bcopy_bandwidth: 5.0e9,
            zcopy_bandwidth: 12.0e9,
        }
    }
}

/// Registration cost charged when deciding the zero-copy threshold.
#[derive(Debug, Clone, Copy)]
pub enum RegistrationCost {
    /// Cached registration: a fixed lookup overhead.
    Cached(Duration),
    /// Every request registers its buffer.
    Uncached(RegCost),
}

impl Threshold {
    /// Resolve to a byte count.
    ///
    /// `Auto` is the length at which copying through bounce buffers takes as
    /// long as registering and transferring directly. When zero-copy never
    /// pays off the threshold is `usize::MAX`.
    pub fn resolve(self, attrs: &LaneAttributes, cost: RegistrationCost) -> usize {
        if let Threshold::Fixed(n) = self {
            return n;
        }
        let (overhead_ns, growth_ns) = match cost {
            RegistrationCost::Cached(d) => (d.as_nanos() as f64, 0.0),
            RegistrationCost::Uncached(c) => (c.overhead_ns, c.growth_ns_per_byte),
        };
        let bcopy_ns_per_byte = 1e9 / attrs.bcopy_bandwidth;
        let zcopy_ns_per_byte = 1e9 / attrs.zcopy_bandwidth;
        let saving = bcopy_ns_per_byte - zcopy_ns_per_byte - growth_ns;
        if saving <= 0.0 || !saving.is_finite() {
            return usize::MAX;
        }
        let thresh = (overhead_ns / saving).ceil();
        if thresh >= usize::MAX as f64 {
            usize::MAX
        } else {
            (thresh as usize).max(1)
        }
    }
}

/// Completion routing for an asynchronous fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionToken {
    pub request: RequestId,
    /// Bytes the fragment carries.
    pub length: usize,
}

/// Result of issuing a zero-copy fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneStatus {
    Done,
    /// Completion will be reported by `poll`.
    InProgress,
}

/// An asynchronous fragment finished.
#[derive(Debug)]
pub struct LaneCompletion {
    pub token: CompletionToken,
    pub status: Result<()>,
}

/// One transport path to a peer.
///
/// Every method returns `RmaError::NoResource` when send resources are
/// temporarily exhausted; the caller retries later.
pub trait RmaLane: Send {
    fn attributes(&self) -> &LaneAttributes;

    /// Write `length` bytes inline.
    ///
    /// # Safety
    /// `buffer` must be valid for reads of `length` bytes.
    unsafe fn put_short(
        &mut self,
        buffer: u64,
        length: usize,
        remote_addr: u64,
        rkey: &[u8],
    ) -> Result<()>;

    /// Read `length` bytes inline.
    ///
    /// # Safety
    /// `buffer` must be valid for writes of `length` bytes.
    unsafe fn get_short(
        &mut self,
        buffer: u64,
        length: usize,
        remote_addr: u64,
        rkey: &[u8],
    ) -> Result<()>;

    /// Write a fragment staged in a bounce buffer. Completes before returning.
    fn put_bcopy(&mut self, payload: &[u8], remote_addr: u64, rkey: &[u8]) -> Result<()>;

    /// Read a fragment into a bounce buffer. Completes before returning.
    fn get_bcopy(&mut self, dest: &mut [u8], remote_addr: u64, rkey: &[u8]) -> Result<()>;

    /// Write directly from registered memory.
    ///
    /// # Safety
    /// `buffer` must stay valid for reads of `length` bytes until the
    /// fragment completes.
    unsafe fn put_zcopy(
        &mut self,
        buffer: u64,
        length: usize,
        local_key: MdKey,
        remote_addr: u64,
        rkey: &[u8],
        token: CompletionToken,
    ) -> Result<LaneStatus>;

    /// Read directly into registered memory.
    ///
    /// # Safety
    /// `buffer` must stay valid for writes of `length` bytes until the
    /// fragment completes.
    unsafe fn get_zcopy(
        &mut self,
        buffer: u64,
        length: usize,
        local_key: MdKey,
        remote_addr: u64,
        rkey: &[u8],
        token: CompletionToken,
    ) -> Result<LaneStatus>;

    /// Append finished asynchronous fragments to `out`. Returns how many.
    fn poll(&mut self, out: &mut Vec<LaneCompletion>) -> usize;
}
