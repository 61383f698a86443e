//! Memory domains: the hardware registration contexts a buffer must be
//! registered with before a transport can touch it.
//!
//! The core consumes domains through the [`MemoryDomain`] trait. `HostMd` is a
//! built-in software domain for host memory, used for in-process transfers
//! and tests.

mod host;
mod invalidate;

pub use host::{HostMd, HostMdFailure};
pub use invalidate::{InvalidateGuard, InvalidateNotifier};

use crate::error::{Result, RmaError};
use crate::types::{MAX_MDS, MdIndex, MdMap, MemoryType, MemoryTypeSet};
use std::sync::Arc;

/// Opaque per-domain registration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MdKey(pub u64);

bitflags::bitflags! {
    /// Registration flags passed to `MemoryDomain::register`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegFlags: u32 {
        const REMOTE_PUT = 1 << 0;
        const REMOTE_GET = 1 << 1;
        const REMOTE_ATOMIC = 1 << 2;
        const LOCAL_READ = 1 << 3;
        const LOCAL_WRITE = 1 << 4;
        const ACCESS_ALL = Self::REMOTE_PUT.bits()
            | Self::REMOTE_GET.bits()
            | Self::REMOTE_ATOMIC.bits()
            | Self::LOCAL_READ.bits()
            | Self::LOCAL_WRITE.bits();

        /// Do not wait for pages to be faulted in.
        const NONBLOCK = 1 << 8;
        /// Pin (mlock) the pages.
        const LOCK = 1 << 9;
        /// Failures are expected; log them at debug level only.
        const HIDE_ERRORS = 1 << 10;
        /// Register through hardware global virtual addressing when available.
        const GVA = 1 << 11;
    }
}

impl RegFlags {
    /// Only the access bits. Two registrations are interchangeable when the
    /// cached one's access bits are a superset of the requested ones.
    pub fn access(self) -> RegFlags {
        self & RegFlags::ACCESS_ALL
    }
}

impl Default for RegFlags {
    fn default() -> Self {
        RegFlags::ACCESS_ALL
    }
}

/// Linear registration cost: `overhead_ns + growth_ns_per_byte * length`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegCost {
    pub overhead_ns: f64,
    pub growth_ns_per_byte: f64,
}

impl RegCost {
    pub fn cost_ns(&self, length: usize) -> f64 {
        self.overhead_ns + self.growth_ns_per_byte * length as f64
    }
}

impl Default for RegCost {
    fn default() -> Self {
        Self {
            overhead_ns: 1000.0,
            growth_ns_per_byte: 0.007,
        }
    }
}

/// Static capabilities of a memory domain.
#[derive(Debug, Clone)]
pub struct MdAttributes {
    /// Memory types the domain can register.
    pub reg_mem_types: MemoryTypeSet,
    /// Memory types the domain can allocate (already registered).
    pub alloc_mem_types: MemoryTypeSet,
    /// Longest single registration the domain accepts.
    pub max_reg_len: usize,
    /// Hardware global virtual addressing is available.
    pub supports_gva: bool,
    pub reg_cost: RegCost,
}

impl Default for MdAttributes {
    fn default() -> Self {
        Self {
            reg_mem_types: MemoryTypeSet::of(&[MemoryType::Host]),
            alloc_mem_types: MemoryTypeSet::EMPTY,
            max_reg_len: usize::MAX,
            supports_gva: false,
            reg_cost: RegCost::default(),
        }
    }
}

/// Failure reported by a memory domain; the caller attaches the domain index.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MdError {
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("{0}")]
    Io(String),
    #[error("out of memory")]
    NoMemory,
}

impl MdError {
    /// Convert into the crate error, tagging the failing domain.
    pub fn at(self, md: MdIndex) -> RmaError {
        match self {
            MdError::Unsupported(operation) => RmaError::Unsupported { md, operation },
            MdError::Io(reason) => RmaError::IoError { md, reason },
            MdError::NoMemory => RmaError::NoMemory {
                what: "memory domain",
            },
        }
    }
}

/// A hardware registration context.
///
/// Implementations are shared across workers and must be internally
/// synchronized.
pub trait MemoryDomain: Send + Sync {
    fn name(&self) -> &str;

    fn attributes(&self) -> &MdAttributes;

    /// Register `[address, address + length)` and return its key.
    fn register(
        &self,
        address: u64,
        length: usize,
        flags: RegFlags,
    ) -> std::result::Result<MdKey, MdError>;

    fn deregister(&self, key: MdKey) -> std::result::Result<(), MdError>;

    /// Deregister and revoke remote access to `key`.
    ///
    /// Domains whose revocation completes asynchronously keep `notifier` and
    /// drop it once done. The default deregisters synchronously.
    fn invalidate(
        &self,
        key: MdKey,
        notifier: InvalidateNotifier,
    ) -> std::result::Result<(), MdError> {
        self.deregister(key)?;
        drop(notifier);
        Ok(())
    }

    /// Remote key material a peer needs to address memory registered under `key`.
    fn pack_rkey(&self, key: MdKey) -> std::result::Result<Vec<u8>, MdError>;

    /// Largest payload this domain's transports can carry inline.
    fn query_max_inline_size(&self) -> usize;

    /// Allocate registered memory of `mem_type`. Returns the address and key.
    fn alloc(
        &self,
        _length: usize,
        _mem_type: MemoryType,
    ) -> std::result::Result<(u64, MdKey), MdError> {
        Err(MdError::Unsupported("alloc"))
    }

    /// Release memory obtained from `alloc`.
    fn free(&self, _address: u64, _length: usize, _key: MdKey) -> std::result::Result<(), MdError> {
        Err(MdError::Unsupported("free"))
    }
}

/// The fixed set of memory domains a context registers against.
#[derive(Clone)]
pub struct MdSet {
    mds: Vec<Arc<dyn MemoryDomain>>,
}

impl MdSet {
    pub fn new(mds: Vec<Arc<dyn MemoryDomain>>) -> Result<Self> {
        if mds.len() > MAX_MDS {
            return Err(RmaError::invalid_param(format!(
                "{} memory domains exceed the maximum of {MAX_MDS}",
                mds.len()
            )));
        }
        Ok(Self { mds })
    }

    pub fn len(&self) -> usize {
        self.mds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mds.is_empty()
    }

    pub fn get(&self, md: MdIndex) -> Option<&Arc<dyn MemoryDomain>> {
        self.mds.get(md as usize)
    }

    /// Look up `md`, failing with `InvalidParam` for an out-of-range index.
    pub fn md(&self, md: MdIndex) -> Result<&Arc<dyn MemoryDomain>> {
        self.get(md)
            .ok_or_else(|| RmaError::invalid_param(format!("no memory domain {md}")))
    }

    /// Every domain in the set.
    pub fn all(&self) -> MdMap {
        MdMap::first(self.mds.len())
    }

    /// Domains able to register `mem_type`.
    pub fn reg_map_for(&self, mem_type: MemoryType) -> MdMap {
        self.iter()
            .filter(|(_, md)| md.attributes().reg_mem_types.contains(mem_type))
            .map(|(i, _)| i)
            .collect()
    }

    /// Domains able to allocate `mem_type`.
    pub fn alloc_map_for(&self, mem_type: MemoryType) -> MdMap {
        self.iter()
            .filter(|(_, md)| md.attributes().alloc_mem_types.contains(mem_type))
            .map(|(i, _)| i)
            .collect()
    }

    /// Longest range every domain in `map` can register in one call.
    pub fn max_reg_len(&self, map: MdMap) -> usize {
        map.iter()
            .filter_map(|md| self.get(md))
            .map(|md| md.attributes().max_reg_len)
            .min()
            .unwrap_or(usize::MAX)
    }

    pub fn iter(&self) -> impl Iterator<Item = (MdIndex, &Arc<dyn MemoryDomain>)> {
        self.mds.iter().enumerate().map(|(i, md)| (i as MdIndex, md))
    }
}

impl std::fmt::Debug for MdSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.mds.iter().map(|md| md.name().to_string()))
            .finish()
    }
}
