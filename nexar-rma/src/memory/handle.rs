use super::keys::MdKeyArray;
use crate::md::{MdKey, RegFlags};
use crate::types::{AllocMethod, MdIndex, MdMap, MemoryType, SysDevice};

bitflags::bitflags! {
    /// State flags carried by a memory handle.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct MemHandleFlags: u8 {
        /// Describes memory exported by a peer.
        const IMPORTED = 1 << 0;
        /// Pages were pinned at registration.
        const MLOCKED = 1 << 1;
        /// At least one domain resolves the range through global virtual addressing.
        const HAS_AUTO_GVA = 1 << 2;
        /// Never keep this range in the registration cache.
        const NO_RCACHE = 1 << 3;
    }
}

/// Identifier of a handle owned by a `Registry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub(crate) u64);

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "memh#{}", self.0)
    }
}

/// Where a handle came from, and who owns its registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOrigin {
    /// A registration cache entry; owns its keys.
    CacheEntry,
    /// A user mapping backed by a cache entry. Keys live on `parent`.
    UserView { parent: HandleId },
    /// Not cached. Owns its keys and any allocation.
    Standalone,
}

/// Heap memory owned by a mapping.
pub(crate) struct HeapBlock(Box<[u8]>);

impl HeapBlock {
    pub(crate) fn zeroed(length: usize) -> Self {
        Self(vec![0u8; length.max(1)].into_boxed_slice())
    }

    pub(crate) fn address(&self) -> u64 {
        self.0.as_ptr() as u64
    }
}

impl std::fmt::Debug for HeapBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HeapBlock({} bytes)", self.0.len())
    }
}

/// A virtual address range registered with zero or more memory domains.
#[derive(Debug)]
pub struct MemHandle {
    pub(crate) start: u64,
    pub(crate) end: u64,
    pub(crate) origin: HandleOrigin,
    pub(crate) alloc_method: Option<AllocMethod>,
    /// Key produced by the allocating domain; reused instead of registering twice.
    pub(crate) alloc_key: Option<MdKey>,
    pub(crate) heap: Option<HeapBlock>,
    pub(crate) mem_type: MemoryType,
    pub(crate) sys_dev: SysDevice,
    pub(crate) remote_uuid: Option<u64>,
    pub(crate) keys: MdKeyArray,
    /// Domains whose keys are invalidated rather than deregistered on release.
    pub(crate) inv_md_map: MdMap,
    pub(crate) gva_md_map: MdMap,
    pub(crate) flags: MemHandleFlags,
    pub(crate) reg_flags: RegFlags,
    pub(crate) refcount: usize,
    /// Superseded in the cache index; destroyed at its last release.
    pub(crate) orphaned: bool,
}

impl MemHandle {
    pub(crate) fn new(start: u64, length: usize, mem_type: MemoryType, origin: HandleOrigin) -> Self {
        Self {
            start,
            end: start + length as u64,
            origin,
            alloc_method: None,
            alloc_key: None,
            heap: None,
            mem_type,
            sys_dev: SysDevice::UNKNOWN,
            remote_uuid: None,
            keys: MdKeyArray::new(),
            inv_md_map: MdMap::EMPTY,
            gva_md_map: MdMap::EMPTY,
            flags: MemHandleFlags::empty(),
            reg_flags: RegFlags::empty(),
            refcount: 1,
            orphaned: false,
        }
    }

    /// Handle for requests that need no registration at all.
    pub(crate) fn dummy() -> Self {
        Self::new(0, 0, MemoryType::Host, HandleOrigin::Standalone)
    }

    pub fn address(&self) -> u64 {
        self.start
    }

    pub fn length(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn contains(&self, address: u64, length: usize) -> bool {
        address >= self.start && address.saturating_add(length as u64) <= self.end
    }

    pub fn origin(&self) -> HandleOrigin {
        self.origin
    }

    pub fn alloc_method(&self) -> Option<AllocMethod> {
        self.alloc_method
    }

    /// Domain that allocated the memory, if any.
    pub fn alloc_md(&self) -> Option<MdIndex> {
        match self.alloc_method {
            Some(AllocMethod::Md(md)) => Some(md),
            _ => None,
        }
    }

    pub fn mem_type(&self) -> MemoryType {
        self.mem_type
    }

    pub fn sys_dev(&self) -> SysDevice {
        self.sys_dev
    }

    pub fn remote_uuid(&self) -> Option<u64> {
        self.remote_uuid
    }

    /// Domains holding a valid registration.
    pub fn md_map(&self) -> MdMap {
        self.keys.md_map()
    }

    pub fn inv_md_map(&self) -> MdMap {
        self.inv_md_map
    }

    pub fn gva_md_map(&self) -> MdMap {
        self.gva_md_map
    }

    pub fn key(&self, md: MdIndex) -> Option<MdKey> {
        self.keys.get(md)
    }

    pub fn keys(&self) -> &MdKeyArray {
        &self.keys
    }

    pub fn flags(&self) -> MemHandleFlags {
        self.flags
    }

    pub fn reg_flags(&self) -> RegFlags {
        self.reg_flags
    }

    pub fn refcount(&self) -> usize {
        self.refcount
    }

    pub fn is_imported(&self) -> bool {
        self.flags.contains(MemHandleFlags::IMPORTED)
    }

    /// Whether `md`'s key was produced by the allocation rather than `register`.
    pub(crate) fn is_alloc_key(&self, md: MdIndex) -> bool {
        self.alloc_md() == Some(md) && self.alloc_key.is_some()
    }
}

/// A registration obtained from `Registry::acquire`.
#[derive(Debug)]
pub enum MemRef {
    /// Owned by the registry; the id carries one reference.
    Cached(HandleId),
    /// Not cached; the value owns its registrations.
    Uncached(Box<MemHandle>),
}

impl MemRef {
    /// The no-registration handle: no domains, zero length.
    pub fn dummy() -> Self {
        MemRef::Uncached(Box::new(MemHandle::dummy()))
    }

    pub fn is_dummy(&self) -> bool {
        matches!(self, MemRef::Uncached(h) if h.length() == 0 && h.md_map().is_empty())
    }

    pub fn id(&self) -> Option<HandleId> {
        match self {
            MemRef::Cached(id) => Some(*id),
            MemRef::Uncached(_) => None,
        }
    }
}

/// A user mapping created by `Context::mem_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemMapping(pub(crate) HandleId);

impl MemMapping {
    pub fn id(self) -> HandleId {
        self.0
    }
}
