//! Registration cache.
//!
//! Cache entries cover disjoint, alignment-widened address ranges and are
//! indexed by start address. A request that falls inside an entry with a
//! compatible memory type and access reuses it, registering only the domains
//! it is still missing. A request that overlaps entries without fitting in one
//! gets a new entry spanning the union; the superseded entries leave the index
//! and are destroyed once their last reference is released.
//!
//! Unreferenced entries stay registered (soft release) until evicted in
//! least-recently-released order.

use super::handle::{HandleId, HandleOrigin, HeapBlock, MemHandle, MemHandleFlags, MemMapping, MemRef};
use super::registrar::{deregister_all, reregister};
use crate::config::RmaConfig;
use crate::error::{Result, RmaError};
use crate::md::{InvalidateGuard, MdKey, MdSet, RegFlags};
use crate::types::{AllocMethod, MdIndex, MdMap, MemoryType, SysDevice};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Parameters for `Registry::map`.
#[derive(Debug, Clone)]
pub struct MapParams {
    /// Start of the range to map; ignored when `allocate` is set.
    pub address: u64,
    pub length: usize,
    pub mem_type: MemoryType,
    pub sys_dev: SysDevice,
    /// Allocate the memory instead of mapping an existing range.
    pub allocate: bool,
    /// Domains to register with. Defaults to every domain able to register
    /// `mem_type`.
    pub md_map: Option<MdMap>,
    pub reg_flags: RegFlags,
    /// Only `NO_RCACHE` is honored.
    pub flags: MemHandleFlags,
}

impl MapParams {
    /// Map an existing host range.
    pub fn new(address: u64, length: usize) -> Self {
        Self {
            address,
            length,
            mem_type: MemoryType::Host,
            sys_dev: SysDevice::UNKNOWN,
            allocate: false,
            md_map: None,
            reg_flags: RegFlags::ACCESS_ALL,
            flags: MemHandleFlags::empty(),
        }
    }

    /// Allocate and map `length` bytes.
    pub fn allocate(length: usize) -> Self {
        Self {
            allocate: true,
            ..Self::new(0, length)
        }
    }

    pub fn with_mem_type(mut self, mem_type: MemoryType) -> Self {
        self.mem_type = mem_type;
        self
    }

    pub fn with_md_map(mut self, md_map: MdMap) -> Self {
        self.md_map = Some(md_map);
        self
    }

    pub fn with_flags(mut self, flags: MemHandleFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Address-keyed store of memory handles.
pub struct Registry {
    mds: MdSet,
    enabled: bool,
    alignment: u64,
    max_unused: usize,
    next_id: u64,
    /// Cache entries by start address.
    index: BTreeMap<u64, HandleId>,
    handles: HashMap<HandleId, MemHandle>,
    /// Indexed entries with no references, least recently released first.
    unused: VecDeque<HandleId>,
}

impl Registry {
    pub fn new(mds: MdSet, config: &RmaConfig) -> Self {
        Self {
            mds,
            enabled: config.rcache_enabled,
            alignment: config.rcache_alignment.max(1) as u64,
            max_unused: config.rcache_max_unused,
            next_id: 1,
            index: BTreeMap::new(),
            handles: HashMap::new(),
            unused: VecDeque::new(),
        }
    }

    pub fn mds(&self) -> &MdSet {
        &self.mds
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Entries currently in the cache index.
    pub fn cached_entries(&self) -> usize {
        self.index.len()
    }

    /// Cached entries with no references.
    pub fn unused_entries(&self) -> usize {
        self.unused.len()
    }

    /// Handles owned by the registry, including user mappings and superseded
    /// entries that are still referenced.
    pub fn live_handles(&self) -> usize {
        self.handles.len()
    }

    fn next_id(&mut self) -> HandleId {
        let id = HandleId(self.next_id);
        self.next_id += 1;
        id
    }

    fn align(&self, address: u64, length: usize) -> (u64, u64) {
        let mask = self.alignment - 1;
        let start = address & !mask;
        let end = address.saturating_add(length as u64).saturating_add(mask) & !mask;
        (start, end)
    }

    /// Indexed entries intersecting `[start, end)`, highest start first.
    fn overlapping(&self, start: u64, end: u64) -> Vec<HandleId> {
        self.index
            .range(..end)
            .rev()
            .map(|(_, id)| *id)
            .take_while(|id| self.handles.get(id).is_some_and(|h| h.end > start))
            .collect()
    }

    /// Obtain a handle covering `[address, address + length)` registered with
    /// at least `md_map`.
    ///
    /// An empty `md_map` needs no registration and yields the dummy handle.
    /// With caching disabled, or `NO_RCACHE` in `flags`, the handle is built
    /// for this call only and owns its registrations.
    pub fn acquire(
        &mut self,
        address: u64,
        length: usize,
        mem_type: MemoryType,
        md_map: MdMap,
        reg_flags: RegFlags,
        flags: MemHandleFlags,
    ) -> Result<MemRef> {
        if md_map.is_empty() {
            return Ok(MemRef::dummy());
        }
        if length == 0 || address == 0 {
            return Err(RmaError::invalid_param(format!(
                "cannot register {length} bytes at {address:#x}"
            )));
        }

        if !self.enabled || flags.contains(MemHandleFlags::NO_RCACHE) {
            let mut h = MemHandle::new(address, length, mem_type, HandleOrigin::Standalone);
            h.flags |= flags & MemHandleFlags::NO_RCACHE;
            reregister(&self.mds, &mut h, md_map, reg_flags)?;
            return Ok(MemRef::Uncached(Box::new(h)));
        }

        // Never widen past what every target domain can register.
        let limit = self.mds.max_reg_len(md_map) as u64;
        let (start, end) = match self.align(address, length) {
            (s, e) if e - s <= limit => (s, e),
            _ => (address, address.saturating_add(length as u64)),
        };
        let overlaps = self.overlapping(start, end);
        let access = reg_flags.access();

        if let [id] = *overlaps.as_slice()
            && let Some(entry) = self.handles.get_mut(&id)
            && entry.start <= start
            && entry.end >= end
            && entry.mem_type == mem_type
            && entry.reg_flags.contains(access)
        {
            let missing = md_map.difference(entry.md_map());
            if !missing.is_empty() {
                let flags = entry.reg_flags | (reg_flags - RegFlags::ACCESS_ALL);
                let target = entry.md_map().union(md_map);
                reregister(&self.mds, entry, target, flags)?;
            }
            entry.refcount += 1;
            if entry.refcount == 1 {
                self.unused.retain(|u| *u != id);
            }
            tracing::trace!(%id, address, length, added = %missing, "rcache hit");
            return Ok(MemRef::Cached(id));
        }

        let mut merged_start = start;
        let mut merged_end = end;
        let mut merged_map = md_map;
        let mut merged_access = access;
        for id in &overlaps {
            if let Some(e) = self.handles.get(id)
                && e.mem_type == mem_type
            {
                merged_start = merged_start.min(e.start);
                merged_end = merged_end.max(e.end);
                merged_map = merged_map.union(e.md_map());
                merged_access |= e.reg_flags.access();
            }
        }

        if merged_end - merged_start > self.mds.max_reg_len(merged_map) as u64 {
            tracing::trace!(
                start = merged_start,
                end = merged_end,
                "merged range exceeds max registration length, registering alone"
            );
            merged_start = start;
            merged_end = end;
            merged_map = md_map;
            merged_access = access;
        }

        let mut entry = MemHandle::new(
            merged_start,
            (merged_end - merged_start) as usize,
            mem_type,
            HandleOrigin::CacheEntry,
        );
        reregister(
            &self.mds,
            &mut entry,
            merged_map,
            merged_access | (reg_flags - RegFlags::ACCESS_ALL),
        )?;

        for old in &overlaps {
            self.retire(*old);
        }
        let id = self.next_id();
        tracing::debug!(
            %id,
            start = merged_start,
            end = merged_end,
            md_map = %merged_map,
            merged = overlaps.len(),
            "rcache miss"
        );
        self.index.insert(entry.start, id);
        self.handles.insert(id, entry);
        Ok(MemRef::Cached(id))
    }

    /// Wrap memory exported by a peer. Imported handles are never cached and
    /// their keys are invalidated, not deregistered, on release.
    pub fn import(
        &mut self,
        address: u64,
        length: usize,
        mem_type: MemoryType,
        md_map: MdMap,
        remote_uuid: u64,
    ) -> Result<MemRef> {
        let mut h = MemHandle::new(address, length, mem_type, HandleOrigin::Standalone);
        h.flags |= MemHandleFlags::IMPORTED;
        h.remote_uuid = Some(remote_uuid);
        reregister(&self.mds, &mut h, md_map, RegFlags::ACCESS_ALL)?;
        h.inv_md_map = h.md_map();
        Ok(MemRef::Uncached(Box::new(h)))
    }

    /// Drop one reference. Cached entries stay registered until evicted.
    pub fn release(&mut self, memref: MemRef) -> Result<()> {
        match memref {
            MemRef::Uncached(h) => {
                if h.md_map().is_empty() && h.alloc_method.is_none() {
                    return Ok(());
                }
                destroy(&self.mds, *h)
            }
            MemRef::Cached(id) => self.release_id(id),
        }
    }

    fn release_id(&mut self, id: HandleId) -> Result<()> {
        let Some(h) = self.handles.get_mut(&id) else {
            return Err(RmaError::invalid_param(format!("unknown memory handle {id}")));
        };
        if h.refcount == 0 {
            return Err(RmaError::invalid_param(format!("{id} released twice")));
        }
        h.refcount -= 1;
        if h.refcount > 0 {
            return Ok(());
        }
        match h.origin {
            HandleOrigin::UserView { parent } => {
                self.handles.remove(&id);
                self.release_id(parent)
            }
            HandleOrigin::Standalone => match self.handles.remove(&id) {
                Some(h) => destroy(&self.mds, h),
                None => Ok(()),
            },
            HandleOrigin::CacheEntry if h.orphaned => match self.handles.remove(&id) {
                Some(h) => destroy(&self.mds, h),
                None => Ok(()),
            },
            HandleOrigin::CacheEntry => {
                self.unused.push_back(id);
                self.evict();
                Ok(())
            }
        }
    }

    fn evict(&mut self) {
        while self.unused.len() > self.max_unused {
            let Some(id) = self.unused.pop_front() else {
                break;
            };
            tracing::debug!(%id, "rcache evict");
            self.retire(id);
        }
    }

    /// Remove `id` from the index. Destroy it now if unreferenced, else at its
    /// last release.
    fn retire(&mut self, id: HandleId) {
        let Some(h) = self.handles.get_mut(&id) else {
            return;
        };
        if self.index.get(&h.start) == Some(&id) {
            self.index.remove(&h.start);
        }
        if h.refcount > 0 {
            h.orphaned = true;
            return;
        }
        self.unused.retain(|u| *u != id);
        if let Some(h) = self.handles.remove(&id)
            && let Err(e) = destroy(&self.mds, h)
        {
            tracing::warn!(%id, "failed to destroy cache entry: {e}");
        }
    }

    /// Resolve a user view to the entry holding its keys.
    fn backing_id(&self, id: HandleId) -> Result<HandleId> {
        match self.handles.get(&id) {
            Some(h) => match h.origin {
                HandleOrigin::UserView { parent } => Ok(parent),
                _ => Ok(id),
            },
            None => Err(RmaError::invalid_param(format!("unknown memory handle {id}"))),
        }
    }

    /// The handle holding `memref`'s registrations.
    pub fn get<'a>(&'a self, memref: &'a MemRef) -> Option<&'a MemHandle> {
        match memref {
            MemRef::Cached(id) => {
                let bid = self.backing_id(*id).ok()?;
                self.handles.get(&bid)
            }
            MemRef::Uncached(h) => Some(&**h),
        }
    }

    pub fn key(&self, memref: &MemRef, md: MdIndex) -> Option<MdKey> {
        self.get(memref).and_then(|h| h.key(md))
    }

    pub fn md_map(&self, memref: &MemRef) -> MdMap {
        self.get(memref).map_or(MdMap::EMPTY, |h| h.md_map())
    }

    /// References held on `memref`'s handle.
    pub fn refcount(&self, memref: &MemRef) -> usize {
        self.get(memref).map_or(0, |h| h.refcount)
    }

    fn handle_mut<'a>(&'a mut self, memref: &'a mut MemRef) -> Result<(&'a mut MemHandle, &'a MdSet, Option<HandleId>)> {
        match memref {
            MemRef::Cached(id) => {
                let bid = self.backing_id(*id)?;
                let h = self
                    .handles
                    .get_mut(&bid)
                    .ok_or_else(|| RmaError::invalid_param(format!("unknown memory handle {bid}")))?;
                Ok((h, &self.mds, Some(bid)))
            }
            MemRef::Uncached(h) => Ok((&mut **h, &self.mds, None)),
        }
    }

    /// Revoke `memref`'s registrations on `md_map`.
    ///
    /// Other references stay valid; only the invalidated keys go away. Each
    /// domain that finishes asynchronously holds a notifier from `guard`, so
    /// the guard's completion runs once all of them and the guard itself are
    /// done. A cache entry left with no registrations leaves the index.
    pub fn invalidate(
        &mut self,
        memref: &mut MemRef,
        md_map: MdMap,
        guard: &InvalidateGuard,
    ) -> Result<()> {
        let (handle, mds, id) = self.handle_mut(memref)?;
        let res = invalidate_keys(mds, handle, md_map, guard);
        let emptied = handle.md_map().is_empty() && handle.origin == HandleOrigin::CacheEntry;
        if let Some(id) = id
            && emptied
        {
            self.retire(id);
        }
        res
    }

    /// Stop assuming `md_map` resolves `memref` through global virtual
    /// addressing. Registrations are kept.
    pub fn disable_auto_registration(&mut self, memref: &mut MemRef, md_map: MdMap) -> Result<()> {
        let (handle, _, _) = self.handle_mut(memref)?;
        disable_gva(handle, md_map);
        Ok(())
    }

    /// Create a user mapping, allocating the memory if requested.
    pub fn map(&mut self, params: &MapParams) -> Result<MemMapping> {
        if params.length == 0 {
            return Err(RmaError::invalid_param("cannot map zero bytes"));
        }
        let md_map = params
            .md_map
            .unwrap_or_else(|| self.mds.reg_map_for(params.mem_type));

        let mut handle = if params.allocate {
            let mut h = self.allocate(params.length, params.mem_type)?;
            if let Err(e) = reregister(&self.mds, &mut h, md_map, params.reg_flags) {
                let _ = destroy(&self.mds, h);
                return Err(e);
            }
            h
        } else {
            if params.address == 0 {
                return Err(RmaError::invalid_param("null address"));
            }
            let cached = self.enabled && !params.flags.contains(MemHandleFlags::NO_RCACHE);
            if cached && !md_map.is_empty() {
                let parent = match self.acquire(
                    params.address,
                    params.length,
                    params.mem_type,
                    md_map,
                    params.reg_flags,
                    params.flags,
                )? {
                    MemRef::Cached(id) => id,
                    other => {
                        self.release(other)?;
                        return Err(RmaError::invalid_param("registration cache bypassed"));
                    }
                };
                MemHandle::new(
                    params.address,
                    params.length,
                    params.mem_type,
                    HandleOrigin::UserView { parent },
                )
            } else {
                let mut h = MemHandle::new(
                    params.address,
                    params.length,
                    params.mem_type,
                    HandleOrigin::Standalone,
                );
                reregister(&self.mds, &mut h, md_map, params.reg_flags)?;
                h
            }
        };
        handle.sys_dev = params.sys_dev;
        handle.flags |= params.flags & MemHandleFlags::NO_RCACHE;

        let id = self.next_id();
        tracing::debug!(
            %id,
            address = handle.start,
            length = handle.length(),
            origin = ?handle.origin,
            "mapped"
        );
        self.handles.insert(id, handle);
        Ok(MemMapping(id))
    }

    fn allocate(&self, length: usize, mem_type: MemoryType) -> Result<MemHandle> {
        for md in self.mds.alloc_map_for(mem_type).iter() {
            let Some(domain) = self.mds.get(md) else {
                continue;
            };
            match domain.alloc(length, mem_type) {
                Ok((address, key)) => {
                    let mut h = MemHandle::new(address, length, mem_type, HandleOrigin::Standalone);
                    h.alloc_method = Some(AllocMethod::Md(md));
                    h.alloc_key = Some(key);
                    return Ok(h);
                }
                Err(e) => tracing::debug!(md, %mem_type, "allocation failed, trying next: {e}"),
            }
        }
        if !mem_type.is_host() {
            return Err(RmaError::NoMemory {
                what: "memory domain allocation",
            });
        }
        let block = HeapBlock::zeroed(length);
        let mut h = MemHandle::new(block.address(), length, mem_type, HandleOrigin::Standalone);
        h.alloc_method = Some(AllocMethod::Heap);
        h.heap = Some(block);
        Ok(h)
    }

    /// Remove a user mapping, releasing its registrations or cache reference.
    pub fn unmap(&mut self, mapping: MemMapping) -> Result<()> {
        match self.handles.get(&mapping.0).map(|h| h.origin) {
            Some(HandleOrigin::CacheEntry) | None => Err(RmaError::invalid_param(format!(
                "{} is not a mapping",
                mapping.0
            ))),
            Some(_) => self.release_id(mapping.0),
        }
    }

    /// The user-visible handle: its range, type and origin.
    pub fn mapping(&self, mapping: MemMapping) -> Option<&MemHandle> {
        self.handles.get(&mapping.0)
    }

    /// The handle holding the mapping's keys.
    pub fn mapping_backing(&self, mapping: MemMapping) -> Option<&MemHandle> {
        let bid = self.backing_id(mapping.0).ok()?;
        self.handles.get(&bid)
    }

    /// Make sure the mapping is registered with every domain in `md_map`.
    pub fn ensure_mapped(&mut self, mapping: MemMapping, md_map: MdMap, reg_flags: RegFlags) -> Result<()> {
        let bid = self.backing_id(mapping.0)?;
        let Some(h) = self.handles.get_mut(&bid) else {
            return Err(RmaError::invalid_param(format!("unknown memory handle {bid}")));
        };
        if md_map.is_subset(h.md_map()) {
            return Ok(());
        }
        let target = h.md_map().union(md_map);
        let flags = h.reg_flags | reg_flags;
        reregister(&self.mds, h, target, flags)
    }

    /// Invalidate a mapping's registrations on `md_map`.
    pub fn invalidate_mapping(
        &mut self,
        mapping: MemMapping,
        md_map: MdMap,
        guard: &InvalidateGuard,
    ) -> Result<()> {
        let bid = self.backing_id(mapping.0)?;
        self.invalidate(&mut MemRef::Cached(bid), md_map, guard)
    }

    pub fn disable_mapping_auto_registration(&mut self, mapping: MemMapping, md_map: MdMap) -> Result<()> {
        let bid = self.backing_id(mapping.0)?;
        self.disable_auto_registration(&mut MemRef::Cached(bid), md_map)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for (id, h) in self.handles.drain() {
            if let Err(e) = destroy(&self.mds, h) {
                tracing::warn!(%id, "failed to destroy handle at shutdown: {e}");
            }
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("enabled", &self.enabled)
            .field("cached", &self.index.len())
            .field("unused", &self.unused.len())
            .field("handles", &self.handles.len())
            .finish()
    }
}

fn invalidate_keys(
    mds: &MdSet,
    handle: &mut MemHandle,
    md_map: MdMap,
    guard: &InvalidateGuard,
) -> Result<()> {
    let targets = md_map.intersection(handle.md_map());
    let mut first_err = None;
    for md in targets.iter() {
        let alloc_key = handle.is_alloc_key(md);
        let Some(key) = handle.keys.remove(md) else {
            continue;
        };
        handle.inv_md_map.remove(md);
        if alloc_key {
            continue;
        }
        if let Some(domain) = mds.get(md)
            && let Err(e) = domain.invalidate(key, guard.notifier())
        {
            tracing::warn!(md, address = handle.start, "invalidation failed: {e}");
            first_err.get_or_insert(e.at(md));
        }
    }
    disable_gva(handle, targets);
    tracing::debug!(
        address = handle.start,
        length = handle.length(),
        invalidated = %targets,
        remaining = %handle.md_map(),
        "invalidated"
    );
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn disable_gva(handle: &mut MemHandle, md_map: MdMap) {
    handle.gva_md_map = handle.gva_md_map.difference(md_map);
    if handle.gva_md_map.is_empty() {
        handle.flags.remove(MemHandleFlags::HAS_AUTO_GVA);
    }
}

/// Deregister everything `h` holds and free memory it allocated.
fn destroy(mds: &MdSet, mut h: MemHandle) -> Result<()> {
    let mut res = deregister_all(mds, &mut h);
    if let (Some(AllocMethod::Md(md)), Some(key)) = (h.alloc_method, h.alloc_key) {
        let freed = mds
            .md(md)
            .and_then(|d| d.free(h.start, h.length(), key).map_err(|e| e.at(md)));
        if let Err(e) = freed {
            tracing::warn!(md, address = h.start, "free failed: {e}");
            if res.is_ok() {
                res = Err(e);
            }
        }
    }
    res
}
