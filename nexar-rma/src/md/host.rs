//! Software memory domain for host memory.
//!
//! Registration is pure bookkeeping: each key records the range it covers, so
//! in-process lanes can validate remote keys the way a NIC would. Failure
//! injection and counters make it usable as a test double.

use super::{InvalidateNotifier, MdAttributes, MdError, MdKey, MemoryDomain, RegCost, RegFlags};
use crate::types::{MemoryType, MemoryTypeSet};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Size of packed rkey material: key(8) + base(8) + length(8).
const RKEY_MATERIAL_SIZE: usize = 24;

/// Kind of failure to inject into a future `register` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMdFailure {
    Io,
    Unsupported,
}

#[derive(Debug, Clone, Copy)]
struct Region {
    address: u64,
    length: usize,
}

#[derive(Default)]
struct HostMdState {
    next_key: u64,
    regions: HashMap<u64, Region>,
    registrations: u64,
    deregistrations: u64,
    /// Fail the registration after `skip` successful ones.
    fail: Option<(usize, HostMdFailure)>,
    pending_invalidations: Vec<InvalidateNotifier>,
    allocations: HashMap<u64, Box<[u8]>>,
}

/// In-process memory domain.
pub struct HostMd {
    name: String,
    attrs: MdAttributes,
    max_inline: usize,
    async_invalidate: bool,
    state: Mutex<HostMdState>,
}

impl HostMd {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attrs: MdAttributes::default(),
            max_inline: 64,
            async_invalidate: false,
            state: Mutex::new(HostMdState {
                next_key: 1,
                ..Default::default()
            }),
        }
    }

    /// Memory types this domain registers (and allocates, if enabled).
    pub fn with_mem_types(mut self, types: &[MemoryType]) -> Self {
        self.attrs.reg_mem_types = MemoryTypeSet::of(types);
        if self.attrs.alloc_mem_types != MemoryTypeSet::EMPTY {
            self.attrs.alloc_mem_types = self.attrs.reg_mem_types;
        }
        self
    }

    pub fn with_max_reg_len(mut self, max: usize) -> Self {
        self.attrs.max_reg_len = max;
        self
    }

    pub fn with_max_inline(mut self, max: usize) -> Self {
        self.max_inline = max;
        self
    }

    pub fn with_gva(mut self, enabled: bool) -> Self {
        self.attrs.supports_gva = enabled;
        self
    }

    pub fn with_reg_cost(mut self, cost: RegCost) -> Self {
        self.attrs.reg_cost = cost;
        self
    }

    /// Allow `alloc` for every registrable memory type.
    pub fn with_alloc(mut self, enabled: bool) -> Self {
        self.attrs.alloc_mem_types = if enabled {
            self.attrs.reg_mem_types
        } else {
            MemoryTypeSet::EMPTY
        };
        self
    }

    /// Hold invalidations until `complete_invalidations` is called.
    pub fn with_async_invalidate(mut self, enabled: bool) -> Self {
        self.async_invalidate = enabled;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HostMdState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the registration after `skip` further successful ones fail.
    pub fn fail_registration_after(&self, skip: usize, failure: HostMdFailure) {
        self.lock().fail = Some((skip, failure));
    }

    /// Make the next registration fail.
    pub fn fail_next_registration(&self, failure: HostMdFailure) {
        self.fail_registration_after(0, failure);
    }

    /// Registrations currently alive.
    pub fn live_registrations(&self) -> usize {
        self.lock().regions.len()
    }

    /// Total successful `register` calls.
    pub fn registrations(&self) -> u64 {
        self.lock().registrations
    }

    /// Total deregistrations, including completed invalidations.
    pub fn deregistrations(&self) -> u64 {
        self.lock().deregistrations
    }

    /// Whether a live registration covers `[address, address + length)`.
    pub fn is_registered(&self, address: u64, length: usize) -> bool {
        self.lock()
            .regions
            .values()
            .any(|r| covers(r, address, length))
    }

    /// Number of live registrations overlapping `[address, address + length)`.
    pub fn registrations_overlapping(&self, address: u64, length: usize) -> usize {
        let end = address.saturating_add(length as u64);
        self.lock()
            .regions
            .values()
            .filter(|r| r.address < end && address < r.address + r.length as u64)
            .count()
    }

    /// Invalidations waiting on `complete_invalidations`.
    pub fn pending_invalidations(&self) -> usize {
        self.lock().pending_invalidations.len()
    }

    /// Finish every held invalidation. Returns how many completed.
    pub fn complete_invalidations(&self) -> usize {
        let pending = std::mem::take(&mut self.lock().pending_invalidations);
        let n = pending.len();
        // Notifiers run completions; drop them outside the state lock.
        drop(pending);
        n
    }

    /// Whether local `key` is live and covers `[address, address + length)`.
    pub fn key_covers(&self, key: MdKey, address: u64, length: usize) -> bool {
        self.lock()
            .regions
            .get(&key.0)
            .is_some_and(|r| covers(r, address, length))
    }

    /// Check that `material` (from `pack_rkey`) grants access to
    /// `[address, address + length)`.
    pub fn validate_rkey(&self, material: &[u8], address: u64, length: usize) -> bool {
        let Some((key, base, len)) = decode_material(material) else {
            return false;
        };
        let state = self.lock();
        match state.regions.get(&key) {
            Some(r) => {
                r.address == base
                    && r.length == len
                    && covers(r, address, length)
            }
            None => false,
        }
    }
}

fn covers(r: &Region, address: u64, length: usize) -> bool {
    address >= r.address
        && address.saturating_add(length as u64) <= r.address + r.length as u64
}

fn decode_material(material: &[u8]) -> Option<(u64, u64, usize)> {
    if material.len() != RKEY_MATERIAL_SIZE {
        return None;
    }
    let word = |i: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&material[i * 8..i * 8 + 8]);
        u64::from_le_bytes(b)
    };
    Some((word(0), word(1), word(2) as usize))
}

impl MemoryDomain for HostMd {
    fn name(&self) -> &str {
        &self.name
    }

    fn attributes(&self) -> &MdAttributes {
        &self.attrs
    }

    fn register(&self, address: u64, length: usize, flags: RegFlags) -> Result<MdKey, MdError> {
        if length > self.attrs.max_reg_len {
            return Err(MdError::Io(format!(
                "{}: length {length} exceeds max registration {}",
                self.name, self.attrs.max_reg_len
            )));
        }
        let mut state = self.lock();
        if let Some((skip, failure)) = state.fail {
            if skip == 0 {
                state.fail = None;
                return Err(match failure {
                    HostMdFailure::Io => MdError::Io(format!("{}: injected failure", self.name)),
                    HostMdFailure::Unsupported => MdError::Unsupported("register"),
                });
            }
            state.fail = Some((skip - 1, failure));
        }
        let key = state.next_key;
        state.next_key += 1;
        state.regions.insert(key, Region { address, length });
        state.registrations += 1;
        tracing::trace!(md = %self.name, key, address, length, ?flags, "host md register");
        Ok(MdKey(key))
    }

    fn deregister(&self, key: MdKey) -> Result<(), MdError> {
        let mut state = self.lock();
        if state.regions.remove(&key.0).is_none() {
            return Err(MdError::Io(format!("{}: unknown key {}", self.name, key.0)));
        }
        state.deregistrations += 1;
        Ok(())
    }

    fn invalidate(&self, key: MdKey, notifier: InvalidateNotifier) -> Result<(), MdError> {
        self.deregister(key)?;
        if self.async_invalidate {
            self.lock().pending_invalidations.push(notifier);
        }
        Ok(())
    }

    fn pack_rkey(&self, key: MdKey) -> Result<Vec<u8>, MdError> {
        let state = self.lock();
        let r = state
            .regions
            .get(&key.0)
            .ok_or_else(|| MdError::Io(format!("{}: unknown key {}", self.name, key.0)))?;
        let mut buf = Vec::with_capacity(RKEY_MATERIAL_SIZE);
        buf.extend_from_slice(&key.0.to_le_bytes());
        buf.extend_from_slice(&r.address.to_le_bytes());
        buf.extend_from_slice(&(r.length as u64).to_le_bytes());
        Ok(buf)
    }

    fn query_max_inline_size(&self) -> usize {
        self.max_inline
    }

    fn alloc(&self, length: usize, mem_type: MemoryType) -> Result<(u64, MdKey), MdError> {
        if !self.attrs.alloc_mem_types.contains(mem_type) {
            return Err(MdError::Unsupported("alloc"));
        }
        let buf = vec![0u8; length.max(1)].into_boxed_slice();
        let address = buf.as_ptr() as u64;
        let key = self.register(address, length, RegFlags::ACCESS_ALL)?;
        self.lock().allocations.insert(address, buf);
        Ok((address, key))
    }

    fn free(&self, address: u64, _length: usize, key: MdKey) -> Result<(), MdError> {
        self.deregister(key)?;
        match self.lock().allocations.remove(&address) {
            Some(_) => Ok(()),
            None => Err(MdError::Io(format!(
                "{}: {address:#x} was not allocated here",
                self.name
            ))),
        }
    }
}
