//! Reconcile a handle's registrations against a target set of memory domains.

use super::handle::{MemHandle, MemHandleFlags};
use crate::error::{Result, RmaError};
use crate::md::{InvalidateGuard, MdError, MdKey, MdSet, RegFlags};
use crate::types::{MdIndex, MdMap};

/// Register `handle` with exactly `target`.
///
/// Domains in `target` but not yet registered are added first; domains no
/// longer in `target` are then removed. If any addition fails, every key added
/// by this call is dropped again and the handle is left as it was.
///
/// A key produced by the allocating domain is reused instead of registering a
/// second time, and is never deregistered here.
pub fn reregister(
    mds: &MdSet,
    handle: &mut MemHandle,
    target: MdMap,
    reg_flags: RegFlags,
) -> Result<()> {
    let current = handle.md_map();
    if handle.length() == 0 {
        if target.is_empty() {
            return Ok(());
        }
        return Err(RmaError::invalid_param(format!(
            "cannot register an empty range with md_map {target}"
        )));
    }
    if !target.is_subset(mds.all()) {
        return Err(RmaError::invalid_param(format!(
            "md_map {target} exceeds the {} available memory domains",
            mds.len()
        )));
    }

    let to_add = target.difference(current);
    let to_remove = current.difference(target);

    let mut added = MdMap::EMPTY;
    for md in to_add.iter() {
        match register_one(mds, handle, md, reg_flags) {
            Ok(key) => {
                handle.keys.insert(md, key);
                added.insert(md);
            }
            Err(e) => {
                if !reg_flags.contains(RegFlags::HIDE_ERRORS) {
                    tracing::warn!(
                        md,
                        address = handle.start,
                        length = handle.length(),
                        rollback = %added,
                        "registration failed: {e}"
                    );
                } else {
                    tracing::debug!(md, "registration failed: {e}");
                }
                let _ = drop_keys(mds, handle, added);
                return Err(e.at(md));
            }
        }
    }

    if !added.is_empty() {
        handle.reg_flags |= reg_flags.access();
        if reg_flags.contains(RegFlags::LOCK) {
            handle.flags |= MemHandleFlags::MLOCKED;
        }
        tracing::debug!(
            address = handle.start,
            length = handle.length(),
            mem_type = %handle.mem_type,
            added = %added,
            "registered"
        );
    }

    drop_keys(mds, handle, to_remove)
}

/// Remove every registration held by `handle`.
pub fn deregister_all(mds: &MdSet, handle: &mut MemHandle) -> Result<()> {
    let all = handle.md_map();
    drop_keys(mds, handle, all)
}

fn register_one(
    mds: &MdSet,
    handle: &mut MemHandle,
    md: MdIndex,
    reg_flags: RegFlags,
) -> std::result::Result<MdKey, MdError> {
    if handle.alloc_md() == Some(md)
        && let Some(key) = handle.alloc_key
    {
        return Ok(key);
    }
    let domain = mds
        .get(md)
        .ok_or(MdError::Unsupported("register on a missing domain"))?;
    let attrs = domain.attributes();
    if !attrs.reg_mem_types.contains(handle.mem_type) {
        return Err(MdError::Unsupported("register for this memory type"));
    }
    let gva = reg_flags.contains(RegFlags::GVA) && attrs.supports_gva;
    let mut flags = reg_flags & !RegFlags::GVA;
    if gva {
        flags |= RegFlags::GVA;
    }
    let key = domain.register(handle.start, handle.length(), flags)?;
    if gva {
        handle.gva_md_map.insert(md);
        handle.flags |= MemHandleFlags::HAS_AUTO_GVA;
    }
    Ok(key)
}

/// Drop the keys for `map`, invalidating those in `inv_md_map`. All keys are
/// removed even if a domain fails; the first failure is returned.
fn drop_keys(mds: &MdSet, handle: &mut MemHandle, map: MdMap) -> Result<()> {
    if map.is_empty() {
        return Ok(());
    }
    let address = handle.start;
    let guard = InvalidateGuard::new(move || {
        tracing::trace!(address, "release invalidation complete");
    });
    let mut first_err = None;
    for md in map.iter() {
        let alloc_key = handle.is_alloc_key(md);
        let invalidate = handle.inv_md_map.contains(md);
        let Some(key) = handle.keys.remove(md) else {
            continue;
        };
        handle.inv_md_map.remove(md);
        handle.gva_md_map.remove(md);
        if alloc_key {
            continue;
        }
        let Some(domain) = mds.get(md) else {
            continue;
        };
        let res = if invalidate {
            domain.invalidate(key, guard.notifier())
        } else {
            domain.deregister(key)
        };
        if let Err(e) = res {
            tracing::warn!(md, address, "deregistration failed: {e}");
            first_err.get_or_insert(e.at(md));
        }
    }
    if handle.gva_md_map.is_empty() {
        handle.flags.remove(MemHandleFlags::HAS_AUTO_GVA);
    }
    drop(guard);
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
