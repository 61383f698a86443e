use super::helpers::{Completions, pair, pair_from, pair_with, pattern};
use nexar_rma::rkey::{RKEY_PREFIX_LEN, packed_md_map, packed_mem_type};
use nexar_rma::{HostMd, MapParams, MdMap, MemoryType, RequestParams, RmaConfig, RmaError, RmaStatus, Threshold};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[test]
fn packed_rkey_lists_only_requested_domains() {
    let p = pair(3);
    let mut buf = vec![0u8; 256];
    let m = p
        .peer
        .mem_map(&MapParams::new(buf.as_mut_ptr() as u64, buf.len()).with_md_map(MdMap::from_bits(0b101)))
        .unwrap();

    let packed = p.peer.rkey_pack(m).unwrap();
    assert_eq!(packed_md_map(&packed).unwrap(), MdMap::from_bits(0b101));
    assert_eq!(packed_mem_type(&packed).unwrap(), MemoryType::Host);
    // Two HostMd materials of 24 bytes, each behind a length byte.
    assert_eq!(packed.len(), RKEY_PREFIX_LEN + 2 * (1 + 24));
    assert_eq!(p.remote[1].registrations(), 0);

    let rkey = p.worker.rkey_unpack(p.ep, &packed).unwrap();
    assert_eq!(rkey.md_map(), MdMap::from_bits(0b101));
    assert_eq!(rkey.endpoint(), p.ep);
    p.peer.mem_unmap(m).unwrap();
}

#[test]
fn rkey_without_matching_lane_is_unreachable() {
    let local: Vec<Arc<HostMd>> = (0..2).map(|i| Arc::new(HostMd::new(&format!("l{i}")))).collect();
    let remote: Vec<Arc<HostMd>> = (0..3).map(|i| Arc::new(HostMd::new(&format!("r{i}")))).collect();
    let p = pair_from(local, remote, RmaConfig::default(), |_| {});
    let mut buf = vec![0u8; 64];
    let m = p
        .peer
        .mem_map(&MapParams::new(buf.as_mut_ptr() as u64, buf.len()).with_md_map(MdMap::single(2)))
        .unwrap();

    let packed = p.peer.rkey_pack(m).unwrap();
    let res = p.worker.rkey_unpack(p.ep, &packed);
    assert!(matches!(res, Err(RmaError::Unreachable { md_map: 0b100 })));
}

#[tokio::test]
async fn get_into_allocated_mapping_uses_alloc_key() {
    let local = vec![Arc::new(HostMd::new("l0").with_alloc(true))];
    let remote = vec![Arc::new(HostMd::new("r0"))];
    let p = pair_from(local, remote, RmaConfig::default(), |a| {
        a.get_zcopy_thresh = Threshold::Fixed(256);
    });
    let m = p.ctx.mem_map(&MapParams::allocate(4096)).unwrap();
    let info = p.ctx.mem_query(m).unwrap();
    assert_ne!(info.address, 0);
    assert_eq!(info.md_map, MdMap::single(0));
    // The allocation's own registration is the only one.
    assert_eq!(p.local[0].registrations(), 1);

    let mut src = pattern(4096);
    let rkey = p.expose_all(&mut src);
    let done = Completions::default();
    let status = unsafe {
        p.worker.get_nbx(
            p.ep,
            info.address,
            4096,
            src.as_ptr() as u64,
            &rkey,
            done.params().memh(m),
        )
    }
    .unwrap();
    let RmaStatus::InProgress(id) = status else {
        panic!("expected a request, got {status:?}");
    };
    p.worker.wait(id).await.unwrap();
    assert!(done.take()[0].is_ok());
    assert_eq!(p.local[0].registrations(), 1);

    // SAFETY: the mapping owns 4096 bytes at `info.address` until unmapped.
    let landed = unsafe { std::slice::from_raw_parts(info.address as *const u8, 4096) };
    assert_eq!(landed, &src[..]);

    p.ctx.mem_unmap(m).unwrap();
    assert_eq!(p.local[0].live_registrations(), 0);
}

#[test]
fn async_invalidation_revokes_remote_access() {
    let local = vec![Arc::new(HostMd::new("l0"))];
    let remote = vec![Arc::new(HostMd::new("r0").with_async_invalidate(true))];
    let p = pair_from(local, remote, RmaConfig::default(), |_| {});
    let mut target = vec![0u8; 64];
    let (m, rkey) = p.expose(&mut target, MdMap::single(0));
    let src = pattern(16);
    let put = || unsafe {
        p.worker.put_nbx(
            p.ep,
            src.as_ptr() as u64,
            16,
            target.as_ptr() as u64,
            &rkey,
            RequestParams::default(),
        )
    };
    assert_eq!(put().unwrap(), RmaStatus::Done);

    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    p.peer
        .mem_invalidate(m, MdMap::single(0), move || flag.store(true, Ordering::SeqCst))
        .unwrap();
    assert!(!fired.load(Ordering::SeqCst), "domain has not finished yet");
    assert_eq!(p.remote[0].pending_invalidations(), 1);
    assert_eq!(p.peer.mem_query(m).unwrap().md_map, MdMap::EMPTY);

    // The key is gone even before the domain reports completion.
    assert!(matches!(put(), Err(RmaError::Transport { .. })));

    assert_eq!(p.remote[0].complete_invalidations(), 1);
    assert!(fired.load(Ordering::SeqCst));
    p.peer.mem_unmap(m).unwrap();
}

#[tokio::test]
async fn invalidated_user_mapping_reregisters_on_demand() {
    let p = pair_with(1, RmaConfig::default(), |a| {
        a.put_zcopy_thresh = Threshold::Fixed(256);
    });
    let mut remote = vec![0u8; 2048];
    let rkey = p.expose_all(&mut remote);
    let src = pattern(2048);
    let m = p
        .ctx
        .mem_map(&MapParams::new(src.as_ptr() as u64, src.len()))
        .unwrap();
    p.ctx.mem_invalidate(m, MdMap::single(0), || {}).unwrap();
    assert_eq!(p.ctx.mem_query(m).unwrap().md_map, MdMap::EMPTY);
    let before = p.local[0].registrations();

    let status = unsafe {
        p.worker.put_nbx(
            p.ep,
            src.as_ptr() as u64,
            2048,
            remote.as_ptr() as u64,
            &rkey,
            RequestParams::new().memh(m),
        )
    }
    .unwrap();
    if let RmaStatus::InProgress(id) = status {
        p.worker.wait(id).await.unwrap();
    }

    assert_eq!(p.local[0].registrations(), before + 1);
    assert_eq!(p.ctx.mem_query(m).unwrap().md_map, MdMap::single(0));
    assert_eq!(remote, src);
    p.ctx.mem_unmap(m).unwrap();
}
