use super::helpers::{Completions, pair, pair_from, pair_with, pattern, uncached};
use nexar_rma::lane::OpKind;
use nexar_rma::rma::RequestState;
use nexar_rma::{HostMd, RequestParams, RmaConfig, RmaError, RmaStatus, Threshold};
use std::sync::Arc;

#[test]
fn zcopy_get_completes_after_both_fragments() {
    let p = pair_with(1, uncached(), |a| {
        a.max_get_zcopy = 4096;
        a.get_zcopy_thresh = Threshold::Fixed(2048);
    });
    p.lanes[0].set_poll_batch(1);
    let mut remote = pattern(8192);
    let rkey = p.expose_all(&mut remote);
    let mut dst = vec![0u8; 8192];
    let done = Completions::default();

    let status = unsafe {
        p.worker.get_nbx(
            p.ep,
            dst.as_mut_ptr() as u64,
            dst.len(),
            remote.as_ptr() as u64,
            &rkey,
            done.params(),
        )
    }
    .unwrap();
    let RmaStatus::InProgress(id) = status else {
        panic!("expected a request, got {status:?}");
    };

    let progress = p.worker.request_progress(id).unwrap().unwrap();
    assert_eq!(progress.outstanding, 2);
    assert_eq!(progress.unissued, 0);
    assert_eq!(progress.remaining, 8192);
    assert_eq!(progress.state, RequestState::Completing);
    let ops = p.lanes[0].ops();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[1].remote_addr, ops[0].remote_addr + 4096);

    assert_eq!(p.worker.progress().unwrap(), 1);
    let progress = p.worker.request_progress(id).unwrap().unwrap();
    assert_eq!(progress.outstanding, 1);
    assert_eq!(progress.remaining, 4096);
    assert_eq!(done.count(), 0);
    assert_eq!(p.local[0].deregistrations(), 0);

    assert_eq!(p.worker.progress().unwrap(), 1);
    assert!(!p.worker.is_in_flight(id).unwrap());
    let results = done.take();
    assert_eq!(results.len(), 1);
    assert!(results[0].is_ok());
    assert_eq!(p.local[0].registrations(), 1);
    assert_eq!(p.local[0].deregistrations(), 1);
    assert_eq!(dst, remote);
}

#[test]
fn short_get_completes_inline() {
    let p = pair(1);
    let mut remote = pattern(64);
    let rkey = p.expose_all(&mut remote);
    let mut dst = [0u8; 16];

    let status = unsafe {
        p.worker.get_nbx(
            p.ep,
            dst.as_mut_ptr() as u64,
            16,
            remote.as_ptr() as u64 + 8,
            &rkey,
            RequestParams::default(),
        )
    }
    .unwrap();

    assert_eq!(status, RmaStatus::Done);
    assert_eq!(p.lanes[0].count(OpKind::GetShort), 1);
    assert_eq!(&dst[..], &remote[8..24]);
}

#[test]
fn bcopy_get_copies_out_of_bounce_buffers() {
    let p = pair_with(1, RmaConfig::default(), |a| {
        a.max_bcopy = 4096;
        a.get_zcopy_thresh = Threshold::Fixed(1 << 20);
    });
    let mut remote = pattern(5000);
    let rkey = p.expose_all(&mut remote);
    let mut dst = vec![0u8; 5000];

    let status = unsafe {
        p.worker.get_nbx(
            p.ep,
            dst.as_mut_ptr() as u64,
            dst.len(),
            remote.as_ptr() as u64,
            &rkey,
            RequestParams::default(),
        )
    }
    .unwrap();

    assert_eq!(status, RmaStatus::Done);
    assert_eq!(p.lanes[0].count(OpKind::GetBcopy), 2);
    assert_eq!(p.local[0].registrations(), 0);
    assert_eq!(dst, remote);
}

#[tokio::test]
async fn get_nbi_then_wait_all() {
    let p = pair_with(1, RmaConfig::default(), |a| {
        a.get_zcopy_thresh = Threshold::Fixed(512);
    });
    let mut remote = pattern(3000);
    let rkey = p.expose_all(&mut remote);
    let mut a = vec![0u8; 1000];
    let mut b = vec![0u8; 2000];

    unsafe {
        p.worker
            .get_nbi(p.ep, a.as_mut_ptr() as u64, 1000, remote.as_ptr() as u64, &rkey)
            .unwrap();
        p.worker
            .get_nbi(
                p.ep,
                b.as_mut_ptr() as u64,
                2000,
                remote.as_ptr() as u64 + 1000,
                &rkey,
            )
            .unwrap();
    }
    assert_eq!(p.worker.outstanding().unwrap(), 2);
    p.worker.wait_all().await.unwrap();

    assert_eq!(&a[..], &remote[..1000]);
    assert_eq!(&b[..], &remote[1000..]);
}

#[test]
fn force_imm_cmpl_large_get_is_no_resource() {
    let p = pair(1);
    let mut remote = pattern(4096);
    let rkey = p.expose_all(&mut remote);
    let mut dst = vec![0u8; 4096];

    let res = unsafe {
        p.worker.get_nbx(
            p.ep,
            dst.as_mut_ptr() as u64,
            dst.len(),
            remote.as_ptr() as u64,
            &rkey,
            RequestParams::new().force_imm_cmpl(),
        )
    };
    assert!(matches!(res, Err(RmaError::NoResource)));
    assert!(p.lanes[0].ops().is_empty());
    assert_eq!(p.worker.outstanding().unwrap(), 0);
}

#[test]
fn max_registration_length_splits_zcopy_get() {
    let local = vec![Arc::new(HostMd::new("l0").with_max_reg_len(4096))];
    let remote_mds = vec![Arc::new(HostMd::new("r0"))];
    let p = pair_from(local, remote_mds, uncached(), |a| {
        a.get_zcopy_thresh = Threshold::Fixed(2048);
    });
    p.lanes[0].set_poll_batch(1);
    let mut remote = pattern(8192);
    let rkey = p.expose_all(&mut remote);
    let mut dst = vec![0u8; 8192];
    let done = Completions::default();

    let status = unsafe {
        p.worker.get_nbx(
            p.ep,
            dst.as_mut_ptr() as u64,
            dst.len(),
            remote.as_ptr() as u64,
            &rkey,
            done.params(),
        )
    }
    .unwrap();
    let RmaStatus::InProgress(id) = status else {
        panic!("expected a request, got {status:?}");
    };
    let ops = p.lanes[0].ops();
    assert_eq!(ops.len(), 2);
    assert!(ops.iter().all(|op| op.kind == OpKind::GetZcopy && op.length == 4096));
    assert_eq!(p.local[0].registrations(), 2);
    assert_eq!(
        p.local[0].registrations_overlapping(dst.as_ptr() as u64, dst.len()),
        2
    );
    let progress = p.worker.request_progress(id).unwrap().unwrap();
    assert_eq!(progress.outstanding, 2);
    assert_eq!(progress.remaining, 8192);

    assert_eq!(p.worker.progress().unwrap(), 1);
    let progress = p.worker.request_progress(id).unwrap().unwrap();
    assert_eq!(progress.outstanding, 1);
    assert_eq!(progress.remaining, 4096);
    assert_eq!(done.count(), 0);
    assert_eq!(p.local[0].deregistrations(), 0);

    assert_eq!(p.worker.progress().unwrap(), 1);
    let results = done.take();
    assert_eq!(results.len(), 1);
    assert!(results[0].is_ok());
    assert_eq!(p.local[0].deregistrations(), 2);
    assert_eq!(p.local[0].live_registrations(), 0);
    assert_eq!(dst, remote);
}

#[tokio::test]
async fn cached_registration_stays_within_max_registration_length() {
    let local = vec![Arc::new(HostMd::new("l0").with_max_reg_len(4096))];
    let remote_mds = vec![Arc::new(HostMd::new("r0"))];
    let p = pair_from(local, remote_mds, RmaConfig::default(), |a| {
        a.max_get_zcopy = 4096;
        a.get_zcopy_thresh = Threshold::Fixed(2048);
    });
    let mut remote = pattern(8192);
    let rkey = p.expose_all(&mut remote);
    // Off page alignment, so widening either window would exceed the limit.
    let mut dst = vec![0u8; 8192 + 16];
    let base = dst.as_mut_ptr() as u64 + 16;

    for len in [4096usize, 8192] {
        let status = unsafe {
            p.worker.get_nbx(
                p.ep,
                base,
                len,
                remote.as_ptr() as u64,
                &rkey,
                RequestParams::default(),
            )
        }
        .unwrap();
        if let RmaStatus::InProgress(id) = status {
            p.worker.wait(id).await.unwrap();
        }
        assert_eq!(&dst[16..16 + len], &remote[..len]);
    }

    assert_eq!(p.lanes[0].count(OpKind::GetZcopy), 3);
    let registry = p.ctx.registry().unwrap();
    assert_eq!(registry.cached_entries(), 2);
    assert_eq!(p.local[0].live_registrations(), 2);
    assert_eq!(p.local[0].registrations(), 2, "first window reused from the cache");
}
