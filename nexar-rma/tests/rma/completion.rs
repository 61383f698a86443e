use super::helpers::{Completions, pair, pair_with, pattern};
use nexar_rma::{RequestParams, RmaConfig, RmaError, RmaStatus, Threshold};

#[test]
fn zero_length_is_done_even_with_null_buffer() {
    let p = pair(1);
    let mut remote = vec![0u8; 64];
    let rkey = p.expose_all(&mut remote);
    let done = Completions::default();

    for get in [false, true] {
        let status = unsafe {
            if get {
                p.worker
                    .get_nbx(p.ep, 0, 0, remote.as_ptr() as u64, &rkey, done.params())
            } else {
                p.worker
                    .put_nbx(p.ep, 0, 0, remote.as_ptr() as u64, &rkey, done.params())
            }
        }
        .unwrap();
        assert_eq!(status, RmaStatus::Done);
    }
    assert!(p.lanes[0].ops().is_empty());
    assert_eq!(p.local[0].registrations(), 0);
    assert_eq!(done.count(), 0);
}

#[test]
fn null_buffer_with_length_is_rejected() {
    let p = pair(1);
    let mut remote = vec![0u8; 64];
    let rkey = p.expose_all(&mut remote);

    let res = unsafe {
        p.worker.put_nbx(
            p.ep,
            0,
            8,
            remote.as_ptr() as u64,
            &rkey,
            RequestParams::default(),
        )
    };
    assert!(matches!(res, Err(RmaError::InvalidParam(_))));
    assert!(p.lanes[0].ops().is_empty());
}

#[tokio::test]
async fn every_callback_fires_exactly_once() {
    let p = pair_with(2, RmaConfig::default(), |a| {
        a.max_put_zcopy = 1000;
        a.put_zcopy_thresh = Threshold::Fixed(1024);
    });
    p.lanes[0].set_poll_batch(3);
    let mut remote = vec![0u8; 64 * 1024];
    let rkey = p.expose_all(&mut remote);
    let src = pattern(64 * 1024);
    let done = Completions::default();

    // Mix of short, buffered and zero-copy sizes over 16 disjoint slices.
    let sizes = [16usize, 512, 2048, 4096];
    let mut requests = 0;
    for i in 0..16 {
        let len = sizes[i % sizes.len()];
        let off = (i * 4096) as u64;
        let status = unsafe {
            p.worker.put_nbx(
                p.ep,
                src.as_ptr() as u64 + off,
                len,
                remote.as_ptr() as u64 + off,
                &rkey,
                done.params(),
            )
        }
        .unwrap();
        if matches!(status, RmaStatus::InProgress(_)) {
            requests += 1;
        }
    }
    assert_eq!(requests, 8, "only the zero-copy sizes stay in flight");

    p.worker.wait_all().await.unwrap();
    for _ in 0..4 {
        assert_eq!(p.worker.progress().unwrap(), 0);
    }

    let results = done.take();
    assert_eq!(results.len(), requests);
    assert!(results.iter().all(|r| r.is_ok()));
    for i in 0..16 {
        let len = sizes[i % sizes.len()];
        let off = i * 4096;
        assert_eq!(&remote[off..off + len], &src[off..off + len]);
    }
}

#[tokio::test]
async fn cached_registration_reused_across_requests() {
    let p = pair_with(1, RmaConfig::default(), |a| {
        a.put_zcopy_thresh = Threshold::Fixed(1024);
    });
    let mut remote = vec![0u8; 4096];
    let rkey = p.expose_all(&mut remote);
    let src = pattern(4096);

    for round in 0..2 {
        remote.fill(0);
        let status = unsafe {
            p.worker.put_nbx(
                p.ep,
                src.as_ptr() as u64,
                src.len(),
                remote.as_ptr() as u64,
                &rkey,
                RequestParams::default(),
            )
        }
        .unwrap();
        let RmaStatus::InProgress(id) = status else {
            panic!("round {round}: expected a request, got {status:?}");
        };
        p.worker.wait(id).await.unwrap();
        assert_eq!(remote, src);
    }

    assert_eq!(p.local[0].registrations(), 1);
    assert_eq!(p.local[0].deregistrations(), 0);
    assert_eq!(p.local[0].live_registrations(), 1);
    let registry = p.ctx.registry().unwrap();
    assert_eq!(registry.cached_entries(), 1);
    assert_eq!(registry.unused_entries(), 1);
}

#[test]
fn fence_mode_disables_the_inline_path() {
    let p = pair(1);
    let mut remote = vec![0u8; 64];
    let rkey = p.expose_all(&mut remote);
    let src = pattern(8);
    let put = |params: RequestParams| unsafe {
        p.worker
            .put_nbx(p.ep, src.as_ptr() as u64, 8, remote.as_ptr() as u64, &rkey, params)
    };

    p.worker.set_fence(p.ep, true).unwrap();
    assert!(matches!(
        put(RequestParams::new().force_imm_cmpl()),
        Err(RmaError::NoResource)
    ));
    // Without `force_imm_cmpl` a request carries the ordering.
    assert_eq!(put(RequestParams::default()).unwrap(), RmaStatus::Done);

    p.worker.set_fence(p.ep, false).unwrap();
    assert_eq!(
        put(RequestParams::new().force_imm_cmpl()).unwrap(),
        RmaStatus::Done
    );
}

#[test]
fn one_shot_fence_applies_to_the_next_operation() {
    let p = pair(1);
    let mut remote = vec![0u8; 64];
    let rkey = p.expose_all(&mut remote);
    let src = pattern(8);
    let put = |params: RequestParams| unsafe {
        p.worker
            .put_nbx(p.ep, src.as_ptr() as u64, 8, remote.as_ptr() as u64, &rkey, params)
    };

    // Nothing issued yet: the fence is a no-op.
    p.worker.fence(p.ep).unwrap();
    assert_eq!(
        put(RequestParams::new().force_imm_cmpl()).unwrap(),
        RmaStatus::Done
    );
    assert_eq!(p.worker.unflushed_lanes(p.ep).unwrap(), 0b1);

    p.worker.fence(p.ep).unwrap();
    assert!(matches!(
        put(RequestParams::new().force_imm_cmpl()),
        Err(RmaError::NoResource)
    ));
    assert_eq!(put(RequestParams::default()).unwrap(), RmaStatus::Done);
    assert_eq!(
        put(RequestParams::new().force_imm_cmpl()).unwrap(),
        RmaStatus::Done,
        "the fence was consumed"
    );
}
