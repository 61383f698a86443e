use super::helpers::{Completions, pair, pair_with, pattern, uncached};
use nexar_rma::lane::OpKind;
use nexar_rma::md::HostMdFailure;
use nexar_rma::{
    Context, ContextParams, HostMd, MdMap, MemoryDomain, RequestParams, RmaConfig, RmaError,
    RmaStatus, Threshold,
};
use std::sync::Arc;

#[test]
fn short_put_parks_when_lane_is_busy() {
    let p = pair(1);
    let mut remote = vec![0u8; 64];
    let rkey = p.expose_all(&mut remote);
    let src = pattern(32);
    let done = Completions::default();

    // One failure for the inline attempt, one for the request's first issue.
    p.lanes[0].inject_no_resource(2);
    let status = unsafe {
        p.worker.put_nbx(
            p.ep,
            src.as_ptr() as u64,
            32,
            remote.as_ptr() as u64,
            &rkey,
            done.params(),
        )
    }
    .unwrap();
    let RmaStatus::InProgress(id) = status else {
        panic!("expected a parked request, got {status:?}");
    };
    assert!(p.worker.is_in_flight(id).unwrap());
    assert!(p.lanes[0].ops().is_empty());

    p.worker.progress().unwrap();
    assert!(!p.worker.is_in_flight(id).unwrap());
    let results = done.take();
    assert_eq!(results.len(), 1);
    assert!(results[0].is_ok());
    assert_eq!(&remote[..32], &src[..]);
}

#[test]
fn force_imm_cmpl_reports_no_resource() {
    let p = pair(1);
    let mut remote = vec![0u8; 64];
    let rkey = p.expose_all(&mut remote);
    let src = pattern(32);

    p.lanes[0].inject_no_resource(1);
    let res = unsafe {
        p.worker.put_nbx(
            p.ep,
            src.as_ptr() as u64,
            32,
            remote.as_ptr() as u64,
            &rkey,
            RequestParams::new().force_imm_cmpl(),
        )
    };
    let err = res.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(p.worker.outstanding().unwrap(), 0);
}

#[test]
fn parked_requests_resume_in_issue_order() {
    let p = pair_with(1, RmaConfig::default(), |a| {
        a.put_zcopy_thresh = Threshold::Fixed(1 << 20);
    });
    let mut remote = vec![0u8; 4096];
    let rkey = p.expose_all(&mut remote);
    let src = pattern(4096);
    let done = Completions::default();

    p.lanes[0].inject_no_resource(1);
    let mut ids = Vec::new();
    for (off, len) in [(0u64, 1024usize), (1024, 16), (2048, 2048)] {
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
        let RmaStatus::InProgress(id) = status else {
            panic!("expected a queued request, got {status:?}");
        };
        ids.push(id);
    }
    assert_eq!(p.worker.outstanding().unwrap(), 3);
    assert!(p.lanes[0].ops().is_empty());

    p.worker.progress().unwrap();
    assert!(ids.iter().all(|&id| !p.worker.is_in_flight(id).unwrap()));
    assert_eq!(done.count(), 3);
    let base = remote.as_ptr() as u64;
    let order: Vec<u64> = p.lanes[0].ops().iter().map(|op| op.remote_addr - base).collect();
    assert_eq!(order, vec![0, 1024, 2048]);
    assert_eq!(remote, src);
}

#[tokio::test]
async fn zcopy_resumes_after_no_resource() {
    let p = pair_with(1, uncached(), |a| {
        a.put_zcopy_thresh = Threshold::Fixed(256);
    });
    let mut remote = vec![0u8; 1024];
    let rkey = p.expose_all(&mut remote);
    let src = pattern(1024);
    let done = Completions::default();

    p.lanes[0].inject_no_resource(2);
    let status = unsafe {
        p.worker.put_nbx(
            p.ep,
            src.as_ptr() as u64,
            1024,
            remote.as_ptr() as u64,
            &rkey,
            done.params(),
        )
    }
    .unwrap();
    let RmaStatus::InProgress(id) = status else {
        panic!("expected a request, got {status:?}");
    };
    // Registered up front, even while parked.
    assert_eq!(p.local[0].live_registrations(), 1);

    p.worker.wait(id).await.unwrap();
    assert!(done.take()[0].is_ok());
    assert_eq!(p.lanes[0].count(OpKind::PutZcopy), 1);
    assert_eq!(p.local[0].live_registrations(), 0);
    assert_eq!(remote, src);
}

#[tokio::test]
async fn completion_error_reaches_callback_and_releases_registration() {
    let p = pair_with(1, uncached(), |a| {
        a.max_put_zcopy = 512;
        a.put_zcopy_thresh = Threshold::Fixed(256);
    });
    let mut remote = vec![0u8; 2048];
    let rkey = p.expose_all(&mut remote);
    let src = pattern(2048);
    let done = Completions::default();

    p.lanes[0].inject_completion_error("link reset");
    let status = unsafe {
        p.worker.put_nbx(
            p.ep,
            src.as_ptr() as u64,
            2048,
            remote.as_ptr() as u64,
            &rkey,
            done.params(),
        )
    }
    .unwrap();
    let RmaStatus::InProgress(id) = status else {
        panic!("expected a request, got {status:?}");
    };
    assert_eq!(p.lanes[0].count(OpKind::PutZcopy), 4);

    p.worker.wait(id).await.unwrap();
    let results = done.take();
    assert_eq!(results.len(), 1);
    match &results[0] {
        Err(RmaError::Transport { message, .. }) => assert!(message.contains("link reset")),
        other => panic!("expected a transport error, got {other:?}"),
    }
    assert_eq!(p.local[0].live_registrations(), 0);
    assert_eq!(p.local[0].deregistrations(), 1);
}

#[test]
fn issue_error_returned_inline() {
    let p = pair_with(1, RmaConfig::default(), |a| {
        a.put_zcopy_thresh = Threshold::Fixed(1 << 20);
    });
    let mut remote = vec![0u8; 1024];
    let rkey = p.expose_all(&mut remote);
    let src = pattern(1024);

    p.lanes[0].inject_issue_error("queue pair down");
    let res = unsafe {
        p.worker.put_nbx(
            p.ep,
            src.as_ptr() as u64,
            1024,
            remote.as_ptr() as u64,
            &rkey,
            RequestParams::default(),
        )
    };
    assert!(matches!(res, Err(RmaError::Transport { .. })));
    assert_eq!(p.worker.outstanding().unwrap(), 0);
}

#[test]
fn issue_error_through_callback_with_no_imm_cmpl() {
    let p = pair_with(1, RmaConfig::default(), |a| {
        a.put_zcopy_thresh = Threshold::Fixed(1 << 20);
    });
    let mut remote = vec![0u8; 1024];
    let rkey = p.expose_all(&mut remote);
    let src = pattern(1024);
    let done = Completions::default();

    p.lanes[0].inject_issue_error("queue pair down");
    let status = unsafe {
        p.worker.put_nbx(
            p.ep,
            src.as_ptr() as u64,
            1024,
            remote.as_ptr() as u64,
            &rkey,
            done.params().no_imm_cmpl(),
        )
    }
    .unwrap();
    assert!(matches!(status, RmaStatus::InProgress(_)));
    let results = done.take();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(RmaError::Transport { .. })));
}

#[test]
fn request_pool_exhaustion() {
    let config = RmaConfig {
        request_pool_size: 1,
        ..uncached()
    };
    let p = pair_with(1, config, |a| a.put_zcopy_thresh = Threshold::Fixed(256));
    let mut remote = vec![0u8; 2048];
    let rkey = p.expose_all(&mut remote);
    let src = pattern(2048);
    let put = |off: u64| unsafe {
        p.worker.put_nbx(
            p.ep,
            src.as_ptr() as u64 + off,
            1024,
            remote.as_ptr() as u64 + off,
            &rkey,
            RequestParams::default(),
        )
    };

    let first = put(0).unwrap();
    assert!(matches!(first, RmaStatus::InProgress(_)));
    assert!(matches!(
        put(1024),
        Err(RmaError::NoMemory { what: "request pool" })
    ));
    // The failed call registered nothing.
    assert_eq!(p.local[0].live_registrations(), 1);

    while p.worker.outstanding().unwrap() > 0 {
        p.worker.progress().unwrap();
    }
    assert!(matches!(put(1024).unwrap(), RmaStatus::InProgress(_)));
    while p.worker.outstanding().unwrap() > 0 {
        p.worker.progress().unwrap();
    }
}

#[test]
fn registration_failure_rolls_back_earlier_domains() {
    let p = pair_with(2, RmaConfig::default(), |a| {
        a.put_zcopy_thresh = Threshold::Fixed(256);
    });
    let mut remote = vec![0u8; 1024];
    let rkey = p.expose_all(&mut remote);
    assert_eq!(rkey.md_map(), MdMap::first(2));
    let src = pattern(1024);

    p.local[1].fail_next_registration(HostMdFailure::Io);
    let res = unsafe {
        p.worker.put_nbx(
            p.ep,
            src.as_ptr() as u64,
            1024,
            remote.as_ptr() as u64,
            &rkey,
            RequestParams::default(),
        )
    };
    assert!(matches!(res, Err(RmaError::IoError { md: 1, .. })));
    assert_eq!(p.local[0].live_registrations(), 0);
    assert_eq!(p.local[1].live_registrations(), 0);
    assert_eq!(p.worker.outstanding().unwrap(), 0);
    assert!(p.lanes[0].ops().is_empty());
}

#[test]
fn remote_range_outside_rkey_is_a_transport_error() {
    let p = pair(1);
    let mut remote = vec![0u8; 64];
    let rkey = p.expose_all(&mut remote);
    let src = pattern(32);

    // Well past the registered (page-aligned) region.
    let res = unsafe {
        p.worker.put_nbx(
            p.ep,
            src.as_ptr() as u64,
            32,
            remote.as_ptr() as u64 + (1 << 20),
            &rkey,
            RequestParams::default(),
        )
    };
    assert!(matches!(res, Err(RmaError::Transport { .. })));
    assert!(remote.iter().all(|&b| b == 0));
}

#[test]
fn unusable_config_is_rejected_at_context_creation() {
    let bad = [
        RmaConfig {
            bcopy_chunk_bytes: 0,
            ..RmaConfig::default()
        },
        RmaConfig {
            rcache_alignment: 3000,
            ..RmaConfig::default()
        },
    ];
    for config in bad {
        let md: Arc<dyn MemoryDomain> = Arc::new(HostMd::new("l0"));
        let res = Context::new(ContextParams::default(), config, vec![md]);
        assert!(matches!(res, Err(RmaError::InvalidParam(_))));
    }
}
