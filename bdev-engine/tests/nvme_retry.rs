//! I/O retry policy: ANA-driven queueing, the retry budget, transport
//! queue exhaustion and abort of queued requests.

use std::{sync::Arc, time::Duration};

use bdev_engine::{
    bdev::nvmx::{
        self,
        emu::{EmuSubsystem, EmuTransport},
        options,
        transport,
        utils::AnaState,
        NVME_CONTROLLERS,
    },
    core::{
        BdevHandle,
        GenericStatusCode,
        IoStatus,
        NvmeCommandStatus,
        NvmeStatus,
    },
    subsys::Config,
};

pub mod common;

fn trid(port: &str, nqn: &str) -> transport::NvmeTransportId {
    transport::Builder::new()
        .with_traddr("127.0.0.1")
        .with_svcid(port)
        .with_subnqn(nqn)
        .build()
}

async fn setup(tag: &str, port: &str) -> (Arc<EmuSubsystem>, String) {
    let nqn = format!("nqn.2019-05.io.engine:{}", tag);
    let sub = EmuSubsystem::create(&nqn);
    sub.add_namespace(1, 1024, 512, 1);
    sub.listen("127.0.0.1", port);

    let bdevs = nvmx::attach_controller(
        tag,
        &format!("{}c0", tag),
        trid(port, &nqn),
        Arc::new(EmuTransport),
        options::Builder::new().build(),
    )
    .await
    .unwrap();

    (sub, bdevs[0].clone())
}

async fn teardown(tag: &str) {
    for ctrlr in nvmx::group_controllers(tag) {
        nvmx::destroy_device(ctrlr).await.ok();
    }
}

fn ns_ana_state(ctrlr: &str) -> Option<AnaState> {
    NVME_CONTROLLERS
        .lookup_by_name(ctrlr)
        .and_then(|c| c.lock().namespace(1))
        .map(|ns| ns.ana_state())
}

fn ns_ana_updating(ctrlr: &str) -> bool {
    NVME_CONTROLLERS
        .lookup_by_name(ctrlr)
        .and_then(|c| c.lock().namespace(1))
        .map_or(false, |ns| ns.ana_state_updating())
}

#[test]
fn ana_inaccessible_queues_until_optimized() {
    let (e, _g) = common::engine();

    let (sub, bdev_name) = common::run_on(0, || async {
        setup("ana0", "14410").await
    });

    // Take the only path out of service; the controller learns about it
    // through the ANA-change async event and the log page read.
    sub.set_ana_state(1, AnaState::Inaccessible);
    assert!(common::wait_until(Duration::from_secs(5), || {
        ns_ana_state("ana0c0") == Some(AnaState::Inaccessible)
    }));
    assert!(common::wait_until(Duration::from_secs(5), || {
        !ns_ana_updating("ana0c0")
    }));

    // A write with no usable path parks on the retry queue. The future is
    // only spawned here: it cannot resolve until the path comes back.
    let name = bdev_name.clone();
    let (submitted_s, submitted_r) =
        futures::channel::oneshot::channel::<()>();
    let done = e.spawn_local_on(0, move || async move {
        let handle = BdevHandle::open(&name, true).unwrap();
        let mut buf = handle.dma_malloc(512).unwrap();
        buf.fill(0x77);

        let (s, r) = futures::channel::oneshot::channel();
        handle
            .writev_blocks(
                vec![buf.to_io_vec()],
                0,
                1,
                Box::new(move |io, _| {
                    s.send(io.status()).ok();
                }),
            )
            .unwrap();
        submitted_s.send(()).ok();

        let status = r.await.unwrap();
        handle.close();
        // Keep the payload alive until completion.
        drop(buf);
        status
    });

    futures::executor::block_on(submitted_r).unwrap();

    // Path comes back; the queued write is dispatched after its retry
    // deadline and completes.
    sub.set_ana_state(1, AnaState::Optimized);
    assert!(common::wait_until(Duration::from_secs(5), || {
        ns_ana_state("ana0c0") == Some(AnaState::Optimized)
    }));

    assert_eq!(futures::executor::block_on(done).unwrap(), IoStatus::Success);
    assert!(!ns_ana_updating("ana0c0"));

    common::run_on(0, || async {
        teardown("ana0").await;
    });
}

#[test]
fn retry_budget_bounds_retries() {
    let (_e, _g) = common::engine();

    Config::update(|cfg| cfg.nvme_bdev_opts.bdev_retry_count = 4);

    let (sub, bdev_name) = common::run_on(0, || async {
        setup("budget0", "14411").await
    });

    let not_ready = NvmeCommandStatus::error(NvmeStatus::Generic(
        GenericStatusCode::NamespaceNotReady,
    ));

    // Five consecutive failures against a budget of four: the first four
    // completions requeue the I/O, the fifth fails it for good.
    sub.inject_io_error(not_ready, 5);

    let name = bdev_name.clone();
    let (status, nvme) = common::run_on(0, move || async move {
        let handle = BdevHandle::open(&name, true).unwrap();
        let buf = handle.dma_malloc(512).unwrap();

        let (s, r) = futures::channel::oneshot::channel();
        handle
            .writev_blocks(
                vec![buf.to_io_vec()],
                0,
                1,
                Box::new(move |io, _| {
                    s.send((io.status(), io.nvme_status())).ok();
                }),
            )
            .unwrap();

        let out = r.await.unwrap();
        handle.close();
        out
    });

    assert_eq!(status, IoStatus::NvmeError);
    assert_eq!(
        nvme.unwrap().status,
        NvmeStatus::Generic(GenericStatusCode::NamespaceNotReady)
    );

    // An unbounded budget retries through the same five failures and
    // succeeds on the sixth attempt.
    Config::update(|cfg| cfg.nvme_bdev_opts.bdev_retry_count = -1);
    sub.inject_io_error(not_ready, 5);

    let name = bdev_name.clone();
    let status = common::run_on(0, move || async move {
        let handle = BdevHandle::open(&name, true).unwrap();
        let buf = handle.dma_malloc(512).unwrap();

        let (s, r) = futures::channel::oneshot::channel();
        handle
            .writev_blocks(
                vec![buf.to_io_vec()],
                0,
                1,
                Box::new(move |io, _| {
                    s.send(io.status()).ok();
                }),
            )
            .unwrap();

        let out = r.await.unwrap();
        handle.close();
        out
    });

    assert_eq!(status, IoStatus::Success);

    common::run_on(0, || async {
        teardown("budget0").await;
    });
}

#[test]
fn transport_queue_full_is_transparent() {
    let (_e, _g) = common::engine();

    let (sub, bdev_name) = common::run_on(0, || async {
        setup("qd0", "14412").await
    });

    // A single-slot submission queue forces the ENOMEM path for all but
    // one of the concurrent writes.
    sub.set_sq_depth(1);

    let name = bdev_name.clone();
    let statuses = common::run_on(0, move || async move {
        let handle = BdevHandle::open(&name, true).unwrap();
        let buf = handle.dma_malloc(512).unwrap();

        let mut receivers = Vec::new();
        for i in 0 .. 4_u64 {
            let (s, r) = futures::channel::oneshot::channel();
            handle
                .writev_blocks(
                    vec![buf.to_io_vec()],
                    i,
                    1,
                    Box::new(move |io, _| {
                        s.send(io.status()).ok();
                    }),
                )
                .unwrap();
            receivers.push(r);
        }

        let mut statuses = Vec::new();
        for r in receivers {
            statuses.push(r.await.unwrap());
        }
        handle.close();
        statuses
    });

    assert!(statuses.iter().all(|s| *s == IoStatus::Success));
    sub.set_sq_depth(128);

    common::run_on(0, || async {
        teardown("qd0").await;
    });
}

#[test]
fn abort_pulls_queued_io() {
    let (_e, _g) = common::engine();

    let (sub, bdev_name) = common::run_on(0, || async {
        setup("abrt0", "14413").await
    });

    sub.set_ana_state(1, AnaState::Inaccessible);
    assert!(common::wait_until(Duration::from_secs(5), || {
        ns_ana_state("abrt0c0") == Some(AnaState::Inaccessible)
    }));

    let name = bdev_name.clone();
    let (target_status, abort_status) = common::run_on(0, move || async move {
        let handle = BdevHandle::open(&name, true).unwrap();
        let buf = handle.dma_malloc(512).unwrap();

        // The write has no usable path and lands on the retry queue.
        let (s, r) = futures::channel::oneshot::channel();
        let target = handle
            .writev_blocks(
                vec![buf.to_io_vec()],
                0,
                1,
                Box::new(move |io, _| {
                    s.send(io.status()).ok();
                }),
            )
            .unwrap();

        // Abort finds it there and completes it as aborted.
        let (sa, ra) = futures::channel::oneshot::channel();
        handle.abort(
            &target,
            Box::new(move |io, _| {
                sa.send(io.status()).ok();
            }),
        );

        let out = (r.await.unwrap(), ra.await.unwrap());
        handle.close();
        out
    });

    assert_eq!(target_status, IoStatus::Aborted);
    assert_eq!(abort_status, IoStatus::Success);

    sub.set_ana_state(1, AnaState::Optimized);
    common::run_on(0, || async {
        teardown("abrt0").await;
    });
}

#[test]
fn fast_io_fail_wins_over_unbounded_retry() {
    let (_e, _g) = common::engine();

    Config::update(|cfg| {
        cfg.nvme_bdev_opts.bdev_retry_count = -1;
        cfg.nvme_bdev_opts.fast_io_fail_timeout_sec = 1;
        cfg.nvme_bdev_opts.reconnect_delay_sec = 1;
        cfg.nvme_bdev_opts.ctrlr_loss_timeout_sec = 60;
    });

    let (sub, bdev_name) = common::run_on(0, || async {
        setup("fiof0", "14414").await
    });

    // Break the path persistently: every reconnect attempt fails, so the
    // controller keeps cycling while queued I/O waits.
    sub.fail_next_connects(1_000);
    sub.fail_qpairs(true);

    let name = bdev_name.clone();
    let status = common::run_on(0, move || async move {
        let handle = BdevHandle::open(&name, true).unwrap();
        let buf = handle.dma_malloc(512).unwrap();

        let (s, r) = futures::channel::oneshot::channel();
        handle
            .writev_blocks(
                vec![buf.to_io_vec()],
                0,
                1,
                Box::new(move |io, _| {
                    s.send(io.status()).ok();
                }),
            )
            .unwrap();

        // Even with an unbounded retry budget, the fast-io-fail deadline
        // fails the queued I/O while reconnects continue.
        let out = r.await.unwrap();
        handle.close();
        out
    });

    assert_eq!(status, IoStatus::Failed);

    // Let the target come back so teardown completes cleanly.
    sub.fail_next_connects(0);
    sub.fail_qpairs(false);

    common::run_on(0, || async {
        teardown("fiof0").await;
    });
}
