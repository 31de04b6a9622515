//! Controller reset: channel teardown and rebuild across cores, pending
//! reset coalescing, qpair loss escalation and removal handling.

use std::{sync::Arc, time::Duration};

use bdev_engine::{
    bdev::nvmx::{
        self,
        emu::{EmuSubsystem, EmuTransport},
        options,
        transport,
        NvmeControllerState,
        NVME_CONTROLLERS,
    },
    core::{Bdev, BdevHandle, IoStatus},
    subsys::Config,
};

pub mod common;

fn trid(traddr: &str, svcid: &str, nqn: &str) -> transport::NvmeTransportId {
    transport::Builder::new()
        .with_traddr(traddr)
        .with_svcid(svcid)
        .with_subnqn(nqn)
        .build()
}

/// Creates one subsystem with one namespace, attaches a controller and
/// returns (subsystem, bdev name).
async fn setup(tag: &str, port: &str) -> (Arc<EmuSubsystem>, String) {
    let nqn = format!("nqn.2019-05.io.engine:{}", tag);
    let sub = EmuSubsystem::create(&nqn);
    sub.add_namespace(1, 1024, 512, 1);
    sub.listen("127.0.0.1", port);

    let group = tag.to_string();
    let bdevs = nvmx::attach_controller(
        &group,
        &format!("{}c0", tag),
        trid("127.0.0.1", port, &nqn),
        Arc::new(EmuTransport),
        options::Builder::new().build(),
    )
    .await
    .unwrap();

    assert_eq!(bdevs.len(), 1);
    (sub, bdevs[0].clone())
}

async fn teardown(tag: &str) {
    for ctrlr in nvmx::group_controllers(tag) {
        nvmx::destroy_device(ctrlr).await.ok();
    }
}

fn ctrlr_state(name: &str) -> Option<NvmeControllerState> {
    NVME_CONTROLLERS
        .lookup_by_name(name)
        .map(|c| c.lock().get_state())
}

#[test]
fn reset_across_threads() {
    let (e, _g) = common::engine();

    let (sub, bdev_name) = common::run_on(0, || async {
        setup("rst0", "14400").await
    });

    // Hold a channel open on the primary core for the duration of the
    // test, so the reset has qpairs to tear down on both cores.
    let (ready_s, ready_r) = futures::channel::oneshot::channel::<()>();
    let (release_s, release_r) = futures::channel::oneshot::channel::<()>();
    let name = bdev_name.clone();
    let held = e.spawn_local_on(0, move || async move {
        let handle = BdevHandle::open(&name, true).unwrap();
        let mut buf = handle.dma_malloc(512).unwrap();
        buf.fill(0x5A);
        handle.write_at(0, &buf).await.unwrap();
        ready_s.send(()).ok();
        release_r.await.ok();
        handle.close();
    });
    futures::executor::block_on(ready_r).unwrap();

    // A reset requested from the second core walks the channels on both
    // cores, reconnects and completes with success.
    let name = bdev_name.clone();
    common::run_on(1, move || async move {
        let handle = BdevHandle::open(&name, true).unwrap();
        handle.reset_async().await.unwrap();

        // The same channel carries I/O again right after.
        let mut buf = handle.dma_malloc(512).unwrap();
        handle.read_at(0, &mut buf).await.unwrap();
        assert!(buf.as_slice().iter().all(|b| *b == 0x5A));
        handle.close();
    });

    release_s.send(()).ok();
    futures::executor::block_on(held).unwrap();

    assert_eq!(sub.reset_count(), 1);
    assert_eq!(
        ctrlr_state("rst0c0"),
        Some(NvmeControllerState::Running)
    );

    // The active trid survived the reset unfailed.
    let c = NVME_CONTROLLERS.lookup_by_name("rst0c0").unwrap();
    assert!(!c.lock().active_trid().is_failed);
    drop(c);

    common::run_on(0, || async {
        teardown("rst0").await;
    });
    assert!(Bdev::lookup_by_name(&bdev_name).is_none());
}

#[test]
fn pending_reset_coalesces() {
    let (_e, _g) = common::engine();

    let (sub, bdev_name) = common::run_on(0, || async {
        setup("rst1", "14401").await
    });

    let name = bdev_name.clone();
    let (st1, st2) = common::run_on(0, move || async move {
        let handle = BdevHandle::open(&name, true).unwrap();

        // Submit two resets back to back, without yielding in between: the
        // second arrives while the first is in flight and is queued as a
        // pending reset on this channel.
        let (s1, r1) = futures::channel::oneshot::channel();
        handle.reset(Box::new(move |io, _| {
            s1.send(io.status()).ok();
        }));

        let (s2, r2) = futures::channel::oneshot::channel();
        handle.reset(Box::new(move |io, _| {
            s2.send(io.status()).ok();
        }));

        let st1 = r1.await.unwrap();
        let st2 = r2.await.unwrap();
        handle.close();
        (st1, st2)
    });

    // Both complete with the status of the one reset that actually ran.
    assert_eq!(st1, IoStatus::Success);
    assert_eq!(st2, IoStatus::Success);
    assert_eq!(sub.reset_count(), 1);

    common::run_on(0, || async {
        teardown("rst1").await;
    });
    assert!(Bdev::lookup_by_name(&bdev_name).is_none());
}

#[test]
fn qpair_loss_escalates_to_reset() {
    let (e, _g) = common::engine();

    let (sub, bdev_name) = common::run_on(0, || async {
        let (sub, name) = setup("rst2", "14402").await;
        let handle = BdevHandle::open(&name, true).unwrap();
        let buf = handle.dma_malloc(512).unwrap();
        handle.write_at(0, &buf).await.unwrap();
        handle.close();
        (sub, name)
    });

    // Keep a channel alive so a poller is watching the qpair while the
    // transport loss is injected.
    let (ready_s, ready_r) = futures::channel::oneshot::channel::<()>();
    let (release_s, release_r) = futures::channel::oneshot::channel::<()>();
    let name = bdev_name.clone();
    let held = e.spawn_local_on(0, move || async move {
        let handle = BdevHandle::open(&name, true).unwrap();
        ready_s.send(()).ok();
        release_r.await.ok();
        handle.close();
    });
    futures::executor::block_on(ready_r).unwrap();

    // Simulated transport loss: the channel poller notices the failed
    // qpair and escalates to a controller reset.
    sub.fail_qpairs(true);
    assert!(common::wait_until(Duration::from_secs(5), || {
        sub.reset_count() >= 1
    }));
    sub.fail_qpairs(false);

    assert!(common::wait_until(Duration::from_secs(5), || {
        ctrlr_state("rst2c0") == Some(NvmeControllerState::Running)
    }));

    // I/O flows again once the reset cycle settled.
    let name = bdev_name.clone();
    common::run_on(1, move || async move {
        let handle = BdevHandle::open(&name, true).unwrap();
        let mut buf = handle.dma_malloc(512).unwrap();
        handle.read_at(0, &mut buf).await.unwrap();
        handle.close();
    });

    release_s.send(()).ok();
    futures::executor::block_on(held).unwrap();

    common::run_on(0, || async {
        teardown("rst2").await;
    });
    assert!(Bdev::lookup_by_name(&bdev_name).is_none());
}

#[test]
fn removal_with_zero_loss_timeout_destructs() {
    let (e, _g) = common::engine();

    Config::update(|cfg| cfg.nvme_bdev_opts.ctrlr_loss_timeout_sec = 0);

    let (sub, bdev_name) = common::run_on(0, || async {
        setup("rst3", "14403").await
    });

    // A live channel, so the loss is actually observed by a poller.
    let (ready_s, ready_r) = futures::channel::oneshot::channel::<()>();
    let (release_s, release_r) = futures::channel::oneshot::channel::<()>();
    let name = bdev_name.clone();
    let held = e.spawn_local_on(0, move || async move {
        let handle = BdevHandle::open(&name, true).unwrap();
        ready_s.send(()).ok();
        release_r.await.ok();
        handle.close();
    });
    futures::executor::block_on(ready_r).unwrap();

    // The subsystem disappears; the reset cycle fails with "removed" and
    // the zero loss budget deletes the controller immediately.
    sub.remove();
    sub.fail_qpairs(true);

    assert!(common::wait_until(Duration::from_secs(10), || {
        NVME_CONTROLLERS.lookup_by_name("rst3c0").is_none()
    }));
    // The bdev is flagged removed right away; final destruct waits for the
    // descriptor holder.
    assert!(common::wait_until(Duration::from_secs(10), || {
        Bdev::lookup_by_name(&bdev_name).is_none()
    }));

    release_s.send(()).ok();
    futures::executor::block_on(held).unwrap();
}

#[test]
fn namespace_resize_propagates() {
    let (_e, _g) = common::engine();

    let (sub, bdev_name) = common::run_on(0, || async {
        setup("rst4", "14404").await
    });

    let bdev = Bdev::lookup_by_name(&bdev_name).unwrap();
    assert_eq!(bdev.num_blocks(), 1024);

    // Growing the namespace raises an attribute-changed event; the bdev
    // follows once the admin poller delivers it.
    sub.resize_namespace(1, 2048);
    assert!(common::wait_until(Duration::from_secs(5), || {
        bdev.num_blocks() == 2048
    }));

    drop(bdev);
    common::run_on(0, || async {
        teardown("rst4").await;
    });
    assert!(Bdev::lookup_by_name(&bdev_name).is_none());
}
