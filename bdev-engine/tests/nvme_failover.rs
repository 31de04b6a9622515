//! Failover: transport id ordering, rotation across listeners, cntlid
//! uniqueness within a group, multipath join and admin routing.

use std::{sync::Arc, time::Duration};

use bdev_engine::{
    bdev::nvmx::{
        self,
        emu::{EmuSubsystem, EmuTransport},
        options,
        transport,
        utils::AnaState,
        NvmeControllerState,
        NVME_CONTROLLERS,
    },
    core::{Bdev, BdevHandle, GenericStatusCode, NvmeCommandStatus, NvmeStatus},
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

async fn attach(
    tag: &str,
    ctrlr: &str,
    t: transport::NvmeTransportId,
) -> Result<Vec<String>, bdev_engine::core::CoreError> {
    nvmx::attach_controller(
        tag,
        ctrlr,
        t,
        Arc::new(EmuTransport),
        options::Builder::new().build(),
    )
    .await
}

async fn teardown(tag: &str) {
    for ctrlr in nvmx::group_controllers(tag) {
        nvmx::destroy_device(ctrlr).await.ok();
    }
}

#[test]
fn secondary_trids_append_after_active() {
    let (_e, _g) = common::engine();

    let nqn = "nqn.2019-05.io.engine:fo0".to_string();
    let sub = EmuSubsystem::create(&nqn);
    sub.add_namespace(1, 256, 512, 1);
    sub.listen("127.0.0.1", "14420");

    common::run_on(0, move || async move {
        attach("fo0", "fo0c0", trid("14420", &nqn)).await.unwrap();
    });

    let c = NVME_CONTROLLERS.lookup_by_name("fo0c0").unwrap();
    {
        let mut ctrlr = c.lock();
        ctrlr.add_secondary_trid(trid("14421", "nqn.alt"));
        ctrlr.add_secondary_trid(trid("14422", "nqn.alt"));

        // Iteration yields the active trid strictly before the alternates.
        let trids = ctrlr.trids();
        assert_eq!(trids[0].trid.svcid(), "14420");
        assert_eq!(trids[1].trid.svcid(), "14421");
        assert_eq!(trids[2].trid.svcid(), "14422");
        assert!(!trids[0].is_failed);
    }
    drop(c);

    common::run_on(0, || async {
        teardown("fo0").await;
    });
}

#[test]
fn failover_rotates_and_reconnects() {
    let (_e, _g) = common::engine();

    Config::update(|cfg| cfg.nvme_bdev_opts.reconnect_delay_sec = 1);

    // One subsystem reachable through three listeners.
    let nqn = "nqn.2019-05.io.engine:fo1".to_string();
    let sub = EmuSubsystem::create(&nqn);
    sub.add_namespace(1, 256, 512, 1);
    sub.listen("127.0.0.1", "14430");
    sub.listen("127.0.0.1", "14431");
    sub.listen("127.0.0.1", "14432");

    let nqn2 = nqn.clone();
    common::run_on(0, move || async move {
        attach("fo1", "fo1c0", trid("14430", &nqn2)).await.unwrap();
    });

    let c = NVME_CONTROLLERS.lookup_by_name("fo1c0").unwrap();
    {
        let mut ctrlr = c.lock();
        ctrlr.add_secondary_trid(trid("14431", &nqn));
        ctrlr.add_secondary_trid(trid("14432", &nqn));
    }

    // First failover removes the active trid: t1 is gone, t2 takes over.
    // Failover starts a reset cycle, so it runs on a reactor.
    common::run_on(0, || async {
        let c = NVME_CONTROLLERS.lookup_by_name("fo1c0").unwrap();
        let mut ctrlr = c.lock();
        ctrlr.failover(true).unwrap();
    });
    assert!(common::wait_until(Duration::from_secs(5), || {
        let ctrlr = c.lock();
        ctrlr.get_state() == NvmeControllerState::Running
            && ctrlr.active_trid().trid.svcid() == "14431"
    }));
    {
        let ctrlr = c.lock();
        let trids = ctrlr.trids();
        assert_eq!(trids.len(), 2);
        assert_eq!(trids[0].trid.svcid(), "14431");
        assert!(!trids[0].is_failed);
    }

    // Second failover with an injected connect failure: the rotation lands
    // on t3, the first reconnect attempt fails, and the delayed retry
    // brings it up. t3 stays active afterwards.
    sub.fail_next_connects(1);
    common::run_on(0, || async {
        let c = NVME_CONTROLLERS.lookup_by_name("fo1c0").unwrap();
        let mut ctrlr = c.lock();
        ctrlr.failover(false).unwrap();
    });
    assert!(common::wait_until(Duration::from_secs(10), || {
        let ctrlr = c.lock();
        ctrlr.get_state() == NvmeControllerState::Running
            && ctrlr.active_trid().trid.svcid() == "14432"
            && !ctrlr.active_trid().is_failed
    }));

    drop(c);
    common::run_on(0, || async {
        teardown("fo1").await;
    });
}

#[test]
fn duplicate_cntlid_rejected_in_group() {
    let (_e, _g) = common::engine();

    let nqn = "nqn.2019-05.io.engine:fo2".to_string();
    let sub = EmuSubsystem::create(&nqn);
    sub.add_namespace(1, 256, 512, 1);
    sub.listen("127.0.0.1", "14440");
    sub.set_fixed_cntlid(7);

    let nqn2 = nqn.clone();
    common::run_on(0, move || async move {
        attach("fo2", "fo2c0", trid("14440", &nqn2)).await.unwrap();

        // Same cntlid in the same group is ambiguous and rejected; the
        // offending controller is detached again.
        let err = attach("fo2", "fo2c1", trid("14440", &nqn2)).await;
        assert!(err.is_err());
    });

    assert!(common::wait_until(Duration::from_secs(5), || {
        NVME_CONTROLLERS.lookup_by_name("fo2c1").is_none()
    }));
    assert!(NVME_CONTROLLERS.lookup_by_name("fo2c0").is_some());

    sub.set_fixed_cntlid(0);
    common::run_on(0, || async {
        teardown("fo2").await;
    });
}

#[test]
fn multipath_join_and_path_preference() {
    let (_e, _g) = common::engine();

    // Two subsystems present the same namespace (shared identity and
    // data), each through its own listener.
    let nqn_a = "nqn.2019-05.io.engine:fo3a".to_string();
    let nqn_b = "nqn.2019-05.io.engine:fo3b".to_string();
    let sub_a = EmuSubsystem::create(&nqn_a);
    let ns = sub_a.add_namespace(1, 256, 512, 1);
    sub_a.listen("127.0.0.1", "14450");

    let sub_b = EmuSubsystem::create(&nqn_b);
    sub_b.add_shared_namespace(&ns);
    sub_b.listen("127.0.0.1", "14451");

    let (created_first, created_second) = {
        let (na, nb) = (nqn_a.clone(), nqn_b.clone());
        common::run_on(0, move || async move {
            let first =
                attach("fo3", "fo3c0", trid("14450", &na)).await.unwrap();
            let second =
                attach("fo3", "fo3c1", trid("14451", &nb)).await.unwrap();
            (first, second)
        })
    };

    // The second controller's namespace joined the existing bdev instead
    // of creating a new one.
    assert_eq!(created_first.len(), 1);
    assert!(created_second.is_empty());
    let bdev_name = created_first[0].clone();

    // Knock the first path out via ANA; I/O keeps flowing over the other.
    sub_a.set_ana_state(1, AnaState::Inaccessible);
    assert!(common::wait_until(Duration::from_secs(5), || {
        NVME_CONTROLLERS
            .lookup_by_name("fo3c0")
            .and_then(|c| c.lock().namespace(1))
            .map_or(false, |ns| ns.ana_state() == AnaState::Inaccessible)
    }));

    let name = bdev_name.clone();
    common::run_on(1, move || async move {
        let handle = BdevHandle::open(&name, true).unwrap();
        let mut buf = handle.dma_malloc(512).unwrap();
        buf.fill(0x42);
        handle.write_at(0, &buf).await.unwrap();

        let mut rbuf = handle.dma_malloc(512).unwrap();
        handle.read_at(0, &mut rbuf).await.unwrap();
        assert!(rbuf.as_slice().iter().all(|b| *b == 0x42));
        handle.close();
    });

    // The first controller leaving keeps the bdev on the remaining path;
    // the last one takes it down.
    common::run_on(0, || async {
        nvmx::destroy_device("fo3c0".to_string()).await.unwrap();
    });
    assert!(Bdev::lookup_by_name(&bdev_name).is_some());

    common::run_on(0, || async {
        nvmx::destroy_device("fo3c1".to_string()).await.unwrap();
    });
    assert!(common::wait_until(Duration::from_secs(5), || {
        Bdev::lookup_by_name(&bdev_name).is_none()
    }));
}

#[test]
fn admin_commands_route_and_honor_dnr() {
    let (_e, _g) = common::engine();

    let nqn = "nqn.2019-05.io.engine:fo4".to_string();
    let sub = EmuSubsystem::create(&nqn);
    sub.add_namespace(1, 256, 512, 1);
    sub.listen("127.0.0.1", "14460");

    let nqn2 = nqn.clone();
    common::run_on(0, move || async move {
        attach("fo4", "fo4c0", trid("14460", &nqn2)).await.unwrap();

        // A clean admin round trip through the healthy controller.
        nvmx::nvme_admin_custom("fo4", 0xC0).await.unwrap();
    });

    // A do-not-retry admin failure surfaces instead of being retried.
    sub.inject_io_error(
        NvmeCommandStatus::error_dnr(NvmeStatus::Generic(
            GenericStatusCode::InternalDeviceError,
        )),
        1,
    );

    common::run_on(0, || async {
        assert!(nvmx::nvme_admin_custom("fo4", 0xC0).await.is_err());
        teardown("fo4").await;
    });
}
