//! Partition library: offset translation, reset passthrough, shared-base
//! life cycle and hot remove fan-out.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use bdev_engine::{
    bdev::{
        malloc::Malloc,
        part::{Part, PartBase},
    },
    core::{Bdev, BdevHandle, DeviceEventType},
};

pub mod common;

#[test]
fn offset_translation() {
    let (_e, _g) = common::engine();

    common::run_on(0, || async {
        Malloc::create("base0", 64, 512, 0, 0).unwrap();

        let base = PartBase::construct("base0").unwrap();
        Part::construct(base.clone(), "base0p1", 16, 16, "Partition").unwrap();
        drop(base);

        let part = BdevHandle::open("base0p1", true).unwrap();

        let mut wbuf = part.dma_malloc(512).unwrap();
        wbuf.fill(0xEE);
        // Offset 4 on the partition lands at block 20 of the base.
        part.write_at(4 * 512, &wbuf).await.unwrap();
        part.close();

        let base_handle = BdevHandle::open("base0", false).unwrap();
        let mut rbuf = base_handle.dma_malloc(512).unwrap();
        base_handle.read_at(20 * 512, &mut rbuf).await.unwrap();
        assert!(rbuf.as_slice().iter().all(|b| *b == 0xEE));
        base_handle.close();

        // Reset flows to the base untranslated and succeeds there.
        let part = BdevHandle::open("base0p1", false).unwrap();
        part.reset_async().await.unwrap();
        part.close();

        if let Some(p) = Bdev::lookup_by_name("base0p1") {
            p.unregister(|_| {});
        }
        if let Some(b) = Bdev::lookup_by_name("base0") {
            b.unregister(|_| {});
        }
    });
}

#[test]
fn out_of_range_partition_rejected() {
    let (_e, _g) = common::engine();

    common::run_on(0, || async {
        Malloc::create("base1", 64, 512, 0, 0).unwrap();

        let base = PartBase::construct("base1").unwrap();
        assert!(
            Part::construct(base.clone(), "base1p1", 60, 16, "Partition")
                .is_err()
        );

        // The failed construct left no partition behind.
        assert!(Bdev::lookup_by_name("base1p1").is_none());
        drop(base);

        Bdev::lookup_by_name("base1").unwrap().unregister(|_| {});
    });
}

#[test]
fn base_hot_remove_fans_out() {
    let (_e, _g) = common::engine();

    let removals: usize = common::run_on(0, || async {
        Malloc::create("base2", 64, 512, 0, 0).unwrap();

        let base = PartBase::construct("base2").unwrap();
        Part::construct(base.clone(), "base2p1", 0, 16, "Partition").unwrap();
        Part::construct(base.clone(), "base2p2", 16, 16, "Partition").unwrap();
        drop(base);

        // The first partition claims the base for the partition module.
        let base_bdev = Bdev::lookup_by_name("base2").unwrap();
        assert!(base_bdev.is_claimed());

        // Hold a descriptor on each partition: the holders must see the
        // remove events and their closes gate the final destructs.
        let removals = Arc::new(AtomicUsize::new(0));
        let mut descriptors = Vec::new();
        for name in ["base2p1", "base2p2"] {
            let counter = removals.clone();
            descriptors.push(
                Bdev::lookup_by_name(name)
                    .unwrap()
                    .open(false, move |event, _| {
                        if event == DeviceEventType::DeviceRemoved {
                            counter.fetch_add(1, Ordering::AcqRel);
                        }
                    })
                    .unwrap(),
            );
        }

        base_bdev.unregister(|_| {});

        // The fan-out runs as messages on the primary reactor; yield until
        // both partition holders saw their remove event.
        for _ in 0 .. 100 {
            if removals.load(Ordering::Acquire) == 2 {
                break;
            }
            bdev_engine::core::engine_sleep(
                std::time::Duration::from_millis(10),
            )
            .await
            .ok();
        }
        assert_eq!(removals.load(Ordering::Acquire), 2);

        // Closing the holders lets the partitions destruct, which drops
        // the last base references and frees the base.
        descriptors.clear();
        bdev_engine::core::engine_sleep(std::time::Duration::from_millis(50))
            .await
            .ok();

        assert!(Bdev::lookup_by_name("base2p1").is_none());
        assert!(Bdev::lookup_by_name("base2p2").is_none());
        assert!(Bdev::lookup_by_name("base2").is_none());

        removals.load(Ordering::Acquire)
    });

    assert_eq!(removals, 2);

    // The claim was released exactly once: a new disk under the same name
    // registers and is claimable again.
    common::run_on(0, || async {
        Malloc::create("base2", 64, 512, 0, 0).unwrap();
        let bdev = Bdev::lookup_by_name("base2").unwrap();
        bdev.claim("verify").unwrap();
        bdev.release_claim();
        bdev.unregister(|_| {});
    });
}
