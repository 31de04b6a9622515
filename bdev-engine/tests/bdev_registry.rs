//! Registry behavior: registration round trips, name and alias
//! uniqueness, claims and descriptor events.

use std::sync::{
    atomic::{AtomicBool, AtomicI32, Ordering},
    Arc,
};

use bdev_engine::{
    bdev::malloc::Malloc,
    core::{Bdev, BdevModule, DeviceEventType, ModuleOpStatus, ModuleRegistry},
};

pub mod common;

/// A module whose disk examine completes asynchronously for bdevs with a
/// matching name prefix.
struct LazyExamine;

impl BdevModule for LazyExamine {
    fn name(&self) -> &str {
        "lazy_examine"
    }

    fn examine_disk(&self, bdev: &Bdev) -> ModuleOpStatus {
        if bdev.name().starts_with("exm") {
            ModuleOpStatus::Pending
        } else {
            ModuleOpStatus::Done
        }
    }
}

static LAZY_EXAMINE: std::sync::Once = std::sync::Once::new();

#[test]
fn examine_gates_public_lookup() {
    let (_e, _g) = common::engine();

    LAZY_EXAMINE
        .call_once(|| ModuleRegistry::get().register(Arc::new(LazyExamine)));

    common::run(async {
        let bdev = Malloc::create("exm0", 64, 512, 0, 0).unwrap();

        // The module's asynchronous examine is still pending: the bdev is
        // registered but not yet openable through the public lookup.
        assert!(!bdev.is_available());
        assert!(Bdev::lookup_by_name("exm0").is_none());

        ModuleRegistry::get().examine_done(&bdev);

        assert!(bdev.is_available());
        assert!(Bdev::lookup_by_name("exm0").is_some());

        bdev.unregister(|_| {});
    });
}

#[test]
fn registration_round_trip() {
    let (_e, _g) = common::engine();

    common::run(async {
        let bdev = Malloc::create("reg0", 128, 512, 0, 0).unwrap();
        bdev.alias_add("reg0-alias").unwrap();

        assert!(Bdev::lookup_by_name("reg0").is_some());
        assert!(Bdev::lookup_by_name("reg0-alias").is_some());

        // Aliases live in the same uniqueness domain as names.
        assert!(Malloc::create("reg0-alias", 16, 512, 0, 0).is_err());
        assert!(Malloc::create("reg0", 16, 512, 0, 0).is_err());

        let done = Arc::new(AtomicI32::new(-1));
        let done2 = done.clone();
        bdev.unregister(move |status| {
            done2.store(status, Ordering::Release);
        });

        assert_eq!(done.load(Ordering::Acquire), 0);
        assert!(Bdev::lookup_by_name("reg0").is_none());
        assert!(Bdev::lookup_by_name("reg0-alias").is_none());

        // The registry is back to its pre-registration state; the same
        // name and alias register cleanly again.
        let again = Malloc::create("reg0", 128, 512, 0, 0).unwrap();
        again.alias_add("reg0-alias").unwrap();
        again.alias_del("reg0-alias").unwrap();
        assert!(Bdev::lookup_by_name("reg0-alias").is_none());
        again.unregister(|_| {});
    });
}

#[test]
fn claim_exclusivity() {
    let (_e, _g) = common::engine();

    common::run(async {
        let bdev = Malloc::create("claim0", 128, 512, 0, 0).unwrap();

        bdev.claim("module_a").unwrap();
        // A second claim fails until the first is released, whoever asks.
        assert!(bdev.claim("module_b").is_err());
        assert!(bdev.claim("module_a").is_err());
        assert_eq!(bdev.claimed_by().unwrap(), "module_a");

        // A claimed bdev refuses writers but still opens read-only.
        assert!(bdev.open(true, |_, _| {}).is_err());
        let ro = bdev.open(false, |_, _| {}).unwrap();
        ro.close();

        bdev.release_claim();
        assert!(bdev.claim("module_b").is_ok());
        bdev.release_claim();

        let rw = bdev.open(true, |_, _| {}).unwrap();
        rw.close();

        bdev.unregister(|_| {});
    });
}

#[test]
fn remove_event_and_deferred_destruct() {
    let (_e, _g) = common::engine();

    common::run(async {
        let bdev = Malloc::create("rm0", 128, 512, 0, 0).unwrap();

        let removed = Arc::new(AtomicBool::new(false));
        let seen = removed.clone();
        let desc = bdev
            .open(false, move |event, _| {
                if event == DeviceEventType::DeviceRemoved {
                    seen.store(true, Ordering::Release);
                }
            })
            .unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        bdev.unregister(move |_| {
            done2.store(true, Ordering::Release);
        });

        // The holder was asked to close; the destruct waits for it.
        assert!(removed.load(Ordering::Acquire));
        assert!(!done.load(Ordering::Acquire));
        assert!(Bdev::lookup_by_name("rm0").is_none());

        desc.close();
        assert!(done.load(Ordering::Acquire));
    });
}

#[test]
fn resize_notification() {
    let (_e, _g) = common::engine();

    common::run(async {
        let bdev = Malloc::create("rs0", 128, 512, 0, 0).unwrap();

        let resized = Arc::new(AtomicBool::new(false));
        let seen = resized.clone();
        let desc = bdev
            .open(false, move |event, _| {
                if event == DeviceEventType::DeviceResized {
                    seen.store(true, Ordering::Release);
                }
            })
            .unwrap();

        bdev.notify_blockcnt_change(256);
        assert_eq!(bdev.num_blocks(), 256);
        assert!(resized.load(Ordering::Acquire));

        desc.close();
        bdev.unregister(|_| {});
    });
}
