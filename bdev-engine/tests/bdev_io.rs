//! Generic I/O path: data integrity, boundary splitting, bounce buffering
//! and compare-and-write emulation on the malloc backend.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use bdev_engine::core::{
    engine_sleep,
    Bdev,
    BdevHandle,
    BdevIo,
    BdevOps,
    CoreError,
    DmaBuf,
    IoStatus,
    IoType,
    IoVec,
    MediaErrorStatusCode,
    NvmeStatus,
};

pub mod common;

fn cleanup(name: &str) {
    if let Some(b) = Bdev::lookup_by_name(name) {
        b.unregister(|_| {});
    }
}

#[test]
fn write_read_round_trip() {
    let (_e, _g) = common::engine();

    common::run_on(0, || async {
        bdev_engine::bdev::malloc::Malloc::create("io0", 256, 512, 0, 0)
            .unwrap();

        let handle = BdevHandle::open("io0", true).unwrap();

        let mut wbuf = handle.dma_malloc(4096).unwrap();
        for (i, b) in wbuf.as_mut_slice().iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        handle.write_at(8 * 512, &wbuf).await.unwrap();

        let mut rbuf = handle.dma_malloc(4096).unwrap();
        handle.read_at(8 * 512, &mut rbuf).await.unwrap();

        assert_eq!(wbuf.as_slice(), rbuf.as_slice());

        handle.close();
        cleanup("io0");
    });
}

#[test]
fn boundary_split() {
    let (_e, _g) = common::engine();

    common::run_on(0, || async {
        // An 8-block optimal boundary with splitting enabled: a 24-block
        // write crossing three boundaries is split by the generic layer.
        bdev_engine::bdev::malloc::Malloc::create("split0", 256, 512, 0, 8)
            .unwrap();
        let bdev = Bdev::lookup_by_name("split0").unwrap();
        assert!(bdev.split_on_optimal_io_boundary());

        let handle = BdevHandle::open("split0", true).unwrap();

        let mut wbuf = handle.dma_malloc(24 * 512).unwrap();
        for (i, b) in wbuf.as_mut_slice().iter_mut().enumerate() {
            *b = (i % 13) as u8 + 1;
        }

        // Offset 4 makes both the head and tail chunks partial.
        handle.write_at(4 * 512, &wbuf).await.unwrap();

        let mut rbuf = handle.dma_malloc(24 * 512).unwrap();
        handle.read_at(4 * 512, &mut rbuf).await.unwrap();
        assert_eq!(wbuf.as_slice(), rbuf.as_slice());

        handle.close();
        cleanup("split0");
    });
}

#[test]
fn misaligned_payload_bounces() {
    let (_e, _g) = common::engine();

    common::run_on(0, || async {
        // The disk requires 4 KiB alignment (2^12); payloads at 512-byte
        // alignment must go through a bounce buffer both ways.
        bdev_engine::bdev::malloc::Malloc::create("bounce0", 64, 512, 12, 0)
            .unwrap();

        let handle = BdevHandle::open("bounce0", true).unwrap();

        // Carve a deliberately misaligned 2-block vector out of a larger
        // buffer: 512 bytes into a 4 KiB-aligned allocation.
        let mut backing = DmaBuf::new(8192, 4096).unwrap();
        for (i, b) in backing.as_mut_slice().iter_mut().enumerate() {
            *b = (i % 7) as u8 + 3;
        }
        let misaligned = IoVec::new(
            (backing.as_ptr() as u64 + 512) as *mut u8,
            1024,
        );

        let (s, r) = futures::channel::oneshot::channel();
        handle
            .writev_blocks(
                vec![misaligned],
                0,
                2,
                Box::new(move |io, _| {
                    s.send(io.status()).ok();
                }),
            )
            .unwrap();
        assert_eq!(r.await.unwrap(), IoStatus::Success);

        // Read back into another misaligned vector; the copy-back must
        // land the data in the caller's buffer.
        let readback = DmaBuf::new(8192, 4096).unwrap();
        let dst = IoVec::new(
            (readback.as_ptr() as u64 + 512) as *mut u8,
            1024,
        );

        let (s, r) = futures::channel::oneshot::channel();
        handle.readv_blocks(
            vec![dst],
            0,
            2,
            Box::new(move |io, _| {
                s.send(io.status()).ok();
            }),
        );
        assert_eq!(r.await.unwrap(), IoStatus::Success);

        unsafe {
            assert_eq!(misaligned.as_slice(), dst.as_slice());
        }

        handle.close();
        cleanup("bounce0");
    });
}

/// Backend that runs out of memory for the first few writes; reads always
/// succeed.
struct FlakyBackend {
    nomem_left: AtomicU32,
}

impl BdevOps for FlakyBackend {
    fn submit_request(&self, io: BdevIo) {
        match io.io_type() {
            IoType::Write => {
                if self.nomem_left.load(Ordering::Acquire) > 0 {
                    self.nomem_left.fetch_sub(1, Ordering::AcqRel);
                    io.complete(IoStatus::NoMemory);
                } else {
                    io.complete(IoStatus::Success);
                }
            }
            IoType::Read => io.complete(IoStatus::Success),
            _ => io.complete(IoStatus::Failed),
        }
    }

    fn io_type_supported(&self, io_type: IoType) -> bool {
        matches!(io_type, IoType::Read | IoType::Write)
    }

    fn open_channel(&self) -> Result<Box<dyn std::any::Any>, CoreError> {
        Ok(Box::new(()))
    }
}

#[test]
fn no_memory_completion_queues_and_retries() {
    let (_e, _g) = common::engine();

    common::run_on(0, || async {
        let bdev = Bdev::builder()
            .with_name("nomem0")
            .with_product_name("Flaky disk")
            .with_module("flaky")
            .with_block_length(512)
            .with_num_blocks(64)
            .with_ops(Arc::new(FlakyBackend {
                nomem_left: AtomicU32::new(1),
            }))
            .build();
        bdev.register().unwrap();

        let handle = BdevHandle::open("nomem0", true).unwrap();
        let buf = handle.dma_malloc(512).unwrap();

        let (s, mut r) = futures::channel::oneshot::channel();
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

        // The backend reported NoMemory: the write parks on the channel's
        // no-memory queue instead of completing towards the caller.
        engine_sleep(std::time::Duration::from_millis(20)).await.ok();
        assert_eq!(r.try_recv().unwrap(), None);

        // Any completion on the same channel kicks the queued request; the
        // backend has room again and the write goes through.
        let (s2, r2) = futures::channel::oneshot::channel();
        handle.readv_blocks(
            vec![buf.to_io_vec()],
            0,
            1,
            Box::new(move |io, _| {
                s2.send(io.status()).ok();
            }),
        );
        assert_eq!(r2.await.unwrap(), IoStatus::Success);
        assert_eq!(r.await.unwrap(), IoStatus::Success);

        handle.close();
        cleanup("nomem0");
    });
}

#[test]
fn compare_and_write() {
    let (_e, _g) = common::engine();

    common::run_on(0, || async {
        bdev_engine::bdev::malloc::Malloc::create("caw0", 64, 512, 0, 0)
            .unwrap();

        let handle = BdevHandle::open("caw0", true).unwrap();

        // Fresh malloc disks read as zeroes, so comparing against zeroes
        // matches and the fused write goes through.
        let zeroes = handle.dma_malloc(512).unwrap();
        let (s, r) = futures::channel::oneshot::channel();
        handle
            .compare_and_write_blocks(
                vec![zeroes.to_io_vec()],
                0,
                1,
                Box::new(move |io, _| {
                    s.send(io.status()).ok();
                }),
            )
            .unwrap();
        assert_eq!(r.await.unwrap(), IoStatus::Success);

        // Now the on-disk data is zeroes again (we wrote zeroes); compare
        // against a non-matching pattern must fail with a miscompare.
        let mut ones = handle.dma_malloc(512).unwrap();
        ones.fill(0xA5);
        handle.write_at(0, &ones).await.unwrap();

        let zeroes = handle.dma_malloc(512).unwrap();
        let (s, r) = futures::channel::oneshot::channel();
        handle
            .compare_and_write_blocks(
                vec![zeroes.to_io_vec()],
                0,
                1,
                Box::new(move |io, _| {
                    s.send(io.status()).ok();
                }),
            )
            .unwrap();
        assert_eq!(r.await.unwrap(), IoStatus::Miscompare);

        handle.close();
        cleanup("caw0");
    });
}

#[test]
fn compare_detail_carries_nvme_status() {
    let (_e, _g) = common::engine();

    common::run_on(0, || async {
        bdev_engine::bdev::malloc::Malloc::create("cmp0", 64, 512, 0, 0)
            .unwrap();

        let handle = BdevHandle::open("cmp0", true).unwrap();

        let mut patt = handle.dma_malloc(512).unwrap();
        patt.fill(0x11);

        let (s, r) = futures::channel::oneshot::channel();
        handle.comparev_blocks(
            vec![patt.to_io_vec()],
            0,
            1,
            Box::new(move |io, _| {
                s.send((io.status(), io.nvme_status())).ok();
            }),
        );

        let (status, nvme) = r.await.unwrap();
        assert_eq!(status, IoStatus::NvmeError);
        assert_eq!(
            nvme.unwrap().status,
            NvmeStatus::MediaError(MediaErrorStatusCode::CompareFailure)
        );

        handle.close();
        cleanup("cmp0");
    });
}
