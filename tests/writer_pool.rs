//! Writer-pool ordering guarantees at the integration surface.

mod common;

use common::init_logging;
use cryo::{PageIndex, PmPageSink, PmRegion, PoolConfig, WriterPool, PAGE_SIZE};
use cryo_backend::{striped_cursors, PageUnit, PAGE_UNIT_SIZE};
use std::sync::Arc;

fn unit(i: u64) -> PageUnit {
    let mut page = vec![0u8; PAGE_SIZE];
    page[..8].copy_from_slice(&i.to_le_bytes());
    PageUnit {
        vaddr: 0x40_0000 + i * PAGE_SIZE as u64,
        page: page.into_boxed_slice(),
        ino: 0,
    }
}

fn read_units(region: &PmRegion, mut cursor: u64, limit: u64) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    while cursor + PAGE_UNIT_SIZE <= limit {
        let mut tag = [0u8; 8];
        region.read_at(cursor, &mut tag).unwrap();
        let vaddr = u64::from_le_bytes(tag);
        if vaddr == 0 {
            break;
        }
        let mut payload = [0u8; 8];
        region.read_at(cursor + 8, &mut payload).unwrap();
        out.push((vaddr, u64::from_le_bytes(payload)));
        cursor += PAGE_UNIT_SIZE;
    }
    out
}

/// 1,000 pages enqueued to a single worker come back in enqueue order.
#[test]
fn single_worker_preserves_enqueue_order() {
    init_logging();
    let n = 1000u64;
    let region = Arc::new(PmRegion::new((n + 1) * PAGE_UNIT_SIZE));
    let sink = Arc::new(PmPageSink {
        region: Arc::clone(&region),
    });
    let pool = WriterPool::start(&PoolConfig::new().with_workers(1), sink, vec![0]);

    for i in 0..n {
        pool.enqueue(0, unit(i)).unwrap();
    }
    pool.drain();

    let units = read_units(&region, 0, region.capacity());
    assert_eq!(units.len(), n as usize);
    for (i, (vaddr, payload)) in units.iter().enumerate() {
        assert_eq!(*payload, i as u64, "unit {} out of order", i);
        assert_eq!(*vaddr, 0x40_0000 + i as u64 * PAGE_SIZE as u64);
    }
}

/// With 8 workers and round-robin producers, positional order is gone
/// but vaddr keying reconstructs the exact page set.
#[test]
fn eight_workers_reconstruct_by_vaddr() {
    init_logging();
    let n = 1000u64;
    let workers = 8usize;
    let stripe = (n / workers as u64 + 2) * PAGE_UNIT_SIZE;
    let region = Arc::new(PmRegion::new(stripe * workers as u64));
    let sink = Arc::new(PmPageSink {
        region: Arc::clone(&region),
    });
    let cursors = striped_cursors(0, region.capacity(), workers);
    let pool = WriterPool::start(&PoolConfig::new().with_workers(workers), sink, cursors.clone());

    for i in 0..n {
        pool.enqueue(i as usize % workers, unit(i)).unwrap();
    }
    pool.drain();
    assert_eq!(pool.pages_written(), n);

    let mut index = PageIndex::new();
    for (w, &start) in cursors.iter().enumerate() {
        let limit = if w + 1 < workers {
            cursors[w + 1]
        } else {
            region.capacity()
        };
        let mut cursor = start;
        while cursor + PAGE_UNIT_SIZE <= limit {
            let mut tag = [0u8; 8];
            region.read_at(cursor, &mut tag).unwrap();
            let vaddr = u64::from_le_bytes(tag);
            if vaddr == 0 {
                break;
            }
            let mut page = vec![0u8; PAGE_SIZE].into_boxed_slice();
            region.read_at(cursor + 8, &mut page).unwrap();
            index.insert_if_absent(vaddr, page);
            cursor += PAGE_UNIT_SIZE;
        }
    }

    assert_eq!(index.len(), n as usize);
    for i in 0..n {
        let vaddr = 0x40_0000 + i * PAGE_SIZE as u64;
        let page = index.get(vaddr).unwrap();
        assert_eq!(u64::from_le_bytes(page[..8].try_into().unwrap()), i);
    }
}
