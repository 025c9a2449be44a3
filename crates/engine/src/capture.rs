//! Address-space capture
//!
//! Walks the region list of a quiesced process and snapshots each
//! region's attributes plus a handle to its backing object. In DELTA mode
//! a fresh shadow object is interposed on every region first: the process
//! resumes writing into the shadow while the old object, now immutable,
//! records the pre-snapshot contents. In FULL mode the same interposition
//! serves as the forked view: the dump reads the collapsed chain while
//! the process keeps running.
//!
//! Submap entries are not supported: a warning is produced and the region
//! is recorded with its pages skipped.

use crate::descriptor::{RegionInfo, VmSpaceInfo};
use crate::vm::{eflag, VmObject, VmSpace};
use cryo_core::{CheckpointMode, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// One captured region: its descriptor plus the object to dump from.
pub struct CapturedRegion {
    /// Attribute snapshot.
    pub info: RegionInfo,
    /// The frozen backing object; `None` for submap or unbacked entries.
    pub object: Option<Arc<VmObject>>,
}

impl CapturedRegion {
    /// The pages to persist for this capture: the object's own residency
    /// in DELTA mode (the dirtied-since-last-snapshot set), the collapsed
    /// chain in FULL mode.
    pub fn pages(&self, mode: CheckpointMode) -> Vec<(u64, Box<[u8]>)> {
        match &self.object {
            None => Vec::new(),
            Some(obj) => match mode {
                CheckpointMode::Delta => obj.resident_pages(),
                CheckpointMode::Full => obj.all_pages(),
            },
        }
    }
}

/// Snapshot the address space of a quiesced process.
///
/// Returns the scalar info plus one [`CapturedRegion`] per region, in
/// region-list order. The caller streams the captured objects out and
/// then calls [`release_captured`] to let the shadow chains collapse.
pub fn capture_vmspace(
    vm: &mut VmSpace,
    mode: CheckpointMode,
) -> Result<(VmSpaceInfo, Vec<CapturedRegion>)> {
    let info = VmSpaceInfo {
        swap_size: vm.swap_size,
        text_size: vm.text_size,
        data_size: vm.data_size,
        stack_size: vm.stack_size,
        text_addr: vm.text_addr,
        data_addr: vm.data_addr,
        max_stack_addr: vm.max_stack_addr,
    };

    let mut captured = Vec::with_capacity(vm.regions.len());
    for region in vm.regions.iter_mut() {
        if region.eflags & eflag::SUBMAP != 0 {
            warn!(
                target: "ckpt::orch",
                start = format_args!("{:#x}", region.start),
                "submap entry found, its pages will be skipped"
            );
            captured.push(CapturedRegion {
                info: RegionInfo {
                    start: region.start,
                    end: region.end,
                    offset: region.offset,
                    protection: region.protection,
                    max_protection: region.max_protection,
                    eflags: region.eflags,
                    object_size: 0,
                    resident: 0,
                    path: region.path.clone(),
                },
                object: None,
            });
            continue;
        }

        let old = region.object.clone();
        let (object_size, resident) = match (&old, mode) {
            (None, _) => (u64::MAX, 0),
            (Some(obj), CheckpointMode::Delta) => (obj.size(), obj.resident_count()),
            (Some(obj), CheckpointMode::Full) => (obj.size(), obj.all_pages().len()),
        };

        // Interpose the shadow; faults now resolve through it, so the old
        // object stops changing. The pmap flush of the original host is
        // implicit here: reads and writes always re-resolve the chain.
        if let Some(obj) = &old {
            region.object = Some(VmObject::shadow(obj));
        }

        captured.push(CapturedRegion {
            info: RegionInfo {
                start: region.start,
                end: region.end,
                offset: region.offset,
                protection: region.protection,
                max_protection: region.max_protection,
                eflags: region.eflags,
                object_size,
                resident: resident as u32,
                path: region.path.clone(),
            },
            object: old,
        });
    }

    debug!(
        target: "ckpt::orch",
        regions = captured.len(),
        ?mode,
        "address space captured"
    );
    Ok((info, captured))
}

/// Release the dumped objects and collapse each region's shadow chain,
/// keeping exactly-once accounting: the next delta dumps only pages
/// dirtied after this snapshot.
pub fn release_captured(vm: &VmSpace, captured: Vec<CapturedRegion>) {
    drop(captured);
    for region in &vm.regions {
        if let Some(obj) = &region.object {
            obj.flatten_below();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::prot;
    use cryo_core::PAGE_SIZE;

    fn space_with_pages() -> VmSpace {
        let mut vm = VmSpace::new();
        vm.map(0x10000, 16 * PAGE_SIZE as u64, prot::RW).unwrap();
        for i in 0..4u64 {
            vm.write(0x10000 + i * PAGE_SIZE as u64, &[i as u8 + 1; 8])
                .unwrap();
        }
        vm
    }

    #[test]
    fn test_full_capture_counts_all_pages() {
        let mut vm = space_with_pages();
        let (_, captured) = capture_vmspace(&mut vm, CheckpointMode::Full).unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].info.resident, 4);
        assert_eq!(captured[0].pages(CheckpointMode::Full).len(), 4);
    }

    #[test]
    fn test_delta_capture_is_dirty_set_only() {
        let mut vm = space_with_pages();

        // First snapshot freezes everything written so far.
        let (_, first) = capture_vmspace(&mut vm, CheckpointMode::Delta).unwrap();
        assert_eq!(first[0].info.resident, 4);
        release_captured(&vm, first);

        // Dirty one old page and one new page.
        vm.write(0x10000 + 2 * PAGE_SIZE as u64, &[0x55; 8]).unwrap();
        vm.write(0x10000 + 9 * PAGE_SIZE as u64, &[0x66; 8]).unwrap();

        let (_, second) = capture_vmspace(&mut vm, CheckpointMode::Delta).unwrap();
        let pages = second[0].pages(CheckpointMode::Delta);
        let idx: Vec<u64> = pages.iter().map(|(i, _)| *i).collect();
        assert_eq!(idx, vec![2, 9]);
        release_captured(&vm, second);
    }

    #[test]
    fn test_captured_object_immune_to_later_writes() {
        let mut vm = space_with_pages();
        let (_, captured) = capture_vmspace(&mut vm, CheckpointMode::Full).unwrap();

        // The process keeps mutating after capture.
        vm.write(0x10000, &[0xff; 8]).unwrap();

        let pages = captured[0].pages(CheckpointMode::Full);
        let page0 = &pages.iter().find(|(i, _)| *i == 0).unwrap().1;
        assert_eq!(&page0[..8], &[1u8; 8]);
    }

    #[test]
    fn test_submap_skipped_with_zero_pages() {
        let mut vm = space_with_pages();
        vm.regions[0].eflags |= eflag::SUBMAP;
        let (_, captured) = capture_vmspace(&mut vm, CheckpointMode::Full).unwrap();
        assert_eq!(captured[0].info.resident, 0);
        assert!(captured[0].object.is_none());
        assert!(captured[0].pages(CheckpointMode::Full).is_empty());
    }

    #[test]
    fn test_release_bounds_chain_depth() {
        let mut vm = space_with_pages();
        for round in 0..5u64 {
            let (_, captured) = capture_vmspace(&mut vm, CheckpointMode::Delta).unwrap();
            release_captured(&vm, captured);
            vm.write(0x10000 + round * PAGE_SIZE as u64, &[round as u8; 4])
                .unwrap();
        }
        let obj = vm.regions[0].object.as_ref().unwrap();
        assert!(obj.chain_depth() <= 2);
    }
}
