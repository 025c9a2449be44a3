//! Address-space restore
//!
//! Rebuilds a host process's address space from a snapshot: tear down the
//! existing mapping, restore the scalars, then re-create each region with
//! a fresh backing object populated from the composed page index and
//! mapped with the recorded protections and offsets.
//!
//! Any failure aborts the restore; the host is left undefined and the
//! orchestrator kills it.

use crate::descriptor::{RegionInfo, VmSpaceInfo};
use crate::vm::{eflag, VmObject, VmRegion, VmSpace};
use cryo_backend::PageIndex;
use cryo_core::{Error, Result, PAGE_SIZE};
use tracing::debug;

/// Rebuild `vm` from the snapshot.
pub fn restore_vmspace(
    vm: &mut VmSpace,
    info: &VmSpaceInfo,
    regions: &[RegionInfo],
    pages: &PageIndex,
) -> Result<()> {
    // Tear down the current space wholesale: mappings, pmap state, SysV
    // attachments, wire-future flags.
    vm.teardown();

    vm.swap_size = info.swap_size;
    vm.text_size = info.text_size;
    vm.data_size = info.data_size;
    vm.stack_size = info.stack_size;
    vm.text_addr = info.text_addr;
    vm.data_addr = info.data_addr;
    vm.max_stack_addr = info.max_stack_addr;

    for rinfo in regions {
        if rinfo.eflags & eflag::SUBMAP != 0 {
            // Recorded but never populated; skip the mapping entirely.
            continue;
        }

        let object_size = if rinfo.object_size == u64::MAX {
            rinfo.end - rinfo.start
        } else {
            rinfo.object_size
        };
        let object = VmObject::new(object_size);

        let region = VmRegion {
            start: rinfo.start,
            end: rinfo.end,
            offset: rinfo.offset,
            protection: rinfo.protection,
            max_protection: rinfo.max_protection,
            eflags: rinfo.eflags | eflag::COW | eflag::PREFAULT,
            object: Some(object.clone()),
            path: rinfo.path.clone(),
        };

        for vaddr in pages.addrs_in_range(rinfo.start, rinfo.end) {
            let page = pages
                .get(vaddr)
                .ok_or_else(|| Error::RestoreFailed(format!("page {:#x} vanished", vaddr)))?;
            if page.len() != PAGE_SIZE {
                return Err(Error::RestoreFailed(format!(
                    "page {:#x} has {} bytes",
                    vaddr,
                    page.len()
                )));
            }
            // Copy in and activate: populated pages are mapped up front
            // rather than faulted, per the prefault flag above.
            object.write_page(region.pindex(vaddr), 0, page);
        }

        vm.insert_region(region)
            .map_err(|e| Error::RestoreFailed(e.to_string()))?;
    }

    debug!(
        target: "ckpt::orch",
        regions = vm.regions.len(),
        pages = pages.len(),
        "address space restored"
    );
    Ok(())
}
