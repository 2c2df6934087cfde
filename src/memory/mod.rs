pub mod frames;
pub mod heap;
pub mod paging;

use alloc::sync::Arc;
use spin::Mutex;

use crate::errno::Result;
use frames::{FrameState, PAGE_SIZE};
use heap::KernelHeap;
use paging::{AddressSpace, PageDirectory, KERNEL_HEAP_END, KERNEL_HEAP_INIT};

/// The virtual-memory subsystem context: frame allocator, kernel address
/// space, and kernel heap. Process directories are spawned from here.
pub struct MemoryManager {
    frames: Arc<FrameState>,
    kernel_space: AddressSpace,
    heap: Mutex<KernelHeap>,
}

impl MemoryManager {
    pub fn new(memory_kib: usize) -> Self {
        let frames = Arc::new(FrameState::new(memory_kib / (PAGE_SIZE / 1024)));
        // Frame zero stays reserved so a null frame number never looks valid.
        frames.mark_system(0);

        let kernel_space: AddressSpace =
            Arc::new(Mutex::new(PageDirectory::new_kernel(frames.clone())));
        let heap = KernelHeap::new(KERNEL_HEAP_INIT, KERNEL_HEAP_END, kernel_space.clone());

        crate::log_info!(
            "memory: {} KiB physical, kernel heap at {:#x}..{:#x}",
            memory_kib,
            KERNEL_HEAP_INIT,
            KERNEL_HEAP_END
        );

        MemoryManager {
            frames,
            kernel_space,
            heap: Mutex::new(heap),
        }
    }

    pub fn frames(&self) -> &Arc<FrameState> {
        &self.frames
    }

    pub fn kernel_space(&self) -> AddressSpace {
        self.kernel_space.clone()
    }

    /// A fresh process address space sharing the kernel tables.
    pub fn new_address_space(&self) -> AddressSpace {
        Arc::new(Mutex::new(self.kernel_space.lock().new_process()))
    }

    /// Deep copy of an address space for fork.
    pub fn clone_address_space(&self, src: &AddressSpace) -> Result<AddressSpace> {
        let copy = src.lock().clone_directory()?;
        Ok(Arc::new(Mutex::new(copy)))
    }

    /// Kernel heap allocation; exhaustion here is fatal to callers that
    /// cannot continue without backing memory.
    pub fn kmalloc(&self, size: usize) -> Result<u64> {
        self.heap.lock().alloc(size)
    }

    pub fn kfree(&self, addr: u64) -> Result<()> {
        self.heap.lock().free(addr)
    }

    /// Back `[addr, addr + size)` in `space` with fresh user frames.
    pub fn map_region(&self, space: &AddressSpace, addr: u64, size: u64) -> Result<()> {
        let mut dir = space.lock();
        let first = addr & !(PAGE_SIZE as u64 - 1);
        let mut at = first;
        while at < addr + size {
            dir.alloc_frame_at(at, false, true)?;
            at += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// KiB of physical memory currently in use.
    pub fn memory_use(&self) -> usize {
        self.frames.memory_use()
    }

    /// KiB of physical memory managed in total.
    pub fn memory_total(&self) -> usize {
        self.frames.memory_total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::paging::USER_BASE;

    #[test]
    fn manager_wires_frames_heap_and_kernel_space_together() {
        let mm = MemoryManager::new(16 * 1024);
        assert_eq!(mm.memory_total(), 16 * 1024);
        let before = mm.memory_use();
        let addr = mm.kmalloc(64).unwrap();
        assert!(addr >= KERNEL_HEAP_INIT && addr < KERNEL_HEAP_END);
        // One heap page was faulted in behind the allocation.
        assert_eq!(mm.memory_use(), before + PAGE_SIZE / 1024);
        mm.kfree(addr).unwrap();
    }

    #[test]
    fn map_region_backs_every_touched_page() {
        let mm = MemoryManager::new(16 * 1024);
        let space = mm.new_address_space();
        mm.map_region(&space, USER_BASE + 100, 2 * PAGE_SIZE as u64)
            .unwrap();
        let dir = space.lock();
        assert!(dir.translate(USER_BASE).is_some());
        assert!(dir.translate(USER_BASE + 2 * PAGE_SIZE as u64).is_some());
    }

    #[test]
    fn cloned_space_releases_frames_independently() {
        let mm = MemoryManager::new(16 * 1024);
        let space = mm.new_address_space();
        mm.map_region(&space, USER_BASE, PAGE_SIZE as u64).unwrap();
        let before = mm.memory_use();
        let copy = mm.clone_address_space(&space).unwrap();
        assert_eq!(mm.memory_use(), before + PAGE_SIZE / 1024);
        drop(copy);
        assert_eq!(mm.memory_use(), before);
        drop(space);
    }
}
