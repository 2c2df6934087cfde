use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

use super::frames::{FrameState, PAGE_SIZE};
use crate::errno::{Error, Result};

/// Entries per page table / tables per directory (two-level layout).
pub const ENTRIES_PER_TABLE: usize = 1024;
/// Virtual span covered by one page table.
pub const TABLE_SPAN: u64 = (ENTRIES_PER_TABLE * PAGE_SIZE) as u64;

/// Bottom of the user address range; everything below is kernel territory
/// whose tables are shared by every directory.
pub const USER_BASE: u64 = 0x1000_0000;
/// Shared-memory window; never duplicated on fork.
pub const SHM_BASE: u64 = 0x8000_0000;
/// Kernel heap window inside the kernel range.
pub const KERNEL_HEAP_INIT: u64 = 0x0080_0000;
pub const KERNEL_HEAP_END: u64 = 0x0200_0000;

/// Reserved return addresses pushed by the signal and thread trampolines.
/// A "fault" at one of these is a control-flow convention, not an error.
pub const SIGNAL_RETURN: u64 = 0xFFFF_DEAF;
pub const THREAD_RETURN: u64 = 0xFFFF_B00F;

/// What a faulting instruction pointer actually means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A signal handler returned through its trampoline.
    SignalReturn,
    /// A thread entry function returned through its trampoline.
    ThreadExit,
    /// A genuine access violation.
    Genuine,
}

/// Map a faulting instruction pointer onto the trampoline table.
pub fn classify_fault(ip: u64) -> FaultKind {
    const TRAMPOLINES: [(u64, FaultKind); 2] = [
        (SIGNAL_RETURN, FaultKind::SignalReturn),
        (THREAD_RETURN, FaultKind::ThreadExit),
    ];
    for (addr, kind) in TRAMPOLINES {
        if ip == addr {
            return kind;
        }
    }
    FaultKind::Genuine
}

bitflags! {
    /// Protection bits of one page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u8 {
        const PRESENT      = 1 << 0;
        const WRITABLE     = 1 << 1;
        const USER         = 1 << 2;
        const WRITETHROUGH = 1 << 3;
        const NOCACHE      = 1 << 4;
    }
}

/// One page-table entry: protection bits plus the frame it names.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageEntry {
    pub flags: PageFlags,
    pub frame: Option<u32>,
}

/// 1024 entries covering 4 MiB of the virtual space.
pub struct PageTable {
    entries: Box<[PageEntry]>,
}

impl PageTable {
    fn new() -> Self {
        let mut entries = Vec::with_capacity(ENTRIES_PER_TABLE);
        entries.resize_with(ENTRIES_PER_TABLE, PageEntry::default);
        PageTable {
            entries: entries.into_boxed_slice(),
        }
    }
}

/// A directory slot either shares a kernel table or owns a user table.
/// The variant, not pointer comparison, decides fork/release behavior.
enum TableRef {
    /// Shared with the kernel directory; never duplicated, never freed here.
    Kernel(Arc<Mutex<PageTable>>),
    /// Owned by this directory; deep-copied on fork, freed on release.
    User(Box<PageTable>),
}

/// A two-level page directory describing one virtual address space.
pub struct PageDirectory {
    slots: Vec<Option<TableRef>>,
    frames: Arc<FrameState>,
}

/// Address spaces are shared by reference counting (kernel daemons, clone)
/// and deep-copied on fork.
pub type AddressSpace = Arc<Mutex<PageDirectory>>;

impl PageDirectory {
    pub fn new(frames: Arc<FrameState>) -> Self {
        let mut slots = Vec::with_capacity(ENTRIES_PER_TABLE);
        slots.resize_with(ENTRIES_PER_TABLE, || None);
        PageDirectory { slots, frames }
    }

    /// Build the kernel directory: shared tables pre-created for the whole
    /// kernel window so later process directories can reference them.
    pub fn new_kernel(frames: Arc<FrameState>) -> Self {
        let mut dir = PageDirectory::new(frames);
        let kernel_slots = (KERNEL_HEAP_END / TABLE_SPAN) as usize;
        for slot in dir.slots.iter_mut().take(kernel_slots) {
            *slot = Some(TableRef::Kernel(Arc::new(Mutex::new(PageTable::new()))));
        }
        dir
    }

    /// A fresh process directory: kernel tables shared, user range empty.
    pub fn new_process(&self) -> Self {
        let mut dir = PageDirectory::new(self.frames.clone());
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(TableRef::Kernel(table)) = slot {
                dir.slots[i] = Some(TableRef::Kernel(table.clone()));
            }
        }
        dir
    }

    fn indices(vaddr: u64) -> Option<(usize, usize)> {
        let page = vaddr / PAGE_SIZE as u64;
        let table = (page / ENTRIES_PER_TABLE as u64) as usize;
        if table >= ENTRIES_PER_TABLE {
            return None;
        }
        Some((table, (page % ENTRIES_PER_TABLE as u64) as usize))
    }

    /// Run `f` against the entry for `vaddr`, creating the covering user
    /// table first when `make` is set.
    pub fn with_entry<R>(
        &mut self,
        vaddr: u64,
        make: bool,
        f: impl FnOnce(&mut PageEntry) -> R,
    ) -> Option<R> {
        let (table, sub) = Self::indices(vaddr)?;
        if self.slots[table].is_none() {
            if !make {
                return None;
            }
            self.slots[table] = Some(TableRef::User(Box::new(PageTable::new())));
        }
        match self.slots[table].as_mut() {
            Some(TableRef::Kernel(shared)) => Some(f(&mut shared.lock().entries[sub])),
            Some(TableRef::User(owned)) => Some(f(&mut owned.entries[sub])),
            None => None,
        }
    }

    /// Copy of the entry for `vaddr`, if its table exists.
    pub fn entry(&self, vaddr: u64) -> Option<PageEntry> {
        let (table, sub) = Self::indices(vaddr)?;
        match self.slots[table].as_ref() {
            Some(TableRef::Kernel(shared)) => Some(shared.lock().entries[sub]),
            Some(TableRef::User(owned)) => Some(owned.entries[sub]),
            None => None,
        }
    }

    /// Claim a physical frame for the page at `vaddr`. An entry that already
    /// names a frame only has its protection bits refreshed.
    pub fn alloc_frame_at(&mut self, vaddr: u64, kernel: bool, writable: bool) -> Result<()> {
        let frames = self.frames.clone();
        self.with_entry(vaddr, true, |entry| {
            let mut flags = PageFlags::PRESENT;
            if writable {
                flags |= PageFlags::WRITABLE;
            }
            if !kernel {
                flags |= PageFlags::USER;
            }
            if entry.frame.is_some() {
                entry.flags = flags;
                return Ok(());
            }
            // The frame is marked used in the bitmap before the entry names it.
            let frame = frames.alloc()?;
            entry.frame = Some(frame as u32);
            entry.flags = flags;
            Ok(())
        })
        .ok_or(Error::Fault)?
    }

    /// Point the page at `vaddr` at a specific frame (DMA-style mapping).
    pub fn map_at(&mut self, vaddr: u64, frame: usize, kernel: bool, writable: bool) -> Result<()> {
        self.frames.mark_system(frame);
        self.with_entry(vaddr, true, |entry| {
            let mut flags = PageFlags::PRESENT;
            if writable {
                flags |= PageFlags::WRITABLE;
            }
            if !kernel {
                flags |= PageFlags::USER;
            }
            entry.frame = Some(frame as u32);
            entry.flags = flags;
        })
        .ok_or(Error::Fault)
    }

    /// Reserve the covering table for `vaddr` without mapping anything.
    pub fn reserve_table(&mut self, vaddr: u64) {
        self.with_entry(vaddr, true, |_| {});
    }

    /// Tear down the page at `vaddr`, returning its frame to the allocator.
    pub fn free_page(&mut self, vaddr: u64) {
        let frames = self.frames.clone();
        self.with_entry(vaddr, false, |entry| {
            if let Some(frame) = entry.frame.take() {
                entry.flags = PageFlags::empty();
                frames.free(frame as usize);
            }
        });
    }

    /// Virtual-to-physical translation.
    pub fn translate(&self, vaddr: u64) -> Option<(usize, usize)> {
        let entry = self.entry(vaddr)?;
        let frame = entry.frame?;
        if !entry.flags.contains(PageFlags::PRESENT) {
            return None;
        }
        Some((frame as usize, (vaddr % PAGE_SIZE as u64) as usize))
    }

    /// Copy bytes out of this address space. Fails on any unmapped page.
    pub fn read(&self, vaddr: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let at = vaddr + done as u64;
            let (frame, offset) = self.translate(at).ok_or(Error::Fault)?;
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            self.frames
                .read_frame(frame, offset, &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copy bytes into this address space. Fails on any unmapped page.
    pub fn write(&self, vaddr: u64, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let at = vaddr + done as u64;
            let (frame, offset) = self.translate(at).ok_or(Error::Fault)?;
            let chunk = (PAGE_SIZE - offset).min(data.len() - done);
            self.frames
                .write_frame(frame, offset, &data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Read a NUL-terminated string out of this address space.
    pub fn read_cstr(&self, vaddr: u64, max: usize) -> Result<alloc::string::String> {
        let mut out = Vec::new();
        for i in 0..max as u64 {
            let mut byte = [0u8; 1];
            self.read(vaddr + i, &mut byte)?;
            if byte[0] == 0 {
                return alloc::string::String::from_utf8(out).map_err(|_| Error::Invalid);
            }
            out.push(byte[0]);
        }
        Err(Error::Invalid)
    }

    /// Full copy for fork: kernel tables are shared by reference, user-range
    /// tables are physically duplicated frame by frame. The shared-memory
    /// window above `SHM_BASE` is never duplicated.
    pub fn clone_directory(&self) -> Result<Self> {
        let mut dir = PageDirectory::new(self.frames.clone());
        for (i, slot) in self.slots.iter().enumerate() {
            let base = i as u64 * TABLE_SPAN;
            match slot {
                None => {}
                Some(TableRef::Kernel(shared)) => {
                    dir.slots[i] = Some(TableRef::Kernel(shared.clone()));
                }
                Some(TableRef::User(owned)) => {
                    if base < SHM_BASE {
                        dir.slots[i] = Some(TableRef::User(self.clone_table(owned)?));
                    }
                }
            }
        }
        Ok(dir)
    }

    fn clone_table(&self, src: &PageTable) -> Result<Box<PageTable>> {
        let mut table = Box::new(PageTable::new());
        for (i, entry) in src.entries.iter().enumerate() {
            let src_frame = match entry.frame {
                Some(f) => f,
                None => continue,
            };
            let frame = self.frames.alloc()?;
            table.entries[i].frame = Some(frame as u32);
            table.entries[i].flags = entry.flags;
            self.frames.copy_frame(src_frame as usize, frame);
        }
        Ok(table)
    }
}

impl Drop for PageDirectory {
    /// Frames are cleared only when the last reference to the directory is
    /// released; kernel-shared tables are left alone.
    fn drop(&mut self) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let base = i as u64 * TABLE_SPAN;
            if let Some(TableRef::User(owned)) = slot {
                if base < SHM_BASE {
                    for entry in owned.entries.iter_mut() {
                        if let Some(frame) = entry.frame.take() {
                            self.frames.free(frame as usize);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Arc<FrameState>, PageDirectory) {
        let frames = Arc::new(FrameState::new(512));
        let kernel = PageDirectory::new_kernel(frames.clone());
        (frames, kernel)
    }

    #[test]
    fn alloc_frame_is_idempotent_on_mapped_entries() {
        let (frames, kernel) = fixture();
        let mut dir = kernel.new_process();
        dir.alloc_frame_at(USER_BASE, false, true).unwrap();
        let first = dir.entry(USER_BASE).unwrap().frame;
        let used = frames.memory_use();
        // Second allocation at the same address only updates protection.
        dir.alloc_frame_at(USER_BASE, false, false).unwrap();
        assert_eq!(dir.entry(USER_BASE).unwrap().frame, first);
        assert_eq!(frames.memory_use(), used);
        assert!(!dir
            .entry(USER_BASE)
            .unwrap()
            .flags
            .contains(PageFlags::WRITABLE));
    }

    #[test]
    fn bitmap_is_marked_before_the_entry_names_a_frame() {
        let (frames, kernel) = fixture();
        let mut dir = kernel.new_process();
        dir.alloc_frame_at(USER_BASE, false, true).unwrap();
        let frame = dir.entry(USER_BASE).unwrap().frame.unwrap() as usize;
        assert!(frames.is_used(frame));
    }

    #[test]
    fn read_write_roundtrip_across_page_boundary() {
        let (_frames, kernel) = fixture();
        let mut dir = kernel.new_process();
        dir.alloc_frame_at(USER_BASE, false, true).unwrap();
        dir.alloc_frame_at(USER_BASE + PAGE_SIZE as u64, false, true)
            .unwrap();
        let at = USER_BASE + PAGE_SIZE as u64 - 3;
        dir.write(at, b"straddle").unwrap();
        let mut buf = [0u8; 8];
        dir.read(at, &mut buf).unwrap();
        assert_eq!(&buf, b"straddle");
    }

    #[test]
    fn unmapped_access_faults() {
        let (_frames, kernel) = fixture();
        let dir = kernel.new_process();
        let mut buf = [0u8; 4];
        assert_eq!(dir.read(USER_BASE, &mut buf), Err(Error::Fault));
    }

    #[test]
    fn fork_deep_copies_user_range_and_shares_kernel_tables() {
        let (_frames, kernel) = fixture();
        let mut parent = kernel.new_process();
        parent.alloc_frame_at(USER_BASE, false, true).unwrap();
        parent.write(USER_BASE, b"parent data").unwrap();

        let child = parent.clone_directory().unwrap();
        // Different physical frames back the same virtual address.
        assert_ne!(
            parent.entry(USER_BASE).unwrap().frame,
            child.entry(USER_BASE).unwrap().frame
        );
        // Contents were copied byte for byte.
        let mut buf = [0u8; 11];
        child.read(USER_BASE, &mut buf).unwrap();
        assert_eq!(&buf, b"parent data");

        // Writes to the child are not observable in the parent and vice versa.
        child.write(USER_BASE, b"child  data").unwrap();
        parent.read(USER_BASE, &mut buf).unwrap();
        assert_eq!(&buf, b"parent data");

        // Kernel tables are the same objects underneath.
        let mut kdir = kernel;
        kdir.with_entry(0x1000, true, |e| e.frame = Some(7)).unwrap();
        assert_eq!(child.entry(0x1000).unwrap().frame, Some(7));
    }

    #[test]
    fn release_returns_user_frames_to_the_allocator() {
        let (frames, kernel) = fixture();
        let baseline = frames.memory_use();
        {
            let mut dir = kernel.new_process();
            for i in 0..4u64 {
                dir.alloc_frame_at(USER_BASE + i * PAGE_SIZE as u64, false, true)
                    .unwrap();
            }
            assert_eq!(frames.memory_use(), baseline + 16);
        }
        assert_eq!(frames.memory_use(), baseline);
    }

    #[test]
    fn trampoline_addresses_classify_as_control_flow() {
        assert_eq!(classify_fault(SIGNAL_RETURN), FaultKind::SignalReturn);
        assert_eq!(classify_fault(THREAD_RETURN), FaultKind::ThreadExit);
        assert_eq!(classify_fault(0x1000_2000), FaultKind::Genuine);
    }
}
