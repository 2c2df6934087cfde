use alloc::vec::Vec;
use hashbrown::HashMap;

use super::frames::PAGE_SIZE;
use super::paging::AddressSpace;
use crate::errno::{Error, Result};

/// Largest request served from a bin page; anything bigger takes the
/// large-block path.
const MAX_BIN_SIZE: usize = PAGE_SIZE / 2;
/// Smallest bin class, in bytes.
const MIN_BIN_SIZE: usize = 16;

const SKIP_MAX_LEVEL: usize = 12;

/// Round a small request up to its power-of-two bin class.
fn bin_class(size: usize) -> usize {
    let mut class = MIN_BIN_SIZE;
    while class < size {
        class <<= 1;
    }
    class
}

fn pages_for(size: usize) -> usize {
    (size + PAGE_SIZE - 1) / PAGE_SIZE
}

// ──────────────────────────────────────────────────────────────
//  Size-ordered skip list of free large blocks
// ──────────────────────────────────────────────────────────────

struct SkipNode {
    pages: usize,
    addr: u64,
    forward: [Option<usize>; SKIP_MAX_LEVEL],
}

/// Free large blocks keyed by (pages, addr); best fit is the first node
/// whose size is not smaller than the request, found in O(log n).
struct FreeList {
    nodes: Vec<SkipNode>,
    head: [Option<usize>; SKIP_MAX_LEVEL],
    recycled: Vec<usize>,
    level: usize,
    rng: u32,
}

impl FreeList {
    fn new() -> Self {
        FreeList {
            nodes: Vec::new(),
            head: [None; SKIP_MAX_LEVEL],
            recycled: Vec::new(),
            level: 1,
            rng: 0x5EED_1234,
        }
    }

    fn random_level(&mut self) -> usize {
        // xorshift; coin flips decide tower height.
        let mut level = 1;
        loop {
            self.rng ^= self.rng << 13;
            self.rng ^= self.rng >> 17;
            self.rng ^= self.rng << 5;
            if self.rng & 1 == 0 || level == SKIP_MAX_LEVEL {
                return level;
            }
            level += 1;
        }
    }

    fn key(&self, idx: usize) -> (usize, u64) {
        (self.nodes[idx].pages, self.nodes[idx].addr)
    }

    fn insert(&mut self, addr: u64, pages: usize) {
        let height = self.random_level();
        let idx = match self.recycled.pop() {
            Some(i) => {
                self.nodes[i] = SkipNode {
                    pages,
                    addr,
                    forward: [None; SKIP_MAX_LEVEL],
                };
                i
            }
            None => {
                self.nodes.push(SkipNode {
                    pages,
                    addr,
                    forward: [None; SKIP_MAX_LEVEL],
                });
                self.nodes.len() - 1
            }
        };
        if height > self.level {
            self.level = height;
        }

        let mut update: [Option<usize>; SKIP_MAX_LEVEL] = [None; SKIP_MAX_LEVEL];
        let mut cursor: Option<usize> = None;
        for lvl in (0..self.level).rev() {
            loop {
                let next = match cursor {
                    Some(c) => self.nodes[c].forward[lvl],
                    None => self.head[lvl],
                };
                match next {
                    Some(n) if self.key(n) < (pages, addr) => cursor = Some(n),
                    _ => break,
                }
            }
            update[lvl] = cursor;
        }

        for lvl in 0..height {
            match update[lvl] {
                Some(prev) => {
                    self.nodes[idx].forward[lvl] = self.nodes[prev].forward[lvl];
                    self.nodes[prev].forward[lvl] = Some(idx);
                }
                None => {
                    self.nodes[idx].forward[lvl] = self.head[lvl];
                    self.head[lvl] = Some(idx);
                }
            }
        }
    }

    /// Remove and return the smallest block of at least `pages` pages.
    fn take_best_fit(&mut self, pages: usize) -> Option<(u64, usize)> {
        // Walk down the towers to the last node smaller than the request.
        let mut cursor: Option<usize> = None;
        for lvl in (0..self.level).rev() {
            loop {
                let next = match cursor {
                    Some(c) => self.nodes[c].forward[lvl],
                    None => self.head[lvl],
                };
                match next {
                    Some(n) if self.nodes[n].pages < pages => cursor = Some(n),
                    _ => break,
                }
            }
        }
        let target = match cursor {
            Some(c) => self.nodes[c].forward[0],
            None => self.head[0],
        }?;

        let (t_pages, t_addr) = self.key(target);
        self.unlink(target, (t_pages, t_addr));
        Some((t_addr, t_pages))
    }

    fn unlink(&mut self, idx: usize, key: (usize, u64)) {
        for lvl in 0..self.level {
            let mut cursor: Option<usize> = None;
            loop {
                let next = match cursor {
                    Some(c) => self.nodes[c].forward[lvl],
                    None => self.head[lvl],
                };
                match next {
                    Some(n) if n == idx => {
                        let after = self.nodes[idx].forward[lvl];
                        match cursor {
                            Some(c) => self.nodes[c].forward[lvl] = after,
                            None => self.head[lvl] = after,
                        }
                        break;
                    }
                    Some(n) if self.key(n) < key => cursor = Some(n),
                    _ => break,
                }
            }
        }
        self.recycled.push(idx);
    }

    fn len(&self) -> usize {
        self.nodes.len() - self.recycled.len()
    }
}

// ──────────────────────────────────────────────────────────────
//  Bin pages for small requests
// ──────────────────────────────────────────────────────────────

struct BinPage {
    class: usize,
    free_slots: Vec<u16>,
    used: usize,
}

/// The kernel heap: segregated bin pages for small requests, a skip-list
/// free list for large ones, dedicated page ranges past one page.
pub struct KernelHeap {
    start: u64,
    end: u64,
    brk: u64,
    kspace: AddressSpace,
    bins: HashMap<u64, BinPage>,
    /// Non-full bin pages per class index (log2(class) - log2(min)).
    open_bins: Vec<Vec<u64>>,
    free_large: FreeList,
    live_large: HashMap<u64, usize>,
}

impl KernelHeap {
    pub fn new(start: u64, end: u64, kspace: AddressSpace) -> Self {
        let classes = (MAX_BIN_SIZE / MIN_BIN_SIZE).trailing_zeros() as usize + 1;
        let mut open_bins = Vec::with_capacity(classes);
        open_bins.resize_with(classes, Vec::new);
        KernelHeap {
            start,
            end,
            brk: start,
            kspace,
            bins: HashMap::new(),
            open_bins,
            free_large: FreeList::new(),
            live_large: HashMap::new(),
        }
    }

    fn class_index(class: usize) -> usize {
        (class / MIN_BIN_SIZE).trailing_zeros() as usize
    }

    /// Extend the heap break, backing fresh pages with kernel frames.
    fn grow(&mut self, pages: usize) -> Result<u64> {
        let bytes = (pages * PAGE_SIZE) as u64;
        if self.brk + bytes > self.end {
            return Err(Error::OutOfMemory);
        }
        let base = self.brk;
        let mut kspace = self.kspace.lock();
        for i in 0..pages {
            kspace.alloc_frame_at(base + (i * PAGE_SIZE) as u64, true, true)?;
        }
        self.brk += bytes;
        Ok(base)
    }

    pub fn alloc(&mut self, size: usize) -> Result<u64> {
        if size == 0 {
            return Err(Error::Invalid);
        }
        if size <= MAX_BIN_SIZE {
            return self.alloc_small(size);
        }
        self.alloc_large(pages_for(size))
    }

    fn alloc_small(&mut self, size: usize) -> Result<u64> {
        let class = bin_class(size);
        let index = Self::class_index(class);

        let page_addr = match self.open_bins[index].last() {
            Some(addr) => *addr,
            None => {
                // Open a fresh bin page for this class.
                let addr = self.grow(1)?;
                let slots = PAGE_SIZE / class;
                self.bins.insert(
                    addr,
                    BinPage {
                        class,
                        free_slots: (0..slots as u16).rev().collect(),
                        used: 0,
                    },
                );
                self.open_bins[index].push(addr);
                addr
            }
        };

        let bin = match self.bins.get_mut(&page_addr) {
            Some(b) => b,
            None => return Err(Error::Invalid),
        };
        let slot = match bin.free_slots.pop() {
            Some(s) => s,
            None => return Err(Error::Invalid),
        };
        bin.used += 1;
        let full = bin.free_slots.is_empty();
        if full {
            self.open_bins[index].retain(|a| *a != page_addr);
        }
        Ok(page_addr + (slot as usize * class) as u64)
    }

    fn alloc_large(&mut self, pages: usize) -> Result<u64> {
        if let Some((addr, found)) = self.free_large.take_best_fit(pages) {
            // Best fit found; hand back the unused tail as its own block.
            if found > pages {
                self.free_large
                    .insert(addr + (pages * PAGE_SIZE) as u64, found - pages);
            }
            self.live_large.insert(addr, pages);
            return Ok(addr);
        }
        let addr = self.grow(pages)?;
        self.live_large.insert(addr, pages);
        Ok(addr)
    }

    pub fn free(&mut self, addr: u64) -> Result<()> {
        if let Some(pages) = self.live_large.remove(&addr) {
            self.free_large.insert(addr, pages);
            return Ok(());
        }

        let page_addr = addr & !(PAGE_SIZE as u64 - 1);
        let bin = self.bins.get_mut(&page_addr).ok_or(Error::Invalid)?;
        let offset = (addr - page_addr) as usize;
        if offset % bin.class != 0 || bin.used == 0 {
            return Err(Error::Invalid);
        }
        let slot = (offset / bin.class) as u16;
        if bin.free_slots.contains(&slot) {
            return Err(Error::Invalid);
        }
        let was_full = bin.free_slots.is_empty();
        bin.free_slots.push(slot);
        bin.used -= 1;
        if was_full {
            let index = Self::class_index(bin.class);
            self.open_bins[index].push(page_addr);
        }
        Ok(())
    }

    /// Bytes between the heap base and the current break.
    pub fn footprint(&self) -> usize {
        (self.brk - self.start) as usize
    }

    pub fn free_blocks(&self) -> usize {
        self.free_large.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frames::FrameState;
    use crate::memory::paging::{PageDirectory, KERNEL_HEAP_END, KERNEL_HEAP_INIT};
    use alloc::sync::Arc;
    use spin::Mutex;

    fn heap() -> KernelHeap {
        let frames = Arc::new(FrameState::new(4096));
        let kspace = Arc::new(Mutex::new(PageDirectory::new_kernel(frames)));
        KernelHeap::new(KERNEL_HEAP_INIT, KERNEL_HEAP_END, kspace)
    }

    #[test]
    fn bin_classes_round_up_to_powers_of_two() {
        assert_eq!(bin_class(1), 16);
        assert_eq!(bin_class(16), 16);
        assert_eq!(bin_class(17), 32);
        assert_eq!(bin_class(2048), 2048);
    }

    #[test]
    fn small_allocations_share_a_bin_page() {
        let mut h = heap();
        let a = h.alloc(24).unwrap();
        let b = h.alloc(24).unwrap();
        // Same 4 KiB page, distinct 32-byte slots.
        assert_eq!(a & !(PAGE_SIZE as u64 - 1), b & !(PAGE_SIZE as u64 - 1));
        assert_ne!(a, b);
        assert_eq!(h.footprint(), PAGE_SIZE);
    }

    #[test]
    fn freed_small_slot_is_reused() {
        let mut h = heap();
        let a = h.alloc(100).unwrap();
        let _b = h.alloc(100).unwrap();
        h.free(a).unwrap();
        let c = h.alloc(100).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn double_free_of_a_small_slot_is_rejected() {
        let mut h = heap();
        let a = h.alloc(64).unwrap();
        h.free(a).unwrap();
        assert_eq!(h.free(a), Err(Error::Invalid));
    }

    #[test]
    fn large_allocations_take_dedicated_page_ranges() {
        let mut h = heap();
        let a = h.alloc(3 * PAGE_SIZE).unwrap();
        assert_eq!(a % PAGE_SIZE as u64, 0);
        assert_eq!(h.footprint(), 3 * PAGE_SIZE);
        h.free(a).unwrap();
        assert_eq!(h.free_blocks(), 1);
    }

    #[test]
    fn best_fit_prefers_the_smallest_sufficient_block() {
        let mut h = heap();
        let big = h.alloc(8 * PAGE_SIZE).unwrap();
        let small = h.alloc(2 * PAGE_SIZE).unwrap();
        h.free(big).unwrap();
        h.free(small).unwrap();
        // A two-page request must come from the two-page block, not the
        // eight-page one.
        let fit = h.alloc(2 * PAGE_SIZE).unwrap();
        assert_eq!(fit, small);
    }

    #[test]
    fn split_blocks_return_their_tail() {
        let mut h = heap();
        let big = h.alloc(8 * PAGE_SIZE).unwrap();
        h.free(big).unwrap();
        let head = h.alloc(3 * PAGE_SIZE).unwrap();
        assert_eq!(head, big);
        // The remaining five pages are still on the free list.
        let tail = h.alloc(5 * PAGE_SIZE).unwrap();
        assert_eq!(tail, big + (3 * PAGE_SIZE) as u64);
        assert_eq!(h.footprint(), 8 * PAGE_SIZE);
    }

    #[test]
    fn exhaustion_surfaces_as_out_of_memory() {
        let frames = Arc::new(FrameState::new(4096));
        let kspace = Arc::new(Mutex::new(PageDirectory::new_kernel(frames)));
        let mut h = KernelHeap::new(KERNEL_HEAP_INIT, KERNEL_HEAP_INIT + 2 * PAGE_SIZE as u64, kspace);
        assert!(h.alloc(PAGE_SIZE).is_ok());
        assert!(h.alloc(PAGE_SIZE).is_ok());
        assert_eq!(h.alloc(16), Err(Error::OutOfMemory));
    }

    #[test]
    fn skip_list_survives_many_inserts_and_removals() {
        let mut list = FreeList::new();
        for i in 0..64u64 {
            list.insert(0x10000 + i * 0x1000, (i % 7 + 1) as usize);
        }
        assert_eq!(list.len(), 64);
        let mut taken = 0;
        while let Some((_addr, pages)) = list.take_best_fit(3) {
            assert!(pages >= 3);
            taken += 1;
        }
        // Classes 3..=7 of the i%7+1 distribution.
        assert_eq!(taken, 45);
        assert!(list.take_best_fit(1).is_some());
    }
}
