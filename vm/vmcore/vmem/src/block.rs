// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest memory blocks: per-location first-fit page allocators over
//! contiguous guest sub-ranges, and the registry resolving
//! `(location | address)` to a block.
//!
//! There is no free-list coalescing: allocations are whole page runs keyed
//! by base address, and freed runs never shrink below their original
//! granularity.

use crate::Memory;
use crate::pages::PAGE_READABLE;
use crate::pages::PAGE_WRITABLE;
use guest_range::GuestRange;
use guest_range::PAGE_SHIFT;
use guest_range::PAGE_SIZE;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// One contiguous guest sub-range with its own allocator.
pub struct Block {
    vm: Weak<Memory>,
    addr: u32,
    size: u32,
    flags: u64,
    used: AtomicU32,
    /// Live allocations, base address to byte size. The mutex also
    /// serializes allocation attempts within the block.
    map: Mutex<BTreeMap<u32, u32>>,
}

impl Block {
    pub(crate) fn new(vm: Weak<Memory>, addr: u32, size: u32, flags: u64) -> Self {
        assert!(
            size != 0
                && addr % PAGE_SIZE == 0
                && size % PAGE_SIZE == 0
                && addr as u64 + size as u64 <= 1 << 32,
            "invalid block range (addr={addr:#x}, size={size:#x})"
        );
        Self {
            vm,
            addr,
            size,
            flags,
            used: AtomicU32::new(0),
            map: Mutex::new(BTreeMap::new()),
        }
    }

    /// The block's base address.
    pub fn addr(&self) -> u32 {
        self.addr
    }

    /// The block's capacity in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Opaque mapping flags the block was created with.
    pub fn flags(&self) -> u64 {
        self.flags
    }

    /// Bytes currently allocated out of the block.
    pub fn used_bytes(&self) -> u32 {
        self.used.load(Ordering::SeqCst)
    }

    /// Returns whether `addr` falls within the block's range.
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.addr && (addr as u64) < self.addr as u64 + self.size as u64
    }

    pub(crate) fn range(&self) -> GuestRange {
        GuestRange::new(self.addr, self.size)
    }

    fn vm(&self) -> Arc<Memory> {
        self.vm.upgrade().expect("memory subsystem dropped")
    }

    /// Allocates `size` bytes (rounded up to whole pages) at the lowest
    /// `align`-aligned address with room, first fit. Returns `None` when the
    /// block cannot satisfy the request.
    ///
    /// Panics unless `align` is a power of two of at least one page.
    pub fn alloc(&self, size: u32, align: u32) -> Option<u32> {
        assert!(
            align >= PAGE_SIZE && align.is_power_of_two(),
            "invalid alignment (size={size:#x}, align={align:#x})"
        );
        let vm = self.vm();
        let mut map = self.map.lock();

        let size = size
            .checked_next_multiple_of(PAGE_SIZE)
            .filter(|&size| size != 0 && size <= self.size)?;

        let block_last = self.addr as u64 + self.size as u64 - 1;
        let mut addr = self.addr.checked_next_multiple_of(align)?;
        while addr as u64 + size as u64 - 1 <= block_last {
            if self.try_alloc(&vm, &mut map, addr, size) {
                return Some(addr);
            }
            if self.used.load(Ordering::SeqCst) as u64 + size as u64 > self.size as u64 {
                return None;
            }
            addr = addr.checked_add(align)?;
        }
        None
    }

    /// Allocates `size` bytes (rounded up to whole pages) at the fixed
    /// address `addr`. Returns `None` when the range leaves the block or is
    /// already occupied.
    pub fn falloc(&self, addr: u32, size: u32) -> Option<u32> {
        let vm = self.vm();
        let mut map = self.map.lock();

        let size = size
            .checked_next_multiple_of(PAGE_SIZE)
            .filter(|&size| size != 0 && size <= self.size)?;
        if addr < self.addr
            || addr as u64 + size as u64 - 1 > self.addr as u64 + self.size as u64 - 1
        {
            return None;
        }

        self.try_alloc(&vm, &mut map, addr, size).then_some(addr)
    }

    /// Frees the allocation based at `addr`, unmapping its pages. Returns
    /// `false` if no allocation starts there.
    pub fn dealloc(&self, addr: u32) -> bool {
        let vm = self.vm();
        let mut map = self.map.lock();

        let Some(size) = map.remove(&addr) else {
            return false;
        };
        self.used.fetch_sub(size, Ordering::SeqCst);
        vm.page_unmap(addr, size);
        true
    }

    fn try_alloc(&self, vm: &Memory, map: &mut BTreeMap<u32, u32>, addr: u32, size: u32) -> bool {
        // The pages must be untouched.
        let range = GuestRange::new(addr, size);
        for page in range.pages() {
            if vm.page_flags(page) != 0 {
                return false;
            }
        }

        // Reserve capacity.
        let reserved = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                assert!(
                    used <= self.size,
                    "unexpected amount of used memory ({used:#x})"
                );
                used.checked_add(size).filter(|&new| new <= self.size)
            });
        if reserved.is_err() {
            return false;
        }

        vm.page_map(addr, size, PAGE_READABLE | PAGE_WRITABLE);
        map.insert(addr, size);
        true
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // If the memory instance is already gone, the whole mapping went
        // with it and there is nothing to release.
        let Some(vm) = self.vm.upgrade() else {
            return;
        };
        let map = std::mem::take(self.map.get_mut());
        if map.is_empty() {
            return;
        }
        let res = vm.res.lock();
        for (addr, size) in map {
            vm.page_unmap_locked(&res, GuestRange::new(addr, size));
        }
        drop(res);
        tracing::debug!(addr = self.addr, "released guest memory block");
    }
}

impl Memory {
    /// Creates a block over `[addr, addr + size)` and registers it. Returns
    /// `None` when the range overlaps an existing block.
    ///
    /// Panics on unaligned arguments or if any covered page is unexpectedly
    /// in use.
    pub fn map(self: &Arc<Self>, addr: u32, size: u32, flags: u64) -> Option<Arc<Block>> {
        assert!(
            size != 0
                && addr % PAGE_SIZE == 0
                && size % PAGE_SIZE == 0
                && addr as u64 + size as u64 <= 1 << 32,
            "invalid arguments (addr={addr:#x}, size={size:#x})"
        );
        let range = GuestRange::new(addr, size);

        let res = self.res.lock();
        let mut locations = self.locations.lock();

        if locations
            .iter()
            .flatten()
            .any(|block| block.range().overlaps(&range))
        {
            return None;
        }
        for page in range.pages() {
            if self.page_flags(page) != 0 {
                panic!(
                    "unexpected pages allocated (current_addr={:#x})",
                    (page as u32) << PAGE_SHIFT
                );
            }
        }

        let block = Arc::new(Block::new(Arc::downgrade(self), addr, size, flags));
        locations.push(Some(block.clone()));
        drop(locations);
        drop(res);

        tracing::debug!(addr, size, "mapped guest memory block");
        Some(block)
    }

    /// Deregisters the block based at `addr`, leaving its slot empty so
    /// other location ids stay stable. Dropping the returned handle releases
    /// the block's remaining allocations.
    pub fn unmap(&self, addr: u32) -> Option<Arc<Block>> {
        let _res = self.res.lock();
        let mut locations = self.locations.lock();

        let slot = locations
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|block| block.addr() == addr))?;
        let block = slot.take();
        tracing::debug!(addr, "unmapped guest memory block");
        block
    }

    /// Resolves a block: by slot id, or by address when `location` is
    /// `None`.
    pub fn get(&self, location: Option<usize>, addr: u32) -> Option<Arc<Block>> {
        let _res = self.res.lock();
        let locations = self.locations.lock();

        match location {
            Some(index) => locations.get(index).cloned().flatten(),
            None => locations
                .iter()
                .flatten()
                .find(|block| block.contains(addr))
                .cloned(),
        }
    }

    /// Allocates `size` bytes from the block at slot `location`.
    ///
    /// Panics if the location does not exist.
    pub fn alloc(&self, size: u32, location: usize, align: u32) -> Option<u32> {
        let block = self
            .get(Some(location), 0)
            .unwrap_or_else(|| panic!("invalid memory location ({location})"));
        block.alloc(size, align)
    }

    /// Allocates `size` bytes at the fixed address `addr`, from the block at
    /// slot `location` or, when `None`, from the block containing `addr`.
    ///
    /// Panics if no such location exists.
    pub fn falloc(&self, addr: u32, size: u32, location: Option<usize>) -> Option<u32> {
        let block = self
            .get(location, addr)
            .unwrap_or_else(|| panic!("invalid memory location ({location:?}, addr={addr:#x})"));
        block.falloc(addr, size)
    }

    /// Frees the allocation based at `addr` in the block at slot `location`
    /// or, when `None`, in the block containing `addr`.
    ///
    /// Panics if no such location exists.
    pub fn dealloc(&self, addr: u32, location: Option<usize>) -> bool {
        let block = self
            .get(location, addr)
            .unwrap_or_else(|| panic!("invalid memory location ({location:?}, addr={addr:#x})"));
        block.dealloc(addr)
    }
}

#[cfg(test)]
mod tests {
    use crate::Console;
    use crate::LOC_MAIN;
    use crate::Memory;
    use crate::RunState;
    use std::sync::Arc;

    fn mem() -> Arc<Memory> {
        Memory::new(Console::Ps3, RunState::new()).unwrap()
    }

    #[test]
    fn test_first_fit_alloc() {
        let vm = mem();

        // The PS3 main block starts at 0x10000; first fit hands out
        // addresses bottom-up.
        assert_eq!(vm.alloc(0x1000, LOC_MAIN, 0x1000), Some(0x1_0000));
        assert_eq!(vm.alloc(0x1000, LOC_MAIN, 0x1000), Some(0x1_1000));

        // Freeing the first allocation makes its address the first fit
        // again.
        assert!(vm.dealloc(0x1_0000, Some(LOC_MAIN)));
        assert_eq!(vm.alloc(0x1000, LOC_MAIN, 0x1000), Some(0x1_0000));
    }

    #[test]
    fn test_falloc_conflict() {
        let vm = mem();

        assert_eq!(vm.alloc(0x1000, LOC_MAIN, 0x1000), Some(0x1_0000));
        // The fixed range collides with the allocation above.
        assert_eq!(vm.falloc(0x1_0000, 0x2000, Some(LOC_MAIN)), None);

        // A disjoint fixed range works.
        assert_eq!(vm.falloc(0x1_2000, 0x2000, None), Some(0x1_2000));
    }

    #[test]
    fn test_falloc_out_of_block() {
        let vm = mem();
        let block = vm.get(Some(LOC_MAIN), 0).unwrap();

        // Below the base, and running past the end.
        assert_eq!(block.falloc(0x1000, 0x1000), None);
        assert_eq!(block.falloc(0x1fff_f000, 0x2000), None);
    }

    #[test]
    fn test_alloc_respects_alignment() {
        let vm = mem();
        let block = vm.get(Some(LOC_MAIN), 0).unwrap();

        // The block base 0x10000 is not 1 MiB aligned; the first fit is the
        // next aligned address.
        assert_eq!(block.alloc(0x1000, 0x10_0000), Some(0x10_0000));
    }

    #[test]
    #[should_panic(expected = "invalid alignment")]
    fn test_alloc_rejects_small_alignment() {
        let vm = mem();
        vm.alloc(0x1000, LOC_MAIN, 0x800);
    }

    #[test]
    fn test_used_bytes_roundtrip() {
        let vm = mem();
        let block = vm.get(Some(LOC_MAIN), 0).unwrap();

        assert_eq!(block.used_bytes(), 0);
        let addr = block.alloc(0x4200, 0x1000).unwrap();
        // Sizes are page-granular.
        assert_eq!(block.used_bytes(), 0x5000);
        assert!(vm.check_addr(addr, 0x5000));

        assert!(block.dealloc(addr));
        assert_eq!(block.used_bytes(), 0);
        assert!(!vm.check_addr(addr, 1));

        // Double free reports failure.
        assert!(!block.dealloc(addr));
    }

    #[test]
    fn test_alloc_exhaustion() {
        let vm = mem();
        // A small user-created block fills up and refuses further requests.
        let block = vm.map(0x4000_0000, 0x4000, 0).unwrap();
        assert_eq!(block.alloc(0x2000, 0x1000), Some(0x4000_0000));
        assert_eq!(block.alloc(0x2000, 0x1000), Some(0x4000_2000));
        assert_eq!(block.alloc(0x1000, 0x1000), None);

        assert!(block.dealloc(0x4000_0000));
        assert_eq!(block.alloc(0x1000, 0x1000), Some(0x4000_0000));
    }

    #[test]
    fn test_map_overlap_refused() {
        let vm = mem();

        // Overlaps the PS3 main block.
        assert!(vm.map(0x1000_0000, 0x1000, 0).is_none());
        // Overlaps a user-created block.
        assert!(vm.map(0x4000_0000, 0x2000, 0).is_some());
        assert!(vm.map(0x4000_1000, 0x2000, 0).is_none());
    }

    #[test]
    fn test_unmap_releases_pages() {
        let vm = mem();

        let block = vm.map(0x4000_0000, 0x4000, 0).unwrap();
        block.alloc(0x2000, 0x1000).unwrap();
        assert!(vm.check_addr(0x4000_0000, 0x2000));

        let removed = vm.unmap(0x4000_0000).unwrap();
        assert!(Arc::ptr_eq(&removed, &block));
        assert!(vm.unmap(0x4000_0000).is_none());

        // Pages survive until the last handle goes away.
        assert!(vm.check_addr(0x4000_0000, 0x2000));
        drop(block);
        drop(removed);
        assert!(!vm.check_addr(0x4000_0000, 0x2000));

        // The range can now be mapped again.
        assert!(vm.map(0x4000_0000, 0x4000, 0).is_some());
    }

    #[test]
    fn test_get_by_address() {
        let vm = mem();

        let block = vm.get(None, 0x1234_5678).unwrap();
        assert_eq!(block.addr(), 0x1_0000);
        assert!(vm.get(None, 0x5000_0000).is_none());

        assert!(vm.get(Some(99), 0).is_none());
    }
}
