// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-page state for the 4 GiB guest address space.
//!
//! One byte per 4 KiB page, updated with sequentially-consistent atomics so
//! the allocated/free edge of every page is ordered against the host
//! protection changes that accompany it. All mutating operations serialize
//! on the reservation mutex; [`Memory::check_addr`] is the only lock-free
//! reader.

use crate::Memory;
use crate::reservation::ResGuard;
use dual_mmap::Protection;
use guest_range::GuestRange;
use guest_range::PAGE_COUNT;
use guest_range::PAGE_SHIFT;
use guest_range::PAGE_SIZE;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

/// Guest reads are permitted.
pub const PAGE_READABLE: u8 = 1 << 0;
/// Guest writes are permitted.
pub const PAGE_WRITABLE: u8 = 1 << 1;
/// The reservation engine must not accept windows on this page.
pub const PAGE_NO_RESERVATIONS: u8 = 1 << 2;
/// The page is backed by an allocation in some block.
pub const PAGE_ALLOCATED: u8 = 1 << 7;

/// One flag byte per guest page.
pub(crate) struct PageTable {
    flags: Box<[AtomicU8]>,
}

impl PageTable {
    pub fn new() -> Self {
        Self {
            flags: (0..PAGE_COUNT).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    pub fn load(&self, page: usize) -> u8 {
        self.flags[page].load(Ordering::SeqCst)
    }

    pub fn install(&self, page: usize, flags: u8) -> u8 {
        self.flags[page].swap(flags, Ordering::SeqCst)
    }

    pub fn clear(&self, page: usize) -> u8 {
        self.flags[page].swap(0, Ordering::SeqCst)
    }

    pub fn store(&self, page: usize, flags: u8) {
        self.flags[page].store(flags, Ordering::SeqCst)
    }
}

/// The public-view protection implied by a page's flag byte.
pub(crate) fn protection_for(flags: u8) -> Protection {
    if flags & PAGE_WRITABLE != 0 {
        Protection::ReadWrite
    } else if flags & PAGE_READABLE != 0 {
        Protection::Read
    } else {
        Protection::NoAccess
    }
}

/// Validates a page-aligned range argument pair.
#[track_caller]
fn page_range(addr: u32, size: u32) -> GuestRange {
    assert!(
        size != 0 && addr % PAGE_SIZE == 0 && size % PAGE_SIZE == 0,
        "unaligned page range (addr={addr:#x}, size={size:#x})"
    );
    GuestRange::new(addr, size)
}

impl Memory {
    pub(crate) fn page_flags(&self, page: usize) -> u8 {
        self.pages.load(page)
    }

    /// Maps the pages covering `[addr, addr + size)` with the given
    /// permission flags, making the privileged view read-write and the
    /// public view match the flags, then zeroing the backing.
    ///
    /// Panics on unaligned arguments, flags carrying [`PAGE_ALLOCATED`], any
    /// covered page already being mapped, or a concurrent map of the same
    /// range.
    pub fn page_map(&self, addr: u32, size: u32, flags: u8) {
        let range = page_range(addr, size);
        assert!(
            flags & PAGE_ALLOCATED == 0,
            "mapping flags must not carry the allocated bit (flags={flags:#x})"
        );
        let res = self.res.lock();
        self.page_map_locked(&res, range, flags);
    }

    pub(crate) fn page_map_locked(&self, _res: &ResGuard<'_>, range: GuestRange, flags: u8) {
        for page in range.pages() {
            if self.pages.load(page) != 0 {
                panic!(
                    "memory already mapped (addr={:#x}, size={:#x}, flags={:#x}, current_addr={:#x})",
                    range.start(),
                    range.len(),
                    flags,
                    (page as u32) << PAGE_SHIFT
                );
            }
        }

        let offset = range.start() as usize;
        let len = range.len() as usize;
        self.mapping
            .protect_privileged(offset, len, Protection::ReadWrite)
            .expect("privileged view protection change should not fail");
        self.mapping
            .protect_public(offset, len, protection_for(flags))
            .expect("public view protection change should not fail");

        for page in range.pages() {
            if self.pages.install(page, flags | PAGE_ALLOCATED) != 0 {
                panic!(
                    "concurrent access during page map (addr={:#x}, size={:#x}, current_addr={:#x})",
                    range.start(),
                    range.len(),
                    (page as u32) << PAGE_SHIFT
                );
            }
        }

        // The shared object keeps its contents across unmap (only the
        // protection is reset), so a fresh mapping must be scrubbed.
        self.mapping.fill_at(offset, 0, len);

        tracing::trace!(
            addr = range.start(),
            size = range.len(),
            flags,
            "mapped guest pages"
        );
    }

    /// Unmaps the pages covering `[addr, addr + size)`, breaking any
    /// reservation that overlaps them and resetting both views to no-access.
    ///
    /// Panics on unaligned arguments or any covered page not being mapped.
    pub fn page_unmap(&self, addr: u32, size: u32) {
        let range = page_range(addr, size);
        let res = self.res.lock();
        self.page_unmap_locked(&res, range);
    }

    pub(crate) fn page_unmap_locked(&self, res: &ResGuard<'_>, range: GuestRange) {
        for page in range.pages() {
            if self.pages.load(page) & PAGE_ALLOCATED == 0 {
                panic!(
                    "memory not mapped (addr={:#x}, size={:#x}, current_addr={:#x})",
                    range.start(),
                    range.len(),
                    (page as u32) << PAGE_SHIFT
                );
            }
        }

        for page in range.pages() {
            self.reservation_break_locked(res, (page as u32) << PAGE_SHIFT);
            if self.pages.clear(page) & PAGE_ALLOCATED == 0 {
                panic!(
                    "concurrent access during page unmap (addr={:#x}, size={:#x}, current_addr={:#x})",
                    range.start(),
                    range.len(),
                    (page as u32) << PAGE_SHIFT
                );
            }
        }

        let offset = range.start() as usize;
        let len = range.len() as usize;
        self.mapping
            .protect_public(offset, len, Protection::NoAccess)
            .expect("public view protection change should not fail");
        self.mapping
            .protect_privileged(offset, len, Protection::NoAccess)
            .expect("privileged view protection change should not fail");

        tracing::trace!(addr = range.start(), size = range.len(), "unmapped guest pages");
    }

    /// Transactionally updates the flags of the pages covering
    /// `[addr, addr + size)`.
    ///
    /// Every covered page must satisfy `test` (allocation is tested
    /// implicitly); otherwise no page is modified and `false` is returned.
    /// Bits in `set` are set, bits in `clear` are cleared, and bits in both
    /// toggle. When a page's effective public protection changes, any
    /// reservation on it is broken and the host protection is updated.
    ///
    /// Panics on unaligned arguments.
    pub fn page_protect(&self, addr: u32, size: u32, test: u8, set: u8, clear: u8) -> bool {
        let range = page_range(addr, size);
        let res = self.res.lock();

        let toggle = set & clear;
        let test = test | PAGE_ALLOCATED;
        for page in range.pages() {
            if self.pages.load(page) & test != test {
                return false;
            }
        }

        if set == 0 && clear == 0 {
            // Pure query.
            return true;
        }

        for page in range.pages() {
            let old = self.pages.load(page);
            let new = ((old | (set & !toggle)) & !(clear & !toggle)) ^ toggle;
            if new == old {
                continue;
            }

            let old_protection = protection_for(old);
            let new_protection = protection_for(new);
            if old_protection != new_protection {
                self.reservation_break_locked(&res, (page as u32) << PAGE_SHIFT);
            }
            self.pages.store(page, new);
            if old_protection != new_protection {
                self.mapping
                    .protect_public(
                        ((page as u32) << PAGE_SHIFT) as usize,
                        PAGE_SIZE as usize,
                        new_protection,
                    )
                    .expect("public view protection change should not fail");
            }
        }

        true
    }

    /// Returns whether `[addr, addr + size)` stays within the guest address
    /// space and every covered page is allocated.
    ///
    /// Panics if `size` is zero.
    pub fn check_addr(&self, addr: u32, size: u32) -> bool {
        assert!(size != 0);
        let Ok(range) = GuestRange::try_new(addr, size) else {
            return false;
        };
        for page in range.pages() {
            if self.pages.load(page) & PAGE_ALLOCATED == 0 {
                return false;
            }
        }
        true
    }
}
