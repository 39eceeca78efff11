// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The reservation engine: a single process-wide load-linked /
//! store-conditional token used to emulate guest atomic read-modify-write
//! instructions.
//!
//! While a reservation is held, the public view of its page is downgraded to
//! read-only, so a foreign write takes a host access violation. The
//! emulator's fault handler is expected to route such faults to
//! [`Memory::reservation_break`] and re-run the faulting instruction; the
//! engine itself performs no per-access checks.
//!
//! The reservation mutex below also serializes page-table mutations, block
//! (de)allocation and the location registry, and is therefore the root of
//! the subsystem's lock order. It must never be held across an access to
//! guest memory through the public view.

use crate::Memory;
use crate::pages::PAGE_ALLOCATED;
use crate::pages::PAGE_NO_RESERVATIONS;
use crate::pages::PAGE_WRITABLE;
use crate::waiter::thread_ctl_addr;
use dual_mmap::Protection;
use guest_range::AlignedWindow;
use guest_range::PAGE_SHIFT;
use guest_range::PAGE_SIZE;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::atomic::fence;
use std::time::Duration;

thread_local! {
    static DID_BREAK: Cell<bool> = const { Cell::new(false) };
}

/// Returns whether the last reservation primitive executed on this thread
/// broke a pre-existing reservation.
pub fn did_break_reservation() -> bool {
    DID_BREAK.with(Cell::get)
}

fn set_did_break(value: bool) {
    DID_BREAK.with(|flag| flag.set(value));
}

/// The reservation slot. All fields are written only under the reservation
/// mutex; `owner` is additionally readable without the lock for the cheap
/// ownership probe in [`Memory::reservation_test`].
pub(crate) struct ResState {
    owner: AtomicUsize,
    addr: AtomicU32,
    size: AtomicU32,
}

impl ResState {
    /// The owning thread's control handle address, or 0 when no reservation
    /// is active.
    pub fn owner(&self) -> usize {
        self.owner.load(Ordering::SeqCst)
    }

    pub fn addr(&self) -> u32 {
        self.addr.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> u32 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn set(&self, owner: usize, addr: u32, size: u32) {
        self.owner.store(owner, Ordering::SeqCst);
        self.addr.store(addr, Ordering::SeqCst);
        self.size.store(size, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.set(0, 0, 0);
    }
}

/// Non-reentrant polled mutex guarding the reservation slot.
///
/// Contended acquisition polls: each failed attempt waits on a condition
/// variable for up to one millisecond and retries the compare-and-swap.
/// Re-acquisition by the current owner is a programming error (typically a
/// [`Memory::reservation_op`] effect re-entering the engine) and panics
/// rather than silently deadlocking.
pub(crate) struct ReservationMutex {
    lock_owner: AtomicUsize,
    contended: AtomicBool,
    sleep: Mutex<()>,
    cond: Condvar,
    state: ResState,
}

impl ReservationMutex {
    pub fn new() -> Self {
        Self {
            lock_owner: AtomicUsize::new(0),
            contended: AtomicBool::new(false),
            sleep: Mutex::new(()),
            cond: Condvar::new(),
            state: ResState {
                owner: AtomicUsize::new(0),
                addr: AtomicU32::new(0),
                size: AtomicU32::new(0),
            },
        }
    }

    /// The reservation owner, readable without holding the lock.
    pub fn res_owner_unlocked(&self) -> usize {
        self.state.owner()
    }

    #[track_caller]
    pub fn lock(&self) -> ResGuard<'_> {
        let me = thread_ctl_addr();
        let mut sleep = None;
        while self
            .lock_owner
            .compare_exchange(0, me, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            if self.lock_owner.load(Ordering::SeqCst) == me {
                panic!("deadlock: reservation mutex re-entered by its owner");
            }
            match &mut sleep {
                None => sleep = Some(self.sleep.lock()),
                Some(guard) => {
                    let _ = self.cond.wait_for(guard, Duration::from_millis(1));
                }
            }
            self.contended.store(true, Ordering::Relaxed);
        }
        ResGuard { lock: self }
    }

    fn unlock(&self) {
        let me = thread_ctl_addr();
        if self
            .lock_owner
            .compare_exchange(me, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            panic!("reservation mutex released by a non-owner thread");
        }
        if self.contended.load(Ordering::Relaxed) {
            self.cond.notify_one();
        }
    }
}

/// Scoped ownership of the reservation mutex, dereferencing to the
/// reservation slot.
pub(crate) struct ResGuard<'a> {
    lock: &'a ReservationMutex,
}

impl std::ops::Deref for ResGuard<'_> {
    type Target = ResState;

    fn deref(&self) -> &ResState {
        &self.lock.state
    }
}

impl Drop for ResGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Validates a reservation window argument pair.
#[track_caller]
fn reservation_window(addr: u32, size: u32) -> AlignedWindow {
    AlignedWindow::try_new(addr, size)
        .unwrap_or_else(|err| panic!("invalid reservation arguments: {err}"))
}

impl Memory {
    /// Restores the reserved page to read-write and clears the reservation,
    /// if one exists on the same page as `addr`. Returns whether it did.
    ///
    /// Callers notify the waiters for the formerly reserved range themselves,
    /// after releasing the mutex, where notification is wanted.
    pub(crate) fn reservation_break_locked(&self, res: &ResGuard<'_>, addr: u32) -> bool {
        if res.owner() != 0 && res.addr() >> PAGE_SHIFT == addr >> PAGE_SHIFT {
            let page_addr = addr & !(PAGE_SIZE - 1);
            self.mapping
                .protect_public(page_addr as usize, PAGE_SIZE as usize, Protection::ReadWrite)
                .expect("public view protection change should not fail");
            res.clear();
            tracing::trace!(addr, "reservation broken");
            true
        } else {
            false
        }
    }

    /// Validates the window's page flags. Must run under the reservation
    /// mutex so the verdict cannot be invalidated by a concurrent unmap or
    /// protection change before the reservation is recorded.
    fn check_reservation_page(&self, _res: &ResGuard<'_>, window: &AlignedWindow) {
        let flags = self.page_flags(window.page());
        if flags & PAGE_WRITABLE == 0
            || flags & PAGE_ALLOCATED == 0
            || flags & PAGE_NO_RESERVATIONS != 0
        {
            panic!("invalid page flags for reservation ({window}, flags={flags:#x})");
        }
    }

    /// Acquires the process-wide reservation on `(addr, size)`, breaking any
    /// existing one, and snapshots the window's current contents into `dst`.
    ///
    /// The public view of the page is downgraded to read-only for the
    /// lifetime of the reservation so that foreign writes fault.
    ///
    /// Panics unless `(addr, size)` is a valid power-of-two window, `dst` is
    /// `size` bytes, and the page is allocated, writable and accepts
    /// reservations.
    pub fn reservation_acquire(&self, dst: &mut [u8], addr: u32, size: u32) {
        let window = reservation_window(addr, size);
        assert_eq!(dst.len(), size as usize, "destination size mismatch");

        let res = self.res.lock();
        self.check_reservation_page(&res, &window);

        set_did_break(res.owner() != 0 && self.reservation_break_locked(&res, res.addr()));

        let page_addr = (addr & !(PAGE_SIZE - 1)) as usize;
        self.mapping
            .protect_public(page_addr, PAGE_SIZE as usize, Protection::Read)
            .expect("public view protection change should not fail");

        res.set(thread_ctl_addr(), addr, size);

        // Order the protection downgrade and the slot update before the
        // snapshot, so a racing fault-driven break observes a consistent
        // reservation.
        fence(Ordering::SeqCst);

        self.mapping.read_public_at(addr as usize, dst);
    }

    /// Conditionally stores `src` to `(addr, size)`: succeeds only if this
    /// thread still holds the reservation on exactly that window.
    ///
    /// On success the write goes through the privileged view while the
    /// public view is no-access, so a foreign reader never observes a torn
    /// value; the reservation is then released and overlapping waiters are
    /// notified. Returns `false` (and changes nothing) if the reservation
    /// was lost or never owned, letting the guest retry its LL/SC loop.
    ///
    /// Panics unless `(addr, size)` is a valid power-of-two window and `src`
    /// is `size` bytes.
    pub fn reservation_update(&self, addr: u32, src: &[u8], size: u32) -> bool {
        let _window = reservation_window(addr, size);
        assert_eq!(src.len(), size as usize, "source size mismatch");

        let res = self.res.lock();

        if res.owner() != thread_ctl_addr() || res.addr() != addr || res.size() != size {
            return false;
        }

        let page_addr = (addr & !(PAGE_SIZE - 1)) as usize;
        self.mapping
            .protect_public(page_addr, PAGE_SIZE as usize, Protection::NoAccess)
            .expect("public view protection change should not fail");

        self.mapping.write_at(addr as usize, src);

        self.reservation_break_locked(&res, addr);
        drop(res);

        self.waiters.notify_at(addr, size);
        true
    }

    /// Runs `proc` as an unconditional atomic operation on `(addr, size)`:
    /// takes ownership of the reservation (breaking any other), makes the
    /// public view of the page no-access, runs the effect, then releases and
    /// notifies overlapping waiters.
    ///
    /// `proc` must access the window through the privileged accessors and
    /// must not call back into the reservation engine; re-entry trips the
    /// mutex's deadlock detection.
    ///
    /// Panics unless `(addr, size)` is a valid power-of-two window on an
    /// allocated, writable, reservable page.
    pub fn reservation_op(&self, addr: u32, size: u32, proc: impl FnOnce()) {
        let window = reservation_window(addr, size);

        let res = self.res.lock();
        self.check_reservation_page(&res, &window);
        let me = thread_ctl_addr();

        set_did_break(false);
        if res.owner() != me || res.addr() != addr || res.size() != size {
            if res.owner() != 0 {
                self.reservation_break_locked(&res, res.addr());
            }
            set_did_break(true);
        }

        let page_addr = (addr & !(PAGE_SIZE - 1)) as usize;
        self.mapping
            .protect_public(page_addr, PAGE_SIZE as usize, Protection::NoAccess)
            .expect("public view protection change should not fail");

        res.set(me, addr, size);
        fence(Ordering::SeqCst);

        proc();

        self.reservation_break_locked(&res, addr);
        drop(res);

        self.waiters.notify_at(addr, size);
    }

    /// Breaks the reservation covering the page of `addr`, if any, and
    /// notifies the waiters for the formerly reserved range.
    ///
    /// This is the entry point the host fault handler uses when a foreign
    /// write trips the read-only reservation page.
    pub fn reservation_break(&self, addr: u32) {
        let res = self.res.lock();
        let raddr = res.addr();
        let rsize = res.size();
        let broke = self.reservation_break_locked(&res, addr);
        set_did_break(broke);
        drop(res);

        if broke {
            self.waiters.notify_at(raddr, rsize);
        }
    }

    /// Inspects the reservation against an access to `[addr, addr + size)`.
    ///
    /// If a write overlaps the reserved page, `callback` decides whether the
    /// access is proceeding; if it is and the byte ranges truly intersect,
    /// the reservation is broken and its waiters notified. Returns the
    /// callback's verdict, or `true` when no reservation concerns arose
    /// (including when `addr` is not an allocated address — the return value
    /// is not a liveness signal).
    pub fn reservation_query(
        &self,
        addr: u32,
        size: u32,
        is_writing: bool,
        callback: impl FnOnce() -> bool,
    ) -> bool {
        let res = self.res.lock();

        if !self.check_addr(addr, 1) {
            return true;
        }

        if !is_writing || res.owner() == 0 || res.addr() >> PAGE_SHIFT != addr >> PAGE_SHIFT {
            return true;
        }

        let result = callback();
        if result && size != 0 {
            let raddr = res.addr();
            let rsize = res.size();
            let overlaps = addr as u64 + size as u64 - 1 >= raddr as u64
                && raddr as u64 + rsize as u64 - 1 >= addr as u64;
            if overlaps {
                let broke = self.reservation_break_locked(&res, addr);
                set_did_break(broke);
                if broke {
                    drop(res);
                    self.waiters.notify_at(raddr, rsize);
                }
            }
        }
        result
    }

    /// Returns whether the current thread holds the reservation.
    pub fn reservation_test(&self) -> bool {
        let owner = self.res.res_owner_unlocked();
        owner != 0 && owner == thread_ctl_addr()
    }

    /// Releases the reservation if the current thread holds it.
    pub fn reservation_free(&self) {
        if !self.reservation_test() {
            return;
        }
        let res = self.res.lock();
        if res.owner() == thread_ctl_addr() {
            let addr = res.addr();
            set_did_break(self.reservation_break_locked(&res, addr));
        }
    }
}
