// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Address-keyed waiters: guest threads blocking until a predicate tied to a
//! memory window becomes true.
//!
//! Waiter records live in a fixed table keyed by `(addr, mask)` windows.
//! Writes that go through the reservation engine notify overlapping waiters
//! directly; a background sweep (see [`Memory::start`](crate::Memory::start))
//! catches predicates whose state changed outside that path.
//!
//! Lock order: the waiter-list mutex is taken before any per-thread mutex,
//! and never while the reservation mutex is held by the same call path
//! without having released it first. A waking thread releases its per-thread
//! mutex before touching the list mutex.

use crate::Memory;
use guest_range::AlignedWindow;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Capacity of the waiter table, sized for the guest thread count.
/// Exhaustion is an engineering error, not a recoverable state.
pub(crate) const WAITER_CAP: usize = 1024;

/// Error surfaced by [`Memory::wait_until`].
#[derive(Debug, Error)]
pub enum WaitError {
    /// The emulator was asked to stop while the thread was waiting.
    #[error("emulator stopped while waiting on guest memory")]
    Stopped,
    /// The wait predicate failed.
    #[error("wait predicate failed")]
    Predicate(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub(crate) type WaitPredicate =
    Box<dyn FnMut() -> Result<bool, Box<dyn std::error::Error + Send + Sync>> + Send>;

/// Per-thread wait record, shared between the owning thread and notifiers.
pub(crate) struct ThreadCtl {
    state: Mutex<WaitState>,
    cond: Condvar,
}

#[derive(Default)]
pub(crate) struct WaitState {
    /// The active predicate. `None` means the record was claimed (or never
    /// armed); no further notifications apply.
    pred: Option<WaitPredicate>,
    /// The verdict a notifier delivered when it claimed the record.
    outcome: Option<Result<(), WaitError>>,
}

thread_local! {
    static THREAD_CTL: Arc<ThreadCtl> = Arc::new(ThreadCtl {
        state: Mutex::new(WaitState::default()),
        cond: Condvar::new(),
    });
}

pub(crate) fn thread_ctl() -> Arc<ThreadCtl> {
    THREAD_CTL.with(|ctl| ctl.clone())
}

/// A stable opaque identity for the current thread, used for lock and
/// reservation ownership tracking.
pub(crate) fn thread_ctl_addr() -> usize {
    THREAD_CTL.with(|ctl| Arc::as_ptr(ctl) as usize)
}

struct Slot {
    thread: Option<Arc<ThreadCtl>>,
    addr: u32,
    mask: u32,
}

impl Slot {
    const EMPTY: Self = Self {
        thread: None,
        addr: 0,
        mask: !0,
    };
}

struct Slots {
    entries: Vec<Slot>,
    /// One past the highest occupied slot.
    max_used: usize,
    /// Lowest slot known to be free; where the next search starts.
    nil_hint: usize,
}

pub(crate) struct WaiterList {
    slots: Mutex<Slots>,
}

impl WaiterList {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                entries: (0..WAITER_CAP).map(|_| Slot::EMPTY).collect(),
                max_used: 0,
                nil_hint: 0,
            }),
        }
    }

    /// Arms the current thread's record with `pred` and publishes it in the
    /// table under `window`. Returns the slot index for deregistration.
    pub fn add(&self, thread: &Arc<ThreadCtl>, window: AlignedWindow, pred: WaitPredicate) -> usize {
        let mut slots = self.slots.lock();

        {
            let mut state = thread.state.lock();
            state.pred = Some(pred);
            state.outcome = None;
        }

        let slots = &mut *slots;
        let index = loop {
            if slots.nil_hint < slots.max_used {
                let index = slots.nil_hint;
                slots.nil_hint += 1;
                if slots.entries[index].thread.is_none() {
                    break index;
                }
            } else {
                assert!(
                    slots.max_used < WAITER_CAP,
                    "waiter table exhausted ({WAITER_CAP})"
                );
                let index = slots.max_used;
                slots.max_used += 1;
                slots.nil_hint = slots.max_used;
                break index;
            }
        };

        slots.entries[index] = Slot {
            thread: Some(thread.clone()),
            addr: window.addr(),
            mask: window.mask(),
        };
        tracing::trace!(addr = window.addr(), size = window.size(), index, "waiter armed");
        index
    }

    /// Frees the slot at `index` and pulls the compaction indices back.
    pub fn remove(&self, index: usize) {
        let mut slots = self.slots.lock();
        slots.entries[index] = Slot::EMPTY;
        slots.nil_hint = slots.nil_hint.min(index);
        while slots.max_used > 0 && slots.entries[slots.max_used - 1].thread.is_none() {
            slots.max_used -= 1;
        }
    }

    /// Notifies every waiter whose window overlaps the event window
    /// `(addr, size)`.
    pub fn notify_at(&self, addr: u32, size: u32) {
        debug_assert!(size.is_power_of_two() && size <= 4096 && addr & (size - 1) == 0);
        let mask = !(size - 1);

        let mut slots = self.slots.lock();
        let slots = &mut *slots;
        for slot in &mut slots.entries[..slots.max_used] {
            // Two aligned power-of-two windows overlap when their addresses
            // agree on the prefix both masks select.
            if slot.thread.is_some() && (slot.addr ^ addr) & (mask & slot.mask) == 0 {
                try_notify(slot);
            }
        }
    }

    /// Sweeps every armed waiter. Returns whether all of them were
    /// satisfied.
    pub fn notify_all(&self) -> bool {
        let mut slots = self.slots.lock();
        let slots = &mut *slots;

        let mut waiters = 0;
        let mut signaled = 0;
        for slot in &mut slots.entries[..slots.max_used] {
            if slot.thread.is_some() && slot.addr != 0 {
                waiters += 1;
                if try_notify(slot) {
                    signaled += 1;
                }
            }
        }
        waiters == signaled
    }
}

/// Evaluates the waiter's predicate under its per-thread mutex; on success
/// or predicate failure, claims the record, disarms the slot so no further
/// notifications match, and signals the thread.
fn try_notify(slot: &mut Slot) -> bool {
    let Some(thread) = slot.thread.clone() else {
        return false;
    };
    let mut state = thread.state.lock();

    let outcome = match &mut state.pred {
        // Already claimed.
        None => return false,
        Some(pred) => match pred() {
            Ok(false) => return false,
            Ok(true) => Ok(()),
            // Deliver the failure to the waiting thread instead of
            // unwinding the notifier.
            Err(err) => Err(WaitError::Predicate(err)),
        },
    };

    state.pred = None;
    state.outcome = Some(outcome);
    slot.addr = 0;
    slot.mask = !0;
    thread.cond.notify_one();
    true
}

/// Deregisters the waiter on scope exit, releasing the per-thread record
/// before taking the list mutex.
struct WaitSlotGuard<'a> {
    list: &'a WaiterList,
    thread: &'a ThreadCtl,
    index: usize,
}

impl Drop for WaitSlotGuard<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.thread.state.lock();
            state.pred = None;
            state.outcome = None;
        }
        self.list.remove(self.index);
    }
}

impl Memory {
    /// Blocks the current thread until `pred` returns true for the guest
    /// window `(addr, size)`.
    ///
    /// The predicate is evaluated by this thread and by threads whose writes
    /// overlap the window; it must be cheap, must not panic, and must not
    /// call back into the reservation engine. A predicate error is surfaced
    /// as [`WaitError::Predicate`] on this thread, whichever thread observed
    /// it. Stopping the emulator interrupts the wait with
    /// [`WaitError::Stopped`].
    ///
    /// Panics unless `(addr, size)` is a valid power-of-two window.
    pub fn wait_until(
        &self,
        addr: u32,
        size: u32,
        pred: impl FnMut() -> Result<bool, Box<dyn std::error::Error + Send + Sync>>
        + Send
        + 'static,
    ) -> Result<(), WaitError> {
        let window = AlignedWindow::try_new(addr, size)
            .unwrap_or_else(|err| panic!("invalid wait arguments: {err}"));

        let thread = thread_ctl();
        let index = self.waiters.add(&thread, window, Box::new(pred));
        let _slot = WaitSlotGuard {
            list: &self.waiters,
            thread: &thread,
            index,
        };

        // Dropped before `_slot`, keeping the per-thread mutex out of the
        // deregistration path.
        let mut state = thread.state.lock();
        loop {
            match &mut state.pred {
                // A notifier claimed the record; its verdict is ours.
                None => return state.outcome.take().unwrap_or(Ok(())),
                Some(pred) => match pred() {
                    Ok(true) => {
                        state.pred = None;
                        return Ok(());
                    }
                    Ok(false) => {}
                    Err(err) => {
                        state.pred = None;
                        return Err(WaitError::Predicate(err));
                    }
                },
            }

            if self.run_state().is_stopped() {
                state.pred = None;
                return Err(WaitError::Stopped);
            }

            let _ = thread.cond.wait_for(&mut state, Duration::from_millis(1));
        }
    }

    /// Notifies every waiter whose window overlaps `(addr, size)`.
    ///
    /// Panics unless `(addr, size)` is a valid power-of-two window.
    pub fn notify_at(&self, addr: u32, size: u32) {
        let window = AlignedWindow::try_new(addr, size)
            .unwrap_or_else(|err| panic!("invalid notify arguments: {err}"));
        self.waiters.notify_at(window.addr(), window.size());
    }

    /// Sweeps every armed waiter, evaluating its predicate. Returns whether
    /// all of them were satisfied.
    pub fn notify_all(&self) -> bool {
        self.waiters.notify_all()
    }
}

#[cfg(test)]
mod tests {
    use super::Slot;
    use super::ThreadCtl;
    use super::WaiterList;
    use super::thread_ctl;
    use crate::Console;
    use crate::Memory;
    use crate::RunState;
    use crate::WaitError;
    use crate::pages::PAGE_READABLE;
    use crate::pages::PAGE_WRITABLE;
    use guest_range::AlignedWindow;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::Duration;

    fn mem_with_page(addr: u32) -> Arc<Memory> {
        let vm = Memory::new(Console::Ps3, RunState::new()).unwrap();
        vm.page_map(addr & !0xfff, 0x1000, PAGE_READABLE | PAGE_WRITABLE);
        vm
    }

    #[test]
    fn test_wait_woken_by_reservation_op() {
        let vm = mem_with_page(0x4_0000);

        let (send, recv) = mpsc::channel();
        let waiter = std::thread::spawn({
            let vm = vm.clone();
            move || {
                let pred_vm = vm.clone();
                send.send(()).unwrap();
                vm.wait_until(0x4_0000, 16, move || {
                    Ok(pred_vm.read_plain::<u32>(0x4_0000)? == 0x42)
                })
            }
        });
        recv.recv().unwrap();

        // A non-overlapping write does not satisfy the waiter.
        let vm2 = vm.clone();
        vm.reservation_op(0x4_0100, 16, move || {
            vm2.mapping.write_plain(0x4_0100, &0x42u32);
        });
        assert!(!waiter.is_finished());

        let vm2 = vm.clone();
        vm.reservation_op(0x4_0000, 16, move || {
            vm2.mapping.write_plain(0x4_0000, &0x42u32);
        });
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_wait_immediate_success() {
        let vm = mem_with_page(0x4_0000);
        vm.write_plain(0x4_0000, &1u32).unwrap();

        let pred_vm = vm.clone();
        vm.wait_until(0x4_0000, 4, move || {
            Ok(pred_vm.read_plain::<u32>(0x4_0000)? == 1)
        })
        .unwrap();
    }

    #[test]
    fn test_wait_predicate_error() {
        let vm = mem_with_page(0x4_0000);

        let err = vm
            .wait_until(0x4_0000, 4, || Err("predicate exploded".into()))
            .unwrap_err();
        assert!(matches!(err, WaitError::Predicate(_)));
    }

    #[test]
    fn test_predicate_error_from_notifier_thread() {
        let vm = mem_with_page(0x4_0000);

        let waiter = std::thread::spawn({
            let vm = vm.clone();
            move || {
                let mut polls = 0;
                vm.wait_until(0x4_0000, 4, move || {
                    // Survive the initial evaluation, then fail on whichever
                    // thread polls the predicate next.
                    polls += 1;
                    if polls > 1 {
                        Err("stale state".into())
                    } else {
                        Ok(false)
                    }
                })
            }
        });

        // Drive notifications until the waiter has been claimed.
        while !waiter.is_finished() {
            vm.notify_at(0x4_0000, 4);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(
            waiter.join().unwrap(),
            Err(WaitError::Predicate(_))
        ));
    }

    #[test]
    fn test_wait_interrupted_by_stop() {
        let run_state = RunState::new();
        let vm = Memory::new(Console::Ps3, run_state.clone()).unwrap();
        vm.page_map(0x4_0000, 0x1000, PAGE_READABLE | PAGE_WRITABLE);

        let waiter = std::thread::spawn({
            let vm = vm.clone();
            move || vm.wait_until(0x4_0000, 4, || Ok(false))
        });

        std::thread::sleep(Duration::from_millis(10));
        assert!(!waiter.is_finished());
        run_state.stop();
        assert!(matches!(waiter.join().unwrap(), Err(WaitError::Stopped)));
    }

    #[test]
    #[should_panic(expected = "invalid wait arguments")]
    fn test_wait_rejects_unaligned_window() {
        let vm = mem_with_page(0x4_0000);
        let _ = vm.wait_until(0x4_0004, 16, || Ok(true));
    }

    fn dummy_thread() -> Arc<ThreadCtl> {
        thread_ctl()
    }

    #[test]
    fn test_slot_compaction() {
        let list = WaiterList::new();
        let thread = dummy_thread();
        let w = |addr| AlignedWindow::new(addr, 4);

        let a = list.add(&thread, w(0x1000), Box::new(|| Ok(false)));
        let b = list.add(&thread, w(0x2000), Box::new(|| Ok(false)));
        let c = list.add(&thread, w(0x3000), Box::new(|| Ok(false)));
        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(list.slots.lock().max_used, 3);

        // Freeing the middle slot rewinds the search hint; freeing the tail
        // shrinks the used region.
        list.remove(b);
        assert_eq!(list.slots.lock().nil_hint, 1);
        assert_eq!(list.slots.lock().max_used, 3);

        let b2 = list.add(&thread, w(0x2000), Box::new(|| Ok(false)));
        assert_eq!(b2, 1);

        list.remove(c);
        assert_eq!(list.slots.lock().max_used, 2);
        list.remove(b2);
        list.remove(a);
        assert_eq!(list.slots.lock().max_used, 0);
        assert_eq!(list.slots.lock().nil_hint, 0);
    }

    #[test]
    fn test_disarmed_slot_does_not_match() {
        // A claimed slot is parked at addr 0 with a full mask, which the
        // overlap rule can never match for a valid event window.
        let slot = Slot {
            thread: None,
            addr: 0,
            mask: !0,
        };
        for addr in [0x1000u32, 0x4_0000, 0xffff_f000] {
            assert!((slot.addr ^ addr) & (!(16 - 1) & slot.mask) != 0);
        }
    }
}
