// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest memory subsystem for a console emulator: a flat 32-bit guest
//! address space mapped twice onto host memory, with page-granular
//! permission tracking, per-location sub-allocators, a single-slot
//! reservation primitive for emulating atomic read-modify-write across
//! heterogeneous guest CPUs, and address-keyed waiters that let guest
//! threads block on memory writes.
//!
//! The two host views share one anonymous backing object: the *public* view
//! mirrors guest permissions (and is where guest CPUs read and write), while
//! the *privileged* view is read-write for every allocated page so the
//! emulator can bypass guest protections, in particular during a
//! reservation's conditional store while the public view is no-access.
//!
//! The subsystem relies on the host delivering access violations for writes
//! to a protection-downgraded page; the embedder's fault handler routes
//! those to [`Memory::reservation_break`]. There is no per-access software
//! check by design.

#![forbid(unsafe_code)]

mod block;
pub mod cpu;
mod pages;
mod reservation;
mod waiter;

pub use block::Block;
pub use pages::PAGE_ALLOCATED;
pub use pages::PAGE_NO_RESERVATIONS;
pub use pages::PAGE_READABLE;
pub use pages::PAGE_WRITABLE;
pub use reservation::did_break_reservation;
pub use waiter::WaitError;

use dual_mmap::DualMapping;
use pages::PageTable;
use parking_lot::Mutex;
use reservation::ReservationMutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;
use waiter::WaiterList;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// Slot id of the main (or RAM) location in every console layout.
pub const LOC_MAIN: usize = 0;
/// Slot id of the user location.
pub const LOC_USER: usize = 1;
/// Slot id of the video location, where the console has one.
pub const LOC_VIDEO: usize = 2;
/// Slot id of the stack location, where the console has one.
pub const LOC_STACK: usize = 3;

/// Emulated platform, selecting the fixed location table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Console {
    /// PS3-like: main, user, video, stack, and SPU local store (slot 4).
    Ps3,
    /// PSV-like: RAM and user; no video or stack locations.
    Psv,
    /// PSP-like: RAM, user, VRAM, no stack, scratchpad (slot 4) and kernel
    /// (slot 5).
    Psp,
}

impl Console {
    fn layout(self) -> &'static [Option<(u32, u32)>] {
        match self {
            Console::Ps3 => &[
                Some((0x0001_0000, 0x1FFF_0000)), // main
                Some((0x2000_0000, 0x1000_0000)), // user
                Some((0xC000_0000, 0x1000_0000)), // video
                Some((0xD000_0000, 0x1000_0000)), // stack
                Some((0xE000_0000, 0x2000_0000)), // SPU
            ],
            Console::Psv => &[
                Some((0x8100_0000, 0x1000_0000)), // RAM
                Some((0x9100_0000, 0x2F00_0000)), // user
                None,                             // video
                None,                             // stack
            ],
            Console::Psp => &[
                Some((0x0800_0000, 0x0200_0000)), // RAM
                Some((0x0880_0000, 0x0180_0000)), // user
                Some((0x0400_0000, 0x0020_0000)), // VRAM
                None,                             // stack
                Some((0x0001_0000, 0x0000_4000)), // scratchpad
                Some((0x8800_0000, 0x0080_0000)), // kernel
            ],
        }
    }
}

const STATE_RUNNING: u8 = 0;
const STATE_PAUSED: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Cooperative run-state gate shared between the emulator and the memory
/// subsystem. Waits observe `stop`; the background notifier observes both
/// `pause` and `stop`.
pub struct RunState(AtomicU8);

impl RunState {
    /// Returns a new gate in the running state.
    pub fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU8::new(STATE_RUNNING)))
    }

    /// Pauses the emulator.
    pub fn pause(&self) {
        self.0.store(STATE_PAUSED, Ordering::SeqCst);
    }

    /// Resumes the emulator.
    pub fn resume(&self) {
        self.0.store(STATE_RUNNING, Ordering::SeqCst);
    }

    /// Stops the emulator. Pending waits fail with
    /// [`WaitError::Stopped`] and the notifier task exits.
    pub fn stop(&self) {
        self.0.store(STATE_STOPPED, Ordering::SeqCst);
    }

    /// Returns whether the emulator is paused.
    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst) == STATE_PAUSED
    }

    /// Returns whether the emulator has been asked to stop.
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst) == STATE_STOPPED
    }
}

/// Error returned by the validated guest accessors for ranges that are not
/// fully allocated.
#[derive(Debug, Error)]
#[error("access to unallocated guest memory (addr={addr:#x}, size={size:#x})")]
pub struct AccessError {
    addr: u32,
    size: usize,
}

/// The guest memory subsystem. One instance per emulated machine.
pub struct Memory {
    pub(crate) mapping: DualMapping,
    pub(crate) pages: PageTable,
    pub(crate) res: ReservationMutex,
    pub(crate) waiters: WaiterList,
    /// Location registry. Guarded by the reservation mutex; the inner mutex
    /// only satisfies aliasing.
    pub(crate) locations: Mutex<Vec<Option<Arc<Block>>>>,
    run_state: Arc<RunState>,
}

impl Memory {
    /// Maps the guest address space and registers the fixed location table
    /// of `console`.
    pub fn new(console: Console, run_state: Arc<RunState>) -> io::Result<Arc<Self>> {
        let mapping = DualMapping::new(1_usize << 32)?;
        let vm = Arc::new(Self {
            mapping,
            pages: PageTable::new(),
            res: ReservationMutex::new(),
            waiters: WaiterList::new(),
            locations: Mutex::new(Vec::new()),
            run_state,
        });

        let mut locations = vm.locations.lock();
        for entry in console.layout() {
            locations.push(entry.map(|(addr, size)| {
                Arc::new(Block::new(Arc::downgrade(&vm), addr, size, 0))
            }));
        }
        drop(locations);

        tracing::debug!(?console, "guest memory initialized");
        Ok(vm)
    }

    /// The emulator run-state gate this instance observes.
    pub fn run_state(&self) -> &Arc<RunState> {
        &self.run_state
    }

    /// Starts the background notifier: a detached task that periodically
    /// sweeps the waiter list to catch predicates whose state changed
    /// without a notification, until the emulator stops or the instance is
    /// dropped.
    pub fn start(self: &Arc<Self>) {
        let vm = Arc::downgrade(self);
        let run_state = self.run_state.clone();
        std::thread::Builder::new()
            .name("vmem notifier".into())
            .spawn(move || {
                tracing::debug!("guest memory notifier started");
                let mut satisfied = true;
                while !run_state.is_stopped() {
                    let Some(vm) = vm.upgrade() else { break };
                    loop {
                        let all = vm.notify_all();
                        if !all && satisfied {
                            // A full sweep left a waiter unsatisfied: some
                            // state changed without a notification.
                            tracing::warn!("waiter sweep left unsatisfied waiters");
                        }
                        satisfied = all;
                        if all || run_state.is_paused() {
                            break;
                        }
                        std::thread::yield_now();
                    }
                    drop(vm);
                    std::thread::sleep(Duration::from_millis(1));
                }
                tracing::debug!("guest memory notifier stopped");
            })
            .expect("failed to spawn the notifier thread");
    }

    /// Pointer into the public view at guest address `addr`. Accesses
    /// through it observe guest page permissions.
    pub fn public_ptr(&self, addr: u32) -> *mut u8 {
        self.mapping.public_ptr(addr as usize)
    }

    /// Pointer into the privileged view at guest address `addr`. Accesses
    /// through it bypass guest page permissions but still require the page
    /// to be allocated.
    pub fn privileged_ptr(&self, addr: u32) -> *mut u8 {
        self.mapping.privileged_ptr(addr as usize)
    }

    fn validated_size(&self, addr: u32, size: usize) -> Result<(), AccessError> {
        if u32::try_from(size)
            .is_ok_and(|size| self.check_addr(addr, size))
        {
            Ok(())
        } else {
            Err(AccessError { addr, size })
        }
    }

    /// Reads `data.len()` bytes at `addr` through the privileged view,
    /// failing if the range is not fully allocated.
    pub fn read_bytes(&self, addr: u32, data: &mut [u8]) -> Result<(), AccessError> {
        if data.is_empty() {
            return Ok(());
        }
        self.validated_size(addr, data.len())?;
        self.mapping.read_at(addr as usize, data);
        Ok(())
    }

    /// Writes `data` at `addr` through the privileged view, failing if the
    /// range is not fully allocated.
    pub fn write_bytes(&self, addr: u32, data: &[u8]) -> Result<(), AccessError> {
        if data.is_empty() {
            return Ok(());
        }
        self.validated_size(addr, data.len())?;
        self.mapping.write_at(addr as usize, data);
        Ok(())
    }

    /// Reads a `T` at `addr` through the privileged view, failing if the
    /// range is not fully allocated.
    pub fn read_plain<T: FromBytes + IntoBytes>(&self, addr: u32) -> Result<T, AccessError> {
        self.validated_size(addr, size_of::<T>())?;
        Ok(self.mapping.read_plain(addr as usize))
    }

    /// Writes `value` at `addr` through the privileged view, failing if the
    /// range is not fully allocated.
    pub fn write_plain<T: IntoBytes + Immutable>(
        &self,
        addr: u32,
        value: &T,
    ) -> Result<(), AccessError> {
        self.write_bytes(addr, value.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use crate::Console;
    use crate::LOC_MAIN;
    use crate::LOC_STACK;
    use crate::LOC_USER;
    use crate::Memory;
    use crate::RunState;
    use crate::cpu::GuestCpu;
    use std::time::Duration;

    #[test]
    fn test_console_layouts() {
        let vm = Memory::new(Console::Ps3, RunState::new()).unwrap();
        assert_eq!(vm.get(Some(LOC_MAIN), 0).unwrap().addr(), 0x0001_0000);
        assert_eq!(vm.get(Some(LOC_STACK), 0).unwrap().addr(), 0xD000_0000);
        assert_eq!(vm.get(Some(4), 0).unwrap().addr(), 0xE000_0000);

        let vm = Memory::new(Console::Psv, RunState::new()).unwrap();
        assert_eq!(vm.get(Some(LOC_MAIN), 0).unwrap().addr(), 0x8100_0000);
        // PSV has no video or stack locations.
        assert!(vm.get(Some(2), 0).is_none());
        assert!(vm.get(Some(LOC_STACK), 0).is_none());

        let vm = Memory::new(Console::Psp, RunState::new()).unwrap();
        assert_eq!(vm.get(Some(5), 0).unwrap().addr(), 0x8800_0000);
        assert!(vm.get(Some(LOC_STACK), 0).is_none());
    }

    #[test]
    fn test_accessors_validate_allocation() {
        let vm = Memory::new(Console::Ps3, RunState::new()).unwrap();

        assert!(vm.read_plain::<u32>(0x1_0000).is_err());
        let addr = vm.alloc(0x1000, LOC_MAIN, 0x1000).unwrap();
        vm.write_plain(addr, &0xdead_beefu32).unwrap();
        assert_eq!(vm.read_plain::<u32>(addr).unwrap(), 0xdead_beef);

        // A buffer straddling the end of the allocation is refused.
        let mut buf = [0; 8];
        assert!(vm.read_bytes(addr + 0x1000 - 4, &mut buf).is_err());

        vm.dealloc(addr, None);
        assert!(vm.read_plain::<u32>(addr).is_err());
    }

    #[test]
    fn test_fresh_allocation_is_zeroed() {
        let vm = Memory::new(Console::Ps3, RunState::new()).unwrap();

        let addr = vm.alloc(0x1000, LOC_MAIN, 0x1000).unwrap();
        vm.write_plain(addr, &!0u64).unwrap();
        vm.dealloc(addr, None);

        // The same range comes back scrubbed.
        assert_eq!(vm.alloc(0x1000, LOC_MAIN, 0x1000), Some(addr));
        assert_eq!(vm.read_plain::<u64>(addr).unwrap(), 0);
    }

    #[test]
    fn test_notifier_catches_out_of_band_write() {
        let run_state = RunState::new();
        let vm = Memory::new(Console::Ps3, run_state.clone()).unwrap();
        vm.start();

        let addr = vm.falloc(0x4_0000, 0x1000, None).unwrap();
        let waiter = std::thread::spawn({
            let vm = vm.clone();
            move || {
                let pred_vm = vm.clone();
                vm.wait_until(addr, 4, move || {
                    Ok(pred_vm.read_plain::<u32>(addr)? == 0x1234)
                })
            }
        });

        // Write without going through the reservation path: no direct
        // notification, so only the background sweep can wake the waiter.
        std::thread::sleep(Duration::from_millis(5));
        vm.write_plain(addr, &0x1234u32).unwrap();

        waiter.join().unwrap().unwrap();
        run_state.stop();
    }

    #[test]
    fn test_ll_sc_loop_with_stack_adapter() {
        // A PPU-flavored end-to-end pass: reserve stack space, then run an
        // LL/SC-style increment loop on an allocated word.
        let vm = Memory::new(Console::Ps3, RunState::new()).unwrap();

        let stack_top = 0xD000_0000u32 + 0x1_0000;
        vm.falloc(0xD000_0000, 0x1_0000, Some(LOC_STACK)).unwrap();
        let mut sp = stack_top as u64;
        let mut cpu = GuestCpu::Ppu {
            sp: &mut sp,
            stack_base: 0xD000_0000,
        };
        let (frame, old_sp) = cpu.stack_push(0x80, 16).unwrap();
        vm.write_plain(frame, &0u64).unwrap();

        let word = vm.alloc(0x1000, LOC_USER, 0x1000).unwrap();
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let vm = vm.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        loop {
                            let mut data = [0; 4];
                            vm.reservation_acquire(&mut data, word, 4);
                            let value = u32::from_ne_bytes(data) + 1;
                            if vm.reservation_update(word, &value.to_ne_bytes(), 4) {
                                break;
                            }
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(vm.read_plain::<u32>(word).unwrap(), 400);

        cpu.stack_pop(frame, old_sp).unwrap();
        assert_eq!(sp, stack_top as u64);
    }
}
