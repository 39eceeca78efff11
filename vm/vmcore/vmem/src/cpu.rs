// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Stack-pointer adapters for the guest CPU variants.
//!
//! Each emulated ISA keeps its stack pointer in a different architectural
//! register with different alignment rules and a different floor. This
//! module is the narrow façade the HLE function dispatcher uses to reserve
//! and release guest stack space without knowing those details.

use guest_range::align_up;
use thiserror::Error;

/// Size of the SPU local store; the SPU stack must stay below it.
const SPU_LOCAL_STORE_SIZE: u32 = 0x4_0000;

/// Error produced by the guest stack operations.
///
/// Both conditions are fatal for the calling guest thread; the dispatcher
/// surfaces them to the guest as an exception.
#[derive(Debug, Error)]
pub enum StackError {
    /// The stack pointer would move below the stack floor.
    #[error("guest stack overflow (size={size:#x}, align={align:#x}, sp={sp:#x})")]
    Overflow {
        /// Requested frame size.
        size: u32,
        /// Requested frame alignment.
        align: u32,
        /// Stack pointer before the push.
        sp: u32,
    },
    /// The stack pointer no longer matches the frame being released.
    #[error("guest stack inconsistency (addr={addr:#x}, sp={sp:#x}, old_sp={old_sp:#x})")]
    Inconsistency {
        /// Frame address being released.
        addr: u32,
        /// Current stack pointer.
        sp: u32,
        /// Stack pointer to restore.
        old_sp: u32,
    },
}

/// Borrowed view of the stack-pointer state of one guest CPU.
pub enum GuestCpu<'a> {
    /// PPU-like: 64-bit stack pointer, frames aligned up to 8 bytes, floor
    /// at the thread's stack base.
    Ppu {
        /// GPR1, holding the stack pointer.
        sp: &'a mut u64,
        /// Lowest valid stack address.
        stack_base: u32,
    },
    /// SPU-like: 32-bit stack pointer into local store, frames aligned up to
    /// 16 bytes, floor at the local store size. Effective addresses are
    /// offset by the thread's local-store window.
    Spu {
        /// Preferred word of GPR1, holding the local-store stack pointer.
        sp: &'a mut u32,
        /// Guest address of this SPU's local store.
        local_store_offset: u32,
    },
    /// ARM-like: 32-bit stack pointer, frames aligned up to 4 bytes, floor
    /// at the thread's stack base.
    Arm {
        /// SP register.
        sp: &'a mut u32,
        /// Lowest valid stack address.
        stack_base: u32,
    },
}

impl GuestCpu<'_> {
    /// Reserves `size` bytes on the guest stack, aligning the new stack
    /// pointer down to `align` bytes.
    ///
    /// Returns the guest address of the reserved frame and the previous
    /// stack pointer value, to be passed back to [`GuestCpu::stack_pop`].
    ///
    /// Panics if `align` is not a power of two.
    pub fn stack_push(&mut self, size: u32, align: u32) -> Result<(u32, u32), StackError> {
        assert!(align.is_power_of_two(), "invalid alignment ({align:#x})");
        match self {
            GuestCpu::Ppu { sp, stack_base } => {
                let old_pos = u32::try_from(**sp)
                    .unwrap_or_else(|_| panic!("PPU stack pointer out of range ({:#x})", **sp));
                let new = (old_pos.wrapping_sub(align_up(size, 8))) & !(align - 1);
                if new < *stack_base || new > old_pos {
                    return Err(StackError::Overflow {
                        size,
                        align,
                        sp: old_pos,
                    });
                }
                **sp = new.into();
                Ok((new, old_pos))
            }
            GuestCpu::Spu { sp, local_store_offset } => {
                let old_pos = **sp;
                let new = (old_pos.wrapping_sub(align_up(size, 16))) & !(align - 1);
                if new >= SPU_LOCAL_STORE_SIZE {
                    return Err(StackError::Overflow {
                        size,
                        align,
                        sp: old_pos,
                    });
                }
                **sp = new;
                Ok((new + *local_store_offset, old_pos))
            }
            GuestCpu::Arm { sp, stack_base } => {
                let old_pos = **sp;
                let new = (old_pos.wrapping_sub(align_up(size, 4))) & !(align - 1);
                if new < *stack_base || new > old_pos {
                    return Err(StackError::Overflow {
                        size,
                        align,
                        sp: old_pos,
                    });
                }
                **sp = new;
                Ok((new, old_pos))
            }
        }
    }

    /// Releases the frame at `addr`, restoring the stack pointer saved by
    /// the matching [`GuestCpu::stack_push`].
    ///
    /// Fails if the current stack pointer does not match `addr`, which means
    /// push and pop calls are no longer balanced.
    pub fn stack_pop(&mut self, addr: u32, old_sp: u32) -> Result<(), StackError> {
        match self {
            GuestCpu::Ppu { sp, .. } => {
                if **sp != addr.into() {
                    return Err(StackError::Inconsistency {
                        addr,
                        sp: **sp as u32,
                        old_sp,
                    });
                }
                **sp = old_sp.into();
            }
            GuestCpu::Spu { sp, local_store_offset } => {
                if sp.wrapping_add(*local_store_offset) != addr {
                    return Err(StackError::Inconsistency {
                        addr,
                        sp: **sp,
                        old_sp,
                    });
                }
                **sp = old_sp;
            }
            GuestCpu::Arm { sp, .. } => {
                if **sp != addr {
                    return Err(StackError::Inconsistency {
                        addr,
                        sp: **sp,
                        old_sp,
                    });
                }
                **sp = old_sp;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::GuestCpu;
    use super::StackError;

    #[test]
    fn test_ppu_stack() {
        let mut sp = 0xd001_0000u64;
        let mut cpu = GuestCpu::Ppu {
            sp: &mut sp,
            stack_base: 0xd000_0000,
        };

        let (addr, old) = cpu.stack_push(0x30, 16).unwrap();
        assert_eq!(old, 0xd001_0000);
        assert_eq!(addr, 0xd000_ffd0);

        // Unbalanced release is caught.
        assert!(matches!(
            cpu.stack_pop(0xd000_ffc0, old),
            Err(StackError::Inconsistency { .. })
        ));

        cpu.stack_pop(addr, old).unwrap();
        assert_eq!(sp, 0xd001_0000);
    }

    #[test]
    fn test_ppu_stack_overflow() {
        let mut sp = 0xd000_0040u64;
        let mut cpu = GuestCpu::Ppu {
            sp: &mut sp,
            stack_base: 0xd000_0000,
        };
        assert!(matches!(
            cpu.stack_push(0x100, 8),
            Err(StackError::Overflow { .. })
        ));
        // A failed push leaves the stack pointer alone.
        assert_eq!(sp, 0xd000_0040);
    }

    #[test]
    fn test_spu_stack() {
        let mut sp = 0x3_fff0u32;
        let mut cpu = GuestCpu::Spu {
            sp: &mut sp,
            local_store_offset: 0xe010_0000,
        };

        let (addr, old) = cpu.stack_push(0x20, 16).unwrap();
        assert_eq!(old, 0x3_fff0);
        assert_eq!(addr, 0xe010_0000 + 0x3_ffd0);

        cpu.stack_pop(addr, old).unwrap();
        assert_eq!(sp, 0x3_fff0);
    }

    #[test]
    fn test_spu_stack_underflow_wraps() {
        let mut sp = 0x10u32;
        let mut cpu = GuestCpu::Spu {
            sp: &mut sp,
            local_store_offset: 0,
        };
        // Pushing past zero wraps above the local store size and is caught.
        assert!(matches!(
            cpu.stack_push(0x100, 16),
            Err(StackError::Overflow { .. })
        ));
    }

    #[test]
    fn test_arm_stack() {
        let mut sp = 0x8110_0000u32;
        let mut cpu = GuestCpu::Arm {
            sp: &mut sp,
            stack_base: 0x8100_0000,
        };

        let (addr, old) = cpu.stack_push(0x11, 8).unwrap();
        // Size is aligned up to 4, then the stack pointer is aligned down.
        assert_eq!(addr, 0x8110_0000 - 0x18);
        cpu.stack_pop(addr, old).unwrap();
        assert_eq!(sp, 0x8110_0000);
    }
}
