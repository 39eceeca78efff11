// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Unix implementation of the dual-view mapping primitives.

#![cfg(unix)]

use crate::Protection;
use std::ffi::c_void;
use std::fs::File;
use std::io;
use std::io::Error;
use std::os::unix::prelude::*;
use std::ptr::null_mut;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    let s = PAGE_SIZE.load(Ordering::Relaxed);
    if s != 0 {
        s
    } else {
        // SAFETY: sysconf has no preconditions.
        let s = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        PAGE_SIZE.store(s, Ordering::Relaxed);
        s
    }
}

pub(crate) fn native_protection(protection: Protection) -> i32 {
    match protection {
        Protection::NoAccess => libc::PROT_NONE,
        Protection::Read => libc::PROT_READ,
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    }
}

unsafe fn mmap(
    addr: *mut c_void,
    len: usize,
    prot: i32,
    flags: i32,
    fd: i32,
    offset: i64,
) -> Result<*mut c_void, Error> {
    // SAFETY: guaranteed by caller.
    let address = unsafe { libc::mmap(addr, len, prot, flags, fd, offset) };
    if address == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    Ok(address)
}

/// One virtual address range backed by a shared memory object.
#[derive(Debug)]
pub(crate) struct View {
    address: *mut c_void,
    len: usize,
}

// SAFETY: View's internal pointer represents an owned virtual address range.
// There is no safety issue accessing this pointer across threads.
unsafe impl Send for View {}
// SAFETY: see above comment.
unsafe impl Sync for View {}

impl View {
    /// Maps `len` bytes of the shared object `fd` at a kernel-chosen address,
    /// initially inaccessible.
    pub fn map_shared(fd: BorrowedFd<'_>, len: usize) -> io::Result<Self> {
        if len == 0 || len % page_size() != 0 {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        // SAFETY: mapping a fresh range chosen by the kernel.
        let address = unsafe {
            mmap(
                null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )?
        };
        Ok(Self { address, len })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.address.cast()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn validate_offset_len(&self, offset: usize, len: usize) -> io::Result<usize> {
        let end = offset.checked_add(len).ok_or(io::ErrorKind::InvalidInput)?;
        let page_size = page_size();
        if offset % page_size != 0 || end % page_size != 0 || end > self.len {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        Ok(end)
    }

    /// Changes the protection of `[offset, offset + len)` within the view.
    pub fn protect(&self, offset: usize, len: usize, protection: Protection) -> io::Result<()> {
        let _ = self.validate_offset_len(offset, len)?;
        // SAFETY: the range is within the view, which this object owns.
        let ret = unsafe {
            libc::mprotect(
                self.address.add(offset),
                len,
                native_protection(protection),
            )
        };
        if ret < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// Gets a slice for accessing the mapped data directly.
    ///
    /// This is safe from a Rust memory model perspective: the VA is mapped
    /// and owned in a shared state by this object, so `&[AtomicU8]` access
    /// from multiple threads is fine. Accessing a range whose protection
    /// excludes the access will still fault and bring the process down, so
    /// care must nonetheless be taken when using this method.
    pub fn atomic_slice(&self, start: usize, len: usize) -> &[AtomicU8] {
        assert!(self.len() >= start && self.len() - start >= len);
        // SAFETY: slice is within the mapped range.
        unsafe { std::slice::from_raw_parts(self.as_ptr().cast::<AtomicU8>().add(start), len) }
    }
}

impl Drop for View {
    fn drop(&mut self) {
        // SAFETY: unmapping a range owned by this object.
        let ret = unsafe { libc::munmap(self.address, self.len) };
        if ret < 0 {
            panic!("munmap failed: {}", Error::last_os_error());
        }
    }
}

#[cfg(target_os = "linux")]
fn new_memfd() -> io::Result<File> {
    // SAFETY: creating a new file descriptor according to the documented
    // contract.
    unsafe {
        let fd = libc::memfd_create(c"guest_mem".as_ptr(), libc::MFD_CLOEXEC);
        if fd < 0 {
            return Err(Error::last_os_error());
        }
        Ok(File::from_raw_fd(fd))
    }
}

#[cfg(not(target_os = "linux"))]
fn new_memfd() -> io::Result<File> {
    let mut name = [0; 16];
    getrandom::getrandom(&mut name).unwrap();
    let mut name = format!("{:x}", u128::from_ne_bytes(name));
    // macOS limits the name length to 31 bytes, which is sufficient to ensure
    // uniqueness.
    name.truncate(31);
    let name = std::ffi::CString::new(name).unwrap();
    // SAFETY: creating a new shared memory object with a name no other object
    // can share, and unlinking it immediately so it does not outlive the
    // process.
    unsafe {
        let fd = libc::shm_open(name.as_ptr(), libc::O_RDWR | libc::O_EXCL | libc::O_CREAT);
        if fd < 0 {
            return Err(Error::last_os_error());
        }
        let _ = libc::shm_unlink(name.as_ptr());
        Ok(File::from_raw_fd(fd))
    }
}

/// Allocates a mappable anonymous shared memory object of `size` bytes.
pub fn alloc_shared_memory(size: u64) -> io::Result<OwnedFd> {
    let fd = new_memfd()?;
    fd.set_len(size)?;
    Ok(fd.into())
}
