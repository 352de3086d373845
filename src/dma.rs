// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Physically-addressed buffer allocation.
//!
//! Decoder engines write pictures by DMA, so output framebuffers and the bitstream scratch
//! buffer come from an allocator that hands out physically contiguous, aligned memory. The
//! session only goes through [`DmaAllocator`]; [`MemFdAllocator`] is a memfd-backed
//! implementation for software engines and tests.

use core::slice;
use std::fmt;
use std::fs::File;
use std::io;
use std::num::NonZeroU64;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use nix::errno::Errno;
use nix::sys::memfd::memfd_create;
use nix::sys::memfd::MemFdCreateFlag;
use nix::sys::mman;
use thiserror::Error;

/// Address of a buffer on the bus the decoder engine performs DMA on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysAddr(pub u64);

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A physically contiguous region handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRegion {
    pub addr: PhysAddr,
    pub size: u64,
}

/// Intended access of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("buffer size cannot be zero")]
    ZeroSize,
    #[error("alignment {0} is not a power of two")]
    BadAlignment(u64),
    #[error("buffer size {0} larger than usize")]
    BufferTooLarge(u64),
    #[error("call to memfd_create failed: {0}")]
    FailedToCreate(#[from] Errno),
    #[error("failed to set size of memfd: {0}")]
    FailedToSetSize(io::Error),
    #[error("failed to seal memfd: {0}")]
    FailedToSeal(io::Error),
    #[error("mmap call returned error: {0}")]
    Mmap(Errno),
}

/// Allocator for the engine's framebuffers and scratch memory.
///
/// Deallocation is by drop; buffer ownership already enforces the release-exactly-once
/// rule.
pub trait DmaAllocator {
    type Buffer: DmaBuffer;

    fn allocate(&self, size: u64, alignment: u64) -> Result<Self::Buffer, AllocError>;
}

/// One fixed-size allocation with a stable physical address.
pub trait DmaBuffer {
    type Mapping: AsRef<[u8]>;

    fn size(&self) -> u64;

    fn phys_addr(&self) -> PhysAddr;

    /// Maps the buffer into the caller's address space. The mapping is released when the
    /// returned value is dropped.
    fn map(&self, mode: AccessMode) -> Result<Self::Mapping, AllocError>;

    /// The region to hand to an engine for this buffer.
    fn region(&self) -> PhysRegion {
        PhysRegion {
            addr: self.phys_addr(),
            size: self.size(),
        }
    }
}

/// Pseudo-physical address space for memfd buffers. Engines only require the addresses to
/// be stable and unique per buffer.
static NEXT_PSEUDO_PHYS: AtomicU64 = AtomicU64::new(0x1000_0000);

/// Memfd-backed [`DmaAllocator`].
///
/// Memfd memory has no bus address, so buffers carry stable process-unique pseudo-physical
/// addresses; every engine that treats the address as an opaque key (any software engine)
/// works unchanged. Hardware engines need a platform allocator instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemFdAllocator;

impl DmaAllocator for MemFdAllocator {
    type Buffer = MemFdDmaBuffer;

    fn allocate(&self, size: u64, alignment: u64) -> Result<MemFdDmaBuffer, AllocError> {
        let size = NonZeroU64::new(size).ok_or(AllocError::ZeroSize)?;
        if !alignment.is_power_of_two() {
            return Err(AllocError::BadAlignment(alignment));
        }

        let fd = memfd_create(c"vpu-buffer", MemFdCreateFlag::MFD_ALLOW_SEALING)?;
        let file: File = fd.into();

        // Allocate requested size.
        file.set_len(size.into())
            .map_err(AllocError::FailedToSetSize)?;

        // Seal so the memory size cannot be changed.
        //
        // SAFETY: `file` is a valid file.
        if unsafe {
            libc::fcntl(
                file.as_raw_fd(),
                libc::F_ADD_SEALS,
                libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_SEAL,
            )
        } < 0
        {
            return Err(AllocError::FailedToSeal(io::Error::last_os_error()));
        }

        // Over-reserve so the handed-out address can be rounded up to the alignment.
        let base = NEXT_PSEUDO_PHYS.fetch_add(size.get() + alignment, Ordering::Relaxed);
        let phys = PhysAddr(base.next_multiple_of(alignment));

        Ok(MemFdDmaBuffer { file, size, phys })
    }
}

/// A chunk of memory allocated through `memfd`.
///
/// Buffers are of fixed size and can also be manipulated as files.
pub struct MemFdDmaBuffer {
    file: File,
    size: NonZeroU64,
    phys: PhysAddr,
}

impl MemFdDmaBuffer {
    pub fn as_file(&self) -> &File {
        &self.file
    }
}

impl DmaBuffer for MemFdDmaBuffer {
    type Mapping = MemFdMapping;

    fn size(&self) -> u64 {
        self.size.get()
    }

    fn phys_addr(&self) -> PhysAddr {
        self.phys
    }

    fn map(&self, _mode: AccessMode) -> Result<MemFdMapping, AllocError> {
        // The mode is advisory here; memfd mappings are always created read-write.
        let size = NonZeroUsize::try_from(self.size)
            .map_err(|_| AllocError::BufferTooLarge(self.size.get()))?;

        // SAFETY: `self.file` is a valid file.
        let data = unsafe {
            mman::mmap(
                None,
                size,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_SHARED,
                &self.file,
                0,
            )
            .map_err(AllocError::Mmap)?
        };

        Ok(MemFdMapping {
            // SAFETY: `data` is non-null and obtained through a `mmap` of size `self.size`.
            data: unsafe { slice::from_raw_parts_mut(data.as_ptr().cast(), size.into()) },
        })
    }
}

impl AsFd for MemFdDmaBuffer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for MemFdDmaBuffer {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.file.as_raw_fd()
    }
}

/// A CPU mapping of a [`MemFdDmaBuffer`].
pub struct MemFdMapping {
    // A mapping remains valid until we munmap it, that is, until this object is deleted.
    // Hence the static lifetime.
    data: &'static mut [u8],
}

impl MemFdMapping {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl Drop for MemFdMapping {
    fn drop(&mut self) {
        // Safe because the pointer and length were constructed in map() and are always
        // valid.
        unsafe {
            mman::munmap(
                NonNull::new_unchecked(self.data.as_mut_ptr().cast()),
                self.data.len(),
            )
        }
        .unwrap_or_else(|e| {
            log::error!("error while unmapping buffer: {:#}", e);
        });
    }
}

impl AsRef<[u8]> for MemFdMapping {
    fn as_ref(&self) -> &[u8] {
        self.data
    }
}

impl AsMut<[u8]> for MemFdMapping {
    fn as_mut(&mut self) -> &mut [u8] {
        self.data
    }
}
