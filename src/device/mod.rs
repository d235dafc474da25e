// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The capability through which the engine sees the physical medium.
//!
//! The engine owns the caching policy; a [`RawDevice`] only has to answer
//! sized, aligned reads and tell medium failures apart from everything else.
//! Implementations need not be reentrant: the engine serialises physical
//! reads per device.

mod file;
mod memory;

pub use file::FileDevice;
pub use memory::MemoryDevice;

use thiserror::Error;

/// How a physical read can go wrong.
///
/// Only [`Medium`](RawError::Medium) is recoverable: the engine records the
/// affected blocks as bad and keeps going. Everything else aborts the
/// requesting call.
#[derive(Debug, Error)]
pub enum RawError {
    #[error("medium error reading {length} bytes at offset {offset:#x}")]
    Medium { offset: u64, length: usize },
    #[error("short read: device returned {got} bytes")]
    ShortRead { got: usize },
    #[error("device closed")]
    Closed,
    #[error(transparent)]
    Other(#[from] std::io::Error),
}

/// A physical block source: an optical drive, a failing disk, an image file.
pub trait RawDevice: Send {
    /// Total size in bytes. Constant over the session.
    fn size(&self) -> u64;

    /// Native sector size. Power of two, at least 512.
    fn block_size(&self) -> u32;

    /// Reads exactly `length` bytes at `offset`. Both are aligned to
    /// [`block_size`](RawDevice::block_size), except that a read against the
    /// final sectors of an oddly-sized source may be clipped to
    /// [`size`](RawDevice::size).
    fn read(&mut self, offset: u64, length: usize) -> Result<Vec<u8>, RawError>;
}
