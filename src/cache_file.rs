// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Sparse, memory-mapped backing store for cached sector bytes.
//!
//! The file has no header: the block at index `b` lives at byte offset
//! `b * block_size`, and the file length equals the device size, so the image
//! is directly loop-mountable once complete. Blocks never read from the
//! device are holes.
//!
//! This layer does not interpret block status; serving a block that the
//! status map does not mark cached is the caller's bug, not ours. Writes land
//! in the mapping and are scheduled to disk asynchronously; durability is
//! only forced by [`sync`](CacheFile::sync) at checkpoint time.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use fs4::fs_std::FileExt;
use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use crate::errors::Error;

#[derive(Debug)]
pub struct CacheFile {
    file: File,
    map: MmapMut,
    device_size: u64,
    block_size: u32,
}

impl CacheFile {
    /// Opens or creates the image at `path` for a device of `device_size`
    /// bytes. A pre-existing image shorter than the device is rejected; a
    /// zero-length file counts as fresh so that a crash between creation and
    /// the first extension is recoverable.
    pub fn open(path: &Path, device_size: u64, block_size: u32) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        if len != 0 && len < device_size {
            return Err(Error::CacheSizeMismatch {
                expected: device_size,
                actual: len,
            });
        }
        if len < device_size {
            file.set_len(device_size)?;
            debug!(path = %path.display(), device_size, "created sparse cache image");
        }
        let map_len = usize::try_from(device_size)
            .map_err(|_| io::Error::new(io::ErrorKind::OutOfMemory, "device too large to map"))?;
        // SAFETY: the engine holds an exclusive advisory lock on this file
        // for the lifetime of the mapping, so no other process mutates it
        // underneath us, and the file is never truncated while mapped.
        let map = unsafe { MmapOptions::new().len(map_len).map_mut(&file)? };
        Ok(Self {
            file,
            map,
            device_size,
            block_size,
        })
    }

    pub fn device_size(&self) -> u64 {
        self.device_size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Byte span of the block range, the tail clipped to the device size.
    fn span(&self, block: u64, nblocks: u64) -> (usize, usize) {
        let bs = self.block_size as u64;
        let start = block * bs;
        let end = (block + nblocks) * bs;
        assert!(nblocks > 0 && start < self.device_size, "block range out of bounds");
        (start as usize, end.min(self.device_size) as usize)
    }

    /// Copies `nblocks` blocks out of the mapping. The final block of the
    /// device may be short; everything else is exactly block-sized.
    pub fn read_blocks(&self, block: u64, nblocks: u64) -> Vec<u8> {
        let (start, end) = self.span(block, nblocks);
        self.map[start..end].to_vec()
    }

    /// Copies bytes into the mapping and schedules them to disk. `bytes`
    /// must cover the block range exactly (block-aligned, tail clipped).
    pub fn write_blocks(&mut self, block: u64, bytes: &[u8]) -> io::Result<()> {
        let (start, end) = self.span(block, bytes.len().div_ceil(self.block_size as usize) as u64);
        assert_eq!(end - start, bytes.len(), "byte length does not cover the block range");
        self.map[start..end].copy_from_slice(bytes);
        // msync(MS_ASYNC) on the dirty range; the checkpoint makes it durable.
        self.map.flush_async_range(start, end - start)
    }

    /// msync(MS_SYNC) the whole mapping, then fsync the file.
    pub fn sync(&self) -> io::Result<()> {
        self.map.flush()?;
        self.file.sync_all()
    }

    /// Exclusive advisory lock on the image, held for the session. Taken on
    /// the image rather than the mapfile because the mapfile inode is
    /// replaced on every checkpoint rename.
    pub fn try_lock(&self) -> io::Result<bool> {
        self.file.try_lock_exclusive()
    }

    pub fn unlock(&self) -> io::Result<()> {
        FileExt::unlock(&self.file)
    }
}
