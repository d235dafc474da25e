// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{RawDevice, RawError};

/// An in-memory device, the test twin of [`FileDevice`](super::FileDevice).
///
/// Sectors can be scripted to fail with a medium error, the device can be
/// yanked mid-session, and every physical read is logged, so tests can assert
/// that a range was read from the medium exactly once. Clones share state:
/// keep one handle for assertions while the engine owns another.
#[derive(Clone)]
pub struct MemoryDevice {
    inner: Arc<RwLock<Inner>>,
    block_size: u32,
}

struct Inner {
    data: Vec<u8>,
    bad: BTreeSet<u64>,
    closed: bool,
    reads: Vec<(u64, usize)>,
}

impl MemoryDevice {
    pub fn new(data: Vec<u8>, block_size: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                data,
                bad: BTreeSet::new(),
                closed: false,
                reads: Vec::new(),
            })),
            block_size,
        }
    }

    /// Makes reads covering the given device sector fail with a medium error.
    pub fn mark_bad(&self, sector: u64) {
        self.inner.write().bad.insert(sector);
    }

    /// Undoes [`mark_bad`](Self::mark_bad), as a drive sometimes does on a
    /// later pass.
    pub fn heal(&self, sector: u64) {
        self.inner.write().bad.remove(&sector);
    }

    /// Subsequent reads fail with [`RawError::Closed`].
    pub fn yank(&self) {
        self.inner.write().closed = true;
    }

    /// Every `(offset, length)` passed to [`RawDevice::read`] so far,
    /// including reads that failed.
    pub fn reads(&self) -> Vec<(u64, usize)> {
        self.inner.read().reads.clone()
    }

    pub fn read_count(&self) -> usize {
        self.inner.read().reads.len()
    }

    /// How many times any read touched the given sector.
    pub fn times_read(&self, sector: u64) -> usize {
        let bs = self.block_size as u64;
        let (lo, hi) = (sector * bs, (sector + 1) * bs);
        self.inner
            .read()
            .reads
            .iter()
            .filter(|&&(off, len)| off < hi && off + len as u64 > lo)
            .count()
    }
}

impl RawDevice for MemoryDevice {
    fn size(&self) -> u64 {
        self.inner.read().data.len() as u64
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read(&mut self, offset: u64, length: usize) -> Result<Vec<u8>, RawError> {
        let mut inner = self.inner.write();
        inner.reads.push((offset, length));
        if inner.closed {
            return Err(RawError::Closed);
        }
        let end = offset + length as u64;
        if end > inner.data.len() as u64 {
            return Err(RawError::ShortRead {
                got: (inner.data.len() as u64).saturating_sub(offset) as usize,
            });
        }
        let bs = self.block_size as u64;
        if inner
            .bad
            .range(offset / bs..end.div_ceil(bs))
            .next()
            .is_some()
        {
            return Err(RawError::Medium { offset, length });
        }
        Ok(inner.data[offset as usize..end as usize].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_bad_sector_fails_only_ranges_that_touch_it() {
        let mut dev = MemoryDevice::new(vec![0; 4096], 512);
        dev.mark_bad(3);
        assert!(dev.read(0, 1024).is_ok());
        assert!(matches!(dev.read(1024, 1024), Err(RawError::Medium { .. })));
        assert!(dev.read(2048, 2048).is_ok());
        assert_eq!(dev.read_count(), 3);
    }

    #[test]
    fn yanked_device_reports_closed() {
        let mut dev = MemoryDevice::new(vec![0; 1024], 512);
        dev.yank();
        assert!(matches!(dev.read(0, 512), Err(RawError::Closed)));
    }
}
