// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The public façade binding the status map, the cache file and the device.
//!
//! One mutex guards the status map, the cache file and the table of claimed
//! block ranges. Physical reads never happen under it: a reader inspects
//! status, claims an unread range, drops the lock, performs the device read,
//! then re-takes the lock to commit the outcome. Readers whose range overlaps
//! a claim wait on a condvar and re-plan once the claim completes, so an
//! unread block is read from the medium at most once no matter how many
//! callers want it.
//!
//! ```text
//! caller A ──► lock ─ plan ─ claim [4,8) ─ unlock ─ device read ─ lock ─ commit ─►
//! caller B ──► lock ─ plan ─ overlap! ───── wait ──────────────────◄ notify ─ re-plan ─►
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, instrument, trace, warn};

use crate::cache_file::CacheFile;
use crate::device::{RawDevice, RawError};
use crate::errors::Error;
use crate::persist;
use crate::planner::{self, PlanStep};
use crate::status_map::{BlockStatus, StatusMap};

/// What `read` returns for blocks that failed with a medium error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BadSectorPolicy {
    /// Substitute zeroes, the way a ddrescue-filled image reads.
    #[default]
    Zeros,
    /// Fail the whole call with [`Error::DataUnavailable`].
    Error,
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Cache granularity in bytes. Power of two, a multiple of the device's
    /// native sector size.
    pub block_size: u32,
    /// Upper bound on a single physical read, in cache blocks.
    pub max_phys_read_blocks: u32,
    pub bad_sector_policy: BadSectorPolicy,
    /// Give every block already marked bad one fresh attempt this session,
    /// by resetting failed ranges to non-tried at open.
    pub retry_bad: bool,
    /// Checkpoint once this much newly cached data has accumulated...
    pub checkpoint_bytes: u64,
    /// ...or this much time has passed since the last checkpoint, whichever
    /// trips first.
    pub checkpoint_interval: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            max_phys_read_blocks: 256,
            bad_sector_policy: BadSectorPolicy::Zeros,
            retry_bad: false,
            checkpoint_bytes: 1 << 20,
            checkpoint_interval: Duration::from_secs(5),
        }
    }
}

impl CacheOptions {
    fn validate(&self, device_block_size: u32) -> Result<(), Error> {
        if !self.block_size.is_power_of_two() {
            return Err(Error::InvalidOptions(format!(
                "block_size {} is not a power of two",
                self.block_size
            )));
        }
        if self.block_size < device_block_size || self.block_size % device_block_size != 0 {
            return Err(Error::InvalidOptions(format!(
                "block_size {} is not a multiple of the device sector size {device_block_size}",
                self.block_size
            )));
        }
        if self.max_phys_read_blocks == 0 {
            return Err(Error::InvalidOptions(
                "max_phys_read_blocks must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Session counters, in the spirit of a database's statistics surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Physical reads issued to the device, sub-split probes included.
    pub physical_reads: u64,
    /// Blocks newly recorded as cached this session.
    pub blocks_cached: u64,
    /// Blocks newly recorded as bad this session.
    pub bad_blocks: u64,
    /// Completed `read` calls.
    pub reads: u64,
    /// Total bytes returned to callers.
    pub bytes_read: u64,
}

pub struct CacheEngine<D> {
    device: Mutex<D>,
    state: Mutex<EngineState>,
    completed: Condvar,
    opts: CacheOptions,
    map_path: PathBuf,
    device_size: u64,
    physical_reads: AtomicU64,
}

struct EngineState {
    status: StatusMap,
    cache: CacheFile,
    /// Claimed block ranges with a physical read outstanding. Disjoint.
    inflight: Vec<(u64, u64)>,
    /// Newly cached bytes since the last checkpoint.
    dirty_bytes: u64,
    last_checkpoint: Instant,
    stats: CacheStats,
    device_gone: bool,
    closed: bool,
}

/// Outcome of one claimed range, after sub-splitting.
enum Segment {
    Good { start: u64, end: u64, bytes: Vec<u8> },
    Bad { start: u64, end: u64 },
}

impl<D: RawDevice> CacheEngine<D> {
    /// Opens the cache pair for `device`, creating both files on first use.
    ///
    /// Holds an exclusive advisory lock for the whole session, so two
    /// engines can never fight over one image.
    #[instrument(level = "debug", skip_all, fields(map = %map_path.display()))]
    pub fn open(
        device: D,
        cache_path: &Path,
        map_path: &Path,
        opts: CacheOptions,
    ) -> Result<Self, Error> {
        opts.validate(device.block_size())?;
        let device_size = device.size();
        let map_existed = map_path.try_exists()?;
        if map_existed && !cache_path.try_exists()? {
            // A map without its image would claim data we do not have.
            return Err(Error::CacheSizeMismatch {
                expected: device_size,
                actual: 0,
            });
        }
        let cache = CacheFile::open(cache_path, device_size, opts.block_size)?;
        if !cache.try_lock()? {
            return Err(Error::AlreadyInUse(map_path.to_owned()));
        }
        let mut status = StatusMap::load(map_path, device_size, opts.block_size)?;
        if opts.retry_bad {
            // One fresh attempt per failed block this session, in the manner
            // of ddrescue's --try-again. Blocks that fail again are
            // condemned again.
            status.reset_failed();
        }
        if !map_existed {
            persist::write_map_atomic(&status, map_path)?;
        }
        debug!(device_size, block_size = opts.block_size, "engine open");
        Ok(Self {
            device: Mutex::new(device),
            state: Mutex::new(EngineState {
                status,
                cache,
                inflight: Vec::new(),
                dirty_bytes: 0,
                last_checkpoint: Instant::now(),
                stats: CacheStats::default(),
                device_gone: false,
                closed: false,
            }),
            completed: Condvar::new(),
            opts,
            map_path: map_path.to_owned(),
            device_size,
            physical_reads: AtomicU64::new(0),
        })
    }

    /// Reads `length` bytes at `offset`, caching whatever the medium had to
    /// be touched for. No alignment requirement on the caller.
    #[instrument(level = "trace", skip(self))]
    pub fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, Error> {
        let req_end = offset
            .checked_add(length as u64)
            .filter(|&e| e <= self.device_size)
            .ok_or(Error::OutOfRange {
                offset,
                length: length as u64,
                device_size: self.device_size,
            })?;
        if length == 0 {
            return Ok(Vec::new());
        }
        let bs = self.opts.block_size as u64;
        let first = offset / bs;
        let last = req_end.div_ceil(bs);
        let mut buf = vec![0u8; ((last * bs).min(self.device_size) - first * bs) as usize];

        loop {
            let mut st = self.state.lock();
            if st.closed {
                return Err(Error::Closed);
            }
            if st.device_gone {
                return Err(Error::DeviceGone);
            }
            let plan = planner::plan(&st.status, offset, length, &self.opts);
            let mut unavailable: Option<(u64, u64)> = None;
            let mut wanted: Option<(u64, u64)> = None;
            for step in &plan.steps {
                match *step {
                    PlanStep::FromCache { start, end } => {
                        let bytes = st.cache.read_blocks(start, end - start);
                        let at = ((start - plan.first_block) * bs) as usize;
                        buf[at..at + bytes.len()].copy_from_slice(&bytes);
                    }
                    PlanStep::Placeholder { start, end } => {
                        // The buffer is already zeroed; just remember the
                        // first such run for the Error policy.
                        if unavailable.is_none() {
                            let lo = (start * bs).max(offset);
                            let hi = (end * bs).min(req_end);
                            unavailable = Some((lo, hi - lo));
                        }
                    }
                    PlanStep::FromDevice { start, end } => {
                        wanted = Some((start, end));
                        break;
                    }
                }
            }

            let Some((want_lo, want_hi)) = wanted else {
                // Everything materialised; the placeholder decision is final.
                if let (BadSectorPolicy::Error, Some((off, len))) =
                    (self.opts.bad_sector_policy, unavailable)
                {
                    return Err(Error::DataUnavailable {
                        offset: off,
                        length: len,
                    });
                }
                st.stats.reads += 1;
                st.stats.bytes_read += length as u64;
                drop(st);
                buf.truncate(plan.skip + length);
                if plan.skip > 0 {
                    buf.drain(..plan.skip);
                }
                return Ok(buf);
            };

            // Claim as much of the wanted range as is not already being
            // fetched by somebody else.
            let blocking = st
                .inflight
                .iter()
                .filter(|&&(lo, hi)| lo < want_hi && hi > want_lo)
                .map(|&(lo, _)| lo)
                .min();
            let (claim_lo, claim_hi) = match blocking {
                Some(lo) if lo <= want_lo => {
                    // The front of our range is in flight; wait and re-plan.
                    self.completed.wait(&mut st);
                    continue;
                }
                Some(lo) => (want_lo, lo),
                None => (want_lo, want_hi),
            };
            st.inflight.push((claim_lo, claim_hi));
            st.status.note_attempt(claim_lo * bs);
            drop(st);

            let outcome = self.fetch(claim_lo, claim_hi);

            let mut st = self.state.lock();
            st.inflight.retain(|&r| r != (claim_lo, claim_hi));
            self.completed.notify_all();
            match outcome {
                Ok(_) if st.closed => return Err(Error::Closed),
                Ok(segments) => {
                    for seg in &segments {
                        match seg {
                            Segment::Good { start, end, bytes } => {
                                st.cache.write_blocks(*start, bytes)?;
                                st.status.set(*start, *end, BlockStatus::Cached);
                                st.stats.blocks_cached += end - start;
                                st.dirty_bytes += bytes.len() as u64;
                            }
                            Segment::Bad { start, end } => {
                                warn!(start = *start, end = *end, "medium error, blocks marked bad");
                                st.status.set(*start, *end, BlockStatus::BadSector);
                                st.stats.bad_blocks += end - start;
                            }
                        }
                    }
                    self.maybe_checkpoint(&mut st)?;
                }
                Err(RawError::Closed) => {
                    warn!("device went away; refusing further reads");
                    st.device_gone = true;
                    return Err(Error::DeviceGone);
                }
                Err(RawError::ShortRead { got }) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("device returned {got} bytes short of a full read"),
                    )));
                }
                Err(RawError::Medium { .. }) => {
                    unreachable!("sub-split consumes medium errors")
                }
                Err(RawError::Other(e)) => return Err(Error::Io(e)),
            }
            // Re-plan: the range we fetched is now cached or bad, and other
            // claims may have completed meanwhile.
        }
    }

    /// Reads the claimed block range, isolating medium errors by recursive
    /// halving down to single blocks. Small ranges are probed linearly; the
    /// observable outcome is the same.
    fn fetch(&self, start: u64, end: u64) -> Result<Vec<Segment>, RawError> {
        let mut segments = Vec::new();
        self.fetch_into(start, end, &mut segments)?;
        Ok(segments)
    }

    fn fetch_into(&self, start: u64, end: u64, out: &mut Vec<Segment>) -> Result<(), RawError> {
        let bs = self.opts.block_size as u64;
        let lo = start * bs;
        let hi = (end * bs).min(self.device_size);
        let length = (hi - lo) as usize;
        self.physical_reads.fetch_add(1, Ordering::Relaxed);
        trace!(start, end, "physical read");
        // The device mutex is held for one probe at a time, so a sub-split
        // stays interruptible between half-steps but never within one.
        let result = self.device.lock().read(lo, length);
        match result {
            Ok(bytes) if bytes.len() == length => {
                out.push(Segment::Good { start, end, bytes });
                Ok(())
            }
            Ok(bytes) => Err(RawError::ShortRead { got: bytes.len() }),
            Err(RawError::Medium { .. }) if end - start == 1 => {
                out.push(Segment::Bad { start, end });
                Ok(())
            }
            Err(RawError::Medium { .. }) if end - start <= 4 => {
                for b in start..end {
                    self.fetch_into(b, b + 1, out)?;
                }
                Ok(())
            }
            Err(RawError::Medium { .. }) => {
                let mid = start + (end - start) / 2;
                self.fetch_into(start, mid, out)?;
                self.fetch_into(mid, end, out)
            }
            Err(e) => Err(e),
        }
    }

    fn maybe_checkpoint(&self, st: &mut EngineState) -> Result<(), Error> {
        if st.dirty_bytes == 0 {
            return Ok(());
        }
        if st.dirty_bytes < self.opts.checkpoint_bytes
            && st.last_checkpoint.elapsed() < self.opts.checkpoint_interval
        {
            return Ok(());
        }
        self.checkpoint(st)
    }

    fn checkpoint(&self, st: &mut EngineState) -> Result<(), Error> {
        persist::checkpoint(&st.status, &st.cache, &self.map_path)?;
        st.dirty_bytes = 0;
        st.last_checkpoint = Instant::now();
        debug!(map = %self.map_path.display(), "checkpointed");
        Ok(())
    }

    /// Forces a checkpoint: cache file made durable, status map atomically
    /// rewritten.
    pub fn flush(&self) -> Result<(), Error> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(Error::Closed);
        }
        self.checkpoint(&mut st)
    }

    /// Flushes and releases the session lock. Idempotent; the engine refuses
    /// reads afterwards.
    pub fn close(&self) -> Result<(), Error> {
        let mut st = self.state.lock();
        if st.closed {
            return Ok(());
        }
        let flushed = self.checkpoint(&mut st);
        st.closed = true;
        let unlocked = st.cache.unlock();
        flushed?;
        unlocked?;
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let st = self.state.lock();
        CacheStats {
            physical_reads: self.physical_reads.load(Ordering::Relaxed),
            ..st.stats
        }
    }

    pub fn device_size(&self) -> u64 {
        self.device_size
    }

    pub fn block_size(&self) -> u32 {
        self.opts.block_size
    }
}

impl<D> Drop for CacheEngine<D> {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if !st.closed {
            if let Err(e) = persist::checkpoint(&st.status, &st.cache, &self.map_path) {
                warn!("checkpoint on drop failed: {e}");
            }
        }
    }
}
