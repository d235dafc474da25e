// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Transparent read-once caching for slow, fragile or failing block devices.
//!
//! Every sector any consumer reads through the engine is recorded into a
//! sparse local image and a run-length status map; later reads are served
//! from the cache and never touch the medium again. Over natural use the
//! image converges toward a complete copy of the device.
//!
//! ```text
//!            read(offset, len)
//! consumer ────────────────────► CacheEngine
//!                                 │     │
//!                     StatusMap ◄─┤     ├─► RawDevice (one read per block,
//!                     (disc.map)  │     │    ever)
//!                                 └─► CacheFile
//!                                     (disc.img — sparse, loop-mountable)
//! ```
//!
//! The status map is persisted in ddrescue's mapfile format, so a rescue can
//! be started with ddrescue and continued here, or the other way round, and
//! standard tooling can display progress.
//!
//! Medium errors are not fatal: the failing range is sub-split so that only
//! the truly bad blocks are condemned, the rest is salvaged, and bad blocks
//! read back as zeroes (or as an error, see [`BadSectorPolicy`]).
//!
//! The engine is synchronous and thread-safe. Front-ends that expose the
//! cache as an NBD export or a FUSE file call [`CacheEngine::read`] from
//! whatever concurrency model they prefer; overlapping reads of an uncached
//! range are coalesced into a single physical read.
//!
//! ```
//! use blkcache::{CacheEngine, CacheOptions, MemoryDevice};
//!
//! # fn main() -> anyhow::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let device = MemoryDevice::new(vec![0xAB; 16 * 4096], 512);
//!
//! let engine = CacheEngine::open(
//!     device.clone(),
//!     &dir.path().join("disc.img"),
//!     &dir.path().join("disc.map"),
//!     CacheOptions::default(),
//! )?;
//!
//! assert_eq!(engine.read(0, 8192)?, vec![0xAB; 8192]);
//! // Served from the cache; the medium is not touched again.
//! assert_eq!(engine.read(4096, 4096)?, vec![0xAB; 4096]);
//! assert_eq!(engine.stats().physical_reads, 1);
//! engine.close()?;
//! # Ok(())
//! # }
//! ```

mod cache_file;
mod device;
mod engine;
mod errors;
mod persist;
mod planner;
mod status_map;

pub use cache_file::CacheFile;
pub use device::{FileDevice, MemoryDevice, RawDevice, RawError};
pub use engine::{BadSectorPolicy, CacheEngine, CacheOptions, CacheStats};
pub use errors::Error;
pub use status_map::{BlockStatus, SectorStatus, StatusMap, StatusRuns};
