// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::PathBuf;

use thiserror::Error;

/// Engine error.
///
/// Medium errors never surface here directly: the read path records them in
/// the status map and substitutes the configured placeholder. Everything in
/// this enum is either a caller mistake, a fatal open-time condition, or a
/// durability failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error("read of {length} bytes at offset {offset:#x} exceeds device size {device_size:#x}")]
    OutOfRange {
        offset: u64,
        length: u64,
        device_size: u64,
    },
    /// Only produced under [`BadSectorPolicy::Error`](crate::BadSectorPolicy).
    #[error("no data available for {length} bytes at offset {offset:#x}")]
    DataUnavailable { offset: u64, length: u64 },
    #[error("map file {path}: {reason} (line {line})", path = .path.display())]
    MapFileCorrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("cache file is {actual} bytes but the device is {expected}")]
    CacheSizeMismatch { expected: u64, actual: u64 },
    #[error("cache for {path} is in use by another process", path = .0.display())]
    AlreadyInUse(PathBuf),
    #[error("device went away mid-session")]
    DeviceGone,
    #[error("engine is closed")]
    Closed,
    #[error("invalid option: {0}")]
    InvalidOptions(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
