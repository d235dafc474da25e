// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Turns a byte-range request into block-granular work.
//!
//! A request is quantised to the covering block range; the head and tail
//! partials are carried as a byte window over the assembled buffer, so every
//! step below works in whole blocks and the final slice is bytewise.
//!
//! The plan is advisory: the engine re-plans after every committed physical
//! read, because concurrent readers may have cached or condemned blocks in
//! the meantime.

use itertools::Itertools;

use crate::engine::CacheOptions;
use crate::status_map::{BlockStatus, StatusMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PlanStep {
    /// Blocks the status map trusts; copy them out of the cache file.
    FromCache { start: u64, end: u64 },
    /// Blocks that need a physical read.
    FromDevice { start: u64, end: u64 },
    /// Blocks known bad; bytes come from the placeholder policy.
    Placeholder { start: u64, end: u64 },
}

#[derive(Debug)]
pub(crate) struct Plan {
    /// First block covered by the request.
    pub first_block: u64,
    /// Bytes to drop from the front of the assembled buffer.
    pub skip: usize,
    /// Ordered, non-overlapping, covering the whole block range.
    pub steps: Vec<PlanStep>,
}

pub(crate) fn plan(map: &StatusMap, offset: u64, length: usize, opts: &CacheOptions) -> Plan {
    let bs = map.block_size() as u64;
    let first = offset / bs;
    let last = if length == 0 {
        first
    } else {
        (offset + length as u64).div_ceil(bs)
    };
    let steps = map
        .range(first, last)
        .map(|(start, end, status)| match status {
            BlockStatus::Cached => PlanStep::FromCache { start, end },
            BlockStatus::Unread => PlanStep::FromDevice { start, end },
            // Condemned blocks are never re-issued here; a retry session
            // resets them to non-tried at open instead.
            BlockStatus::BadSector | BlockStatus::NonScraped => {
                PlanStep::Placeholder { start, end }
            }
        })
        .coalesce(merge)
        .flat_map(|step| split_phys(step, opts.max_phys_read_blocks as u64))
        .collect();
    Plan {
        first_block: first,
        skip: (offset - first * bs) as usize,
        steps,
    }
}

/// Adjacent status runs can share a disposition (bad next to non-scraped);
/// merge them so physical reads are as large as the cap allows.
fn merge(a: PlanStep, b: PlanStep) -> Result<PlanStep, (PlanStep, PlanStep)> {
    use PlanStep::*;
    match (a, b) {
        (FromCache { start, end }, FromCache { start: s, end: e }) if end == s => {
            Ok(FromCache { start, end: e })
        }
        (FromDevice { start, end }, FromDevice { start: s, end: e }) if end == s => {
            Ok(FromDevice { start, end: e })
        }
        (Placeholder { start, end }, Placeholder { start: s, end: e }) if end == s => {
            Ok(Placeholder { start, end: e })
        }
        _ => Err((a, b)),
    }
}

fn split_phys(step: PlanStep, max_blocks: u64) -> Vec<PlanStep> {
    match step {
        PlanStep::FromDevice { start, end } if end - start > max_blocks => (start..end)
            .step_by(max_blocks as usize)
            .map(|s| PlanStep::FromDevice {
                start: s,
                end: (s + max_blocks).min(end),
            })
            .collect(),
        other => vec![other],
    }
}
