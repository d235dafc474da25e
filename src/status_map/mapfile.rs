// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! ddrescue mapfile codec.
//!
//! ```text
//! # Mapfile. Created by blkcache
//! # current_pos  current_status
//! 0x00000000     ?
//! #      pos            size    status
//! 0x00000000  0x00001000  +
//! 0x00001000  0x00000200  B
//! ```
//!
//! The first non-comment line is the current position line; every following
//! non-comment line is an extent `pos size status`. Numbers are hexadecimal
//! with a `0x` prefix (decimal is tolerated on input). Extents must be
//! contiguous from offset 0 and cover the device exactly.
//!
//! Parsing is lenient about what it carries and strict about structure:
//! unrecognised single-character statuses are preserved verbatim, comment
//! lines other than the regenerated header survive a rewrite, but any
//! overlap, gap, malformed number or short line is rejected as corrupt.

use std::io;

use super::{SectorStatus, StatusMap};

#[derive(Debug)]
pub(super) struct ParseError {
    pub line: usize,
    pub reason: String,
}

pub(super) fn parse(
    content: &str,
    device_size: u64,
    block_size: u32,
) -> Result<StatusMap, ParseError> {
    let mut map = StatusMap::new(device_size, block_size);
    if content.trim().is_empty() {
        return Ok(map);
    }
    map.transitions.clear();

    let mut pos_line_seen = false;
    let mut covered = 0u64;
    let mut last_status = None;
    let mut lineno = 0;
    for raw in content.lines() {
        lineno += 1;
        let line = raw.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix('#') {
            // Header comments are regenerated on save; everything else is
            // carried through.
            let t = rest.trim_start();
            if !(t.starts_with("Mapfile")
                || t.starts_with("current_pos")
                || t.starts_with("pos"))
            {
                map.comments.push(line.to_owned());
            }
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if !pos_line_seen {
            // `current_pos current_status`, with a trailing current_pass in
            // newer ddrescue versions that we drop.
            if fields.len() < 2 {
                return Err(fail(lineno, "malformed current position line"));
            }
            map.current_pos = number(fields[0]).map_err(|r| fail(lineno, &r))?;
            map.current_status = status(fields[1]).map_err(|r| fail(lineno, &r))?;
            pos_line_seen = true;
            continue;
        }
        if fields.len() != 3 {
            return Err(fail(lineno, "expected `pos size status`"));
        }
        let pos = number(fields[0]).map_err(|r| fail(lineno, &r))?;
        let size = number(fields[1]).map_err(|r| fail(lineno, &r))?;
        let st = status(fields[2]).map_err(|r| fail(lineno, &r))?;
        if pos != covered {
            return Err(fail(
                lineno,
                &format!("extent at {pos:#x} is not contiguous with coverage up to {covered:#x}"),
            ));
        }
        if size == 0 {
            return Err(fail(lineno, "zero-sized extent"));
        }
        covered = pos
            .checked_add(size)
            .ok_or_else(|| fail(lineno, "extent size overflows"))?;
        if covered > device_size {
            return Err(fail(
                lineno,
                &format!("extents cover {covered:#x} but the device is {device_size:#x}"),
            ));
        }
        if last_status != Some(st) {
            map.transitions.insert(pos, st);
            last_status = Some(st);
        }
    }
    if !pos_line_seen {
        return Err(fail(lineno, "missing current position line"));
    }
    if covered != device_size {
        return Err(fail(
            lineno,
            &format!("extents cover {covered:#x} but the device is {device_size:#x}"),
        ));
    }
    // A zero-sized device has no extents; keep the anchoring transition.
    if map.transitions.is_empty() {
        map.transitions.insert(0, SectorStatus::NonTried);
    }
    Ok(map)
}

pub(super) fn emit<W: io::Write>(map: &StatusMap, mut w: W) -> io::Result<()> {
    writeln!(w, "# Mapfile. Created by blkcache")?;
    for comment in &map.comments {
        writeln!(w, "{comment}")?;
    }
    writeln!(w, "# current_pos  current_status")?;
    writeln!(
        w,
        "{:#010x}     {}",
        map.current_pos,
        map.current_status.as_char()
    )?;
    writeln!(w, "#      pos            size    status")?;
    for (start, end, status) in map.sector_runs() {
        writeln!(w, "{:#010x}  {:#010x}  {}", start, end - start, status.as_char())?;
    }
    Ok(())
}

fn fail(line: usize, reason: &str) -> ParseError {
    ParseError {
        line,
        reason: reason.to_owned(),
    }
}

fn number(field: &str) -> Result<u64, String> {
    let (digits, radix) = match field.strip_prefix("0x").or_else(|| field.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (field, 10),
    };
    u64::from_str_radix(digits, radix).map_err(|e| format!("bad number {field:?}: {e}"))
}

fn status(field: &str) -> Result<SectorStatus, String> {
    let mut chars = field.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_graphic() => Ok(SectorStatus::from_char(c)),
        _ => Err(format!("bad status field {field:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::super::{BlockStatus, StatusMap};
    use super::*;

    const SIZE: u64 = 0x4000;
    const BS: u32 = 0x1000;

    const SAMPLE: &str = "\
# Mapfile. Created by GNU ddrescue version 1.27
# Command line: ddrescue /dev/sr0 cd.img cd.map
# current_pos  current_status  current_pass
0x00001000     *               1
#      pos        size  status
0x00000000  0x00001000  +
0x00001000  0x00000200  B
0x00001200  0x00000e00  *
0x00002000  0x00002000  ?
";

    #[test]
    fn parses_a_ddrescue_mapfile() {
        let map = parse(SAMPLE, SIZE, BS).unwrap();
        assert_eq!(map.current_pos(), 0x1000);
        assert_eq!(map.status_at(0), BlockStatus::Cached);
        assert_eq!(map.status_at(1), BlockStatus::BadSector);
        assert_eq!(map.status_at(2), BlockStatus::Unread);
        assert_eq!(map.status_at(3), BlockStatus::Unread);
        assert_eq!(map.comments.len(), 1);
    }

    #[test]
    fn preserves_untouched_statuses_across_a_rewrite() {
        let map = parse(SAMPLE, SIZE, BS).unwrap();
        let mut out = Vec::new();
        map.save(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        // Data lines survive byte-for-byte; only the header block is ours.
        for line in SAMPLE.lines().filter(|l| !l.starts_with('#')).skip(1) {
            assert!(text.contains(line), "missing {line:?} in {text}");
        }
        assert!(text.contains("# Command line: ddrescue /dev/sr0 cd.img cd.map"));
        assert!(text.ends_with("0x00002000  0x00002000  ?\n"));
        // And the rewrite parses back to the same per-block statuses.
        let reloaded = parse(&text, SIZE, BS).unwrap();
        for b in 0..map.blocks() {
            assert_eq!(reloaded.status_at(b), map.status_at(b));
        }
    }

    #[test]
    fn preserves_unknown_status_characters() {
        let content = "\
0x00000000     ?
0x00000000  0x00002000  +
0x00002000  0x00002000  F
";
        let map = parse(content, SIZE, BS).unwrap();
        // `F` is not ours: never trusted as data, but carried on save.
        assert_eq!(map.status_at(2), BlockStatus::Unread);
        let mut out = Vec::new();
        map.save(&mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("0x00002000  0x00002000  F"));
    }

    #[test]
    fn adjacent_equal_extents_coalesce_on_load() {
        let content = "\
0x00000000     ?
0x00000000  0x00001000  +
0x00001000  0x00001000  +
0x00002000  0x00002000  ?
";
        let map = parse(content, SIZE, BS).unwrap();
        assert_eq!(map.transitions.len(), 2);
    }

    #[test]
    fn empty_content_is_a_fresh_map() {
        let map = parse("", SIZE, BS).unwrap();
        assert_eq!(map, StatusMap::new(SIZE, BS));
    }

    #[test]
    fn rejects_structural_damage() {
        // Gap between extents.
        let gap = "0x0     ?\n0x0  0x1000  +\n0x2000  0x2000  ?\n";
        assert!(parse(gap, SIZE, BS).is_err());
        // Overlap / non-monotonic.
        let overlap = "0x0     ?\n0x0  0x2000  +\n0x1000  0x3000  ?\n";
        assert!(parse(overlap, SIZE, BS).is_err());
        // Covered size differs from the device size.
        let short = "0x0     ?\n0x0  0x1000  +\n";
        assert!(parse(short, SIZE, BS).is_err());
        let long = "0x0     ?\n0x0  0x5000  +\n";
        assert!(parse(long, SIZE, BS).is_err());
        // Malformed fields.
        assert!(parse("0x0     ?\n0x0  zzz  +\n", SIZE, BS).is_err());
        assert!(parse("0x0     ?\n0x0  0x4000  ++\n", SIZE, BS).is_err());
        assert!(parse("0x0     ?\n0x0  0x4000\n", SIZE, BS).is_err());
    }

    #[test]
    fn error_reports_the_offending_line() {
        let overlap = "0x0     ?\n0x0  0x2000  +\n0x1000  0x3000  ?\n";
        let err = parse(overlap, SIZE, BS).unwrap_err();
        assert_eq!(err.line, 3);
    }
}
