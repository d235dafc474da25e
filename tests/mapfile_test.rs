// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use blkcache::{BlockStatus, Error, StatusMap};

const BS: u32 = 4096;

/// A mapfile as GNU ddrescue writes it, covering a 40-block device with the
/// full status alphabet.
const DDRESCUE: &str = "\
# Mapfile. Created by GNU ddrescue version 1.27
# Command line: ddrescue -d /dev/sdb hdd.img hdd.map
# Start time:   2024-11-02 14:03:31
# current_pos  current_status  current_pass
0x00014000     /               2
#      pos        size  status
0x00000000  0x00008000  +
0x00008000  0x00001000  -
0x00009000  0x00002000  *
0x0000b000  0x00001000  /
0x0000c000  0x00001000  B
0x0000d000  0x0001b000  ?
";

const SIZE: u64 = 0x28000;

#[test]
fn ddrescue_pair_round_trips_without_loss() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hdd.map");
    std::fs::write(&path, DDRESCUE).unwrap();

    let map = StatusMap::load(&path, SIZE, BS).unwrap();
    let mut out = Vec::new();
    map.save(&mut out).unwrap();
    let rewritten = String::from_utf8(out).unwrap();

    // Every data line survives byte-for-byte; only the header block is
    // regenerated.
    let original_data: Vec<&str> = DDRESCUE
        .lines()
        .filter(|l| !l.starts_with('#'))
        .skip(1)
        .collect();
    let rewritten_data: Vec<&str> = rewritten
        .lines()
        .filter(|l| !l.starts_with('#'))
        .skip(1)
        .collect();
    assert_eq!(original_data, rewritten_data);

    // Freestanding comments are carried through.
    assert!(rewritten.contains("# Command line: ddrescue -d /dev/sdb hdd.img hdd.map"));
    assert!(rewritten.contains("# Start time:   2024-11-02 14:03:31"));

    // And the rewrite loads back to an identical view of every block.
    std::fs::write(&path, &rewritten).unwrap();
    let reloaded = StatusMap::load(&path, SIZE, BS).unwrap();
    for block in 0..map.blocks() {
        assert_eq!(reloaded.status_at(block), map.status_at(block));
    }
    assert_eq!(reloaded.current_pos(), 0x14000);
}

#[test]
fn semantic_folding_of_the_alphabet() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hdd.map");
    std::fs::write(&path, DDRESCUE).unwrap();
    let map = StatusMap::load(&path, SIZE, BS).unwrap();

    assert_eq!(map.status_at(0), BlockStatus::Cached);
    assert_eq!(map.status_at(8), BlockStatus::NonScraped); // -
    assert_eq!(map.status_at(9), BlockStatus::NonScraped); // *
    assert_eq!(map.status_at(11), BlockStatus::NonScraped); // /
    assert_eq!(map.status_at(12), BlockStatus::BadSector);
    assert_eq!(map.status_at(13), BlockStatus::Unread);
}

#[test]
fn absent_mapfile_is_a_fresh_map() {
    let dir = tempfile::tempdir().unwrap();
    let map = StatusMap::load(&dir.path().join("nope.map"), SIZE, BS).unwrap();
    assert_eq!(
        map.range(0, map.blocks()).collect::<Vec<_>>(),
        vec![(0, map.blocks(), BlockStatus::Unread)]
    );
}

#[test]
fn corrupt_mapfiles_are_refused_with_a_location() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.map");

    // Coverage short of the device size.
    std::fs::write(&path, "0x0     ?\n0x0  0x1000  +\n").unwrap();
    match StatusMap::load(&path, SIZE, BS) {
        Err(Error::MapFileCorrupt { path: p, .. }) => assert_eq!(p, path),
        other => panic!("expected MapFileCorrupt, got {other:?}"),
    }

    // Overlapping extents report the offending line.
    std::fs::write(
        &path,
        "0x0     ?\n0x00000000  0x00020000  +\n0x00010000  0x00018000  ?\n",
    )
    .unwrap();
    match StatusMap::load(&path, SIZE, BS) {
        Err(Error::MapFileCorrupt { line, .. }) => assert_eq!(line, 3),
        other => panic!("expected MapFileCorrupt, got {other:?}"),
    }
}
