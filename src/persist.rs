// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Crash-safe checkpointing.
//!
//! The crash model: after a crash at any point, every block the on-disk map
//! marks cached must be durably present in the image. The ordering below
//! guarantees it — the image is synced before the map that names its
//! contents is renamed into place. A block written to the image but not yet
//! named by a checkpointed map merely degrades to non-tried on recovery.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::cache_file::CacheFile;
use crate::errors::Error;
use crate::status_map::StatusMap;

pub(crate) fn checkpoint(
    status: &StatusMap,
    cache: &CacheFile,
    map_path: &Path,
) -> Result<(), Error> {
    cache.sync()?;
    write_map_atomic(status, map_path)
}

/// Serialise to `<map>.tmp`, fsync, rename over the map, fsync the
/// directory. Readers of the map path never observe a torn file.
pub(crate) fn write_map_atomic(status: &StatusMap, map_path: &Path) -> Result<(), Error> {
    let tmp = tmp_path(map_path);
    {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(&file);
        status.save(&mut writer)?;
        writer.flush()?;
        file.sync_all()?;
    }
    fs::rename(&tmp, map_path)?;
    sync_parent_dir(map_path)?;
    trace!(map = %map_path.display(), "map checkpoint written");
    Ok(())
}

fn tmp_path(map_path: &Path) -> PathBuf {
    let mut os = map_path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// The rename itself has to be made durable, or a crash can forget it.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_map::BlockStatus;

    #[test]
    fn checkpoint_replaces_the_map_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let map_path = dir.path().join("disc.map");
        let mut status = StatusMap::new(0x4000, 0x1000);
        write_map_atomic(&status, &map_path).unwrap();

        status.set(0, 2, BlockStatus::Cached);
        write_map_atomic(&status, &map_path).unwrap();

        let reloaded = StatusMap::load(&map_path, 0x4000, 0x1000).unwrap();
        assert_eq!(reloaded.status_at(0), BlockStatus::Cached);
        assert_eq!(reloaded.status_at(2), BlockStatus::Unread);
        assert!(!tmp_path(&map_path).exists());
    }

    #[test]
    fn tmp_lives_next_to_the_map() {
        assert_eq!(
            tmp_path(Path::new("/data/disc.map")),
            Path::new("/data/disc.map.tmp")
        );
    }
}
