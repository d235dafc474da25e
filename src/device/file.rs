// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fs::File;
use std::io;
use std::path::Path;

use positioned_io::{RandomAccessFile, ReadAt};
use tracing::debug;

use super::{RawDevice, RawError};

/// A source backed by a regular file or a block device node.
///
/// Reads go through [`ReadAt`], so concurrent open handles elsewhere in the
/// process never disturb a shared cursor. On Unix an `EIO` from the kernel is
/// reported as a medium error; that is what a failing disk or an unreadable
/// optical sector surfaces as through the block layer.
pub struct FileDevice {
    file: RandomAccessFile,
    size: u64,
    block_size: u32,
}

impl FileDevice {
    pub fn open(path: &Path, block_size: u32) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        debug!(path = %path.display(), size, block_size, "opened raw device");
        Ok(Self {
            file: RandomAccessFile::try_new(file)?,
            size,
            block_size,
        })
    }
}

impl RawDevice for FileDevice {
    fn size(&self) -> u64 {
        self.size
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read(&mut self, offset: u64, length: usize) -> Result<Vec<u8>, RawError> {
        let mut buf = vec![0u8; length];
        let mut got = 0;
        while got < length {
            match self.file.read_at(offset + got as u64, &mut buf[got..]) {
                Ok(0) => return Err(RawError::ShortRead { got }),
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_medium_error(&e) => {
                    return Err(RawError::Medium { offset, length });
                }
                Err(e) => return Err(RawError::Other(e)),
            }
        }
        Ok(buf)
    }
}

fn is_medium_error(e: &io::Error) -> bool {
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(libc::EIO)
    }
    #[cfg(not(unix))]
    {
        let _ = e;
        false
    }
}
