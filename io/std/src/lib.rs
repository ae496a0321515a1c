// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom},
    path::Path,
    sync::Mutex,
};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

use log::trace;
use vss_err::{Error, Result};
use vss_io::{Offset, VolumeIo};

/// `VolumeIo` backed by a `std::fs::File` opened read-write.
///
/// Positioned reads and writes go straight through `FileExt::read_exact_at` /
/// `write_all_at`, which do not touch the file's shared cursor; `seek` is
/// kept on a separate cloned handle purely so callers relying on the
/// capability set described in the store engine's design notes have a real
/// cursor to move.
pub struct FileVolumeIo {
    file: File,
    cursor: Mutex<File>,
}

impl FileVolumeIo {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let cursor = file.try_clone()?;
        Ok(Self {
            file,
            cursor: Mutex::new(cursor),
        })
    }
}

impl VolumeIo for FileVolumeIo {
    fn seek(&self, offset: Offset) -> Result<()> {
        let mut cursor = self
            .cursor
            .lock()
            .map_err(|_| Error::Internal("volume cursor lock poisoned"))?;
        cursor.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn read_at(&self, offset: Offset, buffer: &mut [u8]) -> Result<()> {
        trace!("read_at offset=0x{offset:08x} size={}", buffer.len());
        self.file.read_exact_at(buffer, offset)?;
        Ok(())
    }

    fn write_at(&self, offset: Offset, buffer: &[u8]) -> Result<()> {
        trace!("write_at offset=0x{offset:08x} size={}", buffer.len());
        self.file.write_all_at(buffer, offset)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("vss_io_std_test_{name}_{}", std::process::id()));
        path
    }

    #[test]
    fn write_then_read_round_trips() {
        let path = temp_path("round_trip");
        fs::write(&path, vec![0u8; 4096]).unwrap();

        let io = FileVolumeIo::open(&path).unwrap();
        io.write_at(1024, b"hello store").unwrap();

        let mut buffer = [0u8; 11];
        io.read_at(1024, &mut buffer).unwrap();
        assert_eq!(&buffer, b"hello store");

        fs::remove_file(&path).ok();
    }

    #[test]
    fn read_past_eof_is_io_error() {
        let path = temp_path("eof");
        fs::write(&path, vec![0u8; 16]).unwrap();

        let io = FileVolumeIo::open(&path).unwrap();
        let mut buffer = [0u8; 32];
        assert!(matches!(io.read_at(0, &mut buffer), Err(Error::Io(_))));

        fs::remove_file(&path).ok();
    }

    #[test]
    fn seek_moves_the_cursor_handle() {
        let path = temp_path("seek");
        fs::write(&path, vec![0u8; 64]).unwrap();

        let io = FileVolumeIo::open(&path).unwrap();
        io.seek(32).unwrap();

        fs::remove_file(&path).ok();
    }
}
