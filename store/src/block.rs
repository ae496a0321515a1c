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

//! Store-block reader: decodes the 128-byte header every 16 KiB (or
//! smaller, for read-only catalog/header probes) on-disk unit carries,
//! and hands back the header fields plus the raw payload that follows it.

use log::error;
use zerocopy::{
    little_endian::{U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use vss_err::{Error, Result};
use vss_io::{Offset, VolumeIo};

pub const HEADER_SIZE: usize = 128;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawStoreBlockHeader {
    identifier: [u8; 16],
    version: U32,
    record_type: U32,
    relative_offset: U64,
    offset: U64,
    next_offset: U64,
    reserved: [u8; 80],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Header,
    Catalog,
    StoreIndex,
    StoreHeader,
    StoreBitmap,
    StoreBlockRange,
}

impl RecordType {
    fn from_raw(raw: u32) -> Result<Self> {
        Ok(match raw {
            1 => RecordType::Header,
            2 => RecordType::Catalog,
            3 => RecordType::StoreIndex,
            4 => RecordType::StoreHeader,
            5 => RecordType::StoreBitmap,
            6 => RecordType::StoreBlockRange,
            other => {
                return Err(Error::BadFormat(format!(
                    "unsupported store block record type {other}"
                )))
            }
        })
    }

    pub fn as_raw(self) -> u32 {
        match self {
            RecordType::Header => 1,
            RecordType::Catalog => 2,
            RecordType::StoreIndex => 3,
            RecordType::StoreHeader => 4,
            RecordType::StoreBitmap => 5,
            RecordType::StoreBlockRange => 6,
        }
    }
}

/// A decoded store block: its header fields plus the payload bytes that
/// follow the 128-byte header (`data_size == data.len()`, kept alongside
/// each other for callers that sliced a shorter-than-16-KiB probe read).
#[derive(Debug)]
pub struct StoreBlock {
    pub offset: Offset,
    pub relative_offset: u64,
    pub next_offset: u64,
    pub record_type: RecordType,
    pub data: Vec<u8>,
}

impl StoreBlock {
    pub fn data_size(&self) -> usize {
        self.data.len()
    }
}

/// Reads a store block of `size` bytes at `offset` (`size` is normally
/// 16 KiB; a smaller size is used for read-only catalog/header probes).
pub fn read_store_block<VIO: VolumeIo>(
    io: &VIO,
    offset: Offset,
    size: usize,
) -> Result<StoreBlock> {
    if size < HEADER_SIZE {
        return Err(Error::BadArgument("store block read shorter than header"));
    }
    let mut raw = vec![0u8; size];
    io.read_at(offset, &mut raw)?;

    let (header, _) = RawStoreBlockHeader::ref_from_prefix(&raw[..HEADER_SIZE])
        .map_err(|_| Error::BadArgument("store block header buffer too short"))?;
    let actual_offset = header.offset.get();
    let record_type = RecordType::from_raw(header.record_type.get())?;

    if actual_offset != offset {
        error!(
            "store block header offset 0x{actual_offset:x} does not match requested offset 0x{offset:x}"
        );
        return Err(Error::BadFormat(format!(
            "store block header offset 0x{actual_offset:x} does not match requested offset 0x{offset:x}"
        )));
    }

    let data = raw[HEADER_SIZE..].to_vec();
    Ok(StoreBlock {
        offset: actual_offset,
        relative_offset: header.relative_offset.get(),
        next_offset: header.next_offset.get(),
        record_type,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct MemIo {
        bytes: RefCell<Vec<u8>>,
    }

    impl VolumeIo for MemIo {
        fn seek(&self, _offset: Offset) -> Result<()> {
            Ok(())
        }

        fn read_at(&self, offset: Offset, buffer: &mut [u8]) -> Result<()> {
            let bytes = self.bytes.borrow();
            let start = offset as usize;
            let end = start + buffer.len();
            buffer.copy_from_slice(&bytes[start..end]);
            Ok(())
        }

        fn write_at(&self, offset: Offset, buffer: &[u8]) -> Result<()> {
            let mut bytes = self.bytes.borrow_mut();
            let start = offset as usize;
            bytes[start..start + buffer.len()].copy_from_slice(buffer);
            Ok(())
        }
    }

    fn make_block(record_type: u32, offset: u64, next_offset: u64) -> Vec<u8> {
        let mut raw = vec![0u8; 16 * 1024];
        raw[20..24].copy_from_slice(&record_type.to_le_bytes());
        raw[24..32].copy_from_slice(&0u64.to_le_bytes());
        raw[32..40].copy_from_slice(&offset.to_le_bytes());
        raw[40..48].copy_from_slice(&next_offset.to_le_bytes());
        raw
    }

    #[test]
    fn decodes_header_and_payload() {
        let io = MemIo {
            bytes: RefCell::new(make_block(3, 0x4000, 0x8000)),
        };
        let block = read_store_block(&io, 0x4000, 16 * 1024).unwrap();
        assert_eq!(block.record_type, RecordType::StoreIndex);
        assert_eq!(block.next_offset, 0x8000);
        assert_eq!(block.data_size(), 16 * 1024 - HEADER_SIZE);
    }

    #[test]
    fn rejects_offset_mismatch() {
        let io = MemIo {
            bytes: RefCell::new(make_block(3, 0x4000, 0x8000)),
        };
        assert!(matches!(
            read_store_block(&io, 0x0, 16 * 1024),
            Err(Error::BadFormat(_))
        ));
    }

    #[test]
    fn rejects_unsupported_record_type() {
        let io = MemIo {
            bytes: RefCell::new(make_block(9, 0x4000, 0x8000)),
        };
        assert!(matches!(
            read_store_block(&io, 0x4000, 16 * 1024),
            Err(Error::BadFormat(_))
        ));
    }
}
