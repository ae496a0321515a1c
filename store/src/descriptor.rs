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

//! Block descriptors: the copy-on-write mapping entries that make up a
//! store's block-descriptor chain, plus the lighter, bookkeeping-only
//! block-range descriptors from the block-range-list chain.

use zerocopy::{
    little_endian::{U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use vss_err::Result;

pub const FLAG_NORMAL: u32 = 0;
pub const FLAG_FORWARDER: u32 = 1;
pub const FLAG_OVERLAY: u32 = 2;
pub const FLAG_TOMBSTONE: u32 = 4;

pub const BLOCK_DESCRIPTOR_SIZE: usize = 32;
pub const BLOCK_RANGE_DESCRIPTOR_SIZE: usize = 24;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawBlockDescriptor {
    original_offset: U64,
    relative_offset: U64,
    offset: U64,
    flags: U32,
    bitmap: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawBlockRangeDescriptor {
    original_offset: U64,
    offset: U64,
    size: U64,
}

/// A single copy-on-write mapping entry. `descriptor_location` and
/// `list_entry_number` are out-of-band bookkeeping the core attaches once
/// the entry has been placed inside its owning store block; `overlay` is a
/// non-owning link (an index into the same arena) to a paired overlay
/// descriptor, populated by the tree on insertion.
#[derive(Debug, Clone)]
pub struct BlockDescriptor {
    pub original_offset: u64,
    pub relative_offset: u64,
    pub offset: u64,
    pub flags: u32,
    pub bitmap: u32,
    pub descriptor_location: u64,
    pub list_entry_number: u16,
    pub overlay: Option<usize>,
}

impl BlockDescriptor {
    pub fn is_forwarder(&self) -> bool {
        self.flags == FLAG_FORWARDER
    }

    pub fn is_overlay(&self) -> bool {
        self.flags == FLAG_OVERLAY
    }
}

/// Result of parsing one 32-byte slot in a store-index block's payload.
pub enum DescriptorSlot {
    /// An all-zero entry: the owning block's descriptor list ends here.
    EndOfList,
    /// `flags == 4`: a dead slot, skipped but still counted towards
    /// `list_entry_number` for entries after it in the same block.
    Tombstone,
    Descriptor(BlockDescriptor),
}

pub fn parse_block_descriptor(
    bytes: &[u8],
    descriptor_location: u64,
    list_entry_number: u16,
) -> Result<DescriptorSlot> {
    debug_assert_eq!(bytes.len(), BLOCK_DESCRIPTOR_SIZE);
    if bytes.iter().all(|b| *b == 0) {
        return Ok(DescriptorSlot::EndOfList);
    }

    let (raw, _) = RawBlockDescriptor::ref_from_prefix(bytes)
        .map_err(|_| vss_err::Error::BadArgument("block descriptor buffer too short"))?;
    let flags = raw.flags.get();
    if flags == FLAG_TOMBSTONE {
        return Ok(DescriptorSlot::Tombstone);
    }

    Ok(DescriptorSlot::Descriptor(BlockDescriptor {
        original_offset: raw.original_offset.get(),
        relative_offset: raw.relative_offset.get(),
        offset: raw.offset.get(),
        flags,
        bitmap: raw.bitmap.get(),
        descriptor_location,
        list_entry_number,
        overlay: None,
    }))
}

/// A block-range descriptor: observed and tracked in the free-space
/// tracker, never consulted at read/write time.
#[derive(Debug, Clone)]
pub struct BlockRangeDescriptor {
    pub original_offset: u64,
    pub offset: u64,
    pub size: u64,
}

pub fn parse_block_range_descriptor(bytes: &[u8]) -> Result<Option<BlockRangeDescriptor>> {
    debug_assert_eq!(bytes.len(), BLOCK_RANGE_DESCRIPTOR_SIZE);
    if bytes.iter().all(|b| *b == 0) {
        return Ok(None);
    }

    let (raw, _) = RawBlockRangeDescriptor::ref_from_prefix(bytes)
        .map_err(|_| vss_err::Error::BadArgument("block range descriptor buffer too short"))?;
    Ok(Some(BlockRangeDescriptor {
        original_offset: raw.original_offset.get(),
        offset: raw.offset.get(),
        size: raw.size.get(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(original_offset: u64, relative_offset: u64, offset: u64, flags: u32, bitmap: u32) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes[0..8].copy_from_slice(&original_offset.to_le_bytes());
        bytes[8..16].copy_from_slice(&relative_offset.to_le_bytes());
        bytes[16..24].copy_from_slice(&offset.to_le_bytes());
        bytes[24..28].copy_from_slice(&flags.to_le_bytes());
        bytes[28..32].copy_from_slice(&bitmap.to_le_bytes());
        bytes
    }

    #[test]
    fn parses_normal_descriptor() {
        let bytes = encode(0x10000, 0, 0x20000, FLAG_NORMAL, 0);
        match parse_block_descriptor(&bytes, 128, 0).unwrap() {
            DescriptorSlot::Descriptor(d) => {
                assert_eq!(d.original_offset, 0x10000);
                assert_eq!(d.offset, 0x20000);
                assert_eq!(d.flags, FLAG_NORMAL);
            }
            _ => panic!("expected a descriptor"),
        }
    }

    #[test]
    fn all_zero_entry_is_end_of_list() {
        let bytes = [0u8; 32];
        assert!(matches!(
            parse_block_descriptor(&bytes, 128, 0).unwrap(),
            DescriptorSlot::EndOfList
        ));
    }

    #[test]
    fn tombstone_flag_is_recognized() {
        let bytes = encode(0x10000, 0, 0x20000, FLAG_TOMBSTONE, 0);
        assert!(matches!(
            parse_block_descriptor(&bytes, 128, 0).unwrap(),
            DescriptorSlot::Tombstone
        ));
    }

    #[test]
    fn parses_block_range_descriptor() {
        let mut bytes = [0u8; BLOCK_RANGE_DESCRIPTOR_SIZE];
        bytes[0..8].copy_from_slice(&0x10000u64.to_le_bytes());
        bytes[8..16].copy_from_slice(&0x20000u64.to_le_bytes());
        bytes[16..24].copy_from_slice(&0x4000u64.to_le_bytes());
        let range = parse_block_range_descriptor(&bytes).unwrap().unwrap();
        assert_eq!(range.original_offset, 0x10000);
        assert_eq!(range.offset, 0x20000);
        assert_eq!(range.size, 0x4000);
    }
}
