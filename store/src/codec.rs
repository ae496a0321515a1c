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

//! Small byte-slice helpers shared by the block, descriptor and store
//! readers. Every accessor bounds-checks against the slice it is given and
//! reports `BadArgument` rather than panicking, since slices here are always
//! fixed-size windows carved out of a caller-supplied buffer.

use vss_err::{Error, Result};

/// 1601-01-01 00:00:00 UTC expressed in Unix seconds, the epoch FILETIME
/// ticks (100 ns units since that date) are relative to.
const FILETIME_EPOCH_OFFSET_SECS: i64 = 11_644_473_600;

pub fn read_u16(buffer: &[u8], offset: usize) -> Result<u16> {
    let bytes = buffer
        .get(offset..offset + 2)
        .ok_or(Error::BadArgument("read_u16 out of bounds"))?;
    Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
}

pub fn read_u32(buffer: &[u8], offset: usize) -> Result<u32> {
    let bytes = buffer
        .get(offset..offset + 4)
        .ok_or(Error::BadArgument("read_u32 out of bounds"))?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

pub fn read_u64(buffer: &[u8], offset: usize) -> Result<u64> {
    let bytes = buffer
        .get(offset..offset + 8)
        .ok_or(Error::BadArgument("read_u64 out of bounds"))?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

pub fn write_u16(buffer: &mut [u8], offset: usize, value: u16) -> Result<()> {
    let slot = buffer
        .get_mut(offset..offset + 2)
        .ok_or(Error::BadArgument("write_u16 out of bounds"))?;
    slot.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn write_u32(buffer: &mut [u8], offset: usize, value: u32) -> Result<()> {
    let slot = buffer
        .get_mut(offset..offset + 4)
        .ok_or(Error::BadArgument("write_u32 out of bounds"))?;
    slot.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn write_u64(buffer: &mut [u8], offset: usize, value: u64) -> Result<()> {
    let slot = buffer
        .get_mut(offset..offset + 8)
        .ok_or(Error::BadArgument("write_u64 out of bounds"))?;
    slot.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn read_guid(buffer: &[u8], offset: usize) -> Result<[u8; 16]> {
    let bytes = buffer
        .get(offset..offset + 16)
        .ok_or(Error::BadArgument("read_guid out of bounds"))?;
    let mut guid = [0u8; 16];
    guid.copy_from_slice(bytes);
    Ok(guid)
}

/// Decodes a 16-bit-length-prefixed UTF-16LE string starting at `offset`,
/// failing with `Corrupt` if the declared length would run past `buffer`'s
/// end rather than silently truncating.
pub fn read_length_prefixed_utf16(buffer: &[u8], offset: usize) -> Result<(String, usize)> {
    let length = read_u16(buffer, offset)? as usize;
    let start = offset + 2;
    let end = start + length;
    let bytes = buffer
        .get(start..end)
        .ok_or_else(|| Error::Corrupt("length-prefixed string runs past block end".into()))?;
    let units = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    let value: String = char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect();
    Ok((value, end))
}

/// Converts raw FILETIME ticks (100 ns units since 1601-01-01) to Unix
/// seconds. The raw value is what store headers actually carry; this is
/// offered purely as a convenience for callers that want a calendar time.
pub fn filetime_ticks_to_unix_seconds(ticks: u64) -> i64 {
    (ticks / 10_000_000) as i64 - FILETIME_EPOCH_OFFSET_SECS
}
