//! Utility functions for binary encoding, checksums and time conversion.

use crate::error::{RegistryError, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use encoding_rs::UTF_16LE;
use std::io::Cursor;

/// Offset where hive bins start (after base block)
pub const HBIN_START_OFFSET: u32 = 0x1000;

/// Marker stored in offset fields that reference nothing.
pub const NO_OFFSET: u32 = 0xFFFF_FFFF;

/// Seconds between 1601-01-01 (FILETIME epoch) and 1970-01-01.
const FILETIME_UNIX_DIFF: i64 = 11_644_473_600;

/// Returns true if an offset field refers to a cell.
#[inline]
pub fn is_valid_ref(offset: u32) -> bool {
    offset != NO_OFFSET && offset != 0
}

/// Rounds `value` up to the next multiple of `align` (a power of two).
#[inline]
pub fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Decodes a UTF-16LE string without trimming.
///
/// Key and value names carry an explicit length, so embedded and trailing
/// zero code units are part of the name.
///
/// # Errors
///
/// Returns an error if the data length is odd or the data is not valid UTF-16.
pub fn read_utf16_string(data: &[u8], offset: u32) -> Result<String> {
    if data.is_empty() {
        return Ok(String::new());
    }

    if data.len() % 2 != 0 {
        return Err(RegistryError::InvalidUtf16 { offset });
    }

    match UTF_16LE.decode_without_bom_handling_and_without_replacement(data) {
        Some(decoded) => Ok(decoded.into_owned()),
        None => Err(RegistryError::InvalidUtf16 { offset }),
    }
}

/// Reads a fixed-length UTF-16LE field, stopping at the first terminator.
pub fn read_fixed_utf16(data: &[u8]) -> String {
    let (decoded, _, _) = UTF_16LE.decode(data);
    decoded.split('\0').next().unwrap_or_default().to_string()
}

/// Reads a u32 from a byte slice at the given offset.
pub fn read_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    if offset + 4 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 4,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 4]);
    Ok(cursor.read_u32::<LittleEndian>()?)
}

/// Reads a u16 from a byte slice at the given offset.
pub fn read_u16_le(data: &[u8], offset: usize) -> Result<u16> {
    if offset + 2 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 2,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 2]);
    Ok(cursor.read_u16::<LittleEndian>()?)
}

/// Reads an i32 from a byte slice at the given offset.
pub fn read_i32_le(data: &[u8], offset: usize) -> Result<i32> {
    if offset + 4 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 4,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 4]);
    Ok(cursor.read_i32::<LittleEndian>()?)
}

/// Reads a u64 from a byte slice at the given offset.
pub fn read_u64_le(data: &[u8], offset: usize) -> Result<u64> {
    if offset + 8 > data.len() {
        return Err(RegistryError::TruncatedData {
            offset: offset as u32,
            expected: 8,
            actual: data.len().saturating_sub(offset),
        });
    }

    let mut cursor = Cursor::new(&data[offset..offset + 8]);
    Ok(cursor.read_u64::<LittleEndian>()?)
}

/// Writes a u16 at the given offset. The caller guarantees the range is in bounds.
#[inline]
pub fn write_u16_le(data: &mut [u8], offset: usize, value: u16) {
    LittleEndian::write_u16(&mut data[offset..offset + 2], value);
}

/// Writes a u32 at the given offset. The caller guarantees the range is in bounds.
#[inline]
pub fn write_u32_le(data: &mut [u8], offset: usize, value: u32) {
    LittleEndian::write_u32(&mut data[offset..offset + 4], value);
}

/// Writes an i32 at the given offset. The caller guarantees the range is in bounds.
#[inline]
pub fn write_i32_le(data: &mut [u8], offset: usize, value: i32) {
    LittleEndian::write_i32(&mut data[offset..offset + 4], value);
}

/// Writes a u64 at the given offset. The caller guarantees the range is in bounds.
#[inline]
pub fn write_u64_le(data: &mut [u8], offset: usize, value: u64) {
    LittleEndian::write_u64(&mut data[offset..offset + 8], value);
}

/// Calculates the base block checksum.
///
/// XOR of the first 127 little-endian dwords. The two values Windows reserves
/// are remapped: 0xFFFFFFFF becomes 0xFFFFFFFE and 0 becomes 1.
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut checksum = data[..0x1FC.min(data.len())]
        .chunks_exact(4)
        .fold(0u32, |acc, word| acc ^ LittleEndian::read_u32(word));

    if checksum == 0xFFFF_FFFF {
        checksum = 0xFFFF_FFFE;
    } else if checksum == 0 {
        checksum = 1;
    }

    checksum
}

/// Converts a relative cell offset to an absolute hive offset.
///
/// Cell offsets in the registry are relative to the first hbin (at 0x1000).
///
/// # Errors
///
/// Returns `RegistryError::InvalidOffset` if the offset would overflow.
#[inline]
pub fn cell_offset_to_absolute(cell_offset: u32) -> Result<u32> {
    cell_offset
        .checked_add(HBIN_START_OFFSET)
        .ok_or(RegistryError::InvalidOffset {
            offset: cell_offset,
            hive_size: 0,
        })
}

/// Converts an absolute hive offset to a relative cell offset.
///
/// # Errors
///
/// Returns `RegistryError::InvalidFormat` if the offset is before hbin start.
#[inline]
pub fn absolute_to_cell_offset(absolute_offset: u32) -> Result<u32> {
    if absolute_offset < HBIN_START_OFFSET {
        return Err(RegistryError::InvalidFormat(format!(
            "Absolute offset {:#x} is before hbin start",
            absolute_offset
        )));
    }
    Ok(absolute_offset - HBIN_START_OFFSET)
}

/// Converts a FILETIME (100ns ticks since 1601) to a UTC timestamp.
pub fn filetime_to_datetime(filetime: u64) -> Option<chrono::DateTime<chrono::Utc>> {
    let seconds = (filetime / 10_000_000) as i64 - FILETIME_UNIX_DIFF;
    let nanos = ((filetime % 10_000_000) * 100) as u32;

    chrono::DateTime::from_timestamp(seconds, nanos)
}

/// Returns the current time as a FILETIME.
pub fn filetime_now() -> u64 {
    let now = chrono::Utc::now();
    let seconds = (now.timestamp() + FILETIME_UNIX_DIFF).max(0) as u64;
    seconds * 10_000_000 + u64::from(now.timestamp_subsec_nanos() / 100)
}
