//! Big data block (db) chains.
//!
//! Registry values larger than 16,344 bytes (on hives of minor version 4 and
//! later) are stored as a header cell, a cell listing segment offsets and the
//! segments themselves.
//!
//! ```text
//! Offset  Size  Description
//! 0x00    2     Signature ("db")
//! 0x02    2     Number of segments
//! 0x04    4     Offset to segment list
//! ```

use crate::alloc::CellAllocator;
use crate::buffer::HiveBuffer;
use crate::cell::CellType;
use crate::error::{RegistryError, Result};
use crate::utils::{read_u16_le, read_u32_le, write_u16_le, write_u32_le};

/// Bytes of value data carried by one segment.
pub const BIG_DATA_SEGMENT_SIZE: usize = 16344;

/// First minor version that understands big data.
pub const BIG_DATA_MIN_MINOR_VERSION: u32 = 4;

/// Big data block header structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigDataBlock {
    /// Number of data segments
    pub segment_count: u16,

    /// Offset to the list of segment offsets
    pub segment_list_offset: u32,
}

impl BigDataBlock {
    /// Size of a big data block header
    const SIZE: usize = 8;

    /// Parses a big data block header from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "db" signature)
    /// * `offset` - Offset of this cell for error reporting
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        CellType::DataBlock.expect(data, offset)?;

        if data.len() < Self::SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: Self::SIZE,
                actual: data.len(),
            });
        }

        Ok(BigDataBlock {
            segment_count: read_u16_le(data, 0x02)?,
            segment_list_offset: read_u32_le(data, 0x04)?,
        })
    }

    /// Encodes the header cell payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = vec![0u8; Self::SIZE];
        data[0..2].copy_from_slice(CellType::DataBlock.signature());
        write_u16_le(&mut data, 0x02, self.segment_count);
        write_u32_le(&mut data, 0x04, self.segment_list_offset);
        data
    }
}

/// True if a value of `length` bytes must be stored as a chain on this hive version.
pub fn needs_big_data(length: usize, minor_version: u32) -> bool {
    minor_version >= BIG_DATA_MIN_MINOR_VERSION && length > BIG_DATA_SEGMENT_SIZE
}

/// True if the data cell at `offset` holding `length` bytes is a chain header.
pub fn is_big_data(buffer: &HiveBuffer, offset: u32, length: u32, minor_version: u32) -> Result<bool> {
    if !needs_big_data(length as usize, minor_version) {
        return Ok(false);
    }
    let cell = buffer.read_cell(offset)?;
    Ok(cell.len() >= 2 && &cell[0..2] == CellType::DataBlock.signature())
}

fn segment_offsets(buffer: &HiveBuffer, block: &BigDataBlock) -> Result<Vec<u32>> {
    let list = buffer.read_cell(block.segment_list_offset)?;
    let count = block.segment_count as usize;
    if list.len() < count * 4 {
        return Err(RegistryError::TruncatedData {
            offset: block.segment_list_offset,
            expected: count * 4,
            actual: list.len(),
        });
    }
    (0..count).map(|i| read_u32_le(list, i * 4)).collect()
}

/// Reassembles `length` bytes from the chain headed at `offset`.
pub fn read(buffer: &HiveBuffer, offset: u32, length: u32) -> Result<Vec<u8>> {
    let block = BigDataBlock::parse(buffer.read_cell(offset)?, offset)?;
    let length = length as usize;

    let mut data = Vec::with_capacity(length);
    for segment in segment_offsets(buffer, &block)? {
        let cell = buffer.read_cell(segment)?;
        let take = cell.len().min(BIG_DATA_SEGMENT_SIZE).min(length - data.len());
        data.extend_from_slice(&cell[..take]);
        if data.len() == length {
            break;
        }
    }

    if data.len() != length {
        return Err(RegistryError::TruncatedData {
            offset,
            expected: length,
            actual: data.len(),
        });
    }
    Ok(data)
}

/// Every cell of the chain headed at `offset`, header first.
pub fn chain_cells(buffer: &HiveBuffer, offset: u32) -> Result<Vec<u32>> {
    let block = BigDataBlock::parse(buffer.read_cell(offset)?, offset)?;
    let mut cells = vec![offset, block.segment_list_offset];
    cells.extend(segment_offsets(buffer, &block)?);
    Ok(cells)
}

/// Writes `data` as a new chain and returns the header offset.
///
/// On error every cell allocated so far is freed again.
pub fn write(buffer: &mut HiveBuffer, alloc: &mut CellAllocator, data: &[u8]) -> Result<u32> {
    let mut allocated = Vec::new();
    match write_chain(buffer, alloc, data, &mut allocated) {
        Ok(offset) => Ok(offset),
        Err(e) => {
            for cell in allocated.into_iter().rev() {
                alloc.free(buffer, cell)?;
            }
            Err(e)
        }
    }
}

fn write_chain(
    buffer: &mut HiveBuffer,
    alloc: &mut CellAllocator,
    data: &[u8],
    allocated: &mut Vec<u32>,
) -> Result<u32> {
    let segment_count = u16::try_from((data.len() + BIG_DATA_SEGMENT_SIZE - 1) / BIG_DATA_SEGMENT_SIZE)
        .map_err(|_| RegistryError::InvalidArgument(format!("value of {} bytes is too large", data.len())))?;

    let mut segments = Vec::with_capacity(segment_count as usize);
    for chunk in data.chunks(BIG_DATA_SEGMENT_SIZE) {
        let segment = alloc.allocate(buffer, chunk.len())?;
        allocated.push(segment);
        buffer.cell_mut(segment)?[..chunk.len()].copy_from_slice(chunk);
        segments.push(segment);
    }

    let list: Vec<u8> = segments.iter().flat_map(|s| s.to_le_bytes()).collect();
    let list_offset = alloc.allocate(buffer, list.len())?;
    allocated.push(list_offset);
    buffer.cell_mut(list_offset)?[..list.len()].copy_from_slice(&list);

    let header = BigDataBlock {
        segment_count,
        segment_list_offset: list_offset,
    }
    .encode();
    let header_offset = alloc.allocate(buffer, header.len())?;
    allocated.push(header_offset);
    buffer.cell_mut(header_offset)?[..header.len()].copy_from_slice(&header);

    Ok(header_offset)
}
