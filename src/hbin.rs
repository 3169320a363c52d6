//! Hive bin (hbin) blocks.
//!
//! Hive bins are 4KB-aligned blocks that contain registry cells. Each hbin
//! has a 32-byte header followed by a contiguous run of cells that exactly
//! fills the rest of the block.

use crate::error::{RegistryError, Result};
use crate::utils::{read_i32_le, read_u32_le, read_u64_le, write_i32_le, write_u32_le};

/// Expected signature for hive bins ("hbin").
pub const HBIN_SIGNATURE: &[u8; 4] = b"hbin";

/// Size of an hbin header.
pub const HBIN_HEADER_SIZE: usize = 0x20;

/// Hbins are allocated in multiples of this size.
pub const HBIN_ALIGNMENT: usize = 0x1000;

/// Smallest legal cell (size field plus one 4-byte slot, 8-byte granular).
pub const MIN_CELL_SIZE: usize = 8;

/// Hive bin header structure.
#[derive(Debug, Clone)]
pub struct HbinHeader {
    /// Signature, should be "hbin".
    pub signature: [u8; 4],

    /// Offset of this hbin from the start of the hive bins (relative to 0x1000).
    pub offset: u32,

    /// Size of this hbin in bytes (including header).
    pub size: u32,

    /// Timestamp (Windows FILETIME), only meaningful in the first hbin.
    pub timestamp: u64,
}

impl HbinHeader {
    /// Parses an hbin header from raw bytes.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw bytes starting at the hbin header.
    /// * `expected_offset` - Expected offset value for validation.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Data is too small
    /// - Signature is invalid
    /// - Offset doesn't match expected value
    /// - Size is not a non-zero multiple of 4096
    pub fn parse(data: &[u8], expected_offset: u32) -> Result<Self> {
        if data.len() < HBIN_HEADER_SIZE {
            return Err(RegistryError::TruncatedData {
                offset: expected_offset,
                expected: HBIN_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let mut signature = [0u8; 4];
        signature.copy_from_slice(&data[0..4]);

        if &signature != HBIN_SIGNATURE {
            return Err(RegistryError::invalid_signature(HBIN_SIGNATURE, &signature));
        }

        let offset = read_u32_le(data, 0x04)?;
        let size = read_u32_le(data, 0x08)?;

        if offset != expected_offset {
            return Err(RegistryError::InvalidFormat(format!(
                "Hbin offset mismatch: expected {:#x}, found {:#x}",
                expected_offset, offset
            )));
        }

        if size == 0 || size as usize % HBIN_ALIGNMENT != 0 {
            return Err(RegistryError::InvalidFormat(format!(
                "Hbin at {:#x} has invalid size {:#x}",
                offset, size
            )));
        }

        if offset.checked_add(size).is_none() {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: size as usize,
                actual: data.len(),
            });
        }

        let timestamp = read_u64_le(data, 0x14)?;

        Ok(HbinHeader {
            signature,
            offset,
            size,
            timestamp,
        })
    }

    /// Writes a fresh hbin into `block`: header plus one free cell spanning the rest.
    ///
    /// `block` must be exactly the size of the new hbin.
    pub fn write_empty(block: &mut [u8], offset: u32) {
        let size = block.len();
        block.fill(0);
        block[0..4].copy_from_slice(HBIN_SIGNATURE);
        write_u32_le(block, 0x04, offset);
        write_u32_le(block, 0x08, size as u32);
        write_i32_le(block, HBIN_HEADER_SIZE, (size - HBIN_HEADER_SIZE) as i32);
    }

    /// Relative offset of the first cell in this hbin.
    pub fn first_cell(&self) -> u32 {
        self.offset + HBIN_HEADER_SIZE as u32
    }

    /// Relative offset one past the last byte of this hbin.
    pub fn end(&self) -> u32 {
        self.offset + self.size
    }

    /// Returns the size of the data area (excluding the header).
    pub fn data_size(&self) -> u32 {
        self.size.saturating_sub(HBIN_HEADER_SIZE as u32)
    }
}

/// Iterator over cells within an hbin.
///
/// Yields an error and stops at the first malformed cell.
pub struct HbinCellIterator<'a> {
    data: &'a [u8],
    offset: usize,
    hbin_offset: u32,
    failed: bool,
}

impl<'a> HbinCellIterator<'a> {
    /// Creates a new cell iterator for an hbin's data area.
    ///
    /// # Arguments
    ///
    /// * `data` - The hbin's data area (excluding header).
    /// * `data_offset` - Relative offset of the first byte of `data`.
    pub fn new(data: &'a [u8], data_offset: u32) -> Self {
        Self {
            data,
            offset: 0,
            hbin_offset: data_offset,
            failed: false,
        }
    }
}

impl<'a> Iterator for HbinCellIterator<'a> {
    type Item = Result<CellInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }

        let cell_offset = self.hbin_offset + self.offset as u32;
        let size = match read_i32_le(self.data, self.offset) {
            Ok(s) => s,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };

        let abs_size = size.unsigned_abs() as usize;
        if abs_size < MIN_CELL_SIZE || abs_size % MIN_CELL_SIZE != 0 {
            self.failed = true;
            return Some(Err(RegistryError::invalid_cell_size(size, cell_offset)));
        }

        let data_end = self.offset + abs_size;
        if data_end > self.data.len() {
            self.failed = true;
            return Some(Err(RegistryError::TruncatedData {
                offset: cell_offset,
                expected: abs_size,
                actual: self.data.len() - self.offset,
            }));
        }

        self.offset = data_end;
        Some(Ok(CellInfo {
            offset: cell_offset,
            size: abs_size as u32,
            is_allocated: size < 0,
        }))
    }
}

/// Location and state of a cell within an hbin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellInfo {
    /// Offset of this cell from the first hbin.
    pub offset: u32,

    /// Size of the cell (including the size field).
    pub size: u32,

    /// Whether this cell is allocated (true) or free (false).
    pub is_allocated: bool,
}
