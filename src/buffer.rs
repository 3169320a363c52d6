//! The in-memory hive image.
//!
//! A [`HiveBuffer`] owns every byte of the hive file. Other components address
//! it only through cell offsets (relative to the first hbin), and every access
//! goes through bounds and state validation here.

use crate::error::{RegistryError, Result};
use crate::header::BASE_BLOCK_SIZE;
use crate::utils::{cell_offset_to_absolute, read_i32_le, write_i32_le};
use memmap2::Mmap;

/// Hive data storage.
enum HiveData {
    /// Memory-mapped file data (read-only handles).
    Mapped(Mmap),
    /// Owned data (writable handles and in-memory hives).
    Owned(Vec<u8>),
}

/// Byte buffer holding the full hive file contents.
pub struct HiveBuffer {
    data: HiveData,
    writable: bool,
}

impl HiveBuffer {
    /// Wraps a read-only memory map.
    pub fn from_mmap(mmap: Mmap) -> Self {
        Self {
            data: HiveData::Mapped(mmap),
            writable: false,
        }
    }

    /// Wraps owned bytes.
    pub fn from_vec(data: Vec<u8>, writable: bool) -> Self {
        Self {
            data: HiveData::Owned(data),
            writable,
        }
    }

    /// Returns a slice of the hive data.
    pub fn as_slice(&self) -> &[u8] {
        match &self.data {
            HiveData::Mapped(mmap) => mmap,
            HiveData::Owned(data) => data,
        }
    }

    /// Returns the length of the hive data.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Returns true if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if mutation is permitted.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Copies the hive data out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    /// Returns the mutable backing vector.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::ReadOnly` for read-only handles.
    fn owned_mut(&mut self) -> Result<&mut Vec<u8>> {
        match (&mut self.data, self.writable) {
            (HiveData::Owned(data), true) => Ok(data),
            _ => Err(RegistryError::ReadOnly),
        }
    }

    /// Returns the whole buffer mutably.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        Ok(self.owned_mut()?.as_mut_slice())
    }

    /// Validates a cell offset and returns `(absolute offset, raw size field)`.
    ///
    /// Checks alignment, that the size field lies in the hbin area, and that
    /// the cell extent fits in the buffer.
    pub fn cell_header(&self, offset: u32) -> Result<(usize, i32)> {
        let data = self.as_slice();

        if offset % 4 != 0 {
            return Err(RegistryError::invalid_offset(offset, data.len()));
        }

        let abs_offset = cell_offset_to_absolute(offset)? as usize;
        if abs_offset < BASE_BLOCK_SIZE || abs_offset + 4 > data.len() {
            return Err(RegistryError::invalid_offset(offset, data.len()));
        }

        let size = read_i32_le(data, abs_offset)?;
        let abs_size = size.unsigned_abs() as usize;

        if abs_size < 8 {
            return Err(RegistryError::invalid_cell_size(size, offset));
        }

        if abs_offset + abs_size > data.len() {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: abs_size,
                actual: data.len() - abs_offset,
            });
        }

        Ok((abs_offset, size))
    }

    /// Returns `(total cell size, allocated)` for the cell at `offset`.
    pub fn cell_size(&self, offset: u32) -> Result<(u32, bool)> {
        let (_, size) = self.cell_header(offset)?;
        Ok((size.unsigned_abs(), size < 0))
    }

    /// Reads the payload of an allocated cell (excluding the size field).
    ///
    /// # Errors
    ///
    /// Returns `CellNotAllocated` if the offset names a free cell, which means
    /// some structure holds a dangling reference.
    pub fn read_cell(&self, offset: u32) -> Result<&[u8]> {
        let (abs_offset, size) = self.cell_header(offset)?;
        if size >= 0 {
            return Err(RegistryError::CellNotAllocated { offset });
        }

        let end = abs_offset + size.unsigned_abs() as usize;
        Ok(&self.as_slice()[abs_offset + 4..end])
    }

    /// Reads an allocated cell including its size field.
    pub fn read_cell_with_size(&self, offset: u32) -> Result<&[u8]> {
        let (abs_offset, size) = self.cell_header(offset)?;
        if size >= 0 {
            return Err(RegistryError::CellNotAllocated { offset });
        }

        let end = abs_offset + size.unsigned_abs() as usize;
        Ok(&self.as_slice()[abs_offset..end])
    }

    /// Returns the payload of an allocated cell mutably.
    pub fn cell_mut(&mut self, offset: u32) -> Result<&mut [u8]> {
        let (abs_offset, size) = self.cell_header(offset)?;
        if size >= 0 {
            return Err(RegistryError::CellNotAllocated { offset });
        }

        let end = abs_offset + size.unsigned_abs() as usize;
        Ok(&mut self.owned_mut()?[abs_offset + 4..end])
    }

    /// Rewrites the size field of the cell at `offset`.
    ///
    /// The caller has already validated that `offset` lies inside an hbin.
    pub fn write_cell_size(&mut self, offset: u32, size: i32) -> Result<()> {
        let abs_offset = cell_offset_to_absolute(offset)? as usize;
        let data = self.owned_mut()?;
        if abs_offset + 4 > data.len() {
            return Err(RegistryError::invalid_offset(offset, data.len()));
        }
        write_i32_le(data, abs_offset, size);
        Ok(())
    }

    /// Inserts `block` at absolute position `at`, shifting any trailing bytes.
    ///
    /// Either the whole block is inserted or the buffer is left unchanged.
    pub fn insert_block(&mut self, at: usize, block: &[u8]) -> Result<()> {
        let data = self.owned_mut()?;
        if at > data.len() {
            return Err(RegistryError::invalid_offset(at as u32, data.len()));
        }
        data.try_reserve(block.len())
            .map_err(|_| RegistryError::AllocationFailed { requested: block.len() })?;
        data.splice(at..at, block.iter().copied());
        Ok(())
    }
}
