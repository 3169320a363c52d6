//! Cell allocator.
//!
//! Cells live inside hbins and are sized in 8-byte units including their
//! 4-byte length prefix. The length prefix in the buffer is the source of
//! truth (negative = in use, positive = free); the allocator keeps a derived
//! index of free cells ordered by offset that is rebuilt on open.
//!
//! Policy:
//! - first fit by ascending offset, splitting off the tail when the remainder
//!   is at least [`MIN_CELL_SIZE`]
//! - when nothing fits, a new hbin large enough for the request is appended
//! - freeing merges with the immediately following cell if it is free and in
//!   the same hbin

use crate::buffer::HiveBuffer;
use crate::error::{RegistryError, Result};
use crate::hbin::{HbinCellIterator, HbinHeader, HBIN_ALIGNMENT, HBIN_HEADER_SIZE, MIN_CELL_SIZE};
use crate::header::BASE_BLOCK_SIZE;
use crate::utils::{align_up, cell_offset_to_absolute};
use std::collections::BTreeMap;
use tracing::debug;

/// Returns the total cell size needed to hold `payload_len` bytes.
pub fn cell_size_for(payload_len: usize) -> Result<usize> {
    let size = align_up(payload_len + 4, MIN_CELL_SIZE);
    if size > i32::MAX as usize {
        return Err(RegistryError::AllocationFailed { requested: size });
    }
    Ok(size)
}

/// Byte accounting over every hbin in the hive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CellStats {
    /// Number of hbins.
    pub hbin_count: usize,
    /// Bytes taken by hbin headers.
    pub hbin_header_bytes: u64,
    /// Number of cells in use.
    pub used_cells: usize,
    /// Bytes in cells in use, including length prefixes.
    pub used_bytes: u64,
    /// Number of free cells.
    pub free_cells: usize,
    /// Bytes in free cells, including length prefixes.
    pub free_bytes: u64,
}

impl CellStats {
    /// Base block plus every byte accounted for in the hbins.
    pub fn total_bytes(&self) -> u64 {
        BASE_BLOCK_SIZE as u64 + self.hbin_header_bytes + self.used_bytes + self.free_bytes
    }
}

/// Free-cell index and hbin map for one hive.
#[derive(Debug, Clone)]
pub struct CellAllocator {
    /// Free cells, offset -> total size.
    free_cells: BTreeMap<u32, u32>,
    /// Hbins, offset -> size.
    hbins: BTreeMap<u32, u32>,
    /// End of the last hbin, relative to the first.
    hive_length: u32,
}

impl CellAllocator {
    /// Walks every hbin up to `hive_length` and indexes the free cells.
    ///
    /// # Errors
    ///
    /// Fails on a malformed hbin header, a cell that does not tile its hbin
    /// exactly, or an hbin area that extends past the buffer.
    pub fn scan(buffer: &HiveBuffer, hive_length: u32) -> Result<Self> {
        let data = buffer.as_slice();
        let mut free_cells = BTreeMap::new();
        let mut hbins = BTreeMap::new();
        let mut offset = 0u32;

        while offset < hive_length {
            let abs = cell_offset_to_absolute(offset)? as usize;
            if abs + HBIN_HEADER_SIZE > data.len() {
                return Err(RegistryError::TruncatedData {
                    offset,
                    expected: HBIN_HEADER_SIZE,
                    actual: data.len().saturating_sub(abs),
                });
            }

            let header = HbinHeader::parse(&data[abs..], offset)?;
            let end = abs + header.size as usize;
            if header.end() > hive_length || end > data.len() {
                return Err(RegistryError::TruncatedData {
                    offset,
                    expected: header.size as usize,
                    actual: data.len().saturating_sub(abs),
                });
            }

            for cell in HbinCellIterator::new(&data[abs + HBIN_HEADER_SIZE..end], header.first_cell()) {
                let cell = cell?;
                if !cell.is_allocated {
                    free_cells.insert(cell.offset, cell.size);
                }
            }

            hbins.insert(offset, header.size);
            offset = header.end();
        }

        debug!(
            hbins = hbins.len(),
            free_cells = free_cells.len(),
            "Built free-cell index"
        );

        Ok(Self {
            free_cells,
            hbins,
            hive_length,
        })
    }

    /// Returns the end of the last hbin, relative to the first.
    pub fn hive_length(&self) -> u32 {
        self.hive_length
    }

    /// Iterates over `(offset, size)` of every free cell in offset order.
    pub fn free_cells(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.free_cells.iter().map(|(&o, &s)| (o, s))
    }

    /// Total bytes in free cells.
    pub fn free_bytes(&self) -> u64 {
        self.free_cells.values().map(|&s| u64::from(s)).sum()
    }

    /// Returns `(start, size)` of the hbin containing `offset`.
    pub fn hbin_containing(&self, offset: u32) -> Option<(u32, u32)> {
        self.hbins
            .range(..=offset)
            .next_back()
            .filter(|(&start, &size)| offset < start + size)
            .map(|(&start, &size)| (start, size))
    }

    /// Allocates a zeroed cell able to hold `payload_len` bytes.
    ///
    /// Returns the cell offset. On failure neither the buffer nor the index
    /// has changed.
    pub fn allocate(&mut self, buffer: &mut HiveBuffer, payload_len: usize) -> Result<u32> {
        if !buffer.is_writable() {
            return Err(RegistryError::ReadOnly);
        }

        let needed = cell_size_for(payload_len)? as u32;
        let (offset, size) = match self.first_fit(needed) {
            Some(cell) => cell,
            None => self.grow(buffer, needed)?,
        };

        let remainder = size - needed;
        let cell_size = if remainder as usize >= MIN_CELL_SIZE {
            buffer.write_cell_size(offset + needed, remainder as i32)?;
            needed
        } else {
            size
        };

        buffer.write_cell_size(offset, -(cell_size as i32))?;
        buffer.cell_mut(offset)?.fill(0);

        self.free_cells.remove(&offset);
        if cell_size != size {
            self.free_cells.insert(offset + needed, remainder);
        }

        Ok(offset)
    }

    /// Marks the cell at `offset` free and merges it with a free successor.
    ///
    /// # Errors
    ///
    /// Freeing a cell that is already free is reported as corruption.
    pub fn free(&mut self, buffer: &mut HiveBuffer, offset: u32) -> Result<()> {
        let (size, allocated) = buffer.cell_size(offset)?;
        if !allocated {
            return Err(RegistryError::CellNotAllocated { offset });
        }

        let (hbin_start, hbin_size) = self
            .hbin_containing(offset)
            .ok_or_else(|| RegistryError::invalid_offset(offset, buffer.len()))?;

        let next = offset + size;
        let successor = if next < hbin_start + hbin_size {
            self.free_cells.get(&next).copied()
        } else {
            None
        };

        let merged = size + successor.unwrap_or(0);
        buffer.write_cell_size(offset, merged as i32)?;

        if successor.is_some() {
            self.free_cells.remove(&next);
        }
        self.free_cells.insert(offset, merged);

        Ok(())
    }

    /// Resizes an allocated cell.
    ///
    /// If the existing cell already has room the offset is returned unchanged.
    /// Otherwise a new cell is allocated, the old payload copied over and the
    /// old cell freed; the caller must repoint every reference.
    pub fn reallocate(&mut self, buffer: &mut HiveBuffer, offset: u32, payload_len: usize) -> Result<u32> {
        let (size, allocated) = buffer.cell_size(offset)?;
        if !allocated {
            return Err(RegistryError::CellNotAllocated { offset });
        }

        if cell_size_for(payload_len)? <= size as usize {
            return Ok(offset);
        }

        let old = buffer.read_cell(offset)?.to_vec();
        let new_offset = self.allocate(buffer, payload_len)?;
        let copy_len = old.len().min(payload_len);
        buffer.cell_mut(new_offset)?[..copy_len].copy_from_slice(&old[..copy_len]);
        self.free(buffer, offset)?;

        debug!(
            from = %format!("{:#x}", offset),
            to = %format!("{:#x}", new_offset),
            payload_len,
            "Reallocated cell"
        );

        Ok(new_offset)
    }

    /// Walks every hbin and checks that the free-cell index matches the buffer.
    pub fn verify(&self, buffer: &HiveBuffer) -> Result<CellStats> {
        let data = buffer.as_slice();
        let mut stats = CellStats::default();
        let mut seen_free = 0usize;

        for (&start, &size) in &self.hbins {
            let abs = cell_offset_to_absolute(start)? as usize;
            let end = abs + size as usize;
            if end > data.len() {
                return Err(RegistryError::invalid_offset(start, data.len()));
            }

            stats.hbin_count += 1;
            stats.hbin_header_bytes += HBIN_HEADER_SIZE as u64;

            for cell in HbinCellIterator::new(&data[abs + HBIN_HEADER_SIZE..end], start + HBIN_HEADER_SIZE as u32) {
                let cell = cell?;
                if cell.is_allocated {
                    stats.used_cells += 1;
                    stats.used_bytes += u64::from(cell.size);
                } else {
                    if self.free_cells.get(&cell.offset) != Some(&cell.size) {
                        return Err(RegistryError::format_error(format!(
                            "Free cell {:#x} ({} bytes) missing from index",
                            cell.offset, cell.size
                        )));
                    }
                    seen_free += 1;
                    stats.free_cells += 1;
                    stats.free_bytes += u64::from(cell.size);
                }
            }
        }

        if seen_free != self.free_cells.len() {
            return Err(RegistryError::format_error(format!(
                "Free-cell index holds {} entries, hbins hold {}",
                self.free_cells.len(),
                seen_free
            )));
        }

        Ok(stats)
    }

    fn first_fit(&self, needed: u32) -> Option<(u32, u32)> {
        self.free_cells
            .iter()
            .find(|(_, &size)| size >= needed)
            .map(|(&offset, &size)| (offset, size))
    }

    /// Appends an hbin large enough for a `needed`-byte cell.
    fn grow(&mut self, buffer: &mut HiveBuffer, needed: u32) -> Result<(u32, u32)> {
        let hbin_size = align_up(needed as usize + HBIN_HEADER_SIZE, HBIN_ALIGNMENT);
        let hbin_offset = self.hive_length;
        let new_length = u32::try_from(hbin_size)
            .ok()
            .and_then(|size| hbin_offset.checked_add(size))
            .filter(|&len| cell_offset_to_absolute(len).is_ok())
            .ok_or(RegistryError::AllocationFailed { requested: hbin_size })?;

        let mut block = Vec::new();
        block
            .try_reserve_exact(hbin_size)
            .map_err(|_| RegistryError::AllocationFailed { requested: hbin_size })?;
        block.resize(hbin_size, 0);
        HbinHeader::write_empty(&mut block, hbin_offset);

        let at = cell_offset_to_absolute(hbin_offset)? as usize;
        buffer.insert_block(at, &block)?;

        let cell_offset = hbin_offset + HBIN_HEADER_SIZE as u32;
        let cell_size = (hbin_size - HBIN_HEADER_SIZE) as u32;
        self.hbins.insert(hbin_offset, hbin_size as u32);
        self.free_cells.insert(cell_offset, cell_size);
        self.hive_length = new_length;

        debug!(
            offset = %format!("{:#x}", hbin_offset),
            size = hbin_size,
            "Appended hbin"
        );

        Ok((cell_offset, cell_size))
    }
}
