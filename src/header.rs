//! Registry hive base block (header) parsing and serialization.
//!
//! The base block is the first 4096 bytes (0x1000) of a registry hive file.
//! It contains metadata about the hive including version, timestamps, the
//! root key cell offset and the total length of the hbin area.

use crate::error::{RegistryError, Result};
use crate::utils::{
    calculate_checksum, filetime_to_datetime, read_fixed_utf16, read_u32_le, read_u64_le,
    write_u32_le, write_u64_le,
};
use std::fmt;

/// Size of the base block in bytes.
pub const BASE_BLOCK_SIZE: usize = 4096;

/// Expected signature for a valid registry hive ("regf").
pub const REGF_SIGNATURE: &[u8; 4] = b"regf";

const PRIMARY_SEQUENCE_OFFSET: usize = 0x04;
const SECONDARY_SEQUENCE_OFFSET: usize = 0x08;
const LAST_WRITTEN_OFFSET: usize = 0x0C;
const ROOT_CELL_OFFSET: usize = 0x24;
const HIVE_LENGTH_OFFSET: usize = 0x28;
const FILE_NAME_OFFSET: usize = 0x30;
const FILE_NAME_LENGTH: usize = 64;

/// Offset of the checksum field in the base block.
pub const CHECKSUM_OFFSET: usize = 0x1FC;

/// Registry hive base block header.
#[derive(Debug, Clone)]
pub struct BaseBlock {
    /// Signature, should be "regf".
    pub signature: [u8; 4],

    /// Primary sequence number.
    pub primary_sequence: u32,

    /// Secondary sequence number.
    pub secondary_sequence: u32,

    /// Last written timestamp (Windows FILETIME).
    pub last_written: u64,

    /// Major version of the hive format.
    pub major_version: u32,

    /// Minor version of the hive format.
    pub minor_version: u32,

    /// File type (0 = normal, 1 = transaction log).
    pub file_type: u32,

    /// File format (1 = direct memory load).
    pub file_format: u32,

    /// Offset to root key cell (relative to first hbin).
    pub root_cell_offset: u32,

    /// Length of the hbin area in bytes (end of the last hbin, relative to 0x1000).
    pub hive_length: u32,

    /// Clustering factor (always 1).
    pub clustering_factor: u32,

    /// File name (embedded, 64 UTF-16LE characters).
    pub file_name: String,

    /// Checksum (XOR of first 508 bytes).
    pub checksum: u32,
}

impl BaseBlock {
    /// Parses and validates a base block, rejecting a checksum mismatch.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Data is too small
    /// - Signature is invalid
    /// - Checksum doesn't match
    /// - Version is unsupported
    pub fn parse(data: &[u8]) -> Result<Self> {
        Self::parse_with(data, true)
    }

    /// Parses a base block, optionally skipping the checksum comparison.
    ///
    /// Skipping the comparison is the recovery path for hives whose header
    /// was damaged after the last clean write.
    pub fn parse_with(data: &[u8], verify_checksum: bool) -> Result<Self> {
        if data.len() < BASE_BLOCK_SIZE {
            return Err(RegistryError::HiveTooSmall {
                size: data.len(),
                minimum: BASE_BLOCK_SIZE,
            });
        }

        let mut signature = [0u8; 4];
        signature.copy_from_slice(&data[0..4]);

        if &signature != REGF_SIGNATURE {
            return Err(RegistryError::invalid_signature(REGF_SIGNATURE, &signature));
        }

        let primary_sequence = read_u32_le(data, PRIMARY_SEQUENCE_OFFSET)?;
        let secondary_sequence = read_u32_le(data, SECONDARY_SEQUENCE_OFFSET)?;
        let last_written = read_u64_le(data, LAST_WRITTEN_OFFSET)?;
        let major_version = read_u32_le(data, 0x14)?;
        let minor_version = read_u32_le(data, 0x18)?;
        let file_type = read_u32_le(data, 0x1C)?;
        let file_format = read_u32_le(data, 0x20)?;
        let root_cell_offset = read_u32_le(data, ROOT_CELL_OFFSET)?;
        let hive_length = read_u32_le(data, HIVE_LENGTH_OFFSET)?;
        let clustering_factor = read_u32_le(data, 0x2C)?;

        let file_name =
            read_fixed_utf16(&data[FILE_NAME_OFFSET..FILE_NAME_OFFSET + FILE_NAME_LENGTH * 2]);

        let checksum = read_u32_le(data, CHECKSUM_OFFSET)?;

        let calculated = calculate_checksum(data);
        if verify_checksum && checksum != calculated {
            return Err(RegistryError::ChecksumMismatch {
                expected: checksum,
                calculated,
            });
        }

        // NT5 (1.3) through NT6 (1.5/1.6) layouts
        if major_version != 1 || !(3..=6).contains(&minor_version) {
            return Err(RegistryError::UnsupportedVersion {
                major: major_version,
                minor: minor_version,
            });
        }

        if hive_length % 4096 != 0 {
            return Err(RegistryError::format_error(format!(
                "Hive length {:#x} is not a multiple of 4096",
                hive_length
            )));
        }

        Ok(BaseBlock {
            signature,
            primary_sequence,
            secondary_sequence,
            last_written,
            major_version,
            minor_version,
            file_type,
            file_format,
            root_cell_offset,
            hive_length,
            clustering_factor,
            file_name,
            checksum,
        })
    }

    /// Writes the mutable header fields back into `data` and recomputes the checksum.
    ///
    /// Only sequence numbers, the timestamp, the root offset and the hive length
    /// are rewritten; every other byte of the base block is left untouched.
    pub fn serialize(&mut self, data: &mut [u8]) -> Result<()> {
        if data.len() < BASE_BLOCK_SIZE {
            return Err(RegistryError::HiveTooSmall {
                size: data.len(),
                minimum: BASE_BLOCK_SIZE,
            });
        }

        write_u32_le(data, PRIMARY_SEQUENCE_OFFSET, self.primary_sequence);
        write_u32_le(data, SECONDARY_SEQUENCE_OFFSET, self.secondary_sequence);
        write_u64_le(data, LAST_WRITTEN_OFFSET, self.last_written);
        write_u32_le(data, ROOT_CELL_OFFSET, self.root_cell_offset);
        write_u32_le(data, HIVE_LENGTH_OFFSET, self.hive_length);

        self.checksum = calculate_checksum(data);
        write_u32_le(data, CHECKSUM_OFFSET, self.checksum);

        Ok(())
    }

    /// Advances both sequence numbers and stamps the write time.
    pub fn begin_commit(&mut self, now: u64) {
        let next = self.primary_sequence.wrapping_add(1);
        self.primary_sequence = next;
        self.secondary_sequence = next;
        self.last_written = now;
    }

    /// Returns true if the hive is in a consistent state.
    ///
    /// The hive is consistent when primary and secondary sequence numbers match.
    pub fn is_consistent(&self) -> bool {
        self.primary_sequence == self.secondary_sequence
    }

    /// Converts the last written timestamp to a human-readable format.
    pub fn last_written_datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        filetime_to_datetime(self.last_written)
    }
}

impl fmt::Display for BaseBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Registry Hive Header:\n\
             - Version: {}.{}\n\
             - Root Cell Offset: {:#x}\n\
             - Hive Length: {} bytes\n\
             - Consistent: {}\n\
             - File Name: {}",
            self.major_version,
            self.minor_version,
            self.root_cell_offset,
            self.hive_length,
            self.is_consistent(),
            self.file_name
        )
    }
}
