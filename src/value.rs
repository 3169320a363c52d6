//! Registry value (vk) decoding and encoding.
//!
//! ```text
//! Offset  Size  Field
//! 0x00    2     "vk"
//! 0x02    2     name length
//! 0x04    4     data length (bit 31 set: data stored in the next field)
//! 0x08    4     data offset, or up to four bytes of resident data
//! 0x0C    4     type
//! 0x10    2     flags (0x0001: compressed name)
//! 0x12    2     spare
//! 0x14    n     name
//! ```

use crate::cell::{CellType, ValueType};
use crate::error::{RegistryError, Result};
use crate::name::RegName;
use crate::utils::{read_u16_le, read_u32_le, write_u16_le, write_u32_le};

/// Size of the fixed part of a value key.
pub const VALUE_KEY_MIN_SIZE: usize = 0x14;

/// Largest data length stored inside the vk cell itself.
pub const MAX_RESIDENT_LEN: usize = 4;

const NAME_LENGTH: usize = 0x02;
const DATA_LENGTH: usize = 0x04;
const DATA_OFFSET: usize = 0x08;
const DATA_TYPE: usize = 0x0C;
const FLAGS: usize = 0x10;

const RESIDENT_BIT: u32 = 0x8000_0000;
const VALUE_COMP_NAME: u16 = 0x0001;

/// Where a value's data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLocation {
    /// Up to four bytes held in the vk cell's data-offset field.
    Resident {
        /// The data-offset field, as bytes.
        bytes: [u8; 4],
        /// Number of meaningful bytes.
        len: u8,
    },

    /// Data held in a separate cell (or a big-data chain).
    NonResident {
        /// Cell offset of the data cell.
        offset: u32,
        /// Data length in bytes.
        length: u32,
    },
}

impl DataLocation {
    /// Builds a resident location, or `None` if `data` is too long.
    pub fn resident(data: &[u8]) -> Option<Self> {
        if data.len() > MAX_RESIDENT_LEN {
            return None;
        }
        let mut bytes = [0u8; 4];
        bytes[..data.len()].copy_from_slice(data);
        Some(DataLocation::Resident {
            bytes,
            len: data.len() as u8,
        })
    }

    /// Decodes the raw length and offset fields.
    fn from_fields(raw_length: u32, raw_offset: u32, offset: u32) -> Result<Self> {
        if raw_length & RESIDENT_BIT == 0 {
            return Ok(DataLocation::NonResident {
                offset: raw_offset,
                length: raw_length,
            });
        }

        let len = raw_length & !RESIDENT_BIT;
        if len as usize > MAX_RESIDENT_LEN {
            return Err(RegistryError::InvalidFormat(format!(
                "resident value at {:#x} claims {} bytes",
                offset, len
            )));
        }
        Ok(DataLocation::Resident {
            bytes: raw_offset.to_le_bytes(),
            len: len as u8,
        })
    }

    /// Raw `(data length, data offset)` fields.
    fn to_fields(self) -> (u32, u32) {
        match self {
            DataLocation::Resident { bytes, len } => (RESIDENT_BIT | u32::from(len), u32::from_le_bytes(bytes)),
            DataLocation::NonResident { offset, length } => (length, offset),
        }
    }

    /// Logical data length in bytes.
    pub fn len(&self) -> u32 {
        match self {
            DataLocation::Resident { len, .. } => u32::from(*len),
            DataLocation::NonResident { length, .. } => *length,
        }
    }

    /// True when there is no data at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True for data held inside the vk cell.
    pub fn is_resident(&self) -> bool {
        matches!(self, DataLocation::Resident { .. })
    }
}

/// Value key (vk) structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueKey {
    /// Value name, byte-exact. Empty for the default value.
    pub name: RegName,

    /// Value data type.
    pub data_type: ValueType,

    /// Data placement.
    pub data: DataLocation,

    /// Raw flags.
    pub flags: u16,
}

impl ValueKey {
    /// Parses a value key from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "vk" signature).
    /// * `offset` - Offset of this cell for error reporting.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is malformed or truncated.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        CellType::ValueKey.expect(data, offset)?;

        if data.len() < VALUE_KEY_MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: VALUE_KEY_MIN_SIZE,
                actual: data.len(),
            });
        }

        let name_length = read_u16_le(data, NAME_LENGTH)? as usize;
        let flags = read_u16_le(data, FLAGS)?;

        let name_end = VALUE_KEY_MIN_SIZE + name_length;
        if name_end > data.len() {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: name_end,
                actual: data.len(),
            });
        }

        let location = DataLocation::from_fields(
            read_u32_le(data, DATA_LENGTH)?,
            read_u32_le(data, DATA_OFFSET)?,
            offset,
        )?;

        Ok(ValueKey {
            name: RegName::from_raw(&data[VALUE_KEY_MIN_SIZE..name_end], flags & VALUE_COMP_NAME != 0),
            data_type: ValueType::from(read_u32_le(data, DATA_TYPE)?),
            data: location,
            flags,
        })
    }

    /// Builds the payload of a new value key.
    pub fn encode(name: &RegName, data_type: ValueType, data: DataLocation) -> Result<Vec<u8>> {
        let name_length = u16::try_from(name.len()).map_err(|_| {
            RegistryError::InvalidArgument(format!("value name of {} bytes is too long", name.len()))
        })?;

        let mut cell = vec![0u8; VALUE_KEY_MIN_SIZE + name.len()];
        cell[0..2].copy_from_slice(CellType::ValueKey.signature());
        write_u16_le(&mut cell, NAME_LENGTH, name_length);
        Self::write_data(&mut cell, data);
        write_u32_le(&mut cell, DATA_TYPE, data_type.into());
        if name.is_compressed() {
            write_u16_le(&mut cell, FLAGS, VALUE_COMP_NAME);
        }
        cell[VALUE_KEY_MIN_SIZE..].copy_from_slice(name.as_bytes());

        Ok(cell)
    }

    /// Rewrites the data length and offset fields of an existing vk cell.
    pub fn write_data(cell: &mut [u8], data: DataLocation) {
        let (length, offset) = data.to_fields();
        write_u32_le(cell, DATA_LENGTH, length);
        write_u32_le(cell, DATA_OFFSET, offset);
    }

    /// Rewrites the type field of an existing vk cell.
    pub fn write_type(cell: &mut [u8], data_type: ValueType) {
        write_u32_le(cell, DATA_TYPE, data_type.into());
    }

    /// Logical data length.
    pub fn data_length(&self) -> u32 {
        self.data.len()
    }

    /// True if the name is stored one byte per character.
    pub fn is_name_compressed(&self) -> bool {
        self.flags & VALUE_COMP_NAME != 0
    }
}

/// Reads a value list: a flat array of `count` vk offsets.
pub fn parse_value_list(data: &[u8], count: u32, offset: u32) -> Result<Vec<u32>> {
    let needed = count as usize * 4;
    if data.len() < needed {
        return Err(RegistryError::TruncatedData {
            offset,
            expected: needed,
            actual: data.len(),
        });
    }
    (0..count as usize).map(|i| read_u32_le(data, i * 4)).collect()
}

/// Encodes a value list.
pub fn encode_value_list(offsets: &[u32]) -> Vec<u8> {
    offsets.iter().flat_map(|o| o.to_le_bytes()).collect()
}
