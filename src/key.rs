//! Registry key node (nk) decoding and encoding.
//!
//! ```text
//! Offset  Size  Field
//! 0x00    2     "nk"
//! 0x02    2     flags
//! 0x04    8     last written (FILETIME)
//! 0x0C    4     access bits
//! 0x10    4     parent
//! 0x14    4     subkey count
//! 0x18    4     volatile subkey count
//! 0x1C    4     subkey list
//! 0x20    4     volatile subkey list
//! 0x24    4     value count
//! 0x28    4     value list
//! 0x2C    4     security (sk)
//! 0x30    4     class name
//! 0x34    4     max subkey name length
//! 0x38    4     max subkey class length
//! 0x3C    4     max value name length
//! 0x40    4     max value data length
//! 0x44    4     work var
//! 0x48    2     name length
//! 0x4A    2     class name length
//! 0x4C    n     name
//! ```

use crate::cell::{CellType, KeyNodeFlags};
use crate::error::{RegistryError, Result};
use crate::name::RegName;
use crate::utils::{read_u16_le, read_u32_le, read_u64_le, write_u16_le, write_u32_le, write_u64_le, NO_OFFSET};

/// Size of the fixed part of a key node.
pub const KEY_NODE_MIN_SIZE: usize = 0x4C;

const FLAGS: usize = 0x02;
const LAST_WRITTEN: usize = 0x04;
const PARENT: usize = 0x10;
const SUBKEY_COUNT: usize = 0x14;
const VOLATILE_SUBKEY_COUNT: usize = 0x18;
const SUBKEY_LIST: usize = 0x1C;
const VOLATILE_SUBKEY_LIST: usize = 0x20;
const VALUE_COUNT: usize = 0x24;
const VALUE_LIST: usize = 0x28;
const SECURITY: usize = 0x2C;
const CLASS_NAME: usize = 0x30;
const MAX_SUBKEY_NAME: usize = 0x34;
const MAX_VALUE_NAME: usize = 0x3C;
const MAX_VALUE_DATA: usize = 0x40;
const NAME_LENGTH: usize = 0x48;
const CLASS_NAME_LENGTH: usize = 0x4A;

/// Key node (nk) structure.
#[derive(Debug, Clone)]
pub struct KeyNode {
    /// Flags for this key.
    pub flags: KeyNodeFlags,

    /// Last written timestamp (Windows FILETIME).
    pub last_written: u64,

    /// Offset to parent key node.
    pub parent_offset: u32,

    /// Number of subkeys.
    pub subkey_count: u32,

    /// Number of volatile subkeys.
    pub volatile_subkey_count: u32,

    /// Offset to subkey list.
    pub subkey_list_offset: u32,

    /// Offset to volatile subkey list.
    pub volatile_subkey_list_offset: u32,

    /// Number of values.
    pub value_count: u32,

    /// Offset to value list.
    pub value_list_offset: u32,

    /// Offset to security descriptor.
    pub security_offset: u32,

    /// Offset to class name.
    pub class_name_offset: u32,

    /// Maximum length of subkey name.
    pub max_subkey_name_len: u32,

    /// Maximum length of value name.
    pub max_value_name_len: u32,

    /// Maximum length of value data.
    pub max_value_data_len: u32,

    /// Length of class name in bytes.
    pub class_name_length: u16,

    /// Key name, byte-exact.
    pub name: RegName,
}

impl KeyNode {
    /// Parses a key node from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field, starting with "nk" signature).
    /// * `offset` - Offset of this cell for error reporting.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        CellType::KeyNode.expect(data, offset)?;

        if data.len() < KEY_NODE_MIN_SIZE {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: KEY_NODE_MIN_SIZE,
                actual: data.len(),
            });
        }

        let flags = KeyNodeFlags::new(read_u16_le(data, FLAGS)?);
        let name_length = read_u16_le(data, NAME_LENGTH)? as usize;

        let name_end = KEY_NODE_MIN_SIZE + name_length;
        if name_end > data.len() {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: name_end,
                actual: data.len(),
            });
        }

        let name = RegName::from_raw(&data[KEY_NODE_MIN_SIZE..name_end], flags.is_compressed());

        Ok(KeyNode {
            flags,
            last_written: read_u64_le(data, LAST_WRITTEN)?,
            parent_offset: read_u32_le(data, PARENT)?,
            subkey_count: read_u32_le(data, SUBKEY_COUNT)?,
            volatile_subkey_count: read_u32_le(data, VOLATILE_SUBKEY_COUNT)?,
            subkey_list_offset: read_u32_le(data, SUBKEY_LIST)?,
            volatile_subkey_list_offset: read_u32_le(data, VOLATILE_SUBKEY_LIST)?,
            value_count: read_u32_le(data, VALUE_COUNT)?,
            value_list_offset: read_u32_le(data, VALUE_LIST)?,
            security_offset: read_u32_le(data, SECURITY)?,
            class_name_offset: read_u32_le(data, CLASS_NAME)?,
            max_subkey_name_len: read_u32_le(data, MAX_SUBKEY_NAME)?,
            max_value_name_len: read_u32_le(data, MAX_VALUE_NAME)?,
            max_value_data_len: read_u32_le(data, MAX_VALUE_DATA)?,
            class_name_length: read_u16_le(data, CLASS_NAME_LENGTH)?,
            name,
        })
    }

    /// Builds the payload of a new, empty key node.
    ///
    /// The key has no values, no subkeys and no class name.
    pub fn encode_new(name: &RegName, parent: u32, security: u32, timestamp: u64) -> Result<Vec<u8>> {
        let name_length = u16::try_from(name.len()).map_err(|_| {
            RegistryError::InvalidArgument(format!("key name of {} bytes is too long", name.len()))
        })?;

        let mut data = vec![0u8; KEY_NODE_MIN_SIZE + name.len()];
        data[0..2].copy_from_slice(CellType::KeyNode.signature());

        let flags = if name.is_compressed() {
            KeyNodeFlags::COMP_NAME
        } else {
            0
        };
        write_u16_le(&mut data, FLAGS, flags);
        write_u64_le(&mut data, LAST_WRITTEN, timestamp);
        write_u32_le(&mut data, PARENT, parent);
        write_u32_le(&mut data, SUBKEY_LIST, NO_OFFSET);
        write_u32_le(&mut data, VOLATILE_SUBKEY_LIST, NO_OFFSET);
        write_u32_le(&mut data, VALUE_LIST, NO_OFFSET);
        write_u32_le(&mut data, SECURITY, security);
        write_u32_le(&mut data, CLASS_NAME, NO_OFFSET);
        write_u16_le(&mut data, NAME_LENGTH, name_length);
        data[KEY_NODE_MIN_SIZE..].copy_from_slice(name.as_bytes());

        Ok(data)
    }

    /// Points the key at a new subkey list.
    pub fn write_subkey_list(cell: &mut [u8], count: u32, list_offset: u32) {
        write_u32_le(cell, SUBKEY_COUNT, count);
        write_u32_le(cell, SUBKEY_LIST, list_offset);
    }

    /// Points the key at a new value list.
    pub fn write_value_list(cell: &mut [u8], count: u32, list_offset: u32) {
        write_u32_le(cell, VALUE_COUNT, count);
        write_u32_le(cell, VALUE_LIST, list_offset);
    }

    /// Overwrites the max-subkey-name field.
    pub fn write_max_subkey_name(cell: &mut [u8], len: u32) {
        write_u32_le(cell, MAX_SUBKEY_NAME, len);
    }

    /// Overwrites the max-value-name and max-value-data fields.
    pub fn write_value_maxima(cell: &mut [u8], name_len: u32, data_len: u32) {
        write_u32_le(cell, MAX_VALUE_NAME, name_len);
        write_u32_le(cell, MAX_VALUE_DATA, data_len);
    }

    /// Total subkeys, stable and volatile.
    pub fn total_subkeys(&self) -> u32 {
        self.subkey_count.saturating_add(self.volatile_subkey_count)
    }

    /// Returns true if this key has subkeys.
    pub fn has_subkeys(&self) -> bool {
        self.subkey_count > 0
    }

    /// Returns true if this key has values.
    pub fn has_values(&self) -> bool {
        self.value_count > 0
    }

    /// Returns true if this is the root key.
    pub fn is_root(&self) -> bool {
        self.flags.is_root()
    }
}
