//! Cell type tags, key-node flags and value type codes.
//!
//! Cells are the fundamental data structures within registry hives. Each
//! structured cell starts with a 2-byte signature that identifies its type;
//! raw data cells carry no tag.

use crate::error::{RegistryError, Result};

/// Cell type signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    /// Key node (nk) - represents a registry key.
    KeyNode,

    /// Value key (vk) - represents a registry value.
    ValueKey,

    /// Security descriptor (sk).
    Security,

    /// Index leaf (li) - list of subkey offsets.
    IndexLeaf,

    /// Fast leaf (lf) - list of subkeys with name hints.
    FastLeaf,

    /// Hash leaf (lh) - list of subkeys with name hashes.
    HashLeaf,

    /// Index root (ri) - list of subkey list offsets.
    IndexRoot,

    /// Data block (db) - big data header.
    DataBlock,
}

impl CellType {
    /// Parses a cell type from a 2-byte signature.
    pub fn from_signature(sig: &[u8; 2]) -> Option<Self> {
        match sig {
            b"nk" => Some(CellType::KeyNode),
            b"vk" => Some(CellType::ValueKey),
            b"sk" => Some(CellType::Security),
            b"li" => Some(CellType::IndexLeaf),
            b"lf" => Some(CellType::FastLeaf),
            b"lh" => Some(CellType::HashLeaf),
            b"ri" => Some(CellType::IndexRoot),
            b"db" => Some(CellType::DataBlock),
            _ => None,
        }
    }

    /// Returns the 2-byte signature for this cell type.
    pub fn signature(&self) -> &'static [u8; 2] {
        match self {
            CellType::KeyNode => b"nk",
            CellType::ValueKey => b"vk",
            CellType::Security => b"sk",
            CellType::IndexLeaf => b"li",
            CellType::FastLeaf => b"lf",
            CellType::HashLeaf => b"lh",
            CellType::IndexRoot => b"ri",
            CellType::DataBlock => b"db",
        }
    }

    /// Short name used in error messages.
    pub fn label(&self) -> &'static str {
        match self {
            CellType::KeyNode => "nk",
            CellType::ValueKey => "vk",
            CellType::Security => "sk",
            CellType::IndexLeaf => "li",
            CellType::FastLeaf => "lf",
            CellType::HashLeaf => "lh",
            CellType::IndexRoot => "ri",
            CellType::DataBlock => "db",
        }
    }

    /// Checks that `data` starts with this type's signature.
    pub fn expect(&self, data: &[u8], offset: u32) -> Result<()> {
        if data.len() < 2 || &data[0..2] != self.signature() {
            return Err(RegistryError::unexpected_cell(self.label(), data, offset));
        }
        Ok(())
    }

    /// Returns true if this cell type represents a subkey list.
    pub fn is_subkey_list(&self) -> bool {
        matches!(
            self,
            CellType::IndexLeaf | CellType::FastLeaf | CellType::HashLeaf | CellType::IndexRoot
        )
    }
}

/// Flags for key nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyNodeFlags(pub u16);

impl KeyNodeFlags {
    /// Key is volatile (not stored on disk).
    pub const VOLATILE: u16 = 0x0001;

    /// Key is a mount point for another hive.
    pub const HIVE_EXIT: u16 = 0x0002;

    /// Key is the root key.
    pub const ROOT_KEY: u16 = 0x0004;

    /// Key cannot be deleted.
    pub const NO_DELETE: u16 = 0x0008;

    /// Key is a symbolic link.
    pub const SYM_LINK: u16 = 0x0010;

    /// Key name is in compressed format (one byte per character).
    pub const COMP_NAME: u16 = 0x0020;

    /// Key is a predefined handle.
    pub const PREDEF_HANDLE: u16 = 0x0040;

    /// Creates a new KeyNodeFlags from a u16 value.
    pub fn new(flags: u16) -> Self {
        Self(flags)
    }

    /// Returns true if the specified flag is set.
    pub fn has_flag(&self, flag: u16) -> bool {
        (self.0 & flag) != 0
    }

    /// Returns true if the key name is compressed.
    pub fn is_compressed(&self) -> bool {
        self.has_flag(Self::COMP_NAME)
    }

    /// Returns true if this is a volatile key.
    pub fn is_volatile(&self) -> bool {
        self.has_flag(Self::VOLATILE)
    }

    /// Returns true if this is the root key.
    pub fn is_root(&self) -> bool {
        self.has_flag(Self::ROOT_KEY)
    }
}

/// Registry value data types.
///
/// Codes outside the predefined range are kept in [`ValueType::Unknown`] so
/// they survive a read/write cycle unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ValueType {
    /// No value type.
    None,

    /// String (null-terminated).
    String,

    /// String with environment variables.
    ExpandString,

    /// Binary data.
    Binary,

    /// 32-bit little-endian integer.
    Dword,

    /// 32-bit big-endian integer.
    DwordBigEndian,

    /// Symbolic link (Unicode).
    Link,

    /// Multiple strings.
    MultiString,

    /// Resource list.
    ResourceList,

    /// Full resource descriptor.
    FullResourceDescriptor,

    /// Resource requirements list.
    ResourceRequirementsList,

    /// 64-bit little-endian integer.
    Qword,

    /// Any other type code, preserved verbatim.
    Unknown(u32),
}

impl From<u32> for ValueType {
    fn from(value: u32) -> Self {
        match value {
            0 => ValueType::None,
            1 => ValueType::String,
            2 => ValueType::ExpandString,
            3 => ValueType::Binary,
            4 => ValueType::Dword,
            5 => ValueType::DwordBigEndian,
            6 => ValueType::Link,
            7 => ValueType::MultiString,
            8 => ValueType::ResourceList,
            9 => ValueType::FullResourceDescriptor,
            10 => ValueType::ResourceRequirementsList,
            11 => ValueType::Qword,
            _ => ValueType::Unknown(value),
        }
    }
}

impl From<ValueType> for u32 {
    fn from(value: ValueType) -> Self {
        match value {
            ValueType::None => 0,
            ValueType::String => 1,
            ValueType::ExpandString => 2,
            ValueType::Binary => 3,
            ValueType::Dword => 4,
            ValueType::DwordBigEndian => 5,
            ValueType::Link => 6,
            ValueType::MultiString => 7,
            ValueType::ResourceList => 8,
            ValueType::FullResourceDescriptor => 9,
            ValueType::ResourceRequirementsList => 10,
            ValueType::Qword => 11,
            ValueType::Unknown(raw) => raw,
        }
    }
}

impl ValueType {
    /// Returns the name of this value type.
    pub fn name(&self) -> String {
        match self {
            ValueType::None => "REG_NONE".to_string(),
            ValueType::String => "REG_SZ".to_string(),
            ValueType::ExpandString => "REG_EXPAND_SZ".to_string(),
            ValueType::Binary => "REG_BINARY".to_string(),
            ValueType::Dword => "REG_DWORD".to_string(),
            ValueType::DwordBigEndian => "REG_DWORD_BIG_ENDIAN".to_string(),
            ValueType::Link => "REG_LINK".to_string(),
            ValueType::MultiString => "REG_MULTI_SZ".to_string(),
            ValueType::ResourceList => "REG_RESOURCE_LIST".to_string(),
            ValueType::FullResourceDescriptor => "REG_FULL_RESOURCE_DESCRIPTOR".to_string(),
            ValueType::ResourceRequirementsList => "REG_RESOURCE_REQUIREMENTS_LIST".to_string(),
            ValueType::Qword => "REG_QWORD".to_string(),
            ValueType::Unknown(value) => format!("REG_UNKNOWN_{:#010x}", value),
        }
    }
}
