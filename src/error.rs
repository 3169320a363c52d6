//! Error types for hive reading and editing.
//!
//! Every failure maps onto one of a small set of classes (see [`ErrorKind`]) so
//! callers can tell a recoverable lookup miss from a damaged file without
//! matching on individual variants.

use std::io;
use thiserror::Error;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Coarse classification of a [`RegistryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad magic, signature or unsupported layout.
    Format,
    /// Checksum mismatch, out-of-bounds or dangling offsets, cycles.
    Corruption,
    /// A name lookup missed.
    NotFound,
    /// A child with the same name already exists.
    DuplicateName,
    /// The hive buffer could not grow.
    Allocation,
    /// The storage layer failed.
    Io,
    /// The caller asked for something the handle cannot do.
    InvalidInput,
}

/// Errors that can occur while reading or mutating a hive.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// I/O error occurred while reading or writing the hive file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid magic signature in header or structure.
    #[error("Invalid signature: expected {expected:?}, found {found:?}")]
    InvalidSignature {
        /// Signature the structure should carry.
        expected: Vec<u8>,
        /// Signature actually present.
        found: Vec<u8>,
    },

    /// Invalid hive format.
    #[error("Invalid hive format: {0}")]
    InvalidFormat(String),

    /// Hive is too small to be valid.
    #[error("Hive too small: {size} bytes (minimum: {minimum} bytes)")]
    HiveTooSmall {
        /// Actual size.
        size: usize,
        /// Minimum acceptable size.
        minimum: usize,
    },

    /// Unsupported hive version.
    #[error("Unsupported hive version: {major}.{minor}")]
    UnsupportedVersion {
        /// Major version found in the header.
        major: u32,
        /// Minor version found in the header.
        minor: u32,
    },

    /// Checksum mismatch in hive header.
    #[error("Checksum mismatch: expected {expected:#x}, calculated {calculated:#x}")]
    ChecksumMismatch {
        /// Checksum stored in the header.
        expected: u32,
        /// Checksum computed over the header.
        calculated: u32,
    },

    /// Cell offset is out of bounds or misaligned.
    #[error("Invalid cell offset: {offset:#x} (hive size: {hive_size:#x})")]
    InvalidOffset {
        /// The offending cell offset.
        offset: u32,
        /// Size of the hive buffer.
        hive_size: usize,
    },

    /// Cell size is invalid or corrupted.
    #[error("Invalid cell size: {size} at offset {offset:#x}")]
    InvalidCellSize {
        /// Raw signed size field.
        size: i32,
        /// Cell offset.
        offset: u32,
    },

    /// An offset refers to a cell that is not in use.
    #[error("Cell at offset {offset:#x} is not allocated")]
    CellNotAllocated {
        /// Cell offset.
        offset: u32,
    },

    /// A cell carries a different type tag than the reference expects.
    #[error("Expected {expected} cell at offset {offset:#x}, found {found:?}")]
    UnexpectedCellType {
        /// Human readable name of the expected tag.
        expected: &'static str,
        /// Tag actually present.
        found: [u8; 2],
        /// Cell offset.
        offset: u32,
    },

    /// Traversal came back to a cell it already visited.
    #[error("Cyclic reference through cell {offset:#x}")]
    CyclicReference {
        /// Cell offset where the cycle closed.
        offset: u32,
    },

    /// Data truncated or incomplete.
    #[error("Truncated data at offset {offset:#x}: expected {expected} bytes, got {actual} bytes")]
    TruncatedData {
        /// Offset of the structure being read.
        offset: u32,
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Invalid subkey list type.
    #[error("Invalid subkey list type {list_type:?} at offset {offset:#x}")]
    InvalidSubkeyList {
        /// Signature found.
        list_type: [u8; 2],
        /// Cell offset.
        offset: u32,
    },

    /// Invalid UTF-16 string data.
    #[error("Invalid UTF-16 string at offset {offset:#x}")]
    InvalidUtf16 {
        /// Offset of the owning cell.
        offset: u32,
    },

    /// Key or value not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A sibling with the same name already exists.
    #[error("Duplicate name: {0}")]
    DuplicateName(String),

    /// The buffer could not be grown to satisfy an allocation.
    #[error("Allocation of {requested} bytes failed")]
    AllocationFailed {
        /// Cell size that was requested.
        requested: usize,
    },

    /// Mutation attempted on a handle opened for reading.
    #[error("Hive was opened read-only")]
    ReadOnly,

    /// A caller-supplied argument cannot be encoded in the hive.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl RegistryError {
    /// Returns the taxonomy class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::InvalidSignature { .. }
            | Self::InvalidFormat(_)
            | Self::HiveTooSmall { .. }
            | Self::UnsupportedVersion { .. } => ErrorKind::Format,
            Self::ChecksumMismatch { .. }
            | Self::InvalidOffset { .. }
            | Self::InvalidCellSize { .. }
            | Self::CellNotAllocated { .. }
            | Self::UnexpectedCellType { .. }
            | Self::CyclicReference { .. }
            | Self::TruncatedData { .. }
            | Self::InvalidSubkeyList { .. }
            | Self::InvalidUtf16 { .. } => ErrorKind::Corruption,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::DuplicateName(_) => ErrorKind::DuplicateName,
            Self::AllocationFailed { .. } => ErrorKind::Allocation,
            Self::ReadOnly | Self::InvalidArgument(_) => ErrorKind::InvalidInput,
        }
    }

    /// Creates an invalid signature error with context.
    ///
    /// # Arguments
    ///
    /// * `expected` - Expected signature bytes
    /// * `found` - Actual signature bytes found
    pub fn invalid_signature(expected: &[u8], found: &[u8]) -> Self {
        Self::InvalidSignature {
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }

    /// Creates an invalid offset error with context.
    pub fn invalid_offset(offset: u32, hive_size: usize) -> Self {
        Self::InvalidOffset { offset, hive_size }
    }

    /// Creates an invalid cell size error with context.
    pub fn invalid_cell_size(size: i32, offset: u32) -> Self {
        Self::InvalidCellSize { size, offset }
    }

    /// Creates a format error with detailed context.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use hive_edit::error::{ErrorKind, RegistryError};
    /// let err = RegistryError::format_error(format!("hbin size {:#x} is not 4K aligned", 0x1234));
    /// assert_eq!(err.kind(), ErrorKind::Format);
    /// ```
    pub fn format_error(message: String) -> Self {
        Self::InvalidFormat(message)
    }

    /// Creates a not found error with context about what was being searched.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use hive_edit::error::{ErrorKind, RegistryError};
    /// let err = RegistryError::not_found("key", "Software\\Vendor");
    /// assert_eq!(err.kind(), ErrorKind::NotFound);
    /// ```
    pub fn not_found(item_type: &str, name: &str) -> Self {
        Self::NotFound(format!("{} '{}'", item_type, name))
    }

    /// Creates an unexpected cell type error.
    pub fn unexpected_cell(expected: &'static str, found: &[u8], offset: u32) -> Self {
        let mut tag = [0u8; 2];
        for (dst, src) in tag.iter_mut().zip(found) {
            *dst = *src;
        }
        Self::UnexpectedCellType {
            expected,
            found: tag,
            offset,
        }
    }

    /// Returns true for a recoverable lookup miss.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}
