//! Raw key and value names.
//!
//! Names are stored either compressed (one byte per character, Latin-1) or as
//! UTF-16LE, selected by a flag in the owning cell. A [`RegName`] keeps the
//! stored bytes exactly as found; zero bytes are ordinary characters.
//! Comparison is case-insensitive over UTF-16 code units.

use crate::error::Result;
use crate::utils::read_utf16_string;
use std::fmt;

/// A key or value name in its on-disk encoding.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RegName {
    bytes: Vec<u8>,
    compressed: bool,
}

impl RegName {
    /// Encodes `name` compactly: Latin-1 when every character fits in a byte,
    /// UTF-16LE otherwise.
    pub fn new(name: &str) -> Self {
        if name.chars().all(|c| (c as u32) <= 0xFF) {
            Self {
                bytes: name.chars().map(|c| c as u8).collect(),
                compressed: true,
            }
        } else {
            Self {
                bytes: name.encode_utf16().flat_map(u16::to_le_bytes).collect(),
                compressed: false,
            }
        }
    }

    /// Wraps bytes read from a cell.
    pub fn from_raw(bytes: &[u8], compressed: bool) -> Self {
        Self {
            bytes: bytes.to_vec(),
            compressed,
        }
    }

    /// The stored bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// True if stored one byte per character.
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Stored length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for the empty (default value) name.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The name as UTF-16 code units.
    pub fn code_units(&self) -> Vec<u16> {
        if self.compressed {
            self.bytes.iter().map(|&b| u16::from(b)).collect()
        } else {
            self.bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect()
        }
    }

    /// Number of characters (UTF-16 code units).
    pub fn char_len(&self) -> usize {
        if self.compressed {
            self.bytes.len()
        } else {
            self.bytes.len() / 2
        }
    }

    /// Decodes the name, failing on malformed UTF-16.
    ///
    /// `offset` is the owning cell and is only used for error reporting.
    pub fn decode(&self, offset: u32) -> Result<String> {
        if self.compressed {
            Ok(self.bytes.iter().map(|&b| char::from(b)).collect())
        } else {
            read_utf16_string(&self.bytes, offset)
        }
    }

    /// Decodes the name, replacing malformed UTF-16 with U+FFFD.
    pub fn to_string_lossy(&self) -> String {
        if self.compressed {
            self.bytes.iter().map(|&b| char::from(b)).collect()
        } else {
            String::from_utf16_lossy(&self.code_units())
        }
    }

    /// Case-insensitive comparison, independent of the stored encoding.
    pub fn eq_ignore_case(&self, other: &RegName) -> bool {
        let lhs = self.code_units();
        let rhs = other.code_units();
        lhs.len() == rhs.len() && lhs.iter().zip(&rhs).all(|(&a, &b)| upcase(a) == upcase(b))
    }
}

/// Upper-cases one UTF-16 code unit; units without a single-unit upper case map to themselves.
pub fn upcase(unit: u16) -> u16 {
    if unit < 0x80 {
        return (unit as u8).to_ascii_uppercase().into();
    }

    let Some(c) = char::from_u32(u32::from(unit)) else {
        return unit;
    };

    let mut upper = c.to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(u), None) if (u as u32) <= 0xFFFF => u as u32 as u16,
        _ => unit,
    }
}

impl From<&str> for RegName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for RegName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl fmt::Debug for RegName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegName")
            .field("name", &self.to_string_lossy())
            .field("compressed", &self.compressed)
            .field("bytes", &hex::encode(&self.bytes))
            .finish()
    }
}
