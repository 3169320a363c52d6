//! # Windows Registry Hive Editor
//!
//! Reads and edits Windows registry hive files (regf) in place: navigate keys
//! and values, add keys, set values, and write the hive back with a fresh
//! header checksum.
//!
//! ## Features
//!
//! - **Read mode**: memory-mapped, no copies, mutation rejected
//! - **Write mode**: whole hive held in memory; nothing touches the file until flush
//! - **Byte-exact names**: embedded zero bytes and non-ASCII names survive unchanged
//! - **Atomic edits**: every operation either completes or leaves the hive as it was
//! - **Big data**: values above 16,344 bytes are read and written as `db` chains
//!
//! ## Binary Layout
//!
//! ```text
//! [Base Block - 4KB]
//!   - Signature: "regf"
//!   - Sequence numbers, timestamp, version
//!   - Root offset, hive length
//!   - Checksum
//!
//! [Hive Bins - 4KB aligned]
//!   [Hbin Header - 32 bytes]
//!   [Cells]
//!     [Cell Size - 4 bytes, negative if allocated]
//!     [Cell Data]
//!       - Key nodes (nk)
//!       - Value keys (vk)
//!       - Subkey lists (lf/lh/li/ri)
//!       - Security descriptors (sk)
//!       - Raw data, big data (db)
//! ```
//!
//! ## Examples
//!
//! ```no_run
//! use hive_edit::{Hive, NewValue, OpenMode, ValueType};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut hive = Hive::open("NTUSER.DAT", OpenMode::Write)?;
//! let root = hive.root();
//!
//! for child in hive.node_children(root)? {
//!     println!("{}", hive.node_name(child)?);
//! }
//!
//! let key = match hive.node_get_child(root, "Software")? {
//!     Some(key) => key,
//!     None => hive.node_add_child(root, "Software")?,
//! };
//! hive.node_set_value(key, &NewValue::new("Greeting", ValueType::Binary, b"hello".to_vec()))?;
//!
//! hive.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alloc;
pub mod bigdata;
pub mod buffer;
pub mod cell;
pub mod error;
pub mod hbin;
pub mod header;
pub mod hive;
pub mod key;
pub mod name;
pub mod subkey_list;
pub mod utils;
pub mod value;

pub use alloc::CellStats;
pub use cell::{CellType, KeyNodeFlags, ValueType};
pub use error::{ErrorKind, RegistryError, Result};
pub use header::BaseBlock;
pub use hive::{DataCell, Hive, NewValue, NodeId, OpenMode, OpenOptions, ValueId};
pub use name::RegName;
pub use value::DataLocation;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
#[path = "../tests/common/mod.rs"]
mod fixtures;
