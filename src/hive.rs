//! Hive handle: open, navigate, edit and flush a registry hive.
//!
//! Nodes and values are addressed by the cell offset of their nk or vk cell.
//! Offsets stay valid for the lifetime of the handle unless the operation
//! that produced them documents otherwise.

use crate::alloc::{CellAllocator, CellStats};
use crate::bigdata;
use crate::buffer::HiveBuffer;
use crate::cell::{CellType, ValueType};
use crate::error::{RegistryError, Result};
use crate::header::BaseBlock;
use crate::key::{KeyNode, KEY_NODE_MIN_SIZE};
use crate::name::RegName;
use crate::subkey_list::{self, SubkeyListType};
use crate::utils::{
    calculate_checksum, cell_offset_to_absolute, filetime_now, is_valid_ref, read_u32_le, write_u32_le,
    NO_OFFSET,
};
use crate::value::{encode_value_list, parse_value_list, DataLocation, ValueKey, VALUE_KEY_MIN_SIZE};
use memmap2::Mmap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Offset of a key's nk cell.
pub type NodeId = u32;

/// Offset of a value's vk cell.
pub type ValueId = u32;

/// Reference count field inside an sk cell.
const SECURITY_REFCOUNT: usize = 0x0C;

/// Minor version from which new subkey lists are `lh` rather than `lf`.
const HASH_LEAF_MIN_MINOR_VERSION: u32 = 5;

/// How a hive file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Memory-mapped, no mutation.
    Read,
    /// Loaded into memory, written back on flush.
    Write,
}

/// Options for opening a hive.
///
/// ```no_run
/// use hive_edit::OpenOptions;
///
/// let hive = OpenOptions::new().write(true).open("NTUSER.DAT")?;
/// # Ok::<(), hive_edit::RegistryError>(())
/// ```
#[derive(Debug, Clone)]
pub struct OpenOptions {
    write: bool,
    verify_checksum: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenOptions {
    /// Read-only, checksum verified.
    pub fn new() -> Self {
        Self {
            write: false,
            verify_checksum: true,
        }
    }

    /// Enables mutation and flushing.
    pub fn write(&mut self, write: bool) -> &mut Self {
        self.write = write;
        self
    }

    /// Controls whether a header checksum mismatch rejects the hive.
    ///
    /// With verification off, a hive with a bad checksum can still be opened
    /// for reading; opening it for writing is refused.
    pub fn verify_checksum(&mut self, verify: bool) -> &mut Self {
        self.verify_checksum = verify;
        self
    }

    fn mode(&self) -> OpenMode {
        if self.write {
            OpenMode::Write
        } else {
            OpenMode::Read
        }
    }

    /// Opens the hive at `path`.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display(), mode = ?self.mode()))]
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Hive> {
        info!("Opening registry hive");
        let path = path.as_ref();

        let buffer = if self.write {
            HiveBuffer::from_vec(std::fs::read(path)?, true)
        } else {
            let file = File::open(path)?;
            // SAFETY: the map is read-only, owned by the returned hive and every
            // access goes through bounds-checked buffer methods.
            let mmap = unsafe { Mmap::map(&file)? };
            HiveBuffer::from_mmap(mmap)
        };
        debug!(size = buffer.len(), "Loaded hive file");

        let mut hive = Hive::from_buffer(buffer, self.verify_checksum)?;
        hive.path = Some(path.to_path_buf());
        Ok(hive)
    }

    /// Opens a hive held in memory.
    pub fn open_vec(&self, data: Vec<u8>) -> Result<Hive> {
        Hive::from_buffer(HiveBuffer::from_vec(data, self.write), self.verify_checksum)
    }
}

/// A value to store with [`Hive::node_set_value`] or [`Hive::node_set_values`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewValue {
    /// Value name; empty for the default value.
    pub key: String,
    /// Type code.
    pub value_type: ValueType,
    /// Raw data.
    pub data: Vec<u8>,
}

impl NewValue {
    /// Creates a value.
    pub fn new(key: impl Into<String>, value_type: ValueType, data: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value_type,
            data: data.into(),
        }
    }
}

/// Location of a value's data cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DataCell {
    /// Data length plus the 4-byte cell length prefix.
    pub length: u32,
    /// Absolute file offset of the data cell.
    pub offset: u32,
}

/// An open registry hive.
pub struct Hive {
    buffer: HiveBuffer,
    base_block: BaseBlock,
    alloc: CellAllocator,
    path: Option<PathBuf>,
    dirty: bool,
}

impl std::fmt::Debug for Hive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hive")
            .field("path", &self.path)
            .field("size", &self.buffer.len())
            .field("writable", &self.buffer.is_writable())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl Hive {
    /// Opens a hive file.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - File cannot be read
    /// - Header is invalid or its checksum does not match
    /// - An hbin or cell is malformed
    /// - The root offset does not name a key node
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        OpenOptions::new().write(mode == OpenMode::Write).open(path)
    }

    /// Opens a hive from bytes already in memory.
    pub fn from_vec(data: Vec<u8>, mode: OpenMode) -> Result<Self> {
        OpenOptions::new().write(mode == OpenMode::Write).open_vec(data)
    }

    fn from_buffer(buffer: HiveBuffer, verify_checksum: bool) -> Result<Self> {
        let base_block = BaseBlock::parse_with(buffer.as_slice(), verify_checksum)?;

        let calculated = calculate_checksum(buffer.as_slice());
        if calculated != base_block.checksum {
            warn!(
                stored = %format!("{:#010x}", base_block.checksum),
                calculated = %format!("{:#010x}", calculated),
                "Header checksum mismatch, opening in recovery mode"
            );
            if buffer.is_writable() {
                return Err(RegistryError::ChecksumMismatch {
                    expected: base_block.checksum,
                    calculated,
                });
            }
        }

        if !base_block.is_consistent() {
            warn!(
                primary = base_block.primary_sequence,
                secondary = base_block.secondary_sequence,
                "Hive was not cleanly written"
            );
        }

        let alloc = CellAllocator::scan(&buffer, base_block.hive_length)?;

        let root = base_block.root_cell_offset;
        KeyNode::parse(buffer.read_cell(root)?, root)?;

        info!(
            version = %format!("{}.{}", base_block.major_version, base_block.minor_version),
            root = %format!("{:#x}", root),
            hive_length = base_block.hive_length,
            "Opened registry hive"
        );

        Ok(Self {
            buffer,
            base_block,
            alloc,
            path: None,
            dirty: false,
        })
    }

    /// Returns the parsed base block.
    pub fn base_block(&self) -> &BaseBlock {
        &self.base_block
    }

    /// True if the hive has unflushed modifications.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// True if the hive accepts mutations.
    pub fn is_writable(&self) -> bool {
        self.buffer.is_writable()
    }

    /// The root key.
    pub fn root(&self) -> NodeId {
        self.base_block.root_cell_offset
    }

    fn key(&self, node: NodeId) -> Result<KeyNode> {
        KeyNode::parse(self.buffer.read_cell(node)?, node)
    }

    fn vk(&self, value: ValueId) -> Result<ValueKey> {
        ValueKey::parse(self.buffer.read_cell(value)?, value)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.buffer.is_writable() {
            Ok(())
        } else {
            Err(RegistryError::ReadOnly)
        }
    }

    // ---- nodes ----

    /// Decoded key name.
    pub fn node_name(&self, node: NodeId) -> Result<String> {
        self.key(node)?.name.decode(node)
    }

    /// Key name exactly as stored.
    pub fn node_name_raw(&self, node: NodeId) -> Result<RegName> {
        Ok(self.key(node)?.name)
    }

    /// Last-written FILETIME of a key.
    pub fn node_timestamp(&self, node: NodeId) -> Result<u64> {
        Ok(self.key(node)?.last_written)
    }

    /// Parent of a key, or `None` for the root.
    pub fn node_parent(&self, node: NodeId) -> Result<Option<NodeId>> {
        let key = self.key(node)?;
        if key.is_root() || node == self.root() {
            return Ok(None);
        }
        self.key(key.parent_offset)?;
        Ok(Some(key.parent_offset))
    }

    /// Number of subkeys recorded in the key.
    pub fn node_nr_children(&self, node: NodeId) -> Result<u32> {
        Ok(self.key(node)?.subkey_count)
    }

    /// Size of the nk structure: fixed part plus name.
    pub fn node_struct_length(&self, node: NodeId) -> Result<usize> {
        Ok(KEY_NODE_MIN_SIZE + self.key(node)?.name.len())
    }

    /// All subkeys of `node`, in index order.
    pub fn node_children(&self, node: NodeId) -> Result<Vec<NodeId>> {
        let key = self.key(node)?;
        if key.subkey_count == 0 {
            return Ok(Vec::new());
        }

        let children = subkey_list::collect_children(&self.buffer, key.subkey_list_offset)?;
        if children.len() != key.subkey_count as usize {
            warn!(
                node = %format!("{:#x}", node),
                recorded = key.subkey_count,
                found = children.len(),
                "Subkey count does not match subkey list"
            );
        }
        Ok(children)
    }

    /// Finds a direct subkey by name, ignoring case.
    ///
    /// Returns `Ok(None)` when there is no such subkey.
    pub fn node_get_child(&self, node: NodeId, name: &str) -> Result<Option<NodeId>> {
        let key = self.key(node)?;
        if key.subkey_count == 0 {
            return Ok(None);
        }
        subkey_list::find_child(&self.buffer, key.subkey_list_offset, &RegName::new(name))
    }

    /// Follows a backslash-separated path from `start`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` naming the first missing component.
    pub fn node_find_path(&self, start: NodeId, path: &str) -> Result<NodeId> {
        let mut node = start;
        for component in path.split('\\').filter(|c| !c.is_empty()) {
            node = self
                .node_get_child(node, component)?
                .ok_or_else(|| RegistryError::not_found("Key", component))?;
        }
        Ok(node)
    }

    /// Adds an empty subkey named `name` and returns it.
    ///
    /// # Errors
    ///
    /// `DuplicateName` if a subkey with that name (ignoring case) exists.
    #[instrument(skip(self), fields(parent = %format!("{:#x}", parent)))]
    pub fn node_add_child(&mut self, parent: NodeId, name: &str) -> Result<NodeId> {
        self.ensure_writable()?;
        let parent_key = self.key(parent)?;
        let name = RegName::new(name);

        if parent_key.subkey_count > 0
            && subkey_list::find_child(&self.buffer, parent_key.subkey_list_offset, &name)?.is_some()
        {
            return Err(RegistryError::DuplicateName(name.to_string_lossy()));
        }

        let security = parent_key.security_offset;
        let shares_security = is_valid_ref(security);
        if shares_security {
            let cell = self.buffer.read_cell(security)?;
            CellType::Security.expect(cell, security)?;
            if cell.len() < SECURITY_REFCOUNT + 4 {
                return Err(RegistryError::TruncatedData {
                    offset: security,
                    expected: SECURITY_REFCOUNT + 4,
                    actual: cell.len(),
                });
            }
        }
        let security = if shares_security { security } else { NO_OFFSET };

        let encoded = KeyNode::encode_new(&name, parent, security, filetime_now())?;
        let child = self.alloc.allocate(&mut self.buffer, encoded.len())?;
        self.buffer.cell_mut(child)?[..encoded.len()].copy_from_slice(&encoded);

        let root = if parent_key.subkey_count > 0 {
            parent_key.subkey_list_offset
        } else {
            NO_OFFSET
        };
        let new_kind = if self.base_block.minor_version >= HASH_LEAF_MIN_MINOR_VERSION {
            SubkeyListType::HashLeaf
        } else {
            SubkeyListType::FastLeaf
        };

        let insertion = match subkey_list::insert_child(&mut self.buffer, &mut self.alloc, root, child, &name, new_kind) {
            Ok(insertion) => insertion,
            Err(e) => {
                self.alloc.free(&mut self.buffer, child)?;
                return Err(e);
            }
        };

        let name_bytes = name.char_len() as u32 * 2;
        let cell = self.buffer.cell_mut(parent)?;
        KeyNode::write_subkey_list(cell, parent_key.subkey_count + 1, insertion.root);
        if name_bytes > parent_key.max_subkey_name_len {
            KeyNode::write_max_subkey_name(cell, name_bytes);
        }

        for retired in insertion.retired {
            self.alloc.free(&mut self.buffer, retired)?;
        }

        if shares_security {
            let cell = self.buffer.cell_mut(security)?;
            let count = read_u32_le(cell, SECURITY_REFCOUNT)?;
            write_u32_le(cell, SECURITY_REFCOUNT, count.saturating_add(1));
        }

        self.dirty = true;
        debug!(child = %format!("{:#x}", child), "Added subkey");
        Ok(child)
    }

    // ---- values ----

    /// All values of `node`, in list order.
    pub fn node_values(&self, node: NodeId) -> Result<Vec<ValueId>> {
        let key = self.key(node)?;
        self.value_list(&key)
    }

    fn value_list(&self, key: &KeyNode) -> Result<Vec<ValueId>> {
        if key.value_count == 0 {
            return Ok(Vec::new());
        }

        let list = key.value_list_offset;
        let values = parse_value_list(self.buffer.read_cell(list)?, key.value_count, list)?;
        for &value in &values {
            CellType::ValueKey.expect(self.buffer.read_cell(value)?, value)?;
        }
        Ok(values)
    }

    /// Number of values recorded in the key.
    pub fn node_nr_values(&self, node: NodeId) -> Result<u32> {
        Ok(self.key(node)?.value_count)
    }

    /// Finds a value by name, ignoring case. `""` names the default value.
    ///
    /// Returns `Ok(None)` when there is no such value.
    pub fn node_get_value(&self, node: NodeId, name: &str) -> Result<Option<ValueId>> {
        let wanted = RegName::new(name);
        for value in self.node_values(node)? {
            if self.vk(value)?.name.eq_ignore_case(&wanted) {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Decoded value name.
    pub fn value_key(&self, value: ValueId) -> Result<String> {
        self.vk(value)?.name.decode(value)
    }

    /// Value name exactly as stored.
    pub fn value_key_raw(&self, value: ValueId) -> Result<RegName> {
        Ok(self.vk(value)?.name)
    }

    /// Type code and data length of a value.
    pub fn value_type(&self, value: ValueId) -> Result<(ValueType, u32)> {
        let vk = self.vk(value)?;
        Ok((vk.data_type, vk.data_length()))
    }

    /// Size of the vk structure: fixed part plus name.
    pub fn value_struct_length(&self, value: ValueId) -> Result<usize> {
        Ok(VALUE_KEY_MIN_SIZE + self.vk(value)?.name.len())
    }

    /// Type code and raw data of a value.
    pub fn value_value(&self, value: ValueId) -> Result<(ValueType, Vec<u8>)> {
        let vk = self.vk(value)?;
        Ok((vk.data_type, self.read_data(vk.data)?))
    }

    /// Where a value's data lives, or `None` for data held in the vk cell.
    pub fn value_data_cell(&self, value: ValueId) -> Result<Option<DataCell>> {
        match self.vk(value)?.data {
            DataLocation::Resident { .. } => Ok(None),
            DataLocation::NonResident { length: 0, .. } => Ok(None),
            DataLocation::NonResident { offset, length } => {
                self.buffer.read_cell(offset)?;
                Ok(Some(DataCell {
                    length: length.saturating_add(4),
                    offset: cell_offset_to_absolute(offset)?,
                }))
            }
        }
    }

    fn read_data(&self, location: DataLocation) -> Result<Vec<u8>> {
        match location {
            DataLocation::Resident { bytes, len } => Ok(bytes[..len as usize].to_vec()),
            DataLocation::NonResident { length: 0, .. } => Ok(Vec::new()),
            DataLocation::NonResident { offset, length } => {
                if bigdata::is_big_data(&self.buffer, offset, length, self.base_block.minor_version)? {
                    return bigdata::read(&self.buffer, offset, length);
                }
                let cell = self.buffer.read_cell(offset)?;
                let length = length as usize;
                if cell.len() < length {
                    return Err(RegistryError::TruncatedData {
                        offset,
                        expected: length,
                        actual: cell.len(),
                    });
                }
                Ok(cell[..length].to_vec())
            }
        }
    }

    /// Every cell holding the data at `location`.
    fn data_cells(&self, location: DataLocation) -> Result<Vec<u32>> {
        match location {
            DataLocation::NonResident { offset, length } if length > 0 && is_valid_ref(offset) => {
                if bigdata::is_big_data(&self.buffer, offset, length, self.base_block.minor_version)? {
                    bigdata::chain_cells(&self.buffer, offset)
                } else {
                    Ok(vec![offset])
                }
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Stores `data` in new cells unless it fits in the vk cell.
    fn write_data(&mut self, data: &[u8]) -> Result<DataLocation> {
        if let Some(resident) = DataLocation::resident(data) {
            return Ok(resident);
        }

        let length = u32::try_from(data.len())
            .ok()
            .filter(|len| len & 0x8000_0000 == 0)
            .ok_or_else(|| RegistryError::InvalidArgument(format!("value of {} bytes is too large", data.len())))?;

        let offset = if bigdata::needs_big_data(data.len(), self.base_block.minor_version) {
            bigdata::write(&mut self.buffer, &mut self.alloc, data)?
        } else {
            let offset = self.alloc.allocate(&mut self.buffer, data.len())?;
            self.buffer.cell_mut(offset)?[..data.len()].copy_from_slice(data);
            offset
        };

        Ok(DataLocation::NonResident { offset, length })
    }

    fn free_cells(&mut self, cells: &[u32]) -> Result<()> {
        for &cell in cells.iter().rev() {
            self.alloc.free(&mut self.buffer, cell)?;
        }
        Ok(())
    }

    /// Writes a new vk cell (and its data) and returns its offset.
    ///
    /// On error nothing stays allocated.
    fn write_value(&mut self, value: &NewValue, name: &RegName) -> Result<ValueId> {
        let location = self.write_data(&value.data)?;
        let data_cells = self.data_cells(location)?;

        let encoded = match ValueKey::encode(name, value.value_type, location) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.free_cells(&data_cells)?;
                return Err(e);
            }
        };
        let offset = match self.alloc.allocate(&mut self.buffer, encoded.len()) {
            Ok(offset) => offset,
            Err(e) => {
                self.free_cells(&data_cells)?;
                return Err(e);
            }
        };
        self.buffer.cell_mut(offset)?[..encoded.len()].copy_from_slice(&encoded);
        Ok(offset)
    }

    /// Creates or overwrites one value of `node` and returns its vk offset.
    ///
    /// An existing value keeps its vk offset. Its data is rewritten in place
    /// when the old data cell has room, and moved to a new cell otherwise.
    #[instrument(skip(self, value), fields(node = %format!("{:#x}", node), key = %value.key, len = value.data.len()))]
    pub fn node_set_value(&mut self, node: NodeId, value: &NewValue) -> Result<ValueId> {
        self.ensure_writable()?;
        let key = self.key(node)?;
        let values = self.value_list(&key)?;
        let name = RegName::new(&value.key);

        let mut existing = None;
        for &offset in &values {
            let vk = self.vk(offset)?;
            if vk.name.eq_ignore_case(&name) {
                existing = Some((offset, vk));
                break;
            }
        }

        let vk_offset = match existing {
            Some((offset, vk)) => {
                self.overwrite_value(offset, &vk, value)?;
                offset
            }
            None => self.append_value(node, &key, &values, value, &name)?,
        };

        let name_bytes = name.char_len() as u32 * 2;
        let data_len = value.data.len() as u32;
        let cell = self.buffer.cell_mut(node)?;
        KeyNode::write_value_maxima(
            cell,
            key.max_value_name_len.max(name_bytes),
            key.max_value_data_len.max(data_len),
        );

        self.dirty = true;
        Ok(vk_offset)
    }

    fn overwrite_value(&mut self, offset: ValueId, vk: &ValueKey, value: &NewValue) -> Result<()> {
        let old_cells = self.data_cells(vk.data)?;

        // Plain data cell with room for the new bytes: rewrite in place
        let reuse = match vk.data {
            DataLocation::NonResident { offset: data_offset, .. }
                if old_cells == [data_offset]
                    && DataLocation::resident(&value.data).is_none()
                    && !bigdata::needs_big_data(value.data.len(), self.base_block.minor_version) =>
            {
                let capacity = self.buffer.read_cell(data_offset)?.len();
                (value.data.len() <= capacity).then_some(data_offset)
            }
            _ => None,
        };

        let (location, retired) = match reuse {
            Some(data_offset) => {
                let cell = self.buffer.cell_mut(data_offset)?;
                cell.fill(0);
                cell[..value.data.len()].copy_from_slice(&value.data);
                let location = DataLocation::NonResident {
                    offset: data_offset,
                    length: value.data.len() as u32,
                };
                (location, Vec::new())
            }
            None => (self.write_data(&value.data)?, old_cells),
        };

        let cell = self.buffer.cell_mut(offset)?;
        ValueKey::write_data(cell, location);
        ValueKey::write_type(cell, value.value_type);

        self.free_cells(&retired)
    }

    fn append_value(
        &mut self,
        node: NodeId,
        key: &KeyNode,
        values: &[ValueId],
        value: &NewValue,
        name: &RegName,
    ) -> Result<ValueId> {
        let vk_offset = self.write_value(value, name)?;

        let mut list = values.to_vec();
        list.push(vk_offset);
        let encoded = encode_value_list(&list);

        let old_list = (key.value_count > 0).then_some(key.value_list_offset);
        let in_place = match old_list {
            Some(offset) => self.buffer.read_cell(offset)?.len() >= encoded.len(),
            None => false,
        };

        let list_offset = match old_list {
            Some(offset) if in_place => offset,
            _ => match self.alloc.allocate(&mut self.buffer, encoded.len()) {
                Ok(offset) => offset,
                Err(e) => {
                    let mut cells = self.data_cells(self.vk(vk_offset)?.data)?;
                    cells.push(vk_offset);
                    self.free_cells(&cells)?;
                    return Err(e);
                }
            },
        };
        self.buffer.cell_mut(list_offset)?[..encoded.len()].copy_from_slice(&encoded);

        KeyNode::write_value_list(self.buffer.cell_mut(node)?, list.len() as u32, list_offset);

        if let Some(old) = old_list.filter(|&old| old != list_offset) {
            self.alloc.free(&mut self.buffer, old)?;
        }

        Ok(vk_offset)
    }

    /// Replaces every value of `node` with `values`.
    ///
    /// The new cells are all written before the key is repointed; the old
    /// cells are freed afterwards. On error the key still shows its old
    /// values and no new cell stays allocated.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if two entries share a name (ignoring case).
    #[instrument(skip(self, values), fields(node = %format!("{:#x}", node), count = values.len()))]
    pub fn node_set_values(&mut self, node: NodeId, values: &[NewValue]) -> Result<()> {
        self.ensure_writable()?;
        let key = self.key(node)?;
        let old_values = self.value_list(&key)?;

        let names: Vec<RegName> = values.iter().map(|v| RegName::new(&v.key)).collect();
        for (i, name) in names.iter().enumerate() {
            if names[..i].iter().any(|other| other.eq_ignore_case(name)) {
                return Err(RegistryError::InvalidArgument(format!(
                    "value {:?} given more than once",
                    name.to_string_lossy()
                )));
            }
        }

        let mut allocated: Vec<u32> = Vec::new();
        let written = self.write_value_set(values, &names, &mut allocated);
        let list_offset = match written {
            Ok(list_offset) => list_offset,
            Err(e) => {
                self.free_cells(&allocated)?;
                return Err(e);
            }
        };

        let max_name = names.iter().map(|n| n.char_len() as u32 * 2).max().unwrap_or(0);
        let max_data = values.iter().map(|v| v.data.len() as u32).max().unwrap_or(0);
        let cell = self.buffer.cell_mut(node)?;
        KeyNode::write_value_list(cell, values.len() as u32, list_offset);
        KeyNode::write_value_maxima(cell, max_name, max_data);

        let mut retired = Vec::new();
        for &old in &old_values {
            retired.extend(self.data_cells(self.vk(old)?.data)?);
            retired.push(old);
        }
        if key.value_count > 0 {
            retired.push(key.value_list_offset);
        }
        for cell in retired {
            self.alloc.free(&mut self.buffer, cell)?;
        }

        self.dirty = true;
        Ok(())
    }

    /// Writes every value and the list; records each allocated cell in `allocated`.
    fn write_value_set(&mut self, values: &[NewValue], names: &[RegName], allocated: &mut Vec<u32>) -> Result<u32> {
        let mut offsets = Vec::with_capacity(values.len());
        for (value, name) in values.iter().zip(names) {
            let offset = self.write_value(value, name)?;
            allocated.extend(self.data_cells(self.vk(offset)?.data)?);
            allocated.push(offset);
            offsets.push(offset);
        }

        if offsets.is_empty() {
            return Ok(NO_OFFSET);
        }

        let encoded = encode_value_list(&offsets);
        let list_offset = self.alloc.allocate(&mut self.buffer, encoded.len())?;
        allocated.push(list_offset);
        self.buffer.cell_mut(list_offset)?[..encoded.len()].copy_from_slice(&encoded);
        Ok(list_offset)
    }

    // ---- whole hive ----

    /// Byte accounting over every hbin, checked against the free-cell index.
    pub fn cell_stats(&self) -> Result<CellStats> {
        self.alloc.verify(&self.buffer)
    }

    /// The bytes a flush would write now.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = self.buffer.to_vec();
        if self.dirty {
            let mut header = self.base_block.clone();
            header.begin_commit(filetime_now());
            header.hive_length = self.alloc.hive_length();
            header.serialize(&mut data)?;
        }
        Ok(data)
    }

    fn commit_header(&mut self) -> Result<()> {
        self.base_block.begin_commit(filetime_now());
        self.base_block.hive_length = self.alloc.hive_length();
        self.base_block.serialize(self.buffer.as_mut_slice()?)
    }

    /// Writes the hive to `path`, committing the header first if modified.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.ensure_writable()?;
        if self.dirty {
            self.commit_header()?;
        }

        let mut file = File::create(path.as_ref())?;
        file.write_all(self.buffer.as_slice())?;
        file.sync_all()?;

        info!(
            size = self.buffer.len(),
            sequence = self.base_block.primary_sequence,
            "Saved registry hive"
        );
        self.dirty = false;
        Ok(())
    }

    /// Writes pending modifications back to the file the hive was opened from.
    ///
    /// Does nothing if the hive is unmodified.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let path = self
            .path
            .clone()
            .ok_or_else(|| RegistryError::InvalidArgument("hive has no backing file; use save".to_string()))?;
        self.save(path)
    }

    /// Flushes and releases the hive.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}
