//! Subkey lists (li, lf, lh, ri): the child-name index of a key.
//!
//! A key's subkey-list offset points either at a single leaf or at an index
//! root whose entries are leaves. Leaves map child names to nk offsets:
//!
//! ```text
//! li: "li" count:u16 { key:u32 }*
//! lf: "lf" count:u16 { key:u32 hint:u32 }*   hint = first four name bytes
//! lh: "lh" count:u16 { key:u32 hash:u32 }*   hash = fold(h * 37 + upcase(c))
//! ri: "ri" count:u16 { leaf:u32 }*
//! ```
//!
//! Entries are not kept sorted; lookup filters on the hint or hash and then
//! confirms against the child's actual name.

use crate::alloc::CellAllocator;
use crate::buffer::HiveBuffer;
use crate::cell::CellType;
use crate::error::{RegistryError, Result};
use crate::key::KeyNode;
use crate::name::{upcase, RegName};
use crate::utils::{is_valid_ref, read_u32_le, write_u16_le, write_u32_le};
use std::collections::HashSet;
use tracing::debug;

/// Most entries a single leaf takes before a new leaf is started.
pub const LEAF_CAPACITY: usize = 512;

/// Subkey list types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubkeyListType {
    /// Index leaf (li) - simple list of offsets.
    IndexLeaf,

    /// Fast leaf (lf) - list with 4-byte name hints.
    FastLeaf,

    /// Hash leaf (lh) - list with name hashes.
    HashLeaf,

    /// Index root (ri) - list of leaf offsets.
    IndexRoot,
}

impl SubkeyListType {
    /// Parses a subkey list type from a 2-byte signature.
    pub fn from_signature(sig: &[u8; 2], offset: u32) -> Result<Self> {
        match CellType::from_signature(sig) {
            Some(CellType::IndexLeaf) => Ok(SubkeyListType::IndexLeaf),
            Some(CellType::FastLeaf) => Ok(SubkeyListType::FastLeaf),
            Some(CellType::HashLeaf) => Ok(SubkeyListType::HashLeaf),
            Some(CellType::IndexRoot) => Ok(SubkeyListType::IndexRoot),
            _ => Err(RegistryError::InvalidSubkeyList { list_type: *sig, offset }),
        }
    }

    fn cell_type(&self) -> CellType {
        match self {
            SubkeyListType::IndexLeaf => CellType::IndexLeaf,
            SubkeyListType::FastLeaf => CellType::FastLeaf,
            SubkeyListType::HashLeaf => CellType::HashLeaf,
            SubkeyListType::IndexRoot => CellType::IndexRoot,
        }
    }

    /// Bytes per entry.
    fn entry_size(&self) -> usize {
        match self {
            SubkeyListType::FastLeaf | SubkeyListType::HashLeaf => 8,
            SubkeyListType::IndexLeaf | SubkeyListType::IndexRoot => 4,
        }
    }

    /// Payload size of a list of this type with `count` entries.
    pub fn encoded_len(&self, count: usize) -> usize {
        4 + count * self.entry_size()
    }
}

/// Subkey list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubkeyListEntry {
    /// Offset to the key node (or to a leaf, inside an index root).
    pub key_offset: u32,

    /// Name hint: first bytes for lf, hash for lh, unused otherwise.
    pub name_hint: u32,
}

/// A decoded subkey list cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubkeyList {
    /// List type.
    pub kind: SubkeyListType,

    /// Entries in stored order.
    pub entries: Vec<SubkeyListEntry>,
}

impl SubkeyList {
    /// Creates an empty list.
    pub fn new(kind: SubkeyListType) -> Self {
        Self {
            kind,
            entries: Vec::new(),
        }
    }

    /// Parses a subkey list from cell data.
    ///
    /// # Arguments
    ///
    /// * `data` - Cell data (excluding size field).
    /// * `offset` - Offset of this cell for error reporting.
    pub fn parse(data: &[u8], offset: u32) -> Result<Self> {
        if data.len() < 4 {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: 4,
                actual: data.len(),
            });
        }

        let kind = SubkeyListType::from_signature(&[data[0], data[1]], offset)?;
        let count = u16::from_le_bytes([data[2], data[3]]) as usize;

        let expected_size = kind.encoded_len(count);
        if data.len() < expected_size {
            return Err(RegistryError::TruncatedData {
                offset,
                expected: expected_size,
                actual: data.len(),
            });
        }

        let stride = kind.entry_size();
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let pos = 4 + i * stride;
            let key_offset = read_u32_le(data, pos)?;
            let name_hint = if stride == 8 { read_u32_le(data, pos + 4)? } else { 0 };
            entries.push(SubkeyListEntry {
                key_offset,
                name_hint,
            });
        }

        Ok(Self { kind, entries })
    }

    /// Encodes the list into a cell payload of exactly `encoded_len` bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let count = u16::try_from(self.entries.len()).map_err(|_| {
            RegistryError::InvalidArgument(format!("{} entries do not fit one list", self.entries.len()))
        })?;

        let mut data = vec![0u8; self.kind.encoded_len(self.entries.len())];
        data[0..2].copy_from_slice(self.kind.cell_type().signature());
        write_u16_le(&mut data, 2, count);

        let stride = self.kind.entry_size();
        for (i, entry) in self.entries.iter().enumerate() {
            let pos = 4 + i * stride;
            write_u32_le(&mut data, pos, entry.key_offset);
            if stride == 8 {
                write_u32_le(&mut data, pos + 4, entry.name_hint);
            }
        }

        Ok(data)
    }

    /// Returns an iterator over entry offsets.
    pub fn key_offsets_iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|e| e.key_offset)
    }

    /// Returns the number of entries in this list.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if this list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if this is an index root (contains leaves).
    pub fn is_index_root(&self) -> bool {
        self.kind == SubkeyListType::IndexRoot
    }

    /// Builds the entry this leaf type stores for `name`.
    pub fn entry_for(&self, key_offset: u32, name: &RegName) -> SubkeyListEntry {
        let name_hint = match self.kind {
            SubkeyListType::HashLeaf => lh_hash(name),
            SubkeyListType::FastLeaf => lf_hint(name),
            SubkeyListType::IndexLeaf | SubkeyListType::IndexRoot => 0,
        };
        SubkeyListEntry {
            key_offset,
            name_hint,
        }
    }

    /// True if `entry` may name `name` according to its hint.
    ///
    /// lf hint bytes fold like full names do. A zero byte on either side
    /// matches anything, since characters above 0xFF have no one-byte hint.
    fn hint_matches(&self, entry: &SubkeyListEntry, name: &RegName) -> bool {
        match self.kind {
            SubkeyListType::HashLeaf => entry.name_hint == lh_hash(name),
            SubkeyListType::FastLeaf => {
                let stored = entry.name_hint.to_le_bytes();
                let wanted = lf_hint(name).to_le_bytes();
                stored.iter().zip(&wanted).all(|(&a, &b)| {
                    a == 0 || b == 0 || upcase(u16::from(a)) == upcase(u16::from(b))
                })
            }
            SubkeyListType::IndexLeaf | SubkeyListType::IndexRoot => true,
        }
    }
}

/// Name hash stored in lh leaves.
pub fn lh_hash(name: &RegName) -> u32 {
    name.code_units()
        .into_iter()
        .fold(0u32, |hash, unit| hash.wrapping_mul(37).wrapping_add(u32::from(upcase(unit))))
}

/// Name hint stored in lf leaves: the first four characters, zero padded.
pub fn lf_hint(name: &RegName) -> u32 {
    let mut hint = [0u8; 4];
    for (slot, unit) in hint.iter_mut().zip(name.code_units()) {
        *slot = u8::try_from(unit).unwrap_or(0);
    }
    u32::from_le_bytes(hint)
}

fn read_list(buffer: &HiveBuffer, offset: u32) -> Result<SubkeyList> {
    SubkeyList::parse(buffer.read_cell(offset)?, offset)
}

/// Reads the leaves reachable from `root`, rejecting nested or repeated index roots.
fn leaves(buffer: &HiveBuffer, root: u32) -> Result<Vec<(u32, SubkeyList)>> {
    let list = read_list(buffer, root)?;
    if !list.is_index_root() {
        return Ok(vec![(root, list)]);
    }

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(list.len());
    for leaf_offset in list.key_offsets_iter() {
        if !seen.insert(leaf_offset) || leaf_offset == root {
            return Err(RegistryError::CyclicReference { offset: leaf_offset });
        }
        let leaf = read_list(buffer, leaf_offset)?;
        if leaf.is_index_root() {
            return Err(RegistryError::CyclicReference { offset: leaf_offset });
        }
        out.push((leaf_offset, leaf));
    }
    Ok(out)
}

/// Collects every child nk offset under `root`.
///
/// Each offset is checked to name an allocated nk cell.
pub fn collect_children(buffer: &HiveBuffer, root: u32) -> Result<Vec<u32>> {
    if !is_valid_ref(root) {
        return Ok(Vec::new());
    }

    let mut children = Vec::new();
    for (_, leaf) in leaves(buffer, root)? {
        for child in leaf.key_offsets_iter() {
            CellType::KeyNode.expect(buffer.read_cell(child)?, child)?;
            children.push(child);
        }
    }
    Ok(children)
}

/// Finds the child named `name` (case-insensitive) under `root`.
pub fn find_child(buffer: &HiveBuffer, root: u32, name: &RegName) -> Result<Option<u32>> {
    if !is_valid_ref(root) {
        return Ok(None);
    }

    for (_, leaf) in leaves(buffer, root)? {
        for entry in &leaf.entries {
            if !leaf.hint_matches(entry, name) {
                continue;
            }
            let child = KeyNode::parse(buffer.read_cell(entry.key_offset)?, entry.key_offset)?;
            if child.name.eq_ignore_case(name) {
                return Ok(Some(entry.key_offset));
            }
        }
    }
    Ok(None)
}

/// Result of inserting into a child index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insertion {
    /// Offset the owning key must now reference.
    pub root: u32,
    /// Cells no longer referenced once the owner points at `root`.
    pub retired: Vec<u32>,
}

/// Adds `child` (named `name`) to the index rooted at `root`.
///
/// `new_kind` is the leaf type used when a new leaf has to be created from
/// nothing. Existing cells are only modified once every allocation the
/// insertion needs has succeeded; on error, cells allocated so far are freed.
pub fn insert_child(
    buffer: &mut HiveBuffer,
    alloc: &mut CellAllocator,
    root: u32,
    child: u32,
    name: &RegName,
    new_kind: SubkeyListType,
) -> Result<Insertion> {
    if !is_valid_ref(root) {
        let mut leaf = SubkeyList::new(new_kind);
        leaf.entries.push(leaf.entry_for(child, name));
        let offset = write_new(buffer, alloc, &leaf)?;
        return Ok(Insertion {
            root: offset,
            retired: Vec::new(),
        });
    }

    let top = read_list(buffer, root)?;
    if !top.is_index_root() {
        if top.len() < LEAF_CAPACITY {
            let mut grown = top;
            grown.entries.push(grown.entry_for(child, name));
            let placed = place(buffer, alloc, root, &grown)?;
            return Ok(Insertion {
                root: placed,
                retired: if placed == root { Vec::new() } else { vec![root] },
            });
        }

        // Full leaf: split into an index root over the old leaf and a new one
        let mut fresh = SubkeyList::new(top.kind);
        fresh.entries.push(fresh.entry_for(child, name));
        let fresh_offset = write_new(buffer, alloc, &fresh)?;

        let mut index = SubkeyList::new(SubkeyListType::IndexRoot);
        index.entries.push(SubkeyListEntry { key_offset: root, name_hint: 0 });
        index.entries.push(SubkeyListEntry { key_offset: fresh_offset, name_hint: 0 });
        let index_offset = match write_new(buffer, alloc, &index) {
            Ok(offset) => offset,
            Err(e) => {
                alloc.free(buffer, fresh_offset)?;
                return Err(e);
            }
        };

        debug!(leaf = %format!("{:#x}", root), "Promoted full leaf to index root");
        return Ok(Insertion {
            root: index_offset,
            retired: Vec::new(),
        });
    }

    let all = leaves(buffer, root)?;
    let mut index = top;

    match all.last() {
        Some((last_offset, last)) if last.len() < LEAF_CAPACITY => {
            let last_offset = *last_offset;
            let mut grown = last.clone();
            grown.entries.push(grown.entry_for(child, name));
            let placed = place(buffer, alloc, last_offset, &grown)?;
            if placed == last_offset {
                return Ok(Insertion { root, retired: Vec::new() });
            }

            // Same entry count, so the index root is rewritten in place
            if let Some(slot) = index.entries.last_mut() {
                slot.key_offset = placed;
            }
            let encoded = index.encode()?;
            buffer.cell_mut(root)?[..encoded.len()].copy_from_slice(&encoded);
            Ok(Insertion {
                root,
                retired: vec![last_offset],
            })
        }
        last => {
            let kind = last.map(|(_, leaf)| leaf.kind).unwrap_or(new_kind);
            let mut fresh = SubkeyList::new(kind);
            fresh.entries.push(fresh.entry_for(child, name));
            let fresh_offset = write_new(buffer, alloc, &fresh)?;

            index.entries.push(SubkeyListEntry { key_offset: fresh_offset, name_hint: 0 });
            let placed = match place(buffer, alloc, root, &index) {
                Ok(offset) => offset,
                Err(e) => {
                    alloc.free(buffer, fresh_offset)?;
                    return Err(e);
                }
            };
            Ok(Insertion {
                root: placed,
                retired: if placed == root { Vec::new() } else { vec![root] },
            })
        }
    }
}

/// Allocates a cell for `list` and writes it.
fn write_new(buffer: &mut HiveBuffer, alloc: &mut CellAllocator, list: &SubkeyList) -> Result<u32> {
    let encoded = list.encode()?;
    let offset = alloc.allocate(buffer, encoded.len())?;
    buffer.cell_mut(offset)?[..encoded.len()].copy_from_slice(&encoded);
    Ok(offset)
}

/// Writes `list` over the cell at `offset` if it fits, otherwise into a new cell.
///
/// The old cell is never freed here; the caller retires it after repointing.
fn place(buffer: &mut HiveBuffer, alloc: &mut CellAllocator, offset: u32, list: &SubkeyList) -> Result<u32> {
    let encoded = list.encode()?;
    let capacity = buffer.read_cell(offset)?.len();
    if encoded.len() <= capacity {
        buffer.cell_mut(offset)?[..encoded.len()].copy_from_slice(&encoded);
        return Ok(offset);
    }
    write_new(buffer, alloc, list)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subkey_list_type() {
        assert_eq!(
            SubkeyListType::from_signature(b"li", 0).unwrap(),
            SubkeyListType::IndexLeaf
        );
        assert_eq!(
            SubkeyListType::from_signature(b"ri", 0).unwrap(),
            SubkeyListType::IndexRoot
        );
        assert!(matches!(
            SubkeyListType::from_signature(b"nk", 0x40),
            Err(RegistryError::InvalidSubkeyList { offset: 0x40, .. })
        ));
    }

    #[test]
    fn test_encode_parse_lh() {
        let mut list = SubkeyList::new(SubkeyListType::HashLeaf);
        list.entries.push(list.entry_for(0x120, &RegName::new("Software")));
        list.entries.push(list.entry_for(0x220, &RegName::new("System")));

        let data = list.encode().unwrap();
        assert_eq!(data.len(), 4 + 2 * 8);
        assert_eq!(SubkeyList::parse(&data, 0).unwrap(), list);
    }

    #[test]
    fn test_li_has_no_hints() {
        let mut data = vec![0u8; 12];
        data[0..2].copy_from_slice(b"li");
        write_u16_le(&mut data, 2, 2);
        write_u32_le(&mut data, 4, 0x80);
        write_u32_le(&mut data, 8, 0x100);

        let list = SubkeyList::parse(&data, 0).unwrap();
        assert_eq!(list.key_offsets_iter().collect::<Vec<_>>(), vec![0x80, 0x100]);
        assert!(list.entries.iter().all(|e| e.name_hint == 0));
    }

    #[test]
    fn test_truncated_list() {
        let mut data = vec![0u8; 8];
        data[0..2].copy_from_slice(b"lf");
        write_u16_le(&mut data, 2, 2);
        assert!(matches!(
            SubkeyList::parse(&data, 0),
            Err(RegistryError::TruncatedData { expected: 20, .. })
        ));
    }

    #[test]
    fn test_lh_hash_is_case_insensitive() {
        assert_eq!(lh_hash(&RegName::new("abc")), lh_hash(&RegName::new("ABC")));
        // 'A' * 37^2 + 'B' * 37 + 'C'
        assert_eq!(lh_hash(&RegName::new("ABC")), 65 * 37 * 37 + 66 * 37 + 67);
        assert_eq!(lh_hash(&RegName::new("")), 0);
    }

    #[test]
    fn test_lf_hint() {
        assert_eq!(lf_hint(&RegName::new("Software")), u32::from_le_bytes(*b"Soft"));
        assert_eq!(lf_hint(&RegName::new("ab")), u32::from_le_bytes([b'a', b'b', 0, 0]));
    }

    fn scratch() -> (HiveBuffer, CellAllocator) {
        let buffer = HiveBuffer::from_vec(crate::fixtures::minimal_hive(), true);
        let alloc = CellAllocator::scan(&buffer, 0x1000).unwrap();
        (buffer, alloc)
    }

    fn add_key(buffer: &mut HiveBuffer, alloc: &mut CellAllocator, name: &RegName) -> u32 {
        let encoded = KeyNode::encode_new(name, 0x20, crate::utils::NO_OFFSET, 0).unwrap();
        let offset = alloc.allocate(buffer, encoded.len()).unwrap();
        buffer.cell_mut(offset).unwrap()[..encoded.len()].copy_from_slice(&encoded);
        offset
    }

    #[test]
    fn test_insert_and_find() {
        let (mut buffer, mut alloc) = scratch();
        let mut root = crate::utils::NO_OFFSET;
        let mut keys = Vec::new();

        for name in ["Software", "System", "zero\0key", "weird™"] {
            let name = RegName::new(name);
            let key = add_key(&mut buffer, &mut alloc, &name);
            let insertion = insert_child(&mut buffer, &mut alloc, root, key, &name, SubkeyListType::HashLeaf).unwrap();
            for retired in insertion.retired {
                alloc.free(&mut buffer, retired).unwrap();
            }
            root = insertion.root;
            keys.push((name, key));
        }

        assert_eq!(collect_children(&buffer, root).unwrap().len(), 4);
        for (name, key) in &keys {
            assert_eq!(find_child(&buffer, root, name).unwrap(), Some(*key));
        }
        assert_eq!(find_child(&buffer, root, &RegName::new("SYSTEM")).unwrap(), Some(keys[1].1));
        assert_eq!(find_child(&buffer, root, &RegName::new("Missing")).unwrap(), None);
        alloc.verify(&buffer).unwrap();
    }

    #[test]
    fn test_full_leaf_becomes_index_root() {
        let (mut buffer, mut alloc) = scratch();
        let mut root = crate::utils::NO_OFFSET;

        for i in 0..=LEAF_CAPACITY {
            let name = RegName::new(&format!("key{}", i));
            let key = add_key(&mut buffer, &mut alloc, &name);
            let insertion = insert_child(&mut buffer, &mut alloc, root, key, &name, SubkeyListType::FastLeaf).unwrap();
            for retired in insertion.retired {
                alloc.free(&mut buffer, retired).unwrap();
            }
            root = insertion.root;
        }

        let top = SubkeyList::parse(buffer.read_cell(root).unwrap(), root).unwrap();
        assert!(top.is_index_root());
        assert_eq!(top.len(), 2);
        assert_eq!(collect_children(&buffer, root).unwrap().len(), LEAF_CAPACITY + 1);
        assert!(find_child(&buffer, root, &RegName::new("KEY0")).unwrap().is_some());
        let last = format!("key{}", LEAF_CAPACITY);
        assert!(find_child(&buffer, root, &RegName::new(&last)).unwrap().is_some());
        alloc.verify(&buffer).unwrap();
    }

    #[test]
    fn test_nested_index_root_is_corruption() {
        let (mut buffer, mut alloc) = scratch();
        let mut index = SubkeyList::new(SubkeyListType::IndexRoot);
        index.entries.push(SubkeyListEntry { key_offset: 0, name_hint: 0 });
        let offset = write_new(&mut buffer, &mut alloc, &index).unwrap();

        // Point the index root at itself
        write_u32_le(buffer.cell_mut(offset).unwrap(), 4, offset);
        assert!(matches!(
            collect_children(&buffer, offset),
            Err(RegistryError::CyclicReference { .. })
        ));
    }

    #[test]
    fn test_lf_hint_matching_ignores_case() {
        let list = SubkeyList::new(SubkeyListType::FastLeaf);
        let entry = list.entry_for(0x20, &RegName::new("Software"));
        assert!(list.hint_matches(&entry, &RegName::new("SOFTWARE")));
        assert!(!list.hint_matches(&entry, &RegName::new("System")));
    }

    #[test]
    fn test_lf_hint_matching_folds_latin1() {
        let list = SubkeyList::new(SubkeyListType::FastLeaf);
        let entry = list.entry_for(0x20, &RegName::new("äbc"));
        assert!(list.hint_matches(&entry, &RegName::new("Äbc")));
        assert!(list.hint_matches(&entry, &RegName::new("ÄBC")));
        assert!(!list.hint_matches(&entry, &RegName::new("öbc")));
    }

    #[test]
    fn test_lf_hint_zero_byte_matches_any() {
        let list = SubkeyList::new(SubkeyListType::FastLeaf);
        // Another writer may store the low byte of a wide character
        let stored = SubkeyListEntry {
            key_offset: 0x20,
            name_hint: u32::from_le_bytes([0x22, b'x', 0, 0]),
        };
        assert!(list.hint_matches(&stored, &RegName::new("™x")));

        let entry = list.entry_for(0x20, &RegName::new("™x"));
        assert_eq!(entry.name_hint.to_le_bytes(), [0, b'x', 0, 0]);
        assert!(list.hint_matches(&entry, &RegName::new("™X")));
    }
}
