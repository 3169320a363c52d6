//! In-memory hive fixtures shared by unit tests, integration tests and benches.
//!
//! Only the standard library is used here so the file can be included from
//! inside the crate as well as from `tests/` and `benches/`.

#![allow(dead_code)]

pub const BASE_BLOCK: usize = 0x1000;
pub const HBIN_HEADER: usize = 0x20;

pub const KEY_ROOT: u16 = 0x0004;
pub const KEY_NO_DELETE: u16 = 0x0008;
pub const KEY_COMP_NAME: u16 = 0x0020;

/// Lays out cells in a single hbin, in allocation order.
pub struct HiveBuilder {
    cells: Vec<u8>,
    minor_version: u32,
}

impl HiveBuilder {
    pub fn new(minor_version: u32) -> Self {
        Self {
            cells: vec![0u8; HBIN_HEADER],
            minor_version,
        }
    }

    /// Appends an allocated cell and returns its offset.
    pub fn cell(&mut self, payload: &[u8]) -> u32 {
        let offset = self.cells.len() as u32;
        let size = (payload.len() + 4 + 7) & !7;
        self.cells.extend_from_slice(&(-(size as i32)).to_le_bytes());
        self.cells.extend_from_slice(payload);
        self.cells.resize(offset as usize + size, 0);
        offset
    }

    /// Overwrites a u32 inside the payload of `cell`.
    pub fn patch_u32(&mut self, cell: u32, at: usize, value: u32) {
        let pos = cell as usize + 4 + at;
        self.cells[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Pads the hbin with one free cell and prepends a base block.
    pub fn finish(mut self, root: u32) -> Vec<u8> {
        let mut hbin_size = (self.cells.len() + 0xFFF) & !0xFFF;
        if hbin_size - self.cells.len() < 8 && hbin_size != self.cells.len() {
            hbin_size += 0x1000;
        }
        let tail = hbin_size - self.cells.len();
        if tail > 0 {
            self.cells.extend_from_slice(&(tail as i32).to_le_bytes());
            self.cells.resize(hbin_size, 0);
        }

        self.cells[0..4].copy_from_slice(b"hbin");
        self.cells[4..8].copy_from_slice(&0u32.to_le_bytes());
        self.cells[8..12].copy_from_slice(&(hbin_size as u32).to_le_bytes());

        let mut hive = base_block(root, hbin_size as u32, self.minor_version);
        hive.extend_from_slice(&self.cells);
        hive
    }
}

/// A 4096-byte base block with a valid checksum.
pub fn base_block(root: u32, hive_length: u32, minor_version: u32) -> Vec<u8> {
    let mut block = vec![0u8; BASE_BLOCK];
    block[0..4].copy_from_slice(b"regf");
    put_u32(&mut block, 0x04, 1);
    put_u32(&mut block, 0x08, 1);
    block[0x0C..0x14].copy_from_slice(&0x01D0_0000_0000_0000u64.to_le_bytes());
    put_u32(&mut block, 0x14, 1);
    put_u32(&mut block, 0x18, minor_version);
    put_u32(&mut block, 0x1C, 0);
    put_u32(&mut block, 0x20, 1);
    put_u32(&mut block, 0x24, root);
    put_u32(&mut block, 0x28, hive_length);
    put_u32(&mut block, 0x2C, 1);
    for (i, unit) in "fixture".encode_utf16().enumerate() {
        block[0x30 + i * 2..0x32 + i * 2].copy_from_slice(&unit.to_le_bytes());
    }
    let checksum = checksum(&block);
    put_u32(&mut block, 0x1FC, checksum);
    block
}

pub fn checksum(block: &[u8]) -> u32 {
    let sum = block[..0x1FC]
        .chunks_exact(4)
        .fold(0u32, |acc, w| acc ^ u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
    match sum {
        0xFFFF_FFFF => 0xFFFF_FFFE,
        0 => 1,
        other => other,
    }
}

fn put_u32(data: &mut [u8], at: usize, value: u32) {
    data[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// An nk payload with no subkeys, values or class.
pub fn nk(name: &[u8], compressed: bool, flags: u16, parent: u32, security: u32) -> Vec<u8> {
    let mut data = vec![0u8; 0x4C + name.len()];
    data[0..2].copy_from_slice(b"nk");
    let flags = flags | if compressed { KEY_COMP_NAME } else { 0 };
    data[2..4].copy_from_slice(&flags.to_le_bytes());
    data[4..12].copy_from_slice(&0x01D0_0000_0000_0000u64.to_le_bytes());
    put_u32(&mut data, 0x10, parent);
    put_u32(&mut data, 0x1C, 0xFFFF_FFFF);
    put_u32(&mut data, 0x20, 0xFFFF_FFFF);
    put_u32(&mut data, 0x28, 0xFFFF_FFFF);
    put_u32(&mut data, 0x2C, security);
    put_u32(&mut data, 0x30, 0xFFFF_FFFF);
    data[0x48..0x4A].copy_from_slice(&(name.len() as u16).to_le_bytes());
    data[0x4C..].copy_from_slice(name);
    data
}

/// An sk payload linked to itself with a reference count of one.
pub fn sk(own_offset: u32) -> Vec<u8> {
    let descriptor = [1u8, 0, 0x04, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    let mut data = vec![0u8; 0x14 + descriptor.len()];
    data[0..2].copy_from_slice(b"sk");
    put_u32(&mut data, 0x04, own_offset);
    put_u32(&mut data, 0x08, own_offset);
    put_u32(&mut data, 0x0C, 1);
    put_u32(&mut data, 0x10, descriptor.len() as u32);
    data[0x14..].copy_from_slice(&descriptor);
    data
}

/// A vk payload. `raw_length` carries the resident bit when set by the caller.
pub fn vk(name: &[u8], compressed: bool, value_type: u32, raw_length: u32, raw_offset: u32) -> Vec<u8> {
    let mut data = vec![0u8; 0x14 + name.len()];
    data[0..2].copy_from_slice(b"vk");
    data[2..4].copy_from_slice(&(name.len() as u16).to_le_bytes());
    put_u32(&mut data, 0x04, raw_length);
    put_u32(&mut data, 0x08, raw_offset);
    put_u32(&mut data, 0x0C, value_type);
    if compressed {
        data[0x10..0x12].copy_from_slice(&1u16.to_le_bytes());
    }
    data[0x14..].copy_from_slice(name);
    data
}

pub fn latin1(name: &str) -> Vec<u8> {
    name.chars().map(|c| c as u32 as u8).collect()
}

pub fn utf16(name: &str) -> Vec<u8> {
    name.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// A root key with a security cell and nothing else.
pub fn minimal_hive() -> Vec<u8> {
    minimal_hive_version(5)
}

pub fn minimal_hive_version(minor_version: u32) -> Vec<u8> {
    let mut builder = HiveBuilder::new(minor_version);
    let root = builder.cell(&nk(b"ROOT", true, KEY_ROOT | KEY_NO_DELETE, 0, 0));
    let security = builder.cell(&sk(0));
    builder.patch_u32(security, 0x04, security);
    builder.patch_u32(security, 0x08, security);
    builder.patch_u32(root, 0x2C, security);
    builder.finish(root)
}

/// Offsets of the interesting cells in [`sample_hive`].
pub struct Sample {
    pub bytes: Vec<u8>,
    pub root: u32,
    pub security: u32,
    pub children: Vec<(String, u32)>,
    pub dword_value: u32,
    pub binary_value: u32,
    pub binary_data: u32,
}

pub const SAMPLE_BINARY: [u8; 33] = *b"0123456789abcdefghijklmnopqrstuvw";

/// A root with three children in an `li` leaf and two values.
///
/// Children: "abcd_äöüß" (compressed), "zero\0key" (compressed), "weird™" (UTF-16).
/// Values: "zero\0val" (resident dword), "symbols $£₤₧€" (33 bytes of binary data).
pub fn sample_hive() -> Sample {
    let mut builder = HiveBuilder::new(5);
    let root = builder.cell(&nk(b"ROOT", true, KEY_ROOT | KEY_NO_DELETE, 0, 0));
    let security = builder.cell(&sk(0));
    builder.patch_u32(security, 0x04, security);
    builder.patch_u32(security, 0x08, security);
    builder.patch_u32(security, 0x0C, 4);
    builder.patch_u32(root, 0x2C, security);

    let names = [
        ("abcd_äöüß", latin1("abcd_äöüß"), true),
        ("zero\0key", latin1("zero\0key"), true),
        ("weird™", utf16("weird™"), false),
    ];
    let mut children = Vec::new();
    for (name, raw, compressed) in &names {
        let child = builder.cell(&nk(raw, *compressed, 0, root, security));
        children.push((name.to_string(), child));
    }

    let mut list = vec![0u8; 4 + 4 * children.len()];
    list[0..2].copy_from_slice(b"li");
    list[2..4].copy_from_slice(&(children.len() as u16).to_le_bytes());
    for (i, (_, child)) in children.iter().enumerate() {
        put_u32(&mut list, 4 + i * 4, *child);
    }
    let list = builder.cell(&list);
    builder.patch_u32(root, 0x14, children.len() as u32);
    builder.patch_u32(root, 0x1C, list);
    builder.patch_u32(root, 0x34, 18);

    let dword_value = builder.cell(&vk(&latin1("zero\0val"), true, 4, 0x8000_0004, 0x1234_5678));
    let binary_data = builder.cell(&SAMPLE_BINARY);
    let binary_value = builder.cell(&vk(&utf16("symbols $£₤₧€"), false, 3, 33, binary_data));
    let mut values = Vec::new();
    values.extend_from_slice(&dword_value.to_le_bytes());
    values.extend_from_slice(&binary_value.to_le_bytes());
    let values = builder.cell(&values);
    builder.patch_u32(root, 0x24, 2);
    builder.patch_u32(root, 0x28, values);
    builder.patch_u32(root, 0x3C, 26);
    builder.patch_u32(root, 0x40, 33);

    Sample {
        bytes: builder.finish(root),
        root,
        security,
        children,
        dword_value,
        binary_value,
        binary_data,
    }
}
