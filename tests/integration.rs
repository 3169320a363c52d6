//! Integration tests driving the public tree API over synthesized hives.

mod common;

use hive_edit::{ErrorKind, Hive, NewValue, OpenMode, RegName, ValueType};
use proptest::prelude::*;
use std::path::PathBuf;

fn temp_hive(name: &str, bytes: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("hive-edit-{}-{}.hiv", std::process::id(), name));
    std::fs::write(&path, bytes).unwrap();
    path
}

fn writable(bytes: Vec<u8>) -> Hive {
    Hive::from_vec(bytes, OpenMode::Write).unwrap()
}

#[test]
fn test_open_close_unmodified_is_byte_identical() {
    let sample = common::sample_hive();
    let path = temp_hive("roundtrip", &sample.bytes);

    let hive = Hive::open(&path, OpenMode::Write).unwrap();
    hive.close().unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), sample.bytes);
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_read_mode_open() {
    let sample = common::sample_hive();
    let path = temp_hive("readmode", &sample.bytes);

    let hive = Hive::open(&path, OpenMode::Read).unwrap();
    assert_eq!(hive.root(), sample.root);
    assert_eq!(hive.node_nr_children(hive.root()).unwrap(), 3);
    assert!(!hive.is_writable());
    hive.close().unwrap();

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_get_child_finds_every_child() {
    let sample = common::sample_hive();
    let hive = Hive::from_vec(sample.bytes, OpenMode::Read).unwrap();
    let root = hive.root();

    let children = hive.node_children(root).unwrap();
    assert_eq!(children.len(), sample.children.len());

    for child in children {
        let name = hive.node_name(child).unwrap();
        assert_eq!(hive.node_get_child(root, &name).unwrap(), Some(child));
        assert_eq!(hive.node_parent(child).unwrap(), Some(root));
    }
}

#[test]
fn test_special_character_names_read() {
    let sample = common::sample_hive();
    let hive = Hive::from_vec(sample.bytes, OpenMode::Read).unwrap();
    let root = hive.root();

    for (name, offset) in &sample.children {
        assert_eq!(hive.node_get_child(root, name).unwrap(), Some(*offset));
        assert_eq!(&hive.node_name(*offset).unwrap(), name);
    }

    let zero = hive.node_get_child(root, "zero\0key").unwrap().unwrap();
    assert_eq!(hive.node_name_raw(zero).unwrap().as_bytes(), b"zero\0key");
    // Embedded zero is part of the name, not a terminator
    assert_eq!(hive.node_get_child(root, "zero").unwrap(), None);

    let weird = hive.node_get_child(root, "WEIRD™").unwrap().unwrap();
    assert!(!hive.node_name_raw(weird).unwrap().is_compressed());

    let value = hive.node_get_value(root, "symbols $£₤₧€").unwrap().unwrap();
    assert_eq!(value, sample.binary_value);
    assert_eq!(hive.value_key(value).unwrap(), "symbols $£₤₧€");

    let value = hive.node_get_value(root, "zero\0val").unwrap().unwrap();
    assert_eq!(hive.value_type(value).unwrap(), (ValueType::Dword, 4));
    assert_eq!(hive.value_value(value).unwrap().1, 0x1234_5678u32.to_le_bytes());
}

#[test]
fn test_add_child_special_names_survive_reopen() {
    let mut hive = writable(common::minimal_hive());
    let root = hive.root();

    let names = ["abcd_äöüß", "zero\0key", "weird™", "a\0b\0c"];
    for name in names {
        hive.node_add_child(root, name).unwrap();
    }

    let hive = Hive::from_vec(hive.to_bytes().unwrap(), OpenMode::Read).unwrap();
    let root = hive.root();
    for name in names {
        let child = hive.node_get_child(root, name).unwrap().unwrap();
        assert_eq!(hive.node_name(child).unwrap(), name);
        assert_eq!(hive.node_name_raw(child).unwrap(), RegName::new(name));
        assert_eq!(hive.node_nr_children(child).unwrap(), 0);
        assert_eq!(hive.node_nr_values(child).unwrap(), 0);
    }
}

#[test]
fn test_add_child_to_existing_li_leaf() {
    let sample = common::sample_hive();
    let mut hive = writable(sample.bytes);
    let root = hive.root();

    let child = hive.node_add_child(root, "Fourth").unwrap();
    assert_eq!(hive.node_nr_children(root).unwrap(), 4);
    assert_eq!(hive.node_get_child(root, "fourth").unwrap(), Some(child));
    for (name, offset) in &sample.children {
        assert_eq!(hive.node_get_child(root, name).unwrap(), Some(*offset));
    }

    let err = hive.node_add_child(root, "ABCD_ÄÖÜß").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DuplicateName);
}

#[test]
fn test_nested_path() {
    let mut hive = writable(common::minimal_hive());
    let root = hive.root();
    let a = hive.node_add_child(root, "A").unwrap();
    let b = hive.node_add_child(a, "B").unwrap();
    let c = hive.node_add_child(b, "C").unwrap();

    assert_eq!(hive.node_find_path(root, "A\\B\\C").unwrap(), c);
    assert_eq!(hive.node_find_path(root, "\\a\\b").unwrap(), b);
    let err = hive.node_find_path(root, "A\\X\\C").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.is_not_found());
}

#[test]
fn test_set_values_then_set_value() {
    let mut hive = writable(common::minimal_hive());
    let root = hive.root();
    let child = hive.node_add_child(root, "child").unwrap();

    hive.node_set_values(
        child,
        &[
            NewValue::new("first", ValueType::Binary, b"hello".to_vec()),
            NewValue::new("second", ValueType::Binary, b"world".to_vec()),
        ],
    )
    .unwrap();
    assert_eq!(hive.node_nr_values(child).unwrap(), 2);

    let first = hive.node_get_value(child, "first").unwrap().unwrap();
    let second = hive.node_get_value(child, "second").unwrap().unwrap();

    hive.node_set_value(child, &NewValue::new("first", ValueType::Binary, b"goodbye".to_vec()))
        .unwrap();

    assert_eq!(hive.node_get_value(child, "first").unwrap(), Some(first));
    assert_eq!(hive.value_value(first).unwrap(), (ValueType::Binary, b"goodbye".to_vec()));
    assert_eq!(hive.value_type(first).unwrap(), (ValueType::Binary, 7));
    assert_eq!(hive.value_value(second).unwrap(), (ValueType::Binary, b"world".to_vec()));
    assert_eq!(hive.node_nr_values(child).unwrap(), 2);
}

#[test]
fn test_set_values_replaces_whole_set() {
    let sample = common::sample_hive();
    let mut hive = writable(sample.bytes);
    let root = hive.root();

    hive.node_set_values(root, &[NewValue::new("only", ValueType::Qword, 1u64.to_le_bytes())])
        .unwrap();

    let values = hive.node_values(root).unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(hive.value_key(values[0]).unwrap(), "only");
    assert_eq!(hive.node_get_value(root, "zero\0val").unwrap(), None);
    assert_eq!(hive.node_get_value(root, "symbols $£₤₧€").unwrap(), None);

    // The old vk and data cells went back to the free pool
    let stats = hive.cell_stats().unwrap();
    assert_eq!(stats.total_bytes(), hive.to_bytes().unwrap().len() as u64);
}

#[test]
fn test_set_values_empty_clears() {
    let sample = common::sample_hive();
    let mut hive = writable(sample.bytes);
    let root = hive.root();

    hive.node_set_values(root, &[]).unwrap();
    assert_eq!(hive.node_nr_values(root).unwrap(), 0);
    assert!(hive.node_values(root).unwrap().is_empty());
    assert_eq!(hive.node_get_value(root, "zero\0val").unwrap(), None);
}

#[test]
fn test_set_value_leaves_others_untouched() {
    let sample = common::sample_hive();
    let mut hive = writable(sample.bytes);
    let root = hive.root();

    let updated = hive
        .node_set_value(root, &NewValue::new("ZERO\0VAL", ValueType::Binary, vec![0xAA; 12]))
        .unwrap();
    assert_eq!(updated, sample.dword_value);
    assert_eq!(hive.value_value(updated).unwrap(), (ValueType::Binary, vec![0xAA; 12]));

    let (value_type, data) = hive.value_value(sample.binary_value).unwrap();
    assert_eq!(value_type, ValueType::Binary);
    assert_eq!(data, common::SAMPLE_BINARY);
    assert_eq!(hive.node_nr_values(root).unwrap(), 2);
}

#[test]
fn test_set_value_special_names() {
    let mut hive = writable(common::minimal_hive());
    let root = hive.root();

    let zero = hive
        .node_set_value(root, &NewValue::new("zero\0val", ValueType::Binary, b"abc".to_vec()))
        .unwrap();
    let symbols = hive
        .node_set_value(root, &NewValue::new("symbols $£₤₧€", ValueType::Binary, b"xyz".to_vec()))
        .unwrap();

    let hive = Hive::from_vec(hive.to_bytes().unwrap(), OpenMode::Read).unwrap();
    let root = hive.root();
    assert_eq!(hive.node_get_value(root, "zero\0val").unwrap(), Some(zero));
    assert_eq!(hive.node_get_value(root, "symbols $£₤₧€").unwrap(), Some(symbols));
    assert_eq!(hive.value_key(symbols).unwrap(), "symbols $£₤₧€");
    assert_eq!(hive.value_key_raw(zero).unwrap().as_bytes(), b"zero\0val");
}

#[test]
fn test_data_cell_of_preset_value() {
    let sample = common::sample_hive();
    let hive = Hive::from_vec(sample.bytes, OpenMode::Read).unwrap();

    let cell = hive.value_data_cell(sample.binary_value).unwrap().unwrap();
    assert_eq!(cell.length, 37);
    assert_eq!(cell.offset, 0x1000 + sample.binary_data);

    assert_eq!(hive.value_data_cell(sample.dword_value).unwrap(), None);
}

#[test]
fn test_data_cell_of_new_value() {
    let mut hive = writable(common::minimal_hive());
    let root = hive.root();
    let child = hive.node_add_child(root, "child").unwrap();

    let value = hive
        .node_set_value(child, &NewValue::new("blob", ValueType::Binary, vec![7u8; 33]))
        .unwrap();
    let cell = hive.value_data_cell(value).unwrap().unwrap();
    assert_eq!(cell.length, 37);

    // The reported offset is where the 33 bytes actually are
    let bytes = hive.to_bytes().unwrap();
    let at = cell.offset as usize;
    let size = i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    assert_eq!(size, -40);
    assert_eq!(&bytes[at + 4..at + 37], &[7u8; 33][..]);
}

#[test]
fn test_heavy_fan_out_uses_index_root() {
    let mut hive = writable(common::minimal_hive());
    let root = hive.root();

    let mut added = Vec::new();
    for i in 0..600 {
        added.push(hive.node_add_child(root, &format!("child{:04}", i)).unwrap());
    }

    assert_eq!(hive.node_nr_children(root).unwrap(), 600);
    let children = hive.node_children(root).unwrap();
    assert_eq!(children.len(), 600);

    let hive = Hive::from_vec(hive.to_bytes().unwrap(), OpenMode::Read).unwrap();
    let root = hive.root();
    for (i, &child) in added.iter().enumerate() {
        assert_eq!(hive.node_get_child(root, &format!("CHILD{:04}", i)).unwrap(), Some(child));
    }
}

#[test]
fn test_flush_then_reopen_from_disk() {
    let path = temp_hive("flush", &common::minimal_hive());

    let mut hive = Hive::open(&path, OpenMode::Write).unwrap();
    let root = hive.root();
    let key = hive.node_add_child(root, "Persisted").unwrap();
    hive.node_set_value(key, &NewValue::new("v", ValueType::Binary, vec![1u8; 100]))
        .unwrap();
    assert!(hive.is_dirty());
    hive.close().unwrap();

    let hive = Hive::open(&path, OpenMode::Read).unwrap();
    let key = hive.node_find_path(hive.root(), "Persisted").unwrap();
    let value = hive.node_get_value(key, "v").unwrap().unwrap();
    assert_eq!(hive.value_value(value).unwrap().1, vec![1u8; 100]);
    assert_eq!(hive.base_block().hive_length as usize + 0x1000, std::fs::metadata(&path).unwrap().len() as usize);
    drop(hive);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_read_only_handle_rejects_writes() {
    let mut hive = Hive::from_vec(common::minimal_hive(), OpenMode::Read).unwrap();
    let root = hive.root();

    let value = NewValue::new("v", ValueType::Binary, vec![1]);
    assert_eq!(hive.node_set_value(root, &value).unwrap_err().kind(), ErrorKind::InvalidInput);
    assert_eq!(hive.node_set_values(root, &[value]).unwrap_err().kind(), ErrorKind::InvalidInput);
    assert_eq!(hive.node_add_child(root, "k").unwrap_err().kind(), ErrorKind::InvalidInput);
}

#[test]
fn test_unknown_value_type_round_trips() {
    let mut hive = writable(common::minimal_hive());
    let root = hive.root();
    let value = hive
        .node_set_value(root, &NewValue::new("odd", ValueType::Unknown(0xDEAD), b"payload".to_vec()))
        .unwrap();

    let hive = Hive::from_vec(hive.to_bytes().unwrap(), OpenMode::Read).unwrap();
    assert_eq!(hive.value_type(value).unwrap(), (ValueType::Unknown(0xDEAD), 7));
}

#[test]
fn test_struct_lengths() {
    let sample = common::sample_hive();
    let hive = Hive::from_vec(sample.bytes, OpenMode::Read).unwrap();
    assert_eq!(hive.node_struct_length(hive.root()).unwrap(), 0x4C + 4);
    // "symbols $£₤₧€" is stored as 13 UTF-16 units
    assert_eq!(hive.value_struct_length(sample.binary_value).unwrap(), 0x14 + 26);
}

#[derive(Debug, Clone)]
enum Op {
    AddChild(u16),
    SetValue(u8, usize),
    ReplaceValues(Vec<usize>),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<u16>().prop_map(Op::AddChild),
        (0u8..8, 0usize..2000).prop_map(|(n, len)| Op::SetValue(n, len)),
        proptest::collection::vec(0usize..300, 0..6).prop_map(Op::ReplaceValues),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_cells_account_for_every_byte(ops in proptest::collection::vec(op(), 1..40)) {
        let mut hive = writable(common::minimal_hive());
        let root = hive.root();

        for op in ops {
            match op {
                Op::AddChild(n) => {
                    let result = hive.node_add_child(root, &format!("k{}", n));
                    if let Err(e) = result {
                        prop_assert_eq!(e.kind(), ErrorKind::DuplicateName);
                    }
                }
                Op::SetValue(n, len) => {
                    let value = NewValue::new(format!("v{}", n), ValueType::Binary, vec![n; len]);
                    hive.node_set_value(root, &value).unwrap();
                    prop_assert_eq!(hive.value_value(hive.node_get_value(root, &value.key).unwrap().unwrap()).unwrap().1, value.data);
                }
                Op::ReplaceValues(lens) => {
                    let values: Vec<NewValue> = lens
                        .iter()
                        .enumerate()
                        .map(|(i, &len)| NewValue::new(format!("r{}", i), ValueType::Binary, vec![i as u8; len]))
                        .collect();
                    hive.node_set_values(root, &values).unwrap();
                    prop_assert_eq!(hive.node_nr_values(root).unwrap() as usize, values.len());
                }
            }

            let stats = hive.cell_stats().unwrap();
            prop_assert_eq!(stats.total_bytes(), hive.to_bytes().unwrap().len() as u64);
        }
    }
}

fn long_name() -> String {
    "x".repeat(70_000)
}

#[test]
fn test_set_values_failure_keeps_old_set() {
    let mut hive = writable(common::minimal_hive());
    let root = hive.root();
    let keep = hive
        .node_set_value(root, &NewValue::new("keep", ValueType::Binary, vec![7u8; 40]))
        .unwrap();
    let before = hive.cell_stats().unwrap();

    let values = [
        NewValue::new("fine", ValueType::Binary, vec![1u8; 100]),
        NewValue::new(long_name(), ValueType::Binary, vec![2u8; 100]),
    ];
    let err = hive.node_set_values(root, &values).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    assert_eq!(hive.node_values(root).unwrap(), vec![keep]);
    assert_eq!(hive.value_key(keep).unwrap(), "keep");
    assert_eq!(hive.value_value(keep).unwrap().1, vec![7u8; 40]);
    assert_eq!(hive.node_get_value(root, "fine").unwrap(), None);

    let after = hive.cell_stats().unwrap();
    assert_eq!(after.used_cells, before.used_cells);
    assert_eq!(after.used_bytes, before.used_bytes);
    assert_eq!(after.total_bytes(), before.total_bytes());
}

#[test]
fn test_set_value_failure_leaves_node_untouched() {
    let mut hive = writable(common::minimal_hive());
    let root = hive.root();
    let keep = hive
        .node_set_value(root, &NewValue::new("keep", ValueType::Dword, 5u32.to_le_bytes()))
        .unwrap();
    let before = hive.cell_stats().unwrap();

    let err = hive
        .node_set_value(root, &NewValue::new(long_name(), ValueType::Binary, vec![3u8; 200]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    assert_eq!(hive.node_values(root).unwrap(), vec![keep]);
    assert_eq!(hive.node_nr_values(root).unwrap(), 1);
    let after = hive.cell_stats().unwrap();
    assert_eq!(after.used_cells, before.used_cells);
    assert_eq!(after.used_bytes, before.used_bytes);

    let reopened = Hive::from_vec(hive.to_bytes().unwrap(), OpenMode::Read).unwrap();
    assert_eq!(reopened.node_values(reopened.root()).unwrap(), vec![keep]);
}
