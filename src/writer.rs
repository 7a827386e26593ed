// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Serialization of a [`DeviceTree`] into a flattened device tree blob.

use alloc::borrow::ToOwned;
use alloc::collections::btree_map::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use zerocopy::IntoBytes;

use crate::fdt::{
    FDT_BEGIN_NODE, FDT_END, FDT_END_NODE, FDT_PROP, FdtHeader, MemoryReservation,
    align_tag_offset,
};
use crate::model::{DeviceTree, DeviceTreeProperty, NodeId};

pub(crate) fn to_bytes(tree: &DeviceTree) -> Vec<u8> {
    let rsvmap = reservation_block(&tree.memory_reservations);
    let (struct_block, strings_block) = struct_and_strings_blocks(tree);
    let header = FdtHeader::for_blocks(rsvmap.len(), struct_block.len(), strings_block.len());

    let mut dtb = Vec::with_capacity(
        size_of::<FdtHeader>() + rsvmap.len() + struct_block.len() + strings_block.len(),
    );
    dtb.extend_from_slice(header.as_bytes());
    dtb.extend_from_slice(&rsvmap);
    dtb.extend_from_slice(&struct_block);
    dtb.extend_from_slice(&strings_block);
    dtb
}

/// Emits the reservation entries followed by the all-zero terminator pair.
fn reservation_block(reservations: &[MemoryReservation]) -> Vec<u8> {
    let terminator = MemoryReservation::new(0, 0);
    let mut block = Vec::with_capacity((reservations.len() + 1) * 2 * size_of::<u64>());
    for entry in reservations.iter().chain(core::iter::once(&terminator)) {
        block.extend_from_slice(&entry.address().to_be_bytes());
        block.extend_from_slice(&entry.size().to_be_bytes());
    }
    block
}

fn struct_and_strings_blocks(tree: &DeviceTree) -> (Vec<u8>, Vec<u8>) {
    let mut strings = StringTable::default();
    let mut struct_block = Vec::new();

    write_node(&mut struct_block, &mut strings, tree, tree.root());
    struct_block.extend_from_slice(&FDT_END.to_be_bytes());

    (struct_block, strings.block)
}

fn write_node(
    struct_block: &mut Vec<u8>,
    strings: &mut StringTable,
    tree: &DeviceTree,
    id: NodeId,
) {
    let node = tree.node(id);

    struct_block.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
    struct_block.extend_from_slice(node.name().as_bytes());
    struct_block.push(0);
    align(struct_block);

    for prop in node.properties() {
        write_prop(struct_block, strings, prop);
    }

    for child in node.children() {
        write_node(struct_block, strings, tree, child);
    }

    struct_block.extend_from_slice(&FDT_END_NODE.to_be_bytes());
}

fn write_prop(struct_block: &mut Vec<u8>, strings: &mut StringTable, prop: &DeviceTreeProperty) {
    let len = u32::try_from(prop.value().len())
        .expect("property value does not fit the 32-bit length field");

    struct_block.extend_from_slice(&FDT_PROP.to_be_bytes());
    struct_block.extend_from_slice(&len.to_be_bytes());
    struct_block.extend_from_slice(&strings.offset_of(prop.name()).to_be_bytes());
    struct_block.extend_from_slice(prop.value());
    align(struct_block);
}

fn align(vec: &mut Vec<u8>) {
    let new_len = align_tag_offset(vec.len());
    vec.resize(new_len, 0);
}

/// The deduplicated strings block under construction.
#[derive(Default)]
struct StringTable {
    block: Vec<u8>,
    offsets: BTreeMap<String, u32>,
}

impl StringTable {
    fn offset_of(&mut self, name: &str) -> u32 {
        if let Some(offset) = self.offsets.get(name) {
            return *offset;
        }
        let offset =
            u32::try_from(self.block.len()).expect("strings block outgrew the 32-bit offset field");
        self.block.extend_from_slice(name.as_bytes());
        self.block.push(0);
        self.offsets.insert(name.to_owned(), offset);
        offset
    }
}
