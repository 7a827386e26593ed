// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Phandle resolution for unflattened overlays.
//!
//! Overlay-internal phandles are shifted above the largest live phandle so
//! the two trees never collide; `__local_fixups__` lists where those
//! phandles are referenced inside the overlay, and `__fixups__` lists
//! references to labels that must be resolved against the live tree's
//! `/__symbols__` node. Resolution runs under the engine's phandle lock so
//! the observed live maximum cannot be invalidated by a concurrent apply.

use alloc::string::String;
use alloc::vec::Vec;

use crate::model::{DeviceTree, NodeId, is_phandle_property};
use crate::overlay::error::{OverlayError, OverlayErrorKind};

/// Phandle value used by overlay compilers for unresolved references.
const PHANDLE_UNRESOLVED: u32 = 0xffff_ffff;

pub(crate) fn resolve_phandles(
    live: &DeviceTree,
    overlay: &mut DeviceTree,
) -> Result<(), OverlayError> {
    let delta = live.max_phandle();

    adjust_overlay_phandles(overlay, delta)?;

    if let Some(local_fixups) = overlay.node(overlay.root()).child("__local_fixups__") {
        adjust_local_references(overlay, local_fixups, overlay.root(), delta)?;
    }

    if let Some(fixups) = overlay.node(overlay.root()).child("__fixups__") {
        resolve_external_references(live, overlay, fixups)?;
    }

    Ok(())
}

/// Shifts every overlay phandle by `delta`, both the node mirrors and the
/// `phandle`/`linux,phandle` property bytes. Zero and the unresolved
/// placeholder are left alone.
fn adjust_overlay_phandles(overlay: &mut DeviceTree, delta: u32) -> Result<(), OverlayError> {
    let mut nodes = Vec::new();
    overlay.visit(overlay.root(), &mut |_, id| nodes.push(id));

    for id in nodes {
        let node = overlay.node_mut(id);
        let phandle = node.phandle();
        if phandle == 0 || phandle == PHANDLE_UNRESOLVED {
            continue;
        }
        let Some(shifted) = phandle.checked_add(delta) else {
            return Err(OverlayError::new(OverlayErrorKind::CorruptPhandle, ""));
        };
        node.set_phandle(shifted);
        for prop in node.properties_mut() {
            if is_phandle_property(prop.name()) && prop.as_u32() == Ok(phandle) {
                prop.set_value(shifted.to_be_bytes());
            }
        }
    }
    Ok(())
}

/// Walks the `__local_fixups__` shadow tree alongside the overlay proper.
/// Each property under the shadow tree lists byte offsets of phandle cells
/// inside the identically-named property of the corresponding overlay node.
fn adjust_local_references(
    overlay: &mut DeviceTree,
    fixup_node: NodeId,
    target_node: NodeId,
    delta: u32,
) -> Result<(), OverlayError> {
    let fixup_props: Vec<(String, Vec<u8>)> = overlay
        .node(fixup_node)
        .properties()
        .map(|p| (String::from(p.name()), p.value().to_vec()))
        .collect();

    for (name, offsets) in fixup_props {
        let path = overlay.path(target_node);
        let prop = overlay
            .node_mut(target_node)
            .property_mut(&name)
            .ok_or_else(|| OverlayError::new(OverlayErrorKind::CorruptPhandle, path.clone()))?;
        let mut value = prop.value().to_vec();
        for offset_bytes in offsets.chunks(4) {
            let offset: [u8; 4] = offset_bytes
                .try_into()
                .map_err(|_| OverlayError::new(OverlayErrorKind::CorruptPhandle, path.clone()))?;
            let offset = u32::from_be_bytes(offset) as usize;
            let cell = value
                .get_mut(offset..offset + 4)
                .ok_or_else(|| OverlayError::new(OverlayErrorKind::CorruptPhandle, path.clone()))?;
            let old = u32::from_be_bytes(cell.try_into().expect("slice is 4 bytes"));
            let shifted = old
                .checked_add(delta)
                .ok_or_else(|| OverlayError::new(OverlayErrorKind::CorruptPhandle, path.clone()))?;
            cell.copy_from_slice(&shifted.to_be_bytes());
        }
        prop.set_value(value);
    }

    let children: Vec<(String, NodeId)> = overlay
        .node(fixup_node)
        .children()
        .map(|id| (String::from(overlay.node(id).name()), id))
        .collect();
    for (name, fixup_child) in children {
        let target_child = overlay.node(target_node).child(&name).ok_or_else(|| {
            OverlayError::new(OverlayErrorKind::CorruptPhandle, overlay.path(target_node))
        })?;
        adjust_local_references(overlay, fixup_child, target_child, delta)?;
    }

    Ok(())
}

/// Resolves `__fixups__` entries against the live tree's `/__symbols__`
/// node. Each property is named after a label; its value is a
/// NUL-separated list of `path:property:offset` locations in the overlay
/// where the labelled node's live phandle must be written.
fn resolve_external_references(
    live: &DeviceTree,
    overlay: &mut DeviceTree,
    fixups: NodeId,
) -> Result<(), OverlayError> {
    let fixup_props: Vec<(String, Vec<u8>)> = overlay
        .node(fixups)
        .properties()
        .map(|p| (String::from(p.name()), p.value().to_vec()))
        .collect();
    if fixup_props.is_empty() {
        return Ok(());
    }

    let symbols = live.find_node("/__symbols__").ok_or_else(|| {
        log::error!("overlay has fixups, but no symbols in live tree");
        OverlayError::new(OverlayErrorKind::Unresolved, "/__symbols__")
    })?;

    for (label, locations) in fixup_props {
        let symbol_path = live
            .node(symbols)
            .property(&label)
            .and_then(|p| p.as_str().ok())
            .ok_or_else(|| {
                log::error!("symbol '{label}' not found in live tree");
                OverlayError::new(OverlayErrorKind::Unresolved, label.clone())
            })?;
        let target = live
            .find_node(symbol_path)
            .ok_or_else(|| OverlayError::new(OverlayErrorKind::Unresolved, label.clone()))?;
        let phandle = live.node(target).phandle();
        if phandle == 0 {
            return Err(OverlayError::new(OverlayErrorKind::Unresolved, label));
        }

        for location in locations.split(|&b| b == 0).filter(|s| !s.is_empty()) {
            let location = core::str::from_utf8(location)
                .map_err(|_| OverlayError::new(OverlayErrorKind::CorruptPhandle, label.clone()))?;
            patch_reference(overlay, location, phandle)?;
        }
    }

    Ok(())
}

fn patch_reference(
    overlay: &mut DeviceTree,
    location: &str,
    phandle: u32,
) -> Result<(), OverlayError> {
    let invalid = || OverlayError::new(OverlayErrorKind::CorruptPhandle, location);

    let mut parts = location.rsplitn(3, ':');
    let offset = parts
        .next()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(invalid)?;
    let prop_name = parts.next().ok_or_else(invalid)?;
    let path = parts.next().ok_or_else(invalid)?;

    let node = overlay.find_node(path).ok_or_else(invalid)?;
    let prop = overlay
        .node_mut(node)
        .property_mut(prop_name)
        .ok_or_else(invalid)?;
    let mut value = prop.value().to_vec();
    let cell = value.get_mut(offset..offset + 4).ok_or_else(invalid)?;
    cell.copy_from_slice(&phandle.to_be_bytes());
    prop.set_value(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceTreeNode, DeviceTreeProperty};

    fn live_with_symbols() -> DeviceTree {
        let mut live = DeviceTree::new();
        let soc = live.add_child(live.root(), DeviceTreeNode::new("soc"));
        let led = live.add_child(soc, DeviceTreeNode::new("led"));
        live.node_mut(led)
            .add_property(DeviceTreeProperty::u32("phandle", 3));
        let symbols = live.add_child(live.root(), DeviceTreeNode::new("__symbols__"));
        live.node_mut(symbols)
            .add_property(DeviceTreeProperty::string("led", "/soc/led"));
        live
    }

    #[test]
    fn local_phandles_are_shifted_past_live_maximum() {
        let live = live_with_symbols();

        let mut overlay = DeviceTree::new();
        let frag = overlay.add_child(overlay.root(), DeviceTreeNode::new("fragment@0"));
        let content = overlay.add_child(frag, DeviceTreeNode::new("__overlay__"));
        let dev = overlay.add_child(content, DeviceTreeNode::new("dev"));
        overlay
            .node_mut(dev)
            .add_property(DeviceTreeProperty::u32("phandle", 1));
        let sibling = overlay.add_child(content, DeviceTreeNode::new("sibling"));
        overlay
            .node_mut(sibling)
            .add_property(DeviceTreeProperty::u32("some-ref", 1));

        // Shadow tree pointing at the reference cell.
        let lf_root = overlay.add_child(overlay.root(), DeviceTreeNode::new("__local_fixups__"));
        let lf_frag = overlay.add_child(lf_root, DeviceTreeNode::new("fragment@0"));
        let lf_content = overlay.add_child(lf_frag, DeviceTreeNode::new("__overlay__"));
        let lf_sibling = overlay.add_child(lf_content, DeviceTreeNode::new("sibling"));
        overlay
            .node_mut(lf_sibling)
            .add_property(DeviceTreeProperty::u32("some-ref", 0));

        resolve_phandles(&live, &mut overlay).unwrap();

        assert_eq!(overlay.node(dev).phandle(), 4); // live max is 3
        assert_eq!(
            overlay.node(dev).property("phandle").unwrap().as_u32(),
            Ok(4)
        );
        assert_eq!(
            overlay.node(sibling).property("some-ref").unwrap().as_u32(),
            Ok(4)
        );
    }

    #[test]
    fn external_references_resolve_against_live_symbols() {
        let live = live_with_symbols();

        let mut overlay = DeviceTree::new();
        let frag = overlay.add_child(overlay.root(), DeviceTreeNode::new("fragment@0"));
        overlay
            .node_mut(frag)
            .add_property(DeviceTreeProperty::u32("target", PHANDLE_UNRESOLVED));
        overlay.add_child(frag, DeviceTreeNode::new("__overlay__"));
        let fixups = overlay.add_child(overlay.root(), DeviceTreeNode::new("__fixups__"));
        overlay
            .node_mut(fixups)
            .add_property(DeviceTreeProperty::string("led", "/fragment@0:target:0"));

        resolve_phandles(&live, &mut overlay).unwrap();

        assert_eq!(
            overlay.node(frag).property("target").unwrap().as_u32(),
            Ok(3)
        );
    }

    #[test]
    fn unknown_label_is_rejected() {
        let live = live_with_symbols();

        let mut overlay = DeviceTree::new();
        let fixups = overlay.add_child(overlay.root(), DeviceTreeNode::new("__fixups__"));
        overlay
            .node_mut(fixups)
            .add_property(DeviceTreeProperty::string("nope", "/fragment@0:target:0"));

        let err = resolve_phandles(&live, &mut overlay).unwrap_err();
        assert!(matches!(err.kind, OverlayErrorKind::Unresolved));
    }

    #[test]
    fn fixups_without_live_symbols_are_rejected() {
        let live = DeviceTree::new();

        let mut overlay = DeviceTree::new();
        let fixups = overlay.add_child(overlay.root(), DeviceTreeNode::new("__fixups__"));
        overlay
            .node_mut(fixups)
            .add_property(DeviceTreeProperty::string("led", "/fragment@0:target:0"));

        let err = resolve_phandles(&live, &mut overlay).unwrap_err();
        assert!(matches!(err.kind, OverlayErrorKind::Unresolved));
    }
}
