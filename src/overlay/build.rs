// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Translation of overlay fragments into a changeset.
//!
//! The walker descends an overlay fragment and the live tree in lockstep,
//! carrying a target context of `(live node, in_livetree)`. While the
//! overlay structure still matches existing live nodes the walker emits
//! property adds and updates against them; once it steps past the live
//! tree it synthesizes detached nodes, and every deeper edit targets those
//! until the changeset attaches them.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use indexmap::IndexMap;
use twox_hash::xxhash64;

use crate::model::{
    DeviceTree, DeviceTreeNode, DeviceTreeProperty, NodeId, is_pseudo_property, name_map_hasher,
};
use crate::overlay::Fragment;
use crate::overlay::changeset::Changeset;
use crate::overlay::error::{OverlayError, OverlayErrorKind};

/// Target context of one walker level.
#[derive(Debug, Clone, Copy)]
struct Target {
    /// Node where the current level of the overlay will be applied.
    node: NodeId,
    /// Whether [`node`](Self::node) is attached to the live tree, as
    /// opposed to being a node synthesized for this changeset.
    in_livetree: bool,
}

/// Returns the last path component of a node name. Unflattened names are
/// single components already; this also tolerates full-path names.
fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Resolves a fragment's live-tree target: a `target` phandle wins over a
/// `target-path` string; with a caller-supplied target base, `target-path`
/// is interpreted relative to it.
pub(crate) fn find_target(
    live: &DeviceTree,
    overlay: &DeviceTree,
    info_node: NodeId,
    target_base: Option<&str>,
) -> Result<NodeId, OverlayError> {
    let info = overlay.node(info_node);

    if let Some(prop) = info.property("target")
        && let Ok(phandle) = prop.as_u32()
    {
        return live.find_by_phandle(phandle).ok_or_else(|| {
            log::error!(
                "find target, node: {}, phandle 0x{phandle:x} not found",
                overlay.path(info_node)
            );
            OverlayError::new(OverlayErrorKind::TargetNotFound, overlay.path(info_node))
        });
    }

    if let Some(prop) = info.property("target-path")
        && let Ok(path) = prop.as_str()
    {
        let full_path = match target_base {
            Some(base) => alloc::format!("{base}{path}"),
            None => String::from(path),
        };
        return live.find_node(&full_path).ok_or_else(|| {
            log::error!(
                "find target, node: {}, path '{full_path}' not found",
                overlay.path(info_node)
            );
            OverlayError::new(OverlayErrorKind::TargetNotFound, full_path)
        });
    }

    log::error!(
        "find target, node: {}, no target property",
        overlay.path(info_node)
    );
    Err(OverlayError::new(
        OverlayErrorKind::NoTarget,
        overlay.path(info_node),
    ))
}

/// Builds the changeset for one overlay changeset's fragments.
pub(crate) struct ChangesetBuilder<'a> {
    live: &'a mut DeviceTree,
    overlay: &'a DeviceTree,
    fragments: &'a [Fragment],
    symbols_fragment: bool,
    cset: &'a mut Changeset,
    /// Properties already destined for nodes that are not in the live tree
    /// yet, keyed by (synthesized node, property name). This is what makes
    /// "present in target" decidable inside a subtree that does not exist
    /// in the live tree.
    pending: IndexMap<(NodeId, String), (), xxhash64::State>,
}

impl<'a> ChangesetBuilder<'a> {
    pub(crate) fn new(
        live: &'a mut DeviceTree,
        overlay: &'a DeviceTree,
        fragments: &'a [Fragment],
        symbols_fragment: bool,
        cset: &'a mut Changeset,
    ) -> Self {
        Self {
            live,
            overlay,
            fragments,
            symbols_fragment,
            cset,
            pending: IndexMap::with_hasher(name_map_hasher()),
        }
    }

    /// Translates every fragment into changeset entries, the symbols
    /// fragment last, then checks the accumulated entries for
    /// cross-fragment conflicts.
    pub(crate) fn build(mut self) -> Result<(), OverlayError> {
        let fragments = self.fragments;
        let fragment_count = if self.symbols_fragment {
            fragments.len() - 1
        } else {
            fragments.len()
        };

        for fragment in &fragments[..fragment_count] {
            let target = Target {
                node: fragment.target,
                in_livetree: true,
            };
            if let Err(e) = self.next_level(target, fragment.overlay) {
                log::debug!("fragment apply failed '{}'", self.live.path(fragment.target));
                return Err(e);
            }
        }

        if self.symbols_fragment {
            let fragment = fragments[fragments.len() - 1];
            let target = Target {
                node: fragment.target,
                in_livetree: true,
            };
            if let Err(e) = self.symbols_node(target, fragment.overlay) {
                log::debug!(
                    "symbols fragment apply failed '{}'",
                    self.live.path(fragment.target)
                );
                return Err(e);
            }
        }

        self.dup_entry_check()
    }

    /// Adds one level of the overlay to the changeset: all properties of
    /// `overlay_node` first, then its children, recursively.
    fn next_level(&mut self, target: Target, overlay_node: NodeId) -> Result<(), OverlayError> {
        let props: Vec<DeviceTreeProperty> =
            self.overlay.node(overlay_node).properties().cloned().collect();
        for prop in &props {
            if let Err(e) = self.add_property(target, prop, false) {
                log::debug!(
                    "Failed to apply prop @{}/{}",
                    self.live.path(target.node),
                    prop.name()
                );
                return Err(e);
            }
        }

        let children: Vec<NodeId> = self.overlay.node(overlay_node).children().collect();
        for child in children {
            if let Err(e) = self.add_node(target, child) {
                log::debug!(
                    "Failed to apply node @{}/{}",
                    self.live.path(target.node),
                    self.overlay.node(child).name()
                );
                return Err(e);
            }
        }

        Ok(())
    }

    /// Adds a changeset entry for one overlay property.
    ///
    /// Pseudo-properties ("name", "phandle", "linux,phandle") targeting a
    /// live node are dropped. `#address-cells` and `#size-cells` already in
    /// the live tree must match the overlay byte for byte and are never
    /// updated. Symbol properties are duplicated through the path rewriter
    /// and may not update an existing symbol.
    fn add_property(
        &mut self,
        target: Target,
        overlay_prop: &DeviceTreeProperty,
        is_symbols_prop: bool,
    ) -> Result<(), OverlayError> {
        if target.in_livetree && is_pseudo_property(overlay_prop.name()) {
            return Ok(());
        }

        let existing = if target.in_livetree {
            self.live.node(target.node).property(overlay_prop.name())
        } else {
            None
        };

        if let Some(existing) = existing
            && matches!(existing.name(), "#address-cells" | "#size-cells")
        {
            if existing.value_eq(overlay_prop) {
                return Ok(());
            }
            log::error!(
                "ERROR: changing value of {} is not allowed in {}",
                existing.name(),
                self.live.path(target.node)
            );
            return Err(OverlayError::new(
                OverlayErrorKind::CellsMismatch,
                self.live.path(target.node),
            ));
        }

        let new_prop = if is_symbols_prop {
            if existing.is_some() {
                return Err(OverlayError::new(
                    OverlayErrorKind::SymbolCollision,
                    self.live.path(target.node),
                ));
            }
            self.dup_and_rewrite_symbol(overlay_prop).ok_or_else(|| {
                OverlayError::new(OverlayErrorKind::SymbolRewrite, overlay_prop.name())
            })?
        } else {
            overlay_prop.clone()
        };

        if !self.live.node(target.node).flags().overlay {
            log::warn!(
                "memory leak will occur if overlay removed, property: {}/{}",
                self.live.path(target.node),
                new_prop.name()
            );
        }

        let pending_key = (target.node, new_prop.name().to_string());
        let update =
            existing.is_some() || (!target.in_livetree && self.pending.contains_key(&pending_key));
        if update {
            self.cset.add_update_property(target.node, new_prop);
        } else {
            if !target.in_livetree {
                self.pending.insert(pending_key, ());
            }
            self.cset.add_add_property(target.node, new_prop);
        }

        Ok(())
    }

    /// Adds changeset entries for one overlay child node and its subtree.
    ///
    /// If the live target already has a child with the same basename the
    /// walker recurses into it, unless both nodes carry nonzero phandles —
    /// a fragment may not replace a phandle. Otherwise a detached node is
    /// synthesized and attached by the changeset.
    fn add_node(&mut self, target: Target, overlay_child: NodeId) -> Result<(), OverlayError> {
        let child_basename = basename(self.overlay.node(overlay_child).name()).to_string();

        if let Some(tchild) = self.live.node(target.node).child(&child_basename) {
            if self.overlay.node(overlay_child).phandle() != 0
                && self.live.node(tchild).phandle() != 0
            {
                return Err(OverlayError::new(
                    OverlayErrorKind::PhandleConflict,
                    self.live.path(tchild),
                ));
            }
            let target_child = Target {
                node: tchild,
                in_livetree: target.in_livetree,
            };
            return self.next_level(target_child, overlay_child);
        }

        let mut node = DeviceTreeNode::new(child_basename);
        {
            let flags = node.flags_mut();
            flags.dynamic = true;
            flags.overlay = true;
        }
        if let Some(prop) = self.overlay.node(overlay_child).property("phandle")
            && let Ok(phandle) = prop.as_u32()
        {
            // The obsolete "linux,phandle" is deliberately not consulted.
            node.set_phandle(phandle);
        }

        let tchild = self.live.alloc_orphan(node, Some(target.node));
        self.cset.add_attach_node(tchild);

        let target_child = Target {
            node: tchild,
            in_livetree: false,
        };
        self.next_level(target_child, overlay_child)
    }

    /// Translates the `__symbols__` fragment: properties only, each one
    /// duplicated through the path rewriter. Child nodes are rejected.
    fn symbols_node(
        &mut self,
        target: Target,
        overlay_symbols_node: NodeId,
    ) -> Result<(), OverlayError> {
        if self.overlay.node(overlay_symbols_node).has_children() {
            return Err(OverlayError::new(
                OverlayErrorKind::SymbolsHasChildren,
                self.overlay.path(overlay_symbols_node),
            ));
        }

        let props: Vec<DeviceTreeProperty> = self
            .overlay
            .node(overlay_symbols_node)
            .properties()
            .cloned()
            .collect();
        for prop in &props {
            if let Err(e) = self.add_property(target, prop, true) {
                log::debug!(
                    "Failed to apply symbols prop @{}/{}",
                    self.live.path(target.node),
                    prop.name()
                );
                return Err(e);
            }
        }

        Ok(())
    }

    /// Duplicates a symbol property, rewriting its overlay-internal path
    /// into the live-tree path of the fragment's target.
    ///
    /// The value must be a NUL-terminated path of the shape
    /// `/<fragment>/__overlay__/<tail>`; the result is
    /// `<target_path><tail>`. Any malformed value or lookup miss yields
    /// `None`, which the caller reports as an allocation-style failure.
    fn dup_and_rewrite_symbol(&self, prop: &DeviceTreeProperty) -> Option<DeviceTreeProperty> {
        let value = prop.value();
        let nul = value.iter().position(|&b| b == 0)?;
        let path = core::str::from_utf8(&value[..nul]).ok()?;
        if path.is_empty() {
            return None;
        }

        let fragment_name = path.strip_prefix('/')?.split('/').next()?;
        let fragment_node = self.overlay.node(self.overlay.root()).child(fragment_name)?;
        let overlay_node = self.overlay.node(fragment_node).child("__overlay__")?;
        let fragment = self.fragments.iter().find(|f| f.overlay == overlay_node)?;

        let overlay_name = self.overlay.path(overlay_node);
        if overlay_name.len() > path.len() {
            return None;
        }
        let path_tail = &path[overlay_name.len()..];
        let target_path = self.live.path(fragment.target);

        let mut new_value = Vec::with_capacity(target_path.len() + path_tail.len() + 1);
        new_value.extend_from_slice(target_path.as_bytes());
        new_value.extend_from_slice(path_tail.as_bytes());
        new_value.push(0);

        Some(DeviceTreeProperty::new(prop.name(), new_value))
    }

    /// Scans the accumulated changeset for entries that touch the same node
    /// path (attach/detach) or the same (node path, property name)
    /// (add/remove/update) from different fragments. Printed paths rather
    /// than node identity are compared, because a fragment-synthesized node
    /// and a live node may coexist at the same path mid-build.
    fn dup_entry_check(&self) -> Result<(), OverlayError> {
        let entries: Vec<(bool, String, Option<&str>)> = self
            .cset
            .entries()
            .map(|entry| {
                (
                    entry.action().is_node_op(),
                    self.live.path(entry.node()),
                    entry.property_name(),
                )
            })
            .collect();

        let mut duplicate = None;
        for (i, first) in entries.iter().enumerate() {
            for second in &entries[i + 1..] {
                if first.1 != second.1 {
                    continue;
                }
                if first.0 && second.0 {
                    log::error!(
                        "ERROR: multiple fragments add and/or delete node {}",
                        first.1
                    );
                    duplicate = Some(first.1.clone());
                } else if !first.0
                    && !second.0
                    && first.2.is_some()
                    && first.2 == second.2
                {
                    log::error!(
                        "ERROR: multiple fragments add, update, and/or delete property {}/{}",
                        first.1,
                        first.2.unwrap_or("")
                    );
                    duplicate = Some(first.1.clone());
                }
            }
        }

        match duplicate {
            Some(path) => Err(OverlayError::new(OverlayErrorKind::DuplicateEntry, path)),
            None => Ok(()),
        }
    }
}
