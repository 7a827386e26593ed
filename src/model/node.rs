// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use alloc::borrow::ToOwned;
use alloc::string::String;
use indexmap::IndexMap;
use twox_hash::xxhash64;

use super::property::{DeviceTreeProperty, is_phandle_property};

/// A handle to a node inside a [`DeviceTree`](super::DeviceTree) arena.
///
/// Handles are cheap to copy and stay valid for as long as the node exists
/// in its tree, whether or not the node is currently attached to a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(super) u32);

/// Lifecycle markers of a node.
///
/// `overlay` marks a node synthesized by the overlay engine; such nodes are
/// created through exactly one overlay changeset and released only when
/// that changeset is removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFlags {
    /// The node was allocated at runtime rather than unflattened as part of
    /// the boot tree.
    pub dynamic: bool,
    /// The node is not currently linked into its parent's child table.
    pub detached: bool,
    /// The node was synthesized by the overlay engine.
    pub overlay: bool,
}

pub(crate) fn name_map_hasher() -> xxhash64::State {
    xxhash64::State::with_seed(0xd00d_feed)
}

/// A node stored in a [`DeviceTree`](super::DeviceTree) arena.
///
/// Children and properties are kept in [`IndexMap`]s, which provide O(1)
/// lookups by name while preserving insertion order. Children are referred
/// to by [`NodeId`]; the parent link is a non-owning id, which is what
/// breaks the parent/child reference cycle.
#[derive(Debug, Clone)]
pub struct DeviceTreeNode {
    name: String,
    properties: IndexMap<String, DeviceTreeProperty, xxhash64::State>,
    pub(super) children: IndexMap<String, NodeId, xxhash64::State>,
    pub(super) parent: Option<NodeId>,
    pub(super) phandle: u32,
    pub(super) flags: NodeFlags,
}

impl Default for DeviceTreeNode {
    fn default() -> Self {
        Self {
            name: String::new(),
            properties: IndexMap::with_hasher(name_map_hasher()),
            children: IndexMap::with_hasher(name_map_hasher()),
            parent: None,
            phandle: 0,
            flags: NodeFlags::default(),
        }
    }
}

impl DeviceTreeNode {
    /// Creates a new `DeviceTreeNode` with the given basename.
    ///
    /// # Examples
    ///
    /// ```
    /// # use dt_overlay::DeviceTreeNode;
    /// let node = DeviceTreeNode::new("uart@1000");
    /// assert_eq!(node.name(), "uart@1000");
    /// assert_eq!(node.phandle(), 0);
    /// ```
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Returns the name of this node.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the phandle of this node, or 0 if it has none.
    ///
    /// The value mirrors the node's `phandle` (or legacy `linux,phandle`)
    /// property and is maintained by property insertion and removal.
    #[must_use]
    pub fn phandle(&self) -> u32 {
        self.phandle
    }

    /// Returns the lifecycle markers of this node.
    #[must_use]
    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    pub(crate) fn flags_mut(&mut self) -> &mut NodeFlags {
        &mut self.flags
    }

    pub(crate) fn set_phandle(&mut self, phandle: u32) {
        self.phandle = phandle;
    }

    /// Returns the parent of this node, if any.
    ///
    /// Nodes synthesized by the overlay engine have a parent before they
    /// are attached to it.
    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Returns an iterator over the properties of this node.
    pub fn properties(&self) -> impl Iterator<Item = &DeviceTreeProperty> {
        self.properties.values()
    }

    /// Returns a mutable iterator over the properties of this node.
    pub fn properties_mut(&mut self) -> impl Iterator<Item = &mut DeviceTreeProperty> {
        self.properties.values_mut()
    }

    /// Finds a property by its name and returns a reference to it.
    ///
    /// # Examples
    ///
    /// ```
    /// # use dt_overlay::{DeviceTreeNode, DeviceTreeProperty};
    /// let mut node = DeviceTreeNode::new("uart@1000");
    /// node.add_property(DeviceTreeProperty::string("status", "disabled"));
    /// let status = node.property("status").unwrap();
    /// assert_eq!(status.as_str(), Ok("disabled"));
    /// assert!(node.property("compatible").is_none());
    /// ```
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&DeviceTreeProperty> {
        self.properties.get(name)
    }

    /// Finds a property by its name and returns a mutable reference to it.
    #[must_use]
    pub fn property_mut(&mut self, name: &str) -> Option<&mut DeviceTreeProperty> {
        self.properties.get_mut(name)
    }

    /// Adds a property to this node, replacing any property with the same
    /// name in place.
    ///
    /// Inserting a 4-byte `phandle` (or `linux,phandle`) property updates
    /// the node's mirrored [`phandle`](Self::phandle) value.
    pub fn add_property(&mut self, property: DeviceTreeProperty) {
        if is_phandle_property(property.name())
            && let Ok(value) = property.as_u32()
        {
            self.phandle = value;
        }
        self.properties.insert(property.name().to_owned(), property);
    }

    /// Removes a property from this node by its name.
    pub fn remove_property(&mut self, name: &str) -> Option<DeviceTreeProperty> {
        let removed = self.properties.shift_remove(name);
        if removed.is_some() && is_phandle_property(name) {
            self.phandle = 0;
        }
        removed
    }

    /// Returns whether this node has any children.
    #[must_use]
    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Returns an iterator over the ids of this node's children, in
    /// insertion order.
    pub fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.values().copied()
    }

    /// Finds a child by its name.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<NodeId> {
        self.children.get(name).copied()
    }
}
