// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Runtime device tree overlays.
//!
//! This crate keeps a mutable device tree in memory and grafts overlay
//! blobs onto it at runtime: an [`OverlayManager`] validates and
//! unflattens each blob, resolves its phandles against the live tree,
//! translates its fragments into an atomically applied changeset, and
//! later reverts the changeset again — refusing removals that would pull
//! a node out from under a newer overlay.
//!
//! # Examples
//!
//! ```
//! use dt_overlay::{
//!     DeviceTree, DeviceTreeNode, DeviceTreeProperty, OverlayManager,
//! };
//!
//! // A live tree with one bus.
//! let mut live = DeviceTree::new();
//! live.add_child(live.root(), DeviceTreeNode::new("bus"));
//!
//! // An overlay adding a device under it, flattened to a blob.
//! let mut overlay = DeviceTree::new();
//! let frag = overlay.add_child(overlay.root(), DeviceTreeNode::new("fragment@0"));
//! overlay
//!     .node_mut(frag)
//!     .add_property(DeviceTreeProperty::string("target-path", "/bus"));
//! let content = overlay.add_child(frag, DeviceTreeNode::new("__overlay__"));
//! let dev = overlay.add_child(content, DeviceTreeNode::new("dev"));
//! overlay
//!     .node_mut(dev)
//!     .add_property(DeviceTreeProperty::string("compatible", "x,y"));
//!
//! let manager = OverlayManager::new(live);
//! let (mut id, result) = manager.apply(&overlay.to_dtb(), None);
//! result.unwrap();
//! assert!(manager.with_tree(|tree| tree.find_node("/bus/dev").is_some()));
//!
//! manager.remove(&mut id).unwrap();
//! assert!(manager.with_tree(|tree| tree.find_node("/bus/dev").is_none()));
//! ```

#![no_std]

extern crate alloc;

pub mod error;
pub mod fdt;
pub mod model;
pub mod overlay;
mod writer;

pub use error::{Errno, FdtError};
pub use fdt::{Fdt, MemoryReservation};
pub use model::{DeviceTree, DeviceTreeNode, DeviceTreeProperty, NodeFlags, NodeId};
pub use overlay::{
    ChangesetAction, NotifierHandle, OverlayAction, OverlayError, OverlayErrorKind,
    OverlayManager, OverlayNotification, ReconfigNotification,
};
