// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The primitive-edit executor.
//!
//! A [`Changeset`] is an ordered list of attach/detach/add/remove/update
//! edits against live-tree nodes. Applying and reverting are inverses;
//! both attempt to restore the previous state when an edit fails partway
//! and report the recovery outcome, so the engine can decide whether the
//! live tree is still trustworthy.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use crate::error::Errno;
use crate::model::{DeviceTree, DeviceTreeProperty, NodeId};
use crate::overlay::notify::{NotifierChain, ReconfigNotification};

/// A primitive edit kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangesetAction {
    /// Link a node into its parent's child table.
    AttachNode,
    /// Unlink a node from its parent's child table.
    DetachNode,
    /// Add a property that must not already exist on the node.
    AddProperty,
    /// Remove a property from the node.
    RemoveProperty,
    /// Replace a property's value, or add it if absent.
    UpdateProperty,
}

impl ChangesetAction {
    #[must_use]
    pub(crate) fn name(self) -> &'static str {
        match self {
            ChangesetAction::AttachNode => "attach node",
            ChangesetAction::DetachNode => "detach node",
            ChangesetAction::AddProperty => "add property",
            ChangesetAction::RemoveProperty => "remove property",
            ChangesetAction::UpdateProperty => "update property",
        }
    }

    pub(crate) fn is_node_op(self) -> bool {
        matches!(self, ChangesetAction::AttachNode | ChangesetAction::DetachNode)
    }
}

impl fmt::Display for ChangesetAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One primitive edit.
#[derive(Debug)]
pub(crate) struct ChangesetEntry {
    action: ChangesetAction,
    node: NodeId,
    /// The new property for add/update, or the property name for remove.
    prop: Option<DeviceTreeProperty>,
    /// The displaced property, captured at apply time so revert can restore
    /// it.
    old_prop: Option<DeviceTreeProperty>,
}

impl ChangesetEntry {
    pub(crate) fn action(&self) -> ChangesetAction {
        self.action
    }

    pub(crate) fn node(&self) -> NodeId {
        self.node
    }

    pub(crate) fn property_name(&self) -> Option<&str> {
        self.prop.as_ref().map(DeviceTreeProperty::name)
    }
}

/// The outcome of a failed apply or revert: the edit error, plus the error
/// of the automatic recovery attempt if that failed too. A set `recovery`
/// means the live tree is in an unknown state.
#[derive(Debug)]
pub(crate) struct ChangesetError {
    pub(crate) error: Errno,
    pub(crate) recovery: Option<Errno>,
}

/// An ordered list of primitive edits that is applied and reverted as a
/// group.
#[derive(Debug, Default)]
pub(crate) struct Changeset {
    entries: Vec<ChangesetEntry>,
    /// How many leading entries are currently applied to the live tree.
    applied: usize,
}

impl Changeset {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_applied(&self) -> bool {
        self.applied == self.entries.len() && !self.entries.is_empty()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &ChangesetEntry> {
        self.entries.iter()
    }

    pub(crate) fn add_attach_node(&mut self, node: NodeId) {
        self.push(ChangesetAction::AttachNode, node, None);
    }

    pub(crate) fn add_detach_node(&mut self, node: NodeId) {
        self.push(ChangesetAction::DetachNode, node, None);
    }

    pub(crate) fn add_add_property(&mut self, node: NodeId, prop: DeviceTreeProperty) {
        self.push(ChangesetAction::AddProperty, node, Some(prop));
    }

    pub(crate) fn add_remove_property(&mut self, node: NodeId, prop: DeviceTreeProperty) {
        self.push(ChangesetAction::RemoveProperty, node, Some(prop));
    }

    pub(crate) fn add_update_property(&mut self, node: NodeId, prop: DeviceTreeProperty) {
        self.push(ChangesetAction::UpdateProperty, node, Some(prop));
    }

    fn push(&mut self, action: ChangesetAction, node: NodeId, prop: Option<DeviceTreeProperty>) {
        self.entries.push(ChangesetEntry {
            action,
            node,
            prop,
            old_prop: None,
        });
    }

    /// Applies all entries in order. If an entry fails, the applied prefix
    /// is reverted in reverse order before returning.
    pub(crate) fn apply(&mut self, tree: &mut DeviceTree) -> Result<(), ChangesetError> {
        for index in 0..self.entries.len() {
            if let Err(error) = Self::apply_entry(&mut self.entries[index], tree) {
                log::error!(
                    "changeset entry apply failed: {} {} ({error})",
                    self.entries[index].action,
                    tree.path(self.entries[index].node),
                );
                let mut recovery = None;
                for undo in (0..index).rev() {
                    if let Err(e) = Self::revert_entry(&mut self.entries[undo], tree) {
                        recovery = Some(e);
                        break;
                    }
                }
                self.applied = 0;
                return Err(ChangesetError { error, recovery });
            }
        }
        self.applied = self.entries.len();
        Ok(())
    }

    /// Reverts the applied entries in reverse order. If an entry fails, the
    /// already-reverted suffix is re-applied before returning.
    pub(crate) fn revert(&mut self, tree: &mut DeviceTree) -> Result<(), ChangesetError> {
        let count = self.applied;
        for index in (0..count).rev() {
            if let Err(error) = Self::revert_entry(&mut self.entries[index], tree) {
                log::error!(
                    "changeset entry revert failed: {} {} ({error})",
                    self.entries[index].action,
                    tree.path(self.entries[index].node),
                );
                let mut recovery = None;
                for redo in index + 1..count {
                    if let Err(e) = Self::apply_entry(&mut self.entries[redo], tree) {
                        recovery = Some(e);
                        break;
                    }
                }
                return Err(ChangesetError { error, recovery });
            }
        }
        self.applied = 0;
        Ok(())
    }

    fn apply_entry(entry: &mut ChangesetEntry, tree: &mut DeviceTree) -> Result<(), Errno> {
        match entry.action {
            ChangesetAction::AttachNode => tree.attach(entry.node),
            ChangesetAction::DetachNode => tree.detach(entry.node),
            ChangesetAction::AddProperty => {
                let prop = entry.prop.clone().ok_or(Errno::Inval)?;
                let node = tree.node_mut(entry.node);
                if node.property(prop.name()).is_some() {
                    return Err(Errno::Inval);
                }
                node.add_property(prop);
                Ok(())
            }
            ChangesetAction::RemoveProperty => {
                let name = entry.prop.as_ref().ok_or(Errno::Inval)?.name().to_string();
                match tree.node_mut(entry.node).remove_property(&name) {
                    Some(old) => {
                        entry.old_prop = Some(old);
                        Ok(())
                    }
                    None => Err(Errno::NoDev),
                }
            }
            ChangesetAction::UpdateProperty => {
                let prop = entry.prop.clone().ok_or(Errno::Inval)?;
                let node = tree.node_mut(entry.node);
                entry.old_prop = node.property(prop.name()).cloned();
                node.add_property(prop);
                Ok(())
            }
        }
    }

    fn revert_entry(entry: &mut ChangesetEntry, tree: &mut DeviceTree) -> Result<(), Errno> {
        match entry.action {
            ChangesetAction::AttachNode => tree.detach(entry.node),
            ChangesetAction::DetachNode => tree.attach(entry.node),
            ChangesetAction::AddProperty => {
                let name = entry.prop.as_ref().ok_or(Errno::Inval)?.name();
                match tree.node_mut(entry.node).remove_property(name) {
                    Some(_) => Ok(()),
                    None => Err(Errno::NoDev),
                }
            }
            ChangesetAction::RemoveProperty => {
                let old = entry.old_prop.take().ok_or(Errno::Inval)?;
                let node = tree.node_mut(entry.node);
                if node.property(old.name()).is_some() {
                    return Err(Errno::Inval);
                }
                node.add_property(old);
                Ok(())
            }
            ChangesetAction::UpdateProperty => {
                let name = entry.prop.as_ref().ok_or(Errno::Inval)?.name().to_string();
                let node = tree.node_mut(entry.node);
                match entry.old_prop.take() {
                    Some(old) => {
                        node.add_property(old);
                        Ok(())
                    }
                    None => match node.remove_property(&name) {
                        Some(_) => Ok(()),
                        None => Err(Errno::NoDev),
                    },
                }
            }
        }
    }

    /// Reports every entry on the reconfig chain after a successful apply.
    /// Observer errors are logged and do not stop delivery; the last error
    /// is returned.
    pub(crate) fn notify_applied(
        &self,
        tree: &DeviceTree,
        chain: &NotifierChain<ReconfigNotification>,
    ) -> Result<(), Errno> {
        self.notify(tree, chain, false)
    }

    /// Reports every entry on the reconfig chain after a successful revert,
    /// in revert (reverse) order. Same error policy as
    /// [`notify_applied`](Self::notify_applied).
    pub(crate) fn notify_reverted(
        &self,
        tree: &DeviceTree,
        chain: &NotifierChain<ReconfigNotification>,
    ) -> Result<(), Errno> {
        self.notify(tree, chain, true)
    }

    fn notify(
        &self,
        tree: &DeviceTree,
        chain: &NotifierChain<ReconfigNotification>,
        reverted: bool,
    ) -> Result<(), Errno> {
        let mut result = Ok(());
        let mut order: Vec<&ChangesetEntry> = self.entries.iter().collect();
        if reverted {
            order.reverse();
        }
        for entry in order {
            let event = ReconfigNotification {
                action: entry.action,
                reverted,
                path: tree.path(entry.node),
                property: entry.property_name().map(String::from),
            };
            if let Err(errno) = chain.call_chain(&event) {
                log::error!(
                    "changeset entry notify error {errno}, {} {}",
                    entry.action,
                    event.path,
                );
                result = Err(errno);
            }
        }
        result
    }
}
