// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The overlay engine: staged application and removal of device tree
//! overlays against a live tree.
//!
//! An overlay blob is unflattened, its phandles resolved, its fragments
//! mapped onto live-tree targets, and the whole patch translated into one
//! changeset that is committed atomically — on a partial failure the
//! already-applied entries are rolled back. Applied overlays form a stack:
//! an overlay can only be removed while no newer overlay touches any node
//! in its footprint. Observers are notified before and after each apply
//! and remove, once per fragment.
//!
//! All engine state lives in an [`OverlayManager`] value; creating one per
//! test keeps tests hermetic.

use alloc::vec::Vec;
use core::mem;

use indexmap::IndexMap;
use spin::{Mutex, MutexGuard};
use twox_hash::xxhash64;

use crate::error::Errno;
use crate::fdt::Fdt;
use crate::model::{DeviceTree, NodeId, name_map_hasher};

mod build;
mod changeset;
mod error;
mod notify;
mod resolver;

pub use changeset::ChangesetAction;
pub use error::{OverlayError, OverlayErrorKind};
pub use notify::{NotifierHandle, OverlayAction, OverlayNotification, ReconfigNotification};

use changeset::Changeset;

/// One unit of overlay patch: the fragment's `__overlay__` subtree inside
/// the overlay tree, and the live-tree node it grafts onto.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fragment {
    pub(crate) overlay: NodeId,
    pub(crate) target: NodeId,
}

/// Trustworthiness of the live tree. Failures are sticky: once an apply or
/// revert could not be rolled back, the tree state is unknown and all
/// further overlay operations are refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeHealth {
    Healthy,
    ApplyFailed,
    RevertFailed,
    Both,
}

impl TreeHealth {
    fn corrupt(self) -> bool {
        self != TreeHealth::Healthy
    }

    fn note_apply_fail(&mut self) {
        *self = match *self {
            TreeHealth::Healthy | TreeHealth::ApplyFailed => TreeHealth::ApplyFailed,
            TreeHealth::RevertFailed | TreeHealth::Both => TreeHealth::Both,
        };
    }

    fn note_revert_fail(&mut self) {
        *self = match *self {
            TreeHealth::Healthy | TreeHealth::RevertFailed => TreeHealth::RevertFailed,
            TreeHealth::ApplyFailed | TreeHealth::Both => TreeHealth::Both,
        };
    }
}

/// An overlay changeset: one applied (or partially applied) overlay.
#[derive(Debug)]
struct OverlayChangeset {
    id: u32,
    /// Owned copy of the overlay blob.
    fdt: Vec<u8>,
    /// The unflattened overlay tree.
    overlay: DeviceTree,
    /// Fragment records; if a symbols fragment exists it is the last
    /// element.
    fragments: Vec<Fragment>,
    symbols_fragment: bool,
    cset: Changeset,
    /// Most recent notification phase entered by this changeset.
    notify_state: OverlayAction,
}

#[derive(Debug)]
struct ManagerInner {
    tree: DeviceTree,
    /// Registry of live overlay changesets. Insertion order is application
    /// order, so this map doubles as the overlay stack (tail = newest) and
    /// as the id lookup table.
    overlays: IndexMap<u32, OverlayChangeset, xxhash64::State>,
    health: TreeHealth,
    next_id: u32,
}

/// The overlay engine. Owns the live tree, the overlay registry, the
/// sticky corruption state, and both observer chains.
///
/// Two locks serialize the engine, always taken in the same order: the
/// phandle lock (outer, held across phandle resolution and apply so a
/// concurrent apply cannot invalidate the observed maximum phandle) and
/// the registry lock (inner, guarding the live tree, the registry, and all
/// per-changeset state). Observer callbacks run under the registry lock
/// and must not call back into the engine.
#[derive(Debug)]
pub struct OverlayManager {
    phandle_lock: Mutex<()>,
    inner: Mutex<ManagerInner>,
    overlay_chain: notify::NotifierChain<OverlayNotification>,
    reconfig_chain: notify::NotifierChain<ReconfigNotification>,
}

impl OverlayManager {
    /// Creates an engine owning `tree` as its live tree.
    #[must_use]
    pub fn new(tree: DeviceTree) -> Self {
        Self {
            phandle_lock: Mutex::new(()),
            inner: Mutex::new(ManagerInner {
                tree,
                overlays: IndexMap::with_hasher(name_map_hasher()),
                health: TreeHealth::Healthy,
                next_id: 1,
            }),
            overlay_chain: notify::NotifierChain::new(),
            reconfig_chain: notify::NotifierChain::new(),
        }
    }

    /// Creates and applies an overlay changeset from a flattened overlay
    /// blob.
    ///
    /// With a `base` path, `target-path` fragment targets are resolved
    /// relative to that live node instead of the live root.
    ///
    /// Returns the changeset id along with the result. The id is nonzero
    /// whenever the changeset was registered — including most failures —
    /// so the caller can pass it to [`remove`](Self::remove) to discard a
    /// partially applied overlay. This is especially likely when a
    /// post-apply observer rejects the overlay: the overlay stays applied
    /// and an error is returned. The id is 0 only when the blob was
    /// rejected before registration.
    pub fn apply(
        &self,
        overlay_fdt: &[u8],
        base: Option<&str>,
    ) -> (u32, Result<(), OverlayError>) {
        if self.inner.lock().health.corrupt() {
            log::error!("devicetree state suspect, refuse to apply overlay");
            return (0, Err(OverlayError::new(OverlayErrorKind::CorruptTree, "")));
        }

        let fdt = match Fdt::new(overlay_fdt) {
            Ok(fdt) => fdt,
            Err(e) => {
                log::error!("invalid overlay blob header");
                return (0, Err(e.into()));
            }
        };
        let fdt_copy = fdt.data().to_vec();

        let _phandle_guard = self.phandle_lock.lock();
        let mut inner = self.inner.lock();

        let mut overlay = match DeviceTree::from_fdt(&fdt) {
            Ok(tree) => tree,
            Err(e) => {
                log::error!("unable to unflatten overlay blob");
                return (0, Err(e.into()));
            }
        };
        {
            let root = overlay.root();
            let flags = overlay.node_mut(root).flags_mut();
            flags.dynamic = true;
            flags.detached = true;
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.overlays.insert(
            id,
            OverlayChangeset {
                id,
                fdt: fdt_copy,
                overlay,
                fragments: Vec::new(),
                symbols_fragment: false,
                cset: Changeset::new(),
                notify_state: OverlayAction::Init,
            },
        );

        let result = self.perform_apply(&mut inner, id, base);
        if let Err(e) = &result {
            log::debug!("overlay apply failed, err={e}");
        }
        (id, result)
    }

    fn perform_apply(
        &self,
        inner: &mut ManagerInner,
        id: u32,
        base: Option<&str>,
    ) -> Result<(), OverlayError> {
        {
            let ManagerInner { tree, overlays, .. } = inner;
            let ovcs = overlays.get_mut(&id).expect("changeset was just registered");
            resolver::resolve_phandles(tree, &mut ovcs.overlay)?;
            Self::init_overlay_changeset(tree, ovcs, base)?;
        }

        self.overlay_notify(inner, id, OverlayAction::PreApply)?;

        {
            let ManagerInner { tree, overlays, .. } = inner;
            let ovcs = overlays.get_mut(&id).expect("changeset was just registered");
            let OverlayChangeset {
                overlay,
                fragments,
                symbols_fragment,
                cset,
                ..
            } = ovcs;
            build::ChangesetBuilder::new(tree, overlay, fragments, *symbols_fragment, cset)
                .build()?;
        }

        {
            let ManagerInner {
                tree,
                overlays,
                health,
                ..
            } = inner;
            let ovcs = overlays.get_mut(&id).expect("changeset was just registered");
            if let Err(e) = ovcs.cset.apply(tree) {
                if let Some(recovery) = e.recovery {
                    log::debug!("overlay changeset revert error {recovery}");
                    health.note_apply_fail();
                }
                return Err(OverlayError::new(OverlayErrorKind::Changeset(e.error), ""));
            }
        }

        let mut result = Ok(());
        {
            let ovcs = inner.overlays.get(&id).expect("changeset was just registered");
            if let Err(errno) = ovcs.cset.notify_applied(&inner.tree, &self.reconfig_chain) {
                log::error!("overlay apply changeset entry notify error {errno}");
                result = Err(OverlayError::new(OverlayErrorKind::Notifier(errno), ""));
            }
            // notify failure is not fatal, continue
        }

        if let Err(e) = self.overlay_notify(inner, id, OverlayAction::PostApply)
            && result.is_ok()
        {
            result = Err(e);
        }
        result
    }

    /// Populates the fragment records from the top level of the overlay:
    /// every child carrying an `__overlay__` node becomes a fragment, a
    /// `__symbols__` child becomes the final fragment, and any other top
    /// level node is silently ignored.
    fn init_overlay_changeset(
        tree: &DeviceTree,
        ovcs: &mut OverlayChangeset,
        base: Option<&str>,
    ) -> Result<(), OverlayError> {
        let root = ovcs.overlay.root();
        let root_flags = ovcs.overlay.node(root).flags();
        if !root_flags.dynamic {
            log::debug!("overlay root is not dynamic");
        }
        if !root_flags.detached {
            log::debug!("overlay root is not detached");
        }

        let mut fragments = Vec::new();
        let children: Vec<NodeId> = ovcs.overlay.node(root).children().collect();
        for child in children {
            if let Some(overlay_node) = ovcs.overlay.node(child).child("__overlay__") {
                let target = build::find_target(tree, &ovcs.overlay, child, base)?;
                fragments.push(Fragment {
                    overlay: overlay_node,
                    target,
                });
            }
        }

        // If there is a symbols fragment it is the final element.
        if let Some(symbols) = ovcs.overlay.node(root).child("__symbols__") {
            let target = tree.find_node("/__symbols__").ok_or_else(|| {
                log::error!("symbols in overlay, but not in live tree");
                OverlayError::new(OverlayErrorKind::TargetNotFound, "/__symbols__")
            })?;
            fragments.push(Fragment {
                overlay: symbols,
                target,
            });
            ovcs.symbols_fragment = true;
        }

        if fragments.is_empty() {
            log::error!("no fragments or symbols in overlay");
            return Err(OverlayError::new(OverlayErrorKind::NoFragments, ""));
        }
        ovcs.fragments = fragments;

        Ok(())
    }

    /// Delivers one phase to the overlay observer chain, one call per
    /// fragment in fragment order. The first observer error stops delivery
    /// for this phase and is returned.
    fn overlay_notify(
        &self,
        inner: &mut ManagerInner,
        id: u32,
        action: OverlayAction,
    ) -> Result<(), OverlayError> {
        let events: Vec<OverlayNotification> = {
            let ManagerInner { tree, overlays, .. } = inner;
            let ovcs = overlays.get_mut(&id).expect("notified changeset is registered");
            ovcs.notify_state = action;
            ovcs.fragments
                .iter()
                .map(|fragment| OverlayNotification {
                    action,
                    target: fragment.target,
                    target_path: tree.path(fragment.target),
                    overlay_node: fragment.overlay,
                    overlay_path: ovcs.overlay.path(fragment.overlay),
                })
                .collect()
        };

        for event in events {
            if let Err(errno) = self.overlay_chain.call_chain(&event) {
                log::error!(
                    "overlay changeset {action} notifier error {errno}, target: {}",
                    event.target_path
                );
                return Err(OverlayError::new(
                    OverlayErrorKind::Notifier(errno),
                    event.target_path,
                ));
            }
        }

        Ok(())
    }

    /// Reverts and frees the overlay changeset behind `ovcs_id`.
    ///
    /// Removal is refused while a newer overlay touches any node of this
    /// overlay's footprint ([`OverlayErrorKind::NotTopmost`]). On a
    /// successful revert, `*ovcs_id` is cleared to 0 — even if a
    /// post-remove observer then reports an error.
    pub fn remove(&self, ovcs_id: &mut u32) -> Result<(), OverlayError> {
        let mut inner = self.inner.lock();

        if inner.health.corrupt() {
            log::error!("suspect devicetree state, refuse to remove overlay");
            return Err(OverlayError::new(OverlayErrorKind::CorruptTree, ""));
        }

        let id = *ovcs_id;
        if !inner.overlays.contains_key(&id) {
            log::error!("remove: could not find overlay #{id}");
            return Err(OverlayError::new(OverlayErrorKind::UnknownId, ""));
        }

        if !Self::removal_is_ok(&inner, id) {
            log::error!("overlay #{id} is not topmost");
            return Err(OverlayError::new(OverlayErrorKind::NotTopmost, ""));
        }

        self.overlay_notify(&mut inner, id, OverlayAction::PreRemove)?;

        let was_applied;
        {
            let ManagerInner {
                tree,
                overlays,
                health,
                ..
            } = &mut *inner;
            let ovcs = overlays.get_mut(&id).expect("presence checked above");
            was_applied = ovcs.cset.is_applied();
            if let Err(e) = ovcs.cset.revert(tree) {
                if let Some(recovery) = e.recovery {
                    log::debug!("overlay changeset re-apply error {recovery}");
                    health.note_revert_fail();
                }
                return Err(OverlayError::new(OverlayErrorKind::Changeset(e.error), ""));
            }
        }

        let mut result = Ok(());
        if was_applied {
            let ovcs = inner.overlays.get(&id).expect("presence checked above");
            if let Err(errno) = ovcs.cset.notify_reverted(&inner.tree, &self.reconfig_chain) {
                log::error!("overlay remove changeset entry notify error {errno}");
                result = Err(OverlayError::new(OverlayErrorKind::Notifier(errno), ""));
            }
            // notify failure is not fatal, continue
        }

        // The id is observably retired before post-remove notifiers run.
        *ovcs_id = 0;

        if let Err(e) = self.overlay_notify(&mut inner, id, OverlayAction::PostRemove)
            && result.is_ok()
        {
            result = Err(e);
        }

        let ovcs = inner
            .overlays
            .shift_remove(&id)
            .expect("presence checked above");
        Self::free_overlay_changeset(&mut inner, ovcs);

        result
    }

    /// Reverts and frees all overlay changesets, newest first. Stops at
    /// the first failure.
    pub fn remove_all(&self) -> Result<(), OverlayError> {
        // The tail of the registry is guaranteed to be safe to remove.
        loop {
            let last = self.inner.lock().overlays.last().map(|(id, _)| *id);
            let Some(mut id) = last else {
                return Ok(());
            };
            self.remove(&mut id)?;
        }
    }

    /// An overlay may only be removed if it is topmost: for every node its
    /// changeset touches, no newer overlay's changeset may touch that node
    /// or any ancestor or descendant of it.
    fn removal_is_ok(inner: &ManagerInner, remove_id: u32) -> bool {
        let Some(pos) = inner.overlays.get_index_of(&remove_id) else {
            return false;
        };
        let (_, remove_ovcs) = inner.overlays.get_index(pos).expect("index is in range");

        for entry in remove_ovcs.cset.entries() {
            for later in (pos + 1..inner.overlays.len()).rev() {
                let (later_id, later_ovcs) =
                    inner.overlays.get_index(later).expect("index is in range");
                for later_entry in later_ovcs.cset.entries() {
                    if inner.tree.in_subtree(entry.node(), later_entry.node())
                        || inner.tree.in_subtree(later_entry.node(), entry.node())
                    {
                        log::error!(
                            "removal check: #{remove_id} overlaps with #{later_id} @{}",
                            inner.tree.path(entry.node())
                        );
                        return false;
                    }
                }
            }
        }

        true
    }

    /// Frees a changeset that has left the registry: releases the arena
    /// slots of the nodes it synthesized and drops the owned overlay
    /// memory — unless observers may still hold references to it, in which
    /// case the memory is deliberately leaked.
    fn free_overlay_changeset(inner: &mut ManagerInner, ovcs: OverlayChangeset) {
        if !ovcs.cset.is_applied() {
            for entry in ovcs.cset.entries() {
                if entry.action() == ChangesetAction::AttachNode {
                    inner.tree.release(entry.node());
                }
            }
        }

        // Observers are not allowed to retain references into the overlay
        // tree other than during the window from pre-apply until
        // post-remove. Freeing inside that window would invalidate them.
        if !matches!(
            ovcs.notify_state,
            OverlayAction::Init | OverlayAction::PostRemove
        ) {
            log::warn!(
                "overlay #{} freed in notify state {}; overlay memory leaked",
                ovcs.id,
                ovcs.notify_state
            );
            mem::forget(ovcs.overlay);
            mem::forget(ovcs.fdt);
        }
    }

    /// Registers an observer for overlay phase notifications. Callbacks
    /// run under the registry lock and must not call back into the engine.
    pub fn register_observer(
        &self,
        callback: impl Fn(&OverlayNotification) -> Result<(), Errno> + Send + Sync + 'static,
    ) -> NotifierHandle {
        self.overlay_chain.register(callback)
    }

    /// Unregisters an overlay observer. Returns whether it was registered.
    pub fn unregister_observer(&self, handle: NotifierHandle) -> bool {
        self.overlay_chain.unregister(handle)
    }

    /// Registers an observer for per-entry change notifications.
    pub fn register_reconfig_observer(
        &self,
        callback: impl Fn(&ReconfigNotification) -> Result<(), Errno> + Send + Sync + 'static,
    ) -> NotifierHandle {
        self.reconfig_chain.register(callback)
    }

    /// Unregisters a per-entry observer. Returns whether it was registered.
    pub fn unregister_reconfig_observer(&self, handle: NotifierHandle) -> bool {
        self.reconfig_chain.unregister(handle)
    }

    /// Takes the phandle lock, serializing external phandle-producing work
    /// with overlay application. Apply takes this lock before the registry
    /// lock; callers holding it must not call into the engine.
    pub fn lock_phandles(&self) -> MutexGuard<'_, ()> {
        self.phandle_lock.lock()
    }

    /// Runs `f` with shared access to the live tree, under the registry
    /// lock.
    pub fn with_tree<R>(&self, f: impl FnOnce(&DeviceTree) -> R) -> R {
        let inner = self.inner.lock();
        f(&inner.tree)
    }

    /// Returns the number of overlays currently in the registry.
    #[must_use]
    pub fn overlay_count(&self) -> usize {
        self.inner.lock().overlays.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceTreeNode;

    fn manager_with_bus() -> OverlayManager {
        let mut tree = DeviceTree::new();
        tree.add_child(tree.root(), DeviceTreeNode::new("bus"));
        OverlayManager::new(tree)
    }

    fn overlay_blob_adding_dev() -> alloc::vec::Vec<u8> {
        let mut overlay = DeviceTree::new();
        let frag = overlay.add_child(overlay.root(), DeviceTreeNode::new("fragment@0"));
        overlay
            .node_mut(frag)
            .add_property(crate::model::DeviceTreeProperty::string("target-path", "/bus"));
        let content = overlay.add_child(frag, DeviceTreeNode::new("__overlay__"));
        overlay.add_child(content, DeviceTreeNode::new("dev"));
        overlay.to_dtb()
    }

    #[test]
    fn corruption_is_sticky_and_refuses_all_operations() {
        let manager = manager_with_bus();
        manager.inner.lock().health.note_apply_fail();

        let (id, result) = manager.apply(&overlay_blob_adding_dev(), None);
        assert_eq!(id, 0);
        let err = result.unwrap_err();
        assert!(matches!(err.kind, OverlayErrorKind::CorruptTree));
        assert_eq!(err.errno(), Errno::Busy);

        let mut stale = 1;
        let err = manager.remove(&mut stale).unwrap_err();
        assert!(matches!(err.kind, OverlayErrorKind::CorruptTree));
        assert_eq!(stale, 1);
    }

    #[test]
    fn health_transitions_are_monotone() {
        let mut health = TreeHealth::Healthy;
        assert!(!health.corrupt());
        health.note_apply_fail();
        assert_eq!(health, TreeHealth::ApplyFailed);
        health.note_revert_fail();
        assert_eq!(health, TreeHealth::Both);
        health.note_apply_fail();
        assert_eq!(health, TreeHealth::Both);
        assert!(health.corrupt());
    }

    #[test]
    fn ids_are_monotonic_and_start_at_one() {
        let manager = manager_with_bus();
        let blob = overlay_blob_adding_dev();

        let (first, result) = manager.apply(&blob, None);
        result.unwrap();
        assert_eq!(first, 1);

        let mut id = first;
        manager.remove(&mut id).unwrap();

        // A once-used id is never handed out again.
        let (second, result) = manager.apply(&blob, None);
        result.unwrap();
        assert_eq!(second, 2);
        let mut id = second;
        manager.remove(&mut id).unwrap();
    }
}
