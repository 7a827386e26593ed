// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Observer chains for overlay-scoped and per-entry notifications.
//!
//! Registration and unregistration take the chain's own reader/writer lock;
//! deliveries run while the engine holds its registry lock, so callbacks
//! must not call back into apply or remove.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::RwLock;

use crate::error::Errno;
use crate::model::NodeId;
use crate::overlay::changeset::ChangesetAction;

/// Lifecycle phase of an overlay changeset.
///
/// `Init` is the state of a freshly created changeset; the other four are
/// delivered to observers as the changeset moves through apply and remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayAction {
    Init,
    PreApply,
    PostApply,
    PreRemove,
    PostRemove,
}

impl OverlayAction {
    #[must_use]
    pub(crate) fn name(self) -> &'static str {
        match self {
            OverlayAction::Init => "init",
            OverlayAction::PreApply => "pre-apply",
            OverlayAction::PostApply => "post-apply",
            OverlayAction::PreRemove => "pre-remove",
            OverlayAction::PostRemove => "post-remove",
        }
    }
}

impl fmt::Display for OverlayAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One overlay-scoped delivery: the phase plus the fragment it concerns.
///
/// Observers must not retain the node ids beyond the window from
/// [`OverlayAction::PreApply`] until [`OverlayAction::PostRemove`] for the
/// overlay they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayNotification {
    /// The phase being entered.
    pub action: OverlayAction,
    /// The fragment's target node in the live tree.
    pub target: NodeId,
    /// The fragment's target path in the live tree.
    pub target_path: String,
    /// The fragment's subtree node inside the overlay.
    pub overlay_node: NodeId,
    /// The fragment's subtree path inside the overlay.
    pub overlay_path: String,
}

/// One per-entry delivery, sent after an entry has been applied or
/// reverted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconfigNotification {
    /// The primitive edit that was performed (on revert, the edit being
    /// undone).
    pub action: ChangesetAction,
    /// Whether this delivery reports an apply or a revert.
    pub reverted: bool,
    /// Path of the affected node.
    pub path: String,
    /// Name of the affected property for property edits.
    pub property: Option<String>,
}

/// A handle returned on observer registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifierHandle(u64);

type Callback<E> = Box<dyn Fn(&E) -> Result<(), Errno> + Send + Sync>;

/// An ordered chain of observers sharing one event type.
pub(crate) struct NotifierChain<E> {
    entries: RwLock<Vec<(u64, Callback<E>)>>,
    next_handle: AtomicU64,
}

impl<E> fmt::Debug for NotifierChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierChain")
            .field("observers", &self.entries.read().len())
            .finish()
    }
}

impl<E> Default for NotifierChain<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> NotifierChain<E> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub(crate) fn register(
        &self,
        callback: impl Fn(&E) -> Result<(), Errno> + Send + Sync + 'static,
    ) -> NotifierHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push((handle, Box::new(callback)));
        NotifierHandle(handle)
    }

    pub(crate) fn unregister(&self, handle: NotifierHandle) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(h, _)| *h != handle.0);
        entries.len() != before
    }

    /// Delivers `event` to every observer in registration order. The first
    /// observer error stops delivery and is returned.
    pub(crate) fn call_chain(&self, event: &E) -> Result<(), Errno> {
        for (_, callback) in self.entries.read().iter() {
            callback(event)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn delivery_in_registration_order() {
        let chain: NotifierChain<u32> = NotifierChain::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let first = Arc::clone(&seen);
        chain.register(move |_| {
            first.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        let second = Arc::clone(&seen);
        chain.register(move |_| {
            second.fetch_add(10, Ordering::Relaxed);
            Ok(())
        });

        chain.call_chain(&0).unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 11);
    }

    #[test]
    fn first_error_short_circuits() {
        let chain: NotifierChain<u32> = NotifierChain::new();
        let called = Arc::new(AtomicUsize::new(0));

        chain.register(|_| Err(Errno::Inval));
        let later = Arc::clone(&called);
        chain.register(move |_| {
            later.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        assert_eq!(chain.call_chain(&0), Err(Errno::Inval));
        assert_eq!(called.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn unregister_removes_observer() {
        let chain: NotifierChain<u32> = NotifierChain::new();
        let handle = chain.register(|_| Err(Errno::Busy));
        assert!(chain.unregister(handle));
        assert!(!chain.unregister(handle));
        chain.call_chain(&0).unwrap();
    }
}
