// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::{Arc, Mutex};

use dt_overlay::{
    DeviceTree, DeviceTreeNode, DeviceTreeProperty, Errno, OverlayAction, OverlayErrorKind,
    OverlayManager,
};

fn manager_with_bus() -> OverlayManager {
    let mut live = DeviceTree::new();
    live.add_child(live.root(), DeviceTreeNode::new("bus"));
    OverlayManager::new(live)
}

fn overlay_adding_dev() -> Vec<u8> {
    let mut overlay = DeviceTree::new();
    let fragment = overlay.add_child(overlay.root(), DeviceTreeNode::new("fragment@0"));
    overlay
        .node_mut(fragment)
        .add_property(DeviceTreeProperty::string("target-path", "/bus"));
    let content = overlay.add_child(fragment, DeviceTreeNode::new("__overlay__"));
    let dev = overlay.add_child(content, DeviceTreeNode::new("dev"));
    overlay
        .node_mut(dev)
        .add_property(DeviceTreeProperty::string("compatible", "x,y"));
    overlay.to_dtb()
}

#[test]
fn phases_are_delivered_in_lifecycle_order() {
    let manager = manager_with_bus();
    let phases: Arc<Mutex<Vec<(OverlayAction, String)>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&phases);
    manager.register_observer(move |notification| {
        sink.lock()
            .unwrap()
            .push((notification.action, notification.target_path.clone()));
        Ok(())
    });

    let (mut id, result) = manager.apply(&overlay_adding_dev(), None);
    result.unwrap();
    manager.remove(&mut id).unwrap();

    let phases = phases.lock().unwrap();
    let expected = [
        OverlayAction::PreApply,
        OverlayAction::PostApply,
        OverlayAction::PreRemove,
        OverlayAction::PostRemove,
    ];
    assert_eq!(phases.len(), expected.len());
    for ((action, target), expected) in phases.iter().zip(expected) {
        assert_eq!(*action, expected);
        assert_eq!(target, "/bus");
    }
}

#[test]
fn one_delivery_per_fragment_in_order() {
    let mut live = DeviceTree::new();
    live.add_child(live.root(), DeviceTreeNode::new("a"));
    live.add_child(live.root(), DeviceTreeNode::new("b"));
    let manager = OverlayManager::new(live);

    let mut overlay = DeviceTree::new();
    for (index, path) in ["/a", "/b"].iter().enumerate() {
        let fragment = overlay.add_child(
            overlay.root(),
            DeviceTreeNode::new(format!("fragment@{index}")),
        );
        overlay
            .node_mut(fragment)
            .add_property(DeviceTreeProperty::string("target-path", path));
        let content = overlay.add_child(fragment, DeviceTreeNode::new("__overlay__"));
        overlay
            .node_mut(content)
            .add_property(DeviceTreeProperty::string("status", "okay"));
    }

    let targets: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&targets);
    manager.register_observer(move |notification| {
        if notification.action == OverlayAction::PreApply {
            sink.lock().unwrap().push(notification.target_path.clone());
        }
        Ok(())
    });

    let (mut id, result) = manager.apply(&overlay.to_dtb(), None);
    result.unwrap();
    assert_eq!(*targets.lock().unwrap(), ["/a", "/b"]);
    manager.remove(&mut id).unwrap();
}

#[test]
fn pre_apply_error_blocks_application() {
    let manager = manager_with_bus();
    let before = manager.with_tree(DeviceTree::to_dtb);

    let handle = manager.register_observer(|notification| {
        if notification.action == OverlayAction::PreApply {
            Err(Errno::Inval)
        } else {
            Ok(())
        }
    });

    let (mut id, result) = manager.apply(&overlay_adding_dev(), None);
    let err = result.unwrap_err();
    assert!(matches!(err.kind, OverlayErrorKind::Notifier(Errno::Inval)));
    assert_eq!(err.errno(), Errno::Inval);
    assert_ne!(id, 0);
    assert!(manager.with_tree(|tree| tree.find_node("/bus/dev").is_none()));

    assert!(manager.unregister_observer(handle));
    manager.remove(&mut id).unwrap();
    assert_eq!(manager.with_tree(DeviceTree::to_dtb), before);
}

#[test]
fn post_apply_error_is_reported_but_not_rolled_back() {
    let manager = manager_with_bus();

    let handle = manager.register_observer(|notification| {
        if notification.action == OverlayAction::PostApply {
            Err(Errno::Busy)
        } else {
            Ok(())
        }
    });

    let (mut id, result) = manager.apply(&overlay_adding_dev(), None);
    let err = result.unwrap_err();
    assert!(matches!(err.kind, OverlayErrorKind::Notifier(Errno::Busy)));
    // The overlay stayed applied; the caller owns the decision to back out.
    assert!(manager.with_tree(|tree| tree.find_node("/bus/dev").is_some()));
    assert_eq!(manager.overlay_count(), 1);

    manager.unregister_observer(handle);
    manager.remove(&mut id).unwrap();
    assert!(manager.with_tree(|tree| tree.find_node("/bus/dev").is_none()));
}

#[test]
fn pre_remove_error_keeps_overlay_applied() {
    let manager = manager_with_bus();

    let (mut id, result) = manager.apply(&overlay_adding_dev(), None);
    result.unwrap();

    let handle = manager.register_observer(|notification| {
        if notification.action == OverlayAction::PreRemove {
            Err(Errno::Busy)
        } else {
            Ok(())
        }
    });

    let err = manager.remove(&mut id).unwrap_err();
    assert!(matches!(err.kind, OverlayErrorKind::Notifier(Errno::Busy)));
    assert_ne!(id, 0);
    assert!(manager.with_tree(|tree| tree.find_node("/bus/dev").is_some()));

    manager.unregister_observer(handle);
    manager.remove(&mut id).unwrap();
    assert_eq!(id, 0);
}

#[test]
fn post_remove_error_still_retires_the_id() {
    let manager = manager_with_bus();
    let before = manager.with_tree(DeviceTree::to_dtb);

    let (mut id, result) = manager.apply(&overlay_adding_dev(), None);
    result.unwrap();

    let handle = manager.register_observer(|notification| {
        if notification.action == OverlayAction::PostRemove {
            Err(Errno::Inval)
        } else {
            Ok(())
        }
    });

    let err = manager.remove(&mut id).unwrap_err();
    assert!(matches!(err.kind, OverlayErrorKind::Notifier(Errno::Inval)));
    // The revert went through: the id is retired and the tree restored.
    assert_eq!(id, 0);
    assert_eq!(manager.overlay_count(), 0);
    assert_eq!(manager.with_tree(DeviceTree::to_dtb), before);

    manager.unregister_observer(handle);
}

#[test]
fn unregistered_observer_is_not_called() {
    let manager = manager_with_bus();
    let calls = Arc::new(Mutex::new(0usize));

    let sink = Arc::clone(&calls);
    let handle = manager.register_observer(move |_| {
        *sink.lock().unwrap() += 1;
        Ok(())
    });
    assert!(manager.unregister_observer(handle));
    assert!(!manager.unregister_observer(handle));

    let (mut id, result) = manager.apply(&overlay_adding_dev(), None);
    result.unwrap();
    manager.remove(&mut id).unwrap();
    assert_eq!(*calls.lock().unwrap(), 0);
}

#[test]
fn reconfig_observer_errors_do_not_block_apply() {
    let manager = manager_with_bus();

    let handle = manager.register_reconfig_observer(|_| Err(Errno::Inval));

    let (mut id, result) = manager.apply(&overlay_adding_dev(), None);
    // Per-entry notifier errors are reported but the overlay is applied.
    let err = result.unwrap_err();
    assert!(matches!(err.kind, OverlayErrorKind::Notifier(Errno::Inval)));
    assert!(manager.with_tree(|tree| tree.find_node("/bus/dev").is_some()));

    manager.unregister_reconfig_observer(handle);
    manager.remove(&mut id).unwrap();
}
