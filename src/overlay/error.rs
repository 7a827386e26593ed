// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types for overlay application and removal.

use alloc::string::String;
use core::fmt;

use crate::error::{Errno, FdtError};

/// An error that can occur when applying or removing a device tree overlay.
#[derive(Debug)]
#[non_exhaustive]
pub struct OverlayError {
    path: String,
    /// The type of the error that has occurred.
    pub kind: OverlayErrorKind,
}

impl OverlayError {
    pub(crate) fn new(kind: OverlayErrorKind, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// Returns the path of the node the error concerns, when known.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the stable error code of this error, suitable for passing
    /// through to errno-style callers.
    #[must_use]
    pub fn errno(&self) -> Errno {
        match &self.kind {
            OverlayErrorKind::CorruptTree | OverlayErrorKind::NotTopmost => Errno::Busy,
            OverlayErrorKind::UnknownId => Errno::NoDev,
            OverlayErrorKind::SymbolRewrite => Errno::NoMem,
            OverlayErrorKind::Notifier(errno) | OverlayErrorKind::Changeset(errno) => *errno,
            _ => Errno::Inval,
        }
    }
}

/// The kind of an error that can occur when applying or removing a device
/// tree overlay.
#[derive(Debug)]
#[non_exhaustive]
pub enum OverlayErrorKind {
    /// A previous apply or revert failure left the live tree in an unknown
    /// state; all further overlay operations are refused.
    CorruptTree,
    /// A newer overlay touches a node in this overlay's subtrees, so this
    /// overlay cannot be removed yet.
    NotTopmost,
    /// No overlay with the given id exists.
    UnknownId,
    /// The overlay blob failed validation or unflattening.
    Blob(FdtError),
    /// The overlay contains neither a fragment nor a symbols node.
    NoFragments,
    /// A fragment carries neither a usable `target` nor a `target-path`
    /// property.
    NoTarget,
    /// A fragment's target does not exist in the live tree.
    TargetNotFound,
    /// The overlay proposes a different `#address-cells` or `#size-cells`
    /// value than the live tree carries.
    CellsMismatch,
    /// Both the overlay node and the matching live node carry a nonzero
    /// phandle.
    PhandleConflict,
    /// The overlay defines a symbol that already exists in the live tree.
    SymbolCollision,
    /// The overlay's symbols node has child nodes.
    SymbolsHasChildren,
    /// A symbol property could not be duplicated and rewritten.
    SymbolRewrite,
    /// Multiple fragments produce changeset entries for the same node or
    /// property.
    DuplicateEntry,
    /// A phandle value in the overlay is malformed.
    CorruptPhandle,
    /// A `__fixups__` reference could not be resolved against the live
    /// tree's symbols.
    Unresolved,
    /// An observer rejected the operation.
    Notifier(Errno),
    /// The changeset executor failed.
    Changeset(Errno),
}

impl fmt::Display for OverlayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{} at {}", self.kind, self.path)
        }
    }
}

impl fmt::Display for OverlayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CorruptTree => write!(f, "device tree state suspect"),
            Self::NotTopmost => write!(f, "overlay is not topmost"),
            Self::UnknownId => write!(f, "no overlay with this id"),
            Self::Blob(e) => write!(f, "invalid overlay blob: {e}"),
            Self::NoFragments => write!(f, "no fragments or symbols in overlay"),
            Self::NoTarget => write!(f, "fragment has no target property"),
            Self::TargetNotFound => write!(f, "target not found in live tree"),
            Self::CellsMismatch => {
                write!(f, "changing #address-cells or #size-cells is not allowed")
            }
            Self::PhandleConflict => write!(f, "fragment may not replace an existing phandle"),
            Self::SymbolCollision => write!(f, "symbol already exists in live tree"),
            Self::SymbolsHasChildren => write!(f, "symbols node must not have children"),
            Self::SymbolRewrite => write!(f, "unable to duplicate symbol property"),
            Self::DuplicateEntry => {
                write!(f, "multiple fragments modify the same node or property")
            }
            Self::CorruptPhandle => write!(f, "phandle property is corrupted"),
            Self::Unresolved => write!(f, "unresolved symbol reference"),
            Self::Notifier(errno) => write!(f, "notifier error {errno}"),
            Self::Changeset(errno) => write!(f, "changeset error {errno}"),
        }
    }
}

impl core::error::Error for OverlayError {}

impl From<FdtError> for OverlayError {
    fn from(e: FdtError) -> Self {
        OverlayError::new(OverlayErrorKind::Blob(e), "")
    }
}
