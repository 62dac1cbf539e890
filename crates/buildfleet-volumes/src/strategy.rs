// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Volume creation strategies.
//!
//! The set of strategies is closed and each serializes to the backend's
//! small discriminated payload, so this is a tagged enum rather than a trait.

use serde::{Deserialize, Serialize};

/// How a volume's initial content comes to exist.
///
/// A volume's strategy is immutable once created: re-deriving a volume means
/// creating a new one, never mutating the strategy in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeStrategy {
    /// Start with no content.
    Empty,

    /// Cheap clone of an existing volume's content.
    #[serde(rename = "cow")]
    CopyOnWrite {
        /// Handle of the parent volume on the same backend.
        #[serde(rename = "volume")]
        parent: String,
    },

    /// Populate from a path on the worker's host filesystem.
    Import {
        path: String,
        #[serde(default)]
        follow_symlinks: bool,
    },
}

impl VolumeStrategy {
    pub fn import(path: impl Into<String>) -> Self {
        VolumeStrategy::Import {
            path: path.into(),
            follow_symlinks: false,
        }
    }
}
