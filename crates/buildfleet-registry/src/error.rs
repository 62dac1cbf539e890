// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for registry operations.

/// Result type using RegistryError
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors surfaced by registry implementations.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// A state transition was requested on a row that is not in the expected
    /// previous state. Transitions are atomic; losing a race surfaces here.
    #[error("invalid state transition for {row} {id}: expected '{expected}', got '{actual}'")]
    InvalidStateTransition {
        row: &'static str,
        id: i64,
        expected: String,
        actual: String,
    },

    /// The row a transition or lookup referred to does not exist.
    #[error("{row} {id} not found")]
    RowNotFound { row: &'static str, id: i64 },

    /// A copy-on-write child was requested for a parent that has not reached
    /// `Created` state yet.
    #[error("volume '{parent_handle}' is not created; cannot derive a child from it")]
    ParentVolumeNotCreated { parent_handle: String },

    /// The owner's registry record disappeared between lookup and create,
    /// e.g. a check session expired.
    #[error("no registry container record found for owner '{owner_key}'")]
    OwnerDisappeared { owner_key: String },

    /// The underlying store failed.
    #[error("registry store error during '{operation}': {details}")]
    Store { operation: String, details: String },
}
