// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for volume backend operations.

/// Result type using VolumeError
pub type Result<T> = std::result::Result<T, VolumeError>;

/// Errors surfaced by volume backend clients.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum VolumeError {
    /// The backend has no volume under this handle.
    #[error("volume '{handle}' not found on volume backend")]
    NotFound { handle: String },

    /// A copy-on-write or import source was missing.
    #[error("strategy source '{source_ref}' not available: {details}")]
    StrategySource { source_ref: String, details: String },

    /// The backend answered with a non-success status.
    #[error("volume backend responded {status}: {message}")]
    Backend { status: u16, message: String },

    /// The HTTP request itself failed.
    #[error("volume backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A streamed archive could not be read or written.
    #[error("volume archive error: {0}")]
    Archive(#[from] std::io::Error),

    /// A narrowed stream-out yielded no entry for the requested path.
    #[error("no archive entry for path '{path}' in volume '{handle}'")]
    NoSuchPath { handle: String, path: String },
}
