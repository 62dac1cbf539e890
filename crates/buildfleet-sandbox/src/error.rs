// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the container backend client.

/// Errors from backend requests and hijacked connections.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("container '{handle}' not found on backend")]
    ContainerNotFound { handle: String },

    #[error("container backend responded {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("container backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("connection i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode backend payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unexpected protocol payload: {payload}")]
    Protocol { payload: String },

    #[error("invalid backend url '{url}': {details}")]
    Url { url: String, details: String },
}

/// Result alias for backend client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced through [`crate::Process::wait`] and control writes.
///
/// Clonable because the same terminal outcome is observed by every waiter.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ProcessError {
    #[error("process canceled")]
    Canceled,

    #[error("process failed on backend: {0}")]
    Remote(String),

    #[error("failed to open {stream} stream: {details}")]
    StreamSetup { stream: &'static str, details: String },

    #[error("control connection decode failed: {details}")]
    Decode { details: String },

    #[error("control connection closed before an exit status arrived")]
    Disconnected,

    #[error("control write failed: {details}")]
    Write { details: String },
}
