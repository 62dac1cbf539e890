// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for worker orchestration and placement.

use buildfleet_registry::RegistryError;
use buildfleet_sandbox::{ClientError, ProcessError};
use buildfleet_volumes::VolumeError;

/// Result alias for worker and pool operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Errors surfaced by the worker and pool layer.
///
/// Not-found drift (a backend missing something the registry says exists) is
/// deliberately distinct from plain lookup misses: drift is surfaced
/// verbatim and never retried, because only a reconciliation sweep may
/// resolve it.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// Registry row says created, container backend has no such container.
    #[error("container '{handle}' is marked created but missing from worker '{worker}'")]
    ContainerMissingFromWorker { handle: String, worker: String },

    /// Registry row says created, volume backend has no such volume.
    #[error("volume '{handle}' is marked created but missing from worker '{worker}'")]
    VolumeMissingFromWorker { handle: String, worker: String },

    #[error("two mounts target the same destination path '{path}'")]
    DuplicateMountPath { path: String },

    #[error("worker '{worker}' does not provide base resource type '{name}'")]
    BaseResourceTypeNotFound { worker: String, name: String },

    #[error("worker '{worker}' has no certificates path configured")]
    CertsPathNotConfigured { worker: String },

    #[error("no volume found for artifact '{handle}'")]
    ArtifactNotFound { handle: String },

    #[error("worker '{name}' is not registered")]
    WorkerNotFound { name: String },

    /// A backend call failed while the worker was not heartbeating; callers
    /// should retry against a different worker.
    #[error("worker '{worker}' is unreachable ({state}): {details}")]
    WorkerUnreachable { worker: String, state: String, details: String },

    #[error("no worker satisfies the spec: {constraint}")]
    NoCompatibleWorker { constraint: String },

    #[error("placement strategy '{strategy}' rejected every candidate worker")]
    StrategyRejectedAll { strategy: &'static str },

    #[error("image metadata of volume '{volume}' is malformed: {details}")]
    MalformedImageMetadata { volume: String, details: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("process failed: {0}")]
    Process(#[from] ProcessError),
}
