// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Record types stored in the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a registered worker, as maintained by the external
/// registration/heartbeat system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Heartbeating normally; eligible for placement.
    Running,
    /// Missed heartbeats; calls against its backends are expected to fail.
    Stalled,
    /// Draining before shutdown.
    Landing,
    Landed,
    Retiring,
}

/// A base resource type a worker declares support for: a name plus the host
/// path of its importable rootfs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseResourceType {
    pub name: String,
    /// Host path on the worker that can be imported as a volume.
    pub image_path: String,
    pub privileged: bool,
}

/// One fleet node: identity, backend addresses, declared capabilities and
/// live counters. Created by registration and mutated by heartbeats, both of
/// which are external to this repository; the core treats everything but the
/// counters as read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub name: String,
    /// Base URL of the container backend's HTTP API.
    pub container_backend_url: String,
    /// Base URL of the volume backend's HTTP API.
    pub volume_backend_url: String,
    /// Release version reported by the worker, e.g. "2.3.1".
    pub version: Option<String>,
    pub state: WorkerState,
    pub platform: String,
    pub tags: Vec<String>,
    /// Team this worker is reserved for; `None` means general.
    pub team_id: Option<i64>,
    pub resource_types: Vec<BaseResourceType>,
    pub active_containers: i64,
    pub active_volumes: i64,
    pub ephemeral: bool,
    pub start_time: DateTime<Utc>,
    pub http_proxy_url: Option<String>,
    pub https_proxy_url: Option<String>,
    pub no_proxy: Option<String>,
    /// Host path of the worker's CA certificate bundle, importable as a
    /// read-only volume.
    pub certs_path: Option<String>,
}

impl WorkerRecord {
    pub fn is_team_owned(&self) -> bool {
        self.team_id.is_some()
    }
}

/// Container row lifecycle. `Creating` and `Created` are the two working
/// states of find-or-create; `Failed` is terminal and `Destroying` hands the
/// row to the garbage collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Creating,
    Created,
    Failed,
    Destroying,
}

/// Descriptive metadata attached to a container row at creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    /// Kind of step this container runs, e.g. "task" or "check".
    pub kind: String,
    pub step_name: String,
    pub working_directory: String,
    pub user: String,
}

/// A registry container row. The handle is the join key between this row and
/// the live container on the worker's container backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRow {
    pub id: i64,
    pub handle: String,
    pub worker_name: String,
    pub state: ContainerState,
    pub owner_key: String,
    pub metadata: ContainerMetadata,
    pub created_at: DateTime<Utc>,
}

/// Volume row lifecycle, mirroring [`ContainerState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeState {
    Creating,
    Created,
    Failed,
    Destroying,
}

/// A registry volume row. `parent_handle` records copy-on-write lineage;
/// `resource_cache_key`, when set, marks the volume as holding cacheable
/// resource content that other workers may prefer locally over streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRow {
    pub id: i64,
    pub handle: String,
    pub worker_name: String,
    pub state: VolumeState,
    pub team_id: Option<i64>,
    /// Container this volume is attached to, if any.
    pub container_id: Option<i64>,
    /// Mount path inside the container, if attached.
    pub mount_path: Option<String>,
    /// Handle of the copy-on-write parent, if any.
    pub parent_handle: Option<String>,
    pub resource_cache_key: Option<String>,
    pub created_at: DateTime<Utc>,
}
