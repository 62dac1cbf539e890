// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client-side contract for the buildfleet durable registry.
//!
//! The registry is the durable store of container and volume *intent*: a row
//! is created before any side effect happens on a worker's backends, and the
//! row's state is only advanced after the corresponding side effect actually
//! succeeded. This crate defines the records, the [`Registry`] trait through
//! which the rest of the system consumes the store, and the advisory lock
//! primitive used to serialize volume creation across processes.
//!
//! The relational implementation lives outside this repository; the
//! [`memory::InMemoryRegistry`] backend provides the same semantics in-process
//! and backs every test in the workspace.

pub mod error;
pub mod memory;
pub mod records;

pub use self::error::{RegistryError, Result};
pub use self::memory::InMemoryRegistry;
pub use self::records::{
    BaseResourceType, ContainerMetadata, ContainerRow, ContainerState, VolumeRow, VolumeState,
    WorkerRecord, WorkerState,
};

use async_trait::async_trait;

/// Opaque correlation key identifying the logical owner of a container.
///
/// Callers supply an owner (e.g. "check container for resource X", "build
/// step N of build B") when asking for a container; the registry only ever
/// compares and stores the serialized key, so new owner kinds can be added
/// without touching the worker layer.
pub trait ContainerOwner: Send + Sync {
    /// Stable serialized form of this owner. Two owners are the same owner
    /// if and only if their keys are byte-equal.
    fn key(&self) -> String;
}

/// Owner backed by a plain string key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedOwner(pub String);

impl ContainerOwner for FixedOwner {
    fn key(&self) -> String {
        self.0.clone()
    }
}

/// Identifier for an advisory lock held in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockId {
    /// Serializes creation of the volume row with the given id.
    VolumeCreating(i64),
}

/// A held advisory lock. The lock is released when the guard is dropped, so
/// every exit path of the holder releases it.
pub trait Lock: Send {}

/// The durable registry, as consumed by the worker pool.
///
/// All state transitions are atomic at the row level: `container_created`,
/// `container_failed`, `volume_created` and friends either advance the row
/// from its expected previous state or fail with
/// [`RegistryError::InvalidStateTransition`].
#[async_trait]
pub trait Registry: Send + Sync {
    // --- workers ---

    /// All registered workers, regardless of state.
    async fn workers(&self) -> Result<Vec<WorkerRecord>>;

    /// Look up a single worker by name.
    async fn find_worker(&self, name: &str) -> Result<Option<WorkerRecord>>;

    /// The worker on which a container for this owner already exists (in
    /// either creating or created state), used for sticky placement.
    async fn find_worker_for_container_owner(
        &self,
        owner: &dyn ContainerOwner,
    ) -> Result<Option<String>>;

    // --- containers ---

    /// Find the container row for this owner on this worker, whatever its
    /// state. Rows in `Failed` or `Destroying` state are not returned; they
    /// are invisible to find-or-create and are reaped externally.
    async fn find_container(
        &self,
        worker: &str,
        owner: &dyn ContainerOwner,
    ) -> Result<Option<ContainerRow>>;

    /// Create a container row in `Creating` state. This is the durable
    /// intent recorded before any backend side effect.
    async fn create_container(
        &self,
        worker: &str,
        owner: &dyn ContainerOwner,
        metadata: ContainerMetadata,
    ) -> Result<ContainerRow>;

    /// Find a created container row by its handle.
    async fn find_created_container_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<ContainerRow>>;

    /// Transition `Creating` -> `Created`.
    async fn container_created(&self, id: i64) -> Result<()>;

    /// Transition `Creating` -> `Failed` (terminal).
    async fn container_failed(&self, id: i64) -> Result<()>;

    /// Transition `Created` -> `Destroying`.
    async fn container_destroying(&self, id: i64) -> Result<()>;

    // --- volumes ---

    /// Find the volume row attached to a container at the given mount path.
    async fn find_container_volume(
        &self,
        team_id: i64,
        worker: &str,
        container_id: i64,
        mount_path: &str,
    ) -> Result<Option<VolumeRow>>;

    /// Create a volume row (state `Creating`) attached to a container.
    async fn create_container_volume(
        &self,
        team_id: i64,
        worker: &str,
        container_id: i64,
        mount_path: &str,
    ) -> Result<VolumeRow>;

    /// Create a copy-on-write child of `parent` attached to a container.
    ///
    /// The parent row must already be in `Created` state; a child may never
    /// begin creating before its parent's content exists.
    async fn create_child_for_container(
        &self,
        parent: &VolumeRow,
        container_id: i64,
        mount_path: &str,
    ) -> Result<VolumeRow>;

    /// Find the imported base-resource-type volume on a worker.
    async fn find_base_resource_type_volume(
        &self,
        worker: &str,
        resource_type: &str,
    ) -> Result<Option<VolumeRow>>;

    /// Create the imported base-resource-type volume row on a worker.
    async fn create_base_resource_type_volume(
        &self,
        worker: &str,
        resource_type: &str,
    ) -> Result<VolumeRow>;

    /// Find the base cache volume for a (job, step, path) key on a worker.
    async fn find_task_cache_volume(
        &self,
        team_id: i64,
        worker: &str,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> Result<Option<VolumeRow>>;

    /// Register an existing created volume as the base cache volume for a
    /// (job, step, path) key. Future cache hits clone this volume.
    async fn initialize_task_cache(
        &self,
        volume_id: i64,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> Result<()>;

    /// Find the imported certs volume on a worker.
    async fn find_resource_certs_volume(&self, worker: &str) -> Result<Option<VolumeRow>>;

    /// Create the imported certs volume row on a worker.
    async fn create_resource_certs_volume(&self, worker: &str) -> Result<VolumeRow>;

    /// Find a volume row by handle, whatever worker holds it.
    async fn find_volume_by_handle(&self, handle: &str) -> Result<Option<VolumeRow>>;

    /// All created volume rows attached to a container, for reconstructing
    /// its mounts.
    async fn find_volumes_for_container(&self, container_id: i64) -> Result<Vec<VolumeRow>>;

    /// Find a created volume on a worker holding the given resource-cache
    /// content, used to prefer local copies over remote streaming.
    async fn find_resource_cache_volume(
        &self,
        worker: &str,
        cache_key: &str,
    ) -> Result<Option<VolumeRow>>;

    /// Mark a created volume as holding the given resource-cache content.
    async fn initialize_resource_cache(&self, volume_id: i64, cache_key: &str) -> Result<()>;

    /// Transition `Creating` -> `Created`.
    async fn volume_created(&self, id: i64) -> Result<()>;

    /// Transition `Creating` -> `Failed` (terminal).
    async fn volume_failed(&self, id: i64) -> Result<()>;

    // --- locks ---

    /// Try to acquire an advisory lock. Returns `None` when another holder
    /// currently has the lock; the caller is expected to back off and retry.
    async fn acquire_lock(&self, id: LockId) -> Result<Option<Box<dyn Lock>>>;
}
