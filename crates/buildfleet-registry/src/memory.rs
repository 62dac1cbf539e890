// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process registry backend.
//!
//! Implements the full [`Registry`] contract against in-memory tables with
//! the same transition semantics as the relational store, and backs the
//! workspace's tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{RegistryError, Result};
use crate::records::{
    ContainerMetadata, ContainerRow, ContainerState, VolumeRow, VolumeState, WorkerRecord,
    WorkerState,
};
use crate::{ContainerOwner, Lock, LockId, Registry};

#[derive(Default)]
struct Tables {
    workers: Vec<WorkerRecord>,
    containers: Vec<ContainerRow>,
    volumes: Vec<VolumeRow>,
    /// (team, worker, job, step, path) -> base cache volume id
    task_caches: HashMap<(i64, String, i64, String, String), i64>,
    /// worker -> certs volume id
    certs_volumes: HashMap<String, i64>,
    /// (worker, resource type) -> imported volume id
    base_resource_type_volumes: HashMap<(String, String), i64>,
}

/// In-memory [`Registry`] implementation.
pub struct InMemoryRegistry {
    tables: Mutex<Tables>,
    held_locks: Arc<Mutex<HashSet<LockId>>>,
    next_id: AtomicI64,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            held_locks: Arc::new(Mutex::new(HashSet::new())),
            next_id: AtomicI64::new(1),
        }
    }

    /// Register a worker. Test setup helper standing in for the external
    /// registration system.
    pub fn insert_worker(&self, record: WorkerRecord) {
        let mut tables = self.tables.lock().unwrap();
        tables.workers.retain(|w| w.name != record.name);
        tables.workers.push(record);
    }

    /// Overwrite a worker's lifecycle state, as heartbeats would.
    pub fn set_worker_state(&self, name: &str, state: WorkerState) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(worker) = tables.workers.iter_mut().find(|w| w.name == name) {
            worker.state = state;
        }
    }

    /// Snapshot of all container rows, including failed ones.
    pub fn container_rows(&self) -> Vec<ContainerRow> {
        self.tables.lock().unwrap().containers.clone()
    }

    /// Snapshot of all volume rows, including failed ones.
    pub fn volume_rows(&self) -> Vec<VolumeRow> {
        self.tables.lock().unwrap().volumes.clone()
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn new_volume_row(
        &self,
        tables: &mut Tables,
        worker: &str,
        team_id: Option<i64>,
        container_id: Option<i64>,
        mount_path: Option<&str>,
        parent_handle: Option<&str>,
    ) -> VolumeRow {
        let row = VolumeRow {
            id: self.allocate_id(),
            handle: Uuid::new_v4().to_string(),
            worker_name: worker.to_string(),
            state: VolumeState::Creating,
            team_id,
            container_id,
            mount_path: mount_path.map(str::to_string),
            parent_handle: parent_handle.map(str::to_string),
            resource_cache_key: None,
            created_at: Utc::now(),
        };
        tables.volumes.push(row.clone());
        row
    }
}

struct HeldLock {
    id: LockId,
    held: Arc<Mutex<HashSet<LockId>>>,
}

impl Lock for HeldLock {}

impl Drop for HeldLock {
    fn drop(&mut self) {
        self.held.lock().unwrap().remove(&self.id);
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn workers(&self) -> Result<Vec<WorkerRecord>> {
        Ok(self.tables.lock().unwrap().workers.clone())
    }

    async fn find_worker(&self, name: &str) -> Result<Option<WorkerRecord>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.workers.iter().find(|w| w.name == name).cloned())
    }

    async fn find_worker_for_container_owner(
        &self,
        owner: &dyn ContainerOwner,
    ) -> Result<Option<String>> {
        let key = owner.key();
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .containers
            .iter()
            .find(|c| {
                c.owner_key == key
                    && matches!(c.state, ContainerState::Creating | ContainerState::Created)
            })
            .map(|c| c.worker_name.clone()))
    }

    async fn find_container(
        &self,
        worker: &str,
        owner: &dyn ContainerOwner,
    ) -> Result<Option<ContainerRow>> {
        let key = owner.key();
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .containers
            .iter()
            .find(|c| {
                c.worker_name == worker
                    && c.owner_key == key
                    && matches!(c.state, ContainerState::Creating | ContainerState::Created)
            })
            .cloned())
    }

    async fn create_container(
        &self,
        worker: &str,
        owner: &dyn ContainerOwner,
        metadata: ContainerMetadata,
    ) -> Result<ContainerRow> {
        let key = owner.key();
        let mut tables = self.tables.lock().unwrap();
        // Owner uniqueness, as the relational store's constraint enforces:
        // a concurrent creator gets the row that already exists.
        if let Some(existing) = tables.containers.iter().find(|c| {
            c.worker_name == worker
                && c.owner_key == key
                && matches!(c.state, ContainerState::Creating | ContainerState::Created)
        }) {
            return Ok(existing.clone());
        }
        let row = ContainerRow {
            id: self.allocate_id(),
            handle: Uuid::new_v4().to_string(),
            worker_name: worker.to_string(),
            state: ContainerState::Creating,
            owner_key: key,
            metadata,
            created_at: Utc::now(),
        };
        debug!(handle = %row.handle, worker, "created creating container row");
        tables.containers.push(row.clone());
        Ok(row)
    }

    async fn find_created_container_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<ContainerRow>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .containers
            .iter()
            .find(|c| c.handle == handle && c.state == ContainerState::Created)
            .cloned())
    }

    async fn container_created(&self, id: i64) -> Result<()> {
        transition_container(self, id, ContainerState::Creating, ContainerState::Created)
    }

    async fn container_failed(&self, id: i64) -> Result<()> {
        transition_container(self, id, ContainerState::Creating, ContainerState::Failed)
    }

    async fn container_destroying(&self, id: i64) -> Result<()> {
        transition_container(self, id, ContainerState::Created, ContainerState::Destroying)
    }

    async fn find_container_volume(
        &self,
        team_id: i64,
        worker: &str,
        container_id: i64,
        mount_path: &str,
    ) -> Result<Option<VolumeRow>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .volumes
            .iter()
            .find(|v| {
                v.worker_name == worker
                    && v.team_id == Some(team_id)
                    && v.container_id == Some(container_id)
                    && v.mount_path.as_deref() == Some(mount_path)
                    && matches!(v.state, VolumeState::Creating | VolumeState::Created)
            })
            .cloned())
    }

    async fn create_container_volume(
        &self,
        team_id: i64,
        worker: &str,
        container_id: i64,
        mount_path: &str,
    ) -> Result<VolumeRow> {
        let mut tables = self.tables.lock().unwrap();
        // Same uniqueness rule as containers: one live row per mount path.
        if let Some(existing) = tables.volumes.iter().find(|v| {
            v.worker_name == worker
                && v.team_id == Some(team_id)
                && v.container_id == Some(container_id)
                && v.mount_path.as_deref() == Some(mount_path)
                && matches!(v.state, VolumeState::Creating | VolumeState::Created)
        }) {
            return Ok(existing.clone());
        }
        Ok(self.new_volume_row(
            &mut tables,
            worker,
            Some(team_id),
            Some(container_id),
            Some(mount_path),
            None,
        ))
    }

    async fn create_child_for_container(
        &self,
        parent: &VolumeRow,
        container_id: i64,
        mount_path: &str,
    ) -> Result<VolumeRow> {
        let mut tables = self.tables.lock().unwrap();
        let parent_state = tables
            .volumes
            .iter()
            .find(|v| v.id == parent.id)
            .map(|v| v.state)
            .ok_or(RegistryError::RowNotFound {
                row: "volume",
                id: parent.id,
            })?;
        if parent_state != VolumeState::Created {
            return Err(RegistryError::ParentVolumeNotCreated {
                parent_handle: parent.handle.clone(),
            });
        }
        if let Some(existing) = tables.volumes.iter().find(|v| {
            v.container_id == Some(container_id)
                && v.mount_path.as_deref() == Some(mount_path)
                && v.parent_handle.as_deref() == Some(parent.handle.as_str())
                && matches!(v.state, VolumeState::Creating | VolumeState::Created)
        }) {
            return Ok(existing.clone());
        }
        let worker = parent.worker_name.clone();
        let mut row = self.new_volume_row(
            &mut tables,
            &worker,
            parent.team_id,
            Some(container_id),
            Some(mount_path),
            Some(&parent.handle),
        );
        // children inherit the parent's cache identity
        row.resource_cache_key = parent.resource_cache_key.clone();
        if let Some(stored) = tables.volumes.iter_mut().find(|v| v.id == row.id) {
            stored.resource_cache_key = row.resource_cache_key.clone();
        }
        Ok(row)
    }

    async fn find_base_resource_type_volume(
        &self,
        worker: &str,
        resource_type: &str,
    ) -> Result<Option<VolumeRow>> {
        let tables = self.tables.lock().unwrap();
        let id = tables
            .base_resource_type_volumes
            .get(&(worker.to_string(), resource_type.to_string()));
        Ok(id.and_then(|id| tables.volumes.iter().find(|v| v.id == *id).cloned()))
    }

    async fn create_base_resource_type_volume(
        &self,
        worker: &str,
        resource_type: &str,
    ) -> Result<VolumeRow> {
        let mut tables = self.tables.lock().unwrap();
        let row = self.new_volume_row(&mut tables, worker, None, None, None, None);
        tables
            .base_resource_type_volumes
            .insert((worker.to_string(), resource_type.to_string()), row.id);
        Ok(row)
    }

    async fn find_task_cache_volume(
        &self,
        team_id: i64,
        worker: &str,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> Result<Option<VolumeRow>> {
        let tables = self.tables.lock().unwrap();
        let key = (
            team_id,
            worker.to_string(),
            job_id,
            step_name.to_string(),
            path.to_string(),
        );
        let id = tables.task_caches.get(&key);
        Ok(id.and_then(|id| {
            tables
                .volumes
                .iter()
                .find(|v| v.id == *id && v.state == VolumeState::Created)
                .cloned()
        }))
    }

    async fn initialize_task_cache(
        &self,
        volume_id: i64,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let volume = tables
            .volumes
            .iter()
            .find(|v| v.id == volume_id)
            .ok_or(RegistryError::RowNotFound {
                row: "volume",
                id: volume_id,
            })?;
        let key = (
            volume.team_id.unwrap_or(0),
            volume.worker_name.clone(),
            job_id,
            step_name.to_string(),
            path.to_string(),
        );
        tables.task_caches.insert(key, volume_id);
        Ok(())
    }

    async fn find_resource_certs_volume(&self, worker: &str) -> Result<Option<VolumeRow>> {
        let tables = self.tables.lock().unwrap();
        let id = tables.certs_volumes.get(worker);
        Ok(id.and_then(|id| tables.volumes.iter().find(|v| v.id == *id).cloned()))
    }

    async fn create_resource_certs_volume(&self, worker: &str) -> Result<VolumeRow> {
        let mut tables = self.tables.lock().unwrap();
        let row = self.new_volume_row(&mut tables, worker, None, None, None, None);
        tables.certs_volumes.insert(worker.to_string(), row.id);
        Ok(row)
    }

    async fn find_volume_by_handle(&self, handle: &str) -> Result<Option<VolumeRow>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .volumes
            .iter()
            .find(|v| v.handle == handle && v.state == VolumeState::Created)
            .cloned())
    }

    async fn find_volumes_for_container(&self, container_id: i64) -> Result<Vec<VolumeRow>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .volumes
            .iter()
            .filter(|v| {
                v.container_id == Some(container_id) && v.state == VolumeState::Created
            })
            .cloned()
            .collect())
    }

    async fn find_resource_cache_volume(
        &self,
        worker: &str,
        cache_key: &str,
    ) -> Result<Option<VolumeRow>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .volumes
            .iter()
            .find(|v| {
                v.worker_name == worker
                    && v.resource_cache_key.as_deref() == Some(cache_key)
                    && v.state == VolumeState::Created
            })
            .cloned())
    }

    async fn initialize_resource_cache(&self, volume_id: i64, cache_key: &str) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let volume = tables
            .volumes
            .iter_mut()
            .find(|v| v.id == volume_id)
            .ok_or(RegistryError::RowNotFound {
                row: "volume",
                id: volume_id,
            })?;
        volume.resource_cache_key = Some(cache_key.to_string());
        Ok(())
    }

    async fn volume_created(&self, id: i64) -> Result<()> {
        transition_volume(self, id, VolumeState::Creating, VolumeState::Created)
    }

    async fn volume_failed(&self, id: i64) -> Result<()> {
        transition_volume(self, id, VolumeState::Creating, VolumeState::Failed)
    }

    async fn acquire_lock(&self, id: LockId) -> Result<Option<Box<dyn Lock>>> {
        let mut held = self.held_locks.lock().unwrap();
        if held.contains(&id) {
            return Ok(None);
        }
        held.insert(id.clone());
        Ok(Some(Box::new(HeldLock {
            id,
            held: Arc::clone(&self.held_locks),
        })))
    }
}

fn transition_container(
    registry: &InMemoryRegistry,
    id: i64,
    expected: ContainerState,
    next: ContainerState,
) -> Result<()> {
    let mut tables = registry.tables.lock().unwrap();
    let row = tables
        .containers
        .iter_mut()
        .find(|c| c.id == id)
        .ok_or(RegistryError::RowNotFound {
            row: "container",
            id,
        })?;
    if row.state != expected {
        return Err(RegistryError::InvalidStateTransition {
            row: "container",
            id,
            expected: format!("{expected:?}"),
            actual: format!("{:?}", row.state),
        });
    }
    row.state = next;
    Ok(())
}

fn transition_volume(
    registry: &InMemoryRegistry,
    id: i64,
    expected: VolumeState,
    next: VolumeState,
) -> Result<()> {
    let mut tables = registry.tables.lock().unwrap();
    let row = tables
        .volumes
        .iter_mut()
        .find(|v| v.id == id)
        .ok_or(RegistryError::RowNotFound { row: "volume", id })?;
    if row.state != expected {
        return Err(RegistryError::InvalidStateTransition {
            row: "volume",
            id,
            expected: format!("{expected:?}"),
            actual: format!("{:?}", row.state),
        });
    }
    row.state = next;
    Ok(())
}
