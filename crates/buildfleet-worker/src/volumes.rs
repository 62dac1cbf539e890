// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Volume find-or-create against one worker's volume backend.
//!
//! Every kind of mount goes through the same routine: find or create the
//! registry row, then drive it to created under the row's advisory lock.
//! Lock contention is not an error; the loser backs off a fixed interval and
//! re-reads the row, which by then is usually created.

use std::sync::Arc;
use std::time::Duration;

use buildfleet_registry::{LockId, Registry, RegistryError, VolumeRow, VolumeState};
use buildfleet_volumes::{Volume, VolumeBackend, VolumeSpec, VolumeStrategy};
use tracing::{debug, warn};

use crate::error::{Result, WorkerError};

const CREATE_LOCK_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Which registry row a volume materializes from.
pub(crate) enum RowSource<'a> {
    /// A volume attached to a container at a mount path.
    Container { team_id: i64, container_id: i64, mount_path: &'a str },
    /// A copy-on-write child of an existing created volume.
    Child { parent: &'a VolumeRow, container_id: i64, mount_path: &'a str },
    /// The per-worker import of a base resource type's host path.
    BaseResourceType { name: &'a str },
    /// The per-worker import of the CA certificate bundle.
    Certs,
}

/// Materializes volumes on one worker.
pub(crate) struct VolumeFactory {
    registry: Arc<dyn Registry>,
    backend: Arc<dyn VolumeBackend>,
    worker: String,
}

impl VolumeFactory {
    pub(crate) fn new(
        registry: Arc<dyn Registry>,
        backend: Arc<dyn VolumeBackend>,
        worker: impl Into<String>,
    ) -> Self {
        Self { registry, backend, worker: worker.into() }
    }

    pub(crate) fn backend(&self) -> Arc<dyn VolumeBackend> {
        self.backend.clone()
    }

    /// Reconstructs a [`Volume`] from a created registry row. The backend
    /// missing the volume is consistency drift, surfaced and never repaired
    /// here.
    pub(crate) async fn lookup_created(&self, row: &VolumeRow) -> Result<Volume> {
        match self.backend.lookup_volume(&row.handle).await? {
            Some(live) => Ok(Volume::new(row.clone(), live, self.backend.clone())),
            None => Err(WorkerError::VolumeMissingFromWorker {
                handle: row.handle.clone(),
                worker: self.worker.clone(),
            }),
        }
    }

    /// The shared find-or-create routine.
    pub(crate) async fn find_or_create(
        &self,
        source: RowSource<'_>,
        strategy: VolumeStrategy,
        privileged: bool,
    ) -> Result<Volume> {
        loop {
            let row = match self.find_row(&source).await? {
                Some(row) => row,
                None => self.create_row(&source).await?,
            };
            match row.state {
                VolumeState::Created => return self.lookup_created(&row).await,
                VolumeState::Creating => {
                    let Some(_guard) =
                        self.registry.acquire_lock(LockId::VolumeCreating(row.id)).await?
                    else {
                        debug!(handle = %row.handle, "volume create lock held elsewhere; backing off");
                        tokio::time::sleep(CREATE_LOCK_RETRY_DELAY).await;
                        continue;
                    };
                    return self.create_under_lock(row, &strategy, privileged).await;
                }
                // Find never returns terminal rows; a fresh row is always
                // creating.
                VolumeState::Failed | VolumeState::Destroying => {
                    return Err(WorkerError::VolumeMissingFromWorker {
                        handle: row.handle,
                        worker: self.worker.clone(),
                    });
                }
            }
        }
    }

    /// Creates the backend volume and advances the row, with the row's lock
    /// held. A concurrent creator may have finished between our find and the
    /// lock acquisition, so the backend is checked again first.
    async fn create_under_lock(
        &self,
        mut row: VolumeRow,
        strategy: &VolumeStrategy,
        privileged: bool,
    ) -> Result<Volume> {
        let (live, already_existed) = match self.backend.lookup_volume(&row.handle).await? {
            Some(live) => (live, true),
            None => {
                let spec = VolumeSpec::new(strategy.clone(), privileged);
                match self.backend.create_volume(&row.handle, &spec).await {
                    Ok(live) => (live, false),
                    Err(err) => {
                        warn!(handle = %row.handle, error = %err, "backend volume create failed");
                        self.registry.volume_failed(row.id).await?;
                        return Err(err.into());
                    }
                }
            }
        };
        match self.registry.volume_created(row.id).await {
            Ok(()) => {}
            // The concurrent creator already advanced the row.
            Err(RegistryError::InvalidStateTransition { .. }) if already_existed => {}
            Err(err) => return Err(err.into()),
        }
        row.state = VolumeState::Created;
        debug!(handle = %row.handle, worker = %self.worker, "volume created");
        Ok(Volume::new(row, live, self.backend.clone()))
    }

    async fn find_row(&self, source: &RowSource<'_>) -> Result<Option<VolumeRow>> {
        let row = match source {
            RowSource::Container { team_id, container_id, mount_path } => {
                self.registry
                    .find_container_volume(*team_id, &self.worker, *container_id, mount_path)
                    .await?
            }
            RowSource::Child { parent, container_id, mount_path } => {
                match self
                    .registry
                    .find_container_volume(
                        parent.team_id.unwrap_or(0),
                        &self.worker,
                        *container_id,
                        mount_path,
                    )
                    .await?
                {
                    // Only reuse a row that really is a child of this parent.
                    Some(row) if row.parent_handle.as_deref() == Some(parent.handle.as_str()) => {
                        Some(row)
                    }
                    Some(_) | None => None,
                }
            }
            RowSource::BaseResourceType { name } => {
                self.registry.find_base_resource_type_volume(&self.worker, name).await?
            }
            RowSource::Certs => self.registry.find_resource_certs_volume(&self.worker).await?,
        };
        Ok(row)
    }

    async fn create_row(&self, source: &RowSource<'_>) -> Result<VolumeRow> {
        let row = match source {
            RowSource::Container { team_id, container_id, mount_path } => {
                self.registry
                    .create_container_volume(*team_id, &self.worker, *container_id, mount_path)
                    .await?
            }
            RowSource::Child { parent, container_id, mount_path } => {
                self.registry
                    .create_child_for_container(parent, *container_id, mount_path)
                    .await?
            }
            RowSource::BaseResourceType { name } => {
                self.registry.create_base_resource_type_volume(&self.worker, name).await?
            }
            RowSource::Certs => self.registry.create_resource_certs_volume(&self.worker).await?,
        };
        Ok(row)
    }
}
