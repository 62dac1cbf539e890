// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The [`Container`] handle returned by find-or-create.

use buildfleet_registry::{ContainerMetadata, ContainerRow};
use buildfleet_sandbox::{Client, Process, ProcessError, ProcessIo, ProcessSpec, Signal, TtySpec};
use buildfleet_volumes::Volume;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::Result;

/// A volume attached to a container at a destination path.
#[derive(Clone)]
pub struct VolumeMount {
    pub volume: Volume,
    pub destination: String,
}

impl std::fmt::Debug for VolumeMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeMount")
            .field("volume", &self.volume.handle())
            .field("destination", &self.destination)
            .finish()
    }
}

fn exit_status_property(process_id: &str) -> String {
    format!("buildfleet:exit-status:{process_id}")
}

/// A created container: the registry row joined with its live counterpart on
/// the worker's container backend.
#[derive(Clone)]
pub struct Container {
    row: ContainerRow,
    mounts: Vec<VolumeMount>,
    client: Client,
}

impl Container {
    pub(crate) fn new(row: ContainerRow, mounts: Vec<VolumeMount>, client: Client) -> Self {
        Self { row, mounts, client }
    }

    pub fn handle(&self) -> &str {
        &self.row.handle
    }

    pub fn worker_name(&self) -> &str {
        &self.row.worker_name
    }

    pub fn metadata(&self) -> &ContainerMetadata {
        &self.row.metadata
    }

    pub fn mounts(&self) -> &[VolumeMount] {
        &self.mounts
    }

    /// Spawns a process. An empty `user`/`dir` in the spec falls back to the
    /// image's default user and the container's working directory.
    #[instrument(skip_all, fields(handle = %self.row.handle, path = %spec.path))]
    pub async fn run(
        &self,
        mut spec: ProcessSpec,
        io: ProcessIo,
        cancel: CancellationToken,
    ) -> Result<ContainerProcess> {
        if spec.user.is_empty() {
            if let Some(user) = self.client.property(&self.row.handle, "user").await? {
                spec.user = user;
            }
        }
        if spec.dir.is_empty() {
            spec.dir = self.row.metadata.working_directory.clone();
        }
        let process = self.client.run(&self.row.handle, &spec, io, cancel).await?;
        Ok(ContainerProcess {
            inner: process,
            client: self.client.clone(),
            handle: self.row.handle.clone(),
        })
    }

    /// Reattaches to a process by its caller-chosen id. When the exit status
    /// was already persisted by an earlier wait, no connection is opened at
    /// all.
    #[instrument(skip_all, fields(handle = %self.row.handle, process_id))]
    pub async fn attach(
        &self,
        process_id: &str,
        io: ProcessIo,
        cancel: CancellationToken,
    ) -> Result<ContainerProcess> {
        let key = exit_status_property(process_id);
        if let Some(value) = self.client.property(&self.row.handle, &key).await? {
            if let Ok(status) = value.parse::<i32>() {
                return Ok(ContainerProcess {
                    inner: Process::exited(process_id, status),
                    client: self.client.clone(),
                    handle: self.row.handle.clone(),
                });
            }
        }
        let process = self.client.attach(&self.row.handle, process_id, io, cancel).await?;
        Ok(ContainerProcess {
            inner: process,
            client: self.client.clone(),
            handle: self.row.handle.clone(),
        })
    }

    pub async fn property(&self, name: &str) -> Result<Option<String>> {
        Ok(self.client.property(&self.row.handle, name).await?)
    }

    pub async fn set_property(&self, name: &str, value: &str) -> Result<()> {
        Ok(self.client.set_property(&self.row.handle, name, value).await?)
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("handle", &self.row.handle)
            .field("worker", &self.row.worker_name)
            .field("mounts", &self.mounts)
            .finish()
    }
}

/// Process handle that persists the exit status as a container property so
/// a later attach can short-circuit.
pub struct ContainerProcess {
    inner: Process,
    client: Client,
    handle: String,
}

impl ContainerProcess {
    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub async fn wait(&mut self) -> std::result::Result<i32, ProcessError> {
        let status = self.inner.wait().await?;
        let key = exit_status_property(self.inner.id());
        // Best effort; a missing property only costs a reattach later.
        let _ = self.client.set_property(&self.handle, &key, &status.to_string()).await;
        Ok(status)
    }

    pub async fn signal(&self, signal: Signal) -> std::result::Result<(), ProcessError> {
        self.inner.signal(signal).await
    }

    pub async fn set_tty(&self, tty: TtySpec) -> std::result::Result<(), ProcessError> {
        self.inner.set_tty(tty).await
    }
}
