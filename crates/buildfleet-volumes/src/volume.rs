// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The [`Volume`] handle.

use std::sync::Arc;

use buildfleet_registry::VolumeRow;

use crate::archive;
use crate::backend::{BackendVolume, ByteStream, VolumeBackend};
use crate::error::Result;
use crate::strategy::VolumeStrategy;

/// A volume as seen by the orchestration layer: a registry row paired with
/// its live counterpart on a worker's volume backend.
#[derive(Clone)]
pub struct Volume {
    row: VolumeRow,
    live: BackendVolume,
    backend: Arc<dyn VolumeBackend>,
}

impl Volume {
    pub fn new(row: VolumeRow, live: BackendVolume, backend: Arc<dyn VolumeBackend>) -> Self {
        Self { row, live, backend }
    }

    pub fn handle(&self) -> &str {
        &self.live.handle
    }

    /// Absolute path of the volume on its worker.
    pub fn path(&self) -> &str {
        &self.live.path
    }

    pub fn worker_name(&self) -> &str {
        &self.row.worker_name
    }

    pub fn row(&self) -> &VolumeRow {
        &self.row
    }

    /// A strategy descriptor that clones this volume.
    pub fn cow_strategy(&self) -> VolumeStrategy {
        VolumeStrategy::CopyOnWrite {
            parent: self.live.handle.clone(),
        }
    }

    /// Stream the content at `path` out as a tar+gzip archive.
    pub async fn stream_out(&self, path: &str) -> Result<ByteStream> {
        self.backend.stream_out(&self.live.handle, path).await
    }

    /// Unpack a tar+gzip archive into the volume at `path`.
    pub async fn stream_in(&self, path: &str, content: ByteStream) -> Result<()> {
        self.backend
            .stream_in(&self.live.handle, path, content)
            .await
    }

    /// Read a single file: a stream-out narrowed to `path`, then exactly one
    /// archive entry.
    pub async fn stream_file(&self, path: &str) -> Result<Vec<u8>> {
        let stream = self.stream_out(path).await?;
        let bytes = archive::collect(stream).await?;
        let (_, data) = archive::first_entry(&bytes, &self.live.handle, path)?;
        Ok(data)
    }

    pub async fn set_property(&self, name: &str, value: &str) -> Result<()> {
        self.backend
            .set_property(&self.live.handle, name, value)
            .await
    }

    pub async fn set_privileged(&self, privileged: bool) -> Result<()> {
        self.backend
            .set_privileged(&self.live.handle, privileged)
            .await
    }

    pub async fn get_privileged(&self) -> Result<bool> {
        self.backend.get_privileged(&self.live.handle).await
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("handle", &self.live.handle)
            .field("worker", &self.row.worker_name)
            .field("path", &self.live.path)
            .finish()
    }
}
