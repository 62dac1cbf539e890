// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process volume backend.
//!
//! Holds volume content as in-memory file maps while honoring the full
//! streaming contract (tar+gzip in, tar+gzip out), so tests exercise the
//! same archive round-trips the HTTP backend performs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::archive;
use crate::backend::{BackendVolume, ByteStream, VolumeBackend, VolumeSpec};
use crate::error::{Result, VolumeError};
use crate::strategy::VolumeStrategy;

type FileMap = BTreeMap<String, Vec<u8>>;

struct MemVolume {
    path: String,
    properties: HashMap<String, String>,
    privileged: bool,
    files: FileMap,
}

impl MemVolume {
    fn describe(&self, handle: &str) -> BackendVolume {
        BackendVolume {
            handle: handle.to_string(),
            path: self.path.clone(),
            properties: self.properties.clone(),
            privileged: self.privileged,
        }
    }
}

/// In-memory [`VolumeBackend`] implementation.
#[derive(Default)]
pub struct InMemoryVolumeBackend {
    volumes: Mutex<HashMap<String, MemVolume>>,
    /// Importable host paths, standing in for the worker's filesystem.
    host_paths: Mutex<HashMap<String, FileMap>>,
}

impl InMemoryVolumeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a host path that `VolumeStrategy::Import` can pull from.
    pub fn add_host_path(&self, path: impl Into<String>, files: Vec<(&str, &[u8])>) {
        let files = files
            .into_iter()
            .map(|(name, data)| (name.to_string(), data.to_vec()))
            .collect();
        self.host_paths.lock().unwrap().insert(path.into(), files);
    }

    /// Replace a volume's content wholesale. Test fixture helper.
    pub fn put_files(&self, handle: &str, files: Vec<(&str, &[u8])>) {
        let mut volumes = self.volumes.lock().unwrap();
        if let Some(volume) = volumes.get_mut(handle) {
            volume.files = files
                .into_iter()
                .map(|(name, data)| (name.to_string(), data.to_vec()))
                .collect();
        }
    }

    /// Direct read of a volume's file map. Test assertion helper.
    pub fn files(&self, handle: &str) -> Option<BTreeMap<String, Vec<u8>>> {
        self.volumes
            .lock()
            .unwrap()
            .get(handle)
            .map(|v| v.files.clone())
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.lock().unwrap().len()
    }
}

#[async_trait]
impl VolumeBackend for InMemoryVolumeBackend {
    async fn create_volume(&self, handle: &str, spec: &VolumeSpec) -> Result<BackendVolume> {
        let mut volumes = self.volumes.lock().unwrap();
        let files = match &spec.strategy {
            VolumeStrategy::Empty => FileMap::new(),
            VolumeStrategy::CopyOnWrite { parent } => volumes
                .get(parent)
                .ok_or_else(|| VolumeError::StrategySource {
                    source_ref: parent.clone(),
                    details: "copy-on-write parent volume not found".to_string(),
                })?
                .files
                .clone(),
            VolumeStrategy::Import { path, .. } => self
                .host_paths
                .lock()
                .unwrap()
                .get(path)
                .ok_or_else(|| VolumeError::StrategySource {
                    source_ref: path.clone(),
                    details: "import path not found on host".to_string(),
                })?
                .clone(),
        };
        let volume = MemVolume {
            path: format!("/var/volumes/live/{handle}/volume"),
            properties: spec.properties.clone(),
            privileged: spec.privileged,
            files,
        };
        let described = volume.describe(handle);
        volumes.insert(handle.to_string(), volume);
        Ok(described)
    }

    async fn lookup_volume(&self, handle: &str) -> Result<Option<BackendVolume>> {
        let volumes = self.volumes.lock().unwrap();
        Ok(volumes.get(handle).map(|v| v.describe(handle)))
    }

    async fn list_volumes(&self, filter: &HashMap<String, String>) -> Result<Vec<BackendVolume>> {
        let volumes = self.volumes.lock().unwrap();
        Ok(volumes
            .iter()
            .filter(|(_, v)| {
                filter
                    .iter()
                    .all(|(name, value)| v.properties.get(name) == Some(value))
            })
            .map(|(handle, v)| v.describe(handle))
            .collect())
    }

    async fn destroy_volume(&self, handle: &str) -> Result<()> {
        let mut volumes = self.volumes.lock().unwrap();
        volumes
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| VolumeError::NotFound {
                handle: handle.to_string(),
            })
    }

    async fn stream_in(&self, handle: &str, path: &str, content: ByteStream) -> Result<()> {
        let bytes = archive::collect(content).await?;
        let entries = archive::unpack(&bytes)?;

        let mut volumes = self.volumes.lock().unwrap();
        let volume = volumes
            .get_mut(handle)
            .ok_or_else(|| VolumeError::NotFound {
                handle: handle.to_string(),
            })?;
        let prefix = normalize(path);
        for (name, data) in entries {
            let key = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            volume.files.insert(key, data);
        }
        Ok(())
    }

    async fn stream_out(&self, handle: &str, path: &str) -> Result<ByteStream> {
        let volumes = self.volumes.lock().unwrap();
        let volume = volumes.get(handle).ok_or_else(|| VolumeError::NotFound {
            handle: handle.to_string(),
        })?;

        let prefix = normalize(path);
        let mut entries = FileMap::new();
        if prefix.is_empty() {
            entries = volume.files.clone();
        } else if let Some(data) = volume.files.get(&prefix) {
            // narrowed to a single file: one entry named by its basename
            let basename = prefix.rsplit('/').next().unwrap_or(&prefix).to_string();
            entries.insert(basename, data.clone());
        } else {
            let dir_prefix = format!("{prefix}/");
            for (name, data) in &volume.files {
                if let Some(rest) = name.strip_prefix(&dir_prefix) {
                    entries.insert(rest.to_string(), data.clone());
                }
            }
            if entries.is_empty() {
                return Err(VolumeError::NoSuchPath {
                    handle: handle.to_string(),
                    path: path.to_string(),
                });
            }
        }

        let bytes = archive::pack(&entries)?;
        Ok(archive::stream_from_bytes(bytes))
    }

    async fn set_property(&self, handle: &str, name: &str, value: &str) -> Result<()> {
        let mut volumes = self.volumes.lock().unwrap();
        let volume = volumes
            .get_mut(handle)
            .ok_or_else(|| VolumeError::NotFound {
                handle: handle.to_string(),
            })?;
        volume
            .properties
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn set_privileged(&self, handle: &str, privileged: bool) -> Result<()> {
        let mut volumes = self.volumes.lock().unwrap();
        let volume = volumes
            .get_mut(handle)
            .ok_or_else(|| VolumeError::NotFound {
                handle: handle.to_string(),
            })?;
        volume.privileged = privileged;
        Ok(())
    }

    async fn get_privileged(&self, handle: &str) -> Result<bool> {
        let volumes = self.volumes.lock().unwrap();
        volumes
            .get(handle)
            .map(|v| v.privileged)
            .ok_or_else(|| VolumeError::NotFound {
                handle: handle.to_string(),
            })
    }
}

/// Strip leading "./" and "/" so archive prefixes compose cleanly.
fn normalize(path: &str) -> String {
    let path = path.trim_start_matches("./").trim_start_matches('/');
    path.trim_end_matches('/').to_string()
}
