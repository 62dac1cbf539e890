// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image resolution types and environment assembly.

use buildfleet_registry::WorkerRecord;
use buildfleet_volumes::Volume;
use serde::Deserialize;

use crate::error::{Result, WorkerError};

/// Metadata file produced alongside a rootfs by image-building steps.
pub(crate) const IMAGE_METADATA_FILE: &str = "metadata.json";

/// Registry mount path under which a container's image volume is tracked.
/// The image volume is not bind-mounted; the backend consumes it as rootfs.
pub(crate) const IMAGE_MOUNT_PATH: &str = "/image";

/// Default user and extra environment shipped inside an image volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageMetadata {
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub user: String,
}

/// A resolved image: the rootfs URL handed to the container backend plus
/// whatever metadata came with it.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub url: String,
    pub privileged: bool,
    pub metadata: ImageMetadata,
}

/// Rootfs URL for an image volume on the local worker.
pub(crate) fn rootfs_url(volume: &Volume) -> String {
    format!("raw://{}/rootfs", volume.path())
}

pub(crate) fn parse_metadata(volume_handle: &str, bytes: &[u8]) -> Result<ImageMetadata> {
    serde_json::from_slice(bytes).map_err(|err| WorkerError::MalformedImageMetadata {
        volume: volume_handle.to_string(),
        details: format!("{err}: {}", String::from_utf8_lossy(bytes)),
    })
}

/// Assembles a container's environment: image metadata first, then the spec
/// environment (which wins on conflicting variable names), then the worker's
/// proxy settings appended last.
pub(crate) fn merge_env(
    image_env: &[String],
    spec_env: &[String],
    worker: &WorkerRecord,
) -> Vec<String> {
    let mut merged: Vec<String> = image_env.to_vec();
    for var in spec_env {
        let name = var_name(var);
        match merged.iter().position(|existing| var_name(existing) == name) {
            Some(i) => merged[i] = var.clone(),
            None => merged.push(var.clone()),
        }
    }
    if let Some(url) = &worker.http_proxy_url {
        merged.push(format!("http_proxy={url}"));
    }
    if let Some(url) = &worker.https_proxy_url {
        merged.push(format!("https_proxy={url}"));
    }
    if let Some(hosts) = &worker.no_proxy {
        merged.push(format!("no_proxy={hosts}"));
    }
    merged
}

fn var_name(var: &str) -> &str {
    var.split_once('=').map(|(name, _)| name).unwrap_or(var)
}
