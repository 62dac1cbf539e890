// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The volume backend API and its HTTP client.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{Result, VolumeError};
use crate::strategy::VolumeStrategy;

/// A stream of archive bytes flowing into or out of a volume.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Desired shape of a volume at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub strategy: VolumeStrategy,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl VolumeSpec {
    pub fn new(strategy: VolumeStrategy, privileged: bool) -> Self {
        Self {
            strategy,
            privileged,
            properties: HashMap::new(),
        }
    }
}

/// A live volume as reported by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendVolume {
    pub handle: String,
    /// Absolute mount path of the volume on the worker.
    pub path: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub privileged: bool,
}

/// Client-side contract of a worker's volume backend.
///
/// Implementations are per-worker; handles are only meaningful against the
/// backend that created them.
#[async_trait]
pub trait VolumeBackend: Send + Sync {
    /// Create a volume under a caller-supplied handle.
    async fn create_volume(&self, handle: &str, spec: &VolumeSpec) -> Result<BackendVolume>;

    /// Look a volume up by handle. `None` means the backend has no such
    /// volume; whether that is an error is the caller's call.
    async fn lookup_volume(&self, handle: &str) -> Result<Option<BackendVolume>>;

    /// All volumes whose properties are a superset of `filter`.
    async fn list_volumes(&self, filter: &HashMap<String, String>) -> Result<Vec<BackendVolume>>;

    async fn destroy_volume(&self, handle: &str) -> Result<()>;

    /// Unpack a tar+gzip archive into the volume at `path`.
    async fn stream_in(&self, handle: &str, path: &str, content: ByteStream) -> Result<()>;

    /// Pack the volume content at `path` into a tar+gzip archive.
    async fn stream_out(&self, handle: &str, path: &str) -> Result<ByteStream>;

    async fn set_property(&self, handle: &str, name: &str, value: &str) -> Result<()>;

    async fn set_privileged(&self, handle: &str, privileged: bool) -> Result<()>;

    async fn get_privileged(&self, handle: &str) -> Result<bool>;
}

/// HTTP client for a remote volume backend.
pub struct HttpVolumeBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpVolumeBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/volumes{}", self.base_url, suffix)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(VolumeError::Backend {
            status: status.as_u16(),
            message,
        })
    }
}

#[derive(Serialize)]
struct CreateVolumeRequest<'a> {
    handle: &'a str,
    strategy: &'a VolumeStrategy,
    privileged: bool,
    properties: &'a HashMap<String, String>,
}

#[async_trait]
impl VolumeBackend for HttpVolumeBackend {
    #[instrument(skip(self, spec), fields(backend = %self.base_url))]
    async fn create_volume(&self, handle: &str, spec: &VolumeSpec) -> Result<BackendVolume> {
        let request = CreateVolumeRequest {
            handle,
            strategy: &spec.strategy,
            privileged: spec.privileged,
            properties: &spec.properties,
        };
        let response = self.client.post(self.url("")).json(&request).send().await?;
        let volume = Self::check(response).await?.json::<BackendVolume>().await?;
        debug!(handle, path = %volume.path, "created volume");
        Ok(volume)
    }

    async fn lookup_volume(&self, handle: &str) -> Result<Option<BackendVolume>> {
        let response = self
            .client
            .get(self.url(&format!("/{handle}")))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::check(response).await?.json().await?))
    }

    async fn list_volumes(&self, filter: &HashMap<String, String>) -> Result<Vec<BackendVolume>> {
        let response = self
            .client
            .get(self.url(""))
            .query(&filter.iter().collect::<Vec<_>>())
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn destroy_volume(&self, handle: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/{handle}")))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(VolumeError::NotFound {
                handle: handle.to_string(),
            });
        }
        Self::check(response).await?;
        Ok(())
    }

    #[instrument(skip(self, content))]
    async fn stream_in(&self, handle: &str, path: &str, content: ByteStream) -> Result<()> {
        let body = reqwest::Body::wrap_stream(content);
        let response = self
            .client
            .put(self.url(&format!("/{handle}/stream-in")))
            .query(&[("path", path)])
            .header(reqwest::header::CONTENT_TYPE, "application/gzip")
            .body(body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stream_out(&self, handle: &str, path: &str) -> Result<ByteStream> {
        let response = self
            .client
            .put(self.url(&format!("/{handle}/stream-out")))
            .query(&[("path", path)])
            .send()
            .await?;
        let response = Self::check(response).await?;
        let stream = response
            .bytes_stream()
            .map_err(|err| std::io::Error::other(err));
        Ok(Box::pin(stream))
    }

    async fn set_property(&self, handle: &str, name: &str, value: &str) -> Result<()> {
        let response = self
            .client
            .put(self.url(&format!("/{handle}/properties/{name}")))
            .json(&serde_json::json!({ "value": value }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn set_privileged(&self, handle: &str, privileged: bool) -> Result<()> {
        let response = self
            .client
            .put(self.url(&format!("/{handle}/privileged")))
            .json(&privileged)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get_privileged(&self, handle: &str) -> Result<bool> {
        let response = self
            .client
            .get(self.url(&format!("/{handle}/privileged")))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
