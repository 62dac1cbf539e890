// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! High-level container backend client.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::{ClientError, ClientResult};
use crate::process::{Process, ProcessIo, stream_process};
use crate::protocol::{
    Capacity, ContainerInfo, ContainerMetrics, ContainerSpec, Limits, ProcessSpec, Route,
};
use crate::transport::{ByteStream, HttpTransport, Transport};

/// Client for one container backend.
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Connects over HTTP to `base_url`, e.g. `http://10.0.3.7:7777`.
    pub fn http(base_url: &str) -> ClientResult<Self> {
        Ok(Self::new(Arc::new(HttpTransport::new(base_url)?)))
    }

    pub async fn ping(&self) -> ClientResult<()> {
        self.transport.request(Route::Ping, None).await?;
        Ok(())
    }

    pub async fn capacity(&self) -> ClientResult<Capacity> {
        let value = self.transport.request(Route::Capacity, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Creates a container and returns its handle.
    #[instrument(skip_all, fields(handle = %spec.handle))]
    pub async fn create(&self, spec: &ContainerSpec) -> ClientResult<String> {
        let value = self
            .transport
            .request(Route::Create, Some(serde_json::to_value(spec)?))
            .await?;
        let created: HandlePayload = serde_json::from_value(value)?;
        Ok(created.handle)
    }

    #[instrument(skip(self))]
    pub async fn destroy(&self, handle: &str) -> ClientResult<()> {
        self.transport
            .request(Route::Destroy { handle: handle.to_string() }, None)
            .await
            .map_err(|err| not_found(err, handle))?;
        Ok(())
    }

    pub async fn stop(&self, handle: &str, kill: bool) -> ClientResult<()> {
        self.transport
            .request(Route::Stop { handle: handle.to_string() }, Some(json!({ "kill": kill })))
            .await
            .map_err(|err| not_found(err, handle))?;
        Ok(())
    }

    /// Lists handles of containers matching all given property pairs.
    pub async fn list(&self, filter: &[(String, String)]) -> ClientResult<Vec<String>> {
        let value = self
            .transport
            .request(Route::List { filter: filter.to_vec() }, None)
            .await?;
        let listed: HandlesPayload = serde_json::from_value(value)?;
        Ok(listed.handles)
    }

    /// Looks a container up by handle; `Ok(None)` when the backend does not
    /// know it.
    pub async fn lookup(&self, handle: &str) -> ClientResult<Option<ContainerInfo>> {
        match self.info(handle).await {
            Ok(info) => Ok(Some(info)),
            Err(ClientError::ContainerNotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn info(&self, handle: &str) -> ClientResult<ContainerInfo> {
        let value = self
            .transport
            .request(Route::Info { handle: handle.to_string() }, None)
            .await
            .map_err(|err| not_found(err, handle))?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn metrics(&self, handle: &str) -> ClientResult<ContainerMetrics> {
        let value = self
            .transport
            .request(Route::Metrics { handle: handle.to_string() }, None)
            .await
            .map_err(|err| not_found(err, handle))?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn current_limits(&self, handle: &str) -> ClientResult<Limits> {
        let value = self
            .transport
            .request(Route::CurrentLimits { handle: handle.to_string() }, None)
            .await
            .map_err(|err| not_found(err, handle))?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn properties(&self, handle: &str) -> ClientResult<HashMap<String, String>> {
        let value = self
            .transport
            .request(Route::Properties { handle: handle.to_string() }, None)
            .await
            .map_err(|err| not_found(err, handle))?;
        Ok(serde_json::from_value(value)?)
    }

    /// `Ok(None)` when the property has never been set.
    pub async fn property(&self, handle: &str, name: &str) -> ClientResult<Option<String>> {
        let route = Route::Property { handle: handle.to_string(), name: name.to_string() };
        match self.transport.request(route, None).await {
            Ok(value) => {
                let payload: ValuePayload = serde_json::from_value(value)?;
                Ok(Some(payload.value))
            }
            Err(ClientError::Backend { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn set_property(&self, handle: &str, name: &str, value: &str) -> ClientResult<()> {
        let route = Route::SetProperty { handle: handle.to_string(), name: name.to_string() };
        self.transport
            .request(route, Some(json!({ "value": value })))
            .await
            .map_err(|err| not_found(err, handle))?;
        Ok(())
    }

    pub async fn remove_property(&self, handle: &str, name: &str) -> ClientResult<()> {
        let route = Route::RemoveProperty { handle: handle.to_string(), name: name.to_string() };
        self.transport.request(route, None).await.map_err(|err| not_found(err, handle))?;
        Ok(())
    }

    /// Unpacks an archive stream into `destination` inside the container.
    #[instrument(skip(self, content))]
    pub async fn stream_in(
        &self,
        handle: &str,
        destination: &str,
        content: ByteStream,
    ) -> ClientResult<()> {
        let route = Route::StreamIn {
            handle: handle.to_string(),
            destination: destination.to_string(),
        };
        self.transport.stream_in(route, content).await
    }

    /// Streams `source` inside the container out as an archive.
    #[instrument(skip(self))]
    pub async fn stream_out(&self, handle: &str, source: &str) -> ClientResult<ByteStream> {
        let route =
            Route::StreamOut { handle: handle.to_string(), source: source.to_string() };
        self.transport.stream_out(route).await
    }

    /// Maps a host port to a container port; zero asks the backend to pick.
    pub async fn net_in(
        &self,
        handle: &str,
        host_port: u32,
        container_port: u32,
    ) -> ClientResult<(u32, u32)> {
        let value = self
            .transport
            .request(
                Route::NetIn { handle: handle.to_string() },
                Some(json!({ "host_port": host_port, "container_port": container_port })),
            )
            .await
            .map_err(|err| not_found(err, handle))?;
        let mapped: PortMappingPayload = serde_json::from_value(value)?;
        Ok((mapped.host_port, mapped.container_port))
    }

    pub async fn net_out(&self, handle: &str, rule: Value) -> ClientResult<()> {
        self.transport
            .request(Route::NetOut { handle: handle.to_string() }, Some(rule))
            .await
            .map_err(|err| not_found(err, handle))?;
        Ok(())
    }

    /// Spawns a process and wires its stdio. Canceling `cancel` stops the
    /// process and resolves `wait` with a cancellation error.
    #[instrument(skip(self, spec, io, cancel), fields(path = %spec.path))]
    pub async fn run(
        &self,
        handle: &str,
        spec: &ProcessSpec,
        io: ProcessIo,
        cancel: CancellationToken,
    ) -> ClientResult<Process> {
        let conn = self
            .transport
            .hijack(
                Route::Run { handle: handle.to_string() },
                Some(serde_json::to_value(spec)?),
            )
            .await
            .map_err(|err| not_found(err, handle))?;
        stream_process(self.transport.clone(), handle, conn, io, cancel).await
    }

    /// Reattaches to a process spawned earlier with a known id.
    #[instrument(skip(self, io, cancel))]
    pub async fn attach(
        &self,
        handle: &str,
        process_id: &str,
        io: ProcessIo,
        cancel: CancellationToken,
    ) -> ClientResult<Process> {
        let route = Route::Attach {
            handle: handle.to_string(),
            process_id: process_id.to_string(),
        };
        let conn = self
            .transport
            .hijack(route, None)
            .await
            .map_err(|err| not_found(err, handle))?;
        stream_process(self.transport.clone(), handle, conn, io, cancel).await
    }
}

fn not_found(err: ClientError, handle: &str) -> ClientError {
    match err {
        ClientError::Backend { status: 404, .. } => {
            ClientError::ContainerNotFound { handle: handle.to_string() }
        }
        other => other,
    }
}

#[derive(serde::Deserialize)]
struct HandlePayload {
    handle: String,
}

#[derive(serde::Deserialize)]
struct HandlesPayload {
    #[serde(default)]
    handles: Vec<String>,
}

#[derive(serde::Deserialize)]
struct ValuePayload {
    value: String,
}

#[derive(serde::Deserialize)]
struct PortMappingPayload {
    host_port: u32,
    container_port: u32,
}
