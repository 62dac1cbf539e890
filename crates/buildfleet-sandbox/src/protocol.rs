// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire types for the container backend protocol.
//!
//! Every backend operation is addressed by a [`Route`]. Plain operations
//! exchange one JSON document each way; `run`, `attach` and the per-stream
//! stdio routes hijack the connection after the response head and speak
//! newline-free [`Envelope`] JSON objects over the raw socket from then on.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ClientError;

/// Specification sent to the backend when creating a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub handle: String,
    /// Root filesystem location, e.g. `raw:///var/volumes/live/abc/volume/rootfs`.
    pub rootfs: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub bind_mounts: Vec<BindMount>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<Limits>,
}

/// Host path mounted into the container filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindMount {
    pub src_path: String,
    pub dst_path: String,
    pub mode: BindMountMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMountMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
}

/// Specification for a process spawned inside a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Client-chosen identifier, used later for attach.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    /// Working directory. The backend creates it if absent.
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tty: Option<TtySpec>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TtySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_size: Option<WindowSize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowSize {
    pub columns: u32,
    pub rows: u32,
}

/// Aggregate capacity report from a backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Capacity {
    pub memory_in_bytes: u64,
    pub disk_in_bytes: u64,
    pub max_containers: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerInfo {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub container_ip: String,
    #[serde(default)]
    pub container_path: String,
    #[serde(default)]
    pub process_ids: Vec<String>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ContainerMetrics {
    #[serde(default)]
    pub memory_usage_in_bytes: u64,
    #[serde(default)]
    pub cpu_usage_ns: u64,
    #[serde(default)]
    pub disk_usage_in_bytes: u64,
}

/// Stream multiplexing envelope exchanged over hijacked connections.
///
/// The first envelope on a run/attach connection carries `process_id` and
/// `stream_id`; subsequent envelopes on the same connection carry stdin
/// payloads client-to-server and `exit_status` or `error` server-to-client.
/// Payload bytes travel base64-encoded in `data`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<StdStream>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Explicit stdin close marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tty: Option<TtySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdStream {
    Stdin,
    Stdout,
    Stderr,
}

/// Addressable backend operations.
#[derive(Debug, Clone)]
pub enum Route {
    Ping,
    Capacity,
    Create,
    List { filter: Vec<(String, String)> },
    Destroy { handle: String },
    Stop { handle: String },
    Info { handle: String },
    Metrics { handle: String },
    CurrentLimits { handle: String },
    Properties { handle: String },
    Property { handle: String, name: String },
    SetProperty { handle: String, name: String },
    RemoveProperty { handle: String, name: String },
    StreamIn { handle: String, destination: String },
    StreamOut { handle: String, source: String },
    NetIn { handle: String },
    NetOut { handle: String },
    Run { handle: String },
    Attach { handle: String, process_id: String },
    Stdout { handle: String, process_id: String, stream_id: String },
    Stderr { handle: String, process_id: String, stream_id: String },
}

impl Route {
    pub fn method(&self) -> &'static str {
        match self {
            Route::Ping
            | Route::Capacity
            | Route::List { .. }
            | Route::Info { .. }
            | Route::Metrics { .. }
            | Route::CurrentLimits { .. }
            | Route::Properties { .. }
            | Route::Property { .. }
            | Route::Attach { .. }
            | Route::Stdout { .. }
            | Route::Stderr { .. } => "GET",
            Route::Create | Route::Run { .. } | Route::NetIn { .. } | Route::NetOut { .. } => {
                "POST"
            }
            Route::Stop { .. }
            | Route::SetProperty { .. }
            | Route::StreamIn { .. }
            | Route::StreamOut { .. } => "PUT",
            Route::Destroy { .. } | Route::RemoveProperty { .. } => "DELETE",
        }
    }

    pub fn path_and_query(&self) -> String {
        match self {
            Route::Ping => "/ping".into(),
            Route::Capacity => "/capacity".into(),
            Route::Create => "/containers".into(),
            Route::List { filter } => {
                if filter.is_empty() {
                    "/containers".into()
                } else {
                    let query = filter
                        .iter()
                        .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
                        .collect::<Vec<_>>()
                        .join("&");
                    format!("/containers?{query}")
                }
            }
            Route::Destroy { handle } => format!("/containers/{handle}"),
            Route::Stop { handle } => format!("/containers/{handle}/stop"),
            Route::Info { handle } => format!("/containers/{handle}/info"),
            Route::Metrics { handle } => format!("/containers/{handle}/metrics"),
            Route::CurrentLimits { handle } => format!("/containers/{handle}/limits"),
            Route::Properties { handle } => format!("/containers/{handle}/properties"),
            Route::Property { handle, name }
            | Route::SetProperty { handle, name }
            | Route::RemoveProperty { handle, name } => {
                format!("/containers/{handle}/properties/{}", urlencode(name))
            }
            Route::StreamIn { handle, destination } => {
                format!("/containers/{handle}/stream-in?destination={}", urlencode(destination))
            }
            Route::StreamOut { handle, source } => {
                format!("/containers/{handle}/stream-out?source={}", urlencode(source))
            }
            Route::NetIn { handle } => format!("/containers/{handle}/net/in"),
            Route::NetOut { handle } => format!("/containers/{handle}/net/out"),
            Route::Run { handle } => format!("/containers/{handle}/processes"),
            Route::Attach { handle, process_id } => {
                format!("/containers/{handle}/processes/{process_id}/attach")
            }
            Route::Stdout { handle, process_id, stream_id } => format!(
                "/containers/{handle}/processes/{process_id}/attaches/{stream_id}/stdout"
            ),
            Route::Stderr { handle, process_id, stream_id } => format!(
                "/containers/{handle}/processes/{process_id}/attaches/{stream_id}/stderr"
            ),
        }
    }
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' | b':' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Incremental decoder for back-to-back JSON envelopes on a raw connection.
///
/// The peer writes envelopes with no delimiter between them, so framing is
/// done by tracking JSON object nesting depth and string state.
pub struct EnvelopeReader<R> {
    inner: R,
    buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> EnvelopeReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, buffer: Vec::new() }
    }

    /// Reads the next envelope. Returns `Ok(None)` on clean end of stream.
    pub async fn next(&mut self) -> Result<Option<Envelope>, ClientError> {
        loop {
            if let Some(end) = complete_object_end(&self.buffer) {
                let raw: Vec<u8> = self.buffer.drain(..end).collect();
                let envelope = serde_json::from_slice(&raw)?;
                return Ok(Some(envelope));
            }
            let mut chunk = [0u8; 8192];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.buffer.iter().all(|b| b.is_ascii_whitespace()) {
                    return Ok(None);
                }
                return Err(ClientError::Protocol {
                    payload: String::from_utf8_lossy(&self.buffer).into_owned(),
                });
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Finds the byte index one past the first complete top-level JSON object,
/// or `None` if the buffer does not yet hold one.
fn complete_object_end(buffer: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut started = false;
    for (i, &byte) in buffer.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' if started => in_string = true,
            b'{' => {
                started = true;
                depth += 1;
            }
            b'}' => {
                depth = depth.saturating_sub(1);
                if started && depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
