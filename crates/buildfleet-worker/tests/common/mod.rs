// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures: an in-process container backend and fleet wiring.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use buildfleet_registry::{InMemoryRegistry, Registry, WorkerRecord, WorkerState};
use buildfleet_sandbox::{
    ByteStream, Client, ClientError, ClientResult, Envelope, EnvelopeReader, HijackedConn, Route,
    Transport,
};
use buildfleet_volumes::{InMemoryVolumeBackend, VolumeBackend};
use buildfleet_worker::{Backends, Pool, Worker};
use chrono::Utc;
use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, DuplexStream};

/// Script for one process path: exit code (`None` waits for a signal) and
/// stdout bytes served on the stdout stream connection.
#[derive(Clone)]
pub struct ProcessScript {
    pub exit_status: Option<i32>,
    pub stdout: Vec<u8>,
}

#[derive(Default)]
struct StoredContainer {
    spec: Value,
    properties: HashMap<String, String>,
}

/// In-process container backend speaking the same [`Transport`] contract as
/// the HTTP one.
#[derive(Default)]
pub struct FakeContainerBackend {
    containers: Mutex<HashMap<String, StoredContainer>>,
    scripts: Mutex<HashMap<String, ProcessScript>>,
    /// process id -> stdout bytes staged at run time
    pending_stdout: Mutex<HashMap<String, Vec<u8>>>,
    next_pid: Mutex<u64>,
    pub stop_requests: Mutex<Vec<String>>,
    /// Process specs received on run, for assertions.
    pub run_specs: Mutex<Vec<Value>>,
}

impl FakeContainerBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Scripts the behavior of processes whose spec path equals `path`.
    pub fn script_process(&self, path: &str, script: ProcessScript) {
        self.scripts.lock().unwrap().insert(path.to_string(), script);
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn container_spec(&self, handle: &str) -> Option<Value> {
        self.containers.lock().unwrap().get(handle).map(|c| c.spec.clone())
    }

    pub fn set_container_property(&self, handle: &str, name: &str, value: &str) {
        let mut containers = self.containers.lock().unwrap();
        containers
            .entry(handle.to_string())
            .or_default()
            .properties
            .insert(name.to_string(), value.to_string());
    }

    pub fn container_property(&self, handle: &str, name: &str) -> Option<String> {
        let containers = self.containers.lock().unwrap();
        containers.get(handle).and_then(|c| c.properties.get(name).cloned())
    }

    fn not_found() -> ClientError {
        ClientError::Backend { status: 404, message: "unknown handle".into() }
    }
}

fn pipe() -> (HijackedConn, DuplexStream) {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(client_end);
    (HijackedConn { read: Box::new(read), write: Box::new(write) }, server_end)
}

async fn send(conn: &mut (impl tokio::io::AsyncWrite + Unpin), envelope: &Envelope) {
    let bytes = serde_json::to_vec(envelope).unwrap();
    let _ = conn.write_all(&bytes).await;
    let _ = conn.flush().await;
}

#[async_trait]
impl Transport for FakeContainerBackend {
    async fn request(&self, route: Route, body: Option<Value>) -> ClientResult<Value> {
        match route {
            Route::Ping | Route::Capacity => Ok(Value::Null),
            Route::Create => {
                let spec = body.unwrap_or(Value::Null);
                let handle = spec["handle"].as_str().unwrap_or_default().to_string();
                let mut containers = self.containers.lock().unwrap();
                // Idempotent by handle, like a backend reconciling a retried
                // create.
                containers
                    .entry(handle.clone())
                    .or_insert_with(|| StoredContainer { spec, properties: HashMap::new() });
                Ok(json!({ "handle": handle }))
            }
            Route::List { .. } => {
                let handles: Vec<String> =
                    self.containers.lock().unwrap().keys().cloned().collect();
                Ok(json!({ "handles": handles }))
            }
            Route::Info { handle } => {
                let containers = self.containers.lock().unwrap();
                if containers.contains_key(&handle) {
                    Ok(json!({ "state": "active" }))
                } else {
                    Err(Self::not_found())
                }
            }
            Route::Destroy { handle } => {
                let mut containers = self.containers.lock().unwrap();
                if containers.remove(&handle).is_some() {
                    Ok(Value::Null)
                } else {
                    Err(Self::not_found())
                }
            }
            Route::Stop { handle } => {
                self.stop_requests.lock().unwrap().push(handle);
                Ok(Value::Null)
            }
            Route::Properties { handle } => {
                let containers = self.containers.lock().unwrap();
                let container = containers.get(&handle).ok_or_else(Self::not_found)?;
                Ok(serde_json::to_value(&container.properties).unwrap())
            }
            Route::Property { handle, name } => {
                let containers = self.containers.lock().unwrap();
                let container = containers.get(&handle).ok_or_else(Self::not_found)?;
                match container.properties.get(&name) {
                    Some(value) => Ok(json!({ "value": value })),
                    None => Err(Self::not_found()),
                }
            }
            Route::SetProperty { handle, name } => {
                let value = body
                    .as_ref()
                    .and_then(|b| b["value"].as_str())
                    .unwrap_or_default()
                    .to_string();
                let mut containers = self.containers.lock().unwrap();
                let container = containers.get_mut(&handle).ok_or_else(Self::not_found)?;
                container.properties.insert(name, value);
                Ok(Value::Null)
            }
            Route::RemoveProperty { handle, name } => {
                let mut containers = self.containers.lock().unwrap();
                let container = containers.get_mut(&handle).ok_or_else(Self::not_found)?;
                container.properties.remove(&name);
                Ok(Value::Null)
            }
            other => panic!("request not supported by fake backend: {other:?}"),
        }
    }

    async fn stream_in(&self, _route: Route, _content: ByteStream) -> ClientResult<()> {
        panic!("container stream_in not supported by fake backend");
    }

    async fn stream_out(&self, _route: Route) -> ClientResult<ByteStream> {
        panic!("container stream_out not supported by fake backend");
    }

    async fn hijack(&self, route: Route, body: Option<Value>) -> ClientResult<HijackedConn> {
        match route {
            Route::Run { handle } => {
                if !self.containers.lock().unwrap().contains_key(&handle) {
                    return Err(Self::not_found());
                }
                let spec = body.unwrap_or(Value::Null);
                self.run_specs.lock().unwrap().push(spec.clone());
                let path = spec["path"].as_str().unwrap_or_default().to_string();
                let script = self
                    .scripts
                    .lock()
                    .unwrap()
                    .get(&path)
                    .cloned()
                    .unwrap_or(ProcessScript { exit_status: Some(0), stdout: Vec::new() });

                let pid = match spec["id"].as_str() {
                    Some(id) => id.to_string(),
                    None => {
                        let mut next = self.next_pid.lock().unwrap();
                        *next += 1;
                        format!("p-{next}")
                    }
                };
                self.pending_stdout.lock().unwrap().insert(pid.clone(), script.stdout.clone());

                let (conn, server_end) = pipe();
                let header_pid = pid.clone();
                tokio::spawn(async move {
                    let (read, mut write) = tokio::io::split(server_end);
                    send(
                        &mut write,
                        &Envelope {
                            process_id: Some(header_pid.clone()),
                            stream_id: Some(header_pid),
                            ..Default::default()
                        },
                    )
                    .await;
                    match script.exit_status {
                        Some(status) => {
                            send(
                                &mut write,
                                &Envelope { exit_status: Some(status), ..Default::default() },
                            )
                            .await;
                        }
                        None => {
                            // Hold the process until a signal arrives.
                            let mut reader = EnvelopeReader::new(read);
                            while let Ok(Some(envelope)) = reader.next().await {
                                if let Some(signal) = envelope.signal {
                                    send(
                                        &mut write,
                                        &Envelope {
                                            exit_status: Some(128 + signal),
                                            ..Default::default()
                                        },
                                    )
                                    .await;
                                    break;
                                }
                            }
                        }
                    }
                    let _ = write.shutdown().await;
                });
                Ok(conn)
            }
            Route::Stdout { process_id, .. } => {
                let bytes = self
                    .pending_stdout
                    .lock()
                    .unwrap()
                    .get(&process_id)
                    .cloned()
                    .unwrap_or_default();
                let (conn, mut server_end) = pipe();
                tokio::spawn(async move {
                    let _ = server_end.write_all(&bytes).await;
                    let _ = server_end.shutdown().await;
                });
                Ok(conn)
            }
            Route::Stderr { .. } => {
                let (conn, mut server_end) = pipe();
                tokio::spawn(async move {
                    let _ = server_end.shutdown().await;
                });
                Ok(conn)
            }
            Route::Attach { .. } => Err(ClientError::Backend {
                status: 500,
                message: "attach not scripted".into(),
            }),
            other => panic!("hijack not supported by fake backend: {other:?}"),
        }
    }
}

/// [`Backends`] wired to in-process fakes per worker name.
#[derive(Default)]
pub struct FakeBackends {
    entries: Mutex<HashMap<String, (Arc<FakeContainerBackend>, Arc<InMemoryVolumeBackend>)>>,
}

impl Backends for FakeBackends {
    fn container_client(&self, worker: &WorkerRecord) -> buildfleet_worker::Result<Client> {
        let entries = self.entries.lock().unwrap();
        let (containers, _) = entries
            .get(&worker.name)
            .unwrap_or_else(|| panic!("no fake backends for worker '{}'", worker.name));
        Ok(Client::new(containers.clone()))
    }

    fn volume_backend(&self, worker: &WorkerRecord) -> Arc<dyn VolumeBackend> {
        let entries = self.entries.lock().unwrap();
        let (_, volumes) = entries
            .get(&worker.name)
            .unwrap_or_else(|| panic!("no fake backends for worker '{}'", worker.name));
        volumes.clone()
    }
}

/// AsyncWrite sink collecting everything written into a shared buffer.
pub struct CaptureSink(pub Arc<Mutex<Vec<u8>>>);

impl CaptureSink {
    pub fn new() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        (Self(buffer.clone()), buffer)
    }
}

impl tokio::io::AsyncWrite for CaptureSink {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

pub fn worker_record(name: &str) -> WorkerRecord {
    WorkerRecord {
        name: name.into(),
        container_backend_url: format!("http://{name}:7777"),
        volume_backend_url: format!("http://{name}:7788"),
        version: Some("2.3.1".into()),
        state: WorkerState::Running,
        platform: "linux".into(),
        tags: Vec::new(),
        team_id: None,
        resource_types: Vec::new(),
        active_containers: 0,
        active_volumes: 0,
        ephemeral: false,
        start_time: Utc::now(),
        http_proxy_url: None,
        https_proxy_url: None,
        no_proxy: None,
        certs_path: None,
    }
}

/// A whole in-process fleet: registry plus per-worker fake backends.
pub struct TestFleet {
    pub registry: Arc<InMemoryRegistry>,
    pub backends: Arc<FakeBackends>,
}

impl TestFleet {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(InMemoryRegistry::new()),
            backends: Arc::new(FakeBackends::default()),
        }
    }

    /// Registers a worker and its fakes; the record can be customized first.
    pub fn add_worker(
        &self,
        record: WorkerRecord,
    ) -> (Arc<FakeContainerBackend>, Arc<InMemoryVolumeBackend>) {
        let containers = FakeContainerBackend::new();
        let volumes = Arc::new(InMemoryVolumeBackend::new());
        self.backends
            .entries
            .lock()
            .unwrap()
            .insert(record.name.clone(), (containers.clone(), volumes.clone()));
        self.registry.insert_worker(record);
        (containers, volumes)
    }

    pub async fn worker(&self, name: &str) -> Worker {
        let record = self.registry.find_worker(name).await.unwrap().unwrap();
        Worker::new(record, self.registry.clone(), self.backends.clone()).unwrap()
    }

    pub fn pool(&self) -> Pool {
        Pool::new(self.registry.clone(), self.backends.clone())
    }
}

/// Seeds a created artifact volume on a worker's backend and registry,
/// returning its handle.
pub async fn seed_artifact_volume(
    fleet: &TestFleet,
    worker: &str,
    volumes: &InMemoryVolumeBackend,
    team_id: i64,
    files: Vec<(&str, &[u8])>,
) -> String {
    static SEED: std::sync::atomic::AtomicI64 = std::sync::atomic::AtomicI64::new(0);
    let n = SEED.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let row = fleet
        .registry
        .create_container_volume(team_id, worker, -1 - n, &format!("/artifact-seed/{n}"))
        .await
        .unwrap();
    volumes
        .create_volume(
            &row.handle,
            &buildfleet_volumes::VolumeSpec::new(buildfleet_volumes::VolumeStrategy::Empty, false),
        )
        .await
        .unwrap();
    volumes.put_files(&row.handle, files);
    fleet.registry.volume_created(row.id).await.unwrap();
    row.handle
}
