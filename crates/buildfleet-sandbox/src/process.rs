// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote process handles and the hijacked session driver.
//!
//! A run or attach yields a [`Process`]. Its exit outcome is published once
//! through a watch channel, so `wait` can be called repeatedly and from
//! clones. Control traffic (stdin, tty, signal) shares one connection with
//! the server-to-client exit envelope; writes are serialized by a mutex so
//! envelope boundaries are never interleaved.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ClientResult, ProcessError};
use crate::protocol::{Envelope, EnvelopeReader, Route, StdStream, TtySpec};
use crate::transport::{HijackedConn, Transport};

/// Signals deliverable to a remote process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl Signal {
    fn number(self) -> i32 {
        match self {
            Signal::Terminate => 15,
            Signal::Kill => 9,
        }
    }
}

/// Caller-supplied stdio wiring for a process.
#[derive(Default)]
pub struct ProcessIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl ProcessIo {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Write side of the control connection, shared between the stdin pump and
/// the process handle.
struct ControlStream {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl ControlStream {
    async fn send(&self, envelope: &Envelope) -> Result<(), ProcessError> {
        let bytes = serde_json::to_vec(envelope)
            .map_err(|err| ProcessError::Write { details: err.to_string() })?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&bytes)
            .await
            .map_err(|err| ProcessError::Write { details: err.to_string() })?;
        writer
            .flush()
            .await
            .map_err(|err| ProcessError::Write { details: err.to_string() })
    }

    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

type ExitOutcome = Result<i32, ProcessError>;

/// Handle to a process running in a remote container.
#[derive(Clone)]
pub struct Process {
    id: String,
    control: Option<Arc<ControlStream>>,
    exit: watch::Receiver<Option<ExitOutcome>>,
}

impl Process {
    /// A process that already finished; used when a persisted exit status
    /// makes reattaching unnecessary.
    pub fn exited(id: impl Into<String>, status: i32) -> Self {
        // The receiver keeps the last value after the sender drops.
        let (_tx, rx) = watch::channel(Some(Ok(status)));
        Self { id: id.into(), control: None, exit: rx }
    }

    pub(crate) fn new(
        id: String,
        control: Option<Arc<ControlStream>>,
        exit: watch::Receiver<Option<ExitOutcome>>,
    ) -> Self {
        Self { id, control, exit }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resolves once the process exits, the session is canceled, or the
    /// control connection is severed.
    pub async fn wait(&mut self) -> Result<i32, ProcessError> {
        loop {
            if let Some(outcome) = self.exit.borrow_and_update().clone() {
                return outcome;
            }
            if self.exit.changed().await.is_err() {
                return Err(ProcessError::Disconnected);
            }
        }
    }

    pub async fn signal(&self, signal: Signal) -> Result<(), ProcessError> {
        let control = self.control.as_ref().ok_or(ProcessError::Disconnected)?;
        control
            .send(&Envelope { signal: Some(signal.number()), ..Default::default() })
            .await
    }

    pub async fn set_tty(&self, tty: TtySpec) -> Result<(), ProcessError> {
        let control = self.control.as_ref().ok_or(ProcessError::Disconnected)?;
        control.send(&Envelope { tty: Some(tty), ..Default::default() }).await
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("attached", &self.control.is_some())
            .finish()
    }
}

/// Drives a hijacked run/attach connection into a [`Process`].
///
/// The first envelope identifies the process and the stream id under which
/// stdout and stderr can be hijacked on their own connections. A failure to
/// open either stdio connection still yields a handle; the failure is
/// reported through `wait` and the session is torn down.
pub(crate) async fn stream_process(
    transport: Arc<dyn Transport>,
    handle: &str,
    conn: HijackedConn,
    mut io: ProcessIo,
    cancel: CancellationToken,
) -> ClientResult<Process> {
    let HijackedConn { read, write } = conn;
    let mut reader = EnvelopeReader::new(read);

    let first = reader.next().await?.ok_or_else(|| crate::error::ClientError::Protocol {
        payload: "connection closed before the process header envelope".to_string(),
    })?;
    let process_id = first.process_id.ok_or_else(|| crate::error::ClientError::Protocol {
        payload: "header envelope is missing process_id".to_string(),
    })?;
    let stream_id = first.stream_id.unwrap_or_default();
    debug!(%process_id, %stream_id, "process session established");

    let control = Arc::new(ControlStream { writer: Mutex::new(write) });
    let (exit_tx, exit_rx) = watch::channel(None);
    let process = Process::new(process_id.clone(), Some(control.clone()), exit_rx);

    if let Some(stdin) = io.stdin.take() {
        spawn_stdin_pump(stdin, control.clone(), cancel.clone());
    }

    let mut copiers: Vec<JoinHandle<()>> = Vec::new();
    let wants = [
        (io.stdout.take(), "stdout"),
        (io.stderr.take(), "stderr"),
    ];
    for (sink, name) in wants {
        let Some(sink) = sink else { continue };
        let route = match name {
            "stdout" => Route::Stdout {
                handle: handle.to_string(),
                process_id: process_id.clone(),
                stream_id: stream_id.clone(),
            },
            _ => Route::Stderr {
                handle: handle.to_string(),
                process_id: process_id.clone(),
                stream_id: stream_id.clone(),
            },
        };
        match transport.hijack(route, None).await {
            Ok(stdio_conn) => {
                copiers.push(spawn_stdio_copy(stdio_conn, sink, cancel.clone()));
            }
            Err(err) => {
                warn!(%process_id, stream = name, error = %err, "stdio hijack failed");
                for copier in copiers {
                    copier.abort();
                }
                control.shutdown().await;
                let _ = exit_tx.send(Some(Err(ProcessError::StreamSetup {
                    stream: name,
                    details: err.to_string(),
                })));
                return Ok(process);
            }
        }
    }

    let stop_handle = handle.to_string();
    tokio::spawn(async move {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                // Best-effort stop so the backend reaps the process.
                let _ = transport
                    .request(Route::Stop { handle: stop_handle }, Some(json!({ "kill": false })))
                    .await;
                Err(ProcessError::Canceled)
            }
            outcome = read_exit(&mut reader) => outcome,
        };
        for copier in copiers {
            let _ = copier.await;
        }
        control.shutdown().await;
        drop(reader);
        let _ = exit_tx.send(Some(outcome));
    });

    Ok(process)
}

async fn read_exit<R: AsyncRead + Unpin>(
    reader: &mut EnvelopeReader<R>,
) -> Result<i32, ProcessError> {
    loop {
        match reader.next().await {
            Ok(Some(envelope)) => {
                if let Some(message) = envelope.error {
                    return Err(ProcessError::Remote(message));
                }
                if let Some(status) = envelope.exit_status {
                    return Ok(status);
                }
            }
            Ok(None) => return Err(ProcessError::Disconnected),
            Err(err) => return Err(ProcessError::Decode { details: err.to_string() }),
        }
    }
}

fn spawn_stdin_pump(
    mut stdin: Box<dyn AsyncRead + Send + Unpin>,
    control: Arc<ControlStream>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return,
                read = stdin.read(&mut chunk) => read,
            };
            match read {
                Ok(0) => {
                    let _ = control
                        .send(&Envelope {
                            source: Some(StdStream::Stdin),
                            closed: Some(true),
                            ..Default::default()
                        })
                        .await;
                    return;
                }
                Ok(n) => {
                    let envelope = Envelope {
                        source: Some(StdStream::Stdin),
                        data: Some(BASE64.encode(&chunk[..n])),
                        ..Default::default()
                    };
                    if control.send(&envelope).await.is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    });
}

fn spawn_stdio_copy(
    conn: HijackedConn,
    mut sink: Box<dyn AsyncWrite + Send + Unpin>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let HijackedConn { mut read, write } = conn;
        // Closing our write side tells the backend this is receive-only.
        drop(write);
        tokio::select! {
            _ = cancel.cancelled() => {}
            result = tokio::io::copy(&mut read, &mut sink) => { let _ = result; }
        }
        let _ = sink.flush().await;
    })
}
