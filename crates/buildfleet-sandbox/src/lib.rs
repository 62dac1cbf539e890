// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container backend client for buildfleet.
//!
//! Speaks the backend's HTTP protocol: plain JSON request/response for
//! container lifecycle and properties, connection hijacking for process
//! stdio. See [`Client`] for the operation surface and [`Process`] for the
//! handle returned by run and attach.

pub mod client;
pub mod error;
pub mod process;
pub mod protocol;
pub mod transport;

pub use client::Client;
pub use error::{ClientError, ClientResult, ProcessError};
pub use process::{Process, ProcessIo, Signal};
pub use protocol::{
    BindMount, BindMountMode, Capacity, ContainerInfo, ContainerMetrics, ContainerSpec, Envelope,
    EnvelopeReader, Limits, ProcessSpec, Route, StdStream, TtySpec, WindowSize,
};
pub use transport::{ByteStream, HijackedConn, HttpTransport, Transport};
