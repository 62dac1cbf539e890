// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Volume backend client for buildfleet.
//!
//! A volume is a content-addressable directory exposed by a worker's volume
//! backend. This crate covers the client-side contract only: the closed set
//! of creation strategies ([`VolumeStrategy`]), the backend API
//! ([`VolumeBackend`], with an HTTP implementation and an in-process one for
//! tests), and the [`Volume`] handle pairing a registry row with its live
//! backend counterpart.
//!
//! All content transfer round-trips through a gzip-compressed tar archive;
//! "stream a single file" is a stream-out narrowed to that file's path
//! followed by reading exactly one archive entry.

pub mod archive;
pub mod backend;
pub mod error;
pub mod memory;
pub mod strategy;
pub mod volume;

pub use self::backend::{BackendVolume, ByteStream, HttpVolumeBackend, VolumeBackend, VolumeSpec};
pub use self::error::{Result, VolumeError};
pub use self::memory::InMemoryVolumeBackend;
pub use self::strategy::VolumeStrategy;
pub use self::volume::Volume;
