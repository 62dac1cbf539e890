// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker-pool orchestration for buildfleet.
//!
//! Ties the registry, volume backends and container backends together: the
//! [`Pool`] selects a compatible [`Worker`] for a spec, the worker drives
//! the container/volume find-or-create state machine (cloning or streaming
//! input volumes as needed), and the resulting [`Container`] runs processes
//! through the container backend protocol client.

pub mod container;
pub mod error;
pub mod image;
pub mod placement;
pub mod pool;
pub mod spec;
pub mod version;
pub mod worker;

mod volumes;

pub use container::{Container, ContainerProcess, VolumeMount};
pub use error::{Result, WorkerError};
pub use image::{FetchedImage, ImageMetadata};
pub use placement::{
    Chained, FewestActiveContainers, LimitActiveContainers, LimitActiveVolumes, PlacementStrategy,
    Random,
};
pub use pool::Pool;
pub use spec::{
    ContainerLimits, ContainerSpec, ImageSource, InputSpec, OutputSpec, VolumeRef, WorkerSpec,
};
pub use version::Version;
pub use worker::{Backends, CERTS_PATH, HttpBackends, SCRATCH_PATH, Worker};
