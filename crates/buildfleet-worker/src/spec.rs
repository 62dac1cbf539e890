// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Caller-facing specifications: what to run, and where it may run.

use serde::{Deserialize, Serialize};

/// Reference to a volume produced by an earlier step, possibly on another
/// worker. Resolution happens through the registry at container build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRef {
    pub handle: String,
}

impl VolumeRef {
    pub fn new(handle: impl Into<String>) -> Self {
        Self { handle: handle.into() }
    }
}

/// Where the container's root filesystem comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    /// Bare image URL passed to the container backend verbatim.
    Url { url: String },
    /// A base resource type declared by the worker; its host path is
    /// imported once per worker and cloned per container.
    BaseResourceType { name: String },
    /// Rootfs built by a previous step and stored as a volume.
    Volume(VolumeRef),
}

/// An artifact mounted into the container at a destination path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub artifact: VolumeRef,
    pub destination: String,
}

/// A named empty (or input-shared) volume the step writes results into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    pub destination: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLimits {
    pub cpu_shares: Option<u64>,
    pub memory_bytes: Option<u64>,
}

/// Fully resolved description of a desired container. Deciding *what* to run
/// happens upstream; by the time a spec reaches a worker every artifact
/// reference and path is concrete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub team_id: i64,
    pub image: ImageSource,
    /// Working directory of the step. Relative cache paths resolve against
    /// this, and a volume is mounted here if nothing else covers it.
    pub dir: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub limits: ContainerLimits,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    /// Cache paths, absolute or relative to `dir`, keyed for reuse by
    /// (job, step, path).
    #[serde(default)]
    pub caches: Vec<String>,
    /// Cache scope; caches are disabled without a job id.
    #[serde(default)]
    pub job_id: Option<i64>,
    /// Applies to `Url` and `Volume` images; `BaseResourceType` images use
    /// the privilege declared by the worker for that type.
    #[serde(default)]
    pub privileged: bool,
    /// Mount the worker's CA certificate bundle read-only.
    #[serde(default)]
    pub certs_bind_mount: bool,
}

impl ContainerSpec {
    pub fn new(team_id: i64, image: ImageSource, dir: impl Into<String>) -> Self {
        Self {
            team_id,
            image,
            dir: dir.into(),
            env: Vec::new(),
            limits: ContainerLimits::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            caches: Vec::new(),
            job_id: None,
            privileged: false,
            certs_bind_mount: false,
        }
    }
}

/// Placement requirements a worker must satisfy to host a spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub team_id: i64,
    /// Required platform; `None` accepts any.
    #[serde(default)]
    pub platform: Option<String>,
    /// Every requested tag must be present on the worker. A tagged worker
    /// never matches a spec requesting no tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Base resource type the worker must declare support for.
    #[serde(default)]
    pub resource_type: Option<String>,
}

/// Removes `.` segments and resolves `..` lexically, the way mount
/// destinations are compared. Does not touch the filesystem.
pub(crate) fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() && !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Resolves `path` against `dir` when relative, then cleans it.
pub(crate) fn resolve_path(dir: &str, path: &str) -> String {
    if path.starts_with('/') {
        clean_path(path)
    } else {
        clean_path(&format!("{dir}/{path}"))
    }
}
