// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The fleet-wide view: compatibility filtering, worker selection, volume
//! location.

use std::sync::Arc;

use buildfleet_registry::{ContainerOwner, Registry, WorkerRecord, WorkerState};
use buildfleet_volumes::Volume;
use tracing::{debug, instrument};

use crate::error::{Result, WorkerError};
use crate::placement::PlacementStrategy;
use crate::spec::WorkerSpec;
use crate::version::{Version, is_compatible};
use crate::worker::{Backends, Worker};

/// The worker pool.
pub struct Pool {
    registry: Arc<dyn Registry>,
    backends: Arc<dyn Backends>,
    /// Version the fleet must be compatible with; `None` disables the check.
    required_version: Option<Version>,
}

impl Pool {
    pub fn new(registry: Arc<dyn Registry>, backends: Arc<dyn Backends>) -> Self {
        Self { registry, backends, required_version: None }
    }

    pub fn with_required_version(mut self, version: Version) -> Self {
        self.required_version = Some(version);
        self
    }

    fn worker(&self, record: WorkerRecord) -> Result<Worker> {
        Worker::new(record, self.registry.clone(), self.backends.clone())
    }

    pub async fn find_worker(&self, name: &str) -> Result<Worker> {
        let record = self
            .registry
            .find_worker(name)
            .await?
            .ok_or_else(|| WorkerError::WorkerNotFound { name: name.to_string() })?;
        self.worker(record)
    }

    /// Sticky-then-select placement: the worker already holding a container
    /// for this owner is reused while it stays compatible, which is what
    /// makes reattaching to a long-running step possible. Otherwise the
    /// strategy picks from the compatible set.
    #[instrument(skip_all, fields(owner = %owner.key()))]
    pub async fn find_or_select_worker(
        &self,
        owner: &dyn ContainerOwner,
        spec: &WorkerSpec,
        strategy: &dyn PlacementStrategy,
    ) -> Result<Worker> {
        if let Some(name) = self.registry.find_worker_for_container_owner(owner).await? {
            if let Some(record) = self.registry.find_worker(&name).await? {
                if record.state == WorkerState::Running && self.compatible(&record, spec) {
                    debug!(worker = %record.name, "reusing worker already holding the owner's container");
                    return self.worker(record);
                }
            }
            debug!(worker = %name, "owner's previous worker is no longer eligible");
        }

        let candidates = self.compatible_workers(spec).await?;
        if candidates.is_empty() {
            return Err(WorkerError::NoCompatibleWorker { constraint: describe(spec) });
        }
        let mut ordered = candidates;
        strategy.order(&mut ordered);
        for candidate in ordered {
            if strategy.approve(&candidate) {
                debug!(worker = %candidate.name, strategy = strategy.name(), "worker selected");
                return self.worker(candidate);
            }
        }
        Err(WorkerError::StrategyRejectedAll { strategy: strategy.name() })
    }

    /// Running workers satisfying the spec. When any team-scoped worker
    /// qualifies, team-scoped workers shadow general ones entirely.
    pub async fn compatible_workers(&self, spec: &WorkerSpec) -> Result<Vec<WorkerRecord>> {
        let mut compatible: Vec<WorkerRecord> = self
            .registry
            .workers()
            .await?
            .into_iter()
            .filter(|worker| worker.state == WorkerState::Running && self.compatible(worker, spec))
            .collect();
        if compatible.iter().any(|worker| worker.team_id == Some(spec.team_id)) {
            compatible.retain(|worker| worker.team_id == Some(spec.team_id));
        }
        Ok(compatible)
    }

    fn compatible(&self, worker: &WorkerRecord, spec: &WorkerSpec) -> bool {
        if let Some(required) = &self.required_version {
            if !is_compatible(worker.version.as_deref(), required) {
                return false;
            }
        }
        if let Some(team) = worker.team_id {
            if team != spec.team_id {
                return false;
            }
        }
        if let Some(resource_type) = &spec.resource_type {
            if !worker.resource_types.iter().any(|t| t.name == *resource_type) {
                return false;
            }
        }
        if let Some(platform) = &spec.platform {
            if worker.platform != *platform {
                return false;
            }
        }
        if spec.tags.is_empty() {
            // A tagged worker only serves specs that ask for its tags.
            worker.tags.is_empty()
        } else {
            spec.tags.iter().all(|tag| worker.tags.contains(tag))
        }
    }

    /// Which worker holds a volume. When `requesting_worker` is given and
    /// already holds a local copy of the same resource-cache content, the
    /// local copy wins over a remote fetch.
    #[instrument(skip(self))]
    pub async fn locate_volume(
        &self,
        team_id: i64,
        handle: &str,
        requesting_worker: Option<&str>,
    ) -> Result<Option<(Worker, Volume)>> {
        if let Some(name) = requesting_worker {
            let worker = self.find_worker(name).await?;
            if let Some(volume) = worker.find_volume_for_artifact(handle).await? {
                return Ok(Some((worker, volume)));
            }
        }

        let Some(row) = self.registry.find_volume_by_handle(handle).await? else {
            return Ok(None);
        };
        if let Some(owner) = row.team_id {
            if owner != team_id {
                return Ok(None);
            }
        }
        let worker = self.find_worker(&row.worker_name).await?;
        match worker.lookup_volume(handle).await? {
            Some(volume) => Ok(Some((worker, volume))),
            None => Ok(None),
        }
    }
}

fn describe(spec: &WorkerSpec) -> String {
    let mut parts = vec![format!("team {}", spec.team_id)];
    if let Some(platform) = &spec.platform {
        parts.push(format!("platform '{platform}'"));
    }
    if !spec.tags.is_empty() {
        parts.push(format!("tags [{}]", spec.tags.join(", ")));
    }
    if let Some(resource_type) = &spec.resource_type {
        parts.push(format!("resource type '{resource_type}'"));
    }
    parts.join(", ")
}
