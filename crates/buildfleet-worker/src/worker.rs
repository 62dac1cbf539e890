// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One worker: container find-or-create, image resolution, mount assembly.

use std::collections::HashMap;
use std::sync::Arc;

use buildfleet_registry::{
    ContainerMetadata, ContainerOwner, ContainerRow, ContainerState, Registry, RegistryError,
    VolumeRow, WorkerRecord, WorkerState,
};
use buildfleet_sandbox::{
    BindMount, BindMountMode, Client, ClientError, ContainerSpec as WireContainerSpec, Limits,
};
use buildfleet_volumes::{Volume, VolumeBackend, VolumeError, VolumeStrategy};
use tracing::{debug, info, instrument, warn};

use crate::container::{Container, VolumeMount};
use crate::error::{Result, WorkerError};
use crate::image::{
    FetchedImage, IMAGE_METADATA_FILE, IMAGE_MOUNT_PATH, ImageMetadata, merge_env, parse_metadata,
    rootfs_url,
};
use crate::spec::{ContainerSpec, ImageSource, clean_path, resolve_path};
use crate::volumes::{RowSource, VolumeFactory};

/// Destination of the per-container scratch volume.
pub const SCRATCH_PATH: &str = "/scratch";

/// Destination of the read-only CA certificate mount.
pub const CERTS_PATH: &str = "/etc/ssl/certs";

/// Resolves backend clients for worker records. The HTTP implementation
/// talks to the addresses a worker registered with; tests substitute
/// in-process backends.
pub trait Backends: Send + Sync {
    fn container_client(&self, worker: &WorkerRecord) -> Result<Client>;
    fn volume_backend(&self, worker: &WorkerRecord) -> Arc<dyn VolumeBackend>;
}

/// [`Backends`] over the workers' registered HTTP addresses.
pub struct HttpBackends;

impl Backends for HttpBackends {
    fn container_client(&self, worker: &WorkerRecord) -> Result<Client> {
        Ok(Client::http(&worker.container_backend_url)?)
    }

    fn volume_backend(&self, worker: &WorkerRecord) -> Arc<dyn VolumeBackend> {
        Arc::new(buildfleet_volumes::HttpVolumeBackend::new(&worker.volume_backend_url))
    }
}

/// One fleet node, as seen by the orchestration layer: its registry record
/// plus clients for its two backends.
pub struct Worker {
    record: WorkerRecord,
    registry: Arc<dyn Registry>,
    backends: Arc<dyn Backends>,
    client: Client,
    volumes: VolumeFactory,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(
        record: WorkerRecord,
        registry: Arc<dyn Registry>,
        backends: Arc<dyn Backends>,
    ) -> Result<Self> {
        let client = backends.container_client(&record)?;
        let volumes = VolumeFactory::new(
            registry.clone(),
            backends.volume_backend(&record),
            record.name.clone(),
        );
        Ok(Self { record, registry, backends, client, volumes })
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn record(&self) -> &WorkerRecord {
        &self.record
    }

    pub fn active_containers(&self) -> i64 {
        self.record.active_containers
    }

    pub fn active_volumes(&self) -> i64 {
        self.record.active_volumes
    }

    /// One-line description used in logs and placement errors.
    pub fn description(&self) -> String {
        format!(
            "worker '{}' (platform {}, version {}, {} active containers)",
            self.record.name,
            self.record.platform,
            self.record.version.as_deref().unwrap_or("unknown"),
            self.record.active_containers,
        )
    }

    /// The find-or-create state machine for containers.
    ///
    /// The registry row is the durable intent: it exists before any backend
    /// side effect, and a created row whose backend container is gone is a
    /// consistency violation surfaced to the caller, never repaired here.
    #[instrument(skip_all, fields(worker = %self.record.name, owner = %owner.key()))]
    pub async fn find_or_create_container(
        &self,
        owner: &dyn ContainerOwner,
        metadata: ContainerMetadata,
        spec: &ContainerSpec,
    ) -> Result<Container> {
        self.find_or_create_container_inner(owner, metadata, spec)
            .await
            .map_err(|err| self.classify(err))
    }

    async fn find_or_create_container_inner(
        &self,
        owner: &dyn ContainerOwner,
        metadata: ContainerMetadata,
        spec: &ContainerSpec,
    ) -> Result<Container> {
        let row = match self.registry.find_container(&self.record.name, owner).await? {
            Some(row) => row,
            None => {
                self.registry.create_container(&self.record.name, owner, metadata).await?
            }
        };

        if row.state == ContainerState::Created {
            if self.client.lookup(&row.handle).await?.is_none() {
                return Err(WorkerError::ContainerMissingFromWorker {
                    handle: row.handle,
                    worker: self.record.name.clone(),
                });
            }
            let mounts = self.mounts_for(&row).await?;
            return Ok(Container::new(row, mounts, self.client.clone()));
        }

        // Row is creating. A backend container under its handle means a
        // previous attempt (or a concurrent one) got that far already.
        if self.client.lookup(&row.handle).await?.is_some() {
            let mounts = self.mounts_for(&row).await?;
            let mut row = row;
            self.mark_created(&row).await?;
            row.state = ContainerState::Created;
            return Ok(Container::new(row, mounts, self.client.clone()));
        }

        self.build_container(row, spec).await
    }

    /// Looks a created container up by handle, reconstructing its mounts.
    pub async fn lookup_container(&self, handle: &str) -> Result<Option<Container>> {
        let Some(row) = self.registry.find_created_container_by_handle(handle).await? else {
            return Ok(None);
        };
        if row.worker_name != self.record.name {
            return Ok(None);
        }
        if self.client.lookup(&row.handle).await?.is_none() {
            return Err(WorkerError::ContainerMissingFromWorker {
                handle: row.handle,
                worker: self.record.name.clone(),
            });
        }
        let mounts = self.mounts_for(&row).await?;
        Ok(Some(Container::new(row, mounts, self.client.clone())))
    }

    /// Looks a created volume up by handle, if this worker holds it.
    pub async fn lookup_volume(&self, handle: &str) -> Result<Option<Volume>> {
        let Some(row) = self.registry.find_volume_by_handle(handle).await? else {
            return Ok(None);
        };
        if row.worker_name != self.record.name {
            return Ok(None);
        }
        Ok(Some(self.volumes.lookup_created(&row).await?))
    }

    /// Resolves an artifact to a volume usable from this worker, preferring
    /// a local copy of the same resource-cache content over the remote
    /// original.
    pub async fn find_volume_for_artifact(&self, handle: &str) -> Result<Option<Volume>> {
        let Some(row) = self.registry.find_volume_by_handle(handle).await? else {
            return Ok(None);
        };
        if row.worker_name == self.record.name {
            return Ok(Some(self.volumes.lookup_created(&row).await?));
        }
        if let Some(cache_key) = &row.resource_cache_key {
            if let Some(local) = self
                .registry
                .find_resource_cache_volume(&self.record.name, cache_key)
                .await?
            {
                debug!(handle, cache_key, "using local resource cache copy");
                return Ok(Some(self.volumes.lookup_created(&local).await?));
            }
        }
        Ok(None)
    }

    // --- container building ---

    async fn build_container(&self, row: ContainerRow, spec: &ContainerSpec) -> Result<Container> {
        match self.create_backend_container(&row, spec).await {
            Ok(container) => Ok(container),
            Err(err) => {
                // Terminal: a half-built container must never be found again.
                if let Err(mark_err) = self.registry.container_failed(row.id).await {
                    warn!(handle = %row.handle, error = %mark_err, "failed to mark container row failed");
                }
                Err(err)
            }
        }
    }

    async fn create_backend_container(
        &self,
        row: &ContainerRow,
        spec: &ContainerSpec,
    ) -> Result<Container> {
        let image = self.resolve_image(row, spec).await?;
        let mounts = self.create_mounts(row, spec, image.privileged).await?;

        let mut bind_mounts: Vec<BindMount> = mounts
            .iter()
            .map(|mount| BindMount {
                src_path: mount.volume.path().to_string(),
                dst_path: mount.destination.clone(),
                mode: BindMountMode::ReadWrite,
            })
            .collect();
        if spec.certs_bind_mount {
            let certs = self.certs_volume().await?;
            bind_mounts.push(BindMount {
                src_path: certs.path().to_string(),
                dst_path: CERTS_PATH.to_string(),
                mode: BindMountMode::ReadOnly,
            });
        }

        let mut properties = HashMap::new();
        if !image.metadata.user.is_empty() {
            properties.insert("user".to_string(), image.metadata.user.clone());
        }

        let wire = WireContainerSpec {
            handle: row.handle.clone(),
            rootfs: image.url.clone(),
            privileged: image.privileged,
            env: merge_env(&image.metadata.env, &spec.env, &self.record),
            bind_mounts,
            properties,
            limits: Some(Limits {
                cpu_shares: spec.limits.cpu_shares,
                memory_bytes: spec.limits.memory_bytes,
            }),
        };
        self.client.create(&wire).await?;
        self.mark_created(row).await?;
        info!(handle = %row.handle, rootfs = %image.url, "container created");

        let mut row = row.clone();
        row.state = ContainerState::Created;
        Ok(Container::new(row, mounts, self.client.clone()))
    }

    /// Creating -> created, tolerating a concurrent creator having advanced
    /// the row first; the loser of that race attaches rather than erroring.
    async fn mark_created(&self, row: &ContainerRow) -> Result<()> {
        match self.registry.container_created(row.id).await {
            Ok(()) => Ok(()),
            Err(RegistryError::InvalidStateTransition { .. }) => {
                debug!(handle = %row.handle, "container row already marked created");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn resolve_image(&self, row: &ContainerRow, spec: &ContainerSpec) -> Result<FetchedImage> {
        match &spec.image {
            ImageSource::Url { url } => Ok(FetchedImage {
                url: url.clone(),
                privileged: spec.privileged,
                metadata: ImageMetadata::default(),
            }),
            ImageSource::BaseResourceType { name } => {
                let declared = self
                    .record
                    .resource_types
                    .iter()
                    .find(|t| t.name == *name)
                    .ok_or_else(|| WorkerError::BaseResourceTypeNotFound {
                        worker: self.record.name.clone(),
                        name: name.clone(),
                    })?;
                let import = self
                    .volumes
                    .find_or_create(
                        RowSource::BaseResourceType { name },
                        VolumeStrategy::import(&declared.image_path),
                        declared.privileged,
                    )
                    .await?;
                let clone = self
                    .volumes
                    .find_or_create(
                        RowSource::Child {
                            parent: import.row(),
                            container_id: row.id,
                            mount_path: IMAGE_MOUNT_PATH,
                        },
                        import.cow_strategy(),
                        declared.privileged,
                    )
                    .await?;
                Ok(FetchedImage {
                    url: rootfs_url(&clone),
                    privileged: declared.privileged,
                    metadata: ImageMetadata::default(),
                })
            }
            ImageSource::Volume(reference) => {
                let artifact = self
                    .registry
                    .find_volume_by_handle(&reference.handle)
                    .await?
                    .ok_or_else(|| WorkerError::ArtifactNotFound {
                        handle: reference.handle.clone(),
                    })?;
                let image_volume = self
                    .materialize_artifact(&artifact, spec, row.id, IMAGE_MOUNT_PATH, spec.privileged)
                    .await?;
                let bytes = image_volume.stream_file(IMAGE_METADATA_FILE).await?;
                let metadata = parse_metadata(image_volume.handle(), &bytes)?;
                Ok(FetchedImage {
                    url: rootfs_url(&image_volume),
                    privileged: spec.privileged,
                    metadata,
                })
            }
        }
    }

    async fn create_mounts(
        &self,
        row: &ContainerRow,
        spec: &ContainerSpec,
        privileged: bool,
    ) -> Result<Vec<VolumeMount>> {
        let container_id = row.id;
        let dir = clean_path(&spec.dir);
        let mut mounts: Vec<VolumeMount> = Vec::new();

        let scratch = self
            .volumes
            .find_or_create(
                RowSource::Container {
                    team_id: spec.team_id,
                    container_id,
                    mount_path: SCRATCH_PATH,
                },
                VolumeStrategy::Empty,
                privileged,
            )
            .await?;
        mounts.push(VolumeMount { volume: scratch, destination: SCRATCH_PATH.to_string() });

        // Inputs fetch concurrently; one failed transfer fails the build.
        let input_futures = spec.inputs.iter().map(|input| {
            let destination = clean_path(&input.destination);
            async move {
                let artifact = self
                    .registry
                    .find_volume_by_handle(&input.artifact.handle)
                    .await?
                    .ok_or_else(|| WorkerError::ArtifactNotFound {
                        handle: input.artifact.handle.clone(),
                    })?;
                let volume = self
                    .materialize_artifact(&artifact, spec, container_id, &destination, privileged)
                    .await?;
                Ok::<_, WorkerError>(VolumeMount { volume, destination })
            }
        });
        for mount in futures::future::try_join_all(input_futures).await? {
            push_unique(&mut mounts, mount)?;
        }

        for output in &spec.outputs {
            let destination = resolve_path(&dir, &output.destination);
            // An output sharing a destination with an input reuses its volume.
            if mounts.iter().any(|m| m.destination == destination) {
                continue;
            }
            let volume = self
                .volumes
                .find_or_create(
                    RowSource::Container {
                        team_id: spec.team_id,
                        container_id,
                        mount_path: &destination,
                    },
                    VolumeStrategy::Empty,
                    privileged,
                )
                .await?;
            mounts.push(VolumeMount { volume, destination });
        }

        for cache in &spec.caches {
            let destination = resolve_path(&dir, cache);
            let volume = self
                .cache_volume(spec, row, container_id, &destination, privileged)
                .await?;
            push_unique(&mut mounts, VolumeMount { volume, destination })?;
        }

        if !dir.is_empty() && dir != "/" && !mounts.iter().any(|m| m.destination == dir) {
            let volume = self
                .volumes
                .find_or_create(
                    RowSource::Container {
                        team_id: spec.team_id,
                        container_id,
                        mount_path: &dir,
                    },
                    VolumeStrategy::Empty,
                    privileged,
                )
                .await?;
            mounts.push(VolumeMount { volume, destination: dir });
        }

        // Parents before children when the backend applies the mounts.
        mounts.sort_by(|a, b| a.destination.cmp(&b.destination));
        Ok(mounts)
    }

    /// A cached volume for (job, step, path) is cloned copy-on-write so
    /// concurrent builds never share a mutable cache; the first build of a
    /// key creates the empty volume that becomes the base for future hits.
    async fn cache_volume(
        &self,
        spec: &ContainerSpec,
        row: &ContainerRow,
        container_id: i64,
        destination: &str,
        privileged: bool,
    ) -> Result<Volume> {
        let Some(job_id) = spec.job_id else {
            return self
                .volumes
                .find_or_create(
                    RowSource::Container {
                        team_id: spec.team_id,
                        container_id,
                        mount_path: destination,
                    },
                    VolumeStrategy::Empty,
                    privileged,
                )
                .await;
        };
        let existing = self
            .registry
            .find_task_cache_volume(
                spec.team_id,
                &self.record.name,
                job_id,
                &row.metadata.step_name,
                destination,
            )
            .await?;
        match existing {
            Some(base) => {
                self.volumes
                    .find_or_create(
                        RowSource::Child {
                            parent: &base,
                            container_id,
                            mount_path: destination,
                        },
                        VolumeStrategy::CopyOnWrite { parent: base.handle.clone() },
                        privileged,
                    )
                    .await
            }
            None => {
                let volume = self
                    .volumes
                    .find_or_create(
                        RowSource::Container {
                            team_id: spec.team_id,
                            container_id,
                            mount_path: destination,
                        },
                        VolumeStrategy::Empty,
                        privileged,
                    )
                    .await?;
                self.registry
                    .initialize_task_cache(
                        volume.row().id,
                        job_id,
                        &row.metadata.step_name,
                        destination,
                    )
                    .await?;
                Ok(volume)
            }
        }
    }

    /// Local artifacts are cloned copy-on-write; remote ones are fetched by
    /// creating an empty local volume and streaming the source's bytes in.
    async fn materialize_artifact(
        &self,
        artifact: &VolumeRow,
        spec: &ContainerSpec,
        container_id: i64,
        destination: &str,
        privileged: bool,
    ) -> Result<Volume> {
        if artifact.worker_name == self.record.name {
            return self
                .volumes
                .find_or_create(
                    RowSource::Child { parent: artifact, container_id, mount_path: destination },
                    VolumeStrategy::CopyOnWrite { parent: artifact.handle.clone() },
                    privileged,
                )
                .await;
        }

        let local = self
            .volumes
            .find_or_create(
                RowSource::Container {
                    team_id: spec.team_id,
                    container_id,
                    mount_path: destination,
                },
                VolumeStrategy::Empty,
                privileged,
            )
            .await?;
        self.stream_artifact(artifact, &local).await?;
        Ok(local)
    }

    #[instrument(skip_all, fields(handle = %artifact.handle, from = %artifact.worker_name, to = %self.record.name))]
    async fn stream_artifact(&self, artifact: &VolumeRow, destination: &Volume) -> Result<()> {
        let source_record = self
            .registry
            .find_worker(&artifact.worker_name)
            .await?
            .ok_or_else(|| WorkerError::WorkerNotFound { name: artifact.worker_name.clone() })?;
        let source_backend = self.backends.volume_backend(&source_record);
        let live = source_backend
            .lookup_volume(&artifact.handle)
            .await?
            .ok_or_else(|| WorkerError::VolumeMissingFromWorker {
                handle: artifact.handle.clone(),
                worker: artifact.worker_name.clone(),
            })?;
        let source = Volume::new(artifact.clone(), live, source_backend);
        debug!("streaming volume between workers");
        let content = source.stream_out(".").await?;
        destination.stream_in(".", content).await?;
        Ok(())
    }

    /// The imported CA bundle volume. Never privileged, whatever the image.
    async fn certs_volume(&self) -> Result<Volume> {
        let Some(certs_path) = &self.record.certs_path else {
            return Err(WorkerError::CertsPathNotConfigured {
                worker: self.record.name.clone(),
            });
        };
        self.volumes
            .find_or_create(RowSource::Certs, VolumeStrategy::import(certs_path), false)
            .await
    }

    /// Reconstructs the mounts of an existing container from its created
    /// volume rows.
    async fn mounts_for(&self, row: &ContainerRow) -> Result<Vec<VolumeMount>> {
        let rows = self.registry.find_volumes_for_container(row.id).await?;
        let mut mounts = Vec::new();
        for volume_row in rows {
            let Some(path) = volume_row.mount_path.clone() else { continue };
            if path == IMAGE_MOUNT_PATH {
                continue;
            }
            let volume = self.volumes.lookup_created(&volume_row).await?;
            mounts.push(VolumeMount { volume, destination: path });
        }
        mounts.sort_by(|a, b| a.destination.cmp(&b.destination));
        Ok(mounts)
    }

    /// Backend failures against a worker that stopped heartbeating are a
    /// separate class: the caller should pick another worker, not retry
    /// this one.
    fn classify(&self, err: WorkerError) -> WorkerError {
        let network_failure = matches!(
            &err,
            WorkerError::Client(ClientError::Http(_) | ClientError::Io(_))
                | WorkerError::Volume(VolumeError::Http(_))
        );
        if network_failure && self.record.state != WorkerState::Running {
            return WorkerError::WorkerUnreachable {
                worker: self.record.name.clone(),
                state: format!("{:?}", self.record.state).to_lowercase(),
                details: err.to_string(),
            };
        }
        err
    }
}

fn push_unique(mounts: &mut Vec<VolumeMount>, mount: VolumeMount) -> Result<()> {
    if mounts.iter().any(|m| m.destination == mount.destination) {
        return Err(WorkerError::DuplicateMountPath { path: mount.destination });
    }
    mounts.push(mount);
    Ok(())
}
