// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker-level integration tests: find-or-create, mounts, images, caches,
//! processes. Everything runs against in-process registry and backends.

mod common;

use buildfleet_registry::{
    ContainerMetadata, ContainerState, FixedOwner, Registry, VolumeState,
};
use buildfleet_sandbox::{ProcessIo, ProcessSpec, Route, Transport};
use buildfleet_volumes::VolumeBackend;
use buildfleet_worker::{
    CERTS_PATH, ContainerSpec, ImageSource, InputSpec, OutputSpec, SCRATCH_PATH, VolumeRef,
    WorkerError,
};
use common::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn owner(key: &str) -> FixedOwner {
    FixedOwner(key.to_string())
}

fn task_metadata() -> ContainerMetadata {
    ContainerMetadata {
        kind: "task".into(),
        step_name: "unit".into(),
        working_directory: "/tmp/build".into(),
        user: String::new(),
    }
}

fn url_spec(team_id: i64) -> ContainerSpec {
    ContainerSpec::new(
        team_id,
        ImageSource::Url { url: "raw:///images/base/rootfs".into() },
        "/tmp/build",
    )
}

fn mount_paths(container: &buildfleet_worker::Container) -> Vec<String> {
    container.mounts().iter().map(|m| m.destination.clone()).collect()
}

#[tokio::test]
async fn find_or_create_builds_container_and_marks_row_created() {
    let fleet = TestFleet::new();
    let (containers, _) = fleet.add_worker(worker_record("w1"));
    let worker = fleet.worker("w1").await;

    let container = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &url_spec(1))
        .await
        .unwrap();

    let rows = fleet.registry.container_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].state, ContainerState::Created);
    assert_eq!(rows[0].handle, container.handle());
    assert_eq!(containers.container_count(), 1);

    // scratch plus the working directory, sorted by destination
    assert_eq!(mount_paths(&container), vec![SCRATCH_PATH.to_string(), "/tmp/build".to_string()]);

    let wire = containers.container_spec(container.handle()).unwrap();
    assert_eq!(wire["rootfs"], "raw:///images/base/rootfs");
    assert_eq!(wire["privileged"], false);
    assert_eq!(wire["bind_mounts"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn same_owner_returns_the_existing_container() {
    let fleet = TestFleet::new();
    let (containers, _) = fleet.add_worker(worker_record("w1"));
    let worker = fleet.worker("w1").await;

    let first = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &url_spec(1))
        .await
        .unwrap();
    let second = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &url_spec(1))
        .await
        .unwrap();

    assert_eq!(first.handle(), second.handle());
    assert_eq!(fleet.registry.container_rows().len(), 1);
    assert_eq!(containers.container_count(), 1);
}

#[tokio::test]
async fn concurrent_find_or_create_converges_on_one_container() {
    let fleet = TestFleet::new();
    let (containers, _) = fleet.add_worker(worker_record("w1"));
    let worker_a = fleet.worker("w1").await;
    let worker_b = fleet.worker("w1").await;

    let owner_ref = owner("build-1");
    let spec = url_spec(1);
    let (a, b) = tokio::join!(
        worker_a.find_or_create_container(&owner_ref, task_metadata(), &spec),
        worker_b.find_or_create_container(&owner_ref, task_metadata(), &spec),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(a.handle(), b.handle());
    assert_eq!(fleet.registry.container_rows().len(), 1);
    assert_eq!(fleet.registry.container_rows()[0].state, ContainerState::Created);
    assert_eq!(containers.container_count(), 1);
}

#[tokio::test]
async fn mounts_cover_inputs_outputs_caches_and_workdir_once_each() {
    let fleet = TestFleet::new();
    let (_, volumes) = fleet.add_worker(worker_record("w1"));
    let worker = fleet.worker("w1").await;

    let in1 = seed_artifact_volume(&fleet, "w1", &volumes, 1, vec![("a", b"1")]).await;
    let in2 = seed_artifact_volume(&fleet, "w1", &volumes, 1, vec![("b", b"2")]).await;

    let mut spec = url_spec(1);
    spec.inputs = vec![
        InputSpec { artifact: VolumeRef::new(in1), destination: "/tmp/build/in1".into() },
        InputSpec { artifact: VolumeRef::new(in2), destination: "/in2".into() },
    ];
    spec.outputs = vec![OutputSpec { name: "out".into(), destination: "out".into() }];
    spec.caches = vec!["gopath".into()];
    spec.job_id = Some(3);

    let container = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &spec)
        .await
        .unwrap();

    assert_eq!(
        mount_paths(&container),
        vec![
            "/in2".to_string(),
            SCRATCH_PATH.to_string(),
            "/tmp/build".to_string(),
            "/tmp/build/gopath".to_string(),
            "/tmp/build/in1".to_string(),
            "/tmp/build/out".to_string(),
        ]
    );
}

#[tokio::test]
async fn duplicate_input_destinations_fail_the_build() {
    let fleet = TestFleet::new();
    let (_, volumes) = fleet.add_worker(worker_record("w1"));
    let worker = fleet.worker("w1").await;

    let in1 = seed_artifact_volume(&fleet, "w1", &volumes, 1, vec![("a", b"1")]).await;
    let in2 = seed_artifact_volume(&fleet, "w1", &volumes, 1, vec![("b", b"2")]).await;

    let mut spec = url_spec(1);
    spec.inputs = vec![
        InputSpec { artifact: VolumeRef::new(in1), destination: "/dup".into() },
        InputSpec { artifact: VolumeRef::new(in2), destination: "/dup/".into() },
    ];

    let err = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &spec)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::DuplicateMountPath { path } if path == "/dup"));

    // the half-built container must never be found again
    assert_eq!(fleet.registry.container_rows()[0].state, ContainerState::Failed);
}

#[tokio::test]
async fn output_on_an_input_destination_reuses_the_input_volume() {
    let fleet = TestFleet::new();
    let (_, volumes) = fleet.add_worker(worker_record("w1"));
    let worker = fleet.worker("w1").await;

    let artifact = seed_artifact_volume(&fleet, "w1", &volumes, 1, vec![("src.c", b"int")]).await;

    let mut spec = url_spec(1);
    spec.inputs = vec![InputSpec {
        artifact: VolumeRef::new(artifact.clone()),
        destination: "/tmp/build/src".into(),
    }];
    spec.outputs = vec![OutputSpec { name: "src".into(), destination: "src".into() }];

    let container = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &spec)
        .await
        .unwrap();

    let shared: Vec<_> = container
        .mounts()
        .iter()
        .filter(|m| m.destination == "/tmp/build/src")
        .collect();
    assert_eq!(shared.len(), 1);
    // the shared volume is the input's copy-on-write child, not a new empty one
    assert_eq!(shared[0].volume.row().parent_handle.as_deref(), Some(artifact.as_str()));
}

#[tokio::test]
async fn local_inputs_clone_and_remote_inputs_stream() {
    let fleet = TestFleet::new();
    let (_, w1_volumes) = fleet.add_worker(worker_record("w1"));
    let (_, w2_volumes) = fleet.add_worker(worker_record("w2"));
    let worker = fleet.worker("w1").await;

    let remote = seed_artifact_volume(&fleet, "w2", &w2_volumes, 1, vec![("file1", b"content")]).await;
    let local = seed_artifact_volume(&fleet, "w1", &w1_volumes, 1, vec![("file2", b"here")]).await;

    let mut spec = url_spec(1);
    spec.inputs = vec![
        InputSpec { artifact: VolumeRef::new(remote), destination: "/in".into() },
        InputSpec { artifact: VolumeRef::new(local.clone()), destination: "/in2".into() },
    ];

    let container = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &spec)
        .await
        .unwrap();

    let streamed = container.mounts().iter().find(|m| m.destination == "/in").unwrap();
    // fetched into a fresh local volume, byte for byte
    assert_eq!(streamed.volume.row().parent_handle, None);
    assert_eq!(
        w1_volumes.files(streamed.volume.handle()).unwrap()["file1"],
        b"content"
    );

    let cloned = container.mounts().iter().find(|m| m.destination == "/in2").unwrap();
    assert_eq!(cloned.volume.row().parent_handle.as_deref(), Some(local.as_str()));
    assert_eq!(w1_volumes.files(cloned.volume.handle()).unwrap()["file2"], b"here");
}

#[tokio::test]
async fn missing_artifact_fails_the_build() {
    let fleet = TestFleet::new();
    fleet.add_worker(worker_record("w1"));
    let worker = fleet.worker("w1").await;

    let mut spec = url_spec(1);
    spec.inputs =
        vec![InputSpec { artifact: VolumeRef::new("no-such"), destination: "/in".into() }];

    let err = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &spec)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::ArtifactNotFound { handle } if handle == "no-such"));
}

#[tokio::test]
async fn created_row_without_backend_container_is_a_hard_error() {
    let fleet = TestFleet::new();
    fleet.add_worker(worker_record("w1"));
    let worker = fleet.worker("w1").await;

    let row = fleet
        .registry
        .create_container("w1", &owner("build-1"), task_metadata())
        .await
        .unwrap();
    fleet.registry.container_created(row.id).await.unwrap();

    let err = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &url_spec(1))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::ContainerMissingFromWorker { .. }));

    // never silently recreated: state stays created for reconciliation
    assert_eq!(fleet.registry.container_rows()[0].state, ContainerState::Created);
}

#[tokio::test]
async fn creating_row_with_live_backend_container_attaches() {
    let fleet = TestFleet::new();
    let (containers, _) = fleet.add_worker(worker_record("w1"));
    let worker = fleet.worker("w1").await;

    let row = fleet
        .registry
        .create_container("w1", &owner("build-1"), task_metadata())
        .await
        .unwrap();
    containers
        .request(Route::Create, Some(json!({ "handle": row.handle })))
        .await
        .unwrap();

    let container = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &url_spec(1))
        .await
        .unwrap();

    assert_eq!(container.handle(), row.handle);
    assert_eq!(fleet.registry.container_rows()[0].state, ContainerState::Created);
    assert_eq!(containers.container_count(), 1);
}

#[tokio::test]
async fn image_volume_supplies_rootfs_env_and_user() {
    let fleet = TestFleet::new();
    let mut record = worker_record("w1");
    record.http_proxy_url = Some("http://proxy:3128".into());
    let (containers, volumes) = fleet.add_worker(record);
    let worker = fleet.worker("w1").await;

    let image = seed_artifact_volume(
        &fleet,
        "w1",
        &volumes,
        1,
        vec![
            ("metadata.json", br#"{"env":["A=1","B=image"],"user":"builder"}"#),
            ("rootfs/bin/sh", b"\x7fELF"),
        ],
    )
    .await;

    let mut spec = ContainerSpec::new(1, ImageSource::Volume(VolumeRef::new(image)), "/tmp/build");
    spec.env = vec!["B=2".into()];

    let container = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &spec)
        .await
        .unwrap();

    let wire = containers.container_spec(container.handle()).unwrap();
    let rootfs = wire["rootfs"].as_str().unwrap();
    assert!(rootfs.starts_with("raw://"), "rootfs should address the image volume: {rootfs}");
    assert!(rootfs.ends_with("/rootfs"));
    assert_eq!(wire["env"], json!(["A=1", "B=2", "http_proxy=http://proxy:3128"]));
    assert_eq!(wire["properties"]["user"], "builder");

    // the image volume backs the rootfs; it is not in the mount set
    assert_eq!(mount_paths(&container), vec![SCRATCH_PATH.to_string(), "/tmp/build".to_string()]);
}

#[tokio::test]
async fn remote_image_volume_is_fetched_before_use() {
    let fleet = TestFleet::new();
    let (containers, w1_volumes) = fleet.add_worker(worker_record("w1"));
    let (_, w2_volumes) = fleet.add_worker(worker_record("w2"));
    let worker = fleet.worker("w1").await;

    let image = seed_artifact_volume(
        &fleet,
        "w2",
        &w2_volumes,
        1,
        vec![("metadata.json", br#"{"user":"nobody"}"#)],
    )
    .await;

    let spec = ContainerSpec::new(1, ImageSource::Volume(VolumeRef::new(image)), "/tmp/build");
    let container = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &spec)
        .await
        .unwrap();

    let wire = containers.container_spec(container.handle()).unwrap();
    assert_eq!(wire["properties"]["user"], "nobody");

    // the fetched copy lives on this worker now
    let local_image = fleet
        .registry
        .volume_rows()
        .into_iter()
        .find(|row| row.worker_name == "w1" && row.mount_path.as_deref() == Some("/image"))
        .unwrap();
    assert_eq!(local_image.state, VolumeState::Created);
    assert!(w1_volumes.files(&local_image.handle).unwrap().contains_key("metadata.json"));
}

#[tokio::test]
async fn malformed_image_metadata_names_the_volume() {
    let fleet = TestFleet::new();
    let (_, volumes) = fleet.add_worker(worker_record("w1"));
    let worker = fleet.worker("w1").await;

    let image =
        seed_artifact_volume(&fleet, "w1", &volumes, 1, vec![("metadata.json", b"not json")]).await;

    let spec = ContainerSpec::new(1, ImageSource::Volume(VolumeRef::new(image)), "/tmp/build");
    let err = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &spec)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::MalformedImageMetadata { .. }));
}

#[tokio::test]
async fn base_resource_type_imports_once_and_clones_per_container() {
    let fleet = TestFleet::new();
    let mut record = worker_record("w1");
    record.resource_types = vec![buildfleet_registry::BaseResourceType {
        name: "git".into(),
        image_path: "/opt/resources/git".into(),
        privileged: true,
    }];
    let (containers, volumes) = fleet.add_worker(record);
    volumes.add_host_path("/opt/resources/git", vec![("rootfs/bin/git", b"bin")]);
    let worker = fleet.worker("w1").await;

    let spec = ContainerSpec::new(1, ImageSource::BaseResourceType { name: "git".into() }, "/tmp/build");
    let first = worker
        .find_or_create_container(&owner("check-1"), task_metadata(), &spec)
        .await
        .unwrap();
    let second = worker
        .find_or_create_container(&owner("check-2"), task_metadata(), &spec)
        .await
        .unwrap();

    let import = fleet
        .registry
        .find_base_resource_type_volume("w1", "git")
        .await
        .unwrap()
        .unwrap();
    let clones: Vec<_> = fleet
        .registry
        .volume_rows()
        .into_iter()
        .filter(|row| row.parent_handle.as_deref() == Some(import.handle.as_str()))
        .collect();
    assert_eq!(clones.len(), 2, "each container gets its own clone of one import");

    // declared privilege wins over the spec and reaches the backend
    for container in [&first, &second] {
        let wire = containers.container_spec(container.handle()).unwrap();
        assert_eq!(wire["privileged"], true);
    }
    for clone in &clones {
        assert!(volumes.files(&clone.handle).unwrap().contains_key("rootfs/bin/git"));
    }
}

#[tokio::test]
async fn unknown_base_resource_type_is_rejected() {
    let fleet = TestFleet::new();
    fleet.add_worker(worker_record("w1"));
    let worker = fleet.worker("w1").await;

    let spec = ContainerSpec::new(1, ImageSource::BaseResourceType { name: "svn".into() }, "/");
    let err = worker
        .find_or_create_container(&owner("check-1"), task_metadata(), &spec)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::BaseResourceTypeNotFound { name, .. } if name == "svn"));
}

#[tokio::test]
async fn privilege_reaches_every_volume_except_certs() {
    let fleet = TestFleet::new();
    let mut record = worker_record("w1");
    record.certs_path = Some("/usr/share/certs".into());
    let (containers, volumes) = fleet.add_worker(record);
    volumes.add_host_path("/usr/share/certs", vec![("ca.pem", b"PEM")]);
    let worker = fleet.worker("w1").await;

    let mut spec = url_spec(1);
    spec.privileged = true;
    spec.certs_bind_mount = true;

    let container = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &spec)
        .await
        .unwrap();

    for mount in container.mounts() {
        assert!(
            mount.volume.get_privileged().await.unwrap(),
            "mount at {} should be privileged",
            mount.destination
        );
    }

    let certs = fleet.registry.find_resource_certs_volume("w1").await.unwrap().unwrap();
    assert!(!volumes.get_privileged(&certs.handle).await.unwrap());

    // certs ride along as a read-only bind mount, outside the mount set
    assert!(!mount_paths(&container).contains(&CERTS_PATH.to_string()));
    let wire = containers.container_spec(container.handle()).unwrap();
    let certs_bind = wire["bind_mounts"]
        .as_array()
        .unwrap()
        .iter()
        .find(|b| b["dst_path"] == CERTS_PATH)
        .expect("certs bind mount present");
    assert_eq!(certs_bind["mode"], "read_only");
}

#[tokio::test]
async fn certs_mount_without_a_configured_path_fails() {
    let fleet = TestFleet::new();
    fleet.add_worker(worker_record("w1"));
    let worker = fleet.worker("w1").await;

    let mut spec = url_spec(1);
    spec.certs_bind_mount = true;

    let err = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &spec)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::CertsPathNotConfigured { .. }));
}

#[tokio::test]
async fn task_caches_share_a_base_through_copy_on_write() {
    let fleet = TestFleet::new();
    fleet.add_worker(worker_record("w1"));
    let worker = fleet.worker("w1").await;

    let mut spec = url_spec(1);
    spec.caches = vec!["gopath".into()];
    spec.job_id = Some(7);

    let first = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &spec)
        .await
        .unwrap();
    let base_handle = first
        .mounts()
        .iter()
        .find(|m| m.destination == "/tmp/build/gopath")
        .unwrap()
        .volume
        .handle()
        .to_string();

    // the first build's volume became the base for the cache key
    let base = fleet
        .registry
        .find_task_cache_volume(1, "w1", 7, "unit", "/tmp/build/gopath")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(base.handle, base_handle);

    let second = worker
        .find_or_create_container(&owner("build-2"), task_metadata(), &spec)
        .await
        .unwrap();
    let hit = second
        .mounts()
        .iter()
        .find(|m| m.destination == "/tmp/build/gopath")
        .unwrap();
    assert_ne!(hit.volume.handle(), base_handle);
    assert_eq!(hit.volume.row().parent_handle.as_deref(), Some(base_handle.as_str()));
}

#[tokio::test]
async fn caches_without_a_job_stay_isolated() {
    let fleet = TestFleet::new();
    fleet.add_worker(worker_record("w1"));
    let worker = fleet.worker("w1").await;

    let mut spec = url_spec(1);
    spec.caches = vec!["gopath".into()];

    let container = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &spec)
        .await
        .unwrap();
    let mount = container
        .mounts()
        .iter()
        .find(|m| m.destination == "/tmp/build/gopath")
        .unwrap();
    assert_eq!(mount.volume.row().parent_handle, None);
    assert_eq!(
        fleet.registry.find_task_cache_volume(1, "w1", 0, "unit", "/tmp/build/gopath").await.unwrap(),
        None
    );
}

#[tokio::test]
async fn run_persists_the_exit_status_and_attach_short_circuits() {
    let fleet = TestFleet::new();
    let (containers, _) = fleet.add_worker(worker_record("w1"));
    let worker = fleet.worker("w1").await;

    let container = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &url_spec(1))
        .await
        .unwrap();

    containers.script_process("echo", ProcessScript { exit_status: Some(0), stdout: b"hello\n".to_vec() });
    containers.set_container_property(container.handle(), "user", "builder");

    let (sink, captured) = CaptureSink::new();
    let spec = ProcessSpec {
        id: Some("p-1".into()),
        path: "echo".into(),
        args: vec!["hello".into()],
        ..Default::default()
    };
    let io = ProcessIo { stdin: None, stdout: Some(Box::new(sink)), stderr: None };

    let mut process = container.run(spec, io, CancellationToken::new()).await.unwrap();
    assert_eq!(process.wait().await.unwrap(), 0);
    assert_eq!(&*captured.lock().unwrap(), b"hello\n");

    // the empty user fell back to the container's "user" property
    let run_spec = containers.run_specs.lock().unwrap().last().cloned().unwrap();
    assert_eq!(run_spec["user"], "builder");
    assert_eq!(run_spec["dir"], "/tmp/build");

    assert_eq!(
        containers.container_property(container.handle(), "buildfleet:exit-status:p-1"),
        Some("0".to_string())
    );

    // the fake backend refuses attach connections, so a successful reattach
    // proves the persisted status short-circuited it
    let mut attached = container
        .attach("p-1", ProcessIo::none(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(attached.wait().await.unwrap(), 0);
}

#[tokio::test]
async fn attach_reads_a_previously_persisted_exit_status() {
    let fleet = TestFleet::new();
    let (containers, _) = fleet.add_worker(worker_record("w1"));
    let worker = fleet.worker("w1").await;

    let container = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &url_spec(1))
        .await
        .unwrap();
    containers.set_container_property(container.handle(), "buildfleet:exit-status:p-9", "7");

    let mut process = container
        .attach("p-9", ProcessIo::none(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(process.wait().await.unwrap(), 7);
}

#[tokio::test]
async fn signaled_processes_report_the_signal_exit_code() {
    let fleet = TestFleet::new();
    let (containers, _) = fleet.add_worker(worker_record("w1"));
    let worker = fleet.worker("w1").await;

    let container = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &url_spec(1))
        .await
        .unwrap();
    containers.script_process("sleep", ProcessScript { exit_status: None, stdout: Vec::new() });

    let spec = ProcessSpec { id: Some("p-2".into()), path: "sleep".into(), ..Default::default() };
    let mut process =
        container.run(spec, ProcessIo::none(), CancellationToken::new()).await.unwrap();
    process.signal(buildfleet_sandbox::Signal::Terminate).await.unwrap();
    assert_eq!(process.wait().await.unwrap(), 143);
}

#[tokio::test]
async fn lookup_container_reconstructs_the_mount_set() {
    let fleet = TestFleet::new();
    let (_, volumes) = fleet.add_worker(worker_record("w1"));
    let worker = fleet.worker("w1").await;

    let artifact = seed_artifact_volume(&fleet, "w1", &volumes, 1, vec![("a", b"1")]).await;
    let mut spec = url_spec(1);
    spec.inputs =
        vec![InputSpec { artifact: VolumeRef::new(artifact), destination: "/in".into() }];

    let created = worker
        .find_or_create_container(&owner("build-1"), task_metadata(), &spec)
        .await
        .unwrap();

    let found = worker.lookup_container(created.handle()).await.unwrap().unwrap();
    assert_eq!(mount_paths(&found), mount_paths(&created));

    assert!(worker.lookup_container("no-such-handle").await.unwrap().is_none());
}
