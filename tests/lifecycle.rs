//! End to end lifecycle tests against the in-memory backend

use assert_matches::assert_matches;
use std::sync::Arc;
use std::time::Duration;
use storage_gateway::domain::ports::ExternalFile;
use storage_gateway::promoter::{naming, DEFAULT_PROMOTER_DIR};
use storage_gateway::protocols::{iscsi, nfs, nvmeof};
use storage_gateway::{
    Error, GatewayConfig, Iqn, Iscsi, MemoryBackend, Nfs, Nqn, Nvmeof, ResourceName,
    ResourceState, ServiceIp, ServiceState, StorageBackend, VolumeConfig,
};
use tokio_test::{assert_err, assert_ok};

fn fast_config() -> GatewayConfig {
    GatewayConfig {
        resource_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(10),
        stability_checks: 2,
        stability_interval: Duration::from_millis(5),
        ..Default::default()
    }
}

fn backend() -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::default())
}

fn iqn() -> Iqn {
    Iqn::new("iqn.2021-08.com.linbit:target1").unwrap()
}

fn ip(s: &str) -> ServiceIp {
    s.parse().unwrap()
}

fn target(size_kib: u64) -> iscsi::ResourceConfig {
    iscsi::ResourceConfig::new(iqn(), vec![ip("10.0.0.1/24")], vec![VolumeConfig::new(1, size_kib)])
}

fn volume_numbers<V: storage_gateway::domain::AsVolume>(volumes: &[V]) -> Vec<u32> {
    volumes.iter().map(|v| v.volume().number).collect()
}

// =============================================================================
// iSCSI
// =============================================================================

#[tokio::test]
async fn test_iscsi_create_starts_target() {
    let backend = backend();
    let gateway = Iscsi::new(backend.clone(), &fast_config());

    let created = gateway.create(target(1024 * 1024)).await.unwrap();

    assert_eq!(created.resource_group, "DfltRscGrp");
    assert_eq!(volume_numbers(&created.volumes), vec![1]);
    assert_eq!(created.status.service, ServiceState::Started);
    assert_eq!(created.status.state, ResourceState::OK);
    assert_eq!(created.status.primary, "node1");
    assert_eq!(created.status.nodes.len(), 2);
    assert!(created.status.volumes.iter().all(|v| v.number != 0));

    let path = naming::config_path(DEFAULT_PROMOTER_DIR, "iscsi-target1");
    let file = backend.get_external_file(&path).await.unwrap();
    let text = String::from_utf8(file.content).unwrap();
    assert!(text.contains(r#"id = "iscsi-target1""#));
    assert!(text.contains("ocf:heartbeat:iSCSILogicalUnit lu1"));
}

#[tokio::test]
async fn test_iscsi_create_is_idempotent() {
    let backend = backend();
    let gateway = Iscsi::new(backend.clone(), &fast_config());

    let first = gateway.create(target(1024)).await.unwrap();
    let second = gateway.create(target(1024)).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(backend.resource_definition_count().await, 1);
}

#[tokio::test]
async fn test_iscsi_create_incompatible() {
    let gateway = Iscsi::new(backend(), &fast_config());
    gateway.create(target(1024)).await.unwrap();

    assert_matches!(
        gateway.create(target(2048)).await,
        Err(Error::IncompatibleResource { id }) if id == "iscsi-target1"
    );

    let mut other_credentials = target(1024);
    other_credentials.username = "admin".into();
    other_credentials.password = "secret".into();
    assert_matches!(
        gateway.create(other_credentials).await,
        Err(Error::IncompatibleResource { .. })
    );
}

#[tokio::test]
async fn test_iscsi_create_other_implementation() {
    let gateway = Iscsi::new(backend(), &fast_config());
    let mut lio = target(1024);
    lio.implementation = Some("lio-t".into());
    gateway.create(lio).await.unwrap();

    let same = assert_ok!(gateway.create(target(1024)).await);
    assert_eq!(same.implementation.as_deref(), Some("lio-t"));

    let mut scst = target(1024);
    scst.implementation = Some("scst".into());
    assert_matches!(
        gateway.create(scst).await,
        Err(Error::IncompatibleResource { id }) if id == "iscsi-target1"
    );
}

#[tokio::test]
async fn test_iscsi_crashed_service_reports_stopped() {
    let backend = backend();
    let gateway = Iscsi::new(backend.clone(), &fast_config());
    gateway.create(target(1024)).await.unwrap();

    backend.set_in_use("target1", None).await;

    let crashed = gateway.get(&iqn()).await.unwrap().unwrap();
    assert_eq!(crashed.status.service, ServiceState::Stopped);
    assert_eq!(crashed.status.primary, "");

    let grown = assert_ok!(gateway.add_volume(&iqn(), VolumeConfig::new(2, 1024)).await).unwrap();
    assert_eq!(volume_numbers(&grown.volumes), vec![1, 2]);
}

#[tokio::test]
async fn test_iscsi_validation_creates_nothing() {
    let backend = backend();
    let gateway = Iscsi::new(backend.clone(), &fast_config());

    let mut rsc = target(1024);
    rsc.service_ips.clear();
    assert_matches!(gateway.create(rsc).await, Err(Error::Validation(_)));

    let mut rsc = target(1024);
    rsc.volumes.push(VolumeConfig::new(1, 2048));
    assert_matches!(gateway.create(rsc).await, Err(Error::Validation(_)));

    assert_eq!(backend.resource_definition_count().await, 0);
    assert!(assert_ok!(gateway.list().await).is_empty());
}

#[tokio::test]
async fn test_iscsi_stop_start_and_volumes() {
    let gateway = Iscsi::new(backend(), &fast_config());
    gateway.create(target(1024)).await.unwrap();

    assert_matches!(
        gateway.add_volume(&iqn(), VolumeConfig::new(0, 2048)).await,
        Err(Error::ServiceRunning { .. })
    );

    let stopped = gateway.stop(&iqn()).await.unwrap().unwrap();
    assert_eq!(stopped.status.service, ServiceState::Stopped);
    assert_eq!(stopped.status.primary, "");

    let added = gateway
        .add_volume(&iqn(), VolumeConfig::new(0, 2048))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(volume_numbers(&added.volumes), vec![1, 2]);

    // same volume again is a no-op, a different size is not
    let again = gateway
        .add_volume(&iqn(), VolumeConfig::new(2, 2048))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(volume_numbers(&again.volumes), vec![1, 2]);
    assert_matches!(
        gateway.add_volume(&iqn(), VolumeConfig::new(2, 4096)).await,
        Err(Error::VolumeSizeMismatch { number: 2, existing: 2048, requested: 4096 })
    );

    let fetched = gateway.get(&iqn()).await.unwrap().unwrap();
    assert_eq!(volume_numbers(&fetched.volumes), vec![1, 2]);

    assert_matches!(
        gateway.delete_volume(&iqn(), 0).await,
        Err(Error::Validation(_))
    );
    let removed = gateway.delete_volume(&iqn(), 1).await.unwrap().unwrap();
    assert_eq!(volume_numbers(&removed.volumes), vec![2]);

    let unchanged = gateway.delete_volume(&iqn(), 7).await.unwrap().unwrap();
    assert_eq!(volume_numbers(&unchanged.volumes), vec![2]);

    let started = gateway.start(&iqn()).await.unwrap().unwrap();
    assert_eq!(started.status.service, ServiceState::Started);
    assert_eq!(volume_numbers(&started.volumes), vec![2]);
}

#[tokio::test]
async fn test_iscsi_delete() {
    let backend = backend();
    let gateway = Iscsi::new(backend.clone(), &fast_config());
    gateway.create(target(1024)).await.unwrap();

    assert_ok!(gateway.delete(&iqn()).await);
    assert_eq!(gateway.get(&iqn()).await.unwrap(), None);
    assert_eq!(backend.resource_definition_count().await, 0);

    // deleting twice is fine
    assert_ok!(gateway.delete(&iqn()).await);
}

#[tokio::test]
async fn test_unknown_instance() {
    let gateway = Iscsi::new(backend(), &fast_config());
    let unknown = Iqn::new("iqn.2021-08.com.linbit:nothere").unwrap();

    assert_eq!(gateway.get(&unknown).await.unwrap(), None);
    assert_eq!(gateway.start(&unknown).await.unwrap(), None);
    assert_eq!(gateway.stop(&unknown).await.unwrap(), None);
    assert_eq!(
        gateway.add_volume(&unknown, VolumeConfig::new(0, 1024)).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn test_leftover_config_is_overwritten() {
    let backend = backend();
    let path = naming::config_path(DEFAULT_PROMOTER_DIR, "iscsi-target1");
    let leftover = r#"
[[promoter]]
id = "iscsi-target1"

[promoter.resources.target1]
start = ["ocf:heartbeat:IPaddr2 service_ip0 cidr_netmask=24 ip=10.0.0.99"]
"#;
    backend
        .put_external_file(&ExternalFile {
            path: path.clone(),
            content: leftover.as_bytes().to_vec(),
        })
        .await
        .unwrap();

    let gateway = Iscsi::new(backend.clone(), &fast_config());
    let created = gateway.create(target(1024)).await.unwrap();
    assert_eq!(created.status.service, ServiceState::Started);

    let text = String::from_utf8(backend.get_external_file(&path).await.unwrap().content).unwrap();
    assert!(!text.contains("10.0.0.99"));
}

#[tokio::test]
async fn test_failed_create_rolls_back() {
    // one node cannot satisfy the default place count of two
    let backend = Arc::new(MemoryBackend::new(vec!["node1".into()]));
    let gateway = Iscsi::new(backend.clone(), &fast_config());

    assert_err!(gateway.create(target(1024)).await);
    assert_eq!(backend.resource_definition_count().await, 0);
    assert!(backend.list_external_files().await.unwrap().is_empty());
}

// =============================================================================
// NVMe-oF
// =============================================================================

fn nqn() -> Nqn {
    Nqn::new("nqn.2021-08.com.linbit:nvme:vol1").unwrap()
}

#[tokio::test]
async fn test_nvmeof_lifecycle() {
    let backend = backend();
    let gateway = Nvmeof::new(backend.clone(), &fast_config());

    let rsc = nvmeof::ResourceConfig::new(
        nqn(),
        ip("192.168.0.1/24"),
        vec![VolumeConfig::new(0, 1024), VolumeConfig::new(0, 2048)],
    );
    let created = gateway.create(rsc).await.unwrap();
    assert_eq!(volume_numbers(&created.volumes), vec![1, 2]);
    assert_eq!(created.status.service, ServiceState::Started);

    let listed = gateway.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].nqn, nqn());

    let stopped = gateway.stop(&nqn()).await.unwrap().unwrap();
    assert_eq!(stopped.status.service, ServiceState::Stopped);

    let added = gateway
        .add_volume(&nqn(), VolumeConfig::new(0, 4096))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(volume_numbers(&added.volumes), vec![1, 2, 3]);

    gateway.delete(&nqn()).await.unwrap();
    assert!(gateway.list().await.unwrap().is_empty());
    assert_eq!(backend.resource_definition_count().await, 0);
}

#[tokio::test]
async fn test_service_ip_collision_across_protocols() {
    let backend = backend();
    let iscsi = Iscsi::new(backend.clone(), &fast_config());
    let nvme = Nvmeof::new(backend.clone(), &fast_config());

    iscsi.create(target(1024)).await.unwrap();

    let rsc = nvmeof::ResourceConfig::new(
        nqn(),
        ip("10.0.0.1/16"),
        vec![VolumeConfig::new(1, 1024)],
    );
    assert_matches!(
        nvme.create(rsc).await,
        Err(Error::IpCollision { ip, config }) if ip == "10.0.0.1" && config == "iscsi-target1"
    );
    assert_eq!(backend.resource_definition_count().await, 1);

    // each protocol only lists its own instances
    assert!(nvme.list().await.unwrap().is_empty());
    assert_eq!(iscsi.list().await.unwrap().len(), 1);
}

// =============================================================================
// NFS
// =============================================================================

fn nfs_name() -> ResourceName {
    ResourceName::new("nfs1").unwrap()
}

fn export() -> nfs::ResourceConfig {
    nfs::ResourceConfig::new(
        nfs_name(),
        ip("172.16.0.10/16"),
        vec![
            nfs::NfsVolumeConfig::new(0, 1024 * 1024, ""),
            nfs::NfsVolumeConfig::new(0, 2048, "scratch/"),
        ],
    )
}

#[tokio::test]
async fn test_nfs_lifecycle() {
    let backend = backend();
    let gateway = Nfs::new(backend.clone(), &fast_config());

    let created = gateway.create(export()).await.unwrap();
    assert_eq!(created.allowed_ips, ServiceIp::allow_all());
    assert_eq!(volume_numbers(&created.volumes), vec![1, 2]);
    assert_eq!(created.volumes[0].export_path, "/");
    assert_eq!(created.volumes[1].export_path, "/scratch");
    assert_eq!(created.volumes[1].volume.file_system.as_deref(), Some("ext4"));
    assert_eq!(created.status.service, ServiceState::Started);

    assert_eq!(gateway.create(export()).await.unwrap(), created);

    gateway.stop(&nfs_name()).await.unwrap();
    assert_matches!(
        gateway
            .add_volume(&nfs_name(), nfs::NfsVolumeConfig::new(0, 1024, "/scratch"))
            .await,
        Err(Error::Validation(msg)) if msg == "nfs export paths must be unique"
    );

    let added = gateway
        .add_volume(&nfs_name(), nfs::NfsVolumeConfig::new(0, 1024, "more"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(volume_numbers(&added.volumes), vec![1, 2, 3]);
    assert_eq!(added.volumes[2].export_path, "/more");

    let fetched = gateway.get(&nfs_name()).await.unwrap().unwrap();
    assert_eq!(fetched.volumes, added.volumes);

    gateway.delete(&nfs_name()).await.unwrap();
    assert_eq!(gateway.get(&nfs_name()).await.unwrap(), None);
}

#[tokio::test]
async fn test_nfs_allowed_ips_incompatible() {
    let gateway = Nfs::new(backend(), &fast_config());
    gateway.create(export()).await.unwrap();

    let mut restricted = export();
    restricted.allowed_ips = vec![ip("172.16.0.0/16")];
    assert_matches!(
        gateway.create(restricted).await,
        Err(Error::IncompatibleResource { .. })
    );
}
