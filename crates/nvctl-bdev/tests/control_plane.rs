//! End-to-end tests of the control plane against the simulated transport.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use nvctl_bdev::driver::{CommandClass, HotplugEvent, opcode};
use nvctl_bdev::sim::{SimTarget, SimTransport};
use nvctl_bdev::stats::TransportStats;
use nvctl_bdev::{
    AttachRequest, ControlPlane, DiscoveryRequest, ErrorInjectionRequest, FW_SUCCESS_MESSAGE,
    RemoveInjectionRequest, Transport,
};
use nvctl_common::{
    ControllerState, Error, GlobalOptions, MultipathMode, PathFilter, TransportId, TransportKind,
};
use nvctl_runtime::{ReactorHandle, ReactorPool, completion};

const CNODE1: &str = "nqn.2016-06.io.spdk:cnode1";
const CNODE2: &str = "nqn.2016-06.io.spdk:cnode2";

async fn setup(workers: usize) -> (ControlPlane, Arc<SimTransport>) {
    let pool = Arc::new(ReactorPool::start(workers).unwrap());
    let sim = Arc::new(SimTransport::new(TransportKind::Tcp));
    sim.add_target(SimTarget::new("10.0.0.1", "4420", CNODE1));
    sim.add_target(SimTarget::new("10.0.0.2", "4420", CNODE1));
    sim.add_target(SimTarget::new("10.0.0.3", "4420", CNODE2).with_namespaces(3));
    let driver: Arc<dyn Transport> = Arc::clone(&sim) as Arc<dyn Transport>;
    let plane = ControlPlane::start(pool, driver, GlobalOptions::default())
        .await
        .unwrap();
    (plane, sim)
}

fn request(name: &str, traddr: &str, subnqn: &str) -> AttachRequest {
    AttachRequest::new(name, TransportKind::Tcp, traddr)
        .with_trsvcid("4420")
        .with_subnqn(subnqn)
}

fn firmware_file(len: usize) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let content: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
    file.write_all(&content).unwrap();
    file
}

// ── Attach / detach ────────────────────────────────────────────────────

#[tokio::test]
async fn test_attach_registers_bdevs() {
    let (plane, _sim) = setup(2).await;

    let bdevs = plane
        .attach_controller(request("Nvme0", "10.0.0.3", CNODE2))
        .await
        .unwrap();
    assert_eq!(bdevs, vec!["Nvme0n1", "Nvme0n2", "Nvme0n3"]);

    let info = plane.bdevs().get("Nvme0n2").unwrap();
    assert_eq!(info.ctrlr_name, "Nvme0");
    assert_eq!(info.block_size, 4096);
    assert!(info.examined);

    let ctrlrs = plane.get_controllers(None).unwrap();
    assert_eq!(ctrlrs.len(), 1);
    assert_eq!(ctrlrs[0].ctrlrs[0].state, ControllerState::Enabled);
    assert_eq!(ctrlrs[0].ctrlrs[0].trid.traddr, "10.0.0.3");

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_attach_unreachable_target() {
    let (plane, _sim) = setup(1).await;

    let err = plane
        .attach_controller(request("Nvme0", "10.9.9.9", CNODE1))
        .await
        .unwrap_err();
    assert_eq!(err.errno(), -libc::ENXIO);
    assert!(plane.get_controllers(None).unwrap().is_empty());

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_path_needs_multipath() {
    let (plane, sim) = setup(1).await;

    plane
        .attach_controller(request("Nvme0", "10.0.0.1", CNODE1))
        .await
        .unwrap();

    let err = plane
        .attach_controller(
            request("Nvme0", "10.0.0.2", CNODE1).with_multipath(MultipathMode::Disable),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
    // The rejected path never reached the driver
    assert!(sim.controller("10.0.0.2", "4420").is_none());

    let bdevs = plane
        .attach_controller(
            request("Nvme0", "10.0.0.2", CNODE1).with_multipath(MultipathMode::Failover),
        )
        .await
        .unwrap();
    assert_eq!(bdevs, vec!["Nvme0n1"]);

    let ctrlrs = plane.get_controllers(Some("Nvme0")).unwrap();
    assert_eq!(ctrlrs[0].ctrlrs.len(), 2);
    assert_eq!(ctrlrs[0].multipath, MultipathMode::Disable);
    assert_eq!(plane.bdevs().list().len(), 1);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_same_network_path_rejected() {
    let (plane, _sim) = setup(1).await;

    plane
        .attach_controller(request("Nvme0", "10.0.0.1", CNODE1))
        .await
        .unwrap();
    let err = plane
        .attach_controller(
            request("Nvme0", "10.0.0.1", CNODE1).with_multipath(MultipathMode::Multipath),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.message(),
        "A controller named Nvme0 already exists with the specified network path"
    );

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_attach_admits_one_disabled_path() {
    for stagger in 0..24 {
        let (plane, _sim) = setup(4).await;

        let first = plane.attach_controller(
            request("Nvme0", "10.0.0.1", CNODE1).with_multipath(MultipathMode::Disable),
        );
        let second = async {
            for _ in 0..stagger {
                tokio::task::yield_now().await;
            }
            plane
                .attach_controller(
                    request("Nvme0", "10.0.0.2", CNODE1).with_multipath(MultipathMode::Disable),
                )
                .await
        };
        let (a, b) = tokio::join!(first, second);

        assert!(a.is_ok() != b.is_ok(), "stagger {stagger}: {a:?} {b:?}");
        let rejected = if a.is_ok() { b } else { a };
        assert!(
            matches!(rejected, Err(Error::AlreadyExists(_))),
            "stagger {stagger}: {rejected:?}"
        );
        let ctrlrs = plane.get_controllers(Some("Nvme0")).unwrap();
        assert_eq!(ctrlrs[0].ctrlrs.len(), 1, "stagger {stagger}");
        assert_eq!(plane.bdevs().list().len(), 1);

        plane.shutdown().await.unwrap();
        plane.pool().shutdown();
    }
}

#[tokio::test]
async fn test_concurrent_attach_same_network_path() {
    let (plane, sim) = setup(2).await;

    let (a, b) = tokio::join!(
        plane.attach_controller(
            request("Nvme0", "10.0.0.1", CNODE1).with_multipath(MultipathMode::Multipath),
        ),
        plane.attach_controller(
            request("Nvme0", "10.0.0.1", CNODE1).with_multipath(MultipathMode::Multipath),
        ),
    );
    assert!(a.is_ok() != b.is_ok());
    let ctrlrs = plane.get_controllers(Some("Nvme0")).unwrap();
    assert_eq!(ctrlrs[0].ctrlrs.len(), 1);
    let live = sim.controllers().iter().filter(|c| !c.is_shut_down()).count();
    assert_eq!(live, 1);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_path_from_other_host_address() {
    let (plane, _sim) = setup(1).await;

    plane
        .attach_controller(request("Nvme0", "10.0.0.1", CNODE1).with_hostaddr("192.168.0.10"))
        .await
        .unwrap();
    let bdevs = plane
        .attach_controller(
            request("Nvme0", "10.0.0.1", CNODE1)
                .with_hostaddr("192.168.0.11")
                .with_multipath(MultipathMode::Multipath),
        )
        .await
        .unwrap();
    assert_eq!(bdevs, vec!["Nvme0n1"]);

    let ctrlrs = plane.get_controllers(Some("Nvme0")).unwrap();
    assert_eq!(ctrlrs[0].ctrlrs.len(), 2);
    let addrs: Vec<&str> = ctrlrs[0].ctrlrs.iter().map(|p| p.host.addr.as_str()).collect();
    assert_eq!(addrs, vec!["192.168.0.10", "192.168.0.11"]);
    assert!(ctrlrs[0].ctrlrs.iter().all(|p| p.trid.traddr == "10.0.0.1"));

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_path_with_other_subsystem() {
    let (plane, _sim) = setup(1).await;

    plane
        .attach_controller(request("Nvme0", "10.0.0.1", CNODE1))
        .await
        .unwrap();
    let err = plane
        .attach_controller(
            request("Nvme0", "10.0.0.3", CNODE2).with_multipath(MultipathMode::Failover),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_detach_by_filter() {
    let (plane, sim) = setup(1).await;

    plane
        .attach_controller(request("Nvme0", "10.0.0.1", CNODE1))
        .await
        .unwrap();
    plane
        .attach_controller(
            request("Nvme0", "10.0.0.2", CNODE1).with_multipath(MultipathMode::Failover),
        )
        .await
        .unwrap();

    let filter = PathFilter {
        traddr: Some("10.0.0.2".to_string()),
        ..Default::default()
    };
    plane.detach_controller("Nvme0", filter).await.unwrap();

    let ctrlrs = plane.get_controllers(Some("Nvme0")).unwrap();
    assert_eq!(ctrlrs[0].ctrlrs.len(), 1);
    assert!(plane.bdevs().get("Nvme0n1").is_some());
    assert!(sim.controller("10.0.0.2", "4420").is_none());

    let nothing = PathFilter {
        traddr: Some("10.0.0.99".to_string()),
        ..Default::default()
    };
    let err = plane.detach_controller("Nvme0", nothing).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    plane
        .detach_controller("Nvme0", PathFilter::default())
        .await
        .unwrap();
    assert!(plane.bdevs().get("Nvme0n1").is_none());
    let err = plane.get_controllers(Some("Nvme0")).unwrap_err();
    assert_eq!(err.message(), "Controller Nvme0 does not exist");

    plane.shutdown().await.unwrap();
}

// ── Options ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_set_options_only_without_controllers() {
    let (plane, _sim) = setup(1).await;

    let options = GlobalOptions {
        transport_retry_count: 8,
        ..Default::default()
    };
    plane.set_options(options.clone()).await.unwrap();
    assert_eq!(plane.get_options().transport_retry_count, 8);

    plane
        .attach_controller(request("Nvme0", "10.0.0.1", CNODE1))
        .await
        .unwrap();
    let err = plane.set_options(options).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_set_options_rejects_inconsistent_timeouts() {
    let (plane, _sim) = setup(1).await;

    let options = GlobalOptions {
        ctrlr_loss_timeout_sec: 10,
        reconnect_delay_sec: 20,
        ..Default::default()
    };
    assert!(plane.set_options(options).await.is_err());
    assert_eq!(plane.get_options(), GlobalOptions::default());

    plane.shutdown().await.unwrap();
}

// ── Reset ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reset_completes_on_calling_reactor() {
    let (plane, sim) = setup(2).await;
    plane
        .attach_controller(request("Nvme0", "10.0.0.1", CNODE1))
        .await
        .unwrap();

    let (tx, rx) = completion::<String>();
    let caller = plane.pool().workers()[1].clone();
    let on_worker = plane.clone();
    caller
        .send(move || {
            on_worker.reset_controller_with("Nvme0", move |result| {
                let thread = ReactorHandle::current()
                    .map(|h| h.name().to_string())
                    .unwrap_or_default();
                match result {
                    Ok(()) => tx.success(thread),
                    Err(e) => tx.error(e),
                }
            });
        })
        .unwrap();

    assert_eq!(rx.await.unwrap(), "reactor_2");
    assert_eq!(sim.controller("10.0.0.1", "4420").unwrap().reset_count(), 1);
    let ctrlrs = plane.get_controllers(Some("Nvme0")).unwrap();
    assert_eq!(ctrlrs[0].ctrlrs[0].state, ControllerState::Enabled);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reset_failure_marks_path_failed() {
    let (plane, sim) = setup(1).await;
    sim.add_target(SimTarget::new("10.0.0.4", "4420", CNODE1).with_failing_reset());
    plane
        .attach_controller(request("Nvme0", "10.0.0.4", CNODE1))
        .await
        .unwrap();

    assert!(plane.reset_controller("Nvme0").await.is_err());
    let ctrlrs = plane.get_controllers(Some("Nvme0")).unwrap();
    assert_eq!(ctrlrs[0].ctrlrs[0].state, ControllerState::Failed);

    let err = plane.reset_controller("Nvme9").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    plane.shutdown().await.unwrap();
}

// ── Firmware ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_firmware_update_in_chunks() {
    let (plane, sim) = setup(2).await;
    plane
        .attach_controller(request("Nvme0", "10.0.0.1", CNODE1))
        .await
        .unwrap();
    let file = firmware_file(10_000);

    let message = plane.apply_firmware("Nvme0n1", file.path()).await.unwrap();
    assert_eq!(message, FW_SUCCESS_MESSAGE);

    let ctrlr = sim.controller("10.0.0.1", "4420").unwrap();
    let downloads: Vec<(u64, u64)> = ctrlr
        .admin_log()
        .iter()
        .filter(|c| c.opc == opcode::FIRMWARE_IMAGE_DOWNLOAD)
        .map(|c| (c.download_offset(), c.download_len()))
        .collect();
    assert_eq!(downloads, vec![(0, 4096), (4096, 4096), (8192, 1808)]);
    assert_eq!(ctrlr.firmware_image(), std::fs::read(file.path()).unwrap());
    assert_eq!(ctrlr.committed_slots(), vec![0]);
    assert_eq!(ctrlr.reset_count(), 1);

    let info = plane.bdevs().get("Nvme0n1").unwrap();
    assert_eq!(info.open_descriptors, 0);
    assert_eq!(info.io_channels, 0);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_firmware_download_failure_releases_resources() {
    let (plane, sim) = setup(1).await;
    sim.add_target(
        SimTarget::new("10.0.0.5", "4420", CNODE1)
            .with_failing_opcode(opcode::FIRMWARE_IMAGE_DOWNLOAD),
    );
    plane
        .attach_controller(request("Nvme0", "10.0.0.5", CNODE1))
        .await
        .unwrap();
    let file = firmware_file(8192);

    let err = plane.apply_firmware("Nvme0n1", file.path()).await.unwrap_err();
    assert_eq!(err.message(), "firmware download failed.");
    assert_eq!(err.errno(), -libc::EIO);

    let ctrlr = sim.controller("10.0.0.5", "4420").unwrap();
    assert!(ctrlr.committed_slots().is_empty());
    assert_eq!(ctrlr.reset_count(), 0);
    let info = plane.bdevs().get("Nvme0n1").unwrap();
    assert_eq!(info.open_descriptors, 0);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_firmware_size_not_multiple_of_four() {
    let (plane, sim) = setup(1).await;
    plane
        .attach_controller(request("Nvme0", "10.0.0.1", CNODE1))
        .await
        .unwrap();
    let ctrlr = sim.controller("10.0.0.1", "4420").unwrap();
    let before = ctrlr.admin_log().len();
    let file = firmware_file(4097);

    let err = plane.apply_firmware("Nvme0n1", file.path()).await.unwrap_err();
    assert_eq!(err.message(), "Firmware image size is not multiple of 4.");
    assert_eq!(ctrlr.admin_log().len(), before);
    assert_eq!(ctrlr.reset_count(), 0);
    assert_eq!(plane.bdevs().get("Nvme0n1").unwrap().open_descriptors, 0);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_firmware_on_claimed_bdev() {
    let (plane, _sim) = setup(1).await;
    plane
        .attach_controller(request("Nvme0", "10.0.0.3", CNODE2))
        .await
        .unwrap();
    plane.bdevs().claim("Nvme0n2", "raid").unwrap();
    let file = firmware_file(4096);

    let err = plane.apply_firmware("Nvme0n1", file.path()).await.unwrap_err();
    assert_eq!(err.errno(), -libc::EBUSY);
    assert_eq!(err.message(), "Device Nvme0n2 is in use.");
    // The descriptor opened before the claimed bdev was released
    assert_eq!(plane.bdevs().get("Nvme0n1").unwrap().open_descriptors, 0);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_firmware_unknown_bdev() {
    let (plane, _sim) = setup(1).await;
    let file = firmware_file(4096);

    let err = plane.apply_firmware("Nvme7n1", file.path()).await.unwrap_err();
    assert_eq!(err.message(), "bdev Nvme7n1 were not found");

    // The bdev is looked up before the image is opened
    let err = plane
        .apply_firmware("Nvme7n1", "/nonexistent/firmware.bin")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(err.message(), "bdev Nvme7n1 were not found");

    plane.shutdown().await.unwrap();
}

// ── Statistics ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_transport_statistics_per_reactor() {
    let (plane, _sim) = setup(2).await;
    plane
        .attach_controller(request("Nvme0", "10.0.0.1", CNODE1))
        .await
        .unwrap();

    let stats = plane.get_transport_statistics().await.unwrap();
    let threads: Vec<&str> = stats.poll_groups.iter().map(|s| s.thread.as_str()).collect();
    assert_eq!(threads, vec!["app_thread", "reactor_1", "reactor_2"]);
    for group in &stats.poll_groups {
        assert_eq!(group.transports.len(), 1);
        assert!(matches!(&group.transports[0], TransportStats::Tcp(tcp) if tcp.polls == 1));
    }

    plane.shutdown().await.unwrap();
}

// ── Health ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_info() {
    let (plane, _sim) = setup(1).await;

    let err = plane.get_controller_health_info(None).await.unwrap_err();
    assert_eq!(err.message(), "No NVMe controller found.");

    plane
        .attach_controller(request("Nvme0", "10.0.0.1", CNODE1))
        .await
        .unwrap();
    let health = plane.get_controller_health_info(Some("Nvme0")).await.unwrap();
    assert_eq!(health.traddr, "10.0.0.1");
    assert_eq!(health.temperature_threshold_celsius, 70);
    assert_eq!(health.model_number, "nvctl simulated controller");

    let first = plane.get_controller_health_info(None).await.unwrap();
    assert_eq!(first, health);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_health_admin_failure_is_internal() {
    let (plane, sim) = setup(1).await;
    sim.add_target(
        SimTarget::new("10.0.0.6", "4420", CNODE1).with_failing_opcode(opcode::GET_LOG_PAGE),
    );
    plane
        .attach_controller(request("Nvme0", "10.0.0.6", CNODE1))
        .await
        .unwrap();

    let err = plane
        .get_controller_health_info(Some("Nvme0"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
    assert_eq!(err.message(), "Internal error.");

    plane.shutdown().await.unwrap();
}

// ── Error injection ────────────────────────────────────────────────────

#[tokio::test]
async fn test_io_injection_reaches_every_channel() {
    let (plane, sim) = setup(2).await;
    plane
        .attach_controller(request("Nvme0", "10.0.0.1", CNODE1))
        .await
        .unwrap();

    plane
        .add_error_injection(ErrorInjectionRequest::new("Nvme0", CommandClass::Io, 0x02))
        .await
        .unwrap();
    let ctrlr = sim.controller("10.0.0.1", "4420").unwrap();
    let mut threads: Vec<String> = ctrlr.io_injections().into_iter().map(|(t, _)| t).collect();
    threads.sort();
    assert_eq!(threads, vec!["app_thread", "reactor_1", "reactor_2"]);

    plane
        .remove_error_injection(RemoveInjectionRequest {
            name: "Nvme0".to_string(),
            cmd_type: CommandClass::Io,
            opc: 0x02,
        })
        .await
        .unwrap();
    assert!(ctrlr.io_injections().is_empty());

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_io_injection_skips_channels_without_qpair() {
    let (plane, sim) = setup(2).await;
    sim.add_target(SimTarget::new("10.0.0.7", "4420", CNODE1).with_failing_qpairs());
    plane
        .attach_controller(request("Nvme0", "10.0.0.7", CNODE1))
        .await
        .unwrap();

    plane
        .add_error_injection(ErrorInjectionRequest::new("Nvme0", CommandClass::Io, 0x01))
        .await
        .unwrap();
    assert!(sim.controller("10.0.0.7", "4420").unwrap().io_injections().is_empty());

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_admin_injection_fails_next_command() {
    let (plane, sim) = setup(1).await;
    plane
        .attach_controller(request("Nvme0", "10.0.0.1", CNODE1))
        .await
        .unwrap();

    plane
        .add_error_injection(ErrorInjectionRequest::new(
            "Nvme0",
            CommandClass::Admin,
            opcode::GET_FEATURES,
        ))
        .await
        .unwrap();
    assert_eq!(
        sim.controller("10.0.0.1", "4420").unwrap().admin_injections().len(),
        1
    );
    assert!(plane.get_controller_health_info(Some("Nvme0")).await.is_err());
    assert!(plane.get_controller_health_info(Some("Nvme0")).await.is_ok());

    let err = plane
        .add_error_injection(ErrorInjectionRequest::new("Nvme9", CommandClass::Admin, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    plane.shutdown().await.unwrap();
}

// ── Discovery ──────────────────────────────────────────────────────────

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn entry(traddr: &str, subnqn: &str) -> TransportId {
    TransportId::new(TransportKind::Tcp, traddr)
        .with_trsvcid("4420")
        .with_subnqn(subnqn)
}

#[tokio::test]
async fn test_discovery_attaches_and_withdraws() {
    let (plane, sim) = setup(1).await;
    let service = sim.add_discovery_service("10.0.0.100", "8009");
    service.set_entries(vec![entry("10.0.0.1", CNODE1), entry("10.0.0.3", CNODE2)]);

    let mut req = DiscoveryRequest::new("disc", TransportKind::Tcp, "10.0.0.100", "8009");
    req.wait_for_attach = true;
    plane.start_discovery(req).await.unwrap();

    let info = plane.get_discovery_info();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].ctrlrs, vec!["disc0", "disc1"]);
    assert!(plane.bdevs().get("disc0n1").is_some());

    // A second path to a known subsystem joins its controller
    service.set_entries(vec![
        entry("10.0.0.1", CNODE1),
        entry("10.0.0.2", CNODE1),
        entry("10.0.0.3", CNODE2),
    ]);
    eventually(|| {
        plane
            .get_controllers(Some("disc0"))
            .is_ok_and(|c| c[0].ctrlrs.len() == 2)
    })
    .await;

    service.set_entries(vec![entry("10.0.0.1", CNODE1), entry("10.0.0.2", CNODE1)]);
    eventually(|| plane.get_discovery_info()[0].ctrlrs == vec!["disc0"]).await;
    assert!(plane.get_controllers(Some("disc1")).is_err());

    plane.stop_discovery("disc").await.unwrap();
    assert!(plane.get_discovery_info().is_empty());
    assert!(plane.get_controllers(None).unwrap().is_empty());

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_discovery_duplicates_and_unknown_stop() {
    let (plane, sim) = setup(1).await;
    sim.add_discovery_service("10.0.0.100", "8009");

    plane
        .start_discovery(DiscoveryRequest::new("disc", TransportKind::Tcp, "10.0.0.100", "8009"))
        .await
        .unwrap();

    let err = plane
        .start_discovery(DiscoveryRequest::new("disc", TransportKind::Tcp, "10.0.0.101", "8009"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
    let err = plane
        .start_discovery(DiscoveryRequest::new("other", TransportKind::Tcp, "10.0.0.100", "8009"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));

    let err = plane.stop_discovery("missing").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    plane.stop_discovery("disc").await.unwrap();
    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_discovery_connect_failure_leaves_no_entry() {
    let (plane, _sim) = setup(1).await;

    let err = plane
        .start_discovery(DiscoveryRequest::new("disc", TransportKind::Tcp, "10.0.0.200", "8009"))
        .await
        .unwrap_err();
    assert_eq!(err.errno(), -libc::ECONNREFUSED);
    assert!(plane.get_discovery_info().is_empty());

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_discovery_log_failure_removes_entry() {
    let (plane, sim) = setup(1).await;
    let service = sim.add_discovery_service("10.0.0.100", "8009");
    service.set_entries(vec![entry("10.0.0.1", CNODE1)]);
    service.fail_log_page();

    for _ in 0..2 {
        let mut req = DiscoveryRequest::new("disc", TransportKind::Tcp, "10.0.0.100", "8009");
        req.wait_for_attach = true;
        let err = plane.start_discovery(req).await.unwrap_err();
        // A retry under the same name reaches the service again
        assert_eq!(err.errno(), -libc::EIO);
        assert!(plane.get_discovery_info().is_empty());
    }
    assert!(plane.get_controllers(None).unwrap().is_empty());

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_discovery_failure_while_running() {
    let (plane, sim) = setup(1).await;
    let service = sim.add_discovery_service("10.0.0.100", "8009");
    service.set_entries(vec![entry("10.0.0.1", CNODE1)]);

    plane
        .start_discovery(DiscoveryRequest::new("disc", TransportKind::Tcp, "10.0.0.100", "8009"))
        .await
        .unwrap();
    eventually(|| {
        plane
            .get_discovery_info()
            .first()
            .is_some_and(|d| d.ctrlrs == vec!["disc0"])
    })
    .await;

    service.fail_log_page();
    eventually(|| plane.get_discovery_info().is_empty()).await;
    eventually(|| plane.get_controllers(None).is_ok_and(|c| c.is_empty())).await;

    let err = plane.stop_discovery("disc").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    plane.shutdown().await.unwrap();
}

// ── Hotplug ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_hotplug_insert_and_remove() {
    let (plane, sim) = setup(1).await;
    plane.set_hotplug(true, Some(1_000)).await.unwrap();
    assert!(plane.hotplug().enabled);

    sim.add_target(SimTarget::new("0000:81:00.0", "", ""));
    sim.push_hotplug_event(HotplugEvent::Inserted(TransportId::new(
        TransportKind::Tcp,
        "0000:81:00.0",
    )));
    eventually(|| plane.get_controllers(Some("HotInNvme0")).is_ok()).await;
    assert!(plane.bdevs().get("HotInNvme0n1").is_some());

    sim.push_hotplug_event(HotplugEvent::Removed(TransportId::new(
        TransportKind::Tcp,
        "0000:81:00.0",
    )));
    eventually(|| plane.get_controllers(Some("HotInNvme0")).is_err()).await;

    plane.set_hotplug(false, None).await.unwrap();
    assert!(!plane.hotplug().enabled);
    plane.shutdown().await.unwrap();
}
