//! In-memory loopback driver.
//!
//! Controllers are plain structs behind a lock. Admin commands are
//! recorded so callers can inspect the exact sequence a control-plane
//! operation issued. Failures are switched on per target or per
//! controller.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use async_trait::async_trait;
use bytes::BufMut;
use nvctl_common::{ControllerOptions, Error, PathIdentity, Result, TransportId, TransportKind};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::driver::{
    AdminCommand, Controller, ControllerData, DiscoveryLogEntry, DiscoverySession, ErrorInjection,
    FEAT_TEMPERATURE_THRESHOLD, HEALTH_LOG_PAGE_SIZE, HotplugEvent, IoQpair,
    LOG_HEALTH_INFORMATION, NamespaceInfo, PollGroup, Transport, opcode,
};
use crate::stats::{PcieStats, RdmaDeviceStats, TcpStats, TransportStats};

// ── Targets ────────────────────────────────────────────────────────────

/// Health counters a simulated controller reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimHealth {
    pub critical_warning: u8,
    pub temperature_kelvin: u16,
    pub available_spare: u8,
    pub available_spare_threshold: u8,
    pub percentage_used: u8,
    pub data_units_read: u128,
    pub data_units_written: u128,
    pub host_read_commands: u128,
    pub host_write_commands: u128,
    pub controller_busy_time: u128,
    pub power_cycles: u128,
    pub power_on_hours: u128,
    pub unsafe_shutdowns: u128,
    pub media_errors: u128,
    pub num_err_log_entries: u128,
    pub warning_temp_time: u32,
    pub critical_temp_time: u32,
    pub temp_sensors: [u16; 8],
}

impl Default for SimHealth {
    fn default() -> Self {
        Self {
            critical_warning: 0,
            temperature_kelvin: 310,
            available_spare: 100,
            available_spare_threshold: 10,
            percentage_used: 3,
            data_units_read: 52_000,
            data_units_written: 31_000,
            host_read_commands: 1_200_000,
            host_write_commands: 800_000,
            controller_busy_time: 42,
            power_cycles: 12,
            power_on_hours: 1234,
            unsafe_shutdowns: 1,
            media_errors: 0,
            num_err_log_entries: 2,
            warning_temp_time: 0,
            critical_temp_time: 0,
            temp_sensors: [305, 0, 0, 0, 0, 0, 0, 0],
        }
    }
}

impl SimHealth {
    /// Lay the counters out as a health information log page.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut page = Vec::with_capacity(HEALTH_LOG_PAGE_SIZE);
        page.put_u8(self.critical_warning);
        page.put_u16_le(self.temperature_kelvin);
        page.put_u8(self.available_spare);
        page.put_u8(self.available_spare_threshold);
        page.put_u8(self.percentage_used);
        page.put_u8(0);
        page.put_bytes(0, 25);
        for counter in [
            self.data_units_read,
            self.data_units_written,
            self.host_read_commands,
            self.host_write_commands,
            self.controller_busy_time,
            self.power_cycles,
            self.power_on_hours,
            self.unsafe_shutdowns,
            self.media_errors,
            self.num_err_log_entries,
        ] {
            page.put_u128_le(counter);
        }
        page.put_u32_le(self.warning_temp_time);
        page.put_u32_le(self.critical_temp_time);
        for sensor in self.temp_sensors {
            page.put_u16_le(sensor);
        }
        page.resize(HEALTH_LOG_PAGE_SIZE, 0);
        page
    }
}

/// A reachable NVMe subsystem
#[derive(Debug, Clone)]
pub struct SimTarget {
    pub traddr: String,
    pub trsvcid: String,
    pub subnqn: String,
    pub data: ControllerData,
    pub namespaces: Vec<NamespaceInfo>,
    pub health: SimHealth,
    pub temperature_threshold_kelvin: u32,
    pub fail_connect: bool,
    pub fail_qpair_alloc: bool,
    pub fail_reset: bool,
    pub failing_opcodes: HashSet<u8>,
}

impl SimTarget {
    /// A target with one 512-byte-block namespace
    pub fn new(traddr: &str, trsvcid: &str, subnqn: &str) -> Self {
        Self {
            traddr: traddr.to_string(),
            trsvcid: trsvcid.to_string(),
            subnqn: subnqn.to_string(),
            data: ControllerData {
                model_number: "nvctl simulated controller".to_string(),
                serial_number: format!("SIM-{traddr}-{trsvcid}"),
                firmware_revision: "1.0".to_string(),
                subnqn: subnqn.to_string(),
            },
            namespaces: vec![NamespaceInfo {
                nsid: 1,
                block_size: 512,
                num_blocks: 1 << 21,
            }],
            health: SimHealth::default(),
            temperature_threshold_kelvin: 343,
            fail_connect: false,
            fail_qpair_alloc: false,
            fail_reset: false,
            failing_opcodes: HashSet::new(),
        }
    }

    #[must_use]
    pub fn with_namespaces(mut self, count: u32) -> Self {
        self.namespaces = (1..=count)
            .map(|nsid| NamespaceInfo {
                nsid,
                block_size: 4096,
                num_blocks: 1 << 18,
            })
            .collect();
        self
    }

    #[must_use]
    pub fn with_failing_opcode(mut self, opc: u8) -> Self {
        self.failing_opcodes.insert(opc);
        self
    }

    #[must_use]
    pub const fn with_failing_reset(mut self) -> Self {
        self.fail_reset = true;
        self
    }

    #[must_use]
    pub const fn with_failing_qpairs(mut self) -> Self {
        self.fail_qpair_alloc = true;
        self
    }
}

// ── Transport ──────────────────────────────────────────────────────────

/// The simulated transport driver
pub struct SimTransport {
    kind: TransportKind,
    targets: Mutex<BTreeMap<(String, String), SimTarget>>,
    discovery: Mutex<BTreeMap<(String, String), Arc<SimDiscoveryService>>>,
    controllers: Mutex<Vec<Arc<SimController>>>,
    hotplug: Mutex<Vec<HotplugEvent>>,
    next_cntlid: AtomicU16,
}

impl SimTransport {
    #[must_use]
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            targets: Mutex::new(BTreeMap::new()),
            discovery: Mutex::new(BTreeMap::new()),
            controllers: Mutex::new(Vec::new()),
            hotplug: Mutex::new(Vec::new()),
            next_cntlid: AtomicU16::new(1),
        }
    }

    pub fn add_target(&self, target: SimTarget) {
        let key = (target.traddr.clone(), target.trsvcid.clone());
        self.targets.lock().insert(key, target);
    }

    pub fn remove_target(&self, traddr: &str, trsvcid: &str) {
        self.targets
            .lock()
            .remove(&(traddr.to_string(), trsvcid.to_string()));
    }

    /// Start answering discovery connections at `traddr:trsvcid`.
    pub fn add_discovery_service(&self, traddr: &str, trsvcid: &str) -> Arc<SimDiscoveryService> {
        let (generation, _) = watch::channel(0);
        let service = Arc::new(SimDiscoveryService {
            entries: Mutex::new(Vec::new()),
            generation,
            log_page_fails: AtomicBool::new(false),
        });
        self.discovery.lock().insert(
            (traddr.to_string(), trsvcid.to_string()),
            Arc::clone(&service),
        );
        service
    }

    pub fn push_hotplug_event(&self, event: HotplugEvent) {
        self.hotplug.lock().push(event);
    }

    /// Every controller connected so far, oldest first
    #[must_use]
    pub fn controllers(&self) -> Vec<Arc<SimController>> {
        self.controllers.lock().clone()
    }

    /// The most recent live controller connected to `traddr:trsvcid`
    #[must_use]
    pub fn controller(&self, traddr: &str, trsvcid: &str) -> Option<Arc<SimController>> {
        self.controllers
            .lock()
            .iter()
            .rev()
            .find(|c| c.trid.traddr == traddr && c.trid.trsvcid == trsvcid && !c.is_shut_down())
            .cloned()
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn connect(
        &self,
        path: &PathIdentity,
        _opts: &ControllerOptions,
    ) -> Result<Arc<dyn Controller>> {
        let trid = &path.trid;
        let target = self
            .targets
            .lock()
            .get(&(trid.traddr.clone(), trid.trsvcid.clone()))
            .cloned()
            .ok_or_else(|| Error::device(libc::ENXIO, format!("No controller at {trid}")))?;

        if target.fail_connect {
            return Err(Error::device(
                libc::ECONNREFUSED,
                format!("Connection to {trid} refused"),
            ));
        }
        if !trid.subnqn.is_empty() && trid.subnqn != target.subnqn {
            return Err(Error::device(
                libc::ENXIO,
                format!("Subsystem {} not found at {}", trid.subnqn, trid.traddr),
            ));
        }

        tokio::task::yield_now().await;

        let cntlid = self.next_cntlid.fetch_add(1, Ordering::Relaxed);
        let mut trid = trid.clone();
        trid.subnqn.clone_from(&target.subnqn);
        let state = SimCtrlrState {
            failing_opcodes: target.failing_opcodes.clone(),
            ..Default::default()
        };
        let ctrlr = Arc::new(SimController {
            cntlid,
            kind: self.kind,
            trid,
            target,
            state: Arc::new(Mutex::new(state)),
            failed: AtomicBool::new(false),
        });
        debug!("Simulated controller {} connected to {}", cntlid, ctrlr.trid);
        self.controllers.lock().push(Arc::clone(&ctrlr));
        Ok(ctrlr)
    }

    async fn connect_discovery(
        &self,
        trid: &TransportId,
        _hostnqn: &str,
    ) -> Result<Box<dyn DiscoverySession>> {
        let service = self
            .discovery
            .lock()
            .get(&(trid.traddr.clone(), trid.trsvcid.clone()))
            .cloned()
            .ok_or_else(|| {
                Error::device(
                    libc::ECONNREFUSED,
                    format!("No discovery controller at {trid}"),
                )
            })?;
        tokio::task::yield_now().await;

        let changes = service.generation.subscribe();
        Ok(Box::new(SimDiscoverySession { service, changes }))
    }

    fn create_poll_group(&self) -> Box<dyn PollGroup> {
        Box::new(SimPollGroup {
            qpairs: BTreeMap::new(),
        })
    }

    fn hotplug_scan(&self) -> Vec<HotplugEvent> {
        std::mem::take(&mut *self.hotplug.lock())
    }
}

// ── Controller ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimCtrlrState {
    admin_log: Vec<AdminCommand>,
    firmware: Vec<u8>,
    committed_slots: Vec<u8>,
    reset_count: u32,
    fail_reset: bool,
    shut_down: bool,
    failing_opcodes: HashSet<u8>,
    admin_injections: Vec<ErrorInjection>,
    io_injections: Vec<(String, ErrorInjection)>,
}

/// A simulated controller path
pub struct SimController {
    cntlid: u16,
    kind: TransportKind,
    trid: TransportId,
    target: SimTarget,
    state: Arc<Mutex<SimCtrlrState>>,
    failed: AtomicBool,
}

impl SimController {
    #[must_use]
    pub const fn cntlid(&self) -> u16 {
        self.cntlid
    }

    #[must_use]
    pub const fn trid(&self) -> &TransportId {
        &self.trid
    }

    /// Admin commands in submission order
    #[must_use]
    pub fn admin_log(&self) -> Vec<AdminCommand> {
        self.state.lock().admin_log.clone()
    }

    /// Bytes received through firmware image download
    #[must_use]
    pub fn firmware_image(&self) -> Vec<u8> {
        self.state.lock().firmware.clone()
    }

    #[must_use]
    pub fn committed_slots(&self) -> Vec<u8> {
        self.state.lock().committed_slots.clone()
    }

    #[must_use]
    pub fn reset_count(&self) -> u32 {
        self.state.lock().reset_count
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    /// Injection rules installed on I/O queue pairs, by reactor name
    #[must_use]
    pub fn io_injections(&self) -> Vec<(String, ErrorInjection)> {
        self.state.lock().io_injections.clone()
    }

    #[must_use]
    pub fn admin_injections(&self) -> Vec<ErrorInjection> {
        self.state.lock().admin_injections.clone()
    }

    pub fn fail_opcode(&self, opc: u8) {
        self.state.lock().failing_opcodes.insert(opc);
    }

    pub fn fail_resets(&self, fail: bool) {
        self.state.lock().fail_reset = fail;
    }

    fn execute(&self, cmd: AdminCommand, buf: &mut [u8]) -> Result<u32> {
        let mut st = self.state.lock();
        st.admin_log.push(cmd);

        if st.shut_down {
            return Err(Error::device(libc::ENXIO, "controller is shut down"));
        }
        if let Some(rule) = st
            .admin_injections
            .iter_mut()
            .find(|r| r.opc == cmd.opc && r.err_count > 0)
        {
            rule.err_count -= 1;
            return Err(Error::device(
                libc::EIO,
                format!("injected error sct {} sc {}", rule.sct, rule.sc),
            ));
        }
        if st.failing_opcodes.contains(&cmd.opc) {
            return Err(Error::device(
                libc::EIO,
                format!("admin opcode {:#04x} failed", cmd.opc),
            ));
        }

        match cmd.opc {
            opcode::FIRMWARE_IMAGE_DOWNLOAD => {
                let offset = cmd.download_offset() as usize;
                let len = cmd.download_len() as usize;
                if buf.len() != len {
                    return Err(Error::device(libc::EINVAL, "payload length mismatch"));
                }
                if st.firmware.len() < offset + len {
                    st.firmware.resize(offset + len, 0);
                }
                st.firmware[offset..offset + len].copy_from_slice(buf);
                Ok(0)
            }
            opcode::FIRMWARE_COMMIT => {
                st.committed_slots.push((cmd.cdw10 & 0x7) as u8);
                Ok(0)
            }
            opcode::GET_FEATURES if cmd.cdw10 & 0xFF == u32::from(FEAT_TEMPERATURE_THRESHOLD) => {
                Ok(self.target.temperature_threshold_kelvin)
            }
            opcode::GET_LOG_PAGE if cmd.cdw10 & 0xFF == u32::from(LOG_HEALTH_INFORMATION) => {
                let page = self.target.health.encode();
                let n = buf.len().min(page.len());
                buf[..n].copy_from_slice(&page[..n]);
                Ok(0)
            }
            _ => Ok(0),
        }
    }
}

#[async_trait]
impl Controller for SimController {
    fn transport(&self) -> TransportKind {
        self.kind
    }

    fn data(&self) -> ControllerData {
        self.target.data.clone()
    }

    fn namespaces(&self) -> Vec<NamespaceInfo> {
        self.target.namespaces.clone()
    }

    async fn identify_namespace(&self, nsid: u32) -> Result<NamespaceInfo> {
        tokio::task::yield_now().await;
        self.target
            .namespaces
            .iter()
            .find(|ns| ns.nsid == nsid)
            .copied()
            .ok_or_else(|| Error::device(libc::ENODEV, format!("namespace {nsid} is not active")))
    }

    async fn admin_command(&self, cmd: AdminCommand, buf: &mut [u8]) -> Result<u32> {
        let result = self.execute(cmd, buf);
        tokio::task::yield_now().await;
        result
    }

    async fn reset(&self) -> Result<()> {
        let fail = {
            let mut st = self.state.lock();
            st.reset_count += 1;
            st.fail_reset || self.target.fail_reset
        };
        tokio::task::yield_now().await;
        self.failed.store(fail, Ordering::SeqCst);
        if fail {
            return Err(Error::device(libc::EIO, "controller reset failed"));
        }
        Ok(())
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn alloc_io_qpair(&self) -> Result<Box<dyn IoQpair>> {
        if self.target.fail_qpair_alloc {
            return Err(Error::resource_exhausted("no free I/O queues"));
        }
        let thread = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        Ok(Box::new(SimQpair {
            state: Arc::clone(&self.state),
            thread,
            connected: true,
        }))
    }

    fn add_admin_error_injection(&self, injection: &ErrorInjection) -> Result<()> {
        self.state.lock().admin_injections.push(*injection);
        Ok(())
    }

    fn remove_admin_error_injection(&self, opc: u8) {
        self.state.lock().admin_injections.retain(|r| r.opc != opc);
    }

    async fn shutdown(&self) {
        self.state.lock().shut_down = true;
        debug!("Simulated controller {} shut down", self.cntlid);
    }
}

// ── Queue pairs and poll groups ────────────────────────────────────────

struct SimQpair {
    state: Arc<Mutex<SimCtrlrState>>,
    thread: String,
    connected: bool,
}

impl IoQpair for SimQpair {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn reconnect(&mut self) -> Result<()> {
        if self.state.lock().shut_down {
            return Err(Error::device(libc::ENXIO, "controller is shut down"));
        }
        self.connected = true;
        Ok(())
    }

    fn add_error_injection(&mut self, injection: &ErrorInjection) -> Result<()> {
        self.state
            .lock()
            .io_injections
            .push((self.thread.clone(), *injection));
        Ok(())
    }

    fn remove_error_injection(&mut self, opc: u8) {
        let thread = &self.thread;
        self.state
            .lock()
            .io_injections
            .retain(|(t, r)| !(t == thread && r.opc == opc));
    }
}

/// Reports one counter set per transport with at least one queue pair.
/// `polls` counts the queue pairs in the group.
struct SimPollGroup {
    qpairs: BTreeMap<&'static str, (TransportKind, u64)>,
}

impl PollGroup for SimPollGroup {
    fn add_qpair(&mut self, kind: TransportKind) {
        self.qpairs.entry(kind.trstring()).or_insert((kind, 0)).1 += 1;
    }

    fn remove_qpair(&mut self, kind: TransportKind) {
        if let Some(entry) = self.qpairs.get_mut(kind.trstring()) {
            entry.1 = entry.1.saturating_sub(1);
            if entry.1 == 0 {
                self.qpairs.remove(kind.trstring());
            }
        }
    }

    fn stats(&self) -> Vec<TransportStats> {
        self.qpairs
            .values()
            .filter_map(|&(kind, polls)| match kind {
                TransportKind::Tcp => Some(TransportStats::Tcp(TcpStats {
                    polls,
                    ..Default::default()
                })),
                TransportKind::Pcie | TransportKind::VfioUser => {
                    Some(TransportStats::Pcie(PcieStats {
                        polls,
                        ..Default::default()
                    }))
                }
                TransportKind::Rdma => Some(TransportStats::Rdma {
                    devices: vec![RdmaDeviceStats {
                        dev_name: "sim_rdma0".to_string(),
                        polls,
                        ..Default::default()
                    }],
                }),
                TransportKind::Fc => None,
            })
            .collect()
    }
}

// ── Discovery ──────────────────────────────────────────────────────────

/// A discovery controller whose log the caller edits
pub struct SimDiscoveryService {
    entries: Mutex<Vec<DiscoveryLogEntry>>,
    generation: watch::Sender<u64>,
    log_page_fails: AtomicBool,
}

impl SimDiscoveryService {
    /// Replace the advertised log and notify connected sessions.
    pub fn set_entries(&self, trids: Vec<TransportId>) {
        *self.entries.lock() = trids
            .into_iter()
            .map(|trid| DiscoveryLogEntry { trid })
            .collect();
        self.generation.send_modify(|g| *g += 1);
    }

    /// Make every later log page read fail with `EIO`, and wake connected
    /// sessions so they read again.
    pub fn fail_log_page(&self) {
        self.log_page_fails.store(true, Ordering::SeqCst);
        self.generation.send_modify(|g| *g += 1);
    }
}

struct SimDiscoverySession {
    service: Arc<SimDiscoveryService>,
    changes: watch::Receiver<u64>,
}

#[async_trait]
impl DiscoverySession for SimDiscoverySession {
    async fn log_page(&mut self) -> Result<Vec<DiscoveryLogEntry>> {
        let _ = self.changes.borrow_and_update();
        if self.service.log_page_fails.load(Ordering::SeqCst) {
            return Err(Error::device(libc::EIO, "Get log page failed"));
        }
        let entries = self.service.entries.lock().clone();
        tokio::task::yield_now().await;
        Ok(entries)
    }

    async fn wait_for_change(&mut self) -> Result<()> {
        self.changes
            .changed()
            .await
            .map_err(|_| Error::device(libc::ENOTCONN, "discovery controller disconnected"))
    }
}
