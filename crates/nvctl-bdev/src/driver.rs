//! Driver contract consumed by the control plane.
//!
//! The wire-level transport is a collaborator: it connects controllers,
//! executes admin commands, hands out I/O queue pairs and reports poll
//! group statistics. Everything above it (naming, multipath, discovery,
//! firmware sequencing) lives in this crate.
//!
//! [`Controller`] handles are shared across reactors. [`IoQpair`] and
//! [`PollGroup`] are thread-bound and live in a reactor's channel context.

use std::sync::Arc;

use async_trait::async_trait;
use nvctl_common::{ControllerOptions, PathIdentity, Result, TransportId, TransportKind};
use serde::{Deserialize, Serialize};

use crate::stats::TransportStats;

// ── Admin commands ─────────────────────────────────────────────────────

/// Admin opcodes used by the control plane
pub mod opcode {
    pub const GET_LOG_PAGE: u8 = 0x02;
    pub const GET_FEATURES: u8 = 0x0A;
    pub const FIRMWARE_COMMIT: u8 = 0x10;
    pub const FIRMWARE_IMAGE_DOWNLOAD: u8 = 0x11;
}

/// SMART / health information log page id
pub const LOG_HEALTH_INFORMATION: u8 = 0x02;
/// Size of the health information log page
pub const HEALTH_LOG_PAGE_SIZE: usize = 512;
/// Temperature threshold feature id
pub const FEAT_TEMPERATURE_THRESHOLD: u8 = 0x04;
/// Namespace id addressing every namespace
pub const NSID_ALL: u32 = 0xFFFF_FFFF;

/// Firmware commit action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommitAction {
    /// Replace the image in the slot
    ReplaceImg = 0,
    /// Replace the image and activate it at the next reset
    ReplaceAndEnableImg = 1,
    /// Activate the image already in the slot at the next reset
    EnableImg = 2,
}

/// A single admin command. Only the dwords the control plane uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminCommand {
    pub opc: u8,
    pub nsid: u32,
    pub cdw10: u32,
    pub cdw11: u32,
}

impl AdminCommand {
    /// Firmware image download of `len` bytes (a multiple of 4) at `offset`.
    #[must_use]
    pub const fn firmware_download(offset: u32, len: u32) -> Self {
        Self {
            opc: opcode::FIRMWARE_IMAGE_DOWNLOAD,
            nsid: 0,
            cdw10: (len >> 2) - 1,
            cdw11: offset >> 2,
        }
    }

    #[must_use]
    pub const fn firmware_commit(slot: u8, action: CommitAction) -> Self {
        Self {
            opc: opcode::FIRMWARE_COMMIT,
            nsid: 0,
            cdw10: (slot as u32 & 0x7) | ((action as u32) << 3),
            cdw11: 0,
        }
    }

    #[must_use]
    pub const fn get_features(fid: u8) -> Self {
        Self {
            opc: opcode::GET_FEATURES,
            nsid: 0,
            cdw10: fid as u32,
            cdw11: 0,
        }
    }

    /// Get Log Page for `len` bytes (a multiple of 4) of log `lid`.
    #[must_use]
    pub const fn get_log_page(lid: u8, nsid: u32, len: u32) -> Self {
        let numdl = ((len >> 2) - 1) & 0xFFFF;
        Self {
            opc: opcode::GET_LOG_PAGE,
            nsid,
            cdw10: (numdl << 16) | lid as u32,
            cdw11: 0,
        }
    }

    /// Byte offset addressed by a firmware download
    #[must_use]
    pub const fn download_offset(&self) -> u64 {
        (self.cdw11 as u64) << 2
    }

    /// Byte length carried by a firmware download
    #[must_use]
    pub const fn download_len(&self) -> u64 {
        (self.cdw10 as u64 + 1) << 2
    }
}

// ── Controller data ────────────────────────────────────────────────────

/// Identify data the control plane reports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ControllerData {
    pub model_number: String,
    pub serial_number: String,
    pub firmware_revision: String,
    pub subnqn: String,
}

/// An active namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NamespaceInfo {
    pub nsid: u32,
    pub block_size: u32,
    pub num_blocks: u64,
}

// ── Error injection ────────────────────────────────────────────────────

/// Queue class an injection rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandClass {
    Admin,
    Io,
}

/// Fail the next `err_count` commands with opcode `opc`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInjection {
    pub opc: u8,
    pub do_not_submit: bool,
    pub timeout_in_us: u64,
    pub err_count: u32,
    pub sct: u8,
    pub sc: u8,
}

// ── Discovery and hotplug ──────────────────────────────────────────────

/// One record of a discovery log page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryLogEntry {
    pub trid: TransportId,
}

/// Local device arrival or removal seen by the hotplug poller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    Inserted(TransportId),
    Removed(TransportId),
}

// ── Traits ─────────────────────────────────────────────────────────────

/// Entry point of a transport driver
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect one controller path.
    async fn connect(
        &self,
        path: &PathIdentity,
        opts: &ControllerOptions,
    ) -> Result<Arc<dyn Controller>>;

    /// Connect to a discovery controller.
    async fn connect_discovery(
        &self,
        trid: &TransportId,
        hostnqn: &str,
    ) -> Result<Box<dyn DiscoverySession>>;

    /// Create the poll group for the calling reactor.
    fn create_poll_group(&self) -> Box<dyn PollGroup>;

    /// Drain local device arrivals and removals.
    fn hotplug_scan(&self) -> Vec<HotplugEvent> {
        Vec::new()
    }
}

/// A connected controller path
#[async_trait]
pub trait Controller: Send + Sync {
    fn transport(&self) -> TransportKind;

    fn data(&self) -> ControllerData;

    /// Active namespaces at connect time
    fn namespaces(&self) -> Vec<NamespaceInfo>;

    async fn identify_namespace(&self, nsid: u32) -> Result<NamespaceInfo>;

    /// Execute an admin command. `buf` is the data buffer, written by the
    /// host for transfers to the controller and by the controller
    /// otherwise. Returns completion dword 0.
    async fn admin_command(&self, cmd: AdminCommand, buf: &mut [u8]) -> Result<u32>;

    async fn reset(&self) -> Result<()>;

    fn is_failed(&self) -> bool;

    /// Allocate an I/O queue pair for the calling reactor.
    fn alloc_io_qpair(&self) -> Result<Box<dyn IoQpair>>;

    fn add_admin_error_injection(&self, injection: &ErrorInjection) -> Result<()>;

    fn remove_admin_error_injection(&self, opc: u8);

    /// Disconnect the admin queue; the handle is unusable afterwards.
    async fn shutdown(&self);
}

/// An I/O queue pair, owned by one reactor
pub trait IoQpair {
    fn is_connected(&self) -> bool;

    fn disconnect(&mut self);

    fn reconnect(&mut self) -> Result<()>;

    fn add_error_injection(&mut self, injection: &ErrorInjection) -> Result<()>;

    fn remove_error_injection(&mut self, opc: u8);
}

/// Per-reactor poll group
pub trait PollGroup {
    fn add_qpair(&mut self, kind: TransportKind);

    fn remove_qpair(&mut self, kind: TransportKind);

    fn stats(&self) -> Vec<TransportStats>;
}

/// A persistent discovery controller connection
#[async_trait]
pub trait DiscoverySession: Send {
    /// Read the current discovery log.
    async fn log_page(&mut self) -> Result<Vec<DiscoveryLogEntry>>;

    /// Wait until the discovery log changes.
    async fn wait_for_change(&mut self) -> Result<()>;
}
