//! Core value types for nvctl
//!
//! Transport identities, host identities and the path identity used to
//! deduplicate controller paths, plus per-controller options and state.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Capacity of the transport address buffer (including terminator)
pub const TRADDR_MAX_LEN: usize = 256;
/// Capacity of the transport service id buffer (including terminator)
pub const TRSVCID_MAX_LEN: usize = 32;
/// Capacity of the transport string buffer (including terminator)
pub const TRSTRING_MAX_LEN: usize = 32;
/// Maximum length of a qualified name
pub const NQN_MAX_LEN: usize = 223;
/// Upper bound on I/O queues per controller
pub const MAX_IO_QUEUES: u32 = 65536;
/// Default I/O queue count for a new controller
pub const DEFAULT_IO_QUEUES: u32 = 1024;
/// Maximum number of block devices reported by one attach request
pub const MAX_BDEVS_PER_ATTACH: usize = 128;

/// Reject a string that would not fit a fixed-capacity driver buffer.
pub fn check_capacity(field: &str, value: &str, capacity: usize) -> Result<()> {
    if value.len() >= capacity {
        return Err(Error::invalid_argument(format!("{field} too long: {value}")));
    }
    Ok(())
}

// ── Transport kind ─────────────────────────────────────────────────────

/// NVMe transport type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TransportKind {
    Pcie,
    Rdma,
    Tcp,
    Fc,
    VfioUser,
}

impl TransportKind {
    /// Canonical transport string
    #[must_use]
    pub const fn trstring(self) -> &'static str {
        match self {
            Self::Pcie => "PCIe",
            Self::Rdma => "RDMA",
            Self::Tcp => "TCP",
            Self::Fc => "FC",
            Self::VfioUser => "VFIOUSER",
        }
    }

    /// Whether this transport reaches the controller over a fabric
    #[must_use]
    pub const fn is_fabrics(self) -> bool {
        !matches!(self, Self::Pcie)
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pcie" => Ok(Self::Pcie),
            "rdma" => Ok(Self::Rdma),
            "tcp" => Ok(Self::Tcp),
            "fc" => Ok(Self::Fc),
            "vfiouser" => Ok(Self::VfioUser),
            _ => Err(Error::invalid_argument(format!("Failed to parse trtype: {s}"))),
        }
    }
}

impl TryFrom<String> for TransportKind {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<TransportKind> for String {
    fn from(kind: TransportKind) -> Self {
        kind.trstring().to_string()
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.trstring())
    }
}

// ── Address family ─────────────────────────────────────────────────────

/// Transport address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
    Ib,
    Fc,
    IntraHost,
}

impl AddressFamily {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ipv4 => "IPv4",
            Self::Ipv6 => "IPv6",
            Self::Ib => "IB",
            Self::Fc => "FC",
            Self::IntraHost => "INTRA_HOST",
        }
    }
}

impl FromStr for AddressFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ipv4" => Ok(Self::Ipv4),
            "ipv6" => Ok(Self::Ipv6),
            "ib" => Ok(Self::Ib),
            "fc" => Ok(Self::Fc),
            "intra_host" => Ok(Self::IntraHost),
            _ => Err(Error::invalid_argument(format!("Failed to parse adrfam: {s}"))),
        }
    }
}

impl TryFrom<String> for AddressFamily {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<AddressFamily> for String {
    fn from(adrfam: AddressFamily) -> Self {
        adrfam.as_str().to_string()
    }
}

// ── Identities ─────────────────────────────────────────────────────────

/// Transport identity of one controller path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportId {
    #[serde(rename = "trtype")]
    pub kind: TransportKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adrfam: Option<AddressFamily>,
    pub traddr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trsvcid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subnqn: String,
    #[serde(default, skip_serializing)]
    pub priority: i32,
}

impl TransportId {
    /// Create a transport id with only kind and address set
    pub fn new(kind: TransportKind, traddr: impl Into<String>) -> Self {
        Self {
            kind,
            adrfam: None,
            traddr: traddr.into(),
            trsvcid: String::new(),
            subnqn: String::new(),
            priority: 0,
        }
    }

    #[must_use]
    pub fn with_trsvcid(mut self, trsvcid: impl Into<String>) -> Self {
        self.trsvcid = trsvcid.into();
        self
    }

    #[must_use]
    pub fn with_subnqn(mut self, subnqn: impl Into<String>) -> Self {
        self.subnqn = subnqn.into();
        self
    }

    #[must_use]
    pub const fn with_adrfam(mut self, adrfam: AddressFamily) -> Self {
        self.adrfam = Some(adrfam);
        self
    }

    /// Canonical transport string for this id
    #[must_use]
    pub const fn trstring(&self) -> &'static str {
        self.kind.trstring()
    }

    /// Check every string field against its buffer capacity
    pub fn validate(&self) -> Result<()> {
        check_capacity("traddr", &self.traddr, TRADDR_MAX_LEN)?;
        check_capacity("trsvcid", &self.trsvcid, TRSVCID_MAX_LEN)?;
        check_capacity("subnqn", &self.subnqn, NQN_MAX_LEN + 1)?;
        Ok(())
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trtype:{} traddr:{}", self.kind, self.traddr)?;
        if !self.trsvcid.is_empty() {
            write!(f, " trsvcid:{}", self.trsvcid)?;
        }
        if !self.subnqn.is_empty() {
            write!(f, " subnqn:{}", self.subnqn)?;
        }
        Ok(())
    }
}

/// Source address a host uses to reach a controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostId {
    #[serde(rename = "addr", default, skip_serializing_if = "String::is_empty")]
    pub hostaddr: String,
    #[serde(rename = "svcid", default, skip_serializing_if = "String::is_empty")]
    pub hostsvcid: String,
}

impl HostId {
    pub fn validate(&self) -> Result<()> {
        check_capacity("hostaddr", &self.hostaddr, TRADDR_MAX_LEN)?;
        check_capacity("hostsvcid", &self.hostsvcid, TRSVCID_MAX_LEN)?;
        Ok(())
    }
}

/// A unique route plus host identity to a controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathIdentity {
    pub trid: TransportId,
    pub host: HostId,
    pub hostnqn: String,
}

impl PathIdentity {
    /// Two identities are the same network path when address, service id,
    /// host address and host service id all match exactly.
    #[must_use]
    pub fn same_network_path(&self, other: &Self) -> bool {
        self.trid.traddr == other.trid.traddr
            && self.trid.trsvcid == other.trid.trsvcid
            && self.host.hostaddr == other.host.hostaddr
            && self.host.hostsvcid == other.host.hostsvcid
    }
}

/// Partial path identity used to select paths on detach. Unset fields
/// match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PathFilter {
    pub trtype: Option<TransportKind>,
    pub traddr: Option<String>,
    pub adrfam: Option<AddressFamily>,
    pub trsvcid: Option<String>,
    pub subnqn: Option<String>,
    pub hostaddr: Option<String>,
    pub hostsvcid: Option<String>,
}

impl PathFilter {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.trtype.is_none()
            && self.traddr.is_none()
            && self.adrfam.is_none()
            && self.trsvcid.is_none()
            && self.subnqn.is_none()
            && self.hostaddr.is_none()
            && self.hostsvcid.is_none()
    }

    #[must_use]
    pub fn matches(&self, path: &PathIdentity) -> bool {
        fn field(want: Option<&String>, have: &str) -> bool {
            want.is_none_or(|w| w == have)
        }

        self.trtype.is_none_or(|t| t == path.trid.kind)
            && self.adrfam.is_none_or(|a| Some(a) == path.trid.adrfam)
            && field(self.traddr.as_ref(), &path.trid.traddr)
            && field(self.trsvcid.as_ref(), &path.trid.trsvcid)
            && field(self.subnqn.as_ref(), &path.trid.subnqn)
            && field(self.hostaddr.as_ref(), &path.host.hostaddr)
            && field(self.hostsvcid.as_ref(), &path.host.hostsvcid)
    }
}

// ── Multipath ──────────────────────────────────────────────────────────

/// How additional paths under one name are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultipathMode {
    /// A second path under an existing name is rejected
    Disable,
    /// Extra paths are standby; one path is active at a time
    Failover,
    /// I/O may be issued across all paths
    Multipath,
}

impl MultipathMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Failover => "failover",
            Self::Multipath => "multipath",
        }
    }
}

impl FromStr for MultipathMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "disable" => Ok(Self::Disable),
            "failover" => Ok(Self::Failover),
            "multipath" => Ok(Self::Multipath),
            _ => Err(Error::invalid_argument("Invalid multipath parameter")),
        }
    }
}

// ── Controller options ─────────────────────────────────────────────────

/// End-to-end protection checks enabled on a controller's namespaces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrchkFlags {
    #[serde(default)]
    pub reftag: bool,
    #[serde(default)]
    pub guard: bool,
}

impl PrchkFlags {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.reftag && !self.guard
    }
}

/// Check the relations between the reconnect timeouts.
///
/// `ctrlr_loss_timeout_sec` of -1 means retry forever, 0 means never
/// reconnect.
pub fn check_reconnect_timeouts(
    ctrlr_loss_timeout_sec: i32,
    reconnect_delay_sec: u32,
    fast_io_fail_timeout_sec: u32,
) -> Result<()> {
    let ok = match ctrlr_loss_timeout_sec {
        i32::MIN..=-2 => false,
        -1 => {
            reconnect_delay_sec != 0
                && (fast_io_fail_timeout_sec == 0 || fast_io_fail_timeout_sec >= reconnect_delay_sec)
        }
        0 => reconnect_delay_sec == 0 && fast_io_fail_timeout_sec == 0,
        loss => {
            let loss = loss.unsigned_abs();
            reconnect_delay_sec != 0
                && reconnect_delay_sec <= loss
                && (fast_io_fail_timeout_sec == 0
                    || (fast_io_fail_timeout_sec >= reconnect_delay_sec
                        && fast_io_fail_timeout_sec <= loss))
        }
    };
    if ok {
        Ok(())
    } else {
        Err(Error::invalid_argument(
            "The parameters ctrlr_loss_timeout_sec, reconnect_delay_sec and \
             fast_io_fail_timeout_sec are inconsistent",
        ))
    }
}

/// Options fixed at controller creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerOptions {
    pub header_digest: bool,
    pub data_digest: bool,
    pub num_io_queues: u32,
    pub prchk: PrchkFlags,
    pub ctrlr_loss_timeout_sec: i32,
    pub reconnect_delay_sec: u32,
    pub fast_io_fail_timeout_sec: u32,
    pub fabrics_connect_timeout_us: u64,
    pub from_discovery_service: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            header_digest: false,
            data_digest: false,
            num_io_queues: DEFAULT_IO_QUEUES,
            prchk: PrchkFlags::default(),
            ctrlr_loss_timeout_sec: 0,
            reconnect_delay_sec: 0,
            fast_io_fail_timeout_sec: 0,
            fabrics_connect_timeout_us: 0,
            from_discovery_service: false,
        }
    }
}

impl ControllerOptions {
    pub fn validate(&self) -> Result<()> {
        if self.num_io_queues == 0 || self.num_io_queues > MAX_IO_QUEUES {
            return Err(Error::invalid_argument(format!(
                "num_io_queues out of bounds, min: 1 max: {MAX_IO_QUEUES}"
            )));
        }
        check_reconnect_timeouts(
            self.ctrlr_loss_timeout_sec,
            self.reconnect_delay_sec,
            self.fast_io_fail_timeout_sec,
        )
    }
}

// ── Controller identity and state ──────────────────────────────────────

/// Process-unique controller instance id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ControllerId(pub u64);

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctrlr{}", self.0)
    }
}

/// Controller instance state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Enabled,
    Resetting,
    #[serde(rename = "reconnect_is_delayed")]
    ReconnectDelayed,
    Failed,
    Deleting,
}

impl ControllerState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Resetting => "resetting",
            Self::ReconnectDelayed => "reconnect_is_delayed",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
        }
    }

    /// Whether the instance can serve a new admin sequence
    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
