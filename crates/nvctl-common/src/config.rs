//! Configuration types for nvctl
//!
//! Module-wide NVMe tunables, the hotplug poller, and the validated target
//! tables (ports, hosts, subsystems) handed over by the config loader.

use crate::error::{Error, Result};
use crate::nqn::Nqn;
use crate::types::{TransportKind, check_reconnect_timeouts};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;

/// Default NVMe-oF service id
pub const DEFAULT_TRSVCID: &str = "4420";

/// Root configuration for the nvctl daemon
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Reactor configuration
    pub reactor: ReactorConfig,
    /// NVMe module options
    pub bdev_nvme: GlobalOptions,
    /// Hotplug poller
    pub hotplug: HotplugConfig,
    /// Target tables
    pub target: TargetConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<()> {
        if self.reactor.workers == 0 {
            return Err(Error::invalid_argument("reactor.workers must be at least 1"));
        }
        self.bdev_nvme.validate()?;
        self.target.validate()
    }
}

/// Reactor configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Number of worker reactors, in addition to the app reactor
    pub workers: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ── NVMe module options ────────────────────────────────────────────────

/// What to do when an I/O or admin command times out
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionOnTimeout {
    #[default]
    None,
    Abort,
    Reset,
}

/// Module-wide NVMe tunables
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalOptions {
    pub action_on_timeout: ActionOnTimeout,
    pub timeout_us: u64,
    pub timeout_admin_us: u64,
    pub keep_alive_timeout_ms: u32,
    pub transport_retry_count: u32,
    pub arbitration_burst: u32,
    pub low_priority_weight: u32,
    pub medium_priority_weight: u32,
    pub high_priority_weight: u32,
    pub nvme_adminq_poll_period_us: u64,
    pub nvme_ioq_poll_period_us: u64,
    pub io_queue_requests: u32,
    pub delay_cmd_submit: bool,
    pub bdev_retry_count: i32,
    pub transport_ack_timeout: u8,
    pub ctrlr_loss_timeout_sec: i32,
    pub reconnect_delay_sec: u32,
    pub fast_io_fail_timeout_sec: u32,
    /// Deadline for each admin round trip of a firmware update; 0 disables
    pub firmware_step_timeout_ms: u64,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            action_on_timeout: ActionOnTimeout::None,
            timeout_us: 0,
            timeout_admin_us: 0,
            keep_alive_timeout_ms: 10_000,
            transport_retry_count: 4,
            arbitration_burst: 0,
            low_priority_weight: 0,
            medium_priority_weight: 0,
            high_priority_weight: 0,
            nvme_adminq_poll_period_us: 10_000,
            nvme_ioq_poll_period_us: 0,
            io_queue_requests: 0,
            delay_cmd_submit: true,
            bdev_retry_count: 3,
            transport_ack_timeout: 0,
            ctrlr_loss_timeout_sec: 0,
            reconnect_delay_sec: 0,
            fast_io_fail_timeout_sec: 0,
            firmware_step_timeout_ms: 30_000,
        }
    }
}

impl GlobalOptions {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_us == 0 && self.timeout_admin_us != 0 {
            return Err(Error::invalid_argument(
                "timeout_admin_us requires timeout_us to be set",
            ));
        }
        if self.arbitration_burst > 7 {
            return Err(Error::invalid_argument(format!(
                "arbitration_burst {} out of range, max 7",
                self.arbitration_burst
            )));
        }
        if self.bdev_retry_count < -1 {
            return Err(Error::invalid_argument(format!(
                "bdev_retry_count {} out of range, min -1",
                self.bdev_retry_count
            )));
        }
        if self.transport_ack_timeout > 31 {
            return Err(Error::invalid_argument(format!(
                "transport_ack_timeout {} out of range, max 31",
                self.transport_ack_timeout
            )));
        }
        check_reconnect_timeouts(
            self.ctrlr_loss_timeout_sec,
            self.reconnect_delay_sec,
            self.fast_io_fail_timeout_sec,
        )
    }
}

// ── Hotplug ────────────────────────────────────────────────────────────

/// Default hotplug poll period
pub const HOTPLUG_DEFAULT_PERIOD_US: u64 = 100_000;
/// Largest accepted hotplug poll period
pub const HOTPLUG_MAX_PERIOD_US: u64 = 10_000_000;

/// Hotplug poller configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotplugConfig {
    pub enabled: bool,
    pub period_us: u64,
}

impl Default for HotplugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            period_us: HOTPLUG_DEFAULT_PERIOD_US,
        }
    }
}

impl HotplugConfig {
    /// Poll period actually used: 0 means default, larger values clamp.
    #[must_use]
    pub fn effective_period_us(&self) -> u64 {
        match self.period_us {
            0 => HOTPLUG_DEFAULT_PERIOD_US,
            p => p.min(HOTPLUG_MAX_PERIOD_US),
        }
    }
}

// ── Target tables ──────────────────────────────────────────────────────

/// A parsed `host[:port]` or `[v6host][:port]` listen address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenAddr {
    pub host: String,
    pub port: String,
}

impl ListenAddr {
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || Error::invalid_argument(format!("Invalid listen address {s}"));

        let (host, rest) = if let Some(v6) = s.strip_prefix('[') {
            let end = v6.find(']').ok_or_else(bad)?;
            (&v6[..end], &v6[end + 1..])
        } else {
            match s.find(':') {
                Some(idx) => (&s[..idx], &s[idx..]),
                None => (s, ""),
            }
        };

        let port = match rest {
            "" => DEFAULT_TRSVCID,
            r => r.strip_prefix(':').ok_or_else(bad)?,
        };
        if host.is_empty() || port.is_empty() || port.parse::<u16>().is_err() {
            return Err(bad());
        }

        Ok(Self {
            host: host.to_string(),
            port: port.to_string(),
        })
    }
}

/// A listening port of the target
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortConfig {
    /// Port id, referenced by subsystem mappings
    pub id: u32,
    pub transport: TransportKind,
    pub listen: Vec<String>,
}

/// A set of initiator networks
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostConfig {
    /// Host id, referenced by subsystem mappings
    pub id: u32,
    /// Allowed networks in `addr/prefix` form
    pub netmasks: Vec<String>,
}

/// Port/host pair a subsystem is exported on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub port: u32,
    pub host: u32,
}

/// An exported subsystem
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubsystemConfig {
    pub nqn: Nqn,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

/// Target tables
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub max_queue_depth: u16,
    pub max_connections_per_session: u16,
    pub ports: Vec<PortConfig>,
    pub hosts: Vec<HostConfig>,
    pub subsystems: Vec<SubsystemConfig>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 128,
            max_connections_per_session: 4,
            ports: Vec::new(),
            hosts: Vec::new(),
            subsystems: Vec::new(),
        }
    }
}

fn check_netmask(mask: &str) -> Result<()> {
    let bad = || Error::invalid_argument(format!("Invalid netmask {mask}"));
    let (addr, prefix) = mask.split_once('/').ok_or_else(bad)?;
    let addr: IpAddr = addr.parse().map_err(|_| bad())?;
    let prefix: u8 = prefix.parse().map_err(|_| bad())?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(bad());
    }
    Ok(())
}

impl TargetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_depth < 2 {
            return Err(Error::invalid_argument("max_queue_depth must be at least 2"));
        }
        if self.max_connections_per_session == 0 {
            return Err(Error::invalid_argument(
                "max_connections_per_session must be at least 1",
            ));
        }

        let mut ports = HashSet::new();
        for port in &self.ports {
            if port.id == 0 || !ports.insert(port.id) {
                return Err(Error::invalid_argument(format!("Invalid port id Port{}", port.id)));
            }
            if port.listen.is_empty() {
                return Err(Error::invalid_argument(format!(
                    "Port{} has no listen addresses",
                    port.id
                )));
            }
            for addr in &port.listen {
                ListenAddr::parse(addr)?;
            }
        }

        let mut hosts = HashSet::new();
        for host in &self.hosts {
            if host.id == 0 || !hosts.insert(host.id) {
                return Err(Error::invalid_argument(format!("Invalid host id Host{}", host.id)));
            }
            if host.netmasks.is_empty() {
                return Err(Error::invalid_argument(format!("Host{} has no netmasks", host.id)));
            }
            for mask in &host.netmasks {
                check_netmask(mask)?;
            }
        }

        for subsystem in &self.subsystems {
            for mapping in &subsystem.mappings {
                if !ports.contains(&mapping.port) {
                    return Err(Error::invalid_argument(format!(
                        "Subsystem {} maps unknown Port{}",
                        subsystem.nqn, mapping.port
                    )));
                }
                if !hosts.contains(&mapping.host) {
                    return Err(Error::invalid_argument(format!(
                        "Subsystem {} maps unknown Host{}",
                        subsystem.nqn, mapping.host
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_addr_parse() {
        let a = ListenAddr::parse("192.168.1.10:4421").unwrap();
        assert_eq!(a.host, "192.168.1.10");
        assert_eq!(a.port, "4421");

        let a = ListenAddr::parse("192.168.1.10").unwrap();
        assert_eq!(a.port, DEFAULT_TRSVCID);

        let a = ListenAddr::parse("[fe80::1]:4430").unwrap();
        assert_eq!(a.host, "fe80::1");
        assert_eq!(a.port, "4430");

        let a = ListenAddr::parse("[fe80::1]").unwrap();
        assert_eq!(a.port, DEFAULT_TRSVCID);

        assert!(ListenAddr::parse("[fe80::1").is_err());
        assert!(ListenAddr::parse("host:notaport").is_err());
        assert!(ListenAddr::parse(":4420").is_err());
    }

    #[test]
    fn test_global_options_defaults_validate() {
        assert!(GlobalOptions::default().validate().is_ok());
    }

    #[test]
    fn test_global_options_rejects_bad_values() {
        let opts = GlobalOptions {
            timeout_admin_us: 100,
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let opts = GlobalOptions {
            transport_ack_timeout: 32,
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let opts = GlobalOptions {
            ctrlr_loss_timeout_sec: 10,
            reconnect_delay_sec: 20,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_hotplug_period() {
        let mut hp = HotplugConfig::default();
        assert_eq!(hp.effective_period_us(), HOTPLUG_DEFAULT_PERIOD_US);
        hp.period_us = 0;
        assert_eq!(hp.effective_period_us(), HOTPLUG_DEFAULT_PERIOD_US);
        hp.period_us = u64::MAX;
        assert_eq!(hp.effective_period_us(), HOTPLUG_MAX_PERIOD_US);
    }

    #[test]
    fn test_daemon_config_from_toml() {
        let text = r#"
            [reactor]
            workers = 4

            [bdev_nvme]
            action_on_timeout = "reset"
            timeout_us = 5000000

            [[target.ports]]
            id = 1
            transport = "tcp"
            listen = ["10.0.0.1:4420", "[::1]"]

            [[target.hosts]]
            id = 1
            netmasks = ["10.0.0.0/24"]

            [[target.subsystems]]
            nqn = "nqn.2016-06.io.spdk:cnode1"
            mappings = [{ port = 1, host = 1 }]
        "#;
        let config: DaemonConfig = toml::from_str(text).unwrap();
        assert_eq!(config.reactor.workers, 4);
        assert_eq!(config.bdev_nvme.action_on_timeout, ActionOnTimeout::Reset);
        assert_eq!(config.bdev_nvme.keep_alive_timeout_ms, 10_000);
        assert_eq!(config.target.ports[0].transport, TransportKind::Tcp);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_target_rejects_unknown_mapping() {
        let text = r#"
            [[ports]]
            id = 1
            transport = "rdma"
            listen = ["10.0.0.1"]

            [[subsystems]]
            nqn = "nqn.2016-06.io.spdk:cnode1"
            mappings = [{ port = 1, host = 7 }]
        "#;
        let target: TargetConfig = toml::from_str(text).unwrap();
        let err = target.validate().unwrap_err();
        assert!(err.message().contains("Host7"));
    }

    #[test]
    fn test_target_rejects_bad_nqn() {
        let text = r#"
            [[subsystems]]
            nqn = "iqn.2016-06.io.spdk:cnode1"
        "#;
        assert!(toml::from_str::<TargetConfig>(text).is_err());
    }

    #[test]
    fn test_target_rejects_bad_netmask() {
        let target = TargetConfig {
            hosts: vec![HostConfig {
                id: 1,
                netmasks: vec!["10.0.0.0/40".to_string()],
            }],
            ..Default::default()
        };
        assert!(target.validate().is_err());
    }
}
