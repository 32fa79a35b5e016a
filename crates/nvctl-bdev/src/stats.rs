//! Transport statistics gathered from every reactor's poll group.

use nvctl_runtime::ReactorHandle;
use serde::Serialize;

use nvctl_common::Result;

use crate::channel::for_each_thread;

/// Counters of one RDMA device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RdmaDeviceStats {
    pub dev_name: String,
    pub polls: u64,
    pub idle_polls: u64,
    pub completions: u64,
    pub queued_requests: u64,
    pub total_send_wrs: u64,
    pub send_doorbell_updates: u64,
    pub total_recv_wrs: u64,
    pub recv_doorbell_updates: u64,
}

/// PCIe poll group counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PcieStats {
    pub polls: u64,
    pub idle_polls: u64,
    pub completions: u64,
    pub cq_mmio_doorbell_updates: u64,
    pub cq_shadow_doorbell_updates: u64,
    pub queued_requests: u64,
    pub submitted_requests: u64,
    pub sq_mmio_doorbell_updates: u64,
    pub sq_shadow_doorbell_updates: u64,
}

/// TCP poll group counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TcpStats {
    pub polls: u64,
    pub idle_polls: u64,
    pub socket_completions: u64,
    pub nvme_completions: u64,
    pub queued_requests: u64,
    pub submitted_requests: u64,
}

/// Counters of one transport within a poll group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "trname")]
pub enum TransportStats {
    #[serde(rename = "RDMA")]
    Rdma { devices: Vec<RdmaDeviceStats> },
    #[serde(rename = "PCIE")]
    Pcie(PcieStats),
    #[serde(rename = "TCP")]
    Tcp(TcpStats),
}

/// Counters of one reactor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadStats {
    pub thread: String,
    pub transports: Vec<TransportStats>,
}

/// Counters of every reactor, in reactor order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportStatistics {
    pub poll_groups: Vec<ThreadStats>,
}

/// Ask every reactor's poll group for its counters.
pub async fn collect(reactors: &[ReactorHandle]) -> Result<TransportStatistics> {
    let report = for_each_thread(reactors, |ctx| Ok(ctx.poll_group_stats())).await;
    let poll_groups = report
        .into_result()?
        .into_iter()
        .map(|(thread, transports)| ThreadStats { thread, transports })
        .collect();
    Ok(TransportStatistics { poll_groups })
}
