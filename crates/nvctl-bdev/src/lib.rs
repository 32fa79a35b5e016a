//! nvctl bdev - NVMe block device control plane
//!
//! Attaches NVMe controllers over any supported transport, exposes their
//! namespaces as named block devices and manages them afterwards:
//! multipath groups, resets, firmware updates, health telemetry,
//! discovery sessions, hotplug and error injection.
//!
//! # Architecture
//!
//! ```text
//!   caller ──▶ ControlPlane ──spawn──▶ app reactor ──▶ ControllerRegistry
//!                                          │                 │
//!                 ┌────────────────────────┤                 ▼
//!                 ▼                        ▼            BdevLayer
//!        admin reactor (round-robin)   for_each_reactor
//!        connect / reset / admin cmds   ctrlr channels, poll groups
//!                 │                        │
//!                 └──────────▶ Transport ◀─┘   (driver.rs; sim.rs in tests)
//! ```
//!
//! The registry is only mutated from the app reactor. Per-reactor state
//! (queue pairs, poll groups) lives in thread-local channel contexts and
//! is reached by broadcasting to every reactor.

pub mod attach;
pub mod bdev;
pub mod channel;
pub mod discovery;
pub mod driver;
pub mod firmware;
pub mod health;
pub mod inject;
pub mod plane;
pub mod registry;
pub mod reset;
pub mod sim;
pub mod stats;

pub use attach::AttachRequest;
pub use bdev::{BdevDesc, BdevInfo, BdevLayer, IoChannel, bdev_name};
pub use discovery::{DiscoveryInfo, DiscoveryRequest, DiscoveryState};
pub use driver::{CommandClass, Controller, ControllerData, Transport};
pub use firmware::{FW_CHUNK_SIZE, FW_SUCCESS_MESSAGE};
pub use health::HealthInfo;
pub use inject::{ErrorInjectionRequest, RemoveInjectionRequest};
pub use plane::{ControlPlane, ControllerReport, HostReport, PathReport};
pub use stats::{ThreadStats, TransportStatistics};
