//! Attach and detach pipelines.
//!
//! ```text
//!   AttachRequest ──validate──▶ ValidatedAttach
//!                                    │ (app reactor)
//!         reserve path ─▶ connect ─▶ channels on every reactor
//!                                                   │
//!                 registry insert ◀─ bdevs ◀────────┘
//!                        │
//!                 wait_for_examine ─▶ bdev names
//! ```
//!
//! Validation runs before anything is touched. An admitted path is reserved
//! in the registry until the attach finishes, so a concurrent attach under
//! the same name is judged against it. Once the driver has connected, every
//! failure shuts the new controller down again, except a failure while
//! registering bdevs after at least one was registered, which keeps the
//! path and the bdevs registered so far.

use std::sync::Arc;

use nvctl_common::{
    AddressFamily, ControllerId, ControllerOptions, ControllerState, DEFAULT_IO_QUEUES, Error,
    GlobalOptions, HostId, MAX_BDEVS_PER_ATTACH, MultipathMode, NQN_MAX_LEN, Nqn, PathFilter,
    PathIdentity, PrchkFlags, Result, TRADDR_MAX_LEN, TRSVCID_MAX_LEN, TransportId, TransportKind,
    check_capacity,
};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::channel::for_each_thread;
use crate::driver::Controller;
use crate::plane::PlaneInner;
use crate::registry::{ControllerInstance, ControllerRegistry};

/// Parameters of an attach request as they arrive over the wire
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AttachRequest {
    pub name: String,
    pub trtype: String,
    pub traddr: String,
    pub adrfam: Option<String>,
    pub trsvcid: Option<String>,
    pub priority: Option<String>,
    pub subnqn: Option<String>,
    pub hostnqn: Option<String>,
    pub hostaddr: Option<String>,
    pub hostsvcid: Option<String>,
    pub multipath: Option<String>,
    pub prchk_reftag: bool,
    pub prchk_guard: bool,
    #[serde(alias = "hdgst")]
    pub header_digest: bool,
    #[serde(alias = "ddgst")]
    pub data_digest: bool,
    pub num_io_queues: Option<u32>,
    pub ctrlr_loss_timeout_sec: Option<i32>,
    pub reconnect_delay_sec: Option<u32>,
    pub fast_io_fail_timeout_sec: Option<u32>,
    pub fabrics_connect_timeout_us: Option<u64>,
}

/// An attach request that passed validation
#[derive(Debug, Clone)]
pub struct ValidatedAttach {
    pub name: String,
    pub path: PathIdentity,
    pub opts: ControllerOptions,
    pub mode: Option<MultipathMode>,
}

fn check_opt(field: &str, value: Option<&String>, capacity: usize) -> Result<String> {
    let value = value.cloned().unwrap_or_default();
    check_capacity(field, &value, capacity)?;
    Ok(value)
}

impl AttachRequest {
    /// Minimal request for `name` at `trtype`/`traddr`
    pub fn new(name: &str, trtype: TransportKind, traddr: &str) -> Self {
        Self {
            name: name.to_string(),
            trtype: trtype.trstring().to_string(),
            traddr: traddr.to_string(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_trsvcid(mut self, trsvcid: &str) -> Self {
        self.trsvcid = Some(trsvcid.to_string());
        self
    }

    #[must_use]
    pub fn with_subnqn(mut self, subnqn: &str) -> Self {
        self.subnqn = Some(subnqn.to_string());
        self
    }

    /// Source address the host connects from
    #[must_use]
    pub fn with_hostaddr(mut self, hostaddr: &str) -> Self {
        self.hostaddr = Some(hostaddr.to_string());
        self
    }

    #[must_use]
    pub fn with_multipath(mut self, mode: MultipathMode) -> Self {
        self.multipath = Some(mode.as_str().to_string());
        self
    }

    /// Check every field, in wire order, and fill unset options from the
    /// module-wide defaults.
    pub fn validate(&self, globals: &GlobalOptions) -> Result<ValidatedAttach> {
        if self.name.is_empty() {
            return Err(Error::invalid_argument("Controller name must not be empty"));
        }
        let kind: TransportKind = self.trtype.parse()?;
        check_capacity("traddr", &self.traddr, TRADDR_MAX_LEN)?;
        let adrfam = self
            .adrfam
            .as_deref()
            .map(str::parse::<AddressFamily>)
            .transpose()?;
        let trsvcid = check_opt("trsvcid", self.trsvcid.as_ref(), TRSVCID_MAX_LEN)?;
        let priority = match &self.priority {
            Some(p) => p
                .parse::<i32>()
                .map_err(|_| Error::invalid_argument(format!("Invalid priority: {p}")))?,
            None => 0,
        };
        let subnqn = check_opt("subnqn", self.subnqn.as_ref(), NQN_MAX_LEN + 1)?;
        let hostnqn = match &self.hostnqn {
            Some(h) => {
                check_capacity("hostnqn", h, NQN_MAX_LEN + 1)?;
                h.clone()
            }
            None => Nqn::default_host().as_str().to_string(),
        };
        let hostaddr = check_opt("hostaddr", self.hostaddr.as_ref(), TRADDR_MAX_LEN)?;
        let hostsvcid = check_opt("hostsvcid", self.hostsvcid.as_ref(), TRSVCID_MAX_LEN)?;
        let mode = self
            .multipath
            .as_deref()
            .map(str::parse::<MultipathMode>)
            .transpose()?;

        let opts = ControllerOptions {
            header_digest: self.header_digest,
            data_digest: self.data_digest,
            num_io_queues: self.num_io_queues.unwrap_or(DEFAULT_IO_QUEUES),
            prchk: PrchkFlags {
                reftag: self.prchk_reftag,
                guard: self.prchk_guard,
            },
            ctrlr_loss_timeout_sec: self
                .ctrlr_loss_timeout_sec
                .unwrap_or(globals.ctrlr_loss_timeout_sec),
            reconnect_delay_sec: self
                .reconnect_delay_sec
                .unwrap_or(globals.reconnect_delay_sec),
            fast_io_fail_timeout_sec: self
                .fast_io_fail_timeout_sec
                .unwrap_or(globals.fast_io_fail_timeout_sec),
            fabrics_connect_timeout_us: self.fabrics_connect_timeout_us.unwrap_or(0),
            from_discovery_service: false,
        };
        opts.validate()?;

        Ok(ValidatedAttach {
            name: self.name.clone(),
            path: PathIdentity {
                trid: TransportId {
                    kind,
                    adrfam,
                    traddr: self.traddr.clone(),
                    trsvcid,
                    subnqn,
                    priority,
                },
                host: HostId {
                    hostaddr,
                    hostsvcid,
                },
                hostnqn,
            },
            opts,
            mode,
        })
    }
}

/// Holds an admitted path's place in the registry while its attach is in
/// flight. Released on every exit, including cancellation.
struct Reserved<'a> {
    registry: &'a Mutex<ControllerRegistry>,
    name: &'a str,
    path: PathIdentity,
}

impl Drop for Reserved<'_> {
    fn drop(&mut self) {
        self.registry.lock().release(self.name, &self.path);
    }
}

impl PlaneInner {
    /// Attach one controller path. Runs on the app reactor.
    pub(crate) async fn attach(
        self: &Arc<Self>,
        req: ValidatedAttach,
        discovery: Option<String>,
    ) -> Result<Vec<String>> {
        let ValidatedAttach {
            name,
            path,
            mut opts,
            mode,
        } = req;

        let plan = self.registry.lock().reserve(&name, &path, &opts, mode)?;
        let _reserved = Reserved {
            registry: &self.registry,
            name: &name,
            path: path.clone(),
        };
        opts.prchk = plan.prchk;

        let ctrlr = self.driver.connect(&path, &opts).await?;

        let id = self.registry.lock().next_controller_id();
        if let Err(e) = self.create_channels(id, &ctrlr).await {
            self.destroy_channels(id).await;
            ctrlr.shutdown().await;
            return Err(e);
        }

        // Another path may have created or removed the name meanwhile.
        // Nothing below suspends until the insert.
        let joined = self.registry.lock().find_named(&name).map(|n| n.bdevs.clone());
        let (bdevs, partial) = match joined {
            Some(bdevs) => (bdevs, None),
            None => self.register_namespaces(&name, &ctrlr),
        };
        if bdevs.is_empty()
            && let Some(e) = partial
        {
            debug!("No bdev of {} could be registered: {}", name, e);
            self.destroy_channels(id).await;
            ctrlr.shutdown().await;
            return Err(e);
        }

        let trid = path.trid.clone();
        let instance = ControllerInstance {
            id,
            path,
            opts,
            state: ControllerState::Enabled,
            ctrlr,
            admin_reactor: self.pick_admin_reactor(),
        };
        self.registry
            .lock()
            .insert(&name, plan.mode, instance, bdevs.clone(), discovery);

        self.bdevs.wait_for_examine(&bdevs).await;
        info!("Attached controller {} ({}) at {}", name, id, trid);

        match partial {
            Some(e) => Err(e),
            None => Ok(bdevs),
        }
    }

    async fn create_channels(&self, id: ControllerId, ctrlr: &Arc<dyn Controller>) -> Result<()> {
        let shared = Arc::clone(ctrlr);
        let report = for_each_thread(self.pool.all(), move |ctx| {
            Ok(ctx.create_ctrlr_channel(id, shared.as_ref()))
        })
        .await;
        let created = report.into_result()?;
        let without_qpair = created.iter().filter(|(_, has)| !*has).count();
        if without_qpair > 0 {
            warn!("{} of {} channels of {} have no I/O qpair", without_qpair, created.len(), id);
        }
        Ok(())
    }

    pub(crate) async fn destroy_channels(&self, id: ControllerId) {
        let report = for_each_thread(self.pool.all(), move |ctx| Ok(ctx.destroy_ctrlr_channel(id))).await;
        if let Some(e) = report.first_error() {
            warn!("Failed to destroy every channel of {}: {}", id, e);
        }
    }

    /// Register one bdev per active namespace. Returns the registered
    /// names and the error that stopped registration early, if any.
    fn register_namespaces(
        &self,
        name: &str,
        ctrlr: &Arc<dyn Controller>,
    ) -> (Vec<String>, Option<Error>) {
        let namespaces = ctrlr.namespaces();
        let mut names = Vec::with_capacity(namespaces.len().min(MAX_BDEVS_PER_ATTACH));
        for ns in &namespaces {
            if names.len() == MAX_BDEVS_PER_ATTACH {
                let err = Error::resource_exhausted(format!(
                    "Found {} namespaces but can only report {}",
                    namespaces.len(),
                    MAX_BDEVS_PER_ATTACH
                ));
                return (names, Some(err));
            }
            match self.bdevs.register(name, *ns, Arc::clone(ctrlr)) {
                Ok(bdev) => names.push(bdev),
                Err(e) => return (names, Some(e)),
            }
        }
        (names, None)
    }

    /// Detach the paths of `name` matched by `filter`. Runs on the app
    /// reactor.
    pub(crate) async fn detach(&self, name: &str, filter: &PathFilter) -> Result<()> {
        let ids = self.registry.lock().begin_detach(name, filter)?;

        for id in &ids {
            let ctrlr = self
                .registry
                .lock()
                .instance(*id)
                .map(|(_, instance)| Arc::clone(&instance.ctrlr));
            self.destroy_channels(*id).await;
            if let Some(ctrlr) = ctrlr {
                ctrlr.shutdown().await;
            }
        }

        let detached = self.registry.lock().finish_detach(name, &ids);
        for bdev in &detached.bdevs {
            self.bdevs.unregister(bdev);
        }
        for instance in &detached.instances {
            info!(
                "Detached controller {} ({}) at {}",
                name, instance.id, instance.path.trid
            );
        }
        if !detached.bdevs.is_empty() {
            debug!("Controller {} removed with {} bdevs", name, detached.bdevs.len());
        }
        Ok(())
    }
}
