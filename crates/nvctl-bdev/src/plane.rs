//! The control plane facade.
//!
//! Every request that touches the registry is moved onto the app reactor
//! and awaited from the caller's context. Validation that needs no shared
//! state runs in the caller before anything is scheduled.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use nvctl_common::{
    ControllerState, Error, GlobalOptions, HostId, HotplugConfig, MultipathMode, Nqn, PathFilter,
    PathIdentity, Result, TransportId,
};
use nvctl_runtime::{Marshal, ReactorHandle, ReactorId, ReactorPool, completion, for_each_reactor};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::attach::{AttachRequest, ValidatedAttach};
use crate::bdev::BdevLayer;
use crate::channel::{init_context, teardown_context};
use crate::discovery::{DiscoveryEntry, DiscoveryInfo, DiscoveryRequest};
use crate::driver::{HotplugEvent, Transport};
use crate::health::HealthInfo;
use crate::inject::{ErrorInjectionRequest, RemoveInjectionRequest};
use crate::registry::ControllerRegistry;
use crate::stats::{self, TransportStatistics};

/// Name prefix of controllers attached by the hotplug poller
pub const HOTPLUG_NAME_PREFIX: &str = "HotInNvme";

#[derive(Debug, Default)]
pub(crate) struct HotplugState {
    config: HotplugConfig,
    /// Bumped on every change; a poller exits once it sees a newer value
    generation: u64,
}

/// State shared by every control-plane task
pub(crate) struct PlaneInner {
    pub(crate) pool: Arc<ReactorPool>,
    pub(crate) driver: Arc<dyn Transport>,
    pub(crate) registry: Mutex<ControllerRegistry>,
    pub(crate) bdevs: Arc<BdevLayer>,
    pub(crate) discovery: Mutex<BTreeMap<String, DiscoveryEntry>>,
    pub(crate) options: RwLock<GlobalOptions>,
    hotplug: Mutex<HotplugState>,
    hotplug_seq: AtomicU64,
    next_admin: AtomicUsize,
}

impl PlaneInner {
    /// Round-robin over the workers; the app reactor when there are none.
    pub(crate) fn pick_admin_reactor(&self) -> ReactorId {
        let workers = self.pool.workers();
        if workers.is_empty() {
            return self.pool.app().id();
        }
        let n = self.next_admin.fetch_add(1, Ordering::Relaxed);
        workers[n % workers.len()].id()
    }

    fn set_hotplug(self: &Arc<Self>, config: HotplugConfig) {
        let generation = {
            let mut state = self.hotplug.lock();
            state.config = config;
            state.generation += 1;
            state.generation
        };
        if !config.enabled {
            info!("Hotplug poller disabled");
            return;
        }

        let period = Duration::from_micros(config.effective_period_us());
        info!("Hotplug poller enabled, period {:?}", period);
        tokio::task::spawn_local(hotplug_poller(Arc::downgrade(self), generation, period));
    }

    async fn handle_hotplug(self: &Arc<Self>, event: HotplugEvent) {
        match event {
            HotplugEvent::Inserted(trid) => {
                let known = self
                    .registry
                    .lock()
                    .iter()
                    .any(|n| n.instances.iter().any(|i| i.path.trid.traddr == trid.traddr));
                if known {
                    debug!("Hotplug: {} already attached", trid.traddr);
                    return;
                }
                let name = format!(
                    "{HOTPLUG_NAME_PREFIX}{}",
                    self.hotplug_seq.fetch_add(1, Ordering::Relaxed)
                );
                let opts = {
                    let globals = self.options.read();
                    nvctl_common::ControllerOptions {
                        ctrlr_loss_timeout_sec: globals.ctrlr_loss_timeout_sec,
                        reconnect_delay_sec: globals.reconnect_delay_sec,
                        fast_io_fail_timeout_sec: globals.fast_io_fail_timeout_sec,
                        ..Default::default()
                    }
                };
                let req = ValidatedAttach {
                    name: name.clone(),
                    path: PathIdentity {
                        trid,
                        host: HostId::default(),
                        hostnqn: Nqn::default_host().to_string(),
                    },
                    opts,
                    mode: None,
                };
                match self.attach(req, None).await {
                    Ok(bdevs) => info!("Hotplug attached {} with {} bdevs", name, bdevs.len()),
                    Err(e) => warn!("Hotplug attach of {} failed: {}", name, e),
                }
            }
            HotplugEvent::Removed(trid) => {
                let names: Vec<String> = self
                    .registry
                    .lock()
                    .iter()
                    .filter(|n| n.instances.iter().any(|i| i.path.trid.traddr == trid.traddr))
                    .map(|n| n.name.clone())
                    .collect();
                let filter = PathFilter {
                    traddr: Some(trid.traddr.clone()),
                    ..Default::default()
                };
                for name in names {
                    if let Err(e) = self.detach(&name, &filter).await {
                        warn!("Hotplug removal of {} failed: {}", name, e);
                    }
                }
            }
        }
    }
}

async fn hotplug_poller(plane: Weak<PlaneInner>, generation: u64, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let Some(inner) = plane.upgrade() else {
            break;
        };
        if inner.hotplug.lock().generation != generation {
            break;
        }
        for event in inner.driver.hotplug_scan() {
            inner.handle_hotplug(event).await;
        }
    }
    debug!("Hotplug poller {} stopped", generation);
}

// ── Reports ────────────────────────────────────────────────────────────

/// Host identity of a path as reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostReport {
    pub nqn: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub svcid: String,
}

/// One path of a controller as reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathReport {
    pub state: ControllerState,
    pub trid: TransportId,
    pub host: HostReport,
}

/// One named controller as reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerReport {
    pub name: String,
    pub multipath: MultipathMode,
    pub ctrlrs: Vec<PathReport>,
}

// ── Facade ─────────────────────────────────────────────────────────────

/// Entry point for every control-plane operation
#[derive(Clone)]
pub struct ControlPlane {
    inner: Arc<PlaneInner>,
}

impl ControlPlane {
    /// Validate `options`, install a channel context on every reactor and
    /// return the plane.
    pub async fn start(
        pool: Arc<ReactorPool>,
        driver: Arc<dyn Transport>,
        options: GlobalOptions,
    ) -> Result<Self> {
        options.validate()?;

        let poll_groups = Arc::clone(&driver);
        for_each_reactor(pool.all(), move || {
            let thread = ReactorHandle::current().map(|h| h.name().to_string())?;
            init_context(&thread, poll_groups.create_poll_group());
            Some(Ok(()))
        })
        .await
        .into_result()?;

        let bdevs = BdevLayer::new(pool.app().clone());
        info!("Control plane started on {} reactors", pool.all().len());
        Ok(Self {
            inner: Arc::new(PlaneInner {
                pool,
                driver,
                registry: Mutex::new(ControllerRegistry::new()),
                bdevs,
                discovery: Mutex::new(BTreeMap::new()),
                options: RwLock::new(options),
                hotplug: Mutex::new(HotplugState::default()),
                hotplug_seq: AtomicU64::new(0),
                next_admin: AtomicUsize::new(0),
            }),
        })
    }

    /// Run `f` on the app reactor and await its result.
    async fn on_app<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<PlaneInner>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.inner.pool.app().spawn(move || f(inner)).await
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ReactorPool> {
        &self.inner.pool
    }

    #[must_use]
    pub fn bdevs(&self) -> &Arc<BdevLayer> {
        &self.inner.bdevs
    }

    // ── Options and hotplug ────────────────────────────────────────────

    /// Replace the module-wide options. Refused once any controller exists.
    pub async fn set_options(&self, options: GlobalOptions) -> Result<()> {
        options.validate()?;
        self.on_app(move |inner| async move {
            if !inner.registry.lock().is_empty() {
                return Err(Error::invalid_argument(
                    "Options cannot be changed while controllers exist",
                ));
            }
            *inner.options.write() = options;
            debug!("Module options updated");
            Ok(())
        })
        .await
    }

    #[must_use]
    pub fn get_options(&self) -> GlobalOptions {
        self.inner.options.read().clone()
    }

    /// Start or stop the hotplug poller. Resolves once the change took
    /// effect on the app reactor.
    pub async fn set_hotplug(&self, enabled: bool, period_us: Option<u64>) -> Result<()> {
        let config = HotplugConfig {
            enabled,
            period_us: period_us.unwrap_or(0),
        };
        self.on_app(move |inner| async move {
            inner.set_hotplug(config);
            Ok(())
        })
        .await
    }

    #[must_use]
    pub fn hotplug(&self) -> HotplugConfig {
        self.inner.hotplug.lock().config
    }

    // ── Controllers ────────────────────────────────────────────────────

    /// Attach a controller path. Resolves to the names of the bdevs on it.
    pub async fn attach_controller(&self, req: AttachRequest) -> Result<Vec<String>> {
        let req = req.validate(&self.inner.options.read())?;
        self.on_app(move |inner| async move { inner.attach(req, None).await })
            .await
    }

    /// Detach the paths of `name` matched by `filter`; all paths when the
    /// filter is empty.
    pub async fn detach_controller(&self, name: &str, filter: PathFilter) -> Result<()> {
        let name = name.to_string();
        self.on_app(move |inner| async move { inner.detach(&name, &filter).await })
            .await
    }

    /// Report every controller, or only `name`.
    pub fn get_controllers(&self, name: Option<&str>) -> Result<Vec<ControllerReport>> {
        let registry = self.inner.registry.lock();
        let report = |n: &crate::registry::NamedController| ControllerReport {
            name: n.name.clone(),
            multipath: n.mode,
            ctrlrs: n
                .instances
                .iter()
                .map(|i| PathReport {
                    state: i.state,
                    trid: i.path.trid.clone(),
                    host: HostReport {
                        nqn: i.path.hostnqn.clone(),
                        addr: i.path.host.hostaddr.clone(),
                        svcid: i.path.host.hostsvcid.clone(),
                    },
                })
                .collect(),
        };
        match name {
            Some(name) => registry
                .find_named(name)
                .map(|n| vec![report(n)])
                .ok_or_else(|| Error::not_found(format!("Controller {name} does not exist"))),
            None => Ok(registry.iter().map(report).collect()),
        }
    }

    /// Download `filename` to the controller behind `bdev`, commit it and
    /// reset the controller.
    pub async fn apply_firmware(&self, bdev: &str, filename: impl Into<PathBuf>) -> Result<String> {
        let bdev = bdev.to_string();
        let filename = filename.into();
        self.on_app(move |inner| async move { inner.apply_firmware(&bdev, &filename).await })
            .await
    }

    pub async fn get_transport_statistics(&self) -> Result<TransportStatistics> {
        stats::collect(self.inner.pool.all()).await
    }

    /// Reset the active path of `name`. `done` runs on the calling reactor,
    /// or on the app reactor when the caller is not a reactor.
    pub fn reset_controller_with<F>(&self, name: &str, done: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let origin = ReactorHandle::current().unwrap_or_else(|| self.inner.pool.app().clone());
        self.inner
            .reset_with(name.to_string(), Marshal::new(origin, done));
    }

    pub async fn reset_controller(&self, name: &str) -> Result<()> {
        let (tx, rx) = completion();
        self.reset_controller_with(name, move |result| tx.complete(result));
        rx.await
    }

    /// Health of `name`, or of the first controller when no name is given.
    pub async fn get_controller_health_info(&self, name: Option<&str>) -> Result<HealthInfo> {
        let name = name.map(str::to_string);
        self.on_app(move |inner| async move { inner.health_info(name.as_deref()).await })
            .await
    }

    // ── Discovery ──────────────────────────────────────────────────────

    pub async fn start_discovery(&self, req: DiscoveryRequest) -> Result<()> {
        let req = req.validate(&self.inner.options.read())?;
        self.on_app(move |inner| async move { inner.start_discovery(req).await })
            .await
    }

    pub async fn stop_discovery(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.on_app(move |inner| async move { inner.stop_discovery(&name).await })
            .await
    }

    #[must_use]
    pub fn get_discovery_info(&self) -> Vec<DiscoveryInfo> {
        self.inner.discovery_info()
    }

    // ── Error injection ────────────────────────────────────────────────

    pub async fn add_error_injection(&self, req: ErrorInjectionRequest) -> Result<()> {
        self.on_app(move |inner| async move { inner.add_error_injection(&req).await })
            .await
    }

    pub async fn remove_error_injection(&self, req: RemoveInjectionRequest) -> Result<()> {
        self.on_app(move |inner| async move { inner.remove_error_injection(&req).await })
            .await
    }

    // ── Teardown ───────────────────────────────────────────────────────

    /// Stop every discovery session and the hotplug poller, detach every
    /// controller and drop the reactors' channel contexts.
    pub async fn shutdown(&self) -> Result<()> {
        self.on_app(|inner| async move {
            inner.set_hotplug(HotplugConfig::default());

            let sessions: Vec<String> = inner.discovery.lock().keys().cloned().collect();
            let stops = sessions.iter().map(|name| inner.stop_discovery(name));
            for (name, result) in sessions.iter().zip(join_all(stops).await) {
                if let Err(e) = result {
                    warn!("Failed to stop discovery {} on shutdown: {}", name, e);
                }
            }

            let names: Vec<String> = inner.registry.lock().iter().map(|n| n.name.clone()).collect();
            for name in names {
                if let Err(e) = inner.detach(&name, &PathFilter::default()).await {
                    warn!("Failed to detach {} on shutdown: {}", name, e);
                }
            }
            Ok(())
        })
        .await?;

        for_each_reactor(self.inner.pool.all(), || {
            teardown_context();
            Some(Ok(()))
        })
        .await
        .into_result()?;
        info!("Control plane stopped");
        Ok(())
    }
}
