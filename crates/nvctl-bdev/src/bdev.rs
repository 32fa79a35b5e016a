//! Block devices built on controller namespaces.
//!
//! Each active namespace of a controller becomes a bdev named
//! `<controller>n<nsid>`. Registration starts an asynchronous examine pass
//! on the app reactor; [`BdevLayer::wait_for_examine`] resolves once every
//! named bdev has finished it.
//!
//! Descriptors remember the reactor that opened them and may only be
//! closed there. I/O channels are bound to the opening thread.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use nvctl_common::{Error, Result};
use nvctl_runtime::{ReactorHandle, ReactorId, deliver};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::driver::{Controller, NamespaceInfo};

/// Name of the bdev exposing namespace `nsid` of controller `ctrlr`
#[must_use]
pub fn bdev_name(ctrlr: &str, nsid: u32) -> String {
    format!("{ctrlr}n{nsid}")
}

/// Snapshot of a registered bdev
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BdevInfo {
    pub name: String,
    pub ctrlr_name: String,
    pub nsid: u32,
    pub block_size: u32,
    pub num_blocks: u64,
    pub examined: bool,
    pub open_descriptors: usize,
    pub io_channels: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
}

struct BdevEntry {
    ctrlr_name: String,
    ns: NamespaceInfo,
    examined: watch::Sender<bool>,
    descs: BTreeMap<u64, ReactorId>,
    channels: usize,
    claim: Option<String>,
}

impl BdevEntry {
    fn info(&self, name: &str) -> BdevInfo {
        BdevInfo {
            name: name.to_string(),
            ctrlr_name: self.ctrlr_name.clone(),
            nsid: self.ns.nsid,
            block_size: self.ns.block_size,
            num_blocks: self.ns.num_blocks,
            examined: *self.examined.borrow(),
            open_descriptors: self.descs.len(),
            io_channels: self.channels,
            claimed_by: self.claim.clone(),
        }
    }
}

/// Registry of bdevs and their open descriptors
pub struct BdevLayer {
    app: ReactorHandle,
    bdevs: Mutex<BTreeMap<String, BdevEntry>>,
    next_desc: AtomicU64,
}

impl BdevLayer {
    #[must_use]
    pub fn new(app: ReactorHandle) -> Arc<Self> {
        Arc::new(Self {
            app,
            bdevs: Mutex::new(BTreeMap::new()),
            next_desc: AtomicU64::new(1),
        })
    }

    /// Register the bdev for one namespace and queue its examine pass.
    pub fn register(
        self: &Arc<Self>,
        ctrlr_name: &str,
        ns: NamespaceInfo,
        ctrlr: Arc<dyn Controller>,
    ) -> Result<String> {
        let name = bdev_name(ctrlr_name, ns.nsid);
        {
            let mut bdevs = self.bdevs.lock();
            if bdevs.contains_key(&name) {
                return Err(Error::already_exists(format!("bdev {name} already exists")));
            }
            let (examined, _) = watch::channel(false);
            bdevs.insert(
                name.clone(),
                BdevEntry {
                    ctrlr_name: ctrlr_name.to_string(),
                    ns,
                    examined,
                    descs: BTreeMap::new(),
                    channels: 0,
                    claim: None,
                },
            );
        }
        debug!("Registered bdev {}", name);

        let layer = Arc::clone(self);
        let examine_name = name.clone();
        // Completion is observed through the examined flag
        let _ = self.app.spawn(move || async move {
            layer.examine(&examine_name, ctrlr.as_ref(), ns.nsid).await;
            Ok(())
        });
        Ok(name)
    }

    async fn examine(&self, name: &str, ctrlr: &dyn Controller, nsid: u32) {
        let geometry = ctrlr.identify_namespace(nsid).await;
        let mut bdevs = self.bdevs.lock();
        let Some(entry) = bdevs.get_mut(name) else {
            return;
        };
        match geometry {
            Ok(ns) => entry.ns = ns,
            Err(e) => warn!("Examine of bdev {} failed: {}", name, e),
        }
        entry.examined.send_replace(true);
        debug!("Examined bdev {}", name);
    }

    /// Wait until every listed bdev finished its examine pass. Bdevs that
    /// are unknown or get unregistered meanwhile count as examined.
    pub async fn wait_for_examine(&self, names: &[String]) {
        let pending: Vec<_> = {
            let bdevs = self.bdevs.lock();
            names
                .iter()
                .filter_map(|n| bdevs.get(n).map(|e| e.examined.subscribe()))
                .collect()
        };
        for mut rx in pending {
            let _ = rx.wait_for(|done| *done).await;
        }
    }

    /// Remove a bdev. Open descriptors are left dangling and their close
    /// becomes a no-op.
    pub fn unregister(&self, name: &str) -> Option<BdevInfo> {
        let entry = self.bdevs.lock().remove(name)?;
        if !entry.descs.is_empty() {
            warn!(
                "Unregistering bdev {} with {} open descriptors",
                name,
                entry.descs.len()
            );
        }
        debug!("Unregistered bdev {}", name);
        Some(entry.info(name))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<BdevInfo> {
        self.bdevs.lock().get(name).map(|e| e.info(name))
    }

    #[must_use]
    pub fn list(&self) -> Vec<BdevInfo> {
        self.bdevs
            .lock()
            .iter()
            .map(|(name, e)| e.info(name))
            .collect()
    }

    /// Names of every bdev built on controller `ctrlr_name`
    #[must_use]
    pub fn names_for_controller(&self, ctrlr_name: &str) -> Vec<String> {
        self.bdevs
            .lock()
            .iter()
            .filter(|(_, e)| e.ctrlr_name == ctrlr_name)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Take the write claim of a bdev on behalf of `module`.
    pub fn claim(&self, name: &str, module: &str) -> Result<()> {
        let mut bdevs = self.bdevs.lock();
        let entry = bdevs
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("bdev {name} were not found")))?;
        if let Some(owner) = &entry.claim {
            return Err(Error::device(
                libc::EPERM,
                format!("bdev {name} already claimed by {owner}"),
            ));
        }
        entry.claim = Some(module.to_string());
        Ok(())
    }

    pub fn release_claim(&self, name: &str) {
        if let Some(entry) = self.bdevs.lock().get_mut(name) {
            entry.claim = None;
        }
    }

    /// Open a descriptor on the calling reactor.
    ///
    /// A write open of a claimed bdev fails with `EPERM`.
    pub fn open(self: &Arc<Self>, name: &str, write: bool) -> Result<BdevDesc> {
        let reactor = ReactorHandle::current()
            .ok_or_else(|| Error::internal("bdev descriptors must be opened on a reactor"))?;

        let mut bdevs = self.bdevs.lock();
        let entry = bdevs
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("bdev {name} were not found")))?;
        if write && let Some(owner) = &entry.claim {
            return Err(Error::device(
                libc::EPERM,
                format!("bdev {name} is claimed by {owner}"),
            ));
        }

        let id = self.next_desc.fetch_add(1, Ordering::Relaxed);
        entry.descs.insert(id, reactor.id());
        debug!("Opened descriptor {} of bdev {} on {}", id, name, reactor.name());
        Ok(BdevDesc {
            id,
            bdev: name.to_string(),
            reactor: reactor.id(),
            write,
            layer: Arc::clone(self),
        })
    }

    fn release_desc(&self, name: &str, id: u64) {
        if let Some(entry) = self.bdevs.lock().get_mut(name) {
            entry.descs.remove(&id);
        }
    }

    fn adjust_channels(&self, name: &str, opened: bool) {
        if let Some(entry) = self.bdevs.lock().get_mut(name) {
            if opened {
                entry.channels += 1;
            } else {
                entry.channels = entry.channels.saturating_sub(1);
            }
        }
    }
}

/// An open bdev descriptor, tied to the reactor that opened it
pub struct BdevDesc {
    id: u64,
    bdev: String,
    reactor: ReactorId,
    write: bool,
    layer: Arc<BdevLayer>,
}

impl std::fmt::Debug for BdevDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BdevDesc")
            .field("id", &self.id)
            .field("bdev", &self.bdev)
            .field("reactor", &self.reactor)
            .field("write", &self.write)
            .finish_non_exhaustive()
    }
}

impl BdevDesc {
    #[must_use]
    pub fn bdev_name(&self) -> &str {
        &self.bdev
    }

    /// Reactor that opened this descriptor
    #[must_use]
    pub const fn reactor(&self) -> ReactorId {
        self.reactor
    }

    #[must_use]
    pub const fn is_write(&self) -> bool {
        self.write
    }

    fn on_owner(&self) -> bool {
        ReactorHandle::current().is_some_and(|h| h.id() == self.reactor)
    }

    /// Get an I/O channel for this descriptor on its owning reactor.
    pub fn get_io_channel(&self) -> Result<IoChannel> {
        if !self.on_owner() {
            return Err(Error::internal(format!(
                "I/O channel of bdev {} requested off reactor {}",
                self.bdev, self.reactor
            )));
        }
        self.layer.adjust_channels(&self.bdev, true);
        Ok(IoChannel {
            bdev: self.bdev.clone(),
            layer: Arc::clone(&self.layer),
            _thread_bound: PhantomData,
        })
    }

    /// Close the descriptor. Must run on the owning reactor; anywhere
    /// else the close is refused and the descriptor stays recorded as open.
    pub fn close(self) -> Result<()> {
        if !self.on_owner() {
            error!(
                "Descriptor {} of bdev {} closed off its reactor {}",
                self.id, self.bdev, self.reactor
            );
            return Err(Error::internal(format!(
                "descriptor of bdev {} must be closed on reactor {}",
                self.bdev, self.reactor
            )));
        }
        self.layer.release_desc(&self.bdev, self.id);
        debug!("Closed descriptor {} of bdev {}", self.id, self.bdev);
        Ok(())
    }

    /// Close on `owner`, directly if it is the calling reactor and through
    /// its message queue otherwise.
    pub fn close_on_owner(self, owner: &ReactorHandle) -> Result<()> {
        if owner.id() != self.reactor {
            return Err(Error::invalid_argument(format!(
                "reactor {} does not own descriptor of bdev {}",
                owner.name(),
                self.bdev
            )));
        }
        if owner.is_current() {
            return self.close();
        }
        deliver(owner, self, |desc| {
            if let Err(e) = desc.close() {
                warn!("Deferred descriptor close failed: {}", e);
            }
        })
    }
}

/// A per-thread I/O channel of a bdev
pub struct IoChannel {
    bdev: String,
    layer: Arc<BdevLayer>,
    _thread_bound: PhantomData<*const ()>,
}

impl IoChannel {
    #[must_use]
    pub fn bdev_name(&self) -> &str {
        &self.bdev
    }
}

impl Drop for IoChannel {
    fn drop(&mut self) {
        self.layer.adjust_channels(&self.bdev, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Transport;
    use crate::sim::{SimTarget, SimTransport};
    use nvctl_common::{ControllerOptions, HostId, PathIdentity, TransportId, TransportKind};
    use nvctl_runtime::ReactorPool;

    async fn setup(pool: &ReactorPool) -> (Arc<BdevLayer>, Arc<dyn Controller>) {
        let sim = SimTransport::new(TransportKind::Tcp);
        sim.add_target(
            SimTarget::new("10.0.0.1", "4420", "nqn.2016-06.io.spdk:cnode1").with_namespaces(2),
        );
        let path = PathIdentity {
            trid: TransportId::new(TransportKind::Tcp, "10.0.0.1").with_trsvcid("4420"),
            host: HostId::default(),
            hostnqn: String::new(),
        };
        let ctrlr = sim.connect(&path, &ControllerOptions::default()).await.unwrap();
        (BdevLayer::new(pool.app().clone()), ctrlr)
    }

    fn placeholder(nsid: u32) -> NamespaceInfo {
        NamespaceInfo {
            nsid,
            block_size: 0,
            num_blocks: 0,
        }
    }

    #[tokio::test]
    async fn test_examine_fills_geometry() {
        let pool = ReactorPool::start(1).unwrap();
        let (layer, ctrlr) = setup(&pool).await;

        let a = layer.register("Nvme0", placeholder(1), Arc::clone(&ctrlr)).unwrap();
        let b = layer.register("Nvme0", placeholder(2), Arc::clone(&ctrlr)).unwrap();
        assert_eq!(a, "Nvme0n1");
        assert_eq!(b, "Nvme0n2");

        layer.wait_for_examine(&[a.clone(), b]).await;
        let info = layer.get(&a).unwrap();
        assert!(info.examined);
        assert_eq!(info.block_size, 4096);
        assert_eq!(layer.names_for_controller("Nvme0").len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_register_fails() {
        let pool = ReactorPool::start(1).unwrap();
        let (layer, ctrlr) = setup(&pool).await;

        layer.register("Nvme0", placeholder(1), Arc::clone(&ctrlr)).unwrap();
        let err = layer.register("Nvme0", placeholder(1), ctrlr).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_foreign_close_is_refused() {
        let pool = ReactorPool::start(1).unwrap();
        let (layer, ctrlr) = setup(&pool).await;
        layer.register("Nvme0", placeholder(1), ctrlr).unwrap();

        let worker = pool.workers()[0].clone();
        let opener = Arc::clone(&layer);
        let desc = worker
            .call(move || opener.open("Nvme0n1", true))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(desc.reactor(), worker.id());

        // The app reactor does not own it
        let err = pool.app().call(move || desc.close()).await.unwrap();
        assert!(err.is_err());
        assert_eq!(layer.get("Nvme0n1").unwrap().open_descriptors, 1);
    }

    #[tokio::test]
    async fn test_close_on_owner_from_other_reactor() {
        let pool = ReactorPool::start(1).unwrap();
        let (layer, ctrlr) = setup(&pool).await;
        layer.register("Nvme0", placeholder(1), ctrlr).unwrap();

        let worker = pool.workers()[0].clone();
        let opener = Arc::clone(&layer);
        let desc = worker
            .call(move || opener.open("Nvme0n1", false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(layer.get("Nvme0n1").unwrap().open_descriptors, 1);

        let owner = worker.clone();
        pool.app()
            .call(move || desc.close_on_owner(&owner))
            .await
            .unwrap()
            .unwrap();
        // Flush the worker queue so the deferred close has run
        worker.call(|| ()).await.unwrap();
        assert_eq!(layer.get("Nvme0n1").unwrap().open_descriptors, 0);
    }

    #[tokio::test]
    async fn test_claim_blocks_write_open() {
        let pool = ReactorPool::start(1).unwrap();
        let (layer, ctrlr) = setup(&pool).await;
        layer.register("Nvme0", placeholder(1), ctrlr).unwrap();
        layer.claim("Nvme0n1", "raid").unwrap();

        let opener = Arc::clone(&layer);
        let result = pool
            .app()
            .call(move || {
                let write = opener.open("Nvme0n1", true).map(|_| ());
                let read = opener.open("Nvme0n1", false).and_then(BdevDesc::close);
                (write, read)
            })
            .await
            .unwrap();
        assert_eq!(result.0.unwrap_err().errno(), -libc::EPERM);
        assert!(result.1.is_ok());

        layer.release_claim("Nvme0n1");
        assert!(layer.get("Nvme0n1").unwrap().claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_io_channel_count() {
        let pool = ReactorPool::start(1).unwrap();
        let (layer, ctrlr) = setup(&pool).await;
        layer.register("Nvme0", placeholder(1), ctrlr).unwrap();

        let opener = Arc::clone(&layer);
        let counts = pool
            .app()
            .call(move || {
                let desc = opener.open("Nvme0n1", false)?;
                let channel = desc.get_io_channel()?;
                let during = opener.get("Nvme0n1").map(|i| i.io_channels);
                drop(channel);
                let after = opener.get("Nvme0n1").map(|i| i.io_channels);
                desc.close()?;
                Ok::<_, Error>((during, after))
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counts, (Some(1), Some(0)));
    }
}
