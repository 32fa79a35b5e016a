//! Discovery service sessions.
//!
//! A session keeps a discovery controller connection open and reconciles
//! the advertised log with the registry on every change: new entries are
//! attached, withdrawn ones detached. Each session runs as a local task on
//! the app reactor.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use nvctl_common::{
    AddressFamily, ControllerOptions, Error, GlobalOptions, HostId, MultipathMode, Nqn,
    PathFilter, PathIdentity, Result, TRADDR_MAX_LEN, TRSVCID_MAX_LEN, TransportId,
    TransportKind, check_capacity, nqn::DISCOVERY_NQN,
};
use nvctl_runtime::{CompletionReceiver, CompletionSender, completion};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::attach::ValidatedAttach;
use crate::driver::{DiscoveryLogEntry, DiscoverySession};
use crate::plane::PlaneInner;

/// Parameters of a start request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiscoveryRequest {
    pub name: String,
    pub trtype: String,
    pub traddr: String,
    pub adrfam: Option<String>,
    pub trsvcid: Option<String>,
    pub hostnqn: Option<String>,
    pub wait_for_attach: bool,
    pub ctrlr_loss_timeout_sec: Option<i32>,
    pub reconnect_delay_sec: Option<u32>,
    pub fast_io_fail_timeout_sec: Option<u32>,
}

/// A start request that passed validation
#[derive(Debug, Clone)]
pub struct ValidatedDiscovery {
    pub name: String,
    pub trid: TransportId,
    pub hostnqn: String,
    pub opts: ControllerOptions,
    pub wait_for_attach: bool,
}

impl DiscoveryRequest {
    pub fn new(name: &str, trtype: TransportKind, traddr: &str, trsvcid: &str) -> Self {
        Self {
            name: name.to_string(),
            trtype: trtype.trstring().to_string(),
            traddr: traddr.to_string(),
            trsvcid: Some(trsvcid.to_string()),
            ..Default::default()
        }
    }

    pub fn validate(&self, globals: &GlobalOptions) -> Result<ValidatedDiscovery> {
        if self.name.is_empty() {
            return Err(Error::invalid_argument("Discovery name must not be empty"));
        }
        let kind: TransportKind = self.trtype.parse()?;
        check_capacity("traddr", &self.traddr, TRADDR_MAX_LEN)?;
        let adrfam = self
            .adrfam
            .as_deref()
            .map(str::parse::<AddressFamily>)
            .transpose()?;
        let trsvcid = self.trsvcid.clone().unwrap_or_default();
        check_capacity("trsvcid", &trsvcid, TRSVCID_MAX_LEN)?;
        let hostnqn = match &self.hostnqn {
            Some(h) => Nqn::new(h.clone())?.to_string(),
            None => Nqn::default_host().to_string(),
        };

        let opts = ControllerOptions {
            ctrlr_loss_timeout_sec: self
                .ctrlr_loss_timeout_sec
                .unwrap_or(globals.ctrlr_loss_timeout_sec),
            reconnect_delay_sec: self
                .reconnect_delay_sec
                .unwrap_or(globals.reconnect_delay_sec),
            fast_io_fail_timeout_sec: self
                .fast_io_fail_timeout_sec
                .unwrap_or(globals.fast_io_fail_timeout_sec),
            from_discovery_service: true,
            ..Default::default()
        };
        opts.validate()?;

        Ok(ValidatedDiscovery {
            name: self.name.clone(),
            trid: TransportId {
                kind,
                adrfam,
                traddr: self.traddr.clone(),
                trsvcid,
                subnqn: DISCOVERY_NQN.to_string(),
                priority: 0,
            },
            hostnqn,
            opts,
            wait_for_attach: self.wait_for_attach,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryState {
    Running,
    Stopping,
}

/// One row of the session table
pub(crate) struct DiscoveryEntry {
    trid: TransportId,
    hostnqn: String,
    state: DiscoveryState,
    stop: watch::Sender<bool>,
    /// Resolves when the session task exits; `None` while connecting
    done: Option<CompletionReceiver<()>>,
    ctrlrs: BTreeSet<String>,
}

/// Reported state of a discovery session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryInfo {
    pub name: String,
    pub trid: TransportId,
    pub hostnqn: String,
    pub state: DiscoveryState,
    pub ctrlrs: Vec<String>,
}

/// Entries are keyed by where they point, not by the name they got
type EntryKey = (String, String, String);

fn entry_key(trid: &TransportId) -> EntryKey {
    (trid.traddr.clone(), trid.trsvcid.clone(), trid.subnqn.clone())
}

/// Per-session state that lives only inside the session task
struct SessionState {
    name: String,
    hostnqn: String,
    opts: ControllerOptions,
    known: BTreeMap<EntryKey, String>,
    next_index: u32,
}

impl PlaneInner {
    pub(crate) async fn start_discovery(self: &Arc<Self>, req: ValidatedDiscovery) -> Result<()> {
        let ValidatedDiscovery {
            name,
            trid,
            hostnqn,
            opts,
            wait_for_attach,
        } = req;

        let stop_rx = {
            let mut table = self.discovery.lock();
            if table.contains_key(&name) {
                return Err(Error::already_exists(format!(
                    "Discovery service {name} already exists"
                )));
            }
            if table
                .values()
                .any(|e| e.trid.traddr == trid.traddr && e.trid.trsvcid == trid.trsvcid)
            {
                return Err(Error::already_exists(format!(
                    "A discovery service to {}:{} already exists",
                    trid.traddr, trid.trsvcid
                )));
            }
            let (stop, stop_rx) = watch::channel(false);
            table.insert(
                name.clone(),
                DiscoveryEntry {
                    trid: trid.clone(),
                    hostnqn: hostnqn.clone(),
                    state: DiscoveryState::Running,
                    stop,
                    done: None,
                    ctrlrs: BTreeSet::new(),
                },
            );
            stop_rx
        };

        let session = match self.driver.connect_discovery(&trid, &hostnqn).await {
            Ok(session) => session,
            Err(e) => {
                self.discovery.lock().remove(&name);
                return Err(e);
            }
        };
        info!("Discovery service {} connected to {}", name, trid);

        let (first_round_tx, first_round_rx) = completion::<()>();
        let weak = Arc::downgrade(self);
        let state = SessionState {
            name: name.clone(),
            hostnqn,
            opts,
            known: BTreeMap::new(),
            next_index: 0,
        };
        let done = self.pool.app().spawn(move || async move {
            run_session(weak, state, session, stop_rx, first_round_tx).await;
            Ok(())
        });
        if let Some(entry) = self.discovery.lock().get_mut(&name) {
            entry.done = Some(done);
        }

        if wait_for_attach {
            match first_round_rx.await {
                Ok(()) | Err(Error::Cancelled) => {}
                // The session has already removed its entry
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub(crate) async fn stop_discovery(&self, name: &str) -> Result<()> {
        let done = {
            let mut table = self.discovery.lock();
            let entry = table.get_mut(name).ok_or_else(|| {
                Error::not_found(format!("Discovery service {name} does not exist"))
            })?;
            if entry.state == DiscoveryState::Stopping {
                return Err(Error::invalid_argument(format!(
                    "Discovery service {name} is already stopping"
                )));
            }
            let Some(done) = entry.done.take() else {
                return Err(Error::device(
                    libc::EBUSY,
                    format!("Discovery service {name} is still connecting"),
                ));
            };
            entry.state = DiscoveryState::Stopping;
            entry.stop.send_replace(true);
            done
        };

        if let Err(e) = done.await {
            debug!("Discovery session {} ended with {}", name, e);
        }

        let ctrlrs = self
            .discovery
            .lock()
            .remove(name)
            .map(|e| e.ctrlrs)
            .unwrap_or_default();
        for ctrlr in ctrlrs {
            if let Err(e) = self.detach(&ctrlr, &PathFilter::default()).await {
                debug!("Controller {} of discovery {} already gone: {}", ctrlr, name, e);
            }
        }
        info!("Stopped discovery service {}", name);
        Ok(())
    }

    /// Drop the table entry of a session that ended on its own and detach
    /// the controllers it attached. A session being stopped is left to
    /// [`Self::stop_discovery`].
    async fn retire_discovery(&self, name: &str) {
        let ctrlrs = {
            let mut table = self.discovery.lock();
            if !table
                .get(name)
                .is_some_and(|e| e.state == DiscoveryState::Running)
            {
                return;
            }
            table.remove(name).map(|e| e.ctrlrs).unwrap_or_default()
        };
        info!("Discovery service {} failed and was removed", name);
        for ctrlr in ctrlrs {
            if let Err(e) = self.detach(&ctrlr, &PathFilter::default()).await {
                debug!("Controller {} of discovery {} already gone: {}", ctrlr, name, e);
            }
        }
    }

    #[must_use]
    pub(crate) fn discovery_info(&self) -> Vec<DiscoveryInfo> {
        self.discovery
            .lock()
            .iter()
            .map(|(name, e)| DiscoveryInfo {
                name: name.clone(),
                trid: e.trid.clone(),
                hostnqn: e.hostnqn.clone(),
                state: e.state,
                ctrlrs: e.ctrlrs.iter().cloned().collect(),
            })
            .collect()
    }

    fn has_path(&self, name: &str, trid: &TransportId) -> bool {
        self.registry.lock().find_named(name).is_some_and(|n| {
            n.instances
                .iter()
                .any(|i| i.path.trid.traddr == trid.traddr && i.path.trid.trsvcid == trid.trsvcid)
        })
    }

    fn record_discovered(&self, session: &str, ctrlr: &str, added: bool) {
        if let Some(entry) = self.discovery.lock().get_mut(session) {
            if added {
                entry.ctrlrs.insert(ctrlr.to_string());
            } else {
                entry.ctrlrs.remove(ctrlr);
            }
        }
    }

    async fn discovery_round(
        self: &Arc<Self>,
        state: &mut SessionState,
        entries: &[DiscoveryLogEntry],
        stop: &watch::Receiver<bool>,
    ) {
        let current: BTreeMap<EntryKey, &TransportId> = entries
            .iter()
            .filter(|e| e.trid.subnqn != DISCOVERY_NQN)
            .map(|e| (entry_key(&e.trid), &e.trid))
            .collect();

        let withdrawn: Vec<EntryKey> = state
            .known
            .keys()
            .filter(|k| !current.contains_key(*k))
            .cloned()
            .collect();
        for key in withdrawn {
            let Some(ctrlr) = state.known.remove(&key) else {
                continue;
            };
            let (traddr, trsvcid, subnqn) = key;
            let filter = PathFilter {
                traddr: Some(traddr),
                trsvcid: Some(trsvcid),
                subnqn: Some(subnqn),
                ..Default::default()
            };
            match self.detach(&ctrlr, &filter).await {
                Ok(()) => info!("Discovery {} detached withdrawn path of {}", state.name, ctrlr),
                Err(e) => debug!("Withdrawn path of {} already gone: {}", ctrlr, e),
            }
            if self.registry.lock().find_named(&ctrlr).is_none() {
                self.record_discovered(&state.name, &ctrlr, false);
            }
        }

        for (key, trid) in current {
            if state.known.contains_key(&key) {
                continue;
            }
            if *stop.borrow() {
                debug!("Discovery {} stopping, skipping remaining entries", state.name);
                break;
            }

            let sibling = state
                .known
                .iter()
                .find(|(k, _)| k.2 == key.2)
                .map(|(_, n)| n.clone());
            let (ctrlr, mode) = match sibling {
                Some(existing) => (existing, Some(MultipathMode::Failover)),
                None => {
                    let fresh = format!("{}{}", state.name, state.next_index);
                    state.next_index += 1;
                    (fresh, None)
                }
            };

            let req = ValidatedAttach {
                name: ctrlr.clone(),
                path: PathIdentity {
                    trid: trid.clone(),
                    host: HostId::default(),
                    hostnqn: state.hostnqn.clone(),
                },
                opts: state.opts.clone(),
                mode,
            };
            match self.attach(req, Some(state.name.clone())).await {
                Ok(bdevs) => info!(
                    "Discovery {} attached {} ({} bdevs) at {}",
                    state.name,
                    ctrlr,
                    bdevs.len(),
                    trid
                ),
                Err(e) => warn!("Discovery {} failed to attach {}: {}", state.name, trid, e),
            }
            if self.has_path(&ctrlr, trid) {
                state.known.insert(key, ctrlr.clone());
                self.record_discovered(&state.name, &ctrlr, true);
            }
        }
    }
}

async fn run_session(
    plane: Weak<PlaneInner>,
    mut state: SessionState,
    mut session: Box<dyn DiscoverySession>,
    mut stop: watch::Receiver<bool>,
    first_round: CompletionSender<()>,
) {
    let mut first_round = Some(first_round);
    let failure = loop {
        if *stop.borrow() {
            break None;
        }
        let entries = match session.log_page().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Discovery {} failed to read the log page: {}", state.name, e);
                break Some(e);
            }
        };
        debug!("Discovery {} log has {} entries", state.name, entries.len());

        let Some(inner) = plane.upgrade() else {
            break None;
        };
        inner.discovery_round(&mut state, &entries, &stop).await;
        drop(inner);
        if let Some(tx) = first_round.take() {
            tx.success(());
        }

        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break None;
                }
            }
            changed = session.wait_for_change() => {
                if let Err(e) = changed {
                    warn!("Discovery {} lost its controller: {}", state.name, e);
                    break Some(e);
                }
            }
        }
    };

    if let Some(e) = failure {
        // The table entry goes before the waiting caller hears of the
        // failure, so a retry under the same name is admitted
        if let Some(inner) = plane.upgrade() {
            inner.retire_discovery(&state.name).await;
        }
        if let Some(tx) = first_round.take() {
            tx.error(e);
        }
    }
    debug!("Discovery session {} finished", state.name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_sets_discovery_nqn() {
        let req = DiscoveryRequest::new("disc", TransportKind::Tcp, "10.0.0.100", "8009");
        let v = req.validate(&GlobalOptions::default()).unwrap();
        assert_eq!(v.trid.subnqn, DISCOVERY_NQN);
        assert!(v.opts.from_discovery_service);
        assert!(!v.wait_for_attach);
    }

    #[test]
    fn test_validate_rejects_bad_hostnqn() {
        let mut req = DiscoveryRequest::new("disc", TransportKind::Tcp, "10.0.0.100", "8009");
        req.hostnqn = Some("host-without-prefix".to_string());
        assert!(req.validate(&GlobalOptions::default()).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_trtype() {
        let mut req = DiscoveryRequest::new("disc", TransportKind::Tcp, "10.0.0.100", "8009");
        req.trtype = "ethernet".to_string();
        let err = req.validate(&GlobalOptions::default()).unwrap_err();
        assert_eq!(err.message(), "Failed to parse trtype: ethernet");
    }
}
