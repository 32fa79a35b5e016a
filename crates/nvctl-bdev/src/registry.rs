//! Controller registry.
//!
//! Maps each user-assigned name to its ordered group of controller paths.
//! Insertion order is path preference order; the first path is the active
//! one in failover mode. The registry is owned by the control plane and
//! mutated only from the app reactor.

use std::collections::BTreeMap;
use std::sync::Arc;

use nvctl_common::{
    ControllerId, ControllerOptions, ControllerState, Error, MultipathMode, PathFilter,
    PathIdentity, PrchkFlags, Result,
};
use nvctl_runtime::ReactorId;
use tracing::{debug, warn};

use crate::driver::Controller;

/// One realized path to a controller
pub struct ControllerInstance {
    pub id: ControllerId,
    pub path: PathIdentity,
    pub opts: ControllerOptions,
    pub state: ControllerState,
    pub ctrlr: Arc<dyn Controller>,
    /// Reactor polling this path's admin queue
    pub admin_reactor: ReactorId,
}

impl std::fmt::Debug for ControllerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerInstance")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("state", &self.state)
            .field("admin_reactor", &self.admin_reactor)
            .finish_non_exhaustive()
    }
}

/// All paths registered under one name
#[derive(Debug)]
pub struct NamedController {
    pub name: String,
    /// Mode requested when the name was first created
    pub mode: MultipathMode,
    pub instances: Vec<ControllerInstance>,
    /// Bdevs built on this controller
    pub bdevs: Vec<String>,
    /// Discovery session that introduced the controller, if any
    pub discovery: Option<String>,
}

impl NamedController {
    /// The preferred path
    #[must_use]
    pub fn active(&self) -> Option<&ControllerInstance> {
        self.instances.first()
    }

    #[must_use]
    pub fn subnqn(&self) -> &str {
        self.active().map_or("", |i| i.path.trid.subnqn.as_str())
    }

    #[must_use]
    pub fn hostnqn(&self) -> &str {
        self.active().map_or("", |i| i.path.hostnqn.as_str())
    }
}

/// Outcome of a successful attach check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachPlan {
    /// Whether the name already exists
    pub existing: bool,
    pub mode: MultipathMode,
    /// Protection flags the new path must use
    pub prchk: PrchkFlags,
}

/// A path admitted by an attach that has not been inserted yet
#[derive(Debug)]
struct Reservation {
    name: String,
    path: PathIdentity,
    prchk: PrchkFlags,
}

/// Name to path-group registry
#[derive(Debug, Default)]
pub struct ControllerRegistry {
    named: BTreeMap<String, NamedController>,
    pending: Vec<Reservation>,
    next_id: u64,
}

impl ControllerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn find_named(&self, name: &str) -> Option<&NamedController> {
        self.named.get(name)
    }

    pub fn find_named_mut(&mut self, name: &str) -> Option<&mut NamedController> {
        self.named.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedController> {
        self.named.values()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.named.is_empty()
    }

    /// Find the name holding a controller path whose subsystem NQN is
    /// `subnqn`.
    #[must_use]
    pub fn find_by_subnqn(&self, subnqn: &str) -> Option<&NamedController> {
        self.named.values().find(|n| n.subnqn() == subnqn)
    }

    pub fn instance(&self, id: ControllerId) -> Option<(&NamedController, &ControllerInstance)> {
        self.named
            .values()
            .find_map(|n| n.instances.iter().find(|i| i.id == id).map(|i| (n, i)))
    }

    /// Decide whether a path may be added under `name`. Never mutates.
    ///
    /// Paths reserved by attaches still in flight count as members of
    /// their name.
    pub fn check_attach(
        &self,
        name: &str,
        path: &PathIdentity,
        opts: &ControllerOptions,
        mode: Option<MultipathMode>,
    ) -> Result<AttachPlan> {
        let existing = self.named.get(name);
        let pending: Vec<&Reservation> = self.pending.iter().filter(|r| r.name == name).collect();
        if existing.is_none() && pending.is_empty() {
            return Ok(AttachPlan {
                existing: false,
                mode: mode.unwrap_or(MultipathMode::Disable),
                prchk: opts.prchk,
            });
        }

        let mode = mode.unwrap_or_else(|| {
            warn!(
                "No multipath mode given for existing controller {}; defaulting to failover. \
                 This default is deprecated, pass the mode explicitly",
                name
            );
            MultipathMode::Failover
        });
        if mode == MultipathMode::Disable {
            return Err(Error::already_exists(format!(
                "A controller named {name} already exists and multipath is disabled"
            )));
        }

        let members: Vec<(&PathIdentity, PrchkFlags)> = existing
            .into_iter()
            .flat_map(|n| n.instances.iter().map(|i| (&i.path, i.opts.prchk)))
            .chain(pending.iter().map(|r| (&r.path, r.prchk)))
            .collect();

        if members.iter().any(|(p, _)| p.same_network_path(path)) {
            return Err(Error::already_exists(format!(
                "A controller named {name} already exists with the specified network path"
            )));
        }

        // Registered paths come first, so this is the active path when
        // there is one
        let Some(&(reference, prchk)) = members.first() else {
            return Err(Error::internal(format!("Controller {name} has no paths")));
        };
        if reference.trid.subnqn != path.trid.subnqn {
            return Err(Error::invalid_argument(format!(
                "A controller named {name} already exists with subnqn {}",
                reference.trid.subnqn
            )));
        }
        if reference.hostnqn != path.hostnqn {
            return Err(Error::invalid_argument(format!(
                "A controller named {name} already exists with hostnqn {}",
                reference.hostnqn
            )));
        }

        if !opts.prchk.is_empty() {
            return Err(Error::invalid_argument(
                "To add a path, do not specify PI options.",
            ));
        }

        Ok(AttachPlan {
            existing: true,
            mode,
            prchk,
        })
    }

    /// Admit a path under `name` and hold its place until [`release`] is
    /// called, so concurrent attaches see it.
    ///
    /// [`release`]: Self::release
    pub fn reserve(
        &mut self,
        name: &str,
        path: &PathIdentity,
        opts: &ControllerOptions,
        mode: Option<MultipathMode>,
    ) -> Result<AttachPlan> {
        let plan = self.check_attach(name, path, opts, mode)?;
        self.pending.push(Reservation {
            name: name.to_string(),
            path: path.clone(),
            prchk: plan.prchk,
        });
        Ok(plan)
    }

    /// Drop the reservation made for `path` under `name`.
    pub fn release(&mut self, name: &str, path: &PathIdentity) {
        if let Some(pos) = self
            .pending
            .iter()
            .position(|r| r.name == name && r.path == *path)
        {
            self.pending.remove(pos);
        }
    }

    /// Number of attaches in flight
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn next_controller_id(&mut self) -> ControllerId {
        self.next_id += 1;
        ControllerId(self.next_id)
    }

    /// Append a path under `name`, creating the name if needed.
    pub fn insert(
        &mut self,
        name: &str,
        mode: MultipathMode,
        instance: ControllerInstance,
        bdevs: Vec<String>,
        discovery: Option<String>,
    ) {
        debug!("Registering {} under {}", instance.id, name);
        let entry = self
            .named
            .entry(name.to_string())
            .or_insert_with(|| NamedController {
                name: name.to_string(),
                mode,
                instances: Vec::new(),
                bdevs: Vec::new(),
                discovery,
            });
        entry.instances.push(instance);
        for bdev in bdevs {
            if !entry.bdevs.contains(&bdev) {
                entry.bdevs.push(bdev);
            }
        }
    }

    /// Returns false for unknown ids and for paths being deleted.
    pub fn set_state(&mut self, id: ControllerId, state: ControllerState) -> bool {
        for named in self.named.values_mut() {
            if let Some(instance) = named.instances.iter_mut().find(|i| i.id == id) {
                // Deleting is final
                if instance.state == ControllerState::Deleting {
                    return false;
                }
                debug!("{} {} -> {}", id, instance.state, state);
                instance.state = state;
                return true;
            }
        }
        false
    }

    /// Mark the paths of `name` matched by `filter` as deleting and return
    /// their ids. Paths already being deleted are not matched again.
    pub fn begin_detach(&mut self, name: &str, filter: &PathFilter) -> Result<Vec<ControllerId>> {
        let named = self
            .named
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("Controller {name} does not exist")))?;

        let mut ids = Vec::new();
        for instance in &mut named.instances {
            if instance.state != ControllerState::Deleting && filter.matches(&instance.path) {
                instance.state = ControllerState::Deleting;
                ids.push(instance.id);
            }
        }
        if ids.is_empty() {
            return Err(Error::not_found(format!(
                "No path of controller {name} matches the given filter"
            )));
        }
        Ok(ids)
    }

    /// Remove the paths `ids` from `name`.
    ///
    /// When the last path goes, the named entry goes with it and its bdev
    /// names are returned.
    pub fn finish_detach(&mut self, name: &str, ids: &[ControllerId]) -> Detached {
        let Some(named) = self.named.get_mut(name) else {
            return Detached::default();
        };
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut named.instances)
            .into_iter()
            .partition(|i| ids.contains(&i.id));
        named.instances = kept;

        let bdevs = if named.instances.is_empty() {
            self.named
                .remove(name)
                .map(|n| n.bdevs)
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        Detached {
            instances: removed,
            bdevs,
        }
    }

    /// Remove the paths of `name` matched by `filter` in one step.
    pub fn detach(&mut self, name: &str, filter: &PathFilter) -> Result<Detached> {
        let ids = self.begin_detach(name, filter)?;
        Ok(self.finish_detach(name, &ids))
    }
}

/// Paths and bdevs released by a detach
#[derive(Debug, Default)]
pub struct Detached {
    pub instances: Vec<ControllerInstance>,
    /// Non-empty only when the named entry itself was removed
    pub bdevs: Vec<String>,
}
