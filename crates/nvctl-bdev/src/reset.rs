//! Controller reset.
//!
//! The active path's queue pairs are disconnected on every reactor, the
//! driver reset runs on the path's admin reactor, and the queue pairs are
//! reconnected. The outcome is handed back to the reactor that asked.

use std::sync::Arc;

use nvctl_common::{ControllerState, Error, Result};
use nvctl_runtime::Marshal;
use tracing::{error, info, warn};

use crate::channel::{CtrlrChannel, for_each_ctrlr_channel};
use crate::plane::PlaneInner;

impl PlaneInner {
    /// Reset the active path of `name` and deliver the outcome through
    /// `done`. Runs the sequence on the app reactor.
    pub(crate) fn reset_with(self: &Arc<Self>, name: String, done: Marshal<Result<()>>) {
        let inner = Arc::clone(self);
        let _ = self.pool.app().spawn(move || async move {
            let outcome = inner.reset_active_path(&name).await;
            let origin = done.origin().name().to_string();
            if done.deliver(outcome).is_err() {
                warn!("Reset of {} finished but reactor {} is gone", name, origin);
            }
            Ok(())
        });
    }

    /// Reset the active path of `name`. Must run on the app reactor.
    pub(crate) async fn reset_active_path(&self, name: &str) -> Result<()> {
        let (id, ctrlr, admin) = {
            let mut registry = self.registry.lock();
            let named = registry
                .find_named(name)
                .ok_or_else(|| Error::not_found(format!("Controller {name} does not exist")))?;
            let active = named
                .active()
                .ok_or_else(|| Error::internal(format!("Controller {name} has no paths")))?;
            match active.state {
                ControllerState::Resetting => {
                    return Err(Error::device(
                        libc::EBUSY,
                        format!("Controller {name} is already being reset"),
                    ));
                }
                ControllerState::Deleting => {
                    return Err(Error::device(
                        libc::ENXIO,
                        format!("Controller {name} is being deleted"),
                    ));
                }
                _ => {}
            }
            let picked = (active.id, Arc::clone(&active.ctrlr), active.admin_reactor);
            registry.set_state(picked.0, ControllerState::Resetting);
            picked
        };
        info!("Resetting controller {} ({})", name, id);

        for_each_ctrlr_channel(self.pool.all(), id, |ch| {
            ch.disconnect();
            Ok(())
        })
        .await;

        let admin = self
            .pool
            .get(admin)
            .unwrap_or_else(|| self.pool.app())
            .clone();
        let mut result = admin.spawn(move || async move { ctrlr.reset().await }).await;
        if result.is_ok() {
            result = for_each_ctrlr_channel(self.pool.all(), id, CtrlrChannel::reconnect)
                .await
                .into_result()
                .map(|_| ());
        }

        let state = if result.is_ok() {
            ControllerState::Enabled
        } else {
            ControllerState::Failed
        };
        self.registry.lock().set_state(id, state);

        match &result {
            Ok(()) => info!("Controller {} ({}) reset", name, id),
            Err(e) => error!("Reset of controller {} ({}) failed: {}", name, id, e),
        }
        result
    }
}
