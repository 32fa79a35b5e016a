//! Command error injection.
//!
//! Admin rules go to the admin queue of every path of a controller. I/O
//! rules are broadcast to the controller's channel on every reactor; a
//! channel without a connected queue pair is skipped.

use std::sync::Arc;

use nvctl_common::{ControllerId, Error, Result};
use serde::Deserialize;
use tracing::{debug, error};

use crate::channel::for_each_ctrlr_channel;
use crate::driver::{CommandClass, Controller, ErrorInjection};
use crate::plane::PlaneInner;

const fn default_err_count() -> u32 {
    1
}

/// Parameters of an add request
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInjectionRequest {
    pub name: String,
    pub cmd_type: CommandClass,
    pub opc: u8,
    #[serde(default)]
    pub do_not_submit: bool,
    #[serde(default)]
    pub timeout_in_us: u64,
    #[serde(default = "default_err_count")]
    pub err_count: u32,
    #[serde(default)]
    pub sct: u8,
    #[serde(default)]
    pub sc: u8,
}

impl ErrorInjectionRequest {
    /// Fail the next command of class `cmd_type` with opcode `opc`
    pub fn new(name: &str, cmd_type: CommandClass, opc: u8) -> Self {
        Self {
            name: name.to_string(),
            cmd_type,
            opc,
            do_not_submit: false,
            timeout_in_us: 0,
            err_count: default_err_count(),
            sct: 0,
            sc: 0,
        }
    }

    #[must_use]
    pub const fn rule(&self) -> ErrorInjection {
        ErrorInjection {
            opc: self.opc,
            do_not_submit: self.do_not_submit,
            timeout_in_us: self.timeout_in_us,
            err_count: self.err_count,
            sct: self.sct,
            sc: self.sc,
        }
    }
}

/// Parameters of a remove request
#[derive(Debug, Clone, Deserialize)]
pub struct RemoveInjectionRequest {
    pub name: String,
    pub cmd_type: CommandClass,
    pub opc: u8,
}

impl PlaneInner {
    fn injection_targets(&self, name: &str) -> Result<Vec<(ControllerId, Arc<dyn Controller>)>> {
        let registry = self.registry.lock();
        let named = registry.find_named(name).ok_or_else(|| {
            error!("No controller with specified name was found.");
            Error::not_found(format!("Controller {name} does not exist"))
        })?;
        Ok(named
            .instances
            .iter()
            .map(|i| (i.id, Arc::clone(&i.ctrlr)))
            .collect())
    }

    pub(crate) async fn add_error_injection(&self, req: &ErrorInjectionRequest) -> Result<()> {
        let targets = self.injection_targets(&req.name)?;
        let rule = req.rule();

        let result = match req.cmd_type {
            CommandClass::Admin => targets
                .iter()
                .try_for_each(|(_, ctrlr)| ctrlr.add_admin_error_injection(&rule)),
            CommandClass::Io => {
                let mut status = Ok(());
                for (id, _) in &targets {
                    let report = for_each_ctrlr_channel(self.pool.all(), *id, move |ch| {
                        ch.active_qpair()
                            .map_or(Ok(()), |qpair| qpair.add_error_injection(&rule))
                    })
                    .await;
                    debug!("Injection rule broadcast to {} channels of {}", report.visited(), id);
                    if status.is_ok() {
                        status = report.into_result().map(|_| ());
                    }
                }
                status
            }
        };
        result.map_err(|e| {
            error!("Failed to add error injection on {}: {}", req.name, e);
            Error::device(e.errno(), "Failed to add the error injection.")
        })
    }

    pub(crate) async fn remove_error_injection(&self, req: &RemoveInjectionRequest) -> Result<()> {
        let targets = self.injection_targets(&req.name)?;
        let opc = req.opc;

        match req.cmd_type {
            CommandClass::Admin => {
                for (_, ctrlr) in &targets {
                    ctrlr.remove_admin_error_injection(opc);
                }
            }
            CommandClass::Io => {
                for (id, _) in &targets {
                    for_each_ctrlr_channel(self.pool.all(), *id, move |ch| {
                        if let Some(qpair) = ch.active_qpair() {
                            qpair.remove_error_injection(opc);
                        }
                        Ok(())
                    })
                    .await;
                }
            }
        }
        Ok(())
    }
}
