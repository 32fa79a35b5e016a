//! Controller health telemetry.

use std::sync::Arc;

use bytes::Buf;
use nvctl_common::{Error, Result};
use nvctl_runtime::DmaBuf;
use serde::Serialize;
use tracing::error;

use crate::driver::{
    AdminCommand, ControllerData, FEAT_TEMPERATURE_THRESHOLD, HEALTH_LOG_PAGE_SIZE,
    LOG_HEALTH_INFORMATION, NSID_ALL,
};
use crate::plane::PlaneInner;

const KELVIN_OFFSET: i32 = 273;
/// Bytes of the health page that carry fields we decode
const DECODED_LEN: usize = 216;

/// Decoded SMART / health information of one controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthInfo {
    pub model_number: String,
    pub serial_number: String,
    pub firmware_revision: String,
    pub traddr: String,
    pub critical_warning: u8,
    pub temperature_celsius: i32,
    pub temperature_threshold_celsius: i32,
    pub available_spare_percentage: u8,
    pub available_spare_threshold_percentage: u8,
    pub percentage_used: u8,
    pub data_units_read: u128,
    pub data_units_written: u128,
    pub host_read_commands: u128,
    pub host_write_commands: u128,
    pub controller_busy_time: u128,
    pub power_cycles: u128,
    pub power_on_hours: u128,
    pub unsafe_shutdowns: u128,
    pub media_errors: u128,
    pub num_err_log_entries: u128,
    pub warning_temperature_time_minutes: u32,
    pub critical_composite_temperature_time_minutes: u32,
    /// Reported sensors only; unimplemented sensors read as zero
    pub temperature_sensors_celsius: Vec<i32>,
}

fn celsius(kelvin: u16) -> i32 {
    i32::from(kelvin) - KELVIN_OFFSET
}

impl HealthInfo {
    /// Decode a health log page. `threshold` is completion dword 0 of the
    /// temperature threshold feature.
    pub fn decode(data: &ControllerData, traddr: &str, threshold: u32, page: &[u8]) -> Result<Self> {
        if page.len() < DECODED_LEN {
            return Err(Error::internal(format!(
                "health log page too short: {} bytes",
                page.len()
            )));
        }
        let mut buf = page;

        let critical_warning = buf.get_u8();
        let temperature = buf.get_u16_le();
        let available_spare = buf.get_u8();
        let available_spare_threshold = buf.get_u8();
        let percentage_used = buf.get_u8();
        buf.advance(26);

        let mut counters = [0_u128; 10];
        for counter in &mut counters {
            *counter = buf.get_u128_le();
        }
        let warning_time = buf.get_u32_le();
        let critical_time = buf.get_u32_le();
        let temperature_sensors_celsius = (0..8)
            .map(|_| buf.get_u16_le())
            .filter(|k| *k != 0)
            .map(celsius)
            .collect();

        let [
            data_units_read,
            data_units_written,
            host_read_commands,
            host_write_commands,
            controller_busy_time,
            power_cycles,
            power_on_hours,
            unsafe_shutdowns,
            media_errors,
            num_err_log_entries,
        ] = counters;

        Ok(Self {
            model_number: data.model_number.trim().to_string(),
            serial_number: data.serial_number.trim().to_string(),
            firmware_revision: data.firmware_revision.trim().to_string(),
            traddr: traddr.to_string(),
            critical_warning,
            temperature_celsius: celsius(temperature),
            temperature_threshold_celsius: celsius((threshold & 0xFFFF) as u16),
            available_spare_percentage: available_spare,
            available_spare_threshold_percentage: available_spare_threshold,
            percentage_used,
            data_units_read,
            data_units_written,
            host_read_commands,
            host_write_commands,
            controller_busy_time,
            power_cycles,
            power_on_hours,
            unsafe_shutdowns,
            media_errors,
            num_err_log_entries,
            warning_temperature_time_minutes: warning_time,
            critical_composite_temperature_time_minutes: critical_time,
            temperature_sensors_celsius,
        })
    }
}

impl PlaneInner {
    /// Read the health of `name`, or of the first controller when no name
    /// is given. Must run on the app reactor.
    pub(crate) async fn health_info(&self, name: Option<&str>) -> Result<HealthInfo> {
        let (ctrlr, traddr, admin) = {
            let registry = self.registry.lock();
            let named = match name {
                Some(name) => registry
                    .find_named(name)
                    .ok_or_else(|| Error::not_found(format!("Controller {name} does not exist")))?,
                None => registry
                    .iter()
                    .next()
                    .ok_or_else(|| Error::not_found("No NVMe controller found."))?,
            };
            let active = named
                .active()
                .ok_or_else(|| Error::internal(format!("Controller {} has no paths", named.name)))?;
            (
                Arc::clone(&active.ctrlr),
                active.path.trid.traddr.clone(),
                active.admin_reactor,
            )
        };

        let admin = self.pool.get(admin).unwrap_or_else(|| self.pool.app()).clone();
        admin
            .spawn(move || async move {
                let threshold = ctrlr
                    .admin_command(AdminCommand::get_features(FEAT_TEMPERATURE_THRESHOLD), &mut [])
                    .await?;
                let mut page = DmaBuf::alloc(HEALTH_LOG_PAGE_SIZE)?;
                let cmd = AdminCommand::get_log_page(
                    LOG_HEALTH_INFORMATION,
                    NSID_ALL,
                    HEALTH_LOG_PAGE_SIZE as u32,
                );
                ctrlr.admin_command(cmd, page.as_mut_slice()).await?;
                HealthInfo::decode(&ctrlr.data(), &traddr, threshold, page.as_slice())
            })
            .await
            .map_err(|e| {
                error!("Failed to read controller health: {}", e);
                Error::internal("Internal error.")
            })
    }
}
