//! Firmware update.
//!
//! ```text
//!   load image ─▶ open bdevs ─▶ downloading ─▶ committing ─▶ resetting ─▶ done
//!                      │             │              │             │
//!                      └─────────────┴──────────────┴─────────────┴──▶ failed
//! ```
//!
//! The image goes down in chunks of at most [`FW_CHUNK_SIZE`] bytes. The
//! next chunk is sent only after the previous one completed. Whatever the
//! outcome, the update's buffer, channel and descriptors are released
//! exactly once, descriptors on the reactor that opened them.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nvctl_common::{Error, Result};
use nvctl_runtime::{DmaBuf, ReactorPool};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

use crate::bdev::{BdevDesc, IoChannel};
use crate::driver::{AdminCommand, CommitAction, Controller};
use crate::plane::PlaneInner;

/// Largest firmware download chunk
pub const FW_CHUNK_SIZE: usize = 4096;
/// Firmware slot written by an update; 0 lets the controller choose
pub const FW_COMMIT_SLOT: u8 = 0;

/// Message reported by a successful update
pub const FW_SUCCESS_MESSAGE: &str = "firmware commit succeeded. Controller reset in progress.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FirmwareState {
    Downloading,
    Committing,
    Resetting,
    Done,
    Failed,
}

struct FirmwareUpdate {
    bdev: String,
    ctrlr_name: String,
    ctrlr: Arc<dyn Controller>,
    image: DmaBuf,
    offset: usize,
    remaining: usize,
    descs: Vec<BdevDesc>,
    channel: Option<IoChannel>,
    state: FirmwareState,
}

impl FirmwareUpdate {
    fn cleanup(self, pool: &ReactorPool) {
        let Self {
            bdev,
            image,
            descs,
            channel,
            state,
            ..
        } = self;
        drop(channel);
        for desc in descs {
            let Some(owner) = pool.get(desc.reactor()) else {
                warn!("Reactor {} of descriptor is gone", desc.reactor());
                continue;
            };
            if let Err(e) = desc.close_on_owner(owner) {
                warn!("Failed to close descriptor during firmware cleanup: {}", e);
            }
        }
        drop(image);
        debug!("Firmware update of {} released in state {:?}", bdev, state);
    }
}

/// Keep the driver's code, reword the message.
fn step_failed(e: &Error, message: &str) -> Error {
    let code = match e {
        Error::Device { code, .. } => *code,
        _ => -libc::EIO,
    };
    Error::device(code, message)
}

async fn load_image(filename: &Path) -> Result<DmaBuf> {
    let mut file = tokio::fs::File::open(filename).await.map_err(|e| {
        error!("Failed to open firmware image {}: {}", filename.display(), e);
        Error::internal("open file failed.")
    })?;
    let size = file
        .metadata()
        .await
        .map_err(|_| Error::internal("open file failed."))?
        .len();
    if size == 0 || size % 4 != 0 {
        return Err(Error::invalid_argument(
            "Firmware image size is not multiple of 4.",
        ));
    }
    let size = usize::try_from(size).map_err(|_| Error::resource_exhausted("Memory allocation error."))?;

    let mut image = DmaBuf::alloc(size)?;
    file.read_exact(image.as_mut_slice()).await.map_err(|e| {
        error!("Failed to read firmware image {}: {}", filename.display(), e);
        Error::internal("Read firmware image failed!")
    })?;
    Ok(image)
}

impl PlaneInner {
    /// Download, commit and activate a firmware image on the controller
    /// behind `bdev`. Must run on the app reactor.
    pub(crate) async fn apply_firmware(&self, bdev: &str, filename: &Path) -> Result<String> {
        let info = self
            .bdevs
            .get(bdev)
            .ok_or_else(|| Error::not_found(format!("bdev {bdev} were not found")))?;
        let ctrlr = self
            .registry
            .lock()
            .find_named(&info.ctrlr_name)
            .and_then(|n| n.active().map(|i| Arc::clone(&i.ctrlr)))
            .ok_or_else(|| {
                Error::not_found(format!("Controller information for {bdev} were not found."))
            })?;
        let image = load_image(filename).await?;

        let remaining = image.len();
        let mut update = FirmwareUpdate {
            bdev: bdev.to_string(),
            ctrlr_name: info.ctrlr_name,
            ctrlr,
            image,
            offset: 0,
            remaining,
            descs: Vec::new(),
            channel: None,
            state: FirmwareState::Downloading,
        };

        let result = self.run_update(&mut update).await;
        if let Err(e) = &result {
            update.state = FirmwareState::Failed;
            error!("Firmware update of {} failed: {}", bdev, e);
        }
        update.cleanup(&self.pool);
        result
    }

    async fn run_update(&self, update: &mut FirmwareUpdate) -> Result<String> {
        for name in self.bdevs.names_for_controller(&update.ctrlr_name) {
            match self.bdevs.open(&name, true) {
                Ok(desc) => update.descs.push(desc),
                Err(e) if e.errno() == -libc::EPERM => {
                    return Err(Error::device(libc::EBUSY, format!("Device {name} is in use.")));
                }
                Err(e) => return Err(e),
            }
        }
        let desc = update
            .descs
            .iter()
            .find(|d| d.bdev_name() == update.bdev)
            .ok_or_else(|| Error::internal("No descriptor were found."))?;
        let channel = desc
            .get_io_channel()
            .map_err(|_| Error::internal("No channels were found."))?;
        update.channel = Some(channel);

        let deadline = self.options.read().firmware_step_timeout_ms;
        info!(
            "Downloading {} byte firmware image to {}",
            update.remaining, update.ctrlr_name
        );

        update.state = FirmwareState::Downloading;
        while update.remaining > 0 {
            let transfer = update.remaining.min(FW_CHUNK_SIZE);
            let offset = update.offset;
            let cmd = AdminCommand::firmware_download(
                u32::try_from(offset).map_err(|_| Error::internal("firmware offset overflow"))?,
                u32::try_from(transfer).map_err(|_| Error::internal("firmware chunk overflow"))?,
            );
            let chunk = &mut update.image.as_mut_slice()[offset..offset + transfer];
            admin_step(update.ctrlr.as_ref(), cmd, chunk, deadline)
                .await
                .map_err(|e| step_failed(&e, "firmware download failed."))?;

            update.offset += transfer;
            update.remaining -= transfer;
            debug!(
                "Firmware chunk at {} ({} bytes) done, {} remaining",
                offset, transfer, update.remaining
            );
        }

        update.state = FirmwareState::Committing;
        let cmd = AdminCommand::firmware_commit(FW_COMMIT_SLOT, CommitAction::ReplaceAndEnableImg);
        admin_step(update.ctrlr.as_ref(), cmd, &mut [], deadline)
            .await
            .map_err(|e| step_failed(&e, "firmware commit failed."))?;

        update.state = FirmwareState::Resetting;
        self.reset_active_path(&update.ctrlr_name)
            .await
            .map_err(|e| step_failed(&e, "Controller reset failed."))?;

        update.state = FirmwareState::Done;
        info!("Firmware of {} committed", update.ctrlr_name);
        Ok(FW_SUCCESS_MESSAGE.to_string())
    }
}

/// One admin round trip under the per-step deadline; 0 waits forever.
async fn admin_step(
    ctrlr: &dyn Controller,
    cmd: AdminCommand,
    buf: &mut [u8],
    deadline_ms: u64,
) -> Result<u32> {
    if deadline_ms == 0 {
        return ctrlr.admin_command(cmd, buf).await;
    }
    tokio::time::timeout(
        Duration::from_millis(deadline_ms),
        ctrlr.admin_command(cmd, buf),
    )
    .await
    .map_err(|_| {
        Error::device(
            libc::ETIMEDOUT,
            format!("admin command {:#04x} timed out", cmd.opc),
        )
    })?
}
