//! Per-reactor channel contexts.
//!
//! Every reactor owns exactly one [`ChannelContext`]: its poll group and
//! one [`CtrlrChannel`] per attached controller path, each holding that
//! reactor's I/O queue pair. The context lives in thread-local storage, so
//! the only way to reach it is to run code on the owning reactor, which is
//! what [`for_each_thread`] and [`for_each_ctrlr_channel`] do.

use std::cell::RefCell;
use std::collections::BTreeMap;

use nvctl_common::{ControllerId, Result, TransportKind};
use nvctl_runtime::{FanOutReport, ReactorHandle, for_each_reactor};
use tracing::{debug, warn};

use crate::driver::{Controller, IoQpair, PollGroup};
use crate::stats::TransportStats;

thread_local! {
    static CONTEXT: RefCell<Option<ChannelContext>> = const { RefCell::new(None) };
}

/// One controller path's state on one reactor
pub struct CtrlrChannel {
    ctrlr: ControllerId,
    kind: TransportKind,
    qpair: Option<Box<dyn IoQpair>>,
}

impl CtrlrChannel {
    #[must_use]
    pub const fn controller(&self) -> ControllerId {
        self.ctrlr
    }

    #[must_use]
    pub const fn has_qpair(&self) -> bool {
        self.qpair.is_some()
    }

    /// The queue pair, if one exists and is connected
    pub fn active_qpair(&mut self) -> Option<&mut (dyn IoQpair + 'static)> {
        self.qpair.as_deref_mut().filter(|q| q.is_connected())
    }

    pub fn disconnect(&mut self) {
        if let Some(qpair) = self.qpair.as_mut() {
            qpair.disconnect();
        }
    }

    pub fn reconnect(&mut self) -> Result<()> {
        match self.qpair.as_mut() {
            Some(qpair) if !qpair.is_connected() => qpair.reconnect(),
            _ => Ok(()),
        }
    }
}

/// Channel state owned by one reactor
pub struct ChannelContext {
    thread: String,
    poll_group: Box<dyn PollGroup>,
    ctrlrs: BTreeMap<ControllerId, CtrlrChannel>,
}

impl ChannelContext {
    #[must_use]
    pub fn thread(&self) -> &str {
        &self.thread
    }

    #[must_use]
    pub fn poll_group_stats(&self) -> Vec<TransportStats> {
        self.poll_group.stats()
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.ctrlrs.len()
    }

    pub fn ctrlr_channel(&mut self, id: ControllerId) -> Option<&mut CtrlrChannel> {
        self.ctrlrs.get_mut(&id)
    }

    /// Create this reactor's channel for a controller path. A failed queue
    /// pair allocation leaves the channel without a queue pair.
    pub fn create_ctrlr_channel(&mut self, id: ControllerId, ctrlr: &dyn Controller) -> bool {
        let kind = ctrlr.transport();
        let qpair = match ctrlr.alloc_io_qpair() {
            Ok(qpair) => {
                self.poll_group.add_qpair(kind);
                Some(qpair)
            }
            Err(e) => {
                warn!("Failed to allocate I/O qpair for {} on {}: {}", id, self.thread, e);
                None
            }
        };
        let has_qpair = qpair.is_some();
        self.ctrlrs.insert(
            id,
            CtrlrChannel {
                ctrlr: id,
                kind,
                qpair,
            },
        );
        debug!("Created channel for {} on {}", id, self.thread);
        has_qpair
    }

    pub fn destroy_ctrlr_channel(&mut self, id: ControllerId) -> bool {
        match self.ctrlrs.remove(&id) {
            Some(channel) => {
                if channel.qpair.is_some() {
                    self.poll_group.remove_qpair(channel.kind);
                }
                debug!("Destroyed channel for {} on {}", id, self.thread);
                true
            }
            None => false,
        }
    }
}

/// Install the calling reactor's channel context.
pub fn init_context(thread: &str, poll_group: Box<dyn PollGroup>) {
    CONTEXT.with(|c| {
        *c.borrow_mut() = Some(ChannelContext {
            thread: thread.to_string(),
            poll_group,
            ctrlrs: BTreeMap::new(),
        });
    });
}

/// Drop the calling reactor's channel context.
pub fn teardown_context() {
    CONTEXT.with(|c| c.borrow_mut().take());
}

/// Run `f` against the calling reactor's context, if it has one.
pub fn with_context<R>(f: impl FnOnce(&mut ChannelContext) -> R) -> Option<R> {
    CONTEXT.with(|c| c.borrow_mut().as_mut().map(f))
}

/// Run `op` against the channel context of every reactor.
pub async fn for_each_thread<R, F>(reactors: &[ReactorHandle], op: F) -> FanOutReport<R>
where
    F: Fn(&mut ChannelContext) -> Result<R> + Send + Sync + 'static,
    R: Send + 'static,
{
    for_each_reactor(reactors, move || with_context(|ctx| op(ctx))).await
}

/// Run `op` against every channel of one controller path. Reactors without
/// a channel for it are skipped.
pub async fn for_each_ctrlr_channel<R, F>(
    reactors: &[ReactorHandle],
    id: ControllerId,
    op: F,
) -> FanOutReport<R>
where
    F: Fn(&mut CtrlrChannel) -> Result<R> + Send + Sync + 'static,
    R: Send + 'static,
{
    for_each_reactor(reactors, move || {
        with_context(|ctx| ctx.ctrlr_channel(id).map(|ch| op(ch))).flatten()
    })
    .await
}
