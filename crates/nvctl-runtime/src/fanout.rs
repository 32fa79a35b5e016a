//! Broadcast an operation to every reactor and gather the results.
//!
//! Reactors are visited one at a time in pool order. Each visit runs on
//! the visited reactor's own thread. A failure on one reactor does not stop
//! the broadcast; the first failure in visiting order becomes the overall
//! status once every reactor has answered.

use std::sync::Arc;

use nvctl_common::{Error, Result};
use tracing::debug;

use crate::reactor::{ReactorHandle, ReactorId};

/// Result of one visited reactor
#[derive(Debug)]
pub struct ChannelOutcome<R> {
    pub reactor: ReactorId,
    pub thread: String,
    pub result: Result<R>,
}

/// Aggregated result of a broadcast
#[derive(Debug)]
pub struct FanOutReport<R> {
    outcomes: Vec<ChannelOutcome<R>>,
}

impl<R> FanOutReport<R> {
    /// Per-reactor outcomes in visiting order
    #[must_use]
    pub fn outcomes(&self) -> &[ChannelOutcome<R>] {
        &self.outcomes
    }

    /// Number of reactors that took part
    #[must_use]
    pub fn visited(&self) -> usize {
        self.outcomes.len()
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// First failure in visiting order
    #[must_use]
    pub fn first_error(&self) -> Option<&Error> {
        self.outcomes.iter().find_map(|o| o.result.as_ref().err())
    }

    /// Collapse into the overall status: the first failure, or every
    /// value keyed by thread name.
    pub fn into_result(self) -> Result<Vec<(String, R)>> {
        let mut values = Vec::with_capacity(self.outcomes.len());
        for outcome in self.outcomes {
            values.push((outcome.thread, outcome.result?));
        }
        Ok(values)
    }
}

/// Run `op` on every reactor in `reactors`, one after the other.
///
/// `op` returns `None` when the reactor holds nothing for this broadcast;
/// such reactors are left out of the report.
pub async fn for_each_reactor<R, F>(reactors: &[ReactorHandle], op: F) -> FanOutReport<R>
where
    F: Fn() -> Option<Result<R>> + Send + Sync + 'static,
    R: Send + 'static,
{
    let op = Arc::new(op);
    let mut outcomes = Vec::with_capacity(reactors.len());

    for reactor in reactors {
        let op = Arc::clone(&op);
        let result = match reactor.call(move || op()).await {
            Ok(Some(result)) => result,
            Ok(None) => continue,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            debug!("Fan-out on {} failed: {}", reactor.name(), e);
        }
        outcomes.push(ChannelOutcome {
            reactor: reactor.id(),
            thread: reactor.name().to_string(),
            result,
        });
    }

    FanOutReport { outcomes }
}
