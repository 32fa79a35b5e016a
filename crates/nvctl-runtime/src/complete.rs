//! Completion pairs and cross-reactor delivery.
//!
//! Work that finishes on one reactor often has to report back to the
//! reactor that asked for it. A [`completion()`] pair turns a one-shot
//! result into a future; [`deliver`] and [`Marshal`] run a callback on a
//! named origin reactor.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use nvctl_common::{Error, Result};
use tokio::sync::oneshot;

use crate::reactor::ReactorHandle;

/// Sender half of a completion pair.
pub struct CompletionSender<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> CompletionSender<T> {
    /// Send a result.
    pub fn complete(self, result: Result<T>) {
        // Receiver may have been dropped
        let _ = self.tx.send(result);
    }

    /// Send a successful value.
    pub fn success(self, value: T) {
        let _ = self.tx.send(Ok(value));
    }

    /// Send an error.
    pub fn error(self, err: Error) {
        let _ = self.tx.send(Err(err));
    }
}

/// Receiver half of a completion pair.
///
/// Resolves to [`Error::Cancelled`] if the sender is dropped without
/// completing.
pub struct CompletionReceiver<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for CompletionReceiver<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Create a completion sender/receiver pair.
#[must_use]
pub fn completion<T>() -> (CompletionSender<T>, CompletionReceiver<T>) {
    let (tx, rx) = oneshot::channel();
    (CompletionSender { tx }, CompletionReceiver { rx })
}

/// Schedule `f(payload)` on `origin`.
///
/// Always goes through the origin's message queue, even when called from
/// the origin itself, so the callback never runs inside the caller's
/// stack frame.
pub fn deliver<T, F>(origin: &ReactorHandle, payload: T, f: F) -> Result<()>
where
    T: Send + 'static,
    F: FnOnce(T) + Send + 'static,
{
    origin.send(move || f(payload))
}

/// A callback bound to the reactor it must run on.
///
/// Consumed by [`Marshal::deliver`], so an outcome is delivered at most
/// once.
pub struct Marshal<T> {
    origin: ReactorHandle,
    f: Box<dyn FnOnce(T) + Send>,
}

impl<T: Send + 'static> Marshal<T> {
    pub fn new(origin: ReactorHandle, f: impl FnOnce(T) + Send + 'static) -> Self {
        Self {
            origin,
            f: Box::new(f),
        }
    }

    #[must_use]
    pub const fn origin(&self) -> &ReactorHandle {
        &self.origin
    }

    /// Run the callback on its origin reactor.
    pub fn deliver(self, payload: T) -> Result<()> {
        deliver(&self.origin, payload, self.f)
    }
}
