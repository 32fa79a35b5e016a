//! Reactors: dedicated threads with a single-threaded executor.
//!
//! Reactor 0 is the app reactor, which runs control requests. Reactors
//! 1..=N are workers that own per-core channel state. A reactor accepts
//! closures through its message queue and runs them on its own thread, so
//! anything stored in a reactor's thread-local state is reachable only
//! through [`ReactorHandle::send`], [`ReactorHandle::call`] or
//! [`ReactorHandle::spawn`].

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::thread::JoinHandle;

use nvctl_common::{Error, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::complete::{CompletionReceiver, completion};

/// Name of the app reactor thread
pub const APP_THREAD_NAME: &str = "app_thread";

enum Message {
    Run(Box<dyn FnOnce() + Send>),
    Shutdown,
}

thread_local! {
    static CURRENT: RefCell<Option<ReactorHandle>> = const { RefCell::new(None) };
}

/// Reactor index within its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReactorId(pub u32);

impl fmt::Display for ReactorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cloneable handle for posting work to a reactor
#[derive(Clone)]
pub struct ReactorHandle {
    id: ReactorId,
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Message>,
}

impl fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ReactorHandle {
    #[must_use]
    pub const fn id(&self) -> ReactorId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle of the reactor running the calling thread, if any
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Whether the calling thread is this reactor
    #[must_use]
    pub fn is_current(&self) -> bool {
        CURRENT.with(|c| c.borrow().as_ref().is_some_and(|h| h.id == self.id))
    }

    /// Post a closure to run on this reactor.
    pub fn send<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Message::Run(Box::new(f)))
            .map_err(|_| Error::internal(format!("reactor {} is not running", self.name)))
    }

    /// Run a closure on this reactor and await its return value.
    ///
    /// Resolves to [`Error::Cancelled`] if the reactor stops first.
    pub fn call<F, R>(&self, f: F) -> CompletionReceiver<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = completion();
        // On failure the closure, and with it the sender, is dropped
        let _ = self.send(move || tx.success(f()));
        rx
    }

    /// Build a future on this reactor and drive it there as a local task.
    ///
    /// The future itself never leaves the reactor, so it may hold
    /// thread-bound state across suspension points.
    pub fn spawn<F, Fut, T>(&self, f: F) -> CompletionReceiver<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = completion();
        let _ = self.send(move || {
            tokio::task::spawn_local(async move {
                tx.complete(f().await);
            });
        });
        rx
    }
}

fn run_reactor(
    handle: ReactorHandle,
    runtime: tokio::runtime::Runtime,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    CURRENT.with(|c| *c.borrow_mut() = Some(handle.clone()));
    debug!("Reactor {} started", handle.name());

    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Run(f) => f(),
                Message::Shutdown => break,
            }
        }
    });
    drop(local);

    CURRENT.with(|c| c.borrow_mut().take());
    debug!("Reactor {} stopped", handle.name());
}

/// The app reactor plus a fixed set of worker reactors
pub struct ReactorPool {
    reactors: Vec<ReactorHandle>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ReactorPool {
    /// Start the app reactor and `workers` worker reactors.
    pub fn start(workers: usize) -> Result<Self> {
        let mut reactors = Vec::with_capacity(workers + 1);
        let mut threads = Vec::with_capacity(workers + 1);

        for index in 0..=workers {
            let name: Arc<str> = if index == 0 {
                APP_THREAD_NAME.into()
            } else {
                format!("reactor_{index}").into()
            };
            let id = ReactorId(
                u32::try_from(index).map_err(|_| Error::invalid_argument("too many reactors"))?,
            );
            let (tx, rx) = mpsc::unbounded_channel();
            let handle = ReactorHandle {
                id,
                name: Arc::clone(&name),
                tx,
            };

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let thread_handle = handle.clone();
            let thread = std::thread::Builder::new()
                .name(name.to_string())
                .spawn(move || run_reactor(thread_handle, runtime, rx))?;

            reactors.push(handle);
            threads.push(thread);
        }

        info!("Started reactor pool: app + {} workers", workers);
        Ok(Self {
            reactors,
            threads: Mutex::new(threads),
        })
    }

    /// The reactor that runs control requests
    #[must_use]
    pub fn app(&self) -> &ReactorHandle {
        &self.reactors[0]
    }

    #[must_use]
    pub fn workers(&self) -> &[ReactorHandle] {
        &self.reactors[1..]
    }

    /// Every reactor, app reactor first
    #[must_use]
    pub fn all(&self) -> &[ReactorHandle] {
        &self.reactors
    }

    #[must_use]
    pub fn get(&self, id: ReactorId) -> Option<&ReactorHandle> {
        self.reactors.get(id.0 as usize)
    }

    /// Stop every reactor and join its thread. Work still queued is
    /// dropped, so pending completions resolve as cancelled.
    pub fn shutdown(&self) {
        for reactor in &self.reactors {
            let _ = reactor.tx.send(Message::Shutdown);
        }

        let me = std::thread::current().id();
        for thread in self.threads.lock().drain(..) {
            if thread.thread().id() == me {
                continue;
            }
            if thread.join().is_err() {
                warn!("Reactor thread panicked during shutdown");
            }
        }
    }
}

impl Drop for ReactorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
