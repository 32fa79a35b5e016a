//! nvctl Runtime
//!
//! Execution contexts for the control plane. Every reactor is a dedicated
//! OS thread running a single-threaded executor; state owned by a reactor
//! is only ever touched from that thread.
//!
//! # Architecture
//!
//! ```text
//!        ┌──────────────┐   send / call / spawn   ┌──────────────┐
//!        │  app_thread  │ ──────────────────────▶ │  reactor_1   │
//!        │ (control ops)│ ◀────────────────────── │ (channels)   │
//!        └──────┬───────┘        deliver          └──────────────┘
//!               │  for_each_reactor
//!               ├───────────────────────────────▶ reactor_2 ...
//!               ▼
//!        FanOutReport (first error, per-thread results)
//! ```

pub mod complete;
pub mod dma;
pub mod fanout;
pub mod reactor;

pub use complete::{CompletionReceiver, CompletionSender, Marshal, completion, deliver};
pub use dma::DmaBuf;
pub use fanout::{ChannelOutcome, FanOutReport, for_each_reactor};
pub use reactor::{ReactorHandle, ReactorId, ReactorPool};
