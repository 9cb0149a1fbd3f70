//! taskpool — a shared task pool coordinated only through a document store.
//!
//! Workers claim tasks with revision-checked writes; there is no scheduler
//! process. See `claim` for the protocol and `worker::runner` for the loop.

pub mod claim;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod scrub;
pub mod store;
pub mod submission;
pub mod tasks;
pub mod transport;
pub mod worker;

pub use claim::TaskClaimer;
pub use config::PoolConfig;
pub use context::PoolContext;
pub use error::{Error, Result};
pub use model::{Job, Task};
pub use scrub::{ScrubQueue, Scrubber};
pub use worker::{CommandExecutor, Runner, TaskExecutor};
