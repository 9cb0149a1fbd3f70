//! Worker side of the pool.
//!
//! - `executor` — what to do with a claimed task (`TaskExecutor`, `CommandExecutor`)
//! - `runner` — the claim/process/persist loop, sequential or slot-limited parallel
//! - `shutdown` — stop flag wired to SIGINT/SIGTERM

pub mod executor;
pub mod runner;
pub mod shutdown;

pub use executor::{CommandExecutor, TaskExecutor};
pub use runner::{RunSummary, Runner, StopReason};
pub use shutdown::{StopFlag, install_shutdown_handler};
