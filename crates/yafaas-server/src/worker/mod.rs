//! Worker process management and output relaying.

pub mod manager;
pub mod relay;

pub use manager::{WorkerConfig, WorkerError, WorkerFault, WorkerManager, WorkerState};
pub use relay::{RelayError, ScanMode, relay, spawn_relay};
