//! yafaas host library
//!
//! A local function-as-a-service host:
//! - Single-slot event bus between HTTP callers and one worker process
//! - Worker process lifecycle and output relaying
//! - HTTP invocation protocol and graceful server shutdown

pub mod bus;
pub mod server;
pub mod worker;

pub use bus::{BusError, Delivery, Event, EventBus, Outcome};
pub use server::{BoundServer, LifecycleState, ServeError, Server, ServerConfig};
pub use worker::{WorkerConfig, WorkerManager, WorkerState};
