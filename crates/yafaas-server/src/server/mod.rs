//! HTTP front end: protocol routes and server lifecycle.

pub mod lifecycle;
pub mod routes;

pub use lifecycle::{
    BoundServer, LifecycleState, ServeError, Server, ServerConfig, shutdown_signal,
    spawn_signal_listener,
};
pub use routes::{AppState, BANNER, EVENT_ID_HEADER, ROUTE_PREFIX, build_router};
