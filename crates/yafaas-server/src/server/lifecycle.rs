//! Server start, drain and shutdown.
//!
//! Shutdown runs from a single entry point: refuse new submissions, give
//! invocations already accepted the grace period to complete (the worker
//! still polls and posts results meanwhile), then interrupt the worker, stop
//! accepting connections, cancel whatever is still pending and close the bus.

use std::future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use yafaas_core::ServerSettings;

use super::routes::{AppState, build_router};
use crate::bus::EventBus;
use crate::worker::manager::RELAY_DRAIN_TIMEOUT;
use crate::worker::{WorkerConfig, WorkerError, WorkerFault, WorkerManager, WorkerState};

/// Time allowed for connections to wind down after pending bus operations
/// were cancelled.
const FORCE_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// HTTP front end configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Grace period for in-flight requests once shutdown begins.
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            shutdown_grace: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self::new(settings.host.clone(), settings.port)
            .with_shutdown_grace(settings.shutdown_grace())
    }
}

/// Lifecycle of the HTTP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Serving,
    Draining,
    Stopped,
}

/// Errors that end [`BoundServer::serve`].
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    WorkerFault(#[from] WorkerFault),
}

/// A server that has not bound its listener yet.
pub struct Server {
    config: ServerConfig,
    worker: WorkerManager,
    bus: EventBus,
    state_tx: watch::Sender<LifecycleState>,
}

impl Server {
    pub fn new(config: ServerConfig, worker: WorkerConfig) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Starting);
        Self {
            config,
            worker: WorkerManager::new(worker),
            bus: EventBus::new(),
            state_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    /// Bind the listener. Binding before the worker starts lets the worker
    /// receive the real address, including an OS-assigned port.
    pub async fn bind(self) -> Result<BoundServer, ServeError> {
        let addr = self.config.bind_addr();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.state_tx.send_replace(LifecycleState::Stopped);
                return Err(ServeError::Bind { addr, source });
            }
        };
        let local_addr = listener.local_addr()?;
        Ok(BoundServer {
            server: self,
            listener,
            local_addr,
        })
    }
}

/// A server with a bound listener, ready to serve.
pub struct BoundServer {
    server: Server,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BoundServer {
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.server.subscribe()
    }

    pub fn worker_state(&self) -> watch::Receiver<WorkerState> {
        self.server.worker.subscribe()
    }

    /// Start the worker and serve until `shutdown` is cancelled, the server
    /// fails, or the worker faults under the report crash policy.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ServeError> {
        let Self {
            server:
                Server {
                    config,
                    mut worker,
                    bus,
                    state_tx,
                },
            listener,
            local_addr,
        } = self;

        if let Err(e) = worker.start(&local_addr.to_string()) {
            state_tx.send_replace(LifecycleState::Stopped);
            return Err(e.into());
        }
        let fault_rx = worker.take_fault_receiver();

        let state = AppState::new(bus.clone());
        let draining = state.draining.clone();
        let force = state.cancel.clone();
        let stop_accepting = CancellationToken::new();
        let app = build_router(state);
        let mut serve_task = tokio::spawn({
            let stop_accepting = stop_accepting.clone();
            async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(stop_accepting.cancelled_owned())
                    .await
            }
        });
        state_tx.send_replace(LifecycleState::Serving);
        info!(addr = %local_addr, "Server listening");

        let fault = async move {
            match fault_rx {
                Some(rx) => match rx.await {
                    Ok(fault) => fault,
                    Err(_) => future::pending().await,
                },
                None => future::pending().await,
            }
        };

        let mut served = None;
        let mut faulted = None;
        tokio::select! {
            () = shutdown.cancelled() => info!("Shutdown requested"),
            fault = fault => faulted = Some(fault),
            joined = &mut serve_task => {
                error!("Server stopped unexpectedly");
                served = Some(join_result(joined));
            }
        }

        state_tx.send_replace(LifecycleState::Draining);
        draining.cancel();
        if served.is_none() && faulted.is_none() {
            info!(
                grace_secs = config.shutdown_grace.as_secs_f64(),
                "Refusing new events, waiting for in-flight invocations"
            );
            if tokio::time::timeout(config.shutdown_grace, bus.wait_idle())
                .await
                .is_err()
            {
                warn!("Grace period elapsed with invocations still in flight");
            }
        }

        // The worker must be marked as stopping before its long poll is cut.
        if let Err(e) = worker.interrupt() {
            warn!(error = %e, "Failed to interrupt worker");
        }
        stop_accepting.cancel();
        force.cancel();
        bus.close();

        let served = match served {
            Some(result) => result,
            None => match tokio::time::timeout(FORCE_CLOSE_TIMEOUT, &mut serve_task).await {
                Ok(joined) => join_result(joined),
                Err(_) => {
                    warn!("Connections still open, closing them");
                    serve_task.abort();
                    Ok(())
                }
            },
        };

        let limit = worker.config().terminate_timeout + RELAY_DRAIN_TIMEOUT + FORCE_CLOSE_TIMEOUT;
        match tokio::time::timeout(limit, worker.wait_exited()).await {
            Ok(state) => info!(?state, "Worker stopped"),
            Err(_) => warn!("Worker still running at shutdown"),
        }

        state_tx.send_replace(LifecycleState::Stopped);
        info!("Server stopped");

        match faulted {
            Some(fault) => Err(fault.into()),
            None => served,
        }
    }
}

fn join_result(joined: Result<std::io::Result<()>, JoinError>) -> Result<(), ServeError> {
    match joined {
        Ok(result) => result.map_err(ServeError::Io),
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(ServeError::Io(std::io::Error::other(e))),
    }
}

/// Resolve on Ctrl-C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C shutdown signal"),
        () = terminate => info!("Received SIGTERM shutdown signal"),
    }
}

/// Cancel `token` on the first shutdown signal.
pub fn spawn_signal_listener(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            () = shutdown_signal() => token.cancel(),
            () = token.cancelled() => {}
        }
    })
}
