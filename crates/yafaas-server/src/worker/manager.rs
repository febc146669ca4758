//! Worker process lifecycle manager.
//!
//! Spawns the single worker process, relays its output, delivers the
//! shutdown interrupt and supervises its exit. An exit the host did not ask
//! for is a fault: by default the whole host exits with it.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use yafaas_core::{CrashPolicy, WorkerSettings};

use super::relay::{ScanMode, spawn_relay};

/// How long relays may keep draining the pipes after the worker exited.
/// Grandchildren that inherited the pipes can hold them open past the exit.
pub const RELAY_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for the worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Executable to run.
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Variable that carries the host's callback address.
    pub callback_env: String,
    /// Additional variables on top of the inherited environment.
    pub extra_env: Vec<(String, String)>,
    pub log_prefix: bool,
    pub scan_mode: ScanMode,
    /// Time allowed between the interrupt and SIGKILL.
    pub terminate_timeout: Duration,
    pub crash_policy: CrashPolicy,
}

impl WorkerConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self::from(&WorkerSettings {
            program: program.into(),
            ..WorkerSettings::default()
        })
    }

    /// Name used to prefix relayed output: the program's file name.
    pub fn display_name(&self) -> String {
        self.program.file_name().map_or_else(
            || self.program.display().to_string(),
            |name| name.to_string_lossy().into_owned(),
        )
    }
}

impl From<&WorkerSettings> for WorkerConfig {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            program: settings.program.clone(),
            args: settings.args.clone(),
            working_dir: settings.working_dir.clone(),
            callback_env: settings.callback_env.clone(),
            extra_env: settings
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            log_prefix: settings.log_prefix,
            scan_mode: ScanMode::from_limit(settings.max_log_line_bytes),
            terminate_timeout: settings.terminate_timeout(),
            crash_policy: settings.crash_policy,
        }
    }
}

/// Lifecycle of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Running { pid: u32 },
    /// `code` is `None` when the process was killed by a signal.
    Exited { code: Option<i32> },
}

/// An exit the host did not ask for.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Worker {program} exited unexpectedly: {status}")]
pub struct WorkerFault {
    pub program: String,
    pub code: Option<i32>,
    pub status: String,
}

/// Owner of the worker process. Nothing else signals it or reads its pipes.
pub struct WorkerManager {
    config: WorkerConfig,
    state_tx: watch::Sender<WorkerState>,
    /// Cancelled once the host asks the worker to stop.
    stopping: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
    fault_rx: Option<oneshot::Receiver<WorkerFault>>,
}

impl WorkerManager {
    pub fn new(config: WorkerConfig) -> Self {
        let (state_tx, _) = watch::channel(WorkerState::NotStarted);
        Self {
            config,
            state_tx,
            stopping: CancellationToken::new(),
            supervisor: None,
            fault_rx: None,
        }
    }

    pub const fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Start the worker with its output relayed to the host's stdout/stderr.
    pub fn start(&mut self, callback_addr: &str) -> Result<(), WorkerError> {
        self.start_with_output(callback_addr, tokio::io::stdout(), tokio::io::stderr())
    }

    /// Start the worker, relaying its stdout and stderr to the given sinks.
    ///
    /// The environment is inherited from the host plus the callback variable
    /// and any extra variables.
    pub fn start_with_output<O, E>(
        &mut self,
        callback_addr: &str,
        stdout_sink: O,
        stderr_sink: E,
    ) -> Result<(), WorkerError>
    where
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        if self.supervisor.is_some() {
            return Err(WorkerError::AlreadyStarted);
        }

        let config = &self.config;
        let name = config.display_name();
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .env(&config.callback_env, callback_addr)
            .envs(config.extra_env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        info!(
            program = %config.program.display(),
            args = ?config.args,
            working_dir = ?config.working_dir,
            callback_env = %config.callback_env,
            callback_addr,
            "Starting worker process"
        );
        let mut child = cmd.spawn().map_err(|e| WorkerError::SpawnFailed {
            program: config.program.display().to_string(),
            reason: e.to_string(),
        })?;

        // Dropping `child` on these error paths kills the process.
        let stdout = child
            .stdout
            .take()
            .ok_or(WorkerError::PipeUnavailable { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(WorkerError::PipeUnavailable { stream: "stderr" })?;

        let relays = vec![
            spawn_relay(
                name.clone(),
                "stdout",
                stdout,
                stdout_sink,
                config.log_prefix,
                config.scan_mode,
            ),
            spawn_relay(
                name.clone(),
                "stderr",
                stderr,
                stderr_sink,
                config.log_prefix,
                config.scan_mode,
            ),
        ];

        if let Some(pid) = child.id() {
            self.state_tx.send_replace(WorkerState::Running { pid });
        }

        let (fault_tx, fault_rx) = oneshot::channel();
        self.fault_rx = Some(fault_rx);
        self.supervisor = Some(tokio::spawn(supervise(
            child,
            Supervision {
                name,
                relays,
                stopping: self.stopping.clone(),
                terminate_timeout: config.terminate_timeout,
                crash_policy: config.crash_policy,
                state_tx: self.state_tx.clone(),
                fault_tx,
            },
        )));
        Ok(())
    }

    /// Ask the worker to stop by sending it SIGINT. Does not wait for exit.
    ///
    /// From here on an exit counts as expected. If the worker is still alive
    /// after the terminate timeout it is killed.
    pub fn interrupt(&self) -> Result<(), WorkerError> {
        self.stopping.cancel();
        let WorkerState::Running { pid } = self.state() else {
            return Ok(());
        };
        info!(pid, "Forwarding interrupt to worker");
        send_interrupt(pid)
    }

    pub fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    /// Wait until the worker has exited. Returns immediately if it never
    /// started.
    pub async fn wait_exited(&self) -> WorkerState {
        let mut rx = self.state_tx.subscribe();
        if self.supervisor.is_none() {
            return *rx.borrow();
        }
        rx.wait_for(|s| matches!(s, WorkerState::Exited { .. }))
            .await
            .map_or(WorkerState::Exited { code: None }, |s| *s)
    }

    /// Receiver for an unexpected exit under [`CrashPolicy::Report`].
    ///
    /// Available once after [`Self::start`]. The sender is dropped without a
    /// value when the worker exits as expected.
    pub fn take_fault_receiver(&mut self) -> Option<oneshot::Receiver<WorkerFault>> {
        self.fault_rx.take()
    }
}

struct Supervision {
    name: String,
    relays: Vec<JoinHandle<()>>,
    stopping: CancellationToken,
    terminate_timeout: Duration,
    crash_policy: CrashPolicy,
    state_tx: watch::Sender<WorkerState>,
    fault_tx: oneshot::Sender<WorkerFault>,
}

async fn supervise(mut child: Child, sup: Supervision) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = sup.stopping.cancelled() => {
            match tokio::time::timeout(sup.terminate_timeout, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(worker = %sup.name, "Timeout waiting for worker to stop, killing");
                    if let Err(e) = child.kill().await {
                        warn!(worker = %sup.name, error = %e, "Failed to kill worker");
                    }
                    child.wait().await
                }
            }
        }
    };

    // Output written before the exit is relayed before anyone hears of it.
    let relays = sup.relays;
    let drained = tokio::time::timeout(RELAY_DRAIN_TIMEOUT, async move {
        for relay in relays {
            if let Err(e) = relay.await {
                warn!(error = %e, "Relay task failed");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(worker = %sup.name, "Worker output still open after exit, not waiting for it");
    }

    let code = status.as_ref().ok().and_then(ExitStatus::code);
    sup.state_tx.send_replace(WorkerState::Exited { code });

    let expected = sup.stopping.is_cancelled() || status.as_ref().is_ok_and(ExitStatus::success);
    if expected {
        info!(worker = %sup.name, ?code, "Worker exited");
        return;
    }

    let fault = WorkerFault {
        program: sup.name,
        code,
        status: match &status {
            Ok(status) => status.to_string(),
            Err(e) => e.to_string(),
        },
    };
    match sup.crash_policy {
        CrashPolicy::Exit => {
            error!(error = %fault, "Worker has terminated, shutting down host");
            std::process::exit(1);
        }
        CrashPolicy::Report => {
            error!(error = %fault, "Worker has terminated");
            if sup.fault_tx.send(fault).is_err() {
                debug!("No one is listening for worker faults");
            }
        }
    }
}

#[cfg(unix)]
fn send_interrupt(pid: u32) -> Result<(), WorkerError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|e| WorkerError::Signal {
        reason: e.to_string(),
    })?;
    kill(Pid::from_raw(raw), Signal::SIGINT).map_err(|e| WorkerError::Signal {
        reason: e.to_string(),
    })
}

#[cfg(not(unix))]
fn send_interrupt(pid: u32) -> Result<(), WorkerError> {
    warn!(pid, "Interrupt not supported on this platform, worker will be killed");
    Ok(())
}

/// Errors from worker process operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Failed to capture worker {stream}")]
    PipeUnavailable { stream: &'static str },

    #[error("Failed to signal worker: {reason}")]
    Signal { reason: String },

    #[error("Worker already started")]
    AlreadyStarted,
}
