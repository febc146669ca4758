//! yafaas
//!
//! Single binary server for running functions as a service: invocations
//! posted over HTTP are handed to one long-lived worker process.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use yafaas_core::Config;
use yafaas_core::config::load_config;
use yafaas_core::tracing_init::{default_filter, init_tracing};
use yafaas_server::server::{Server, ServerConfig, spawn_signal_listener};
use yafaas_server::worker::WorkerConfig;

const DEFAULT_FUNC: &str = "index.js";
const DEFAULT_FDIR: &str = "/tmp/yafaas";

#[derive(Parser, Debug)]
#[command(name = "yafaas")]
#[command(
    version,
    about = "yet another function as a service",
    long_about = "yafaas is a single binary server for running functions as a service."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server to handle function invocations and events
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Host to bind the server to [default: localhost]
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to bind the server to [default: 9000]
    #[arg(short, long)]
    port: Option<u16>,

    /// Function module to invoke [default: index.js]
    #[arg(short, long)]
    func: Option<String>,

    /// Working directory of the function [default: /tmp/yafaas]
    #[arg(short = 'd', long)]
    fdir: Option<String>,

    /// Worker executable [default: node]
    #[arg(long)]
    program: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long, env = "YAFAAS_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds in-flight requests may take to finish after a shutdown signal
    #[arg(long)]
    shutdown_grace: Option<u64>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "YAFAAS_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let log_json = args.log_json;
    let config = resolve_config(args)?;
    init_tracing(&default_filter(&config.log_level), log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.server.bind_addr(),
        program = %config.worker.program.display(),
        args = ?config.worker.args,
        "Starting yafaas"
    );

    // Listen for signals before announcing readiness.
    let shutdown = CancellationToken::new();
    let signals = spawn_signal_listener(shutdown.clone());

    let server = Server::new(
        ServerConfig::from(&config.server),
        WorkerConfig::from(&config.worker),
    );
    let bound = server.bind().await?;

    // Tell systemd we are ready. `true` unsets $NOTIFY_SOCKET before the
    // worker is spawned so it cannot notify on our behalf.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    let result = bound.serve(shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = signals.await {
        warn!(error = %e, "Signal listener task failed");
    }
    result?;
    Ok(())
}

/// Layer CLI flags over file and environment configuration.
fn resolve_config(args: ServeArgs) -> anyhow::Result<Config> {
    let mut config = load_config(args.config.as_deref())?;

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(secs) = args.shutdown_grace {
        config.server.shutdown_grace_secs = secs;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    if let Some(program) = args.program {
        config.worker.program = program;
    }
    // The worker is started as `<program> <fdir> <func>`.
    if args.fdir.is_some() || args.func.is_some() || config.worker.args.is_empty() {
        config.worker.args = vec![
            args.fdir.unwrap_or_else(|| DEFAULT_FDIR.to_string()),
            args.func.unwrap_or_else(|| DEFAULT_FUNC.to_string()),
        ];
    }
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> ServeArgs {
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Serve(args) => args,
        }
    }

    #[test]
    fn short_flags_set_bind_address_and_function() {
        let args = parse(&[
            "yafaas", "serve", "-H", "0.0.0.0", "-p", "8080", "-f", "main.mjs", "-d", "/srv/fn",
        ]);
        let config = resolve_config(args).unwrap();
        assert_eq!(config.server.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.worker.args, vec!["/srv/fn", "main.mjs"]);
    }

    #[test]
    fn worker_args_default_to_fdir_and_func() {
        let config = resolve_config(parse(&["yafaas", "serve"])).unwrap();
        assert_eq!(config.worker.args, vec![DEFAULT_FDIR, DEFAULT_FUNC]);
    }
}
