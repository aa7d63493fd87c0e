//! GemStalker DAP (Debug Adapter Protocol) adapter.
//!
//! Exposes a Debug Adapter Protocol server over TCP. Clients are served one after another,
//! one client is one debug session.

use anyhow::Context;
use clap::Parser;
use gemstalker::config::Config;
use gemstalker::dap::io::FileTracer;
use gemstalker::dap::DapServer;
use gemstalker::gci::{GciLibrary, SessionRegistry};
use log::{info, warn};
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on (default: 127.0.0.1:4711)
    #[clap(long, default_value = "127.0.0.1:4711")]
    listen: String,

    /// Exit after the first debug session ends (single-client mode).
    #[clap(long)]
    oneshot: bool,

    /// Optional log file for adapter diagnostics (no output to stdout).
    #[clap(long)]
    log_file: Option<PathBuf>,

    /// Trace DAP traffic (requests/responses/events) into the log file.
    /// Requires --log-file.
    #[clap(long)]
    trace_dap: bool,

    /// Configuration file, `~/.config/gemstalker/config.toml` by default.
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Path to the thread-safe GCI library.
    #[clap(long, env = "GS_LIBRARY")]
    library: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let logger = env_logger::Logger::from_default_env();
    let filter = logger.filter();
    gemstalker::log::LOGGER_SWITCHER.switch(logger, filter);

    let args = Args::parse();
    let config = Config::from_file(args.config.as_deref()).unwrap_or_default();

    let library_path = GciLibrary::locate(args.library.as_deref().or(config.library.as_deref()));
    let library = GciLibrary::load(&library_path)
        .with_context(|| format!("load GCI library {}", library_path.display()))?;
    let registry = Arc::new(SessionRegistry::new(Arc::new(library)));

    let addr: SocketAddr = args.listen.parse().context("Invalid listen address")?;
    let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
    info!(target: "dap", "gs-dap listening on {addr}");

    let tracer = match &args.log_file {
        Some(path) => Some(FileTracer::new(path)?),
        None => None,
    };
    if args.trace_dap && tracer.is_none() {
        warn!(target: "dap", "--trace-dap requires --log-file; tracing disabled");
    }
    let server = DapServer::new(registry.clone(), config).with_tracer(tracer, args.trace_dap);

    loop {
        let (stream, peer) = match listener.accept() {
            Ok(v) => v,
            Err(err) => {
                warn!(target: "dap", "accept failed: {err:#}");
                continue;
            }
        };
        info!(target: "dap", "DAP client connected: {peer}");
        if let Some(t) = server.tracer() {
            t.line(&format!("client connected: {peer}"));
        }

        let res = server.serve(stream);
        if let Err(err) = res {
            warn!(target: "dap", "session ended with error: {err:#}");
            if let Some(t) = server.tracer() {
                t.line(&format!("session error: {err:#}"));
            }
        } else if let Some(t) = server.tracer() {
            t.line("session finished OK");
        }

        if args.oneshot {
            break;
        }
    }

    registry.logout_all();
    Ok(())
}
