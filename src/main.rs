//! `popbusd`: the popbus broker daemon
//!
//! Startup order matters: the PID-file lock is taken and the process forked
//! into the background before the tokio runtime exists, since a runtime's
//! worker threads do not survive `fork`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tracing::{error, info};

use popbus::broker::Broker;
use popbus::config::{Settings, load_config, load_config_from};
use popbus::transport::server::{bind_listeners, serve};
use popbus::utils::error::{Error, Result};
use popbus::utils::logging;
use popbus::utils::pidfile::PidFileLock;

const EXIT_ALREADY_RUNNING: u8 = 12;
const EXIT_FAILURE: u8 = 1;

#[derive(Debug, Parser)]
#[command(name = "popbusd", version, about = "popbus message broker")]
struct Cli {
    /// Run in the foreground instead of detaching
    #[arg(short, long)]
    foreground: bool,

    /// Log level: error, warn, info, debug or trace
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Listen address, tcp://host:port or unix:///path. May be repeated.
    #[arg(long = "listen", value_name = "ADDRESS")]
    listen: Vec<String>,

    /// Add a catch-all route that logs every message
    #[arg(short = 'r', long)]
    debug_route: bool,

    /// Leave Nagle's algorithm enabled on accepted TCP connections
    #[arg(short = 'd', long)]
    nagle: bool,

    /// Configuration file (any format the config crate reads)
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Lock file guarding against a second broker
    #[arg(long, value_name = "PATH")]
    pid_file: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if !self.listen.is_empty() {
            settings.server.listen = self.listen.clone();
        }
        if self.debug_route {
            settings.broker.debug_route = true;
        }
        if self.nagle {
            settings.server.no_delay = false;
        }
        if let Some(pid_file) = &self.pid_file {
            settings.server.pid_file = pid_file.clone();
        }
    }
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let loaded = match &cli.config {
        Some(path) => load_config_from(path),
        None => load_config(),
    };
    let mut settings = match loaded {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    cli.apply(&mut settings);

    let lock = match PidFileLock::acquire(&settings.server.pid_file) {
        Ok(lock) => lock,
        Err(Error::AlreadyRunning(path)) => {
            error!(pid_file = %path.display(), "broker already running");
            return ExitCode::from(EXIT_ALREADY_RUNNING);
        }
        Err(e) => {
            error!(error = %e, "failed to open pid file");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    if cli.foreground {
        info!("running in foreground");
    } else if let Err(e) = nix::unistd::daemon(false, true) {
        error!(error = %e, "failed to fork off daemon");
        return ExitCode::from(EXIT_FAILURE);
    }
    if let Err(e) = lock.record_pid() {
        error!(error = %e, "failed to write pid file");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let result = runtime.block_on(run(settings));
    drop(lock);
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "broker failed");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(settings: Settings) -> Result<()> {
    let listeners = bind_listeners(&settings.server.listen, settings.server.no_delay).await?;
    let broker = Arc::new(Mutex::new(Broker::new(settings.broker)));

    tokio::select! {
        _ = serve(listeners, broker) => {
            error!("all listeners stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, exiting");
        }
    }
    Ok(())
}
