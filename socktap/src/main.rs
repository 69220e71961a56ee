use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use socktap_common::{load_config, EventSink, Result};
use tracing::{debug, error, info, warn};

mod engine;
mod fd;
mod inode;
mod process;
mod proxy;
mod seccomp;
mod socket;
mod state;

use engine::Engine;

/// socktap - observe a command's TCP traffic through an in-process proxy
///
/// The supervisor forks the target, installs the seccomp user-notification
/// filter, and hands this process the notification fd, the target pid and
/// its pidfd.
#[derive(Parser, Debug)]
#[command(name = "socktap")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Intercept a traced process' TCP sockets via seccomp user-mode notification")]
pub struct Args {
    /// Seccomp user-mode notification fd inherited from the supervisor
    #[arg(long = "notify-fd")]
    pub notify_fd: i32,

    /// Root target process id
    #[arg(long = "pid")]
    pub pid: u32,

    /// pidfd for the root target (opened here when absent)
    #[arg(long = "pidfd")]
    pub pidfd: Option<i32>,

    /// Configuration file path
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// File for debug logs (stderr if unspecified)
    #[arg(long = "logfile")]
    pub logfile: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    match &args.logfile {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    info!("starting socktap v{}", env!("CARGO_PKG_VERSION"));

    let exe = std::env::current_exe()?;
    let config = load_config(&exe, args.config.as_deref().and_then(|p| p.to_str()))?;
    debug!("configuration: {:?}", config);

    let (sink, mut events) = EventSink::channel(config.event_buffer);
    let log_events = config.log_events;
    tokio::spawn(async move {
        // Drain the sink regardless of whether records are written, so the
        // proxies never see a clogged channel.
        while let Some(event) = events.recv().await {
            if !log_events {
                continue;
            }
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("failed to encode event: {}", e),
            }
        }
    });

    let pidfd = match args.pidfd {
        Some(pidfd) => pidfd,
        None => process::pidfd_open(args.pid).map_err(|e| {
            socktap_common::SocktapError::ProcessError(format!(
                "pidfd_open {}: {}",
                args.pid, e
            ))
        })?,
    };

    let engine = Engine::new(sink, args.notify_fd, args.pid, pidfd);
    if let Err(e) = engine.run().await {
        error!("dispatcher exited: {}", e);
        return Err(e);
    }
    Ok(())
}
