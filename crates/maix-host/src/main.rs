//! MaixLink host entry point.
//!
//! Parses the command line, loads configuration, wires [`HostServices`], and
//! runs one subcommand.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()           -- TOML file, overridden by CLI flags
//!  └─ HostServices::new()     -- discovery, sessions, frame store
//!  └─ subcommand
//!       ├─ discover           -- probe the LAN and list MaixCAM boards
//!       ├─ run <file>         -- run a program on one board, print its output
//!       └─ serve              -- discovery + frame hub + auto-connect until Ctrl-C
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use maix_frame_hub::FrameServer;
use maix_host::application::session_manager::SessionNotice;
use maix_host::infrastructure::storage::config::{load_config, load_config_from, AppConfig};
use maix_host::{ConnectTarget, HostServices, ProgramRunner, RunnerEvent};

/// Talk to MaixCAM boards on the local network.
#[derive(Debug, Parser)]
#[command(name = "maix-host", version, about)]
struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, global = true, env = "MAIXLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is unset (overrides the config file).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List boards found by mDNS.
    Discover {
        /// How long to listen for answers.
        #[arg(long, default_value_t = 3000)]
        duration_ms: u64,
    },
    /// Run a program on a board and stream its output.
    Run {
        /// Python source file to run.
        file: PathBuf,
        /// Board IP address or discovered name.  Defaults to the first board
        /// discovered.
        #[arg(long, env = "MAIXLINK_DEVICE")]
        device: Option<String>,
        /// Seconds to wait for the handshake.
        #[arg(long, default_value_t = 5)]
        connect_timeout_secs: u64,
    },
    /// Serve camera frames over HTTP while keeping discovery running.
    Serve {
        /// Frame hub port (overrides the config file).
        #[arg(long)]
        port: Option<u16>,
        /// Frame hub bind address (overrides the config file).
        #[arg(long)]
        bind: Option<String>,
        /// Connect to every board discovery finds.
        #[arg(long)]
        auto_connect: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config_from(path),
        None => load_config(),
    }
    .context("failed to load configuration")?;

    // Initialise structured logging.  `RUST_LOG` wins over flag and config.
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.general.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Command::Discover { duration_ms } => discover(&config, Duration::from_millis(duration_ms)).await,
        Command::Run {
            file,
            device,
            connect_timeout_secs,
        } => run(&config, file, device, Duration::from_secs(connect_timeout_secs)).await,
        Command::Serve {
            port,
            bind,
            auto_connect,
        } => {
            let mut config = config;
            if let Some(port) = port {
                config.frame_hub.port = port;
            }
            if let Some(bind) = bind {
                config.frame_hub.bind_address = bind;
            }
            serve(&config, auto_connect).await
        }
    }
}

// ── discover ──────────────────────────────────────────────────────────────────

async fn discover(config: &AppConfig, duration: Duration) -> anyhow::Result<()> {
    let services = HostServices::new(config);
    services.discovery.start().await;
    tokio::time::sleep(duration).await;
    services.discovery.stop().await;

    let devices = services.discovery.devices();
    if devices.is_empty() {
        println!("no devices found");
    }
    for device in devices {
        println!("{}\t{}", device.ip, device.name);
    }
    Ok(())
}

// ── run ───────────────────────────────────────────────────────────────────────

async fn run(
    config: &AppConfig,
    file: PathBuf,
    device: Option<String>,
    connect_timeout: Duration,
) -> anyhow::Result<()> {
    let services = HostServices::new(config);

    let target = match device {
        Some(device) => {
            if !looks_like_ip(&device) {
                // A name needs at least one discovery tick to resolve.
                services.discovery.discover_now().await.context("discovery failed")?;
            }
            services.target_for(&device)
        }
        None => {
            services.discovery.discover_now().await.context("discovery failed")?;
            match services.discovery.devices().into_iter().next() {
                Some(identity) => ConnectTarget::Identity(identity),
                None => bail!("no device found; pass --device <ip>"),
            }
        }
    };

    let link = services
        .connect_and_wait(target, connect_timeout)
        .await
        .context("failed to connect")?;
    info!("connected to {}", link.identity());

    let mut runner = ProgramRunner::new();
    let mut output = runner
        .start(&file, &services.sessions)
        .await
        .with_context(|| format!("failed to start {}", file.display()))?;

    let mut exit_code = 0;
    let mut stop_requested = false;
    loop {
        tokio::select! {
            event = output.next() => match event {
                Some(RunnerEvent::Stdout(text)) => print!("{text}"),
                Some(RunnerEvent::Stderr(text)) => eprintln!("{text}"),
                Some(RunnerEvent::Image { format_tag, data }) => {
                    tracing::debug!("image frame: tag {format_tag}, {} bytes", data.len());
                }
                Some(RunnerEvent::End(status)) => {
                    exit_code = match status {
                        Some(status) if status.is_clean() => 0,
                        _ => 1,
                    };
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !stop_requested => {
                stop_requested = true;
                info!("stopping program");
                if let Err(e) = runner.stop().await {
                    warn!("stop failed: {e}");
                }
            }
        }
    }

    services.shutdown().await;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

fn looks_like_ip(device: &str) -> bool {
    maix_core::parse_ipv4(device).is_ok()
}

// ── serve ─────────────────────────────────────────────────────────────────────

async fn serve(config: &AppConfig, auto_connect: bool) -> anyhow::Result<()> {
    let services = Arc::new(HostServices::new(config));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let server_task = if config.frame_hub.enabled {
        let settings = config.frame_hub.settings();
        let server = FrameServer::bind(settings.bind_addr, Arc::clone(&services.frames))
            .await
            .context("failed to start frame hub")?;
        info!("frame hub listening on http://{}", server.local_addr()?);
        let mut shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(server.run(async move {
            let _ = shutdown.recv().await;
        })))
    } else {
        None
    };

    if config.discovery.enabled {
        services.discovery.start().await;
    }

    let started = services.connect_known_devices().await;
    if started > 0 {
        info!("connecting to {started} configured device(s)");
    }

    let notices = tokio::spawn(log_notices(services.sessions.subscribe()));
    let auto = auto_connect.then(|| {
        let services = Arc::clone(&services);
        tokio::spawn(async move { connect_discovered(services).await })
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down");

    if let Some(auto) = auto {
        auto.abort();
    }
    let _ = shutdown_tx.send(());
    services.shutdown().await;
    notices.abort();
    if let Some(task) = server_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("frame hub stopped with error: {e}"),
            Err(e) => error!("frame hub task failed: {e}"),
        }
    }
    Ok(())
}

/// Connects to each device as soon as discovery reports it.
async fn connect_discovered(services: Arc<HostServices>) {
    let mut devices = services.discovery.subscribe();
    loop {
        let current = devices.borrow_and_update().clone();
        for identity in current {
            if let Err(e) = services.sessions.connect(ConnectTarget::Identity(identity)).await {
                warn!("auto-connect failed: {e}");
            }
        }
        services.refresh_view();
        if devices.changed().await.is_err() {
            break;
        }
    }
}

async fn log_notices(mut notices: broadcast::Receiver<SessionNotice>) {
    loop {
        match notices.recv().await {
            Ok(SessionNotice::Added(identity)) => info!("session added: {identity}"),
            Ok(SessionNotice::Lost { identity, reason }) => warn!("session lost: {identity}: {reason}"),
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
