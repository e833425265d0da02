//! oxitun command line
//!
//! `oxitun run -c config.yaml` starts every configured tunnel. SIGHUP reloads
//! the configuration (stop, load, start); SIGINT and SIGTERM stop and exit.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use oxitun_lib::{AppConfig, TunnelSet};
use tracing::{error, info};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "oxitun", version, about = "TCP tunnel relay", propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all configured tunnels until stopped
    Run,

    /// Validate the configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    oxitun_lib::init_logging();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run => run(&cli.config).await,
        Commands::Check => check(&cli.config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load(path: &Path) -> anyhow::Result<TunnelSet> {
    let config = AppConfig::load(path)
        .with_context(|| format!("loading {}", path.display()))?;
    Ok(TunnelSet::from_config(config)?)
}

fn check(path: &Path) -> anyhow::Result<()> {
    let set = load(path)?;
    info!("{}: {} tunnel(s) OK", path.display(), set.len());
    Ok(())
}

async fn run(path: &Path) -> anyhow::Result<()> {
    let mut signals = Signals::install()?;

    let mut set = load(path)?;
    set.start().await.context("starting tunnels")?;

    loop {
        match signals.next().await {
            Control::Reload => {
                info!("SIGHUP received, reloading {}", path.display());
                set.stop().await;
                set = load(path).context("reloading configuration")?;
                set.start().await.context("restarting tunnels")?;
            }
            Control::Stop => {
                info!("Shutdown signal received");
                set.stop().await;
                return Ok(());
            }
        }
    }
}

enum Control {
    Reload,
    Stop,
}

#[cfg(unix)]
struct Signals {
    hangup: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> anyhow::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            hangup: signal(SignalKind::hangup()).context("installing SIGHUP handler")?,
            interrupt: signal(SignalKind::interrupt()).context("installing SIGINT handler")?,
            terminate: signal(SignalKind::terminate()).context("installing SIGTERM handler")?,
        })
    }

    async fn next(&mut self) -> Control {
        tokio::select! {
            _ = self.hangup.recv() => Control::Reload,
            _ = self.interrupt.recv() => Control::Stop,
            _ = self.terminate.recv() => Control::Stop,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> anyhow::Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> Control {
        use tracing::warn;

        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        Control::Stop
    }
}
