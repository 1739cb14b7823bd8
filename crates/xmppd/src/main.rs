use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use xmppd::config::LogLevel;
use xmppd::{Config, Server};

/// Single-domain XMPP instant-messaging server.
#[derive(Debug, Parser)]
#[command(name = "xmppd", version, about)]
struct Cli {
    /// Config file (default: ./xmppd.conf, if present)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Server domain
    #[arg(short, long)]
    domain: Option<String>,
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,
    /// Data directory
    #[arg(short = 'D', long)]
    datadir: Option<PathBuf>,
    /// Log file path
    #[arg(short, long)]
    logfile: Option<PathBuf>,
    /// Log level (DEBUG/INFO/WARN/ERROR)
    #[arg(short = 'L', long)]
    loglevel: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("xmppd: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::default();
    if let Some(ref path) = cli.config {
        config
            .load_file(path)
            .with_context(|| format!("loading config {}", path.display()))?;
    } else if Path::new("./xmppd.conf").is_file() {
        config.load_file(Path::new("./xmppd.conf"))?;
    }
    if let Some(domain) = cli.domain {
        config.domain = domain;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(datadir) = cli.datadir {
        config.datadir = datadir;
    }
    if let Some(logfile) = cli.logfile {
        config.logfile = logfile;
    }
    if let Some(loglevel) = cli.loglevel {
        config.loglevel = LogLevel::parse(&loglevel);
    }

    init_logging(&config)?;

    info!(
        domain = %config.domain,
        addr = %config.listen_addr(),
        datadir = %config.datadir.display(),
        "xmppd starting"
    );

    std::fs::create_dir_all(&config.datadir)
        .with_context(|| format!("creating data directory {}", config.datadir.display()))?;

    let listener = TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("binding {}", config.listen_addr()))?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    Server::new(config).run(listener, shutdown).await?;

    info!("xmppd shut down cleanly");
    Ok(())
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.logfile)
        .with_context(|| format!("opening log file {}", config.logfile.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.loglevel.as_filter()))
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

/// SIGINT/SIGTERM raise the shutdown token; the accept loop exits after
/// notifying every session.
fn spawn_signal_handler(token: CancellationToken) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }
        token.cancel();
    });
    Ok(())
}
