//! Headless demo daemon: loads `config.toml`, starts a peer runtime, and
//! logs every event it receives. No GUI, no persistence — a minimal host
//! that exercises the library the way an embedder would.

use std::path::PathBuf;

use anyhow::{Context, Result};
use log::Level;
use simplelog::{ColorChoice, CombinedLogger, Config as LogConfig, LevelFilter, TermLogger, TerminalMode, WriteLogger};

use lcp::config::PeerConfig;
use lcp::events::PeerEvent;

fn setup_logger() -> Result<()> {
    let exe_path = std::env::current_exe().context("failed to get exe path")?;
    let log_dir = exe_path
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."))
        .join("logs");
    std::fs::create_dir_all(&log_dir).context("failed to create log dir")?;

    let log_file = std::fs::File::create(log_dir.join("lcpd.log"))
        .context("failed to create lcpd log file")?;

    CombinedLogger::init(vec![
        TermLogger::new(
            LevelFilter::Info,
            LogConfig::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Debug, LogConfig::default(), log_file),
    ])
    .ok();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logger()?;
    log::info!("lcpd starting");

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let mut config = match PeerConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return Ok(());
        }
    };

    if config.local_peer_id == "anonymous" {
        config.local_peer_id = uuid::Uuid::new_v4().to_string();
        log::info!("no local_peer_id configured, generated {}", config.local_peer_id);
    }

    let (runtime, mut events) = lcp::runtime::spawn(config).await?;
    log::info!("lcpd listening as {}", runtime.local_peer_id());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutdown signal received");
        }
        () = drain_events(&mut events) => {}
    }

    runtime.shutdown();
    Ok(())
}

async fn drain_events(events: &mut lcp::events::EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::Message { from, text } => {
                log::info!("[{from}] {text}");
            }
            PeerEvent::File { from, path } => {
                log::info!("received file from {from}: {}", path.display());
            }
            PeerEvent::PeerOnline { peer } => {
                log::info!("peer online: {peer}");
            }
            PeerEvent::PeerOffline { peer } => {
                log::info!("peer offline: {peer}");
            }
            PeerEvent::FileProgress {
                peer,
                path,
                percent,
                status,
            } => {
                log::debug!("file {} to/from {peer}: {percent}% ({status:?})", path.display());
            }
            PeerEvent::Log { level, message } => {
                log_at(level, &message);
            }
        }
    }
}

fn log_at(level: Level, message: &str) {
    match level {
        Level::Error => log::error!("{message}"),
        Level::Warn => log::warn!("{message}"),
        Level::Info => log::info!("{message}"),
        Level::Debug => log::debug!("{message}"),
        Level::Trace => log::trace!("{message}"),
    }
}
