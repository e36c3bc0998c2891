use anyhow::{Context, Result};
use spray_relay::config::{Config, Mode};
use spray_relay::{DirWatcher, LogWatcher, RelayServer, Watcher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long in-flight sessions may drain after Ctrl-C before they are cut
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    if !config.quiet {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .init();
    }

    let selector = config.selector()?;
    let mut writer = None;
    let watcher: Option<Arc<dyn Watcher>> = match &config.mode {
        Mode::Switch { .. } => None,
        Mode::Monitor {
            context_dir: Some(dir),
            ..
        } => {
            let (watcher, handle) = DirWatcher::new(dir)
                .with_context(|| format!("Could not create context directory {}", dir.display()))?;
            writer = Some(handle);
            info!(dir = %dir.display(), "Recording connections");
            Some(Arc::new(watcher) as Arc<dyn Watcher>)
        }
        Mode::Monitor { context_dir: None, .. } => Some(Arc::new(LogWatcher) as Arc<dyn Watcher>),
    };

    let server = RelayServer::bind(config.server.clone(), selector, watcher).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.close().await;

    if tokio::time::timeout(DRAIN_TIMEOUT, server.wait()).await.is_err() {
        warn!(
            sessions = server.active_sessions(),
            "Sessions still open after {:?}, closing them",
            DRAIN_TIMEOUT
        );
        server.abort();
        server.wait().await;
    }

    // Last watcher reference goes with the server; flush pending records
    drop(server);
    if let Some(writer) = writer {
        writer.await.context("Context directory writer failed")?;
    }

    Ok(())
}
