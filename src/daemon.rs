//! Daemon Infrastructure - single-instance lifetime around the reconciler
//!
//! The daemon takes the sync directory lock, runs the reconcile loop until a
//! shutdown signal arrives, and releases the lock on the way out. Failing to
//! take the lock is the only fatal error: it happens before anything in the
//! sync directory is touched.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::layout::SyncLayout;
use crate::lock::{LockError, LockGuard, LockStatus};
use crate::reconciler::Reconciler;

pub struct Daemon {
    config: Config,
    layout: SyncLayout,
    shutdown_sender: broadcast::Sender<()>,
}

/// Snapshot of a sync directory as seen from outside the daemon
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub sync_dir: PathBuf,
    pub is_running: bool,
    pub pid: Option<u32>,
    pub syncflag_present: bool,
    pub missing_dirs: Vec<PathBuf>,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        let layout = SyncLayout::new(config.sync_dir_path());
        let (shutdown_sender, _) = broadcast::channel(1);

        Self {
            config,
            layout,
            shutdown_sender,
        }
    }

    pub fn layout(&self) -> &SyncLayout {
        &self.layout
    }

    /// Handle that stops a running daemon between passes
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_sender.clone()
    }

    /// Run in the foreground until SIGINT/SIGTERM
    pub async fn run(&self) -> Result<()> {
        info!("Starting rm-syncd daemon for {}", self.layout.root().display());

        // Nothing may touch the sync directory before the lock is ours
        let lock = match LockGuard::acquire(&self.layout.lock_file()) {
            Ok(lock) => lock,
            Err(e @ LockError::Held { .. }) => {
                error!("syncd is already running (could not acquire lock): {}", e);
                return Err(e).context("Another rm-syncd instance owns this sync directory");
            }
            Err(e) => return Err(e).context("Failed to acquire sync directory lock"),
        };

        let mut reconciler =
            Reconciler::from_config(&self.config).context("Failed to set up reconciler")?;

        // Handlers are live before the first pass
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

        let shutdown_sender = self.shutdown_sender.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => debug!("SIGINT received"),
                _ = sigterm.recv() => debug!("SIGTERM received"),
            }
            info!("Shutdown signal received, stopping daemon...");
            let _ = shutdown_sender.send(());
        });

        let result = reconciler.run(self.shutdown_sender.subscribe()).await;

        if let Err(e) = lock.release() {
            warn!("Failed to release lock cleanly: {}", e);
        }
        info!("Daemon cleanup completed");

        result
    }
}

/// Create the directory layout only
pub fn install(layout: &SyncLayout) -> Result<()> {
    layout.ensure_dirs().with_context(|| {
        format!(
            "Failed to create directory structure under {}",
            layout.root().display()
        )
    })
}

/// Inspect a sync directory without mutating it
pub fn status(layout: &SyncLayout) -> Result<DaemonStatus> {
    let lock_status =
        LockGuard::probe(&layout.lock_file()).context("Failed to probe sync directory lock")?;
    let (is_running, pid) = match lock_status {
        LockStatus::Free => (false, None),
        LockStatus::Held { pid } => (true, pid),
    };

    Ok(DaemonStatus {
        sync_dir: layout.root().to_path_buf(),
        is_running,
        pid,
        syncflag_present: layout.syncflag_exists(),
        missing_dirs: layout.missing_dirs(),
    })
}

/// Check whether a daemon holds the lock for this sync directory
pub fn is_daemon_running(layout: &SyncLayout) -> Result<bool> {
    Ok(status(layout)?.is_running)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_config(sync_dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.sync_dir = sync_dir.to_string_lossy().into_owned();
        config.processing.command = vec!["true".to_string()];
        config.viewer.enabled = false;
        config.daemon.max_wait = "50ms".to_string();
        config.daemon.poll_interval = "10ms".to_string();
        config
    }

    #[tokio::test]
    async fn test_run_fails_fast_when_locked() {
        let temp = tempdir().unwrap();
        let sync_dir = temp.path().join("sync");
        let daemon = Daemon::new(test_config(&sync_dir));

        let _held = LockGuard::acquire(&daemon.layout().lock_file()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), daemon.run())
            .await
            .expect("locked daemon must not block");

        let err = result.unwrap_err();
        assert_matches!(err.downcast_ref::<LockError>(), Some(LockError::Held { .. }));
        assert!(!daemon.layout().dirty().exists());
        assert!(!daemon.layout().staging().exists());
        assert!(!daemon.layout().stable().exists());
    }

    #[tokio::test]
    async fn test_run_holds_lock_until_shutdown() {
        let temp = tempdir().unwrap();
        let sync_dir = temp.path().join("sync");
        let daemon = Daemon::new(test_config(&sync_dir));
        let layout = daemon.layout().clone();
        let shutdown = daemon.shutdown_handle();

        let probe_layout = layout.clone();
        let observer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let running = is_daemon_running(&probe_layout).unwrap();
            let _ = shutdown.send(());
            running
        });

        tokio::time::timeout(Duration::from_secs(5), daemon.run())
            .await
            .expect("daemon did not stop")
            .unwrap();

        assert!(observer.await.unwrap());
        assert!(layout.missing_dirs().is_empty());
        assert!(!is_daemon_running(&layout).unwrap());
    }

    #[test]
    fn test_status_of_fresh_directory() {
        let temp = tempdir().unwrap();
        let layout = SyncLayout::new(temp.path().join("sync"));

        let status = status(&layout).unwrap();

        assert!(!status.is_running);
        assert_eq!(status.pid, None);
        assert!(!status.syncflag_present);
        assert_eq!(status.missing_dirs.len(), 5);
        // Probing must not create anything
        assert!(!layout.root().exists());
    }

    #[test]
    fn test_install_then_status() {
        let temp = tempdir().unwrap();
        let layout = SyncLayout::new(temp.path().join("sync"));

        install(&layout).unwrap();
        std::fs::write(layout.syncflag(), b"").unwrap();
        let _lock = LockGuard::acquire(&layout.lock_file()).unwrap();

        let status = status(&layout).unwrap();
        assert!(status.is_running);
        assert_eq!(status.pid, Some(std::process::id()));
        assert!(status.syncflag_present);
        assert!(status.missing_dirs.is_empty());
    }
}
