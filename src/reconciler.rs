//! Reconciler - the sync pipeline state machine
//!
//! Data moves `dirty -> staging -> stable/source` and is then handed to the
//! processing step. The only durable state is the existence of `syncflag`;
//! everything else lives in [`PipelineState`] and is rebuilt by
//! [`Reconciler::recover_state`] on startup.
//!
//! Each reconciliation pass runs three phases in a fixed order:
//!
//! 1. **reap** - consume the outcome of a finished processing run and notify
//!    the viewer on success
//! 2. **stage** - if `syncflag` exists and staging is free, mirror dirty into
//!    staging and delete `syncflag`
//! 3. **promote** - if staging is full and nothing is processing, mirror
//!    staging into the stable source and start processing
//!
//! Reap runs first so a run that just finished unblocks a pending promote in
//! the same pass. Every failure leaves the flags untouched and is retried on
//! the next pass; transfers are idempotent, so a retry never does harm.

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::layout::SyncLayout;
use crate::notifier::Notifier;
use crate::processing::{CommandProcessor, Outcome, ProcessingSupervisor, Processor};
use crate::transfer::{Mirror, Rsync};

const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(5);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// In-memory pipeline flags, owned by the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineState {
    /// Staging holds a mirror not yet promoted to the stable source
    pub staging_full: bool,
    /// A processing run is in flight
    pub processing: bool,
    /// The most recent run failed; only meaningful during reap
    pub process_error: bool,
}

/// What one reconciliation pass did
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    /// Outcome of a processing run reaped in this pass
    pub reaped: Option<Outcome>,
    /// Whether the viewer acknowledged the rebuild notification
    pub notified: Option<bool>,
    /// Dirty was mirrored into staging and `syncflag` removed
    pub staged: bool,
    /// Staging was mirrored into the stable source and processing started
    pub promoted: bool,
    pub stage_error: Option<String>,
    pub promote_error: Option<String>,
}

impl PassReport {
    /// Whether the pass changed the pipeline state
    pub fn changed(&self) -> bool {
        self.reaped.is_some() || self.staged || self.promoted
    }
}

/// Why [`Reconciler::wait_any`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Syncflag,
    ProcessingFinished,
    Timeout,
}

pub struct Reconciler {
    layout: SyncLayout,
    mirror: Arc<dyn Mirror>,
    supervisor: ProcessingSupervisor,
    notifier: Notifier,
    rebuild_url: Option<String>,
    max_wait: Duration,
    poll_interval: Duration,
    state: PipelineState,
    /// The last stage attempt failed with `syncflag` still in place
    stage_failed: bool,
}

impl Reconciler {
    pub fn new(layout: SyncLayout, mirror: Arc<dyn Mirror>, processor: Arc<dyn Processor>) -> Self {
        Self {
            layout,
            mirror,
            supervisor: ProcessingSupervisor::new(processor),
            notifier: Notifier::new(),
            rebuild_url: None,
            max_wait: DEFAULT_MAX_WAIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            state: PipelineState::default(),
            stage_failed: false,
        }
    }

    /// Build a reconciler wired to rsync, the configured processing command and the viewer
    pub fn from_config(config: &Config) -> Result<Self> {
        let layout = SyncLayout::new(config.sync_dir_path());
        let mirror = Arc::new(Rsync::from_config(&config.transfer));
        let processor = Arc::new(
            CommandProcessor::new(&config.processing.command)
                .context("Invalid processing command")?,
        );
        let rebuild_url = config.viewer.enabled.then(|| config.rebuild_url());

        Ok(Self::new(layout, mirror, processor)
            .with_notifier(Notifier::with_timeout(config.notify_timeout()?), rebuild_url)
            .with_wait(config.max_wait()?, config.poll_interval()?))
    }

    /// Notify `rebuild_url` after every successful processing run
    pub fn with_notifier(mut self, notifier: Notifier, rebuild_url: Option<String>) -> Self {
        self.notifier = notifier;
        self.rebuild_url = rebuild_url;
        self
    }

    pub fn with_wait(mut self, max_wait: Duration, poll_interval: Duration) -> Self {
        self.max_wait = max_wait;
        self.poll_interval = poll_interval;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Rebuild the pipeline flags from the filesystem
    ///
    /// Processing from a previous lifetime is considered lost and is never
    /// resumed. `staging_full` is inferred from `syncflag` alone: present
    /// means staging is stale and must be re-staged; absent means a promote
    /// may not have completed, so it is redone.
    pub fn recover_state(&mut self) -> PipelineState {
        self.state.processing = false;
        self.state.process_error = false;

        if self.layout.syncflag_exists() {
            self.state.staging_full = false;
            info!("recover: syncflag present, staging_full=false");
        } else {
            self.state.staging_full = true;
            info!("recover: syncflag absent, staging_full=true (conservative)");
        }

        self.state
    }

    /// Run one reconciliation pass: reap, stage, promote
    pub async fn reconcile(&mut self) -> PassReport {
        let mut report = PassReport::default();

        self.reap(&mut report).await;
        self.stage(&mut report).await;
        self.promote(&mut report).await;

        report
    }

    async fn reap(&mut self, report: &mut PassReport) {
        if !self.state.processing || self.supervisor.is_alive() {
            return;
        }
        let Some(outcome) = self.supervisor.reap().await else {
            return;
        };

        self.state.processing = false;
        self.state.process_error = !outcome.is_success();

        if self.state.process_error {
            if let Outcome::Failure(failure) = &outcome {
                error!("reap: {}, skipping viewer rebuild", failure);
            }
            // Consumed: the next promote starts from a clean slate
            self.state.process_error = false;
        } else if let Some(url) = &self.rebuild_url {
            info!("reap: processing done, triggering viewer rebuild");
            report.notified = Some(self.notifier.notify(url).await);
        } else {
            info!("reap: processing done");
        }

        report.reaped = Some(outcome);
    }

    async fn stage(&mut self, report: &mut PassReport) {
        if !self.layout.syncflag_exists() {
            self.stage_failed = false;
            return;
        }
        if self.state.staging_full {
            return;
        }

        info!("stage: rsyncing dirty -> staging");
        match self
            .mirror
            .mirror(&self.layout.dirty(), &self.layout.staging())
            .await
        {
            Ok(transfer) => debug!(
                "stage: {} changed entries{}",
                transfer.changed_entries,
                if transfer.is_noop() { " (no-op)" } else { "" }
            ),
            Err(e) => {
                error!("stage: {}, will retry next cycle", e);
                report.stage_error = Some(e.to_string());
                self.stage_failed = true;
                return;
            }
        }

        match std::fs::remove_file(self.layout.syncflag()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                // Staging stays "not full"; the next pass re-stages, which is a no-op
                error!("stage: failed to remove syncflag: {}, will retry next cycle", e);
                report.stage_error = Some(e.to_string());
                self.stage_failed = true;
                return;
            }
        }

        self.stage_failed = false;
        self.state.staging_full = true;
        report.staged = true;
        info!("stage: done, syncflag removed");
    }

    async fn promote(&mut self, report: &mut PassReport) {
        if !self.state.staging_full || self.state.processing {
            return;
        }

        let source = self.layout.source();
        info!("promote: rsyncing staging -> {}", source.display());
        match self.mirror.mirror(&self.layout.staging(), &source).await {
            Ok(transfer) => debug!(
                "promote: {} changed entries{}",
                transfer.changed_entries,
                if transfer.is_noop() { " (no-op)" } else { "" }
            ),
            Err(e) => {
                error!("promote: {}, will retry next cycle", e);
                report.promote_error = Some(e.to_string());
                return;
            }
        }

        if let Err(e) = self.supervisor.start(&source, &self.layout.output()) {
            error!("promote: {}, will retry next cycle", e);
            report.promote_error = Some(e.to_string());
            return;
        }

        self.state.process_error = false;
        self.state.processing = true;
        self.state.staging_full = false;
        report.promoted = true;
        info!("promote: done, processing started");
    }

    /// Wait until a pass has something to do, at most `max_wait`
    ///
    /// Wakes when `syncflag` appears while staging is free, or when the
    /// in-flight processing run finishes. A `syncflag` left behind by a failed
    /// stage does not count; that stage is retried after the timeout.
    pub async fn wait_any(&self) -> WakeReason {
        let deadline = Instant::now() + self.max_wait;
        let watch_syncflag = !self.state.staging_full && !self.stage_failed;

        loop {
            if watch_syncflag && self.layout.syncflag_exists() {
                return WakeReason::Syncflag;
            }
            if self.supervisor.is_finished() {
                return WakeReason::ProcessingFinished;
            }

            let now = Instant::now();
            if now >= deadline {
                return WakeReason::Timeout;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Main reconcile loop
    ///
    /// Ensures the layout, recovers state, then runs passes until `shutdown`
    /// fires. Shutdown is only observed between passes.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        self.layout.ensure_dirs().with_context(|| {
            format!(
                "Failed to create directory structure under {}",
                self.layout.root().display()
            )
        })?;
        self.recover_state();
        info!("syncd running in {}", self.layout.root().display());

        loop {
            let report = self.reconcile().await;

            if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }
            if report.changed() {
                continue;
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                reason = self.wait_any() => debug!("wake: {:?}", reason),
            }
        }

        if self.state.processing {
            info!("Shutting down with processing in flight; it will be re-run on next start");
        }
        info!("Reconcile loop exiting");
        Ok(())
    }
}
