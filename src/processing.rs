//! Processing Supervisor - runs the processing step in the background
//!
//! The processing step turns the promoted snapshot into the viewer's output
//! directory. It may take arbitrarily long, so it runs as a spawned task while
//! the reconciler keeps polling. The task's terminal outcome is published
//! through its `JoinHandle`, which gives the control loop a race-free
//! `is_finished()` check and a one-shot result.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command as AsyncCommand;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// A processing run that raised, panicked or exited abnormally
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("processing failed: {0}")]
pub struct ProcessingFailure(pub String);

/// Terminal outcome of one processing run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(ProcessingFailure),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Returned by [`ProcessingSupervisor::start`] while a run is still active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("a processing run is already active")]
pub struct AlreadyRunningError;

/// The processing step: reads `source`, writes whatever it wants into `output`
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, source: &Path, output: &Path) -> Result<()>;
}

/// Processor that runs an external command as `<program> <args..> <source> <output>`
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
}

impl CommandProcessor {
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .context("Processing command is empty")?;

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl Processor for CommandProcessor {
    async fn process(&self, source: &Path, output: &Path) -> Result<()> {
        debug!(
            "Running processing command: {} {:?} {} {}",
            self.program,
            self.args,
            source.display(),
            output.display()
        );

        let result = AsyncCommand::new(&self.program)
            .args(&self.args)
            .arg(source)
            .arg(output)
            // The run is abandoned, not resumed, if the daemon goes away
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.program))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(anyhow!(
                "{} exited with {}: {}",
                self.program,
                result.status,
                stderr.trim()
            ));
        }

        Ok(())
    }
}

/// Owns the single in-flight processing run
pub struct ProcessingSupervisor {
    processor: Arc<dyn Processor>,
    active: Option<JoinHandle<Outcome>>,
}

impl ProcessingSupervisor {
    pub fn new(processor: Arc<dyn Processor>) -> Self {
        Self {
            processor,
            active: None,
        }
    }

    /// Start one run in the background and return immediately
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, source: &Path, output: &Path) -> Result<(), AlreadyRunningError> {
        if self.active.is_some() {
            return Err(AlreadyRunningError);
        }

        let processor = Arc::clone(&self.processor);
        let source: PathBuf = source.to_path_buf();
        let output: PathBuf = output.to_path_buf();

        let handle = tokio::spawn(async move {
            info!("Processing started: {}", source.display());
            match processor.process(&source, &output).await {
                Ok(()) => {
                    info!("Processing completed successfully");
                    Outcome::Success
                }
                Err(e) => {
                    error!("Processing failed: {:#}", e);
                    Outcome::Failure(ProcessingFailure(format!("{:#}", e)))
                }
            }
        });

        self.active = Some(handle);
        Ok(())
    }

    /// A run has been started and not reaped yet
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// A run is active and has not finished
    pub fn is_alive(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// A run has finished and is waiting to be reaped
    pub fn is_finished(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|handle| handle.is_finished())
    }

    /// Consume the outcome of a finished run
    ///
    /// Returns `None` when there is no run or it is still alive; never blocks
    /// on a live run. Each outcome is returned exactly once.
    pub async fn reap(&mut self) -> Option<Outcome> {
        if !self.is_finished() {
            return None;
        }
        let handle = self.active.take()?;

        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                error!("Processing task panicked");
                Outcome::Failure(ProcessingFailure("processing task panicked".to_string()))
            }
            Err(e) => Outcome::Failure(ProcessingFailure(format!(
                "processing task did not complete: {}",
                e
            ))),
        };

        Some(outcome)
    }
}
