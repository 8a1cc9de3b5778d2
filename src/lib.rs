//! rm-syncd - reconciliation daemon for reMarkable tablet sync
//!
//! The tablet pushes its notebook files into a *dirty* area and touches a
//! `syncflag` when a push completes. rm-syncd moves each complete push through
//! a *staging* area into a *stable* source snapshot, runs the processing step
//! against that snapshot in the background, and asks the viewer to rebuild once
//! processing succeeds.
//!
//! ## Core Features
//!
//! - **Level-triggered reconciliation**: every pass derives its work from the
//!   on-disk state, so a crash or restart never loses a sync
//! - **Single-writer snapshots**: the stable snapshot is never replaced while
//!   processing reads it
//! - **Single instance**: an advisory lock guards each sync directory
//! - **Best-effort notification**: viewer outages never block the pipeline
//!
//! ## Modules
//!
//! - [`config`]: YAML configuration with XDG defaults
//! - [`layout`]: On-disk directory layout of a sync directory
//! - [`transfer`]: Mirror copies via rsync
//! - [`processing`]: Background processing supervisor
//! - [`notifier`]: Viewer rebuild notification
//! - [`lock`]: Single-instance lock
//! - [`reconciler`]: Pipeline state and the reconcile loop
//! - [`daemon`]: Process lifetime, signals and status
//! - [`health`]: Preflight checks for `rm-syncd doctor`

pub mod config;
pub mod daemon;
pub mod health;
pub mod layout;
pub mod lock;
pub mod notifier;
pub mod processing;
pub mod reconciler;
pub mod transfer;

pub use config::Config;
pub use daemon::{Daemon, DaemonStatus};
pub use health::HealthCheck;
pub use layout::SyncLayout;
pub use lock::{LockError, LockGuard, LockStatus};
pub use notifier::Notifier;
pub use processing::{CommandProcessor, Outcome, ProcessingSupervisor, Processor};
pub use reconciler::{PassReport, PipelineState, Reconciler, WakeReason};
pub use transfer::{Mirror, Rsync, TransferError, TransferReport};
