//! System health checks for rm-syncd
//!
//! Preflight checks run by `rm-syncd doctor` to verify the external tools and
//! the sync directory before starting the daemon.

use std::path::{Path, PathBuf};

use crate::layout::SyncLayout;
use crate::lock::{LockGuard, LockStatus};
use crate::Config;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// rsync installation status
    pub rsync: CheckResult,
    /// Processing command resolution
    pub processing: CheckResult,
    /// Sync directory status
    pub sync_dir: CheckResult,
    /// Directory layout completeness (warning only, `run` creates it)
    pub layout: CheckResult,
    /// Daemon lock state (warning only)
    pub lock: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: true,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub fn run(config: &Config) -> Self {
        let layout = SyncLayout::new(config.sync_dir_path());

        Self {
            rsync: Self::check_rsync(&config.transfer.rsync_path),
            processing: Self::check_processing(&config.processing.command),
            sync_dir: Self::check_sync_dir(layout.root()),
            layout: Self::check_layout(&layout),
            lock: Self::check_lock(&layout),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.all_checks().iter().all(|(_, result)| result.passed)
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, result)| result)
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, result)| result)
            .filter(|r| r.is_warning)
            .collect()
    }

    /// Check rsync installation
    fn check_rsync(program: &str) -> CheckResult {
        match std::process::Command::new(program).arg("--version").output() {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let version = stdout.lines().next().unwrap_or_default().trim().to_string();
                CheckResult::ok_with_details("rsync installed", version)
            }
            Ok(_) => CheckResult::error(format!("{} --version failed", program)),
            Err(_) => CheckResult::error_with_details(
                format!("{} not found", program),
                "Install rsync with your package manager, or set transfer.rsync_path",
            ),
        }
    }

    /// Check that the processing program can be found
    fn check_processing(command: &[String]) -> CheckResult {
        let Some(program) = command.first() else {
            return CheckResult::error_with_details(
                "No processing command configured",
                "Set processing.command in the config file",
            );
        };

        match resolve_program(program) {
            Some(path) => CheckResult::ok_with_details(
                "Processing command found",
                format!("{} ({})", command.join(" "), path.display()),
            ),
            None => CheckResult::error_with_details(
                format!("Processing program '{}' not found", program),
                "Install it or point processing.command at its full path",
            ),
        }
    }

    /// Check sync directory exists and is writable
    fn check_sync_dir(root: &Path) -> CheckResult {
        if !root.exists() {
            let ancestor = root.ancestors().find(|p| p.exists());
            return match ancestor.map(probe_writable) {
                Some(Ok(())) => CheckResult::warning_with_details(
                    "Sync directory does not exist yet",
                    format!("Run: rm-syncd install {}", root.display()),
                ),
                _ => CheckResult::error_with_details(
                    "Sync directory cannot be created",
                    format!("No writable parent for {}", root.display()),
                ),
            };
        }

        match probe_writable(root) {
            Ok(()) => CheckResult::ok_with_details("Sync directory writable", root.display().to_string()),
            Err(e) => CheckResult::error_with_details(
                "Sync directory is not writable",
                format!("{}: {}", root.display(), e),
            ),
        }
    }

    /// Check the directory layout (warning only)
    fn check_layout(layout: &SyncLayout) -> CheckResult {
        let missing = layout.missing_dirs();
        if missing.is_empty() {
            CheckResult::ok("Directory layout complete")
        } else {
            let list: Vec<String> = missing.iter().map(|p| p.display().to_string()).collect();
            CheckResult::warning_with_details(
                "Directory layout incomplete (created on daemon start)",
                list.join("\n"),
            )
        }
    }

    /// Check whether a daemon already owns the sync directory (warning only)
    fn check_lock(layout: &SyncLayout) -> CheckResult {
        match LockGuard::probe(&layout.lock_file()) {
            Ok(LockStatus::Free) => CheckResult::ok("No daemon running"),
            Ok(LockStatus::Held { pid: Some(pid) }) => {
                CheckResult::warning(format!("Daemon already running (pid {})", pid))
            }
            Ok(LockStatus::Held { pid: None }) => CheckResult::warning("Daemon already running"),
            Err(e) => CheckResult::warning_with_details("Could not probe daemon lock", e.to_string()),
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 5] {
        [
            ("rsync", &self.rsync),
            ("Processing Command", &self.processing),
            ("Sync Directory", &self.sync_dir),
            ("Directory Layout", &self.layout),
            ("Daemon Lock", &self.lock),
        ]
    }
}

/// Create and remove a scratch file in `dir`
fn probe_writable(dir: &Path) -> std::io::Result<()> {
    let probe = dir.join(format!(".rm-syncd-doctor-{}", std::process::id()));
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)?;
    std::fs::remove_file(&probe)
}

/// Find `program` on PATH, or accept it as-is when it contains a path separator
fn resolve_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|path| path.is_file())
}
