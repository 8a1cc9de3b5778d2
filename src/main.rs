use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rm_syncd::config::{self, LoggingConfig};
use rm_syncd::daemon;
use rm_syncd::health::CheckResult;
use rm_syncd::{Config, Daemon, HealthCheck, SyncLayout};

#[derive(Parser)]
#[command(name = "rm-syncd")]
#[command(about = "Reconciles reMarkable device syncs into rm-viewer output")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the directory structure and print setup instructions
    Install {
        /// Sync directory (overrides sync_dir from the config file)
        sync_dir: Option<String>,
    },

    /// Run the sync daemon in the foreground until SIGINT/SIGTERM
    Run {
        /// Sync directory (overrides sync_dir from the config file)
        sync_dir: Option<String>,

        /// URL of the rm-viewer instance for rebuild notifications
        #[arg(long)]
        viewer_url: Option<String>,
    },

    /// Show the state of a sync directory
    Status {
        /// Sync directory (overrides sync_dir from the config file)
        sync_dir: Option<String>,

        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// System health check and diagnostics
    Doctor {
        /// Sync directory (overrides sync_dir from the config file)
        sync_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config)?;
    init_logging(cli.verbose, &config.logging)?;

    match cli.command {
        Commands::Install { sync_dir } => {
            apply_sync_dir(&mut config, sync_dir)?;
            cmd_install(&config)
        }
        Commands::Run {
            sync_dir,
            viewer_url,
        } => {
            apply_sync_dir(&mut config, sync_dir)?;
            if let Some(url) = viewer_url {
                config.viewer.url = url;
                config.viewer.enabled = true;
            }
            cmd_run(config).await
        }
        Commands::Status { sync_dir, json } => {
            apply_sync_dir(&mut config, sync_dir)?;
            cmd_status(&config, json)
        }
        Commands::Doctor { sync_dir } => {
            apply_sync_dir(&mut config, sync_dir)?;
            cmd_doctor(&config)
        }
    }
}

/// Initialize logging based on verbosity and the logging section of the config
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(logging.color),
        )
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Config::load_or_default(),
    }
}

/// Replace the configured sync directory with an absolute form of `sync_dir`
fn apply_sync_dir(config: &mut Config, sync_dir: Option<String>) -> Result<()> {
    let Some(raw) = sync_dir else {
        return Ok(());
    };

    let mut path = config::expand_path(&raw)?;
    if path.is_relative() {
        path = std::env::current_dir()
            .context("Failed to resolve current directory")?
            .join(path);
    }
    config.sync_dir = path.to_string_lossy().into_owned();
    Ok(())
}

/// Create the layout and print device and viewer setup instructions
fn cmd_install(config: &Config) -> Result<()> {
    let layout = SyncLayout::new(config.sync_dir_path());
    daemon::install(&layout)?;
    let sd = layout.root().display();

    println!("✅ Sync directory created: {}", sd);
    println!();
    println!("  📁 xochitl-dirty/       <- device rsyncs here");
    println!("  📁 xochitl-staging/     <- staged snapshot");
    println!("  📁 stable/");
    println!("    📁 xochitl/           <- stable snapshot for processing");
    println!("    📁 process_out/       <- viewer serves from here");
    println!();
    println!("📱 Device config (set in .rm-viewer/config.sh):");
    println!("   SYNC_DIR=\"{}\"", sd);
    println!();
    println!("📥 Initial sync (copy xochitl from the tablet into the dirty dir):");
    println!(
        "   scp -r root@<tablet-ip>:/home/root/.local/share/remarkable/xochitl/* {}/xochitl-dirty/",
        sd
    );
    println!("   touch {}/syncflag", sd);
    println!();
    println!("🚀 Then start the viewer and the daemon:");
    println!("   rm-viewer view {}/stable/process_out", sd);
    println!("   rm-syncd run {}", sd);
    println!();
    println!("   The viewer reloads automatically once new data is processed.");

    Ok(())
}

/// Run the daemon until a shutdown signal arrives
async fn cmd_run(config: Config) -> Result<()> {
    info!("Starting rm-syncd v{}", env!("CARGO_PKG_VERSION"));
    if config.viewer.enabled {
        info!("Viewer rebuild endpoint: {}", config.rebuild_url());
    } else {
        info!("Viewer notification disabled");
    }

    let daemon = Daemon::new(config);
    daemon.run().await
}

/// Report the state of a sync directory without modifying it
fn cmd_status(config: &Config, json: bool) -> Result<()> {
    let layout = SyncLayout::new(config.sync_dir_path());
    let status = daemon::status(&layout)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status).context("Failed to serialize status")?
        );
        return Ok(());
    }

    println!("📊 rm-syncd Status");
    println!("   📁 Sync directory: {}", status.sync_dir.display());

    if status.is_running {
        match status.pid {
            Some(pid) => println!("   🟢 Daemon: Running (pid {})", pid),
            None => println!("   🟢 Daemon: Running"),
        }
    } else {
        println!("   🔴 Daemon: Not running");
    }

    if status.syncflag_present {
        println!("   🚩 Syncflag: present (device sync waiting to be staged)");
    } else {
        println!("   ⚪ Syncflag: absent");
    }

    for dir in layout.directories() {
        let icon = if status.missing_dirs.contains(&dir) { "❌" } else { "✅" };
        println!("   {} {}", icon, dir.display());
    }

    if !status.missing_dirs.is_empty() {
        println!("   💡 Use 'rm-syncd install' to create the directory structure");
    }

    Ok(())
}

/// System health check and diagnostics
fn cmd_doctor(config: &Config) -> Result<()> {
    let health = HealthCheck::run(config);
    print_health_report(&health);

    if !health.all_passed() {
        std::process::exit(1);
    }
    Ok(())
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 rm-syncd System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    let errors = health.errors();
    let warnings = health.warnings();
    if errors.is_empty() {
        println!("✅ All checks passed ({} warnings)", warnings.len());
    } else {
        println!(
            "❌ {} checks failed, {} warnings",
            errors.len(),
            warnings.len()
        );
    }
}
