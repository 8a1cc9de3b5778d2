/// Common test utilities and helpers for rm-syncd integration tests
use assert_fs::prelude::*;
use assert_fs::TempDir;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Scratch home, config directory and sync directory for one test
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub config_home: PathBuf,
    pub sync_dir: PathBuf,
}

#[allow(dead_code)]
impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_home = temp_dir.child("config").path().to_path_buf();
        let sync_dir = temp_dir.child("sync").path().to_path_buf();

        Self {
            temp_dir,
            config_home,
            sync_dir,
        }
    }

    /// Write a config file and return its path
    pub fn create_test_config(&self, content: &str) -> PathBuf {
        let config = self.temp_dir.child("rm-syncd.yml");
        config.write_str(content).expect("Failed to write test config");
        config.path().to_path_buf()
    }

    /// Config that never needs the real viewer or processing tool
    pub fn create_minimal_config(&self) -> PathBuf {
        let content = format!(
            r#"
sync_dir: "{}"
viewer:
  enabled: false
processing:
  command: ["true"]
daemon:
  max_wait: "100ms"
  poll_interval: "20ms"
logging:
  level: "debug"
  color: false
"#,
            self.sync_dir.display()
        );
        self.create_test_config(&content)
    }

    /// Command for the built binary, isolated from the user's real config
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_rm-syncd"));
        cmd.env("XDG_CONFIG_HOME", &self.config_home)
            .env("HOME", self.temp_dir.path())
            .env_remove("RUST_LOG");
        cmd
    }

    pub fn run(&self, args: &[&str]) -> Output {
        self.command()
            .args(args)
            .output()
            .expect("Failed to execute rm-syncd")
    }

    pub fn sync_path(&self, relative: &str) -> PathBuf {
        self.sync_dir.join(relative)
    }

    pub fn default_config_path(&self) -> PathBuf {
        self.config_home.join("rm-syncd").join("config.yml")
    }
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[allow(dead_code)]
pub fn path_str(path: &Path) -> &str {
    path.to_str().expect("test paths are UTF-8")
}
