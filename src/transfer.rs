//! Directory mirroring used by both pipeline stages
//!
//! A transfer makes `dst` an exact copy of `src`: new and changed files are
//! copied, files present only in `dst` are deleted. Repeating a transfer with
//! an unchanged `src` changes nothing, which is what lets the reconciler redo
//! a stage or promote after a crash without harm.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

use crate::config::TransferConfig;

/// Failure of a mirror operation. Always retryable.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} {}: {stderr}", describe_exit(.code))]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with status {code}"),
        None => "was terminated by a signal".to_string(),
    }
}

/// What a successful mirror operation changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferReport {
    /// Entries created, updated or deleted in the destination
    pub changed_entries: usize,
}

impl TransferReport {
    pub fn is_noop(&self) -> bool {
        self.changed_entries == 0
    }
}

/// One-way directory mirroring
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mirror: Send + Sync {
    /// Make the contents of `dst` equal to the contents of `src`
    async fn mirror(&self, src: &Path, dst: &Path) -> Result<TransferReport, TransferError>;
}

/// Mirror implementation backed by `rsync -a --delete`
#[derive(Debug, Clone)]
pub struct Rsync {
    program: String,
    extra_args: Vec<String>,
}

impl Rsync {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            program: config.rsync_path.clone(),
            extra_args: config.extra_args.clone(),
        }
    }

    fn args(&self, src: &Path, dst: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-a", "--delete", "--itemize-changes"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.extend(self.extra_args.iter().map(OsString::from));
        // Trailing slashes: mirror the contents, not the directory itself
        args.push(with_trailing_slash(src));
        args.push(with_trailing_slash(dst));
        args
    }
}

fn with_trailing_slash(path: &Path) -> OsString {
    let mut arg = path.as_os_str().to_owned();
    if !path.as_os_str().to_string_lossy().ends_with('/') {
        arg.push("/");
    }
    arg
}

#[async_trait]
impl Mirror for Rsync {
    async fn mirror(&self, src: &Path, dst: &Path) -> Result<TransferReport, TransferError> {
        info!("rsync: {} -> {}", src.display(), dst.display());

        let output = AsyncCommand::new(&self.program)
            .args(self.args(src, dst))
            .output()
            .await
            .map_err(|source| TransferError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(TransferError::Failed {
                program: self.program.clone(),
                code: output.status.code(),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let changed_entries = count_itemized_changes(&stdout);
        debug!(
            "rsync finished: {} changed entries in {}",
            changed_entries,
            dst.display()
        );

        Ok(TransferReport { changed_entries })
    }
}

/// Count the `--itemize-changes` lines that describe an actual change
///
/// Itemize lines look like `>f+++++++++ path` or `*deleting   path`. Anything
/// else (the `-v`/`--stats` summary, blank lines) is ignored, as are the
/// unchanged-item lines `-ii` prints with an all-blank attribute field.
fn count_itemized_changes(stdout: &str) -> usize {
    stdout.lines().filter(|line| is_itemized_change(line)).count()
}

fn is_itemized_change(line: &str) -> bool {
    if line.starts_with("*deleting ") {
        return true;
    }

    let bytes = line.as_bytes();
    if bytes.len() < 13 || bytes[11] != b' ' {
        return false;
    }
    let update = bytes[0];
    let file_type = bytes[1];
    if !b"<>ch.".contains(&update) || !b"fdLDS".contains(&file_type) {
        return false;
    }

    let attrs = &bytes[2..11];
    if !attrs
        .iter()
        .all(|b| b.is_ascii_alphabetic() || *b == b'.' || *b == b'+' || *b == b' ' || *b == b'?')
    {
        return false;
    }
    update != b'.' || attrs.iter().any(|b| *b != b' ')
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn rsync_available() -> bool {
        std::process::Command::new("rsync")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Relative path -> file contents for every file under `root`
    fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
            for entry in fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    walk(root, &path, out);
                } else {
                    let rel = path.strip_prefix(root).unwrap().to_path_buf();
                    out.insert(rel, fs::read(&path).unwrap());
                }
            }
        }
        let mut out = BTreeMap::new();
        walk(root, root, &mut out);
        out
    }

    #[test]
    fn test_args_use_trailing_slashes() {
        let mut rsync = Rsync::new("rsync");
        rsync.extra_args = vec!["--checksum".to_string()];

        let args = rsync.args(Path::new("/a/src"), Path::new("/a/dst/"));

        assert_eq!(
            args,
            vec![
                OsString::from("-a"),
                OsString::from("--delete"),
                OsString::from("--itemize-changes"),
                OsString::from("--checksum"),
                OsString::from("/a/src/"),
                OsString::from("/a/dst/"),
            ]
        );
    }

    #[test]
    fn test_counts_itemized_changes() {
        let stdout = "\
cd+++++++++ notebook/
>f+++++++++ notebook/page.rm
>f.st...... a.metadata
.d..t...... ./
*deleting   stale.content
";
        assert_eq!(count_itemized_changes(stdout), 5);
        assert_eq!(count_itemized_changes(""), 0);
    }

    #[test]
    fn test_itemize_count_ignores_verbose_and_stats_output() {
        let stdout = "\
sending incremental file list
>f.st...... a.metadata

Number of files: 3 (reg: 2, dir: 1)
Number of regular files transferred: 1
sent 180 bytes  received 35 bytes  430.00 bytes/sec
total size is 12  speedup is 0.06
";
        assert_eq!(count_itemized_changes(stdout), 1);

        let noop = "\
sending incremental file list

sent 98 bytes  received 12 bytes  220.00 bytes/sec
total size is 12  speedup is 0.11
";
        assert_eq!(count_itemized_changes(noop), 0);
    }

    #[test]
    fn test_itemize_count_skips_unchanged_entries() {
        // `-ii` lists unchanged entries with a blank attribute field
        let stdout = "\
.d          ./
.f          a.metadata
>f..t...... notebook/page.rm
";
        assert_eq!(count_itemized_changes(stdout), 1);
    }

    #[test]
    fn test_failed_error_message() {
        let err = TransferError::Failed {
            program: "rsync".to_string(),
            code: Some(23),
            stderr: "some files vanished".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "rsync exited with status 23: some files vanished"
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let temp = tempdir().unwrap();
        let rsync = Rsync::new("rm-syncd-no-such-rsync");

        let result = rsync.mirror(temp.path(), temp.path()).await;

        assert_matches!(result, Err(TransferError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_mirror_is_idempotent() {
        if !rsync_available() {
            eprintln!("rsync not installed, skipping");
            return;
        }

        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(src.join("notebook")).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("a.metadata"), b"{}").unwrap();
        fs::write(src.join("notebook").join("page.rm"), b"strokes").unwrap();

        let rsync = Rsync::new("rsync");
        let first = rsync.mirror(&src, &dst).await.unwrap();
        let after_first = snapshot(&dst);

        let second = rsync.mirror(&src, &dst).await.unwrap();
        let after_second = snapshot(&dst);

        assert!(!first.is_noop());
        assert!(second.is_noop());
        assert_eq!(after_first, snapshot(&src));
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn test_mirror_deletes_extraneous_files() {
        if !rsync_available() {
            eprintln!("rsync not installed, skipping");
            return;
        }

        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("kept"), b"1").unwrap();
        fs::write(dst.join("stale"), b"old").unwrap();

        tokio_test::assert_ok!(Rsync::new("rsync").mirror(&src, &dst).await);

        assert!(dst.join("kept").exists());
        assert!(!dst.join("stale").exists());
    }

    #[tokio::test]
    async fn test_missing_source_is_failed_with_stderr() {
        if !rsync_available() {
            eprintln!("rsync not installed, skipping");
            return;
        }

        let temp = tempdir().unwrap();
        let result = Rsync::new("rsync")
            .mirror(&temp.path().join("absent"), &temp.path().join("dst"))
            .await;

        match result {
            Err(TransferError::Failed { code, stderr, .. }) => {
                assert_ne!(code, Some(0));
                assert!(!stderr.is_empty());
            }
            other => panic!("expected TransferError::Failed, got {other:?}"),
        }
    }
}
