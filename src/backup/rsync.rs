//! rsync as the transfer and listing engine.

use super::inquiry::DirLister;
use super::rsync_output::{parse_listing, sum_file_sizes, ListEntry, TransferStats};
use super::types::FolderSize;
use crate::error::{BackupError, Result};
use crate::utils::config::TransferOptions;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exit codes that may mean the destination filesystem is full
/// (23: partial transfer due to error, 11: error in file I/O).
pub const SPACE_EXIT_CODES: [i32; 2] = [23, 11];

/// Exit codes worth another attempt: socket I/O, protocol stream, timeouts.
pub const TRANSIENT_EXIT_CODES: [i32; 4] = [10, 12, 30, 35];

/// One rsync invocation for one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub src: String,
    /// Absolute destination folder
    pub dst: PathBuf,
    /// Whole subtree, or only the files directly inside `src`
    pub recursive: bool,
    /// Folders below `src` to leave out, relative to `src`
    pub excludes: Vec<String>,
    /// Previous copies of `dst` to hardlink unchanged files against
    pub link_dests: Vec<PathBuf>,
    pub options: TransferOptions,
    pub chmod: Option<String>,
    pub password: Option<String>,
    pub verbose: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOutcome {
    /// None when rsync was killed by a signal
    pub exit_code: Option<i32>,
    pub output: Vec<String>,
    pub errors: Vec<String>,
    pub stats: TransferStats,
}

impl TransferOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn error_message(&self) -> String {
        if self.errors.is_empty() {
            format!("rsync failed with exit code: {:?}", self.exit_code)
        } else {
            self.errors.join("\n")
        }
    }
}

/// The point-to-point copy primitive driven by the executor.
#[async_trait]
pub trait SyncPrimitive: Send + Sync {
    /// Runs one transfer. Non-zero exit codes are reported in the outcome;
    /// `Err` is reserved for spawn failures and cancellation.
    async fn transfer(&self, req: &TransferRequest, cancel: &CancellationToken) -> Result<TransferOutcome>;
}

pub fn build_transfer_args(req: &TransferRequest) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["--times".into(), "--protect-args".into()];

    if req.recursive {
        args.push("--recursive".into());
    } else {
        args.push("--dirs".into());
        args.push("--exclude=*/".into());
    }

    let o = &req.options;
    for (enabled, flag) in [
        (o.transfer_source_permissions, "--perms"),
        (o.transfer_source_owner, "--owner"),
        (o.transfer_source_group, "--group"),
        (o.symlinks_as_symlinks, "--links"),
        (o.transfer_device_files, "--devices"),
        (o.transfer_special_files, "--specials"),
        (o.compress_file_transfer, "--compress"),
    ] {
        if enabled {
            args.push(flag.into());
        }
    }

    if let Some(chmod) = &req.chmod {
        args.push(format!("--chmod={}", chmod).into());
    }

    for exclude in &req.excludes {
        args.push(format!("--exclude=/{}/", exclude.trim_matches('/')).into());
    }

    for target in &req.link_dests {
        let mut arg = OsString::from("--link-dest=");
        arg.push(target.as_os_str());
        args.push(arg);
    }

    args.push("--stats".into());
    if req.verbose {
        args.push("--verbose".into());
    }

    args.push(with_trailing_slash(&req.src).into());
    let mut dst = req.dst.clone().into_os_string();
    if !dst.to_string_lossy().ends_with('/') {
        dst.push("/");
    }
    args.push(dst);
    args
}

fn with_trailing_slash(path: &str) -> String {
    format!("{}/", path.trim_end_matches('/'))
}

async fn read_lines<R>(reader: Option<R>) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    if let Some(reader) = reader {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            out.push(line);
        }
    }
    out
}

/// Runs a prepared command, killing it if `cancel` fires first.
async fn run_cancellable(
    mut cmd: Command,
    cancel: &CancellationToken,
) -> Result<(Option<i32>, Vec<String>, Vec<String>)> {
    if cancel.is_cancelled() {
        return Err(BackupError::ProcessTerminated);
    }

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BackupError::RsyncSpawn(e.to_string()))?;

    let stdout_task = tokio::spawn(read_lines(child.stdout.take()));
    let stderr_task = tokio::spawn(read_lines(child.stderr.take()));

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill rsync: {}", e);
            }
            stdout_task.abort();
            stderr_task.abort();
            return Err(BackupError::ProcessTerminated);
        }
    };

    let output = stdout_task.await.unwrap_or_default();
    let errors = stderr_task.await.unwrap_or_default();
    Ok((status.code(), output, errors))
}

#[derive(Debug, Clone)]
pub struct RsyncTransfer {
    rsync_path: PathBuf,
}

impl RsyncTransfer {
    pub fn new(rsync_path: impl Into<PathBuf>) -> Self {
        Self {
            rsync_path: rsync_path.into(),
        }
    }
}

#[async_trait]
impl SyncPrimitive for RsyncTransfer {
    async fn transfer(&self, req: &TransferRequest, cancel: &CancellationToken) -> Result<TransferOutcome> {
        if let Some(parent) = req.dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let args = build_transfer_args(req);
        debug!("Running rsync: {:?}", args);
        let mut cmd = Command::new(&self.rsync_path);
        cmd.args(&args);
        if let Some(password) = &req.password {
            cmd.env("RSYNC_PASSWORD", password);
        }

        let (exit_code, output, errors) = run_cancellable(cmd, cancel).await?;
        for line in &errors {
            warn!("rsync stderr: {}", line);
        }

        let mut stats = TransferStats::default();
        for line in &output {
            stats.feed_line(line);
        }
        Ok(TransferOutcome {
            exit_code,
            output,
            errors,
            stats,
        })
    }
}

/// Lists source folders with `rsync --list-only`; works for local and remote sources.
#[derive(Debug, Clone)]
pub struct RsyncLister {
    rsync_path: PathBuf,
}

impl RsyncLister {
    pub fn new(rsync_path: impl Into<PathBuf>) -> Self {
        Self {
            rsync_path: rsync_path.into(),
        }
    }

    async fn list_only(
        &self,
        path: &str,
        recursive: bool,
        auth: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut cmd = Command::new(&self.rsync_path);
        cmd.arg("--list-only").arg("--protect-args");
        if recursive {
            cmd.arg("--recursive");
        }
        cmd.arg(with_trailing_slash(path));
        if let Some(password) = auth {
            cmd.env("RSYNC_PASSWORD", password);
        }

        let (code, output, errors) = run_cancellable(cmd, cancel).await?;
        if code == Some(0) {
            return Ok(output);
        }

        let message = if errors.is_empty() {
            format!("rsync exited with code {:?}", code)
        } else {
            errors.join("\n")
        };
        if message.contains("Not a directory") {
            return Err(BackupError::NotADirectory(path.to_string()));
        }
        Err(BackupError::Inquiry {
            path: path.to_string(),
            message,
        })
    }
}

#[async_trait]
impl DirLister for RsyncLister {
    async fn list(&self, path: &str, auth: Option<&str>, cancel: &CancellationToken) -> Result<Vec<ListEntry>> {
        let output = self.list_only(path, false, auth, cancel).await?;
        Ok(parse_listing(&output.join("\n")))
    }

    async fn measure(&self, path: &str, auth: Option<&str>, cancel: &CancellationToken) -> Result<FolderSize> {
        let output = self.list_only(path, true, auth, cancel).await?;
        Ok(FolderSize(sum_file_sizes(&output.join("\n"))))
    }
}

/// Check if rsync is available and return its version line
pub async fn check_rsync(rsync_path: &Path) -> Result<String> {
    let output = Command::new(rsync_path)
        .arg("--version")
        .output()
        .await
        .map_err(|e| BackupError::RsyncSpawn(e.to_string()))?;

    if !output.status.success() {
        return Err(BackupError::RsyncSpawn(format!(
            "{} --version exited with {}",
            rsync_path.display(),
            output.status
        )));
    }

    let version = String::from_utf8_lossy(&output.stdout);
    Ok(version.lines().next().unwrap_or("unknown").to_string())
}
