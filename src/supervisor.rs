#![forbid(unsafe_code)]

//! Runs the external extraction tool (yt-dlp) as a supervised child process.
//!
//! Output is consumed line by line from both pipes while the cancellation flag
//! is watched, so an interrupt reaches a running download within one read
//! iteration. Stopping a child always follows the same protocol: a terminate
//! request, a bounded grace period, then a forced kill.

use anyhow::{Result, bail};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::config::Quality;
use crate::error::{ItemError, SupervisorError};
use crate::identity::ItemRef;
use crate::index::AssetIndex;
use crate::interrupt::Interrupt;

const WARNING_MARKER: &str = "WARNING:";
const ERROR_MARKER: &str = "ERROR:";
const DESTINATION_MARKER: &str = "Destination:";
const PLAYER_NOISE_MARKER: &str = "player=";
pub const MERGE_FORMAT: &str = "mp4";

static PERCENT_PROGRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.\d+%").expect("valid progress regex"));

/// Locations of the external tools plus the timing knobs of the termination
/// protocol.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub yt_dlp: PathBuf,
    pub ffprobe: PathBuf,
    pub grace_period: Duration,
    pub extraction_timeout: Option<Duration>,
}

impl Toolchain {
    /// Fails loudly when either tool is missing from PATH.
    pub fn ensure_available(&self) -> Result<()> {
        ensure_program_available(&self.yt_dlp, "--version")?;
        ensure_program_available(&self.ffprobe, "-version")
    }
}

/// Runs `<program> <version_flag>` and checks that it exits cleanly.
fn ensure_program_available(program: &Path, version_flag: &str) -> Result<()> {
    let status = std::process::Command::new(program)
        .arg(version_flag)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!(
            "{} is installed but returned a failure status",
            program.display()
        ),
        Err(err) => bail!("{} is not installed or not in PATH: {}", program.display(), err),
    }
}

/// Keeps progress, destination and error lines; drops warnings and the
/// player-script chatter that accompanies some destination lines.
pub fn keep_tool_line(line: &str) -> bool {
    if line.contains(WARNING_MARKER) {
        return false;
    }
    if (PERCENT_PROGRESS.is_match(line) || line.contains(DESTINATION_MARKER))
        && !line.contains(PLAYER_NOISE_MARKER)
    {
        return true;
    }
    line.contains(ERROR_MARKER)
}

pub fn format_selector(quality: Quality) -> String {
    match quality {
        Quality::Best => "bestvideo+bestaudio/best".to_string(),
        Quality::MaxHeight(height) => {
            format!("bestvideo[height<={height}]+bestaudio/best[height<={height}]")
        }
    }
}

/// `{dir}/{stable_id}.%(ext)s`; the tool picks the extension.
pub fn output_template(directory: &Path, stable_id: &str) -> PathBuf {
    directory.join(format!("{stable_id}.%(ext)s"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Spawns `command` and feeds every output line to `on_line` until the child
/// exits. Interrupts and the optional timeout stop the child through
/// [`terminate`].
pub async fn run_supervised(
    mut command: Command,
    tool: &str,
    interrupt: &Interrupt,
    grace_period: Duration,
    timeout: Option<Duration>,
    mut on_line: impl FnMut(OutputStream, &str),
) -> Result<(), SupervisorError> {
    if interrupt.is_set() {
        return Err(SupervisorError::Interrupted);
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
        tool: tool.to_string(),
        source,
    })?;
    let missing_pipe = |name: &str| SupervisorError::Io {
        tool: tool.to_string(),
        source: std::io::Error::other(format!("{name} was not captured")),
    };
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;
    let mut stdout = BufReader::new(stdout).lines();
    let mut stderr = BufReader::new(stderr).lines();
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut last_error: Option<String> = None;

    let deadline = async move {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let status = loop {
        if interrupt.is_set() {
            terminate(&mut child, grace_period, tool).await;
            return Err(SupervisorError::Interrupted);
        }

        tokio::select! {
            biased;
            _ = interrupt.wait() => {
                terminate(&mut child, grace_period, tool).await;
                return Err(SupervisorError::Interrupted);
            }
            _ = &mut deadline => {
                terminate(&mut child, grace_period, tool).await;
                return Err(SupervisorError::TimedOut {
                    tool: tool.to_string(),
                    secs: timeout.map(|limit| limit.as_secs()).unwrap_or_default(),
                });
            }
            line = stdout.next_line(), if stdout_open => match line {
                Ok(Some(line)) => on_line(OutputStream::Stdout, &line),
                Ok(None) => stdout_open = false,
                Err(err) => {
                    tracing::warn!(tool, "stopped reading stdout: {err}");
                    stdout_open = false;
                }
            },
            line = stderr.next_line(), if stderr_open => match line {
                Ok(Some(line)) => {
                    if line.contains(ERROR_MARKER) {
                        last_error = Some(line.trim().to_string());
                    }
                    on_line(OutputStream::Stderr, &line);
                }
                Ok(None) => stderr_open = false,
                Err(err) => {
                    tracing::warn!(tool, "stopped reading stderr: {err}");
                    stderr_open = false;
                }
            },
            status = child.wait(), if !stdout_open && !stderr_open => {
                break status.map_err(|source| SupervisorError::Io {
                    tool: tool.to_string(),
                    source,
                })?;
            }
        }
    };

    if status.success() {
        Ok(())
    } else {
        Err(SupervisorError::Failed {
            tool: tool.to_string(),
            status,
            last_error,
        })
    }
}

/// Asks the child to stop, waits up to `grace_period`, then kills it.
pub async fn terminate(child: &mut Child, grace_period: Duration, tool: &str) {
    request_stop(child, tool);
    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(tool, %status, "process stopped"),
        Ok(Err(err)) => tracing::warn!(tool, "waiting for process failed: {err}"),
        Err(_) => {
            tracing::warn!(
                tool,
                grace_secs = grace_period.as_secs_f64(),
                "process ignored terminate request, killing"
            );
            if let Err(err) = child.kill().await {
                tracing::warn!(tool, "kill failed: {err}");
            }
        }
    }
}

#[cfg(unix)]
fn request_stop(child: &mut Child, tool: &str) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        tracing::warn!(tool, pid, "could not send SIGTERM: {err}");
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child, tool: &str) {
    if let Err(err) = child.start_kill() {
        tracing::warn!(tool, "could not stop process: {err}");
    }
}

pub(crate) fn tool_label(program: &Path) -> String {
    program
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}

/// Downloads one item into the index's directory and returns the file the
/// tool produced. The directory is rescanned afterwards because the final
/// extension is only known to the tool.
pub async fn run_extraction(
    toolchain: &Toolchain,
    item: &ItemRef,
    index: &AssetIndex,
    quality: Quality,
    interrupt: &Interrupt,
) -> Result<PathBuf, ItemError> {
    let template = output_template(index.directory(), item.stable_id());
    let tool = tool_label(&toolchain.yt_dlp);

    let mut command = Command::new(&toolchain.yt_dlp);
    command
        .arg(item.source_url())
        .arg("-f")
        .arg(format_selector(quality))
        .arg("--output")
        .arg(&template)
        .arg("--force-overwrites")
        .arg("--no-continue")
        .arg("--no-part")
        .arg("--merge-output-format")
        .arg(MERGE_FORMAT)
        .arg("--no-warnings")
        .arg("--newline");

    run_supervised(
        command,
        &tool,
        interrupt,
        toolchain.grace_period,
        toolchain.extraction_timeout,
        |stream, line| {
            if !keep_tool_line(line) {
                return;
            }
            match stream {
                OutputStream::Stderr if line.contains(ERROR_MARKER) => {
                    tracing::error!("{tool} stderr: {line}")
                }
                _ => tracing::debug!("{line}"),
            }
        },
    )
    .await?;

    if interrupt.is_set() {
        return Err(ItemError::Interrupted);
    }

    let refreshed = index.rebuild().map_err(ItemError::Rescan)?;
    tracing::debug!(
        generation = refreshed.generation(),
        files = refreshed.len(),
        "rescanned output directory"
    );
    let path = refreshed
        .find(item.stable_id())
        .map(Path::to_path_buf)
        .ok_or_else(|| ItemError::MissingOutput(item.stable_id().to_string()))?;

    let size_mb = std::fs::metadata(&path)
        .map(|meta| meta.len() as f64 / (1024.0 * 1024.0))
        .unwrap_or_default();
    tracing::info!(file = %path.display(), "download finished ({size_mb:.2} MB)");
    Ok(path)
}

/// Enumerates the video ids of a playlist with `--flat-playlist --get-id`,
/// under the same termination protocol as a download.
pub async fn list_playlist_ids(
    toolchain: &Toolchain,
    playlist_url: &str,
    interrupt: &Interrupt,
) -> Result<Vec<String>, SupervisorError> {
    let tool = tool_label(&toolchain.yt_dlp);
    let mut command = Command::new(&toolchain.yt_dlp);
    command
        .arg("--flat-playlist")
        .arg("--get-id")
        .arg(playlist_url);

    let mut ids = Vec::new();
    run_supervised(
        command,
        &tool,
        interrupt,
        toolchain.grace_period,
        toolchain.extraction_timeout,
        |stream, line| match stream {
            OutputStream::Stdout => {
                let id = line.trim();
                if !id.is_empty() {
                    ids.push(id.to_string());
                }
            }
            OutputStream::Stderr => {
                if keep_tool_line(line) {
                    tracing::warn!("{tool} stderr: {line}");
                }
            }
        },
    )
    .await?;
    Ok(ids)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Toolchain;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    pub fn toolchain(yt_dlp: PathBuf, ffprobe: PathBuf) -> Toolchain {
        Toolchain {
            yt_dlp,
            ffprobe,
            grace_period: Duration::from_secs(1),
            extraction_timeout: None,
        }
    }

    /// Writes an executable shell script standing in for an external tool.
    pub fn install_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/usr/bin/env bash\n{body}")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).unwrap();
        }
        path
    }
}
