//! FFmpeg process spawning, stderr progress parsing and kill switches.
//!
//! Each conversion spawns its own FFmpeg child. Stderr is read on a separate
//! task that feeds the progress parser and keeps a bounded tail for error
//! reporting. The caller hands in a kill switch; firing it terminates the child
//! and the run resolves to `AppError::Aborted`.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, Command};
use tokio::sync::oneshot;

use super::progress::{LineSplitter, parse_ffmpeg_progress};
use crate::error::AppError;

/// Keep only the last N bytes of stderr to avoid unbounded memory growth.
const MAX_STDERR_BYTES: usize = 64 * 1024;
/// How long to wait for stderr EOF after the process has exited.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Fires once to terminate the process it was handed to.
pub type KillSwitch = oneshot::Receiver<()>;

#[derive(Default)]
struct Registry {
    switches: HashMap<usize, oneshot::Sender<()>>,
    closed: bool,
}

/// Kill switches of the processes currently running for one batch, keyed by file index.
#[derive(Default)]
pub struct ActiveProcesses {
    inner: Mutex<Registry>,
}

impl ActiveProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill switch for `index`. After `terminate_all` the switch is already fired.
    pub fn register(&self, index: usize) -> KillSwitch {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.inner.lock();
        if guard.closed {
            let _ = tx.send(());
        } else {
            guard.switches.insert(index, tx);
        }
        rx
    }

    pub fn release(&self, index: usize) {
        self.inner.lock().switches.remove(&index);
    }

    /// Fire every registered switch and refuse new ones. Returns how many were fired.
    pub fn terminate_all(&self) -> usize {
        let switches: Vec<_> = {
            let mut guard = self.inner.lock();
            guard.closed = true;
            guard.switches.drain().collect()
        };
        let count = switches.len();
        for (index, tx) in switches {
            log::info!(
                target: "mediaforge::ffmpeg::runner",
                "Terminating FFmpeg process for file {}",
                index
            );
            let _ = tx.send(());
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().switches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves when the switch fires. A dropped sender never fires.
async fn fired(kill: KillSwitch) {
    if kill.await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn push_tail(tail: &mut Vec<u8>, bytes: &[u8]) {
    tail.extend_from_slice(bytes);
    if tail.len() > MAX_STDERR_BYTES {
        let excess = tail.len() - MAX_STDERR_BYTES;
        tail.drain(..excess);
    }
}

async fn read_stderr(
    mut stderr: ChildStderr,
    duration_secs: Option<f64>,
    tail: Arc<Mutex<Vec<u8>>>,
    on_progress: Option<Arc<dyn Fn(u8) + Send + Sync>>,
) {
    let mut current_duration = duration_secs.filter(|&d| d > 0.0);
    let mut last_percent: Option<u8> = None;
    let mut splitter = LineSplitter::new();
    let mut buf = [0u8; 4096];

    let mut handle_line = |line: &str| {
        let (percent, d) = parse_ffmpeg_progress(line, current_duration);
        current_duration = d;
        if let Some(p) = percent
            && last_percent.is_none_or(|last| p > last)
        {
            last_percent = Some(p);
            if let Some(ref cb) = on_progress {
                cb(p);
            }
        }
    };

    loop {
        let n = match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        push_tail(&mut tail.lock(), &buf[..n]);
        for line in splitter.push(&buf[..n]) {
            handle_line(&line);
        }
    }
    if let Some(line) = splitter.finish() {
        handle_line(&line);
    }
}

/// Run FFmpeg to completion.
///
/// - `duration_secs`: source duration from the probe. When absent, the
///   `Duration:` header on stderr is used instead.
/// - `on_progress`: receives percent in [0, 99], non-decreasing.
/// - `kill`: firing it terminates the child; the result is then `Aborted`.
pub async fn run_ffmpeg(
    ffmpeg: &Path,
    args: &[String],
    duration_secs: Option<f64>,
    on_progress: Option<Arc<dyn Fn(u8) + Send + Sync>>,
    kill: KillSwitch,
) -> Result<(), AppError> {
    let input_arg = args
        .iter()
        .position(|a| a == "-i")
        .and_then(|i| args.get(i + 1));
    log::debug!(
        target: "mediaforge::ffmpeg::runner",
        "Spawning FFmpeg: path={}, input={:?}, output={:?}",
        ffmpeg.display(),
        input_arg,
        args.last()
    );

    let mut cmd = Command::new(ffmpeg);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);
    let mut child = cmd
        .spawn()
        .map_err(|e| AppError::ffmpeg_failed(-1, format!("Failed to spawn FFmpeg: {}", e)))?;

    let stderr = match child.stderr.take() {
        Some(s) => s,
        None => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(AppError::ffmpeg_failed(-1, "Failed to capture stderr"));
        }
    };

    let tail = Arc::new(Mutex::new(Vec::new()));
    let reader = tokio::spawn(read_stderr(
        stderr,
        duration_secs,
        Arc::clone(&tail),
        on_progress,
    ));

    let (status, killed) = tokio::select! {
        status = child.wait() => (status?, false),
        _ = fired(kill) => {
            log::info!(
                target: "mediaforge::ffmpeg::runner",
                "Kill requested, stopping FFmpeg"
            );
            let _ = child.start_kill();
            (child.wait().await?, true)
        }
    };

    // Children of the tool may keep the pipe open; do not wait on them forever.
    if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, reader).await.is_err() {
        log::debug!(
            target: "mediaforge::ffmpeg::runner",
            "Stderr still open after exit, continuing"
        );
    }
    let stderr_str = String::from_utf8_lossy(&tail.lock()).to_string();

    if status.success() {
        log::info!(
            target: "mediaforge::ffmpeg::runner",
            "FFmpeg completed successfully"
        );
        return Ok(());
    }
    if killed {
        log::warn!(
            target: "mediaforge::ffmpeg::runner",
            "FFmpeg process was aborted (terminated by request)"
        );
        return Err(AppError::aborted());
    }

    let code = status.code().unwrap_or(-1);
    let err_preview = stderr_str
        .lines()
        .rev()
        .take(3)
        .collect::<Vec<_>>()
        .join("; ");
    log::error!(
        target: "mediaforge::ffmpeg::runner",
        "FFmpeg failed (code={}): {}",
        code,
        err_preview
    );
    Err(AppError::FfmpegFailed {
        code,
        stderr: stderr_str,
    })
}
