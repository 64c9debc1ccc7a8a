#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mediaforge_core::batch::{BatchHooks, BatchProgress, Notification};
use mediaforge_core::convert::{ConvertOutcome, ItemContext, ItemConverter};
use mediaforge_core::ffmpeg::{ConversionPolicy, MediaTools};
use mediaforge_core::hardware::HardwareCapability;
use parking_lot::Mutex;

/// What the fake does for one file, keyed by file name.
#[derive(Clone, Debug)]
pub enum Plan {
    /// Report each percent after `step`, then complete.
    Succeed { progress: Vec<u8>, step: Duration },
    Fail { after: Duration, error: String },
    /// Run until the kill switch fires.
    Hang,
    /// Wait for the kill switch, then report a failure the way a killed
    /// process with a non-zero exit does.
    FailOnKill { error: String },
    Panic,
}

impl Plan {
    pub fn quick() -> Self {
        Plan::Succeed {
            progress: vec![25, 50, 75],
            step: Duration::from_millis(5),
        }
    }

    pub fn slow(total: Duration) -> Self {
        Plan::Succeed {
            progress: vec![50],
            step: total / 2,
        }
    }

    pub fn fail(error: &str) -> Self {
        Plan::Fail {
            after: Duration::from_millis(5),
            error: error.to_string(),
        }
    }
}

/// In-memory converter with scripted per-file behavior.
pub struct FakeConverter {
    plans: HashMap<String, Plan>,
    default_plan: Plan,
    capability: HardwareCapability,
    active: AtomicUsize,
    max_active: AtomicUsize,
    started: Mutex<Vec<usize>>,
    threads_seen: Mutex<Vec<usize>>,
}

impl FakeConverter {
    pub fn new(default_plan: Plan) -> Self {
        Self {
            plans: HashMap::new(),
            default_plan,
            capability: HardwareCapability::software(8),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
            threads_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_plan(mut self, file_name: &str, plan: Plan) -> Self {
        self.plans.insert(file_name.to_string(), plan);
        self
    }

    pub fn with_cpu_threads(mut self, threads: usize) -> Self {
        self.capability = HardwareCapability::software(threads);
        self
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<usize> {
        self.started.lock().clone()
    }

    pub fn threads_seen(&self) -> Vec<usize> {
        self.threads_seen.lock().clone()
    }

    fn plan_for(&self, source: &Path) -> Plan {
        source
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| self.plans.get(n))
            .unwrap_or(&self.default_plan)
            .clone()
    }

    async fn run_plan(&self, source: &Path, policy: &ConversionPolicy, mut ctx: ItemContext) -> ConvertOutcome {
        match self.plan_for(source) {
            Plan::Succeed { progress, step } => {
                for pct in progress {
                    tokio::select! {
                        _ = tokio::time::sleep(step) => (ctx.on_progress)(pct),
                        _ = &mut ctx.kill => return ConvertOutcome::Cancelled,
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(step) => {}
                    _ = &mut ctx.kill => return ConvertOutcome::Cancelled,
                }
                ConvertOutcome::Completed {
                    output_path: source.with_extension(policy.format.as_str()),
                    output_size_bytes: 1024,
                    used_stream_copy: false,
                }
            }
            Plan::Fail { after, error } => {
                tokio::select! {
                    _ = tokio::time::sleep(after) => ConvertOutcome::Failed { error },
                    _ = &mut ctx.kill => ConvertOutcome::Cancelled,
                }
            }
            Plan::Hang => {
                let _ = (&mut ctx.kill).await;
                ConvertOutcome::Cancelled
            }
            Plan::FailOnKill { error } => {
                let _ = (&mut ctx.kill).await;
                ConvertOutcome::Failed { error }
            }
            Plan::Panic => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                panic!("converter exploded on {}", source.display());
            }
        }
    }
}

impl ItemConverter for FakeConverter {
    async fn capabilities(&self) -> HardwareCapability {
        self.capability.clone()
    }

    async fn convert(
        &self,
        source: &Path,
        policy: &ConversionPolicy,
        _capability: &HardwareCapability,
        ctx: ItemContext,
    ) -> ConvertOutcome {
        self.started.lock().push(ctx.file_index);
        self.threads_seen.lock().push(ctx.threads);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let outcome = self.run_plan(source, policy, ctx).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Hooks that record every event in delivery order.
#[derive(Clone, Default)]
pub struct Recorder {
    pub progress: Arc<Mutex<Vec<BatchProgress>>>,
    pub notifications: Arc<Mutex<Vec<Notification>>>,
}

impl Recorder {
    pub fn hooks(&self) -> BatchHooks {
        let progress = Arc::clone(&self.progress);
        let notifications = Arc::clone(&self.notifications);
        BatchHooks::default()
            .on_progress(move |p| progress.lock().push(p.clone()))
            .on_notification(move |n| notifications.lock().push(n.clone()))
    }

    pub fn progress(&self) -> Vec<BatchProgress> {
        self.progress.lock().clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }
}

pub fn files(names: &[&str]) -> Vec<PathBuf> {
    names.iter().map(|n| PathBuf::from("/media").join(n)).collect()
}

/// Poll `check` every 5 ms, panicking after 5 s.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Scratch directory holding executable fake `ffmpeg` / `ffprobe` scripts.
pub struct FakeToolsEnv {
    pub dir: tempfile::TempDir,
}

impl FakeToolsEnv {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temp dir"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn write_file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path(name);
        fs::write(&path, contents).expect("write file");
        path
    }

    #[cfg(unix)]
    pub fn write_script(&self, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = self.write_file(name, &format!("#!/bin/sh\n{}\n", body));
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
        path
    }

    /// ffprobe answering duration queries with `duration` and JSON queries with
    /// one h264 video stream and one aac audio stream.
    #[cfg(unix)]
    pub fn ffprobe(&self, duration: &str) -> PathBuf {
        let json = r#"{"format":{"duration":"10.0","size":"2048","bit_rate":"1600","format_name":"matroska,webm"},"streams":[{"codec_type":"video","codec_name":"h264","width":640,"height":360,"r_frame_rate":"30/1"},{"codec_type":"audio","codec_name":"aac"}]}"#;
        self.write_script(
            "ffprobe",
            &format!(
                "case \"$*\" in\n  *format=duration*) echo '{}' ;;\n  *) echo '{}' ;;\nesac",
                duration, json
            ),
        )
    }

    /// ffmpeg that logs its arguments, reports half-way progress and writes the output.
    #[cfg(unix)]
    pub fn ffmpeg_ok(&self) -> PathBuf {
        let args_log = self.path("args.txt");
        self.write_script(
            "ffmpeg",
            &format!(
                "printf '%s\\n' \"$@\" > '{}'\nfor last; do :; done\nprintf 'frame=1 time=00:00:05.00 bitrate=1\\n' >&2\n[ \"$last\" = - ] || printf 'data' > \"$last\"\nexit 0",
                args_log.display()
            ),
        )
    }

    #[cfg(unix)]
    pub fn ffmpeg_failing(&self, stderr: &str, code: i32) -> PathBuf {
        self.write_script("ffmpeg", &format!("echo '{}' >&2\nexit {}", stderr, code))
    }

    #[cfg(unix)]
    pub fn ffmpeg_hanging(&self) -> PathBuf {
        self.write_script("ffmpeg", "exec sleep 30")
    }

    pub fn tools(&self) -> MediaTools {
        MediaTools::new(self.path("ffmpeg"), self.path("ffprobe"))
    }

    pub fn logged_args(&self) -> Vec<String> {
        fs::read_to_string(self.path("args.txt"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}
