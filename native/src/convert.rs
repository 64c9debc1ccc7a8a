//! Single-file conversion: destination naming, stream-copy decision, the FFmpeg
//! run itself and a normalized outcome.

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use time::macros::format_description;

use crate::codec::{StreamCopy, stream_copy_for};
use crate::error::AppError;
use crate::ffmpeg::ffprobe::{probe_duration, probe_stream_codecs};
use crate::ffmpeg::{
    ConversionPolicy, KillSwitch, MediaTools, OutputFormat, QualityMode, build_conversion_args,
    run_ffmpeg,
};
use crate::hardware::{HardwareCapability, cpu_threads, get_capabilities};

const COLLISION_SUFFIX: &str = "_converted";

/// Result of converting one file. Cancellation is not a failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "status")]
pub enum ConvertOutcome {
    Completed {
        output_path: PathBuf,
        output_size_bytes: u64,
        used_stream_copy: bool,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

/// Per-item inputs handed to a converter by the orchestrator.
pub struct ItemContext {
    pub file_index: usize,
    /// FFmpeg `-threads` for this item.
    pub threads: usize,
    pub kill: KillSwitch,
    /// Percent in [0, 99], non-decreasing.
    pub on_progress: Arc<dyn Fn(u8) + Send + Sync>,
}

/// Converts one source file. The orchestrator only talks to this trait.
pub trait ItemConverter: Send + Sync + 'static {
    fn capabilities(&self) -> impl Future<Output = HardwareCapability> + Send;

    fn convert(
        &self,
        source: &Path,
        policy: &ConversionPolicy,
        capability: &HardwareCapability,
        ctx: ItemContext,
    ) -> impl Future<Output = ConvertOutcome> + Send;
}

/// Local wall-clock time, UTC when the offset cannot be determined.
pub fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Expand `{name}`, `{date}` (YYYY-MM-DD), `{time}` (HH-MM-SS) and `{format}`.
pub fn apply_filename_template(
    template: &str,
    name: &str,
    format: OutputFormat,
    now: OffsetDateTime,
) -> String {
    let date = now
        .format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_default();
    let clock = now
        .format(format_description!("[hour]-[minute]-[second]"))
        .unwrap_or_default();
    template
        .replace("{name}", name)
        .replace("{date}", &date)
        .replace("{time}", &clock)
        .replace("{format}", format.as_str())
}

/// Destination for `source`. Never equal to `source`: a clash falls back to
/// `{name}_converted.{ext}` in the same directory.
pub fn resolve_output_path(
    source: &Path,
    format: OutputFormat,
    output_dir: Option<&Path>,
    template: Option<&str>,
    now: OffsetDateTime,
) -> PathBuf {
    let name = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let dir = output_dir
        .map(Path::to_path_buf)
        .or_else(|| source.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    let base = template
        .map(|t| apply_filename_template(t, &name, format, now))
        .filter(|b| !b.trim().is_empty())
        .unwrap_or_else(|| name.clone());

    let candidate = dir.join(format!("{}.{}", base, format));
    if same_file(&candidate, source) {
        return dir.join(format!("{}{}.{}", name, COLLISION_SUFFIX, format));
    }
    candidate
}

/// Absolute form of `path` with `.` and `..` folded away. Does not touch the filesystem.
fn normalized(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn same_file(a: &Path, b: &Path) -> bool {
    if normalized(a) == normalized(b) {
        return true;
    }
    // Symlinked directories only resolve when both paths exist.
    matches!(
        (std::fs::canonicalize(a), std::fs::canonicalize(b)),
        (Ok(x), Ok(y)) if x == y
    )
}

/// FFmpeg threads for one of `parallelism` concurrent conversions.
pub fn threads_per_conversion(cpu_threads: usize, parallelism: usize) -> usize {
    (cpu_threads / parallelism.max(1)).max(1)
}

/// The FFmpeg-backed converter.
#[derive(Debug, Clone)]
pub struct FfmpegConverter {
    tools: MediaTools,
}

impl FfmpegConverter {
    pub fn new(tools: MediaTools) -> Self {
        Self { tools }
    }

    pub fn tools(&self) -> &MediaTools {
        &self.tools
    }

    /// Decide per-stream copy. Probe failures read as "unknown" and re-encode.
    async fn stream_copy(&self, source: &Path, policy: &ConversionPolicy) -> StreamCopy {
        if !policy.effective_stream_copy() {
            return StreamCopy::NONE;
        }
        let codecs = probe_stream_codecs(&self.tools, source).await;
        let copy = stream_copy_for(&codecs.video, &codecs.audio, policy.format);
        log::debug!(
            target: "mediaforge::convert",
            "Stream copy for {}: video={} ({}), audio={} ({})",
            source.display(),
            copy.video,
            codecs.video,
            copy.audio,
            codecs.audio
        );
        copy
    }

    /// Run one conversion, returning the output path or the error.
    pub async fn convert_one(
        &self,
        source: &Path,
        policy: &ConversionPolicy,
        capability: &HardwareCapability,
        mut ctx: ItemContext,
    ) -> Result<(PathBuf, u64, bool), AppError> {
        if ctx.kill.try_recv().is_ok() {
            return Err(AppError::aborted());
        }
        let output = resolve_output_path(
            source,
            policy.format,
            policy.output_dir.as_deref(),
            policy.effective_filename_template(),
            local_now(),
        );
        if let Some(dir) = output.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        let duration = match probe_duration(&self.tools, source).await {
            Ok(d) => Some(d),
            Err(e) => {
                log::debug!(
                    target: "mediaforge::convert",
                    "Duration unknown for {}, progress from stderr only: {}",
                    source.display(),
                    e
                );
                None
            }
        };
        let copy = self.stream_copy(source, policy).await;
        let args = build_conversion_args(source, &output, policy, capability, ctx.threads, copy);

        log::info!(
            target: "mediaforge::convert",
            "Converting file {}: {} -> {}",
            ctx.file_index,
            source.display(),
            output.display()
        );
        run_ffmpeg(
            &self.tools.ffmpeg,
            &args,
            duration,
            Some(ctx.on_progress),
            ctx.kill,
        )
        .await?;

        let size = tokio::fs::metadata(&output).await.map(|m| m.len()).unwrap_or(0);
        Ok((output, size, copy.any()))
    }
}

impl ItemConverter for FfmpegConverter {
    async fn capabilities(&self) -> HardwareCapability {
        get_capabilities(&self.tools).await
    }

    async fn convert(
        &self,
        source: &Path,
        policy: &ConversionPolicy,
        capability: &HardwareCapability,
        ctx: ItemContext,
    ) -> ConvertOutcome {
        match self.convert_one(source, policy, capability, ctx).await {
            Ok((output_path, output_size_bytes, used_stream_copy)) => ConvertOutcome::Completed {
                output_path,
                output_size_bytes,
                used_stream_copy,
            },
            Err(e) if e.is_aborted() => ConvertOutcome::Cancelled,
            Err(e) => ConvertOutcome::Failed {
                error: e.batch_message(),
            },
        }
    }
}

/// Convert one file into `{name}_converted.{format}` next to it, highest quality tier.
pub async fn convert_video(
    tools: &MediaTools,
    source: &Path,
    format: OutputFormat,
    on_progress: Arc<dyn Fn(u8) + Send + Sync>,
    kill: KillSwitch,
) -> Result<PathBuf, AppError> {
    if !source.is_file() {
        return Err(AppError::InvalidRequest(format!(
            "Input file not found: {}",
            source.display()
        )));
    }
    let mut policy = ConversionPolicy::new(format);
    policy.quality_mode = Some(QualityMode::HighQuality);
    policy.filename_template = Some(format!("{{name}}{}", COLLISION_SUFFIX));

    let converter = FfmpegConverter::new(tools.clone());
    let capability = converter.capabilities().await;
    let ctx = ItemContext {
        file_index: 0,
        threads: threads_per_conversion(cpu_threads(), 1),
        kill,
        on_progress,
    };
    let (output, _, _) = converter.convert_one(source, &policy, &capability, ctx).await?;
    Ok(output)
}
