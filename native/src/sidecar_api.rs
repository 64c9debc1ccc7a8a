//! Operations behind the sidecar's JSON-lines methods. The binary owns the
//! wire protocol and job bookkeeping; everything here is plain async Rust.

use std::path::PathBuf;
use std::sync::Arc;

use crate::batch::{BatchHandle, BatchHooks, BatchOrchestrator};
use crate::codec::StreamCopy;
use crate::convert::{FfmpegConverter, convert_video, local_now, resolve_output_path, threads_per_conversion};
use crate::error::AppError;
use crate::ffmpeg::ffprobe::{VideoMetadata, probe_video_metadata};
use crate::ffmpeg::{
    ConversionPolicy, FfmpegProgressPayload, KillSwitch, MediaTools, OutputFormat,
    build_conversion_args, format_args_for_display_multiline, path_to_string,
};
use crate::hardware::{HardwareCapability, cpu_threads, get_capabilities};

pub type SidecarProgressEmitter = Arc<dyn Fn(FfmpegProgressPayload) + Send + Sync>;

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadataResult {
    #[serde(flatten)]
    pub metadata: VideoMetadata,
    pub size_mb: f64,
}

impl From<VideoMetadata> for VideoMetadataResult {
    fn from(metadata: VideoMetadata) -> Self {
        let size_mb = metadata.size as f64 / 1024.0 / 1024.0;
        Self { metadata, size_mb }
    }
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertResult {
    pub success: bool,
    pub output_path: String,
}

/// Probed capabilities, or an all-software record when FFmpeg cannot be found.
pub async fn hardware_info() -> HardwareCapability {
    match MediaTools::resolve() {
        Ok(tools) => get_capabilities(tools).await,
        Err(e) => {
            log::warn!(
                target: "mediaforge::sidecar",
                "Hardware probe skipped, FFmpeg unavailable: {}",
                e
            );
            HardwareCapability::software(cpu_threads())
        }
    }
}

/// Metadata for display. Probe failure is returned to the caller.
pub async fn get_video_metadata(path: PathBuf) -> Result<VideoMetadataResult, AppError> {
    let tools = MediaTools::resolve()?;
    let meta = probe_video_metadata(tools, &path).await?;
    Ok(meta.into())
}

/// Multi-line FFmpeg command a batch would run for `input_path` (or a placeholder).
/// Stream copy is decided per file at run time, so the preview always re-encodes.
pub fn preview_conversion_command(
    policy: &ConversionPolicy,
    input_path: Option<String>,
    capability: &HardwareCapability,
) -> String {
    let input = PathBuf::from(input_path.as_deref().unwrap_or("<input>"));
    let output = if input_path.is_some() {
        resolve_output_path(
            &input,
            policy.format,
            policy.output_dir.as_deref(),
            policy.effective_filename_template(),
            local_now(),
        )
    } else {
        PathBuf::from(format!("<output>.{}", policy.format))
    };
    let threads = threads_per_conversion(capability.cpu_threads, policy.effective_parallelism());
    let args = build_conversion_args(&input, &output, policy, capability, threads, StreamCopy::NONE);
    format!("ffmpeg\n{}", format_args_for_display_multiline(&args))
}

/// Single-file conversion beside the source.
pub async fn convert_file(
    input_path: PathBuf,
    format: OutputFormat,
    on_progress: SidecarProgressEmitter,
    kill: KillSwitch,
) -> Result<ConvertResult, AppError> {
    let tools = MediaTools::resolve()?;
    let progress: Arc<dyn Fn(u8) + Send + Sync> =
        Arc::new(move |progress: u8| on_progress(FfmpegProgressPayload { progress }));
    let output = convert_video(tools, &input_path, format, progress, kill).await?;
    Ok(ConvertResult {
        success: true,
        output_path: path_to_string(&output),
    })
}

/// Start a batch on the FFmpeg converter. Must be called inside a tokio runtime.
pub fn start_batch(
    files: Vec<PathBuf>,
    policy: ConversionPolicy,
    hooks: BatchHooks,
) -> Result<BatchHandle, AppError> {
    if files.is_empty() {
        return Err(AppError::InvalidRequest("No files to convert".to_string()));
    }
    let tools = MediaTools::resolve()?;
    let converter = Arc::new(FfmpegConverter::new(tools.clone()));
    Ok(BatchOrchestrator::new(converter, hooks).start(files, policy))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_uses_placeholders_without_input() {
        let policy = ConversionPolicy::new(OutputFormat::Webm);
        let text = preview_conversion_command(&policy, None, &HardwareCapability::software(4));
        assert!(text.starts_with("ffmpeg\n  -hide_banner\n  -nostdin\n  -i <input>"));
        assert!(text.contains("  -c:v libvpx-vp9"));
        assert!(text.ends_with("  -y <output>.webm"));
    }

    #[test]
    fn preview_resolves_output_from_input() {
        let mut policy = ConversionPolicy::new(OutputFormat::Mp4);
        policy.parallelism = Some(2);
        let text = preview_conversion_command(
            &policy,
            Some("/videos/clip.mkv".to_string()),
            &HardwareCapability::software(8),
        );
        assert!(text.contains("  -i /videos/clip.mkv"));
        assert!(text.contains("  -threads 4"));
        assert!(text.ends_with("  -y /videos/clip.mp4"));
    }

    #[tokio::test]
    async fn empty_batch_rejected() {
        let err = start_batch(vec![], ConversionPolicy::new(OutputFormat::Mp4), BatchHooks::default())
            .err()
            .unwrap();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[test]
    fn metadata_result_flattens() {
        let meta = VideoMetadata {
            duration: 1.0,
            width: 2,
            height: 3,
            codec: "h264".into(),
            audio_codec: None,
            bitrate: 4,
            fps: 25.0,
            format: "mp4".into(),
            size: 2 * 1024 * 1024,
        };
        let json = serde_json::to_value(VideoMetadataResult::from(meta)).unwrap();
        assert_eq!(json["codec"], "h264");
        assert_eq!(json["sizeMb"], 2.0);
    }
}
