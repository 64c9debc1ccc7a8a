//! FFprobe-based metadata extraction: full stream/format info for display,
//! duration for progress, first stream codecs for the stream-copy decision.

use std::path::Path;
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;

use super::{MediaTools, path_to_string};
use crate::codec::UNKNOWN_CODEC;
use crate::error::AppError;

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    size: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
    #[serde(default)]
    format_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    streams: Option<Vec<FfprobeStream>>,
}

impl FfprobeOutput {
    fn first_stream(&self, kind: &str) -> Option<&FfprobeStream> {
        self.streams
            .as_ref()
            .and_then(|streams| streams.iter().find(|s| s.codec_type.as_deref() == Some(kind)))
    }
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    let (num, den) = s.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if den == 0.0 {
        return None;
    }
    Some(num / den)
}

fn parse_bit_rate(s: &str) -> Option<u64> {
    s.trim().parse().ok()
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub codec: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    /// Bits per second: video stream first, container second.
    pub bitrate: u64,
    pub fps: f64,
    pub format: String,
    pub size: u64,
}

/// First video and audio codec of a source. `"unknown"` when not found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCodecs {
    pub video: String,
    pub audio: String,
}

impl SourceCodecs {
    pub fn unknown() -> Self {
        Self {
            video: UNKNOWN_CODEC.to_string(),
            audio: UNKNOWN_CODEC.to_string(),
        }
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

/// Parse ffprobe JSON output into VideoMetadata.
///
/// `path` supplies the extension fallback for `format`. `file_size` (from a
/// filesystem stat) wins over the container's reported size.
pub fn parse_ffprobe_json(
    json: &str,
    path: &Path,
    file_size: Option<u64>,
) -> Result<VideoMetadata, AppError> {
    let output: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| AppError::probe(format!("Failed to parse ffprobe JSON: {}", e)))?;

    let format = output.format.as_ref();
    let duration = format
        .and_then(|f| f.duration.as_ref())
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);
    let container_size = format
        .and_then(|f| f.size.as_ref())
        .and_then(|s| s.parse::<u64>().ok());

    let video = output.first_stream("video");
    let audio = output.first_stream("audio");
    let width = video.and_then(|s| s.width).unwrap_or(0);
    let height = video.and_then(|s| s.height).unwrap_or(0);
    let fps = video
        .and_then(|s| s.r_frame_rate.as_deref())
        .and_then(parse_frame_rate)
        .map(|fps| (fps * 100.0).round() / 100.0)
        .unwrap_or(0.0);
    let codec = video
        .and_then(|s| s.codec_name.clone())
        .unwrap_or_else(|| UNKNOWN_CODEC.to_string());
    let bitrate = video
        .and_then(|s| s.bit_rate.as_deref())
        .and_then(parse_bit_rate)
        .or_else(|| format.and_then(|f| f.bit_rate.as_deref()).and_then(parse_bit_rate))
        .unwrap_or(0);
    let container = format
        .and_then(|f| f.format_name.as_deref())
        .and_then(|names| names.split(',').next())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| extension_of(path));

    Ok(VideoMetadata {
        duration,
        width,
        height,
        codec,
        audio_codec: audio.and_then(|s| s.codec_name.clone()),
        bitrate,
        fps,
        format: container,
        size: file_size.or(container_size).unwrap_or(0),
    })
}

async fn run_ffprobe(tools: &MediaTools, args: &[&str], path: &Path) -> Result<String, AppError> {
    let mut cmd = Command::new(&tools.ffprobe);
    cmd.args(args)
        .arg(path_to_string(path))
        .stdin(Stdio::null())
        .kill_on_drop(true);
    #[cfg(windows)]
    cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
    let output = cmd
        .output()
        .await
        .map_err(|e| AppError::probe(format!("Failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::probe(format!("ffprobe failed: {}", stderr.trim())));
    }

    String::from_utf8(output.stdout)
        .map_err(|_| AppError::probe("ffprobe output was not valid UTF-8"))
}

const JSON_ARGS: &[&str] = &[
    "-v",
    "error",
    "-print_format",
    "json",
    "-show_format",
    "-show_streams",
];

/// Run ffprobe on a media file and return metadata.
pub async fn probe_video_metadata(tools: &MediaTools, path: &Path) -> Result<VideoMetadata, AppError> {
    log::debug!(
        target: "mediaforge::ffmpeg::ffprobe",
        "probe_video_metadata: path={}",
        path.display()
    );
    let json = run_ffprobe(tools, JSON_ARGS, path).await?;
    let file_size = tokio::fs::metadata(path).await.ok().map(|m| m.len());
    parse_ffprobe_json(&json, path, file_size)
}

/// Container duration in seconds.
pub async fn probe_duration(tools: &MediaTools, path: &Path) -> Result<f64, AppError> {
    let out = run_ffprobe(
        tools,
        &[
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ],
        path,
    )
    .await?;
    out.trim()
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d > 0.0)
        .ok_or_else(|| AppError::probe(format!("No duration for {}", path.display())))
}

/// First video/audio codec names. Never fails: unreadable sources report `"unknown"`.
pub async fn probe_stream_codecs(tools: &MediaTools, path: &Path) -> SourceCodecs {
    let json = match run_ffprobe(tools, JSON_ARGS, path).await {
        Ok(json) => json,
        Err(e) => {
            log::debug!(
                target: "mediaforge::ffmpeg::ffprobe",
                "Codec probe failed for {}: {}",
                path.display(),
                e
            );
            return SourceCodecs::unknown();
        }
    };
    parse_stream_codecs(&json)
}

fn parse_stream_codecs(json: &str) -> SourceCodecs {
    let Ok(output) = serde_json::from_str::<FfprobeOutput>(json) else {
        return SourceCodecs::unknown();
    };
    let codec_of = |kind: &str| {
        output
            .first_stream(kind)
            .and_then(|s| s.codec_name.clone())
            .unwrap_or_else(|| UNKNOWN_CODEC.to_string())
    };
    SourceCodecs {
        video: codec_of("video"),
        audio: codec_of("audio"),
    }
}
