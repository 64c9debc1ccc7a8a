mod builder;
pub mod discovery;
mod error;
pub mod ffprobe;
pub mod progress;
mod runner;

pub use builder::{
    audio_encode_args, build_conversion_args, build_encode_args, format_args_for_display_multiline,
    hw_decoder_args, video_encode_args,
};
pub use discovery::MediaTools;
pub use error::{FfmpegErrorPayload, parse_ffmpeg_error};
pub use runner::{ActiveProcesses, KillSwitch, run_ffmpeg};

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Progress payload for single-file conversion events.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FfmpegProgressPayload {
    pub progress: u8,
}

/// Target container. Audio-only targets drop the video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp4,
    Mov,
    Mkv,
    Avi,
    Flv,
    Webm,
    Wmv,
    Gif,
    Mp3,
    Wav,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 10] = [
        OutputFormat::Mp4,
        OutputFormat::Mov,
        OutputFormat::Mkv,
        OutputFormat::Avi,
        OutputFormat::Flv,
        OutputFormat::Webm,
        OutputFormat::Wmv,
        OutputFormat::Gif,
        OutputFormat::Mp3,
        OutputFormat::Wav,
    ];

    /// File extension and stream-copy table key.
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Mov => "mov",
            OutputFormat::Mkv => "mkv",
            OutputFormat::Avi => "avi",
            OutputFormat::Flv => "flv",
            OutputFormat::Webm => "webm",
            OutputFormat::Wmv => "wmv",
            OutputFormat::Gif => "gif",
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Wav => "wav",
        }
    }

    pub fn is_audio_only(self) -> bool {
        matches!(self, OutputFormat::Mp3 | OutputFormat::Wav)
    }

    /// Containers that take H.264/HEVC video with AAC audio.
    pub fn is_h26x_container(self) -> bool {
        matches!(
            self,
            OutputFormat::Mp4
                | OutputFormat::Mov
                | OutputFormat::Mkv
                | OutputFormat::Avi
                | OutputFormat::Flv
        )
    }

    /// mp4/mov want the moov atom up front and the hvc1 tag for HEVC.
    pub fn is_quicktime_family(self) -> bool {
        matches!(self, OutputFormat::Mp4 | OutputFormat::Mov)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        OutputFormat::ALL
            .into_iter()
            .find(|f| f.as_str() == lower)
            .ok_or_else(|| format!("Unsupported output format: {}", s))
    }
}

/// Speed/quality tier. Stream copy is a separate toggle, not a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QualityMode {
    Fast,
    #[default]
    Balanced,
    HighQuality,
}

impl QualityMode {
    /// Pick the value for this tier from a `[fast, balanced, highQuality]` table.
    pub fn pick<T: Copy>(self, table: [T; 3]) -> T {
        match self {
            QualityMode::Fast => table[0],
            QualityMode::Balanced => table[1],
            QualityMode::HighQuality => table[2],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodecChoice {
    #[default]
    #[serde(alias = "standard")]
    H264,
    #[serde(alias = "advanced")]
    Hevc,
}

pub const MIN_PARALLELISM: usize = 1;
pub const MAX_PARALLELISM: usize = 4;

/// Per-batch conversion settings. Optional fields fall back to `effective_*` defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionPolicy {
    pub format: OutputFormat,
    pub quality_mode: Option<QualityMode>,
    pub video_codec: Option<VideoCodecChoice>,
    pub parallelism: Option<u32>,
    pub stream_copy: Option<bool>,
    pub output_dir: Option<PathBuf>,
    pub filename_template: Option<String>,
}

impl ConversionPolicy {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            quality_mode: None,
            video_codec: None,
            parallelism: None,
            stream_copy: None,
            output_dir: None,
            filename_template: None,
        }
    }

    pub fn effective_quality_mode(&self) -> QualityMode {
        self.quality_mode.unwrap_or_default()
    }

    pub fn effective_video_codec(&self) -> VideoCodecChoice {
        self.video_codec.unwrap_or_default()
    }

    pub fn effective_parallelism(&self) -> usize {
        (self.parallelism.unwrap_or(1) as usize).clamp(MIN_PARALLELISM, MAX_PARALLELISM)
    }

    pub fn effective_stream_copy(&self) -> bool {
        self.stream_copy.unwrap_or(false)
    }

    pub fn effective_filename_template(&self) -> Option<&str> {
        self.filename_template
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// Path to string for FFmpeg args or logging.
pub fn path_to_string(path: &(impl AsRef<std::path::Path> + ?Sized)) -> String {
    path.as_ref().to_string_lossy().to_string()
}
