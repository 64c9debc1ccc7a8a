//! Map FFmpeg exit codes and stderr to user-friendly messages.
//!
//! Exit codes are from ffmpeg.c: 1 (general), 69 (rate exceeded),
//! 123 (hard exit), 255 (signal). -1 is used for spawn failure.
//! Stderr is kept as detail for debugging.

use serde::Serialize;

/// Payload for error responses and events. Frontend shows summary; detail is expandable.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FfmpegErrorPayload {
    pub summary: String,
    pub detail: String,
}

/// Stderr fragments that explain a failure better than the bare exit code.
const STDERR_HINTS: &[(&str, &str)] = &[
    ("Unknown encoder", "Encoder is not available in this FFmpeg build."),
    ("No such file or directory", "Input file not found."),
    ("Permission denied", "Permission denied writing output."),
    ("Invalid data found when processing input", "Input is not a recognized media file."),
    ("does not contain any stream", "Input contains no usable streams."),
    ("No space left on device", "Disk is full."),
];

const ELLIPSIS: &str = "…";

/// Builds a short summary from exit code and stderr. Stderr is passed through as detail.
pub fn parse_ffmpeg_error(stderr: &str, exit_code: Option<i32>) -> FfmpegErrorPayload {
    let summary = match exit_code {
        Some(code) => match known_exit_code_summary(code) {
            Some(msg) => msg,
            None => stderr_hint(stderr)
                .map(str::to_string)
                .unwrap_or_else(|| format!("FFmpeg failed (exit code {}).", code)),
        },
        None => stderr_hint(stderr)
            .map(str::to_string)
            .unwrap_or_else(|| first_line_truncated(stderr, 120)),
    };
    let detail = stderr.trim().to_string();
    FfmpegErrorPayload { summary, detail }
}

fn known_exit_code_summary(code: i32) -> Option<String> {
    match code {
        -1 => Some("FFmpeg not found or failed to start.".into()),
        1 => Some("FFmpeg failed.".into()),
        69 => Some("Encoding rate limit exceeded.".into()),
        123 | 255 => Some("Encoding was stopped.".into()),
        _ => None,
    }
}

fn stderr_hint(stderr: &str) -> Option<&'static str> {
    STDERR_HINTS
        .iter()
        .find(|(needle, _)| stderr.contains(needle))
        .map(|(_, hint)| *hint)
}

/// First non-empty line of stderr, truncated to max_len bytes on a char boundary.
fn first_line_truncated(stderr: &str, max_len: usize) -> String {
    let first = stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    if first.len() <= max_len {
        return first.to_string();
    }
    let mut cut = max_len.saturating_sub(ELLIPSIS.len());
    while !first.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &first[..cut], ELLIPSIS)
}
