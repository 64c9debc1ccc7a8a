use std::path::Path;

use super::{ConversionPolicy, OutputFormat, QualityMode, VideoCodecChoice, path_to_string};
use crate::codec::StreamCopy;
use crate::hardware::{GpuAccelKind, HardwareCapability, NO_HW_DECODER};

const AUDIO_BITRATE: &str = "128k";
const GIF_FILTER: &str = "fps=15,scale=480:-1:flags=lanczos";

fn push_all(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

/// Encoder name for H.264/HEVC containers.
fn h26x_encoder(gpu: GpuAccelKind, hevc: bool) -> &'static str {
    match (gpu, hevc) {
        (GpuAccelKind::None, false) => "libx264",
        (GpuAccelKind::None, true) => "libx265",
        (GpuAccelKind::Nvenc, false) => "h264_nvenc",
        (GpuAccelKind::Nvenc, true) => "hevc_nvenc",
        (GpuAccelKind::Qsv, false) => "h264_qsv",
        (GpuAccelKind::Qsv, true) => "hevc_qsv",
        (GpuAccelKind::Amf, false) => "h264_amf",
        (GpuAccelKind::Amf, true) => "hevc_amf",
    }
}

/// Native preset/quality vocabulary of each encoder family.
fn h26x_tier_args(args: &mut Vec<String>, gpu: GpuAccelKind, hevc: bool, quality: QualityMode) {
    match gpu {
        GpuAccelKind::None if hevc => {
            let preset = quality.pick(["fast", "medium", "slower"]);
            let crf = quality.pick([30, 26, 22]);
            push_all(args, &["-preset", preset, "-crf"]);
            args.push(crf.to_string());
        }
        GpuAccelKind::None => {
            let preset = quality.pick(["fast", "medium", "slower"]);
            let crf = quality.pick([28, 23, 18]);
            push_all(args, &["-preset", preset, "-crf"]);
            args.push(crf.to_string());
        }
        GpuAccelKind::Nvenc => {
            let preset = quality.pick(["p1", "p4", "p7"]);
            let cq = quality.pick([30, 25, 19]);
            push_all(args, &["-preset", preset, "-cq"]);
            args.push(cq.to_string());
        }
        GpuAccelKind::Qsv => {
            let preset = quality.pick(["veryfast", "medium", "veryslow"]);
            let gq = quality.pick([28, 23, 18]);
            push_all(args, &["-preset", preset, "-global_quality"]);
            args.push(gq.to_string());
        }
        GpuAccelKind::Amf => {
            let level = quality.pick(["speed", "balanced", "quality"]);
            let qp = quality.pick([28, 23, 18]).to_string();
            push_all(args, &["-quality", level, "-rc", "cqp", "-qp_i", &qp, "-qp_p", &qp]);
        }
    }
}

/// Video stream arguments for a re-encode. Audio-only targets get `-vn`.
pub fn video_encode_args(
    format: OutputFormat,
    gpu: GpuAccelKind,
    quality: QualityMode,
    codec: VideoCodecChoice,
    hevc_supported: bool,
) -> Vec<String> {
    let mut args = Vec::new();
    match format {
        f if f.is_h26x_container() => {
            let hevc = codec == VideoCodecChoice::Hevc && hevc_supported;
            push_all(&mut args, &["-c:v", h26x_encoder(gpu, hevc)]);
            h26x_tier_args(&mut args, gpu, hevc, quality);
            if hevc && f.is_quicktime_family() {
                push_all(&mut args, &["-tag:v", "hvc1"]);
            }
        }
        OutputFormat::Webm => {
            let crf = quality.pick([36, 31, 24]).to_string();
            let cpu_used = quality.pick([4, 2, 1]).to_string();
            push_all(
                &mut args,
                &["-c:v", "libvpx-vp9", "-crf", &crf, "-b:v", "0", "-cpu-used", &cpu_used, "-row-mt", "1"],
            );
        }
        OutputFormat::Wmv => push_all(&mut args, &["-c:v", "wmv2"]),
        OutputFormat::Gif => push_all(&mut args, &["-vf", GIF_FILTER]),
        _ => push_all(&mut args, &["-vn"]),
    }
    args
}

/// Audio stream arguments for a re-encode. gif drops audio.
pub fn audio_encode_args(format: OutputFormat, quality: QualityMode) -> Vec<String> {
    let mut args = Vec::new();
    match format {
        f if f.is_h26x_container() => push_all(&mut args, &["-c:a", "aac", "-b:a", AUDIO_BITRATE]),
        OutputFormat::Webm => push_all(&mut args, &["-c:a", "libopus", "-b:a", AUDIO_BITRATE]),
        OutputFormat::Wmv => push_all(&mut args, &["-c:a", "wmav2"]),
        OutputFormat::Gif => push_all(&mut args, &["-an"]),
        OutputFormat::Mp3 => {
            let q = quality.pick([4, 2, 0]).to_string();
            push_all(&mut args, &["-c:a", "libmp3lame", "-q:a", &q]);
        }
        _ => push_all(&mut args, &["-c:a", "pcm_s16le"]),
    }
    args
}

fn container_args(format: OutputFormat) -> Vec<String> {
    if format.is_quicktime_family() {
        vec!["-movflags".to_string(), "+faststart".to_string()]
    } else {
        Vec::new()
    }
}

fn thread_args(threads: usize) -> Vec<String> {
    vec!["-threads".to_string(), threads.max(1).to_string()]
}

/// Full encode argument list: threads, then video, then audio. Pure.
pub fn build_encode_args(
    format: OutputFormat,
    gpu: GpuAccelKind,
    quality: QualityMode,
    codec: VideoCodecChoice,
    threads: usize,
    hevc_supported: bool,
) -> Vec<String> {
    let mut args = thread_args(threads);
    args.extend(video_encode_args(format, gpu, quality, codec, hevc_supported));
    args.extend(audio_encode_args(format, quality));
    args.extend(container_args(format));
    args
}

/// `-hwaccel <id>`, or nothing when no decoder is available.
pub fn hw_decoder_args(decoder: &str) -> Vec<String> {
    if decoder.is_empty() || decoder == NO_HW_DECODER {
        Vec::new()
    } else {
        vec!["-hwaccel".to_string(), decoder.to_string()]
    }
}

/// Complete FFmpeg invocation for one conversion.
///
/// Hardware decode is applied only when the video stream is re-encoded and the
/// target carries video; a copied stream is never decoded.
pub fn build_conversion_args(
    input: &Path,
    output: &Path,
    policy: &ConversionPolicy,
    capability: &HardwareCapability,
    threads: usize,
    copy: StreamCopy,
) -> Vec<String> {
    let format = policy.format;
    let quality = policy.effective_quality_mode();

    let mut args = vec!["-hide_banner".to_string(), "-nostdin".to_string()];
    if !copy.video && !format.is_audio_only() {
        args.extend(hw_decoder_args(&capability.hw_decoder));
    }
    args.extend(["-i".to_string(), path_to_string(input)]);
    args.extend(thread_args(threads));

    if copy.video {
        push_all(&mut args, &["-c:v", "copy"]);
    } else {
        args.extend(video_encode_args(
            format,
            capability.gpu_accel,
            quality,
            policy.effective_video_codec(),
            capability.hevc_support,
        ));
    }
    if copy.audio {
        push_all(&mut args, &["-c:a", "copy"]);
    } else {
        args.extend(audio_encode_args(format, quality));
    }
    args.extend(container_args(format));

    args.extend(["-y".to_string(), path_to_string(output)]);

    log::debug!(
        target: "mediaforge::ffmpeg::builder",
        "Built conversion args: format={}, gpu={:?}, copy={:?}, threads={}, input={} -> output={}",
        format,
        capability.gpu_accel,
        copy,
        threads,
        input.display(),
        output.display()
    );
    args
}

/// Formats args for readable display: option and value on the same line when the next arg is a value.
pub fn format_args_for_display_multiline(args: &[String]) -> String {
    if args.is_empty() {
        return String::new();
    }
    let mut lines = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        let line = if arg.starts_with('-') && i + 1 < args.len() && !args[i + 1].starts_with('-') {
            let value = &args[i + 1];
            i += 2;
            format!("  {} {}", arg, value)
        } else {
            i += 1;
            format!("  {}", arg)
        };
        lines.push(line);
    }
    lines.join("\n")
}
