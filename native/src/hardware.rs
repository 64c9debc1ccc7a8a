//! GPU encoder/decoder detection.
//!
//! Candidates are tried in priority order by running a one-frame encode of a
//! synthetic source. The first encoder that works wins; its paired decoder and
//! HEVC encoder are then probed. The result is computed once per process.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::ffmpeg::MediaTools;

/// Decoder id meaning "no hardware decode".
pub const NO_HW_DECODER: &str = "none";
pub const SOFTWARE_NAME: &str = "Software Encoding";
/// Generic Windows decoder probed when no GPU encoder works.
const WINDOWS_FALLBACK_DECODER: &str = "d3d11va";
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const SYNTHETIC_SOURCE: &str = "nullsrc=s=256x256:d=0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuAccelKind {
    None,
    Nvenc,
    Qsv,
    Amf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareCapability {
    pub gpu_accel: GpuAccelKind,
    pub gpu_name: String,
    pub cpu_threads: usize,
    pub hw_decoder: String,
    pub hevc_support: bool,
}

impl HardwareCapability {
    /// All-software record. Software encoders always support HEVC.
    pub fn software(cpu_threads: usize) -> Self {
        Self {
            gpu_accel: GpuAccelKind::None,
            gpu_name: SOFTWARE_NAME.to_string(),
            cpu_threads: cpu_threads.max(1),
            hw_decoder: NO_HW_DECODER.to_string(),
            hevc_support: true,
        }
    }
}

struct GpuCandidate {
    encoder: &'static str,
    hevc_encoder: &'static str,
    kind: GpuAccelKind,
    name: &'static str,
    decoder: &'static str,
}

const CANDIDATES: [GpuCandidate; 3] = [
    GpuCandidate {
        encoder: "h264_nvenc",
        hevc_encoder: "hevc_nvenc",
        kind: GpuAccelKind::Nvenc,
        name: "NVIDIA NVENC",
        decoder: "cuda",
    },
    GpuCandidate {
        encoder: "h264_qsv",
        hevc_encoder: "hevc_qsv",
        kind: GpuAccelKind::Qsv,
        name: "Intel Quick Sync",
        decoder: "qsv",
    },
    GpuCandidate {
        encoder: "h264_amf",
        hevc_encoder: "hevc_amf",
        kind: GpuAccelKind::Amf,
        name: "AMD AMF",
        decoder: "d3d11va",
    },
];

/// Test encodes against the local machine. Failures of any kind mean "unavailable".
pub trait EncoderProbe {
    fn encoder_works(&self, encoder: &str) -> impl Future<Output = bool> + Send;
    fn decoder_works(&self, decoder: &str) -> impl Future<Output = bool> + Send;
}

/// Probes by running FFmpeg against `nullsrc`, bounded by a 10 s timeout.
pub struct FfmpegEncoderProbe {
    ffmpeg: PathBuf,
}

impl FfmpegEncoderProbe {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    async fn succeeds(&self, args: &[&str]) -> bool {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-loglevel", "error"])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::debug!(
                    target: "mediaforge::hardware",
                    "Probe spawn failed: {}",
                    e
                );
                return false;
            }
        };
        match tokio::time::timeout(PROBE_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(_)) => false,
            Err(_) => {
                log::debug!(
                    target: "mediaforge::hardware",
                    "Probe timed out: {:?}",
                    args
                );
                let _ = child.start_kill();
                false
            }
        }
    }
}

impl EncoderProbe for FfmpegEncoderProbe {
    async fn encoder_works(&self, encoder: &str) -> bool {
        self.succeeds(&[
            "-f", "lavfi", "-i", SYNTHETIC_SOURCE, "-c:v", encoder, "-frames:v", "1", "-f", "null", "-",
        ])
        .await
    }

    async fn decoder_works(&self, decoder: &str) -> bool {
        self.succeeds(&[
            "-hwaccel", decoder, "-f", "lavfi", "-i", SYNTHETIC_SOURCE, "-frames:v", "1", "-f", "null", "-",
        ])
        .await
    }
}

/// Logical CPU count, at least 1.
pub fn cpu_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Capability detection over any probe. Stops at the first working encoder.
pub async fn detect_capability(
    probe: &impl EncoderProbe,
    cpu_threads: usize,
    windows: bool,
) -> HardwareCapability {
    for candidate in &CANDIDATES {
        if !probe.encoder_works(candidate.encoder).await {
            log::debug!(
                target: "mediaforge::hardware",
                "{} unavailable",
                candidate.encoder
            );
            continue;
        }
        let decoder_ok = probe.decoder_works(candidate.decoder).await;
        let hevc_ok = probe.encoder_works(candidate.hevc_encoder).await;
        return HardwareCapability {
            gpu_accel: candidate.kind,
            gpu_name: candidate.name.to_string(),
            cpu_threads: cpu_threads.max(1),
            hw_decoder: if decoder_ok {
                candidate.decoder.to_string()
            } else {
                NO_HW_DECODER.to_string()
            },
            hevc_support: hevc_ok,
        };
    }

    let mut capability = HardwareCapability::software(cpu_threads);
    if windows && probe.decoder_works(WINDOWS_FALLBACK_DECODER).await {
        capability.hw_decoder = WINDOWS_FALLBACK_DECODER.to_string();
    }
    capability
}

static CAPABILITIES: OnceCell<HardwareCapability> = OnceCell::const_new();

/// Process-wide capabilities, probed on first call.
pub async fn get_capabilities(tools: &MediaTools) -> HardwareCapability {
    CAPABILITIES
        .get_or_init(|| async {
            let probe = FfmpegEncoderProbe::new(&tools.ffmpeg);
            let capability = detect_capability(&probe, cpu_threads(), cfg!(windows)).await;
            log::info!(
                target: "mediaforge::hardware",
                "Hardware capability: {} (decoder={}, hevc={}, threads={})",
                capability.gpu_name,
                capability.hw_decoder,
                capability.hevc_support,
                capability.cpu_threads
            );
            capability
        })
        .await
        .clone()
}
