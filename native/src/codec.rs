//! Stream-copy compatibility between source codecs and target containers.
//!
//! Two independent tables: video codec -> containers, audio codec -> containers.
//! A codec missing from its table is never copied.

use serde::Serialize;

use crate::ffmpeg::OutputFormat;

struct CopyRow {
    codec: &'static str,
    containers: &'static [&'static str],
}

macro_rules! copy_table {
    ($name:ident: $( [$codec:expr, $containers:expr] ),* $(,)?) => {
        const $name: &[CopyRow] = &[
            $( CopyRow { codec: $codec, containers: $containers } ),*
        ];
    };
}

copy_table!(VIDEO_COPY_TABLE:
    ["h264", &["mp4", "mkv", "mov", "avi", "flv", "ts"]],
    ["hevc", &["mp4", "mkv", "mov", "ts"]],
    ["vp9", &["webm", "mkv"]],
    ["vp8", &["webm", "mkv"]],
    ["mpeg4", &["mp4", "mkv", "avi"]],
);

copy_table!(AUDIO_COPY_TABLE:
    ["aac", &["mp4", "mkv", "mov", "flv", "ts"]],
    ["mp3", &["mp4", "mkv", "mov", "avi", "ts"]],
    ["ac3", &["mp4", "mkv", "mov", "avi", "ts"]],
    ["eac3", &["mp4", "mkv", "mov", "ts"]],
    ["opus", &["webm", "mkv", "ogg"]],
    ["vorbis", &["webm", "mkv", "ogg"]],
    ["flac", &["mkv", "ogg"]],
    ["pcm_s16le", &["wav", "avi", "mkv"]],
    ["pcm_s24le", &["wav", "avi", "mkv"]],
);

/// Codec name reported when the source could not be probed.
pub const UNKNOWN_CODEC: &str = "unknown";

/// Which streams can be passed through unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamCopy {
    pub video: bool,
    pub audio: bool,
}

impl StreamCopy {
    pub const NONE: StreamCopy = StreamCopy {
        video: false,
        audio: false,
    };

    pub fn any(self) -> bool {
        self.video || self.audio
    }
}

fn table_allows(table: &[CopyRow], codec: &str, container: &str) -> bool {
    let codec = codec.trim().to_ascii_lowercase();
    table
        .iter()
        .find(|row| row.codec == codec)
        .is_some_and(|row| row.containers.contains(&container))
}

/// Per-stream copy eligibility. Pure: depends only on the two tables.
pub fn can_stream_copy(video_codec: &str, audio_codec: &str, target: &str) -> StreamCopy {
    let target = target.trim().to_ascii_lowercase();
    StreamCopy {
        video: table_allows(VIDEO_COPY_TABLE, video_codec, &target),
        audio: table_allows(AUDIO_COPY_TABLE, audio_codec, &target),
    }
}

/// Copy decision for a conversion target. The video side is dropped for
/// audio-only targets and gif, which always re-encode frames.
pub fn stream_copy_for(video_codec: &str, audio_codec: &str, format: OutputFormat) -> StreamCopy {
    let mut copy = can_stream_copy(video_codec, audio_codec, format.as_str());
    if format.is_audio_only() || format == OutputFormat::Gif {
        copy.video = false;
    }
    if format == OutputFormat::Gif {
        copy.audio = false;
    }
    copy
}
