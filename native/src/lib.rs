pub mod batch;
pub mod codec;
pub mod convert;
pub mod error;
pub mod ffmpeg;
pub mod hardware;
pub mod sidecar_api;
