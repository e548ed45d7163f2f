// crates/ionia-media/src/lib.rs

pub mod apartment;
pub mod audio_encoder;
pub mod capture;
pub mod config;
pub mod file_muxer;
pub mod pipeline;
pub mod stream_muxer;
pub mod video_encoder;

#[cfg(windows)]
mod duplication;
#[cfg(windows)]
mod wasapi_capture;

pub use apartment::ApartmentMode;
pub use config::{AudioOptions, CaptureMode, OutputKind, RecorderConfig, VideoOptions};
pub use pipeline::{Recorder, RecorderState};
