// crates/ionia-core/src/lib.rs

pub mod adts;
pub mod avc;
pub mod engine;
pub mod media_types;
pub mod normalize;
pub mod ring;
pub mod stream_buffer;
pub mod video_clock;

pub use engine::AudioEngine;
pub use media_types::{
    AudioFormat, AudioPacket, EncodedAudioPacket, EncodedVideoPacket, PipelineStats,
    SampleEncoding, UnifiedFrame,
};
pub use ring::{FrameRing, SampleRing};
pub use stream_buffer::{QueuedPacket, StreamBuffer};
pub use video_clock::VideoClock;
