// crates/ionia-media/src/config.rs
//
// Job description handed to the Recorder. Everything is validated once at
// initialise; a bad configuration never builds a partial pipeline.

use serde::{Deserialize, Serialize};

/// Which audio sources to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    Mic,
    Desktop,
    Both,
}

impl CaptureMode {
    pub fn wants_desktop(&self) -> bool {
        matches!(self, CaptureMode::Desktop | CaptureMode::Both)
    }

    pub fn wants_mic(&self) -> bool {
        matches!(self, CaptureMode::Mic | CaptureMode::Both)
    }
}

/// Where the encoded output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputKind {
    /// Local MP4 file (one H.264 track, one AAC track, faststart).
    Mp4,
    /// FLV over RTMP to a live ingest URL.
    Rtmp,
    /// Audio only: raw AAC with a 7-byte ADTS header per packet.
    RawAac,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoOptions {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Target bitrate in bits/s.
    pub bitrate: usize,
    /// Prefer the NVENC hardware encoder when present.
    pub use_nvenc: bool,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self { width: 1920, height: 1080, fps: 30, bitrate: 5_000_000, use_nvenc: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioOptions {
    /// AAC bitrate in bits/s.
    pub bitrate: usize,
    /// Linear gain applied to the microphone before mixing.
    pub mic_gain: f32,
}

impl Default for AudioOptions {
    fn default() -> Self {
        Self { bitrate: 192_000, mic_gain: ionia_core::engine::DEFAULT_MIC_GAIN }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    pub mode: CaptureMode,
    pub output: OutputKind,
    /// File path for Mp4/RawAac, `rtmp://…` URL for Rtmp.
    pub target: String,
    pub video: VideoOptions,
    pub audio: AudioOptions,
    /// Stream buffer admission limits (Rtmp only).
    pub stream_max_packets: usize,
    pub stream_max_latency_ms: i64,
}

impl RecorderConfig {
    pub fn new(mode: CaptureMode, output: OutputKind, target: impl Into<String>) -> Self {
        Self {
            mode,
            output,
            target: target.into(),
            video: VideoOptions::default(),
            audio: AudioOptions::default(),
            stream_max_packets: 256,
            stream_max_latency_ms: 3_000,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.target.is_empty() {
            return Err("output target is empty".into());
        }
        if self.output == OutputKind::Rtmp && !self.target.starts_with("rtmp://") {
            return Err(format!("'{}' is not an rtmp:// URL", self.target));
        }
        if self.output != OutputKind::RawAac {
            if self.video.fps == 0 || self.video.fps > 240 {
                return Err(format!("unreasonable fps {}", self.video.fps));
            }
            if self.video.width == 0 || self.video.height == 0 {
                return Err("video dimensions must be non-zero".into());
            }
            // 4:2:0 subsampling needs even dimensions.
            if self.video.width % 2 != 0 || self.video.height % 2 != 0 {
                return Err(format!(
                    "video dimensions {}x{} must be even for yuv420p",
                    self.video.width, self.video.height
                ));
            }
        }
        if self.audio.mic_gain < 0.0 || !self.audio.mic_gain.is_finite() {
            return Err(format!("invalid mic gain {}", self.audio.mic_gain));
        }
        if self.stream_max_packets == 0 {
            return Err("stream buffer size must be non-zero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let cfg = RecorderConfig::new(CaptureMode::Both, OutputKind::Mp4, "out.mp4");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rtmp_requires_rtmp_url() {
        let cfg = RecorderConfig::new(CaptureMode::Both, OutputKind::Rtmp, "http://x");
        assert!(cfg.validate().is_err());
        let cfg = RecorderConfig::new(CaptureMode::Both, OutputKind::Rtmp, "rtmp://a/live/key");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn odd_dimensions_are_rejected() {
        let mut cfg = RecorderConfig::new(CaptureMode::Desktop, OutputKind::Mp4, "out.mp4");
        cfg.video.width = 1919;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn raw_aac_ignores_video_options() {
        let mut cfg = RecorderConfig::new(CaptureMode::Mic, OutputKind::RawAac, "out.aac");
        cfg.video.fps = 0; // irrelevant for audio-only output
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn mode_flags() {
        assert!(CaptureMode::Both.wants_desktop() && CaptureMode::Both.wants_mic());
        assert!(!CaptureMode::Mic.wants_desktop());
        assert!(!CaptureMode::Desktop.wants_mic());
    }
}
