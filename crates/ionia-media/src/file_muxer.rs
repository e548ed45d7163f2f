// crates/ionia-media/src/file_muxer.rs
//
// MP4 writer for local recordings, plus the raw-AAC (ADTS) sink.
//
// Authority rule: this muxer is the ONLY place timestamps are assigned.
// Upstream encoded packets arrive timestamp-free; audio PTS is a running
// sample count in 1/48000, video PTS is the caller's frame index in 1/fps.
// Both are rescaled into whatever time base the container actually gave
// the stream, queried at write time because libavformat may rewrite stream
// time bases when the header is written.
//
// Stream layout: 0 — H.264 video, 1 — AAC audio.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Result};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::Id as CodecId;
use ffmpeg::encoder;
use ffmpeg::format::output as open_output;
use ffmpeg::util::rational::Rational;
use ffmpeg::{Packet, Rescale, Rounding};

use ionia_core::adts::adts_header;
use ionia_core::media_types::{EncodedAudioPacket, EncodedVideoPacket};

use crate::audio_encoder::AacEncoder;
use crate::video_encoder::H264Encoder;

pub struct FileMuxer {
    octx: ffmpeg::format::context::Output,
    video_tb: Rational,
    audio_tb: Rational,
    /// Highest video frame index written; ties are allowed because every
    /// packet of one encoded frame shares its index.
    last_video_index: i64,
    last_video_pts: i64,
    audio_sample_count: i64,
    video_packet_count: u64,
    audio_packet_count: u64,
    total_bytes: u64,
    /// Cleared on the first container write failure; every later write
    /// refuses quietly.
    connected: bool,
    finalized: bool,
}

// The AVFormatContext is only touched behind the pipeline's sink mutex.
unsafe impl Send for FileMuxer {}

impl FileMuxer {
    pub fn new(
        path: &Path,
        video_enc: &H264Encoder,
        audio_enc: &AacEncoder,
    ) -> Result<Self> {
        let mut octx = open_output(&path)
            .map_err(|e| anyhow::anyhow!("could not open output '{}': {e}", path.display()))?;

        let fps = video_enc.fps();
        let video_tb = Rational::new(1, fps as i32);
        let audio_tb = Rational::new(1, audio_enc.sample_rate() as i32);

        let h264 = encoder::find(CodecId::H264)
            .ok_or_else(|| anyhow::anyhow!("H.264 codec missing for stream setup"))?;
        let mut ost_video = octx
            .add_stream(h264)
            .map_err(|e| anyhow::anyhow!("add video stream: {e}"))?;
        ost_video.set_time_base(video_tb);

        let aac = encoder::find(CodecId::AAC)
            .ok_or_else(|| anyhow::anyhow!("AAC codec missing for stream setup"))?;
        let mut ost_audio = octx
            .add_stream(aac)
            .map_err(|e| anyhow::anyhow!("add audio stream: {e}"))?;
        ost_audio.set_time_base(audio_tb);

        // Copy opened-encoder parameters (dimensions, formats, extradata —
        // avcC and AudioSpecificConfig) into the streams' codecpar. No safe
        // accessor exists for this in ffmpeg-the-third.
        unsafe {
            let fps_rational = ffmpeg::ffi::AVRational { num: fps as i32, den: 1 };
            let vstream = *(*octx.as_mut_ptr()).streams.add(0);
            let ret = ffmpeg::ffi::avcodec_parameters_from_context(
                (*vstream).codecpar,
                video_enc.codec_ptr() as *mut ffmpeg::ffi::AVCodecContext,
            );
            if ret < 0 {
                bail!("avcodec_parameters_from_context (video) failed: {ret}");
            }
            (*vstream).avg_frame_rate = fps_rational;
            (*vstream).r_frame_rate = fps_rational;

            let astream = *(*octx.as_mut_ptr()).streams.add(1);
            let ret = ffmpeg::ffi::avcodec_parameters_from_context(
                (*astream).codecpar,
                audio_enc.codec_ptr() as *mut ffmpeg::ffi::AVCodecContext,
            );
            if ret < 0 {
                bail!("avcodec_parameters_from_context (audio) failed: {ret}");
            }
        }

        let mut opts = ffmpeg::Dictionary::new();
        opts.set("movflags", "faststart");
        octx.write_header_with(opts)
            .map_err(|e| anyhow::anyhow!("write MP4 header: {e}"))?;

        log::info!("[mp4] initialised: {}", path.display());

        Ok(Self {
            octx,
            video_tb,
            audio_tb,
            last_video_index: -1,
            last_video_pts: -1,
            audio_sample_count: 0,
            video_packet_count: 0,
            audio_packet_count: 0,
            total_bytes: 0,
            connected: true,
            finalized: false,
        })
    }

    fn write_packet(&mut self, pkt: &Packet, what: &str) -> bool {
        match pkt.write_interleaved(&mut self.octx) {
            Ok(()) => true,
            Err(e) => {
                log::error!("[mp4] {what} write failed: {e} — refusing further writes");
                self.connected = false;
                false
            }
        }
    }

    /// Write one encoded video packet stamped from `frame_index`.
    /// Returns false when the packet was refused (timestamp regression).
    pub fn write_video(&mut self, packet: &EncodedVideoPacket, frame_index: i64) -> Result<bool> {
        if self.finalized || !self.connected || packet.payload.is_empty() {
            return Ok(false);
        }
        if frame_index < 0 || frame_index < self.last_video_index {
            log::error!(
                "[mp4] refusing video packet: frame index {frame_index} after {}",
                self.last_video_index
            );
            return Ok(false);
        }

        let mut pkt = Packet::copy(&packet.payload);
        pkt.set_stream(0);
        pkt.set_pts(Some(frame_index));
        pkt.set_dts(Some(frame_index));
        pkt.set_duration(1);
        if packet.is_keyframe {
            pkt.set_flags(ffmpeg::packet::Flags::KEY);
        }

        let ost_tb = self.octx.stream(0).unwrap().time_base();
        pkt.rescale_ts(self.video_tb, ost_tb);
        if !self.write_packet(&pkt, "video") {
            return Ok(false);
        }

        self.last_video_index = frame_index;
        self.last_video_pts = self.last_video_pts.max(frame_index);
        self.video_packet_count += 1;
        self.total_bytes += packet.payload.len() as u64;
        Ok(true)
    }

    /// Write one encoded audio packet; PTS advances by exactly the
    /// packet's sample count.
    pub fn write_audio(&mut self, packet: &EncodedAudioPacket) -> Result<bool> {
        if self.finalized || !self.connected || packet.payload.is_empty() || packet.num_samples <= 0
        {
            return Ok(false);
        }

        let mut pkt = Packet::copy(&packet.payload);
        pkt.set_stream(1);
        pkt.set_pts(Some(self.audio_sample_count));
        pkt.set_dts(Some(self.audio_sample_count));
        pkt.set_duration(packet.num_samples);

        let ost_tb = self.octx.stream(1).unwrap().time_base();
        pkt.rescale_ts(self.audio_tb, ost_tb);
        if !self.write_packet(&pkt, "audio") {
            return Ok(false);
        }

        self.audio_sample_count += packet.num_samples;
        self.audio_packet_count += 1;
        self.total_bytes += packet.payload.len() as u64;
        Ok(true)
    }

    /// Set final durations and write the container trailer.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        // libavformat may have replaced the video stream's time base at
        // header time; restate the duration in whatever base it holds now.
        if self.last_video_pts >= 0 {
            let frames = self.last_video_pts + 1;
            unsafe {
                let vstream = *(*self.octx.as_mut_ptr()).streams.add(0);
                let current_tb = (*vstream).time_base;
                let duration = frames.rescale_with(
                    self.video_tb,
                    Rational::from(current_tb),
                    Rounding::NearInfinity,
                );
                (*vstream).duration = duration;
                (*vstream).nb_frames = frames;

                let av_tb = Rational::new(1, ffmpeg::ffi::AV_TIME_BASE as i32);
                (*self.octx.as_mut_ptr()).duration =
                    frames.rescale_with(self.video_tb, av_tb, Rounding::NearInfinity);
            }
        }

        if !self.connected {
            log::warn!("[mp4] skipping trailer: earlier write failure left the file incomplete");
            return Ok(());
        }
        self.octx
            .write_trailer()
            .map_err(|e| anyhow::anyhow!("write MP4 trailer: {e}"))?;

        log::info!(
            "[mp4] finalised: {} video packets, {} audio packets, {} bytes",
            self.video_packet_count,
            self.audio_packet_count,
            self.total_bytes
        );
        Ok(())
    }

    pub fn video_packet_count(&self) -> u64 {
        self.video_packet_count
    }

    pub fn audio_packet_count(&self) -> u64 {
        self.audio_packet_count
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

/// Audio-only sink: one 7-byte ADTS header per AAC packet, straight to
/// disk. No container, no timestamps — ADTS is self-framing.
pub struct RawAacWriter {
    file: BufWriter<File>,
    sample_rate: u32,
    channels: u8,
    packet_count: u64,
    total_bytes: u64,
}

impl RawAacWriter {
    pub fn new(path: &Path, sample_rate: u32, channels: u8) -> Result<Self> {
        let file = File::create(path)
            .map_err(|e| anyhow::anyhow!("create '{}': {e}", path.display()))?;
        log::info!("[adts] writing raw AAC to {}", path.display());
        Ok(Self {
            file: BufWriter::new(file),
            sample_rate,
            channels,
            packet_count: 0,
            total_bytes: 0,
        })
    }

    pub fn write(&mut self, packet: &EncodedAudioPacket) -> Result<()> {
        if packet.payload.is_empty() {
            return Ok(());
        }
        let header = adts_header(packet.payload.len(), self.sample_rate, self.channels);
        self.file.write_all(&header)?;
        self.file.write_all(&packet.payload)?;
        self.packet_count += 1;
        self.total_bytes += (header.len() + packet.payload.len()) as u64;
        Ok(())
    }

    pub fn finalize(&mut self) -> Result<()> {
        self.file.flush()?;
        log::info!(
            "[adts] finalised: {} packets, {} bytes",
            self.packet_count,
            self.total_bytes
        );
        Ok(())
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}
