// crates/ionia-media/src/audio_encoder.rs
//
// AAC-LC encoder with a frame accumulator.
//
// The audio engine emits whatever frame count its clock demands per tick;
// AAC demands exactly frame_size (1024) samples per input frame. This
// accumulator is the decoupling point: incoming interleaved stereo f32 is
// buffered, full frames are de-interleaved to planar and encoded, the
// residual carries over.
//
// Flush NEVER pads. A residual shorter than one frame is discarded — at
// most ~21 ms of audio lost at stop. Padding would splice zero samples
// into the timeline, which is audible as a click and distorts the total
// duration.

use anyhow::Result;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::Sample;
use ffmpeg::util::channel_layout::{ChannelLayout, ChannelLayoutMask};
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::Packet;

use ionia_core::media_types::{EncodedAudioPacket, CHANNELS};

pub struct AacEncoder {
    encoder: ffmpeg::encoder::Audio,
    sample_rate: u32,
    /// Samples per channel per encoder frame (1024 for AAC-LC).
    frame_size: usize,
    /// Interleaved stereo residual awaiting a full frame.
    pending: Vec<f32>,
    /// Encoder-internal PTS feed; the muxer assigns the real timestamps.
    next_pts: i64,
    packet_count: u64,
    total_bytes: u64,
}

// The codec context is only ever touched by the audio-tick worker that the
// encoder is moved into; Send lets it cross into that thread.
unsafe impl Send for AacEncoder {}

impl AacEncoder {
    pub fn new(sample_rate: u32, bitrate: usize) -> Result<Self> {
        let aac = encoder::find(CodecId::AAC)
            .ok_or_else(|| anyhow::anyhow!("AAC encoder not found"))?;

        let ctx = codec::context::Context::new_with_codec(aac);
        let mut audio = ctx
            .encoder()
            .audio()
            .map_err(|e| anyhow::anyhow!("create AAC encoder context: {e}"))?;

        audio.set_rate(sample_rate as i32);
        audio.set_ch_layout(ChannelLayout::STEREO);
        audio.set_format(Sample::F32(SampleType::Planar));
        audio.set_bit_rate(bitrate);

        // SPS-equivalent for AAC: put the AudioSpecificConfig in extradata
        // so container muxers can emit it out of band.
        unsafe {
            let p = audio.as_mut_ptr();
            (*p).flags |= ffmpeg::ffi::AV_CODEC_FLAG_GLOBAL_HEADER as i32;
        }

        let opened = audio
            .open_as_with(aac, ffmpeg::Dictionary::new())
            .map_err(|e| anyhow::anyhow!("open AAC encoder: {e}"))?;

        // Guard against a codec reporting 0 (shouldn't happen with AAC).
        let frame_size = (opened.frame_size() as usize).max(1024);

        log::info!("[aac] opened: {sample_rate} Hz stereo fltp, {bitrate} bps, frame_size={frame_size}");

        Ok(Self {
            encoder: opened,
            sample_rate,
            frame_size,
            pending: Vec::new(),
            next_pts: 0,
            packet_count: 0,
            total_bytes: 0,
        })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Buffer `samples` (interleaved stereo f32) and encode every complete
    /// frame now available. Residual samples stay buffered.
    pub fn encode(&mut self, samples: &[f32]) -> Result<Vec<EncodedAudioPacket>> {
        self.pending.extend_from_slice(samples);

        let mut out = Vec::new();
        while self.pending.len() / CHANNELS >= self.frame_size {
            self.encode_one_frame(&mut out)?;
        }
        Ok(out)
    }

    /// Encode any residual ≥ one frame, discard the rest, then drain the
    /// codec's internal frames with EOF.
    pub fn flush(&mut self) -> Result<Vec<EncodedAudioPacket>> {
        let mut out = Vec::new();
        while self.pending.len() / CHANNELS >= self.frame_size {
            self.encode_one_frame(&mut out)?;
        }

        let discarded = self.pending.len() / CHANNELS;
        if discarded > 0 {
            log::debug!("[aac] flush: discarding {discarded} residual frames (< frame_size)");
        }
        self.pending.clear();

        self.encoder
            .send_eof()
            .map_err(|e| anyhow::anyhow!("send EOF to AAC encoder: {e}"))?;
        self.drain_packets(&mut out)?;
        Ok(out)
    }

    fn encode_one_frame(&mut self, out: &mut Vec<EncodedAudioPacket>) -> Result<()> {
        let n = self.frame_size;

        let mut frame = AudioFrame::new(
            Sample::F32(SampleType::Planar),
            n,
            ChannelLayoutMask::STEREO,
        );
        frame.set_rate(self.sample_rate);
        frame.set_pts(Some(self.next_pts));
        self.next_pts += n as i64;

        // De-interleave [L0 R0 L1 R1 …] into the frame's two planes.
        unsafe {
            let ldata = frame.data_mut(0);
            let ldst = std::slice::from_raw_parts_mut(ldata.as_mut_ptr() as *mut f32, n);
            let rdata = frame.data_mut(1);
            let rdst = std::slice::from_raw_parts_mut(rdata.as_mut_ptr() as *mut f32, n);
            for i in 0..n {
                ldst[i] = self.pending[i * CHANNELS];
                rdst[i] = self.pending[i * CHANNELS + 1];
            }
        }
        self.pending.drain(..n * CHANNELS);

        self.encoder
            .send_frame(&frame)
            .map_err(|e| anyhow::anyhow!("send frame to AAC encoder: {e}"))?;
        self.drain_packets(out)
    }

    fn drain_packets(&mut self, out: &mut Vec<EncodedAudioPacket>) -> Result<()> {
        let mut pkt = Packet::empty();
        while self.encoder.receive_packet(&mut pkt).is_ok() {
            let payload = pkt.data().unwrap_or(&[]).to_vec();
            if payload.is_empty() {
                continue;
            }
            self.packet_count += 1;
            self.total_bytes += payload.len() as u64;
            out.push(EncodedAudioPacket {
                payload,
                num_samples: self.frame_size as i64,
            });
        }
        Ok(())
    }

    /// AudioSpecificConfig (or more) populated by the codec at open.
    pub fn extradata(&self) -> Option<Vec<u8>> {
        unsafe {
            let p = self.encoder.as_ptr();
            if (*p).extradata.is_null() || (*p).extradata_size <= 0 {
                None
            } else {
                Some(
                    std::slice::from_raw_parts(
                        (*p).extradata,
                        (*p).extradata_size as usize,
                    )
                    .to_vec(),
                )
            }
        }
    }

    pub(crate) fn codec_ptr(&self) -> *const ffmpeg::ffi::AVCodecContext {
        self.encoder.as_ptr()
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}
