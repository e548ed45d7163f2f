// crates/ionia-media/src/stream_muxer.rs
//
// FLV-over-RTMP muxer. On top of the file muxer's timestamp discipline it
// adds the three bitstream contracts the wire format demands:
//
//   (a) incoming H.264 may be Annex-B (NVENC habitually is) → convert to
//       4-byte-length AVCC before it touches the container
//   (b) codecpar extradata must be a clean avcC. If the encoder didn't
//       populate extradata at open, header emission is DEFERRED until the
//       first keyframe arrives and SPS/PPS can be harvested from it
//   (c) the AAC stream's extradata is a hand-built 2-byte
//       AudioSpecificConfig so the FLV muxer emits the sequence header
//
// Packets are not written inline: they are admitted to the DTS-sorted
// stream buffer and drained by the network sender, which paces them
// against the wall clock. Audio arriving before the deferred header is
// admitted too — the sender refuses to drain until the header exists, so
// nothing is lost while video warms up.
//
// An avcC that still contains Annex-B start codes is a programmer error
// that yields an unplayable stream; building one aborts the write with a
// hard error rather than continuing.

use anyhow::{bail, Result};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::Id as CodecId;
use ffmpeg::encoder;
use ffmpeg::format::output_as;
use ffmpeg::util::rational::Rational;
use ffmpeg::{Packet, Rescale, Rounding};

use ionia_core::avc;
use ionia_core::media_types::{EncodedAudioPacket, EncodedVideoPacket};
use ionia_core::stream_buffer::{QueuedPacket, StreamBuffer};

use crate::audio_encoder::AacEncoder;
use crate::video_encoder::H264Encoder;

const VIDEO_STREAM: usize = 0;
const AUDIO_STREAM: usize = 1;

pub struct StreamMuxer {
    octx: ffmpeg::format::context::Output,
    url: String,
    video_codec_tb: Rational,
    audio_codec_tb: Rational,
    header_written: bool,
    connected: bool,
    sent_first_keyframe: bool,
    audio_samples_written: i64,
    last_video_dts: i64,
    last_audio_dts: i64,
    buffer: StreamBuffer,
    video_packet_count: u64,
    audio_packet_count: u64,
    total_bytes: u64,
}

// The AVFormatContext is only touched behind the pipeline's sink mutex.
unsafe impl Send for StreamMuxer {}

impl StreamMuxer {
    pub fn new(
        url: &str,
        video_enc: &H264Encoder,
        audio_enc: &AacEncoder,
        max_packets: usize,
        max_latency_ms: i64,
    ) -> Result<Self> {
        ffmpeg::format::network::init();

        let mut octx = output_as(&url, "flv")
            .map_err(|e| anyhow::anyhow!("open RTMP output '{url}': {e}"))?;

        let fps = video_enc.fps();
        let sample_rate = audio_enc.sample_rate();

        let h264 = encoder::find(CodecId::H264)
            .ok_or_else(|| anyhow::anyhow!("H.264 codec missing for stream setup"))?;
        octx.add_stream(h264)
            .map_err(|e| anyhow::anyhow!("add video stream: {e}"))?;

        let aac = encoder::find(CodecId::AAC)
            .ok_or_else(|| anyhow::anyhow!("AAC codec missing for stream setup"))?;
        octx.add_stream(aac)
            .map_err(|e| anyhow::anyhow!("add audio stream: {e}"))?;

        unsafe {
            let fps_rational = ffmpeg::ffi::AVRational { num: fps as i32, den: 1 };
            // FLV timestamps are milliseconds; set the time bases up front
            // so packets queued before the deferred header already carry
            // the base the muxer will settle on.
            let ms = ffmpeg::ffi::AVRational { num: 1, den: 1000 };

            let vstream = *(*octx.as_mut_ptr()).streams.add(VIDEO_STREAM);
            let ret = ffmpeg::ffi::avcodec_parameters_from_context(
                (*vstream).codecpar,
                video_enc.codec_ptr() as *mut ffmpeg::ffi::AVCodecContext,
            );
            if ret < 0 {
                bail!("avcodec_parameters_from_context (video) failed: {ret}");
            }
            (*vstream).time_base = ms;
            (*vstream).avg_frame_rate = fps_rational;
            (*vstream).r_frame_rate = fps_rational;

            let astream = *(*octx.as_mut_ptr()).streams.add(AUDIO_STREAM);
            let ret = ffmpeg::ffi::avcodec_parameters_from_context(
                (*astream).codecpar,
                audio_enc.codec_ptr() as *mut ffmpeg::ffi::AVCodecContext,
            );
            if ret < 0 {
                bail!("avcodec_parameters_from_context (audio) failed: {ret}");
            }
            (*astream).time_base = ms;
        }

        let mut muxer = Self {
            octx,
            url: url.to_string(),
            video_codec_tb: Rational::new(1, fps as i32),
            audio_codec_tb: Rational::new(1, sample_rate as i32),
            header_written: false,
            connected: true,
            sent_first_keyframe: false,
            audio_samples_written: 0,
            last_video_dts: -1,
            last_audio_dts: -1,
            buffer: StreamBuffer::new(max_packets, max_latency_ms),
            video_packet_count: 0,
            audio_packet_count: 0,
            total_bytes: 0,
        };

        // The FLV muxer needs a clean avcC in video extradata. The copy
        // from the encoder context may hold Annex-B parameter sets (x264),
        // a ready avcC, or nothing at all (NVENC until its first keyframe).
        match video_enc.extradata() {
            Some(ed) if ed.first() == Some(&0x01) => {
                if !avc::avcc_is_valid(&ed) {
                    bail!("encoder extradata claims avcC but contains Annex-B start codes");
                }
                muxer.set_video_extradata(&ed)?;
            }
            Some(ed) => {
                let (sps, pps) = avc::extract_sps_pps(&ed);
                match avc::build_avcc(&sps, &pps) {
                    Some(avcc) => {
                        if !avc::avcc_is_valid(&avcc) {
                            bail!("built avcC extradata contains Annex-B start codes");
                        }
                        muxer.set_video_extradata(&avcc)?;
                    }
                    None => log::warn!(
                        "[stream-muxer] encoder extradata had no usable SPS/PPS, deferring header"
                    ),
                }
            }
            None => {}
        }

        // AudioSpecificConfig so the container can emit the AAC sequence
        // header on its own; never hand-write FLV tag payloads.
        let asc = avc::audio_specific_config(sample_rate, 2)
            .ok_or_else(|| anyhow::anyhow!("no AAC sampling index for {sample_rate} Hz"))?;
        muxer.set_audio_extradata(&asc)?;

        if muxer.video_extradata_len() > 0 {
            muxer.write_header()?;
        } else {
            log::info!("[stream-muxer] deferring header until H.264 avcC is available");
        }

        Ok(muxer)
    }

    fn set_video_extradata(&mut self, data: &[u8]) -> Result<()> {
        unsafe { set_codecpar_extradata(&mut self.octx, VIDEO_STREAM, data) }
    }

    fn set_audio_extradata(&mut self, data: &[u8]) -> Result<()> {
        unsafe { set_codecpar_extradata(&mut self.octx, AUDIO_STREAM, data) }
    }

    fn video_extradata_len(&self) -> usize {
        unsafe {
            let vstream = *(*self.octx.as_ptr()).streams.add(VIDEO_STREAM);
            (*(*vstream).codecpar).extradata_size.max(0) as usize
        }
    }

    fn write_header(&mut self) -> Result<()> {
        self.octx
            .write_header()
            .map_err(|e| anyhow::anyhow!("write FLV header to '{}': {e}", self.url))?;
        self.header_written = true;

        let vtb = self.octx.stream(VIDEO_STREAM).unwrap().time_base();
        let atb = self.octx.stream(AUDIO_STREAM).unwrap().time_base();
        log::info!(
            "[stream-muxer] header written, time_base video={}/{} audio={}/{}",
            vtb.numerator(),
            vtb.denominator(),
            atb.numerator(),
            atb.denominator()
        );
        Ok(())
    }

    fn stream_tb(&self, idx: usize) -> Rational {
        self.octx.stream(idx).unwrap().time_base()
    }

    /// Queue one encoded video packet for sending.
    ///
    /// Returns false when the packet was refused (not connected, keyframe
    /// gate, timestamp regression, buffer policy). Bitstream-invariant
    /// violations return an error.
    pub fn write_video(&mut self, packet: &EncodedVideoPacket, frame_index: i64) -> Result<bool> {
        if !self.connected || packet.payload.is_empty() {
            return Ok(false);
        }

        // (a) Annex-B → AVCC.
        let payload = if avc::starts_with_start_code(&packet.payload) {
            match avc::annexb_to_avcc(&packet.payload) {
                Some(converted) => converted,
                None => {
                    log::error!(
                        "[stream-muxer] Annex-B conversion failed ({} bytes)",
                        packet.payload.len()
                    );
                    return Ok(false);
                }
            }
        } else {
            packet.payload.clone()
        };

        // (b) deferred header: harvest SPS/PPS from the first keyframe.
        if !self.header_written {
            if self.video_extradata_len() == 0 && packet.is_keyframe {
                let (sps, pps) = avc::extract_sps_pps(&packet.payload);
                if let Some(avcc) = avc::build_avcc(&sps, &pps) {
                    if !avc::avcc_is_valid(&avcc) {
                        bail!("avcC built from keyframe contains Annex-B start codes");
                    }
                    self.set_video_extradata(&avcc)?;
                }
            }
            if self.video_extradata_len() > 0 {
                self.write_header()?;
            }
        }

        // Key-frame gate: nothing before the first IDR.
        if !self.sent_first_keyframe && !packet.is_keyframe {
            log::debug!("[stream-muxer] dropping pre-keyframe video packet");
            return Ok(false);
        }

        let tb = self.stream_tb(VIDEO_STREAM);
        let pts = frame_index.rescale_with(self.video_codec_tb, tb, Rounding::NearInfinity);
        let next = (frame_index + 1).rescale_with(self.video_codec_tb, tb, Rounding::NearInfinity);
        let duration = (next - pts).max(1);

        if pts <= self.last_video_dts {
            return Ok(false);
        }
        self.last_video_dts = pts;
        if packet.is_keyframe {
            self.sent_first_keyframe = true;
        }

        let len = payload.len() as u64;
        let admitted = self.buffer.push(QueuedPacket {
            payload,
            pts,
            dts: pts,
            duration,
            stream_index: VIDEO_STREAM,
            time_base: (tb.numerator(), tb.denominator()),
            is_video: true,
            is_keyframe: packet.is_keyframe,
        });
        if admitted {
            self.video_packet_count += 1;
            self.total_bytes += len;
        }
        Ok(admitted)
    }

    /// Queue one encoded audio packet. Audio does NOT wait for the first
    /// keyframe — it buffers until video is ready, then drains in DTS
    /// order.
    pub fn write_audio(&mut self, packet: &EncodedAudioPacket) -> Result<bool> {
        if !self.connected || packet.payload.is_empty() || packet.num_samples <= 0 {
            return Ok(false);
        }

        let tb = self.stream_tb(AUDIO_STREAM);
        let cur = self.audio_samples_written;
        let next_samples = cur + packet.num_samples;

        let pts = cur.rescale_with(self.audio_codec_tb, tb, Rounding::NearInfinity);
        let mut next = next_samples.rescale_with(self.audio_codec_tb, tb, Rounding::NearInfinity);
        if next <= pts {
            next = pts + 1;
        }

        if pts <= self.last_audio_dts {
            return Ok(false);
        }
        self.last_audio_dts = pts;
        self.audio_samples_written = next_samples;

        let len = packet.payload.len() as u64;
        let admitted = self.buffer.push(QueuedPacket {
            payload: packet.payload.clone(),
            pts,
            dts: pts,
            duration: next - pts,
            stream_index: AUDIO_STREAM,
            time_base: (tb.numerator(), tb.denominator()),
            is_video: false,
            is_keyframe: false,
        });
        if admitted {
            self.audio_packet_count += 1;
            self.total_bytes += len;
        }
        Ok(admitted)
    }

    /// Pop the next due packet for the network sender. `None` until the
    /// header exists or when the buffer is dry.
    pub fn next_packet(&mut self) -> Option<(QueuedPacket, i64)> {
        if !self.header_written || !self.connected {
            return None;
        }
        self.buffer.pop_front()
    }

    /// Write one previously queued packet to the wire. An I/O failure
    /// marks the muxer disconnected; later writes refuse quietly.
    pub fn send_packet(&mut self, qp: &QueuedPacket) -> bool {
        if !self.connected {
            return false;
        }

        let mut pkt = Packet::copy(&qp.payload);
        pkt.set_stream(qp.stream_index);
        pkt.set_pts(Some(qp.pts));
        pkt.set_dts(Some(qp.dts));
        pkt.set_duration(qp.duration);
        if qp.is_keyframe {
            pkt.set_flags(ffmpeg::packet::Flags::KEY);
        }

        if let Err(e) = pkt.write_interleaved(&mut self.octx) {
            log::error!("[stream-muxer] network write failed: {e} — marking disconnected");
            self.connected = false;
            return false;
        }
        true
    }

    /// Flush the interleaving queue and write the trailer.
    pub fn close(&mut self) {
        if self.header_written && self.connected {
            if let Err(e) = self.octx.write_trailer() {
                log::error!("[stream-muxer] write trailer: {e}");
            }
        }
        self.connected = false;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_backpressure(&self) -> bool {
        self.buffer.is_backpressure()
    }

    pub fn buffered_packets(&self) -> usize {
        self.buffer.len()
    }

    pub fn dropped_video(&self) -> u64 {
        self.buffer.dropped_video()
    }

    pub fn dropped_audio(&self) -> u64 {
        self.buffer.dropped_audio()
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

/// Replace a stream's codecpar extradata, with the padding libavformat
/// expects after the payload.
unsafe fn set_codecpar_extradata(
    octx: &mut ffmpeg::format::context::Output,
    stream_idx: usize,
    data: &[u8],
) -> Result<()> {
    let stream = *(*octx.as_mut_ptr()).streams.add(stream_idx);
    let par = (*stream).codecpar;

    if !(*par).extradata.is_null() {
        ffmpeg::ffi::av_freep(&mut (*par).extradata as *mut _ as *mut std::ffi::c_void);
        (*par).extradata_size = 0;
    }

    let size = data.len();
    let buf = ffmpeg::ffi::av_malloc(size + ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize)
        as *mut u8;
    if buf.is_null() {
        bail!("av_malloc({size}) failed for extradata");
    }
    std::ptr::copy_nonoverlapping(data.as_ptr(), buf, size);
    std::ptr::write_bytes(
        buf.add(size),
        0,
        ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize,
    );
    (*par).extradata = buf;
    (*par).extradata_size = size as i32;
    Ok(())
}
