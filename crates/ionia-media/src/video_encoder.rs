// crates/ionia-media/src/video_encoder.rs
//
// H.264 encoder with hardware/software fallback.
//
// Selection order:
//   1. h264_nvenc when requested and present — low latency, constant
//      bitrate.
//   2. libx264 / x264 — veryfast, zerolatency, baseline.
//   3. Whatever generic H.264 encoder remains. If that turns out to be the
//      Media Foundation wrapper AND the ambient COM apartment is STA, the
//      pipeline REFUSES to initialise: h264_mf deadlocks under STA on its
//      first encode, and a hang is strictly worse than a clear error.
//
// Packets leave here as bytes + keyframe flag only. The muxer derives all
// timestamps from the frame index; the PTS fed to the codec exists purely
// for its internal bookkeeping.

use anyhow::{bail, Result};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling::{Context as ScaleCtx, Flags as ScaleFlags};
use ffmpeg::util::frame::video::Video as VideoFrame;
use ffmpeg::util::rational::Rational;
use ffmpeg::Packet;

use ionia_core::media_types::EncodedVideoPacket;

use crate::apartment::ApartmentMode;
use crate::config::VideoOptions;

pub struct H264Encoder {
    encoder: ffmpeg::encoder::video::Video,
    scaler: ScaleCtx,
    width: u32,
    height: u32,
    fps: u32,
    frame_count: i64,
    codec_name: String,
    packet_count: u64,
    total_bytes: u64,
}

// Touched only by the video-tick worker it is moved into.
unsafe impl Send for H264Encoder {}

impl H264Encoder {
    pub fn new(opts: &VideoOptions, apartment: ApartmentMode) -> Result<Self> {
        // Selection policy: NVENC if asked for and present, then x264, then
        // whatever generic H.264 encoder remains — with the MF/STA refusal.
        let mut is_nvenc = false;
        let mut codec = None;

        if opts.use_nvenc {
            codec = encoder::find_by_name("h264_nvenc");
            if codec.is_some() {
                log::info!("[h264] using NVENC hardware encoder");
                is_nvenc = true;
            } else {
                log::info!("[h264] NVENC requested but not available, falling back to x264");
            }
        }
        if codec.is_none() {
            for name in ["libx264", "x264"] {
                codec = encoder::find_by_name(name);
                if codec.is_some() {
                    log::info!("[h264] using {name}");
                    break;
                }
            }
        }
        if codec.is_none() {
            codec = encoder::find(CodecId::H264);
        }

        let codec = codec
            .ok_or_else(|| anyhow::anyhow!("no H.264 encoder available in this ffmpeg build"))?;
        let codec_name = codec.name().to_string();

        // The MF wrapper deadlocks under single-threaded-apartment COM.
        // Refuse it loudly rather than hanging at the first encode.
        if codec_name.contains("mf") && apartment == ApartmentMode::Sta {
            bail!(
                "the only available H.264 encoder is '{codec_name}', which requires a \
                 multi-threaded COM apartment, but this process is in STA mode. \
                 Install an ffmpeg build with libx264 (e.g. vcpkg install \
                 ffmpeg[x264]) and restart."
            );
        }

        let ctx = codec::context::Context::new_with_codec(codec);
        let mut video = ctx
            .encoder()
            .video()
            .map_err(|e| anyhow::anyhow!("create H.264 encoder context: {e}"))?;

        let time_base = Rational::new(1, opts.fps as i32);
        video.set_width(opts.width);
        video.set_height(opts.height);
        video.set_format(Pixel::YUV420P);
        video.set_time_base(time_base);
        video.set_frame_rate(Some(Rational::new(opts.fps as i32, 1)));
        video.set_bit_rate(opts.bitrate);
        video.set_gop(opts.fps * 2); // keyframe every 2 s
        video.set_max_b_frames(0);

        // SPS/PPS into extradata so the MP4 muxer gets its avcC without
        // waiting for the first keyframe. (The RTMP path still handles
        // encoders that leave this empty.)
        unsafe {
            let p = video.as_mut_ptr();
            (*p).flags |= ffmpeg::ffi::AV_CODEC_FLAG_GLOBAL_HEADER as i32;
        }

        let mut dict = ffmpeg::Dictionary::new();
        if is_nvenc {
            dict.set("preset", "fast");
            dict.set("tune", "ll");
            dict.set("rc", "cbr");
        } else {
            dict.set("preset", "veryfast");
            dict.set("tune", "zerolatency");
            dict.set("profile", "baseline");
        }
        dict.set("bf", "0");

        let opened = video
            .open_as_with(codec, dict)
            .map_err(|e| anyhow::anyhow!("open {codec_name}: {e}"))?;

        let scaler = ScaleCtx::get(
            Pixel::RGBA,
            opts.width,
            opts.height,
            Pixel::YUV420P,
            opts.width,
            opts.height,
            ScaleFlags::BILINEAR,
        )
        .map_err(|e| anyhow::anyhow!("create RGBA→YUV420P scaler: {e}"))?;

        log::info!(
            "[h264] opened {codec_name}: {}x{} @ {} fps, {} bps, gop={}",
            opts.width,
            opts.height,
            opts.fps,
            opts.bitrate,
            opts.fps * 2
        );

        Ok(Self {
            encoder: opened,
            scaler,
            width: opts.width,
            height: opts.height,
            fps: opts.fps,
            frame_count: 0,
            codec_name,
            packet_count: 0,
            total_bytes: 0,
        })
    }

    /// Encode one tightly packed RGBA frame. Returns zero or more packets —
    /// codecs may buffer internally even with zerolatency tuning.
    pub fn encode(&mut self, rgba: &[u8]) -> Result<Vec<EncodedVideoPacket>> {
        let expected = self.width as usize * self.height as usize * 4;
        if rgba.len() != expected {
            bail!("frame size {} != expected {}", rgba.len(), expected);
        }

        let mut src = VideoFrame::new(Pixel::RGBA, self.width, self.height);
        let stride = src.stride(0);
        let row_bytes = self.width as usize * 4;
        {
            let data = src.data_mut(0);
            for row in 0..self.height as usize {
                data[row * stride..row * stride + row_bytes]
                    .copy_from_slice(&rgba[row * row_bytes..(row + 1) * row_bytes]);
            }
        }

        let mut yuv = VideoFrame::empty();
        self.scaler
            .run(&src, &mut yuv)
            .map_err(|e| anyhow::anyhow!("scale RGBA frame: {e}"))?;
        yuv.set_pts(Some(self.frame_count));
        self.frame_count += 1;

        self.encoder
            .send_frame(&yuv)
            .map_err(|e| anyhow::anyhow!("send frame to {}: {e}", self.codec_name))?;

        Ok(self.drain_packets())
    }

    /// EOF the codec and collect whatever it was still holding.
    pub fn flush(&mut self) -> Result<Vec<EncodedVideoPacket>> {
        self.encoder
            .send_eof()
            .map_err(|e| anyhow::anyhow!("send EOF to {}: {e}", self.codec_name))?;
        Ok(self.drain_packets())
    }

    fn drain_packets(&mut self) -> Vec<EncodedVideoPacket> {
        let mut out = Vec::new();
        let mut pkt = Packet::empty();
        while self.encoder.receive_packet(&mut pkt).is_ok() {
            let payload = pkt.data().unwrap_or(&[]).to_vec();
            if payload.is_empty() {
                continue;
            }
            self.packet_count += 1;
            self.total_bytes += payload.len() as u64;
            out.push(EncodedVideoPacket {
                payload,
                is_keyframe: pkt.is_key(),
            });
        }
        out
    }

    /// avcC or Annex-B parameter sets, depending on the codec.
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

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}
