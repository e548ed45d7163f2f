// crates/ionia-core/src/normalize.rs
//
// Audio normalisation: any captured PCM format → interleaved f32 stereo at
// 48 kHz, in three ordered passes:
//
//   1. decode_to_f32  — i16 / i32 / f32 / extensible-f32 → f32, interleaving
//                       preserved
//   2. resample       — linear interpolation to 48 kHz, channel count
//                       unchanged; passthrough when the source is already
//                       48 kHz
//   3. adapt_channels — mono duplicated, stereo untouched, ≥3 channels take
//                       the front pair
//
// The resampler is plain linear interpolation: no dithering, no anti-alias
// filter. At 44.1 → 48 the aliasing is inaudible on typical desktop
// content; the latency and complexity of a band-limited kernel isn't worth
// it for a live capture path. The kernel is isolated in `resample` so it
// can be swapped without touching callers.

use crate::media_types::{AudioFormat, SampleEncoding, UnifiedFrame, SAMPLE_RATE};

/// Run the full pipeline on one captured buffer.
///
/// Returns `None` when the buffer is too short for the declared frame count
/// or the encoding is unsupported — the caller discards the frame and
/// counts it; a bad packet must never poison the pipeline.
pub fn normalize(bytes: &[u8], frames: usize, format: &AudioFormat) -> Option<UnifiedFrame> {
    if frames == 0 || format.channels == 0 {
        return None;
    }

    let decoded = decode_to_f32(bytes, frames, format)?;
    let resampled = resample(&decoded, frames, format.channels as usize, format.sample_rate);
    let stereo = adapt_channels(&resampled, format.channels as usize);

    Some(UnifiedFrame::new(stereo))
}

/// Pass 1: decode packed interleaved samples to f32, preserving
/// interleaving. Integer samples are scaled by their full-scale value.
pub fn decode_to_f32(bytes: &[u8], frames: usize, format: &AudioFormat) -> Option<Vec<f32>> {
    let samples = frames * format.channels as usize;
    let needed = samples * format.bytes_per_sample();
    if bytes.len() < needed {
        return None;
    }

    let bytes = &bytes[..needed];
    let out = match format.encoding {
        SampleEncoding::I16 => bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
            .collect(),
        SampleEncoding::I32 => bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32 / 2_147_483_648.0)
            .collect(),
        SampleEncoding::F32 | SampleEncoding::F32Extensible => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    };

    Some(out)
}

/// Pass 2: linear resample to 48 kHz. `input` is interleaved with
/// `channels` channels; the output keeps the channel count.
///
/// Output length: `ceil(in_frames · 48000 / src_rate)` frames.
pub fn resample(input: &[f32], in_frames: usize, channels: usize, src_rate: u32) -> Vec<f32> {
    if src_rate == SAMPLE_RATE || in_frames == 0 {
        return input.to_vec();
    }

    let out_frames =
        ((in_frames as u64 * SAMPLE_RATE as u64 + src_rate as u64 - 1) / src_rate as u64) as usize;
    let mut out = vec![0.0f32; out_frames * channels];

    let step = src_rate as f64 / SAMPLE_RATE as f64;
    for i in 0..out_frames {
        let pos = i as f64 * step;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let idx = idx.min(in_frames - 1);
        let next = (idx + 1).min(in_frames - 1);

        for ch in 0..channels {
            let a = input[idx * channels + ch];
            let b = input[next * channels + ch];
            out[i * channels + ch] = a + (b - a) * frac;
        }
    }

    out
}

/// Pass 3: adapt the channel layout to stereo.
pub fn adapt_channels(input: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        2 => input.to_vec(),
        1 => {
            let mut out = Vec::with_capacity(input.len() * 2);
            for &s in input {
                out.push(s);
                out.push(s);
            }
            out
        }
        // ≥3: the first two channels are front-left / front-right in the
        // common layouts; the rest are discarded.
        n => {
            let frames = input.len() / n;
            let mut out = Vec::with_capacity(frames * 2);
            for f in 0..frames {
                out.push(input[f * n]);
                out.push(input[f * n + 1]);
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(rate: u32, channels: u16, encoding: SampleEncoding) -> AudioFormat {
        AudioFormat { sample_rate: rate, channels, encoding }
    }

    #[test]
    fn decode_i16_full_scale() {
        let bytes: Vec<u8> = [i16::MIN, 0, 16384, i16::MAX]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let out = decode_to_f32(&bytes, 2, &fmt(48_000, 2, SampleEncoding::I16)).unwrap();
        assert_eq!(out[0], -1.0);
        assert_eq!(out[1], 0.0);
        assert!((out[2] - 0.5).abs() < 1e-4);
        assert!((out[3] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn decode_i32_full_scale() {
        let bytes: Vec<u8> = [i32::MIN, 0i32, i32::MAX]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let out = decode_to_f32(&bytes, 3, &fmt(48_000, 1, SampleEncoding::I32)).unwrap();
        assert_eq!(out[0], -1.0);
        assert_eq!(out[1], 0.0);
        assert!((out[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn decode_f32_identity_both_tags() {
        let bytes: Vec<u8> = [0.25f32, -0.75]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        for enc in [SampleEncoding::F32, SampleEncoding::F32Extensible] {
            let out = decode_to_f32(&bytes, 1, &fmt(48_000, 2, enc)).unwrap();
            assert_eq!(out, vec![0.25, -0.75]);
        }
    }

    #[test]
    fn decode_short_buffer_is_rejected() {
        let bytes = vec![0u8; 6]; // 1.5 samples of i32
        assert!(decode_to_f32(&bytes, 2, &fmt(48_000, 1, SampleEncoding::I32)).is_none());
    }

    #[test]
    fn resample_passthrough_at_48k() {
        let input = vec![0.1, 0.2, 0.3, 0.4];
        assert_eq!(resample(&input, 2, 2, 48_000), input);
    }

    #[test]
    fn resample_output_length_is_ceiling() {
        // 441 frames at 44100 → ceil(441 · 48000 / 44100) = 480
        let input = vec![0.0f32; 441];
        assert_eq!(resample(&input, 441, 1, 44_100).len(), 480);

        // 96 kHz halves: ceil(100 · 48000 / 96000) = 50
        let input = vec![0.0f32; 100];
        assert_eq!(resample(&input, 100, 1, 96_000).len(), 50);
    }

    #[test]
    fn resample_interpolates_linearly() {
        // 24 kHz → 48 kHz doubles the frame count; odd output frames land
        // halfway between input neighbours.
        let input = vec![0.0f32, 1.0];
        let out = resample(&input, 2, 1, 24_000);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert_eq!(out[2], 1.0);
        // Past the last input frame the value holds (clamped index).
        assert_eq!(out[3], 1.0);
    }

    #[test]
    fn mono_duplicates_to_both_channels() {
        let out = adapt_channels(&[0.5, -0.5], 1);
        assert_eq!(out, vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn surround_takes_front_pair() {
        // 5.1 frame: FL FR FC LFE BL BR
        let frame = [0.1, 0.2, 0.9, 0.9, 0.9, 0.9, 0.3, 0.4, 0.9, 0.9, 0.9, 0.9];
        let out = adapt_channels(&frame, 6);
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn full_pipeline_mono_i16_44100() {
        // 441 mono i16 frames at 44.1 kHz → 480 stereo f32 frames at 48 kHz.
        let bytes: Vec<u8> = std::iter::repeat(8192i16)
            .take(441)
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let out = normalize(&bytes, 441, &fmt(44_100, 1, SampleEncoding::I16)).unwrap();
        assert_eq!(out.frames, 480);
        assert_eq!(out.samples.len(), 960);
        // Constant input stays constant through the linear resampler.
        for s in &out.samples {
            assert!((s - 0.25).abs() < 1e-4);
        }
    }

    #[test]
    fn zero_frames_is_rejected() {
        assert!(normalize(&[], 0, &fmt(48_000, 2, SampleEncoding::F32)).is_none());
    }
}
