// crates/ionia-core/src/engine.rs
//
// AudioEngine: the clock master for the audio timeline.
//
// Two asynchronous capture sources (desktop loopback, microphone) feed
// interleaved f32 stereo into per-source rings. `tick()` emits exactly the
// number of frames the wall clock says are due — `elapsed_ms · 48000/1000 −
// frames_sent` — regardless of how much either source has delivered:
//
//   • source behind  → its contribution is silence for the missing frames
//   • source ahead   → the ring's drop-oldest policy bounds its latency
//
// The emitted timeline is therefore gap-free and drift-free by
// construction; a stalled source produces an audible dropout, never an
// A/V desync. Consecutive packets satisfy pts_next == pts_prev + duration.
//
// Thread model: the orchestrator wraps the engine in a Mutex; capture
// workers call `feed`, the audio-tick worker calls `tick`. The lock is held
// only for the push/drain window.

use std::time::Instant;

use crate::media_types::{AudioPacket, CHANNELS, SAMPLE_RATE};
use crate::ring::SampleRing;

/// Which capture source a `feed` call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSourceKind {
    Desktop,
    Mic,
}

/// Largest burst one tick may emit: 100 ms of frames. Caps catch-up after a
/// scheduler stall so downstream never sees a multi-second PCM wall.
pub const MAX_FRAMES_PER_TICK: u64 = (SAMPLE_RATE / 10) as u64;

/// Default ring capacity per source: 10 s of stereo audio.
pub const DEFAULT_RING_FRAMES: usize = SAMPLE_RATE as usize * 10;

/// Default microphone gain. Voice sits low against desktop audio; a mild
/// boost reads better without routinely clipping.
pub const DEFAULT_MIC_GAIN: f32 = 1.2;

pub struct AudioEngine {
    desktop: SampleRing,
    mic: SampleRing,
    mic_gain: f32,
    started_at: Option<Instant>,
    frames_sent: u64,
    frames_received: u64,
}

impl AudioEngine {
    pub fn new(ring_cap_frames: usize, mic_gain: f32) -> Self {
        Self {
            desktop: SampleRing::new(ring_cap_frames),
            mic: SampleRing::new(ring_cap_frames),
            mic_gain,
            started_at: None,
            frames_sent: 0,
            frames_received: 0,
        }
    }

    /// Snapshot the monotonic clock and zero the timeline.
    pub fn start(&mut self) {
        self.desktop.clear();
        self.mic.clear();
        self.frames_sent = 0;
        self.frames_received = 0;
        self.started_at = Some(Instant::now());
    }

    pub fn stop(&mut self) {
        self.started_at = None;
        self.desktop.clear();
        self.mic.clear();
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// Push interleaved stereo f32 samples from one capture source.
    /// Ignored while stopped.
    pub fn feed(&mut self, samples: &[f32], source: AudioSourceKind) {
        if self.started_at.is_none() || samples.is_empty() {
            return;
        }
        debug_assert_eq!(samples.len() % CHANNELS, 0);
        self.frames_received += (samples.len() / CHANNELS) as u64;
        match source {
            AudioSourceKind::Desktop => self.desktop.push(samples),
            AudioSourceKind::Mic => self.mic.push(samples),
        }
    }

    /// Emit the frames due at the current wall-clock instant, if any.
    pub fn tick(&mut self) -> Option<AudioPacket> {
        let elapsed_ms = self.started_at?.elapsed().as_millis() as u64;
        self.tick_at(elapsed_ms)
    }

    /// Clock-explicit tick: emit the frames due at `elapsed_ms` since
    /// `start()`. Split out from `tick` so the timeline arithmetic is
    /// testable without a live clock.
    pub fn tick_at(&mut self, elapsed_ms: u64) -> Option<AudioPacket> {
        self.started_at?;

        let expected = elapsed_ms * SAMPLE_RATE as u64 / 1000;
        let to_send = expected.saturating_sub(self.frames_sent);
        if to_send == 0 {
            return None;
        }
        let to_send = to_send.min(MAX_FRAMES_PER_TICK) as usize;

        let mixed = self.mix(to_send);

        let pts = self.frames_sent as i64;
        self.frames_sent += to_send as u64;

        let mut payload = Vec::with_capacity(mixed.len() * 4);
        for s in &mixed {
            payload.extend_from_slice(&s.to_le_bytes());
        }

        Some(AudioPacket {
            payload,
            pts,
            dts: pts,
            duration: to_send as i64,
            stream_index: 0,
        })
    }

    /// Non-blocking mix of `frames` stereo frames. A source with fewer
    /// frames available contributes silence for the shortfall; the sum is
    /// hard-clipped to [−1, 1].
    fn mix(&mut self, frames: usize) -> Vec<f32> {
        let desktop_frames = self.desktop.frames_available();
        let mic_frames = self.mic.frames_available();

        let mut out = vec![0.0f32; frames * CHANNELS];
        for frame in 0..frames {
            for ch in 0..CHANNELS {
                let idx = frame * CHANNELS + ch;
                let d = if frame < desktop_frames {
                    self.desktop.get(idx).unwrap_or(0.0)
                } else {
                    0.0
                };
                let m = if frame < mic_frames {
                    self.mic.get(idx).unwrap_or(0.0) * self.mic_gain
                } else {
                    0.0
                };
                out[idx] = (d + m).clamp(-1.0, 1.0);
            }
        }

        self.desktop.consume(frames * CHANNELS);
        self.mic.consume(frames * CHANNELS);
        out
    }

    /// Next packet's PTS, in samples.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Total frames fed by capture since `start()`.
    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    /// Samples evicted from either ring by the drop-oldest policy.
    pub fn dropped_samples(&self) -> u64 {
        self.desktop.dropped_samples() + self.mic.dropped_samples()
    }

    pub fn mic_available_frames(&self) -> usize {
        self.mic.frames_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_f32(p: &AudioPacket) -> Vec<f32> {
        p.payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn started(gain: f32) -> AudioEngine {
        let mut e = AudioEngine::new(DEFAULT_RING_FRAMES, gain);
        e.start();
        e
    }

    #[test]
    fn tick_emits_clock_rate_not_feed_rate() {
        let mut e = started(1.0);
        // No audio fed at all: the clock still demands 100 ms → 4800 frames,
        // all silence.
        let p = e.tick_at(100).unwrap();
        assert_eq!(p.duration, 4800);
        assert_eq!(p.pts, 0);
        assert!(payload_f32(&p).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn tick_before_first_frame_due_is_none() {
        let mut e = started(1.0);
        assert!(e.tick_at(0).is_none());
    }

    #[test]
    fn burst_is_capped_at_100ms() {
        let mut e = started(1.0);
        // 1 s stall → only MAX_FRAMES_PER_TICK emitted, remainder next tick.
        let p = e.tick_at(1000).unwrap();
        assert_eq!(p.duration, MAX_FRAMES_PER_TICK as i64);
        let p2 = e.tick_at(1000).unwrap();
        assert_eq!(p2.pts, MAX_FRAMES_PER_TICK as i64);
    }

    #[test]
    fn consecutive_packets_are_gap_free() {
        let mut e = started(1.0);
        let a = e.tick_at(21).unwrap();
        let b = e.tick_at(42).unwrap();
        let c = e.tick_at(64).unwrap();
        assert_eq!(b.pts, a.pts + a.duration);
        assert_eq!(c.pts, b.pts + b.duration);
    }

    #[test]
    fn frames_sent_tracks_expected_within_cap() {
        let mut e = started(1.0);
        for ms in (21..=210).step_by(21) {
            e.tick_at(ms);
        }
        let expected = 210 * SAMPLE_RATE as u64 / 1000;
        assert_eq!(e.frames_sent(), expected);
    }

    #[test]
    fn desktop_and_mic_are_summed_with_gain() {
        let mut e = started(2.0);
        e.feed(&[0.1, 0.1], AudioSourceKind::Desktop);
        e.feed(&[0.2, 0.2], AudioSourceKind::Mic);
        let p = e.tick_at(1).unwrap(); // 48 frames due; 1 fed
        let s = payload_f32(&p);
        assert!((s[0] - 0.5).abs() < 1e-6); // 0.1 + 0.2·2.0
        assert!((s[1] - 0.5).abs() < 1e-6);
        // Frames past what was fed are silence.
        assert_eq!(s[2], 0.0);
    }

    #[test]
    fn mix_hard_clips() {
        let mut e = started(1.2);
        e.feed(&[0.9, -0.9], AudioSourceKind::Desktop);
        e.feed(&[0.9, -0.9], AudioSourceKind::Mic);
        let p = e.tick_at(1).unwrap();
        let s = payload_f32(&p);
        assert_eq!(s[0], 1.0);
        assert_eq!(s[1], -1.0);
    }

    #[test]
    fn late_burst_drops_oldest_and_stays_bounded() {
        // Mic lag scenario: a burst larger than the ring keeps only the
        // most recent ring-capacity frames; availability never exceeds the
        // cap.
        let cap_frames = 100;
        let mut e = AudioEngine::new(cap_frames, 1.0);
        e.start();
        let burst = vec![0.5f32; 300 * 2]; // 300 frames > 100-frame ring
        e.feed(&burst, AudioSourceKind::Mic);
        assert!(e.mic_available_frames() <= cap_frames);
        assert_eq!(e.dropped_samples(), 400); // 200 frames dropped
        // Emitted timeline still advances gap-free.
        let p = e.tick_at(10).unwrap();
        assert_eq!(p.pts, 0);
        assert_eq!(p.duration, 480);
    }

    #[test]
    fn feed_ignored_while_stopped() {
        let mut e = AudioEngine::new(64, 1.0);
        e.feed(&[0.1, 0.1], AudioSourceKind::Desktop);
        assert_eq!(e.frames_received(), 0);
        e.start();
        e.feed(&[0.1, 0.1], AudioSourceKind::Desktop);
        assert_eq!(e.frames_received(), 1);
        e.stop();
        assert!(e.tick_at(100).is_none());
    }

    #[test]
    fn payload_is_raw_f32_bytes() {
        let mut e = started(1.0);
        e.feed(&[0.25, -0.25], AudioSourceKind::Desktop);
        let p = e.tick_at(1).unwrap();
        assert_eq!(p.payload.len(), p.duration as usize * CHANNELS * 4);
        assert!(p.is_valid());
    }
}
