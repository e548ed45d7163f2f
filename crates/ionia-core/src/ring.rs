// crates/ionia-core/src/ring.rs
//
// The two bounded buffers that decouple capture from the clock masters.
// Their overflow policies differ on purpose:
//
//   SampleRing (audio)  — drop the OLDEST samples to make room. Keeping the
//                         most recent audio is perceptually correct for a
//                         live stream; stale audio would add latency that
//                         never drains.
//   FrameRing  (video)  — REJECT the new frame. Older frames are closer in
//                         time to the next expected encode slot, so they
//                         win over a late arrival.

use std::collections::VecDeque;

/// Interleaved f32 sample FIFO with a hard cap and drop-oldest overflow.
pub struct SampleRing {
    buf: VecDeque<f32>,
    cap_samples: usize,
    dropped_samples: u64,
}

impl SampleRing {
    /// `cap_frames` is the capacity in stereo frames (2 samples each).
    pub fn new(cap_frames: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap_frames * 2),
            cap_samples: cap_frames * 2,
            dropped_samples: 0,
        }
    }

    /// Append interleaved samples, evicting from the front on overflow.
    pub fn push(&mut self, samples: &[f32]) {
        let incoming = samples.len().min(self.cap_samples);
        // A single chunk larger than the whole ring keeps only its tail.
        let skipped = samples.len() - incoming;
        self.dropped_samples += skipped as u64;

        let excess = (self.buf.len() + incoming).saturating_sub(self.cap_samples);
        if excess > 0 {
            self.buf.drain(..excess);
            self.dropped_samples += excess as u64;
        }
        self.buf.extend(&samples[skipped..]);
    }

    /// Samples currently buffered.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Stereo frames currently buffered.
    pub fn frames_available(&self) -> usize {
        self.buf.len() / 2
    }

    pub fn get(&self, idx: usize) -> Option<f32> {
        self.buf.get(idx).copied()
    }

    /// Remove up to `n` samples from the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Samples evicted by overflow since construction.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples
    }
}

/// Fixed-capacity ring of captured RGBA frames.
///
/// `push` copies into the next write slot and rejects when full. `last_into`
/// returns the most recently pushed frame even after it has been popped —
/// the video engine duplicates it when capture lags.
pub struct FrameRing {
    slots: Vec<Vec<u8>>,
    frame_size: usize,
    read: usize,
    write: usize,
    len: usize,
    last: Option<usize>,
}

impl FrameRing {
    pub fn new(capacity: usize, frame_size: usize) -> Self {
        Self {
            slots: vec![vec![0u8; frame_size]; capacity],
            frame_size,
            read: 0,
            write: 0,
            len: 0,
            last: None,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Copy `frame` into the ring. Returns false (frame rejected) when the
    /// ring is full or the frame has the wrong size.
    pub fn push(&mut self, frame: &[u8]) -> bool {
        if frame.len() != self.frame_size || self.len == self.slots.len() {
            return false;
        }
        self.slots[self.write].copy_from_slice(frame);
        self.last = Some(self.write);
        self.write = (self.write + 1) % self.slots.len();
        self.len += 1;
        true
    }

    /// Copy the oldest frame into `out` and advance the read index.
    pub fn pop_into(&mut self, out: &mut [u8]) -> bool {
        if self.len == 0 || out.len() != self.frame_size {
            return false;
        }
        out.copy_from_slice(&self.slots[self.read]);
        self.read = (self.read + 1) % self.slots.len();
        self.len -= 1;
        true
    }

    /// Copy the most recently pushed frame into `out`. Fails only if no
    /// frame has ever been pushed.
    pub fn last_into(&self, out: &mut [u8]) -> bool {
        match self.last {
            Some(idx) if out.len() == self.frame_size => {
                out.copy_from_slice(&self.slots[idx]);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_ring_drops_oldest_on_overflow() {
        let mut ring = SampleRing::new(2); // 4 samples
        ring.push(&[1.0, 2.0, 3.0, 4.0]);
        ring.push(&[5.0, 6.0]);
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.get(0), Some(3.0)); // 1.0, 2.0 evicted
        assert_eq!(ring.get(3), Some(6.0));
        assert_eq!(ring.dropped_samples(), 2);
    }

    #[test]
    fn sample_ring_oversized_chunk_keeps_tail() {
        let mut ring = SampleRing::new(1); // 2 samples
        ring.push(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.get(0), Some(3.0));
        assert_eq!(ring.dropped_samples(), 2);
    }

    #[test]
    fn sample_ring_consume_bounds() {
        let mut ring = SampleRing::new(4);
        ring.push(&[1.0, 2.0, 3.0, 4.0]);
        ring.consume(3);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.get(0), Some(4.0));
        ring.consume(10); // over-consume is clamped
        assert!(ring.is_empty());
    }

    #[test]
    fn frame_ring_rejects_when_full() {
        let mut ring = FrameRing::new(2, 4);
        assert!(ring.push(&[1; 4]));
        assert!(ring.push(&[2; 4]));
        assert!(!ring.push(&[3; 4])); // full → new frame rejected
        assert_eq!(ring.len(), 2);

        let mut out = vec![0u8; 4];
        assert!(ring.pop_into(&mut out));
        assert_eq!(out, vec![1; 4]); // oldest preserved
    }

    #[test]
    fn frame_ring_fifo_order() {
        let mut ring = FrameRing::new(3, 2);
        ring.push(&[1; 2]);
        ring.push(&[2; 2]);
        let mut out = vec![0u8; 2];
        assert!(ring.pop_into(&mut out));
        assert_eq!(out, vec![1; 2]);
        ring.push(&[3; 2]);
        assert!(ring.pop_into(&mut out));
        assert_eq!(out, vec![2; 2]);
        assert!(ring.pop_into(&mut out));
        assert_eq!(out, vec![3; 2]);
        assert!(!ring.pop_into(&mut out));
    }

    #[test]
    fn frame_ring_last_survives_pop() {
        let mut ring = FrameRing::new(2, 2);
        let mut out = vec![0u8; 2];
        assert!(!ring.last_into(&mut out)); // nothing ever pushed

        ring.push(&[7; 2]);
        assert!(ring.pop_into(&mut out));
        assert!(ring.is_empty());
        assert!(ring.last_into(&mut out));
        assert_eq!(out, vec![7; 2]);
    }

    #[test]
    fn frame_ring_rejects_wrong_size() {
        let mut ring = FrameRing::new(2, 4);
        assert!(!ring.push(&[0; 3]));
    }
}
