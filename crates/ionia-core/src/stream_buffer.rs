// crates/ionia-core/src/stream_buffer.rs
//
// Bounded multi-stream queue between the muxer and the network sender.
//
// Packets are held sorted by DTS converted to MICROSECONDS through each
// packet's own stream time base — millisecond resolution produces ties
// between audio (21.333 ms cadence) and video (33 ms cadence) that break
// the ordering. Latency is the DTS span between the newest and oldest
// queued packet; no wall clock is involved.
//
// Overflow and overdue admission both apply the same policy, in order:
//   1. drop one video non-keyframe from anywhere in the queue, recheck
//   2. still inadmissible → refuse the incoming packet
// Audio and keyframes are never dropped: losing audio is audible and
// losing a keyframe stalls decode until the next GOP.

use std::collections::VecDeque;

/// One queued packet, timestamps already rescaled into its stream's time
/// base. `time_base` is (num, den).
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    pub payload: Vec<u8>,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub stream_index: usize,
    pub time_base: (i32, i32),
    pub is_video: bool,
    pub is_keyframe: bool,
}

impl QueuedPacket {
    /// DTS in microseconds — the cross-stream ordering key.
    pub fn dts_us(&self) -> i64 {
        let (num, den) = self.time_base;
        if den == 0 {
            return 0;
        }
        (self.dts as i128 * num as i128 * 1_000_000 / den as i128) as i64
    }
}

#[derive(Debug)]
struct Entry {
    packet: QueuedPacket,
    dts_us: i64,
}

pub struct StreamBuffer {
    entries: VecDeque<Entry>,
    max_size: usize,
    max_latency_ms: i64,
    added: u64,
    dropped_video: u64,
    dropped_audio: u64,
}

impl StreamBuffer {
    pub fn new(max_size: usize, max_latency_ms: i64) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_size),
            max_size,
            max_latency_ms,
            added: 0,
            dropped_video: 0,
            dropped_audio: 0,
        }
    }

    /// DTS span of the queue in milliseconds.
    pub fn latency_ms(&self) -> i64 {
        match (self.entries.front(), self.entries.back()) {
            (Some(front), Some(back)) => (back.dts_us - front.dts_us) / 1000,
            _ => 0,
        }
    }

    /// Drop the first video non-keyframe found, front to back.
    /// Returns true if one was dropped.
    fn drop_one_video_nonkey(&mut self) -> bool {
        if let Some(idx) = self
            .entries
            .iter()
            .position(|e| e.packet.is_video && !e.packet.is_keyframe)
        {
            let _ = self.entries.remove(idx);
            self.dropped_video += 1;
            true
        } else {
            false
        }
    }

    fn count_refusal(&mut self, packet: &QueuedPacket) {
        if packet.is_video {
            self.dropped_video += 1;
        } else {
            self.dropped_audio += 1;
        }
    }

    /// Admit `packet`, applying the drop policy on overflow or overdue
    /// latency. Returns false when the packet was refused.
    pub fn push(&mut self, packet: QueuedPacket) -> bool {
        if self.entries.len() >= self.max_size {
            self.drop_one_video_nonkey();
            if self.entries.len() >= self.max_size {
                self.count_refusal(&packet);
                return false;
            }
        }

        if self.latency_ms() > self.max_latency_ms {
            log::warn!(
                "[stream-buffer] latency {} ms over budget {} ms, dropping a video frame",
                self.latency_ms(),
                self.max_latency_ms
            );
            self.drop_one_video_nonkey();
            if self.latency_ms() > self.max_latency_ms {
                self.count_refusal(&packet);
                return false;
            }
        }

        let dts_us = packet.dts_us();
        let idx = self.entries.partition_point(|e| e.dts_us <= dts_us);
        self.entries.insert(idx, Entry { packet, dts_us });
        self.added += 1;
        true
    }

    /// Lowest-DTS packet, with its microsecond key for sender pacing.
    pub fn pop_front(&mut self) -> Option<(QueuedPacket, i64)> {
        self.entries.pop_front().map(|e| (e.packet, e.dts_us))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_backpressure(&self) -> bool {
        self.entries.len() >= self.max_size || self.latency_ms() > self.max_latency_ms
    }

    pub fn added(&self) -> u64 {
        self.added
    }

    pub fn dropped_video(&self) -> u64 {
        self.dropped_video
    }

    pub fn dropped_audio(&self) -> u64 {
        self.dropped_audio
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(dts: i64, key: bool) -> QueuedPacket {
        QueuedPacket {
            payload: vec![0xAA; 16],
            pts: dts,
            dts,
            duration: 33,
            stream_index: 0,
            time_base: (1, 1000),
            is_video: true,
            is_keyframe: key,
        }
    }

    fn audio(dts: i64) -> QueuedPacket {
        QueuedPacket {
            payload: vec![0xBB; 8],
            pts: dts,
            dts,
            duration: 21,
            stream_index: 1,
            time_base: (1, 1000),
            is_video: false,
            is_keyframe: false,
        }
    }

    #[test]
    fn dts_us_uses_the_packet_time_base() {
        // 1/1000: 33 → 33 000 µs. 1/48000: 1024 samples → 21 333 µs.
        assert_eq!(video(33, false).dts_us(), 33_000);
        let mut a = audio(1024);
        a.time_base = (1, 48_000);
        assert_eq!(a.dts_us(), 21_333);
    }

    #[test]
    fn pop_returns_lowest_dts_across_streams() {
        let mut buf = StreamBuffer::new(16, 10_000);
        assert!(buf.push(video(33, true)));
        let mut a = audio(1024);
        a.time_base = (1, 48_000); // 21.333 ms < 33 ms
        assert!(buf.push(a));
        assert!(buf.push(video(66, false)));

        let (first, us) = buf.pop_front().unwrap();
        assert!(!first.is_video);
        assert_eq!(us, 21_333);
        assert_eq!(buf.pop_front().unwrap().1, 33_000);
        assert_eq!(buf.pop_front().unwrap().1, 66_000);
        assert!(buf.pop_front().is_none());
    }

    #[test]
    fn insert_is_sorted_even_for_out_of_order_arrival() {
        let mut buf = StreamBuffer::new(16, 10_000);
        buf.push(video(100, false));
        buf.push(video(50, false));
        buf.push(video(75, false));
        let order: Vec<i64> = std::iter::from_fn(|| buf.pop_front().map(|(p, _)| p.dts)).collect();
        assert_eq!(order, vec![50, 75, 100]);
    }

    #[test]
    fn overflow_drops_video_nonkey_first() {
        // The backpressure-drop scenario: fill with non-keyframes, then
        // demand admission for audio and a keyframe.
        let mut buf = StreamBuffer::new(10, 1_000_000);
        for i in 0..20 {
            buf.push(video(i, false));
        }
        assert_eq!(buf.len(), 10);
        assert!(buf.dropped_video() >= 1);

        assert!(buf.push(audio(5)));
        assert!(buf.push(video(21, true)));
        assert!(buf.len() <= 10);
    }

    #[test]
    fn audio_and_keyframes_survive_a_full_queue() {
        let mut buf = StreamBuffer::new(4, 1_000_000);
        buf.push(audio(1));
        buf.push(video(2, true));
        buf.push(audio(3));
        buf.push(video(4, true));
        // Queue full of undroppables: the incoming packet is refused, the
        // queue keeps what it has.
        assert!(!buf.push(video(5, false)));
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.dropped_video(), 1);
        let kinds: Vec<bool> =
            std::iter::from_fn(|| buf.pop_front().map(|(p, _)| p.is_video)).collect();
        assert_eq!(kinds, vec![false, true, false, true]);
    }

    #[test]
    fn refused_audio_is_counted_separately() {
        let mut buf = StreamBuffer::new(2, 1_000_000);
        buf.push(audio(1));
        buf.push(audio(2));
        assert!(!buf.push(audio(3)));
        assert_eq!(buf.dropped_audio(), 1);
        assert_eq!(buf.dropped_video(), 0);
    }

    #[test]
    fn latency_gate_drops_then_refuses() {
        let mut buf = StreamBuffer::new(100, 50); // 50 ms budget
        buf.push(audio(0));
        buf.push(video(30, false));
        buf.push(audio(100)); // span now 100 ms
        // Next push: over budget → the one non-keyframe goes; span still
        // 100 ms (audio at both ends) → refuse.
        assert!(!buf.push(audio(110)));
        assert_eq!(buf.dropped_video(), 1);
        assert_eq!(buf.dropped_audio(), 1);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn admission_invariant_holds_after_every_successful_push() {
        let mut buf = StreamBuffer::new(8, 500);
        for i in 0..50 {
            let accepted = buf.push(video(i * 40, i % 10 == 0));
            if accepted {
                assert!(buf.len() <= 8);
            }
        }
    }

    #[test]
    fn backpressure_reflects_size_and_latency() {
        let mut buf = StreamBuffer::new(2, 1_000);
        assert!(!buf.is_backpressure());
        buf.push(audio(0));
        buf.push(audio(10));
        assert!(buf.is_backpressure()); // size

        let mut buf = StreamBuffer::new(100, 10);
        buf.push(audio(0));
        buf.push(audio(1000));
        assert!(buf.is_backpressure()); // latency
    }

    #[test]
    fn counters_track_added_packets() {
        let mut buf = StreamBuffer::new(4, 1_000_000);
        buf.push(audio(1));
        buf.push(video(2, true));
        assert_eq!(buf.added(), 2);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.added(), 2); // counters survive clear
    }
}
