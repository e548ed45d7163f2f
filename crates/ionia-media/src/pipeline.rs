// crates/ionia-media/src/pipeline.rs
//
// Recorder: owns every component and every worker thread.
//
// State machine: Created → Initialised → Running → Stopping → Stopped.
// `initialise` wires components and surfaces configuration errors before
// any thread exists; `start` snapshots the clocks and spawns the workers;
// `stop` raises the global stop flag, joins workers in creation order,
// then finalises the sink.
//
// Worker inventory (all kernel threads; every concurrency source is an OS
// event or a periodic wake):
//
//   audio-capture-desktop  blocks on the loopback source, feeds the mixer
//   audio-capture-mic      symmetric for the microphone
//   audio-tick             drives the audio engine at AAC frame cadence
//                          (1024/48000 ≈ 21.333 ms) against a steady
//                          clock, encodes, writes to the sink
//   video-capture          blocks on desktop duplication (or the injected
//                          frame slot), pushes into the frame ring
//   video-tick             CFR encode loop with last-frame duplication
//   network-sender         streaming only: drains the stream buffer with
//                          real-time pacing
//
// Audio workers request time-critical scheduling from the OS.
//
// Ownership: codec contexts are moved INTO their producing worker and
// never shared; the muxer sits behind one mutex that the two tick workers
// and the network sender serialise through. Every cross-component
// reference is an Arc owned here and joined here — no component holds a
// handle to its consumer.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use ffmpeg_the_third as ffmpeg;

use ionia_core::engine::{AudioEngine, AudioSourceKind, DEFAULT_RING_FRAMES};
use ionia_core::media_types::{PipelineStats, SAMPLE_RATE};
use ionia_core::normalize;
use ionia_core::ring::FrameRing;
use ionia_core::video_clock::VideoClock;

use crate::apartment::{self, ApartmentMode};
use crate::audio_encoder::AacEncoder;
use crate::capture::{self, AudioCaptureSource, DesktopSource};
use crate::config::{OutputKind, RecorderConfig};
use crate::file_muxer::{FileMuxer, RawAacWriter};
use crate::stream_muxer::StreamMuxer;
use crate::video_encoder::H264Encoder;

/// Blocking OS waits use this timeout so workers poll the stop flag at
/// least this often.
const CAPTURE_WAIT: Duration = Duration::from_millis(100);

/// Video frame ring depth (~133 ms at 30 fps).
const FRAME_RING_SLOTS: usize = 4;

/// Catch-up iterations one audio tick wake may run.
const AUDIO_TICK_CATCHUP: u32 = 5;

/// How long `stop` keeps draining the stream buffer before closing.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Created,
    Initialised,
    Running,
    Stopping,
    Stopped,
}

/// Out-of-band notifications from workers to whoever drives the recorder.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A worker hit an unrecoverable error and raised the stop flag.
    Fatal(String),
    /// The network sink refused further writes.
    Disconnected,
}

enum Sink {
    Mp4(FileMuxer),
    Stream(StreamMuxer),
    RawAac(RawAacWriter),
}

#[derive(Default)]
struct Counters {
    video_frames: AtomicU64,
    video_packets: AtomicU64,
    audio_packets: AtomicU64,
    audio_frames_received: AtomicU64,
    audio_frames_encoded: AtomicU64,
    dropped_video: AtomicU64,
    dropped_audio: AtomicU64,
    frames_duplicated: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.video_frames.store(0, Ordering::Relaxed);
        self.video_packets.store(0, Ordering::Relaxed);
        self.audio_packets.store(0, Ordering::Relaxed);
        self.audio_frames_received.store(0, Ordering::Relaxed);
        self.audio_frames_encoded.store(0, Ordering::Relaxed);
        self.dropped_video.store(0, Ordering::Relaxed);
        self.dropped_audio.store(0, Ordering::Relaxed);
        self.frames_duplicated.store(0, Ordering::Relaxed);
    }
}

/// Latest-wins slot for test frame injection. Once enabled, the capture
/// worker stops consuming the real duplication source.
#[derive(Default)]
struct InjectSlot {
    enabled: bool,
    frame: Option<Vec<u8>>,
}

pub struct Recorder {
    config: RecorderConfig,
    state: RecorderState,
    apartment: ApartmentMode,
    encoder_name: String,

    stop_flag: Arc<AtomicBool>,
    engine: Arc<Mutex<AudioEngine>>,
    frame_ring: Arc<Mutex<FrameRing>>,
    inject: Arc<Mutex<InjectSlot>>,
    counters: Arc<Counters>,
    sink: Arc<Mutex<Sink>>,

    events_tx: Sender<PipelineEvent>,
    events_rx: Receiver<PipelineEvent>,

    // Held between initialise and start, then moved into their workers.
    audio_encoder: Option<AacEncoder>,
    video_encoder: Option<H264Encoder>,
    desktop_audio: Option<Box<dyn AudioCaptureSource>>,
    mic_audio: Option<Box<dyn AudioCaptureSource>>,
    desktop_video: Option<Box<dyn DesktopSource>>,

    workers: Vec<(String, JoinHandle<()>)>,
}

impl Recorder {
    /// Wire the full pipeline. Any configuration problem — bad options,
    /// missing encoder, unusable capture device — fails here; no partial
    /// pipeline survives an error.
    pub fn initialise(config: RecorderConfig) -> Result<Self> {
        config.validate().map_err(|e| anyhow::anyhow!("configuration: {e}"))?;

        ffmpeg::init().context("ffmpeg init")?;

        // Probe the ambient COM apartment BEFORE any codec is selected:
        // the MF H.264 wrapper must be refused under STA.
        let apartment = apartment::probe();
        log::info!("[recorder] apartment mode: {apartment}");

        let engine = AudioEngine::new(DEFAULT_RING_FRAMES, config.audio.mic_gain);
        let audio_encoder = AacEncoder::new(SAMPLE_RATE, config.audio.bitrate)?;

        let has_video = config.output != OutputKind::RawAac;
        let video_encoder = if has_video {
            Some(H264Encoder::new(&config.video, apartment)?)
        } else {
            None
        };
        let encoder_name = video_encoder
            .as_ref()
            .map(|e| e.codec_name().to_string())
            .unwrap_or_else(|| "aac".to_string());

        let frame_size = if has_video {
            (config.video.width * config.video.height * 4) as usize
        } else {
            4
        };
        let frame_ring = FrameRing::new(FRAME_RING_SLOTS, frame_size);

        let sink = match config.output {
            OutputKind::Mp4 => Sink::Mp4(FileMuxer::new(
                Path::new(&config.target),
                video_encoder.as_ref().expect("video encoder exists for mp4"),
                &audio_encoder,
            )?),
            OutputKind::Rtmp => Sink::Stream(StreamMuxer::new(
                &config.target,
                video_encoder.as_ref().expect("video encoder exists for rtmp"),
                &audio_encoder,
                config.stream_max_packets,
                config.stream_max_latency_ms,
            )?),
            OutputKind::RawAac => {
                Sink::RawAac(RawAacWriter::new(Path::new(&config.target), SAMPLE_RATE, 2)?)
            }
        };

        let (desktop_audio, mic_audio) = capture::open_audio_sources(config.mode)
            .context("open audio capture")?;

        // Desktop duplication can be absent (headless test hosts): the
        // video path then runs from injected frames only.
        let desktop_video = if has_video {
            match capture::open_desktop_source(config.video.width, config.video.height) {
                Ok(source) => Some(source),
                Err(e) => {
                    log::warn!("[recorder] desktop duplication unavailable ({e}); video requires injected frames");
                    None
                }
            }
        } else {
            None
        };

        let (events_tx, events_rx) = bounded(64);

        log::info!(
            "[recorder] initialised: mode={:?} output={:?} target='{}' encoder={}",
            config.mode,
            config.output,
            config.target,
            encoder_name
        );

        Ok(Self {
            config,
            state: RecorderState::Initialised,
            apartment,
            encoder_name,
            stop_flag: Arc::new(AtomicBool::new(false)),
            engine: Arc::new(Mutex::new(engine)),
            frame_ring: Arc::new(Mutex::new(frame_ring)),
            inject: Arc::new(Mutex::new(InjectSlot::default())),
            counters: Arc::new(Counters::default()),
            sink: Arc::new(Mutex::new(sink)),
            events_tx,
            events_rx,
            audio_encoder: Some(audio_encoder),
            video_encoder,
            desktop_audio,
            mic_audio,
            desktop_video,
            workers: Vec::new(),
        })
    }

    /// Zero the counters, snapshot the clocks, spawn the workers.
    pub fn start(&mut self) -> Result<()> {
        if self.state != RecorderState::Initialised {
            bail!("start() in state {:?}", self.state);
        }

        self.counters.reset();
        self.stop_flag.store(false, Ordering::SeqCst);
        self.engine.lock().unwrap().start();

        if let Some(source) = self.desktop_audio.take() {
            self.spawn_audio_capture("audio-capture-desktop", source, AudioSourceKind::Desktop)?;
        }
        if let Some(source) = self.mic_audio.take() {
            self.spawn_audio_capture("audio-capture-mic", source, AudioSourceKind::Mic)?;
        }

        let audio_encoder = self
            .audio_encoder
            .take()
            .ok_or_else(|| anyhow::anyhow!("audio encoder already consumed — recorder cannot be restarted"))?;
        self.spawn_audio_tick(audio_encoder)?;

        if let Some(video_encoder) = self.video_encoder.take() {
            let desktop = self.desktop_video.take();
            self.spawn_video_capture(desktop)?;
            self.spawn_video_tick(video_encoder)?;
        }

        if matches!(self.config.output, OutputKind::Rtmp) {
            self.spawn_network_sender()?;
        }

        self.state = RecorderState::Running;
        log::info!("[recorder] running with {} workers", self.workers.len());
        Ok(())
    }

    /// Raise the stop flag, join every worker in creation order, finalise
    /// the sink. Encoder flushes happen inside the tick workers on their
    /// way out, so by the time joins return the sink holds every packet.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != RecorderState::Running {
            bail!("stop() in state {:?}", self.state);
        }
        self.state = RecorderState::Stopping;
        self.stop_flag.store(true, Ordering::SeqCst);

        for (name, handle) in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("[recorder] worker '{name}' panicked");
            }
        }

        self.engine.lock().unwrap().stop();

        {
            let mut sink = self.sink.lock().unwrap();
            match &mut *sink {
                Sink::Mp4(muxer) => muxer.finalize()?,
                Sink::RawAac(writer) => writer.finalize()?,
                Sink::Stream(muxer) => {
                    drain_stream_with_pacing(muxer, DRAIN_DEADLINE);
                    muxer.close();
                }
            }
        }

        self.state = RecorderState::Stopped;
        log::info!("[recorder] stopped");
        Ok(())
    }

    /// Running and not mid-abort: a worker hitting a fatal error raises
    /// the stop flag, which this reflects before `stop()` is called.
    pub fn is_running(&self) -> bool {
        self.state == RecorderState::Running && !self.stop_flag.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn check_apartment_mode(&self) -> ApartmentMode {
        self.apartment
    }

    /// Divert the video path to injected frames (test affordance). The
    /// slot is latest-wins; the capture worker stops reading the real
    /// duplication source as soon as the first frame is injected.
    pub fn inject_frame(&self, rgba: Vec<u8>) -> Result<()> {
        let expected = self.frame_ring.lock().unwrap().frame_size();
        if rgba.len() != expected {
            bail!("injected frame is {} bytes, expected {expected}", rgba.len());
        }
        let mut slot = self.inject.lock().unwrap();
        slot.enabled = true;
        slot.frame = Some(rgba);
        Ok(())
    }

    pub fn set_debug_logging(enabled: bool) {
        log::set_max_level(if enabled {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        });
    }

    /// Drain one pending worker notification, if any.
    pub fn poll_event(&self) -> Option<PipelineEvent> {
        self.events_rx.try_recv().ok()
    }

    pub fn stats(&self) -> PipelineStats {
        let engine_dropped_frames = {
            let engine = self.engine.lock().unwrap();
            engine.dropped_samples() / 2
        };

        let (sink_dropped_video, sink_dropped_audio, total_bytes, backpressure) = {
            let sink = self.sink.lock().unwrap();
            match &*sink {
                Sink::Mp4(m) => (0, 0, m.total_bytes(), false),
                Sink::RawAac(w) => (0, 0, w.total_bytes(), false),
                Sink::Stream(s) => (
                    s.dropped_video(),
                    s.dropped_audio(),
                    s.total_bytes(),
                    s.is_backpressure(),
                ),
            }
        };

        PipelineStats {
            video_frames: self.counters.video_frames.load(Ordering::Relaxed),
            video_packets: self.counters.video_packets.load(Ordering::Relaxed),
            audio_packets: self.counters.audio_packets.load(Ordering::Relaxed),
            audio_frames_received: self.counters.audio_frames_received.load(Ordering::Relaxed),
            audio_frames_encoded: self.counters.audio_frames_encoded.load(Ordering::Relaxed),
            dropped_video: self.counters.dropped_video.load(Ordering::Relaxed) + sink_dropped_video,
            dropped_audio: self.counters.dropped_audio.load(Ordering::Relaxed)
                + engine_dropped_frames
                + sink_dropped_audio,
            frames_duplicated: self.counters.frames_duplicated.load(Ordering::Relaxed),
            total_bytes,
            backpressure,
            encoder_name: self.encoder_name.clone(),
        }
    }

    // ── Worker spawning ──────────────────────────────────────────────────

    fn spawn_audio_capture(
        &mut self,
        name: &str,
        source: Box<dyn AudioCaptureSource>,
        kind: AudioSourceKind,
    ) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        let counters = Arc::clone(&self.counters);
        let stop = Arc::clone(&self.stop_flag);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || audio_capture_worker(source, kind, engine, counters, stop))?;
        self.workers.push((name.to_string(), handle));
        Ok(())
    }

    fn spawn_audio_tick(&mut self, encoder: AacEncoder) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        let sink = Arc::clone(&self.sink);
        let counters = Arc::clone(&self.counters);
        let stop = Arc::clone(&self.stop_flag);
        let events = self.events_tx.clone();
        let handle = thread::Builder::new()
            .name("audio-tick".to_string())
            .spawn(move || audio_tick_worker(encoder, engine, sink, counters, stop, events))?;
        self.workers.push(("audio-tick".to_string(), handle));
        Ok(())
    }

    fn spawn_video_capture(&mut self, desktop: Option<Box<dyn DesktopSource>>) -> Result<()> {
        let ring = Arc::clone(&self.frame_ring);
        let inject = Arc::clone(&self.inject);
        let counters = Arc::clone(&self.counters);
        let stop = Arc::clone(&self.stop_flag);
        let handle = thread::Builder::new()
            .name("video-capture".to_string())
            .spawn(move || video_capture_worker(desktop, ring, inject, counters, stop))?;
        self.workers.push(("video-capture".to_string(), handle));
        Ok(())
    }

    fn spawn_video_tick(&mut self, encoder: H264Encoder) -> Result<()> {
        let ring = Arc::clone(&self.frame_ring);
        let sink = Arc::clone(&self.sink);
        let counters = Arc::clone(&self.counters);
        let stop = Arc::clone(&self.stop_flag);
        let events = self.events_tx.clone();
        let fps = self.config.video.fps;
        let handle = thread::Builder::new()
            .name("video-tick".to_string())
            .spawn(move || video_tick_worker(encoder, ring, sink, counters, stop, events, fps))?;
        self.workers.push(("video-tick".to_string(), handle));
        Ok(())
    }

    fn spawn_network_sender(&mut self) -> Result<()> {
        let sink = Arc::clone(&self.sink);
        let stop = Arc::clone(&self.stop_flag);
        let events = self.events_tx.clone();
        let handle = thread::Builder::new()
            .name("network-sender".to_string())
            .spawn(move || network_sender_worker(sink, stop, events))?;
        self.workers.push(("network-sender".to_string(), handle));
        Ok(())
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.state == RecorderState::Running {
            let _ = self.stop();
        }
    }
}

fn send_event(events: &Sender<PipelineEvent>, event: PipelineEvent) {
    if let Err(TrySendError::Disconnected(_)) = events.try_send(event) {
        // Recorder gone; nothing to notify.
    }
}

// ── Worker bodies ────────────────────────────────────────────────────────

fn audio_capture_worker(
    mut source: Box<dyn AudioCaptureSource>,
    kind: AudioSourceKind,
    engine: Arc<Mutex<AudioEngine>>,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
) {
    set_time_critical_priority();
    let format = source.format();
    log::debug!(
        "[audio-capture] {kind:?}: {} Hz, {} ch, {:?}",
        format.sample_rate,
        format.channels,
        format.encoding
    );

    while !stop.load(Ordering::Relaxed) {
        match source.read_packet(CAPTURE_WAIT) {
            Ok(Some(chunk)) => {
                if chunk.discontinuity {
                    log::warn!("[audio-capture] {kind:?}: data discontinuity");
                }
                match normalize::normalize(&chunk.bytes, chunk.frames, &format) {
                    Some(unified) => {
                        counters
                            .audio_frames_received
                            .fetch_add(unified.frames as u64, Ordering::Relaxed);
                        engine.lock().unwrap().feed(&unified.samples, kind);
                    }
                    None => {
                        counters
                            .dropped_audio
                            .fetch_add(chunk.frames as u64, Ordering::Relaxed);
                    }
                }
            }
            Ok(None) => {} // timeout; poll the stop flag
            Err(e) => {
                log::error!("[audio-capture] {kind:?}: {e}");
                thread::sleep(CAPTURE_WAIT);
            }
        }
    }
}

fn audio_tick_worker(
    mut encoder: AacEncoder,
    engine: Arc<Mutex<AudioEngine>>,
    sink: Arc<Mutex<Sink>>,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
    events: Sender<PipelineEvent>,
) {
    set_time_critical_priority();

    // One AAC frame of wall time per tick, scheduled against a steady
    // clock. Fixed sleeps under-produce when the OS timer granularity is
    // coarse; accumulating `next` and catching up (capped) keeps the
    // audio timeline at wall speed.
    let frame_ns = encoder.frame_size() as u64 * 1_000_000_000 / SAMPLE_RATE as u64;
    let tick = Duration::from_nanos(frame_ns);
    let mut next = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now < next {
            thread::sleep(next - now);
        }

        let mut catchups = 0;
        while Instant::now() >= next && catchups < AUDIO_TICK_CATCHUP && !stop.load(Ordering::Relaxed)
        {
            let packet = engine.lock().unwrap().tick();
            if let Some(packet) = packet {
                if let Err(e) = encode_and_write_audio(&mut encoder, &packet.payload, &sink, &counters)
                {
                    log::error!("[audio-tick] {e}");
                    send_event(&events, PipelineEvent::Fatal(e.to_string()));
                    stop.store(true, Ordering::SeqCst);
                    break;
                }
            }
            next += tick;
            catchups += 1;
        }
    }

    // Residual ≥ one frame is encoded; anything shorter is discarded and
    // the codec's internal frames are drained.
    match encoder.flush() {
        Ok(packets) => {
            for packet in &packets {
                counters
                    .audio_frames_encoded
                    .fetch_add(packet.num_samples as u64, Ordering::Relaxed);
                if write_audio_packet(packet, &sink, &counters).is_err() {
                    break;
                }
            }
        }
        Err(e) => log::error!("[audio-tick] flush: {e}"),
    }
}

fn encode_and_write_audio(
    encoder: &mut AacEncoder,
    payload: &[u8],
    sink: &Arc<Mutex<Sink>>,
    counters: &Arc<Counters>,
) -> anyhow::Result<()> {
    let samples: Vec<f32> = payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    for packet in encoder.encode(&samples)? {
        counters
            .audio_frames_encoded
            .fetch_add(packet.num_samples as u64, Ordering::Relaxed);
        write_audio_packet(&packet, sink, counters)?;
    }
    Ok(())
}

fn write_audio_packet(
    packet: &ionia_core::media_types::EncodedAudioPacket,
    sink: &Arc<Mutex<Sink>>,
    counters: &Arc<Counters>,
) -> anyhow::Result<()> {
    let written = {
        let mut sink = sink.lock().unwrap();
        match &mut *sink {
            Sink::Mp4(muxer) => muxer.write_audio(packet)?,
            Sink::Stream(muxer) => muxer.write_audio(packet)?,
            Sink::RawAac(writer) => {
                writer.write(packet)?;
                true
            }
        }
    };
    if written {
        counters.audio_packets.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

fn video_capture_worker(
    mut desktop: Option<Box<dyn DesktopSource>>,
    ring: Arc<Mutex<FrameRing>>,
    inject: Arc<Mutex<InjectSlot>>,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
) {
    let frame_size = ring.lock().unwrap().frame_size();
    let mut frame = vec![0u8; frame_size];

    while !stop.load(Ordering::Relaxed) {
        let injecting = {
            let mut slot = inject.lock().unwrap();
            if slot.enabled {
                match slot.frame.take() {
                    Some(injected) if injected.len() == frame_size => {
                        frame.copy_from_slice(&injected);
                        Some(true)
                    }
                    _ => Some(false),
                }
            } else {
                None
            }
        };

        let captured = match injecting {
            Some(true) => true,
            Some(false) => {
                thread::sleep(Duration::from_millis(1));
                false
            }
            None => match desktop.as_mut() {
                Some(source) => match source.acquire_frame(&mut frame, CAPTURE_WAIT) {
                    Ok(true) => true,
                    Ok(false) => false,
                    Err(e) => {
                        log::error!("[video-capture] {e}");
                        thread::sleep(CAPTURE_WAIT);
                        false
                    }
                },
                None => {
                    // No duplication source and nothing injected yet.
                    thread::sleep(Duration::from_millis(5));
                    false
                }
            },
        };

        if captured {
            if ring.lock().unwrap().push(&frame) {
                counters.video_frames.fetch_add(1, Ordering::Relaxed);
            } else {
                // Ring full: the new frame loses to older, causally
                // earlier frames.
                counters.dropped_video.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn video_tick_worker(
    mut encoder: H264Encoder,
    ring: Arc<Mutex<FrameRing>>,
    sink: Arc<Mutex<Sink>>,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
    events: Sender<PipelineEvent>,
    fps: u32,
) {
    let mut clock = VideoClock::new(fps);
    clock.start();

    let frame_size = ring.lock().unwrap().frame_size();
    let mut frame = vec![0u8; frame_size];

    while !stop.load(Ordering::Relaxed) {
        let expected = clock.expected_frame();
        if clock.frame_number() >= expected {
            thread::sleep(Duration::from_millis(1));
            continue;
        }

        while clock.frame_number() < expected && !stop.load(Ordering::Relaxed) {
            let fresh = ring.lock().unwrap().pop_into(&mut frame);
            if !fresh {
                if ring.lock().unwrap().last_into(&mut frame) {
                    // Capture is lagging: repeating the last frame keeps
                    // the timeline advancing at exactly 1/fps.
                    counters.frames_duplicated.fetch_add(1, Ordering::Relaxed);
                } else {
                    // Nothing captured yet at all: black.
                    frame.fill(0);
                }
            }

            match encoder.encode(&frame) {
                Ok(packets) => {
                    let frame_index = clock.frame_number() as i64;
                    for packet in &packets {
                        if let Err(e) = write_video_packet(packet, frame_index, &sink, &counters) {
                            log::error!("[video-tick] {e}");
                            send_event(&events, PipelineEvent::Fatal(e.to_string()));
                            stop.store(true, Ordering::SeqCst);
                            break;
                        }
                    }
                }
                Err(e) => {
                    log::error!("[video-tick] encode: {e}");
                    send_event(&events, PipelineEvent::Fatal(e.to_string()));
                    stop.store(true, Ordering::SeqCst);
                    break;
                }
            }
            clock.advance();
        }
    }

    // Drain the codec. Late packets belong to frames that already have
    // indices behind them, so they continue the monotonic sequence.
    match encoder.flush() {
        Ok(packets) => {
            for packet in &packets {
                let frame_index = clock.frame_number() as i64;
                if write_video_packet(packet, frame_index, &sink, &counters).is_err() {
                    break;
                }
                clock.advance();
            }
        }
        Err(e) => log::error!("[video-tick] flush: {e}"),
    }
}

fn write_video_packet(
    packet: &ionia_core::media_types::EncodedVideoPacket,
    frame_index: i64,
    sink: &Arc<Mutex<Sink>>,
    counters: &Arc<Counters>,
) -> anyhow::Result<()> {
    let written = {
        let mut sink = sink.lock().unwrap();
        match &mut *sink {
            Sink::Mp4(muxer) => muxer.write_video(packet, frame_index)?,
            Sink::Stream(muxer) => muxer.write_video(packet, frame_index)?,
            Sink::RawAac(_) => false,
        }
    };
    if written {
        counters.video_packets.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

fn network_sender_worker(
    sink: Arc<Mutex<Sink>>,
    stop: Arc<AtomicBool>,
    events: Sender<PipelineEvent>,
) {
    let mut pacing = Pacing::new();
    let mut reported_disconnect = false;

    while !stop.load(Ordering::Relaxed) {
        let popped = {
            let mut sink = sink.lock().unwrap();
            match &mut *sink {
                Sink::Stream(muxer) => muxer.next_packet(),
                _ => None,
            }
        };

        match popped {
            None => thread::sleep(Duration::from_millis(1)),
            Some((packet, dts_us)) => {
                // Sleep OUTSIDE the sink lock so the tick workers keep
                // queueing while we pace.
                pacing.wait_until_due(dts_us);

                let sent = {
                    let mut sink = sink.lock().unwrap();
                    match &mut *sink {
                        Sink::Stream(muxer) => muxer.send_packet(&packet),
                        _ => false,
                    }
                };
                if !sent && !reported_disconnect {
                    send_event(&events, PipelineEvent::Disconnected);
                    reported_disconnect = true;
                }
            }
        }
    }
}

/// Real-time sender pacing: without it the network drains the buffer
/// faster than real time and playback audibly accelerates.
struct Pacing {
    stream_start: Option<Instant>,
    first_dts_us: i64,
}

impl Pacing {
    const TOLERANCE_US: i64 = 2_000;
    const MAX_SLEEP_US: i64 = 250_000;

    fn new() -> Self {
        Self { stream_start: None, first_dts_us: 0 }
    }

    fn wait_until_due(&mut self, dts_us: i64) {
        match self.stream_start {
            None => {
                self.stream_start = Some(Instant::now());
                self.first_dts_us = dts_us;
            }
            Some(start) => {
                let target = dts_us - self.first_dts_us;
                let elapsed = start.elapsed().as_micros() as i64;
                if target > elapsed + Self::TOLERANCE_US {
                    let sleep_us = (target - elapsed).min(Self::MAX_SLEEP_US);
                    thread::sleep(Duration::from_micros(sleep_us as u64));
                }
            }
        }
    }
}

/// Final drain at stop: keep sending due packets (still paced, so the tail
/// doesn't arrive time-compressed) until the buffer is dry or the deadline
/// passes.
fn drain_stream_with_pacing(muxer: &mut StreamMuxer, deadline: Duration) {
    let until = Instant::now() + deadline;
    let mut pacing = Pacing::new();

    while Instant::now() < until {
        match muxer.next_packet() {
            // Dry, disconnected, or the header never arrived (nothing
            // queued can ever be sent) — all final states here.
            None => break,
            Some((packet, dts_us)) => {
                pacing.wait_until_due(dts_us);
                if !muxer.send_packet(&packet) {
                    break;
                }
            }
        }
    }
}

/// Audio workers ask the OS for time-critical scheduling; failure is
/// logged and ignored (unprivileged processes often may not).
#[cfg(target_os = "linux")]
fn set_time_critical_priority() {
    let result = unsafe {
        let param = libc::sched_param { sched_priority: 80 };
        libc::sched_setscheduler(0, libc::SCHED_FIFO, &param)
    };
    if result != 0 {
        log::debug!(
            "[recorder] realtime scheduling unavailable: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(windows)]
fn set_time_critical_priority() {
    use windows::Win32::System::Threading::{
        GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_TIME_CRITICAL,
    };
    unsafe {
        if SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_TIME_CRITICAL).is_err() {
            log::debug!("[recorder] SetThreadPriority failed");
        }
    }
}

#[cfg(not(any(target_os = "linux", windows)))]
fn set_time_critical_priority() {}
