// crates/ionia-media/src/wasapi_capture.rs
//
// WASAPI adapters for the two audio sources: desktop loopback (capture on
// the default RENDER device — the only reliable way to grab system audio
// on Windows) and the default microphone.
//
// Shared-mode initialisation asks for 48 kHz stereo f32 first and falls
// back to the device mix format when refused. In "both" mode the
// microphone is first offered the desktop's chosen format so the two
// rings carry compatible data whenever the hardware allows it.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{anyhow, Result};
use wasapi::{
    initialize_mta, AudioCaptureClient, AudioClient, Device, DeviceEnumerator, Direction, Handle,
    SampleType as WasapiSampleType, StreamMode, WaveFormat,
};

use ionia_core::media_types::{AudioFormat, SampleEncoding, CHANNELS, SAMPLE_RATE};

use crate::capture::{AudioCaptureSource, AudioChunk};
use crate::config::CaptureMode;

pub struct WasapiSource {
    _audio_client: AudioClient,
    capture_client: AudioCaptureClient,
    event: Handle,
    format: AudioFormat,
    block_align: usize,
    /// Staging queue: WASAPI hands back device periods, we hand out one
    /// packet per event.
    staging: VecDeque<u8>,
    label: &'static str,
}

// The COM interfaces are only driven from the capture worker the source
// is moved into.
unsafe impl Send for WasapiSource {}

fn wave_format_to_descriptor(wf: &WaveFormat) -> AudioFormat {
    let encoding = match wf.get_subformat() {
        Ok(WasapiSampleType::Float) => SampleEncoding::F32,
        _ => match wf.get_bitspersample() {
            16 => SampleEncoding::I16,
            _ => SampleEncoding::I32,
        },
    };
    AudioFormat {
        sample_rate: wf.get_samplespersec(),
        channels: wf.get_nchannels(),
        encoding,
    }
}

fn desired_format() -> WaveFormat {
    WaveFormat::new(
        32,
        32,
        &WasapiSampleType::Float,
        SAMPLE_RATE as usize,
        CHANNELS,
        None,
    )
}

impl WasapiSource {
    fn open(
        device: &Device,
        preferred: Option<&WaveFormat>,
        label: &'static str,
    ) -> Result<(Self, WaveFormat)> {
        let mut audio_client = device
            .get_iaudioclient()
            .map_err(|e| anyhow!("{label}: audio client: {e}"))?;

        // Candidate formats in preference order; the first one the device
        // accepts in shared mode wins.
        let mut candidates: Vec<WaveFormat> = Vec::new();
        if let Some(p) = preferred {
            candidates.push(p.clone());
        }
        candidates.push(desired_format());
        if let Ok(mix) = audio_client.get_mixformat() {
            candidates.push(mix);
        }

        let mut chosen = None;
        for candidate in candidates {
            if audio_client.is_supported(&candidate, &Direction::Capture).is_ok() {
                chosen = Some(candidate);
                break;
            }
        }
        let chosen = chosen.ok_or_else(|| anyhow!("{label}: no supported shared-mode format"))?;

        let (_default_period, min_period) = audio_client
            .get_device_period()
            .map_err(|e| anyhow!("{label}: device period: {e}"))?;

        let mode = StreamMode::EventsShared {
            autoconvert: true,
            buffer_duration_hns: min_period,
        };
        audio_client
            .initialize_client(&chosen, &Direction::Capture, &mode)
            .map_err(|e| anyhow!("{label}: initialize client: {e}"))?;

        let event = audio_client
            .set_get_eventhandle()
            .map_err(|e| anyhow!("{label}: event handle: {e}"))?;
        let capture_client = audio_client
            .get_audiocaptureclient()
            .map_err(|e| anyhow!("{label}: capture client: {e}"))?;

        audio_client
            .start_stream()
            .map_err(|e| anyhow!("{label}: start stream: {e}"))?;

        let format = wave_format_to_descriptor(&chosen);
        let block_align = chosen.get_blockalign() as usize;
        log::info!(
            "[wasapi] {label}: {} Hz, {} ch, {:?}, block_align={block_align}",
            format.sample_rate,
            format.channels,
            format.encoding
        );

        Ok((
            Self {
                _audio_client: audio_client,
                capture_client,
                event,
                format,
                block_align,
                staging: VecDeque::new(),
                label,
            },
            chosen,
        ))
    }
}

impl AudioCaptureSource for WasapiSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read_packet(&mut self, timeout: Duration) -> Result<Option<AudioChunk>> {
        if self
            .event
            .wait_for_event(timeout.as_millis() as u32)
            .is_err()
        {
            return Ok(None); // timeout — caller polls the stop flag
        }

        let mut silent = false;
        let mut discontinuity = false;
        while let Ok(frames_next) = self.capture_client.get_next_nbr_frames() {
            match frames_next {
                Some(0) | None => break,
                Some(_) => {}
            }
            let (_frames, flags) = self
                .capture_client
                .read_from_device_to_deque(&mut self.staging)
                .map_err(|e| anyhow!("{}: read device buffer: {e}", self.label))?;
            silent |= flags.silent;
            discontinuity |= flags.data_discontinuity;
        }

        if self.staging.is_empty() {
            return Ok(None);
        }

        let bytes: Vec<u8> = self.staging.drain(..).collect();
        let frames = bytes.len() / self.block_align;
        // SILENT packets deliver zero-valued data of the correct length;
        // the deque read already gives us zeros in that case.
        Ok(Some(AudioChunk { bytes, frames, silent, discontinuity }))
    }
}

/// Open the sources for `mode`: (desktop loopback, microphone).
pub fn open_sources(
    mode: CaptureMode,
) -> Result<(Option<Box<dyn AudioCaptureSource>>, Option<Box<dyn AudioCaptureSource>>)> {
    // The capture workers run on their own threads, but device opening
    // happens here on the caller's thread: COM must be usable on it.
    // RPC_E_CHANGED_MODE (host already STA) is tolerated — WASAPI works
    // from STA, only the MF encoder does not.
    let _ = initialize_mta();

    let enumerator =
        DeviceEnumerator::new().map_err(|e| anyhow!("device enumerator: {e}"))?;

    let mut desktop = None;
    let mut desktop_format: Option<WaveFormat> = None;

    if mode.wants_desktop() {
        let device = enumerator
            .get_default_device(&Direction::Render)
            .map_err(|e| anyhow!("default render device: {e}"))?;
        if let Ok(name) = device.get_friendlyname() {
            log::info!("[wasapi] desktop loopback device: {name}");
        }
        let (source, chosen) = WasapiSource::open(&device, None, "desktop")?;
        desktop_format = Some(chosen);
        desktop = Some(Box::new(source) as Box<dyn AudioCaptureSource>);
    }

    let mut mic = None;
    if mode.wants_mic() {
        let device = enumerator
            .get_default_device(&Direction::Capture)
            .map_err(|e| anyhow!("default capture device: {e}"))?;
        if let Ok(name) = device.get_friendlyname() {
            log::info!("[wasapi] microphone device: {name}");
        }
        let (source, _) = WasapiSource::open(&device, desktop_format.as_ref(), "mic")?;
        mic = Some(Box::new(source) as Box<dyn AudioCaptureSource>);
    }

    Ok((desktop, mic))
}
