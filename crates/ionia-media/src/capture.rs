// crates/ionia-media/src/capture.rs
//
// Seams to the OS capture services. The pipeline only ever talks to these
// two traits; the WASAPI and desktop-duplication implementations live
// behind #[cfg(windows)] and the injected source stands in for tests and
// headless runs.

use std::time::Duration;

use anyhow::Result;
use ionia_core::media_types::AudioFormat;

use crate::config::CaptureMode;

/// One delivered audio packet in the device's NATIVE format; the pipeline
/// normalises it before mixing.
pub struct AudioChunk {
    pub bytes: Vec<u8>,
    pub frames: usize,
    /// SILENT flag: `bytes` is zero-filled of the correct length.
    pub silent: bool,
    /// DISCONTINUITY flag: logged by the worker and otherwise ignored —
    /// the mixer's silence-fill already papers over the gap.
    pub discontinuity: bool,
}

/// An OS audio capture session (desktop loopback or microphone).
///
/// Implementations block in `read_packet` up to `timeout` (the worker uses
/// 100 ms so the stop flag is polled between waits) and own their native
/// device handles.
pub trait AudioCaptureSource: Send {
    fn format(&self) -> AudioFormat;
    fn read_packet(&mut self, timeout: Duration) -> Result<Option<AudioChunk>>;
}

/// An OS desktop-duplication session.
///
/// `acquire_frame` blocks up to `timeout` and, on success, fills `out` with
/// tightly packed RGBA (the adapter swaps BGRA→RGBA and strips row pitch).
/// Access loss is recovered internally by recreating the duplication
/// handle.
pub trait DesktopSource: Send {
    fn dimensions(&self) -> (u32, u32);
    fn acquire_frame(&mut self, out: &mut [u8], timeout: Duration) -> Result<bool>;
}

/// Build the audio sources for `mode`. In "both" mode the microphone is
/// asked to open in the desktop's chosen format first so the two rings feed
/// compatible data without a second resample.
#[cfg(windows)]
pub fn open_audio_sources(
    mode: CaptureMode,
) -> Result<(Option<Box<dyn AudioCaptureSource>>, Option<Box<dyn AudioCaptureSource>>)> {
    crate::wasapi_capture::open_sources(mode)
}

#[cfg(not(windows))]
pub fn open_audio_sources(
    mode: CaptureMode,
) -> Result<(Option<Box<dyn AudioCaptureSource>>, Option<Box<dyn AudioCaptureSource>>)> {
    let _ = mode;
    anyhow::bail!("audio capture requires the Windows audio session API (WASAPI)");
}

#[cfg(windows)]
pub fn open_desktop_source(width: u32, height: u32) -> Result<Box<dyn DesktopSource>> {
    Ok(Box::new(crate::duplication::DxgiDuplication::new(width, height)?))
}

#[cfg(not(windows))]
pub fn open_desktop_source(width: u32, height: u32) -> Result<Box<dyn DesktopSource>> {
    let _ = (width, height);
    anyhow::bail!("desktop capture requires DXGI desktop duplication");
}

/// Swap BGRA rows with a source pitch into tightly packed RGBA.
/// Shared by the duplication adapter and anything replaying raw captures.
pub fn bgra_to_rgba_packed(src: &[u8], src_pitch: usize, width: u32, height: u32, out: &mut [u8]) {
    let row_bytes = width as usize * 4;
    debug_assert!(out.len() >= row_bytes * height as usize);
    for row in 0..height as usize {
        let s = &src[row * src_pitch..row * src_pitch + row_bytes];
        let d = &mut out[row * row_bytes..(row + 1) * row_bytes];
        for px in 0..width as usize {
            d[px * 4] = s[px * 4 + 2]; // R ← B slot
            d[px * 4 + 1] = s[px * 4 + 1];
            d[px * 4 + 2] = s[px * 4]; // B ← R slot
            d[px * 4 + 3] = s[px * 4 + 3];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgra_swap_and_pitch_strip() {
        // 2×2 BGRA with a 12-byte pitch (4 bytes padding per row).
        let mut src = vec![0u8; 24];
        // Pixel (0,0): B=1 G=2 R=3 A=4.
        src[0] = 1;
        src[1] = 2;
        src[2] = 3;
        src[3] = 4;
        // Pixel (1,1): B=5 G=6 R=7 A=8 at row 1, col 1.
        src[12 + 4] = 5;
        src[12 + 5] = 6;
        src[12 + 6] = 7;
        src[12 + 7] = 8;

        let mut out = vec![0u8; 16];
        bgra_to_rgba_packed(&src, 12, 2, 2, &mut out);
        assert_eq!(&out[0..4], &[3, 2, 1, 4]); // RGBA
        assert_eq!(&out[12..16], &[7, 6, 5, 8]);
    }
}
