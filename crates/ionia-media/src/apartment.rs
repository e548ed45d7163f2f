// crates/ionia-media/src/apartment.rs
//
// COM apartment probe. When the host process has already initialised its
// apartment as single-threaded (Electron does), the Media Foundation H.264
// wrapper deadlocks on first encode. The probe detects STA up front so the
// encoder selection can refuse that backend with an actionable error
// instead of hanging.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApartmentMode {
    /// Single-threaded apartment: the MF H.264 wrapper must not be used.
    Sta,
    /// Multi-threaded apartment (or convertible to it).
    Mta,
    /// Not a COM platform, or the probe failed.
    Unknown,
}

impl fmt::Display for ApartmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApartmentMode::Sta => write!(f, "STA"),
            ApartmentMode::Mta => write!(f, "MTA"),
            ApartmentMode::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Probe the ambient apartment mode by attempting MTA initialisation.
/// "Changed mode" means the thread is already STA and cannot be converted.
#[cfg(windows)]
pub fn probe() -> ApartmentMode {
    use windows::Win32::System::Com::{
        CoInitializeEx, CoUninitialize, COINIT_MULTITHREADED,
    };

    const RPC_E_CHANGED_MODE: i32 = 0x8001_0106u32 as i32;

    unsafe {
        let hr = CoInitializeEx(None, COINIT_MULTITHREADED);
        if hr.0 == RPC_E_CHANGED_MODE {
            log::debug!("[apartment] STA detected (RPC_E_CHANGED_MODE)");
            return ApartmentMode::Sta;
        }
        if hr.is_ok() {
            // S_OK: we initialised it → undo. S_FALSE: already MTA.
            if hr.0 == 0 {
                CoUninitialize();
            }
            log::debug!("[apartment] MTA available (hr={:#x})", hr.0);
            return ApartmentMode::Mta;
        }
        log::warn!("[apartment] CoInitializeEx failed: {:#x}", hr.0);
        ApartmentMode::Unknown
    }
}

#[cfg(not(windows))]
pub fn probe() -> ApartmentMode {
    // No COM outside Windows; codec selection treats this as "no thread
    // affinity constraint".
    ApartmentMode::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_scripting_surface() {
        assert_eq!(ApartmentMode::Sta.to_string(), "STA");
        assert_eq!(ApartmentMode::Mta.to_string(), "MTA");
        assert_eq!(ApartmentMode::Unknown.to_string(), "UNKNOWN");
    }

    #[cfg(not(windows))]
    #[test]
    fn probe_is_unknown_off_windows() {
        assert_eq!(probe(), ApartmentMode::Unknown);
    }
}
