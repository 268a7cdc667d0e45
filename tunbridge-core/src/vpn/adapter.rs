//! Wintun virtual network adapter management.
//!
//! REQUIREMENTS:
//! - wintun.dll must be present next to the executable (or in the
//!   current directory)
//! - Administrator privileges are required to create the adapter

use std::path::{Path, PathBuf};
use std::sync::Arc;

use wintun::{Adapter, Session};

use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Security::{GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY};
use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

use super::{VpnError, VpnResult};

/// Tunnel type recorded with the adapter.
const TUNNEL_TYPE: &str = "TunBridge";

/// Stable adapter GUID so Windows keeps per-interface settings across
/// sessions.
const TUNNEL_GUID: u128 = 0x53bded60_b6c8_49ab_8612_6fa5568fc54d;

/// Ring buffer capacity for the packet session.
pub const RING_CAPACITY: u32 = 0x20000;

/// Process access token, closed on scope exit.
struct ProcessToken(HANDLE);

impl ProcessToken {
    fn open_for_query() -> VpnResult<Self> {
        let mut handle = HANDLE::default();
        unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut handle) }
            .map_err(|e| VpnError::com("OpenProcessToken", e))?;
        Ok(Self(handle))
    }

    fn is_elevated(&self) -> VpnResult<bool> {
        let mut elevation = TOKEN_ELEVATION::default();
        let mut size = 0u32;
        unsafe {
            GetTokenInformation(
                self.0,
                TokenElevation,
                Some((&mut elevation as *mut TOKEN_ELEVATION).cast()),
                std::mem::size_of::<TOKEN_ELEVATION>() as u32,
                &mut size,
            )
        }
        .map_err(|e| VpnError::com("GetTokenInformation(TokenElevation)", e))?;
        Ok(elevation.TokenIsElevated != 0)
    }
}

impl Drop for ProcessToken {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

/// Require an elevated process before any system state is touched. A
/// failed token query counts as "not elevated".
pub(crate) fn ensure_elevated() -> VpnResult<()> {
    let elevated = ProcessToken::open_for_query()
        .and_then(|token| token.is_elevated())
        .unwrap_or_else(|e| {
            log::warn!("adapter: elevation query failed ({e}); assuming not elevated");
            false
        });
    if elevated {
        Ok(())
    } else {
        Err(VpnError::Config(
            "administrator privileges are required".into(),
        ))
    }
}

/// Locate wintun.dll: next to the executable first, then in the
/// working directory.
fn wintun_dll_path() -> VpnResult<PathBuf> {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    let cwd = std::env::current_dir().ok();

    exe_dir
        .into_iter()
        .chain(cwd)
        .map(|dir| dir.join("wintun.dll"))
        .find(|candidate| candidate.exists())
        .ok_or_else(|| {
            VpnError::Adapter(
                "wintun.dll not found next to the executable or in the working directory".into(),
            )
        })
}

/// An open Wintun adapter. The DLL stays loaded for the adapter's
/// lifetime.
pub struct TunAdapter {
    _wintun: wintun::Wintun,
    adapter: Arc<Adapter>,
}

impl TunAdapter {
    /// Open an existing adapter by name, creating it when absent.
    pub fn open_or_create(name: &str) -> VpnResult<Self> {
        log::info!("adapter: opening '{name}'");

        let dll_path = wintun_dll_path()?;
        log::debug!("adapter: wintun.dll at {}", dll_path.display());

        let wintun = unsafe { wintun::load_from_path(&dll_path) }
            .map_err(|e| VpnError::Adapter(format!("failed to load wintun.dll: {e}")))?;

        let adapter = match Adapter::open(&wintun, name) {
            Ok(adapter) => {
                log::info!("adapter: opened '{name}'");
                adapter
            }
            Err(open_err) => {
                log::debug!("adapter: open failed ({open_err}), creating");
                let adapter = Adapter::create(&wintun, name, TUNNEL_TYPE, Some(TUNNEL_GUID))
                    .map_err(|e| {
                        VpnError::Adapter(format!("failed to create adapter '{name}': {e}"))
                    })?;
                log::info!("adapter: created '{name}'");
                adapter
            }
        };

        Ok(Self {
            _wintun: wintun,
            adapter,
        })
    }

    /// Stable interface locator used by every network manager.
    pub fn luid(&self) -> u64 {
        let luid = self.adapter.get_luid();
        unsafe { luid.Value }
    }

    /// Start a packet session on the adapter.
    pub fn start_session(&self) -> VpnResult<Session> {
        let session = self
            .adapter
            .start_session(RING_CAPACITY)
            .map_err(|e| VpnError::Adapter(format!("failed to start session: {e}")))?;
        log::info!("adapter: session started (ring=0x{RING_CAPACITY:X})");
        Ok(session)
    }
}

impl Drop for TunAdapter {
    fn drop(&mut self) {
        log::debug!("adapter: dropping");
    }
}

/// Trace one packet's direction and addressing. Only does work when
/// trace logging is enabled.
pub(crate) fn trace_packet(data: &[u8], direction: &str) {
    if !log::log_enabled!(log::Level::Trace) || data.len() < 20 {
        return;
    }
    let version = (data[0] >> 4) & 0x0f;
    match version {
        4 => {
            let src = std::net::Ipv4Addr::new(data[12], data[13], data[14], data[15]);
            let dst = std::net::Ipv4Addr::new(data[16], data[17], data[18], data[19]);
            log::trace!("[{direction}] IPv4 {src} -> {dst} (len={})", data.len());
        }
        6 => log::trace!("[{direction}] IPv6 packet (len={})", data.len()),
        v => log::warn!("[{direction}] unknown packet version={v} (len={})", data.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_capacity_is_power_of_two() {
        assert!(RING_CAPACITY.is_power_of_two());
        assert!(RING_CAPACITY >= wintun::MIN_RING_CAPACITY);
        assert!(RING_CAPACITY <= wintun::MAX_RING_CAPACITY);
    }

    #[test]
    fn trace_packet_tolerates_short_buffers() {
        trace_packet(&[0u8; 4], "to-net");
        trace_packet(&[], "from-net");
    }
}
