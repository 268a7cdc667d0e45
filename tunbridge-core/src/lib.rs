//! TunBridge core: the Windows control plane of a split-tunnel VPN
//! client.
//!
//! The library brings a Wintun adapter up, routes selected traffic
//! through it, pins the encrypted transport to the physical path, and
//! restores the host's network configuration exactly on teardown. The
//! data plane (packet crypto and transport framing) lives in a plugin
//! loaded at runtime.
//!
//! Built as a `cdylib` the crate exports the flat C ABI below; the CLI
//! links it as a regular Rust library and calls [`vpn::session`]
//! directly.

pub mod config;
pub mod vpn;

pub use config::ClientConfig;
pub use vpn::{VpnError, VpnResult};

use std::ffi::{c_char, CStr};

/// Start a session from a NUL-terminated JSON config.
///
/// Returns 0 on success, -1 when a session is already running (or the
/// argument is null).
///
/// # Safety
/// `config_json` must be null or point to a valid NUL-terminated
/// string.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn Start(config_json: *mut c_char) -> i32 {
    if config_json.is_null() {
        return -1;
    }
    let text = CStr::from_ptr(config_json).to_string_lossy();
    vpn::session::start(&text)
}

/// Request a soft stop of the running session. Returns 0 on success,
/// -2 when no session is running. Never blocks.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn Stop() -> i32 {
    vpn::session::stop()
}

/// 1 while a session is running, 0 otherwise.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn IsRunning() -> i32 {
    vpn::session::is_running()
}
