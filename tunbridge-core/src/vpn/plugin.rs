//! Transport plugin loading.
//!
//! The data plane is a dynamically loaded library exposing five C
//! symbols: client connect/disconnect/serve and the server-side
//! bind/serve mirror. All five must resolve or the load fails. Config
//! crosses the boundary as a NUL-terminated JSON string; packets move
//! through plain function pointers so the plugin stays language
//! agnostic.

use std::ffi::{c_char, CStr};

use windows::core::{PCSTR, PCWSTR};
use windows::Win32::Foundation::HMODULE;
use windows::Win32::System::LibraryLoader::{FreeLibrary, GetProcAddress, LoadLibraryW};

use super::{VpnError, VpnResult};

/// Reads one packet bound for the network into `buf`. Returns the
/// packet length, 0 when no packet is pending, -1 when `buf` is too
/// small.
pub type RecvFromNetFn = unsafe extern "C" fn(buf: *mut u8, len: usize) -> isize;

/// Delivers one packet arriving from the network. Returns the number
/// of bytes accepted, 0 when the ring allocation failed.
pub type SendToNetFn = unsafe extern "C" fn(buf: *const u8, len: usize) -> isize;

type ConnectFn = unsafe extern "C" fn(config_json: *const c_char) -> bool;
type DisconnectFn = unsafe extern "C" fn();
type ServeFn =
    unsafe extern "C" fn(recv: RecvFromNetFn, send: SendToNetFn, working: *const i32) -> i32;

const SYMBOLS: [&str; 5] = [
    "Client_Connect",
    "Client_Disconnect",
    "Client_Serve",
    "Server_Bind",
    "Server_Serve",
];

/// A loaded transport plugin. The library stays loaded for the
/// lifetime of this value.
pub struct TransportPlugin {
    module: HMODULE,
    client_connect: ConnectFn,
    client_disconnect: DisconnectFn,
    client_serve: ServeFn,
    server_bind: ConnectFn,
    server_serve: ServeFn,
}

// SAFETY: the module handle and the resolved symbols are immutable
// after load; the plugin contract requires its entry points to be
// callable from the session worker.
unsafe impl Send for TransportPlugin {}

impl TransportPlugin {
    /// Load the library at `path` and resolve all five entry points.
    pub fn load(path: &str) -> VpnResult<Self> {
        log::debug!("plugin: loading {path}");
        let wide: Vec<u16> = path.encode_utf16().chain(std::iter::once(0)).collect();
        let module = unsafe { LoadLibraryW(PCWSTR(wide.as_ptr())) }
            .map_err(|e| VpnError::Plugin(format!("failed to load '{path}': {e}")))?;

        let mut procs = [None; 5];
        for (slot, name) in procs.iter_mut().zip(SYMBOLS) {
            let symbol = format!("{name}\0");
            *slot = unsafe { GetProcAddress(module, PCSTR(symbol.as_ptr())) };
            if slot.is_none() {
                log::error!("plugin: missing symbol '{name}'");
                unsafe {
                    let _ = FreeLibrary(module);
                }
                return Err(VpnError::Plugin(format!(
                    "'{path}' is missing required symbol '{name}'"
                )));
            }
        }

        log::info!("plugin: loaded {path}");
        unsafe {
            Ok(Self {
                module,
                client_connect: std::mem::transmute(procs[0].unwrap()),
                client_disconnect: std::mem::transmute(procs[1].unwrap()),
                client_serve: std::mem::transmute(procs[2].unwrap()),
                server_bind: std::mem::transmute(procs[3].unwrap()),
                server_serve: std::mem::transmute(procs[4].unwrap()),
            })
        }
    }

    pub fn client_connect(&self, config_json: &CStr) -> bool {
        unsafe { (self.client_connect)(config_json.as_ptr()) }
    }

    pub fn client_disconnect(&self) {
        unsafe { (self.client_disconnect)() }
    }

    /// Runs the plugin's data-plane loop on the calling thread until
    /// the flag behind `working` reads zero.
    pub fn client_serve(
        &self,
        recv: RecvFromNetFn,
        send: SendToNetFn,
        working: *const i32,
    ) -> i32 {
        unsafe { (self.client_serve)(recv, send, working) }
    }

    pub fn server_bind(&self, config_json: &CStr) -> bool {
        unsafe { (self.server_bind)(config_json.as_ptr()) }
    }

    pub fn server_serve(
        &self,
        recv: RecvFromNetFn,
        send: SendToNetFn,
        working: *const i32,
    ) -> i32 {
        unsafe { (self.server_serve)(recv, send, working) }
    }
}

impl Drop for TransportPlugin {
    fn drop(&mut self) {
        log::debug!("plugin: unloading");
        unsafe {
            let _ = FreeLibrary(self.module);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fails_for_missing_library() {
        let err = TransportPlugin::load(r"Z:\does\not\exist\transport.dll").unwrap_err();
        assert!(matches!(err, VpnError::Plugin(_)));
    }

    #[test]
    fn required_symbol_set_is_complete() {
        assert!(SYMBOLS.contains(&"Client_Connect"));
        assert!(SYMBOLS.contains(&"Client_Disconnect"));
        assert!(SYMBOLS.contains(&"Client_Serve"));
        assert!(SYMBOLS.contains(&"Server_Bind"));
        assert!(SYMBOLS.contains(&"Server_Serve"));
    }
}
