//! VPN control plane for TunBridge.
//!
//! Architecture:
//! - adapter.rs: Wintun virtual network adapter management
//! - routes.rs: IP Helper route table and interface attribute writes
//! - rollback.rs: baseline snapshot and transactional revert
//! - dns.rs: per-interface DNS resolver binding (registry)
//! - firewall.rs: Windows Firewall outbound allow rules (COM)
//! - watcher.rs: debounced network change notifications
//! - plugin.rs: transport plugin loading (DLL, five C symbols)
//! - session.rs: session lifecycle and the apply/serve/revert sequence

pub mod adapter;
pub mod dns;
pub mod firewall;
pub mod plugin;
pub mod rollback;
pub mod routes;
pub mod session;
pub mod watcher;

pub use adapter::TunAdapter;
pub use dns::DnsBinder;
pub use firewall::{FirewallRules, Protocol};
pub use plugin::TransportPlugin;
pub use rollback::NetworkRollback;
pub use routes::{AddressPlan, IpFamily};
pub use watcher::NetWatcher;

/// VPN-related errors
#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{context} failed (Win32={code})")]
    Win32 { context: &'static str, code: u32 },

    #[error("{context} failed (HRESULT=0x{code:08X})")]
    Com { context: &'static str, code: u32 },

    #[error("logic error: {0}")]
    Logic(&'static str),

    #[error("{0}: {1} operation(s) failed during revert")]
    PartialFailure(&'static str, usize),

    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VpnError {
    /// Tag a Win32 status code with the call site that produced it.
    pub(crate) fn win32(context: &'static str, code: u32) -> Self {
        VpnError::Win32 { context, code }
    }

    /// Tag a COM failure with the call site that produced it.
    pub(crate) fn com(context: &'static str, err: windows::core::Error) -> Self {
        VpnError::Com {
            context,
            code: err.code().0 as u32,
        }
    }
}

pub type VpnResult<T> = Result<T, VpnError>;
