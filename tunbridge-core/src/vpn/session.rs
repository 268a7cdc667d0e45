//! Session lifecycle: the apply -> serve -> revert sequence.
//!
//! One background worker owns the whole session. The flat C ABI needs
//! process-wide state (start/stop/is-running and the packet
//! trampolines the plugin calls), but everything below that surface
//! takes the session context as a parameter.

use std::ffi::CString;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::config::{strip_brackets, ClientConfig};

use super::adapter::{self, trace_packet, TunAdapter};
use super::dns::DnsBinder;
use super::firewall::{FirewallRules, Protocol};
use super::plugin::TransportPlugin;
use super::rollback::NetworkRollback;
use super::routes::{self, AddressPlan, IpFamily};
use super::watcher::NetWatcher;
use super::{VpnError, VpnResult};

/// Prefix for every firewall rule this process owns.
pub const RULE_PREFIX: &str = "TunBridge";

/// Debounce window between a network change burst and reconfiguration.
const REAPPLY_DEBOUNCE: Duration = Duration::from_millis(1000);

static STARTED: AtomicBool = AtomicBool::new(false);
/// Signal-safe running flag; its address is handed to the plugin's
/// serve loop.
static WORKING: AtomicI32 = AtomicI32::new(0);
/// Exit code of the last completed session (plugin serve return, or 1
/// on setup failure).
static LAST_EXIT_CODE: AtomicI32 = AtomicI32::new(0);
static WORKER: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);
/// TUN session the C trampolines read from and write to.
static ACTIVE_TUN: ArcSwapOption<wintun::Session> = ArcSwapOption::const_empty();

/// Everything the reconciler needs to reconfigure one family.
struct NetContext {
    luid: u64,
    server_ip: IpAddr,
    plan: AddressPlan,
}

/// Launch the session worker. Returns 0, or -1 when a session is
/// already running. Never blocks.
pub fn start(config_text: &str) -> i32 {
    if STARTED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return -1;
    }
    WORKING.store(1, Ordering::SeqCst);

    let config_text = config_text.to_owned();
    let spawned = std::thread::Builder::new()
        .name("tunbridge-session".into())
        .spawn(move || {
            let code = match client_main(&config_text) {
                Ok(rc) => {
                    log::info!("session: worker finished rc={rc}");
                    rc
                }
                Err(e) => {
                    log::error!("session: worker failed: {e}");
                    1
                }
            };
            LAST_EXIT_CODE.store(code, Ordering::SeqCst);
            STARTED.store(false, Ordering::SeqCst);
        });

    match spawned {
        Ok(handle) => {
            *WORKER.lock() = Some(handle);
            0
        }
        Err(e) => {
            log::error!("session: failed to spawn worker: {e}");
            STARTED.store(false, Ordering::SeqCst);
            -1
        }
    }
}

/// Soft stop: clear the running flag so the serve loop exits, then
/// join the worker from a detached thread. Returns 0, or -2 when no
/// session is running. Never blocks the caller.
pub fn stop() -> i32 {
    if !STARTED.load(Ordering::SeqCst) {
        return -2;
    }
    WORKING.store(0, Ordering::SeqCst);

    std::thread::spawn(|| {
        let handle = WORKER.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        STARTED.store(false, Ordering::SeqCst);
    });
    0
}

/// 1 while the session worker is alive (including its revert phase).
pub fn is_running() -> i32 {
    STARTED.load(Ordering::SeqCst) as i32
}

/// Exit code of the last completed session.
pub fn last_exit_code() -> i32 {
    LAST_EXIT_CODE.load(Ordering::SeqCst)
}

fn working_flag_ptr() -> *const i32 {
    WORKING.as_ptr() as *const i32
}

/// Resolve the configured server to one address, preferring a literal.
fn resolve_server_ip(server: &str) -> VpnResult<IpAddr> {
    let host = strip_brackets(server);
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = (host, 0u16)
        .to_socket_addrs()
        .map_err(|e| VpnError::Config(format!("cannot resolve server '{host}': {e}")))?;
    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| VpnError::Config(format!("server '{host}' resolved to no addresses")))
}

/// Resolve the server to the firewall RemoteAddresses CSV: the unique
/// set of its addresses, or the literal itself when resolution fails.
fn resolve_firewall_addresses(server: &str) -> String {
    let host = strip_brackets(server);
    if host.parse::<IpAddr>().is_ok() {
        return host.to_owned();
    }
    match (host, 0u16).to_socket_addrs() {
        Ok(addrs) => {
            let unique: std::collections::BTreeSet<String> =
                addrs.map(|sa| sa.ip().to_string()).collect();
            if unique.is_empty() {
                log::warn!("firewall: resolution produced no addresses; using literal '{host}'");
                host.to_owned()
            } else {
                unique.into_iter().collect::<Vec<_>>().join(",")
            }
        }
        Err(e) => {
            log::warn!("firewall: getaddrinfo failed ({e}); using literal '{host}'");
            host.to_owned()
        }
    }
}

/// Reconfigure both families. One family may fail on its own; both
/// failing is fatal.
fn configure_network(ctx: &NetContext) -> VpnResult<()> {
    let mut any_ok = false;
    for family in [IpFamily::V4, IpFamily::V6] {
        match routes::configure_family(ctx.luid, ctx.server_ip, family, &ctx.plan) {
            Ok(()) => {
                log::info!("session: {} configured", family.tag());
                any_ok = true;
            }
            Err(e) => log::error!("session: {} configure failed: {e}", family.tag()),
        }
    }
    if any_ok {
        Ok(())
    } else {
        Err(VpnError::Network(
            "neither IPv4 nor IPv6 could be configured".into(),
        ))
    }
}

/// Clears the trampoline slot even on early exits.
struct ActiveTunGuard;

impl Drop for ActiveTunGuard {
    fn drop(&mut self) {
        ACTIVE_TUN.store(None);
    }
}

unsafe extern "C" fn recv_from_net(buf: *mut u8, len: usize) -> isize {
    let Some(session) = ACTIVE_TUN.load_full() else {
        return 0;
    };
    match session.try_receive() {
        Ok(Some(packet)) => {
            let bytes = packet.bytes();
            trace_packet(bytes, "to-net");
            if bytes.len() > len {
                log::warn!("tun: oversized packet {} > buffer {len}", bytes.len());
                return -1;
            }
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, bytes.len());
            bytes.len() as isize
        }
        Ok(None) => 0,
        Err(e) => {
            // Shutdown is expected during disconnect.
            log::trace!("tun: receive error (may be shutdown): {e}");
            0
        }
    }
}

unsafe extern "C" fn send_to_net(buf: *const u8, len: usize) -> isize {
    let Some(session) = ACTIVE_TUN.load_full() else {
        return 0;
    };
    let data = std::slice::from_raw_parts(buf, len);
    trace_packet(data, "from-net");
    match session.allocate_send_packet(len as u16) {
        Ok(mut packet) => {
            packet.bytes_mut().copy_from_slice(data);
            session.send_packet(packet);
            len as isize
        }
        Err(e) => {
            log::warn!("tun: allocate_send_packet failed (drop): {e}");
            0
        }
    }
}

/// The session worker body: apply, serve, revert.
fn client_main(config_text: &str) -> VpnResult<i32> {
    log::info!("session: starting TunBridge");
    let config = ClientConfig::from_json(config_text)?;

    adapter::ensure_elevated()?;

    let server_ip = resolve_server_ip(&config.server)?;
    log::debug!("session: server resolved to {server_ip}");

    let exe_path = std::env::current_exe()?
        .to_string_lossy()
        .into_owned();

    // Firewall first: if the transport cannot be allowed out, nothing
    // else should be mutated.
    let mut firewall = FirewallRules::new(
        RULE_PREFIX,
        exe_path,
        resolve_firewall_addresses(&config.server),
    );
    firewall.allow(Protocol::Tcp, config.port)?;
    firewall.allow(Protocol::Udp, config.port)?;

    let plugin = TransportPlugin::load(&config.plugin)?;

    let tun = TunAdapter::open_or_create(&config.tun)?;
    let luid = tun.luid();
    log::debug!("session: adapter LUID {luid}");

    let plan = config.address_plan()?;
    let mut rollback = NetworkRollback::capture(luid, Some(server_ip))?;
    log::info!("session: baseline captured, rollback armed");

    let ctx = Arc::new(NetContext {
        luid,
        server_ip,
        plan,
    });
    configure_network(&ctx)?;

    let mut dns = DnsBinder::new(luid);
    dns.apply(&config.dns)?;
    log::info!("session: DNS bound: {}", config.dns.join(", "));

    // The watcher outlives topology churn, not the session: it holds
    // the context weakly and goes quiet once the session is gone.
    let weak_ctx = Arc::downgrade(&ctx);
    let mut watcher = NetWatcher::start(
        Box::new(move || {
            let Some(ctx) = weak_ctx.upgrade() else {
                return;
            };
            log::debug!("session: reapplying network configuration");
            if let Err(e) = configure_network(&ctx) {
                log::error!("session: reapply failed: {e}");
            }
        }),
        REAPPLY_DEBOUNCE,
    )?;
    log::debug!(
        "session: watcher armed (debounce={}ms)",
        REAPPLY_DEBOUNCE.as_millis()
    );

    let session = Arc::new(tun.start_session()?);
    ACTIVE_TUN.store(Some(Arc::clone(&session)));
    let _tun_guard = ActiveTunGuard;

    let config_cstr = CString::new(config_text)
        .map_err(|_| VpnError::Config("config contains a NUL byte".into()))?;
    if !plugin.client_connect(&config_cstr) {
        return Err(VpnError::Plugin("Client_Connect failed".into()));
    }
    log::info!("session: connected to {}:{}", config.server, config.port);

    log::info!("session: serve loop started");
    let rc = plugin.client_serve(recv_from_net, send_to_net, working_flag_ptr());
    log::info!("session: serve loop exited rc={rc}");

    plugin.client_disconnect();
    ACTIVE_TUN.store(None);
    let _ = session.shutdown();

    // Orderly teardown: quiesce the watcher, then unwind route table,
    // DNS and firewall state. Failures are aggregated, never fatal to
    // the remaining steps.
    watcher.stop();
    let mut revert_failures = 0usize;
    if let Err(e) = rollback.revert() {
        log::error!("session: network rollback incomplete: {e}");
        revert_failures += 1;
    }
    if let Err(e) = dns.revert() {
        log::error!("session: DNS revert incomplete: {e}");
        revert_failures += 1;
    }
    if let Err(e) = firewall.revert() {
        log::error!("session: firewall revert incomplete: {e}");
        revert_failures += 1;
    }
    if revert_failures > 0 {
        log::error!(
            "session: teardown finished with {revert_failures} incomplete subsystem(s)"
        );
    } else {
        log::info!("session: shutdown complete");
    }
    Ok(rc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_without_start_reports_not_running() {
        assert_eq!(stop(), -2);
        assert_eq!(is_running(), 0);
    }

    #[test]
    fn resolve_server_accepts_literals() {
        assert_eq!(
            resolve_server_ip("203.0.113.5").unwrap(),
            "203.0.113.5".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            resolve_server_ip("[fd00:dead:beef::1]").unwrap(),
            "fd00:dead:beef::1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn firewall_addresses_fall_back_to_literal() {
        assert_eq!(
            resolve_firewall_addresses("203.0.113.5"),
            "203.0.113.5"
        );
        assert_eq!(
            resolve_firewall_addresses("[fd00::1]"),
            "fd00::1"
        );
    }
}
