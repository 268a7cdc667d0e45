//! Debounced network change notifications.
//!
//! One worker thread waits on two events: `stop` (manual reset) and
//! `kick` (auto reset). Interface-change and route-change callbacks
//! signal `kick`; the worker then waits for a quiet window of
//! `debounce` before invoking the reapply callback. A suppression
//! deadline keeps the reconciler's own mutations from re-triggering
//! it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_EVENT, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::NetworkManagement::IpHelper::{
    CancelMibChangeNotify2, NotifyIpInterfaceChange, NotifyRouteChange2, MIB_IPFORWARD_ROW2,
    MIB_IPINTERFACE_ROW, MIB_NOTIFICATION_TYPE,
};
use windows::Win32::Networking::WinSock::AF_UNSPEC;
use windows::Win32::System::SystemInformation::GetTickCount64;
use windows::Win32::System::Threading::{
    CreateEventW, SetEvent, WaitForMultipleObjects, INFINITE,
};

use super::{VpnError, VpnResult};

/// Callback invoked after a quiet debounce window. Errors must be
/// handled inside; the worker only logs panics.
pub type ReapplyFn = Box<dyn Fn() + Send + Sync + 'static>;

/// Raw event handle moved across threads. The watcher closes it
/// exactly once, after the worker has been joined.
#[derive(Clone, Copy)]
struct EventHandle(HANDLE);

// SAFETY: event handles are process-wide kernel objects; signaling and
// waiting from any thread is the intended use.
unsafe impl Send for EventHandle {}
unsafe impl Sync for EventHandle {}

struct WatcherShared {
    stop: EventHandle,
    kick: EventHandle,
    debounce_ms: u32,
    suppress_until_ms: AtomicU64,
    reapply: ReapplyFn,
}

impl WatcherShared {
    fn kick(&self) {
        let until = self.suppress_until_ms.load(Ordering::Relaxed);
        if unsafe { GetTickCount64() } < until {
            return;
        }
        unsafe {
            let _ = SetEvent(self.kick.0);
        }
    }

    fn suppress(&self, dur: Duration) {
        let until = unsafe { GetTickCount64() } + dur.as_millis() as u64;
        self.suppress_until_ms.store(until, Ordering::Relaxed);
    }
}

unsafe extern "system" fn on_interface_change(
    context: *const core::ffi::c_void,
    _row: *const MIB_IPINTERFACE_ROW,
    _notification_type: MIB_NOTIFICATION_TYPE,
) {
    if let Some(shared) = (context as *const WatcherShared).as_ref() {
        log::trace!("watcher: interface change kick");
        shared.kick();
    }
}

unsafe extern "system" fn on_route_change(
    context: *const core::ffi::c_void,
    _row: *const MIB_IPFORWARD_ROW2,
    _notification_type: MIB_NOTIFICATION_TYPE,
) {
    if let Some(shared) = (context as *const WatcherShared).as_ref() {
        log::trace!("watcher: route change kick");
        shared.kick();
    }
}

/// Watches for interface and route table changes and reapplies the
/// network configuration after each burst settles.
pub struct NetWatcher {
    shared: Arc<WatcherShared>,
    worker: Option<JoinHandle<()>>,
    if_notify: HANDLE,
    route_notify: HANDLE,
    started: bool,
}

// SAFETY: notification handles are only used from `stop`, under &mut.
unsafe impl Send for NetWatcher {}

impl NetWatcher {
    pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1500);

    /// Create the events, subscribe to change notifications and start
    /// the worker thread.
    pub fn start(reapply: ReapplyFn, debounce: Duration) -> VpnResult<Self> {
        log::debug!("watcher: start, debounce={}ms", debounce.as_millis());

        let stop = unsafe { CreateEventW(None, true, false, PCWSTR::null()) }
            .map_err(|e| VpnError::com("CreateEventW(stop)", e))?;
        let kick = match unsafe { CreateEventW(None, false, false, PCWSTR::null()) } {
            Ok(h) => h,
            Err(e) => {
                unsafe {
                    let _ = CloseHandle(stop);
                }
                return Err(VpnError::com("CreateEventW(kick)", e));
            }
        };

        let shared = Arc::new(WatcherShared {
            stop: EventHandle(stop),
            kick: EventHandle(kick),
            debounce_ms: debounce.as_millis() as u32,
            suppress_until_ms: AtomicU64::new(0),
            reapply,
        });
        let context = Arc::as_ptr(&shared) as *const core::ffi::c_void;

        let mut if_notify = HANDLE::default();
        let rc = unsafe {
            NotifyIpInterfaceChange(
                AF_UNSPEC,
                Some(on_interface_change),
                Some(context),
                false,
                &mut if_notify,
            )
        };
        if rc.0 != 0 {
            shared.close_events();
            return Err(VpnError::win32("NotifyIpInterfaceChange", rc.0));
        }

        let mut route_notify = HANDLE::default();
        let rc = unsafe {
            NotifyRouteChange2(AF_UNSPEC, Some(on_route_change), context, false, &mut route_notify)
        };
        if rc.0 != 0 {
            unsafe {
                let _ = CancelMibChangeNotify2(if_notify);
            }
            shared.close_events();
            return Err(VpnError::win32("NotifyRouteChange2", rc.0));
        }

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("tunbridge-watcher".into())
            .spawn(move || worker_loop(worker_shared))
            .map_err(|e| {
                unsafe {
                    let _ = CancelMibChangeNotify2(if_notify);
                    let _ = CancelMibChangeNotify2(route_notify);
                }
                shared.close_events();
                VpnError::Network(format!("failed to spawn watcher thread: {e}"))
            })?;

        log::info!("watcher: started");
        Ok(Self {
            shared,
            worker: Some(worker),
            if_notify,
            route_notify,
            started: true,
        })
    }

    pub fn is_running(&self) -> bool {
        self.started
    }

    /// Signal a change event manually.
    pub fn kick(&self) {
        self.shared.kick();
    }

    /// Ignore kicks until `dur` from now.
    pub fn suppress(&self, dur: Duration) {
        self.shared.suppress(dur);
    }

    /// Cancel subscriptions, stop and join the worker, close handles.
    /// Idempotent.
    pub fn stop(&mut self) {
        if !self.started {
            log::trace!("watcher: already stopped");
            return;
        }
        log::debug!("watcher: stopping");

        unsafe {
            let _ = CancelMibChangeNotify2(self.if_notify);
            let _ = CancelMibChangeNotify2(self.route_notify);
            let _ = SetEvent(self.shared.stop.0);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.shared.close_events();
        self.started = false;
        log::info!("watcher: stopped");
    }
}

impl WatcherShared {
    fn close_events(&self) {
        unsafe {
            let _ = CloseHandle(self.stop.0);
            let _ = CloseHandle(self.kick.0);
        }
    }
}

impl Drop for NetWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: Arc<WatcherShared>) {
    log::debug!("watcher: worker started");
    let wait_set = [shared.stop.0, shared.kick.0];
    const KICKED: WAIT_EVENT = WAIT_EVENT(WAIT_OBJECT_0.0 + 1);

    loop {
        let dw = unsafe { WaitForMultipleObjects(&wait_set, false, INFINITE) };
        if dw == WAIT_OBJECT_0 {
            log::debug!("watcher: stop signaled");
            break;
        }
        if dw != KICKED {
            log::warn!("watcher: unexpected wait result {}", dw.0);
            break;
        }

        log::trace!("watcher: kick received, debouncing {}ms", shared.debounce_ms);
        // Coalesce the burst: every extra kick restarts the window.
        loop {
            let dw2 = unsafe { WaitForMultipleObjects(&wait_set, false, shared.debounce_ms) };
            if dw2 == WAIT_OBJECT_0 {
                log::debug!("watcher: stop during debounce");
                return;
            }
            if dw2 == KICKED {
                log::trace!("watcher: extra kick during debounce");
                continue;
            }
            if dw2 == WAIT_TIMEOUT {
                log::info!("watcher: quiet window elapsed, reapplying");
                // Our own mutations raise notifications too; mute them
                // for one more window.
                shared.suppress(Duration::from_millis(shared.debounce_ms as u64));
                let reapply = std::panic::AssertUnwindSafe(|| (shared.reapply)());
                if std::panic::catch_unwind(reapply).is_err() {
                    log::error!("watcher: reapply panicked, swallowed");
                }
                break;
            }
            log::warn!("watcher: unexpected wait result {}", dw2.0);
            break;
        }
    }
    log::debug!("watcher: worker exiting");
}
