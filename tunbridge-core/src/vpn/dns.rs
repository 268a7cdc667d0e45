//! Per-interface DNS resolver binding.
//!
//! Resolver lists live in the persistent TCP/IP configuration tree,
//! keyed by interface GUID; writing there survives adapter resets,
//! unlike the volatile netsh path. A stored-but-empty value and a
//! missing value are different states and both must be restored
//! exactly on revert.

use std::net::{Ipv4Addr, Ipv6Addr};

use winreg::enums::{HKEY_LOCAL_MACHINE, KEY_QUERY_VALUE, KEY_SET_VALUE, KEY_WOW64_64KEY};
use winreg::RegKey;

use windows::core::{s, w, GUID};
use windows::Win32::Foundation::BOOLEAN;
use windows::Win32::NetworkManagement::IpHelper::ConvertInterfaceLuidToGuid;
use windows::Win32::System::LibraryLoader::{FreeLibrary, GetProcAddress, LoadLibraryW};

use super::routes::net_luid;
use super::{VpnError, VpnResult};

const V4_INTERFACES: &str = r"SYSTEM\CurrentControlSet\Services\Tcpip\Parameters\Interfaces";
const V6_INTERFACES: &str = r"SYSTEM\CurrentControlSet\Services\Tcpip6\Parameters\Interfaces";
const NAME_SERVER: &str = "NameServer";

/// Binds resolver lists to one interface and restores the previous
/// binding on revert (or drop).
pub struct DnsBinder {
    luid: u64,
    guid_str: Option<String>,
    applied: bool,
    touched_v4: bool,
    touched_v6: bool,
    /// Previous values: `None` = value was absent, `Some` = stored
    /// string (possibly empty).
    prev_v4: Option<String>,
    prev_v6: Option<String>,
}

impl DnsBinder {
    pub fn new(luid: u64) -> Self {
        log::debug!("dns: binder created (IfLuid={luid})");
        Self {
            luid,
            guid_str: None,
            applied: false,
            touched_v4: false,
            touched_v6: false,
            prev_v4: None,
            prev_v6: None,
        }
    }

    /// Apply a resolver list. Addresses are split by family; a family
    /// with no addresses is left untouched. Any entry that is not an
    /// IP literal aborts the whole apply before any write.
    pub fn apply(&mut self, servers: &[String]) -> VpnResult<()> {
        log::info!("dns: apply begin, servers={}", servers.len());
        self.touched_v4 = false;
        self.touched_v6 = false;
        self.prev_v4 = None;
        self.prev_v6 = None;

        if servers.is_empty() {
            return Err(VpnError::InvalidArgument("DNS server list is empty".into()));
        }

        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for s in servers {
            if s.parse::<Ipv4Addr>().is_ok() {
                v4.push(s.as_str());
            } else if s.parse::<Ipv6Addr>().is_ok() {
                v6.push(s.as_str());
            } else {
                return Err(VpnError::InvalidArgument(format!(
                    "invalid DNS server address: '{s}'"
                )));
            }
        }
        log::debug!("dns: parsed v4={} v6={}", v4.len(), v6.len());

        self.ensure_guid()?;
        self.prev_v4 = self.read_name_server(V4_INTERFACES)?;
        self.prev_v6 = self.read_name_server(V6_INTERFACES)?;
        log::debug!(
            "dns: prev v4 present={} v6 present={}",
            self.prev_v4.is_some(),
            self.prev_v6.is_some()
        );

        if !v4.is_empty() {
            self.write_name_server(V4_INTERFACES, Some(&v4.join(",")))?;
            self.touched_v4 = true;
        }
        if !v6.is_empty() {
            self.write_name_server(V6_INTERFACES, Some(&v6.join(",")))?;
            self.touched_v6 = true;
        }

        flush_resolver_cache();
        self.applied = true;
        log::info!(
            "dns: apply done (touched v4={} v6={})",
            self.touched_v4,
            self.touched_v6
        );
        Ok(())
    }

    /// Restore each touched family: rewrite the previous value if one
    /// was stored, otherwise delete the value. Aggregates failures.
    pub fn revert(&mut self) -> VpnResult<()> {
        if !self.applied {
            log::trace!("dns: revert with nothing to do");
            return Ok(());
        }
        log::info!(
            "dns: revert begin (touched v4={} v6={})",
            self.touched_v4,
            self.touched_v6
        );
        let mut failures = 0usize;

        if self.touched_v4 {
            let prev = self.prev_v4.take();
            if let Err(e) = self.write_name_server(V4_INTERFACES, prev.as_deref()) {
                log::error!("dns: IPv4 restore failed: {e}");
                failures += 1;
            }
        }
        if self.touched_v6 {
            let prev = self.prev_v6.take();
            if let Err(e) = self.write_name_server(V6_INTERFACES, prev.as_deref()) {
                log::error!("dns: IPv6 restore failed: {e}");
                failures += 1;
            }
        }

        flush_resolver_cache();
        self.applied = false;
        self.touched_v4 = false;
        self.touched_v6 = false;
        self.prev_v4 = None;
        self.prev_v6 = None;

        if failures > 0 {
            return Err(VpnError::PartialFailure("dns revert", failures));
        }
        log::info!("dns: revert done");
        Ok(())
    }

    /// LUID -> braced GUID string, resolved once.
    fn ensure_guid(&mut self) -> VpnResult<&str> {
        if self.guid_str.is_none() {
            let luid = net_luid(self.luid);
            let mut guid = GUID::default();
            let rc = unsafe { ConvertInterfaceLuidToGuid(&luid, &mut guid) };
            if rc.0 != 0 {
                return Err(VpnError::win32("ConvertInterfaceLuidToGuid", rc.0));
            }
            let braced = format!(
                "{{{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}}}",
                guid.data1,
                guid.data2,
                guid.data3,
                guid.data4[0],
                guid.data4[1],
                guid.data4[2],
                guid.data4[3],
                guid.data4[4],
                guid.data4[5],
                guid.data4[6],
                guid.data4[7]
            );
            log::debug!("dns: interface GUID {braced}");
            self.guid_str = Some(braced);
        }
        Ok(self.guid_str.as_deref().unwrap_or_default())
    }

    fn interface_key(&self, base: &str, access: u32) -> VpnResult<RegKey> {
        let guid = self.guid_str.as_deref().ok_or(VpnError::Logic(
            "interface GUID not resolved before registry access",
        ))?;
        let path = format!(r"{base}\{guid}");
        RegKey::predef(HKEY_LOCAL_MACHINE)
            .open_subkey_with_flags(&path, access | KEY_WOW64_64KEY)
            .map_err(|e| VpnError::Config(format!("cannot open registry key '{path}': {e}")))
    }

    /// `Ok(None)` means the value is absent, which is distinct from a
    /// stored empty string.
    fn read_name_server(&self, base: &str) -> VpnResult<Option<String>> {
        let key = self.interface_key(base, KEY_QUERY_VALUE)?;
        match key.get_value::<String, _>(NAME_SERVER) {
            Ok(value) => {
                log::debug!("dns: {NAME_SERVER} present, len={}", value.len());
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::trace!("dns: {NAME_SERVER} not present");
                Ok(None)
            }
            Err(e) => Err(VpnError::Io(e)),
        }
    }

    /// `None` deletes the value; deleting an already-absent value is
    /// fine.
    fn write_name_server(&self, base: &str, value: Option<&str>) -> VpnResult<()> {
        let key = self.interface_key(base, KEY_SET_VALUE)?;
        match value {
            Some(v) => {
                log::debug!("dns: set {NAME_SERVER}='{v}'");
                key.set_value(NAME_SERVER, &v).map_err(VpnError::Io)
            }
            None => {
                log::debug!("dns: delete {NAME_SERVER}");
                match key.delete_value(NAME_SERVER) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(VpnError::Io(e)),
                }
            }
        }
    }
}

impl Drop for DnsBinder {
    fn drop(&mut self) {
        if let Err(e) = self.revert() {
            log::warn!("dns: revert on drop failed: {e}");
        }
    }
}

/// Best-effort flush of the system resolver cache. The export is
/// undocumented, so it is looked up dynamically and any failure is
/// ignored.
pub fn flush_resolver_cache() {
    unsafe {
        let Ok(module) = LoadLibraryW(w!("dnsapi.dll")) else {
            log::warn!("dns: LoadLibraryW(dnsapi.dll) failed");
            return;
        };
        match GetProcAddress(module, s!("DnsFlushResolverCache")) {
            Some(proc) => {
                let flush: unsafe extern "system" fn() -> BOOLEAN = std::mem::transmute(proc);
                let _ = flush();
                log::debug!("dns: resolver cache flushed");
            }
            None => log::warn!("dns: DnsFlushResolverCache not found"),
        }
        let _ = FreeLibrary(module);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_rejects_non_ip() {
        let mut binder = DnsBinder::new(0);
        let err = binder
            .apply(&["10.200.0.1".into(), "dns.example".into()])
            .unwrap_err();
        assert!(matches!(err, VpnError::InvalidArgument(_)));
        assert!(!binder.touched_v4);
    }

    #[test]
    fn empty_list_is_an_error() {
        let mut binder = DnsBinder::new(0);
        assert!(matches!(
            binder.apply(&[]),
            Err(VpnError::InvalidArgument(_))
        ));
    }

    #[test]
    fn revert_without_apply_is_noop() {
        let mut binder = DnsBinder::new(0);
        assert!(binder.revert().is_ok());
    }
}
