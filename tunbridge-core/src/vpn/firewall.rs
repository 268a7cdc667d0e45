//! Windows Firewall outbound allow rules.
//!
//! Each rule is named canonically from the prefix, protocol, remote
//! address set and port, scoped to one executable. A pre-existing rule
//! with the same name is snapshotted in full before being replaced, so
//! revert can recreate it attribute for attribute.

use windows::core::{IUnknown, Interface, BSTR, VARIANT};
use windows::Win32::Foundation::VARIANT_BOOL;
use windows::Win32::NetworkManagement::WindowsFirewall::{
    INetFwPolicy2, INetFwRule, INetFwRules, NetFwPolicy2, NetFwRule, NET_FW_ACTION,
    NET_FW_ACTION_ALLOW, NET_FW_IP_PROTOCOL_TCP, NET_FW_IP_PROTOCOL_UDP, NET_FW_PROFILE2_ALL,
    NET_FW_RULE_DIRECTION, NET_FW_RULE_DIR_OUT,
};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoUninitialize, CLSCTX_INPROC_SERVER,
    COINIT_APARTMENTTHREADED,
};
use windows::Win32::System::Ole::IEnumVARIANT;

use super::{VpnError, VpnResult};

/// L4 protocol of an allow rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub const fn label(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }

    const fn fw_protocol(self) -> i32 {
        match self {
            Protocol::Tcp => NET_FW_IP_PROTOCOL_TCP.0,
            Protocol::Udp => NET_FW_IP_PROTOCOL_UDP.0,
        }
    }
}

/// Everything needed to recreate a rule exactly as it was.
#[derive(Debug, Clone, Default)]
pub struct RuleSnapshot {
    pub name: String,
    pub description: String,
    pub direction: i32,
    pub action: i32,
    pub enabled: bool,
    pub profiles: i32,
    pub interface_types: String,
    pub protocol: i32,
    pub remote_addresses: String,
    pub remote_ports: String,
    pub application_name: String,
}

#[derive(Debug)]
struct Entry {
    proto: Protocol,
    port: u16,
    name: String,
    /// The rule existed before we touched it.
    had_before: bool,
    /// We created or replaced the rule.
    touched: bool,
    snapshot: Option<RuleSnapshot>,
}

/// Session-scoped firewall rule set with exact restoration.
pub struct FirewallRules {
    rule_prefix: String,
    app_path: String,
    remote_addresses: String,
    entries: Vec<Entry>,
    applied: bool,
}

/// Scoped STA apartment; every public operation runs inside one.
struct ComApartment {
    owns: bool,
}

impl ComApartment {
    fn enter() -> VpnResult<Self> {
        let hr = unsafe { CoInitializeEx(None, COINIT_APARTMENTTHREADED) };
        if hr.is_ok() {
            // S_OK or S_FALSE: we must balance with CoUninitialize.
            Ok(Self { owns: true })
        } else if hr.0 as u32 == 0x8001_0106 {
            // RPC_E_CHANGED_MODE: the thread is already an MTA; usable,
            // but not ours to uninitialize.
            Ok(Self { owns: false })
        } else {
            Err(VpnError::Com {
                context: "CoInitializeEx",
                code: hr.0 as u32,
            })
        }
    }
}

impl Drop for ComApartment {
    fn drop(&mut self) {
        if self.owns {
            unsafe { CoUninitialize() };
        }
    }
}

fn firewall_rules() -> VpnResult<INetFwRules> {
    let policy: INetFwPolicy2 =
        unsafe { CoCreateInstance(&NetFwPolicy2, None, CLSCTX_INPROC_SERVER) }
            .map_err(|e| VpnError::com("CoCreateInstance(NetFwPolicy2)", e))?;
    unsafe { policy.Rules() }.map_err(|e| VpnError::com("INetFwPolicy2::Rules", e))
}

impl FirewallRules {
    pub fn new(
        rule_prefix: impl Into<String>,
        app_path: impl Into<String>,
        remote_addresses: impl Into<String>,
    ) -> Self {
        let rules = Self {
            rule_prefix: rule_prefix.into(),
            app_path: app_path.into(),
            remote_addresses: remote_addresses.into(),
            entries: Vec::new(),
            applied: false,
        };
        log::debug!(
            "firewall: constructed prefix='{}' app='{}' remote='{}'",
            rules.rule_prefix,
            rules.app_path,
            rules.remote_addresses
        );
        rules
    }

    fn validate(&self) -> VpnResult<()> {
        if self.rule_prefix.is_empty() {
            return Err(VpnError::InvalidArgument("firewall rule prefix is empty".into()));
        }
        if self.app_path.is_empty() {
            return Err(VpnError::InvalidArgument("firewall application path is empty".into()));
        }
        if self.remote_addresses.is_empty() {
            return Err(VpnError::InvalidArgument("firewall remote addresses are empty".into()));
        }
        Ok(())
    }

    /// Canonical rule name: `"<prefix> Out <TCP|UDP> to <addrs>:<port>"`.
    pub fn rule_name(&self, proto: Protocol, port: u16) -> String {
        format!(
            "{} Out {} to {}:{}",
            self.rule_prefix,
            proto.label(),
            self.remote_addresses,
            port
        )
    }

    /// Ensure an outbound allow rule for (proto, port). Calling twice
    /// with the same pair in one session is a no-op: one ledger entry
    /// per pair.
    pub fn allow(&mut self, proto: Protocol, port: u16) -> VpnResult<()> {
        log::info!("firewall: allow {} port {port}", proto.label());
        self.validate()?;
        if port == 0 {
            return Err(VpnError::InvalidArgument("firewall port is zero".into()));
        }
        if self.entries.iter().any(|e| e.proto == proto && e.port == port) {
            log::trace!("firewall: allow already recorded (idempotent)");
            return Ok(());
        }

        let name = self.rule_name(proto, port);
        let _com = ComApartment::enter()?;
        let rules = firewall_rules()?;

        let snapshot = read_snapshot(&rules, &name)?;
        let had_before = snapshot.is_some();

        self.upsert_outbound(&rules, proto, port, &name)?;

        self.entries.push(Entry {
            proto,
            port,
            name,
            had_before,
            touched: true,
            snapshot,
        });
        self.applied = true;
        log::info!("firewall: rule applied");
        Ok(())
    }

    /// Walk the ledger in reverse: delete what we created, recreate
    /// what we replaced. Failures are collected, not fatal per entry.
    pub fn revert(&mut self) -> VpnResult<()> {
        if !self.applied {
            log::trace!("firewall: revert with nothing to do");
            return Ok(());
        }

        let _com = ComApartment::enter()?;
        let mut failures = 0usize;
        log::info!("firewall: revert begin, entries={}", self.entries.len());

        for entry in self.entries.iter().rev() {
            if entry.touched {
                log::debug!("firewall: remove '{}'", entry.name);
                if let Err(e) = remove_if_exists(&entry.name) {
                    log::error!("firewall: remove '{}' failed: {e}", entry.name);
                    failures += 1;
                }
            }
            if entry.had_before {
                if let Some(snapshot) = &entry.snapshot {
                    log::debug!("firewall: restore '{}'", snapshot.name);
                    if let Err(e) = restore_from_snapshot(snapshot) {
                        log::error!("firewall: restore '{}' failed: {e}", snapshot.name);
                        failures += 1;
                    }
                }
            }
        }

        self.entries.clear();
        self.applied = false;

        if failures > 0 {
            return Err(VpnError::PartialFailure("firewall revert", failures));
        }
        log::info!("firewall: revert done");
        Ok(())
    }

    /// Operator cleanup: delete every rule whose name starts with
    /// `prefix`, regardless of any session ledger.
    pub fn remove_by_prefix(prefix: &str) -> VpnResult<usize> {
        if prefix.is_empty() {
            return Err(VpnError::InvalidArgument("firewall rule prefix is empty".into()));
        }
        let _com = ComApartment::enter()?;
        let rules = firewall_rules()?;

        let mut doomed = Vec::new();
        let enumerator: IEnumVARIANT = unsafe { rules._NewEnum() }
            .map_err(|e| VpnError::com("INetFwRules::_NewEnum", e))?
            .cast()
            .map_err(|e| VpnError::com("IEnumVARIANT cast", e))?;

        let mut slot = [VARIANT::default()];
        let mut fetched = 0u32;
        loop {
            let hr = unsafe { enumerator.Next(&mut slot, &mut fetched) };
            if hr.is_err() || fetched == 0 {
                break;
            }
            let Ok(unknown) = IUnknown::try_from(&slot[0]) else {
                continue;
            };
            let Ok(rule) = unknown.cast::<INetFwRule>() else {
                continue;
            };
            if let Ok(name) = unsafe { rule.Name() } {
                let name = name.to_string();
                if name.starts_with(prefix) {
                    doomed.push(name);
                }
            }
        }

        for name in &doomed {
            log::debug!("firewall: remove '{name}'");
            if let Err(e) = unsafe { rules.Remove(&BSTR::from(name.as_str())) } {
                log::warn!("firewall: remove '{name}' failed: {e}");
            }
        }
        log::info!("firewall: removed {} rule(s) with prefix '{prefix}'", doomed.len());
        Ok(doomed.len())
    }

    /// Delete any rule by our name, then add the rule we want.
    fn upsert_outbound(
        &self,
        rules: &INetFwRules,
        proto: Protocol,
        port: u16,
        name: &str,
    ) -> VpnResult<()> {
        log::debug!(
            "firewall: upsert proto={} port={port} name='{name}'",
            proto.label()
        );
        let rule: INetFwRule = unsafe { CoCreateInstance(&NetFwRule, None, CLSCTX_INPROC_SERVER) }
            .map_err(|e| VpnError::com("CoCreateInstance(NetFwRule)", e))?;

        unsafe {
            rule.SetName(&BSTR::from(name))
                .and_then(|()| rule.SetDescription(&BSTR::from("TunBridge outbound allow")))
                .and_then(|()| rule.SetDirection(NET_FW_RULE_DIR_OUT))
                .and_then(|()| rule.SetAction(NET_FW_ACTION_ALLOW))
                .and_then(|()| rule.SetEnabled(VARIANT_BOOL::from(true)))
                .and_then(|()| rule.SetProfiles(NET_FW_PROFILE2_ALL.0))
                .and_then(|()| rule.SetInterfaceTypes(&BSTR::from("All")))
                .and_then(|()| rule.SetProtocol(proto.fw_protocol()))
                .and_then(|()| rule.SetRemoteAddresses(&BSTR::from(self.remote_addresses.as_str())))
                .and_then(|()| rule.SetRemotePorts(&BSTR::from(port.to_string())))
                .and_then(|()| rule.SetApplicationName(&BSTR::from(self.app_path.as_str())))
                .map_err(|e| VpnError::com("INetFwRule setters", e))?;
        }

        remove_if_exists(name)?;
        unsafe { rules.Add(&rule) }.map_err(|e| VpnError::com("INetFwRules::Add", e))?;
        log::info!("firewall: rule added '{name}'");
        Ok(())
    }
}

impl Drop for FirewallRules {
    fn drop(&mut self) {
        if let Err(e) = self.revert() {
            log::warn!("firewall: revert on drop failed: {e}");
        }
    }
}

/// Read every attribute of a named rule, or `None` when it does not
/// exist.
fn read_snapshot(rules: &INetFwRules, name: &str) -> VpnResult<Option<RuleSnapshot>> {
    let rule = match unsafe { rules.Item(&BSTR::from(name)) } {
        Ok(rule) => rule,
        Err(_) => {
            log::trace!("firewall: snapshot '{name}': not present");
            return Ok(None);
        }
    };

    let mut snap = RuleSnapshot::default();
    unsafe {
        if let Ok(v) = rule.Name() {
            snap.name = v.to_string();
        }
        if let Ok(v) = rule.Description() {
            snap.description = v.to_string();
        }
        if let Ok(v) = rule.Direction() {
            snap.direction = v.0;
        }
        if let Ok(v) = rule.Action() {
            snap.action = v.0;
        }
        if let Ok(v) = rule.Enabled() {
            snap.enabled = v.as_bool();
        }
        if let Ok(v) = rule.Profiles() {
            snap.profiles = v;
        }
        if let Ok(v) = rule.InterfaceTypes() {
            snap.interface_types = v.to_string();
        }
        if let Ok(v) = rule.Protocol() {
            snap.protocol = v;
        }
        if let Ok(v) = rule.RemoteAddresses() {
            snap.remote_addresses = v.to_string();
        }
        if let Ok(v) = rule.RemotePorts() {
            snap.remote_ports = v.to_string();
        }
        if let Ok(v) = rule.ApplicationName() {
            snap.application_name = v.to_string();
        }
    }
    log::debug!("firewall: snapshot '{name}': present");
    Ok(Some(snap))
}

fn remove_if_exists(name: &str) -> VpnResult<()> {
    let rules = firewall_rules()?;
    let bname = BSTR::from(name);
    if unsafe { rules.Item(&bname) }.is_ok() {
        unsafe { rules.Remove(&bname) }.map_err(|e| VpnError::com("INetFwRules::Remove", e))?;
        log::debug!("firewall: removed '{name}'");
    } else {
        log::trace!("firewall: nothing to remove for '{name}'");
    }
    Ok(())
}

/// Recreate a rule from its snapshot, replacing any rule by the same
/// name.
fn restore_from_snapshot(snap: &RuleSnapshot) -> VpnResult<()> {
    let rules = firewall_rules()?;
    let rule: INetFwRule = unsafe { CoCreateInstance(&NetFwRule, None, CLSCTX_INPROC_SERVER) }
        .map_err(|e| VpnError::com("CoCreateInstance(NetFwRule)", e))?;

    unsafe {
        rule.SetName(&BSTR::from(snap.name.as_str()))
            .and_then(|()| rule.SetDescription(&BSTR::from(snap.description.as_str())))
            .and_then(|()| rule.SetDirection(NET_FW_RULE_DIRECTION(snap.direction)))
            .and_then(|()| rule.SetAction(NET_FW_ACTION(snap.action)))
            .and_then(|()| rule.SetEnabled(VARIANT_BOOL::from(snap.enabled)))
            .and_then(|()| rule.SetProfiles(snap.profiles))
            .and_then(|()| rule.SetInterfaceTypes(&BSTR::from(snap.interface_types.as_str())))
            .and_then(|()| rule.SetProtocol(snap.protocol))
            .and_then(|()| rule.SetRemoteAddresses(&BSTR::from(snap.remote_addresses.as_str())))
            .and_then(|()| rule.SetRemotePorts(&BSTR::from(snap.remote_ports.as_str())))
            .and_then(|()| rule.SetApplicationName(&BSTR::from(snap.application_name.as_str())))
            .map_err(|e| VpnError::com("INetFwRule setters (restore)", e))?;
    }

    remove_if_exists(&snap.name)?;
    unsafe { rules.Add(&rule) }.map_err(|e| VpnError::com("INetFwRules::Add (restore)", e))?;
    log::info!("firewall: rule restored '{}'", snap.name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_rule_names() {
        let fw = FirewallRules::new("TunBridge", r"C:\tunbridge.exe", "203.0.113.5");
        assert_eq!(
            fw.rule_name(Protocol::Udp, 5555),
            "TunBridge Out UDP to 203.0.113.5:5555"
        );
        assert_eq!(
            fw.rule_name(Protocol::Tcp, 443),
            "TunBridge Out TCP to 203.0.113.5:443"
        );
    }

    #[test]
    fn validate_rejects_empty_fields() {
        let mut fw = FirewallRules::new("", r"C:\tunbridge.exe", "203.0.113.5");
        assert!(matches!(
            fw.allow(Protocol::Udp, 5555),
            Err(VpnError::InvalidArgument(_))
        ));

        let mut fw = FirewallRules::new("TunBridge", "", "203.0.113.5");
        assert!(fw.allow(Protocol::Udp, 5555).is_err());
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut fw = FirewallRules::new("TunBridge", r"C:\tunbridge.exe", "203.0.113.5");
        assert!(matches!(
            fw.allow(Protocol::Udp, 0),
            Err(VpnError::InvalidArgument(_))
        ));
    }

    #[test]
    fn revert_without_apply_is_noop() {
        let mut fw = FirewallRules::new("TunBridge", r"C:\tunbridge.exe", "203.0.113.5");
        assert!(fw.revert().is_ok());
    }

    #[test]
    fn empty_prefix_rejected_for_bulk_removal() {
        assert!(matches!(
            FirewallRules::remove_by_prefix(""),
            Err(VpnError::InvalidArgument(_))
        ));
    }
}
