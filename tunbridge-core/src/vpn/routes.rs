//! Route table and interface attribute management via IP Helper.
//!
//! All forwarding entries written here carry `MIB_IPPROTO_NETMGMT` as
//! their protocol, which doubles as the ownership tag: rollback finds
//! our entries by matching that tag instead of keeping per-route
//! records.
//!
//! Split tunneling works with two half-space routes per family
//! (0.0.0.0/1 + 128.0.0.0/1, ::/1 + 8000::/1) through the tunnel peer.
//! Together they outweigh the system default route without replacing
//! it, so the pinned host route to the server keeps its original path.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use windows::Win32::Foundation::{
    ERROR_INVALID_PARAMETER, ERROR_OBJECT_ALREADY_EXISTS, NO_ERROR, WIN32_ERROR,
};
use windows::Win32::NetworkManagement::IpHelper::*;
use windows::Win32::NetworkManagement::Ndis::NET_LUID_LH;
use windows::Win32::Networking::WinSock::{ADDRESS_FAMILY, AF_INET, AF_INET6, SOCKADDR_INET};

use super::{VpnError, VpnResult};

/// Address family selector used across all network managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub const fn family(self) -> ADDRESS_FAMILY {
        match self {
            IpFamily::V4 => AF_INET,
            IpFamily::V6 => AF_INET6,
        }
    }

    pub const fn tag(self) -> &'static str {
        match self {
            IpFamily::V4 => "v4",
            IpFamily::V6 => "v6",
        }
    }

    pub fn of(ip: IpAddr) -> IpFamily {
        match ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    /// Prefix length of a host route for this family.
    pub const fn host_prefix_len(self) -> u8 {
        match self {
            IpFamily::V4 => 32,
            IpFamily::V6 => 128,
        }
    }
}

/// Point-to-point addressing of the tunnel, fixed for the session.
#[derive(Debug, Clone, Copy)]
pub struct AddressPlan {
    pub local4: Ipv4Addr,
    pub peer4: Ipv4Addr,
    pub local6: Ipv6Addr,
    pub peer6: Ipv6Addr,
    pub mtu: u32,
}

impl AddressPlan {
    pub fn local(&self, family: IpFamily) -> IpAddr {
        match family {
            IpFamily::V4 => IpAddr::V4(self.local4),
            IpFamily::V6 => IpAddr::V6(self.local6),
        }
    }

    pub fn peer(&self, family: IpFamily) -> IpAddr {
        match family {
            IpFamily::V4 => IpAddr::V4(self.peer4),
            IpFamily::V6 => IpAddr::V6(self.peer6),
        }
    }

    /// On-link prefix length used when assigning the local address.
    /// Wider than /32 and /128 so the peer is on-link reachable.
    pub const fn local_prefix_len(family: IpFamily) -> u8 {
        match family {
            IpFamily::V4 => 22,
            IpFamily::V6 => 64,
        }
    }
}

/// The two half-space destinations per family.
pub fn split_default_halves(family: IpFamily) -> [IpAddr; 2] {
    match family {
        IpFamily::V4 => [
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V4(Ipv4Addr::new(128, 0, 0, 0)),
        ],
        IpFamily::V6 => [
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            IpAddr::V6(Ipv6Addr::new(0x8000, 0, 0, 0, 0, 0, 0, 0)),
        ],
    }
}

pub(crate) fn net_luid(value: u64) -> NET_LUID_LH {
    NET_LUID_LH { Value: value }
}

pub(crate) fn luid_value(luid: &NET_LUID_LH) -> u64 {
    unsafe { luid.Value }
}

fn check(context: &'static str, rc: WIN32_ERROR) -> VpnResult<()> {
    if rc == NO_ERROR {
        Ok(())
    } else {
        Err(VpnError::win32(context, rc.0))
    }
}

pub(crate) fn sockaddr_from_ip(ip: IpAddr) -> SOCKADDR_INET {
    let mut sa = SOCKADDR_INET::default();
    unsafe {
        match ip {
            IpAddr::V4(v4) => {
                sa.Ipv4.sin_family = AF_INET;
                sa.Ipv4.sin_addr.S_un.S_addr = u32::from_ne_bytes(v4.octets());
            }
            IpAddr::V6(v6) => {
                sa.Ipv6.sin6_family = AF_INET6;
                sa.Ipv6.sin6_addr.u.Byte = v6.octets();
            }
        }
    }
    sa
}

pub(crate) fn ip_from_sockaddr(sa: &SOCKADDR_INET) -> Option<IpAddr> {
    unsafe {
        if sa.si_family == AF_INET {
            Some(IpAddr::V4(Ipv4Addr::from(
                sa.Ipv4.sin_addr.S_un.S_addr.to_ne_bytes(),
            )))
        } else if sa.si_family == AF_INET6 {
            Some(IpAddr::V6(Ipv6Addr::from(sa.Ipv6.sin6_addr.u.Byte)))
        } else {
            None
        }
    }
}

/// Family-zero next hop: "deliver directly on this interface".
fn onlink_next_hop(family: IpFamily) -> SOCKADDR_INET {
    let mut sa = SOCKADDR_INET::default();
    unsafe {
        sa.si_family = family.family();
    }
    sa
}

pub(crate) fn read_interface_row(
    luid: u64,
    family: IpFamily,
) -> VpnResult<MIB_IPINTERFACE_ROW> {
    let mut row = MIB_IPINTERFACE_ROW::default();
    unsafe {
        InitializeIpInterfaceEntry(&mut row);
        row.Family = family.family();
        row.InterfaceLuid = net_luid(luid);
        check("GetIpInterfaceEntry", GetIpInterfaceEntry(&mut row))?;
    }
    Ok(row)
}

/// Write an interface row back, treating ERROR_INVALID_PARAMETER as a
/// soft success (some builds refuse metric/MTU writes on loopback-like
/// interfaces).
pub(crate) fn write_interface_row(
    context: &'static str,
    row: &mut MIB_IPINTERFACE_ROW,
) -> VpnResult<()> {
    let rc = unsafe { SetIpInterfaceEntry(row) };
    if rc == ERROR_INVALID_PARAMETER {
        log::warn!("{context}: rc=87, ignored");
        return Ok(());
    }
    check(context, rc)
}

/// Pin the interface metric, disabling automatic metric selection.
pub fn set_interface_metric(luid: u64, family: IpFamily, metric: u32) -> VpnResult<()> {
    let mut row = read_interface_row(luid, family)?;
    row.UseAutomaticMetric = false.into();
    row.Metric = metric;
    write_interface_row("SetIpInterfaceEntry(metric)", &mut row)?;
    log::debug!("interface metric set: {} metric={metric}", family.tag());
    Ok(())
}

pub fn set_interface_mtu(luid: u64, family: IpFamily, mtu: u32) -> VpnResult<()> {
    let mut row = read_interface_row(luid, family)?;
    row.NlMtu = mtu;
    write_interface_row("SetIpInterfaceEntry(mtu)", &mut row)?;
    log::debug!("interface MTU set: {} mtu={mtu}", family.tag());
    Ok(())
}

/// Assign a unicast address with infinite lifetimes; updates in place
/// when the address already exists.
pub fn add_ip_address(luid: u64, ip: IpAddr, prefix_len: u8) -> VpnResult<()> {
    let family = IpFamily::of(ip);
    let mut row = MIB_UNICASTIPADDRESS_ROW::default();
    unsafe {
        InitializeUnicastIpAddressEntry(&mut row);
        row.InterfaceLuid = net_luid(luid);
        row.Address = sockaddr_from_ip(ip);
        row.PrefixOrigin = IpPrefixOriginManual;
        row.SuffixOrigin = IpSuffixOriginOther;
        row.ValidLifetime = u32::MAX;
        row.PreferredLifetime = u32::MAX;
        row.DadState = IpDadStatePreferred;
        row.OnLinkPrefixLength = prefix_len;

        let rc = CreateUnicastIpAddressEntry(&row);
        if rc == NO_ERROR {
            log::info!("unicast address added: {} {ip}/{prefix_len}", family.tag());
            return Ok(());
        }
        if rc == ERROR_OBJECT_ALREADY_EXISTS {
            check("SetUnicastIpAddressEntry", SetUnicastIpAddressEntry(&row))?;
            log::info!("unicast address updated: {} {ip}/{prefix_len}", family.tag());
            return Ok(());
        }
        Err(VpnError::win32("CreateUnicastIpAddressEntry", rc.0))
    }
}

fn owned_forward_row(
    luid: u64,
    dest: IpAddr,
    prefix_len: u8,
    next_hop: SOCKADDR_INET,
    metric: u32,
) -> MIB_IPFORWARD_ROW2 {
    let mut row = MIB_IPFORWARD_ROW2::default();
    unsafe {
        InitializeIpForwardEntry(&mut row);
    }
    row.InterfaceLuid = net_luid(luid);
    row.DestinationPrefix.Prefix = sockaddr_from_ip(dest);
    row.DestinationPrefix.PrefixLength = prefix_len;
    row.NextHop = next_hop;
    row.Metric = metric;
    row.Protocol = MIB_IPPROTO_NETMGMT;
    row
}

fn create_forward_entry(context: &'static str, row: &MIB_IPFORWARD_ROW2) -> VpnResult<()> {
    let rc = unsafe { CreateIpForwardEntry2(row) };
    if rc == NO_ERROR || rc == ERROR_OBJECT_ALREADY_EXISTS {
        return Ok(());
    }
    Err(VpnError::win32(context, rc.0))
}

/// Route a prefix on-link through the given interface.
pub fn add_onlink_route(luid: u64, prefix: IpAddr, prefix_len: u8, metric: u32) -> VpnResult<()> {
    let family = IpFamily::of(prefix);
    let row = owned_forward_row(luid, prefix, prefix_len, onlink_next_hop(family), metric);
    create_forward_entry("CreateIpForwardEntry2(on-link)", &row)?;
    log::info!(
        "on-link route ensured: {} {prefix}/{prefix_len} metric={metric}",
        family.tag()
    );
    Ok(())
}

/// Route a single host on-link through the given interface.
pub fn add_onlink_host_route(luid: u64, ip: IpAddr, metric: u32) -> VpnResult<()> {
    add_onlink_route(luid, ip, IpFamily::of(ip).host_prefix_len(), metric)
}

/// Route a prefix through an explicit gateway on the given interface.
pub fn add_route_via_gateway(
    luid: u64,
    prefix: IpAddr,
    prefix_len: u8,
    gateway: IpAddr,
    metric: u32,
) -> VpnResult<()> {
    let family = IpFamily::of(prefix);
    if IpFamily::of(gateway) != family {
        return Err(VpnError::InvalidArgument(format!(
            "gateway {gateway} does not match prefix family {}",
            family.tag()
        )));
    }
    let row = owned_forward_row(luid, prefix, prefix_len, sockaddr_from_ip(gateway), metric);
    create_forward_entry("CreateIpForwardEntry2(gateway)", &row)?;
    log::info!(
        "route via gateway ensured: {} {prefix}/{prefix_len} via {gateway} metric={metric}",
        family.tag()
    );
    Ok(())
}

/// Ask the stack for the best forwarding entry toward `dest`.
/// "No route" is not an error.
pub fn best_route_to(dest: IpAddr) -> Option<MIB_IPFORWARD_ROW2> {
    let dst = sockaddr_from_ip(dest);
    let mut route = MIB_IPFORWARD_ROW2::default();
    let mut source = SOCKADDR_INET::default();
    let rc = unsafe { GetBestRoute2(None, 0, None, &dst, 0, &mut route, &mut source) };
    if rc == NO_ERROR {
        log::debug!(
            "best route to {dest}: IfLuid={}",
            luid_value(&route.InterfaceLuid)
        );
        Some(route)
    } else {
        log::trace!("best route to {dest}: none (rc={})", rc.0);
        None
    }
}

/// Snapshot the forwarding table for one family.
pub(crate) fn forward_table(family: IpFamily) -> VpnResult<Vec<MIB_IPFORWARD_ROW2>> {
    let mut table: *mut MIB_IPFORWARD_TABLE2 = std::ptr::null_mut();
    unsafe {
        check("GetIpForwardTable2", GetIpForwardTable2(family.family(), &mut table))?;
        let rows = std::slice::from_raw_parts(
            (*table).Table.as_ptr(),
            (*table).NumEntries as usize,
        )
        .to_vec();
        FreeMibTable(table as *const _);
        Ok(rows)
    }
}

/// Linear scan for the lowest-metric default route on any interface
/// other than `exclude`.
pub fn fallback_default_route_excluding(
    exclude: u64,
    family: IpFamily,
) -> VpnResult<Option<MIB_IPFORWARD_ROW2>> {
    let best = forward_table(family)?
        .into_iter()
        .filter(|row| luid_value(&row.InterfaceLuid) != exclude)
        .filter(|row| unsafe { row.DestinationPrefix.Prefix.si_family } == family.family())
        .filter(|row| row.DestinationPrefix.PrefixLength == 0)
        .min_by_key(|row| row.Metric);
    match &best {
        Some(row) => log::debug!(
            "fallback default ({}): IfLuid={} metric={}",
            family.tag(),
            luid_value(&row.InterfaceLuid),
            row.Metric
        ),
        None => log::trace!("fallback default ({}): none", family.tag()),
    }
    Ok(best)
}

/// Next hop for a pinned host route: the via entry's gateway when it
/// carries one of the right family, on-link otherwise.
fn pin_next_hop(family: IpFamily, via: &MIB_IPFORWARD_ROW2) -> SOCKADDR_INET {
    if unsafe { via.NextHop.si_family } == family.family() {
        via.NextHop
    } else {
        onlink_next_hop(family)
    }
}

/// Set or replace the host route to `host` so it travels the same
/// interface (and gateway, when one is present) as `via`. An existing
/// /32 or /128 entry is mutated in place; otherwise a new entry is
/// created, falling back to the legacy IPv4 API on old builds.
pub fn upsert_host_route_via(
    host: IpAddr,
    via: &MIB_IPFORWARD_ROW2,
    metric: u32,
) -> VpnResult<()> {
    let family = IpFamily::of(host);
    if unsafe { via.DestinationPrefix.Prefix.si_family } != family.family() {
        return Err(VpnError::InvalidArgument(
            "host route family does not match the via entry".into(),
        ));
    }

    let desired = owned_forward_row(
        luid_value(&via.InterfaceLuid),
        host,
        family.host_prefix_len(),
        pin_next_hop(family, via),
        metric,
    );

    // Update an existing host entry in place before trying to create.
    if let Ok(rows) = forward_table(family) {
        for mut row in rows {
            if row.DestinationPrefix.PrefixLength != family.host_prefix_len() {
                continue;
            }
            if ip_from_sockaddr(&row.DestinationPrefix.Prefix) != Some(host) {
                continue;
            }
            row.InterfaceLuid = desired.InterfaceLuid;
            row.NextHop = desired.NextHop;
            row.Metric = desired.Metric;
            row.Protocol = MIB_IPPROTO_NETMGMT;
            check("SetIpForwardEntry2(host)", unsafe { SetIpForwardEntry2(&row) })?;
            log::info!("host route updated: {} {host} metric={metric}", family.tag());
            return Ok(());
        }
    }

    let rc = unsafe { CreateIpForwardEntry2(&desired) };
    if rc == NO_ERROR || rc == ERROR_OBJECT_ALREADY_EXISTS {
        log::info!("host route ensured: {} {host} metric={metric}", family.tag());
        return Ok(());
    }
    if family == IpFamily::V6 {
        return Err(VpnError::win32("CreateIpForwardEntry2(v6 host)", rc.0));
    }

    // Some legacy builds reject /32 rows through the modern API; the old
    // one wants an interface index instead of a LUID.
    log::warn!("CreateIpForwardEntry2(v4 host) rc={}, trying legacy API", rc.0);
    let next_hop_addr = unsafe { desired.NextHop.Ipv4.sin_addr.S_un.S_addr };
    let mut legacy = MIB_IPFORWARDROW {
        dwForwardDest: unsafe { desired.DestinationPrefix.Prefix.Ipv4.sin_addr.S_un.S_addr },
        dwForwardMask: u32::MAX,
        dwForwardNextHop: next_hop_addr,
        dwForwardIfIndex: via.InterfaceIndex,
        dwForwardMetric1: metric,
        ..Default::default()
    };
    legacy.Anonymous1 = MIB_IPFORWARDROW_0 {
        // 3 = DIRECT (on-link), 4 = INDIRECT (via gateway)
        dwForwardType: if next_hop_addr == 0 { 3 } else { 4 },
    };
    legacy.Anonymous2 = MIB_IPFORWARDROW_1 {
        dwForwardProto: MIB_IPPROTO_NETMGMT.0 as u32,
    };
    let rc2 = unsafe { CreateIpForwardEntry(&legacy) };
    if rc2 == NO_ERROR.0 || rc2 == ERROR_OBJECT_ALREADY_EXISTS.0 {
        log::info!("host route (legacy) ensured: v4 {host} metric={metric}");
        return Ok(());
    }
    Err(VpnError::win32("CreateIpForwardEntry(legacy v4 host)", rc2))
}

/// Delete every forwarding entry of `family` matching the predicate.
/// Only rows carrying our protocol tag are candidates. Returns the
/// number of rows removed; individual delete failures are logged and
/// reported through the error.
pub fn delete_owned_routes_where<F>(family: IpFamily, pred: F) -> VpnResult<usize>
where
    F: Fn(&MIB_IPFORWARD_ROW2) -> bool,
{
    let doomed: Vec<MIB_IPFORWARD_ROW2> = forward_table(family)?
        .into_iter()
        .filter(|row| row.Protocol == MIB_IPPROTO_NETMGMT)
        .filter(|row| pred(row))
        .collect();

    let mut removed = 0usize;
    let mut failed = 0usize;
    for row in &doomed {
        let rc = unsafe { DeleteIpForwardEntry2(row) };
        if rc == NO_ERROR {
            removed += 1;
        } else {
            log::warn!("DeleteIpForwardEntry2 {} rc={}", family.tag(), rc.0);
            failed += 1;
        }
    }
    log::debug!("owned routes removed: {} n={removed}", family.tag());
    if failed > 0 {
        return Err(VpnError::PartialFailure("route delete", failed));
    }
    Ok(removed)
}

/// One-family reconciliation: MTU, local address, metric, server pin
/// and the split-default pair. Safe to re-run; every step is an upsert.
pub fn configure_family(
    luid: u64,
    server: IpAddr,
    family: IpFamily,
    plan: &AddressPlan,
) -> VpnResult<()> {
    log::info!("configure: begin family={} server={server}", family.tag());

    set_interface_mtu(luid, family, plan.mtu)?;
    add_ip_address(luid, plan.local(family), AddressPlan::local_prefix_len(family))?;
    set_interface_metric(luid, family, 1)?;

    // The pin binds the encrypted transport to its current physical
    // path before the split-defaults would swallow it.
    let mut pinned = false;
    if IpFamily::of(server) == family {
        let via = match best_route_to(server) {
            Some(row) => Some(row),
            None => fallback_default_route_excluding(luid, family)?,
        };
        match via {
            Some(row) => {
                upsert_host_route_via(server, &row, 1)?;
                log::info!(
                    "pinned {} host route to {server} via IfLuid={}",
                    family.tag(),
                    luid_value(&row.InterfaceLuid)
                );
                pinned = true;
            }
            None => log::warn!("no {} route to server before switch", family.tag()),
        }
    } else {
        log::trace!("pin not needed: server family differs");
    }

    if pinned {
        for half in split_default_halves(family) {
            add_route_via_gateway(luid, half, 1, plan.peer(family), 1)?;
        }
        log::info!("split defaults activated via tunnel peer ({})", family.tag());
    }

    log::info!("configure: done family={}", family.tag());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_default_halves_cover_each_family() {
        let [a, b] = split_default_halves(IpFamily::V4);
        assert_eq!(a, "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(b, "128.0.0.0".parse::<IpAddr>().unwrap());

        let [a, b] = split_default_halves(IpFamily::V6);
        assert_eq!(a, "::".parse::<IpAddr>().unwrap());
        assert_eq!(b, "8000::".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn sockaddr_round_trip() {
        for ip in ["203.0.113.5", "fd00:dead:beef::1"] {
            let ip: IpAddr = ip.parse().unwrap();
            assert_eq!(ip_from_sockaddr(&sockaddr_from_ip(ip)), Some(ip));
        }
    }

    #[test]
    fn host_prefix_lengths() {
        assert_eq!(IpFamily::V4.host_prefix_len(), 32);
        assert_eq!(IpFamily::V6.host_prefix_len(), 128);
    }

    #[test]
    fn pin_reuses_gateway_of_matching_family() {
        let gateway: IpAddr = "192.0.2.1".parse().unwrap();
        let mut via = MIB_IPFORWARD_ROW2::default();
        via.NextHop = sockaddr_from_ip(gateway);
        let hop = pin_next_hop(IpFamily::V4, &via);
        assert_eq!(ip_from_sockaddr(&hop), Some(gateway));
    }

    #[test]
    fn pin_falls_back_to_onlink_for_zero_next_hop() {
        // A fallback row with a family-zero next hop means on-link
        // delivery; the pin must preserve that, not invent a gateway.
        let via = MIB_IPFORWARD_ROW2::default();
        let hop = pin_next_hop(IpFamily::V6, &via);
        assert_eq!(unsafe { hop.si_family }, AF_INET6);
        assert_eq!(
            ip_from_sockaddr(&hop),
            Some("::".parse::<IpAddr>().unwrap())
        );
    }

    #[test]
    fn plan_accessors_select_family() {
        let plan = AddressPlan {
            local4: "10.200.0.2".parse().unwrap(),
            peer4: "10.200.0.1".parse().unwrap(),
            local6: "fd00::2".parse().unwrap(),
            peer6: "fd00::1".parse().unwrap(),
            mtu: 1400,
        };
        assert_eq!(plan.local(IpFamily::V4), "10.200.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(plan.peer(IpFamily::V6), "fd00::1".parse::<IpAddr>().unwrap());
        assert_eq!(AddressPlan::local_prefix_len(IpFamily::V4), 22);
        assert_eq!(AddressPlan::local_prefix_len(IpFamily::V6), 64);
    }
}
