//! Baseline capture and transactional revert of network state.
//!
//! The ledger snapshots the interface attribute rows at apply time and
//! undoes the session's route-table footprint on revert: split-default
//! halves and the pinned server route are found by the ownership tag,
//! so no per-route bookkeeping is required.

use std::net::IpAddr;

use super::routes::{
    self, delete_owned_routes_where, ip_from_sockaddr, luid_value, split_default_halves, IpFamily,
};
use super::{VpnError, VpnResult};

#[derive(Debug, Clone, Copy)]
struct FamilyBaseline {
    auto_metric: bool,
    metric: u32,
    mtu: u32,
}

/// Captures interface metrics/MTU on construction and restores the
/// whole footprint on `revert` (or on drop, best-effort).
pub struct NetworkRollback {
    luid: u64,
    server_ip: Option<IpAddr>,
    v4: Option<FamilyBaseline>,
    v6: Option<FamilyBaseline>,
    captured: bool,
}

impl NetworkRollback {
    /// Capture the baseline for both families. Succeeds as long as at
    /// least one family's row is readable.
    pub fn capture(luid: u64, server_ip: Option<IpAddr>) -> VpnResult<Self> {
        log::info!("rollback: capture baseline (IfLuid={luid})");
        let v4 = Self::save_family(luid, IpFamily::V4);
        let v6 = Self::save_family(luid, IpFamily::V6);
        if v4.is_none() && v6.is_none() {
            log::error!("rollback: baseline capture failed for both families");
            return Err(VpnError::Network(
                "failed to capture interface baseline (v4/v6)".into(),
            ));
        }
        log::debug!(
            "rollback: baseline captured v4={} v6={}",
            v4.is_some(),
            v6.is_some()
        );
        Ok(Self {
            luid,
            server_ip,
            v4,
            v6,
            captured: true,
        })
    }

    pub fn has_baseline(&self) -> bool {
        self.captured
    }

    fn save_family(luid: u64, family: IpFamily) -> Option<FamilyBaseline> {
        let row = routes::read_interface_row(luid, family).ok()?;
        let baseline = FamilyBaseline {
            auto_metric: row.UseAutomaticMetric.as_bool(),
            metric: row.Metric,
            mtu: row.NlMtu,
        };
        log::debug!(
            "rollback: saved {} auto_metric={} metric={} mtu={}",
            family.tag(),
            baseline.auto_metric,
            baseline.metric,
            baseline.mtu
        );
        Some(baseline)
    }

    /// Undo everything: split-default halves, the pinned server route,
    /// then the interface baseline. Every step runs even when earlier
    /// ones fail; failures aggregate into one error.
    pub fn revert(&mut self) -> VpnResult<()> {
        if !self.captured {
            return Err(VpnError::Logic("revert called without a captured baseline"));
        }
        log::info!("rollback: revert begin");
        let mut failures = 0usize;

        if let Err(e) = self.remove_split_defaults() {
            log::error!("rollback: split-default removal failed: {e}");
            failures += 1;
        }
        if let Err(e) = self.remove_pinned_route() {
            log::error!("rollback: pinned route removal failed: {e}");
            failures += 1;
        }
        if let Err(e) = self.restore_baseline() {
            log::error!("rollback: baseline restore failed: {e}");
            failures += 1;
        }

        // The baseline is single-use; a second revert has nothing to do.
        self.captured = false;

        if failures > 0 {
            return Err(VpnError::PartialFailure("network rollback", failures));
        }
        log::info!("rollback: revert done");
        Ok(())
    }

    /// Remove our half-space routes on our interface for both families.
    fn remove_split_defaults(&self) -> VpnResult<()> {
        let mut any_ok = false;
        for family in [IpFamily::V4, IpFamily::V6] {
            let halves = split_default_halves(family);
            let luid = self.luid;
            let result = delete_owned_routes_where(family, |row| {
                if luid_value(&row.InterfaceLuid) != luid {
                    return false;
                }
                if row.DestinationPrefix.PrefixLength != 1 {
                    return false;
                }
                match ip_from_sockaddr(&row.DestinationPrefix.Prefix) {
                    Some(dest) => halves.contains(&dest),
                    None => false,
                }
            });
            match result {
                Ok(n) => {
                    any_ok = true;
                    log::debug!("rollback: {} split defaults removed: {n}", family.tag());
                }
                Err(e) => log::warn!("rollback: {} split defaults: {e}", family.tag()),
            }
        }
        if any_ok {
            Ok(())
        } else {
            Err(VpnError::Network("failed to remove split-default routes".into()))
        }
    }

    /// Remove the /32 or /128 pin to the server, wherever it lives.
    fn remove_pinned_route(&self) -> VpnResult<()> {
        let Some(server) = self.server_ip else {
            log::trace!("rollback: no server ip, pin removal skipped");
            return Ok(());
        };
        let family = IpFamily::of(server);
        let removed = delete_owned_routes_where(family, |row| {
            row.DestinationPrefix.PrefixLength == family.host_prefix_len()
                && ip_from_sockaddr(&row.DestinationPrefix.Prefix) == Some(server)
        })?;
        log::info!("rollback: pinned route removed ({} entries)", removed);
        Ok(())
    }

    fn restore_baseline(&self) -> VpnResult<()> {
        let mut ok = true;
        for (family, baseline) in [(IpFamily::V4, &self.v4), (IpFamily::V6, &self.v6)] {
            let Some(baseline) = baseline else { continue };
            ok &= Self::restore_family(self.luid, family, baseline);
        }
        if ok {
            log::info!("rollback: baseline restored");
            Ok(())
        } else {
            Err(VpnError::Network("failed to restore interface metrics/mtu".into()))
        }
    }

    /// Two writes per family: metric fields first, then MTU, each
    /// tolerating ERROR_INVALID_PARAMETER like the forward path does.
    fn restore_family(luid: u64, family: IpFamily, baseline: &FamilyBaseline) -> bool {
        let metric_ok = routes::read_interface_row(luid, family)
            .and_then(|mut row| {
                row.UseAutomaticMetric = baseline.auto_metric.into();
                row.Metric = baseline.metric;
                routes::write_interface_row("SetIpInterfaceEntry(restore metric)", &mut row)
            })
            .map_err(|e| log::warn!("rollback: restore metric {}: {e}", family.tag()))
            .is_ok();

        let mtu_ok = routes::read_interface_row(luid, family)
            .and_then(|mut row| {
                row.NlMtu = baseline.mtu;
                routes::write_interface_row("SetIpInterfaceEntry(restore mtu)", &mut row)
            })
            .map_err(|e| log::warn!("rollback: restore mtu {}: {e}", family.tag()))
            .is_ok();

        metric_ok && mtu_ok
    }
}

impl Drop for NetworkRollback {
    fn drop(&mut self) {
        if self.captured {
            log::debug!("rollback: dropping with baseline, reverting");
            if let Err(e) = self.revert() {
                log::warn!("rollback: revert on drop failed: {e}");
            }
        }
    }
}
