//! Client control-plane tests.
//!
//! These exercise the logic that does not need administrator
//! privileges or live network state. Run with:
//! `cargo test --test client_tests`

use tunbridge_core::config::{strip_bom, strip_brackets, ClientConfig};
use tunbridge_core::vpn::firewall::{FirewallRules, Protocol};
use tunbridge_core::vpn::routes::{split_default_halves, AddressPlan, IpFamily};
use tunbridge_core::VpnError;

fn sample_config(overrides: &[(&str, &str)]) -> String {
    let mut text = r#"{
        "tun": "cvpn0",
        "server": "203.0.113.5",
        "port": 5555,
        "plugin": "./transport.dll",
        "local4": "10.200.0.2",
        "peer4": "10.200.0.1",
        "local6": "fd00:dead:beef::2",
        "peer6": "fd00:dead:beef::1",
        "mtu": 1400,
        "dns": ["10.200.0.1", "1.1.1.1"]
    }"#
    .to_string();
    for (from, to) in overrides {
        text = text.replace(from, to);
    }
    text
}

mod config_tests {
    use super::*;

    #[test]
    fn all_fields_are_required() {
        for field in [
            "tun", "server", "port", "plugin", "local4", "peer4", "local6", "peer6", "mtu", "dns",
        ] {
            let needle = format!("\"{field}\"");
            let text = sample_config(&[(needle.as_str(), "\"_ignored\"")]);
            assert!(
                ClientConfig::from_json(&text).is_err(),
                "config without '{field}' should be rejected"
            );
        }
    }

    #[test]
    fn port_range_is_enforced() {
        let text = sample_config(&[("\"port\": 5555", "\"port\": 0")]);
        assert!(ClientConfig::from_json(&text).is_err());

        let text = sample_config(&[("\"port\": 5555", "\"port\": 70000")]);
        assert!(ClientConfig::from_json(&text).is_err());

        let text = sample_config(&[("\"port\": 5555", "\"port\": 65535")]);
        assert!(ClientConfig::from_json(&text).is_ok());
    }

    #[test]
    fn mtu_range_is_enforced() {
        for (mtu, ok) in [("576", true), ("9200", true), ("575", false), ("9201", false)] {
            let text = sample_config(&[("\"mtu\": 1400", &format!("\"mtu\": {mtu}"))]);
            assert_eq!(ClientConfig::from_json(&text).is_ok(), ok, "mtu={mtu}");
        }
    }

    #[test]
    fn dns_accepts_array_or_csv() {
        let cfg = ClientConfig::from_json(&sample_config(&[])).unwrap();
        assert_eq!(cfg.dns, vec!["10.200.0.1", "1.1.1.1"]);

        let text = sample_config(&[(
            r#"["10.200.0.1", "1.1.1.1"]"#,
            r#"" 10.200.0.1 ,1.1.1.1, ""#,
        )]);
        let cfg = ClientConfig::from_json(&text).unwrap();
        assert_eq!(cfg.dns, vec!["10.200.0.1", "1.1.1.1"]);
    }

    #[test]
    fn dns_must_not_be_empty() {
        let text = sample_config(&[(r#"["10.200.0.1", "1.1.1.1"]"#, r#""  , ""#)]);
        assert!(ClientConfig::from_json(&text).is_err());
    }

    #[test]
    fn unknown_keys_are_allowed() {
        // The config document is shared with the transport plugin.
        let text = sample_config(&[("\"tun\"", "\"srt_latency\": 120, \"tun\"")]);
        assert!(ClientConfig::from_json(&text).is_ok());
    }

    #[test]
    fn bom_is_stripped() {
        let text = format!("\u{feff}{}", sample_config(&[]));
        assert_eq!(strip_bom(&text), sample_config(&[]));
        assert!(ClientConfig::from_json(&text).is_ok());
    }

    #[test]
    fn bracketed_server_is_normalised() {
        assert_eq!(strip_brackets("[fd00:dead:beef::1]"), "fd00:dead:beef::1");
        assert_eq!(strip_brackets("example.net"), "example.net");
    }
}

mod address_plan_tests {
    use super::*;

    #[test]
    fn plan_is_built_from_config_literals() {
        let cfg = ClientConfig::from_json(&sample_config(&[])).unwrap();
        let plan = cfg.address_plan().unwrap();
        assert_eq!(plan.local4.to_string(), "10.200.0.2");
        assert_eq!(plan.peer6.to_string(), "fd00:dead:beef::1");
        assert_eq!(plan.mtu, 1400);
    }

    #[test]
    fn wrong_family_literal_is_rejected() {
        let text = sample_config(&[("\"local4\": \"10.200.0.2\"", "\"local4\": \"fd00::2\"")]);
        assert!(ClientConfig::from_json(&text).is_err());
    }

    #[test]
    fn local_prefixes_cover_the_peer() {
        assert_eq!(AddressPlan::local_prefix_len(IpFamily::V4), 22);
        assert_eq!(AddressPlan::local_prefix_len(IpFamily::V6), 64);
    }
}

mod routing_tests {
    use super::*;
    use std::net::IpAddr;

    #[test]
    fn split_defaults_cover_the_whole_space() {
        // Each half covers exactly half the address space at /1; the
        // two halves differ only in the top bit.
        let [zero, high] = split_default_halves(IpFamily::V4);
        assert_eq!(zero, "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(high, "128.0.0.0".parse::<IpAddr>().unwrap());

        let [zero, high] = split_default_halves(IpFamily::V6);
        assert_eq!(zero, "::".parse::<IpAddr>().unwrap());
        assert_eq!(high, "8000::".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn host_prefixes_per_family() {
        assert_eq!(IpFamily::V4.host_prefix_len(), 32);
        assert_eq!(IpFamily::V6.host_prefix_len(), 128);
        assert_eq!(IpFamily::of("1.2.3.4".parse().unwrap()), IpFamily::V4);
        assert_eq!(IpFamily::of("::1".parse().unwrap()), IpFamily::V6);
    }
}

mod firewall_tests {
    use super::*;

    #[test]
    fn canonical_rule_name_shape() {
        let fw = FirewallRules::new("TunBridge", r"C:\Program Files\TunBridge\tunbridge.exe", "203.0.113.5");
        assert_eq!(
            fw.rule_name(Protocol::Udp, 5555),
            "TunBridge Out UDP to 203.0.113.5:5555"
        );
    }

    #[test]
    fn rule_name_carries_the_address_set() {
        let fw = FirewallRules::new("TunBridge", r"C:\tunbridge.exe", "203.0.113.5,203.0.113.6");
        assert_eq!(
            fw.rule_name(Protocol::Tcp, 443),
            "TunBridge Out TCP to 203.0.113.5,203.0.113.6:443"
        );
    }

    #[test]
    fn empty_prefix_is_rejected() {
        assert!(matches!(
            FirewallRules::remove_by_prefix(""),
            Err(VpnError::InvalidArgument(_))
        ));
    }
}
