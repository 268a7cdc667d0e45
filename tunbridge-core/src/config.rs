//! Client configuration parsing and validation.
//!
//! The config file is a single JSON object shared with the transport
//! plugin: the control plane reads the keys below and hands the whole
//! document to the plugin untouched, so unknown keys are deliberately
//! allowed.

use serde::{Deserialize, Deserializer};
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::vpn::routes::AddressPlan;
use crate::vpn::{VpnError, VpnResult};

pub const MTU_MIN: u32 = 576;
pub const MTU_MAX: u32 = 9200;

/// Client-side session configuration. All fields are mandatory.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// TUN adapter name, e.g. "cvpn0".
    pub tun: String,
    /// Server host name or IP literal; IPv6 may be bracketed.
    pub server: String,
    #[serde(deserialize_with = "int_or_string")]
    pub port: u16,
    /// Path to the transport plugin library.
    pub plugin: String,
    pub local4: String,
    pub peer4: String,
    pub local6: String,
    pub peer6: String,
    #[serde(deserialize_with = "int_or_string")]
    pub mtu: u32,
    /// Resolver addresses: an array of strings or one comma-separated string.
    #[serde(deserialize_with = "string_list_or_csv")]
    pub dns: Vec<String>,
}

impl ClientConfig {
    /// Parse and validate a JSON config document.
    pub fn from_json(text: &str) -> VpnResult<Self> {
        let cfg: ClientConfig = serde_json::from_str(strip_bom(text))
            .map_err(|e| VpnError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> VpnResult<()> {
        if self.tun.trim().is_empty() {
            return Err(VpnError::Config("'tun' cannot be empty".into()));
        }
        if self.server.trim().is_empty() {
            return Err(VpnError::Config("'server' cannot be empty".into()));
        }
        if self.plugin.trim().is_empty() {
            return Err(VpnError::Config("'plugin' cannot be empty".into()));
        }
        if self.port == 0 {
            return Err(VpnError::Config("'port' must be in [1..65535]".into()));
        }
        if !(MTU_MIN..=MTU_MAX).contains(&self.mtu) {
            return Err(VpnError::Config(format!(
                "'mtu' must be in [{MTU_MIN}..{MTU_MAX}]"
            )));
        }
        if self.dns.is_empty() {
            return Err(VpnError::Config("'dns' must contain at least one address".into()));
        }
        // Address plan literals are checked here so a bad config is rejected
        // before any system state is touched.
        self.address_plan()?;
        Ok(())
    }

    /// Build the address plan from the four endpoint literals and the MTU.
    pub fn address_plan(&self) -> VpnResult<AddressPlan> {
        let parse4 = |key: &str, s: &str| -> VpnResult<Ipv4Addr> {
            s.parse()
                .map_err(|_| VpnError::Config(format!("'{key}' is not a valid IPv4 address: '{s}'")))
        };
        let parse6 = |key: &str, s: &str| -> VpnResult<Ipv6Addr> {
            s.parse()
                .map_err(|_| VpnError::Config(format!("'{key}' is not a valid IPv6 address: '{s}'")))
        };
        Ok(AddressPlan {
            local4: parse4("local4", &self.local4)?,
            peer4: parse4("peer4", &self.peer4)?,
            local6: parse6("local6", &self.local6)?,
            peer6: parse6("peer6", &self.peer6)?,
            mtu: self.mtu,
        })
    }
}

/// Remove a UTF-8 byte order mark, if present.
pub fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

/// Remove surrounding brackets from an IPv6 literal ("[::1]" -> "::1").
pub fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Accept an integer or a numeric string ("5555").
fn int_or_string<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }

    let value = match Raw::deserialize(deserializer)? {
        Raw::Int(n) => n,
        Raw::Str(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| serde::de::Error::custom(format!("not an integer: '{s}'")))?,
    };
    T::try_from(value).map_err(|_| serde::de::Error::custom(format!("value out of range: {value}")))
}

/// Accept either an array of strings or one comma-separated string.
/// Entries are trimmed; empty entries are dropped.
fn string_list_or_csv<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Csv(String),
    }

    let items = match Raw::deserialize(deserializer)? {
        Raw::List(list) => list,
        Raw::Csv(csv) => csv.split(',').map(str::to_owned).collect(),
    };
    Ok(items
        .into_iter()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> String {
        r#"{
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
        .to_string()
    }

    #[test]
    fn parses_complete_config() {
        let cfg = ClientConfig::from_json(&sample()).unwrap();
        assert_eq!(cfg.tun, "cvpn0");
        assert_eq!(cfg.port, 5555);
        assert_eq!(cfg.dns, vec!["10.200.0.1", "1.1.1.1"]);
        let plan = cfg.address_plan().unwrap();
        assert_eq!(plan.mtu, 1400);
    }

    #[test]
    fn rejects_missing_field() {
        let text = sample().replace(r#""port": 5555,"#, "");
        assert!(ClientConfig::from_json(&text).is_err());
    }

    #[test]
    fn accepts_numeric_strings() {
        let text = sample()
            .replace("\"port\": 5555", "\"port\": \"5555\"")
            .replace("\"mtu\": 1400", "\"mtu\": \"1400\"");
        let cfg = ClientConfig::from_json(&text).unwrap();
        assert_eq!(cfg.port, 5555);
        assert_eq!(cfg.mtu, 1400);
    }

    #[test]
    fn accepts_csv_dns() {
        let text = sample().replace(
            r#"["10.200.0.1", "1.1.1.1"]"#,
            r#""10.200.0.1, 1.1.1.1 ,""#,
        );
        let cfg = ClientConfig::from_json(&text).unwrap();
        assert_eq!(cfg.dns, vec!["10.200.0.1", "1.1.1.1"]);
    }

    #[test]
    fn rejects_out_of_range_mtu() {
        for bad in ["100", "9300"] {
            let text = sample().replace("\"mtu\": 1400", &format!("\"mtu\": {bad}"));
            assert!(ClientConfig::from_json(&text).is_err());
        }
    }

    #[test]
    fn rejects_bad_address_plan() {
        let text = sample().replace("10.200.0.2", "not-an-ip");
        assert!(ClientConfig::from_json(&text).is_err());
    }

    #[test]
    fn strips_bom() {
        let text = format!("\u{feff}{}", sample());
        assert!(ClientConfig::from_json(&text).is_ok());
    }

    #[test]
    fn strips_brackets() {
        assert_eq!(strip_brackets("[fd00::1]"), "fd00::1");
        assert_eq!(strip_brackets("203.0.113.5"), "203.0.113.5");
        assert_eq!(strip_brackets("[unclosed"), "[unclosed");
    }
}
