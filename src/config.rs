//! Configuration file loader
//!
//! The tester reads a plain `key value` file (one pair per line, `#`
//! starts a comment). Keys not listed here are errors: a typo in a
//! benchmark setup must never turn into a silent default.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;
use tracing::info;

use crate::map::{Bmr, BmrDerived, MapError, DMR_PREFIX_LENGTHS};

/// Config file used when `MAPTBENCH_CONF` is not set.
pub const DEFAULT_CONFIG_FILE: &str = "maptbench.conf";
/// Environment variable overriding the config file location.
pub const CONFIG_ENV_VAR: &str = "MAPTBENCH_CONF";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't open config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config line {line}: {message}")]
    Line { line: usize, message: String },
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Map(#[from] MapError),
}

/// How a UDP port number axis varies from frame to frame (RFC 4814).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortVarMode {
    Increment,
    Decrement,
    Random,
}

impl PortVarMode {
    fn parse(value: &str) -> Result<Self, String> {
        match value {
            "1" => Ok(PortVarMode::Increment),
            "2" => Ok(PortVarMode::Decrement),
            "3" => Ok(PortVarMode::Random),
            _ => Err("must be either 1 for increasing, 2 for decreasing, or 3 for random".into()),
        }
    }
}

/// A MAC address in config-file notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts.next().ok_or("expected xx:xx:xx:xx:xx:xx")?;
            *octet = u8::from_str_radix(part, 16).map_err(|_| "expected xx:xx:xx:xx:xx:xx")?;
        }
        if parts.next().is_some() {
            return Err("expected xx:xx:xx:xx:xx:xx".into());
        }
        Ok(MacAddr(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Validated tester configuration, immutable for the rest of the run.
#[derive(Debug, Clone)]
pub struct Config {
    pub tester_left_ipv6: Ipv6Addr,
    pub tester_right_ipv6: Ipv6Addr,
    pub tester_right_ipv4: Ipv4Addr,
    pub tester_left_mac: MacAddr,
    pub tester_right_mac: MacAddr,
    pub dut_left_mac: MacAddr,
    pub dut_right_mac: MacAddr,
    /// Interface names of the two physical test ports.
    pub left_port: String,
    pub right_port: String,

    pub fwd_var_sport: PortVarMode,
    pub fwd_var_dport: PortVarMode,
    pub rev_var_sport: PortVarMode,
    pub rev_var_dport: PortVarMode,
    pub fwd_dport_min: u16,
    pub fwd_dport_max: u16,
    pub rev_sport_min: u16,
    pub rev_sport_max: u16,
    pub bg_sport_min: u16,
    pub bg_sport_max: u16,
    pub bg_dport_min: u16,
    pub bg_dport_max: u16,

    pub num_of_ces: u32,
    pub bmr: Bmr,
    pub dmr_ipv6_prefix: Ipv6Addr,
    pub dmr_ipv6_prefix_length: u8,

    pub left_sender_cpu: Option<usize>,
    pub right_receiver_cpu: Option<usize>,
    pub right_sender_cpu: Option<usize>,
    pub left_receiver_cpu: Option<usize>,

    pub memory_channels: u8,
    pub forward: bool,
    pub reverse: bool,
    pub promisc: bool,
}

/// Accumulates key/value pairs before validation. Keys without a safe
/// default stay `None` until the file provides them.
#[derive(Default)]
struct Loader {
    tester_left_ipv6: Option<Ipv6Addr>,
    tester_right_ipv6: Option<Ipv6Addr>,
    tester_right_ipv4: Option<Ipv4Addr>,
    tester_left_mac: Option<MacAddr>,
    tester_right_mac: Option<MacAddr>,
    dut_left_mac: Option<MacAddr>,
    dut_right_mac: Option<MacAddr>,
    left_port: Option<String>,
    right_port: Option<String>,
    fwd_var_sport: Option<PortVarMode>,
    fwd_var_dport: Option<PortVarMode>,
    rev_var_sport: Option<PortVarMode>,
    rev_var_dport: Option<PortVarMode>,
    fwd_dport_min: Option<u16>,
    fwd_dport_max: Option<u16>,
    rev_sport_min: Option<u16>,
    rev_sport_max: Option<u16>,
    bg_sport_min: Option<u16>,
    bg_sport_max: Option<u16>,
    bg_dport_min: Option<u16>,
    bg_dport_max: Option<u16>,
    num_of_ces: Option<u32>,
    bmr_ipv6_prefix: Option<Ipv6Addr>,
    bmr_ipv6_prefix_length: Option<u8>,
    bmr_ipv4_prefix: Option<Ipv4Addr>,
    bmr_ipv4_prefix_length: Option<u8>,
    bmr_ea_length: Option<u8>,
    dmr_ipv6_prefix: Option<Ipv6Addr>,
    dmr_ipv6_prefix_length: Option<u8>,
    left_sender_cpu: Option<usize>,
    right_receiver_cpu: Option<usize>,
    right_sender_cpu: Option<usize>,
    left_receiver_cpu: Option<usize>,
    memory_channels: Option<u8>,
    forward: Option<bool>,
    reverse: Option<bool>,
    promisc: Option<bool>,
}

fn parse<T: FromStr>(value: &str, what: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("unable to read '{what}'"))
}

fn parse_bool(value: &str, what: &str) -> Result<bool, String> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(format!("'{what}' must be either 0 for inactive or 1 for active")),
    }
}

fn parse_ranged(value: &str, what: &str, min: u64, max: u64) -> Result<u64, String> {
    let v: u64 = parse(value, what)?;
    if v < min || v > max {
        return Err(format!("'{what}' must be >= {min} and <= {max}"));
    }
    Ok(v)
}

impl Loader {
    fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "Tester-L-IPv6" => self.tester_left_ipv6 = Some(parse(value, key)?),
            "Tester-R-IPv6" => self.tester_right_ipv6 = Some(parse(value, key)?),
            "Tester-R-IPv4" => self.tester_right_ipv4 = Some(parse(value, key)?),
            "Tester-L-MAC" => self.tester_left_mac = Some(value.parse()?),
            "Tester-R-MAC" => self.tester_right_mac = Some(value.parse()?),
            "DUT-L-MAC" => self.dut_left_mac = Some(value.parse()?),
            "DUT-R-MAC" => self.dut_right_mac = Some(value.parse()?),
            "Left-Port" => self.left_port = Some(value.to_string()),
            "Right-Port" => self.right_port = Some(value.to_string()),
            "FW-var-sport" => self.fwd_var_sport = Some(PortVarMode::parse(value)?),
            "FW-var-dport" => self.fwd_var_dport = Some(PortVarMode::parse(value)?),
            "RV-var-sport" => self.rev_var_sport = Some(PortVarMode::parse(value)?),
            "RV-var-dport" => self.rev_var_dport = Some(PortVarMode::parse(value)?),
            "FW-dport-min" => self.fwd_dport_min = Some(parse(value, key)?),
            "FW-dport-max" => self.fwd_dport_max = Some(parse(value, key)?),
            "RV-sport-min" => self.rev_sport_min = Some(parse(value, key)?),
            "RV-sport-max" => self.rev_sport_max = Some(parse(value, key)?),
            "bg-sport-min" => self.bg_sport_min = Some(parse(value, key)?),
            "bg-sport-max" => self.bg_sport_max = Some(parse(value, key)?),
            "bg-dport-min" => self.bg_dport_min = Some(parse(value, key)?),
            "bg-dport-max" => self.bg_dport_max = Some(parse(value, key)?),
            "NUM-OF-CEs" => {
                self.num_of_ces = Some(parse_ranged(value, key, 1, 1_000_000)? as u32)
            }
            "BMR-IPv6-Prefix" => self.bmr_ipv6_prefix = Some(parse(value, key)?),
            "BMR-IPv6-prefix-length" => {
                self.bmr_ipv6_prefix_length = Some(parse_ranged(value, key, 1, 64)? as u8)
            }
            "BMR-IPv4-Prefix" => self.bmr_ipv4_prefix = Some(parse(value, key)?),
            "BMR-IPv4-prefix-length" => {
                self.bmr_ipv4_prefix_length = Some(parse_ranged(value, key, 0, 32)? as u8)
            }
            "BMR-EA-length" => self.bmr_ea_length = Some(parse_ranged(value, key, 0, 48)? as u8),
            "DMR-IPv6-Prefix" => self.dmr_ipv6_prefix = Some(parse(value, key)?),
            "DMR-IPv6-prefix-length" => {
                let len = parse_ranged(value, key, 0, 128)? as u8;
                if !DMR_PREFIX_LENGTHS.contains(&len) {
                    return Err(format!(
                        "'{key}' must be one of 32, 40, 48, 56, 64 or 96"
                    ));
                }
                self.dmr_ipv6_prefix_length = Some(len);
            }
            "CPU-FW-Send" => self.left_sender_cpu = Some(parse(value, key)?),
            "CPU-FW-Receive" => self.right_receiver_cpu = Some(parse(value, key)?),
            "CPU-RV-Send" => self.right_sender_cpu = Some(parse(value, key)?),
            "CPU-RV-Receive" => self.left_receiver_cpu = Some(parse(value, key)?),
            "Mem-Channels" => {
                self.memory_channels = Some(parse_ranged(value, key, 1, 255)? as u8)
            }
            "FW" => self.forward = Some(parse_bool(value, key)?),
            "RV" => self.reverse = Some(parse_bool(value, key)?),
            "Promisc" => self.promisc = Some(parse_bool(value, key)?),
            _ => return Err(format!("unrecognized key '{key}'")),
        }
        Ok(())
    }

    fn finish(self) -> Result<Config, ConfigError> {
        fn required<T>(value: Option<T>, key: &str) -> Result<T, ConfigError> {
            value.ok_or_else(|| ConfigError::Invalid(format!("no '{key}' was specified")))
        }

        let forward = self.forward.unwrap_or(true);
        let reverse = self.reverse.unwrap_or(true);
        if !forward && !reverse {
            return Err(ConfigError::Invalid(
                "no active direction was specified".into(),
            ));
        }
        if forward {
            required(self.left_sender_cpu, "CPU-FW-Send")?;
            required(self.right_receiver_cpu, "CPU-FW-Receive")?;
        }
        if reverse {
            required(self.right_sender_cpu, "CPU-RV-Send")?;
            required(self.left_receiver_cpu, "CPU-RV-Receive")?;
        }

        let config = Config {
            tester_left_ipv6: required(self.tester_left_ipv6, "Tester-L-IPv6")?,
            tester_right_ipv6: required(self.tester_right_ipv6, "Tester-R-IPv6")?,
            tester_right_ipv4: required(self.tester_right_ipv4, "Tester-R-IPv4")?,
            tester_left_mac: required(self.tester_left_mac, "Tester-L-MAC")?,
            tester_right_mac: required(self.tester_right_mac, "Tester-R-MAC")?,
            dut_left_mac: required(self.dut_left_mac, "DUT-L-MAC")?,
            dut_right_mac: required(self.dut_right_mac, "DUT-R-MAC")?,
            left_port: required(self.left_port, "Left-Port")?,
            right_port: required(self.right_port, "Right-Port")?,
            // RFC 4814 recommended defaults for the variable port ranges.
            fwd_var_sport: self.fwd_var_sport.unwrap_or(PortVarMode::Random),
            fwd_var_dport: self.fwd_var_dport.unwrap_or(PortVarMode::Random),
            rev_var_sport: self.rev_var_sport.unwrap_or(PortVarMode::Random),
            rev_var_dport: self.rev_var_dport.unwrap_or(PortVarMode::Random),
            fwd_dport_min: self.fwd_dport_min.unwrap_or(1),
            fwd_dport_max: self.fwd_dport_max.unwrap_or(49151),
            rev_sport_min: self.rev_sport_min.unwrap_or(1024),
            rev_sport_max: self.rev_sport_max.unwrap_or(65535),
            bg_sport_min: self.bg_sport_min.unwrap_or(1024),
            bg_sport_max: self.bg_sport_max.unwrap_or(65535),
            bg_dport_min: self.bg_dport_min.unwrap_or(1),
            bg_dport_max: self.bg_dport_max.unwrap_or(49151),
            num_of_ces: required(self.num_of_ces, "NUM-OF-CEs")?,
            bmr: Bmr {
                ipv6_prefix: self
                    .bmr_ipv6_prefix
                    .unwrap_or_else(|| "2001:db8:ce::".parse().unwrap()),
                ipv6_prefix_length: self.bmr_ipv6_prefix_length.unwrap_or(51),
                ipv4_prefix: required(self.bmr_ipv4_prefix, "BMR-IPv4-Prefix")?,
                ipv4_prefix_length: self.bmr_ipv4_prefix_length.unwrap_or(24),
                ea_length: self.bmr_ea_length.unwrap_or(13),
            },
            dmr_ipv6_prefix: self
                .dmr_ipv6_prefix
                .unwrap_or_else(|| "64:ff9b::".parse().unwrap()),
            dmr_ipv6_prefix_length: self.dmr_ipv6_prefix_length.unwrap_or(64),
            left_sender_cpu: self.left_sender_cpu,
            right_receiver_cpu: self.right_receiver_cpu,
            right_sender_cpu: self.right_sender_cpu,
            left_receiver_cpu: self.left_receiver_cpu,
            memory_channels: self.memory_channels.unwrap_or(1),
            forward,
            reverse,
            promisc: self.promisc.unwrap_or(false),
        };

        for (min, max, what) in [
            (config.fwd_dport_min, config.fwd_dport_max, "FW-dport"),
            (config.rev_sport_min, config.rev_sport_max, "RV-sport"),
            (config.bg_sport_min, config.bg_sport_max, "bg-sport"),
            (config.bg_dport_min, config.bg_dport_max, "bg-dport"),
        ] {
            if min > max {
                return Err(ConfigError::Invalid(format!(
                    "'{what}-min' ({min}) is greater than '{what}-max' ({max})"
                )));
            }
        }

        Ok(config)
    }
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::parse_str(&text)?;
        info!("configuration loaded from '{}'", path.display());
        Ok(config)
    }

    /// Parses configuration text; separated from [`Config::load`] so tests
    /// can feed literals.
    pub fn parse_str(text: &str) -> Result<Config, ConfigError> {
        let mut loader = Loader::default();
        for (idx, raw_line) in text.lines().enumerate() {
            let line = raw_line
                .split('#')
                .next()
                .unwrap_or_default()
                .trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(char::is_whitespace)
                .map(|(k, v)| (k, v.trim()))
                .ok_or_else(|| ConfigError::Line {
                    line: idx + 1,
                    message: format!("missing value for '{line}'"),
                })?;
            loader.apply(key, value).map_err(|message| ConfigError::Line {
                line: idx + 1,
                message,
            })?;
        }
        loader.finish()
    }

    /// Derives the BMR working values and checks the CE population fits
    /// into the EA-bit space.
    pub fn derive_bmr(&self) -> Result<BmrDerived, ConfigError> {
        let derived = self.bmr.derive()?;
        if u64::from(self.num_of_ces) > derived.ea_cardinality {
            return Err(ConfigError::Map(MapError::TooManyCes {
                requested: u64::from(self.num_of_ces),
                available: derived.ea_cardinality,
            }));
        }
        Ok(derived)
    }

    /// Path of the config file, honoring `MAPTBENCH_CONF`.
    pub fn default_path() -> String {
        std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> String {
        "\
# tester interfaces
Tester-L-IPv6 2001:2::2
Tester-R-IPv6 2001:2::8
Tester-R-IPv4 198.19.0.2
Tester-L-MAC a0:36:9f:c5:fa:1c
Tester-R-MAC a0:36:9f:c5:fa:1e
DUT-L-MAC a0:36:9f:c5:e6:58
DUT-R-MAC a0:36:9f:c5:e6:5a
Left-Port enp5s0f0
Right-Port enp5s0f1
BMR-IPv4-Prefix 198.18.0.0
NUM-OF-CEs 100
CPU-FW-Send 2
CPU-FW-Receive 4
CPU-RV-Send 6
CPU-RV-Receive 8
"
        .to_string()
    }

    #[test]
    fn minimal_config_gets_rfc4814_defaults() {
        let cfg = Config::parse_str(&minimal()).unwrap();
        assert_eq!(cfg.fwd_var_sport, PortVarMode::Random);
        assert_eq!(cfg.fwd_dport_min, 1);
        assert_eq!(cfg.fwd_dport_max, 49151);
        assert_eq!(cfg.rev_sport_min, 1024);
        assert_eq!(cfg.bg_sport_max, 65535);
        assert!(cfg.forward && cfg.reverse);
        assert!(!cfg.promisc);
        assert_eq!(cfg.bmr.ipv6_prefix_length, 51);
        assert_eq!(cfg.bmr.ea_length, 13);
        assert_eq!(cfg.dmr_ipv6_prefix_length, 64);
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let text = format!("{}\n   # trailing comment\n\n", minimal());
        assert!(Config::parse_str(&text).is_ok());
    }

    #[test]
    fn unknown_key_is_an_error() {
        let text = format!("{}Frob-Factor 9\n", minimal());
        let err = Config::parse_str(&text).unwrap_err();
        assert!(err.to_string().contains("unrecognized key"));
    }

    #[test]
    fn both_directions_disabled_is_an_error() {
        let text = format!("{}FW 0\nRV 0\n", minimal());
        let err = Config::parse_str(&text).unwrap_err();
        assert!(err.to_string().contains("no active direction"));
    }

    #[test]
    fn missing_cpu_for_enabled_direction() {
        let text = minimal().replace("CPU-RV-Send 6\n", "");
        let err = Config::parse_str(&text).unwrap_err();
        assert!(err.to_string().contains("CPU-RV-Send"));

        // Disabling the direction makes the same file valid.
        let text = format!("{}RV 0\n", minimal().replace("CPU-RV-Send 6\n", ""));
        assert!(Config::parse_str(&text).is_ok());
    }

    #[test]
    fn var_mode_out_of_range() {
        let text = format!("{}FW-var-sport 4\n", minimal());
        assert!(Config::parse_str(&text).is_err());
    }

    #[test]
    fn dmr_prefix_length_must_be_admitted() {
        let text = format!("{}DMR-IPv6-prefix-length 72\n", minimal());
        assert!(Config::parse_str(&text).is_err());
        let text = format!("{}DMR-IPv6-prefix-length 96\n", minimal());
        assert!(Config::parse_str(&text).is_ok());
    }

    #[test]
    fn ce_population_bounds() {
        // 254 suffixes x 32 port sets with the default BMR.
        let text = minimal().replace("NUM-OF-CEs 100", "NUM-OF-CEs 8128");
        let cfg = Config::parse_str(&text).unwrap();
        assert!(cfg.derive_bmr().is_ok());

        let text = minimal().replace("NUM-OF-CEs 100", "NUM-OF-CEs 8129");
        let cfg = Config::parse_str(&text).unwrap();
        assert!(cfg.derive_bmr().is_err());
    }

    #[test]
    fn suffixless_bmr_is_rejected() {
        // IPv4 prefix length 32 leaves no suffix bits at all.
        let text = format!(
            "{}BMR-IPv4-prefix-length 32\nBMR-EA-length 5\n",
            minimal().replace("NUM-OF-CEs 100", "NUM-OF-CEs 1")
        );
        let cfg = Config::parse_str(&text).unwrap();
        assert!(cfg.derive_bmr().is_err());
    }

    #[test]
    fn mac_round_trip() {
        let mac: MacAddr = "a0:36:9f:c5:fa:1c".parse().unwrap();
        assert_eq!(mac.to_string(), "a0:36:9f:c5:fa:1c");
        assert!("a0:36:9f:c5:fa".parse::<MacAddr>().is_err());
        assert!("a0:36:9f:c5:fa:1c:00".parse::<MacAddr>().is_err());
    }
}
