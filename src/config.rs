//! Daemon configuration from `DISPENSD_*` environment variables.
//!
//! Numbers fall back to their defaults when unset or unparsable. Choices
//! that pick hardware behavior (device, direction, policies) must parse.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::device::{Direction, SimStep, StageTimeouts};
use crate::dispense::{AmbiguousUnitPolicy, DispenseSettings, RetryPolicy};
use crate::ledger::SlotOrdering;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}={value:?}: {reason}")]
    Invalid { key: &'static str, value: String, reason: String },
    #[error("{0} is required for this device")]
    Missing(&'static str),
    #[error("{0}")]
    Validation(&'static str),
}

/// Where the firmware lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceConfig {
    Simulated { script: Vec<SimStep> },
    /// A tty device node.
    Serial { path: PathBuf },
    /// A serial-over-TCP bridge such as ser2net.
    Tcp { addr: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub device: DeviceConfig,
    pub timeouts: StageTimeouts,
    pub direction: Direction,
    pub ordering: SlotOrdering,
    pub dispense: DispenseSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let num = |key: &str| get(key).and_then(|s| s.trim().parse::<u64>().ok());
        // Out-of-range values fall back like unparsable ones instead of wrapping.
        let count = |key: &str| num(key).and_then(|n| u32::try_from(n).ok());
        let millis = |key: &str, default: Duration| num(key).map_or(default, Duration::from_millis);

        let device = match get("DISPENSD_DEVICE").as_deref().unwrap_or("simulated") {
            "simulated" | "sim" => {
                let script = match get("DISPENSD_SIM_SCRIPT") {
                    Some(s) => SimStep::parse_script(&s).map_err(|reason| ConfigError::Invalid {
                        key: "DISPENSD_SIM_SCRIPT",
                        value: s.clone(),
                        reason,
                    })?,
                    None => Vec::new(),
                };
                DeviceConfig::Simulated { script }
            }
            "serial" => DeviceConfig::Serial {
                path: get("DISPENSD_SERIAL_PATH").map(PathBuf::from).ok_or(ConfigError::Missing("DISPENSD_SERIAL_PATH"))?,
            },
            "tcp" => DeviceConfig::Tcp {
                addr: get("DISPENSD_DEVICE_ADDR").ok_or(ConfigError::Missing("DISPENSD_DEVICE_ADDR"))?,
            },
            other => {
                return Err(ConfigError::Invalid {
                    key: "DISPENSD_DEVICE",
                    value: other.to_string(),
                    reason: "expected simulated, serial or tcp".into(),
                });
            }
        };

        let base = StageTimeouts::default();
        let timeouts = StageTimeouts {
            ready: millis("DISPENSD_READY_TIMEOUT_MS", base.ready),
            motor_ack: millis("DISPENSD_MOTOR_ACK_TIMEOUT_MS", base.motor_ack),
            sensor_confirm: millis("DISPENSD_SENSOR_TIMEOUT_MS", base.sensor_confirm),
            cycle_complete: millis("DISPENSD_DONE_TIMEOUT_MS", base.cycle_complete),
        };

        let mut dispense = DispenseSettings::default();
        let unit = RetryPolicy::unit_default();
        dispense.unit_retry = RetryPolicy {
            max_attempts: count("DISPENSD_UNIT_ATTEMPTS").unwrap_or(unit.max_attempts),
            initial_backoff: millis("DISPENSD_UNIT_BACKOFF_MS", unit.initial_backoff),
            max_backoff: millis("DISPENSD_UNIT_MAX_BACKOFF_MS", unit.max_backoff),
        };
        if let Some(n) = count("DISPENSD_ALLOCATION_ATTEMPTS") {
            dispense.allocation_retry.max_attempts = n;
        }
        if let Some(s) = get("DISPENSD_FALLBACK") {
            dispense.fallback.enabled = !matches!(s.trim(), "0" | "false" | "off" | "no");
        }
        if let Some(n) = count("DISPENSD_FALLBACK_MAX_UNITS") {
            dispense.fallback.max_units = n;
        }
        dispense.ambiguous_policy = choice(&get, "DISPENSD_AMBIGUOUS_POLICY")?.unwrap_or_default();

        let config = Config {
            bind: get("DISPENSD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: num("DISPENSD_PORT").and_then(|p| u16::try_from(p).ok()).unwrap_or(7878),
            data_dir: get("DISPENSD_DATA_DIR").map_or_else(|| PathBuf::from("./data"), PathBuf::from),
            metrics_port: num("DISPENSD_METRICS_PORT").and_then(|p| u16::try_from(p).ok()),
            max_connections: num("DISPENSD_MAX_CONNECTIONS").and_then(|n| usize::try_from(n).ok()).unwrap_or(64),
            compact_threshold: num("DISPENSD_COMPACT_THRESHOLD").unwrap_or(1000),
            device,
            timeouts,
            direction: choice(&get, "DISPENSD_MOTOR_DIRECTION")?.unwrap_or_default(),
            ordering: choice(&get, "DISPENSD_SLOT_ORDERING")?.unwrap_or_default(),
            dispense,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timeouts.validate().map_err(ConfigError::Validation)?;
        self.dispense.unit_retry.validate().map_err(ConfigError::Validation)?;
        self.dispense.allocation_retry.validate().map_err(ConfigError::Validation)?;
        if self.max_connections == 0 {
            return Err(ConfigError::Validation("max connections must be at least 1"));
        }
        if self.compact_threshold == 0 {
            return Err(ConfigError::Validation("compact threshold must be at least 1"));
        }
        Ok(())
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("ledger.wal")
    }
}

fn choice<T: FromStr<Err = String>>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match get(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|reason| ConfigError::Invalid { key, value, reason }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let c = load(&[]).unwrap();
        assert_eq!(c.port, 7878);
        assert_eq!(c.device, DeviceConfig::Simulated { script: vec![] });
        assert_eq!(c.dispense.unit_retry.max_attempts, 2);
        assert!(c.dispense.fallback.enabled);
        assert_eq!(c.dispense.ambiguous_policy, AmbiguousUnitPolicy::Restore);
        assert_eq!(c.ordering, SlotOrdering::MostStocked);
        assert_eq!(c.wal_path(), PathBuf::from("./data/ledger.wal"));
    }

    #[test]
    fn bad_numbers_fall_back() {
        let c = load(&[("DISPENSD_PORT", "not-a-port"), ("DISPENSD_MAX_CONNECTIONS", "-3")]).unwrap();
        assert_eq!(c.port, 7878);
        assert_eq!(c.max_connections, 64);
    }

    #[test]
    fn out_of_range_counts_fall_back_instead_of_wrapping() {
        // 2^32 and 2^32 + 1 would truncate to 0 and 1.
        let c = load(&[
            ("DISPENSD_UNIT_ATTEMPTS", "4294967296"),
            ("DISPENSD_ALLOCATION_ATTEMPTS", "4294967297"),
            ("DISPENSD_FALLBACK_MAX_UNITS", "4294967296"),
        ])
        .unwrap();
        assert_eq!(c.dispense.unit_retry.max_attempts, 2);
        assert_eq!(c.dispense.allocation_retry.max_attempts, 8);
        assert_eq!(c.dispense.fallback.max_units, 4);

        let c = load(&[("DISPENSD_UNIT_ATTEMPTS", "4294967295"), ("DISPENSD_FALLBACK_MAX_UNITS", "0")]).unwrap();
        assert_eq!(c.dispense.unit_retry.max_attempts, u32::MAX);
        assert_eq!(c.dispense.fallback.max_units, 0);
    }

    #[test]
    fn device_selection() {
        let c = load(&[("DISPENSD_DEVICE", "serial"), ("DISPENSD_SERIAL_PATH", "/dev/ttyUSB0")]).unwrap();
        assert_eq!(c.device, DeviceConfig::Serial { path: PathBuf::from("/dev/ttyUSB0") });
        assert_eq!(load(&[("DISPENSD_DEVICE", "tcp")]), Err(ConfigError::Missing("DISPENSD_DEVICE_ADDR")));
        assert!(matches!(load(&[("DISPENSD_DEVICE", "usb")]), Err(ConfigError::Invalid { .. })));

        let c = load(&[("DISPENSD_SIM_SCRIPT", "ok,no_drop")]).unwrap();
        assert_eq!(c.device, DeviceConfig::Simulated { script: vec![SimStep::Ok, SimStep::NoDrop] });
    }

    #[test]
    fn zero_timeout_rejected() {
        let err = load(&[("DISPENSD_MOTOR_ACK_TIMEOUT_MS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(load(&[("DISPENSD_UNIT_ATTEMPTS", "0")]).is_err());
    }

    #[test]
    fn policies_parse_strictly() {
        let c = load(&[
            ("DISPENSD_AMBIGUOUS_POLICY", "retain"),
            ("DISPENSD_MOTOR_DIRECTION", "rev"),
            ("DISPENSD_SLOT_ORDERING", "mapping_order"),
            ("DISPENSD_FALLBACK", "off"),
        ])
        .unwrap();
        assert_eq!(c.dispense.ambiguous_policy, AmbiguousUnitPolicy::Retain);
        assert_eq!(c.direction, Direction::Reverse);
        assert_eq!(c.ordering, SlotOrdering::MappingOrder);
        assert!(!c.dispense.fallback.enabled);
        assert!(load(&[("DISPENSD_AMBIGUOUS_POLICY", "bill")]).is_err());
    }
}
