//! Runtime configuration, read once when a runtime is built.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How unreachable handles reach their releasers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorMode {
    /// Dropping the last owner releases synchronously.
    #[default]
    Immediate,
    /// Dropping the last owner queues the release for the collector worker.
    Deferred,
    /// Releases are queued and only drained on explicit request.
    Disabled,
}

impl FromStr for CollectorMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(CollectorMode::Immediate),
            "deferred" => Ok(CollectorMode::Deferred),
            "disabled" | "off" | "none" => Ok(CollectorMode::Disabled),
            other => Err(Error::Config(format!("unknown collector mode '{other}'"))),
        }
    }
}

impl fmt::Display for CollectorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CollectorMode::Immediate => "immediate",
            CollectorMode::Deferred => "deferred",
            CollectorMode::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Ceiling on the sum of tracked bytes. 0 disables the check.
    pub max_bytes: usize,

    /// Ceiling on resident process memory. 0 disables the check.
    pub max_physical_bytes: usize,

    /// Forced-collection rounds before an over-budget admission fails.
    pub max_retries: usize,

    /// Pause after each forced collection.
    pub retry_pause_ms: u64,

    pub collector: CollectorMode,

    /// Spawn the background worker in `Deferred` mode.
    pub collector_worker: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_bytes: 0,
            max_physical_bytes: 0,
            max_retries: 10,
            retry_pause_ms: 100,
            collector: CollectorMode::Immediate,
            collector_worker: true,
        }
    }
}

impl RuntimeConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `NATMEM_MAX_BYTES`: tracked-bytes ceiling (accepts `k`/`m`/`g`/`t`)
    /// - `NATMEM_MAX_PHYSICAL_BYTES`: resident-memory ceiling
    /// - `NATMEM_MAX_RETRIES`: forced collections before failing
    /// - `NATMEM_RETRY_PAUSE_MS`: pause after each forced collection
    /// - `NATMEM_COLLECTOR`: `immediate`, `deferred`, or `disabled`
    /// - `NATMEM_COLLECTOR_WORKER`: `true`/`false`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("NATMEM_MAX_BYTES") {
            if let Ok(v) = parse_bytes(&s) {
                cfg.max_bytes = v;
            }
        }

        if let Ok(s) = std::env::var("NATMEM_MAX_PHYSICAL_BYTES") {
            if let Ok(v) = parse_bytes(&s) {
                cfg.max_physical_bytes = v;
            }
        }

        if let Ok(s) = std::env::var("NATMEM_MAX_RETRIES") {
            if let Ok(v) = s.trim().parse::<usize>() {
                cfg.max_retries = v;
            }
        }

        if let Ok(s) = std::env::var("NATMEM_RETRY_PAUSE_MS") {
            if let Ok(v) = s.trim().parse::<u64>() {
                cfg.retry_pause_ms = v;
            }
        }

        if let Ok(s) = std::env::var("NATMEM_COLLECTOR") {
            if let Ok(v) = s.parse::<CollectorMode>() {
                cfg.collector = v;
            }
        }

        if let Ok(s) = std::env::var("NATMEM_COLLECTOR_WORKER") {
            if let Ok(v) = s.trim().parse::<bool>() {
                cfg.collector_worker = v;
            }
        }

        cfg
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }
}

/// Parse a byte count with an optional binary suffix (`k`, `m`, `g`, `t`).
pub fn parse_bytes(s: &str) -> Result<usize> {
    let s = s.trim();
    let (digits, shift) = match s.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_lowercase() {
                'k' => 10,
                'm' => 20,
                'g' => 30,
                't' => 40,
                _ => return Err(Error::Config(format!("unknown byte suffix in '{s}'"))),
            };
            (&s[..i], shift)
        }
        _ => (s, 0),
    };
    let base = digits
        .trim()
        .parse::<usize>()
        .map_err(|e| Error::Config(format!("invalid byte count '{s}': {e}")))?;
    base.checked_mul(1usize << shift)
        .ok_or_else(|| Error::Config(format!("byte count '{s}' overflows")))
}

/// Render a byte count in the suffix notation `parse_bytes` accepts, rounded
/// down to the largest unit that still leaves at least 100 (`102399`, `100K`).
pub fn format_bytes(bytes: usize) -> String {
    const SPAN: usize = 1024 * 100;
    let mut scaled = bytes;
    for unit in ["", "K", "M", "G"] {
        if scaled < SPAN {
            return format!("{scaled}{unit}");
        }
        scaled /= 1024;
    }
    format!("{scaled}T")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bytes_suffixes() {
        assert_eq!(parse_bytes("1000").unwrap(), 1000);
        assert_eq!(parse_bytes("4k").unwrap(), 4096);
        assert_eq!(parse_bytes("512M").unwrap(), 512 << 20);
        assert_eq!(parse_bytes(" 2g ").unwrap(), 2 << 30);
        assert!(parse_bytes("12q").is_err());
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("m").is_err());
    }

    #[test]
    fn test_format_bytes_units() {
        assert_eq!(format_bytes(600), "600");
        assert_eq!(format_bytes(1024 * 100 - 1), "102399");
        assert_eq!(format_bytes(1024 * 100), "100K");
        assert_eq!(format_bytes(512 << 20), "512M");
        assert_eq!(format_bytes(200 << 30), "200G");
        assert_eq!(format_bytes(200 << 40), "200T");
        assert_eq!(parse_bytes(&format_bytes(100 << 20)).unwrap(), 100 << 20);
    }

    #[test]
    fn test_collector_mode_parse() {
        assert_eq!(
            "Deferred".parse::<CollectorMode>().unwrap(),
            CollectorMode::Deferred
        );
        assert_eq!(
            "off".parse::<CollectorMode>().unwrap(),
            CollectorMode::Disabled
        );
        assert!("sometimes".parse::<CollectorMode>().is_err());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let cfg = RuntimeConfig::from_json(r#"{"max_bytes": 1000, "collector": "disabled"}"#)
            .unwrap();
        assert_eq!(cfg.max_bytes, 1000);
        assert_eq!(cfg.collector, CollectorMode::Disabled);
        assert_eq!(cfg.max_retries, 10);
        assert!(cfg.collector_worker);
    }
}
