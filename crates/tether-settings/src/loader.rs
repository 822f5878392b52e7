//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::TetherSettings;

/// Resolve the default settings file (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or out-of-range delivery
/// timing is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TetherSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TETHER_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_overrides<F>(settings: &mut TetherSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("TETHER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("TETHER_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("TETHER_WS_PATH") {
        settings.server.ws_path = v;
    }
    if let Some(v) = env.string("TETHER_ADVERTISE_ADDRESS") {
        settings.server.advertise_address = Some(v);
    }

    // ── Delivery ────────────────────────────────────────────────────
    if let Some(v) = env.u64("TETHER_IDLE_TIMEOUT_SECS", 1, 86_400) {
        settings.delivery.idle_timeout_secs = v;
    }
    if let Some(v) = env.u64("TETHER_RETRY_DELAY_MS", 1, 3_600_000) {
        settings.delivery.retry_delay_ms = v;
    }
    if let Some(v) = env.u64("TETHER_MAX_ATTEMPTS", 1, 1_000) {
        settings.delivery.max_attempts = u32::try_from(v).unwrap_or(u32::MAX);
    }
    if let Some(v) = env.u64("TETHER_WRITE_TIMEOUT_MS", 1, 600_000) {
        settings.delivery.write_timeout_ms = v;
    }

    // ── Discovery ───────────────────────────────────────────────────
    if let Some(v) = env.bool("TETHER_DISCOVERY_ENABLED") {
        settings.discovery.enabled = v;
    }
    if let Some(v) = env.string("TETHER_CONSUL_ADDRESS") {
        settings.discovery.consul_address = v;
    }
    if let Some(v) = env.string("TETHER_CONSUL_TOKEN") {
        settings.discovery.token = Some(v);
    }
    if let Some(v) = env.string("TETHER_SERVICE_ID") {
        settings.discovery.service_id = Some(v);
    }

    // ── Telemetry ───────────────────────────────────────────────────
    if let Some(v) = env.string("TETHER_LOG_LEVEL") {
        settings.telemetry.log_level = v;
    }
    if let Some(v) = env.bool("TETHER_LOG_JSON") {
        settings.telemetry.json = v;
    }
    if let Some(v) = env.string("TETHER_AUDIT_DB") {
        settings.telemetry.audit_db_path = Some(v);
    }
}

/// Reject timing values the delivery engine cannot run with.
pub fn validate(settings: &TetherSettings) -> Result<()> {
    let d = &settings.delivery;
    if d.max_attempts == 0 {
        return Err(SettingsError::InvalidValue(
            "delivery.maxAttempts must be at least 1".into(),
        ));
    }
    if d.idle_timeout_secs == 0 {
        return Err(SettingsError::InvalidValue(
            "delivery.idleTimeoutSecs must be at least 1".into(),
        ));
    }
    if d.retry_delay_ms == 0 || d.write_timeout_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "delivery.retryDelayMs and delivery.writeTimeoutMs must be positive".into(),
        ));
    }
    if !settings.server.ws_path.starts_with('/') {
        return Err(SettingsError::InvalidValue(format!(
            "server.wsPath must start with '/': {}",
            settings.server.ws_path
        )));
    }
    Ok(())
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = self.string(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = self.string(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}
