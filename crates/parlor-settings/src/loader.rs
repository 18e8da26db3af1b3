//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ParlorSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `PARLOR_*` environment variable overrides
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::ParlorSettings;

/// Resolve the path to the settings file (`~/.parlor/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parlor").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ParlorSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; malformed JSON or an invalid combination
/// of values is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ParlorSettings> {
    load_with(path, |key| std::env::var(key).ok())
}

fn load_with(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<ParlorSettings> {
    let defaults = serde_json::to_value(ParlorSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content =
            std::fs::read_to_string(path).map_err(|source| SettingsError::Unreadable {
                path: path.to_path_buf(),
                source,
            })?;
        let user: Value =
            serde_json::from_str(&content).map_err(|source| SettingsError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ParlorSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, lookup);
    settings.validate()?;
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

/// Apply `PARLOR_*` environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored, leaving the file/default value.
pub fn apply_env_overrides(settings: &mut ParlorSettings) {
    apply_overrides(settings, |key| std::env::var(key).ok());
}

fn apply_overrides(settings: &mut ParlorSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("PARLOR_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64_in("PARLOR_PORT", 0, 65_535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = env.string("PARLOR_SEED_PATH") {
        settings.server.seed_path = Some(v);
    }

    // ── Gateway ─────────────────────────────────────────────────────
    if let Some(v) = env.u64_in("PARLOR_MAX_CONNECTIONS_PER_USER", 1, 1_000) {
        settings.gateway.max_connections_per_user = v as usize;
    }
    if let Some(v) = env.u64_in("PARLOR_HUMAN_IDLE_TIMEOUT_MS", 1_000, 3_600_000) {
        settings.gateway.human_idle_timeout_ms = v;
    }
    if let Some(v) = env.u64_in("PARLOR_BOT_IDLE_TIMEOUT_MS", 1_000, 3_600_000) {
        settings.gateway.bot_idle_timeout_ms = v;
    }
    if let Some(v) = env.bool("PARLOR_TYPING_ORDER") {
        settings.gateway.typing_order_enabled = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("PARLOR_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("PARLOR_LOG_JSON") {
        settings.logging.json = v;
    }
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

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64_in(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, min, max, "invalid integer env var, ignoring");
        }
        result
    }
}
