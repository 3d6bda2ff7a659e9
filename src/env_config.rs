//! Centralized environment-variable parsing helpers.
//!
//! All tuning-knob env-var reads go through these helpers so the
//! truthy/falsey parsing logic lives in exactly one place.

use std::time::Duration;

pub(crate) const REPLY_TIMEOUT_ENV: &str = "SNOW_RELAY_REPLY_TIMEOUT_MS";
pub(crate) const DRAIN_POLL_ENV: &str = "SNOW_RELAY_DRAIN_POLL_MS";
pub(crate) const FULL_WIDTH_FLUSH_ENV: &str = "SNOW_RELAY_FULL_WIDTH_FLUSH";
pub(crate) const SERIAL_TRANSCODE_ENV: &str = "SNOW_RELAY_SERIAL_TRANSCODE";

/// Returns `true` when the environment variable is set to a truthy value
/// (`1`, `true`, `yes`, or `on`, case-insensitive, trimmed).
#[inline]
pub(crate) fn env_var_truthy(var_name: &str) -> bool {
    std::env::var(var_name)
        .map(|raw| parse_truthy(&raw))
        .unwrap_or(false)
}

/// Parses the environment variable as a `u64`, returning `Some` only when
/// the value is a valid positive (> 0) integer.
#[inline]
pub(crate) fn env_var_positive_u64(var_name: &str) -> Option<u64> {
    std::env::var(var_name)
        .ok()
        .and_then(|raw| parse_positive_u64(&raw))
}

/// Millisecond duration from the environment, or `default` when unset or
/// not a positive integer.
pub(crate) fn env_var_millis_or(var_name: &str, default: Duration) -> Duration {
    env_var_positive_u64(var_name)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn parse_truthy(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    normalized == "1" || normalized == "true" || normalized == "yes" || normalized == "on"
}

fn parse_positive_u64(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|value| *value > 0)
}

/// Declares a cached boolean feature flag backed by a `OnceLock<bool>`.
///
/// `enabled_unless(fn_name, "ENV_VAR")` returns `true` unless the env var
/// is truthy (the feature is on by default, disabled by the env var).
///
/// `enabled_when(fn_name, "ENV_VAR")` returns `true` only when the env var
/// is truthy (the feature is off by default, enabled by the env var).
macro_rules! define_env_flag {
    (enabled_unless($fn_name:ident, $var:expr)) => {
        #[inline]
        fn $fn_name() -> bool {
            static VALUE: ::std::sync::OnceLock<bool> = ::std::sync::OnceLock::new();
            *VALUE.get_or_init(|| !$crate::env_config::env_var_truthy($var))
        }
    };
    (enabled_when($fn_name:ident, $var:expr)) => {
        #[inline]
        fn $fn_name() -> bool {
            static VALUE: ::std::sync::OnceLock<bool> = ::std::sync::OnceLock::new();
            *VALUE.get_or_init(|| $crate::env_config::env_var_truthy($var))
        }
    };
}

pub(crate) use define_env_flag;
