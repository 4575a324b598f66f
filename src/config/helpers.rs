//! Shared env-var parsing helpers.
//!
//! Numeric and boolean values fall back to their documented defaults on
//! parse failure (with a warning) instead of refusing to start; a bad
//! `FOUNDRY_POLL_INTERVAL_SECS` should not take the whole service down.

use std::str::FromStr;

/// Read an env var, treating empty values as unset.
pub(crate) fn optional_env(var: &str) -> Option<String> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

/// Read a string env var with a default.
pub(crate) fn parse_string_env(var: &str, default: &str) -> String {
    optional_env(var).unwrap_or_else(|| default.to_string())
}

/// Read a parseable env var, falling back to `default` on invalid input.
pub(crate) fn parse_optional_env<T>(var: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    match optional_env(var) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Invalid {} value '{}', using default {}", var, raw, default);
                default
            }
        },
        None => default,
    }
}
