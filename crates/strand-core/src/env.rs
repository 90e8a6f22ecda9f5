//! Environment variable helpers
//!
//! Used by the runtime configuration to apply `STRAND_*` overrides.

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get an environment variable as a boolean.
///
/// "1", "true", "yes", "on" (case-insensitive) count as true; anything else
/// set counts as false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let v: usize = env_get("STRAND_TEST_UNSET_VAR_XYZ", 17);
        assert_eq!(v, 17);
    }

    #[test]
    fn test_env_get_parsed() {
        std::env::set_var("STRAND_TEST_SET_VAR", "23");
        let v: usize = env_get("STRAND_TEST_SET_VAR", 0);
        assert_eq!(v, 23);
        std::env::remove_var("STRAND_TEST_SET_VAR");
    }

    #[test]
    fn test_env_get_bool() {
        assert!(!env_get_bool("STRAND_TEST_UNSET_VAR_XYZ", false));
        std::env::set_var("STRAND_TEST_BOOL_VAR", "yes");
        assert!(env_get_bool("STRAND_TEST_BOOL_VAR", false));
        std::env::remove_var("STRAND_TEST_BOOL_VAR");
    }
}
