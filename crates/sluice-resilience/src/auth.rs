//! API key lookup for remote providers
//!
//! Each provider names the environment variable holding its key
//! (`api_key_env` in `.sluice/config.toml`). Keys are read when the client
//! is built, never written to config or logs.

use sluice_core::{Result, SluiceError};
use std::env;

/// Read a provider's API key from the environment variable `var`
///
/// Empty values are treated as missing.
pub fn api_key_from_env(provider: &str, var: &str) -> Result<String> {
    match env::var(var) {
        Ok(key) if !key.trim().is_empty() => {
            tracing::debug!(provider, env = var, "Using API key from environment");
            Ok(key)
        }
        _ => Err(SluiceError::Config(format!(
            "No API key for provider '{}'. Set {}=<key> or change api_key_env in .sluice/config.toml",
            provider, var
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to prevent concurrent env var modifications
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env_var<F, R>(key: &str, value: Option<&str>, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = ENV_LOCK.lock().unwrap();
        let original = env::var(key).ok();

        match value {
            Some(v) => env::set_var(key, v),
            None => env::remove_var(key),
        }

        let result = f();

        match original {
            Some(v) => env::set_var(key, v),
            None => env::remove_var(key),
        }

        result
    }

    #[test]
    fn test_reads_configured_variable() {
        with_env_var("SLUICE_TEST_KEY_A", Some("sk-test"), || {
            let key = api_key_from_env("primary", "SLUICE_TEST_KEY_A").unwrap();
            assert_eq!(key, "sk-test");
        });
    }

    #[test]
    fn test_missing_key_names_variable() {
        with_env_var("SLUICE_TEST_KEY_B", None, || {
            let err = api_key_from_env("primary", "SLUICE_TEST_KEY_B").unwrap_err();
            assert!(err.to_string().contains("SLUICE_TEST_KEY_B"));
            assert!(err.to_string().contains("primary"));
        });
    }

    #[test]
    fn test_blank_key_is_missing() {
        with_env_var("SLUICE_TEST_KEY_C", Some("   "), || {
            assert!(api_key_from_env("primary", "SLUICE_TEST_KEY_C").is_err());
        });
    }
}
