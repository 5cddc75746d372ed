//! Configuration loader
//!
//! Loads [`ResilienceSettings`] from environment variables or files.
//!
//! ## Loading Strategy
//! 1. First, attempts to load from environment variables
//! 2. If none are set, falls back to probing for a config file; a variable
//!    that is set but malformed fails the load instead
//! 3. Supports JSON and TOML formats
//! 4. Every loaded configuration is validated before it is returned
//!
//! ## Environment Variables
//! - `BULWARK_CONFIG`: path to a config file
//! - `BULWARK_DEFAULT_TIMEOUT_MS`: per-attempt timeout
//! - `BULWARK_DEFAULT_CONNECT_TIMEOUT_MS`: transport connect timeout
//! - `BULWARK_DEFAULT_WARN_THRESHOLD_FRACTION`: near-timeout warning fraction
//! - `BULWARK_DEFAULT_MAX_ATTEMPTS`: total attempts per call
//! - `BULWARK_DEFAULT_INITIAL_DELAY_MS` / `BULWARK_DEFAULT_MAX_DELAY_MS`
//! - `BULWARK_DEFAULT_MULTIPLIER`: backoff growth factor
//! - `BULWARK_DEFAULT_JITTER`: whether to jitter delays (true/false)
//! - `BULWARK_DEFAULT_FAILURE_THRESHOLD`: failures before a circuit opens
//! - `BULWARK_DEFAULT_COOLDOWN_MS`: time a circuit stays open
//! - `BULWARK_DEFAULT_HALF_OPEN_MAX_TRIALS`: concurrent trial calls
//!
//! The `BULWARK_DEFAULT_*` variables override the defaults of the file named
//! by `BULWARK_CONFIG`, or the built-in defaults when it is unset.
//!
//! ## File Locations
//! The loader probes the following paths (in order):
//! 1. `./bulwark.toml`, `./bulwark.json`
//! 2. `./config/bulwark.toml`, `./config/bulwark.json`
//! 3. The same names next to the executable

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use bulwark_common::resilience::{ResilienceSettings, ServiceOverrides};

use crate::errors::{InfraError, InfraResult};

/// Names a config file to load
pub const CONFIG_PATH_VAR: &str = "BULWARK_CONFIG";

const DEFAULTS_PREFIX: &str = "BULWARK_DEFAULT_";

const CONFIG_FILE_NAMES: [&str; 4] =
    ["bulwark.toml", "bulwark.json", "config/bulwark.toml", "config/bulwark.json"];

/// Load configuration with automatic fallback strategy
///
/// Environment variables win when any are set; otherwise the first config
/// file found by [`probe_config_paths`] is used. A set but malformed variable
/// is an error, never a reason to fall back.
///
/// # Errors
/// Returns `InfraError` if no configuration can be found, a variable or file
/// cannot be read or parsed, or the result fails validation.
pub fn load() -> InfraResult<ResilienceSettings> {
    match load_from_env()? {
        Some(settings) => {
            tracing::info!("Configuration loaded from environment variables");
            Ok(settings)
        }
        None => {
            tracing::debug!("No environment configuration, trying file");
            load_from_file(None)
        }
    }
}

/// Load configuration from environment variables
///
/// `BULWARK_CONFIG` supplies the base; `BULWARK_DEFAULT_*` overrides its
/// defaults. See module documentation for the complete list.
///
/// # Returns
/// `Ok(None)` when neither `BULWARK_CONFIG` nor any `BULWARK_DEFAULT_*`
/// variable is set.
///
/// # Errors
/// Returns `InfraError::Config` if a value does not parse or the named file
/// is unusable, and `InfraError::Settings` if the result is invalid.
pub fn load_from_env() -> InfraResult<Option<ResilienceSettings>> {
    let base = env_var(CONFIG_PATH_VAR).map(PathBuf::from);
    let overrides = env_overrides()?;

    if base.is_none() && overrides == ServiceOverrides::default() {
        return Ok(None);
    }

    let mut settings = match base {
        Some(path) => read_config(&path)?,
        None => ResilienceSettings::default(),
    };
    settings.defaults = overrides.apply(&settings.defaults);
    settings.validate()?;
    Ok(Some(settings))
}

/// Load configuration from a file
///
/// If `path` is `None`, probes the standard locations. Format is detected by
/// file extension.
///
/// # Errors
/// Returns `InfraError` if the file is missing, unreadable, malformed, or
/// fails validation.
pub fn load_from_file(path: Option<PathBuf>) -> InfraResult<ResilienceSettings> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(InfraError::config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            p
        }
        None => probe_config_paths().ok_or_else(|| {
            InfraError::config("No config file found in any of the standard locations")
        })?,
    };

    let settings = read_config(&config_path)?;
    settings.validate()?;
    Ok(settings)
}

fn read_config(path: &Path) -> InfraResult<ResilienceSettings> {
    tracing::info!(path = %path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(path)
        .map_err(|source| InfraError::Io { path: path.to_path_buf(), source })?;

    parse_config(&contents, path)
}

/// Parse configuration from string content
///
/// Format is detected by file extension (`.toml` or `.json`).
fn parse_config(contents: &str, path: &Path) -> InfraResult<ResilienceSettings> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match extension {
        "toml" => Ok(toml::from_str(contents)?),
        "json" => Ok(serde_json::from_str(contents)?),
        _ => Err(InfraError::config(format!("Unsupported config format: {extension}"))),
    }
}

/// Probe the standard locations for a configuration file
///
/// Searches the current working directory, then the executable's directory.
///
/// # Returns
/// The first config file found, or `None` if no file exists.
pub fn probe_config_paths() -> Option<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            roots.push(exe_dir.to_path_buf());
        }
    }

    roots
        .iter()
        .flat_map(|root| CONFIG_FILE_NAMES.iter().map(move |name| root.join(name)))
        .find(|path| path.exists())
}

fn env_overrides() -> InfraResult<ServiceOverrides> {
    Ok(ServiceOverrides {
        timeout: env_millis("TIMEOUT_MS")?,
        connect_timeout: env_millis("CONNECT_TIMEOUT_MS")?,
        warn_threshold_fraction: env_parse("WARN_THRESHOLD_FRACTION")?,
        max_attempts: env_parse("MAX_ATTEMPTS")?,
        initial_delay: env_millis("INITIAL_DELAY_MS")?,
        max_delay: env_millis("MAX_DELAY_MS")?,
        multiplier: env_parse("MULTIPLIER")?,
        jitter: env_bool(&format!("{DEFAULTS_PREFIX}JITTER")),
        retry_on: None,
        failure_threshold: env_parse("FAILURE_THRESHOLD")?,
        cooldown: env_millis("COOLDOWN_MS")?,
        half_open_max_trials: env_parse("HALF_OPEN_MAX_TRIALS")?,
    })
}

fn env_millis(suffix: &str) -> InfraResult<Option<Duration>> {
    Ok(env_parse::<u64>(suffix)?.map(Duration::from_millis))
}

/// Parse an optional `BULWARK_DEFAULT_*` variable
fn env_parse<T>(suffix: &str) -> InfraResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!("{DEFAULTS_PREFIX}{suffix}");
    env_var(&key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| InfraError::config(format!("Invalid value for {key}: {e}")))
        })
        .transpose()
}

/// Non-empty environment variable
fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Parse boolean from environment variable
///
/// Accepts: `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive)
fn env_bool(key: &str) -> Option<bool> {
    env_var(key)
        .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Mutex;

    use bulwark_common::resilience::RetryOn;
    use bulwark_common::ErrorKind;
    use once_cell::sync::Lazy;
    use tempfile::NamedTempFile;

    use super::*;

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const ALL_VARS: [&str; 12] = [
        CONFIG_PATH_VAR,
        "BULWARK_DEFAULT_TIMEOUT_MS",
        "BULWARK_DEFAULT_CONNECT_TIMEOUT_MS",
        "BULWARK_DEFAULT_WARN_THRESHOLD_FRACTION",
        "BULWARK_DEFAULT_MAX_ATTEMPTS",
        "BULWARK_DEFAULT_INITIAL_DELAY_MS",
        "BULWARK_DEFAULT_MAX_DELAY_MS",
        "BULWARK_DEFAULT_MULTIPLIER",
        "BULWARK_DEFAULT_JITTER",
        "BULWARK_DEFAULT_FAILURE_THRESHOLD",
        "BULWARK_DEFAULT_COOLDOWN_MS",
        "BULWARK_DEFAULT_HALF_OPEN_MAX_TRIALS",
    ];

    fn clear_env() {
        for key in ALL_VARS {
            std::env::remove_var(key);
        }
    }

    const TOML_CONTENT: &str = r#"
[defaults]
timeout_ms = 3000
max_attempts = 4

[services.billing]
timeout_ms = 1500
failure_threshold = 3
retry_on = { kinds = ["timeout", "server"] }
"#;

    /// Write `contents` to a temp file carrying the given extension
    fn config_file(contents: &str, extension: &str) -> PathBuf {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(contents.as_bytes()).unwrap();
        let path = temp_file.path().with_extension(extension);
        std::fs::copy(temp_file.path(), &path).unwrap();
        path
    }

    #[test]
    fn test_env_bool_parsing() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");

        for (key, value) in [
            ("TEST_BULWARK_BOOL_1", "1"),
            ("TEST_BULWARK_BOOL_TRUE", "true"),
            ("TEST_BULWARK_BOOL_YES", "yes"),
            ("TEST_BULWARK_BOOL_UPPER", "ON"),
        ] {
            std::env::set_var(key, value);
            assert_eq!(env_bool(key), Some(true), "{value} should parse as true");
            std::env::remove_var(key);
        }

        for (key, value) in [("TEST_BULWARK_BOOL_0", "0"), ("TEST_BULWARK_BOOL_OFF", "off")] {
            std::env::set_var(key, value);
            assert_eq!(env_bool(key), Some(false), "{value} should parse as false");
            std::env::remove_var(key);
        }

        std::env::remove_var("TEST_BULWARK_BOOL_MISSING");
        assert_eq!(env_bool("TEST_BULWARK_BOOL_MISSING"), None);
    }

    #[test]
    fn test_load_from_env_overrides_defaults() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_env();

        std::env::set_var("BULWARK_DEFAULT_TIMEOUT_MS", "1200");
        std::env::set_var("BULWARK_DEFAULT_MAX_ATTEMPTS", "5");
        std::env::set_var("BULWARK_DEFAULT_MULTIPLIER", "1.5");
        std::env::set_var("BULWARK_DEFAULT_JITTER", "false");
        std::env::set_var("BULWARK_DEFAULT_COOLDOWN_MS", "45000");

        let result = load_from_env();
        clear_env();

        let settings = result.expect("settings from env").expect("env is configured");
        assert_eq!(settings.defaults.timeout, Duration::from_millis(1200));
        assert_eq!(settings.defaults.max_attempts, 5);
        assert!((settings.defaults.multiplier - 1.5).abs() < f64::EPSILON);
        assert!(!settings.defaults.jitter);
        assert_eq!(settings.defaults.cooldown, Duration::from_secs(45));
        // Untouched fields keep their defaults
        assert_eq!(settings.defaults.failure_threshold, 5);
        assert!(settings.services.is_empty());
    }

    #[test]
    fn test_load_from_env_layers_onto_config_file() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_env();

        let path = config_file(TOML_CONTENT, "toml");
        std::env::set_var(CONFIG_PATH_VAR, &path);
        std::env::set_var("BULWARK_DEFAULT_MAX_ATTEMPTS", "2");

        let result = load_from_env();
        clear_env();
        std::fs::remove_file(&path).ok();

        let settings =
            result.expect("settings from file plus env").expect("env is configured");
        assert_eq!(settings.defaults.timeout, Duration::from_millis(3000));
        assert_eq!(settings.defaults.max_attempts, 2);
        assert_eq!(settings.resolve("billing").max_attempts, 2);
        assert_eq!(settings.resolve("billing").timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_load_from_env_without_vars() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_env();

        let result = load_from_env();
        assert!(matches!(result, Ok(None)), "nothing set means not configured");
    }

    #[test]
    fn test_load_rejects_malformed_env_instead_of_falling_back() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_env();

        std::env::set_var("BULWARK_DEFAULT_MAX_ATTEMPTS", "seven");
        let result = load();
        clear_env();

        match result {
            Err(InfraError::Config(msg)) => assert!(msg.contains("BULWARK_DEFAULT_MAX_ATTEMPTS")),
            other => panic!("expected env parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_rejects_missing_explicit_config_file() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_env();

        std::env::set_var(CONFIG_PATH_VAR, "/nonexistent/bulwark.toml");
        let result = load();
        clear_env();

        match result {
            Err(InfraError::Io { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/bulwark.toml"));
            }
            other => panic!("expected io error for the named file, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_env_invalid_number() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_env();

        std::env::set_var("BULWARK_DEFAULT_MAX_ATTEMPTS", "not-a-number");
        let result = load_from_env();
        clear_env();

        match result {
            Err(InfraError::Config(msg)) => assert!(msg.contains("BULWARK_DEFAULT_MAX_ATTEMPTS")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_env_rejects_invalid_policy() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_env();

        std::env::set_var("BULWARK_DEFAULT_MAX_ATTEMPTS", "0");
        let result = load_from_env();
        clear_env();

        assert!(matches!(result, Err(InfraError::Settings(_))), "zero attempts must be rejected");
    }

    #[test]
    fn test_load_from_file_toml() {
        let path = config_file(TOML_CONTENT, "toml");

        let result = load_from_file(Some(path.clone()));
        std::fs::remove_file(path).ok();

        let settings = result.expect("Should load config from TOML file");
        assert_eq!(settings.defaults.max_attempts, 4);
        let billing = settings.resolve("billing");
        assert_eq!(billing.failure_threshold, 3);
        assert!(billing.retry_on.permits(ErrorKind::Timeout));
        assert!(!billing.retry_on.permits(ErrorKind::Network));
    }

    #[test]
    fn test_load_from_file_json() {
        let json_content = r#"{
            "defaults": { "timeout_ms": 2500, "retry_on": "all" },
            "services": { "search": { "max_attempts": 1 } }
        }"#;
        let path = config_file(json_content, "json");

        let result = load_from_file(Some(path.clone()));
        std::fs::remove_file(path).ok();

        let settings = result.expect("Should load config from JSON file");
        assert_eq!(settings.defaults.timeout, Duration::from_millis(2500));
        assert_eq!(settings.defaults.retry_on, RetryOn::All);
        assert_eq!(settings.resolve("search").max_attempts, 1);
    }

    #[test]
    fn test_load_from_file_not_found() {
        let result = load_from_file(Some(PathBuf::from("/nonexistent/bulwark.toml")));
        assert!(matches!(result, Err(InfraError::Config(_))), "Should be a Config error");
    }

    #[test]
    fn test_load_from_file_invalid_json() {
        let path = config_file(r#"{ "defaults": { "max_attempts": "#, "json");

        let result = load_from_file(Some(path.clone()));
        std::fs::remove_file(path).ok();

        match result {
            Err(InfraError::Config(msg)) => assert!(msg.starts_with("Invalid JSON")),
            other => panic!("expected JSON parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_file_names_invalid_service() {
        let path = config_file("[services.billing]\nhalf_open_max_trials = 0\n", "toml");

        let result = load_from_file(Some(path.clone()));
        std::fs::remove_file(path).ok();

        let err = result.expect_err("zero trials must be rejected");
        assert!(matches!(err, InfraError::Settings(_)));
        assert!(err.to_string().contains("billing"));
    }

    #[test]
    fn test_parse_config_unsupported_format() {
        let result = parse_config("defaults: {}", &PathBuf::from("bulwark.yaml"));
        assert!(result.is_err(), "Should fail with unsupported format");
    }

    #[test]
    fn test_parse_config_empty_toml_uses_defaults() {
        let settings = parse_config("", &PathBuf::from("bulwark.toml")).expect("empty TOML");
        assert_eq!(settings, ResilienceSettings::default());
    }
}
