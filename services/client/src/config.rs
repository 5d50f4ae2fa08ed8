use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base URL of the backend, e.g. `http://localhost:8000`. Connecting
    /// without one is a configuration error, but everything offline works.
    pub backend_url: Option<String>,
    pub voice_name: String,
    pub voice_id: String,
    pub instructions: String,
    pub allow_recording: bool,
    pub store_path: PathBuf,
    pub health_timeout: Duration,
    /// Upper bound on every other backend request.
    pub request_timeout: Duration,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let backend_url = std::env::var("PARLEY_BACKEND_URL")
            .ok()
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        let voice_name =
            std::env::var("PARLEY_VOICE_NAME").unwrap_or_else(|_| "default".to_string());
        let voice_id = std::env::var("PARLEY_VOICE_ID").unwrap_or_else(|_| voice_name.clone());
        let instructions = std::env::var("PARLEY_INSTRUCTIONS").unwrap_or_default();

        let allow_recording = match std::env::var("PARLEY_ALLOW_RECORDING") {
            Ok(raw) => raw.trim().parse::<bool>().map_err(|_| {
                ConfigError::InvalidValue(
                    "PARLEY_ALLOW_RECORDING".to_string(),
                    format!("'{}' is not 'true' or 'false'", raw),
                )
            })?,
            Err(_) => false,
        };

        let store_path = std::env::var("PARLEY_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./parley-history.json"));

        let health_timeout_ms = match std::env::var("PARLEY_HEALTH_TIMEOUT_MS") {
            Ok(raw) => raw.trim().parse::<u64>().map_err(|e| {
                ConfigError::InvalidValue("PARLEY_HEALTH_TIMEOUT_MS".to_string(), e.to_string())
            })?,
            Err(_) => 3000,
        };

        let request_timeout_ms = match std::env::var("PARLEY_REQUEST_TIMEOUT_MS") {
            Ok(raw) => raw.trim().parse::<u64>().map_err(|e| {
                ConfigError::InvalidValue("PARLEY_REQUEST_TIMEOUT_MS".to_string(), e.to_string())
            })?,
            Err(_) => 30_000,
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            backend_url,
            voice_name,
            voice_id,
            instructions,
            allow_recording,
            store_path,
            health_timeout: Duration::from_millis(health_timeout_ms),
            request_timeout: Duration::from_millis(request_timeout_ms),
            log_level,
        })
    }

    /// The backend URL, or the error that makes connecting impossible.
    pub fn require_backend(&self) -> Result<&str, ConfigError> {
        self.backend_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingVar("PARLEY_BACKEND_URL".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("PARLEY_BACKEND_URL");
            env::remove_var("PARLEY_VOICE_NAME");
            env::remove_var("PARLEY_VOICE_ID");
            env::remove_var("PARLEY_INSTRUCTIONS");
            env::remove_var("PARLEY_ALLOW_RECORDING");
            env::remove_var("PARLEY_STORE_PATH");
            env::remove_var("PARLEY_HEALTH_TIMEOUT_MS");
            env::remove_var("PARLEY_REQUEST_TIMEOUT_MS");
            env::remove_var("RUST_LOG");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        clear_env_vars();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.backend_url, None);
        assert_eq!(config.voice_name, "default");
        assert_eq!(config.voice_id, "default");
        assert_eq!(config.instructions, "");
        assert!(!config.allow_recording);
        assert_eq!(config.store_path, PathBuf::from("./parley-history.json"));
        assert_eq!(config.health_timeout, Duration::from_secs(3));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.log_level, Level::INFO);
        assert!(config.require_backend().is_err());
    }

    #[test]
    #[serial]
    fn test_config_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("PARLEY_BACKEND_URL", "https://unmute.example.com/");
            env::set_var("PARLEY_VOICE_NAME", "Watercooler");
            env::set_var("PARLEY_VOICE_ID", "voices/watercooler.wav");
            env::set_var("PARLEY_INSTRUCTIONS", "Keep it short.");
            env::set_var("PARLEY_ALLOW_RECORDING", "true");
            env::set_var("PARLEY_STORE_PATH", "/tmp/parley.json");
            env::set_var("PARLEY_HEALTH_TIMEOUT_MS", "500");
            env::set_var("PARLEY_REQUEST_TIMEOUT_MS", "2500");
            env::set_var("RUST_LOG", "debug");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(
            config.backend_url.as_deref(),
            Some("https://unmute.example.com")
        );
        assert_eq!(config.voice_name, "Watercooler");
        assert_eq!(config.voice_id, "voices/watercooler.wav");
        assert_eq!(config.instructions, "Keep it short.");
        assert!(config.allow_recording);
        assert_eq!(config.store_path, PathBuf::from("/tmp/parley.json"));
        assert_eq!(config.health_timeout, Duration::from_millis(500));
        assert_eq!(config.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(
            config.require_backend().unwrap(),
            "https://unmute.example.com"
        );
    }

    #[test]
    #[serial]
    fn test_config_invalid_allow_recording() {
        clear_env_vars();
        unsafe {
            env::set_var("PARLEY_ALLOW_RECORDING", "sometimes");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "PARLEY_ALLOW_RECORDING"),
            _ => panic!("Expected InvalidValue for PARLEY_ALLOW_RECORDING"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        unsafe {
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_health_timeout() {
        clear_env_vars();
        unsafe {
            env::set_var("PARLEY_HEALTH_TIMEOUT_MS", "soon");
        }

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(var, _) if var == "PARLEY_HEALTH_TIMEOUT_MS"));
    }
}
