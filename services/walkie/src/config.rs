use reqwest::Url;
use std::time::Duration;
use tracing::Level;
use walkie_core::transport::{TransportConfig, derive_ws_base};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub agent_http_url: Url,
    pub agent_ws_url: Url,
    pub intro_timeout: Duration,
    pub turn_timeout: Option<Duration>,
    pub max_capture: Duration,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let http_str = std::env::var("AGENT_HTTP_URL")
            .unwrap_or_else(|_| "http://localhost:8000".to_string());
        let agent_http_url = parse_url("AGENT_HTTP_URL", &http_str)?;
        if !matches!(agent_http_url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidValue(
                "AGENT_HTTP_URL".to_string(),
                format!("scheme '{}' is not http or https", agent_http_url.scheme()),
            ));
        }

        let agent_ws_url = match std::env::var("AGENT_WS_URL") {
            Ok(ws_str) => {
                let url = parse_url("AGENT_WS_URL", &ws_str)?;
                if !matches!(url.scheme(), "ws" | "wss") {
                    return Err(ConfigError::InvalidValue(
                        "AGENT_WS_URL".to_string(),
                        format!("scheme '{}' is not ws or wss", url.scheme()),
                    ));
                }
                url
            }
            Err(_) => derive_ws_base(&agent_http_url).map_err(|e| {
                ConfigError::InvalidValue("AGENT_HTTP_URL".to_string(), e.to_string())
            })?,
        };

        let intro_timeout = Duration::from_secs(parse_secs("INTRO_TIMEOUT_SECS")?.unwrap_or(15));
        let turn_timeout = parse_secs("TURN_TIMEOUT_SECS")?.map(Duration::from_secs);
        let max_capture = Duration::from_secs(parse_secs("MAX_CAPTURE_SECS")?.unwrap_or(60));

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            agent_http_url,
            agent_ws_url,
            intro_timeout,
            turn_timeout,
            max_capture,
            log_level,
        })
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            http_base: self.agent_http_url.clone(),
            ws_base: self.agent_ws_url.clone(),
            request_timeout: self.intro_timeout,
        }
    }
}

fn parse_url(var: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::InvalidValue(var.to_string(), e.to_string()))
}

/// A positive number of seconds, or `None` when the variable is unset.
fn parse_secs(var: &str) -> Result<Option<u64>, ConfigError> {
    let Ok(value) = std::env::var(var) else {
        return Ok(None);
    };
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Some(secs)),
        _ => Err(ConfigError::InvalidValue(
            var.to_string(),
            format!("'{}' is not a positive number of seconds", value),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("AGENT_HTTP_URL");
            env::remove_var("AGENT_WS_URL");
            env::remove_var("INTRO_TIMEOUT_SECS");
            env::remove_var("TURN_TIMEOUT_SECS");
            env::remove_var("MAX_CAPTURE_SECS");
            env::remove_var("RUST_LOG");
        }
    }

    #[test]
    fn test_config_error_display() {
        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_defaults() {
        clear_env_vars();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.agent_http_url.as_str(), "http://localhost:8000/");
        assert_eq!(config.agent_ws_url.as_str(), "ws://localhost:8000/");
        assert_eq!(config.intro_timeout, Duration::from_secs(15));
        assert_eq!(config.turn_timeout, None);
        assert_eq!(config.max_capture, Duration::from_secs(60));
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("AGENT_HTTP_URL", "https://agent.example.com");
            env::set_var("AGENT_WS_URL", "wss://voice.example.com/");
            env::set_var("INTRO_TIMEOUT_SECS", "5");
            env::set_var("TURN_TIMEOUT_SECS", "30");
            env::set_var("MAX_CAPTURE_SECS", "20");
            env::set_var("RUST_LOG", "debug");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.agent_http_url.as_str(), "https://agent.example.com/");
        assert_eq!(config.agent_ws_url.as_str(), "wss://voice.example.com/");
        assert_eq!(config.intro_timeout, Duration::from_secs(5));
        assert_eq!(config.turn_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.max_capture, Duration::from_secs(20));
        assert_eq!(config.log_level, Level::DEBUG);

        let transport = config.transport();
        assert_eq!(transport.ws_base.as_str(), "wss://voice.example.com/");
        assert_eq!(transport.request_timeout, Duration::from_secs(5));
    }

    #[test]
    #[serial]
    fn test_config_derives_secure_ws_url() {
        clear_env_vars();
        unsafe {
            env::set_var("AGENT_HTTP_URL", "https://agent.example.com:8443/api/");
        }

        let config = Config::from_env().expect("Config should load successfully");
        assert_eq!(
            config.agent_ws_url.as_str(),
            "wss://agent.example.com:8443/api/"
        );
    }

    #[test]
    #[serial]
    fn test_config_invalid_urls() {
        clear_env_vars();
        unsafe {
            env::set_var("AGENT_HTTP_URL", "not a url");
        }
        match Config::from_env().unwrap_err() {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "AGENT_HTTP_URL"),
            _ => panic!("Expected InvalidValue for AGENT_HTTP_URL"),
        }

        clear_env_vars();
        unsafe {
            env::set_var("AGENT_WS_URL", "http://localhost:8000");
        }
        match Config::from_env().unwrap_err() {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "AGENT_WS_URL"),
            _ => panic!("Expected InvalidValue for AGENT_WS_URL"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_durations() {
        for var in ["INTRO_TIMEOUT_SECS", "TURN_TIMEOUT_SECS", "MAX_CAPTURE_SECS"] {
            clear_env_vars();
            unsafe {
                env::set_var(var, "0");
            }
            match Config::from_env().unwrap_err() {
                ConfigError::InvalidValue(name, _) => assert_eq!(name, var),
                _ => panic!("Expected InvalidValue for {}", var),
            }
        }

        clear_env_vars();
        unsafe {
            env::set_var("TURN_TIMEOUT_SECS", "soon");
        }
        assert!(Config::from_env().is_err());
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
}
