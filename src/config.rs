use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = ".patchwork.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration loaded from .patchwork.toml.
///
/// The service starts with zero config, but without GitHub App credentials
/// and a webhook secret it rejects every delivery (fail closed).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// GitHub App credentials and API endpoint
    #[serde(default)]
    pub github: GithubConfig,

    /// External review service settings
    #[serde(default)]
    pub reviewer: ReviewerConfig,

    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    /// GitHub App identifier, as shown on the app settings page.
    pub app_id: Option<String>,
    /// Path to the app's RSA private key in PEM format.
    pub private_key_path: Option<PathBuf>,
    /// Shared secret used to verify webhook signatures.
    pub webhook_secret: Option<String>,
    /// API base URL; override for GitHub Enterprise.
    pub api_base_url: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            private_key_path: None,
            webhook_secret: None,
            api_base_url: "https://api.github.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReviewerConfig {
    /// Base URL of the review service.
    pub base_url: String,
    /// Focus areas passed through to the reviewer on every call.
    pub focus_areas: Vec<String>,
    /// Language handed to the reviewer for files with unknown extensions.
    pub fallback_language: String,
    /// Maximum number of per-file reviewer calls in flight for one PR.
    pub max_concurrency: usize,
    /// Request timeout for reviewer calls, in seconds.
    pub timeout_secs: u64,
}

impl Default for ReviewerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            focus_areas: vec![
                "Bugs".to_string(),
                "Security".to_string(),
                "Performance".to_string(),
                "Best Practices".to_string(),
            ],
            fallback_language: "python".to_string(),
            max_concurrency: 4,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address the webhook server binds to.
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from .patchwork.toml in the current directory,
    /// falling back to defaults if the file doesn't exist, then apply
    /// environment variable overrides.
    pub fn load() -> Result<Config, ConfigError> {
        let path = Path::new(CONFIG_FILE);
        let mut config = if path.exists() {
            Self::load_from(path)?
        } else {
            Config::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Load from a specific path (useful for testing and --config).
    pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Environment variables take precedence over file values, so secrets
    /// can stay out of the config file in deployments.
    pub fn apply_env(&mut self) {
        if let Ok(v) = env::var("GITHUB_APP_ID") {
            if !v.is_empty() {
                self.github.app_id = Some(v);
            }
        }
        if let Ok(v) = env::var("GITHUB_PRIVATE_KEY_PATH") {
            if !v.is_empty() {
                self.github.private_key_path = Some(PathBuf::from(v));
            }
        }
        if let Ok(v) = env::var("GITHUB_WEBHOOK_SECRET") {
            if !v.is_empty() {
                self.github.webhook_secret = Some(v);
            }
        }
        if let Ok(v) = env::var("REVIEWER_BASE_URL") {
            if !v.is_empty() {
                self.reviewer.base_url = v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.github.app_id.is_none());
        assert!(config.github.webhook_secret.is_none());
        assert_eq!(config.github.api_base_url, "https://api.github.com");
        assert_eq!(config.reviewer.max_concurrency, 4);
        assert_eq!(config.reviewer.fallback_language, "python");
        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_parse_config_toml() {
        let toml_str = r#"
[github]
app_id = "123456"
private_key_path = "/etc/patchwork/key.pem"
webhook_secret = "hush"

[reviewer]
base_url = "http://reviewer.internal:8000"
max_concurrency = 2

[server]
bind_addr = "127.0.0.1:9090"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.github.app_id.as_deref(), Some("123456"));
        assert_eq!(config.github.webhook_secret.as_deref(), Some("hush"));
        assert_eq!(config.reviewer.base_url, "http://reviewer.internal:8000");
        assert_eq!(config.reviewer.max_concurrency, 2);
        // Unspecified fields keep their defaults
        assert_eq!(config.reviewer.timeout_secs, 60);
        assert_eq!(config.server.bind_addr, "127.0.0.1:9090");
    }

    #[test]
    fn test_parse_empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.github.app_id.is_none());
        assert_eq!(config.reviewer.focus_areas.len(), 4);
    }

    #[test]
    fn test_default_focus_areas() {
        let config = ReviewerConfig::default();
        assert_eq!(
            config.focus_areas,
            vec!["Bugs", "Security", "Performance", "Best Practices"]
        );
    }
}
