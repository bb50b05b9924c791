use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the config file when no CLI argument is given
pub const CONFIG_ENV_VAR: &str = "FIELDSYNC_CONFIG";

/// Sync engine settings, read from a TOML file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub server_url: String,
    /// Project every created observation is linked to
    pub project_id: Option<i64>,
    /// Initial bearer token; replaced at runtime by the credential provider
    pub api_token: Option<String>,
    pub sync_interval_secs: u64,
    pub retry_delay_secs: u64,
    pub poll_interval_secs: u64,
    pub thumbnail_size: u32,
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: crate::database::default_database_path(),
            server_url: "http://localhost:3000".to_string(),
            project_id: None,
            api_token: None,
            sync_interval_secs: 30,
            retry_delay_secs: 60,
            poll_interval_secs: 5,
            thumbnail_size: 256,
            request_timeout_secs: 60,
            user_agent: format!("fieldsync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl SyncConfig {
    pub fn from_toml(s: &str) -> Result<Self, AppError> {
        let config: SyncConfig =
            toml::from_str(s).map_err(|e| AppError::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, AppError> {
        toml::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        log::info!("Loading config from {}", path.display());
        Self::from_toml(&raw)
    }

    /// First CLI argument, then `FIELDSYNC_CONFIG`, then built-in defaults
    pub fn from_env() -> Result<Self, AppError> {
        let path = std::env::args()
            .nth(1)
            .or_else(|| std::env::var(CONFIG_ENV_VAR).ok())
            .map(PathBuf::from);

        match path {
            Some(path) => Self::load(&path),
            None => {
                log::info!("No config file given, using defaults");
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let url = self.server_url.trim();
        if url.is_empty() {
            return Err(AppError::Config("server_url must not be empty".into()));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(AppError::Config(format!(
                "server_url must be an http(s) url, got '{}'",
                url
            )));
        }
        for (name, value) in [
            ("sync_interval_secs", self.sync_interval_secs),
            ("retry_delay_secs", self.retry_delay_secs),
            ("poll_interval_secs", self.poll_interval_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ] {
            if value == 0 {
                return Err(AppError::Config(format!("{} must be greater than 0", name)));
            }
        }
        if self.thumbnail_size == 0 {
            return Err(AppError::Config("thumbnail_size must be greater than 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = SyncConfig::from_toml(
            r#"
            server_url = "https://observations.example.org/api"
            project_id = 12
            "#,
        )
        .unwrap();

        assert_eq!(config.project_id, Some(12));
        assert_eq!(config.sync_interval_secs, 30);
        assert_eq!(config.thumbnail_size, 256);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            SyncConfig::from_toml(r#"server_url = "ftp://x""#),
            Err(AppError::Config(_))
        ));
        assert!(SyncConfig::from_toml("poll_interval_secs = 0").is_err());
        assert!(SyncConfig::from_toml("server_url = 5").is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = SyncConfig {
            api_token: Some("t".into()),
            ..Default::default()
        };
        let parsed = SyncConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }
}
