use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use directories::BaseDirs;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::UploadError;

pub const DEFAULT_CONFIG_FILE: &str = "assessor-up.json";
pub const PASSWORD_ENV: &str = "ASSESSOR_UP_PASSWORD";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub repository_url: String,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    pub project: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub batch: Option<BatchSection>,
    #[serde(default)]
    pub thumbnails: Option<ThumbnailSection>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct BatchSection {
    #[serde(default)]
    pub label_prefix: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ThumbnailSection {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub coordinates: Option<CoordinateSpace>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateSpace {
    Patient,
    Pixel,
}

#[derive(Debug, Clone)]
pub struct RepositorySettings {
    pub base_url: String,
    pub user: String,
    pub password: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ThumbnailSettings {
    pub enabled: bool,
    pub coordinates: CoordinateSpace,
}

impl Default for ThumbnailSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            coordinates: CoordinateSpace::Patient,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub repository: RepositorySettings,
    pub project: String,
    pub label_prefix: String,
    pub note: Option<String>,
    pub thumbnails: ThumbnailSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, UploadError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => Self::default_locations()
                .into_iter()
                .find(|candidate| candidate.exists())
                .ok_or(UploadError::MissingConfig)?,
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| UploadError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| UploadError::ConfigParse(err.to_string()))?;

        let env_password = std::env::var(PASSWORD_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty());
        Self::resolve_config(config, env_password)
    }

    /// `./assessor-up.json`, then `~/.config/assessor-up/assessor-up.json`.
    pub fn default_locations() -> Vec<PathBuf> {
        let mut locations = vec![PathBuf::from(DEFAULT_CONFIG_FILE)];
        if let Some(dirs) = BaseDirs::new() {
            locations.push(
                dirs.home_dir()
                    .join(".config")
                    .join("assessor-up")
                    .join(DEFAULT_CONFIG_FILE),
            );
        }
        locations
    }

    // A password from the environment wins over the file.
    pub fn resolve_config(
        config: Config,
        env_password: Option<String>,
    ) -> Result<ResolvedConfig, UploadError> {
        let base_url = config.repository_url.trim().trim_end_matches('/').to_string();
        let is_http = Url::parse(&base_url)
            .is_ok_and(|url| matches!(url.scheme(), "http" | "https") && url.has_host());
        if !is_http {
            return Err(UploadError::ConfigParse(format!(
                "repository_url must be an http(s) URL: {}",
                config.repository_url
            )));
        }
        let project = config.project.trim().to_string();
        if project.is_empty() {
            return Err(UploadError::ConfigParse("project must not be empty".to_string()));
        }

        let batch = config.batch.unwrap_or_default();
        let thumbnails = config.thumbnails.unwrap_or_default();

        Ok(ResolvedConfig {
            repository: RepositorySettings {
                base_url,
                user: config.user,
                password: env_password.or(config.password),
                timeout: Duration::from_secs(config.timeout_secs.unwrap_or(60)),
            },
            project,
            label_prefix: batch
                .label_prefix
                .filter(|prefix| !prefix.trim().is_empty())
                .unwrap_or_else(default_label_prefix),
            note: batch.note,
            thumbnails: ThumbnailSettings {
                enabled: thumbnails.enabled.unwrap_or(true),
                coordinates: thumbnails.coordinates.unwrap_or(CoordinateSpace::Patient),
            },
        })
    }
}

pub fn default_label_prefix() -> String {
    "upload".to_string()
}
