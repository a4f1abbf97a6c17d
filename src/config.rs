use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TriageError};
use crate::models::TriageAction;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gmail: GmailConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_secret: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: default_redirect_uri(),
            auth_uri: default_auth_uri(),
            token_uri: default_token_uri(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL; without one an in-process store is used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encryption_key: String,
    #[serde(default = "default_credential_ttl_days")]
    pub credential_ttl_days: u64,
    #[serde(default = "default_processed_ttl_days")]
    pub processed_ttl_days: u64,
    #[serde(default = "default_label_cache_ttl_secs")]
    pub label_cache_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            encryption_key: String::new(),
            credential_ttl_days: default_credential_ttl_days(),
            processed_ttl_days: default_processed_ttl_days(),
            label_cache_ttl_secs: default_label_cache_ttl_secs(),
        }
    }
}

impl StoreConfig {
    pub fn credential_ttl(&self) -> Duration {
        Duration::from_secs(self.credential_ttl_days * 24 * 60 * 60)
    }

    pub fn processed_ttl(&self) -> Duration {
        Duration::from_secs(self.processed_ttl_days * 24 * 60 * 60)
    }

    pub fn label_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.label_cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_query")]
    pub query: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_body_max_chars")]
    pub body_max_chars: usize,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_rate_limit_max_calls")]
    pub rate_limit_max_calls: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            query: default_query(),
            page_size: default_page_size(),
            body_max_chars: default_body_max_chars(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            rate_limit_max_calls: default_rate_limit_max_calls(),
            request_timeout_secs: default_request_timeout_secs(),
            max_concurrent_requests: default_max_concurrent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_input_price")]
    pub input_price_per_million: f64,
    #[serde(default = "default_output_price")]
    pub output_price_per_million: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            api_base: None,
            max_input_chars: default_max_input_chars(),
            input_price_per_million: default_input_price(),
            output_price_per_million: default_output_price(),
        }
    }
}

/// Display names of the management labels, one per action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementLabels {
    #[serde(default = "default_to_read_label")]
    pub to_read: String,
    #[serde(default = "default_to_reply_label")]
    pub to_reply: String,
    #[serde(default = "default_to_archive_label")]
    pub to_archive: String,
}

impl Default for ManagementLabels {
    fn default() -> Self {
        Self {
            to_read: default_to_read_label(),
            to_reply: default_to_reply_label(),
            to_archive: default_to_archive_label(),
        }
    }
}

impl ManagementLabels {
    pub fn for_action(&self, action: TriageAction) -> &str {
        match action {
            TriageAction::ToRead => &self.to_read,
            TriageAction::ToReply => &self.to_reply,
            TriageAction::ToArchive => &self.to_archive,
        }
    }

    pub fn all(&self) -> Vec<String> {
        TriageAction::ALL
            .iter()
            .map(|a| self.for_action(*a).to_string())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub labels: ManagementLabels,
    /// Wall-clock budget of one cross-mailbox run
    #[serde(default = "default_batch_budget_secs")]
    pub batch_budget_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            labels: ManagementLabels::default(),
            batch_budget_secs: default_batch_budget_secs(),
        }
    }
}

impl PipelineConfig {
    pub fn batch_budget(&self) -> Duration {
        Duration::from_secs(self.batch_budget_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cron_secret: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cron_secret: String::new(),
        }
    }
}

fn default_redirect_uri() -> String {
    "http://localhost:3000/api/auth/callback".to_string()
}

fn default_auth_uri() -> String {
    crate::auth::GOOGLE_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    crate::auth::GOOGLE_TOKEN_URI.to_string()
}

fn default_credential_ttl_days() -> u64 {
    30
}

fn default_processed_ttl_days() -> u64 {
    7
}

fn default_label_cache_ttl_secs() -> u64 {
    3600
}

fn default_api_base() -> String {
    crate::client::DEFAULT_API_BASE.to_string()
}

fn default_query() -> String {
    "in:inbox".to_string()
}

fn default_page_size() -> u32 {
    20
}

fn default_body_max_chars() -> usize {
    10_000
}

fn default_rate_limit_window_secs() -> u64 {
    100
}

fn default_rate_limit_max_calls() -> u32 {
    250
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    10
}

fn default_model() -> String {
    crate::classifier::DEFAULT_MODEL.to_string()
}

fn default_max_input_chars() -> usize {
    5000
}

fn default_input_price() -> f64 {
    0.15
}

fn default_output_price() -> f64 {
    0.60
}

fn default_to_read_label() -> String {
    "To Read".to_string()
}

fn default_to_reply_label() -> String {
    "To Reply".to_string()
}

fn default_to_archive_label() -> String {
    "To Archive".to_string()
}

fn default_batch_budget_secs() -> u64 {
    300
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

impl Config {
    /// Load from file (defaults when absent), apply environment overrides, validate
    pub async fn load(path: &Path) -> Result<Self> {
        let mut config = Self::load_file(path).await?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    async fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TriageError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| TriageError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Secrets and deployment endpoints from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("GOOGLE_CLIENT_ID") {
            self.oauth.client_id = v;
        }
        if let Some(v) = get("GOOGLE_CLIENT_SECRET") {
            self.oauth.client_secret = v;
        }
        if let Some(v) = get("OAUTH_REDIRECT_URI") {
            self.oauth.redirect_uri = v;
        }
        if let Some(v) = get("REDIS_URL") {
            self.store.redis_url = Some(v);
        }
        if let Some(v) = get("ENCRYPTION_KEY") {
            self.store.encryption_key = v;
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.classifier.api_key = v;
        }
        if let Some(v) = get("CRON_SECRET") {
            self.server.cron_secret = v;
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                TriageError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| TriageError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| TriageError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.gmail.page_size == 0 || self.gmail.page_size > 500 {
            return Err(TriageError::ConfigError(
                "gmail.page_size must be between 1 and 500".to_string(),
            ));
        }

        if self.gmail.rate_limit_window_secs == 0 {
            return Err(TriageError::ConfigError(
                "gmail.rate_limit_window_secs must be greater than 0".to_string(),
            ));
        }
        if self.gmail.rate_limit_max_calls == 0 {
            return Err(TriageError::ConfigError(
                "gmail.rate_limit_max_calls must be greater than 0".to_string(),
            ));
        }

        if self.gmail.max_concurrent_requests == 0 {
            return Err(TriageError::ConfigError(
                "gmail.max_concurrent_requests must be at least 1".to_string(),
            ));
        }

        if self.gmail.body_max_chars == 0 || self.classifier.max_input_chars == 0 {
            return Err(TriageError::ConfigError(
                "gmail.body_max_chars and classifier.max_input_chars must be greater than 0"
                    .to_string(),
            ));
        }

        if self.classifier.model.trim().is_empty() {
            return Err(TriageError::ConfigError(
                "classifier.model cannot be empty".to_string(),
            ));
        }

        if self.classifier.input_price_per_million < 0.0
            || self.classifier.output_price_per_million < 0.0
        {
            return Err(TriageError::ConfigError(
                "classifier prices cannot be negative".to_string(),
            ));
        }

        let labels = self.pipeline.labels.all();
        if labels.iter().any(|l| l.trim().is_empty()) {
            return Err(TriageError::ConfigError(
                "pipeline.labels cannot contain empty names".to_string(),
            ));
        }
        let mut lowered: Vec<String> = labels.iter().map(|l| l.to_lowercase()).collect();
        lowered.sort();
        lowered.dedup();
        if lowered.len() != labels.len() {
            return Err(TriageError::ConfigError(
                "pipeline.labels must be distinct".to_string(),
            ));
        }

        if self.pipeline.batch_budget_secs == 0 {
            return Err(TriageError::ConfigError(
                "pipeline.batch_budget_secs must be greater than 0".to_string(),
            ));
        }

        if self.store.credential_ttl_days == 0 || self.store.processed_ttl_days == 0 {
            return Err(TriageError::ConfigError(
                "store TTLs must be at least one day".to_string(),
            ));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Fail with a readable message when a required secret is missing
    pub fn require(value: &str, name: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(TriageError::ConfigError(format!("{} is not set", name)));
        }
        Ok(())
    }

    /// Write a default configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        Self::default().save(path).await
    }
}
