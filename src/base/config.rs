//! Load configuration via `config` crate with env-override support.

use std::{ops::Deref, sync::Arc};

use serde::Deserialize;

use super::types::{Res, RunMode};

/// Default HTTP port for the Events API listener.
fn default_port() -> u16 {
    8080
}

/// Default GCP project that owns the datasets and models.
fn default_bigquery_project() -> String {
    "project-id".to_string()
}

/// Default BigQuery job location.
fn default_bigquery_location() -> String {
    "asia-northeast1".to_string()
}

/// Default dataset holding the embedded table and both remote models.
fn default_bigquery_dataset() -> String {
    "llm_dataset".to_string()
}

fn default_bigquery_embedded_table() -> String {
    "embedded_data".to_string()
}

fn default_bigquery_embedding_model() -> String {
    "embedding".to_string()
}

fn default_bigquery_generation_model() -> String {
    "remote_llm".to_string()
}

/// Default source table (`dataset.table`) whose `content` column is embedded.
fn default_bigquery_source_table() -> String {
    "AppSheetDatabases.app-sheet".to_string()
}

/// Default sampling temperature for the generation model.
fn default_bigquery_temperature() -> f32 {
    0.2
}

/// Default max output tokens for the generation model.
fn default_bigquery_max_output_tokens() -> u32 {
    1000
}

/// Configuration for the bot.
#[derive(Debug, Clone)]
pub struct Config {
    pub inner: Arc<ConfigInner>,
}

impl Deref for Config {
    type Target = ConfigInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConfigInner {
    /// Slack bot token (`SLACK_BOT_TOKEN`).
    pub slack_bot_token: String,
    /// Slack app token, required for socket mode (`SLACK_APP_TOKEN`).
    #[serde(default)]
    pub slack_app_token: String,
    /// Slack signing secret, required for the HTTP listener (`SLACK_SIGNING_SECRET`).
    #[serde(default)]
    pub slack_signing_secret: String,
    /// Deployment environment; `prod` selects the HTTP listener (`APP_ENVIRONMENT`).
    #[serde(default)]
    pub app_environment: String,
    /// Port for the HTTP listener (`PORT`).
    #[serde(default = "default_port")]
    pub port: u16,
    /// GCP project (`BIGQUERY_PROJECT`).
    #[serde(default = "default_bigquery_project")]
    pub bigquery_project: String,
    /// BigQuery job location (`BIGQUERY_LOCATION`).
    #[serde(default = "default_bigquery_location")]
    pub bigquery_location: String,
    /// Dataset with the embedded table and models (`BIGQUERY_DATASET`).
    #[serde(default = "default_bigquery_dataset")]
    pub bigquery_dataset: String,
    /// Table holding the embeddings (`BIGQUERY_EMBEDDED_TABLE`).
    #[serde(default = "default_bigquery_embedded_table")]
    pub bigquery_embedded_table: String,
    /// Remote embedding model (`BIGQUERY_EMBEDDING_MODEL`).
    #[serde(default = "default_bigquery_embedding_model")]
    pub bigquery_embedding_model: String,
    /// Remote text generation model (`BIGQUERY_GENERATION_MODEL`).
    #[serde(default = "default_bigquery_generation_model")]
    pub bigquery_generation_model: String,
    /// Source content table as `dataset.table` (`BIGQUERY_SOURCE_TABLE`).
    #[serde(default = "default_bigquery_source_table")]
    pub bigquery_source_table: String,
    /// Sampling temperature for the generation model (`BIGQUERY_TEMPERATURE`).
    /// Value between 0 and 1.
    #[serde(default = "default_bigquery_temperature")]
    pub bigquery_temperature: f32,
    /// Max output tokens for the generation model (`BIGQUERY_MAX_OUTPUT_TOKENS`).
    #[serde(default = "default_bigquery_max_output_tokens")]
    pub bigquery_max_output_tokens: u32,
    /// Static OAuth access token (`GOOGLE_ACCESS_TOKEN`).
    /// When unset, a token is requested from the metadata server on every query.
    #[serde(default)]
    pub google_access_token: Option<String>,
}

impl Config {
    pub fn load(explicit_path: Option<&std::path::Path>) -> Res<Self> {
        let mut cfg = config::Config::builder().add_source(config::Environment::default().try_parsing(true));

        if let Some(p) = explicit_path {
            cfg = cfg.add_source(config::File::from(p.to_path_buf()));
        } else if std::path::Path::new(".hidden/config.toml").exists() {
            cfg = cfg.add_source(config::File::with_name(".hidden/config.toml"));
        }

        let result = Config {
            inner: Arc::new(cfg.build()?.try_deserialize()?),
        };

        result.validate()?;

        Ok(result)
    }

    /// Check value ranges and the tokens the selected run mode needs.
    pub fn validate(&self) -> Res<()> {
        if self.bigquery_temperature < 0.0 || self.bigquery_temperature > 1.0 {
            return Err(anyhow::anyhow!("BigQuery generation temperature must be between 0 and 1."));
        }

        if self.bigquery_max_output_tokens < 1 || self.bigquery_max_output_tokens > 8192 {
            return Err(anyhow::anyhow!("BigQuery max output tokens must be between 1 and 8192."));
        }

        if self.slack_bot_token.is_empty() {
            return Err(anyhow::anyhow!("Slack bot token must be set."));
        }

        match self.run_mode() {
            RunMode::Http if self.slack_signing_secret.is_empty() => Err(anyhow::anyhow!("Slack signing secret must be set when `app_environment` is `prod`.")),
            RunMode::Socket if self.slack_app_token.is_empty() => Err(anyhow::anyhow!("Slack app token must be set for socket mode.")),
            _ => Ok(()),
        }
    }

    /// The listener mode selected by `app_environment`.
    pub fn run_mode(&self) -> RunMode {
        RunMode::from_environment(&self.app_environment)
    }
}
