use config::{Config, ConfigError};
use serde::Deserialize;
use std::{env, path::Path, result::Result};

#[derive(Debug, Clone, Deserialize)]
pub struct AzureOpenAiConfig {
    pub endpoint: String,
    pub deployment: String,
    pub api_version: String,
    #[serde(default)]
    pub subscription_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub temperature: f64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictionConfig {
    pub batch_size: usize,
    pub batch_delay_seconds: u64,
    pub max_retries: u32,
    pub max_parallel: usize,
    pub calls_per_minute: usize,
    pub tokens_per_minute: usize,
    pub estimated_tokens_per_call: usize,
    pub input_directory: String,
    pub output_directory: String,
    pub progress_db: String,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub azure_openai: AzureOpenAiConfig,
    pub model: ModelConfig,
    pub religion_prediction: PredictionConfig,
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        builder.try_deserialize()
    }

    /// Load the config from `$APP_DIR/config.toml` (or `<workspace>/config`
    /// when running from cargo), then apply the `AZURE_OPENAI_KEY` env
    /// override so the key never has to live in the checked-in file.
    pub fn load() -> anyhow::Result<Self> {
        let root = env::var("APP_DIR").unwrap_or_else(|_| {
            let dir =
                env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR or APP_DIR is required");
            let dir = Path::new(&dir).parent().unwrap().display().to_string();
            format!("{}/config", dir)
        });
        let path = format!("{root}/config.toml");
        let mut cfg = Self::from_file(&path)?;

        if let Ok(key) = env::var("AZURE_OPENAI_KEY") {
            cfg.azure_openai.subscription_key = key;
        }
        if cfg.azure_openai.subscription_key.is_empty() {
            tracing::warn!("No Azure OpenAI key configured; classification calls will be rejected");
        }

        Ok(cfg)
    }
}
