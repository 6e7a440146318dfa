//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use crate::memory::embedding::{DEFAULT_HASHING_DIMENSION, known_dimension};
use crate::memory::{HashingEmbedder, StorePaths};
use anyhow::Context as _;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// agent-memory configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path.
    pub data_dir: PathBuf,

    /// Store name; artifact file names are derived from it.
    pub store_name: String,

    /// Store behavior settings.
    pub memory: MemoryConfig,

    /// Embedding provider configuration.
    pub embedding: EmbeddingConfig,
}

/// What the caller does when the persisted store cannot be loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadFailurePolicy {
    /// Stop with the load error.
    #[default]
    Abort,
    /// Continue with an empty, non-persistent store.
    StartEmpty,
}

/// Store behavior configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Number of memories recalled when the caller does not say.
    pub default_k: usize,

    pub on_load_failure: LoadFailurePolicy,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            default_k: 5,
            on_load_failure: LoadFailurePolicy::Abort,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    #[default]
    Hashing,
    Ollama,
    #[serde(rename = "fastembed")]
    FastEmbed,
}

impl EmbeddingProvider {
    /// Model used when the configuration does not name one.
    pub fn default_model(self) -> &'static str {
        match self {
            EmbeddingProvider::Hashing => HashingEmbedder::MODEL_NAME,
            EmbeddingProvider::Ollama => "nomic-embed-text",
            EmbeddingProvider::FastEmbed => "all-MiniLM-L6-v2",
        }
    }
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "hashing" => Ok(EmbeddingProvider::Hashing),
            "ollama" => Ok(EmbeddingProvider::Ollama),
            "fastembed" => Ok(EmbeddingProvider::FastEmbed),
            other => Err(ConfigError::Invalid(format!("unknown embedding provider: {other}"))),
        }
    }
}

/// Embedding provider configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,

    /// Provider-specific model name. Ignored by the hashing provider.
    /// Defaults to [`EmbeddingProvider::default_model`].
    pub model: Option<String>,

    /// Output dimension. When unset it comes from the model; the hashing
    /// provider uses 384.
    pub dimension: Option<usize>,

    pub ollama_base_url: String,

    /// Request timeout for remote providers.
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hashing,
            model: None,
            dimension: None,
            ollama_base_url: "http://localhost:11434".into(),
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    /// Model name after applying the provider default.
    pub fn model_name(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.provider.default_model())
    }

    /// Output dimension for the configured provider and model.
    ///
    /// An explicit dimension must agree with the model's known dimension.
    /// Ollama models outside the known table need an explicit dimension.
    pub fn resolved_dimension(&self) -> Result<usize> {
        let dimension = match self.provider {
            EmbeddingProvider::Hashing => self.dimension.unwrap_or(DEFAULT_HASHING_DIMENSION),
            provider => {
                let model = self.model_name();
                match (self.dimension, known_dimension(provider, model)) {
                    (Some(configured), Some(known)) if configured != known => {
                        return Err(ConfigError::Invalid(format!(
                            "embedding model {model} produces {known} dimensions, configured {configured}"
                        ))
                        .into());
                    }
                    (_, Some(known)) => known,
                    (Some(configured), None) if provider == EmbeddingProvider::Ollama => configured,
                    (None, None) if provider == EmbeddingProvider::Ollama => {
                        return Err(ConfigError::Invalid(format!(
                            "embedding.dimension must be set for ollama model {model}"
                        ))
                        .into());
                    }
                    (_, None) => {
                        return Err(ConfigError::Invalid(format!("unknown fastembed model: {model}")).into());
                    }
                }
            }
        };

        if dimension == 0 {
            return Err(ConfigError::Invalid("embedding dimension must be positive".into()).into());
        }
        Ok(dimension)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            store_name: "agent".into(),
            memory: MemoryConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("agent-memory"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

impl Config {
    /// Load configuration from defaults and the environment.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.finish()
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|error| ConfigError::Load {
            path: path.display().to_string(),
            source: Arc::new(error),
        })?;
        let mut config = Self::from_toml(path, &content)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.finish()
    }

    fn from_toml(path: &Path, content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|error| {
            ConfigError::Parse {
                path: path.display().to_string(),
                reason: error.to_string(),
            }
            .into()
        })
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(data_dir) = var("AGENT_MEMORY_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }
        if let Some(store_name) = var("AGENT_MEMORY_STORE") {
            self.store_name = store_name;
        }
        if let Some(provider) = var("AGENT_MEMORY_EMBEDDING_PROVIDER") {
            self.embedding.provider = provider.parse()?;
        }
        if let Some(model) = var("AGENT_MEMORY_EMBEDDING_MODEL") {
            self.embedding.model = Some(model);
        }
        if let Some(dimension) = var("AGENT_MEMORY_EMBEDDING_DIMENSION") {
            let dimension = dimension.parse::<usize>().map_err(|_| {
                ConfigError::Invalid(format!("AGENT_MEMORY_EMBEDDING_DIMENSION is not a number: {dimension}"))
            })?;
            self.embedding.dimension = Some(dimension);
        }
        if let Some(base_url) = var("OLLAMA_BASE_URL") {
            self.embedding.ollama_base_url = base_url;
        }
        Ok(())
    }

    fn finish(self) -> Result<Self> {
        self.validate()?;

        // Ensure data directory exists
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create data directory: {}", self.data_dir.display()))?;

        Ok(self)
    }

    /// Check values that would otherwise fail deep inside the store.
    pub fn validate(&self) -> Result<()> {
        if self.store_name.is_empty()
            || self.store_name.contains(['/', '\\'])
            || self.store_name == "."
            || self.store_name == ".."
        {
            return Err(ConfigError::Invalid(format!("invalid store name: {:?}", self.store_name)).into());
        }
        self.embedding.resolved_dimension()?;
        if self.memory.default_k == 0 {
            return Err(ConfigError::Invalid("memory.default_k must be at least 1".into()).into());
        }
        Ok(())
    }

    /// Locations of the store's artifacts.
    pub fn store_paths(&self) -> StorePaths {
        StorePaths::new(&self.data_dir, &self.store_name)
    }

    /// Directory for rolling log files.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn toml_overrides_defaults() {
        let config = Config::from_toml(
            Path::new("agent.toml"),
            r#"
            data_dir = "/tmp/agent-data"
            store_name = "first_agent"

            [memory]
            default_k = 10
            on_load_failure = "start_empty"

            [embedding]
            provider = "ollama"
            dimension = 768
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.data_dir, PathBuf::from("/tmp/agent-data"));
        assert_eq!(config.store_name, "first_agent");
        assert_eq!(config.memory.default_k, 10);
        assert_eq!(config.memory.on_load_failure, LoadFailurePolicy::StartEmpty);
        assert_eq!(config.embedding.provider, EmbeddingProvider::Ollama);
        assert_eq!(config.embedding.model_name(), "nomic-embed-text");
        assert_eq!(config.embedding.dimension, Some(768));
        assert_eq!(config.embedding.timeout_secs, 30);
    }

    #[test]
    fn env_overrides_file() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("AGENT_MEMORY_STORE", "second"),
                ("AGENT_MEMORY_EMBEDDING_PROVIDER", "fastembed"),
                ("OLLAMA_BASE_URL", "http://gpu-box:11434"),
            ]))
            .expect("env should apply");

        assert_eq!(config.store_name, "second");
        assert_eq!(config.embedding.provider, EmbeddingProvider::FastEmbed);
        assert_eq!(config.embedding.ollama_base_url, "http://gpu-box:11434");
    }

    #[test]
    fn env_sets_model_and_dimension() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("AGENT_MEMORY_EMBEDDING_PROVIDER", "ollama"),
                ("AGENT_MEMORY_EMBEDDING_MODEL", "custom-embedder"),
                ("AGENT_MEMORY_EMBEDDING_DIMENSION", "512"),
            ]))
            .expect("env should apply");

        assert_eq!(config.embedding.model_name(), "custom-embedder");
        assert_eq!(config.embedding.resolved_dimension().expect("dimension"), 512);

        let result = config.apply_env(env(&[("AGENT_MEMORY_EMBEDDING_DIMENSION", "wide")]));
        assert!(result.is_err());
    }

    #[test]
    fn each_provider_has_its_own_defaults() {
        let mut embedding = EmbeddingConfig::default();
        assert_eq!(embedding.model_name(), "hashing-v1");
        assert_eq!(embedding.resolved_dimension().expect("dimension"), 384);

        embedding.provider = EmbeddingProvider::Ollama;
        assert_eq!(embedding.model_name(), "nomic-embed-text");
        assert_eq!(embedding.resolved_dimension().expect("dimension"), 768);

        embedding.provider = EmbeddingProvider::FastEmbed;
        assert_eq!(embedding.model_name(), "all-MiniLM-L6-v2");
        assert_eq!(embedding.resolved_dimension().expect("dimension"), 384);

        embedding.model = Some("bge-base-en-v1.5".into());
        assert_eq!(embedding.resolved_dimension().expect("dimension"), 768);
    }

    #[test]
    fn dimension_must_agree_with_the_model() {
        let mut embedding = EmbeddingConfig {
            provider: EmbeddingProvider::Ollama,
            dimension: Some(384),
            ..EmbeddingConfig::default()
        };
        assert!(embedding.resolved_dimension().is_err());

        embedding.model = Some("nomic-embed-text:latest".into());
        embedding.dimension = None;
        assert_eq!(embedding.resolved_dimension().expect("dimension"), 768);

        embedding.model = Some("my-finetune".into());
        assert!(embedding.resolved_dimension().is_err());
        embedding.dimension = Some(1536);
        assert_eq!(embedding.resolved_dimension().expect("dimension"), 1536);

        let fastembed = EmbeddingConfig {
            provider: EmbeddingProvider::FastEmbed,
            model: Some("word2vec".into()),
            ..EmbeddingConfig::default()
        };
        assert!(fastembed.resolved_dimension().is_err());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let mut config = Config::default();
        let result = config.apply_env(env(&[("AGENT_MEMORY_EMBEDDING_PROVIDER", "word2vec")]));
        assert!(result.is_err());
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut config = Config::default();
        config.store_name = "../escape".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.embedding.dimension = Some(0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.memory.default_k = 0;
        assert!(config.validate().is_err());

        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let error = Config::from_toml(Path::new("bad.toml"), "store_name = [").expect_err("invalid toml");
        assert!(error.to_string().contains("bad.toml"));
    }

    #[test]
    fn store_paths_live_in_data_dir() {
        let mut config = Config::default();
        config.data_dir = PathBuf::from("/srv/memory");
        config.store_name = "helper".into();
        assert_eq!(config.store_paths().log, PathBuf::from("/srv/memory/helper_memory.json"));
        assert_eq!(config.log_dir(), PathBuf::from("/srv/memory/logs"));
    }
}
