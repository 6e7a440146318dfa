//! Embedding providers.
//!
//! The store only talks to the [`Embedder`] trait. Three providers ship with
//! the crate:
//!
//! - [`HashingEmbedder`]: feature-hashed bag of words, offline and fully
//!   deterministic. The default, and what the tests run against.
//! - [`OllamaEmbedder`]: the `/api/embeddings` endpoint of a local Ollama
//!   server.
//! - `FastEmbedder`: a local ONNX model via fastembed, behind the
//!   `local-embeddings` feature.

use crate::config::{EmbeddingConfig, EmbeddingProvider};
use crate::error::{MemoryError, Result};
use crate::memory::types::EmbeddingModelInfo;
use anyhow::Context as _;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Turns text into fixed-length vectors.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    /// Identity and output dimension of the underlying model.
    fn model(&self) -> &EmbeddingModelInfo;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Reject provider output that cannot go into the index.
pub fn validate_embedding(model: &EmbeddingModelInfo, embedding: Vec<f32>) -> Result<Vec<f32>> {
    if embedding.is_empty() {
        return Err(MemoryError::EmbeddingFailed(format!("{} returned an empty vector", model.name)).into());
    }
    if embedding.len() != model.dimension {
        return Err(MemoryError::EmbeddingFailed(format!(
            "{} returned {} dimensions, expected {}",
            model.name,
            embedding.len(),
            model.dimension
        ))
        .into());
    }
    if embedding.iter().any(|value| !value.is_finite()) {
        return Err(MemoryError::EmbeddingFailed(format!(
            "{} returned non-finite components",
            model.name
        ))
        .into());
    }
    Ok(embedding)
}

/// Output dimension of the hashing provider unless configured otherwise.
pub const DEFAULT_HASHING_DIMENSION: usize = 384;

const OLLAMA_MODELS: &[(&str, usize)] = &[
    ("nomic-embed-text", 768),
    ("mxbai-embed-large", 1024),
    ("all-minilm", 384),
    ("snowflake-arctic-embed", 1024),
    ("bge-m3", 1024),
];

const FASTEMBED_MODELS: &[(&str, usize)] = &[
    ("all-MiniLM-L6-v2", 384),
    ("all-MiniLM-L12-v2", 384),
    ("bge-small-en-v1.5", 384),
    ("bge-base-en-v1.5", 768),
    ("nomic-embed-text-v1.5", 768),
];

/// Output dimension of a model the crate knows about.
///
/// Ollama tags (`name:tag`) are looked up by name. The hashing provider has
/// no fixed dimension and always returns `None`.
pub fn known_dimension(provider: EmbeddingProvider, model: &str) -> Option<usize> {
    let (table, model) = match provider {
        EmbeddingProvider::Hashing => return None,
        EmbeddingProvider::Ollama => (OLLAMA_MODELS, model.split(':').next().unwrap_or(model)),
        EmbeddingProvider::FastEmbed => (FASTEMBED_MODELS, model),
    };
    table
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, dimension)| *dimension)
}

/// Build the provider selected in the configuration.
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    let dimension = config.resolved_dimension()?;
    let embedder: Arc<dyn Embedder> = match config.provider {
        EmbeddingProvider::Hashing => Arc::new(HashingEmbedder::new(dimension)),
        EmbeddingProvider::Ollama => Arc::new(OllamaEmbedder::new(
            &config.ollama_base_url,
            config.model_name(),
            dimension,
            Duration::from_secs(config.timeout_secs),
        )?),
        #[cfg(feature = "local-embeddings")]
        EmbeddingProvider::FastEmbed => Arc::new(FastEmbedder::new(config.model_name(), dimension)?),
        #[cfg(not(feature = "local-embeddings"))]
        EmbeddingProvider::FastEmbed => {
            return Err(crate::error::ConfigError::Invalid(
                "the fastembed provider requires the `local-embeddings` feature".into(),
            )
            .into());
        }
    };

    tracing::info!(model = %embedder.model(), "embedding provider ready");
    Ok(embedder)
}

/// Feature-hashing bag-of-words embedder.
///
/// Tokens are lowercased alphanumeric runs. Each token lands in the bucket
/// given by the first eight bytes of its SHA-256 digest, and the count vector
/// is L2-normalised. Texts sharing more words are closer under cosine
/// distance, which is enough for keyword-level recall without a model.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    model: EmbeddingModelInfo,
}

impl HashingEmbedder {
    pub const MODEL_NAME: &'static str = "hashing-v1";

    pub fn new(dimension: usize) -> Self {
        Self {
            model: EmbeddingModelInfo::new(Self::MODEL_NAME, dimension),
        }
    }

    /// Synchronous embedding; never fails.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let dimension = self.model.dimension;
        let mut vector = vec![0.0f32; dimension];
        if dimension == 0 {
            return vector;
        }

        let lowered = text.to_lowercase();
        for token in lowered.split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            vector[bucket(token, dimension)] += 1.0;
        }

        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

fn bucket(token: &str, dimension: usize) -> usize {
    let digest = Sha256::digest(token.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(prefix) % dimension as u64) as usize
}

#[async_trait::async_trait]
impl Embedder for HashingEmbedder {
    fn model(&self) -> &EmbeddingModelInfo {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }
}

/// Embeddings from an Ollama server.
pub struct OllamaEmbedder {
    model: EmbeddingModelInfo,
    endpoint: String,
    http_client: reqwest::Client,
}

#[derive(serde::Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(serde::Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str, dimension: usize, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .with_context(|| "failed to build HTTP client")?;

        Ok(Self {
            model: EmbeddingModelInfo::new(format!("ollama/{model}"), dimension),
            endpoint: format!("{}/api/embeddings", base_url.trim_end_matches('/')),
            http_client,
        })
    }

    fn model_tag(&self) -> &str {
        self.model
            .name
            .strip_prefix("ollama/")
            .unwrap_or(&self.model.name)
    }
}

#[async_trait::async_trait]
impl Embedder for OllamaEmbedder {
    fn model(&self) -> &EmbeddingModelInfo {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&OllamaEmbeddingRequest {
                model: self.model_tag(),
                prompt: text,
            })
            .send()
            .await
            .map_err(|error| MemoryError::EmbeddingFailed(format!("ollama request failed: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MemoryError::EmbeddingFailed(format!("ollama returned {status}: {body}")).into());
        }

        let body: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|error| MemoryError::EmbeddingFailed(format!("malformed ollama response: {error}")))?;

        validate_embedding(&self.model, body.embedding)
    }
}

/// Local ONNX embeddings via fastembed.
#[cfg(feature = "local-embeddings")]
pub struct FastEmbedder {
    model: EmbeddingModelInfo,
    inner: Arc<fastembed::TextEmbedding>,
}

#[cfg(feature = "local-embeddings")]
impl FastEmbedder {
    /// Load the named model, downloading it on first use.
    pub fn new(model_name: &str, dimension: usize) -> Result<Self> {
        let variant = match model_name {
            "all-MiniLM-L6-v2" => fastembed::EmbeddingModel::AllMiniLML6V2,
            "all-MiniLM-L12-v2" => fastembed::EmbeddingModel::AllMiniLML12V2,
            "bge-small-en-v1.5" => fastembed::EmbeddingModel::BGESmallENV15,
            "bge-base-en-v1.5" => fastembed::EmbeddingModel::BGEBaseENV15,
            "nomic-embed-text-v1.5" => fastembed::EmbeddingModel::NomicEmbedTextV15,
            other => {
                return Err(crate::error::ConfigError::Invalid(format!(
                    "unknown fastembed model: {other}"
                ))
                .into());
            }
        };

        let inner = fastembed::TextEmbedding::try_new(fastembed::InitOptions::new(variant))
            .map_err(|error| MemoryError::EmbeddingFailed(error.to_string()))?;

        Ok(Self {
            model: EmbeddingModelInfo::new(format!("fastembed/{model_name}"), dimension),
            inner: Arc::new(inner),
        })
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait::async_trait]
impl Embedder for FastEmbedder {
    fn model(&self) -> &EmbeddingModelInfo {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        // fastembed is synchronous
        let inner = self.inner.clone();
        let text = text.to_string();
        let embeddings = tokio::task::spawn_blocking(move || inner.embed(vec![text], None))
            .await
            .map_err(|error| MemoryError::EmbeddingFailed(format!("embedding task failed: {error}")))?
            .map_err(|error| MemoryError::EmbeddingFailed(error.to_string()))?;

        let embedding = embeddings.into_iter().next().unwrap_or_default();
        validate_embedding(&self.model, embedding)
    }
}
