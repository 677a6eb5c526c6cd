//! TOML configuration for assembling a pipeline.
//!
//! The library itself is assembled from parts (sources, parser, chunker,
//! embedder, storage); this module gives deployments a declarative way to
//! describe those parts. Validation happens at load time so a bad config
//! fails before any source is touched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::chunker::slide::SlideChunker;
use crate::embedder::ollama::OllamaEmbedder;
use crate::embedder::openai::OpenAiEmbedder;
use crate::embedder::Embedder;
use crate::storage::pg::PgStorageConfig;
use crate::storage::ProcessorVersion;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub processor: ProcessorConfig,
    pub chunking: ChunkingConfig,
    pub embedder: EmbedderConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessorConfig {
    pub major: i32,
    pub minor: i32,
    pub patch: i32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Chunk size in tokens (1 token ≈ 4 bytes).
    pub window: u32,
    /// Overlap between consecutive chunks, in tokens.
    #[serde(default)]
    pub slide: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbedderConfig {
    /// `"ollama"` or `"openai"`.
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub dimensions: Option<u32>,
    /// Environment variable holding the API key (OpenAI only).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// PostgreSQL connection URL.
    pub database_url: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_prefix")]
    pub table_prefix: String,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_prefix() -> String {
    "file2llm_".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    /// Number of pooled OCR workers.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Base URL of the OCR HTTP server.
    #[serde(default)]
    pub server_url: Option<String>,
    /// Language codes, primary first.
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            server_url: None,
            languages: default_languages(),
        }
    }
}

fn default_pool_size() -> u32 {
    2
}

fn default_languages() -> Vec<String> {
    vec!["eng".to_string()]
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    /// Filesystem sources by name. The `uuid` field is the storage
    /// identity; the map key is only a config label.
    #[serde(default)]
    pub filesystem: BTreeMap<String, FilesystemSourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemSourceConfig {
    pub root: PathBuf,
    pub uuid: String,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

impl Config {
    /// The processor version quadruple: the config triple plus the
    /// embedding model name.
    pub fn processor_version(&self) -> ProcessorVersion {
        ProcessorVersion {
            major: self.processor.major,
            minor: self.processor.minor,
            patch: self.processor.patch,
            embeddings_model: self.embedder.model.clone(),
        }
    }

    /// Builds the configured chunker.
    pub fn build_chunker(&self) -> SlideChunker {
        SlideChunker::new(self.chunking.window, self.chunking.slide)
    }

    /// Builds the configured embedding client.
    pub fn build_embedder(&self) -> Result<Arc<dyn Embedder>> {
        match self.embedder.provider.as_str() {
            "ollama" => {
                let mut embedder = OllamaEmbedder::new(&self.embedder.model);
                if let Some(base_url) = &self.embedder.base_url {
                    embedder = embedder.with_base_url(base_url);
                }
                if let Some(dimensions) = self.embedder.dimensions {
                    embedder = embedder.with_dimensions(dimensions);
                }
                Ok(Arc::new(embedder))
            }
            "openai" => {
                let api_key = std::env::var(&self.embedder.api_key_env).with_context(|| {
                    format!("{} environment variable not set", self.embedder.api_key_env)
                })?;
                let mut embedder = OpenAiEmbedder::new(&self.embedder.model, api_key);
                if let Some(base_url) = &self.embedder.base_url {
                    embedder = embedder.with_base_url(base_url);
                }
                if let Some(dimensions) = self.embedder.dimensions {
                    embedder = embedder.with_dimensions(dimensions);
                }
                Ok(Arc::new(embedder))
            }
            other => bail!("Unknown embedder provider: '{other}'. Must be ollama or openai."),
        }
    }

    /// The pgvector backend settings implied by this config.
    pub fn pg_storage_config(&self) -> PgStorageConfig {
        PgStorageConfig {
            schema: self.storage.schema.clone(),
            prefix: self.storage.table_prefix.clone(),
            vector_dimensions: self.embedder.dimensions.unwrap_or(768),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

    if config.chunking.window == 0 {
        bail!("chunking.window must be > 0");
    }
    if config.chunking.slide >= config.chunking.window {
        bail!("chunking.slide must be smaller than chunking.window");
    }

    match config.embedder.provider.as_str() {
        "ollama" | "openai" => {}
        other => bail!("Unknown embedder provider: '{other}'. Must be ollama or openai."),
    }
    if config.embedder.model.is_empty() {
        bail!("embedder.model must be specified");
    }
    if config.embedder.dimensions == Some(0) {
        bail!("embedder.dimensions must be > 0");
    }

    if config.storage.database_url.is_empty() {
        bail!("storage.database_url must be specified");
    }

    if config.ocr.pool_size == 0 {
        bail!("ocr.pool_size must be > 0");
    }

    for (name, source) in &config.sources.filesystem {
        if source.uuid.is_empty() {
            bail!("sources.filesystem.{name}.uuid must be specified");
        }
    }

    Ok(config)
}
