use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use holocron_memory::{EmbeddingProvider, GeminiEmbeddingProvider, StubEmbeddingProvider};
use holocron_provider::{ProviderConfig, ProviderType};
use holocron_schema::RetryPolicy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolocronConfig {
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub units_path: PathBuf,
    pub details_path: PathBuf,
    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
}

fn default_index_dir() -> PathBuf {
    PathBuf::from("index")
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("cache/embeddings.sqlite")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider_type")]
    pub provider: ProviderType,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_primary_model")]
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider_type() -> ProviderType {
    ProviderType::Gemini
}

fn default_primary_model() -> String {
    "gemini-3-flash-preview".to_string()
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_model_timeout_secs() -> u64 {
    60
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider_type(),
            api_key: None,
            base_url: None,
            primary: default_primary_model(),
            fallbacks: Vec::new(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            timeout_secs: default_model_timeout_secs(),
        }
    }
}

impl ModelConfig {
    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            provider_type: self.provider,
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    Gemini,
    /// Hash-derived vectors; no network, no semantics.
    Stub,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_backend")]
    pub provider: EmbeddingBackend,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,
}

fn default_embedding_backend() -> EmbeddingBackend {
    EmbeddingBackend::Gemini
}

fn default_embedding_model() -> String {
    "gemini-embedding-001".to_string()
}

fn default_embedding_dimensions() -> usize {
    768
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_backend(),
            api_key: None,
            base_url: None,
            model: default_embedding_model(),
            dimensions: default_embedding_dimensions(),
        }
    }
}

impl EmbeddingConfig {
    pub fn create_provider(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        let provider: Arc<dyn EmbeddingProvider> = match self.provider {
            EmbeddingBackend::Gemini => {
                let key = self
                    .api_key
                    .as_ref()
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| anyhow!("gemini embedding requires api_key"))?;
                let mut provider = GeminiEmbeddingProvider::with_model(
                    key.clone(),
                    self.model.clone(),
                    self.dimensions,
                );
                if let Some(base_url) = &self.base_url {
                    provider = provider.with_base_url(base_url.clone());
                }
                Arc::new(provider)
            }
            EmbeddingBackend::Stub => Arc::new(StubEmbeddingProvider::new(self.dimensions)),
        };
        Ok(provider)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Defaults to `model.primary`.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_summary_concurrency")]
    pub concurrency: usize,
}

fn default_true() -> bool {
    true
}

fn default_summary_concurrency() -> usize {
    4
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: None,
            concurrency: default_summary_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentSettings {
    #[serde(default = "default_max_cycles")]
    pub max_cycles: usize,
    #[serde(default = "default_search_k")]
    pub search_k: usize,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_max_cycles() -> usize {
    10
}

fn default_search_k() -> usize {
    10
}

fn default_tool_timeout_secs() -> u64 {
    30
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_cycles: default_max_cycles(),
            search_k: default_search_k(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// Replace every `${VAR}` with the value of `VAR` (empty when unset).
pub fn resolve_env_var(raw: &str) -> String {
    let mut output = String::new();
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);

        let candidate = &rest[start + 2..];
        let Some(end) = candidate.find('}') else {
            output.push_str(&rest[start..]);
            return output;
        };

        let key = &candidate[..end];
        output.push_str(&std::env::var(key).unwrap_or_default());
        rest = &candidate[end + 1..];
    }

    output.push_str(rest);
    output
}

fn resolve_optional(value: &mut Option<String>) {
    if let Some(raw) = value.take() {
        let resolved = resolve_env_var(&raw);
        *value = (!resolved.is_empty()).then_some(resolved);
    }
}

fn resolve_path(root: &Path, path: &Path) -> PathBuf {
    let resolved = PathBuf::from(resolve_env_var(&path.to_string_lossy()));
    if resolved.is_absolute() {
        resolved
    } else {
        root.join(resolved)
    }
}

fn resolve_config_env(config: &mut HolocronConfig, root: &Path) {
    resolve_optional(&mut config.model.api_key);
    resolve_optional(&mut config.model.base_url);
    resolve_optional(&mut config.embedding.api_key);
    resolve_optional(&mut config.embedding.base_url);

    let data = &mut config.data;
    data.units_path = resolve_path(root, &data.units_path);
    data.details_path = resolve_path(root, &data.details_path);
    data.index_dir = resolve_path(root, &data.index_dir);
    data.cache_path = resolve_path(root, &data.cache_path);
}

/// Path of the main config file under a config root.
pub fn config_file(root: &Path) -> PathBuf {
    root.join("config").join("main.yaml")
}

pub fn load_config(root: &Path) -> Result<HolocronConfig> {
    let mut config: HolocronConfig = read_yaml_file(&config_file(root))?;
    resolve_config_env(&mut config, root);
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &HolocronConfig) -> Result<()> {
    if config.agent.max_cycles == 0 {
        return Err(anyhow!("agent.max_cycles must be at least 1"));
    }
    if config.agent.search_k == 0 {
        return Err(anyhow!("agent.search_k must be at least 1"));
    }
    if config.embedding.dimensions == 0 {
        return Err(anyhow!("embedding.dimensions must be at least 1"));
    }
    if config.model.primary.trim().is_empty() {
        return Err(anyhow!("model.primary must not be empty"));
    }
    if config.model.provider == ProviderType::Gemini && is_blank(&config.model.api_key) {
        return Err(anyhow!("model.api_key is required for the gemini provider"));
    }
    if config.embedding.provider == EmbeddingBackend::Gemini && is_blank(&config.embedding.api_key)
    {
        return Err(anyhow!(
            "embedding.api_key is required for the gemini embedding provider"
        ));
    }
    Ok(())
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

fn read_yaml_file<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse yaml file: {}", path.display()))
}
