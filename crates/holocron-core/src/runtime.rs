//! Wires config, data, providers and tools into a ready-to-use agent.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use holocron_memory::{
    search_index, BuildReport, CacheStore, EmbeddingProvider, IndexBuildError, IndexBuilder,
    Roster, UnitIndex,
};
use holocron_provider::{create_provider, LlmProvider};

use crate::config::HolocronConfig;
use crate::observer::SessionObserver;
use crate::reasoning_loop::{LoopSettings, ReasoningLoop};
use crate::router::LlmRouter;
use crate::summarizer::LlmAbilitySummarizer;
use crate::unit_tools::unit_tool_registry;

pub struct Holocron {
    config: HolocronConfig,
    roster: Arc<Roster>,
    provider: Arc<dyn LlmProvider>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl Holocron {
    /// Load the roster and create both providers from `config`.
    pub fn from_config(config: HolocronConfig) -> Result<Self> {
        let roster = Roster::load(&config.data.units_path, &config.data.details_path)
            .context("failed to load character data")?;
        let provider = create_provider(&config.model.provider_config())?;
        let embedder = config.embedding.create_provider()?;
        Ok(Self::with_parts(config, roster, provider, embedder))
    }

    pub fn with_parts(
        config: HolocronConfig,
        roster: Roster,
        provider: Arc<dyn LlmProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            config,
            roster: Arc::new(roster),
            provider,
            embedder,
        }
    }

    pub fn config(&self) -> &HolocronConfig {
        &self.config
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    pub fn index_path(&self) -> PathBuf {
        search_index::index_path(&self.config.data.index_dir, self.embedder.model_id())
    }

    pub fn router(&self) -> LlmRouter {
        LlmRouter::from_config(
            Arc::clone(&self.provider),
            &self.config.model,
            self.config.retry.clone(),
        )
    }

    /// Build the semantic index unless it already exists.
    pub async fn build_index(&self, summarize: bool) -> Result<BuildReport, IndexBuildError> {
        let cache = CacheStore::open(&self.config.data.cache_path)?;
        let mut builder = IndexBuilder::new(
            self.config.data.index_dir.clone(),
            Arc::clone(&self.embedder),
            cache,
        )
        .with_retry(self.config.retry.clone())
        .with_summary_concurrency(self.config.summarizer.concurrency);

        if summarize && self.config.summarizer.enabled {
            let model = self
                .config
                .summarizer
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.primary.clone());
            builder = builder.with_summarizer(Arc::new(LlmAbilitySummarizer::new(
                Arc::clone(&self.provider),
                model,
            )));
        }
        builder.build(&self.roster).await
    }

    pub fn open_index(&self) -> Result<UnitIndex> {
        Ok(UnitIndex::open(&self.index_path(), Arc::clone(&self.embedder))?
            .with_retry(self.config.retry.clone()))
    }

    /// Build the index on first use, then hand out a reasoning loop over it.
    /// Once the index exists the build step is a no-op.
    pub async fn prepare_reasoning_loop(
        &self,
        observers: Vec<Arc<dyn SessionObserver>>,
    ) -> Result<ReasoningLoop> {
        let report = self
            .build_index(true)
            .await
            .context("failed to bootstrap the semantic index")?;
        if !report.skipped {
            tracing::info!(
                units = report.units,
                embedded = report.embedded,
                "semantic index bootstrapped at {}",
                report.index_path.display()
            );
        }
        self.reasoning_loop(observers)
    }

    /// A reasoning loop over the persisted index. Fails if the index has
    /// not been built.
    pub fn reasoning_loop(&self, observers: Vec<Arc<dyn SessionObserver>>) -> Result<ReasoningLoop> {
        let index = Arc::new(self.open_index()?);
        let tools = unit_tool_registry(
            Arc::clone(&self.roster),
            index,
            self.config.agent.search_k,
        )?;
        let settings = LoopSettings::from_config(&self.config.agent, &self.config.model);
        let reasoning = observers.into_iter().fold(
            ReasoningLoop::new(Arc::new(self.router()), Arc::new(tools)).with_settings(settings),
            |reasoning, observer| reasoning.with_observer(observer),
        );
        Ok(reasoning)
    }
}
