//! One-time construction of the persisted semantic index.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use fs2::FileExt;
use futures::stream::{self, StreamExt};
use holocron_schema::{AbilityRecord, CharacterDetail, CharacterSummary, RetryPolicy, UnitListing};
use serde::Serialize;
use thiserror::Error;
use tokio::task;

use crate::document::summarize_unit;
use crate::embedding::{CachedEmbeddingProvider, EmbeddingProvider};
use crate::roster::Roster;
use crate::search_index::{index_path, write_index};
use crate::{content_hash, CacheStore};

/// Gemini's `batchEmbedContents` accepts at most 100 requests per call.
const DEFAULT_EMBED_BATCH: usize = 100;

/// Text-in, text-out compression of ability descriptions, used only while
/// building the index.
#[async_trait]
pub trait AbilitySummarizer: Send + Sync {
    async fn summarize(&self, ability_name: &str, description: &str) -> Result<String>;
    fn model_id(&self) -> &str;
}

#[derive(Debug, Error)]
pub enum IndexBuildError {
    #[error("unit '{identifier}' has no matching character detail record")]
    MissingDetail { identifier: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildReport {
    pub index_path: PathBuf,
    /// The index already existed; nothing was computed.
    pub skipped: bool,
    pub units: usize,
    /// Embeddings computed by the provider.
    pub embedded: usize,
    pub cache_hits: usize,
    pub summarized: usize,
    pub summary_cache_hits: usize,
    pub summary_fallbacks: usize,
}

impl BuildReport {
    fn skipped(index_path: PathBuf) -> Self {
        Self {
            index_path,
            skipped: true,
            ..Default::default()
        }
    }
}

enum SummaryOutcome {
    Raw(String),
    CacheHit(String),
    Summarized(String),
    Fallback(String),
}

impl SummaryOutcome {
    fn into_text(self) -> String {
        match self {
            Self::Raw(t) | Self::CacheHit(t) | Self::Summarized(t) | Self::Fallback(t) => t,
        }
    }
}

pub struct IndexBuilder {
    index_dir: PathBuf,
    embedder: Arc<dyn EmbeddingProvider>,
    cache: CacheStore,
    summarizer: Option<Arc<dyn AbilitySummarizer>>,
    summary_concurrency: usize,
    retry: RetryPolicy,
    batch_size: usize,
}

impl IndexBuilder {
    pub fn new(index_dir: PathBuf, embedder: Arc<dyn EmbeddingProvider>, cache: CacheStore) -> Self {
        Self {
            index_dir,
            embedder,
            cache,
            summarizer: None,
            summary_concurrency: 4,
            retry: RetryPolicy::default(),
            batch_size: DEFAULT_EMBED_BATCH,
        }
    }

    /// Without a summarizer, raw descriptions go into the documents.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn AbilitySummarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_summary_concurrency(mut self, concurrency: usize) -> Self {
        self.summary_concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn index_path(&self) -> PathBuf {
        index_path(&self.index_dir, self.embedder.model_id())
    }

    /// Build the index unless one already exists for this embedding model.
    ///
    /// Concurrent builders serialize on `<index>.lock`. Nothing is published
    /// at the final path unless every unit was embedded and stored.
    pub async fn build(&self, roster: &Roster) -> Result<BuildReport, IndexBuildError> {
        let path = self.index_path();
        if path.exists() {
            tracing::info!("index already present at {}, skipping build", path.display());
            return Ok(BuildReport::skipped(path));
        }

        std::fs::create_dir_all(&self.index_dir)
            .with_context(|| format!("failed to create {}", self.index_dir.display()))?;
        let lock = acquire_lock(sibling(&path, ".lock")).await?;
        let result = self.build_locked(roster, path).await;
        if let Err(e) = FileExt::unlock(&lock) {
            tracing::warn!("failed to release index build lock: {e}");
        }
        result
    }

    async fn build_locked(
        &self,
        roster: &Roster,
        path: PathBuf,
    ) -> Result<BuildReport, IndexBuildError> {
        if path.exists() {
            tracing::info!("index was built by another process while waiting for the lock");
            return Ok(BuildReport::skipped(path));
        }

        let mut units: Vec<(&UnitListing, &CharacterDetail)> = Vec::with_capacity(roster.len());
        for listing in roster.listings() {
            let detail = roster.get_detail(&listing.identifier).ok_or_else(|| {
                IndexBuildError::MissingDetail {
                    identifier: listing.identifier.clone(),
                }
            })?;
            units.push((listing, detail));
        }

        let mut report = BuildReport {
            index_path: path.clone(),
            units: units.len(),
            ..Default::default()
        };

        tracing::info!(units = units.len(), "building semantic index");
        let summaries = self.summarize_units(&units, &mut report).await;

        let documents: Vec<String> = summaries.iter().map(|s| s.document.clone()).collect();
        let cached = CachedEmbeddingProvider::new(Arc::clone(&self.embedder), self.cache.clone());
        let mut vectors = Vec::with_capacity(documents.len());
        for batch in documents.chunks(self.batch_size) {
            let embedded = self
                .retry
                .run("document embedding", || cached.embed(batch))
                .await?;
            vectors.extend(embedded.embeddings);
        }
        if vectors.len() != summaries.len() {
            return Err(anyhow!(
                "embedding count mismatch: expected {}, got {}",
                summaries.len(),
                vectors.len()
            )
            .into());
        }
        let (cache_hits, embedded) = cached.stats();
        report.cache_hits = cache_hits;
        report.embedded = embedded;

        self.publish(&path, summaries.into_iter().zip(vectors).collect())
            .await?;

        tracing::info!(
            units = report.units,
            embedded = report.embedded,
            cache_hits = report.cache_hits,
            summarized = report.summarized,
            summary_fallbacks = report.summary_fallbacks,
            "semantic index written to {}",
            path.display()
        );
        Ok(report)
    }

    async fn summarize_units(
        &self,
        units: &[(&UnitListing, &CharacterDetail)],
        report: &mut BuildReport,
    ) -> Vec<CharacterSummary> {
        let jobs: Vec<(usize, &AbilityRecord)> = units
            .iter()
            .enumerate()
            .flat_map(|(i, &(_, detail))| detail.rendered_abilities().map(move |a| (i, a)))
            .collect();

        let outcomes: Vec<(usize, SummaryOutcome)> = stream::iter(jobs)
            .map(|(i, ability)| async move { (i, self.summary_for(ability).await) })
            .buffered(self.summary_concurrency)
            .collect()
            .await;

        let mut per_unit: Vec<Vec<String>> = vec![Vec::new(); units.len()];
        for (i, outcome) in outcomes {
            match &outcome {
                SummaryOutcome::Raw(_) => {}
                SummaryOutcome::CacheHit(_) => report.summary_cache_hits += 1,
                SummaryOutcome::Summarized(_) => report.summarized += 1,
                SummaryOutcome::Fallback(_) => report.summary_fallbacks += 1,
            }
            per_unit[i].push(outcome.into_text());
        }

        units
            .iter()
            .zip(per_unit)
            .map(|((listing, detail), texts)| summarize_unit(listing, detail, &texts))
            .collect()
    }

    async fn summary_for(&self, ability: &AbilityRecord) -> SummaryOutcome {
        let Some(summarizer) = &self.summarizer else {
            return SummaryOutcome::Raw(ability.description.clone());
        };

        // the prompt carries the name too, so it is part of the key
        let hash = content_hash(&format!("{}\n{}", ability.name, ability.description));
        match self.cache.get_summary(summarizer.model_id(), &hash).await {
            Ok(Some(summary)) => return SummaryOutcome::CacheHit(summary),
            Ok(None) => {}
            Err(e) => tracing::warn!("summary cache read failed: {e:#}"),
        }

        let attempt = self
            .retry
            .run("ability summary", || {
                summarizer.summarize(&ability.name, &ability.description)
            })
            .await;

        match attempt {
            Ok(summary) if !summary.trim().is_empty() => {
                let summary = summary.trim().to_string();
                if let Err(e) = self
                    .cache
                    .put_summary(summarizer.model_id(), &hash, &summary)
                    .await
                {
                    tracing::warn!("summary cache write failed: {e:#}");
                }
                SummaryOutcome::Summarized(summary)
            }
            Ok(_) => {
                tracing::warn!(
                    "empty summary for ability '{}', using raw description",
                    ability.name
                );
                SummaryOutcome::Fallback(ability.description.clone())
            }
            Err(e) => {
                tracing::warn!(
                    "summarizing ability '{}' failed, using raw description: {e:#}",
                    ability.name
                );
                SummaryOutcome::Fallback(ability.description.clone())
            }
        }
    }

    async fn publish(&self, path: &Path, rows: Vec<(CharacterSummary, Vec<f32>)>) -> Result<()> {
        let partial = sibling(path, ".partial");
        if partial.exists() {
            std::fs::remove_file(&partial)
                .with_context(|| format!("failed to remove stale {}", partial.display()))?;
        }

        let model_id = self.embedder.model_id().to_string();
        let dimensions = self.embedder.dimensions();
        let target = partial.clone();
        let written = task::spawn_blocking(move || write_index(&target, &model_id, dimensions, &rows))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r);

        if let Err(e) = written {
            if let Err(cleanup) = std::fs::remove_file(&partial) {
                tracing::debug!("no partial index to clean up: {cleanup}");
            }
            return Err(e);
        }

        std::fs::rename(&partial, path).with_context(|| {
            format!(
                "failed to publish {} as {}",
                partial.display(),
                path.display()
            )
        })
    }
}

/// `<path><suffix>`, e.g. `stub.sqlite.lock`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

async fn acquire_lock(path: PathBuf) -> Result<File> {
    task::spawn_blocking(move || {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;
        FileExt::lock_exclusive(&file)
            .with_context(|| format!("failed to lock {}", path.display()))?;
        Ok::<File, anyhow::Error>(file)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_appends_suffix() {
        let p = sibling(Path::new("/tmp/idx/stub.sqlite"), ".partial");
        assert_eq!(p, PathBuf::from("/tmp/idx/stub.sqlite.partial"));
    }

    #[test]
    fn missing_detail_names_the_unit() {
        let err = IndexBuildError::MissingDetail {
            identifier: "u/ghost".into(),
        };
        assert!(err.to_string().contains("u/ghost"));
    }
}
