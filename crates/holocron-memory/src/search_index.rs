use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use holocron_schema::{CharacterSummary, RetryPolicy};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

use crate::embedding::EmbeddingProvider;
use crate::roster::Roster;

/// sqlite-vec refuses larger `k` values in a KNN query.
const MAX_KNN: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub identifier: String,
    pub name: String,
    pub document: String,
    /// Cosine similarity, higher is closer.
    pub score: f64,
}

/// File name of the persisted index for an embedding model.
pub fn index_file_name(model_id: &str) -> String {
    let sanitized: String = model_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{sanitized}.sqlite")
}

pub fn index_path(index_dir: &Path, model_id: &str) -> PathBuf {
    index_dir.join(index_file_name(model_id))
}

/// Persisted semantic index over character summary documents.
///
/// Built once by [`crate::IndexBuilder`]; read-only afterwards and safe to
/// share between conversations.
#[derive(Clone)]
pub struct UnitIndex {
    db: Arc<Mutex<Connection>>,
    path: PathBuf,
    embedder: Arc<dyn EmbeddingProvider>,
    retry: RetryPolicy,
    dimensions: usize,
}

impl UnitIndex {
    /// Open an existing index. Fails if it was built with a different
    /// embedding model or dimension.
    pub fn open(path: &Path, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        if !path.exists() {
            bail!(
                "no index at {}; run `holocron build-index` first",
                path.display()
            );
        }
        crate::init_sqlite_vec();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open index {}", path.display()))?;

        let model = read_meta(&conn, "embedding_model")?;
        if model.as_deref() != Some(embedder.model_id()) {
            bail!(
                "index {} was built with embedding model {:?}, configured model is {:?}",
                path.display(),
                model.unwrap_or_default(),
                embedder.model_id()
            );
        }
        let dimensions = read_meta(&conn, "dimensions")?
            .and_then(|d| d.parse::<usize>().ok())
            .unwrap_or(0);
        if dimensions != embedder.dimensions() {
            bail!(
                "index {} has {dimensions}-dimension vectors, provider produces {}",
                path.display(),
                embedder.dimensions()
            );
        }

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
            embedder,
            retry: RetryPolicy::none(),
            dimensions,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn model_id(&self) -> &str {
        self.embedder.model_id()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub async fn len(&self) -> Result<usize> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM units", [], |r| r.get(0))?;
            Ok::<usize, anyhow::Error>(count as usize)
        })
        .await?
    }

    pub async fn identifiers(&self) -> Result<Vec<String>> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare("SELECT identifier FROM units ORDER BY id")?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok::<Vec<String>, anyhow::Error>(out)
        })
        .await?
    }

    /// Identifiers present in the index but absent from `roster`.
    pub async fn verify_against(&self, roster: &Roster) -> Result<Vec<String>> {
        Ok(self
            .identifiers()
            .await?
            .into_iter()
            .filter(|id| !roster.contains(id))
            .collect())
    }

    /// Top-`k` documents by descending similarity to `query`. Equal scores
    /// are ordered by identifier.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let texts = vec![query.to_string()];
        let embedder = Arc::clone(&self.embedder);
        let embedded = self
            .retry
            .run("query embedding", || {
                let embedder = Arc::clone(&embedder);
                let texts = texts.clone();
                async move { embedder.embed(&texts).await }
            })
            .await?;
        let query_embedding = embedded
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("embedding provider returned empty query embedding"))?;

        let db = Arc::clone(&self.db);
        let mut hits = task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;

            if has_vec_table(&conn) {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT u.identifier, u.name, u.document, v.distance
                    FROM units_vec v
                    JOIN units u ON u.id = v.rowid
                    WHERE v.embedding MATCH ?1 AND k = ?2
                    "#,
                )?;
                let rows = stmt.query_map(
                    params![embedding_to_json(&query_embedding), k.min(MAX_KNN) as i64],
                    |r| {
                        Ok(SearchHit {
                            identifier: r.get(0)?,
                            name: r.get(1)?,
                            document: r.get(2)?,
                            score: 1.0_f64 - r.get::<_, f64>(3)?,
                        })
                    },
                )?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                return Ok::<Vec<SearchHit>, anyhow::Error>(out);
            }

            let mut stmt =
                conn.prepare("SELECT identifier, name, document, embedding FROM units")?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (identifier, name, document, embedding_json) = row?;
                let embedding = json_to_embedding(&embedding_json)?;
                out.push(SearchHit {
                    identifier,
                    name,
                    document,
                    score: cosine_similarity(&query_embedding, &embedding) as f64,
                });
            }
            Ok::<Vec<SearchHit>, anyhow::Error>(out)
        })
        .await??;

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        hits.truncate(k);
        Ok(hits)
    }
}

/// Write a complete index file at `path`. Blocking; the caller publishes the
/// file only after this returns.
pub(crate) fn write_index(
    path: &Path,
    model_id: &str,
    dimensions: usize,
    rows: &[(CharacterSummary, Vec<f32>)],
) -> Result<()> {
    crate::init_sqlite_vec();
    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to create index {}", path.display()))?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS units (
            id INTEGER PRIMARY KEY,
            identifier TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            tags TEXT NOT NULL,
            document TEXT NOT NULL,
            embedding TEXT NOT NULL
        );
        "#,
    )?;

    let vec_enabled = match conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE units_vec USING vec0(embedding float[{dimensions}] distance_metric=cosine);"
    )) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("sqlite-vec unavailable, index will use brute-force search: {e}");
            false
        }
    };

    let tx = conn.transaction()?;
    for (summary, embedding) in rows {
        if embedding.len() != dimensions {
            bail!(
                "embedding for {} has {} dimensions, expected {dimensions}",
                summary.identifier,
                embedding.len()
            );
        }
        let embedding_json = embedding_to_json(embedding);
        tx.execute(
            "INSERT INTO units(identifier, name, tags, document, embedding) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                summary.identifier,
                summary.name,
                serde_json::to_string(&summary.tags)?,
                summary.document,
                embedding_json
            ],
        )?;
        if vec_enabled {
            let rowid = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO units_vec(rowid, embedding) VALUES (?1, ?2)",
                params![rowid, embedding_json],
            )?;
        }
    }

    for (key, value) in [
        ("embedding_model", model_id.to_string()),
        ("dimensions", dimensions.to_string()),
        ("unit_count", rows.len().to_string()),
        ("built_at", chrono::Utc::now().to_rfc3339()),
    ] {
        tx.execute(
            "INSERT INTO meta(key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
    }
    tx.commit()?;

    conn.close().map_err(|(_, e)| anyhow!(e))?;
    Ok(())
}

fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |r| {
            r.get(0)
        })
        .optional()?)
}

fn has_vec_table(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='units_vec'",
        [],
        |r| r.get(0),
    )
    .unwrap_or(false)
}

fn embedding_to_json(embedding: &[f32]) -> String {
    match serde_json::to_string(embedding) {
        Ok(json) => json,
        Err(_) => "[]".to_owned(),
    }
}

fn json_to_embedding(json: &str) -> Result<Vec<f32>> {
    let out = serde_json::from_str::<Vec<f32>>(json)?;
    Ok(out)
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}
