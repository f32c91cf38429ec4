use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

use crate::migrations::run_migrations;

/// Durable content-hash cache for embeddings and ability summaries.
///
/// Lives in its own database so an index rebuild never discards it. Rows are
/// keyed by `(model, sha256(text))`, so switching models never reuses stale
/// entries.
#[derive(Clone)]
pub struct CacheStore {
    db: Arc<Mutex<Connection>>,
}

impl CacheStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open cache {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn get_embedding(&self, model: &str, hash: &str) -> Result<Option<Vec<f32>>> {
        let db = Arc::clone(&self.db);
        let model = model.to_string();
        let hash = hash.to_string();

        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare_cached(
                "SELECT embedding FROM embedding_cache WHERE model = ?1 AND hash = ?2",
            )?;
            let embedding: Option<String> = stmt
                .query_row(params![model, hash], |row| row.get(0))
                .optional()?;

            match embedding {
                Some(json) => Ok(Some(serde_json::from_str::<Vec<f32>>(&json)?)),
                None => Ok(None),
            }
        })
        .await?
    }

    pub async fn put_embedding(&self, model: &str, hash: &str, embedding: &[f32]) -> Result<()> {
        let db = Arc::clone(&self.db);
        let model = model.to_string();
        let hash = hash.to_string();
        let embedding_json = serde_json::to_string(embedding)?;
        let dims = embedding.len() as i64;
        let now = Utc::now().timestamp();

        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            conn.execute(
                "INSERT OR REPLACE INTO embedding_cache (model, hash, embedding, dims, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![model, hash, embedding_json, dims, now],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await?
    }

    pub async fn get_summary(&self, model: &str, hash: &str) -> Result<Option<String>> {
        let db = Arc::clone(&self.db);
        let model = model.to_string();
        let hash = hash.to_string();

        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare_cached(
                "SELECT summary FROM summary_cache WHERE model = ?1 AND hash = ?2",
            )?;
            let summary = stmt
                .query_row(params![model, hash], |row| row.get::<_, String>(0))
                .optional()?;
            Ok(summary)
        })
        .await?
    }

    pub async fn put_summary(&self, model: &str, hash: &str, summary: &str) -> Result<()> {
        let db = Arc::clone(&self.db);
        let model = model.to_string();
        let hash = hash.to_string();
        let summary = summary.to_string();
        let now = Utc::now().timestamp();

        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            conn.execute(
                "INSERT OR REPLACE INTO summary_cache (model, hash, summary, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![model, hash, summary, now],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await?
    }

    /// Number of cached embeddings for `model`.
    pub async fn embedding_count(&self, model: &str) -> Result<usize> {
        let db = Arc::clone(&self.db);
        let model = model.to_string();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM embedding_cache WHERE model = ?1",
                params![model],
                |r| r.get(0),
            )?;
            Ok::<usize, anyhow::Error>(count as usize)
        })
        .await?
    }
}
