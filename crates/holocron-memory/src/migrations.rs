use std::collections::HashSet;

use anyhow::Result;
use rusqlite::Connection;

type Migration = (i64, &'static str);

fn cache_migrations() -> Vec<Migration> {
    vec![
        (
            1,
            r#"
            CREATE TABLE IF NOT EXISTS embedding_cache (
                model TEXT NOT NULL,
                hash TEXT NOT NULL,
                embedding TEXT NOT NULL,
                dims INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (model, hash)
            );
            "#,
        ),
        (
            2,
            r#"
            CREATE TABLE IF NOT EXISTS summary_cache (
                model TEXT NOT NULL,
                hash TEXT NOT NULL,
                summary TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (model, hash)
            );
            "#,
        ),
    ]
}

/// Apply any cache schema versions not yet recorded in `__schema_version`.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS __schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        "#,
    )?;

    let mut stmt = conn.prepare("SELECT version FROM __schema_version")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    let mut applied = HashSet::new();
    for row in rows {
        applied.insert(row?);
    }

    for (version, sql) in cache_migrations() {
        if applied.contains(&version) {
            continue;
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO __schema_version(version, applied_at) VALUES (?1, datetime('now'))",
            [version],
        )?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        run_migrations(&conn)?;
        let versions: i64 =
            conn.query_row("SELECT COUNT(*) FROM __schema_version", [], |r| r.get(0))?;
        assert_eq!(versions, 2);
        Ok(())
    }
}
