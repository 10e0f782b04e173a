//! SQLite-backed history store.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, info};

use paperwatch_common::{CanonicalKey, HistoryEntry, PaperwatchError, Result, Subscription};
use paperwatch_llm::{ScoreCache, ScoreResult};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS paper_history (
        key              TEXT PRIMARY KEY,
        first_seen_at    TEXT NOT NULL,
        last_digested_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_history_last_digested
        ON paper_history (last_digested_at);

    CREATE TABLE IF NOT EXISTS llm_score_cache (
        key         TEXT NOT NULL,
        prompt_hash TEXT NOT NULL,
        score       REAL NOT NULL,
        explanation TEXT NOT NULL,
        cached_at   TEXT NOT NULL,
        PRIMARY KEY (key, prompt_hash)
    );

    CREATE TABLE IF NOT EXISTS subscriptions (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_ref  TEXT NOT NULL,
        keywords   TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS search_history (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        query        TEXT NOT NULL,
        result_count INTEGER NOT NULL,
        searched_at  TEXT NOT NULL
    );
";

/// Row counts removed by [`HistoryStore::prune`]. Subscriptions are
/// standing state and are never pruned.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub history_removed: usize,
    pub scores_removed: usize,
    pub searches_removed: usize,
}

/// One recorded on-demand search.
#[derive(Debug, Clone)]
pub struct SearchRecord {
    pub query: String,
    pub result_count: usize,
    pub searched_at: DateTime<Utc>,
}

/// Owns the SQLite connection. Statements run on the blocking pool; the
/// connection is serialized behind a mutex.
pub struct HistoryStore {
    conn: Arc<Mutex<Connection>>,
}

/// Fixed-width UTC timestamps so string comparison in SQL orders correctly.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PaperwatchError::Persistence(format!("bad stored timestamp {s:?}: {e}")))
}

fn db_err(e: rusqlite::Error) -> PaperwatchError {
    PaperwatchError::Persistence(e.to_string())
}

impl HistoryStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<HistoryStore> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests and `check-config`.
    pub fn open_in_memory() -> Result<HistoryStore> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<HistoryStore> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(HistoryStore { conn: Arc::new(Mutex::new(conn)) })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| PaperwatchError::Persistence(format!("storage task failed: {e}")))?
    }

    // ── Digest history ───────────────────────────────────────────────────

    /// Record that these papers were surfaced in a digest at `now`.
    /// One transaction for the whole batch: either every key is recorded
    /// or none is.
    pub async fn mark_digested(
        &self,
        keys: Vec<CanonicalKey>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let stamp = ts(now);
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO paper_history (key, first_seen_at, last_digested_at)
                         VALUES (?1, ?2, ?2)
                         ON CONFLICT(key) DO UPDATE
                            SET last_digested_at = excluded.last_digested_at",
                    )
                    .map_err(db_err)?;
                for key in &keys {
                    stmt.execute(params![key.as_str(), stamp]).map_err(db_err)?;
                }
            }
            tx.commit().map_err(db_err)?;
            debug!(n = keys.len(), "Digest history updated");
            Ok(())
        })
        .await
    }

    /// Subset of `keys` digested at or after `cutoff`. Digest runs use this
    /// to suppress papers already surfaced within the freshness window.
    pub async fn seen_since(
        &self,
        keys: Vec<CanonicalKey>,
        cutoff: DateTime<Utc>,
    ) -> Result<HashSet<CanonicalKey>> {
        let stamp = ts(cutoff);
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT 1 FROM paper_history
                     WHERE key = ?1 AND last_digested_at >= ?2",
                )
                .map_err(db_err)?;
            let mut seen = HashSet::new();
            for key in keys {
                if stmt.exists(params![key.as_str(), stamp]).map_err(db_err)? {
                    seen.insert(key);
                }
            }
            Ok(seen)
        })
        .await
    }

    pub async fn history_entry(&self, key: CanonicalKey) -> Result<Option<HistoryEntry>> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT first_seen_at, last_digested_at
                     FROM paper_history WHERE key = ?1",
                    params![key.as_str()],
                    |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    },
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(db_err(other)),
                })?;
            match row {
                None => Ok(None),
                Some((first, last)) => Ok(Some(HistoryEntry {
                    key,
                    first_seen_at: parse_ts(&first)?,
                    last_digested_at: parse_ts(&last)?,
                })),
            }
        })
        .await
    }

    // ── Retention ────────────────────────────────────────────────────────

    /// Remove history, cached scores and search records older than
    /// `cutoff`. Subscriptions are left untouched.
    pub async fn prune(&self, cutoff: DateTime<Utc>) -> Result<PruneStats> {
        let stamp = ts(cutoff);
        self.with_conn(move |conn| {
            let history_removed = conn
                .execute(
                    "DELETE FROM paper_history WHERE last_digested_at < ?1",
                    params![stamp],
                )
                .map_err(db_err)?;
            let scores_removed = conn
                .execute(
                    "DELETE FROM llm_score_cache WHERE cached_at < ?1",
                    params![stamp],
                )
                .map_err(db_err)?;
            let searches_removed = conn
                .execute(
                    "DELETE FROM search_history WHERE searched_at < ?1",
                    params![stamp],
                )
                .map_err(db_err)?;
            let stats = PruneStats { history_removed, scores_removed, searches_removed };
            info!(?stats, "Pruned expired rows");
            Ok(stats)
        })
        .await
    }

    // ── Subscriptions ────────────────────────────────────────────────────

    pub async fn add_subscription(
        &self,
        owner_ref: String,
        keywords: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        let stamp = ts(now);
        self.with_conn(move |conn| {
            let encoded = serde_json::to_string(&keywords)
                .map_err(|e| PaperwatchError::Persistence(e.to_string()))?;
            conn.execute(
                "INSERT INTO subscriptions (owner_ref, keywords, created_at)
                 VALUES (?1, ?2, ?3)",
                params![owner_ref, encoded, stamp],
            )
            .map_err(db_err)?;
            Ok(Subscription {
                id: conn.last_insert_rowid(),
                owner_ref,
                keywords,
                created_at: now,
            })
        })
        .await
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, owner_ref, keywords, created_at
                     FROM subscriptions ORDER BY id",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(db_err)?;
            let mut subscriptions = Vec::new();
            for row in rows {
                let (id, owner_ref, encoded, created) = row.map_err(db_err)?;
                let keywords: Vec<String> = serde_json::from_str(&encoded)
                    .map_err(|e| PaperwatchError::Persistence(e.to_string()))?;
                subscriptions.push(Subscription {
                    id,
                    owner_ref,
                    keywords,
                    created_at: parse_ts(&created)?,
                });
            }
            Ok(subscriptions)
        })
        .await
    }

    /// Returns false when no subscription had that id.
    pub async fn remove_subscription(&self, id: i64) -> Result<bool> {
        self.with_conn(move |conn| {
            let removed = conn
                .execute("DELETE FROM subscriptions WHERE id = ?1", params![id])
                .map_err(db_err)?;
            Ok(removed > 0)
        })
        .await
    }

    // ── Search history ───────────────────────────────────────────────────

    pub async fn record_search(
        &self,
        query: String,
        result_count: usize,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let stamp = ts(now);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO search_history (query, result_count, searched_at)
                 VALUES (?1, ?2, ?3)",
                params![query, result_count as i64, stamp],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    pub async fn recent_searches(&self, limit: usize) -> Result<Vec<SearchRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT query, result_count, searched_at
                     FROM search_history ORDER BY id DESC LIMIT ?1",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(db_err)?;
            let mut searches = Vec::new();
            for row in rows {
                let (query, count, searched) = row.map_err(db_err)?;
                searches.push(SearchRecord {
                    query,
                    result_count: count.max(0) as usize,
                    searched_at: parse_ts(&searched)?,
                });
            }
            Ok(searches)
        })
        .await
    }
}

#[async_trait]
impl ScoreCache for HistoryStore {
    async fn get(&self, key: &CanonicalKey, prompt_hash: &str) -> Result<Option<ScoreResult>> {
        let key = key.clone();
        let prompt_hash = prompt_hash.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT score, explanation FROM llm_score_cache
                 WHERE key = ?1 AND prompt_hash = ?2",
                params![key.as_str(), prompt_hash],
                |row| {
                    Ok(ScoreResult {
                        score: row.get::<_, f64>(0)? as f32,
                        explanation: row.get(1)?,
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(db_err(other)),
            })
        })
        .await
    }

    async fn put(
        &self,
        key: &CanonicalKey,
        prompt_hash: &str,
        result: &ScoreResult,
    ) -> Result<()> {
        let key = key.clone();
        let prompt_hash = prompt_hash.to_string();
        let result = result.clone();
        let stamp = ts(Utc::now());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO llm_score_cache
                 (key, prompt_hash, score, explanation, cached_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    key.as_str(),
                    prompt_hash,
                    result.score as f64,
                    result.explanation,
                    stamp
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key(s: &str) -> CanonicalKey {
        CanonicalKey::from_stored(format!("doi:10.1/{s}"))
    }

    #[tokio::test]
    async fn open_creates_schema_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("papers.db");
        let store = HistoryStore::open(&path).unwrap();
        store.mark_digested(vec![key("a")], Utc::now()).await.unwrap();
        drop(store);

        // Reopening sees the persisted row.
        let store = HistoryStore::open(&path).unwrap();
        let entry = store.history_entry(key("a")).await.unwrap();
        assert!(entry.is_some());
    }

    #[tokio::test]
    async fn mark_digested_updates_last_but_keeps_first_seen() {
        let store = HistoryStore::open_in_memory().unwrap();
        let first = Utc::now() - Duration::days(10);
        let second = Utc::now();

        store.mark_digested(vec![key("a")], first).await.unwrap();
        store.mark_digested(vec![key("a")], second).await.unwrap();

        let entry = store.history_entry(key("a")).await.unwrap().unwrap();
        assert!(entry.first_seen_at < entry.last_digested_at);
        assert_eq!(ts(entry.first_seen_at), ts(first));
        assert_eq!(ts(entry.last_digested_at), ts(second));
    }

    #[tokio::test]
    async fn seen_since_respects_the_freshness_window() {
        let store = HistoryStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .mark_digested(vec![key("fresh")], now - Duration::days(29))
            .await
            .unwrap();
        store
            .mark_digested(vec![key("stale")], now - Duration::days(31))
            .await
            .unwrap();

        let cutoff = now - Duration::days(30);
        let seen = store
            .seen_since(vec![key("fresh"), key("stale"), key("new")], cutoff)
            .await
            .unwrap();
        assert!(seen.contains(&key("fresh")));
        assert!(!seen.contains(&key("stale")));
        assert!(!seen.contains(&key("new")));
    }

    #[tokio::test]
    async fn prune_removes_expired_rows_but_spares_subscriptions() {
        let store = HistoryStore::open_in_memory().unwrap();
        let now = Utc::now();

        store
            .mark_digested(vec![key("old")], now - Duration::days(31))
            .await
            .unwrap();
        store
            .mark_digested(vec![key("recent")], now - Duration::days(29))
            .await
            .unwrap();
        store
            .record_search("kras".to_string(), 3, now - Duration::days(40))
            .await
            .unwrap();
        store
            .add_subscription(
                "user-1".to_string(),
                vec!["crispr".to_string()],
                now - Duration::days(100),
            )
            .await
            .unwrap();

        let stats = store.prune(now - Duration::days(30)).await.unwrap();
        assert_eq!(stats.history_removed, 1);
        assert_eq!(stats.searches_removed, 1);

        assert!(store.history_entry(key("old")).await.unwrap().is_none());
        assert!(store.history_entry(key("recent")).await.unwrap().is_some());
        assert_eq!(store.list_subscriptions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn subscription_roundtrip_and_removal() {
        let store = HistoryStore::open_in_memory().unwrap();
        let sub = store
            .add_subscription(
                "chan-42".to_string(),
                vec!["single cell".to_string(), "RNA".to_string()],
                Utc::now(),
            )
            .await
            .unwrap();

        let listed = store.list_subscriptions().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].owner_ref, "chan-42");
        assert_eq!(listed[0].keywords, vec!["single cell", "RNA"]);

        assert!(store.remove_subscription(sub.id).await.unwrap());
        assert!(!store.remove_subscription(sub.id).await.unwrap());
        assert!(store.list_subscriptions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn score_cache_roundtrip_is_prompt_scoped() {
        let store = HistoryStore::open_in_memory().unwrap();
        let k = key("scored");
        let result = ScoreResult { score: 0.85, explanation: "novel method".to_string() };

        store.put(&k, "hash-a", &result).await.unwrap();

        let hit = store.get(&k, "hash-a").await.unwrap().unwrap();
        assert!((hit.score - 0.85).abs() < 1e-6);
        assert_eq!(hit.explanation, "novel method");

        // A different prompt hash misses.
        assert!(store.get(&k, "hash-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn search_history_is_recorded_newest_first() {
        let store = HistoryStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.record_search("first".to_string(), 1, now).await.unwrap();
        store.record_search("second".to_string(), 2, now).await.unwrap();

        let recent = store.recent_searches(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].query, "second");
        assert_eq!(recent[1].query, "first");
    }
}
