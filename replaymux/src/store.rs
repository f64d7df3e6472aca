//! SQLite-backed replay metadata store.
//!
//! Every call returns `Result<_, ReplayStoreError>`; store failures are data
//! for the caller to log or ignore, never panics. The coordinator treats
//! non-critical write failures as log lines and keeps going.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};

use crate::error::ReplayStoreError;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS replays (
    id TEXT PRIMARY KEY,
    trackingId TEXT,
    startedAt INTEGER NOT NULL,
    endedAt INTEGER,
    duration INTEGER,
    eventCount INTEGER NOT NULL DEFAULT 0,
    browserType TEXT,
    routePath TEXT,
    userAgent TEXT,
    parentSessionId TEXT NOT NULL,
    targetId TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_replays_session_target
    ON replays(parentSessionId, targetId);

CREATE TABLE IF NOT EXISTS videos (
    id TEXT PRIMARY KEY,
    frameCount INTEGER NOT NULL DEFAULT 0,
    encodingStatus TEXT NOT NULL DEFAULT 'none',
    videoPath TEXT
);

CREATE TABLE IF NOT EXISTS replay_events (
    replayId TEXT NOT NULL,
    seq INTEGER NOT NULL,
    payload TEXT NOT NULL,
    PRIMARY KEY (replayId, seq)
);
"#;

/// Row handed back when a tab's recording is closed out.
#[derive(Debug, Clone)]
pub struct StoppedReplay {
    pub replay_id: String,
    pub duration_ms: u64,
    pub event_count: u64,
}

#[derive(Debug, Clone)]
pub struct ReplayStore {
    pool: SqlitePool,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl ReplayStore {
    /// Opens (or creates) the store at `path`. Uses WAL so coordinator reads
    /// never block the drain-loop writes.
    pub async fn open(path: &Path) -> Result<Self, ReplayStoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));
        Self::open_with(options, 4).await
    }

    /// In-memory store for tests. A single connection: every pooled sqlite
    /// `:memory:` connection would otherwise get its own database.
    pub async fn open_in_memory() -> Result<Self, ReplayStoreError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        Self::open_with(options, 1).await
    }

    async fn open_with(
        options: SqliteConnectOptions,
        max_connections: u32,
    ) -> Result<Self, ReplayStoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(ReplayStoreError::ConnectionFailed)?;
        sqlx::query(SCHEMA_SQL)
            .execute(&pool)
            .await
            .map_err(ReplayStoreError::QueryFailed)?;
        Ok(Self { pool })
    }

    /// Opens a replay row for a freshly attached tab.
    pub async fn start_tab_replay(
        &self,
        session_id: &str,
        target_id: &str,
        url: &str,
    ) -> Result<String, ReplayStoreError> {
        let replay_id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO replays (id, startedAt, routePath, browserType, parentSessionId, targetId) \
             VALUES (?, ?, ?, 'chromium', ?, ?)",
        )
        .bind(&replay_id)
        .bind(now_ms())
        .bind(url)
        .bind(session_id)
        .bind(target_id)
        .execute(&self.pool)
        .await
        .map_err(ReplayStoreError::QueryFailed)?;
        Ok(replay_id)
    }

    async fn active_replay(
        &self,
        session_id: &str,
        target_id: &str,
    ) -> Result<Option<(String, i64, i64)>, ReplayStoreError> {
        let row = sqlx::query(
            "SELECT id, startedAt, eventCount FROM replays \
             WHERE parentSessionId = ? AND targetId = ? AND endedAt IS NULL \
             ORDER BY startedAt DESC LIMIT 1",
        )
        .bind(session_id)
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(ReplayStoreError::QueryFailed)?;
        Ok(row.map(|r| (r.get::<String, _>(0), r.get::<i64, _>(1), r.get::<i64, _>(2))))
    }

    /// Appends drained events to the tab's open replay. Returns how many
    /// were written; a tab with no open replay swallows the batch.
    pub async fn add_tab_events(
        &self,
        session_id: &str,
        target_id: &str,
        events: &[serde_json::Value],
    ) -> Result<usize, ReplayStoreError> {
        if events.is_empty() {
            return Ok(0);
        }
        let Some((replay_id, _, _)) = self.active_replay(session_id, target_id).await? else {
            return Ok(0);
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(ReplayStoreError::TransactionFailed)?;
        // the next seq comes from inside the transaction; concurrent drain
        // batches serialize on the single sqlite writer
        let base: i64 = sqlx::query(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM replay_events WHERE replayId = ?",
        )
        .bind(&replay_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(ReplayStoreError::QueryFailed)?
        .get(0);
        for (i, event) in events.iter().enumerate() {
            sqlx::query("INSERT INTO replay_events (replayId, seq, payload) VALUES (?, ?, ?)")
                .bind(&replay_id)
                .bind(base + i as i64)
                .bind(event.to_string())
                .execute(&mut *tx)
                .await
                .map_err(ReplayStoreError::QueryFailed)?;
        }
        sqlx::query("UPDATE replays SET eventCount = eventCount + ? WHERE id = ?")
            .bind(events.len() as i64)
            .bind(&replay_id)
            .execute(&mut *tx)
            .await
            .map_err(ReplayStoreError::QueryFailed)?;
        tx.commit()
            .await
            .map_err(ReplayStoreError::TransactionFailed)?;
        Ok(events.len())
    }

    /// Closes out a tab's replay. `None` when the tab has no open replay or
    /// recorded nothing at all (the store declines empty recordings).
    pub async fn stop_tab_replay(
        &self,
        session_id: &str,
        target_id: &str,
        frame_count: u64,
    ) -> Result<Option<StoppedReplay>, ReplayStoreError> {
        let Some((replay_id, started_at, event_count)) =
            self.active_replay(session_id, target_id).await?
        else {
            return Ok(None);
        };
        if event_count == 0 && frame_count == 0 {
            sqlx::query("DELETE FROM replays WHERE id = ?")
                .bind(&replay_id)
                .execute(&self.pool)
                .await
                .map_err(ReplayStoreError::QueryFailed)?;
            return Ok(None);
        }

        let ended = now_ms();
        let duration = (ended - started_at).max(0);
        sqlx::query("UPDATE replays SET endedAt = ?, duration = ? WHERE id = ?")
            .bind(ended)
            .bind(duration)
            .bind(&replay_id)
            .execute(&self.pool)
            .await
            .map_err(ReplayStoreError::QueryFailed)?;

        if frame_count > 0 {
            sqlx::query(
                "INSERT INTO videos (id, frameCount, encodingStatus) VALUES (?, ?, 'pending') \
                 ON CONFLICT(id) DO UPDATE SET frameCount = excluded.frameCount",
            )
            .bind(&replay_id)
            .bind(frame_count as i64)
            .execute(&self.pool)
            .await
            .map_err(ReplayStoreError::QueryFailed)?;
        }

        Ok(Some(StoppedReplay {
            replay_id,
            duration_ms: duration as u64,
            event_count: event_count as u64,
        }))
    }

    /// Drops a replay's video row, preserving the DOM recording. Returns
    /// whether a video existed.
    pub async fn delete_video(&self, replay_id: &str) -> Result<bool, ReplayStoreError> {
        let result = sqlx::query("DELETE FROM videos WHERE id = ?")
            .bind(replay_id)
            .execute(&self.pool)
            .await
            .map_err(ReplayStoreError::QueryFailed)?;
        Ok(result.rows_affected() > 0)
    }

    /// Event count for a replay, used by tests and the management surface.
    pub async fn event_count(&self, replay_id: &str) -> Result<u64, ReplayStoreError> {
        let row = sqlx::query("SELECT eventCount FROM replays WHERE id = ?")
            .bind(replay_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(ReplayStoreError::QueryFailed)?;
        Ok(row.map(|r| r.get::<i64, _>(0) as u64).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_add_stop_roundtrip() {
        let store = ReplayStore::open_in_memory().await.unwrap();
        let replay_id = store
            .start_tab_replay("sess1", "tgt1", "https://example.test/")
            .await
            .unwrap();

        let events: Vec<serde_json::Value> = (0..40)
            .map(|i| serde_json::json!({"tag": "dom.mutation", "payload": {"i": i}}))
            .collect();
        assert_eq!(store.add_tab_events("sess1", "tgt1", &events).await.unwrap(), 40);
        assert_eq!(store.event_count(&replay_id).await.unwrap(), 40);

        let stopped = store
            .stop_tab_replay("sess1", "tgt1", 0)
            .await
            .unwrap()
            .expect("active replay with events");
        assert_eq!(stopped.replay_id, replay_id);
        assert_eq!(stopped.event_count, 40);

        // a second stop finds no open replay
        assert!(store.stop_tab_replay("sess1", "tgt1", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_recordings_are_declined() {
        let store = ReplayStore::open_in_memory().await.unwrap();
        store
            .start_tab_replay("sess1", "tgt1", "https://example.test/")
            .await
            .unwrap();
        assert!(store.stop_tab_replay("sess1", "tgt1", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn events_stay_with_their_tab() {
        let store = ReplayStore::open_in_memory().await.unwrap();
        store
            .start_tab_replay("sess1", "tgt1", "https://a.test/")
            .await
            .unwrap();
        store
            .start_tab_replay("sess1", "tgt2", "https://b.test/")
            .await
            .unwrap();

        let a: Vec<serde_json::Value> = (0..3).map(|i| serde_json::json!({"a": i})).collect();
        let b: Vec<serde_json::Value> = (0..5).map(|i| serde_json::json!({"b": i})).collect();
        store.add_tab_events("sess1", "tgt1", &a).await.unwrap();
        store.add_tab_events("sess1", "tgt2", &b).await.unwrap();

        let s1 = store.stop_tab_replay("sess1", "tgt1", 0).await.unwrap().unwrap();
        let s2 = store.stop_tab_replay("sess1", "tgt2", 0).await.unwrap().unwrap();
        assert_eq!(s1.event_count, 3);
        assert_eq!(s2.event_count, 5);
    }

    #[tokio::test]
    async fn video_delete_preserves_the_replay() {
        let store = ReplayStore::open_in_memory().await.unwrap();
        let replay_id = store
            .start_tab_replay("sess1", "tgt1", "https://example.test/")
            .await
            .unwrap();
        let events = vec![serde_json::json!({"tag": "page.open"})];
        store.add_tab_events("sess1", "tgt1", &events).await.unwrap();
        store.stop_tab_replay("sess1", "tgt1", 12).await.unwrap().unwrap();

        assert!(store.delete_video(&replay_id).await.unwrap());
        assert!(!store.delete_video(&replay_id).await.unwrap());
        // the DOM recording survives
        assert_eq!(store.event_count(&replay_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_tabs_swallow_events() {
        let store = ReplayStore::open_in_memory().await.unwrap();
        let events = vec![serde_json::json!({"x": 1})];
        assert_eq!(store.add_tab_events("nope", "nope", &events).await.unwrap(), 0);
    }
}
