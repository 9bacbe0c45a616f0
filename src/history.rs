//! Dub history persistence with async batch writing.
//! Records are buffered in a channel and flushed to SQLite every 300ms so the
//! matching loop never waits on disk I/O. The recorded played keys can seed
//! the played set on the next start.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Where the played audio came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DubSource {
    Replay,
    Realtime,
}

impl DubSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DubSource::Replay => "replay",
            DubSource::Realtime => "realtime",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "realtime" {
            DubSource::Realtime
        } else {
            DubSource::Replay
        }
    }
}

/// One played dub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DubRecord {
    pub request_id: String,
    /// Corpus identifier of the speaker.
    pub character: String,
    pub line: String,
    /// Key the line was stored under in the played set.
    pub played_key: String,
    pub source: DubSource,
    /// Audio path, or a placeholder for synthesized audio.
    pub audio: String,
    pub created_at: i64,
}

impl DubRecord {
    pub fn new(character: &str, line: &str, played_key: String, source: DubSource, audio: String) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            character: character.to_string(),
            line: line.to_string(),
            played_key,
            source,
            audio,
            created_at: now_unix(),
        }
    }
}

/// Async history store: accepts records via channel, flushes to SQLite in batches.
pub struct HistoryStore {
    tx: Mutex<Option<mpsc::UnboundedSender<DubRecord>>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    read_conn: Mutex<Connection>,
}

impl HistoryStore {
    /// Open (or create) the history database and start the background flush
    /// loop. Must be called inside a tokio runtime.
    pub fn open(db_path: &Path) -> Result<Arc<Self>, HistoryError> {
        let read_conn = Connection::open(db_path)?;
        read_conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        read_conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS dub_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                character TEXT NOT NULL,
                line TEXT NOT NULL,
                played_key TEXT NOT NULL,
                source TEXT NOT NULL,
                audio TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_dub_history_created
                ON dub_history(created_at);",
        )?;

        // separate connection so reads never wait on a batch insert
        let write_conn = Connection::open(db_path)?;
        write_conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let flusher = tokio::spawn(flush_loop(rx, write_conn));

        info!(path = %db_path.display(), "history store opened with batch writer");

        Ok(Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            flusher: Mutex::new(Some(flusher)),
            read_conn: Mutex::new(read_conn),
        }))
    }

    /// Queue a record for the batch writer. Never blocks.
    pub fn record(&self, entry: DubRecord) {
        match self.tx.lock().as_ref() {
            Some(tx) => {
                if let Err(e) = tx.send(entry) {
                    warn!(error = %e, "history channel send failed");
                }
            }
            None => warn!(request_id = %entry.request_id, "history closed, record dropped"),
        }
    }

    /// Stop accepting records and wait until everything queued is written.
    pub async fn close(&self) {
        drop(self.tx.lock().take());
        let flusher = self.flusher.lock().take();
        if let Some(handle) = flusher {
            if let Err(e) = handle.await {
                warn!(error = %e, "history flush task failed");
            }
        }
    }

    /// Most recent records, newest first.
    pub fn query_recent(&self, limit: usize) -> Result<Vec<DubRecord>, HistoryError> {
        let conn = self.read_conn.lock();
        let mut stmt = conn.prepare(
            "SELECT request_id, character, line, played_key, source, audio, created_at
             FROM dub_history ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(DubRecord {
                request_id: row.get(0)?,
                character: row.get(1)?,
                line: row.get(2)?,
                played_key: row.get(3)?,
                source: DubSource::parse(&row.get::<_, String>(4)?),
                audio: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Every distinct played key, for resuming the played set.
    pub fn played_keys(&self) -> Result<Vec<String>, HistoryError> {
        let conn = self.read_conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT played_key FROM dub_history")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Delete history older than the given number of days.
    pub fn cleanup_older_than_days(&self, days: u32) -> Result<usize, HistoryError> {
        let conn = self.read_conn.lock();
        let cutoff = now_unix() - (days as i64 * 86400);
        let count = conn.execute("DELETE FROM dub_history WHERE created_at <= ?1", params![cutoff])?;
        if count > 0 {
            info!(removed = count, days, "history cleanup");
        }
        Ok(count)
    }
}

/// Collect records from the channel and batch-insert them every 300ms.
async fn flush_loop(mut rx: mpsc::UnboundedReceiver<DubRecord>, conn: Connection) {
    let flush_interval = Duration::from_millis(300);
    let mut buffer: Vec<DubRecord> = Vec::with_capacity(32);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(flush_interval) => {}
            msg = rx.recv() => {
                match msg {
                    Some(record) => buffer.push(record),
                    None => {
                        if !buffer.is_empty() {
                            flush_batch(&conn, &buffer);
                        }
                        debug!("history flush loop exiting (channel closed)");
                        return;
                    }
                }
            }
        }

        while let Ok(record) = rx.try_recv() {
            buffer.push(record);
        }

        if !buffer.is_empty() {
            flush_batch(&conn, &buffer);
            buffer.clear();
        }
    }
}

/// Batch-insert records within one transaction.
fn flush_batch(conn: &Connection, records: &[DubRecord]) {
    let start = std::time::Instant::now();

    if let Err(e) = conn.execute_batch("BEGIN TRANSACTION") {
        warn!(error = %e, "history batch begin failed");
        return;
    }

    let mut stmt = match conn.prepare_cached(
        "INSERT INTO dub_history
         (request_id, character, line, played_key, source, audio, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    ) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "history batch prepare failed");
            let _ = conn.execute_batch("ROLLBACK");
            return;
        }
    };

    for record in records {
        if let Err(e) = stmt.execute(params![
            record.request_id,
            record.character,
            record.line,
            record.played_key,
            record.source.as_str(),
            record.audio,
            record.created_at,
        ]) {
            warn!(error = %e, request_id = %record.request_id, "history insert failed");
        }
    }

    drop(stmt);

    if let Err(e) = conn.execute_batch("COMMIT") {
        warn!(error = %e, "history batch commit failed");
    } else {
        debug!(
            count = records.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "history batch flushed"
        );
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(line: &str, source: DubSource) -> DubRecord {
        DubRecord::new("Amber", line, crate::dub::PlayedSet::key(line), source, "a.aac".into())
    }

    #[tokio::test]
    async fn test_records_flushed_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(&dir.path().join("history.db")).unwrap();
        store.record(record("I will protect this city", DubSource::Replay));
        store.record(record("brand new line", DubSource::Realtime));
        store.close().await;

        let recent = store.query_recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].line, "brand new line");
        assert_eq!(recent[0].source, DubSource::Realtime);
        assert_eq!(recent[1].played_key, "iwillprotectthiscity");

        let mut keys = store.played_keys().unwrap();
        keys.sort();
        assert_eq!(keys, ["brandnewline", "iwillprotectthiscity"]);
    }

    #[tokio::test]
    async fn test_reopen_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        {
            let store = HistoryStore::open(&path).unwrap();
            store.record(record("one", DubSource::Replay));
            store.close().await;
        }
        let store = HistoryStore::open(&path).unwrap();
        assert_eq!(store.played_keys().unwrap(), ["one"]);
        assert_eq!(store.query_recent(1).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_older_than_days() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(&dir.path().join("history.db")).unwrap();
        let mut old = record("old line", DubSource::Replay);
        old.created_at -= 10 * 86400;
        store.record(old);
        store.record(record("new line", DubSource::Replay));
        store.close().await;

        assert_eq!(store.cleanup_older_than_days(7).unwrap(), 1);
        let recent = store.query_recent(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].line, "new line");
    }

    #[tokio::test]
    async fn test_record_after_close_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(&dir.path().join("history.db")).unwrap();
        store.close().await;
        store.record(record("late", DubSource::Replay));
        assert!(store.query_recent(10).unwrap().is_empty());
    }
}
