//! Session records and the per-case history they are archived into.
//!
//! A `SessionRecord` is created once when a session stops and is never mutated afterwards. The
//! `HistoryStore` is the host's persistence layer; `HistoryManager` enforces the per-case bound.

use crate::error::{LiveError, LiveResult};
use crate::metrics::SessionMetrics;
use crate::prompt::{SimulationMode, TrialPhase};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Counterpart,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub sender: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn now(sender: Speaker, text: impl Into<String>) -> Self {
        Self {
            sender,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Immutable summary of one completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub case_id: String,
    pub phase: TrialPhase,
    pub mode: SimulationMode,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: u64,
    pub transcript_entries: Vec<TranscriptEntry>,
    /// Data URL of the session recording, when one was captured.
    pub audio_reference: Option<String>,
    pub score: u8,
    pub metrics: SessionMetrics,
}

/// Case-scoped persistence. Records are returned oldest first.
pub trait HistoryStore: Send + Sync {
    fn load(&self, case_id: &str) -> LiveResult<Vec<SessionRecord>>;
    fn append(&self, case_id: &str, record: SessionRecord) -> LiveResult<()>;
    /// Returns whether a record was removed.
    fn remove(&self, case_id: &str, id: &str) -> LiveResult<bool>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    cases: DashMap<String, Vec<SessionRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn load(&self, case_id: &str) -> LiveResult<Vec<SessionRecord>> {
        Ok(self.cases.get(case_id).map(|r| r.clone()).unwrap_or_default())
    }

    fn append(&self, case_id: &str, record: SessionRecord) -> LiveResult<()> {
        self.cases.entry(case_id.to_string()).or_default().push(record);
        Ok(())
    }

    fn remove(&self, case_id: &str, id: &str) -> LiveResult<bool> {
        let Some(mut records) = self.cases.get_mut(case_id) else {
            return Ok(false);
        };
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() != before)
    }
}

/// Durable store: one sled key per record under `sessions/{case_id}/{seq}`, so appends and
/// evictions touch a single record. An index tree maps `{case_id}/{id}` to the record key, and
/// decoded records are kept in a hot cache in front of sled.
pub struct SledHistoryStore {
    db: sled::Db,
    index: sled::Tree,
    cache: DashMap<String, SessionRecord>,
}

const SESSIONS_PREFIX: &str = "sessions";
const INDEX_TREE: &str = "session_index";

fn case_prefix(case_id: &str) -> String {
    format!("{}/{}/", SESSIONS_PREFIX, case_id)
}

fn index_key(case_id: &str, id: &str) -> String {
    format!("{}/{}", case_id, id)
}

impl SledHistoryStore {
    pub fn open_path<P: AsRef<Path>>(path: P) -> LiveResult<Self> {
        let db = sled::open(path)?;
        let index = db.open_tree(INDEX_TREE)?;
        Ok(Self {
            db,
            index,
            cache: DashMap::new(),
        })
    }
}

impl HistoryStore for SledHistoryStore {
    fn load(&self, case_id: &str) -> LiveResult<Vec<SessionRecord>> {
        let prefix = case_prefix(case_id);
        let mut records = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry?;
            let key = String::from_utf8_lossy(&key).into_owned();
            // Keys of a nested case id such as "a/b" share the prefix of "a".
            if key[prefix.len()..].contains('/') {
                continue;
            }
            if let Some(record) = self.cache.get(&key) {
                records.push(record.clone());
                continue;
            }
            let record: SessionRecord = serde_json::from_slice(&value)?;
            self.cache.insert(key, record.clone());
            records.push(record);
        }
        Ok(records)
    }

    fn append(&self, case_id: &str, record: SessionRecord) -> LiveResult<()> {
        // Monotonic ids keep keys in insertion order.
        let key = format!("{}{:020}", case_prefix(case_id), self.db.generate_id()?);
        let bytes = serde_json::to_vec(&record)?;
        self.db.insert(key.as_bytes(), bytes)?;
        self.index
            .insert(index_key(case_id, &record.id).as_bytes(), key.as_bytes())?;
        self.cache.insert(key, record);
        self.db.flush()?;
        Ok(())
    }

    fn remove(&self, case_id: &str, id: &str) -> LiveResult<bool> {
        let Some(key) = self.index.remove(index_key(case_id, id).as_bytes())? else {
            return Ok(false);
        };
        let key = String::from_utf8_lossy(&key).into_owned();
        self.cache.remove(&key);
        let removed = self.db.remove(key.as_bytes())?.is_some();
        self.db.flush()?;
        Ok(removed)
    }
}

/// Appends records and keeps each case at most `limit` records long.
#[derive(Clone)]
pub struct HistoryManager {
    store: Arc<dyn HistoryStore>,
    limit: usize,
}

impl HistoryManager {
    pub fn new(store: Arc<dyn HistoryStore>, limit: usize) -> Self {
        Self {
            store,
            limit: limit.max(1),
        }
    }

    /// Append one record, then evict the oldest beyond the limit.
    pub fn archive(&self, record: SessionRecord) -> LiveResult<()> {
        let case_id = record.case_id.clone();
        let record_id = record.id.clone();
        self.store.append(&case_id, record)?;

        let records = self.store.load(&case_id)?;
        if records.len() > self.limit {
            let excess = records.len() - self.limit;
            for old in records.iter().take(excess) {
                if !self.store.remove(&case_id, &old.id)? {
                    warn!(target: "courtcraft::history", case_id = %case_id, id = %old.id, "evicted record was already gone");
                }
            }
        }

        info!(target: "courtcraft::history", case_id = %case_id, id = %record_id, "session archived");
        Ok(())
    }

    pub fn load(&self, case_id: &str) -> LiveResult<Vec<SessionRecord>> {
        self.store.load(case_id)
    }

    /// Explicit user deletion.
    pub fn delete(&self, case_id: &str, id: &str) -> LiveResult<()> {
        if self.store.remove(case_id, id)? {
            Ok(())
        } else {
            Err(LiveError::History(format!("No session {} for case {}", id, case_id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn record(case_id: &str, n: u32) -> SessionRecord {
        SessionRecord {
            id: format!("session-{}", n),
            case_id: case_id.to_string(),
            phase: TrialPhase::OpeningStatement,
            mode: SimulationMode::Practice,
            started_at: Utc::now(),
            duration_seconds: n as u64,
            transcript_entries: vec![TranscriptEntry::now(Speaker::User, "May it please the court")],
            audio_reference: None,
            score: 50,
            metrics: SessionMetrics::default(),
        }
    }

    #[test]
    fn evicts_oldest_beyond_limit() {
        let manager = HistoryManager::new(Arc::new(MemoryHistoryStore::new()), 20);
        for n in 0..23 {
            manager.archive(record("case-1", n)).unwrap();
        }
        let records = manager.load("case-1").unwrap();
        assert_eq!(records.len(), 20);
        assert_eq!(records.first().unwrap().id, "session-3");
        assert_eq!(records.last().unwrap().id, "session-22");
    }

    #[test]
    fn cases_are_isolated() {
        let manager = HistoryManager::new(Arc::new(MemoryHistoryStore::new()), 2);
        manager.archive(record("a", 1)).unwrap();
        manager.archive(record("b", 2)).unwrap();
        assert_eq!(manager.load("a").unwrap().len(), 1);
        assert_eq!(manager.load("b").unwrap().len(), 1);
        assert!(manager.load("c").unwrap().is_empty());
    }

    #[test]
    fn delete_reports_missing_records() {
        let manager = HistoryManager::new(Arc::new(MemoryHistoryStore::new()), 20);
        manager.archive(record("a", 1)).unwrap();
        manager.delete("a", "session-1").unwrap();
        assert!(manager.delete("a", "session-1").is_err());
    }

    #[test]
    fn sled_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledHistoryStore::open_path(dir.path()).unwrap();
            store.append("case-9", record("case-9", 1)).unwrap();
            store.append("case-9", record("case-9", 2)).unwrap();
            assert!(store.remove("case-9", "session-1").unwrap());
        }
        let store = SledHistoryStore::open_path(dir.path()).unwrap();
        let records = store.load("case-9").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "session-2");
        assert_eq!(records[0].transcript_entries[0].sender, Speaker::User);
    }

    #[test]
    fn sled_store_keeps_one_key_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SledHistoryStore::open_path(dir.path()).unwrap());
        let manager = HistoryManager::new(store.clone(), 3);
        for n in 0..5 {
            manager.archive(record("case-9", n)).unwrap();
        }
        manager.archive(record("case-9/appeal", 99)).unwrap();

        let keys = store.db.scan_prefix(case_prefix("case-9").as_bytes()).count();
        assert_eq!(keys, 4, "three records for case-9 plus one for the nested case id");
        let ids: Vec<String> = store.load("case-9").unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["session-2", "session-3", "session-4"]);
        assert_eq!(store.load("case-9/appeal").unwrap().len(), 1);
        assert!(!store.remove("case-9", "session-0").unwrap());
        assert_eq!(store.index.len(), 4);
    }
}
