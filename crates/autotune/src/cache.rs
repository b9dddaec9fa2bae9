//! Persisted tuning log: best measured record per tuning key.

use crate::archive::SearchEntry;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

/// One line of the on-disk log: a tuning key with its best measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogRecord<R> {
    key: String,
    cost: f64,
    record: R,
}

/// Best measured record per tuning key.
///
/// On disk the log is a JSON array of `{key, cost, record}` objects sorted
/// by key. Duplicate keys are allowed in the file; loading keeps the best.
#[derive(Debug, Clone)]
pub struct TuningLog<R> {
    entries: BTreeMap<String, SearchEntry<R>>,
}

impl<R> Default for TuningLog<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> TuningLog<R> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&SearchEntry<R>> {
        self.entries.get(key)
    }

    /// Keep `entry` under `key` unless a better one is already logged.
    /// Returns whether the log changed.
    pub fn record(&mut self, key: &str, entry: SearchEntry<R>) -> bool {
        match self.entries.get(key) {
            Some(existing) if existing.cost >= entry.cost => false,
            _ => {
                self.entries.insert(key.to_string(), entry);
                true
            }
        }
    }
}

impl<R: Serialize + DeserializeOwned> TuningLog<R> {
    /// Read the log at `path`. A missing file is an empty log.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading tuning log {}", path.display()))
            }
        };
        let records: Vec<LogRecord<R>> = serde_json::from_str(&data)
            .with_context(|| format!("parsing tuning log {}", path.display()))?;

        let mut log = Self::new();
        for LogRecord { key, cost, record } in records {
            if !log.record(&key, SearchEntry::new(record, cost)) {
                debug!(key = %key, cost, "dropped worse duplicate log record");
            }
        }
        Ok(log)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let records: Vec<LogRecord<&R>> = self
            .entries
            .iter()
            .map(|(key, entry)| LogRecord {
                key: key.clone(),
                cost: entry.cost,
                record: &entry.record,
            })
            .collect();
        let json = serde_json::to_string_pretty(&records)?;
        fs::write(path, json).with_context(|| format!("writing tuning log {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_keeps_best() {
        let mut log = TuningLog::new();
        assert!(log.record("wmma/nnn/16x16x16", SearchEntry::new(vec![4, 4], 2.0)));
        assert!(!log.record("wmma/nnn/16x16x16", SearchEntry::new(vec![2, 8], 1.0)));
        assert!(log.record("wmma/nnn/16x16x16", SearchEntry::new(vec![8, 2], 3.0)));
        assert_eq!(log.len(), 1);
        assert_eq!(log.get("wmma/nnn/16x16x16").unwrap().record, vec![8, 2]);
    }

    #[test]
    fn test_log_file_round_trip() {
        let path = std::env::temp_dir()
            .join(format!("tileforge-log-{}", std::process::id()))
            .join("log.json");
        let mut log = TuningLog::new();
        log.record("key", SearchEntry::new("record".to_string(), 1.5));
        log.save_to_file(&path).unwrap();

        let loaded: TuningLog<String> = TuningLog::load_from_file(&path).unwrap();
        assert_eq!(loaded.get("key").map(|e| e.record.as_str()), Some("record"));
        let _ = fs::remove_file(&path);

        let missing: TuningLog<String> =
            TuningLog::load_from_file(Path::new("/nonexistent/tileforge/log.json")).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn test_duplicate_keys_keep_best() {
        let path = std::env::temp_dir()
            .join(format!("tileforge-dup-{}", std::process::id()))
            .join("log.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            r#"[
                {"key": "wmma/nnn/16x16x16", "cost": 1.0, "record": [2, 8]},
                {"key": "wmma/nnn/16x16x16", "cost": 4.0, "record": [4, 4]},
                {"key": "wmma/nnn/16x16x16", "cost": 3.0, "record": [8, 2]}
            ]"#,
        )
        .unwrap();

        let log: TuningLog<Vec<usize>> = TuningLog::load_from_file(&path).unwrap();
        assert_eq!(log.len(), 1);
        let best = log.get("wmma/nnn/16x16x16").unwrap();
        assert_eq!(best.record, vec![4, 4]);
        assert_eq!(best.cost, 4.0);

        fs::write(&path, "{not json").unwrap();
        let err = TuningLog::<Vec<usize>>::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("parsing tuning log"));
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
