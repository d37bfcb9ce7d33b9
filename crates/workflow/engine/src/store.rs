//! History storage
//!
//! Histories are append-only, so the store only ever appends events to a run
//! and loads them back. The engine writes each event once, after the state
//! change it records has been applied; on restart every stored run is
//! rebuilt from its events.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use workflow_types::{HistoryEvent, RunId, WorkflowError, WorkflowResult};

/// Storage backend selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Histories live only as long as the process
    #[default]
    Memory,
    /// One JSON-lines file per run under `path`
    File { path: String },
}

impl StoreConfig {
    pub fn open(&self) -> WorkflowResult<Arc<dyn HistoryStore>> {
        match self {
            Self::Memory => Ok(Arc::new(MemoryHistoryStore::new())),
            Self::File { path } => Ok(Arc::new(FileHistoryStore::new(PathBuf::from(path))?)),
        }
    }
}

/// Append-only storage of execution histories
pub trait HistoryStore: Send + Sync {
    /// Append events to the history of `run_id`
    fn append(&self, run_id: &RunId, events: &[HistoryEvent]) -> WorkflowResult<()>;

    /// All events of `run_id`, oldest first
    fn load(&self, run_id: &RunId) -> WorkflowResult<Vec<HistoryEvent>>;

    /// Every run with a stored history
    fn list_runs(&self) -> WorkflowResult<Vec<RunId>>;
}

// ---- In-memory storage ----

#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    histories: Mutex<HashMap<RunId, Vec<HistoryEvent>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn append(&self, run_id: &RunId, events: &[HistoryEvent]) -> WorkflowResult<()> {
        let mut histories = self
            .histories
            .lock()
            .map_err(|_| WorkflowError::Storage("history lock poisoned".into()))?;
        histories
            .entry(run_id.clone())
            .or_default()
            .extend_from_slice(events);
        Ok(())
    }

    fn load(&self, run_id: &RunId) -> WorkflowResult<Vec<HistoryEvent>> {
        let histories = self
            .histories
            .lock()
            .map_err(|_| WorkflowError::Storage("history lock poisoned".into()))?;
        histories
            .get(run_id)
            .cloned()
            .ok_or_else(|| WorkflowError::RunNotFound(run_id.clone()))
    }

    fn list_runs(&self) -> WorkflowResult<Vec<RunId>> {
        let histories = self
            .histories
            .lock()
            .map_err(|_| WorkflowError::Storage("history lock poisoned".into()))?;
        Ok(histories.keys().cloned().collect())
    }
}

// ---- File-backed storage ----

const HISTORY_EXTENSION: &str = "jsonl";

/// Stores each history as `<run id>.jsonl`, one event per line
#[derive(Debug)]
pub struct FileHistoryStore {
    data_dir: PathBuf,
    /// Serializes writers within this process
    write_lock: Mutex<()>,
}

impl FileHistoryStore {
    pub fn new(data_dir: PathBuf) -> WorkflowResult<Self> {
        std::fs::create_dir_all(&data_dir)?;
        tracing::info!(path = %data_dir.display(), "File history store opened");
        Ok(Self {
            data_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn history_path(&self, run_id: &RunId) -> PathBuf {
        self.data_dir
            .join(format!("{}.{}", run_id.as_str(), HISTORY_EXTENSION))
    }
}

impl HistoryStore for FileHistoryStore {
    fn append(&self, run_id: &RunId, events: &[HistoryEvent]) -> WorkflowResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| WorkflowError::Storage("write lock poisoned".into()))?;

        let mut buf = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path(run_id))?;
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }

    fn load(&self, run_id: &RunId) -> WorkflowResult<Vec<HistoryEvent>> {
        let path = self.history_path(run_id);
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorkflowError::RunNotFound(run_id.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: HistoryEvent = serde_json::from_str(&line).map_err(|e| {
                WorkflowError::HistoryCorrupted(format!(
                    "{} line {}: {}",
                    path.display(),
                    index + 1,
                    e
                ))
            })?;
            events.push(event);
        }
        Ok(events)
    }

    fn list_runs(&self) -> WorkflowResult<Vec<RunId>> {
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(HISTORY_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                runs.push(RunId::new(stem));
            }
        }
        runs.sort();
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_types::{EventKind, History, TaskQueueName, WorkflowId, WorkflowType};

    fn sample_history() -> History {
        let mut history = History::new();
        history.append(EventKind::WorkflowExecutionStarted {
            workflow_type: WorkflowType::new("GreetingWorkflow"),
            workflow_id: WorkflowId::new("HelloActivityWorkflow"),
            task_queue: TaskQueueName::new("HelloActivityTaskQueue"),
            input: serde_json::json!("World"),
            parent: None,
            execution_timeout: None,
        });
        history.append(EventKind::TimerFired { seq: 1 });
        history
    }

    #[test]
    fn test_memory_store_appends_in_order() {
        let store = MemoryHistoryStore::new();
        let run = RunId::new("run-1");
        let history = sample_history();
        store.append(&run, &history.events()[..1]).unwrap();
        store.append(&run, &history.events()[1..]).unwrap();

        assert_eq!(store.load(&run).unwrap(), history.events());
        assert_eq!(store.list_runs().unwrap(), vec![run]);
    }

    #[test]
    fn test_unknown_run_is_not_found() {
        let store = MemoryHistoryStore::new();
        assert!(matches!(
            store.load(&RunId::new("missing")),
            Err(WorkflowError::RunNotFound(_))
        ));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunId::new("run-1");
        let history = sample_history();
        {
            let store = FileHistoryStore::new(dir.path().to_path_buf()).unwrap();
            store.append(&run, history.events()).unwrap();
        }

        let reopened = FileHistoryStore::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(reopened.list_runs().unwrap(), vec![run.clone()]);
        let events = reopened.load(&run).unwrap();
        assert_eq!(History::from_events(events).unwrap(), history);
    }

    #[test]
    fn test_file_store_reports_corrupt_line() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.jsonl"), "{not json}\n").unwrap();
        let store = FileHistoryStore::new(dir.path().to_path_buf()).unwrap();
        assert!(matches!(
            store.load(&RunId::new("broken")),
            Err(WorkflowError::HistoryCorrupted(_))
        ));
    }

    #[test]
    fn test_store_config_opens_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::File {
            path: dir.path().join("histories").to_string_lossy().into_owned(),
        };
        let store = config.open().unwrap();
        assert!(store.list_runs().unwrap().is_empty());
    }
}
