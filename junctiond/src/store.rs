//! Signature stores.
//!
//! Workflow facts are append-only; step signatures are one mutable slot per
//! step id. The file-backed stores keep a JSONL log with an in-memory index:
//! writes land in a buffered writer (the write-ahead buffer) and `commit`
//! flushes and fsyncs, so a crash between commits loses at most the
//! uncommitted tail. Ephemeral runs use the in-memory stores instead.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Entry type of workflow facts surfaced by the placeholder projection.
pub const PLACEHOLDER_ENTRY: &str = "placeholder";

/// Workflow-level facts: append-only, queried by workflow id.
pub trait WorkflowStore: Send {
    fn write(&mut self, workflow_id: &str, entry_type: &str, payload: Value) -> Result<()>;
    fn records(&self, workflow_id: &str) -> Result<Vec<Value>>;
    fn placeholders(&self, workflow_id: &str) -> Result<Vec<Value>>;
    fn clear(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
}

/// Step signatures: set/overwrite by step id, point reads by exact key.
pub trait StepStore: Send {
    fn set(&mut self, step_id: &str, signature: Value) -> Result<()>;
    fn get(&self, step_id: &str) -> Result<Option<Value>>;
    fn commit(&mut self) -> Result<()>;
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct WorkflowFact {
    workflow_id: String,
    entry_type: String,
    ts: DateTime<Utc>,
    payload: Value,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct StepFact {
    step_id: String,
    ts: DateTime<Utc>,
    signature: Value,
}

fn open_append(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open signature log {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn replay<T, F>(path: &Path, mut apply: F) -> Result<()>
where
    T: serde::de::DeserializeOwned,
    F: FnMut(T),
{
    if !path.is_file() {
        return Ok(());
    }
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to read signature log {}", path.display()))?,
    );
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(fact) => apply(fact),
            Err(err) => warn!(path = %path.display(), "Skipping corrupt signature record: {}", err),
        }
    }
    Ok(())
}

/// Append-only workflow fact log.
pub struct FileWorkflowStore {
    path: PathBuf,
    writer: BufWriter<File>,
    facts: Vec<WorkflowFact>,
}

impl FileWorkflowStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut facts = Vec::new();
        replay::<WorkflowFact, _>(&path, |fact| facts.push(fact))?;
        let writer = open_append(&path)?;
        Ok(Self { path, writer, facts })
    }
}

impl WorkflowStore for FileWorkflowStore {
    fn write(&mut self, workflow_id: &str, entry_type: &str, payload: Value) -> Result<()> {
        let fact = WorkflowFact {
            workflow_id: workflow_id.to_string(),
            entry_type: entry_type.to_string(),
            ts: Utc::now(),
            payload,
        };
        let line = serde_json::to_string(&fact)? + "\n";
        self.writer.write_all(line.as_bytes())?;
        self.facts.push(fact);
        Ok(())
    }

    fn records(&self, workflow_id: &str) -> Result<Vec<Value>> {
        Ok(self
            .facts
            .iter()
            .filter(|fact| fact.workflow_id == workflow_id)
            .map(|fact| fact.payload.clone())
            .collect())
    }

    fn placeholders(&self, workflow_id: &str) -> Result<Vec<Value>> {
        Ok(self
            .facts
            .iter()
            .filter(|fact| fact.workflow_id == workflow_id && fact.entry_type == PLACEHOLDER_ENTRY)
            .map(|fact| fact.payload.clone())
            .collect())
    }

    fn clear(&mut self) -> Result<()> {
        self.writer.flush()?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .with_context(|| format!("failed to truncate signature log {}", self.path.display()))?;
        self.writer = BufWriter::new(file);
        self.facts.clear();
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// Step signature log; replay keeps the last write per step id.
pub struct FileStepStore {
    writer: BufWriter<File>,
    index: HashMap<String, Value>,
}

impl FileStepStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut index = HashMap::new();
        replay::<StepFact, _>(&path, |fact| {
            index.insert(fact.step_id, fact.signature);
        })?;
        let writer = open_append(&path)?;
        Ok(Self { writer, index })
    }
}

impl StepStore for FileStepStore {
    fn set(&mut self, step_id: &str, signature: Value) -> Result<()> {
        let fact = StepFact {
            step_id: step_id.to_string(),
            ts: Utc::now(),
            signature,
        };
        let line = serde_json::to_string(&fact)? + "\n";
        self.writer.write_all(line.as_bytes())?;
        self.index.insert(fact.step_id, fact.signature);
        Ok(())
    }

    fn get(&self, step_id: &str) -> Result<Option<Value>> {
        Ok(self.index.get(step_id).cloned())
    }

    fn commit(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// In-memory workflow facts for ephemeral runs.
#[derive(Default)]
pub struct MemoryWorkflowStore {
    facts: Vec<WorkflowFact>,
}

impl WorkflowStore for MemoryWorkflowStore {
    fn write(&mut self, workflow_id: &str, entry_type: &str, payload: Value) -> Result<()> {
        self.facts.push(WorkflowFact {
            workflow_id: workflow_id.to_string(),
            entry_type: entry_type.to_string(),
            ts: Utc::now(),
            payload,
        });
        Ok(())
    }

    fn records(&self, workflow_id: &str) -> Result<Vec<Value>> {
        Ok(self
            .facts
            .iter()
            .filter(|fact| fact.workflow_id == workflow_id)
            .map(|fact| fact.payload.clone())
            .collect())
    }

    fn placeholders(&self, workflow_id: &str) -> Result<Vec<Value>> {
        Ok(self
            .facts
            .iter()
            .filter(|fact| fact.workflow_id == workflow_id && fact.entry_type == PLACEHOLDER_ENTRY)
            .map(|fact| fact.payload.clone())
            .collect())
    }

    fn clear(&mut self) -> Result<()> {
        self.facts.clear();
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }
}

/// In-memory step signatures for ephemeral runs.
#[derive(Default)]
pub struct MemoryStepStore {
    index: HashMap<String, Value>,
}

impl StepStore for MemoryStepStore {
    fn set(&mut self, step_id: &str, signature: Value) -> Result<()> {
        self.index.insert(step_id.to_string(), signature);
        Ok(())
    }

    fn get(&self, step_id: &str) -> Result<Option<Value>> {
        Ok(self.index.get(step_id).cloned())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn workflow_log_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("workflow_facts.jsonl");

        {
            let mut store = FileWorkflowStore::open(&path)?;
            store.write("wf1", "tracked_file", json!({"file": "a.txt"}))?;
            store.write("wf1", PLACEHOLDER_ENTRY, json!({"file": "b.txt"}))?;
            store.write("wf2", "tracked_file", json!({"file": "c.txt"}))?;
            store.commit()?;
        }

        let store = FileWorkflowStore::open(&path)?;
        assert_eq!(store.records("wf1")?.len(), 2);
        assert_eq!(store.placeholders("wf1")?, vec![json!({"file": "b.txt"})]);
        assert!(store.records("wf3")?.is_empty());
        Ok(())
    }

    #[test]
    fn clear_empties_log_and_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("workflow_facts.jsonl");

        let mut store = FileWorkflowStore::open(&path)?;
        store.write("wf1", "tracked_file", json!(1))?;
        store.commit()?;
        store.clear()?;
        assert!(store.records("wf1")?.is_empty());

        drop(store);
        let reopened = FileWorkflowStore::open(&path)?;
        assert!(reopened.records("wf1")?.is_empty());
        Ok(())
    }

    #[test]
    fn step_log_keeps_last_write_per_id() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("step_signatures.jsonl");

        {
            let mut store = FileStepStore::open(&path)?;
            store.set("align_1", json!("sig-old"))?;
            store.set("align_1", json!("sig-new"))?;
            store.set("align_2", json!("sig-other"))?;
            store.commit()?;
        }

        let store = FileStepStore::open(&path)?;
        assert_eq!(store.get("align_1")?, Some(json!("sig-new")));
        assert_eq!(store.get("align_2")?, Some(json!("sig-other")));
        assert_eq!(store.get("align_3")?, None);
        Ok(())
    }

    #[test]
    fn memory_stores_behave_like_file_stores() -> Result<()> {
        let mut workflows = MemoryWorkflowStore::default();
        workflows.write("wf1", PLACEHOLDER_ENTRY, json!("p"))?;
        workflows.write("wf1", "record", json!("r"))?;
        assert_eq!(workflows.placeholders("wf1")?, vec![json!("p")]);
        workflows.clear()?;
        assert!(workflows.records("wf1")?.is_empty());

        let mut steps = MemoryStepStore::default();
        steps.set("s", json!("abc"))?;
        steps.commit()?;
        assert_eq!(steps.get("s")?, Some(json!("abc")));
        Ok(())
    }
}
