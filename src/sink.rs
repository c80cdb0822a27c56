//! Streaming, resumable result persistence.
//!
//! Results land one per line in `<root>/<category>_result.json`. Appends are
//! flushed and synced per write so an interrupted run loses at most the line
//! being written, which readers skip.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

use crate::error::SinkError;
use crate::job::{JobResult, SortKey};

const RESULT_SUFFIX: &str = "_result.json";

/// Durable destination for job results.
pub trait ResultSink: Send + Sync + 'static {
    /// Persists one result. Called concurrently for distinct identifiers.
    fn write(&self, result: &JobResult) -> Result<(), SinkError>;

    /// Identifiers that already have a persisted result.
    fn completed_ids(&self) -> Result<HashSet<String>, SinkError>;
}

/// How a write treats an identifier that may already be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Append blindly; the job source already excluded persisted work.
    Append,
    /// Replace any existing record with the same identifier.
    Overwrite,
}

/// Directory name for a model, with path separators flattened.
pub fn model_dir_name(model: &str) -> String {
    model.replace('/', "_")
}

/// JSON-lines result files, one per category.
#[derive(Debug)]
pub struct JsonlResultSink {
    root: PathBuf,
    mode: WriteMode,
    lock: Mutex<()>,
}

impl JsonlResultSink {
    /// Opens (creating if needed) the result directory for `model` under `result_dir`.
    pub fn open(result_dir: &Path, model: &str, mode: WriteMode) -> Result<Self, SinkError> {
        let root = result_dir.join(model_dir_name(model));
        fs::create_dir_all(&root).map_err(|e| SinkError::io(&root, e))?;
        Ok(Self {
            root,
            mode,
            lock: Mutex::new(()),
        })
    }

    pub fn path_for(&self, category: &str) -> PathBuf {
        self.root.join(format!("{category}{RESULT_SUFFIX}"))
    }

    /// Persisted identifiers grouped by category.
    pub fn completed_by_category(&self) -> Result<BTreeMap<String, HashSet<String>>, SinkError> {
        scan_results(&self.root)
    }

    /// Persisted identifiers for `model` under `result_dir`, grouped by
    /// category. Read-only: a missing directory yields an empty map.
    pub fn scan(
        result_dir: &Path,
        model: &str,
    ) -> Result<BTreeMap<String, HashSet<String>>, SinkError> {
        scan_results(&result_dir.join(model_dir_name(model)))
    }

    fn append(&self, path: &Path, record: &Value) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| SinkError::io(path, e))?;
        // Terminate a line torn by an earlier crash so this record starts fresh.
        if ends_mid_line(&mut file).map_err(|e| SinkError::io(path, e))? {
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| SinkError::io(path, e))
    }

    fn upsert(&self, path: &Path, record: Value) -> Result<(), SinkError> {
        let id = record_id(&record).unwrap_or_default().to_string();
        let mut records: Vec<Value> = read_records(path)?
            .into_iter()
            .filter(|r| record_id(r) != Some(id.as_str()))
            .collect();
        records.push(record);
        records.sort_by_cached_key(|r| SortKey::new(record_id(r).unwrap_or_default()));

        let tmp = path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp).map_err(|e| SinkError::io(&tmp, e))?;
            for r in &records {
                let mut line = serde_json::to_string(r)?;
                line.push('\n');
                file.write_all(line.as_bytes())
                    .map_err(|e| SinkError::io(&tmp, e))?;
            }
            file.sync_all().map_err(|e| SinkError::io(&tmp, e))?;
        }
        fs::rename(&tmp, path).map_err(|e| SinkError::io(path, e))
    }
}

impl ResultSink for JsonlResultSink {
    fn write(&self, result: &JobResult) -> Result<(), SinkError> {
        let path = self.path_for(&result.category);
        let record = result.to_record();
        let _guard = self.lock.lock().map_err(|_| SinkError::Poisoned)?;
        match self.mode {
            WriteMode::Append => self.append(&path, &record),
            WriteMode::Overwrite => self.upsert(&path, record),
        }
    }

    fn completed_ids(&self) -> Result<HashSet<String>, SinkError> {
        Ok(self
            .completed_by_category()?
            .into_values()
            .flatten()
            .collect())
    }
}

fn scan_results(root: &Path) -> Result<BTreeMap<String, HashSet<String>>, SinkError> {
    let mut by_category = BTreeMap::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(by_category),
        Err(e) => return Err(SinkError::io(root, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| SinkError::io(root, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(category) = name.strip_suffix(RESULT_SUFFIX) else {
            continue;
        };
        let ids = read_records(&entry.path())?
            .into_iter()
            .filter_map(|r| record_id(&r).map(str::to_string))
            .collect();
        by_category.insert(category.to_string(), ids);
    }
    Ok(by_category)
}

/// Whether a non-empty file lacks its final newline.
fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn record_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

/// Reads every well-formed record in a result file. A missing file is empty;
/// lines that fail to parse (a write cut short by a crash) are skipped.
fn read_records(path: &Path) -> Result<Vec<Value>, SinkError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SinkError::io(path, e)),
    };
    let mut records = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| SinkError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(record) if record_id(&record).is_some() => records.push(record),
            Ok(_) | Err(_) => {
                tracing::warn!(
                    path = %path.display(),
                    line = lineno + 1,
                    "skipping malformed result line"
                );
            }
        }
    }
    Ok(records)
}
