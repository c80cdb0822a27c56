//! Jobs, their terminal results, and the ordering used to dispatch them.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::client::InferenceOutput;

/// One test case routed through the inference client.
///
/// The payload is the opaque test definition. Live execution metadata
/// (retry counts, retry timestamps, nudges) is tracked by the dispatcher, never
/// stored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub category: String,
    pub payload: Value,
}

impl Job {
    pub fn new(id: impl Into<String>, category: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            payload,
        }
    }

    /// Builds a job from a catalogue entry, deriving the category from the
    /// identifier when none is given.
    pub fn from_entry(payload: Value, category: Option<&str>) -> Option<Self> {
        let id = payload.get("id")?.as_str()?.to_string();
        let category = category
            .map(str::to_string)
            .unwrap_or_else(|| category_of(&id).to_string());
        Some(Self {
            id,
            category,
            payload,
        })
    }

    pub fn sort_key(&self) -> SortKey {
        SortKey::new(&self.id)
    }
}

/// Category prefix of an identifier such as `simple_12` or `live_multiple_3-1-0`.
pub fn category_of(id: &str) -> &str {
    match id.rsplit_once('_') {
        Some((category, _)) => category,
        None => id,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum IndexKey {
    Numeric(u64),
    Text(String),
}

/// Deterministic ordering over job identifiers: category first, then the
/// numeric index, so `simple_2` sorts before `simple_10`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    category: String,
    index: IndexKey,
    raw: String,
}

impl SortKey {
    pub fn new(id: &str) -> Self {
        let (category, index) = match id.rsplit_once('_') {
            Some((category, tail)) => {
                let head = tail.split('-').next().unwrap_or(tail);
                let index = head
                    .parse::<u64>()
                    .map(IndexKey::Numeric)
                    .unwrap_or_else(|_| IndexKey::Text(tail.to_string()));
                (category.to_string(), index)
            }
            None => (id.to_string(), IndexKey::Text(String::new())),
        };
        Self {
            category,
            index,
            raw: id.to_string(),
        }
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.category
            .cmp(&other.category)
            .then_with(|| self.index.cmp(&other.index))
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Distinguishes failures that become terminal error results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The provider refused the request on content-policy grounds.
    ContentFilter,
    /// Any other non-transient failure.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ContentFilter => write!(f, "content_filter"),
            ErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub message: String,
    pub traceback: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(InferenceOutput),
    Failure(ErrorDescriptor),
}

/// Terminal result for one job. Exactly one is produced per admitted job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub id: String,
    pub category: String,
    pub outcome: Outcome,
    /// Transient retries incurred. Reported live, never persisted.
    pub rate_limit_retries: u32,
}

impl JobResult {
    pub fn success(job: &Job, output: InferenceOutput, rate_limit_retries: u32) -> Self {
        Self {
            id: job.id.clone(),
            category: job.category.clone(),
            outcome: Outcome::Success(output),
            rate_limit_retries,
        }
    }

    pub fn failure(job: &Job, error: ErrorDescriptor, rate_limit_retries: u32) -> Self {
        Self {
            id: job.id.clone(),
            category: job.category.clone(),
            outcome: Outcome::Failure(error),
            rate_limit_retries,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            Outcome::Failure(e) => Some(e.kind),
            Outcome::Success(_) => None,
        }
    }

    /// The persisted form: the identifier plus the outcome body. Live counters
    /// and the category (which selects the destination file) are left out.
    pub fn to_record(&self) -> Value {
        let mut record = Map::new();
        record.insert("id".into(), Value::String(self.id.clone()));
        match &self.outcome {
            Outcome::Success(output) => {
                record.insert("result".into(), output.result.clone());
                for (key, value) in &output.metadata {
                    if key != "id" && key != "result" {
                        record.insert(key.clone(), value.clone());
                    }
                }
            }
            Outcome::Failure(error) => {
                record.insert(
                    "result".into(),
                    Value::String(format!("Error during inference: {}", error.message)),
                );
                if let Some(traceback) = &error.traceback {
                    record.insert("traceback".into(), Value::String(traceback.clone()));
                }
                record.insert("error_kind".into(), Value::String(error.kind.to_string()));
            }
        }
        Value::Object(record)
    }
}
