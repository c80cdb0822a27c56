use std::future::Future;

use serde_json::{Map, Value};

use crate::error::InferenceError;
use crate::job::Job;

/// What a successful model call hands back: the raw model result plus
/// free-form metadata (token counts, latency) merged into the persisted record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InferenceOutput {
    pub result: Value,
    pub metadata: Map<String, Value>,
}

impl InferenceOutput {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Performs one model call for one job. May block arbitrarily long.
///
/// The engine knows nothing about how the call is made; it only needs failures
/// that the retry policy can classify.
pub trait InferenceClient: Send + Sync + 'static {
    fn infer(&self, job: &Job) -> impl Future<Output = Result<InferenceOutput, InferenceError>> + Send;
}
