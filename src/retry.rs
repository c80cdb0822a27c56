//! Failure classification and retry timing.
//!
//! Transient failures (rate limits, provider overload, timeouts) retry without
//! limit; everything else gives up on the first failure, since the model call is
//! effectively deterministic at near-zero temperature.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::InferenceError;
use crate::job::{ErrorDescriptor, ErrorKind, Job, JobResult};

/// Status codes treated as transient regardless of message text.
const TRANSIENT_STATUSES: [u16; 3] = [429, 500, 503];

/// Frames of error chain kept in a recorded traceback.
pub const TRACE_LIMIT: usize = 10;

/// How a failure is treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Quota or overload signal; retried after a delay scaled to active jobs.
    RateLimit,
    /// The attempt was slow, not rejected; retried at once.
    Timeout,
    /// Content-policy refusal; terminal, but counted separately.
    ContentFilter,
    /// Anything else; terminal.
    Fatal,
}

impl FailureClass {
    pub fn is_transient(self) -> bool {
        matches!(self, FailureClass::RateLimit | FailureClass::Timeout)
    }
}

/// Next action for a job whose attempt just failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    RetryImmediately,
    RetryAfter(Duration),
    GiveUp(JobResult),
}

/// Rate-limit delays indexed by the number of jobs still in flight, with a
/// flat default past the end of the table.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffTable {
    steps: Vec<Duration>,
    default_delay: Duration,
}

impl Default for BackoffTable {
    fn default() -> Self {
        Self::from_secs(&[5, 10, 15, 20, 35, 45], 65)
    }
}

impl BackoffTable {
    pub fn new(steps: Vec<Duration>, default_delay: Duration) -> Self {
        Self {
            steps,
            default_delay,
        }
    }

    pub fn from_secs(steps: &[u64], default_secs: u64) -> Self {
        Self::new(
            steps.iter().copied().map(Duration::from_secs).collect(),
            Duration::from_secs(default_secs),
        )
    }

    pub fn default_delay(&self) -> Duration {
        self.default_delay
    }

    pub fn with_default_delay(&self, default_delay: Duration) -> Self {
        Self {
            steps: self.steps.clone(),
            default_delay,
        }
    }

    /// Delay for `active` in-flight jobs. A count of zero is treated as one.
    pub fn delay_for(&self, active: usize) -> Duration {
        let slot = active.max(1) - 1;
        self.steps.get(slot).copied().unwrap_or(self.default_delay)
    }

    /// Steps must never decrease, and the default must not undercut the last step.
    pub fn is_monotonic(&self) -> bool {
        self.steps.windows(2).all(|w| w[0] <= w[1])
            && self.steps.last().is_none_or(|last| *last <= self.default_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: BackoffTable,
    category_delays: HashMap<String, Duration>,
    overload_markers: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(BackoffTable::default())
    }
}

impl RetryPolicy {
    pub fn new(backoff: BackoffTable) -> Self {
        Self {
            backoff,
            category_delays: HashMap::new(),
            overload_markers: default_overload_markers(),
        }
    }

    pub fn with_category_delays(mut self, delays: HashMap<String, Duration>) -> Self {
        self.category_delays = delays;
        self
    }

    pub fn with_overload_markers(mut self, markers: Vec<String>) -> Self {
        self.overload_markers = markers;
        self
    }

    pub fn backoff(&self) -> &BackoffTable {
        &self.backoff
    }

    /// Classifies a failure by status code and message text.
    pub fn classify(&self, error: &InferenceError) -> FailureClass {
        let raw = error.to_string();
        let lower = raw.to_lowercase();

        let timeout = matches!(error, InferenceError::Timeout(_))
            || lower.contains("timeout")
            || lower.contains("timed out");
        let transient = timeout
            || lower.contains("rate limit")
            || error
                .status_code()
                .is_some_and(|s| TRANSIENT_STATUSES.contains(&s))
            || self
                .overload_markers
                .iter()
                .any(|m| raw.contains(m.as_str()) || lower.contains(&m.to_lowercase()));

        if timeout {
            FailureClass::Timeout
        } else if transient {
            FailureClass::RateLimit
        } else if raw.contains("content_filter") || raw.contains("content management policy") {
            FailureClass::ContentFilter
        } else {
            FailureClass::Fatal
        }
    }

    /// Rate-limit delay for a job of `category` given the active job count.
    /// A per-category override replaces the flat default, not the table.
    pub fn next_delay(&self, category: &str, active: usize) -> Duration {
        match self.category_delays.get(category) {
            Some(delay) => self.backoff.with_default_delay(*delay).delay_for(active),
            None => self.backoff.delay_for(active),
        }
    }

    /// Decides what to do after `error` on `job`. `retries` is the number of
    /// transient retries the job had already incurred before this failure.
    pub fn decide(
        &self,
        job: &Job,
        error: &InferenceError,
        active: usize,
        retries: u32,
    ) -> RetryDecision {
        match self.classify(error) {
            FailureClass::Timeout => RetryDecision::RetryImmediately,
            FailureClass::RateLimit => RetryDecision::RetryAfter(self.next_delay(&job.category, active)),
            class => {
                let kind = if class == FailureClass::ContentFilter {
                    ErrorKind::ContentFilter
                } else {
                    ErrorKind::Fatal
                };
                let descriptor = ErrorDescriptor {
                    kind,
                    message: error.to_string(),
                    traceback: Some(error.trace(TRACE_LIMIT)),
                };
                RetryDecision::GiveUp(JobResult::failure(job, descriptor, retries))
            }
        }
    }
}

pub fn default_overload_markers() -> Vec<String> {
    vec![
        "负载已饱和".to_string(),
        "relay error".to_string(),
        "overloaded".to_string(),
    ]
}
