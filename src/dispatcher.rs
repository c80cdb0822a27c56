//! Bounded-concurrency dispatcher.
//!
//! Every admitted job runs to a terminal [`JobResult`] on a worker slot,
//! including all of its retries, and each result is streamed out as soon as it
//! exists. [`Dispatcher::run`] drives that stream into a [`ResultSink`]; a
//! failed write aborts the whole run.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

use crate::client::{InferenceClient, InferenceOutput};
use crate::error::{BenchError, InferenceError, SinkError};
use crate::job::{ErrorKind, Job, JobResult};
use crate::retry::{RetryDecision, RetryPolicy, TRACE_LIMIT};
use crate::sink::ResultSink;
use crate::state::{DispatchState, WaitOutcome};
use crate::ui::RunProgress;
use crate::watchdog::{StallWatchdog, WatchdogConfig};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub pool_size: usize,
    /// How long a watchdog pulse stays observable to retry waits.
    pub nudge_duration: Duration,
    pub watchdog: WatchdogConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            nudge_duration: Duration::from_millis(500),
            watchdog: WatchdogConfig::default(),
        }
    }
}

/// Per-run handles shared by every worker. Lives outside the jobs themselves.
struct RunContext<C> {
    client: Arc<C>,
    policy: Arc<RetryPolicy>,
    state: Arc<DispatchState>,
}

impl<C> Clone for RunContext<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            policy: Arc::clone(&self.policy),
            state: Arc::clone(&self.state),
        }
    }
}

/// An in-progress dispatch: yields one result per submitted job, in
/// completion order.
pub struct Dispatch {
    results: mpsc::UnboundedReceiver<JobResult>,
    workers: JoinSet<()>,
    state: Arc<DispatchState>,
    total: usize,
}

impl Dispatch {
    pub fn state(&self) -> &Arc<DispatchState> {
        &self.state
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// The next finished result, or `None` once every worker has exited.
    pub async fn next(&mut self) -> Option<JobResult> {
        self.results.recv().await
    }

    /// Stops all workers. Jobs without a result are picked up on resume.
    pub fn abort(&mut self) {
        self.workers.abort_all();
        self.results.close();
    }
}

/// Final tally of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub content_filtered: usize,
    pub rate_limit_retries: u64,
    pub stall_pulses: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl RunSummary {
    fn new(run_id: String, total: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            total,
            succeeded: 0,
            failed: 0,
            content_filtered: 0,
            rate_limit_retries: 0,
            stall_pulses: 0,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
        }
    }

    fn record(&mut self, result: &JobResult) {
        self.rate_limit_retries += u64::from(result.rate_limit_retries);
        match result.error_kind() {
            None => self.succeeded += 1,
            Some(kind) => {
                self.failed += 1;
                if kind == ErrorKind::ContentFilter {
                    self.content_filtered += 1;
                }
            }
        }
    }

    fn finish(&mut self) {
        self.finished_at = Utc::now();
        self.duration_ms = (self.finished_at - self.started_at).num_milliseconds();
    }

    pub fn persisted(&self) -> usize {
        self.succeeded + self.failed
    }
}

pub struct Dispatcher {
    config: DispatchConfig,
    policy: Arc<RetryPolicy>,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig, policy: RetryPolicy) -> Self {
        Self {
            config,
            policy: Arc::new(policy),
        }
    }

    /// Admits every job and starts processing on at most `pool_size` workers.
    pub fn dispatch<C: InferenceClient>(&self, jobs: Vec<Job>, client: Arc<C>) -> Dispatch {
        let state = Arc::new(DispatchState::new(self.config.nudge_duration));
        let ctx = RunContext {
            client,
            policy: Arc::clone(&self.policy),
            state: Arc::clone(&state),
        };
        let slots = Arc::new(Semaphore::new(self.config.pool_size.max(1)));
        let (tx, results) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();
        let total = jobs.len();

        for job in jobs {
            state.admit(&job.id);
            let ctx = ctx.clone();
            let slots = Arc::clone(&slots);
            let tx = tx.clone();
            let span = tracing::info_span!("job", job_id = %job.id);
            workers.spawn(
                async move {
                    // Held for the job's whole retry lifetime.
                    let Ok(_permit) = slots.acquire_owned().await else {
                        return;
                    };
                    ctx.state.start(&job.id);
                    let result = process_job(&job, &ctx).await;
                    ctx.state.finish(&job.id, result.error_kind());
                    let _ = tx.send(result);
                }
                .instrument(span),
            );
        }

        Dispatch {
            results,
            workers,
            state,
            total,
        }
    }

    /// Dispatches `jobs` and persists each result as it arrives.
    ///
    /// Returns [`BenchError::SinkWrite`] as soon as a write fails; every
    /// worker is stopped at that point.
    pub async fn run<C, S>(
        &self,
        jobs: Vec<Job>,
        client: Arc<C>,
        sink: Arc<S>,
        progress: RunProgress,
    ) -> Result<RunSummary, BenchError>
    where
        C: InferenceClient,
        S: ResultSink,
    {
        let run_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("run", run_id = %run_id);
        self.run_inner(run_id, jobs, client, sink, progress)
            .instrument(span)
            .await
    }

    async fn run_inner<C, S>(
        &self,
        run_id: String,
        jobs: Vec<Job>,
        client: Arc<C>,
        sink: Arc<S>,
        progress: RunProgress,
    ) -> Result<RunSummary, BenchError>
    where
        C: InferenceClient,
        S: ResultSink,
    {
        let mut summary = RunSummary::new(run_id, jobs.len());
        tracing::info!(
            jobs = summary.total,
            pool_size = self.config.pool_size,
            "starting dispatch"
        );

        let mut dispatch = self.dispatch(jobs, client);
        let state = Arc::clone(dispatch.state());
        let watchdog = StallWatchdog::new(Arc::clone(&state), self.config.watchdog.clone()).spawn();
        let progress = progress.spawn(Arc::clone(&state));

        while let Some(result) = dispatch.next().await {
            let (result, written) = match persist(&sink, result).await {
                Ok(persisted) => persisted,
                Err(err) => {
                    dispatch.abort();
                    watchdog.abort();
                    progress.abandon().await;
                    return Err(err);
                }
            };
            if let Err(source) = written {
                dispatch.abort();
                watchdog.abort();
                progress.abandon().await;
                tracing::error!(job_id = %result.id, error = %source, "result sink failed, aborting run");
                return Err(BenchError::SinkWrite {
                    job_id: result.id,
                    source,
                });
            }
            summary.record(&result);
        }

        let report = watchdog.await?;
        summary.stall_pulses = report.pulses;
        progress.finish().await;

        let missing = summary.total - summary.persisted();
        if missing > 0 {
            return Err(BenchError::MissingResults { missing });
        }

        summary.finish();
        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            rate_limit_retries = summary.rate_limit_retries,
            "dispatch complete"
        );
        Ok(summary)
    }
}

/// Runs one job to a terminal result, retrying transient failures for as long
/// as they keep occurring.
async fn process_job<C: InferenceClient>(job: &Job, ctx: &RunContext<C>) -> JobResult {
    let mut retries: u32 = 0;
    loop {
        let error = match attempt(job, &ctx.client).await {
            Ok(output) => return JobResult::success(job, output, retries),
            Err(error) => error,
        };

        let active = ctx.state.in_flight();
        match ctx.policy.decide(job, &error, active, retries) {
            RetryDecision::RetryImmediately => {
                retries += 1;
                ctx.state.record_retry(&job.id);
                tracing::warn!(job_id = %job.id, %error, "timed out, retrying immediately");
            }
            RetryDecision::RetryAfter(delay) => {
                retries += 1;
                ctx.state.record_retry(&job.id);
                tracing::warn!(
                    job_id = %job.id,
                    %error,
                    active,
                    delay_secs = delay.as_secs(),
                    "rate limited, backing off"
                );
                if let WaitOutcome::Nudged(at) = ctx.state.stall().wait(delay).await {
                    ctx.state.record_nudge(&job.id, at);
                    tracing::info!(job_id = %job.id, "backoff cut short by stall nudge");
                }
            }
            RetryDecision::GiveUp(result) => {
                if result.error_kind() == Some(ErrorKind::ContentFilter) {
                    tracing::debug!(job_id = %job.id, %error, "rejected by content filter");
                } else {
                    tracing::error!(
                        job_id = %job.id,
                        trace = %error.trace(TRACE_LIMIT),
                        "inference failed, recording error result"
                    );
                }
                return result;
            }
        }
    }
}

/// Writes one result on the blocking pool; file writes and syncs never run on
/// a runtime worker.
async fn persist<S: ResultSink>(
    sink: &Arc<S>,
    result: JobResult,
) -> Result<(JobResult, Result<(), SinkError>), BenchError> {
    let sink = Arc::clone(sink);
    let written = tokio::task::spawn_blocking(move || {
        let outcome = sink.write(&result);
        (result, outcome)
    })
    .await?;
    Ok(written)
}

/// One client call on its own task, so a panicking client becomes a fatal
/// job error instead of a lost job. The call lives in a `JoinSet` owned by
/// this future: aborting the worker aborts the call with it.
async fn attempt<C: InferenceClient>(
    job: &Job,
    client: &Arc<C>,
) -> Result<InferenceOutput, InferenceError> {
    let client = Arc::clone(client);
    let job = job.clone();
    let mut call = JoinSet::new();
    call.spawn(async move { client.infer(&job).await });
    match call.join_next().await {
        Some(Ok(outcome)) => outcome,
        Some(Err(join)) => Err(InferenceError::Other(format!(
            "inference client panicked: {join}"
        ))),
        None => Err(InferenceError::Other("inference call was not scheduled".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use serde_json::{Value, json};
    use tokio::time::Instant;

    use crate::job::Outcome;

    /// Scripted client: each job id maps to a queue of failures served before
    /// success. Ids in `always` fail on every call.
    #[derive(Default)]
    struct ScriptedClient {
        scripts: Mutex<HashMap<String, VecDeque<InferenceError>>>,
        always: HashMap<String, String>,
        calls: Mutex<HashMap<String, Vec<Instant>>>,
        latency: HashMap<String, Duration>,
    }

    impl ScriptedClient {
        fn fail_then_succeed(mut self, id: &str, errors: Vec<InferenceError>) -> Self {
            self.scripts.get_mut().unwrap().insert(id.to_string(), errors.into());
            self
        }

        fn always_fail(mut self, id: &str, message: &str) -> Self {
            self.always.insert(id.to_string(), message.to_string());
            self
        }

        fn calls(&self, id: &str) -> Vec<Instant> {
            self.calls.lock().unwrap().get(id).cloned().unwrap_or_default()
        }
    }

    impl InferenceClient for ScriptedClient {
        async fn infer(&self, job: &Job) -> Result<InferenceOutput, InferenceError> {
            self.calls
                .lock()
                .unwrap()
                .entry(job.id.clone())
                .or_default()
                .push(Instant::now());
            if let Some(latency) = self.latency.get(&job.id) {
                tokio::time::sleep(*latency).await;
            }
            if let Some(message) = self.always.get(&job.id) {
                return Err(InferenceError::Other(message.clone()));
            }
            let next = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&job.id)
                .and_then(VecDeque::pop_front);
            match next {
                Some(error) => Err(error),
                None => Ok(InferenceOutput::new(json!(format!("answer for {}", job.id)))),
            }
        }
    }

    #[derive(Default)]
    struct MemorySink {
        results: Mutex<Vec<JobResult>>,
        fail_on: Option<String>,
    }

    impl ResultSink for MemorySink {
        fn write(&self, result: &JobResult) -> Result<(), SinkError> {
            if self.fail_on.as_deref() == Some(result.id.as_str()) {
                return Err(SinkError::io(
                    "/dev/full",
                    std::io::Error::other("no space left on device"),
                ));
            }
            self.results.lock().unwrap().push(result.clone());
            Ok(())
        }

        fn completed_ids(&self) -> Result<HashSet<String>, SinkError> {
            Ok(self.results.lock().unwrap().iter().map(|r| r.id.clone()).collect())
        }
    }

    fn job(id: &str) -> Job {
        Job::new(id, crate::job::category_of(id), json!({ "id": id }))
    }

    fn dispatcher(pool_size: usize) -> Dispatcher {
        Dispatcher::new(
            DispatchConfig {
                pool_size,
                ..DispatchConfig::default()
            },
            RetryPolicy::default(),
        )
    }

    fn rate_limited() -> InferenceError {
        InferenceError::Status {
            status: 429,
            message: "Rate limit reached".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_outcomes_produce_one_result_each() {
        let client = Arc::new(
            ScriptedClient::default()
                .fail_then_succeed("simple_b", vec![rate_limited()])
                .always_fail("simple_c", "model returned invalid JSON"),
        );
        let sink = Arc::new(MemorySink::default());
        let jobs = vec![job("simple_a"), job("simple_b"), job("simple_c")];

        let summary = dispatcher(2)
            .run(jobs, Arc::clone(&client), Arc::clone(&sink), RunProgress::hidden())
            .await
            .unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.rate_limit_retries, 1);

        let results = sink.results.lock().unwrap();
        let ids: HashSet<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, HashSet::from(["simple_a", "simple_b", "simple_c"]));

        let b_calls = client.calls("simple_b");
        assert_eq!(b_calls.len(), 2);
        assert!(b_calls[1] - b_calls[0] > Duration::ZERO);
        assert_eq!(client.calls("simple_c").len(), 1);

        let c = results.iter().find(|r| r.id == "simple_c").unwrap();
        match &c.outcome {
            Outcome::Failure(error) => {
                assert_eq!(error.kind, ErrorKind::Fatal);
                assert!(error.message.contains("invalid JSON"));
            }
            Outcome::Success(_) => panic!("simple_c should fail"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_retries_without_sleeping() {
        let client = Arc::new(ScriptedClient::default().fail_then_succeed(
            "simple_t",
            vec![
                InferenceError::Timeout("read timed out".into()),
                InferenceError::Other("Request timed out".into()),
            ],
        ));
        let sink = Arc::new(MemorySink::default());
        dispatcher(1)
            .run(vec![job("simple_t")], Arc::clone(&client), sink, RunProgress::hidden())
            .await
            .unwrap();

        let calls = client.calls("simple_t");
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2] - calls[0], Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn last_job_waits_short_backoff() {
        let client =
            Arc::new(ScriptedClient::default().fail_then_succeed("simple_0", vec![rate_limited()]));
        let sink = Arc::new(MemorySink::default());
        dispatcher(4)
            .run(vec![job("simple_0")], Arc::clone(&client), sink, RunProgress::hidden())
            .await
            .unwrap();

        let calls = client.calls("simple_0");
        assert_eq!(calls[1] - calls[0], Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_run_waits_default_backoff() {
        let mut client = ScriptedClient::default().fail_then_succeed("simple_0", vec![rate_limited()]);
        // Keep the other nine jobs in flight while simple_0 backs off.
        for i in 1..10 {
            client.latency.insert(format!("simple_{i}"), Duration::from_secs(300));
        }
        let client = Arc::new(client);
        let jobs: Vec<Job> = (0..10).map(|i| job(&format!("simple_{i}"))).collect();
        let sink = Arc::new(MemorySink::default());
        dispatcher(10)
            .run(jobs, Arc::clone(&client), Arc::clone(&sink), RunProgress::hidden())
            .await
            .unwrap();

        let calls = client.calls("simple_0");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1] - calls[0], Duration::from_secs(65));
        assert_eq!(sink.results.lock().unwrap().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_invoked_once() {
        let client = Arc::new(ScriptedClient::default().always_fail("simple_x", "KeyError: 'function'"));
        let sink = Arc::new(MemorySink::default());
        let summary = dispatcher(1)
            .run(vec![job("simple_x")], Arc::clone(&client), sink, RunProgress::hidden())
            .await
            .unwrap();
        assert_eq!(client.calls("simple_x").len(), 1);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn content_filter_is_counted() {
        let client = Arc::new(ScriptedClient::default().always_fail(
            "simple_cf",
            "The response was filtered due to the prompt triggering content management policy",
        ));
        let summary = dispatcher(1)
            .run(
                vec![job("simple_cf"), job("simple_ok")],
                Arc::clone(&client),
                Arc::new(MemorySink::default()),
                RunProgress::hidden(),
            )
            .await
            .unwrap();
        assert_eq!(summary.content_filtered, 1);
        assert_eq!(client.calls("simple_cf").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_backoff_is_cut_short_by_watchdog() {
        // The only job keeps getting rate limited. With 200s table steps it
        // would wait 200s; the watchdog nudges it after ~11s of idleness.
        let client = Arc::new(
            ScriptedClient::default().fail_then_succeed("simple_0", vec![rate_limited()]),
        );
        let policy = RetryPolicy::new(crate::retry::BackoffTable::from_secs(&[200], 200));
        let dispatcher = Dispatcher::new(DispatchConfig::default(), policy);
        dispatcher
            .run(
                vec![job("simple_0")],
                Arc::clone(&client),
                Arc::new(MemorySink::default()),
                RunProgress::hidden(),
            )
            .await
            .unwrap();

        let calls = client.calls("simple_0");
        let waited = calls[1] - calls[0];
        assert!(waited > Duration::from_secs(10), "waited {waited:?}");
        assert!(waited <= Duration::from_secs(11), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn pool_size_bounds_concurrency() {
        struct Gauge {
            current: AtomicUsize,
            peak: AtomicUsize,
        }
        impl InferenceClient for Gauge {
            async fn infer(&self, _job: &Job) -> Result<InferenceOutput, InferenceError> {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(InferenceOutput::new(Value::Null))
            }
        }

        let gauge = Arc::new(Gauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let jobs: Vec<Job> = (0..12).map(|i| job(&format!("simple_{i}"))).collect();
        let summary = dispatcher(3)
            .run(jobs, Arc::clone(&gauge), Arc::new(MemorySink::default()), RunProgress::hidden())
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 12);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_client_yields_error_result() {
        struct Panics;
        impl InferenceClient for Panics {
            async fn infer(&self, job: &Job) -> Result<InferenceOutput, InferenceError> {
                if job.id == "simple_boom" {
                    panic!("handler bug");
                }
                Ok(InferenceOutput::new(Value::Null))
            }
        }

        let sink = Arc::new(MemorySink::default());
        let summary = dispatcher(2)
            .run(
                vec![job("simple_boom"), job("simple_fine")],
                Arc::new(Panics),
                Arc::clone(&sink),
                RunProgress::hidden(),
            )
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_aborts_run() {
        let sink = Arc::new(MemorySink {
            fail_on: Some("simple_1".into()),
            ..MemorySink::default()
        });
        let jobs: Vec<Job> = (0..5).map(|i| job(&format!("simple_{i}"))).collect();
        let err = dispatcher(1)
            .run(jobs, Arc::new(ScriptedClient::default()), Arc::clone(&sink), RunProgress::hidden())
            .await
            .unwrap_err();

        match err {
            BenchError::SinkWrite { job_id, .. } => assert_eq!(job_id, "simple_1"),
            other => panic!("expected SinkWrite, got {other}"),
        }
        let persisted = sink.results.lock().unwrap().len();
        assert!(persisted < 5);
    }

    #[tokio::test(start_paused = true)]
    async fn results_stream_as_they_finish() {
        struct Slow;
        impl InferenceClient for Slow {
            async fn infer(&self, job: &Job) -> Result<InferenceOutput, InferenceError> {
                let secs = if job.id == "simple_0" { 30 } else { 1 };
                tokio::time::sleep(Duration::from_secs(secs)).await;
                Ok(InferenceOutput::new(Value::Null))
            }
        }

        let mut dispatch = dispatcher(2).dispatch(vec![job("simple_0"), job("simple_1")], Arc::new(Slow));
        assert_eq!(dispatch.total(), 2);
        let first = dispatch.next().await.unwrap();
        assert_eq!(first.id, "simple_1");
        assert_eq!(dispatch.state().in_flight(), 1);
        let second = dispatch.next().await.unwrap();
        assert_eq!(second.id, "simple_0");
        assert!(dispatch.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_run_completes_immediately() {
        let summary = dispatcher(4)
            .run(
                Vec::new(),
                Arc::new(ScriptedClient::default()),
                Arc::new(MemorySink::default()),
                RunProgress::hidden(),
            )
            .await
            .unwrap();
        assert_eq!(summary.total, 0);
        assert_eq!(summary.persisted(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sink_writes_run_off_the_runtime_thread() {
        struct ThreadSink {
            threads: Mutex<Vec<std::thread::ThreadId>>,
        }
        impl ResultSink for ThreadSink {
            fn write(&self, _result: &JobResult) -> Result<(), SinkError> {
                self.threads.lock().unwrap().push(std::thread::current().id());
                Ok(())
            }
            fn completed_ids(&self) -> Result<HashSet<String>, SinkError> {
                Ok(HashSet::new())
            }
        }

        let sink = Arc::new(ThreadSink {
            threads: Mutex::new(Vec::new()),
        });
        let jobs: Vec<Job> = (0..3).map(|i| job(&format!("simple_{i}"))).collect();
        let summary = dispatcher(2)
            .run(jobs, Arc::new(ScriptedClient::default()), Arc::clone(&sink), RunProgress::hidden())
            .await
            .unwrap();

        assert_eq!(summary.persisted(), 3);
        let runtime_thread = std::thread::current().id();
        let threads = sink.threads.lock().unwrap();
        assert_eq!(threads.len(), 3);
        assert!(threads.iter().all(|id| *id != runtime_thread));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_cancels_in_flight_call() {
        struct DropFlag(Arc<AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }
        struct Hanging {
            dropped: Arc<AtomicBool>,
        }
        impl InferenceClient for Hanging {
            async fn infer(&self, _job: &Job) -> Result<InferenceOutput, InferenceError> {
                let _flag = DropFlag(Arc::clone(&self.dropped));
                tokio::time::sleep(Duration::from_secs(1000)).await;
                Ok(InferenceOutput::new(Value::Null))
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let client = Arc::new(Hanging {
            dropped: Arc::clone(&dropped),
        });
        let mut dispatch = dispatcher(1).dispatch(vec![job("simple_0")], client);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!dropped.load(Ordering::SeqCst));

        dispatch.abort();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(dropped.load(Ordering::SeqCst));
    }
}
