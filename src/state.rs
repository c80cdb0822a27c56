//! Shared per-run dispatch state.
//!
//! [`DispatchState`] holds the in-flight set, the time of the last completion,
//! run counters, and the [`StallSignal`]. Workers mutate it only through the
//! methods here; the watchdog pulses the signal; the reporter reads snapshots.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::job::ErrorKind;

/// A single watchdog pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nudge {
    pub seq: u64,
    pub at: Instant,
}

/// How an interruptible retry wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Nudged(Instant),
}

/// Broadcast liveness nudge consumed by every sleeping retry wait.
///
/// A pulse wakes all current waiters at once. A wait that begins while a
/// pulse is still within its window returns immediately, so a pulse is
/// observed for its whole duration, not just at the instant it fires.
#[derive(Debug)]
pub struct StallSignal {
    tx: watch::Sender<Option<Nudge>>,
    window: Duration,
}

impl StallSignal {
    pub fn new(window: Duration) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx, window }
    }

    /// Fires a pulse, waking every waiter.
    pub fn pulse(&self) -> Nudge {
        let mut fired = Nudge {
            seq: 0,
            at: Instant::now(),
        };
        self.tx.send_modify(|current| {
            fired.seq = current.map_or(1, |n| n.seq + 1);
            *current = Some(fired);
        });
        fired
    }

    /// Ends the current pulse early without waking anyone.
    pub fn clear(&self) {
        self.tx.send_if_modified(|current| {
            current.take();
            false
        });
    }

    pub fn is_active(&self) -> bool {
        self.tx
            .borrow()
            .is_some_and(|n| n.at.elapsed() < self.window)
    }

    /// Sleeps for `delay` unless a pulse arrives first.
    pub async fn wait(&self, delay: Duration) -> WaitOutcome {
        if delay.is_zero() {
            return WaitOutcome::Elapsed;
        }
        let mut rx = self.tx.subscribe();
        if self.is_active() {
            return WaitOutcome::Nudged(Instant::now());
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return WaitOutcome::Elapsed,
                changed = rx.changed() => {
                    if changed.is_err() {
                        (&mut sleep).await;
                        return WaitOutcome::Elapsed;
                    }
                    if rx.borrow_and_update().is_some() {
                        return WaitOutcome::Nudged(Instant::now());
                    }
                }
            }
        }
    }
}

/// Live metadata for one admitted job. Discarded once the job finishes.
#[derive(Debug, Clone, Default)]
struct JobTracker {
    started_at: Option<Instant>,
    rate_limit_retries: u32,
    last_retry_at: Option<Instant>,
    last_nudge_at: Option<Instant>,
}

/// One running job as shown by the reporter.
#[derive(Debug, Clone, PartialEq)]
pub struct InFlightView {
    pub id: String,
    pub elapsed: Duration,
    pub rate_limit_retries: u32,
    pub since_retry: Option<Duration>,
    pub since_nudge: Option<Duration>,
}

/// Point-in-time copy of the run counters and running jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub total: usize,
    pub completed: usize,
    pub in_flight: usize,
    pub rate_limited: u64,
    pub content_filtered: u64,
    pub idle: Duration,
    /// Started jobs, slowest first.
    pub running: Vec<InFlightView>,
}

#[derive(Debug)]
struct Inner {
    jobs: HashMap<String, JobTracker>,
    submitted: usize,
    completed: usize,
    rate_limited: u64,
    content_filtered: u64,
    last_completion: Instant,
}

#[derive(Debug)]
pub struct DispatchState {
    inner: Mutex<Inner>,
    stall: StallSignal,
}

impl DispatchState {
    pub fn new(nudge_window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                submitted: 0,
                completed: 0,
                rate_limited: 0,
                content_filtered: 0,
                last_completion: Instant::now(),
            }),
            stall: StallSignal::new(nudge_window),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stall(&self) -> &StallSignal {
        &self.stall
    }

    /// Adds a job to the in-flight set at submission time.
    pub fn admit(&self, id: &str) {
        let mut inner = self.lock();
        inner.jobs.insert(id.to_string(), JobTracker::default());
        inner.submitted += 1;
    }

    /// Marks a job as picked up by a worker.
    pub fn start(&self, id: &str) {
        if let Some(job) = self.lock().jobs.get_mut(id) {
            job.started_at = Some(Instant::now());
        }
    }

    /// Counts a transient retry for the job and for the run.
    pub fn record_retry(&self, id: &str) {
        let mut inner = self.lock();
        inner.rate_limited += 1;
        if let Some(job) = inner.jobs.get_mut(id) {
            job.rate_limit_retries += 1;
            job.last_retry_at = Some(Instant::now());
        }
    }

    pub fn record_nudge(&self, id: &str, at: Instant) {
        if let Some(job) = self.lock().jobs.get_mut(id) {
            job.last_nudge_at = Some(at);
        }
    }

    /// Removes a job from the in-flight set once its terminal result exists.
    pub fn finish(&self, id: &str, error: Option<ErrorKind>) {
        {
            let mut inner = self.lock();
            if inner.jobs.remove(id).is_none() {
                return;
            }
            inner.completed += 1;
            inner.last_completion = Instant::now();
            if error == Some(ErrorKind::ContentFilter) {
                inner.content_filtered += 1;
            }
        }
        self.stall.clear();
    }

    pub fn in_flight(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn last_completion(&self) -> Instant {
        self.lock().last_completion
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let now = Instant::now();
        let inner = self.lock();
        let mut running: Vec<InFlightView> = inner
            .jobs
            .iter()
            .filter_map(|(id, job)| {
                let started = job.started_at?;
                Some(InFlightView {
                    id: id.clone(),
                    elapsed: now.duration_since(started),
                    rate_limit_retries: job.rate_limit_retries,
                    since_retry: job.last_retry_at.map(|t| now.duration_since(t)),
                    since_nudge: job.last_nudge_at.map(|t| now.duration_since(t)),
                })
            })
            .collect();
        running.sort_by(|a, b| b.elapsed.cmp(&a.elapsed).then_with(|| a.id.cmp(&b.id)));

        StatusSnapshot {
            total: inner.submitted,
            completed: inner.completed,
            in_flight: inner.jobs.len(),
            rate_limited: inner.rate_limited,
            content_filtered: inner.content_filtered,
            idle: now.duration_since(inner.last_completion),
            running,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn wait_runs_full_delay_without_pulse() {
        let signal = StallSignal::new(Duration::from_millis(500));
        let start = Instant::now();
        assert_eq!(signal.wait(Duration::from_secs(30)).await, WaitOutcome::Elapsed);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn pulse_wakes_every_waiter() {
        let signal = Arc::new(StallSignal::new(Duration::from_millis(500)));
        let start = Instant::now();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let signal = Arc::clone(&signal);
                tokio::spawn(async move { signal.wait(Duration::from_secs(65)).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_secs(4)).await;
        signal.pulse();

        for waiter in waiters {
            let outcome = waiter.await.unwrap();
            assert!(matches!(outcome, WaitOutcome::Nudged(_)));
        }
        assert!(start.elapsed() < Duration::from_millis(4500));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_started_inside_pulse_window_returns_at_once() {
        let signal = StallSignal::new(Duration::from_millis(500));
        signal.pulse();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(
            signal.wait(Duration::from_secs(10)).await,
            WaitOutcome::Nudged(_)
        ));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!signal.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_ends_pulse_without_waking() {
        let signal = Arc::new(StallSignal::new(Duration::from_secs(5)));
        signal.pulse();
        signal.clear();
        assert!(!signal.is_active());

        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.wait(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        signal.clear();
        assert_eq!(waiter.await.unwrap(), WaitOutcome::Elapsed);
    }

    #[test]
    fn pulses_are_sequenced() {
        let signal = StallSignal::new(Duration::from_millis(500));
        assert_eq!(signal.pulse().seq, 1);
        assert_eq!(signal.pulse().seq, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn finish_updates_counters_and_completion_time() {
        let state = DispatchState::new(Duration::from_millis(500));
        state.admit("simple_1");
        state.admit("simple_2");
        assert_eq!(state.in_flight(), 2);

        tokio::time::sleep(Duration::from_secs(3)).await;
        state.finish("simple_1", Some(ErrorKind::ContentFilter));
        let snapshot = state.snapshot();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.in_flight, 1);
        assert_eq!(snapshot.content_filtered, 1);
        assert_eq!(snapshot.idle, Duration::ZERO);

        // Finishing an unknown or already finished job is a no-op.
        state.finish("simple_1", None);
        assert_eq!(state.snapshot().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_ranks_started_jobs_slowest_first() {
        let state = DispatchState::new(Duration::from_millis(500));
        for id in ["a_1", "a_2", "a_3"] {
            state.admit(id);
        }
        state.start("a_2");
        tokio::time::sleep(Duration::from_secs(5)).await;
        state.start("a_1");
        state.record_retry("a_1");
        tokio::time::sleep(Duration::from_secs(1)).await;

        let snapshot = state.snapshot();
        let ids: Vec<&str> = snapshot.running.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["a_2", "a_1"]);
        assert_eq!(snapshot.running[0].elapsed, Duration::from_secs(6));
        assert_eq!(snapshot.running[1].rate_limit_retries, 1);
        assert_eq!(snapshot.running[1].since_retry, Some(Duration::from_secs(1)));
        assert_eq!(snapshot.rate_limited, 1);
        assert_eq!(snapshot.total, 3);
    }
}
