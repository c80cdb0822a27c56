//! Stall watchdog.
//!
//! Near the end of a run a handful of jobs can sit out long rate-limit
//! backoffs after the limit has already cleared. When few jobs remain and
//! nothing has completed for a while, the watchdog pulses the stall signal so
//! sleeping retries re-check sooner.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::state::DispatchState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// No completion for longer than this counts as idle.
    pub idle_threshold: Duration,
    /// Pulse at most once per this much idle time.
    pub interval: Duration,
    /// Only act when this many jobs or fewer are in flight.
    pub max_in_flight: usize,
    /// How often the in-flight set is inspected.
    pub poll_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(10),
            interval: Duration::from_secs(10),
            max_in_flight: 8,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// What the watchdog did over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchdogReport {
    pub pulses: u64,
    pub last_pulse: Option<Instant>,
}

pub struct StallWatchdog {
    state: Arc<DispatchState>,
    config: WatchdogConfig,
    // Completion time and idle bucket of the most recent pulse.
    last_signal: Option<(Instant, u128)>,
}

impl StallWatchdog {
    pub fn new(state: Arc<DispatchState>, config: WatchdogConfig) -> Self {
        Self {
            state,
            config,
            last_signal: None,
        }
    }

    pub fn spawn(self) -> JoinHandle<WatchdogReport> {
        tokio::spawn(self.run())
    }

    /// Polls until the in-flight set drains.
    pub async fn run(mut self) -> WatchdogReport {
        let mut report = WatchdogReport::default();
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            let active = self.state.in_flight();
            if active == 0 {
                break;
            }
            let last_completion = self.state.last_completion();
            if let Some(bucket) = self.due(active, Instant::now(), last_completion) {
                self.last_signal = Some((last_completion, bucket));
                let nudge = self.state.stall().pulse();
                report.pulses += 1;
                report.last_pulse = Some(nudge.at);
                tracing::info!(
                    active,
                    idle_secs = nudge.at.duration_since(last_completion).as_secs(),
                    seq = nudge.seq,
                    "stall detected, nudging waiting retries"
                );
            }
        }
        report
    }

    /// Returns the idle bucket to signal for, if a pulse is due now.
    fn due(&self, active: usize, now: Instant, last_completion: Instant) -> Option<u128> {
        if active == 0 || active > self.config.max_in_flight {
            return None;
        }
        let idle = now.duration_since(last_completion);
        if idle <= self.config.idle_threshold {
            return None;
        }
        let bucket = idle.as_millis() / self.config.interval.as_millis().max(1);
        match self.last_signal {
            Some((at, signalled)) if at == last_completion && signalled >= bucket => None,
            _ => Some(bucket),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WaitOutcome;

    fn watchdog(state: &Arc<DispatchState>) -> StallWatchdog {
        StallWatchdog::new(Arc::clone(state), WatchdogConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn due_only_in_tail_of_run() {
        let state = Arc::new(DispatchState::new(Duration::from_millis(500)));
        let dog = watchdog(&state);
        let base = Instant::now();
        let later = base + Duration::from_secs(11);
        assert_eq!(dog.due(9, later, base), None);
        assert_eq!(dog.due(0, later, base), None);
        assert_eq!(dog.due(8, later, base), Some(1));
        assert_eq!(dog.due(1, base + Duration::from_secs(10), base), None);
    }

    #[tokio::test(start_paused = true)]
    async fn each_idle_boundary_is_signalled_once() {
        let state = Arc::new(DispatchState::new(Duration::from_millis(500)));
        let mut dog = watchdog(&state);
        let base = Instant::now();
        dog.last_signal = Some((base, 1));
        assert_eq!(dog.due(2, base + Duration::from_secs(15), base), None);
        assert_eq!(dog.due(2, base + Duration::from_secs(20), base), Some(2));

        // A fresh completion resets the boundaries.
        let completed = base + Duration::from_secs(18);
        assert_eq!(dog.due(2, completed + Duration::from_secs(11), completed), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn exits_when_nothing_in_flight() {
        let state = Arc::new(DispatchState::new(Duration::from_millis(500)));
        let report = watchdog(&state).run().await;
        assert_eq!(report.pulses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_tail_job_is_nudged_within_eleven_seconds() {
        let state = Arc::new(DispatchState::new(Duration::from_millis(500)));
        state.admit("simple_7");
        let start = Instant::now();

        let handle = watchdog(&state).spawn();
        let outcome = state.stall().wait(Duration::from_secs(65)).await;
        let WaitOutcome::Nudged(at) = outcome else {
            panic!("expected a nudge, got {outcome:?}");
        };
        let waited = at.duration_since(start);
        assert!(waited > Duration::from_secs(10));
        assert!(waited <= Duration::from_secs(11));

        // Next pulse lands on the following ten-second boundary.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = state.stall().wait(Duration::from_secs(65)).await;
        let WaitOutcome::Nudged(at) = second else {
            panic!("expected a second nudge");
        };
        assert_eq!(at.duration_since(start), Duration::from_secs(20));

        state.finish("simple_7", None);
        let report = handle.await.unwrap();
        assert_eq!(report.pulses, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_run_is_never_nudged() {
        let state = Arc::new(DispatchState::new(Duration::from_millis(500)));
        for i in 0..20 {
            state.admit(&format!("simple_{i}"));
        }
        let handle = watchdog(&state).spawn();
        let outcome = state.stall().wait(Duration::from_secs(65)).await;
        assert_eq!(outcome, WaitOutcome::Elapsed);

        for i in 0..20 {
            state.finish(&format!("simple_{i}"), None);
        }
        assert_eq!(handle.await.unwrap().pulses, 0);
    }
}
