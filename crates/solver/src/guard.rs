//! Capture spam protection.
//!
//! Three checks run in order before a capture may start: a single in-flight
//! capture, a burst limit over a sliding window, and a minimum spacing between
//! successful captures. An accepted request hands back a [`CapturePermit`];
//! dropping the permit releases the in-flight flag on every exit path, and
//! only [`CapturePermit::succeed`] records the completion time.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::CaptureConfig;
use crate::error::GuardError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardPolicy {
    pub min_interval: Duration,
    pub window: Duration,
    pub max_attempts: usize,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(500),
            window: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

impl From<&CaptureConfig> for GuardPolicy {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            min_interval: Duration::from_millis(config.min_interval_ms),
            window: Duration::from_secs(config.rate_limit_window_secs),
            max_attempts: config.max_attempts_per_window,
        }
    }
}

#[derive(Debug, Default)]
struct GuardState {
    capturing: bool,
    last_capture_at: Option<Instant>,
    recent_attempts: VecDeque<Instant>,
    /// Bumped on every acceptance and reset. A permit only touches state
    /// belonging to its own epoch.
    epoch: u64,
}

impl GuardState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.recent_attempts.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.recent_attempts.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Snapshot of the guard for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardStatus {
    pub capturing: bool,
    pub since_last_capture: Option<Duration>,
    pub attempts_in_window: usize,
    pub can_capture: bool,
    pub next_allowed_at: Option<Instant>,
}

/// Shared handle to the capture guard. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct CaptureGuard {
    policy: GuardPolicy,
    state: Arc<Mutex<GuardState>>,
}

impl Default for CaptureGuard {
    fn default() -> Self {
        Self::new(GuardPolicy::default())
    }
}

impl CaptureGuard {
    pub fn new(policy: GuardPolicy) -> Self {
        Self {
            policy,
            state: Arc::new(Mutex::new(GuardState::default())),
        }
    }

    pub fn policy(&self) -> GuardPolicy {
        self.policy
    }

    pub fn request_capture(&self) -> Result<CapturePermit, GuardError> {
        self.request_capture_at(Instant::now())
    }

    /// Like [`request_capture`](Self::request_capture) with an explicit clock
    /// reading.
    pub fn request_capture_at(&self, now: Instant) -> Result<CapturePermit, GuardError> {
        let mut state = self.state.lock();

        if state.capturing {
            warn!("Screenshot rejected: already capturing");
            return Err(GuardError::AlreadyInProgress);
        }

        state.prune(now, self.policy.window);
        if state.recent_attempts.len() >= self.policy.max_attempts {
            warn!(
                attempts = state.recent_attempts.len(),
                window_ms = self.policy.window.as_millis() as u64,
                "Screenshot rejected: rate limited"
            );
            return Err(GuardError::RateLimited {
                max_attempts: self.policy.max_attempts,
                window_secs: self.policy.window.as_secs(),
            });
        }

        if let Some(last) = state.last_capture_at {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.policy.min_interval {
                let remaining = self.policy.min_interval - elapsed;
                let wait_secs = (remaining.as_millis() as u64).div_ceil(1000);
                debug!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Screenshot rejected: throttled"
                );
                return Err(GuardError::Throttled { wait_secs });
            }
        }

        state.recent_attempts.push_back(now);
        state.capturing = true;
        state.epoch += 1;

        Ok(CapturePermit {
            state: Arc::clone(&self.state),
            epoch: state.epoch,
            released: false,
        })
    }

    pub fn is_capturing(&self) -> bool {
        self.state.lock().capturing
    }

    /// Forget in-flight and rate-limit bookkeeping. Outstanding permits become
    /// inert.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.capturing = false;
        state.last_capture_at = None;
        state.recent_attempts.clear();
        state.epoch += 1;
    }

    pub fn status(&self) -> GuardStatus {
        self.status_at(Instant::now())
    }

    pub fn status_at(&self, now: Instant) -> GuardStatus {
        let mut state = self.state.lock();
        state.prune(now, self.policy.window);

        let next_allowed_at = state.last_capture_at.map(|t| t + self.policy.min_interval);
        let throttled = next_allowed_at.is_some_and(|t| now < t);
        let rate_limited = state.recent_attempts.len() >= self.policy.max_attempts;

        GuardStatus {
            capturing: state.capturing,
            since_last_capture: state
                .last_capture_at
                .map(|t| now.saturating_duration_since(t)),
            attempts_in_window: state.recent_attempts.len(),
            can_capture: !state.capturing && !throttled && !rate_limited,
            next_allowed_at,
        }
    }
}

/// Proof that the guard accepted a capture. Must be held for the whole OS
/// capture; dropping it without calling [`succeed`](Self::succeed) marks the
/// attempt as failed.
#[derive(Debug)]
pub struct CapturePermit {
    state: Arc<Mutex<GuardState>>,
    epoch: u64,
    released: bool,
}

impl CapturePermit {
    pub fn succeed(self) {
        self.succeed_at(Instant::now());
    }

    pub fn succeed_at(mut self, at: Instant) {
        let mut state = self.state.lock();
        if state.epoch == self.epoch {
            state.capturing = false;
            state.last_capture_at = Some(at);
        }
        self.released = true;
    }
}

impl Drop for CapturePermit {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut state = self.state.lock();
        if state.epoch == self.epoch {
            state.capturing = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn second_request_while_capturing_is_rejected() {
        let guard = CaptureGuard::default();
        let t0 = Instant::now();

        let permit = guard.request_capture_at(t0).unwrap();
        assert!(guard.is_capturing());
        assert_eq!(
            guard.request_capture_at(t0).unwrap_err(),
            GuardError::AlreadyInProgress
        );

        drop(permit);
        assert!(!guard.is_capturing());
    }

    #[test]
    fn concurrent_requests_accept_exactly_one() {
        let guard = CaptureGuard::default();
        let barrier = Barrier::new(2);

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        // Keep the permit alive so the other thread sees it.
                        let result = guard.request_capture();
                        barrier.wait();
                        result.map(|_| ())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let accepted = results.iter().filter(|r| r.is_ok()).count();
        let in_progress = results
            .iter()
            .filter(|r| matches!(r, Err(GuardError::AlreadyInProgress)))
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(in_progress, 1);
    }

    #[test]
    fn failed_capture_does_not_start_throttle() {
        let guard = CaptureGuard::default();
        let t0 = Instant::now();

        drop(guard.request_capture_at(t0).unwrap());
        // No success recorded, so spacing does not apply.
        assert!(guard.request_capture_at(t0 + ms(10)).is_ok());
    }

    #[test]
    fn throttle_reports_remaining_whole_seconds() {
        let guard = CaptureGuard::default();
        let t0 = Instant::now();

        guard.request_capture_at(t0).unwrap().succeed_at(t0);
        assert_eq!(
            guard.request_capture_at(t0 + ms(200)).unwrap_err(),
            GuardError::Throttled { wait_secs: 1 }
        );
        assert!(guard.request_capture_at(t0 + ms(500)).is_ok());
    }

    #[test]
    fn rate_window_blocks_sixth_attempt_until_window_elapses() {
        let guard = CaptureGuard::default();
        let t0 = Instant::now();

        for i in 0..5 {
            let at = t0 + ms(600 * i);
            guard.request_capture_at(at).unwrap().succeed_at(at);
        }

        let sixth = t0 + ms(3_500);
        assert!(matches!(
            guard.request_capture_at(sixth),
            Err(GuardError::RateLimited { max_attempts: 5, window_secs: 10 })
        ));

        // Ten seconds after the earliest attempt it falls out of the window.
        assert!(guard.request_capture_at(t0 + ms(10_000)).is_ok());
    }

    #[test]
    fn rejections_do_not_record_attempts() {
        let guard = CaptureGuard::default();
        let t0 = Instant::now();

        guard.request_capture_at(t0).unwrap().succeed_at(t0);
        for _ in 0..10 {
            let _ = guard.request_capture_at(t0 + ms(100));
        }
        assert_eq!(guard.status_at(t0 + ms(100)).attempts_in_window, 1);
    }

    #[test]
    fn reset_makes_outstanding_permit_inert() {
        let guard = CaptureGuard::default();
        let t0 = Instant::now();

        let stale = guard.request_capture_at(t0).unwrap();
        guard.reset();
        let fresh = guard.request_capture_at(t0).unwrap();

        drop(stale);
        assert!(guard.is_capturing(), "stale permit must not release a new capture");
        drop(fresh);
        assert!(!guard.is_capturing());
    }

    #[test]
    fn status_reports_next_allowed_time() {
        let guard = CaptureGuard::default();
        let t0 = Instant::now();

        assert!(guard.status_at(t0).can_capture);
        guard.request_capture_at(t0).unwrap().succeed_at(t0);

        let status = guard.status_at(t0 + ms(100));
        assert!(!status.capturing);
        assert!(!status.can_capture);
        assert_eq!(status.next_allowed_at, Some(t0 + ms(500)));
        assert_eq!(status.since_last_capture, Some(ms(100)));
        assert!(guard.status_at(t0 + ms(600)).can_capture);
    }
}
