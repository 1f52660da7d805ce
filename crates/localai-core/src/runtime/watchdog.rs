//! Eviction policy for idle and stuck backends.
//!
//! The policy is a pure function over activity snapshots so it can be tested
//! without processes; [`super::ModelLoader`] runs it on a timer.

use super::ProcessState;
use crate::config::RuntimeConfig;
use std::time::{Duration, Instant};

/// Watchdog and memory-pressure settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogOptions {
    /// Evict backends idle longer than `idle_timeout`.
    pub idle_check: bool,
    /// Evict backends stuck in one request longer than `busy_timeout`.
    pub busy_check: bool,
    pub idle_timeout: Duration,
    pub busy_timeout: Duration,
    /// How often the registry is scanned.
    pub interval: Duration,
    /// Maximum concurrently loaded models; `0` means unlimited.
    pub lru_limit: usize,
    /// Allow LRU eviction of a busy backend when no idle one is left.
    pub force_eviction_when_busy: bool,
}

impl Default for WatchdogOptions {
    fn default() -> Self {
        Self {
            idle_check: false,
            busy_check: false,
            idle_timeout: RuntimeConfig::WATCHDOG_IDLE_TIMEOUT,
            busy_timeout: RuntimeConfig::WATCHDOG_BUSY_TIMEOUT,
            interval: RuntimeConfig::WATCHDOG_INTERVAL,
            lru_limit: 0,
            force_eviction_when_busy: false,
        }
    }
}

impl WatchdogOptions {
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_check = true;
        self.idle_timeout = timeout;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_check = true;
        self.busy_timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_lru_limit(mut self, limit: usize) -> Self {
        self.lru_limit = limit;
        self
    }

    pub fn with_force_eviction_when_busy(mut self, force: bool) -> Self {
        self.force_eviction_when_busy = force;
        self
    }

    /// Whether the periodic scan has anything to do.
    pub fn is_enabled(&self) -> bool {
        self.idle_check || self.busy_check
    }
}

/// What the watchdog needs to know about one backend.
#[derive(Debug, Clone)]
pub struct ActivitySnapshot {
    pub name: String,
    pub state: ProcessState,
    pub last_used: Instant,
    pub request_started: Option<Instant>,
}

/// Names of backends that should be stopped at `now`.
pub fn collect_expired(
    options: &WatchdogOptions,
    snapshots: &[ActivitySnapshot],
    now: Instant,
) -> Vec<String> {
    snapshots
        .iter()
        .filter(|snapshot| match snapshot.state {
            ProcessState::Ready | ProcessState::Idle => {
                options.idle_check
                    && now.saturating_duration_since(snapshot.last_used) > options.idle_timeout
            }
            ProcessState::Busy => {
                options.busy_check
                    && snapshot
                        .request_started
                        .map(|started| now.saturating_duration_since(started) > options.busy_timeout)
                        .unwrap_or(false)
            }
            ProcessState::Failed => true,
            ProcessState::Loading | ProcessState::Stopped => false,
        })
        .map(|snapshot| snapshot.name.clone())
        .collect()
}

/// Pick the least recently used backend to make room, preferring idle ones.
pub fn lru_victim(options: &WatchdogOptions, snapshots: &[ActivitySnapshot]) -> Option<String> {
    let oldest = |busy: bool| {
        snapshots
            .iter()
            .filter(|s| match s.state {
                ProcessState::Ready | ProcessState::Idle | ProcessState::Failed => !busy,
                ProcessState::Busy => busy,
                ProcessState::Loading | ProcessState::Stopped => false,
            })
            .min_by_key(|s| s.last_used)
            .map(|s| s.name.clone())
    };

    oldest(false).or_else(|| {
        if options.force_eviction_when_busy {
            oldest(true)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(name: &str, state: ProcessState, idle: u64, busy: Option<u64>, now: Instant) -> ActivitySnapshot {
        ActivitySnapshot {
            name: name.to_string(),
            state,
            last_used: now - Duration::from_secs(idle),
            request_started: busy.map(|b| now - Duration::from_secs(b)),
        }
    }

    #[test]
    fn test_idle_and_busy_expiry() {
        let now = Instant::now() + Duration::from_secs(3600);
        let options = WatchdogOptions::default()
            .with_idle_timeout(Duration::from_secs(60))
            .with_busy_timeout(Duration::from_secs(30));
        let snapshots = vec![
            snapshot("fresh", ProcessState::Idle, 10, None, now),
            snapshot("stale", ProcessState::Idle, 120, None, now),
            snapshot("never-used", ProcessState::Ready, 61, None, now),
            snapshot("working", ProcessState::Busy, 500, Some(5), now),
            snapshot("stuck", ProcessState::Busy, 500, Some(45), now),
            snapshot("starting", ProcessState::Loading, 9999, None, now),
        ];

        let expired = collect_expired(&options, &snapshots, now);
        assert_eq!(expired, vec!["stale", "never-used", "stuck"]);
    }

    #[test]
    fn test_checks_are_independent() {
        let now = Instant::now() + Duration::from_secs(3600);
        let snapshots = vec![
            snapshot("stale", ProcessState::Idle, 120, None, now),
            snapshot("stuck", ProcessState::Busy, 500, Some(500), now),
        ];

        let idle_only = WatchdogOptions::default().with_idle_timeout(Duration::from_secs(60));
        assert_eq!(collect_expired(&idle_only, &snapshots, now), vec!["stale"]);

        let busy_only = WatchdogOptions::default().with_busy_timeout(Duration::from_secs(60));
        assert_eq!(collect_expired(&busy_only, &snapshots, now), vec!["stuck"]);

        assert!(!WatchdogOptions::default().is_enabled());
    }

    #[test]
    fn test_lru_victim() {
        let now = Instant::now() + Duration::from_secs(3600);
        let snapshots = vec![
            snapshot("a", ProcessState::Busy, 300, Some(1), now),
            snapshot("b", ProcessState::Idle, 100, None, now),
            snapshot("c", ProcessState::Idle, 200, None, now),
        ];
        let options = WatchdogOptions::default().with_lru_limit(2);
        assert_eq!(lru_victim(&options, &snapshots).as_deref(), Some("c"));

        let busy = vec![snapshot("a", ProcessState::Busy, 300, Some(1), now)];
        assert_eq!(lru_victim(&options, &busy), None);
        let forced = options.with_force_eviction_when_busy(true);
        assert_eq!(lru_victim(&forced, &busy).as_deref(), Some("a"));
    }
}
