use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tb_shared::{ClientError, RateLimitsConfig, Result};
use tokio::time::Instant;
use tracing::{debug, warn};

const MIN_RETRY_PAUSE: Duration = Duration::from_millis(10);

/// One `capacity:duration` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitWindow {
    pub capacity: u64,
    pub duration: Duration,
}

/// Parses `capacity:duration[,capacity:duration...]` (durations in seconds,
/// `,` or `;` separated). Returns `None` when any pair is malformed.
/// Pairs with zero capacity or zero duration are dropped, so `0:0,` yields
/// no windows at all.
pub fn parse_rate_limit(spec: &str) -> Option<Vec<RateLimitWindow>> {
    let mut windows = Vec::new();

    for pair in spec.split([',', ';']).map(str::trim).filter(|p| !p.is_empty()) {
        let (capacity, duration) = pair.split_once(':')?;
        let capacity: u64 = capacity.trim().parse().ok()?;
        let duration: u64 = duration.trim().parse().ok()?;

        if capacity == 0 || duration == 0 {
            continue;
        }

        windows.push(RateLimitWindow {
            capacity,
            duration: Duration::from_secs(duration),
        });
    }

    // finest-grained first
    windows.sort_by_key(|w| w.duration);
    windows.dedup_by(|later, earlier| {
        if later.duration == earlier.duration {
            earlier.capacity = earlier.capacity.min(later.capacity);
            true
        } else {
            false
        }
    });

    Some(windows)
}

#[derive(Debug, Clone)]
struct WindowState {
    window: RateLimitWindow,
    counter: u64,
    start: Instant,
}

impl WindowState {
    fn refresh(&mut self, now: Instant) {
        if now.duration_since(self.start) >= self.window.duration {
            self.start = now;
            self.counter = 0;
        }
    }

    fn fits(&self, amount: u64) -> bool {
        self.counter.saturating_add(amount) <= self.window.capacity
    }
}

/// Snapshot of a limiter, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStats {
    pub name: String,
    pub windows: Vec<(RateLimitWindow, u64)>,
}

/// Sliding set of reset-on-expiry windows for one traffic category.
#[derive(Debug)]
pub struct RateLimit {
    name: String,
    percentage: u64,
    spec: Mutex<String>,
    windows: Mutex<Vec<WindowState>>,
}

impl RateLimit {
    pub fn new(name: impl Into<String>, spec: &str) -> Self {
        Self::with_percentage(name, spec, 100)
    }

    /// `percentage` scales every capacity down, keeping a margin below the
    /// server quota.
    pub fn with_percentage(name: impl Into<String>, spec: &str, percentage: u64) -> Self {
        let limit = Self {
            name: name.into(),
            percentage: percentage.clamp(1, 100),
            spec: Mutex::new(String::new()),
            windows: Mutex::new(Vec::new()),
        };
        limit.set_limit(spec);
        limit
    }

    pub fn unlimited(name: impl Into<String>) -> Self {
        Self::new(name, tb_shared::NO_LIMIT)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The last configuration string applied, as received.
    pub fn spec(&self) -> String {
        self.spec.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<WindowState>> {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replaces the configuration. Counters of surviving windows are kept
    /// index by index; windows beyond the new count are discarded.
    pub fn set_limit(&self, spec: &str) {
        let parsed = match parse_rate_limit(spec) {
            Some(windows) => windows,
            None => {
                warn!("Invalid rate limit '{}' for {}, treating as no limit", spec, self.name);
                Vec::new()
            }
        };

        *self.spec.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = spec.to_string();

        let now = Instant::now();
        let mut windows = self.lock();
        let previous = std::mem::take(&mut *windows);

        *windows = parsed
            .into_iter()
            .enumerate()
            .map(|(index, mut window)| {
                window.capacity = (window.capacity.saturating_mul(self.percentage) / 100).max(1);
                match previous.get(index) {
                    Some(old) => WindowState { window, counter: old.counter, start: old.start },
                    None => WindowState { window, counter: 0, start: now },
                }
            })
            .collect();

        debug!("Rate limit {} set to {:?}", self.name, windows.iter().map(|w| w.window).collect::<Vec<_>>());
    }

    pub fn has_limit(&self) -> bool {
        !self.lock().is_empty()
    }

    pub fn windows(&self) -> Vec<RateLimitWindow> {
        self.lock().iter().map(|w| w.window).collect()
    }

    /// Largest amount a single admission can ever request.
    pub fn max_admissible(&self) -> Option<u64> {
        self.lock().iter().map(|w| w.window.capacity).min()
    }

    /// Admits `amount` if every window has room, incrementing all of them.
    pub fn try_admit(&self, amount: u64) -> bool {
        admit_together(&[(self, amount)])
    }

    /// Waits up to `wait` for room for `amount`.
    pub async fn acquire(&self, amount: u64, wait: Duration) -> Result<()> {
        acquire_together(&[(self, amount)], wait).await
    }

    /// Time until the earliest window that holds traffic resets.
    pub fn time_to_next_reset(&self) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .iter()
            .filter(|w| w.counter > 0)
            // a window too long to represent never resets
            .filter_map(|w| w.start.checked_add(w.window.duration))
            .map(|end| end.saturating_duration_since(now))
            .min()
    }

    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            name: self.name.clone(),
            windows: self.lock().iter().map(|w| (w.window, w.counter)).collect(),
        }
    }
}

/// All-or-nothing admission across several limiters. Locks are taken in
/// slice order; callers keep a consistent order and never pass the same
/// limiter twice.
pub fn admit_together(requests: &[(&RateLimit, u64)]) -> bool {
    let now = Instant::now();
    let mut guards: Vec<MutexGuard<'_, Vec<WindowState>>> =
        requests.iter().map(|(limit, _)| limit.lock()).collect();

    for guard in guards.iter_mut() {
        guard.iter_mut().for_each(|w| w.refresh(now));
    }

    let admitted = guards
        .iter()
        .zip(requests)
        .all(|(windows, (_, amount))| windows.iter().all(|w| w.fits(*amount)));

    if admitted {
        for (windows, (_, amount)) in guards.iter_mut().zip(requests) {
            windows.iter_mut().for_each(|w| w.counter = w.counter.saturating_add(*amount));
        }
    }

    admitted
}

/// Cooperative wait: retries admission until it succeeds or `wait` elapses.
pub async fn acquire_together(requests: &[(&RateLimit, u64)], wait: Duration) -> Result<()> {
    for (limit, amount) in requests {
        if let Some(max) = limit.max_admissible() {
            if *amount > max {
                return Err(ClientError::RateLimitExceeded(format!(
                    "{} requested {} but the smallest window allows {}",
                    limit.name(),
                    amount,
                    max
                )));
            }
        }
    }

    // None when the wait is too long to represent
    let deadline = Instant::now().checked_add(wait);

    loop {
        if admit_together(requests) {
            return Ok(());
        }

        let now = Instant::now();
        if deadline.is_some_and(|deadline| now >= deadline) {
            let names: Vec<&str> = requests.iter().map(|(l, _)| l.name()).collect();
            return Err(ClientError::RateLimitExceeded(names.join(", ")));
        }

        let pause = requests
            .iter()
            .filter_map(|(limit, _)| limit.time_to_next_reset())
            .min()
            .unwrap_or(MIN_RETRY_PAUSE)
            .max(MIN_RETRY_PAUSE)
            .min(deadline.map_or(Duration::MAX, |deadline| deadline - now));

        debug!("Rate limited, retrying in {:?}", pause);
        tokio::time::sleep(pause).await;
    }
}

/// Categories of outgoing traffic the server meters separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficCategory {
    Messages,
    TelemetryMessages,
    TelemetryDatapoints,
}

/// The three limiters metering one traffic source.
#[derive(Debug)]
pub struct RateLimits {
    pub messages: RateLimit,
    pub telemetry_messages: RateLimit,
    pub telemetry_datapoints: RateLimit,
}

impl RateLimits {
    pub fn new(prefix: &str, messages: &str, telemetry: &str, datapoints: &str, percentage: u64) -> Self {
        Self {
            messages: RateLimit::with_percentage(format!("{}messages", prefix), messages, percentage),
            telemetry_messages: RateLimit::with_percentage(format!("{}telemetry messages", prefix), telemetry, percentage),
            telemetry_datapoints: RateLimit::with_percentage(format!("{}telemetry datapoints", prefix), datapoints, percentage),
        }
    }

    pub fn unlimited(prefix: &str) -> Self {
        let no_limit = tb_shared::NO_LIMIT;
        Self::new(prefix, no_limit, no_limit, no_limit, 100)
    }

    pub fn get(&self, category: TrafficCategory) -> &RateLimit {
        match category {
            TrafficCategory::Messages => &self.messages,
            TrafficCategory::TelemetryMessages => &self.telemetry_messages,
            TrafficCategory::TelemetryDatapoints => &self.telemetry_datapoints,
        }
    }

    pub fn try_admit(&self, category: TrafficCategory, amount: u64) -> bool {
        self.get(category).try_admit(amount)
    }

    /// Applies the limits present in a server push; absent fields stay as they are.
    pub fn apply(&self, config: &RateLimitsConfig) {
        if let Some(messages) = &config.messages {
            self.messages.set_limit(messages);
        }
        if let Some(telemetry) = &config.telemetry_messages {
            self.telemetry_messages.set_limit(telemetry);
        }
        if let Some(datapoints) = &config.telemetry_data_points {
            self.telemetry_datapoints.set_limit(datapoints);
        }
    }

    /// Admission set for one telemetry publish.
    pub fn telemetry_request(&self, datapoints: u64) -> [(&RateLimit, u64); 3] {
        [
            (&self.messages, 1),
            (&self.telemetry_messages, 1),
            (&self.telemetry_datapoints, datapoints),
        ]
    }

    /// Admission set for any other publish.
    pub fn message_request(&self) -> [(&RateLimit, u64); 1] {
        [(&self.messages, 1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rate_limit() {
        let windows = parse_rate_limit("60:60,10:1,").unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0], RateLimitWindow { capacity: 10, duration: Duration::from_secs(1) });
        assert_eq!(windows[1].duration, Duration::from_secs(60));
    }

    #[test]
    fn test_parse_no_limit_and_garbage() {
        assert_eq!(parse_rate_limit("0:0,"), Some(vec![]));
        assert_eq!(RateLimit::new("dp", "0:0,").spec(), "0:0,");
        assert_eq!(parse_rate_limit(""), Some(vec![]));
        assert_eq!(parse_rate_limit("ten:1"), None);
        assert_eq!(parse_rate_limit("10"), None);
    }

    #[test]
    fn test_no_limit_always_admits() {
        let limit = RateLimit::new("dp", "0:0,");
        assert!(!limit.has_limit());
        for _ in 0..10_000 {
            assert!(limit.try_admit(100));
        }

        let garbage = RateLimit::new("garbage", "not-a-limit");
        assert!(!garbage.has_limit());
        assert!(garbage.try_admit(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_exactly_capacity() {
        let limit = RateLimit::new("messages", "10:20");
        for _ in 0..10 {
            assert!(limit.try_admit(1));
        }
        assert!(!limit.try_admit(1));

        tokio::time::advance(Duration::from_secs(19)).await;
        assert!(!limit.try_admit(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limit.try_admit(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_window_must_have_room() {
        let limit = RateLimit::new("messages", "2:1,3:10");
        assert!(limit.try_admit(1));
        assert!(limit.try_admit(1));
        assert!(!limit.try_admit(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limit.try_admit(1));
        // the 10 second window is exhausted now
        assert!(!limit.try_admit(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfiguration_preserves_counters() {
        let limit = RateLimit::new("messages", "5:1,10:60");
        assert!(limit.try_admit(4));

        limit.set_limit("5:1");
        let stats = limit.stats();
        assert_eq!(stats.windows.len(), 1);
        assert_eq!(stats.windows[0].1, 4);
        assert!(limit.try_admit(1));
        assert!(!limit.try_admit(1));
    }

    #[test]
    fn test_percentage_scales_capacity() {
        let limit = RateLimit::with_percentage("messages", "10:1", 80);
        assert_eq!(limit.max_admissible(), Some(8));
        let tiny = RateLimit::with_percentage("messages", "1:1", 50);
        assert_eq!(tiny.max_admissible(), Some(1));
    }

    #[test]
    fn test_huge_capacity_saturates() {
        let limit = RateLimit::with_percentage("messages", "18446744073709551615:1", 80);
        assert_eq!(limit.max_admissible(), Some(u64::MAX / 100));
        assert!(limit.try_admit(u64::MAX / 100));
        assert!(!limit.try_admit(u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_window_never_resets() {
        let limit = RateLimit::new("messages", "1:18446744073709551615");
        assert!(limit.try_admit(1));
        assert_eq!(limit.time_to_next_reset(), None);

        let result = limit.acquire(1, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ClientError::RateLimitExceeded(_))));
    }

    #[test]
    fn test_admit_together_is_all_or_nothing() {
        let messages = RateLimit::new("messages", "10:60");
        let datapoints = RateLimit::new("datapoints", "5:60");

        assert!(admit_together(&[(&messages, 1), (&datapoints, 5)]));
        assert!(!admit_together(&[(&messages, 1), (&datapoints, 1)]));
        assert_eq!(messages.stats().windows[0].1, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_window_reset() {
        let limit = RateLimit::new("messages", "1:1");
        assert!(limit.try_admit(1));

        let started = Instant::now();
        limit.acquire(1, Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up() {
        let limit = RateLimit::new("messages", "1:60");
        assert!(limit.try_admit(1));

        let result = acquire_together(&[(&limit, 1)], Duration::from_secs(2)).await;
        assert!(matches!(result, Err(ClientError::RateLimitExceeded(_))));

        let oversized = acquire_together(&[(&limit, 5)], Duration::from_secs(2)).await;
        assert!(matches!(oversized, Err(ClientError::RateLimitExceeded(_))));
    }

    #[test]
    fn test_rate_limits_apply() {
        let limits = RateLimits::unlimited("");
        limits.apply(&RateLimitsConfig {
            messages: Some("10:20".into()),
            telemetry_messages: None,
            telemetry_data_points: Some("50:60".into()),
        });
        assert!(limits.messages.has_limit());
        assert!(!limits.telemetry_messages.has_limit());
        assert_eq!(limits.get(TrafficCategory::TelemetryDatapoints).max_admissible(), Some(50));
        assert!(limits.try_admit(TrafficCategory::Messages, 10));
        assert!(!limits.try_admit(TrafficCategory::Messages, 1));
    }
}
