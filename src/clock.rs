//! Time abstraction for guardian-daemon.
//!
//! Everything that measures session duration or evaluates curfews goes
//! through a [`TimeProvider`] rather than calling `Utc::now()` directly, so
//! tests can advance a mock clock deterministically instead of sleeping.

use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// An opaque point on the monotonic timeline. Only subtraction (elapsed
/// time between two readings) is meaningful; the absolute value carries no
/// information on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MonotonicInstant(StdDuration);

impl std::ops::Sub for MonotonicInstant {
    type Output = StdDuration;

    fn sub(self, earlier: Self) -> StdDuration {
        self.0.saturating_sub(earlier.0)
    }
}

/// Trait for providing time functionality; enables dependency injection and
/// deterministic tests.
pub trait TimeProvider: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;

    /// Monotonic reading, immune to wall-clock adjustments, used for
    /// duration accounting.
    fn now_monotonic(&self) -> MonotonicInstant;

    fn now_in_timezone(&self, timezone: Tz) -> DateTime<Tz> {
        self.now_utc().with_timezone(&timezone)
    }

    fn to_timezone(&self, utc_time: &DateTime<Utc>, timezone: Tz) -> DateTime<Tz> {
        utc_time.with_timezone(&timezone)
    }

    fn now_timestamp(&self) -> i64 {
        self.now_utc().timestamp()
    }

    /// Local date in `timezone`, used as the accounting/rollover boundary.
    fn today_in(&self, timezone: Tz) -> chrono::NaiveDate {
        self.now_in_timezone(timezone).date_naive()
    }
}

/// Production time source: wall clock via `chrono::Utc::now`, monotonic via
/// `std::time::Instant` measured from process start.
#[derive(Debug, Clone)]
pub struct SystemTimeProvider {
    started_at: Instant,
}

impl SystemTimeProvider {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }
}

impl Default for SystemTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for SystemTimeProvider {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn now_monotonic(&self) -> MonotonicInstant {
        MonotonicInstant(self.started_at.elapsed())
    }
}

struct MockState {
    wall: DateTime<Utc>,
    monotonic: StdDuration,
}

/// Deterministic clock for tests. `advance*` moves wall clock and monotonic
/// reading together, matching how a real clock behaves absent an NTP jump.
#[derive(Clone)]
pub struct MockTimeProvider {
    state: Arc<Mutex<MockState>>,
}

impl MockTimeProvider {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                wall: start_time,
                monotonic: StdDuration::ZERO,
            })),
        }
    }

    pub fn new_from_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn new_from_ymd_hms(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        min: u32,
        sec: u32,
    ) -> Result<Self, chrono::ParseError> {
        let start_time = Utc
            .with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .ok_or(chrono::ParseError::OutOfRange)?;
        Ok(Self::new(start_time))
    }

    pub fn set_time(&self, new_time: DateTime<Utc>) {
        let mut state = self.state.lock().expect("mock clock mutex poisoned");
        let delta = new_time - state.wall;
        state.wall = new_time;
        if delta > chrono::Duration::zero() {
            state.monotonic += delta.to_std().unwrap_or(StdDuration::ZERO);
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut state = self.state.lock().expect("mock clock mutex poisoned");
        state.wall += duration;
        if duration > chrono::Duration::zero() {
            state.monotonic += duration.to_std().unwrap_or(StdDuration::ZERO);
        }
    }

    pub fn advance_seconds(&self, seconds: i64) {
        self.advance(chrono::Duration::seconds(seconds));
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.advance(chrono::Duration::minutes(minutes));
    }

    pub fn advance_hours(&self, hours: i64) {
        self.advance(chrono::Duration::hours(hours));
    }

    pub fn advance_days(&self, days: i64) {
        self.advance(chrono::Duration::days(days));
    }

    pub fn current_time(&self) -> DateTime<Utc> {
        self.state.lock().expect("mock clock mutex poisoned").wall
    }
}

impl Default for MockTimeProvider {
    fn default() -> Self {
        Self::new_from_now()
    }
}

impl TimeProvider for MockTimeProvider {
    fn now_utc(&self) -> DateTime<Utc> {
        self.current_time()
    }

    fn now_monotonic(&self) -> MonotonicInstant {
        MonotonicInstant(self.state.lock().expect("mock clock mutex poisoned").monotonic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;

    #[test]
    fn system_time_provider_is_plausible() {
        let provider = SystemTimeProvider::new();
        let now = provider.now_utc();
        let system_now = Utc::now();
        assert!((system_now - now).num_seconds().abs() < 60);
    }

    #[test]
    fn mock_time_provider_reports_set_time() {
        let start = Utc.with_ymd_and_hms(2025, 1, 7, 10, 30, 0).single().unwrap();
        let provider = MockTimeProvider::new(start);
        assert_eq!(provider.now_utc(), start);
    }

    #[test]
    fn mock_monotonic_tracks_wall_clock_advances() {
        let provider = MockTimeProvider::new_from_now();
        let t0 = provider.now_monotonic();
        provider.advance_minutes(10);
        let t1 = provider.now_monotonic();
        assert_eq!(t1 - t0, StdDuration::from_secs(600));
    }

    #[test]
    fn timezone_conversion_preserves_instant() {
        let provider = SystemTimeProvider::new();
        let utc_time = provider.now_utc();
        let ny_time = provider.to_timezone(&utc_time, New_York);
        assert_eq!(utc_time, ny_time.with_timezone(&Utc));
    }

    #[test]
    fn today_in_uses_local_timezone() {
        let start = Utc.with_ymd_and_hms(2025, 1, 7, 2, 0, 0).single().unwrap();
        let provider = MockTimeProvider::new(start);
        // 02:00 UTC on Jan 7 is still Jan 6 in New York.
        assert_eq!(
            provider.today_in(New_York),
            chrono::NaiveDate::from_ymd_opt(2025, 1, 6).unwrap()
        );
    }
}
