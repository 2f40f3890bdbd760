//! Per-user quota enforcement tick (C6): notifications, grace period,
//! termination, and account-lock reconciliation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Datelike, NaiveTime, Weekday};
use chrono_tz::Tz;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{info, warn};

use crate::agent_registry::AgentRegistry;
use crate::clock::TimeProvider;
use crate::command_runner::CommandRunner;
use crate::config::ManagedUser;
use crate::error::EnforceError;
use crate::session_tracker::SessionTracker;

const THROTTLE_INTERVAL: StdDuration = StdDuration::from_secs(30);
const THROTTLE_DELTA_MINUTES: f64 = 1.0;
const TICK_INTERVAL: StdDuration = StdDuration::from_secs(10);
const TERMINATE_DEADLINE: StdDuration = StdDuration::from_secs(15);
const GRACE_STEP: StdDuration = StdDuration::from_secs(60);

const HIGH_TIER_COOLDOWN: StdDuration = StdDuration::from_secs(5 * 60);
const LOW_TIER_COOLDOWN: StdDuration = StdDuration::from_secs(60);

struct UserState {
    last_check: std::time::Instant,
    last_remaining: f64,
    tier_last_sent: HashMap<i64, std::time::Instant>,
    in_grace: bool,
    grace_handle: Option<AbortHandle>,
    /// Bonus-pool minutes drawn down at grace entry today. The pool is
    /// consumed in full, once, so this is either 0 or `bonus_pool_minutes`.
    bonus_consumed_minutes: u32,
}

impl Default for UserState {
    fn default() -> Self {
        Self {
            last_check: std::time::Instant::now() - THROTTLE_INTERVAL - StdDuration::from_secs(1),
            last_remaining: f64::INFINITY,
            tier_last_sent: HashMap::new(),
            in_grace: false,
            grace_handle: None,
            bonus_consumed_minutes: 0,
        }
    }
}

pub struct Enforcer {
    clock: Arc<dyn TimeProvider>,
    tracker: Arc<SessionTracker>,
    agents: Arc<AgentRegistry>,
    runner: Arc<dyn CommandRunner>,
    states: Mutex<HashMap<String, UserState>>,
}

impl Enforcer {
    pub fn new(
        clock: Arc<dyn TimeProvider>,
        tracker: Arc<SessionTracker>,
        agents: Arc<AgentRegistry>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            clock,
            tracker,
            agents,
            runner,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Clears all per-user cached tick state; called on daily rollover.
    pub async fn reset_all(&self) {
        self.states.lock().await.clear();
    }

    /// Bonus-pool minutes consumed by `username` since the last rollover.
    /// Read by the supervisor's rollover before calling `reset_all`, since
    /// that call clears this state back to zero.
    pub async fn bonus_consumed_minutes(&self, username: &str) -> u32 {
        self.states
            .lock()
            .await
            .get(username)
            .map(|s| s.bonus_consumed_minutes)
            .unwrap_or(0)
    }

    /// Runs one tick for `username`. No-op if throttled or already in
    /// grace (the grace task owns the user until it completes).
    pub async fn tick(&self, username: &str, user: &ManagedUser, timezone: Tz) -> Result<(), EnforceError> {
        let mut states = self.states.lock().await;
        let state = states.entry(username.to_string()).or_default();

        if state.in_grace {
            return Ok(());
        }

        let remaining = self
            .tracker
            .remaining_minutes(username, user, timezone, &default_reset_time())
            .await
            .map_err(|e| EnforceError::TerminateFailed {
                user: username.to_string(),
                reason: e.to_string(),
            })?;

        let now = std::time::Instant::now();
        let throttled = now.duration_since(state.last_check) < THROTTLE_INTERVAL
            && (remaining - state.last_remaining).abs() < THROTTLE_DELTA_MINUTES;
        if throttled {
            return Ok(());
        }
        state.last_check = now;
        state.last_remaining = remaining;

        if remaining.is_finite() {
            if let Some(tier) = notification_tier(remaining) {
                let cooldown = tier_cooldown(tier);
                let send = state
                    .tier_last_sent
                    .get(&tier)
                    .map(|last| now.duration_since(*last) >= cooldown)
                    .unwrap_or(true);
                if send {
                    state.tier_last_sent.insert(tier, now);
                    let category = tier_category(tier);
                    let message = tier_message(tier);
                    drop(states);
                    self.agents.notify(username, &message, category).await;
                    states = self.states.lock().await;
                }
            }
        }

        let state = states.get_mut(username).expect("entry inserted above");

        if remaining <= 0.0 {
            if !state.in_grace {
                state.in_grace = true;
                state.bonus_consumed_minutes = user.bonus_pool_minutes;
                let handle = self.spawn_grace(username.to_string(), user.grace_minutes, user.bonus_pool_minutes);
                state.grace_handle = Some(handle);
            }
        } else if !is_within_curfew(user, self.clock.now_in_timezone(timezone).time(), self.clock.now_in_timezone(timezone).weekday()) {
            self.unlock_account(username).await?;
        }

        if remaining <= 0.0 {
            self.lock_account(username).await?;
        }

        Ok(())
    }

    fn spawn_grace(&self, username: String, grace_minutes: u32, bonus_pool_minutes: u32) -> AbortHandle {
        let agents = self.agents.clone();
        let runner = self.runner.clone();
        let states_absent_marker = username.clone();
        let total_minutes = grace_minutes + bonus_pool_minutes;

        let handle = tokio::spawn(async move {
            agents.notify(&username, "Your screen time is over.", "critical").await;
            let mut remaining = total_minutes;
            while remaining > 0 {
                tokio::time::sleep(GRACE_STEP).await;
                agents
                    .notify(&username, &format!("{remaining} minutes of grace left"), "critical")
                    .await;
                remaining -= 1;
            }
            let _ = terminate_sessions(&runner, &username).await;
        });
        let abort_handle = handle.abort_handle();
        let _ = states_absent_marker;
        abort_handle
    }

    /// Cancels an in-progress grace period without terminating the
    /// session, e.g. after an admin quota reset or bonus-time grant.
    pub async fn cancel_grace(&self, username: &str) {
        let mut states = self.states.lock().await;
        if let Some(state) = states.get_mut(username) {
            if let Some(handle) = state.grace_handle.take() {
                handle.abort();
            }
            state.in_grace = false;
        }
    }

    async fn lock_account(&self, username: &str) -> Result<(), EnforceError> {
        let out = self
            .runner
            .run("usermod", &["-L", username], StdDuration::from_secs(10))
            .await
            .map_err(|e| EnforceError::LockFailed {
                user: username.to_string(),
                reason: e.to_string(),
            })?;
        if !out.status_success {
            warn!(username, stderr = %out.stderr, "account lock command failed");
        }
        Ok(())
    }

    async fn unlock_account(&self, username: &str) -> Result<(), EnforceError> {
        let out = self
            .runner
            .run("usermod", &["-U", username], StdDuration::from_secs(10))
            .await
            .map_err(|e| EnforceError::UnlockFailed {
                user: username.to_string(),
                reason: e.to_string(),
            })?;
        if !out.status_success {
            warn!(username, stderr = %out.stderr, "account unlock command failed");
        }
        Ok(())
    }
}

async fn terminate_sessions(runner: &Arc<dyn CommandRunner>, username: &str) -> Result<(), EnforceError> {
    let result = runner
        .run("loginctl", &["terminate-user", username], TERMINATE_DEADLINE)
        .await;
    match result {
        Ok(out) if out.status_success => {
            info!(username, "terminated sessions after grace expiry");
            Ok(())
        }
        Ok(out) => {
            warn!(username, stderr = %out.stderr, "termination command reported failure");
            Err(EnforceError::TerminateFailed {
                user: username.to_string(),
                reason: out.stderr,
            })
        }
        Err(e) => {
            warn!(username, error = %e, "termination command failed or timed out");
            Err(EnforceError::TerminateFailed {
                user: username.to_string(),
                reason: e.to_string(),
            })
        }
    }
}

/// Tier identifiers: 15, 10, 5, 4, 3, 2, 1. `T0` is handled separately as
/// the grace-entry transition and has no notification tier of its own.
fn notification_tier(remaining: f64) -> Option<i64> {
    let floor = remaining.floor() as i64;
    match floor {
        15 | 10 | 5 | 4 | 3 | 2 | 1 => Some(floor),
        _ => None,
    }
}

fn tier_cooldown(tier: i64) -> StdDuration {
    match tier {
        15 | 10 | 5 => HIGH_TIER_COOLDOWN,
        _ => LOW_TIER_COOLDOWN,
    }
}

fn tier_category(tier: i64) -> &'static str {
    match tier {
        15 => "info",
        10 | 5 => "warning",
        _ => "critical",
    }
}

fn tier_message(tier: i64) -> String {
    format!("{tier} minutes of screen time remaining")
}

fn default_reset_time() -> String {
    "03:00".to_string()
}

/// Whether `now` (local time, given weekday) falls inside one of `user`'s
/// configured curfew windows.
fn is_within_curfew(user: &ManagedUser, now: NaiveTime, weekday: Weekday) -> bool {
    let day_key = weekday_key(weekday);
    let Some(window) = user.curfew.get(day_key) else {
        return false;
    };
    let Some((start, end)) = window.split_once('-') else {
        return false;
    };
    let (Ok(start), Ok(end)) = (parse_hhmm(start), parse_hhmm(end)) else {
        return false;
    };
    if start <= end {
        now >= start && now < end
    } else {
        // Overnight window, e.g. 22:00-06:00.
        now >= start || now < end
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime, ()> {
    let (h, m) = s.split_once(':').ok_or(())?;
    NaiveTime::from_hms_opt(h.parse().map_err(|_| ())?, m.parse().map_err(|_| ())?, 0).ok_or(())
}

fn weekday_key(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}
