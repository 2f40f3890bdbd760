//! Session lifecycle tracking (C5): observes login-manager signals, keeps
//! the in-memory active-session table, tracks lock/unlock intervals, and
//! answers quota-accounting queries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{MonotonicInstant, TimeProvider};
use crate::config::{ManagedUser, PolicySnapshot};
use crate::error::StoreError;
use crate::store::Store;

const LOCK_DEDUP_WINDOW: StdDuration = StdDuration::from_secs(2);
const MIN_COUNTABLE_SESSION_SECONDS: i64 = 30;

/// Properties read off a `SessionNew` signal, after normalizing the `User`
/// property's two possible D-Bus shapes (tuple or bare uid).
#[derive(Debug, Clone)]
pub struct SessionProps {
    pub platform_session_id: String,
    pub username: String,
    pub uid: i64,
    pub desktop: String,
    pub service: String,
    pub class: String,
}

impl SessionProps {
    /// Ignored classes/services per the filtering rules in §4.3: anything
    /// that isn't an interactive user login session.
    fn is_trackable(&self) -> bool {
        if matches!(self.class.as_str(), "background" | "manager") {
            return false;
        }
        if matches!(self.service.as_str(), "systemd-user" | "runuser") {
            return false;
        }
        true
    }
}

struct LockEntry {
    interval_id: i64,
    opened_at: MonotonicInstant,
}

struct TrackedSession {
    username: String,
    store_id: i64,
    start_monotonic: MonotonicInstant,
    subtracted: StdDuration,
    open_lock: Option<LockEntry>,
    last_lock_event: Option<(bool, DateTime<Utc>)>,
}

/// Unique in-memory key: a short hash of the boot id, so that a platform
/// session id recycled across reboots never collides with a stale entry.
pub fn session_key(boot_id: &str, platform_session_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(boot_id.as_bytes());
    let digest = hasher.finalize();
    format!("{}:{}", hex::encode(&digest[..4]), platform_session_id)
}

pub struct SessionTracker {
    store: Store,
    clock: Arc<dyn TimeProvider>,
    boot_id: String,
    table: Mutex<HashMap<String, TrackedSession>>,
}

impl SessionTracker {
    pub fn new(store: Store, clock: Arc<dyn TimeProvider>, boot_id: String) -> Self {
        Self {
            store,
            clock,
            boot_id,
            table: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, platform_session_id: &str) -> String {
        session_key(&self.boot_id, platform_session_id)
    }

    /// Handles a `SessionNew` signal. No-op for non-trackable or
    /// unmonitored sessions.
    pub async fn handle_session_new(
        &self,
        props: SessionProps,
        policy: &PolicySnapshot,
    ) -> Result<(), StoreError> {
        if !props.is_trackable() {
            debug!(platform_session_id = %props.platform_session_id, class = %props.class, "ignoring non-interactive session");
            return Ok(());
        }
        if policy.effective(&props.username).is_none() {
            debug!(username = %props.username, "ignoring session for unmanaged user");
            return Ok(());
        }

        let now = self.clock.now_utc();
        let local_date = now.date_naive();
        let store_id = self
            .store
            .add_session(
                &props.platform_session_id,
                &props.username,
                props.uid,
                local_date,
                now.timestamp(),
                Some(&props.desktop),
                Some(&props.service),
            )
            .await?;

        let mut table = self.table.lock().await;
        table.insert(
            self.key(&props.platform_session_id),
            TrackedSession {
                username: props.username.clone(),
                store_id,
                start_monotonic: self.clock.now_monotonic(),
                subtracted: StdDuration::ZERO,
                open_lock: None,
                last_lock_event: None,
            },
        );
        info!(username = %props.username, platform_session_id = %props.platform_session_id, "session started");
        Ok(())
    }

    /// Handles a `SessionRemoved` signal.
    pub async fn handle_session_removed(&self, platform_session_id: &str) -> Result<(), StoreError> {
        let key = self.key(platform_session_id);
        let mut table = self.table.lock().await;
        let Some(session) = table.remove(&key) else {
            return Ok(());
        };
        drop(table);

        let elapsed = self.clock.now_monotonic() - session.start_monotonic;
        let duration = elapsed.saturating_sub(session.subtracted);
        let now = self.clock.now_utc();

        self.store
            .close_session(platform_session_id, now.timestamp(), duration.as_secs() as i64)
            .await?;
        info!(username = %session.username, platform_session_id, duration_secs = duration.as_secs(), "session ended");
        Ok(())
    }

    /// Handles a lock/unlock event from a session agent, de-duplicated
    /// within a 2-second window per session.
    pub async fn handle_lock_event(
        &self,
        platform_session_id: &str,
        locked: bool,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let key = self.key(platform_session_id);
        let mut table = self.table.lock().await;
        let Some(session) = table.get_mut(&key) else {
            warn!(platform_session_id, "lock event for unknown session");
            return Ok(());
        };

        if let Some((last_locked, last_ts)) = session.last_lock_event {
            let delta = (timestamp - last_ts).num_milliseconds().unsigned_abs();
            if last_locked == locked && StdDuration::from_millis(delta) < LOCK_DEDUP_WINDOW {
                return Ok(());
            }
        }
        session.last_lock_event = Some((locked, timestamp));

        if locked {
            if session.open_lock.is_some() {
                return Ok(());
            }
            let interval_id = self.store.open_lock_interval(session.store_id, timestamp.timestamp()).await?;
            session.open_lock = Some(LockEntry {
                interval_id,
                opened_at: self.clock.now_monotonic(),
            });
        } else if let Some(entry) = session.open_lock.take() {
            self.store.close_lock_interval(entry.interval_id, timestamp.timestamp()).await?;
            let locked_duration = self.clock.now_monotonic() - entry.opened_at;
            session.subtracted += locked_duration;
        }
        Ok(())
    }

    /// Total screen-time minutes used by `username` since `since_reset`,
    /// counting active sessions up to "now".
    pub async fn used_minutes(&self, username: &str, since_reset: NaiveDate) -> Result<f64, StoreError> {
        let finished_total = self.store.daily_usage(username, since_reset).await?;

        let table = self.table.lock().await;
        let active_total: StdDuration = table
            .values()
            .filter(|s| s.username == username)
            .map(|s| {
                let elapsed = self.clock.now_monotonic() - s.start_monotonic;
                let mut open = s.subtracted;
                if let Some(lock) = &s.open_lock {
                    open += self.clock.now_monotonic() - lock.opened_at;
                }
                elapsed.saturating_sub(open)
            })
            .sum();

        Ok((finished_total as f64 + active_total.as_secs_f64()) / 60.0)
    }

    /// Remaining minutes for `username` given `user`'s effective policy;
    /// `f64::INFINITY` for unmonitored/quota-exempt users.
    pub async fn remaining_minutes(&self, username: &str, user: &ManagedUser, timezone: Tz, reset_time: &str) -> Result<f64, StoreError> {
        if !user.monitored || user.quota_exempt {
            return Ok(f64::INFINITY);
        }
        let boundary = last_reset_boundary(self.clock.now_utc(), timezone, reset_time);
        let used = self.used_minutes(username, boundary).await?;
        Ok((user.daily_quota_minutes as f64 - used).max(0.0))
    }

    pub async fn active_count(&self) -> usize {
        self.table.lock().await.len()
    }

    /// Resets every active session's accounting baseline to "now", called
    /// by the daily rollover so in-progress sessions count zero toward the
    /// new day.
    pub async fn reset_active_baselines(&self) {
        let mut table = self.table.lock().await;
        for session in table.values_mut() {
            session.start_monotonic = self.clock.now_monotonic();
            session.subtracted = StdDuration::ZERO;
        }
    }
}

/// The most recent local-time instant equal to `reset_time`: today's if
/// "now" is at/after it, otherwise yesterday's.
pub fn last_reset_boundary(now_utc: DateTime<Utc>, timezone: Tz, reset_time: &str) -> NaiveDate {
    let local_now = now_utc.with_timezone(&timezone);
    let (hour, minute) = reset_time
        .split_once(':')
        .and_then(|(h, m)| Some((h.parse().ok()?, m.parse().ok()?)))
        .unwrap_or((3u32, 0u32));
    let reset_today = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);

    if local_now.time() >= reset_today {
        local_now.date_naive()
    } else {
        local_now.date_naive() - chrono::Duration::days(1)
    }
}
