//! Durable state: sessions, per-user settings, daily history, metadata.
//!
//! A single embedded SQLite file, opened once at startup. Every write goes
//! through the connection pool's default (synchronous) journal mode so a
//! commit is fsync-durable; callers never see a partially-applied write.

use chrono::{NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::config::PolicySnapshot;
use crate::error::StoreError;

const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: i64,
    pub platform_session_id: String,
    pub username: String,
    pub uid: i64,
    pub local_date: String,
    pub start_wallclock: i64,
    pub end_wallclock: Option<i64>,
    pub duration_seconds: i64,
    pub desktop: Option<String>,
    pub service: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HistoryRow {
    pub username: String,
    pub local_date: String,
    pub total_screen_time_seconds: i64,
    pub login_count: i64,
    pub first_login: Option<i64>,
    pub last_logout: Option<i64>,
    pub quota_exceeded: bool,
    pub bonus_time_used: i64,
}

/// Durable state for guardian-daemon. Cheap to clone (wraps a pool).
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if absent) the store file at `path` and applies any
    /// pending migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Corrupt(format!("cannot create store directory {parent:?}: {e}"))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        )
        .execute(&self.pool)
        .await?;

        let current_version: i64 = self.meta_get("schema_version").await?.and_then(|v| v.parse().ok()).unwrap_or(0);

        if current_version < 1 {
            info!("applying store migration 1");
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    platform_session_id TEXT NOT NULL,
                    username TEXT NOT NULL,
                    uid INTEGER NOT NULL,
                    local_date TEXT NOT NULL,
                    start_wallclock INTEGER NOT NULL,
                    end_wallclock INTEGER,
                    duration_seconds INTEGER NOT NULL DEFAULT 0,
                    desktop TEXT,
                    service TEXT,
                    UNIQUE(username, local_date, start_wallclock)
                )
                "#,
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS lock_intervals (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id INTEGER NOT NULL REFERENCES sessions(id),
                    lock_start INTEGER NOT NULL,
                    lock_end INTEGER
                )
                "#,
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS user_settings (
                    username TEXT PRIMARY KEY,
                    settings_json TEXT NOT NULL
                )
                "#,
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS history (
                    username TEXT NOT NULL,
                    local_date TEXT NOT NULL,
                    total_screen_time_seconds INTEGER NOT NULL,
                    login_count INTEGER NOT NULL,
                    first_login INTEGER,
                    last_logout INTEGER,
                    quota_exceeded BOOLEAN NOT NULL,
                    bonus_time_used INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (username, local_date)
                )
                "#,
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?)")
                .bind(SCHEMA_VERSION.to_string())
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
        }

        Ok(())
    }

    /// Inserts a session row. On a `(username, date, start)` conflict, this
    /// is a no-op and the existing row's id is returned.
    pub async fn add_session(
        &self,
        platform_session_id: &str,
        username: &str,
        uid: i64,
        local_date: NaiveDate,
        start_wallclock: i64,
        desktop: Option<&str>,
        service: Option<&str>,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sessions (platform_session_id, username, uid, local_date, start_wallclock, desktop, service)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(username, local_date, start_wallclock) DO NOTHING
            "#,
        )
        .bind(platform_session_id)
        .bind(username)
        .bind(uid)
        .bind(local_date.to_string())
        .bind(start_wallclock)
        .bind(desktop)
        .bind(service)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(result.last_insert_rowid());
        }

        let row = sqlx::query(
            "SELECT id FROM sessions WHERE username = ? AND local_date = ? AND start_wallclock = ?",
        )
        .bind(username)
        .bind(local_date.to_string())
        .bind(start_wallclock)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    /// Idempotent: closing an already-closed session just re-writes the
    /// same end/duration values.
    pub async fn close_session(
        &self,
        platform_session_id: &str,
        end_wallclock: i64,
        duration_seconds: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sessions SET end_wallclock = ?, duration_seconds = ?
            WHERE platform_session_id = ? AND (end_wallclock IS NULL OR end_wallclock = 0)
            "#,
        )
        .bind(end_wallclock)
        .bind(duration_seconds)
        .bind(platform_session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn active_sessions(&self) -> Result<Vec<SessionRow>, StoreError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions WHERE end_wallclock IS NULL OR end_wallclock = 0",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn sessions_for(&self, username: &str, since: NaiveDate) -> Result<Vec<SessionRow>, StoreError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions WHERE username = ? AND local_date >= ?",
        )
        .bind(username)
        .bind(since.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Sum of finished-session duration on `date`, excluding sessions under
    /// 30 seconds (filters spurious service logins).
    pub async fn daily_usage(&self, username: &str, date: NaiveDate) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(duration_seconds), 0) as total
            FROM sessions
            WHERE username = ? AND local_date = ? AND duration_seconds >= 30
            "#,
        )
        .bind(username)
        .bind(date.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("total")?)
    }

    /// Archives `date`'s finished sessions for `username` into `history`
    /// and removes them, atomically. `daily_quota_minutes` and
    /// `bonus_time_used_minutes` (the day's bonus-pool drawdown, tracked by
    /// the Enforcer) feed the two aggregate flags the Enforcer itself has
    /// no way to persist.
    pub async fn archive_and_clear(
        &self,
        username: &str,
        date: NaiveDate,
        daily_quota_minutes: u32,
        bonus_time_used_minutes: u32,
    ) -> Result<HistoryRow, StoreError> {
        let mut tx = self.pool.begin().await?;

        let sessions = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions WHERE username = ? AND local_date = ?",
        )
        .bind(username)
        .bind(date.to_string())
        .fetch_all(&mut *tx)
        .await?;

        let total: i64 = sessions.iter().map(|s| s.duration_seconds).sum();
        let login_count = sessions.len() as i64;
        let first_login = sessions.iter().map(|s| s.start_wallclock).min();
        let last_logout = sessions.iter().filter_map(|s| s.end_wallclock).max();
        let quota_exceeded = total as f64 / 60.0 >= daily_quota_minutes as f64;

        let history = HistoryRow {
            username: username.to_string(),
            local_date: date.to_string(),
            total_screen_time_seconds: total,
            login_count,
            first_login,
            last_logout,
            quota_exceeded,
            bonus_time_used: bonus_time_used_minutes as i64,
        };

        sqlx::query(
            r#"
            INSERT INTO history (username, local_date, total_screen_time_seconds, login_count, first_login, last_logout, quota_exceeded, bonus_time_used)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(username, local_date) DO UPDATE SET
                total_screen_time_seconds = excluded.total_screen_time_seconds,
                login_count = excluded.login_count,
                first_login = excluded.first_login,
                last_logout = excluded.last_logout,
                quota_exceeded = excluded.quota_exceeded,
                bonus_time_used = excluded.bonus_time_used
            "#,
        )
        .bind(&history.username)
        .bind(&history.local_date)
        .bind(history.total_screen_time_seconds)
        .bind(history.login_count)
        .bind(history.first_login)
        .bind(history.last_logout)
        .bind(history.quota_exceeded)
        .bind(history.bonus_time_used)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM sessions WHERE username = ? AND local_date = ?")
            .bind(username)
            .bind(date.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(username, %date, total, "archived and cleared daily sessions");
        Ok(history)
    }

    pub async fn get_user_settings(&self, username: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT settings_json FROM user_settings WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<String, _>("settings_json")).transpose()?)
    }

    pub async fn set_user_settings(&self, username: &str, settings_json: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_settings (username, settings_json) VALUES (?, ?)
            ON CONFLICT(username) DO UPDATE SET settings_json = excluded.settings_json
            "#,
        )
        .bind(username)
        .bind(settings_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Idempotent: writes `default` plus each managed user's fully merged
    /// effective settings, overwriting prior rows with the same content.
    pub async fn sync_config_to_db(&self, snapshot: &PolicySnapshot) -> Result<(), StoreError> {
        for username in snapshot.managed_usernames() {
            if let Some(user) = snapshot.effective(username) {
                let json = serde_json::to_string(user)
                    .map_err(|e| StoreError::Corrupt(format!("serializing settings for {username}: {e}")))?;
                self.set_user_settings(username, &json).await?;
            }
        }
        Ok(())
    }

    pub async fn meta_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<String, _>("value")).transpose()?)
    }

    pub async fn meta_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn last_reset_date(&self) -> Result<Option<NaiveDate>, StoreError> {
        Ok(self
            .meta_get("last_reset_date")
            .await?
            .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()))
    }

    pub async fn set_last_reset_date(&self, date: NaiveDate) -> Result<(), StoreError> {
        self.meta_set("last_reset_date", &date.to_string()).await
    }

    pub async fn open_lock_interval(&self, session_id: i64, lock_start: i64) -> Result<i64, StoreError> {
        let result = sqlx::query("INSERT INTO lock_intervals (session_id, lock_start) VALUES (?, ?)")
            .bind(session_id)
            .bind(lock_start)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn close_lock_interval(&self, interval_id: i64, lock_end: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE lock_intervals SET lock_end = ? WHERE id = ?")
            .bind(lock_end)
            .bind(interval_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub fn today_string() -> String {
    Utc::now().date_naive().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn add_session_is_idempotent_on_conflict() {
        let store = Store::open_in_memory().await.unwrap();
        let id1 = store
            .add_session("sess-1", "alice", 1000, date(2025, 1, 7), 1000, Some("x11"), Some("login"))
            .await
            .unwrap();
        let id2 = store
            .add_session("sess-1-dup", "alice", 1000, date(2025, 1, 7), 1000, Some("x11"), Some("login"))
            .await
            .unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn close_session_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .add_session("sess-1", "alice", 1000, date(2025, 1, 7), 1000, None, None)
            .await
            .unwrap();
        store.close_session("sess-1", 2000, 1000).await.unwrap();
        store.close_session("sess-1", 2000, 1000).await.unwrap();

        let active = store.active_sessions().await.unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn archive_and_clear_zeroes_daily_usage_and_writes_history() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .add_session("sess-1", "alice", 1000, date(2025, 1, 7), 1000, None, None)
            .await
            .unwrap();
        store.close_session("sess-1", 1100, 100).await.unwrap();

        assert_eq!(store.daily_usage("alice", date(2025, 1, 7)).await.unwrap(), 100);

        let history = store.archive_and_clear("alice", date(2025, 1, 7), 60, 0).await.unwrap();
        assert_eq!(history.total_screen_time_seconds, 100);
        assert!(!history.quota_exceeded);
        assert_eq!(history.bonus_time_used, 0);
        assert_eq!(store.daily_usage("alice", date(2025, 1, 7)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn archive_and_clear_flags_quota_exceeded_and_bonus_time() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .add_session("sess-1", "alice", 1000, date(2025, 1, 7), 1000, None, None)
            .await
            .unwrap();
        store.close_session("sess-1", 1000 + 3600, 3600).await.unwrap();

        let history = store.archive_and_clear("alice", date(2025, 1, 7), 30, 15).await.unwrap();
        assert!(history.quota_exceeded);
        assert_eq!(history.bonus_time_used, 15);
    }

    #[tokio::test]
    async fn archive_and_clear_overwrites_flags_on_repeat_call() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .add_session("sess-1", "alice", 1000, date(2025, 1, 7), 1000, None, None)
            .await
            .unwrap();
        store.close_session("sess-1", 1000 + 60, 60).await.unwrap();
        store.archive_and_clear("alice", date(2025, 1, 7), 0, 10).await.unwrap();

        store
            .add_session("sess-2", "alice", 1000, date(2025, 1, 7), 2000, None, None)
            .await
            .unwrap();
        store.close_session("sess-2", 2000 + 60, 60).await.unwrap();
        let history = store.archive_and_clear("alice", date(2025, 1, 7), 1000, 0).await.unwrap();

        assert!(!history.quota_exceeded);
        assert_eq!(history.bonus_time_used, 0);
    }

    #[tokio::test]
    async fn sessions_for_returns_rows_on_or_after_since() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .add_session("sess-old", "alice", 1000, date(2025, 1, 5), 1000, None, None)
            .await
            .unwrap();
        store
            .add_session("sess-new", "alice", 1000, date(2025, 1, 8), 2000, None, None)
            .await
            .unwrap();
        store
            .add_session("sess-other-user", "bob", 1000, date(2025, 1, 8), 3000, None, None)
            .await
            .unwrap();

        let rows = store.sessions_for("alice", date(2025, 1, 7)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].platform_session_id, "sess-new");
    }

    #[tokio::test]
    async fn daily_usage_excludes_short_sessions() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .add_session("sess-short", "alice", 1000, date(2025, 1, 7), 1000, None, None)
            .await
            .unwrap();
        store.close_session("sess-short", 1010, 10).await.unwrap();
        assert_eq!(store.daily_usage("alice", date(2025, 1, 7)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn user_settings_round_trip() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store.get_user_settings("alice").await.unwrap().is_none());
        store.set_user_settings("alice", r#"{"daily_quota_minutes":60}"#).await.unwrap();
        let got = store.get_user_settings("alice").await.unwrap().unwrap();
        assert!(got.contains("60"));
    }

    #[tokio::test]
    async fn meta_round_trip_for_last_reset_date() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store.last_reset_date().await.unwrap().is_none());
        store.set_last_reset_date(date(2025, 1, 7)).await.unwrap();
        assert_eq!(store.last_reset_date().await.unwrap(), Some(date(2025, 1, 7)));
    }
}
