//! SQLite persistence for delegates, join requests, rate-limit blocks, settings and the audit log.
//!
//! One connection serves every writer. Calls hop onto the blocking pool so the
//! async engine never waits on SQLite directly.

use crate::error::{AdmissionError, Result};
use crate::types::{
    AdmissionAction, AdmissionLogEntry, DecidedBy, DelegateAccount, DelegateId, JoinRequest,
    LogContext, OutcomeDetail, RequestId, RequestStatus,
};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use gate_platform::{SpaceId, UserId};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS delegate_accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_ref TEXT NOT NULL UNIQUE,
    sealed_credential TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    usage_count INTEGER NOT NULL DEFAULT 0,
    last_used_at TEXT NULL,
    daily_count INTEGER NOT NULL DEFAULT 0,
    daily_reset_on TEXT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS join_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    space_id INTEGER NOT NULL,
    display_name TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    decided_by TEXT NULL,
    decided_at TEXT NULL,
    delegate_id INTEGER NULL REFERENCES delegate_accounts(id),
    detail TEXT NULL
);

CREATE INDEX IF NOT EXISTS idx_join_requests_user_created
    ON join_requests (user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_join_requests_status ON join_requests (status);
CREATE UNIQUE INDEX IF NOT EXISTS idx_join_requests_outstanding
    ON join_requests (user_id, space_id)
    WHERE status IN ('pending', 'manual_check');

CREATE TABLE IF NOT EXISTS rate_limit_blocks (
    user_id INTEGER PRIMARY KEY,
    active INTEGER NOT NULL,
    blocked_at TEXT NOT NULL,
    reason TEXT NOT NULL,
    cleared_at TEXT NULL
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS admission_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL,
    user_id INTEGER NULL,
    space_id INTEGER NULL,
    delegate_id INTEGER NULL,
    request_id INTEGER NULL,
    created_at TEXT NOT NULL
);
"#;

const REQUEST_COLUMNS: &str = "id, user_id, space_id, display_name, status, created_at, \
     decided_by, decided_at, delegate_id, detail";
const DELEGATE_COLUMNS: &str = "id, external_ref, sealed_credential, active, usage_count, \
     last_used_at, daily_count, daily_reset_on, created_at";

#[derive(Debug, Error)]
#[error("invalid persisted value for '{field}': {value}")]
struct InvalidPersistedValue {
    field: &'static str,
    value: String,
}

/// Where a request moves to, and what gets recorded alongside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub to: RequestStatus,
    pub decided_by: Option<DecidedBy>,
    pub delegate_id: Option<DelegateId>,
    pub detail: Option<OutcomeDetail>,
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AdmissionError::Persistence(format!("create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    pub(crate) async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| AdmissionError::Persistence("store mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await?
    }

    // ===== delegate accounts =====

    pub async fn insert_delegate(
        &self,
        external_ref: &str,
        sealed_credential: &str,
    ) -> Result<DelegateAccount> {
        let external_ref = external_ref.trim().to_string();
        let sealed_credential = sealed_credential.to_string();
        self.run(move |conn| {
            let now = timestamp_to_db(Utc::now());
            conn.execute(
                r#"
INSERT INTO delegate_accounts (external_ref, sealed_credential, active, created_at)
VALUES (?1, ?2, 1, ?3)
ON CONFLICT(external_ref) DO UPDATE
SET sealed_credential = excluded.sealed_credential,
    active = 1
"#,
                params![external_ref, sealed_credential, now],
            )?;
            let id: i64 = conn.query_row(
                "SELECT id FROM delegate_accounts WHERE external_ref = ?1",
                params![external_ref],
                |row| row.get(0),
            )?;
            load_delegate(conn, DelegateId::new(id))?
                .ok_or(AdmissionError::DelegateNotFound(DelegateId::new(id)))
        })
        .await
    }

    pub async fn get_delegate(&self, id: DelegateId) -> Result<Option<DelegateAccount>> {
        self.run(move |conn| load_delegate(conn, id)).await
    }

    pub async fn list_delegates(&self, active_only: bool) -> Result<Vec<DelegateAccount>> {
        self.run(move |conn| {
            let sql = if active_only {
                format!(
                    "SELECT {DELEGATE_COLUMNS} FROM delegate_accounts WHERE active = 1 \
                     ORDER BY usage_count ASC, id ASC"
                )
            } else {
                format!("SELECT {DELEGATE_COLUMNS} FROM delegate_accounts ORDER BY id ASC")
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], delegate_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    pub async fn count_active_delegates(&self) -> Result<u64> {
        self.run(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM delegate_accounts WHERE active = 1",
                [],
                |row| row.get(0),
            )?;
            Ok(u64::try_from(count).unwrap_or_default())
        })
        .await
    }

    /// Returns whether the flag actually changed.
    pub async fn set_delegate_active(&self, id: DelegateId, active: bool) -> Result<bool> {
        self.run(move |conn| {
            if load_delegate(conn, id)?.is_none() {
                return Err(AdmissionError::DelegateNotFound(id));
            }
            let changed = conn.execute(
                "UPDATE delegate_accounts SET active = ?1 WHERE id = ?2 AND active != ?1",
                params![active, id.get()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Least-used active account under its daily cap, skipping `exclude`.
    pub async fn next_delegate_candidate(
        &self,
        today: NaiveDate,
        daily_cap: u32,
        exclude: Vec<DelegateId>,
    ) -> Result<Option<DelegateAccount>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DELEGATE_COLUMNS} FROM delegate_accounts WHERE active = 1 \
                 ORDER BY usage_count ASC, id ASC"
            ))?;
            let rows = stmt.query_map([], delegate_from_row)?;
            for row in rows {
                let account = row?;
                if exclude.contains(&account.id) {
                    continue;
                }
                if account.admissions_on(today) >= daily_cap {
                    continue;
                }
                return Ok(Some(account));
            }
            Ok(None)
        })
        .await
    }

    /// Bumps usage accounting for a newly bound delegate.
    pub async fn record_selection(
        &self,
        id: DelegateId,
        now: DateTime<Utc>,
    ) -> Result<DelegateAccount> {
        self.run(move |conn| {
            conn.execute(
                r#"
UPDATE delegate_accounts
   SET usage_count = usage_count + 1,
       last_used_at = ?1
 WHERE id = ?2
"#,
                params![timestamp_to_db(now), id.get()],
            )?;
            load_delegate(conn, id)?.ok_or(AdmissionError::DelegateNotFound(id))
        })
        .await
    }

    /// Counts one platform admission against the delegate's daily cap.
    pub async fn record_admission(&self, id: DelegateId, today: NaiveDate) -> Result<u32> {
        self.run(move |conn| {
            let today = today.to_string();
            conn.execute(
                r#"
UPDATE delegate_accounts
   SET daily_count = CASE WHEN daily_reset_on = ?1 THEN daily_count + 1 ELSE 1 END,
       daily_reset_on = ?1
 WHERE id = ?2
"#,
                params![today, id.get()],
            )?;
            let count: i64 = conn.query_row(
                "SELECT daily_count FROM delegate_accounts WHERE id = ?1",
                params![id.get()],
                |row| row.get(0),
            )?;
            Ok(u32::try_from(count).unwrap_or(u32::MAX))
        })
        .await
    }

    // ===== join requests =====

    pub async fn get_request(&self, id: RequestId) -> Result<Option<JoinRequest>> {
        self.run(move |conn| load_request(conn, id)).await
    }

    pub async fn list_requests(&self, statuses: &[RequestStatus]) -> Result<Vec<JoinRequest>> {
        let filter = status_list_sql(statuses);
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REQUEST_COLUMNS} FROM join_requests WHERE status IN ({filter}) \
                 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map([], request_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Conditional status update. `None` means the request was not in any of `from`
    /// (or does not exist) and nothing was written.
    pub async fn transition_request(
        &self,
        id: RequestId,
        from: &[RequestStatus],
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<JoinRequest>> {
        let filter = status_list_sql(from);
        self.run(move |conn| {
            let decided_at = transition.decided_by.map(|_| timestamp_to_db(now));
            let changed = conn.execute(
                &format!(
                    r#"
UPDATE join_requests
   SET status = ?1,
       decided_by = COALESCE(?2, decided_by),
       decided_at = COALESCE(?3, decided_at),
       delegate_id = COALESCE(?4, delegate_id),
       detail = COALESCE(?5, detail)
 WHERE id = ?6
   AND status IN ({filter})
"#
                ),
                params![
                    transition.to.as_str(),
                    transition.decided_by.map(DecidedBy::to_db),
                    decided_at,
                    transition.delegate_id.map(DelegateId::get),
                    transition.detail.map(OutcomeDetail::as_str),
                    id.get(),
                ],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            load_request(conn, id)
        })
        .await
    }

    // ===== settings =====

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?)
        })
        .await
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.run(move |conn| {
            conn.execute(
                r#"
INSERT INTO settings (key, value, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(key) DO UPDATE
SET value = excluded.value,
    updated_at = excluded.updated_at
"#,
                params![key, value, timestamp_to_db(Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    // ===== audit log =====

    pub async fn append_log(&self, action: AdmissionAction, context: LogContext) -> Result<()> {
        self.run(move |conn| append_log(conn, action, context, Utc::now()))
            .await
    }

    pub async fn recent_log(&self, limit: usize) -> Result<Vec<AdmissionLogEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                r#"
SELECT id, action, user_id, space_id, delegate_id, request_id, created_at
  FROM admission_log
 ORDER BY id DESC
 LIMIT ?1
"#,
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok(AdmissionLogEntry {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    user_id: row.get::<_, Option<i64>>(2)?.map(UserId::new),
                    space_id: row.get::<_, Option<i64>>(3)?.map(SpaceId::new),
                    delegate_id: row.get::<_, Option<i64>>(4)?.map(DelegateId::new),
                    request_id: row.get::<_, Option<i64>>(5)?.map(RequestId::new),
                    created_at: timestamp_column(row, 6)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

pub(crate) fn append_log(
    conn: &Connection,
    action: AdmissionAction,
    context: LogContext,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        r#"
INSERT INTO admission_log (action, user_id, space_id, delegate_id, request_id, created_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
"#,
        params![
            action.as_str(),
            context.user_id.map(UserId::get),
            context.space_id.map(SpaceId::get),
            context.delegate_id.map(DelegateId::get),
            context.request_id.map(RequestId::get),
            timestamp_to_db(now),
        ],
    )?;
    Ok(())
}

pub(crate) fn insert_request(
    conn: &Connection,
    user_id: UserId,
    space_id: SpaceId,
    display_name: &str,
    now: DateTime<Utc>,
) -> Result<JoinRequest> {
    conn.execute(
        r#"
INSERT INTO join_requests (user_id, space_id, display_name, status, created_at)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
        params![
            user_id.get(),
            space_id.get(),
            display_name,
            RequestStatus::Pending.as_str(),
            timestamp_to_db(now),
        ],
    )?;
    let id = RequestId::new(conn.last_insert_rowid());
    load_request(conn, id)?.ok_or(AdmissionError::RequestNotFound(id))
}

pub(crate) fn find_outstanding(
    conn: &Connection,
    user_id: UserId,
    space_id: SpaceId,
) -> Result<Option<JoinRequest>> {
    let filter = status_list_sql(&RequestStatus::OUTSTANDING);
    Ok(conn
        .query_row(
            &format!(
                "SELECT {REQUEST_COLUMNS} FROM join_requests \
                 WHERE user_id = ?1 AND space_id = ?2 AND status IN ({filter}) \
                 ORDER BY id DESC LIMIT 1"
            ),
            params![user_id.get(), space_id.get()],
            request_from_row,
        )
        .optional()?)
}

pub(crate) fn count_requests_since(
    conn: &Connection,
    user_id: UserId,
    since: DateTime<Utc>,
) -> Result<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM join_requests WHERE user_id = ?1 AND created_at > ?2",
        params![user_id.get(), timestamp_to_db(since)],
        |row| row.get(0),
    )?;
    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}

fn load_request(conn: &Connection, id: RequestId) -> Result<Option<JoinRequest>> {
    Ok(conn
        .query_row(
            &format!("SELECT {REQUEST_COLUMNS} FROM join_requests WHERE id = ?1"),
            params![id.get()],
            request_from_row,
        )
        .optional()?)
}

fn load_delegate(conn: &Connection, id: DelegateId) -> Result<Option<DelegateAccount>> {
    Ok(conn
        .query_row(
            &format!("SELECT {DELEGATE_COLUMNS} FROM delegate_accounts WHERE id = ?1"),
            params![id.get()],
            delegate_from_row,
        )
        .optional()?)
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<JoinRequest> {
    let status: String = row.get(4)?;
    let decided_by: Option<String> = row.get(6)?;
    let detail: Option<String> = row.get(9)?;
    Ok(JoinRequest {
        id: RequestId::new(row.get(0)?),
        user_id: UserId::new(row.get(1)?),
        space_id: SpaceId::new(row.get(2)?),
        display_name: row.get(3)?,
        status: status
            .parse()
            .map_err(|_| invalid_column(4, "status", &status))?,
        created_at: timestamp_column(row, 5)?,
        decided_by: match decided_by {
            Some(value) => Some(
                DecidedBy::from_db(&value).ok_or_else(|| invalid_column(6, "decided_by", &value))?,
            ),
            None => None,
        },
        decided_at: optional_timestamp_column(row, 7)?,
        delegate_id: row.get::<_, Option<i64>>(8)?.map(DelegateId::new),
        detail: match detail {
            Some(value) => Some(
                value
                    .parse()
                    .map_err(|_| invalid_column(9, "detail", &value))?,
            ),
            None => None,
        },
    })
}

fn delegate_from_row(row: &Row<'_>) -> rusqlite::Result<DelegateAccount> {
    let usage_count: i64 = row.get(4)?;
    let daily_count: i64 = row.get(6)?;
    let daily_reset_on: Option<String> = row.get(7)?;
    Ok(DelegateAccount {
        id: DelegateId::new(row.get(0)?),
        external_ref: row.get(1)?,
        sealed_credential: row.get(2)?,
        active: row.get(3)?,
        usage_count: u64::try_from(usage_count).unwrap_or_default(),
        last_used_at: optional_timestamp_column(row, 5)?,
        daily_count: u32::try_from(daily_count).unwrap_or_default(),
        daily_reset_on: match daily_reset_on {
            Some(value) => Some(
                value
                    .parse::<NaiveDate>()
                    .map_err(|_| invalid_column(7, "daily_reset_on", &value))?,
            ),
            None => None,
        },
        created_at: timestamp_column(row, 8)?,
    })
}

pub(crate) fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| invalid_column(idx, "timestamp", &value))
}

pub(crate) fn optional_timestamp_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(idx)?;
    value
        .map(|value| {
            DateTime::parse_from_rfc3339(&value)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|_| invalid_column(idx, "timestamp", &value))
        })
        .transpose()
}

fn invalid_column(idx: usize, field: &'static str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(InvalidPersistedValue {
            field,
            value: value.to_string(),
        }),
    )
}

/// Statuses are a closed enum, so their strings are safe to inline.
fn status_list_sql(statuses: &[RequestStatus]) -> String {
    if statuses.is_empty() {
        return "NULL".to_string();
    }
    statuses
        .iter()
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    #[tokio::test]
    async fn delegates_persist_and_order_by_usage() {
        let store = Store::open_in_memory().expect("store");
        let a = store.insert_delegate("+1000", "enc:v1:a").await.expect("a");
        let b = store.insert_delegate("+2000", "enc:v1:b").await.expect("b");
        assert!(a.active);
        assert_eq!(a.usage_count, 0);

        let first = store
            .next_delegate_candidate(today(), 40, vec![])
            .await
            .expect("candidate")
            .expect("some");
        assert_eq!(first.id, a.id, "ties break by insertion order");

        store.record_selection(a.id, Utc::now()).await.expect("select");
        let second = store
            .next_delegate_candidate(today(), 40, vec![])
            .await
            .expect("candidate")
            .expect("some");
        assert_eq!(second.id, b.id);

        let skipped = store
            .next_delegate_candidate(today(), 40, vec![b.id])
            .await
            .expect("candidate")
            .expect("some");
        assert_eq!(skipped.id, a.id);
    }

    #[tokio::test]
    async fn reinserting_a_delegate_replaces_credential_and_reactivates() {
        let store = Store::open_in_memory().expect("store");
        let a = store.insert_delegate("+1000", "enc:v1:a").await.expect("a");
        assert!(store.set_delegate_active(a.id, false).await.expect("deactivate"));
        assert!(!store.set_delegate_active(a.id, false).await.expect("no-op"));

        let again = store.insert_delegate("+1000", "enc:v1:new").await.expect("again");
        assert_eq!(again.id, a.id);
        assert!(again.active);
        assert_eq!(again.sealed_credential, "enc:v1:new");
        assert!(matches!(
            store.set_delegate_active(DelegateId::new(99), true).await,
            Err(AdmissionError::DelegateNotFound(_))
        ));
    }

    #[tokio::test]
    async fn daily_cap_excludes_candidates() {
        let store = Store::open_in_memory().expect("store");
        let a = store.insert_delegate("+1000", "enc:v1:a").await.expect("a");
        for _ in 0..2 {
            store.record_admission(a.id, today()).await.expect("admission");
        }
        assert!(store
            .next_delegate_candidate(today(), 2, vec![])
            .await
            .expect("candidate")
            .is_none());
        let tomorrow = today().succ_opt().expect("tomorrow");
        assert!(store
            .next_delegate_candidate(tomorrow, 2, vec![])
            .await
            .expect("candidate")
            .is_some());
        assert_eq!(store.record_admission(a.id, tomorrow).await.expect("reset"), 1);
    }

    #[tokio::test]
    async fn transitions_are_conditional_on_source_status() {
        let store = Store::open_in_memory().expect("store");
        let request = store
            .run(|conn| insert_request(conn, UserId::new(1), SpaceId::new(-10), "Ada", Utc::now()))
            .await
            .expect("insert");
        assert_eq!(request.status, RequestStatus::Pending);

        let approved = store
            .transition_request(
                request.id,
                &[RequestStatus::Pending],
                Transition {
                    to: RequestStatus::Approved,
                    decided_by: Some(DecidedBy::System),
                    delegate_id: None,
                    detail: Some(OutcomeDetail::Verified),
                },
                Utc::now(),
            )
            .await
            .expect("transition")
            .expect("changed");
        assert_eq!(approved.status, RequestStatus::Approved);
        assert_eq!(approved.decided_by, Some(DecidedBy::System));
        assert!(approved.decided_at.is_some());
        assert_eq!(approved.detail, Some(OutcomeDetail::Verified));

        let late = store
            .transition_request(
                request.id,
                &[RequestStatus::Pending, RequestStatus::ManualCheck],
                Transition {
                    to: RequestStatus::Rejected,
                    decided_by: Some(DecidedBy::Operator(UserId::new(5))),
                    delegate_id: None,
                    detail: Some(OutcomeDetail::OperatorRejected),
                },
                Utc::now(),
            )
            .await
            .expect("transition");
        assert!(late.is_none());
        let stored = store.get_request(request.id).await.expect("get").expect("row");
        assert_eq!(stored.status, RequestStatus::Approved);
    }

    #[tokio::test]
    async fn outstanding_requests_are_unique_per_user_and_space() {
        let store = Store::open_in_memory().expect("store");
        store
            .run(|conn| insert_request(conn, UserId::new(1), SpaceId::new(-10), "", Utc::now()))
            .await
            .expect("first");
        let duplicate = store
            .run(|conn| insert_request(conn, UserId::new(1), SpaceId::new(-10), "", Utc::now()))
            .await;
        assert!(matches!(duplicate, Err(AdmissionError::Persistence(_))));

        let other_space = store
            .run(|conn| insert_request(conn, UserId::new(1), SpaceId::new(-20), "", Utc::now()))
            .await;
        assert!(other_space.is_ok());
    }

    #[tokio::test]
    async fn request_window_counts_only_recent_rows() {
        let store = Store::open_in_memory().expect("store");
        let now = Utc::now();
        store
            .run(move |conn| {
                insert_request(conn, UserId::new(1), SpaceId::new(-10), "", now - ChronoDuration::minutes(5))?;
                conn.execute("UPDATE join_requests SET status = 'approved'", [])?;
                insert_request(conn, UserId::new(1), SpaceId::new(-10), "", now)?;
                Ok(())
            })
            .await
            .expect("seed");
        let count = store
            .run(move |conn| count_requests_since(conn, UserId::new(1), now - ChronoDuration::seconds(60)))
            .await
            .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn settings_and_log_round_trip() {
        let store = Store::open_in_memory().expect("store");
        assert_eq!(store.get_setting("auto_admit").await.expect("get"), None);
        store.set_setting("auto_admit", "false").await.expect("set");
        store.set_setting("auto_admit", "true").await.expect("set");
        assert_eq!(
            store.get_setting("auto_admit").await.expect("get").as_deref(),
            Some("true")
        );

        store
            .append_log(
                AdmissionAction::UserBlocked,
                LogContext {
                    user_id: Some(UserId::new(9)),
                    ..LogContext::default()
                },
            )
            .await
            .expect("log");
        let entries = store.recent_log(10).await.expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "user_blocked");
        assert_eq!(entries[0].user_id, Some(UserId::new(9)));
    }
}
