//! Per-user request throttling in front of the admission engine.
//!
//! `admit` is the only way a new request row gets created: the block check, the
//! window count, the duplicate check and the insert share one IMMEDIATE transaction.

use crate::error::Result;
use crate::store::{
    self, Store, count_requests_since, find_outstanding, insert_request, optional_timestamp_column,
    timestamp_column, timestamp_to_db,
};
use crate::types::{AdmissionAction, JoinRequest, LogContext, RateLimitRecord};
use chrono::{DateTime, Utc};
use gate_platform::{SpaceId, UserId};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_MAX_REQUESTS: u32 = 5;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// What to do when a user asks again while an earlier request for the same space is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    #[default]
    Reject,
    ReuseExisting,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlockExpiry {
    #[default]
    Manual,
    AutoExpireAfter(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window: Duration,
    pub expiry: BlockExpiry,
    pub duplicates: DuplicatePolicy,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: DEFAULT_WINDOW,
            expiry: BlockExpiry::Manual,
            duplicates: DuplicatePolicy::Reject,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Blocked { since: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitOutcome {
    Created(JoinRequest),
    /// The open request was handed back under [`DuplicatePolicy::ReuseExisting`].
    Reused(JoinRequest),
    Duplicate(JoinRequest),
    Blocked { newly_blocked: bool },
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Store,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(store: Store, policy: RateLimitPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub async fn check(&self, user_id: UserId, now: DateTime<Utc>) -> Result<RateLimitDecision> {
        let expiry = self.policy.expiry;
        self.store
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let decision = match effective_block(&tx, user_id, now, expiry)? {
                    Some(record) => RateLimitDecision::Blocked {
                        since: record.blocked_at,
                    },
                    None => RateLimitDecision::Allowed,
                };
                tx.commit()?;
                Ok(decision)
            })
            .await
    }

    #[tracing::instrument(level = "info", skip_all, fields(user_id = %user_id, space_id = %space_id))]
    pub async fn admit(
        &self,
        user_id: UserId,
        space_id: SpaceId,
        display_name: &str,
        now: DateTime<Utc>,
    ) -> Result<AdmitOutcome> {
        let policy = self.policy;
        let display_name = display_name.trim().to_string();
        let outcome = self
            .store
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let outcome = admit_in_tx(&tx, &policy, user_id, space_id, &display_name, now)?;
                tx.commit()?;
                Ok(outcome)
            })
            .await?;
        match &outcome {
            AdmitOutcome::Blocked { newly_blocked: true } => {
                tracing::warn!(max_requests = policy.max_requests, "user exceeded request rate; blocked");
            }
            AdmitOutcome::Created(request) => {
                tracing::debug!(request_id = %request.id, "join request created");
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Lifts a block. The request window restarts from this moment.
    pub async fn unblock(&self, user_id: UserId, now: DateTime<Utc>) -> Result<bool> {
        self.store
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let cleared = clear_block(&tx, user_id, now)?;
                if cleared {
                    store::append_log(
                        &tx,
                        AdmissionAction::UserUnblocked,
                        LogContext {
                            user_id: Some(user_id),
                            ..LogContext::default()
                        },
                        now,
                    )?;
                }
                tx.commit()?;
                Ok(cleared)
            })
            .await
    }

    pub async fn record(&self, user_id: UserId) -> Result<Option<RateLimitRecord>> {
        self.store.run(move |conn| load_block(conn, user_id)).await
    }

    pub async fn list_blocked(&self) -> Result<Vec<RateLimitRecord>> {
        self.store
            .run(|conn| {
                let mut stmt = conn.prepare(
                    r#"
SELECT user_id, active, blocked_at, reason, cleared_at
  FROM rate_limit_blocks
 WHERE active = 1
 ORDER BY blocked_at ASC
"#,
                )?;
                let rows = stmt.query_map([], record_from_row)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
    }
}

fn admit_in_tx(
    conn: &Connection,
    policy: &RateLimitPolicy,
    user_id: UserId,
    space_id: SpaceId,
    display_name: &str,
    now: DateTime<Utc>,
) -> Result<AdmitOutcome> {
    if effective_block(conn, user_id, now, policy.expiry)?.is_some() {
        return Ok(AdmitOutcome::Blocked {
            newly_blocked: false,
        });
    }

    let window_start = now - chrono_duration(policy.window);
    let since = match load_block(conn, user_id)?.and_then(|record| record.cleared_at) {
        Some(cleared_at) if cleared_at > window_start => cleared_at,
        _ => window_start,
    };
    if count_requests_since(conn, user_id, since)? >= policy.max_requests {
        let reason = format!(
            "more than {} requests within {}s",
            policy.max_requests,
            policy.window.as_secs()
        );
        block(conn, user_id, now, &reason)?;
        store::append_log(
            conn,
            AdmissionAction::UserBlocked,
            LogContext {
                user_id: Some(user_id),
                space_id: Some(space_id),
                ..LogContext::default()
            },
            now,
        )?;
        return Ok(AdmitOutcome::Blocked {
            newly_blocked: true,
        });
    }

    if let Some(existing) = find_outstanding(conn, user_id, space_id)? {
        return Ok(match policy.duplicates {
            DuplicatePolicy::Reject => AdmitOutcome::Duplicate(existing),
            DuplicatePolicy::ReuseExisting => AdmitOutcome::Reused(existing),
        });
    }

    let request = insert_request(conn, user_id, space_id, display_name, now)?;
    store::append_log(
        conn,
        AdmissionAction::Requested,
        LogContext::for_request(&request),
        now,
    )?;
    Ok(AdmitOutcome::Created(request))
}

/// The active block for `user_id`, lifting it first when auto-expiry says it has lapsed.
fn effective_block(
    conn: &Connection,
    user_id: UserId,
    now: DateTime<Utc>,
    expiry: BlockExpiry,
) -> Result<Option<RateLimitRecord>> {
    let Some(record) = load_block(conn, user_id)? else {
        return Ok(None);
    };
    if !record.active {
        return Ok(None);
    }
    if let BlockExpiry::AutoExpireAfter(after) = expiry {
        if record.blocked_at + chrono_duration(after) <= now {
            clear_block(conn, user_id, now)?;
            tracing::info!(user_id = %user_id, "rate-limit block expired");
            return Ok(None);
        }
    }
    Ok(Some(record))
}

fn load_block(conn: &Connection, user_id: UserId) -> Result<Option<RateLimitRecord>> {
    Ok(conn
        .query_row(
            r#"
SELECT user_id, active, blocked_at, reason, cleared_at
  FROM rate_limit_blocks
 WHERE user_id = ?1
"#,
            params![user_id.get()],
            record_from_row,
        )
        .optional()?)
}

fn block(conn: &Connection, user_id: UserId, now: DateTime<Utc>, reason: &str) -> Result<()> {
    conn.execute(
        r#"
INSERT INTO rate_limit_blocks (user_id, active, blocked_at, reason, cleared_at)
VALUES (?1, 1, ?2, ?3, NULL)
ON CONFLICT(user_id) DO UPDATE
SET active = 1,
    blocked_at = excluded.blocked_at,
    reason = excluded.reason
"#,
        params![user_id.get(), timestamp_to_db(now), reason],
    )?;
    Ok(())
}

fn clear_block(conn: &Connection, user_id: UserId, now: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE rate_limit_blocks SET active = 0, cleared_at = ?1 WHERE user_id = ?2 AND active = 1",
        params![timestamp_to_db(now), user_id.get()],
    )?;
    Ok(changed > 0)
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RateLimitRecord> {
    Ok(RateLimitRecord {
        user_id: UserId::new(row.get(0)?),
        active: row.get(1)?,
        blocked_at: timestamp_column(row, 2)?,
        reason: row.get(3)?,
        cleared_at: optional_timestamp_column(row, 4)?,
    })
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
