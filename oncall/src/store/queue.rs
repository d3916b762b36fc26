//! Durable notification queue with visibility-timeout leasing
//!
//! A message is visible when `visible_at_ms <= now`. Leasing a message pushes
//! its deadline out by the visibility timeout and stamps a fresh lease token;
//! if the holder never acks or requeues, the message simply becomes visible
//! again. Acks and requeues must present the current token, so a worker whose
//! lease expired cannot touch a message another worker now owns.

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use super::rows::{from_millis, to_millis};
use super::store::{Store, StoreError, StoreResult};
use super::types::*;

/// Queue occupancy at an instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// All messages not yet acked
    pub total: u64,
    /// Messages a worker could lease right now
    pub visible: u64,
}

const QUEUE_COLUMNS: &str = "id, notification_id, incident_id, recipient_kind, recipient_id,
    channel, requested_channels_json, priority, subject, body, created_at_ms, retry_count,
    delivery_count";

fn bad(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, u32, NotificationRequest)> {
    let kind: String = row.get(3)?;
    let recipient = Recipient::from_parts(&kind, row.get(4)?).map_err(|e| bad(3, e))?;
    let channel: String = row.get(5)?;
    let requested: String = row.get(6)?;
    let priority: String = row.get(7)?;
    let created_ms: i64 = row.get(10)?;

    let request = NotificationRequest {
        notification_id: row.get(1)?,
        incident_id: row.get(2)?,
        recipient,
        channel: channel.parse().map_err(|e| bad(5, e))?,
        requested_channels: serde_json::from_str(&requested).map_err(|e| bad(6, e))?,
        priority: priority.parse().map_err(|e| bad(7, e))?,
        subject: row.get(8)?,
        body: row.get(9)?,
        created_at: from_millis(created_ms).unwrap_or_default(),
        retry_count: row.get(11)?,
    };
    Ok((row.get(0)?, row.get(12)?, request))
}

/// Append a message that becomes visible at `visible_at`.
pub fn enqueue(
    conn: &Connection,
    request: &NotificationRequest,
    visible_at: DateTime<Utc>,
) -> StoreResult<i64> {
    let requested = serde_json::to_string(&request.requested_channels)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    conn.execute(
        "INSERT INTO notification_queue
            (notification_id, incident_id, recipient_kind, recipient_id, channel,
             requested_channels_json, priority, subject, body, created_at_ms,
             retry_count, visible_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            request.notification_id,
            request.incident_id,
            request.recipient.kind(),
            request.recipient.id(),
            request.channel.as_str(),
            requested,
            request.priority.as_str(),
            request.subject,
            request.body,
            to_millis(request.created_at),
            request.retry_count,
            to_millis(visible_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Lease up to `limit` visible messages, oldest deadline first.
///
/// Must run inside a transaction so two leasers never pick the same row.
pub fn lease_batch(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: usize,
    visibility: Duration,
) -> StoreResult<Vec<LeasedMessage>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM notification_queue
         WHERE visible_at_ms <= ?1
         ORDER BY visible_at_ms, id
         LIMIT ?2",
        QUEUE_COLUMNS
    ))?;
    let candidates = stmt
        .query_map(params![to_millis(now), limit as i64], request_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let deadline = to_millis(now + visibility);
    let mut leased = Vec::with_capacity(candidates.len());
    for (message_id, delivery_count, request) in candidates {
        let token = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "UPDATE notification_queue SET
                lease_token = ?2,
                visible_at_ms = ?3,
                delivery_count = delivery_count + 1
             WHERE id = ?1",
            params![message_id, token, deadline],
        )?;
        leased.push(LeasedMessage {
            message_id,
            lease_token: token,
            delivery_count: delivery_count + 1,
            request,
        });
    }
    Ok(leased)
}

/// Delete a message. Returns `false` if the lease was lost.
pub fn ack(conn: &Connection, message_id: i64, lease_token: &str) -> StoreResult<bool> {
    let changed = conn.execute(
        "DELETE FROM notification_queue WHERE id = ?1 AND lease_token = ?2",
        params![message_id, lease_token],
    )?;
    Ok(changed == 1)
}

/// Release a message for another attempt at `visible_at`.
///
/// Returns `false` if the lease was lost.
pub fn requeue(
    conn: &Connection,
    message_id: i64,
    lease_token: &str,
    visible_at: DateTime<Utc>,
    retry_count: u32,
) -> StoreResult<bool> {
    let changed = conn.execute(
        "UPDATE notification_queue SET
            visible_at_ms = ?3,
            retry_count = ?4,
            lease_token = NULL
         WHERE id = ?1 AND lease_token = ?2",
        params![message_id, lease_token, to_millis(visible_at), retry_count],
    )?;
    Ok(changed == 1)
}

pub fn depth(conn: &Connection, now: DateTime<Utc>) -> StoreResult<QueueDepth> {
    Ok(conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN visible_at_ms <= ?1 THEN 1 ELSE 0 END), 0)
         FROM notification_queue",
        params![to_millis(now)],
        |row| {
            let total: i64 = row.get(0)?;
            let visible: i64 = row.get(1)?;
            Ok(QueueDepth {
                total: total.max(0) as u64,
                visible: visible.max(0) as u64,
            })
        },
    )?)
}

// ============================================================================
// Store wrappers
// ============================================================================

impl Store {
    /// Enqueue a message that is immediately visible
    pub fn enqueue(&self, request: &NotificationRequest) -> StoreResult<i64> {
        self.read(|c| enqueue(c, request, request.created_at))
    }

    /// Lease a batch of visible messages
    pub fn lease(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        visibility: Duration,
    ) -> StoreResult<Vec<LeasedMessage>> {
        self.transaction(|tx| lease_batch(tx, now, limit, visibility))
    }

    pub fn ack(&self, message: &LeasedMessage) -> StoreResult<bool> {
        self.read(|c| ack(c, message.message_id, &message.lease_token))
    }

    pub fn requeue(
        &self,
        message: &LeasedMessage,
        visible_at: DateTime<Utc>,
        retry_count: u32,
    ) -> StoreResult<bool> {
        self.read(|c| {
            requeue(
                c,
                message.message_id,
                &message.lease_token,
                visible_at,
                retry_count,
            )
        })
    }

    pub fn queue_depth(&self, now: DateTime<Utc>) -> StoreResult<QueueDepth> {
        self.read(|c| depth(c, now))
    }
}
