//! Row-level queries.
//!
//! Every function takes a plain `&Connection` so it can run either on a
//! locked store connection or inside an open transaction (a `Transaction`
//! derefs to `Connection`).

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::str::FromStr;
use tracing::warn;

use super::store::{StoreError, StoreResult};
use super::types::*;

// ============================================================================
// Column helpers
// ============================================================================

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

fn conversion_error(
    idx: usize,
    ty: Type,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn text_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = UnknownVariant>,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, Type::Text, e))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    from_millis(ms).ok_or_else(|| {
        conversion_error(
            idx,
            Type::Integer,
            UnknownVariant {
                kind: "timestamp",
                value: ms.to_string(),
            },
        )
    })
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.get(idx)?;
    Ok(ms.and_then(from_millis))
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, Type::Text, e))
}

fn to_json<T: serde::Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

// ============================================================================
// Schedules
// ============================================================================

pub fn upsert_scheduler(conn: &Connection, scheduler: &Scheduler) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO schedulers (id, group_id, name, active) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
            group_id = excluded.group_id,
            name = excluded.name,
            active = excluded.active",
        params![
            scheduler.id,
            scheduler.group_id,
            scheduler.name,
            scheduler.active
        ],
    )?;
    Ok(())
}

fn scheduler_from_row(row: &Row<'_>) -> rusqlite::Result<Scheduler> {
    Ok(Scheduler {
        id: row.get(0)?,
        group_id: row.get(1)?,
        name: row.get(2)?,
        active: row.get(3)?,
    })
}

pub fn get_scheduler(conn: &Connection, id: &str) -> StoreResult<Option<Scheduler>> {
    Ok(conn
        .query_row(
            "SELECT id, group_id, name, active FROM schedulers WHERE id = ?1",
            params![id],
            scheduler_from_row,
        )
        .optional()?)
}

pub fn schedulers_in_group(conn: &Connection, group_id: &str) -> StoreResult<Vec<Scheduler>> {
    let mut stmt = conn.prepare(
        "SELECT id, group_id, name, active FROM schedulers WHERE group_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![group_id], scheduler_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn upsert_shift(conn: &Connection, shift: &Shift) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO shifts (id, scheduler_id, user_id, service_id, start_ms, end_ms, active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            scheduler_id = excluded.scheduler_id,
            user_id = excluded.user_id,
            service_id = excluded.service_id,
            start_ms = excluded.start_ms,
            end_ms = excluded.end_ms,
            active = excluded.active",
        params![
            shift.id,
            shift.scheduler_id,
            shift.user_id,
            shift.service_id,
            to_millis(shift.start),
            to_millis(shift.end),
            shift.active,
        ],
    )?;
    Ok(())
}

fn shift_from_row(row: &Row<'_>) -> rusqlite::Result<Shift> {
    Ok(Shift {
        id: row.get(0)?,
        scheduler_id: row.get(1)?,
        user_id: row.get(2)?,
        service_id: row.get(3)?,
        start: ts_col(row, 4)?,
        end: ts_col(row, 5)?,
        active: row.get(6)?,
    })
}

/// Active shifts of one scheduler whose window contains `at`.
pub fn shifts_covering(
    conn: &Connection,
    scheduler_id: &str,
    at: DateTime<Utc>,
) -> StoreResult<Vec<Shift>> {
    let mut stmt = conn.prepare(
        "SELECT id, scheduler_id, user_id, service_id, start_ms, end_ms, active
         FROM shifts
         WHERE scheduler_id = ?1 AND active = 1 AND start_ms <= ?2 AND end_ms > ?2",
    )?;
    let rows = stmt.query_map(params![scheduler_id, to_millis(at)], shift_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn upsert_override(conn: &Connection, ov: &Override) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO overrides (id, original_shift_id, new_user_id, reason, active, start_ms, end_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            original_shift_id = excluded.original_shift_id,
            new_user_id = excluded.new_user_id,
            reason = excluded.reason,
            active = excluded.active,
            start_ms = excluded.start_ms,
            end_ms = excluded.end_ms",
        params![
            ov.id,
            ov.original_shift_id,
            ov.new_user_id,
            ov.reason,
            ov.active,
            to_millis(ov.start),
            to_millis(ov.end),
        ],
    )?;
    Ok(())
}

pub fn overrides_for_shift(conn: &Connection, shift_id: &str) -> StoreResult<Vec<Override>> {
    let mut stmt = conn.prepare(
        "SELECT id, original_shift_id, new_user_id, reason, active, start_ms, end_ms
         FROM overrides WHERE original_shift_id = ?1",
    )?;
    let rows = stmt.query_map(params![shift_id], |row| {
        Ok(Override {
            id: row.get(0)?,
            original_shift_id: row.get(1)?,
            new_user_id: row.get(2)?,
            reason: row.get(3)?,
            active: row.get(4)?,
            start: ts_col(row, 5)?,
            end: ts_col(row, 6)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ============================================================================
// Policies
// ============================================================================

pub fn upsert_policy(conn: &Connection, policy: &EscalationPolicy) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO escalation_policies
            (id, group_id, name, repeat_max_times, escalate_after_minutes, active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            group_id = excluded.group_id,
            name = excluded.name,
            repeat_max_times = excluded.repeat_max_times,
            escalate_after_minutes = excluded.escalate_after_minutes,
            active = excluded.active",
        params![
            policy.id,
            policy.group_id,
            policy.name,
            policy.repeat_max_times,
            policy.escalate_after_minutes,
            policy.active,
        ],
    )?;
    Ok(())
}

pub fn get_policy(conn: &Connection, id: &str) -> StoreResult<Option<EscalationPolicy>> {
    Ok(conn
        .query_row(
            "SELECT id, group_id, name, repeat_max_times, escalate_after_minutes, active
             FROM escalation_policies WHERE id = ?1",
            params![id],
            |row| {
                Ok(EscalationPolicy {
                    id: row.get(0)?,
                    group_id: row.get(1)?,
                    name: row.get(2)?,
                    repeat_max_times: row.get(3)?,
                    escalate_after_minutes: row.get(4)?,
                    active: row.get(5)?,
                })
            },
        )
        .optional()?)
}

pub fn upsert_level(conn: &Connection, level: &EscalationLevel) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO escalation_levels
            (policy_id, level_number, target_type, target_id, timeout_minutes, channels_json, message_template)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(policy_id, level_number) DO UPDATE SET
            target_type = excluded.target_type,
            target_id = excluded.target_id,
            timeout_minutes = excluded.timeout_minutes,
            channels_json = excluded.channels_json,
            message_template = excluded.message_template",
        params![
            level.policy_id,
            level.level_number,
            level.target.kind(),
            level.target.target_id(),
            level.timeout_minutes,
            to_json(&level.channels)?,
            level.message_template,
        ],
    )?;
    Ok(())
}

/// Levels of a policy ordered by number.
///
/// Rows that cannot be decoded are skipped with a warning; the engine then
/// sees a gap at that number and records it as an unreachable level.
pub fn levels_for_policy(conn: &Connection, policy_id: &str) -> StoreResult<Vec<EscalationLevel>> {
    let mut stmt = conn.prepare(
        "SELECT policy_id, level_number, target_type, target_id, timeout_minutes, channels_json, message_template
         FROM escalation_levels WHERE policy_id = ?1 ORDER BY level_number",
    )?;
    let rows = stmt.query_map(params![policy_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, u32>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<u32>>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, Option<String>>(6)?,
        ))
    })?;

    let mut levels = Vec::new();
    for row in rows {
        let (policy_id, level_number, target_type, target_id, timeout, channels_json, template) =
            row?;
        let target = match EscalationTarget::from_parts(&target_type, target_id) {
            Ok(target) => target,
            Err(e) => {
                warn!(policy_id = %policy_id, level_number, "Skipping malformed escalation level: {}", e);
                continue;
            }
        };
        let channels: Vec<Channel> = match serde_json::from_str(&channels_json) {
            Ok(channels) => channels,
            Err(e) => {
                warn!(policy_id = %policy_id, level_number, "Skipping level with bad channel list: {}", e);
                continue;
            }
        };
        levels.push(EscalationLevel {
            policy_id,
            level_number,
            target,
            timeout_minutes: timeout,
            channels,
            message_template: template,
        });
    }
    Ok(levels)
}

// ============================================================================
// Incidents
// ============================================================================

const INCIDENT_COLUMNS: &str = "id, title, group_id, priority, status, escalation_status,
    escalation_policy_id, current_level, escalation_cycle, last_escalated_at_ms,
    acknowledged_by, acknowledged_at_ms, resolved_by, resolved_at_ms,
    created_at_ms, updated_at_ms, version";

fn incident_from_row(row: &Row<'_>) -> rusqlite::Result<Incident> {
    Ok(Incident {
        id: row.get(0)?,
        title: row.get(1)?,
        group_id: row.get(2)?,
        priority: text_col(row, 3)?,
        status: text_col(row, 4)?,
        escalation_status: text_col(row, 5)?,
        escalation_policy_id: row.get(6)?,
        current_level: row.get(7)?,
        escalation_cycle: row.get(8)?,
        last_escalated_at: opt_ts_col(row, 9)?,
        acknowledged_by: row.get(10)?,
        acknowledged_at: opt_ts_col(row, 11)?,
        resolved_by: row.get(12)?,
        resolved_at: opt_ts_col(row, 13)?,
        created_at: ts_col(row, 14)?,
        updated_at: ts_col(row, 15)?,
        version: row.get(16)?,
    })
}

pub fn insert_incident(conn: &Connection, incident: &Incident) -> StoreResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO incidents ({}) VALUES
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            INCIDENT_COLUMNS
        ),
        params![
            incident.id,
            incident.title,
            incident.group_id,
            incident.priority.as_str(),
            incident.status.as_str(),
            incident.escalation_status.as_str(),
            incident.escalation_policy_id,
            incident.current_level,
            incident.escalation_cycle,
            incident.last_escalated_at.map(to_millis),
            incident.acknowledged_by,
            incident.acknowledged_at.map(to_millis),
            incident.resolved_by,
            incident.resolved_at.map(to_millis),
            to_millis(incident.created_at),
            to_millis(incident.updated_at),
            incident.version,
        ],
    )?;
    Ok(())
}

pub fn get_incident(conn: &Connection, id: &str) -> StoreResult<Option<Incident>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM incidents WHERE id = ?1", INCIDENT_COLUMNS),
            params![id],
            incident_from_row,
        )
        .optional()?)
}

/// Write the mutable fields of `incident` if the stored version still equals
/// `incident.version`. On success the stored version is bumped by one.
///
/// Returns `false` when another writer got there first.
pub fn update_incident_versioned(conn: &Connection, incident: &Incident) -> StoreResult<bool> {
    let changed = conn.execute(
        "UPDATE incidents SET
            status = ?2,
            escalation_status = ?3,
            escalation_policy_id = ?4,
            current_level = ?5,
            escalation_cycle = ?6,
            last_escalated_at_ms = ?7,
            acknowledged_by = ?8,
            acknowledged_at_ms = ?9,
            resolved_by = ?10,
            resolved_at_ms = ?11,
            updated_at_ms = ?12,
            version = version + 1
         WHERE id = ?1 AND version = ?13",
        params![
            incident.id,
            incident.status.as_str(),
            incident.escalation_status.as_str(),
            incident.escalation_policy_id,
            incident.current_level,
            incident.escalation_cycle,
            incident.last_escalated_at.map(to_millis),
            incident.acknowledged_by,
            incident.acknowledged_at.map(to_millis),
            incident.resolved_by,
            incident.resolved_at.map(to_millis),
            to_millis(incident.updated_at),
            incident.version,
        ],
    )?;
    Ok(changed == 1)
}

pub fn incidents_with_escalation_status(
    conn: &Connection,
    status: EscalationStatus,
) -> StoreResult<Vec<Incident>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM incidents WHERE escalation_status = ?1 ORDER BY created_at_ms, id",
        INCIDENT_COLUMNS
    ))?;
    let rows = stmt.query_map(params![status.as_str()], incident_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ============================================================================
// Escalation audit rows
// ============================================================================

const STEP_COLUMNS: &str = "id, incident_id, policy_id, level_number, cycle, target_type,
    target_id, target_name, status, note, created_at_ms, updated_at_ms,
    acknowledged_at_ms, response_time_secs";

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<AlertEscalation> {
    Ok(AlertEscalation {
        id: row.get(0)?,
        incident_id: row.get(1)?,
        policy_id: row.get(2)?,
        level_number: row.get(3)?,
        cycle: row.get(4)?,
        target_type: row.get(5)?,
        target_id: row.get(6)?,
        target_name: row.get(7)?,
        status: text_col(row, 8)?,
        note: row.get(9)?,
        created_at: ts_col(row, 10)?,
        updated_at: ts_col(row, 11)?,
        acknowledged_at: opt_ts_col(row, 12)?,
        response_time_secs: row.get(13)?,
    })
}

pub fn insert_escalation_step(conn: &Connection, step: &NewEscalationStep) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO alert_escalations
            (incident_id, policy_id, level_number, cycle, target_type, target_id,
             target_name, status, note, created_at_ms, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            step.incident_id,
            step.policy_id,
            step.level_number,
            step.cycle,
            step.target_type,
            step.target_id,
            step.target_name,
            step.status.as_str(),
            step.note,
            to_millis(step.created_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Move every `executing` step of an incident to `status`.
pub fn close_executing_steps(
    conn: &Connection,
    incident_id: &str,
    status: StepStatus,
    now: DateTime<Utc>,
) -> StoreResult<usize> {
    Ok(conn.execute(
        "UPDATE alert_escalations SET status = ?2, updated_at_ms = ?3
         WHERE incident_id = ?1 AND status = 'executing'",
        params![incident_id, status.as_str(), to_millis(now)],
    )?)
}

/// Mark in-flight steps acknowledged and stamp their response time.
pub fn acknowledge_executing_steps(
    conn: &Connection,
    incident_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<usize> {
    let now_ms = to_millis(now);
    Ok(conn.execute(
        "UPDATE alert_escalations SET
            status = 'acknowledged',
            acknowledged_at_ms = ?2,
            updated_at_ms = ?2,
            response_time_secs = (?2 - created_at_ms) / 1000
         WHERE incident_id = ?1 AND status = 'executing'",
        params![incident_id, now_ms],
    )?)
}

pub fn steps_for_incident(conn: &Connection, incident_id: &str) -> StoreResult<Vec<AlertEscalation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM alert_escalations WHERE incident_id = ?1 ORDER BY id",
        STEP_COLUMNS
    ))?;
    let rows = stmt.query_map(params![incident_id], step_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ============================================================================
// Notification preferences
// ============================================================================

pub fn get_notification_config(
    conn: &Connection,
    user_id: &str,
) -> StoreResult<Option<NotificationConfig>> {
    Ok(conn
        .query_row(
            "SELECT config_json FROM notification_configs WHERE user_id = ?1",
            params![user_id],
            |row| json_col(row, 0),
        )
        .optional()?)
}

pub fn upsert_notification_config(
    conn: &Connection,
    config: &NotificationConfig,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO notification_configs (user_id, config_json, updated_at_ms) VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id) DO UPDATE SET
            config_json = excluded.config_json,
            updated_at_ms = excluded.updated_at_ms",
        params![config.user_id, to_json(config)?, to_millis(now)],
    )?;
    Ok(())
}

/// Insert the permissive default unless a row already exists, then read back.
pub fn notification_config_or_default(
    conn: &Connection,
    user_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<NotificationConfig> {
    let default = NotificationConfig::permissive(user_id);
    conn.execute(
        "INSERT OR IGNORE INTO notification_configs (user_id, config_json, updated_at_ms)
         VALUES (?1, ?2, ?3)",
        params![user_id, to_json(&default)?, to_millis(now)],
    )?;
    Ok(get_notification_config(conn, user_id)?.unwrap_or(default))
}

// ============================================================================
// Delivery log
// ============================================================================

const DELIVERY_COLUMNS: &str = "notification_id, channel, recipient_kind, recipient_id,
    incident_id, status, retry_count, error_message, created_at_ms, updated_at_ms, sent_at_ms";

fn delivery_from_row(row: &Row<'_>) -> rusqlite::Result<NotificationLog> {
    let kind: String = row.get(2)?;
    let recipient = Recipient::from_parts(&kind, row.get(3)?)
        .map_err(|e| conversion_error(2, Type::Text, e))?;
    Ok(NotificationLog {
        notification_id: row.get(0)?,
        channel: text_col(row, 1)?,
        recipient,
        incident_id: row.get(4)?,
        status: text_col(row, 5)?,
        retry_count: row.get(6)?,
        error_message: row.get(7)?,
        created_at: ts_col(row, 8)?,
        updated_at: ts_col(row, 9)?,
        sent_at: opt_ts_col(row, 10)?,
    })
}

pub fn get_delivery(
    conn: &Connection,
    notification_id: &str,
    channel: Channel,
) -> StoreResult<Option<NotificationLog>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM notification_logs WHERE notification_id = ?1 AND channel = ?2",
                DELIVERY_COLUMNS
            ),
            params![notification_id, channel.as_str()],
            delivery_from_row,
        )
        .optional()?)
}

/// Insert or move a delivery row forward.
///
/// A row that already reached `sent` is never overwritten. Returns whether
/// the row was written.
pub fn upsert_delivery(conn: &Connection, log: &NotificationLog) -> StoreResult<bool> {
    let changed = conn.execute(
        "INSERT INTO notification_logs
            (notification_id, channel, recipient_kind, recipient_id, incident_id, status,
             retry_count, error_message, created_at_ms, updated_at_ms, sent_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(notification_id, channel) DO UPDATE SET
            status = excluded.status,
            retry_count = excluded.retry_count,
            error_message = excluded.error_message,
            updated_at_ms = excluded.updated_at_ms,
            sent_at_ms = COALESCE(excluded.sent_at_ms, notification_logs.sent_at_ms)
         WHERE notification_logs.status != 'sent'",
        params![
            log.notification_id,
            log.channel.as_str(),
            log.recipient.kind(),
            log.recipient.id(),
            log.incident_id,
            log.status.as_str(),
            log.retry_count,
            log.error_message,
            to_millis(log.created_at),
            to_millis(log.updated_at),
            log.sent_at.map(to_millis),
        ],
    )?;
    Ok(changed > 0)
}

pub fn deliveries_for_incident(
    conn: &Connection,
    incident_id: &str,
) -> StoreResult<Vec<NotificationLog>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM notification_logs WHERE incident_id = ?1 ORDER BY created_at_ms, notification_id, channel",
        DELIVERY_COLUMNS
    ))?;
    let rows = stmt.query_map(params![incident_id], delivery_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn deliveries_for_notification(
    conn: &Connection,
    notification_id: &str,
) -> StoreResult<Vec<NotificationLog>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM notification_logs WHERE notification_id = ?1 ORDER BY channel",
        DELIVERY_COLUMNS
    ))?;
    let rows = stmt.query_map(params![notification_id], delivery_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
