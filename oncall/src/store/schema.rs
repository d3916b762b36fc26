//! Table definitions for the SQLite store
//!
//! Timestamps are UTC epoch milliseconds so that range predicates (shift
//! windows, queue visibility deadlines) compare as integers.

/// Current schema version, tracked in `PRAGMA user_version`
pub const SCHEMA_VERSION: i64 = 1;

pub const T_SCHEDULERS: &str = "schedulers";
pub const T_SHIFTS: &str = "shifts";
pub const T_OVERRIDES: &str = "overrides";
pub const T_POLICIES: &str = "escalation_policies";
pub const T_LEVELS: &str = "escalation_levels";
pub const T_INCIDENTS: &str = "incidents";
pub const T_ALERT_ESCALATIONS: &str = "alert_escalations";
pub const T_NOTIFICATION_CONFIGS: &str = "notification_configs";
pub const T_NOTIFICATION_LOGS: &str = "notification_logs";
pub const T_NOTIFICATION_QUEUE: &str = "notification_queue";

/// All table names
pub const ALL_TABLES: &[&str] = &[
    T_SCHEDULERS,
    T_SHIFTS,
    T_OVERRIDES,
    T_POLICIES,
    T_LEVELS,
    T_INCIDENTS,
    T_ALERT_ESCALATIONS,
    T_NOTIFICATION_CONFIGS,
    T_NOTIFICATION_LOGS,
    T_NOTIFICATION_QUEUE,
];

/// Version 1 schema
pub const MIGRATION_V1: &str = "
CREATE TABLE IF NOT EXISTS schedulers (
    id          TEXT PRIMARY KEY,
    group_id    TEXT NOT NULL,
    name        TEXT NOT NULL DEFAULT '',
    active      INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_schedulers_group ON schedulers(group_id);

CREATE TABLE IF NOT EXISTS shifts (
    id              TEXT PRIMARY KEY,
    scheduler_id    TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    service_id      TEXT,
    start_ms        INTEGER NOT NULL,
    end_ms          INTEGER NOT NULL,
    active          INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_shifts_scheduler_window ON shifts(scheduler_id, start_ms, end_ms);

CREATE TABLE IF NOT EXISTS overrides (
    id                  TEXT PRIMARY KEY,
    original_shift_id   TEXT NOT NULL,
    new_user_id         TEXT NOT NULL,
    reason              TEXT,
    active              INTEGER NOT NULL DEFAULT 1,
    start_ms            INTEGER NOT NULL,
    end_ms              INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_overrides_shift ON overrides(original_shift_id);

CREATE TABLE IF NOT EXISTS escalation_policies (
    id                      TEXT PRIMARY KEY,
    group_id                TEXT NOT NULL,
    name                    TEXT NOT NULL DEFAULT '',
    repeat_max_times        INTEGER NOT NULL DEFAULT 1,
    escalate_after_minutes  INTEGER NOT NULL DEFAULT 0,
    active                  INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS escalation_levels (
    policy_id           TEXT NOT NULL,
    level_number        INTEGER NOT NULL,
    target_type         TEXT NOT NULL,
    target_id           TEXT,
    timeout_minutes     INTEGER,
    channels_json       TEXT NOT NULL DEFAULT '[]',
    message_template    TEXT,
    PRIMARY KEY (policy_id, level_number)
);

CREATE TABLE IF NOT EXISTS incidents (
    id                      TEXT PRIMARY KEY,
    title                   TEXT NOT NULL,
    group_id                TEXT NOT NULL,
    priority                TEXT NOT NULL,
    status                  TEXT NOT NULL,
    escalation_status       TEXT NOT NULL,
    escalation_policy_id    TEXT,
    current_level           INTEGER NOT NULL DEFAULT 0,
    escalation_cycle        INTEGER NOT NULL DEFAULT 0,
    last_escalated_at_ms    INTEGER,
    acknowledged_by         TEXT,
    acknowledged_at_ms      INTEGER,
    resolved_by             TEXT,
    resolved_at_ms          INTEGER,
    created_at_ms           INTEGER NOT NULL,
    updated_at_ms           INTEGER NOT NULL,
    version                 INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_incidents_escalation ON incidents(escalation_status);

CREATE TABLE IF NOT EXISTS alert_escalations (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    incident_id         TEXT NOT NULL,
    policy_id           TEXT NOT NULL,
    level_number        INTEGER NOT NULL,
    cycle               INTEGER NOT NULL,
    target_type         TEXT NOT NULL,
    target_id           TEXT,
    target_name         TEXT NOT NULL,
    status              TEXT NOT NULL,
    note                TEXT,
    created_at_ms       INTEGER NOT NULL,
    updated_at_ms       INTEGER NOT NULL,
    acknowledged_at_ms  INTEGER,
    response_time_secs  INTEGER
);
CREATE INDEX IF NOT EXISTS idx_alert_escalations_incident ON alert_escalations(incident_id, id);

CREATE TABLE IF NOT EXISTS notification_configs (
    user_id         TEXT PRIMARY KEY,
    config_json     TEXT NOT NULL,
    updated_at_ms   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS notification_logs (
    notification_id TEXT NOT NULL,
    channel         TEXT NOT NULL,
    recipient_kind  TEXT NOT NULL,
    recipient_id    TEXT NOT NULL,
    incident_id     TEXT NOT NULL,
    status          TEXT NOT NULL,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    error_message   TEXT,
    created_at_ms   INTEGER NOT NULL,
    updated_at_ms   INTEGER NOT NULL,
    sent_at_ms      INTEGER,
    PRIMARY KEY (notification_id, channel)
);
CREATE INDEX IF NOT EXISTS idx_notification_logs_incident ON notification_logs(incident_id);

CREATE TABLE IF NOT EXISTS notification_queue (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    notification_id         TEXT NOT NULL,
    incident_id             TEXT NOT NULL,
    recipient_kind          TEXT NOT NULL,
    recipient_id            TEXT NOT NULL,
    channel                 TEXT NOT NULL,
    requested_channels_json TEXT NOT NULL,
    priority                TEXT NOT NULL,
    subject                 TEXT NOT NULL,
    body                    TEXT NOT NULL,
    created_at_ms           INTEGER NOT NULL,
    retry_count             INTEGER NOT NULL DEFAULT 0,
    visible_at_ms           INTEGER NOT NULL,
    lease_token             TEXT,
    delivery_count          INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_notification_queue_visible ON notification_queue(visible_at_ms, id);
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_table_is_created() {
        for table in ALL_TABLES {
            let ddl = format!("CREATE TABLE IF NOT EXISTS {} (", table);
            assert!(MIGRATION_V1.contains(&ddl), "missing DDL for {}", table);
        }
    }
}
