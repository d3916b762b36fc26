//! SQLite-backed store for schedules, policies, incidents and delivery state
//!
//! One connection guarded by a mutex. Multi-row state changes go through
//! [`Store::transaction`], which opens an `IMMEDIATE` transaction so that a
//! read-check-write sequence cannot interleave with another writer.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use super::rows;
use super::schema::{MIGRATION_V1, SCHEMA_VERSION};
use super::types::*;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid stored data: {0}")]
    InvalidData(#[from] UnknownVariant),

    #[error("Database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to Store
pub type SharedStore = Arc<Store>;

/// Persistent store
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open or create a store at the given path
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Self::init(conn, Some(path))
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> StoreResult<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedStore {
        Arc::new(self)
    }

    /// Database path, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Run `f` against the connection outside of an explicit transaction.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside an immediate transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise. The error type is
    /// the caller's so that domain outcomes which must discard partial writes
    /// (a lost version race, for instance) can be expressed as errors.
    pub fn transaction<T, E>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let out = f(&tx)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }

    /// Current schema version of the open database
    pub fn schema_version(&self) -> StoreResult<i64> {
        self.read(user_version)
    }

    // =========================================================================
    // Schedule operations
    // =========================================================================

    pub fn put_scheduler(&self, scheduler: &Scheduler) -> StoreResult<()> {
        self.read(|c| rows::upsert_scheduler(c, scheduler))
    }

    pub fn put_shift(&self, shift: &Shift) -> StoreResult<()> {
        self.read(|c| rows::upsert_shift(c, shift))
    }

    pub fn put_override(&self, ov: &Override) -> StoreResult<()> {
        self.read(|c| rows::upsert_override(c, ov))
    }

    // =========================================================================
    // Policy operations
    // =========================================================================

    pub fn put_policy(&self, policy: &EscalationPolicy) -> StoreResult<()> {
        self.read(|c| rows::upsert_policy(c, policy))
    }

    pub fn put_level(&self, level: &EscalationLevel) -> StoreResult<()> {
        self.read(|c| rows::upsert_level(c, level))
    }

    pub fn get_policy(&self, policy_id: &str) -> StoreResult<Option<EscalationPolicy>> {
        self.read(|c| rows::get_policy(c, policy_id))
    }

    pub fn levels_for_policy(&self, policy_id: &str) -> StoreResult<Vec<EscalationLevel>> {
        self.read(|c| rows::levels_for_policy(c, policy_id))
    }

    // =========================================================================
    // Incident operations
    // =========================================================================

    pub fn insert_incident(&self, incident: &Incident) -> StoreResult<()> {
        self.read(|c| rows::insert_incident(c, incident))
    }

    pub fn get_incident(&self, incident_id: &str) -> StoreResult<Option<Incident>> {
        self.read(|c| rows::get_incident(c, incident_id))
    }

    /// Incidents whose escalation is in the given state
    pub fn incidents_with_escalation_status(
        &self,
        status: EscalationStatus,
    ) -> StoreResult<Vec<Incident>> {
        self.read(|c| rows::incidents_with_escalation_status(c, status))
    }

    /// Escalation audit rows of an incident in insertion order
    pub fn escalation_steps(&self, incident_id: &str) -> StoreResult<Vec<AlertEscalation>> {
        self.read(|c| rows::steps_for_incident(c, incident_id))
    }

    // =========================================================================
    // Notification preference operations
    // =========================================================================

    pub fn put_notification_config(
        &self,
        config: &NotificationConfig,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.read(|c| rows::upsert_notification_config(c, config, now))
    }

    pub fn get_notification_config(&self, user_id: &str) -> StoreResult<Option<NotificationConfig>> {
        self.read(|c| rows::get_notification_config(c, user_id))
    }

    /// Get a user's preferences, creating the permissive default on first use
    pub fn notification_config_or_default(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<NotificationConfig> {
        self.read(|c| rows::notification_config_or_default(c, user_id, now))
    }

    // =========================================================================
    // Delivery log operations
    // =========================================================================

    pub fn delivery(
        &self,
        notification_id: &str,
        channel: Channel,
    ) -> StoreResult<Option<NotificationLog>> {
        self.read(|c| rows::get_delivery(c, notification_id, channel))
    }

    pub fn record_delivery(&self, log: &NotificationLog) -> StoreResult<bool> {
        self.read(|c| rows::upsert_delivery(c, log))
    }

    pub fn deliveries_for_incident(&self, incident_id: &str) -> StoreResult<Vec<NotificationLog>> {
        self.read(|c| rows::deliveries_for_incident(c, incident_id))
    }

    pub fn deliveries_for_notification(
        &self,
        notification_id: &str,
    ) -> StoreResult<Vec<NotificationLog>> {
        self.read(|c| rows::deliveries_for_notification(c, notification_id))
    }
}

// ============================================================================
// Migrations
// ============================================================================

fn user_version(conn: &Connection) -> StoreResult<i64> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

fn migrate(conn: &Connection) -> StoreResult<()> {
    let found = user_version(conn)?;
    if found > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchema {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    if found < 1 {
        conn.execute_batch(MIGRATION_V1)?;
        conn.pragma_update(None, "user_version", 1)?;
        info!(version = 1, "Applied store migration");
    } else {
        debug!(version = found, "Store schema up to date");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    fn test_store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn test_open_on_disk_migrates_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("oncall.db");
        {
            let store = Store::open(&path).unwrap();
            assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
            store
                .put_scheduler(&Scheduler {
                    id: "s1".into(),
                    group_id: "g1".into(),
                    name: "primary".into(),
                    active: true,
                })
                .unwrap();
        }
        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.path(), Some(path.as_path()));
        let found = reopened
            .read(|c| rows::get_scheduler(c, "s1"))
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "primary");
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("future.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
                .unwrap();
        }
        let err = Store::open(&path).err().unwrap();
        assert!(matches!(err, StoreError::UnsupportedSchema { .. }));
    }

    #[test]
    fn test_incident_versioned_update() {
        let store = test_store();
        let mut incident = Incident::new("g1", "disk full", Priority::High, None, t0());
        store.insert_incident(&incident).unwrap();

        incident.status = IncidentStatus::Acknowledged;
        assert!(store
            .read(|c| rows::update_incident_versioned(c, &incident))
            .unwrap());

        // Same expected version again loses the race
        assert!(!store
            .read(|c| rows::update_incident_versioned(c, &incident))
            .unwrap());

        let stored = store.get_incident(&incident.id).unwrap().unwrap();
        assert_eq!(stored.status, IncidentStatus::Acknowledged);
        assert_eq!(stored.version, incident.version + 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let store = test_store();
        let incident = Incident::new("g1", "cpu", Priority::Low, None, t0());

        let result: StoreResult<()> = store.transaction(|tx| {
            rows::insert_incident(tx, &incident)?;
            Err(StoreError::Serialization("abort".into()))
        });
        assert!(result.is_err());
        assert!(store.get_incident(&incident.id).unwrap().is_none());
    }

    #[test]
    fn test_levels_roundtrip_and_malformed_rows_skipped() {
        let store = test_store();
        store
            .put_level(&EscalationLevel {
                policy_id: "p1".into(),
                level_number: 1,
                target: EscalationTarget::Scheduler("s1".into()),
                timeout_minutes: Some(5),
                channels: vec![Channel::Sms, Channel::Email],
                message_template: None,
            })
            .unwrap();
        store
            .read(|c| {
                c.execute(
                    "INSERT INTO escalation_levels (policy_id, level_number, target_type, target_id)
                     VALUES ('p1', 2, 'carrier_pigeon', 'x')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let levels = store.levels_for_policy("p1").unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].target, EscalationTarget::Scheduler("s1".into()));
        assert_eq!(levels[0].channels, vec![Channel::Sms, Channel::Email]);
    }

    #[test]
    fn test_notification_config_created_lazily() {
        let store = test_store();
        assert!(store.get_notification_config("u1").unwrap().is_none());

        let cfg = store.notification_config_or_default("u1", t0()).unwrap();
        assert_eq!(cfg, NotificationConfig::permissive("u1"));

        let mut custom = cfg.clone();
        custom.sms.enabled = false;
        store.put_notification_config(&custom, t0()).unwrap();
        let again = store.notification_config_or_default("u1", t0()).unwrap();
        assert!(!again.sms.enabled);
    }

    #[test]
    fn test_sent_delivery_is_never_overwritten() {
        let store = test_store();
        let mut log = NotificationLog {
            notification_id: "n1".into(),
            channel: Channel::Email,
            recipient: Recipient::User("u1".into()),
            incident_id: "i1".into(),
            status: DeliveryStatus::Sent,
            retry_count: 0,
            error_message: None,
            created_at: t0(),
            updated_at: t0(),
            sent_at: Some(t0()),
        };
        assert!(store.record_delivery(&log).unwrap());

        log.status = DeliveryStatus::Failed;
        log.updated_at = t0() + Duration::seconds(30);
        assert!(!store.record_delivery(&log).unwrap());

        let stored = store.delivery("n1", Channel::Email).unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Sent);
        assert_eq!(store.deliveries_for_incident("i1").unwrap().len(), 1);
    }
}
