//! On-disk store tests: migrations survive reopen, fixtures import in one go.

use chrono::{TimeZone, Utc};
use oncall::resolver::{resolve, Scope};
use oncall::store::{schema::SCHEMA_VERSION, Fixture, Store, StoreError};

const FIXTURE: &str = r#"
schedulers:
  - { id: primary, group_id: payments }
shifts:
  - id: night
    scheduler_id: primary
    user_id: nina
    start: "2025-05-01T20:00:00Z"
    end: "2025-05-02T08:00:00Z"
overrides:
  - id: swap
    original_shift_id: night
    new_user_id: omar
    start: "2025-05-02T02:00:00Z"
    end: "2025-05-02T04:00:00Z"
policies:
  - id: payments-default
    group_id: payments
    repeat_max_times: 2
    levels:
      - { level_number: 1, target_type: current_schedule, timeout_minutes: 10 }
      - { level_number: 2, target_type: user, target_id: lead, channels: [sms] }
"#;

#[test]
fn test_fixture_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("oncall.db");

    {
        let store = Store::open(&path).unwrap();
        let summary = Fixture::from_yaml(FIXTURE)
            .unwrap()
            .import(&store, Utc::now())
            .unwrap();
        assert_eq!(summary.schedulers, 1);
        assert_eq!(summary.levels, 2);
    }

    let store = Store::open(&path).unwrap();
    assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
    assert_eq!(store.path(), Some(path.as_path()));

    let at = Utc.with_ymd_and_hms(2025, 5, 2, 3, 0, 0).unwrap();
    let who = resolve(&store, &Scope::Group("payments".into()), at)
        .unwrap()
        .unwrap();
    assert_eq!(who.effective_user_id, "omar");
    assert_eq!(who.original_user_id, "nina");

    let levels = store.levels_for_policy("payments-default").unwrap();
    assert_eq!(levels.len(), 2);
    assert_eq!(levels[0].timeout_minutes, Some(10));
    assert_eq!(
        store.get_policy("payments-default").unwrap().unwrap().repeat_max_times,
        2
    );
}

#[test]
fn test_newer_schema_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
    }
    match Store::open(&path) {
        Err(StoreError::UnsupportedSchema { found, .. }) => assert_eq!(found, SCHEMA_VERSION + 1),
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("store opened a newer schema"),
    }
}

#[test]
fn test_fixture_file_errors_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.yaml");
    assert!(Fixture::from_path(&missing).is_err());

    let bad = dir.path().join("bad.yaml");
    std::fs::write(&bad, "schedulers: [ { id: 1").unwrap();
    assert!(Fixture::from_path(&bad).is_err());
}
