mod common;

use arbor::{EngineConfig, Store, StoreError};
use tempfile::tempdir;

#[test]
fn open_creates_database_and_reopens() {
    let dir = tempdir().unwrap();
    let config = EngineConfig::default();
    let store = Store::open(dir.path(), "alice", &config).unwrap();
    assert_eq!(store.user_key(), "alice");
    assert!(store.path().exists());
    drop(store);

    let again = Store::open(dir.path(), "alice", &config).unwrap();
    assert_eq!(again.outbox_depth().unwrap(), 0);
}

#[test]
fn user_key_is_sanitized_for_the_filename() {
    let dir = tempdir().unwrap();
    let config = EngineConfig::default();
    let store = Store::open(dir.path(), "a/b:c../d", &config).unwrap();
    assert_eq!(store.user_key(), "abcd");
    let file = store.path().file_name().unwrap().to_string_lossy().to_string();
    assert_eq!(file, "abcd.db");
}

#[test]
fn empty_user_key_defaults_to_anon() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path(), "::", &EngineConfig::default()).unwrap();
    assert_eq!(store.user_key(), "anon");
}

#[test]
fn missing_backend_is_a_typed_error() {
    let dir = tempdir().unwrap();
    // A regular file in place of the data directory: no usable backend.
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();
    let err = Store::open(blocker.join("sub"), "alice", &EngineConfig::default()).unwrap_err();
    assert!(
        matches!(err, StoreError::NoBackend(_)),
        "expected NoBackend, got {err:?}"
    );
}

#[test]
fn garbage_database_file_is_invalid_state() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("alice.db"), b"this is not a sqlite file at all")
        .unwrap();
    let err = Store::open(dir.path(), "alice", &EngineConfig::default()).unwrap_err();
    assert!(
        matches!(err, StoreError::InvalidState(_) | StoreError::Unknown(_)),
        "expected InvalidState, got {err:?}"
    );
}

#[test]
fn distinct_users_get_distinct_databases() {
    let dir = tempdir().unwrap();
    let config = EngineConfig::default();
    let a = Store::open(dir.path(), "alice", &config).unwrap();
    let b = Store::open(dir.path(), "bob", &config).unwrap();
    assert_ne!(a.path(), b.path());
}
