//! E2E integration test: saving and restoring a store through storage.
//!
//! Validates:
//! 1. Save, clear, restore round trip in memory and on disk.
//! 2. Debounce timing driven by a manual clock.
//! 3. Restores do not re-arm the debounce.
//! 4. Degraded paths: bad envelopes, undecodable values, type conflicts,
//!    and failing backends are logged and never disturb in-memory state.

#![forbid(unsafe_code)]

use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use statewire_core::{Component, RecordingDelegate, Store, StoreConfig, WriteOptions};
use statewire_persist::{
    FileStorage, ManualClock, MemoryStorage, PersistConfig, PersistError, Persistence, Storage,
};
use web_time::Duration;

// ── Helpers ─────────────────────────────────────────────────────────────

const WINDOW: Duration = Duration::from_millis(500);

fn recorded_store() -> (Store, Rc<RecordingDelegate>) {
    let delegate = RecordingDelegate::new();
    (
        Store::with_delegate(StoreConfig::default(), delegate.clone()),
        delegate,
    )
}

fn write<T: statewire_core::CellValue>(store: &Store, key: &str, value: T) {
    store
        .write(key, value, WriteOptions::default())
        .expect("write accepted");
}

fn adapter<S: Storage + 'static>(
    store: &Store,
    storage: S,
) -> (Persistence<S, ManualClock>, ManualClock) {
    let clock = ManualClock::new();
    let persistence = Persistence::with_clock(
        store,
        storage,
        PersistConfig::default().with_debounce(WINDOW),
        clock.clone(),
    );
    persistence.track::<i64>("counter");
    persistence.track::<String>("name");
    (persistence, clock)
}

fn stored_data(storage: &MemoryStorage) -> Value {
    let bytes = storage.get("statewire").expect("envelope stored");
    let envelope: Value = serde_json::from_slice(&bytes).expect("valid json");
    envelope["data"].clone()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Layout {
    sidebar: bool,
    split: u16,
}
statewire_persist::persist_via_serde!(Layout);

/// Serializes to a JSON map with non-string keys, which serde_json rejects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Grid {
    cells: std::collections::BTreeMap<(u8, u8), u8>,
}
statewire_persist::persist_via_serde!(Grid);

/// Backend that refuses every operation.
struct BrokenStorage;

impl Storage for BrokenStorage {
    fn read(&self, _key: &str) -> statewire_persist::Result<Option<Vec<u8>>> {
        Err(PersistError::backend("disk unavailable"))
    }

    fn write(&self, _key: &str, _bytes: &[u8]) -> statewire_persist::Result<()> {
        Err(PersistError::backend("disk unavailable"))
    }

    fn remove(&self, _key: &str) -> statewire_persist::Result<()> {
        Err(PersistError::backend("disk unavailable"))
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 1. Round trip
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn save_clear_restore_in_memory() {
    let (store, _delegate) = recorded_store();
    let storage = MemoryStorage::new();
    let (persistence, _clock) = adapter(&store, storage.clone());

    write(&store, "counter", 5_i64);
    write(&store, "name", "Alice".to_owned());
    write(&store, "scratch", 99_i64);
    assert!(persistence.save_now());
    assert_eq!(stored_data(&storage), json!({"counter": 5, "name": "Alice"}));

    store.clear();
    assert!(!store.exists("counter"));

    assert_eq!(persistence.restore(), 2);
    assert_eq!(store.read::<i64>("counter").unwrap(), Some(5));
    assert_eq!(store.read::<String>("name").unwrap().as_deref(), Some("Alice"));
    assert!(!store.exists("scratch"));
}

#[test]
fn absent_tracked_keys_are_omitted() {
    let (store, _delegate) = recorded_store();
    let storage = MemoryStorage::new();
    let (persistence, _clock) = adapter(&store, storage.clone());

    write(&store, "counter", 1_i64);
    assert!(persistence.save_now());
    assert_eq!(stored_data(&storage), json!({"counter": 1}));
}

#[test]
fn structured_values_survive_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let layout = Layout {
        sidebar: true,
        split: 30,
    };
    {
        let store = Store::new();
        let persistence =
            Persistence::new(&store, FileStorage::new(dir.path()), PersistConfig::default());
        persistence.track::<Layout>("ui.layout");
        write(&store, "ui.layout", layout.clone());
        assert!(persistence.save_now());
    }
    assert!(dir.path().join("statewire.json").exists());

    let store = Store::new();
    let persistence =
        Persistence::new(&store, FileStorage::new(dir.path()), PersistConfig::default());
    persistence.track::<Layout>("ui.layout");
    assert_eq!(persistence.restore(), 1);
    assert_eq!(store.read::<Layout>("ui.layout").unwrap(), Some(layout));
}

#[test]
fn custom_storage_key_is_used() {
    let store = Store::new();
    let storage = MemoryStorage::new();
    let persistence = Persistence::new(
        &store,
        storage.clone(),
        PersistConfig::default().with_storage_key("editor"),
    );
    persistence.track::<i64>("counter");
    write(&store, "counter", 3_i64);
    assert!(persistence.save_now());
    assert!(storage.contains("editor"));
    assert!(!storage.contains("statewire"));

    assert!(persistence.clear_storage());
    assert!(storage.is_empty());
}

#[test]
fn nothing_stored_restores_nothing() {
    let (store, delegate) = recorded_store();
    let (persistence, _clock) = adapter(&store, MemoryStorage::new());
    assert_eq!(persistence.restore(), 0);
    assert!(delegate.errors().is_empty());
}

// ═════════════════════════════════════════════════════════════════════════
// 2. Debounce
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn tracked_change_saves_after_quiet_period() {
    let store = Store::new();
    let storage = MemoryStorage::new();
    let (persistence, clock) = adapter(&store, storage.clone());

    write(&store, "counter", 1_i64);
    assert!(persistence.is_pending());

    clock.advance(Duration::from_millis(300));
    write(&store, "counter", 2_i64);
    clock.advance(Duration::from_millis(300));
    assert!(!persistence.tick(), "second write restarted the window");
    assert!(storage.is_empty());

    clock.advance(Duration::from_millis(200));
    assert!(persistence.tick());
    assert_eq!(stored_data(&storage), json!({"counter": 2}));
    assert!(!persistence.is_pending());
    assert!(!persistence.tick());
}

#[test]
fn untracked_changes_do_not_arm() {
    let store = Store::new();
    let (persistence, _clock) = adapter(&store, MemoryStorage::new());
    write(&store, "scratch", 1_i64);
    assert!(!persistence.is_pending());

    assert!(persistence.untrack("counter"));
    write(&store, "counter", 1_i64);
    assert!(!persistence.is_pending());
    assert_eq!(persistence.tracked_keys(), vec!["name".to_owned()]);
}

#[test]
fn flush_saves_only_when_pending() {
    let store = Store::new();
    let storage = MemoryStorage::new();
    let (persistence, _clock) = adapter(&store, storage.clone());
    assert!(!persistence.flush());

    write(&store, "name", "Bob".to_owned());
    assert!(persistence.flush());
    assert_eq!(stored_data(&storage), json!({"name": "Bob"}));
    assert!(!persistence.is_pending());
}

#[test]
fn restore_does_not_rearm() {
    let store = Store::new();
    let storage = MemoryStorage::new();
    let (persistence, _clock) = adapter(&store, storage.clone());
    write(&store, "counter", 5_i64);
    assert!(persistence.save_now());

    store.remove("counter");
    assert!(!persistence.is_pending(), "removal is not a change notification");

    assert_eq!(persistence.restore(), 1);
    assert!(!persistence.is_pending());
}

#[test]
fn restored_writes_carry_persistence_source() {
    let store = Store::new();
    let storage = MemoryStorage::new();
    let (persistence, _clock) = adapter(&store, storage.clone());
    write(&store, "counter", 5_i64);
    assert!(persistence.save_now());
    store.remove("counter");

    let sources = Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = Rc::clone(&sources);
    store.subscribe_state(move |change| {
        sink.borrow_mut()
            .push(change.source_module_id().map(str::to_owned));
    });
    persistence.restore();
    assert_eq!(
        *sources.borrow(),
        vec![Some(statewire_persist::PERSISTENCE_SOURCE.to_owned())]
    );
}

// ═════════════════════════════════════════════════════════════════════════
// 3. Degraded paths
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn unsupported_version_restores_nothing() {
    let (store, delegate) = recorded_store();
    let storage = MemoryStorage::new();
    storage
        .write(
            "statewire",
            br#"{"version":2,"timestamp":"2026-01-01T00:00:00Z","data":{"counter":5}}"#,
        )
        .unwrap();
    let (persistence, _clock) = adapter(&store, storage);

    assert_eq!(persistence.restore(), 0);
    assert!(!store.exists("counter"));
    let errors = delegate.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].component, Component::Persistence);
    assert!(errors[0].message.contains("unsupported envelope version 2"));
    assert!(matches!(
        persistence.try_restore(),
        Err(PersistError::UnsupportedVersion { found: 2, .. })
    ));
}

#[test]
fn undecodable_key_is_skipped_others_applied() {
    let (store, delegate) = recorded_store();
    let storage = MemoryStorage::new();
    storage
        .write(
            "statewire",
            br#"{"version":1,"timestamp":"2026-01-01T00:00:00Z","data":{"counter":"five","name":"Alice"}}"#,
        )
        .unwrap();
    let (persistence, _clock) = adapter(&store, storage);

    assert_eq!(persistence.restore(), 1);
    assert!(!store.exists("counter"));
    assert_eq!(store.read::<String>("name").unwrap().as_deref(), Some("Alice"));
    let skipped: Vec<_> = delegate
        .logs()
        .into_iter()
        .filter(|log| log.key.as_deref() == Some("counter"))
        .collect();
    assert_eq!(skipped.len(), 1);
    assert!(!skipped[0].is_error);
}

#[test]
fn type_conflict_on_restore_is_logged() {
    let (store, delegate) = recorded_store();
    let storage = MemoryStorage::new();
    let (persistence, _clock) = adapter(&store, storage.clone());
    write(&store, "counter", 7_i64);
    assert!(persistence.save_now());

    store.remove("counter");
    write(&store, "counter", "seven".to_owned());
    assert_eq!(persistence.restore(), 0);
    assert_eq!(store.read::<String>("counter").unwrap().as_deref(), Some("seven"));
    let errors = delegate.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].key.as_deref(), Some("counter"));
}

#[test]
fn type_conflict_on_save_skips_only_that_key() {
    let (store, delegate) = recorded_store();
    let storage = MemoryStorage::new();
    let (persistence, _clock) = adapter(&store, storage.clone());

    write(&store, "counter", "five".to_owned());
    write(&store, "name", "Alice".to_owned());
    assert!(persistence.save_now());
    assert_eq!(stored_data(&storage), json!({"name": "Alice"}));

    let errors = delegate.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].component, Component::Persistence);
    assert_eq!(errors[0].key.as_deref(), Some("counter"));
}

#[test]
fn unencodable_value_is_reported_and_skipped() {
    let (store, delegate) = recorded_store();
    let storage = MemoryStorage::new();
    let (persistence, _clock) = adapter(&store, storage.clone());
    persistence.track::<Grid>("board");

    let mut cells = std::collections::BTreeMap::new();
    cells.insert((1, 2), 3);
    write(&store, "board", Grid { cells });
    write(&store, "counter", 4_i64);
    assert!(persistence.save_now());
    assert_eq!(stored_data(&storage), json!({"counter": 4}));

    let errors = delegate.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].key.as_deref(), Some("board"));
    assert!(errors[0].message.contains("encoding failed"));
}

#[test]
fn failing_backend_keeps_state_and_rearms() {
    let (store, delegate) = recorded_store();
    let (persistence, clock) = adapter(&store, BrokenStorage);

    write(&store, "counter", 1_i64);
    clock.advance(WINDOW);
    assert!(!persistence.tick());
    assert_eq!(store.read::<i64>("counter").unwrap(), Some(1));
    assert!(!persistence.is_pending());
    assert_eq!(delegate.errors().len(), 1);
    assert!(delegate.errors()[0].message.contains("disk unavailable"));

    write(&store, "counter", 2_i64);
    assert!(persistence.is_pending());

    assert_eq!(persistence.restore(), 0);
    assert!(!persistence.clear_storage());
    assert_eq!(delegate.errors().len(), 3);
}

#[test]
fn corrupt_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("statewire.json"), b"{not json").unwrap();
    let (store, delegate) = recorded_store();
    let (persistence, _clock) = adapter(&store, FileStorage::new(dir.path()));

    assert_eq!(persistence.restore(), 0);
    assert!(matches!(persistence.try_restore(), Err(PersistError::Json(_))));
    assert_eq!(delegate.errors().len(), 1);
}

#[test]
fn dropping_adapter_stops_observing() {
    let store = Store::new();
    let before = store.observer_counts().states;
    let (persistence, _clock) = adapter(&store, MemoryStorage::new());
    assert_eq!(store.observer_counts().states, before + 1);
    drop(persistence);
    assert_eq!(store.observer_counts().states, before);
}
