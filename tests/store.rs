//! # Store Integration Tests
//!
//! End-to-end coverage of the direct store surface: round-trips, growth
//! transparency across backend reallocation, deletion under rebalancing,
//! and reopen of memory-mapped files.

use tanoak::{Store, StoreError};

#[test]
fn small_capacity_store_grows_through_ten_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_mapped(dir.path(), "basic.tdb", 64).unwrap();

    for i in 1..=10 {
        let key = i.to_string();
        store.put(key.as_bytes(), key.as_bytes()).unwrap();
    }

    assert_eq!(store.get(b"5").unwrap(), Some(b"5".to_vec()));
    store.close().unwrap();

    let reopened = Store::open_mapped(dir.path(), "basic.tdb", 64).unwrap();
    assert_eq!(reopened.get(b"5").unwrap(), Some(b"5".to_vec()));
    for i in 1..=10 {
        let key = i.to_string();
        assert_eq!(reopened.get(key.as_bytes()).unwrap(), Some(key.into_bytes()));
    }
    reopened.validate().unwrap();
}

#[test]
fn descending_inserts_then_ascending_deletes_hold_invariants() {
    let store = Store::open(64).unwrap();

    let keys: Vec<String> = (0..1000).map(|i| format!("{i:06}")).collect();
    for key in keys.iter().rev() {
        store.put(key.as_bytes(), key.as_bytes()).unwrap();
    }
    store.validate().unwrap();
    assert_eq!(store.len().unwrap(), 1000);

    for (deleted, key) in keys.iter().enumerate() {
        store.delete(key.as_bytes()).unwrap();
        store.validate().unwrap();

        assert_eq!(store.get(key.as_bytes()).unwrap(), None);
        assert_eq!(store.len().unwrap(), (1000 - deleted - 1) as i64);

        // Spot-check survivors around the deletion frontier plus the tail.
        for other in [deleted + 1, deleted + 2, 500, 999] {
            if other > deleted && other < 1000 {
                let k = &keys[other];
                assert_eq!(
                    store.get(k.as_bytes()).unwrap(),
                    Some(k.clone().into_bytes()),
                    "key {k} lost after deleting {key}"
                );
            }
        }
    }

    assert_eq!(store.len().unwrap(), 0);
}

#[test]
fn growth_preserves_every_previous_key() {
    let store = Store::open(64).unwrap();
    let value = vec![0x5A; 256];

    for i in 0..200 {
        let key = format!("key-{i:04}");
        store.put(key.as_bytes(), &value).unwrap();

        // Everything inserted before this growth-heavy put must still read
        // back exactly.
        if i % 50 == 0 {
            for j in 0..=i {
                let prev = format!("key-{j:04}");
                assert_eq!(store.get(prev.as_bytes()).unwrap(), Some(value.clone()));
            }
        }
    }

    store.validate().unwrap();
}

#[test]
fn for_each_is_ordered_and_interruptible() {
    let store = Store::open(1024).unwrap();
    for key in ["delta", "alpha", "echo", "charlie", "bravo"] {
        store.put(key.as_bytes(), b"x").unwrap();
    }

    let mut seen = Vec::new();
    let ended = store
        .for_each(|k, _| {
            seen.push(String::from_utf8(k.to_vec()).unwrap());
            false
        })
        .unwrap();

    assert!(!ended);
    assert_eq!(seen, vec!["alpha", "bravo", "charlie", "delta", "echo"]);

    let mut count = 0;
    let ended = store
        .for_each(|_, _| {
            count += 1;
            count == 2
        })
        .unwrap();

    assert!(ended);
    assert_eq!(count, 2);
}

#[test]
fn mixed_workload_reuses_reclaimed_space() {
    let store = Store::open(1024).unwrap();

    for round in 0..5 {
        for i in 0..100 {
            let key = format!("r{round}-{i:03}");
            store.put(key.as_bytes(), b"payload-payload-payload").unwrap();
        }
        for i in 0..100 {
            let key = format!("r{round}-{i:03}");
            store.delete(key.as_bytes()).unwrap();
        }
        store.validate().unwrap();
    }

    assert_eq!(store.len().unwrap(), 0);
}

#[test]
fn values_can_change_size_in_place() {
    let store = Store::open(256).unwrap();

    store.put(b"k", b"short").unwrap();
    store.put(b"k", b"a considerably longer value than before").unwrap();
    assert_eq!(
        store.get(b"k").unwrap(),
        Some(b"a considerably longer value than before".to_vec())
    );

    store.put(b"k", b"tiny").unwrap();
    assert_eq!(store.get(b"k").unwrap(), Some(b"tiny".to_vec()));
    assert_eq!(store.len().unwrap(), 1);
    store.validate().unwrap();
}

#[test]
fn grow_value_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = Store::open_mapped(dir.path(), "grown.tdb", 128).unwrap();
        let value = store.grow_value(b"slot", 24).unwrap();
        assert_eq!(value, vec![0u8; 24]);
        store.sync().unwrap();
        store.close().unwrap();
    }

    let store = Store::open_mapped(dir.path(), "grown.tdb", 128).unwrap();
    assert_eq!(store.get(b"slot").unwrap(), Some(vec![0u8; 24]));
}

#[test]
fn closed_store_reports_already_closed_everywhere() {
    let store = Store::open(64).unwrap();
    store.close().unwrap();

    let err = store.len().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::AlreadyClosed)
    ));

    let err = store.close().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::AlreadyClosed)
    ));
}
