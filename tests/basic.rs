use stripemap::{MapError, StripedMap};

#[test]
fn set_get_remove_string() {
    let m: StripedMap<String, String> = StripedMap::with_capacity(16);
    assert!(m.is_empty());

    m.set("a".to_string(), "1".to_string()).unwrap();
    assert_eq!(m.len(), 1);
    assert_eq!(m.get(&"a".to_string()), Some("1".to_string()));

    m.set("b".to_string(), "2".to_string()).unwrap();
    assert_eq!(m.len(), 2);
    assert_eq!(m.get(&"b".to_string()), Some("2".to_string()));

    // overwrite does not change the pair count
    m.set("a".to_string(), "10".to_string()).unwrap();
    assert_eq!(m.len(), 2);
    assert_eq!(m.get(&"a".to_string()), Some("10".to_string()));

    assert!(m.remove(&"b".to_string()));
    assert_eq!(m.len(), 1);
    assert_eq!(m.get(&"b".to_string()), None);
}

#[test]
fn insert_rejects_duplicate_keys() {
    let m: StripedMap<u64, String> = StripedMap::new();
    for i in 0..1000u64 {
        m.insert(i, i.to_string()).unwrap();
    }
    assert_eq!(m.len(), 1000);

    for i in 0..1000u64 {
        assert_eq!(
            m.insert(i, "x".to_string()),
            Err(MapError::DuplicateKey),
            "duplicate insert of {i} must fail"
        );
        assert_eq!(m.try_insert(i, "x".to_string()), Ok(false));
        assert_eq!(m.get(&i), Some(i.to_string()), "value of {i} must be untouched");
    }
    assert_eq!(m.len(), 1000);
}

#[test]
fn try_insert_only_adds_new_keys() {
    let m: StripedMap<i32, i32> = StripedMap::new();
    assert_eq!(m.try_insert(1, 7), Ok(true));
    assert_eq!(m.try_insert(1, 9), Ok(false));
    assert_eq!(m.get(&1), Some(7));
    assert_eq!(m.len(), 1);
}

#[test]
fn overwrite_chain_keeps_last_value() {
    const N: u64 = 100_000;
    let m: StripedMap<u64, String> = StripedMap::new();
    for i in 0..N {
        m.set(i, i.to_string()).unwrap();
    }
    for round in 1..=3u32 {
        for i in 0..N {
            m.set(i, format!("{i}{round}")).unwrap();
        }
    }
    assert_eq!(m.len(), N as usize);
    for i in 0..N {
        assert_eq!(m.get(&i), Some(format!("{i}3")));
    }
}

#[test]
fn remove_is_idempotent() {
    let m: StripedMap<i32, String> = StripedMap::new();
    m.insert(5, "five".to_string()).unwrap();
    assert!(m.remove(&5));
    assert!(!m.remove(&5));
    assert_eq!(m.len(), 0);
    assert!(!m.contains_key(&5));
}

#[test]
fn fetch_reports_missing_keys() {
    let m: StripedMap<String, i32> = StripedMap::new();
    m.insert("present".to_string(), 1).unwrap();
    assert_eq!(m.fetch(&"present".to_string()), Ok(1));
    assert_eq!(m.fetch(&"absent".to_string()), Err(MapError::KeyNotFound));
}

#[test]
fn optional_values_round_trip() {
    let m: StripedMap<String, Option<String>> = StripedMap::new();
    m.insert("missing".to_string(), None).unwrap();
    m.insert("present".to_string(), Some("v".to_string())).unwrap();

    assert_eq!(m.get(&"missing".to_string()), Some(None));
    assert_eq!(m.get(&"present".to_string()), Some(Some("v".to_string())));
    assert!(m.contains_key(&"missing".to_string()));
    assert_eq!(m.len(), 2);
}

#[test]
fn len_and_is_empty_semantics() {
    let m: StripedMap<i32, String> = StripedMap::new();
    assert!(m.is_empty());
    assert_eq!(m.len(), 0);

    for i in 0..10 {
        m.insert(i, format!("value_{i}")).unwrap();
        assert_eq!(m.len(), (i + 1) as usize);
        assert!(!m.is_empty());
    }

    for i in 0..10 {
        assert!(m.remove(&i));
        assert_eq!(m.len(), (9 - i) as usize);
    }
    assert!(m.is_empty());
}

#[test]
fn enumerate_and_remove_all() {
    let m: StripedMap<u32, String> = StripedMap::new();
    for i in 0..1000u32 {
        m.insert(i, i.to_string()).unwrap();
    }

    for (k, _) in m.iter() {
        assert!(m.remove(&k), "key {k} yielded but not removable");
    }

    assert_eq!(m.len(), 0);
    assert!(m.is_empty());
    for i in 0..1000u32 {
        assert!(!m.contains_key(&i));
    }
}

#[test]
fn multiple_keys_and_deletions() {
    let m: StripedMap<i32, String> = StripedMap::new();
    for i in 0..100 {
        m.set(i, format!("value_{i}")).unwrap();
    }

    for i in (0..100).step_by(2) {
        assert!(m.remove(&i));
    }

    for i in 0..100 {
        if i % 2 == 0 {
            assert_eq!(m.get(&i), None);
        } else {
            assert_eq!(m.get(&i), Some(format!("value_{i}")));
        }
    }
    assert_eq!(m.len(), 50);
}

#[test]
fn removed_slots_are_reused() {
    let m: StripedMap<u32, u32> = StripedMap::new();
    for i in 0..64u32 {
        m.insert(i, i).unwrap();
    }
    for i in 0..32u32 {
        assert!(m.remove(&i));
    }
    // re-inserts land on the free list, not fresh pool slots
    for i in 0..32u32 {
        m.insert(i, i + 1000).unwrap();
    }
    assert_eq!(m.len(), 64);
    for i in 0..32u32 {
        assert_eq!(m.get(&i), Some(i + 1000));
    }
    for i in 32..64u32 {
        assert_eq!(m.get(&i), Some(i));
    }
}

#[test]
fn edge_case_string_keys() {
    let m: StripedMap<String, String> = StripedMap::new();

    m.insert(String::new(), "empty_key_value".to_string()).unwrap();
    assert_eq!(m.get(&String::new()), Some("empty_key_value".to_string()));

    let long_key = "a".repeat(1000);
    m.insert(long_key.clone(), "long_key_value".to_string()).unwrap();
    assert_eq!(m.get(&long_key), Some("long_key_value".to_string()));

    assert_eq!(m.get(&String::new()), Some("empty_key_value".to_string()));
}

#[test]
fn from_iter_and_extend() {
    let m: StripedMap<i32, i32> = (0..50).map(|i| (i, i * 2)).collect();
    assert_eq!(m.len(), 50);
    assert_eq!(m.get(&7), Some(14));

    let mut m = m;
    m.extend((50..60).map(|i| (i, i * 2)));
    assert_eq!(m.len(), 60);
    assert_eq!(m.get(&55), Some(110));
}
