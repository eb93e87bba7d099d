use stripemap::StripedMap;

#[test]
fn default_map_uses_minimum_segments() {
    let m: StripedMap<u64, u64> = StripedMap::new();
    assert_eq!(m.segments_count(), 7);
    assert!(m.capacity() > 0);
    assert!(!m.has_large_allocations());
}

#[test]
fn presized_map_is_stable_under_fill() {
    let m: StripedMap<u64, u64> = StripedMap::with_capacity(150_000);
    let segments = m.segments_count();
    let capacity = m.capacity();
    assert!(capacity >= 150_000);

    for i in 0..150_000u64 {
        m.insert(i, i).unwrap();
    }

    assert_eq!(m.len(), 150_000);
    assert_eq!(m.segments_count(), segments, "fill within capacity must not resize");
    assert_eq!(m.capacity(), capacity);
    assert!(!m.has_large_allocations());

    for i in (0..150_000u64).step_by(1013) {
        assert_eq!(m.get(&i), Some(i));
    }
}

#[test]
fn draining_shrinks_segments_and_capacity() {
    let m: StripedMap<u64, u64> = StripedMap::with_capacity(150_000);
    for i in 0..150_000u64 {
        m.insert(i, i).unwrap();
    }
    let filled_segments = m.segments_count();
    let filled_capacity = m.capacity();

    for (k, _) in m.iter() {
        assert!(m.remove(&k));
    }

    assert_eq!(m.len(), 0);
    assert!(m.segments_count() < filled_segments);
    assert!(m.capacity() < filled_capacity);
    assert!(!m.has_large_allocations());
}

#[test]
fn growth_from_default_capacity() {
    let m: StripedMap<u64, u64> = StripedMap::new();
    for i in 0..50_000u64 {
        m.set(i, i * 2).unwrap();
    }

    assert!(m.segments_count() > 7, "sustained adds must widen the stripe");
    assert_eq!(m.len(), 50_000);
    assert!(!m.has_large_allocations());

    for i in 0..50_000u64 {
        assert_eq!(m.get(&i), Some(i * 2));
    }
}

#[test]
fn fill_then_drain_returns_to_minimum() {
    let m: StripedMap<u32, String> = StripedMap::with_capacity(20_000);
    for i in 0..20_000u32 {
        m.insert(i, i.to_string()).unwrap();
    }
    let filled_segments = m.segments_count();
    let filled_capacity = m.capacity();
    assert!(filled_segments > 7);

    for i in 0..20_000u32 {
        assert!(m.remove(&i));
    }

    assert!(m.is_empty());
    assert!(m.segments_count() < filled_segments);
    assert!(m.capacity() < filled_capacity);
    assert_eq!(m.segments_count(), 7);
}

#[test]
fn shrink_preserves_survivors() {
    let m: StripedMap<u32, String> = StripedMap::with_capacity(20_000);
    for i in 0..20_000u32 {
        m.insert(i, i.to_string()).unwrap();
    }

    // drain everything except a sparse survivor set, forcing shrinks underneath it
    for i in 0..20_000u32 {
        if i % 100 != 0 {
            assert!(m.remove(&i));
        }
    }

    assert_eq!(m.len(), 200);
    for i in (0..20_000u32).step_by(100) {
        assert_eq!(m.get(&i), Some(i.to_string()));
    }
}

#[test]
fn capacity_tracks_segment_count() {
    let m: StripedMap<u64, u64> = StripedMap::with_capacity(150_000);
    assert_eq!(m.capacity() % m.segments_count(), 0);
    let per_segment = m.capacity() / m.segments_count();
    assert_eq!(per_segment, m.segment_capacity_limit());
    assert!(per_segment > 0);
    assert!(per_segment <= stripemap::MAX_SEGMENT_CAPACITY);

    // the per-segment ceiling is a map-wide constant, so capacity scales linearly
    let small: StripedMap<u64, u64> = StripedMap::new();
    assert_eq!(small.capacity() / small.segments_count(), per_segment);
}
