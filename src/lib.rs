//! StripedMap: a striped hash map for single-writer, multi-reader workloads.
//!
//! The map is split into a prime number of segments; each segment is an
//! open-chaining hash table over a dense entry pool with 16-bit chain links and
//! a per-bucket-group seqlock that lets readers and enumerators run lock-free
//! against one in-place writer. Designed to hold millions of pairs without any
//! single allocation crossing the large-object boundary of generational
//! allocators.

use std::cell::UnsafeCell;
use std::hash::{BuildHasher, Hash};
use std::mem::{size_of, MaybeUninit};
use std::ptr;
use std::sync::atomic::{
    fence, AtomicBool, AtomicI16, AtomicI32, AtomicPtr, AtomicU32, Ordering,
};
use std::thread;

use ahash::RandomState;
use thiserror::Error;

// ================================================================================================
// CONSTANTS
// ================================================================================================

/// Hard per-segment pair ceiling imposed by the 16-bit chain links: the largest
/// prime not exceeding `i16::MAX`.
pub const MAX_SEGMENT_CAPACITY: usize = 32_749;

/// End-of-chain / empty-bucket sentinel for 16-bit pool indices.
const EMPTY: i16 = -1;

/// Number of consecutive buckets sharing one version word.
const BUCKETS_PER_GROUP: usize = 4;

/// Bit 31 of a version word: set while the writer mutates any bucket in the group.
const WRITE_FLAG: u32 = 0x8000_0000;

/// Bits 0..30 of a version word: monotonically increasing change counter.
const VERSION_MASK: u32 = 0x7FFF_FFFF;

const MAX_CAPACITY: usize = MAX_SEGMENT_CAPACITY;

/// Allocation size above which generational allocators place an array in their
/// non-compacting large-object tier. Kept as a cache-locality bound here.
const LARGE_ALLOCATION_THRESHOLD: usize = 85_000;

/// Smallest number of segments the map ever uses.
const MIN_SEGMENTS: usize = 7;

/// Smallest per-segment capacity a resize will request.
const MIN_SEGMENT_CAPACITY: usize = 16;

/// Fraction of the pre-large-allocation capacity a segment should run at.
const OPTIMAL_SEGMENT_FACTOR: f64 = 0.9;

/// Capacity multiplier per attempt when growing after an add.
const GROW_MULTIPLIER: f64 = 1.75;

/// Occupancy ratio below which a remove triggers a shrink.
const SHRINK_THRESHOLD: f64 = 0.40;

/// Capacity multiplier applied on shrink.
const SHRINK_MULTIPLIER: f64 = 0.50;

/// Grow attempts per add before entering the resize cooldown.
const MAX_RESIZE_ATTEMPTS: usize = 3;

/// Adds that must elapse after a failed grow ladder before resizing is retried.
const RESIZE_COOLDOWN_ADDS: i32 = 1000;

/// Expected pair count used when no capacity is given.
const DEFAULT_CAPACITY: usize = 128;

/// Initial power-of-two capacity of the enumeration staging buffer.
const INITIAL_STAGING_CAPACITY: usize = 64;

/// Pure CPU hints before a retry loop yields to the scheduler.
const SPIN_BEFORE_YIELD: i32 = 128;

// ================================================================================================
// PRIME TABLE
// ================================================================================================

/// Pre-computed ascending primes, roughly geometric. Used for both segment
/// counts and per-segment pool sizes so modulo placement stays well distributed.
const PRIMES: &[usize] = &[
    3, 7, 11, 17, 23, 29, 37, 47, 59, 71, 89, 107, 131, 163, 197, 239, 293, 353, 431, 521, 631,
    761, 919, 1103, 1327, 1597, 1931, 2333, 2801, 3371, 4049, 4861, 5839, 7013, 8419, 10_103,
    12_143, 14_591, 17_519, 21_023, 25_229, 30_293, 36_353, 43_627, 52_361, 62_851, 75_431,
    90_523, 108_631, 130_363, 156_437, 187_751, 225_307, 270_371, 324_449, 389_357, 467_237,
    560_689, 672_827, 807_403, 968_897, 1_162_687, 1_395_263, 1_674_319, 2_009_191, 2_411_033,
    2_893_249, 3_471_899, 4_166_287, 4_999_559, 5_999_471, 7_199_369,
];

fn is_prime(candidate: usize) -> bool {
    if candidate < 2 {
        return false;
    }
    if candidate % 2 == 0 {
        return candidate == 2;
    }
    let mut divisor = 3;
    while divisor * divisor <= candidate {
        if candidate % divisor == 0 {
            return false;
        }
        divisor += 2;
    }
    true
}

/// Smallest prime greater than or equal to `min`.
fn get_prime(min: usize) -> usize {
    for &p in PRIMES {
        if p >= min {
            return p;
        }
    }
    let mut candidate = min | 1;
    loop {
        if is_prime(candidate) {
            return candidate;
        }
        candidate += 2;
    }
}

/// Next prime after growing `old` by 3/2. Callers clamp against capacity ceilings.
fn expand_prime(old: usize) -> usize {
    get_prime(old + (old >> 1))
}

/// Largest prime not exceeding `limit`. Requires `limit >= 3`.
fn largest_prime_at_most(limit: usize) -> usize {
    debug_assert!(limit >= 3, "no prime at or below {limit}");
    let mut candidate = if limit % 2 == 0 {
        limit.saturating_sub(1)
    } else {
        limit
    };
    while candidate > 3 {
        if is_prime(candidate) {
            return candidate;
        }
        candidate -= 2;
    }
    3
}

/// Largest prime whose entry array stays below the large-allocation threshold
/// for this key/value instantiation. Entry layouts so large that not even the
/// smallest prime pool fits under the threshold still get a 3-slot pool.
fn max_capacity_before_large_alloc<K, V>() -> usize {
    let entry_size = size_of::<Entry<K, V>>().max(1);
    let limit = (LARGE_ALLOCATION_THRESHOLD / entry_size).clamp(3, MAX_CAPACITY);
    largest_prime_at_most(limit)
}

// ================================================================================================
// ERRORS
// ================================================================================================

/// Errors surfaced by the fallible map operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    /// `insert` was called for a key that is already present.
    #[error("key already exists")]
    DuplicateKey,
    /// `fetch` was called for a key that is not present.
    #[error("key not found")]
    KeyNotFound,
    /// A segment reached its hard 16-bit capacity ceiling and the resize cycle
    /// could not redistribute it. The failed operation left the map unchanged.
    #[error("segment capacity exceeded")]
    CapacityExceeded,
}

// ================================================================================================
// INTERNAL DATA STRUCTURES
// ================================================================================================

/// One slot of a segment's dense entry pool.
///
/// Only `next` is atomic-sized; the composite entry is never read atomically.
/// Readers take raw byte snapshots of `key` and `value` and interpret them only
/// after re-validating the owning bucket group's version word.
struct Entry<K, V> {
    next: AtomicI16,
    key: UnsafeCell<MaybeUninit<K>>,
    value: UnsafeCell<MaybeUninit<V>>,
}

/// Table state of one segment, swapped wholesale on resize. Readers that loaded
/// the previous state keep traversing it; it is reclaimed when the segment drops.
struct SegmentState<K, V> {
    entries: Box<[Entry<K, V>]>,
    buckets: Box<[AtomicI16]>,
    versions: Box<[AtomicU32]>,
}

/// Keys and values displaced by removes and overwrites. They stay alive here so
/// a reader that validated a byte snapshot never dereferences freed heap.
struct Graveyard<K, V> {
    keys: Vec<K>,
    values: Vec<V>,
}

impl<K, V> Graveyard<K, V> {
    fn new() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
        }
    }
}

/// One hash-table shard of the striped map.
///
/// `count` is the pool high-water mark (live plus free-listed slots); the live
/// pair count is `count - free_count`. The free list is a LIFO stack threaded
/// through `next` of reclaimed slots.
struct Segment<K, V> {
    state: AtomicPtr<SegmentState<K, V>>,
    retired: UnsafeCell<Vec<*mut SegmentState<K, V>>>,
    graveyard: UnsafeCell<Graveyard<K, V>>,
    count: AtomicI32,
    free_count: AtomicI32,
    free_list: AtomicI16,
    initial_capacity: usize,
    preferred_capacity: usize,
}

/// Outcome of one optimistic chain probe.
enum Probe<V> {
    Found(V),
    Missing,
    Conflict,
}

/// Outcome of one optimistic bucket copy.
enum BucketCopy {
    Copied,
    Conflict,
    Overflow,
}

// ================================================================================================
// SEGMENT STATE
// ================================================================================================

impl<K, V> SegmentState<K, V> {
    fn allocate(capacity: usize) -> Self {
        let entries = (0..capacity)
            .map(|_| Entry {
                next: AtomicI16::new(EMPTY),
                key: UnsafeCell::new(MaybeUninit::uninit()),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let buckets = (0..capacity)
            .map(|_| AtomicI16::new(EMPTY))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let versions = (0..capacity / BUCKETS_PER_GROUP + 1)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            entries,
            buckets,
            versions,
        }
    }

    #[inline(always)]
    fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[inline(always)]
    fn entry(&self, index: usize) -> &Entry<K, V> {
        &self.entries[index]
    }

    #[inline(always)]
    fn bucket_head(&self, bucket: usize) -> i16 {
        self.buckets[bucket].load(Ordering::Relaxed)
    }

    #[inline(always)]
    fn set_bucket_head(&self, bucket: usize, index: i16) {
        self.buckets[bucket].store(index, Ordering::Relaxed);
    }

    /// Begin a write to `group`: the flag store plus release fence make the flag
    /// visible before any of the field stores that follow it.
    #[inline(always)]
    fn mark_group(&self, group: usize) {
        let word = &self.versions[group];
        word.store(word.load(Ordering::Relaxed) | WRITE_FLAG, Ordering::Release);
        fence(Ordering::Release);
    }

    /// Finish a write to `group`: clear the flag and bump the change counter in
    /// one release store.
    #[inline(always)]
    fn unmark_group(&self, group: usize) {
        let word = &self.versions[group];
        let version = word.load(Ordering::Relaxed);
        word.store(
            (version & VERSION_MASK).wrapping_add(1) & VERSION_MASK,
            Ordering::Release,
        );
    }

    /// Re-validate an optimistic read. The acquire fence keeps the caller's data
    /// loads from sinking past the version re-read.
    #[inline(always)]
    fn group_changed(&self, group: usize, seen: u32) -> bool {
        fence(Ordering::Acquire);
        self.versions[group].load(Ordering::Acquire) != seen
    }
}

impl<K: Eq, V: Clone> SegmentState<K, V> {
    /// One optimistic walk of `bucket` under version `seen`. Field bytes are
    /// snapshotted and only interpreted after the version word re-validates, so
    /// a torn snapshot is discarded before any key compare or value clone.
    fn try_find(&self, bucket: usize, group: usize, seen: u32, key: &K) -> Probe<V> {
        let mut index = self.bucket_head(bucket);
        if self.group_changed(group, seen) {
            return Probe::Conflict;
        }
        while index >= 0 {
            let entry = self.entry(index as usize);
            let next = entry.next.load(Ordering::Relaxed);
            let key_snapshot = unsafe { ptr::read_volatile(entry.key.get()) };
            if self.group_changed(group, seen) {
                return Probe::Conflict;
            }
            if unsafe { key_snapshot.assume_init_ref() } == key {
                let value_snapshot = unsafe { ptr::read_volatile(entry.value.get()) };
                if self.group_changed(group, seen) {
                    return Probe::Conflict;
                }
                let value = unsafe { value_snapshot.assume_init_ref() }.clone();
                if self.group_changed(group, seen) {
                    return Probe::Conflict;
                }
                return Probe::Found(value);
            }
            index = next;
        }
        if self.group_changed(group, seen) {
            Probe::Conflict
        } else {
            Probe::Missing
        }
    }
}

impl<K: Clone, V: Clone> SegmentState<K, V> {
    /// Copy every pair of `bucket` into `staged` under one version window.
    /// `Overflow` asks the caller to double the staging buffer and retry.
    fn try_copy_bucket(&self, bucket: usize, staged: &mut Vec<(K, V)>) -> BucketCopy {
        staged.clear();
        let group = bucket / BUCKETS_PER_GROUP;
        let seen = self.versions[group].load(Ordering::Acquire);
        if seen & WRITE_FLAG != 0 {
            return BucketCopy::Conflict;
        }
        let mut index = self.bucket_head(bucket);
        if self.group_changed(group, seen) {
            return BucketCopy::Conflict;
        }
        while index >= 0 {
            if staged.len() == staged.capacity() {
                return BucketCopy::Overflow;
            }
            let entry = self.entry(index as usize);
            let next = entry.next.load(Ordering::Relaxed);
            let key_snapshot = unsafe { ptr::read_volatile(entry.key.get()) };
            let value_snapshot = unsafe { ptr::read_volatile(entry.value.get()) };
            if self.group_changed(group, seen) {
                staged.clear();
                return BucketCopy::Conflict;
            }
            let pair = unsafe {
                (
                    key_snapshot.assume_init_ref().clone(),
                    value_snapshot.assume_init_ref().clone(),
                )
            };
            staged.push(pair);
            index = next;
        }
        if self.group_changed(group, seen) {
            staged.clear();
            return BucketCopy::Conflict;
        }
        BucketCopy::Copied
    }
}

// ================================================================================================
// SEGMENT
// ================================================================================================

impl<K, V> Segment<K, V> {
    fn new(initial_capacity: usize, preferred_capacity: usize) -> Self {
        Self {
            state: AtomicPtr::new(ptr::null_mut()),
            retired: UnsafeCell::new(Vec::new()),
            graveyard: UnsafeCell::new(Graveyard::new()),
            count: AtomicI32::new(0),
            free_count: AtomicI32::new(0),
            free_list: AtomicI16::new(EMPTY),
            initial_capacity,
            preferred_capacity,
        }
    }

    #[inline(always)]
    fn state(&self) -> Option<&SegmentState<K, V>> {
        let ptr = self.state.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }

    /// First write initializes the table lazily to a prime at least as large as
    /// the capacity the map asked for.
    fn ensure_state(&self) -> &SegmentState<K, V> {
        if let Some(state) = self.state() {
            return state;
        }
        let capacity =
            get_prime(self.initial_capacity.max(MIN_SEGMENT_CAPACITY)).min(MAX_CAPACITY);
        let raw = Box::into_raw(Box::new(SegmentState::allocate(capacity)));
        self.state.store(raw, Ordering::Release);
        unsafe { &*raw }
    }

    /// Live pairs currently stored. Advisory under concurrent observation.
    #[inline(always)]
    fn live_count(&self) -> usize {
        let used = self.count.load(Ordering::Relaxed);
        let free = self.free_count.load(Ordering::Relaxed);
        (used - free).max(0) as usize
    }

    #[inline(always)]
    fn capacity(&self) -> usize {
        self.state().map_or(0, |state| state.capacity())
    }

    /// Displaced pairs are kept, not dropped: an in-flight reader may still hold
    /// a validated snapshot of their bytes. Writer-only.
    fn retire_pair(&self, key: K, value: V) {
        let graveyard = unsafe { &mut *self.graveyard.get() };
        graveyard.keys.push(key);
        graveyard.values.push(value);
    }

    fn retire_value(&self, value: V) {
        unsafe { (*self.graveyard.get()).values.push(value) };
    }
}

impl<K: Eq, V> Segment<K, V> {
    /// Lock-free lookup. Retries on the captured state handle whenever the
    /// bucket group changes underneath the walk.
    fn find(&self, key: &K, hash: i32) -> Option<V>
    where
        V: Clone,
    {
        let state = self.state()?;
        let bucket = hash as usize % state.capacity();
        let group = bucket / BUCKETS_PER_GROUP;
        let mut spins = 0;
        loop {
            let seen = state.versions[group].load(Ordering::Acquire);
            if seen & WRITE_FLAG == 0 {
                match state.try_find(bucket, group, seen, key) {
                    Probe::Found(value) => return Some(value),
                    Probe::Missing => return None,
                    Probe::Conflict => {}
                }
            }
            delay(&mut spins);
        }
    }

    /// Writer-side insert. Returns `Ok(true)` when a new pair was added and
    /// `Ok(false)` when the key already existed (value replaced iff `overwrite`).
    fn insert<F>(
        &self,
        key: K,
        value: V,
        hash: i32,
        overwrite: bool,
        rehash: &F,
    ) -> Result<bool, MapError>
    where
        F: Fn(&K) -> i32,
    {
        loop {
            let state = self.ensure_state();
            let capacity = state.capacity();
            let bucket = hash as usize % capacity;
            let group = bucket / BUCKETS_PER_GROUP;

            let mut index = state.bucket_head(bucket);
            while index >= 0 {
                let entry = state.entry(index as usize);
                if unsafe { (*entry.key.get()).assume_init_ref() } == &key {
                    if overwrite {
                        state.mark_group(group);
                        let old = unsafe { (*entry.value.get()).assume_init_read() };
                        unsafe { (*entry.value.get()).write(value) };
                        state.unmark_group(group);
                        self.retire_value(old);
                    }
                    return Ok(false);
                }
                index = entry.next.load(Ordering::Relaxed);
            }

            let free = self.free_list.load(Ordering::Relaxed);
            let slot = if free >= 0 {
                let entry = state.entry(free as usize);
                self.free_list
                    .store(entry.next.load(Ordering::Relaxed), Ordering::Relaxed);
                self.free_count.fetch_sub(1, Ordering::Relaxed);
                free as usize
            } else {
                let used = self.count.load(Ordering::Relaxed) as usize;
                if used == capacity {
                    self.grow(rehash)?;
                    continue;
                }
                self.count.store(used as i32 + 1, Ordering::Relaxed);
                used
            };

            // Fill the slot before it becomes reachable, so a reader that sees
            // the new head also sees a fully formed first link.
            let entry = state.entry(slot);
            unsafe {
                (*entry.key.get()).write(key);
                (*entry.value.get()).write(value);
            }
            entry.next.store(state.bucket_head(bucket), Ordering::Relaxed);
            state.mark_group(group);
            state.set_bucket_head(bucket, slot as i16);
            state.unmark_group(group);
            return Ok(true);
        }
    }

    /// Writer-side remove. Unlinks under the version protocol, then moves the
    /// pair to the graveyard and pushes the slot onto the free list.
    fn remove(&self, key: &K, hash: i32) -> bool {
        let Some(state) = self.state() else {
            return false;
        };
        let bucket = hash as usize % state.capacity();
        let group = bucket / BUCKETS_PER_GROUP;
        let mut previous = EMPTY;
        let mut index = state.bucket_head(bucket);
        while index >= 0 {
            let entry = state.entry(index as usize);
            let next = entry.next.load(Ordering::Relaxed);
            if unsafe { (*entry.key.get()).assume_init_ref() } == key {
                state.mark_group(group);
                if previous < 0 {
                    state.set_bucket_head(bucket, next);
                } else {
                    state
                        .entry(previous as usize)
                        .next
                        .store(next, Ordering::Relaxed);
                }
                state.unmark_group(group);
                let (old_key, old_value) = unsafe {
                    (
                        (*entry.key.get()).assume_init_read(),
                        (*entry.value.get()).assume_init_read(),
                    )
                };
                self.retire_pair(old_key, old_value);
                entry
                    .next
                    .store(self.free_list.load(Ordering::Relaxed), Ordering::Relaxed);
                self.free_list.store(index, Ordering::Relaxed);
                self.free_count.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            previous = index;
            index = next;
        }
        false
    }

    /// Batch-mode insert used while rebuilding into segments no reader can see.
    /// Skips the version protocol and the free list; keys must be unique.
    /// Returns false once the segment cannot grow past the hard ceiling.
    fn add_unsafe<F>(&self, key: K, value: V, hash: i32, rehash: &F) -> bool
    where
        F: Fn(&K) -> i32,
    {
        loop {
            let state = self.ensure_state();
            let capacity = state.capacity();
            let used = self.count.load(Ordering::Relaxed) as usize;
            if used == capacity {
                if self.grow(rehash).is_err() {
                    return false;
                }
                continue;
            }
            let bucket = hash as usize % capacity;
            let entry = state.entry(used);
            unsafe {
                (*entry.key.get()).write(key);
                (*entry.value.get()).write(value);
            }
            entry.next.store(state.bucket_head(bucket), Ordering::Relaxed);
            state.set_bucket_head(bucket, used as i16);
            self.count.store(used as i32 + 1, Ordering::Relaxed);
            return true;
        }
    }

    /// In-place grow: block-copy the pool prefix into a larger state, relink
    /// every live chain against the new bucket count, publish with one release
    /// store. Readers holding the old state finish their walk on it undisturbed.
    fn grow<F>(&self, rehash: &F) -> Result<(), MapError>
    where
        F: Fn(&K) -> i32,
    {
        let old_ptr = self.state.load(Ordering::Relaxed);
        let old = unsafe { &*old_ptr };
        let used = self.count.load(Ordering::Relaxed) as usize;
        if used >= MAX_CAPACITY {
            return Err(MapError::CapacityExceeded);
        }

        // Grow to the pre-large-allocation capacity first; cross it only once
        // the pool is already there, and never pass the 16-bit ceiling.
        let mut next_capacity = expand_prime(used);
        if next_capacity > self.preferred_capacity && used < self.preferred_capacity {
            next_capacity = self.preferred_capacity;
        }
        if next_capacity > MAX_CAPACITY {
            next_capacity = MAX_CAPACITY;
        }

        let fresh = Box::new(SegmentState::allocate(next_capacity));
        for slot in 0..used {
            let src = old.entry(slot);
            let dst = fresh.entry(slot);
            dst.next
                .store(src.next.load(Ordering::Relaxed), Ordering::Relaxed);
            unsafe {
                ptr::copy_nonoverlapping(src.key.get(), dst.key.get(), 1);
                ptr::copy_nonoverlapping(src.value.get(), dst.value.get(), 1);
            }
        }
        for bucket in 0..old.capacity() {
            let mut index = old.bucket_head(bucket);
            while index >= 0 {
                let entry = old.entry(index as usize);
                let next = entry.next.load(Ordering::Relaxed);
                let hash = rehash(unsafe { (*entry.key.get()).assume_init_ref() });
                let target = hash as usize % next_capacity;
                fresh
                    .entry(index as usize)
                    .next
                    .store(fresh.bucket_head(target), Ordering::Relaxed);
                fresh.set_bucket_head(target, index as i16);
                index = next;
            }
        }

        let raw = Box::into_raw(fresh);
        self.state.store(raw, Ordering::Release);
        // The new state now owns the pair bytes; the old one keeps its arrays
        // alive for readers still walking them.
        unsafe { (*self.retired.get()).push(old_ptr) };
        Ok(())
    }

    /// Writer-side walk over every live pair. `f` returns false to stop early;
    /// the return value says whether the walk ran to completion.
    fn for_each_live(&self, f: &mut impl FnMut(&K, &V) -> bool) -> bool {
        let Some(state) = self.state() else {
            return true;
        };
        for bucket in 0..state.capacity() {
            let mut index = state.bucket_head(bucket);
            while index >= 0 {
                let entry = state.entry(index as usize);
                let keep_going = unsafe {
                    f(
                        (*entry.key.get()).assume_init_ref(),
                        (*entry.value.get()).assume_init_ref(),
                    )
                };
                if !keep_going {
                    return false;
                }
                index = entry.next.load(Ordering::Relaxed);
            }
        }
        true
    }
}

impl<K, V> Drop for Segment<K, V> {
    fn drop(&mut self) {
        let current = *self.state.get_mut();
        if !current.is_null() {
            unsafe {
                // Live pairs are owned by the current state; walk its chains.
                let state = &*current;
                for bucket in 0..state.capacity() {
                    let mut index = state.bucket_head(bucket);
                    while index >= 0 {
                        let entry = state.entry(index as usize);
                        let next = entry.next.load(Ordering::Relaxed);
                        ptr::drop_in_place((*entry.key.get()).as_mut_ptr());
                        ptr::drop_in_place((*entry.value.get()).as_mut_ptr());
                        index = next;
                    }
                }
                drop(Box::from_raw(current));
            }
        }
        // Retired states only own their arrays; their pair bytes moved forward
        // with each grow.
        unsafe {
            for retired in (*self.retired.get()).drain(..) {
                drop(Box::from_raw(retired));
            }
        }
    }
}

// ================================================================================================
// WRITER LOCK
// ================================================================================================

/// Test-and-test-and-set spin lock serializing the map's single writer.
struct WriterLock {
    locked: AtomicBool,
}

struct WriterGuard<'a> {
    lock: &'a WriterLock,
}

impl WriterLock {
    const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    fn acquire(&self) -> WriterGuard<'_> {
        let mut spins = 0;
        loop {
            if !self.locked.swap(true, Ordering::Acquire) {
                return WriterGuard { lock: self };
            }
            while self.locked.load(Ordering::Relaxed) {
                delay(&mut spins);
            }
        }
    }
}

impl Drop for WriterGuard<'_> {
    #[inline(always)]
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

// ================================================================================================
// MAIN STRIPED MAP STRUCTURE
// ================================================================================================

/// The published segment array. Swapped wholesale on a global resize; superseded
/// arrays stay reachable for readers that captured them.
struct SegmentSet<K, V> {
    segments: Box<[Segment<K, V>]>,
}

impl<K, V> SegmentSet<K, V> {
    fn allocate(count: usize, per_segment: usize, preferred: usize) -> Self {
        let segments = (0..count)
            .map(|_| Segment::new(per_segment, preferred))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { segments }
    }
}

/// Striped hash map for one writer and many lock-free readers.
///
/// Operations route to a segment by `hash mod segment_count`; the 31-bit
/// non-negative hash comes from folding the configured [`BuildHasher`] output.
/// Mutating calls serialize on an internal spin lock; `get` and iteration never
/// take it and never block the writer.
pub struct StripedMap<K, V, S: BuildHasher = RandomState> {
    segments: AtomicPtr<SegmentSet<K, V>>,
    retired_sets: UnsafeCell<Vec<*mut SegmentSet<K, V>>>,
    writer: WriterLock,
    resize_cooldown: AtomicI32,
    large_capacity: usize,
    optimal_capacity: usize,
    hasher: S,
}

// SAFETY: readers coordinate with the single writer through the per-group version
// words and acquire/release publication of segment states and segment sets; the
// UnsafeCell fields (retired lists, graveyards) are touched only under the writer
// lock or with exclusive access in Drop.
unsafe impl<K: Send, V: Send, S: Send + BuildHasher> Send for StripedMap<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync + BuildHasher> Sync for StripedMap<K, V, S> {}

fn segment_count_for(desired: usize, optimal_capacity: usize) -> usize {
    get_prime(desired / optimal_capacity).max(MIN_SEGMENTS)
}

fn per_segment_capacity(desired: usize, segment_count: usize) -> usize {
    (desired / segment_count).max(MIN_SEGMENT_CAPACITY)
}

// ================================================================================================
// CONSTRUCTORS
// ================================================================================================

impl<K: Eq + Hash + Clone, V: Clone> StripedMap<K, V, RandomState> {
    /// Create a map sized for the default expected capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a map sized for `capacity` expected pairs.
    ///
    /// The segment count is chosen so each segment runs near its optimal working
    /// size; it will not change while the pair count stays near `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K: Eq + Hash + Clone, V: Clone, S: BuildHasher> StripedMap<K, V, S> {
    /// Create a map using the provided hasher.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(DEFAULT_CAPACITY, hasher)
    }

    /// Create a map sized for `capacity` expected pairs using the provided hasher.
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        let large_capacity = max_capacity_before_large_alloc::<K, V>();
        let optimal_capacity = ((large_capacity as f64 * OPTIMAL_SEGMENT_FACTOR) as usize).max(1);
        let segment_count = segment_count_for(capacity, optimal_capacity);
        let per_segment = per_segment_capacity(capacity, segment_count);
        let set = Box::into_raw(Box::new(SegmentSet::allocate(
            segment_count,
            per_segment,
            large_capacity,
        )));
        Self {
            segments: AtomicPtr::new(set),
            retired_sets: UnsafeCell::new(Vec::new()),
            writer: WriterLock::new(),
            resize_cooldown: AtomicI32::new(0),
            large_capacity,
            optimal_capacity,
            hasher,
        }
    }

    // ============================================================================================
    // PUBLIC API METHODS
    // ============================================================================================

    /// Look up `key` and return a clone of its value.
    ///
    /// Lock-free: concurrent writes make the read retry, never block.
    pub fn get(&self, key: &K) -> Option<V> {
        let hash = self.hash_key(key);
        let set = self.current();
        self.segment_for(set, hash).find(key, hash)
    }

    /// Check whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Look up `key`, failing with [`MapError::KeyNotFound`] when absent.
    pub fn fetch(&self, key: &K) -> Result<V, MapError> {
        self.get(key).ok_or(MapError::KeyNotFound)
    }

    /// Insert a new pair. Returns `Ok(false)` and leaves the stored value
    /// untouched when the key is already present.
    pub fn try_insert(&self, key: K, value: V) -> Result<bool, MapError> {
        self.insert_pair(key, value, false)
    }

    /// Insert a new pair, failing with [`MapError::DuplicateKey`] when the key
    /// is already present.
    pub fn insert(&self, key: K, value: V) -> Result<(), MapError> {
        if self.insert_pair(key, value, false)? {
            Ok(())
        } else {
            Err(MapError::DuplicateKey)
        }
    }

    /// Insert or overwrite the value for `key`.
    pub fn set(&self, key: K, value: V) -> Result<(), MapError> {
        self.insert_pair(key, value, true).map(|_| ())
    }

    /// Remove `key`. Returns whether it was present.
    pub fn remove(&self, key: &K) -> bool {
        let _guard = self.writer.acquire();
        let hash = self.hash_key(key);
        let set = self.current();
        let removed = self.segment_for(set, hash).remove(key, hash);
        if removed {
            self.shrink_after_remove();
        }
        removed
    }

    /// Number of live pairs. Advisory while a writer is running.
    pub fn len(&self) -> usize {
        self.current()
            .segments
            .iter()
            .map(|segment| segment.live_count())
            .sum()
    }

    /// Whether the map holds no pairs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nominal capacity: segment count times the per-segment working ceiling.
    pub fn capacity(&self) -> usize {
        self.current().segments.len() * self.large_capacity
    }

    /// Number of segments currently published.
    pub fn segments_count(&self) -> usize {
        self.current().segments.len()
    }

    /// Largest per-segment pool size that stays below the large-allocation
    /// threshold for this map's entry layout; the working ceiling behind
    /// [`capacity`](Self::capacity).
    pub fn segment_capacity_limit(&self) -> usize {
        self.large_capacity
    }

    /// Whether any segment's entry array crossed the large-allocation threshold.
    pub fn has_large_allocations(&self) -> bool {
        self.current().segments.iter().any(|segment| {
            segment.capacity() * size_of::<Entry<K, V>>() > LARGE_ALLOCATION_THRESHOLD
        })
    }

    /// Weakly consistent snapshot iteration over all pairs.
    ///
    /// Within one pass no pair is yielded twice and no pair is fabricated; pairs
    /// inserted or removed while the pass runs may or may not be observed.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            set: self.current(),
            segment: 0,
            state: None,
            bucket: 0,
            staged: Vec::with_capacity(INITIAL_STAGING_CAPACITY),
        }
    }

    // ============================================================================================
    // PRIVATE HELPER METHODS
    // ============================================================================================

    #[inline(always)]
    fn current(&self) -> &SegmentSet<K, V> {
        unsafe { &*self.segments.load(Ordering::Acquire) }
    }

    #[inline(always)]
    fn segment_for<'a>(&self, set: &'a SegmentSet<K, V>, hash: i32) -> &'a Segment<K, V> {
        &set.segments[hash as usize % set.segments.len()]
    }

    /// Fold the 64-bit hash into the non-negative 31-bit range the index
    /// arithmetic works in.
    #[inline(always)]
    fn hash_key(&self, key: &K) -> i32 {
        let hash = self.hasher.hash_one(key);
        (((hash >> 32) ^ hash) as u32 & VERSION_MASK) as i32
    }

    fn insert_pair(&self, key: K, value: V, overwrite: bool) -> Result<bool, MapError> {
        let _guard = self.writer.acquire();
        let hash = self.hash_key(&key);
        let set = self.current();
        let segment = self.segment_for(set, hash);
        let added = segment.insert(key, value, hash, overwrite, &|k| self.hash_key(k))?;
        if added {
            let cooldown = self.resize_cooldown.load(Ordering::Relaxed);
            if cooldown > 0 {
                self.resize_cooldown.store(cooldown - 1, Ordering::Relaxed);
            } else if segment.live_count() >= self.large_capacity {
                self.grow_after_add();
            }
        }
        Ok(added)
    }

    /// Climb the capacity ladder until a resize sticks; give up into a cooldown
    /// counted in subsequent adds.
    fn grow_after_add(&self) {
        let mut desired = self.capacity();
        for _ in 0..MAX_RESIZE_ATTEMPTS {
            desired = (desired as f64 * GROW_MULTIPLIER) as usize;
            if self.resize(desired) {
                return;
            }
        }
        self.resize_cooldown
            .store(RESIZE_COOLDOWN_ADDS, Ordering::Relaxed);
    }

    fn shrink_after_remove(&self) {
        let set = self.current();
        if set.segments.len() <= MIN_SEGMENTS {
            return;
        }
        let capacity = self.capacity();
        if self.len() <= (capacity as f64 * SHRINK_THRESHOLD) as usize {
            let _ = self.resize((capacity as f64 * SHRINK_MULTIPLIER) as usize);
        }
    }

    /// Rebuild into a fresh segment array sized for `desired` pairs and publish
    /// it atomically. Fails without side effects when the redistribution would
    /// push some new segment past the hard per-segment ceiling.
    fn resize(&self, desired: usize) -> bool {
        let old_set = self.current();
        let new_count = segment_count_for(desired, self.optimal_capacity);
        if new_count == old_set.segments.len() {
            return true;
        }
        let per_segment = per_segment_capacity(desired, new_count);
        let new_set = Box::new(SegmentSet::allocate(
            new_count,
            per_segment,
            self.large_capacity,
        ));

        for segment in old_set.segments.iter() {
            let complete = segment.for_each_live(&mut |key, value| {
                let hash = self.hash_key(key);
                let target = &new_set.segments[hash as usize % new_count];
                target.add_unsafe(key.clone(), value.clone(), hash, &|k| self.hash_key(k))
            });
            if !complete {
                return false;
            }
        }

        let raw = Box::into_raw(new_set);
        // Readers that loaded the old array keep using it; it stays reachable
        // through the retired list until the map drops.
        unsafe { (*self.retired_sets.get()).push(self.segments.load(Ordering::Relaxed)) };
        self.segments.store(raw, Ordering::Release);
        self.resize_cooldown.store(0, Ordering::Relaxed);
        true
    }
}

impl<K, V, S: BuildHasher> Drop for StripedMap<K, V, S> {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(*self.segments.get_mut()));
            for set in self.retired_sets.get_mut().drain(..) {
                drop(Box::from_raw(set));
            }
        }
    }
}

// ================================================================================================
// STANDARD TRAIT IMPLEMENTATIONS
// ================================================================================================

impl<K: Eq + Hash + Clone, V: Clone, S: BuildHasher + Default> Default for StripedMap<K, V, S> {
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<'a, K: Eq + Hash + Clone, V: Clone, S: BuildHasher> IntoIterator for &'a StripedMap<K, V, S> {
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: Eq + Hash + Clone, V: Clone, S: BuildHasher + Default> FromIterator<(K, V)>
    for StripedMap<K, V, S>
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let map = StripedMap::with_hasher(S::default());
        for (key, value) in iter {
            let _ = map.set(key, value);
        }
        map
    }
}

impl<K: Eq + Hash + Clone, V: Clone, S: BuildHasher> Extend<(K, V)> for StripedMap<K, V, S> {
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (key, value) in iter {
            let _ = self.set(key, value);
        }
    }
}

// ================================================================================================
// UTILITY FUNCTIONS
// ================================================================================================

#[inline(always)]
fn try_spin(spins: &mut i32) -> bool {
    if *spins < SPIN_BEFORE_YIELD {
        *spins += *spins + 1;
        std::hint::spin_loop();
        true
    } else {
        false
    }
}

#[inline(always)]
fn delay(spins: &mut i32) {
    if !try_spin(spins) {
        *spins = 0;
        thread::yield_now();
    }
}

// ================================================================================================
// ITERATOR IMPLEMENTATIONS
// ================================================================================================

/// Weakly consistent pair iterator.
///
/// Captures the segment array once at creation and each segment's state handle
/// on entry, then copies one bucket at a time into an owned staging buffer
/// under the seqlock protocol.
pub struct Iter<'a, K, V> {
    set: &'a SegmentSet<K, V>,
    segment: usize,
    state: Option<&'a SegmentState<K, V>>,
    bucket: usize,
    staged: Vec<(K, V)>,
}

impl<'a, K: Clone, V: Clone> Iter<'a, K, V> {
    /// Copy the current bucket, doubling the staging buffer on overflow and
    /// spinning out version conflicts.
    fn copy_current_bucket(&mut self, state: &'a SegmentState<K, V>) {
        let mut spins = 0;
        loop {
            match state.try_copy_bucket(self.bucket, &mut self.staged) {
                BucketCopy::Copied => break,
                BucketCopy::Conflict => delay(&mut spins),
                BucketCopy::Overflow => {
                    let capacity = self.staged.capacity();
                    self.staged.clear();
                    self.staged.reserve_exact(capacity * 2);
                }
            }
        }
        self.bucket += 1;
    }
}

impl<'a, K: Clone, V: Clone> Iterator for Iter<'a, K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pair) = self.staged.pop() {
                return Some(pair);
            }
            match self.state {
                Some(state) if self.bucket < state.capacity() => {
                    self.copy_current_bucket(state);
                }
                _ => {
                    // Advance to the next segment that has a table at all.
                    self.state = None;
                    loop {
                        if self.segment == self.set.segments.len() {
                            return None;
                        }
                        let segment = &self.set.segments[self.segment];
                        self.segment += 1;
                        self.bucket = 0;
                        if let Some(state) = segment.state() {
                            self.state = Some(state);
                            break;
                        }
                    }
                }
            }
        }
    }
}
