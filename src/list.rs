use core::cmp;

use crossbeam_utils::CachePadded;
use rand::Rng;

use crate::{
  arena::Arena,
  node::{Node, MAX_HEIGHT},
  sync::{Arc, AtomicU32, Ordering},
  value::{Entry, ValueStruct},
};

/// Below this threshold a fresh uniform draw keeps a tower growing one more
/// level, so P(height > h) = 3^-h.
const HEIGHT_INCREASE: u32 = u32::MAX / 3;

/// A lock-free, thread-safe ordered map over byte-string keys, backed by a
/// single growable arena.
///
/// One node exists per distinct key; an insert for a key that is already
/// present replaces its value with a single atomic store of the packed
/// descriptor, so concurrent readers always observe a complete value.
/// Inserts of distinct keys proceed in parallel at every level via
/// compare-and-swap on the forward links; no lock is held during search or
/// splicing (the arena takes one only to serialize growth).
///
/// The handle is cheap to clone and share across threads.
#[derive(Clone)]
pub struct SkipList {
  inner: Arc<Inner>,
}

struct Inner {
  /// Current height of the list. 1 <= height <= MAX_HEIGHT. CAS.
  height: CachePadded<AtomicU32>,
  head_offset: u32,
  arena: Arena,
}

impl SkipList {
  /// Creates a skip list whose arena starts at `arena_size` bytes. The
  /// arena grows on demand, so the size is a working-set hint, not a limit.
  pub fn new(arena_size: usize) -> Self {
    let arena = Arena::new(arena_size);
    // Head sentinel at max height with an empty key. Searches always start
    // here, which saves special-casing inserts into an empty list.
    let head_offset = arena.new_node(&[], &ValueStruct::default(), MAX_HEIGHT);
    Self {
      inner: Arc::new(Inner {
        height: CachePadded::new(AtomicU32::new(1)),
        head_offset,
        arena,
      }),
    }
  }

  /// Inserts the key-value pair, replacing the stored value if `key` is
  /// already present.
  ///
  /// `key` must be non-empty and shorter than 64 KiB.
  pub fn insert(&self, key: &[u8], value: ValueStruct) {
    self.inner.insert(key, value)
  }

  /// [`insert`](SkipList::insert) for a prepared [`Entry`].
  pub fn insert_entry(&self, entry: &Entry) {
    self.inner.insert(
      &entry.key,
      ValueStruct {
        value: entry.value.clone(),
        expires_at: entry.expires_at,
      },
    )
  }

  /// Returns the latest committed value for `key`, or `None` if the key was
  /// never inserted.
  pub fn get(&self, key: &[u8]) -> Option<ValueStruct> {
    self.inner.get(key)
  }

  /// Walks the base level and counts entries. O(n); meant for validation,
  /// not bookkeeping, and weakly consistent under concurrent inserts.
  pub fn len(&self) -> usize {
    let arena = self.inner.arena.view();
    let mut count = 0;
    // Safety: head_offset and every reachable link are node offsets, and
    // level 0 is below every tower's height.
    let mut curr = unsafe { arena.next_offset(self.inner.head_offset, 0) };
    while curr != 0 {
      count += 1;
      curr = unsafe { arena.next_offset(curr, 0) };
    }
    count
  }

  /// Returns whether the list holds no entries.
  pub fn is_empty(&self) -> bool {
    let arena = self.inner.arena.view();
    // Safety: head_offset is a node offset.
    unsafe { arena.next_offset(self.inner.head_offset, 0) == 0 }
  }

  /// Height of the tallest tower spliced so far.
  pub fn height(&self) -> u32 {
    self.inner.height()
  }

  /// Number of arena bytes handed out so far.
  pub fn size(&self) -> usize {
    self.inner.arena.size()
  }

  /// Current capacity of the arena.
  pub fn capacity(&self) -> usize {
    self.inner.arena.capacity()
  }
}

impl Inner {
  #[inline]
  fn height(&self) -> u32 {
    self.height.load(Ordering::SeqCst)
  }

  /// Returns `(prev, next)` offsets at `level` such that a node for `key`
  /// belongs between them, searching forward from `before`. If a node with
  /// exactly `key` is found, returns it as both halves: the update signal.
  fn find_splice_for_level(&self, key: &[u8], mut before: u32, level: usize) -> (u32, u32) {
    let arena = self.arena.view();
    loop {
      // Assume before.key < key. A node linked at this level has a tower at
      // least this tall, so the slot reads are in bounds.
      let next = unsafe { arena.next_offset(before, level) };
      let next_node = match unsafe { arena.node(next) } {
        Some(node) => node,
        None => return (before, next),
      };
      let next_key = unsafe { arena.key(next_node.key_offset, next_node.key_size) };
      match key.cmp(next_key) {
        cmp::Ordering::Less => return (before, next),
        cmp::Ordering::Equal => return (next, next),
        cmp::Ordering::Greater => {
          // Keep moving right on this level.
          before = next;
        }
      }
    }
  }

  /// Top-down search for the node nearest to `key` at the base level.
  ///
  /// If `less` is false, finds the leftmost node with key > `key`
  /// (>= if `allow_equal`); if `less` is true, the rightmost node with
  /// key < `key`. Returns the node's offset (0 for none) and whether it
  /// holds `key` exactly.
  fn find_near(&self, key: &[u8], less: bool, allow_equal: bool) -> (u32, bool) {
    let arena = self.arena.view();
    let mut curr = self.head_offset;
    let mut level = (self.height() - 1) as usize;
    loop {
      // Assume curr.key < key. Cursors only land on nodes linked at the
      // current level, so their towers reach it.
      let next = unsafe { arena.next_offset(curr, level) };
      let next_node = match unsafe { arena.node(next) } {
        Some(node) => node,
        None => {
          // curr.key < key < END OF LIST.
          if level > 0 {
            // Can descend further to iterate closer to the end.
            level -= 1;
            continue;
          }

          // Base level. Nothing to the right; curr is the answer iff the
          // caller wanted "less" and curr is a real node.
          if !less || curr == self.head_offset {
            return (0, false);
          }
          return (curr, false);
        }
      };

      let next_key = unsafe { arena.key(next_node.key_offset, next_node.key_size) };
      match key.cmp(next_key) {
        cmp::Ordering::Greater => {
          // curr.key < next.key < key. Keep moving right.
          curr = next;
        }
        cmp::Ordering::Equal => {
          // curr.key < key == next.key.
          if allow_equal {
            return (next, true);
          }
          if !less {
            // Want strictly greater: grab the base-level successor.
            return (unsafe { arena.next_offset(next, 0) }, false);
          }
          // Want strictly less: move closer on the level below.
          if level > 0 {
            level -= 1;
            continue;
          }
          if curr == self.head_offset {
            return (0, false);
          }
          return (curr, false);
        }
        cmp::Ordering::Less => {
          // curr.key < key < next.key.
          if level > 0 {
            level -= 1;
            continue;
          }
          if !less {
            return (next, false);
          }
          if curr == self.head_offset {
            return (0, false);
          }
          return (curr, false);
        }
      }
    }
  }

  /// Installs a fresh value blob on an already-published node. The single
  /// atomic store of the packed descriptor keeps concurrent readers on
  /// either the complete old value or the complete new one.
  fn set_value(&self, node_offset: u32, value: &ValueStruct) {
    let value_word = Node::encode_value(self.arena.put_val(value), value.encoded_size());
    let arena = self.arena.view();
    let node = unsafe { arena.node_unchecked(node_offset) };
    node.set_value_word(value_word);
  }

  fn insert(&self, key: &[u8], value: ValueStruct) {
    assert!(!key.is_empty(), "key must not be empty");

    // Since we allow overwrite, we may not need to create a new node, or
    // even to increase the height. Defer both.
    let list_height = self.height() as usize;
    let mut prev = [0u32; MAX_HEIGHT + 1];
    let mut next = [0u32; MAX_HEIGHT + 1];
    prev[list_height] = self.head_offset;
    for i in (0..list_height).rev() {
      // Use the splice from the level above to bound the search at this one.
      let (p, n) = self.find_splice_for_level(key, prev[i + 1], i);
      prev[i] = p;
      next[i] = n;
      if p == n {
        // Key already present: only the value changes hands.
        self.set_value(p, &value);
        return;
      }
    }

    let height = random_height();
    let node_offset = self.arena.new_node(key, &value, height);

    // Try to increase the list height via CAS.
    let mut observed = self.height();
    while height as u32 > observed {
      match self.height.compare_exchange(
        observed,
        height as u32,
        Ordering::SeqCst,
        Ordering::SeqCst,
      ) {
        // Successfully increased the skip list height.
        Ok(_) => break,
        Err(_) => observed = self.height(),
      }
    }

    // We always insert from the base level and up. After the node is linked
    // at the base level, we cannot fail to find it from any level above.
    for i in 0..height {
      loop {
        if prev[i] == 0 {
          // This level was never searched because the drawn height exceeds
          // the old list height. Lists up here are sparse, so searching
          // from the head is cheap.
          assert!(i > 1, "the base-level splice is always precomputed");
          let (p, n) = self.find_splice_for_level(key, self.head_offset, i);
          prev[i] = p;
          next[i] = n;
          // A racing insert of the same key can only win at the base level.
          assert_ne!(p, n, "duplicate key above the base level");
        }

        {
          let arena = self.arena.view();
          // Safety: node_offset came from new_node with height > i, and
          // prev[i] is linked at level i, so both towers reach this level.
          unsafe {
            arena.set_next_offset(node_offset, i, next[i]);
            if arena.cas_next_offset(prev[i], i, next[i], node_offset) {
              // Managed to insert between prev[i] and next[i]. Go up a level.
              break;
            }
          }
        }

        // CAS failed: recompute prev and next. Re-searching from the old
        // prev is enough, since few nodes land between prev and next.
        let (p, n) = self.find_splice_for_level(key, prev[i], i);
        if p == n {
          assert_eq!(i, 0, "equality can happen only on base level: {i}");
          // Another writer inserted this key first; fall back to an update.
          self.set_value(p, &value);
          return;
        }
        prev[i] = p;
        next[i] = n;
      }
    }
  }

  fn get(&self, key: &[u8]) -> Option<ValueStruct> {
    let (node_offset, _) = self.find_near(key, false, true); // find >=
    if node_offset == 0 {
      return None;
    }

    let (value_offset, value_size) = {
      let arena = self.arena.view();
      // Safety: find_near only returns node offsets.
      let node = unsafe { arena.node_unchecked(node_offset) };
      if unsafe { arena.key(node.key_offset, node.key_size) } != key {
        return None;
      }
      Node::decode_value(node.value_word())
    };
    // Safety: the pair was unpacked from the node's value word.
    Some(unsafe { self.arena.get_value(value_offset, value_size) })
  }
}

/// Draws a tower height with P(height > h) = 3^-h, capped at `MAX_HEIGHT`.
/// The per-thread generator keeps the draw off every shared cache line.
fn random_height() -> usize {
  let mut rng = rand::thread_rng();
  let mut h = 1;
  while h < MAX_HEIGHT && rng.gen::<u32>() < HEIGHT_INCREASE {
    h += 1;
  }
  h
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;
  use std::thread;

  const ARENA_SIZE: usize = 1 << 20;

  fn key(i: usize) -> Vec<u8> {
    format!("{i:05}").into_bytes()
  }

  fn new_value(i: usize) -> ValueStruct {
    ValueStruct::new(format!("{i:05}"))
  }

  fn key_at(l: &SkipList, offset: u32) -> Vec<u8> {
    let arena = l.inner.arena.view();
    let node = unsafe { arena.node_unchecked(offset) };
    unsafe { arena.key(node.key_offset, node.key_size) }.to_vec()
  }

  /// Walks every level: keys strictly ascend, every populated level is a
  /// subset of the base, and each node is present at each level below its
  /// height.
  fn check_invariants(l: &SkipList) {
    let arena = l.inner.arena.view();
    let head = l.inner.head_offset;
    let list_height = l.height() as usize;

    let mut levels: Vec<HashSet<Vec<u8>>> = Vec::new();
    for level in 0..list_height {
      let mut keys = HashSet::new();
      let mut prev_key: Option<Vec<u8>> = None;
      let mut curr = unsafe { arena.next_offset(head, level) };
      while let Some(node) = unsafe { arena.node(curr) } {
        assert!((node.height as usize) > level);
        let k = unsafe { arena.key(node.key_offset, node.key_size) }.to_vec();
        if let Some(p) = &prev_key {
          assert!(p < &k, "keys out of order at level {level}");
        }
        keys.insert(k.clone());
        prev_key = Some(k);
        curr = unsafe { arena.next_offset(curr, level) };
      }
      levels.push(keys);
    }

    for level in 1..list_height {
      assert!(
        levels[level].is_subset(&levels[0]),
        "level {level} holds a key missing from the base"
      );
    }

    let mut curr = unsafe { arena.next_offset(head, 0) };
    while let Some(node) = unsafe { arena.node(curr) } {
      assert!((node.height as usize) <= list_height);
      let k = unsafe { arena.key(node.key_offset, node.key_size) }.to_vec();
      for level in 0..node.height as usize {
        assert!(
          levels[level].contains(&k),
          "node unreachable at level {level} below its height"
        );
      }
      curr = unsafe { arena.next_offset(curr, 0) };
    }
  }

  #[test]
  fn test_basic() {
    let l = SkipList::new(ARENA_SIZE);
    l.insert(b"alpha", ValueStruct::new("A"));
    let v = l.get(b"alpha").unwrap();
    assert_eq!(&v.value[..], b"A");
    assert_eq!(v.expires_at, 0);
    assert!(l.get(b"beta").is_none());
    assert_eq!(l.len(), 1);
    assert!(!l.is_empty());
  }

  #[test]
  fn test_empty_list() {
    let l = SkipList::new(ARENA_SIZE);
    assert!(l.is_empty());
    assert_eq!(l.len(), 0);
    assert!(l.get(b"anything").is_none());
    assert_eq!(l.height(), 1);
  }

  #[test]
  fn test_expires_at_round_trip() {
    let l = SkipList::new(ARENA_SIZE);
    l.insert(b"k", ValueStruct::new("v").with_expires_at(1_700_000_000));
    let v = l.get(b"k").unwrap();
    assert_eq!(&v.value[..], b"v");
    assert_eq!(v.expires_at, 1_700_000_000);
  }

  #[test]
  fn test_update_in_place() {
    let l = SkipList::new(ARENA_SIZE);
    l.insert(b"k", ValueStruct::new("v1"));
    l.insert(b"k", ValueStruct::new("v2"));
    assert_eq!(&l.get(b"k").unwrap().value[..], b"v2");
    assert_eq!(l.len(), 1);
  }

  #[test]
  fn test_insert_idempotent() {
    let l = SkipList::new(ARENA_SIZE);
    l.insert(b"k", ValueStruct::new("v"));
    l.insert(b"k", ValueStruct::new("v"));
    assert_eq!(&l.get(b"k").unwrap().value[..], b"v");
    assert_eq!(l.len(), 1);
  }

  #[test]
  fn test_out_of_order_inserts() {
    let l = SkipList::new(ARENA_SIZE);
    l.insert(b"a", ValueStruct::new("1"));
    l.insert(b"c", ValueStruct::new("3"));
    l.insert(b"b", ValueStruct::new("2"));
    assert_eq!(&l.get(b"a").unwrap().value[..], b"1");
    assert_eq!(&l.get(b"b").unwrap().value[..], b"2");
    assert_eq!(&l.get(b"c").unwrap().value[..], b"3");
    assert_eq!(l.len(), 3);
    // Successor order follows key order, not insertion order.
    let (n, _) = l.inner.find_near(b"a", false, false);
    assert_eq!(key_at(&l, n), b"b");
    let (n, _) = l.inner.find_near(b"b", false, false);
    assert_eq!(key_at(&l, n), b"c");
  }

  #[test]
  fn test_insert_entry() {
    let l = SkipList::new(ARENA_SIZE);
    l.insert_entry(&Entry::new("k", "v").with_expires_at(9));
    let v = l.get(b"k").unwrap();
    assert_eq!(&v.value[..], b"v");
    assert_eq!(v.expires_at, 9);
  }

  #[test]
  #[should_panic(expected = "key must not be empty")]
  fn test_empty_key_rejected() {
    let l = SkipList::new(ARENA_SIZE);
    l.insert(b"", ValueStruct::new("v"));
  }

  #[test]
  fn test_basic_large() {
    let n = 1000;
    let l = SkipList::new(ARENA_SIZE);
    for i in 0..n {
      l.insert(&key(i), new_value(i));
    }
    for i in 0..n {
      assert_eq!(l.get(&key(i)).unwrap(), new_value(i));
    }
    assert_eq!(l.len(), n);
    check_invariants(&l);
  }

  #[test]
  fn test_find_near() {
    fn assert_near(l: &SkipList, less: bool, allow_equal: bool, seek: &str, want: &str, eq: bool) {
      let (n, found_eq) = l.inner.find_near(seek.as_bytes(), less, allow_equal);
      assert_ne!(n, 0, "seek {seek}");
      assert_eq!(key_at(l, n), want.as_bytes(), "seek {seek}");
      assert_eq!(found_eq, eq, "seek {seek}");
    }
    fn assert_near_null(l: &SkipList, less: bool, allow_equal: bool, seek: &str) {
      let (n, found_eq) = l.inner.find_near(seek.as_bytes(), less, allow_equal);
      assert_eq!(n, 0, "seek {seek}");
      assert!(!found_eq);
    }

    let l = SkipList::new(ARENA_SIZE);
    for i in 0..1000 {
      let k = format!("{:05}", i * 10 + 5);
      l.insert(k.as_bytes(), ValueStruct::new(k.clone()));
    }

    // Before the smallest key.
    assert_near(&l, false, false, "00001", "00005", false);
    assert_near(&l, false, true, "00001", "00005", false);
    assert_near_null(&l, true, false, "00001");
    assert_near_null(&l, true, true, "00001");

    // Exactly the smallest key.
    assert_near(&l, false, false, "00005", "00015", false);
    assert_near(&l, false, true, "00005", "00005", true);
    assert_near_null(&l, true, false, "00005");
    assert_near(&l, true, true, "00005", "00005", true);

    // A present key in the middle.
    assert_near(&l, false, false, "05555", "05565", false);
    assert_near(&l, false, true, "05555", "05555", true);
    assert_near(&l, true, false, "05555", "05545", false);
    assert_near(&l, true, true, "05555", "05555", true);

    // An absent key in the middle.
    assert_near(&l, false, false, "05558", "05565", false);
    assert_near(&l, false, true, "05558", "05565", false);
    assert_near(&l, true, false, "05558", "05555", false);
    assert_near(&l, true, true, "05558", "05555", false);

    // Exactly the largest key.
    assert_near_null(&l, false, false, "09995");
    assert_near(&l, false, true, "09995", "09995", true);
    assert_near(&l, true, false, "09995", "09985", false);

    // Past the largest key.
    assert_near_null(&l, false, false, "59995");
    assert_near_null(&l, false, true, "59995");
    assert_near(&l, true, false, "59995", "09995", false);
    assert_near(&l, true, true, "59995", "09995", false);
  }

  #[test]
  fn test_concurrent_insert_distinct_keys() {
    const THREADS: usize = 20;
    const PER_THREAD: usize = 500;
    let n = THREADS * PER_THREAD;

    let gen_key = |i: usize| format!("Keykeykey{i:05}").into_bytes();

    // Small enough that the arena grows several times mid-flight.
    let l = SkipList::new(1 << 20);
    let handles: Vec<_> = (0..THREADS)
      .map(|t| {
        let l = l.clone();
        thread::spawn(move || {
          for i in (t * PER_THREAD)..((t + 1) * PER_THREAD) {
            let k = format!("Keykeykey{i:05}");
            l.insert(k.as_bytes(), ValueStruct::new(k.clone()));
          }
        })
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }

    assert_eq!(l.len(), n);
    for i in 0..n {
      let k = gen_key(i);
      assert_eq!(&l.get(&k).unwrap().value[..], &k[..], "broken: {i}");
    }
    check_invariants(&l);
  }

  #[test]
  fn test_concurrent_readers_and_writers() {
    const THREADS: usize = 10;
    const PER_THREAD: usize = 100;
    let l = SkipList::new(ARENA_SIZE);

    let writers: Vec<_> = (0..THREADS)
      .map(|t| {
        let l = l.clone();
        thread::spawn(move || {
          for i in (t * PER_THREAD)..((t + 1) * PER_THREAD) {
            l.insert(&key(i), new_value(i));
          }
        })
      })
      .collect();
    for h in writers {
      h.join().unwrap();
    }

    let readers: Vec<_> = (0..THREADS)
      .map(|t| {
        let l = l.clone();
        thread::spawn(move || {
          for i in (t * PER_THREAD)..((t + 1) * PER_THREAD) {
            assert_eq!(l.get(&key(i)).unwrap(), new_value(i), "broken: {i}");
          }
        })
      })
      .collect();
    for h in readers {
      h.join().unwrap();
    }
  }

  #[test]
  fn test_concurrent_update_single_key() {
    const THREADS: usize = 16;
    let l = SkipList::new(ARENA_SIZE);
    l.insert(b"other", ValueStruct::new("x"));

    let handles: Vec<_> = (0..THREADS)
      .map(|t| {
        let l = l.clone();
        thread::spawn(move || l.insert(b"contended", new_value(t)))
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }

    // Exactly one node materialized; its value is one of the contenders'.
    assert_eq!(l.len(), 2);
    let got = l.get(b"contended").unwrap();
    assert!((0..THREADS).any(|t| new_value(t) == got));
  }

  #[test]
  fn test_grow_from_tiny_arena() {
    let n = 10_000;
    let l = SkipList::new(1);
    for i in 0..n {
      l.insert(&key(i), new_value(i));
    }
    for i in 0..n {
      assert_eq!(l.get(&key(i)).unwrap(), new_value(i));
    }
    assert_eq!(l.len(), n);
    check_invariants(&l);
  }

  #[test]
  fn test_concurrent_big_values() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 4;
    let big_value = |i: usize| ValueStruct::new(format!("{i:065535}"));

    // Every value dwarfs the initial capacity, so growth happens while
    // other writers are mid-splice.
    let l = SkipList::new(1 << 12);
    let handles: Vec<_> = (0..THREADS)
      .map(|t| {
        let l = l.clone();
        thread::spawn(move || {
          for i in (t * PER_THREAD)..((t + 1) * PER_THREAD) {
            l.insert(&key(i), big_value(i));
          }
        })
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }

    assert_eq!(l.len(), THREADS * PER_THREAD);
    for i in 0..THREADS * PER_THREAD {
      assert_eq!(l.get(&key(i)).unwrap(), big_value(i), "broken: {i}");
    }
  }

  #[test]
  fn test_random_height_distribution() {
    let draws = 100_000;
    let mut total = 0usize;
    for _ in 0..draws {
      let h = random_height();
      assert!((1..=MAX_HEIGHT).contains(&h));
      total += h;
    }
    // E[h] = 1.5 for p = 1/3; the sample mean of 100k draws sits well
    // inside (1.4, 1.6).
    let mean = total as f64 / draws as f64;
    assert!((1.4..1.6).contains(&mean), "mean height {mean}");
  }
}
