use core::{ptr, slice};

use crossbeam_utils::CachePadded;
use parking_lot::{RwLock, RwLockReadGuard};

use crate::{
  node::{Node, MAX_HEIGHT, NODE_ALIGN, OFFSET_SIZE},
  sync::{AtomicU32, AtomicU64, Ordering},
  value::ValueStruct,
};

/// Hard ceiling on how many bytes a single grow step may add.
const MAX_GROW_STEP: u64 = 1 << 30;

/// The backing buffer. Offsets are byte indexes from `ptr`. The storage is a
/// `Vec<u64>` so that the base, and with it every 8-aligned offset, satisfies
/// the alignment of the atomic node header fields.
struct Buf {
  words: Vec<u64>,
  ptr: *mut u8,
}

impl Buf {
  fn with_capacity(cap: usize) -> Self {
    let mut words = vec![0u64; cap.div_ceil(8)];
    let ptr = words.as_mut_ptr().cast::<u8>();
    Self { words, ptr }
  }

  #[inline]
  fn cap(&self) -> usize {
    self.words.len() * 8
  }
}

/// A bump allocator over one contiguous, growable byte buffer. It hands out
/// compact `u32` offsets rather than pointers: offsets stay valid across a
/// grow-and-copy, and five forward links fit in the space of two pointers.
///
/// Offset 0 is reserved as the null sentinel; `used` therefore starts at 1.
///
/// Reservation is a lock-free fetch-add. Growth is serialized by the write
/// half of `buf`'s lock, and every other buffer access happens under a read
/// guard, so the copy never races a reservation being filled in. The one
/// rule call sites must keep: never allocate while holding an [`ArenaView`].
pub(crate) struct Arena {
  used: CachePadded<AtomicU64>,
  buf: RwLock<Buf>,
}

// Safety: the raw buffer pointer is only dereferenced under the `buf` lock,
// and all post-publication node field access goes through atomics.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
  /// Creates an arena with `cap` bytes of initial capacity. The capacity is
  /// a starting point, not a limit: any allocation that would leave the tail
  /// too small grows the buffer.
  pub(crate) fn new(cap: usize) -> Self {
    Self {
      used: CachePadded::new(AtomicU64::new(1)),
      buf: RwLock::new(Buf::with_capacity(cap)),
    }
  }

  /// Number of bytes handed out so far (including the reserved null byte).
  #[inline]
  pub(crate) fn size(&self) -> usize {
    self.used.load(Ordering::Acquire) as usize
  }

  /// Current capacity of the backing buffer.
  #[inline]
  pub(crate) fn capacity(&self) -> usize {
    self.buf.read().cap()
  }

  /// Reserves `size` bytes and returns the offset of the reservation.
  ///
  /// The reservation itself is a single fetch-add. The slow path grows the
  /// buffer whenever fewer than `MAX_NODE_SIZE` bytes of tail slack would
  /// remain, so a node header materialized at any handed-out offset never
  /// extends past the end of the buffer.
  fn allocate(&self, size: u32) -> u32 {
    let offset = self.used.fetch_add(size as u64, Ordering::SeqCst);
    let end = offset + size as u64;
    assert!(
      end <= u32::MAX as u64,
      "arena exhausted its 32-bit offset space"
    );
    if end + Node::MAX_NODE_SIZE as u64 > self.capacity() as u64 {
      self.grow(end + Node::MAX_NODE_SIZE as u64);
    }
    offset as u32
  }

  /// Grow-and-copy. The buffer doubles per step (at most 1 GiB of growth at
  /// a time) and always ends up large enough for `required`. Offsets stay
  /// valid because they are indexes from the buffer base, not pointers.
  #[cold]
  fn grow(&self, required: u64) {
    let mut buf = self.buf.write();
    let cap = buf.cap() as u64;
    if required <= cap {
      // Another grower got here first.
      return;
    }
    let new_cap = (cap + cap.min(MAX_GROW_STEP)).max(required);
    assert!(
      new_cap <= u32::MAX as u64,
      "arena cannot grow past 4 GiB of offset space"
    );
    let next = Buf::with_capacity(new_cap as usize);
    // The write lock excludes every reader and in-flight writer, so a plain
    // copy observes all completed stores.
    unsafe {
      ptr::copy_nonoverlapping(buf.ptr, next.ptr, cap as usize);
    }
    *buf = next;
  }

  /// Allocates an 8-aligned node record with a tower truncated to `height`
  /// links. The caller populates the header before publishing the node.
  fn put_node(&self, height: usize) -> u32 {
    // Tower slots at `height` and above are never accessed, so don't
    // allocate them.
    let unused_size = (MAX_HEIGHT - height) * OFFSET_SIZE;

    // Pad the allocation with enough bytes to ensure alignment.
    let l = (Node::MAX_NODE_SIZE - unused_size + NODE_ALIGN) as u32;
    let n = self.allocate(l);

    // Return the aligned offset.
    (n + NODE_ALIGN as u32) & !(NODE_ALIGN as u32)
  }

  /// Copies `key` into the arena and returns its offset.
  pub(crate) fn put_key(&self, key: &[u8]) -> u32 {
    let offset = self.allocate(key.len() as u32);
    let buf = self.buf.read();
    unsafe {
      ptr::copy_nonoverlapping(key.as_ptr(), buf.ptr.add(offset as usize), key.len());
    }
    offset
  }

  /// Encodes `v` into the arena and returns the blob's offset; its length is
  /// `v.encoded_size()` and travels in the packed value word.
  pub(crate) fn put_val(&self, v: &ValueStruct) -> u32 {
    let size = v.encoded_size();
    let offset = self.allocate(size);
    let buf = self.buf.read();
    let dst = unsafe { slice::from_raw_parts_mut(buf.ptr.add(offset as usize), size as usize) };
    v.encode(dst);
    offset
  }

  /// Decodes the value blob at `offset`.
  ///
  /// ## Safety
  /// `(offset, size)` must be a pair returned by [`Arena::put_val`] or
  /// unpacked from a published node's value word.
  pub(crate) unsafe fn get_value(&self, offset: u32, size: u32) -> ValueStruct {
    let buf = self.buf.read();
    let raw = slice::from_raw_parts(buf.ptr.add(offset as usize), size as usize);
    ValueStruct::decode(raw)
  }

  /// Allocates a node, copies in its key, encodes its value, and fills the
  /// header. Returns the node's offset; the node is not yet reachable from
  /// any list level.
  pub(crate) fn new_node(&self, key: &[u8], value: &ValueStruct, height: usize) -> u32 {
    assert!(
      key.len() <= u16::MAX as usize,
      "key of {} bytes exceeds the u16 key-size field",
      key.len()
    );
    let node_offset = self.put_node(height);
    let key_offset = self.put_key(key);
    let value_word = Node::encode_value(self.put_val(value), value.encoded_size());

    let buf = self.buf.read();
    unsafe {
      let node = buf.ptr.add(node_offset as usize).cast::<Node>();
      Node::init(node, key_offset, key.len() as u16, height as u16, value_word);
    }
    node_offset
  }

  /// Takes a read guard on the buffer and returns an accessor that resolves
  /// offsets to references. Growth waits until every view is dropped, which
  /// is what keeps those references stable; in turn, nothing may allocate
  /// while a view is held.
  #[inline]
  pub(crate) fn view(&self) -> ArenaView<'_> {
    ArenaView {
      buf: self.buf.read(),
    }
  }
}

/// Read-side accessor over the arena buffer; see [`Arena::view`].
pub(crate) struct ArenaView<'a> {
  buf: RwLockReadGuard<'a, Buf>,
}

impl ArenaView<'_> {
  /// Resolves `offset` to a node reference; offset 0 is the null sentinel.
  ///
  /// ## Safety
  /// `offset` must be 0 or a value returned by [`Arena::new_node`].
  #[inline]
  pub(crate) unsafe fn node(&self, offset: u32) -> Option<&Node> {
    if offset == 0 {
      return None;
    }
    Some(&*self.buf.ptr.add(offset as usize).cast::<Node>())
  }

  /// Like [`ArenaView::node`] for offsets known to be non-null.
  ///
  /// ## Safety
  /// `offset` must be a value returned by [`Arena::new_node`].
  #[inline]
  pub(crate) unsafe fn node_unchecked(&self, offset: u32) -> &Node {
    debug_assert_ne!(offset, 0);
    &*self.buf.ptr.add(offset as usize).cast::<Node>()
  }

  /// Borrows `size` key bytes starting at `offset`.
  ///
  /// ## Safety
  /// `(offset, size)` must be a node's `key_offset`/`key_size` pair.
  #[inline]
  pub(crate) unsafe fn key(&self, offset: u32, size: u16) -> &[u8] {
    slice::from_raw_parts(self.buf.ptr.add(offset as usize), size as usize)
  }

  /// Resolves tower slot `level` of the node at `node_offset`. Slots sit
  /// immediately after the header, one u32 per level.
  ///
  /// ## Safety
  /// `node_offset` must be a value returned by [`Arena::new_node`] and
  /// `level` must be below that node's height, so the slot lies inside the
  /// node's (possibly truncated) allocation.
  #[inline]
  unsafe fn tower(&self, node_offset: u32, level: usize) -> &AtomicU32 {
    let slot_offset = node_offset as usize + Node::HEADER_SIZE + level * OFFSET_SIZE;
    &*self.buf.ptr.add(slot_offset).cast::<AtomicU32>()
  }

  /// Loads the forward link of the node at `node_offset` at `level`.
  ///
  /// ## Safety
  /// Same contract as [`ArenaView::tower`].
  #[inline]
  pub(crate) unsafe fn next_offset(&self, node_offset: u32, level: usize) -> u32 {
    self.tower(node_offset, level).load(Ordering::Acquire)
  }

  /// Points a forward link at `offset` ahead of the splice CAS. Only the
  /// inserting thread touches the slot until the CAS publishes it.
  ///
  /// ## Safety
  /// Same contract as [`ArenaView::tower`].
  #[inline]
  pub(crate) unsafe fn set_next_offset(&self, node_offset: u32, level: usize, offset: u32) {
    self.tower(node_offset, level).store(offset, Ordering::Release);
  }

  /// CAS on a forward link; success is the release store that publishes the
  /// spliced node's header.
  ///
  /// ## Safety
  /// Same contract as [`ArenaView::tower`].
  #[inline]
  pub(crate) unsafe fn cas_next_offset(
    &self,
    node_offset: u32,
    level: usize,
    old: u32,
    new: u32,
  ) -> bool {
    self
      .tower(node_offset, level)
      .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
  }
}
