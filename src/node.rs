use core::mem;

use crate::sync::{AtomicU64, Ordering};

/// Tallest tower a node can draw. With p = 1/3 per level, 48 levels keep the
/// expected search path logarithmic far past any realistic memtable size.
pub(crate) const MAX_HEIGHT: usize = 48;

pub(crate) const OFFSET_SIZE: usize = mem::size_of::<u32>();

/// Node allocations are rounded up so the returned offset is 8-byte aligned,
/// which the atomic value word requires.
pub(crate) const NODE_ALIGN: usize = mem::size_of::<u64>() - 1;

/// The fixed header of a skip-list node as it lives inside the arena.
#[repr(C)]
pub(crate) struct Node {
  /// Packed value descriptor: low 32 bits are the arena offset of the encoded
  /// value blob, high 32 bits its length. Rewritten with a single atomic
  /// store on update, so a reader sees either the complete old pair or the
  /// complete new one, never a mix.
  value: AtomicU64,

  // Immutable after the node is published. No lock to access key.
  pub(crate) key_offset: u32,
  pub(crate) key_size: u16,

  /// Number of valid tower slots. Immutable.
  pub(crate) height: u16,

  // The forward-link tower sits immediately after this header, one u32 arena
  // offset per level, level 0 first. Most nodes do not need the full height,
  // since the probability of each successive level decreases geometrically,
  // so the allocation is deliberately truncated to `height` slots. The field
  // cannot live here as an array without claiming bytes the allocation does
  // not own; slots are resolved by offset arithmetic in `ArenaView::tower`.
  // tower: [AtomicU32; MAX_HEIGHT],
}

impl Node {
  /// Size of the fixed header; the tower starts at this offset into a node.
  pub(crate) const HEADER_SIZE: usize = mem::size_of::<Self>();

  /// Size of a node with a full-height tower; also the tail slack the arena
  /// keeps so a header materialized at any handed-out offset stays in bounds.
  pub(crate) const MAX_NODE_SIZE: usize = Self::HEADER_SIZE + MAX_HEIGHT * OFFSET_SIZE;

  /// Fills the header of a freshly allocated node. The tower slots arrive
  /// zeroed (null links) from the allocator.
  ///
  /// ## Safety
  /// `node` must point at a node allocation that no other thread can reach
  /// yet; the writes are plain stores and are published later by the level-0
  /// splice CAS.
  pub(crate) unsafe fn init(
    node: *mut Node,
    key_offset: u32,
    key_size: u16,
    height: u16,
    value_word: u64,
  ) {
    (*node).value = AtomicU64::new(value_word);
    (*node).key_offset = key_offset;
    (*node).key_size = key_size;
    (*node).height = height;
  }

  #[inline]
  pub(crate) fn value_word(&self) -> u64 {
    self.value.load(Ordering::Acquire)
  }

  #[inline]
  pub(crate) fn set_value_word(&self, word: u64) {
    self.value.store(word, Ordering::Release);
  }

  #[inline]
  pub(crate) const fn encode_value(offset: u32, size: u32) -> u64 {
    offset as u64 | (size as u64) << 32
  }

  #[inline]
  pub(crate) const fn decode_value(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
  }
}
