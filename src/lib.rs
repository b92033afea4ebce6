#![doc = include_str!("../README.md")]
#![deny(missing_docs)]

mod arena;
mod list;
mod node;
mod value;

pub use list::SkipList;
pub use value::{Entry, ValueStruct};

/// Re-export bytes crate
pub use bytes;

mod sync {
  #[cfg(not(loom))]
  pub(crate) use core::sync::atomic::*;
  #[cfg(not(loom))]
  pub(crate) use std::sync::Arc;

  #[cfg(loom)]
  pub(crate) use loom::sync::{atomic::*, Arc};
}
