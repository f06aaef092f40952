use std::{ops::Bound, sync::Arc};

use bytes::Bytes;

use crate::{
  db::Engine,
  errors::{Errors, Result},
  option::IteratorOptions,
};

/// Forward cursor over the keys of an [`Engine`], in byte order, restricted to
/// a prefix.
///
/// The cursor owns its position rather than borrowing the index, so each step
/// re-seeks just past the current key. It sees the keys as of its
/// transaction's read timestamp: later commits are never observed. Once the
/// engine is closed the cursor becomes invalid and [`status`](Iterator::status)
/// reports it.
pub struct Iterator {
  engine: Arc<Engine>,
  options: IteratorOptions,
  read_ts: u64,
  current: Option<Vec<u8>>,
}

impl Iterator {
  pub(crate) fn new(engine: Arc<Engine>, options: IteratorOptions, read_ts: u64) -> Self {
    Self {
      engine,
      options,
      read_ts,
      current: None,
    }
  }

  /// Positions the cursor on the first key carrying the prefix.
  pub fn rewind(&mut self) {
    let prefix = self.options.prefix.clone();
    self.current = self.find(Bound::Included(prefix.as_slice()));
  }

  /// Positions the cursor on the first key at or after `key`.
  pub fn seek(&mut self, key: &[u8]) {
    if key < self.options.prefix.as_slice() {
      self.rewind();
      return;
    }
    self.current = self.find(Bound::Included(key));
  }

  pub fn valid(&self) -> bool {
    self.current.is_some() && !self.engine.is_closed()
  }

  pub fn next(&mut self) {
    if let Some(cur) = self.current.take() {
      self.current = self.find(Bound::Excluded(cur.as_slice()));
    }
  }

  pub fn key(&self) -> Option<&[u8]> {
    if self.engine.is_closed() {
      return None;
    }
    self.current.as_deref()
  }

  /// Reads the value of the current key.
  pub fn value(&self) -> Option<Result<Bytes>> {
    self
      .key()
      .map(|key| self.engine.get_value_at(key, self.read_ts))
  }

  /// Why the cursor ran out: `Ok` at the end of the keys, an error if the
  /// engine was closed underneath it.
  pub fn status(&self) -> Result<()> {
    if self.engine.is_closed() {
      return Err(Errors::DatabaseClosed);
    }
    Ok(())
  }

  fn find(&self, from: Bound<&[u8]>) -> Option<Vec<u8>> {
    if self.engine.is_closed() {
      return None;
    }
    self
      .engine
      .next_key_at(from, &self.options.prefix, self.read_ts)
  }
}
