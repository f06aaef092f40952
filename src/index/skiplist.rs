use std::ops::Bound;

use crossbeam_skiplist::SkipMap;

use crate::data::log_record::LogRecordPos;

use super::Indexer;

/// Lock-free index; readers never block writers.
pub struct SkipList {
  skl: SkipMap<Vec<u8>, LogRecordPos>,
}

impl SkipList {
  pub fn new() -> Self {
    Self {
      skl: SkipMap::new(),
    }
  }
}

impl Default for SkipList {
  fn default() -> Self {
    Self::new()
  }
}

impl Indexer for SkipList {
  fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Option<LogRecordPos> {
    // Index mutations are serialized by the engine's commit lock, so the
    // get-then-insert pair cannot interleave with another writer.
    let old = self.skl.get(key.as_slice()).map(|e| *e.value());
    self.skl.insert(key, pos);
    old
  }

  fn get(&self, key: &[u8]) -> Option<LogRecordPos> {
    self.skl.get(key).map(|e| *e.value())
  }

  fn delete(&self, key: &[u8]) -> Option<LogRecordPos> {
    self.skl.remove(key).map(|e| *e.value())
  }

  fn len(&self) -> usize {
    self.skl.len()
  }

  fn next_key(&self, from: Bound<&[u8]>) -> Option<Vec<u8>> {
    self.skl.lower_bound(from).map(|e| e.key().clone())
  }
}
