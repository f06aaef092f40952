use std::{collections::BTreeMap, ops::Bound};

use parking_lot::RwLock;

use crate::data::log_record::LogRecordPos;

use super::Indexer;

pub struct BTree {
  tree: RwLock<BTreeMap<Vec<u8>, LogRecordPos>>,
}

impl BTree {
  pub fn new() -> Self {
    Self {
      tree: RwLock::new(BTreeMap::new()),
    }
  }
}

impl Default for BTree {
  fn default() -> Self {
    Self::new()
  }
}

impl Indexer for BTree {
  fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Option<LogRecordPos> {
    self.tree.write().insert(key, pos)
  }

  fn get(&self, key: &[u8]) -> Option<LogRecordPos> {
    self.tree.read().get(key).copied()
  }

  fn delete(&self, key: &[u8]) -> Option<LogRecordPos> {
    self.tree.write().remove(key)
  }

  fn len(&self) -> usize {
    self.tree.read().len()
  }

  fn next_key(&self, from: Bound<&[u8]>) -> Option<Vec<u8>> {
    let read_guard = self.tree.read();
    read_guard
      .range::<[u8], _>((from, Bound::Unbounded))
      .next()
      .map(|(k, _)| k.clone())
  }
}
