pub mod btree;
pub mod skiplist;

use std::ops::Bound;

use crate::{data::log_record::LogRecordPos, option::IndexType};

/// In-memory ordered map from key to the position of its live record.
pub trait Indexer: Sync + Send {
  /// Stores a key's position, returning the one it replaced.
  fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Option<LogRecordPos>;

  /// Retrieves a key's position from the index.
  fn get(&self, key: &[u8]) -> Option<LogRecordPos>;

  /// Deletes a key's position from the index.
  fn delete(&self, key: &[u8]) -> Option<LogRecordPos>;

  fn len(&self) -> usize;

  /// Returns the smallest key past `from`, in byte order.
  fn next_key(&self, from: Bound<&[u8]>) -> Option<Vec<u8>>;
}

/// Creates a new indexer based on the specified index type.
pub fn new_indexer(index_type: &IndexType) -> Box<dyn Indexer> {
  match *index_type {
    IndexType::BTree => Box::new(btree::BTree::new()),
    IndexType::SkipList => Box::new(skiplist::SkipList::new()),
  }
}
