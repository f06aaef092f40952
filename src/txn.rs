use std::{
  collections::{BTreeMap, HashSet},
  ops::Bound,
  sync::Arc,
};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use prost::encoding::{decode_varint, encode_varint};

use crate::{
  data::log_record::LogRecordPos,
  db::Engine,
  errors::{Errors, Result},
  iterator::Iterator,
  option::IteratorOptions,
};

/// Sequence number of records written outside a transaction (value-log rewrites).
pub(crate) const NON_TXN_SEQ_NO: u64 = 0;

/// Upper bound on buffered writes in one read-write transaction.
pub const MAX_TXN_WRITES: usize = 10_000;

/// Prepends the commit sequence number to a key as it is stored in a data file.
pub(crate) fn log_record_key_with_seq(key: &[u8], seq_no: u64) -> Vec<u8> {
  let mut enc_key = BytesMut::new();
  encode_varint(seq_no, &mut enc_key);
  enc_key.extend_from_slice(key);
  enc_key.to_vec()
}

pub(crate) fn parse_log_record_key(key: &[u8]) -> Result<(Vec<u8>, u64)> {
  let mut buf = key;
  let seq_no = decode_varint(&mut buf).map_err(|_| Errors::DataDirectoryCorrupted)?;
  Ok((buf.chunk().to_vec(), seq_no))
}

struct CommittedTxn {
  ts: u64,
  keys: HashSet<Vec<u8>>,
}

/// Hands out timestamps and detects read-write conflicts between transactions.
///
/// The oracle mutex doubles as the engine's commit lock: every append to the
/// active data file and every index mutation happens while it is held.
pub(crate) struct Oracle {
  next_ts: u64,
  committed: Vec<CommittedTxn>,
  // read timestamps of running read-write transactions, with counts
  active: BTreeMap<u64, usize>,
}

impl Oracle {
  pub(crate) fn new(last_seq: u64) -> Self {
    Self {
      next_ts: last_seq + 1,
      committed: Vec::new(),
      active: BTreeMap::new(),
    }
  }

  pub(crate) fn read_ts(&self) -> u64 {
    self.next_ts - 1
  }

  pub(crate) fn begin(&mut self) -> u64 {
    let ts = self.read_ts();
    *self.active.entry(ts).or_insert(0) += 1;
    ts
  }

  pub(crate) fn done(&mut self, read_ts: u64) {
    if let Some(n) = self.active.get_mut(&read_ts) {
      *n -= 1;
      if *n == 0 {
        self.active.remove(&read_ts);
      }
    }
    self.cleanup();
  }

  /// Reports whether any key in `reads` was committed by a transaction that
  /// started after `read_ts`.
  pub(crate) fn has_conflict(&self, read_ts: u64, reads: &HashSet<Vec<u8>>) -> bool {
    if reads.is_empty() {
      return false;
    }
    self
      .committed
      .iter()
      .filter(|c| c.ts > read_ts)
      .any(|c| c.keys.iter().any(|k| reads.contains(k)))
  }

  pub(crate) fn next_commit_ts(&mut self) -> u64 {
    let ts = self.next_ts;
    self.next_ts += 1;
    ts
  }

  pub(crate) fn record_commit(&mut self, ts: u64, keys: HashSet<Vec<u8>>) {
    if !self.active.is_empty() {
      self.committed.push(CommittedTxn { ts, keys });
    }
  }

  /// Number of transactions that have begun and not finished.
  pub(crate) fn running(&self) -> usize {
    self.active.values().sum()
  }

  /// Oldest read timestamp still in use. Nothing committed at or below it
  /// needs to be remembered.
  pub(crate) fn watermark(&self) -> u64 {
    self
      .active
      .keys()
      .next()
      .copied()
      .unwrap_or_else(|| self.read_ts())
  }

  fn cleanup(&mut self) {
    let watermark = self.watermark();
    self.committed.retain(|c| c.ts > watermark);
  }
}

/// Where keys pointed before recent commits, so that transactions which
/// began earlier keep reading the state as of their read timestamp.
///
/// Each commit records the previous position of the keys it writes before it
/// touches the index. A reader holding the read lock therefore never sees an
/// index change without its matching entry here.
#[derive(Default)]
pub(crate) struct VersionLog {
  // key -> (commit ts, position before that commit), in ascending ts order
  undo: BTreeMap<Vec<u8>, Vec<(u64, Option<LogRecordPos>)>>,
}

impl VersionLog {
  pub(crate) fn record(&mut self, ts: u64, key: Vec<u8>, prev: Option<LogRecordPos>) {
    self.undo.entry(key).or_default().push((ts, prev));
  }

  /// Position of `key` as of `read_ts`, given where the index points now.
  pub(crate) fn resolve(
    &self,
    key: &[u8],
    read_ts: u64,
    current: Option<LogRecordPos>,
  ) -> Option<LogRecordPos> {
    let earliest_after = self
      .undo
      .get(key)
      .and_then(|versions| versions.iter().find(|(ts, _)| *ts > read_ts));
    match earliest_after {
      Some((_, prev)) => *prev,
      None => current,
    }
  }

  /// Smallest key past `from` that has history, whether or not it is live now.
  pub(crate) fn next_key(&self, from: Bound<&[u8]>) -> Option<Vec<u8>> {
    self
      .undo
      .range::<[u8], _>((from, Bound::Unbounded))
      .next()
      .map(|(k, _)| k.clone())
  }

  pub(crate) fn references_file(&self, file_id: u32) -> bool {
    self
      .undo
      .values()
      .flatten()
      .any(|(_, prev)| prev.is_some_and(|p| p.file_id == file_id))
  }

  pub(crate) fn prune(&mut self, watermark: u64) {
    self.undo.retain(|_, versions| {
      versions.retain(|(ts, _)| *ts > watermark);
      !versions.is_empty()
    });
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.undo.is_empty()
  }
}

/// A buffered write: `Some(value)` to set, `None` to delete.
pub(crate) type PendingWrites = BTreeMap<Vec<u8>, Option<Bytes>>;

/// A read-only or read-write transaction over an [`Engine`].
///
/// Every read observes the database as of the moment the transaction began,
/// including reads through its iterators. Read-write transactions buffer their
/// writes and remember every key they read; [`commit`](Transaction::commit)
/// fails with [`Errors::TxnConflict`] if another transaction committed one of
/// those keys after this one began. Dropping a transaction without committing
/// discards it.
pub struct Transaction {
  engine: Arc<Engine>,
  update: bool,
  read_ts: u64,
  reads: Mutex<HashSet<Vec<u8>>>,
  pending: PendingWrites,
  done: bool,
}

impl Transaction {
  pub(crate) fn new(engine: Arc<Engine>, update: bool) -> Self {
    let read_ts = engine.oracle.lock().begin();
    Self {
      engine,
      update,
      read_ts,
      reads: Mutex::new(HashSet::new()),
      pending: BTreeMap::new(),
      done: false,
    }
  }

  pub fn read_ts(&self) -> u64 {
    self.read_ts
  }

  pub fn get(&self, key: &[u8]) -> Result<Bytes> {
    if key.is_empty() {
      return Err(Errors::KeyIsEmpty);
    }
    if self.update {
      if let Some(write) = self.pending.get(key) {
        return write
          .clone()
          .ok_or_else(|| Errors::KeyNotFound(Bytes::copy_from_slice(key)));
      }
      self.reads.lock().insert(key.to_vec());
    }
    self.engine.get_value_at(key, self.read_ts)
  }

  pub fn set(&mut self, key: Vec<u8>, value: Bytes) -> Result<()> {
    self.check_writable(&key)?;
    self.pending.insert(key, Some(value));
    Ok(())
  }

  pub fn delete(&mut self, key: Vec<u8>) -> Result<()> {
    self.check_writable(&key)?;
    self.pending.insert(key, None);
    Ok(())
  }

  fn check_writable(&self, key: &[u8]) -> Result<()> {
    if !self.update || self.engine.options.read_only {
      return Err(Errors::ReadOnly);
    }
    if key.is_empty() {
      return Err(Errors::KeyIsEmpty);
    }
    if self.pending.len() >= MAX_TXN_WRITES && !self.pending.contains_key(key) {
      return Err(Errors::TxnTooBig);
    }
    Ok(())
  }

  /// Opens a forward cursor over the keys committed when the transaction
  /// began; buffered writes are not visible to it.
  pub fn new_iterator(&self, options: IteratorOptions) -> Iterator {
    Iterator::new(self.engine.clone(), options, self.read_ts)
  }

  pub fn commit(mut self) -> Result<()> {
    if !self.update {
      // released on drop
      return Ok(());
    }
    let reads = std::mem::take(&mut *self.reads.lock());
    let pending = std::mem::take(&mut self.pending);
    self.done = true;
    self.engine.commit_txn(self.read_ts, reads, pending)
  }
}

impl Drop for Transaction {
  fn drop(&mut self) {
    if !self.done {
      let mut oracle = self.engine.oracle.lock();
      self.engine.finish_txn(&mut oracle, self.read_ts);
    }
  }
}
