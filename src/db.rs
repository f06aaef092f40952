use std::{
  collections::{HashMap, HashSet, VecDeque},
  fs::{self, File, OpenOptions},
  ops::Bound,
  path::Path,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use bytes::Bytes;
use fs2::FileExt;
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::{
  data::{
    data_file::{DataFile, DATA_FILE_NAME_SUFFIX},
    log_record::{LogRecord, LogRecordPos, LogRecordType, TransactionRecord},
  },
  errors::{Errors, Result},
  index::{self, Indexer},
  merge::DiscardStats,
  option::{EngineOptions, IOManagerType},
  txn::{
    log_record_key_with_seq, parse_log_record_key, Oracle, PendingWrites, Transaction,
    VersionLog, NON_TXN_SEQ_NO,
  },
  util,
};

pub const FILE_LOCK_NAME: &str = "flock";
const INITIAL_FILE_ID: u32 = 0;

/// Log-structured storage engine: append-only data files plus an in-memory
/// ordered index of live keys.
pub struct Engine {
  pub(crate) options: Arc<EngineOptions>,
  pub(crate) active_data_file: RwLock<DataFile>,
  pub(crate) old_data_files: RwLock<HashMap<u32, DataFile>>,
  pub(crate) index: Box<dyn Indexer>,
  pub(crate) oracle: Mutex<Oracle>,
  pub(crate) versions: RwLock<VersionLog>,
  pub(crate) discard_stats: Mutex<DiscardStats>,
  pub(crate) gc_lock: Mutex<()>,
  cache: ValueCache,
  lock_file: File,
  close_lock: Mutex<()>,
  closed: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
  pub key_num: usize,
  pub data_file_num: usize,
  pub reclaim_size: u64,
  pub disk_size: u64,
}

impl Engine {
  pub fn open(opts: EngineOptions) -> Result<Self> {
    check_options(&opts)?;

    let options = opts.clone();
    let dir_path = &options.dir_path;
    if !dir_path.is_dir() {
      if options.read_only {
        return Err(Errors::DatabaseDirNotFound);
      }
      if let Err(e) = fs::create_dir_all(dir_path) {
        error!("create database directory err: {}", e);
        return Err(Errors::FailedToCreateDatabaseDir);
      }
    }

    let lock_file = open_lock_file(dir_path, options.read_only)?;

    let mut file_ids = load_data_file_ids(dir_path)?;
    if file_ids.is_empty() {
      if options.read_only {
        return Err(Errors::DatabaseDirNotFound);
      }
      file_ids.push(INITIAL_FILE_ID);
    }

    let io_type = if options.mmap_at_startup {
      IOManagerType::MemoryMap
    } else {
      IOManagerType::StandardFileIO
    };
    let mut data_files = Vec::with_capacity(file_ids.len());
    for fid in file_ids.iter() {
      data_files.push(DataFile::new(dir_path, *fid, io_type)?);
    }
    let mut active_file = data_files.pop().ok_or(Errors::DataFileNotFound)?;
    let old_data_files: HashMap<u32, DataFile> = data_files
      .into_iter()
      .map(|f| (f.get_file_id(), f))
      .collect();

    let index = index::new_indexer(&options.index_type);
    let mut discard_stats = DiscardStats::default();
    let replay = load_index_from_data_files(
      &file_ids,
      &old_data_files,
      &active_file,
      index.as_ref(),
      &mut discard_stats,
    )?;

    // Writes always go through standard file I/O.
    let mut old_data_files = old_data_files;
    if options.mmap_at_startup {
      for file in old_data_files.values_mut() {
        file.set_io_manager(dir_path, IOManagerType::StandardFileIO)?;
      }
      active_file.set_io_manager(dir_path, IOManagerType::StandardFileIO)?;
    }
    // New records must follow the last one replay accepted, not a torn tail.
    if !options.read_only && replay.active_valid_end < active_file.file_size() {
      warn!(
        "truncating torn tail of data file {} at {} (file size {})",
        active_file.get_file_id(),
        replay.active_valid_end,
        active_file.file_size()
      );
      active_file.truncate(replay.active_valid_end)?;
    }
    active_file.set_write_off(active_file.file_size());

    info!(
      "opened database at {} with {} data files and {} keys",
      dir_path.display(),
      file_ids.len(),
      index.len()
    );

    Ok(Engine {
      cache: ValueCache::new(options.value_cache_size),
      options: Arc::new(options),
      active_data_file: RwLock::new(active_file),
      old_data_files: RwLock::new(old_data_files),
      index,
      oracle: Mutex::new(Oracle::new(replay.last_seq)),
      versions: RwLock::new(VersionLog::default()),
      discard_stats: Mutex::new(discard_stats),
      gc_lock: Mutex::new(()),
      lock_file,
      close_lock: Mutex::new(()),
      closed: AtomicBool::new(false),
    })
  }

  pub fn options(&self) -> &EngineOptions {
    &self.options
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  /// Runs `f` inside a read-only transaction.
  pub fn view<F, T>(self: &Arc<Self>, f: F) -> Result<T>
  where
    F: FnOnce(&Transaction) -> Result<T>,
  {
    if self.is_closed() {
      return Err(Errors::DatabaseClosed);
    }
    let txn = self.new_transaction(false);
    f(&txn)
  }

  /// Runs `f` inside a read-write transaction and commits it if `f` succeeds.
  pub fn update<F, T>(self: &Arc<Self>, f: F) -> Result<T>
  where
    F: FnOnce(&mut Transaction) -> Result<T>,
  {
    if self.is_closed() {
      return Err(Errors::DatabaseClosed);
    }
    let mut txn = self.new_transaction(true);
    let ret = f(&mut txn)?;
    txn.commit()?;
    Ok(ret)
  }

  pub fn new_transaction(self: &Arc<Self>, update: bool) -> Transaction {
    Transaction::new(self.clone(), update)
  }

  /// Reads the value `key` had as of `read_ts` from its data file.
  pub(crate) fn get_value_at(&self, key: &[u8], read_ts: u64) -> Result<Bytes> {
    // Holding both file locks keeps the record's file from being removed by
    // value-log GC between the index lookup and the read.
    let active_file = self.active_data_file.read();
    let old_files = self.old_data_files.read();
    if self.is_closed() {
      return Err(Errors::DatabaseClosed);
    }

    let pos = {
      let versions = self.versions.read();
      versions.resolve(key, read_ts, self.index.get(key))
    }
    .ok_or_else(|| Errors::KeyNotFound(Bytes::copy_from_slice(key)))?;
    if let Some(value) = self.cache.get(&pos) {
      return Ok(value);
    }

    let read = if active_file.get_file_id() == pos.file_id {
      active_file.read_log_record(pos.offset)?
    } else {
      old_files
        .get(&pos.file_id)
        .ok_or(Errors::DataFileNotFound)?
        .read_log_record(pos.offset)?
    };
    if read.record.rec_type == LogRecordType::Deleted {
      return Err(Errors::KeyNotFound(Bytes::copy_from_slice(key)));
    }

    let value = Bytes::from(read.record.value);
    self.cache.put(pos, value.clone());
    Ok(value)
  }

  /// Validates and applies the writes of a read-write transaction.
  pub(crate) fn commit_txn(
    &self,
    read_ts: u64,
    reads: HashSet<Vec<u8>>,
    pending: PendingWrites,
  ) -> Result<()> {
    let mut oracle = self.oracle.lock();
    let res = self.commit_locked(&mut oracle, read_ts, &reads, pending);
    self.finish_txn(&mut oracle, read_ts);
    res
  }

  /// Unregisters a transaction and forgets history no running one can read.
  pub(crate) fn finish_txn(&self, oracle: &mut Oracle, read_ts: u64) {
    oracle.done(read_ts);
    let mut versions = self.versions.write();
    if !versions.is_empty() {
      versions.prune(oracle.watermark());
    }
  }

  /// Smallest key past `from` carrying `prefix` that existed as of `read_ts`.
  pub(crate) fn next_key_at(
    &self,
    from: Bound<&[u8]>,
    prefix: &[u8],
    read_ts: u64,
  ) -> Option<Vec<u8>> {
    let mut from = from.map(|k| k.to_vec());
    loop {
      let bound = from.as_ref().map(|k| k.as_slice());
      let versions = self.versions.read();
      // keys removed after read_ts are only found in the version log
      let candidate = match (self.index.next_key(bound), versions.next_key(bound)) {
        (Some(a), Some(b)) => a.min(b),
        (a, b) => a.or(b)?,
      };
      if !candidate.starts_with(prefix) {
        return None;
      }
      if versions
        .resolve(&candidate, read_ts, self.index.get(&candidate))
        .is_some()
      {
        return Some(candidate);
      }
      from = Bound::Excluded(candidate);
    }
  }

  fn commit_locked(
    &self,
    oracle: &mut Oracle,
    read_ts: u64,
    reads: &HashSet<Vec<u8>>,
    pending: PendingWrites,
  ) -> Result<()> {
    if self.is_closed() {
      return Err(Errors::DatabaseClosed);
    }
    if pending.is_empty() {
      return Ok(());
    }
    if oracle.has_conflict(read_ts, reads) {
      return Err(Errors::TxnConflict);
    }

    let commit_ts = oracle.next_commit_ts();
    let mut records: Vec<LogRecord> = pending
      .iter()
      .map(|(key, value)| LogRecord {
        key: log_record_key_with_seq(key, commit_ts),
        value: value.as_ref().map(|v| v.to_vec()).unwrap_or_default(),
        rec_type: if value.is_some() {
          LogRecordType::Normal
        } else {
          LogRecordType::Deleted
        },
      })
      .collect();
    records.push(LogRecord {
      key: log_record_key_with_seq(&[], commit_ts),
      value: Vec::new(),
      rec_type: LogRecordType::TxnFinished,
    });

    let positions = self.append_log_records(&records)?;
    if self.options.sync_writes {
      self.active_data_file.read().sync()?;
    }

    // Other running transactions must keep seeing what these keys held before.
    if oracle.running() > 1 {
      let mut versions = self.versions.write();
      for key in pending.keys() {
        versions.record(commit_ts, key.clone(), self.index.get(key));
      }
    }

    let mut discard = self.discard_stats.lock();
    for ((key, value), pos) in pending.iter().zip(positions.iter()) {
      let old = match value {
        Some(_) => self.index.put(key.clone(), *pos),
        None => {
          discard.add_tombstone(pos);
          self.index.delete(key)
        }
      };
      if let Some(old) = old {
        discard.add_stale(&old);
      }
    }
    if let Some(fin) = positions.last() {
      discard.add_stale(fin);
    }

    oracle.record_commit(commit_ts, pending.into_keys().collect());
    Ok(())
  }

  /// Appends records contiguously to the active data file, sealing it first
  /// if they would push it past the configured size. Callers hold the commit lock.
  pub(crate) fn append_log_records(&self, records: &[LogRecord]) -> Result<Vec<LogRecordPos>> {
    let encoded: Vec<Vec<u8>> = records.iter().map(|r| r.encode()).collect();
    let batch_size: u64 = encoded.iter().map(|e| e.len() as u64).sum();

    let mut active_file = self.active_data_file.write();
    let write_off = active_file.get_write_off();
    if write_off > 0 && write_off + batch_size > self.options.data_file_size {
      active_file.sync()?;
      let next_id = active_file.get_file_id() + 1;
      let new_file = DataFile::new(&self.options.dir_path, next_id, IOManagerType::StandardFileIO)?;
      let sealed = std::mem::replace(&mut *active_file, new_file);
      let mut old_files = self.old_data_files.write();
      old_files.insert(sealed.get_file_id(), sealed);
    }

    let mut positions = Vec::with_capacity(encoded.len());
    for enc in encoded.iter() {
      let offset = active_file.get_write_off();
      active_file.write(enc)?;
      positions.push(LogRecordPos {
        file_id: active_file.get_file_id(),
        offset,
        size: enc.len() as u32,
      });
    }
    Ok(positions)
  }

  pub fn sync(&self) -> Result<()> {
    if self.is_closed() {
      return Err(Errors::DatabaseClosed);
    }
    if self.options.read_only {
      return Ok(());
    }
    self.active_data_file.read().sync()
  }

  /// On-disk size of the database directory in bytes.
  pub fn size(&self) -> u64 {
    util::file::dir_disk_size(&self.options.dir_path)
  }

  pub fn stat(&self) -> Result<Stat> {
    if self.is_closed() {
      return Err(Errors::DatabaseClosed);
    }
    let data_file_num = self.old_data_files.read().len() + 1;
    Ok(Stat {
      key_num: self.index.len(),
      data_file_num,
      reclaim_size: self.discard_stats.lock().total(),
      disk_size: self.size(),
    })
  }

  /// Closes the engine. Only the first call does any work; later calls return `Ok(())`.
  pub fn close(&self) -> Result<()> {
    let _guard = self.close_lock.lock();
    if self.is_closed() {
      return Ok(());
    }

    if self.options.compact_on_close && !self.options.read_only {
      self.compact();
    }

    // Wait out in-flight commits and reads before flipping the flag.
    let _oracle = self.oracle.lock();
    let active_file = self.active_data_file.write();
    let _old_files = self.old_data_files.write();
    self.closed.store(true, Ordering::SeqCst);

    let res = if self.options.read_only {
      Ok(())
    } else {
      active_file.sync()
    };
    if let Err(e) = FileExt::unlock(&self.lock_file) {
      warn!("failed to unlock database directory: {}", e);
    }
    info!("closed database at {}", self.options.dir_path.display());
    res
  }
}

impl Drop for Engine {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      error!("error whilst closing engine: {}", e);
    }
  }
}

fn check_options(opts: &EngineOptions) -> Result<()> {
  let dir_path = opts.dir_path.to_str();
  if dir_path.is_none() || dir_path.unwrap_or_default().is_empty() {
    return Err(Errors::DirPathIsEmpty);
  }
  if opts.data_file_size == 0 {
    return Err(Errors::DataFileSizeTooSmall);
  }
  Ok(())
}

fn open_lock_file(dir_path: &Path, read_only: bool) -> Result<File> {
  let path = dir_path.join(FILE_LOCK_NAME);
  let file = if read_only {
    OpenOptions::new().read(true).open(&path)
  } else {
    OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path)
  };
  let file = match file {
    Ok(file) => file,
    Err(e) if read_only => {
      warn!("no database lock file in {}: {}", dir_path.display(), e);
      return Err(Errors::DatabaseDirNotFound);
    }
    Err(e) => {
      error!("failed to open lock file: {}", e);
      return Err(Errors::FailedToOpenDataFile);
    }
  };
  let locked = if read_only {
    FileExt::try_lock_shared(&file)
  } else {
    FileExt::try_lock_exclusive(&file)
  };
  if locked.is_err() {
    return Err(Errors::DatabaseIsUsing);
  }
  Ok(file)
}

fn load_data_file_ids(dir_path: &Path) -> Result<Vec<u32>> {
  let dir = match fs::read_dir(dir_path) {
    Ok(dir) => dir,
    Err(e) => {
      error!("failed to read database dir: {}", e);
      return Err(Errors::FailedToReadDatabaseDir);
    }
  };

  let mut file_ids = Vec::new();
  for file in dir.flatten() {
    let file_os_str = file.file_name();
    let file_name = match file_os_str.to_str() {
      Some(name) => name,
      None => continue,
    };
    if let Some(stem) = file_name.strip_suffix(DATA_FILE_NAME_SUFFIX) {
      match stem.parse::<u32>() {
        Ok(fid) => file_ids.push(fid),
        Err(_) => return Err(Errors::DataDirectoryCorrupted),
      }
    }
  }
  file_ids.sort_unstable();
  Ok(file_ids)
}

struct Replay {
  // highest sequence number found in any record, finished or not
  last_seq: u64,
  // end of the last intact record in the active file
  active_valid_end: u64,
}

/// Replays every data file into the index. Records of a transaction are
/// applied only once its finish marker has been read.
///
/// The returned sequence number covers unfinished transactions too, so a
/// later commit never reuses the sequence of a torn one.
fn load_index_from_data_files(
  file_ids: &[u32],
  old_files: &HashMap<u32, DataFile>,
  active_file: &DataFile,
  index: &dyn Indexer,
  discard: &mut DiscardStats,
) -> Result<Replay> {
  let mut pending_txns: HashMap<u64, Vec<TransactionRecord>> = HashMap::new();
  let mut last_seq = NON_TXN_SEQ_NO;
  let mut active_valid_end = 0;

  let apply = |key: Vec<u8>, rec_type: LogRecordType, pos: LogRecordPos, discard: &mut DiscardStats| {
    let old = match rec_type {
      LogRecordType::Normal => index.put(key, pos),
      LogRecordType::Deleted => {
        discard.add_tombstone(&pos);
        index.delete(&key)
      }
      LogRecordType::TxnFinished => None,
    };
    if let Some(old) = old {
      discard.add_stale(&old);
    }
  };

  for file_id in file_ids.iter() {
    let data_file = if *file_id == active_file.get_file_id() {
      active_file
    } else {
      old_files.get(file_id).ok_or(Errors::DataFileNotFound)?
    };

    let mut offset = 0;
    loop {
      let (log_record, size) = match data_file.read_log_record(offset) {
        Ok(result) => (result.record, result.size),
        Err(Errors::ReadDataFileEOF) => break,
        Err(e) => return Err(e),
      };
      let pos = LogRecordPos {
        file_id: *file_id,
        offset,
        size: size as u32,
      };

      let (real_key, seq_no) = parse_log_record_key(&log_record.key)?;
      last_seq = last_seq.max(seq_no);
      if seq_no == NON_TXN_SEQ_NO {
        apply(real_key, log_record.rec_type, pos, discard);
      } else if log_record.rec_type == LogRecordType::TxnFinished {
        if let Some(records) = pending_txns.remove(&seq_no) {
          for txn_record in records {
            let (key, _) = parse_log_record_key(&txn_record.record.key)?;
            apply(key, txn_record.record.rec_type, txn_record.pos, discard);
          }
        }
        discard.add_stale(&pos);
      } else {
        pending_txns
          .entry(seq_no)
          .or_default()
          .push(TransactionRecord {
            record: log_record,
            pos,
          });
      }
      offset += size;
    }
    if *file_id == active_file.get_file_id() {
      active_valid_end = offset;
    }
  }

  // Batches that never saw their finish marker are garbage.
  for records in pending_txns.into_values() {
    for txn_record in records {
      discard.add_stale(&txn_record.pos);
    }
  }
  Ok(Replay {
    last_seq,
    active_valid_end,
  })
}

/// Small FIFO cache of values keyed by record position; positions are never reused.
struct ValueCache {
  capacity: u64,
  inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
  map: HashMap<LogRecordPos, Bytes>,
  order: VecDeque<LogRecordPos>,
  used: u64,
}

impl ValueCache {
  fn new(capacity: u64) -> Self {
    Self {
      capacity,
      inner: Mutex::new(CacheInner::default()),
    }
  }

  fn get(&self, pos: &LogRecordPos) -> Option<Bytes> {
    if self.capacity == 0 {
      return None;
    }
    self.inner.lock().map.get(pos).cloned()
  }

  fn put(&self, pos: LogRecordPos, value: Bytes) {
    let size = value.len() as u64;
    if self.capacity == 0 || size > self.capacity {
      return;
    }
    let mut inner = self.inner.lock();
    if inner.map.contains_key(&pos) {
      return;
    }
    while inner.used + size > self.capacity {
      match inner.order.pop_front() {
        Some(evict) => {
          if let Some(v) = inner.map.remove(&evict) {
            inner.used -= v.len() as u64;
          }
        }
        None => break,
      }
    }
    inner.used += size;
    inner.order.push_back(pos);
    inner.map.insert(pos, value);
  }
}
