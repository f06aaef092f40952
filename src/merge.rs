use std::{collections::HashMap, fs};

use log::{debug, error};

use crate::{
  data::{
    data_file::{get_data_file_name, DataFile},
    log_record::{LogRecord, LogRecordPos, LogRecordType},
  },
  db::Engine,
  errors::{Errors, Result},
  option::IOManagerType,
  txn::{log_record_key_with_seq, parse_log_record_key, NON_TXN_SEQ_NO},
  util,
};

/// Per data file byte counts of records that no longer back a live key.
///
/// Tombstones are tracked apart from other stale records: one may still
/// shadow an older record of its key in an earlier file, so it only becomes
/// reclaimable once its file is the oldest one left.
#[derive(Debug, Default)]
pub(crate) struct DiscardStats {
  stale: HashMap<u32, u64>,
  tombstones: HashMap<u32, u64>,
}

impl DiscardStats {
  pub(crate) fn add_stale(&mut self, pos: &LogRecordPos) {
    *self.stale.entry(pos.file_id).or_insert(0) += pos.size as u64;
  }

  pub(crate) fn add_tombstone(&mut self, pos: &LogRecordPos) {
    *self.tombstones.entry(pos.file_id).or_insert(0) += pos.size as u64;
  }

  fn reclaimable(&self, file_id: u32, is_oldest: bool) -> u64 {
    let stale = self.stale.get(&file_id).copied().unwrap_or(0);
    if is_oldest {
      stale + self.tombstones.get(&file_id).copied().unwrap_or(0)
    } else {
      stale
    }
  }

  fn remove(&mut self, file_id: u32) {
    self.stale.remove(&file_id);
    self.tombstones.remove(&file_id);
  }

  pub(crate) fn total(&self) -> u64 {
    self.stale.values().sum::<u64>() + self.tombstones.values().sum::<u64>()
  }
}

/// A record of the file being reclaimed that must survive the rewrite.
struct LiveRecord {
  key: Vec<u8>,
  value: Vec<u8>,
  rec_type: LogRecordType,
  old_pos: LogRecordPos,
}

impl Engine {
  /// Reclaims one sealed data file whose share of reclaimable bytes is at
  /// least `discard_ratio`: its live records are appended to the active file,
  /// the index is repointed and the file is deleted.
  ///
  /// Returns [`Errors::NoRewrite`] when no file qualifies; this is the normal
  /// outcome for a database without garbage and for a read-only one.
  pub fn run_value_log_gc(&self, discard_ratio: f32) -> Result<()> {
    if self.is_closed() {
      return Err(Errors::DatabaseClosed);
    }
    if self.options.read_only {
      return Err(Errors::NoRewrite);
    }
    let _gc = match self.gc_lock.try_lock() {
      Some(guard) => guard,
      None => return Err(Errors::ValueLogGcInProgress),
    };
    self.rewrite_one_file(discard_ratio)
  }

  /// Reclaims every sealed file holding reclaimable bytes. Used on close.
  pub(crate) fn compact(&self) {
    let _gc = self.gc_lock.lock();
    let rounds = self.old_data_files.read().len() * 2;
    for _ in 0..rounds {
      match self.rewrite_one_file(f32::MIN_POSITIVE) {
        Ok(()) => continue,
        Err(Errors::NoRewrite) => break,
        Err(e) => {
          error!("compaction on close failed: {}", e);
          break;
        }
      }
    }
  }

  fn pick_gc_candidate(&self, discard_ratio: f32) -> Option<u32> {
    let old_files = self.old_data_files.read();
    let oldest = old_files.keys().min().copied()?;
    let discard = self.discard_stats.lock();
    old_files
      .values()
      .filter_map(|file| {
        let fid = file.get_file_id();
        let reclaimable = discard.reclaimable(fid, fid == oldest);
        let file_size = file.file_size();
        if reclaimable == 0 || file_size == 0 {
          return None;
        }
        let ratio = reclaimable as f32 / file_size as f32;
        (ratio >= discard_ratio).then_some((fid, ratio))
      })
      .max_by(|a, b| a.1.total_cmp(&b.1))
      .map(|(fid, _)| fid)
  }

  fn rewrite_one_file(&self, discard_ratio: f32) -> Result<()> {
    let candidate = self.pick_gc_candidate(discard_ratio).ok_or(Errors::NoRewrite)?;
    // a running transaction may still read old versions out of the file
    if self.versions.read().references_file(candidate) {
      return Err(Errors::NoRewrite);
    }

    // Reading the candidate needs no lock: only GC removes sealed files.
    let (scanned, is_oldest) = self.collect_live_records(candidate)?;
    let live_size: u64 = scanned.iter().map(|r| r.old_pos.size as u64).sum();
    let available = util::file::available_disk_space(&self.options.dir_path);
    if live_size >= available {
      return Err(Errors::NoEnoughSpaceForGc);
    }
    self.rewrite_scanned(candidate, &scanned, is_oldest)
  }

  /// Copies the scanned records that are still live into the active file and
  /// deletes the candidate file.
  fn rewrite_scanned(&self, candidate: u32, scanned: &[LiveRecord], is_oldest: bool) -> Result<()> {
    {
      // The commit lock keeps the rewritten records ordered before any later
      // commit touching the same keys.
      let _commit = self.oracle.lock();
      if self.is_closed() {
        return Err(Errors::DatabaseClosed);
      }
      if self.versions.read().references_file(candidate) {
        return Err(Errors::NoRewrite);
      }

      // records overwritten or deleted since the scan need no copy
      let live: Vec<&LiveRecord> = scanned
        .iter()
        .filter(|r| self.is_live(r, is_oldest))
        .collect();
      debug!(
        "rewriting data file {} ({} of {} records live, oldest: {})",
        candidate,
        live.len(),
        scanned.len(),
        is_oldest
      );

      if !live.is_empty() {
        let records: Vec<LogRecord> = live
          .iter()
          .map(|r| LogRecord {
            key: log_record_key_with_seq(&r.key, NON_TXN_SEQ_NO),
            value: r.value.clone(),
            rec_type: r.rec_type,
          })
          .collect();
        let positions = self.append_log_records(&records)?;
        self.active_data_file.read().sync()?;

        let mut discard = self.discard_stats.lock();
        for (rec, pos) in live.iter().zip(positions.into_iter()) {
          match rec.rec_type {
            LogRecordType::Normal => {
              self.index.put(rec.key.clone(), pos);
            }
            _ => discard.add_tombstone(&pos),
          }
        }
      }
    }

    // Readers hold the file locks across lookup and read, so once the write
    // lock is ours nobody is still reading the old positions.
    let removed = self.old_data_files.write().remove(&candidate);
    self.discard_stats.lock().remove(candidate);
    drop(removed);
    let file_name = get_data_file_name(&self.options.dir_path, candidate);
    if let Err(e) = fs::remove_file(&file_name) {
      error!("failed to remove data file {}: {}", file_name.display(), e);
      return Err(Errors::FailedToRemoveDataFile);
    }
    Ok(())
  }

  // Called with the commit lock held, so the index cannot move underneath.
  fn is_live(&self, rec: &LiveRecord, is_oldest: bool) -> bool {
    match rec.rec_type {
      LogRecordType::Normal => self.index.get(&rec.key) == Some(rec.old_pos),
      LogRecordType::Deleted => !is_oldest && self.index.get(&rec.key).is_none(),
      LogRecordType::TxnFinished => false,
    }
  }

  /// Reads the records of `file_id` that are still referenced by the index,
  /// plus tombstones that may still shadow a record in an older file.
  fn collect_live_records(&self, file_id: u32) -> Result<(Vec<LiveRecord>, bool)> {
    let is_oldest = {
      let old_files = self.old_data_files.read();
      if !old_files.contains_key(&file_id) {
        return Err(Errors::DataFileNotFound);
      }
      old_files.keys().all(|fid| *fid >= file_id)
    };
    // a private handle, so commits rotating the active file are not held up
    let data_file = DataFile::new(&self.options.dir_path, file_id, IOManagerType::StandardFileIO)?;

    let mut live = Vec::new();
    let mut offset = 0;
    loop {
      let (record, size) = match data_file.read_log_record(offset) {
        Ok(result) => (result.record, result.size),
        Err(Errors::ReadDataFileEOF) => break,
        Err(e) => return Err(e),
      };
      let pos = LogRecordPos {
        file_id,
        offset,
        size: size as u32,
      };
      offset += size;

      let (key, _) = parse_log_record_key(&record.key)?;
      let rec = LiveRecord {
        key,
        value: record.value,
        rec_type: record.rec_type,
        old_pos: pos,
      };
      if self.is_live(&rec, is_oldest) {
        live.push(rec);
      }
    }
    Ok((live, is_oldest))
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use bytes::Bytes;

  use super::*;
  use crate::{
    option::EngineOptions,
    util::rand_kv::{get_test_key, get_test_value},
  };

  fn open_engine(dir: &std::path::Path) -> Arc<Engine> {
    let opts = EngineOptions {
      dir_path: dir.to_path_buf(),
      data_file_size: 64 * 1024,
      compact_on_close: false,
      ..Default::default()
    };
    Arc::new(Engine::open(opts).expect("failed to open engine"))
  }

  fn put(engine: &Arc<Engine>, key: Bytes, value: Bytes) {
    engine
      .update(|txn| txn.set(key.to_vec(), value))
      .expect("failed to put");
  }

  #[test]
  fn test_gc_empty_engine() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    assert_eq!(engine.run_value_log_gc(0.5), Err(Errors::NoRewrite));
  }

  #[test]
  fn test_gc_reclaims_overwritten_file() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());

    for i in 0..2000 {
      put(&engine, get_test_key(i), get_test_value(i));
    }
    for i in 0..2000 {
      put(&engine, get_test_key(i), Bytes::from("new value in gc"));
    }
    let files_before = engine.stat().unwrap().data_file_num;
    assert!(files_before > 2);

    assert!(engine.run_value_log_gc(0.5).is_ok());
    let stat = engine.stat().unwrap();
    assert_eq!(stat.data_file_num, files_before - 1);
    assert_eq!(stat.key_num, 2000);

    for i in 0..2000 {
      let value = engine.view(|txn| txn.get(&get_test_key(i))).unwrap();
      assert_eq!(value, Bytes::from("new value in gc"));
    }
  }

  #[test]
  fn test_gc_keeps_tombstones_until_oldest() {
    let dir = tempfile::tempdir().unwrap();
    {
      let engine = open_engine(dir.path());
      for i in 0..2000 {
        put(&engine, get_test_key(i), get_test_value(i));
      }
      for i in 0..1000 {
        engine
          .update(|txn| txn.delete(get_test_key(i).to_vec()))
          .unwrap();
      }
      // pad so the tombstones end up in a sealed file
      for i in 2000..3000 {
        put(&engine, get_test_key(i), get_test_value(i));
      }
      while engine.run_value_log_gc(0.01).is_ok() {}
      engine.close().unwrap();
    }

    let engine = open_engine(dir.path());
    for i in 0..1000 {
      let res = engine.view(|txn| txn.get(&get_test_key(i)));
      assert!(res.unwrap_err().is_not_found());
    }
    for i in 1000..3000 {
      assert!(engine.view(|txn| txn.get(&get_test_key(i))).is_ok());
    }
    assert_eq!(engine.stat().unwrap().key_num, 2000);
  }

  #[test]
  fn test_gc_read_only_and_closed() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    put(&engine, Bytes::from("k"), Bytes::from("v"));
    engine.close().unwrap();
    assert_eq!(engine.run_value_log_gc(0.5), Err(Errors::DatabaseClosed));

    let opts = EngineOptions {
      dir_path: dir.path().to_path_buf(),
      read_only: true,
      compact_on_close: false,
      ..Default::default()
    };
    let ro = Engine::open(opts).unwrap();
    assert_eq!(ro.run_value_log_gc(0.5), Err(Errors::NoRewrite));
  }

  #[test]
  fn test_gc_does_not_resurrect_writes_made_during_scan() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    for i in 0..2000 {
      put(&engine, get_test_key(i), get_test_value(i));
    }
    for i in (0..2000).step_by(2) {
      put(&engine, get_test_key(i), Bytes::from("new"));
    }

    let candidate = engine.pick_gc_candidate(0.3).unwrap();
    let (scanned, is_oldest) = engine.collect_live_records(candidate).unwrap();
    assert!(scanned.len() >= 2);
    let overwritten = scanned[0].key.clone();
    let deleted = scanned[1].key.clone();

    // foreground commits land between the scan and the rewrite
    put(&engine, Bytes::from(overwritten.clone()), Bytes::from("after scan"));
    engine.update(|txn| txn.delete(deleted.clone())).unwrap();

    engine.rewrite_scanned(candidate, &scanned, is_oldest).unwrap();
    let check = |engine: &Arc<Engine>| {
      assert_eq!(
        engine.view(|txn| txn.get(&overwritten)).unwrap(),
        Bytes::from("after scan")
      );
      assert!(engine.view(|txn| txn.get(&deleted)).unwrap_err().is_not_found());
      assert_eq!(engine.stat().unwrap().key_num, 1999);
    };
    check(&engine);

    engine.close().unwrap();
    drop(engine);
    check(&open_engine(dir.path()));
  }

  #[test]
  fn test_gc_waits_for_older_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    for i in 0..2000 {
      put(&engine, get_test_key(i), Bytes::from(format!("old-{}", i)));
    }

    let reader = engine.new_transaction(false);
    for i in 0..2000 {
      put(&engine, get_test_key(i), Bytes::from("new"));
    }

    // the reader still needs the overwritten records
    assert_eq!(engine.run_value_log_gc(0.5), Err(Errors::NoRewrite));
    assert_eq!(reader.get(&get_test_key(7)).unwrap(), Bytes::from("old-7"));
    drop(reader);

    assert!(engine.run_value_log_gc(0.5).is_ok());
    assert_eq!(
      engine.view(|txn| txn.get(&get_test_key(7))).unwrap(),
      Bytes::from("new")
    );
  }
}
