use std::{
  collections::BTreeMap,
  fs,
  path::{Path, PathBuf},
  sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
  },
  thread,
};

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::{
  context::Context,
  db::Engine,
  errors::{Errors, Result},
  option::IteratorOptions,
  prefix::Prefix,
  txn::Transaction,
  util,
};

/// One shard per possible first byte of a logical key.
pub const SHARDS: usize = 256;

const COUNTER_FILE_PREFIX: &str = "KEYCOUNT-";

/// Counts the keys under `prefix` with a parallel scan.
///
/// The key space is split on the first byte of the logical key and the shards
/// are handed out to a bounded set of worker threads, all reading the same
/// snapshot. The first failing shard cancels the rest and its error is
/// returned; there is no partial count.
pub fn sharded_count(db: &Arc<Engine>, prefix: &Prefix, ctx: &Context) -> Result<u64> {
  if db.is_closed() {
    return Err(Errors::DatabaseClosed);
  }
  if let Some(e) = ctx.err() {
    return Err(e);
  }

  let workers = thread::available_parallelism()
    .map(|n| n.get())
    .unwrap_or(4)
    .min(SHARDS);
  db.view(|txn| {
    let mut total = scatter(ctx, workers, |shard, ctx| {
      count_shard(txn, prefix.add(&[shard as u8]), ctx)
    })?;
    // the empty logical key is the prefix itself, which no shard covers
    if !prefix.is_empty() && txn.get(prefix).is_ok() {
      total += 1;
    }
    Ok(total)
  })
}

/// Runs `count` over every shard on `workers` threads and sums the results.
fn scatter<F>(ctx: &Context, workers: usize, count: F) -> Result<u64>
where
  F: Fn(usize, &Context) -> Result<u64> + Sync,
{
  let ctx = ctx.with_cancel();
  let next_shard = AtomicUsize::new(0);
  let finished = AtomicUsize::new(0);
  let total = AtomicU64::new(0);
  let first_err: Mutex<Option<Errors>> = Mutex::new(None);

  thread::scope(|s| {
    for _ in 0..workers {
      s.spawn(|| loop {
        let shard = next_shard.fetch_add(1, Ordering::Relaxed);
        if shard >= SHARDS || ctx.is_done() {
          break;
        }
        match count(shard, &ctx) {
          Ok(n) => {
            total.fetch_add(n, Ordering::Relaxed);
            finished.fetch_add(1, Ordering::Relaxed);
          }
          Err(e) => {
            first_err.lock().get_or_insert(e);
            ctx.cancel();
            break;
          }
        }
      });
    }
  });

  if let Some(e) = first_err.into_inner() {
    return Err(e);
  }
  if finished.into_inner() < SHARDS {
    // workers stopped because the caller's context ended
    return Err(ctx.err().unwrap_or(Errors::Cancelled));
  }
  Ok(total.into_inner())
}

fn count_shard(txn: &Transaction, shard_prefix: Vec<u8>, ctx: &Context) -> Result<u64> {
  let mut iter = txn.new_iterator(IteratorOptions {
    prefix: shard_prefix,
  });
  let mut n = 0;
  iter.rewind();
  while iter.valid() {
    if let Some(e) = ctx.err() {
      return Err(e);
    }
    n += 1;
    iter.next();
  }
  iter.status()?;
  Ok(n)
}

/// Key count of one prefix, cached in memory and in a sidecar file.
///
/// `None` means unknown: the next [`get_or_compute`](KeyCounter::get_or_compute)
/// recounts from scratch.
pub struct KeyCounter {
  path: PathBuf,
  read_only: bool,
  count: Mutex<Option<u64>>,
}

impl KeyCounter {
  fn load(path: PathBuf, read_only: bool) -> Self {
    let count = match fs::read_to_string(&path) {
      Ok(s) => match s.trim().parse::<u64>() {
        Ok(n) => Some(n),
        Err(_) => {
          warn!("malformed key counter {}, will recount", path.display());
          None
        }
      },
      Err(_) => None,
    };
    Self {
      path,
      read_only,
      count: Mutex::new(count),
    }
  }

  pub fn get(&self) -> Option<u64> {
    *self.count.lock()
  }

  /// Returns the cached count, running `compute` and persisting its result
  /// when the count is unknown.
  pub fn get_or_compute<F>(&self, compute: F) -> Result<u64>
  where
    F: FnOnce() -> Result<u64>,
  {
    let mut count = self.count.lock();
    if let Some(n) = *count {
      return Ok(n);
    }
    let n = compute()?;
    debug!("recounted {} keys for {}", n, self.path.display());
    *count = Some(n);
    self.persist(n);
    Ok(n)
  }

  fn apply(&self, count: &mut Option<u64>, delta: i64) {
    if let Some(n) = count.as_mut() {
      *n = n.saturating_add_signed(delta);
      self.persist(*n);
    }
  }

  fn persist(&self, n: u64) {
    if self.read_only {
      return;
    }
    if let Err(e) = util::file::write_atomic(&self.path, n.to_string().as_bytes()) {
      warn!("key counter not persisted: {}", e);
    }
  }
}

/// The persisted key counters of one database, one per counted prefix.
///
/// A mutation adjusts every counter whose prefix covers the mutated key, so a
/// count taken through an outer scope stays right when an inner one writes.
pub(crate) struct CounterSet {
  dir_path: PathBuf,
  enabled: bool,
  read_only: bool,
  // Mutations hold it shared; registering a new counter holds it exclusively,
  // so a recount never starts while a mutation it cannot see is in flight.
  gate: RwLock<()>,
  counters: Mutex<BTreeMap<Prefix, Arc<KeyCounter>>>,
}

impl CounterSet {
  /// Loads every sidecar in `dir_path`. With counting disabled, sidecars are
  /// removed instead, since mutations made now would leave them stale.
  pub(crate) fn load(dir_path: &Path, enabled: bool, read_only: bool) -> Self {
    let mut counters = BTreeMap::new();
    for (prefix, path) in list_counter_files(dir_path) {
      if enabled {
        let counter = KeyCounter::load(path, read_only);
        counters.insert(prefix, Arc::new(counter));
      } else if !read_only {
        if let Err(e) = fs::remove_file(&path) {
          warn!("failed to remove key counter {}: {}", path.display(), e);
        }
      }
    }
    Self {
      dir_path: dir_path.to_path_buf(),
      enabled,
      read_only,
      gate: RwLock::new(()),
      counters: Mutex::new(counters),
    }
  }

  /// The counter of `prefix`, registered on first use. `None` when counting is off.
  pub(crate) fn get(&self, prefix: &Prefix) -> Option<Arc<KeyCounter>> {
    if !self.enabled {
      return None;
    }
    if let Some(counter) = self.counters.lock().get(prefix) {
      return Some(counter.clone());
    }
    let _gate = self.gate.write();
    let mut counters = self.counters.lock();
    let counter = counters.entry(prefix.clone()).or_insert_with(|| {
      let path = counter_file_path(&self.dir_path, prefix);
      Arc::new(KeyCounter::load(path, self.read_only))
    });
    Some(counter.clone())
  }

  /// Runs a mutation of `real_key` that reports how it changed the number of
  /// keys, and applies that change to every covering counter.
  ///
  /// The covering counters stay locked across the mutation, so a concurrent
  /// recount either sees the mutation or has it applied afterwards, never both.
  pub(crate) fn track<T, F>(&self, real_key: &[u8], op: F) -> Result<T>
  where
    F: FnOnce() -> Result<(T, i64)>,
  {
    if !self.enabled {
      return op().map(|(ret, _)| ret);
    }
    let _gate = self.gate.read();
    // BTreeMap order gives every mutation the same lock order.
    let covering: Vec<Arc<KeyCounter>> = self
      .counters
      .lock()
      .iter()
      .filter(|(prefix, _)| real_key.starts_with(prefix.as_bytes()))
      .map(|(_, counter)| counter.clone())
      .collect();
    let mut guards: Vec<_> = covering.iter().map(|c| c.count.lock()).collect();

    let (ret, delta) = op()?;
    if delta != 0 {
      for (counter, guard) in covering.iter().zip(guards.iter_mut()) {
        counter.apply(guard, delta);
      }
    }
    Ok(ret)
  }
}

fn counter_file_path(dir_path: &Path, prefix: &Prefix) -> PathBuf {
  let hex: String = prefix.iter().map(|b| format!("{:02x}", b)).collect();
  dir_path.join(format!("{}{}", COUNTER_FILE_PREFIX, hex))
}

fn list_counter_files(dir_path: &Path) -> Vec<(Prefix, PathBuf)> {
  let dir = match fs::read_dir(dir_path) {
    Ok(dir) => dir,
    Err(_) => return Vec::new(),
  };
  dir
    .flatten()
    .filter_map(|entry| {
      let file_name = entry.file_name();
      let hex = file_name.to_str()?.strip_prefix(COUNTER_FILE_PREFIX)?;
      let prefix = decode_hex(hex)?;
      Some((Prefix::new(prefix), entry.path()))
    })
    .collect()
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
  if s.len() % 2 != 0 {
    return None;
  }
  (0..s.len())
    .step_by(2)
    .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
    .collect()
}

#[cfg(test)]
mod tests {
  use std::time::{Duration, Instant};

  use bytes::Bytes;

  use super::*;
  use crate::option::EngineOptions;

  fn open_engine(dir: &Path) -> Arc<Engine> {
    let opts = EngineOptions {
      dir_path: dir.to_path_buf(),
      ..Default::default()
    };
    Arc::new(Engine::open(opts).unwrap())
  }

  #[test]
  fn test_sharded_count() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    let a = Prefix::from("a:");
    let b = Prefix::from("b:");

    engine
      .update(|txn| {
        for i in 0..=255u8 {
          txn.set(a.add(&[i, b'x']), Bytes::from("v"))?;
          txn.set(a.add(&[i, b'y']), Bytes::from("v"))?;
        }
        txn.set(b.add(b"only"), Bytes::from("v"))
      })
      .unwrap();

    let ctx = Context::background();
    assert_eq!(sharded_count(&engine, &a, &ctx).unwrap(), 512);
    assert_eq!(sharded_count(&engine, &b, &ctx).unwrap(), 1);
    assert_eq!(sharded_count(&engine, &Prefix::default(), &ctx).unwrap(), 513);
    assert_eq!(sharded_count(&engine, &Prefix::from("c:"), &ctx).unwrap(), 0);
  }

  #[test]
  fn test_sharded_count_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());

    let ctx = Context::background().with_cancel();
    ctx.cancel();
    let res = sharded_count(&engine, &Prefix::default(), &ctx);
    assert_eq!(res, Err(Errors::Cancelled));

    let ctx = Context::background().with_timeout(Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(5));
    let res = sharded_count(&engine, &Prefix::default(), &ctx);
    assert_eq!(res, Err(Errors::DeadlineExceeded));

    engine.close().unwrap();
    let res = sharded_count(&engine, &Prefix::default(), &Context::background());
    assert_eq!(res, Err(Errors::DatabaseClosed));
  }

  // Blocks until `ctx` ends, giving up after a while so a broken
  // cancellation fails the test instead of hanging it.
  fn wait_done(ctx: &Context) -> bool {
    let give_up = Instant::now() + Duration::from_secs(10);
    while !ctx.is_done() {
      if Instant::now() > give_up {
        return false;
      }
      std::thread::sleep(Duration::from_millis(1));
    }
    true
  }

  #[test]
  fn test_scatter_failing_shard_cancels_siblings() {
    let succeeded = AtomicUsize::new(0);
    let res = scatter(&Context::background(), 2, |shard, ctx| {
      if shard == 7 {
        return Err(Errors::FailedToReadFromDataFile);
      }
      if shard > 7 {
        assert!(wait_done(ctx));
        return Err(ctx.err().unwrap_or(Errors::Cancelled));
      }
      succeeded.fetch_add(1, Ordering::SeqCst);
      Ok(1)
    });
    assert_eq!(res, Err(Errors::FailedToReadFromDataFile));
    assert_eq!(succeeded.load(Ordering::SeqCst), 7);
  }

  #[test]
  fn test_scatter_caller_cancelled_mid_scan() {
    let caller = Context::background().with_cancel();
    let started = AtomicUsize::new(0);
    let res = scatter(&caller, 2, |shard, ctx| {
      started.fetch_add(1, Ordering::SeqCst);
      if shard == 3 {
        caller.cancel();
      } else if shard > 3 {
        assert!(wait_done(ctx));
      }
      // every started shard succeeds, yet the count is incomplete
      Ok(1)
    });
    assert_eq!(res, Err(Errors::Cancelled));
    assert!(started.load(Ordering::SeqCst) < SHARDS);

    let ctx = Context::background().with_timeout(Duration::from_millis(30));
    let res = scatter(&ctx, 2, |_, _| {
      std::thread::sleep(Duration::from_millis(2));
      Ok(1)
    });
    assert_eq!(res, Err(Errors::DeadlineExceeded));

    let res = scatter(&Context::background(), 3, |shard, _| Ok(shard as u64 % 2));
    assert_eq!(res, Ok(SHARDS as u64 / 2));
  }

  #[test]
  fn test_count_shard_engine_closed_mid_scan() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path());
    engine
      .update(|txn| {
        for i in 0..100u32 {
          txn.set(format!("a{}", i).into_bytes(), Bytes::from("v"))?;
        }
        Ok(())
      })
      .unwrap();

    let ctx = Context::background();
    let txn = engine.new_transaction(false);
    assert_eq!(count_shard(&txn, b"a".to_vec(), &ctx), Ok(100));

    engine.close().unwrap();
    assert_eq!(
      count_shard(&txn, b"a".to_vec(), &ctx),
      Err(Errors::DatabaseClosed)
    );
  }

  #[test]
  fn test_counter_set_tracks_covering_prefixes() {
    let dir = tempfile::tempdir().unwrap();
    let root = Prefix::default();
    let ks = Prefix::from("ks:");
    {
      let set = CounterSet::load(dir.path(), true, false);
      let root_counter = set.get(&root).unwrap();
      let ks_counter = set.get(&ks).unwrap();
      assert!(Arc::ptr_eq(&ks_counter, &set.get(&ks).unwrap()));
      assert_eq!(root_counter.get(), None);

      // unknown counts ignore adjustments
      set.track(b"ks:a", || Ok(((), 1))).unwrap();
      assert_eq!(ks_counter.get(), None);

      assert_eq!(root_counter.get_or_compute(|| Ok(10)).unwrap(), 10);
      assert_eq!(ks_counter.get_or_compute(|| Ok(4)).unwrap(), 4);
      set.track(b"ks:b", || Ok(((), 1))).unwrap();
      set.track(b"other", || Ok(((), -3))).unwrap();
      assert_eq!(root_counter.get(), Some(8));
      assert_eq!(ks_counter.get(), Some(5));

      // a failed mutation leaves the counts alone
      let res: Result<()> = set.track(b"ks:c", || Err(Errors::KeyExists(Bytes::from("c"))));
      assert!(res.is_err());
      assert_eq!(ks_counter.get(), Some(5));
    }

    let set = CounterSet::load(dir.path(), true, false);
    let ks_counter = set.get(&ks).unwrap();
    assert_eq!(ks_counter.get(), Some(5));
    assert_eq!(ks_counter.get_or_compute(|| panic!("count is cached")).unwrap(), 5);
    assert_eq!(set.get(&root).unwrap().get(), Some(8));
  }

  #[test]
  fn test_counter_set_disabled_drops_sidecars() {
    let dir = tempfile::tempdir().unwrap();
    let ks = Prefix::from("ks:");
    {
      let set = CounterSet::load(dir.path(), true, false);
      set.get(&ks).unwrap().get_or_compute(|| Ok(7)).unwrap();
    }
    assert!(counter_file_path(dir.path(), &ks).exists());

    let set = CounterSet::load(dir.path(), false, false);
    assert!(set.get(&ks).is_none());
    assert!(!counter_file_path(dir.path(), &ks).exists());
    assert_eq!(set.track(b"ks:a", || Ok((42, 1))).unwrap(), 42);
  }

  #[test]
  fn test_key_counter_malformed() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = Prefix::default();
    fs::write(counter_file_path(dir.path(), &prefix), b"not a number").unwrap();

    let set = CounterSet::load(dir.path(), true, false);
    let counter = set.get(&prefix).unwrap();
    assert_eq!(counter.get(), None);
    assert_eq!(counter.get_or_compute(|| Ok(3)).unwrap(), 3);
  }

  #[test]
  fn test_decode_hex() {
    assert_eq!(decode_hex(""), Some(vec![]));
    assert_eq!(decode_hex("6b733a"), Some(b"ks:".to_vec()));
    assert_eq!(decode_hex("6b7"), None);
    assert_eq!(decode_hex("zz"), None);
  }
}
