use std::{collections::BTreeSet, iter::FusedIterator, sync::Arc};

use bytes::Bytes;
use derive_more::{Deref, From, IntoIterator};

use crate::{
  context::Context,
  counter::sharded_count,
  errors::{Errors, Result},
  iterator::Iterator as Cursor,
  monitor::Monitor,
  option::{IteratorOptions, Options},
  prefix::Prefix,
  retry::retry_on_conflict,
  txn::Transaction,
};

/// A key-value view over one prefix of a shared database.
///
/// Views are cheap to clone and never own the database: closing any view, or
/// the [`Store`](crate::store::Store) it came from, closes it for all of them.
#[derive(Clone)]
pub struct Kv {
  mon: Arc<Monitor>,
  prefix: Prefix,
}

/// Arguments to [`Kv::put`].
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
  pub key: Bytes,
  pub data: Bytes,

  /// Overwrite an existing value instead of failing with [`Errors::KeyExists`].
  pub replace: bool,
}

/// Ordered set of keys, as returned by [`Kv::has`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deref, From, IntoIterator)]
#[into_iterator(owned, ref)]
pub struct KeySet(BTreeSet<Bytes>);

impl KeySet {
  pub fn add(&mut self, key: Bytes) {
    self.0.insert(key);
  }
}

impl FromIterator<Bytes> for KeySet {
  fn from_iter<I: IntoIterator<Item = Bytes>>(iter: I) -> Self {
    KeySet(iter.into_iter().collect())
  }
}

impl Kv {
  /// Opens the database described by `options` as a single view scoped to
  /// `options.key_prefix`.
  pub fn open(options: Options) -> Result<Self> {
    let prefix = Prefix::from(options.key_prefix.clone());
    let mon = Monitor::open(options)?;
    Ok(Self::new(mon, prefix))
  }

  pub(crate) fn new(mon: Arc<Monitor>, prefix: Prefix) -> Self {
    Self { mon, prefix }
  }

  pub fn prefix(&self) -> &Prefix {
    &self.prefix
  }

  pub fn is_closed(&self) -> bool {
    self.mon.is_closed()
  }

  fn check_open(&self) -> Result<()> {
    if self.mon.is_closed() {
      return Err(Errors::DatabaseClosed);
    }
    Ok(())
  }

  pub fn get(&self, key: &[u8]) -> Result<Bytes> {
    self.check_open()?;
    let real_key = self.prefix.add(key);
    self
      .mon
      .db()
      .view(|txn| txn.get(&real_key))
      .map_err(|e| match e {
        Errors::KeyNotFound(_) | Errors::KeyIsEmpty => {
          Errors::KeyNotFound(Bytes::copy_from_slice(key))
        }
        e => e,
      })
  }

  /// Reports which of `keys` are present. A key whose lookup fails for any
  /// reason counts as absent.
  pub fn has<I, K>(&self, keys: I) -> Result<KeySet>
  where
    I: IntoIterator<Item = K>,
    K: AsRef<[u8]>,
  {
    self.check_open()?;
    self.mon.db().view(|txn| {
      let mut out = KeySet::default();
      for key in keys {
        let key = key.as_ref();
        if txn.get(&self.prefix.add(key)).is_ok() {
          out.add(Bytes::copy_from_slice(key));
        }
      }
      Ok(out)
    })
  }

  /// Stores `opts.data` under `opts.key`, retrying on transaction conflicts.
  pub fn put(&self, opts: PutOptions) -> Result<()> {
    self.check_open()?;
    let real_key = self.prefix.add(&opts.key);
    self.mon.track_mutation(&real_key, || {
      let created = retry_on_conflict(|| {
        self.mon.db().update(|txn| put_in_txn(txn, &real_key, &opts))
      })?;
      Ok(((), created as i64))
    })
  }

  /// Removes `key`, retrying on transaction conflicts.
  pub fn delete(&self, key: &[u8]) -> Result<()> {
    self.check_open()?;
    let real_key = self.prefix.add(key);
    if real_key.is_empty() {
      // the engine cannot store an empty key, so it is never present
      return Err(Errors::KeyNotFound(Bytes::new()));
    }
    self.mon.track_mutation(&real_key, || {
      retry_on_conflict(|| {
        self.mon.db().update(|txn| match txn.get(&real_key) {
          Ok(_) => txn.delete(real_key.clone()),
          Err(Errors::KeyNotFound(_)) => Err(Errors::KeyNotFound(Bytes::copy_from_slice(key))),
          Err(e) => Err(e),
        })
      })?;
      Ok(((), -1))
    })
  }

  /// Lists the keys at or after `start`, in order.
  ///
  /// The listing reads one snapshot, taken when it is created: keys committed
  /// or deleted while it is being consumed do not change what it yields.
  /// The sequence ends early with an error if `ctx` is cancelled or its
  /// deadline passes, or if the database is closed. Dropping the iterator, or
  /// calling [`stop`](KeyIter::stop), releases its transaction.
  pub fn list(&self, ctx: &Context, start: &[u8]) -> KeyIter {
    if self.mon.is_closed() {
      return KeyIter::failed(ctx, self.prefix.clone(), Errors::DatabaseClosed);
    }
    let db = self.mon.db();
    let txn = db.new_transaction(false);
    let mut cursor = txn.new_iterator(IteratorOptions {
      prefix: self.prefix.to_vec(),
    });
    cursor.seek(&self.prefix.add(start));
    KeyIter {
      ctx: ctx.clone(),
      prefix: self.prefix.clone(),
      scan: Some(Scan { _txn: txn, cursor }),
      failed: None,
    }
  }

  /// Calls `f` with each key at or after `start` until it returns `false`.
  pub fn scan<F>(&self, ctx: &Context, start: &[u8], mut f: F) -> Result<()>
  where
    F: FnMut(Bytes) -> bool,
  {
    for key in self.list(ctx, start) {
      if !f(key?) {
        break;
      }
    }
    Ok(())
  }

  /// Number of keys in the view.
  ///
  /// With a persisted counter this is served from the counter, and a full
  /// sharded scan only runs when the counter is unknown.
  pub fn len(&self, ctx: &Context) -> Result<u64> {
    self.check_open()?;
    match self.mon.counter(&self.prefix) {
      Some(counter) => counter.get_or_compute(|| sharded_count(self.mon.db(), &self.prefix, ctx)),
      None => sharded_count(self.mon.db(), &self.prefix, ctx),
    }
  }

  pub fn is_empty(&self, ctx: &Context) -> Result<bool> {
    self.check_open()?;
    let mut keys = self.list(ctx, &[]);
    match keys.next() {
      Some(Err(e)) => Err(e),
      Some(Ok(_)) => Ok(false),
      None => Ok(true),
    }
  }

  /// Closes the underlying database, for every view sharing it.
  pub fn close(&self) -> Result<()> {
    self.mon.close()
  }
}

// Reports whether the key was newly created.
fn put_in_txn(txn: &mut Transaction, real_key: &[u8], opts: &PutOptions) -> Result<bool> {
  let created = match txn.get(real_key) {
    Ok(_) if !opts.replace => return Err(Errors::KeyExists(opts.key.clone())),
    Ok(_) => false,
    Err(Errors::KeyNotFound(_)) => true,
    Err(e) => return Err(e),
  };
  txn.set(real_key.to_vec(), opts.data.clone())?;
  Ok(created)
}

struct Scan {
  _txn: Transaction,
  cursor: Cursor,
}

/// Keys yielded by [`Kv::list`].
pub struct KeyIter {
  ctx: Context,
  prefix: Prefix,
  scan: Option<Scan>,
  failed: Option<Errors>,
}

impl KeyIter {
  fn failed(ctx: &Context, prefix: Prefix, err: Errors) -> Self {
    Self {
      ctx: ctx.clone(),
      prefix,
      scan: None,
      failed: Some(err),
    }
  }

  /// Ends the sequence without an error and releases its transaction.
  pub fn stop(&mut self) {
    self.scan = None;
    self.failed = None;
  }

  fn finish(&mut self, err: Errors) -> Option<Result<Bytes>> {
    self.scan = None;
    Some(Err(err))
  }
}

impl Iterator for KeyIter {
  type Item = Result<Bytes>;

  fn next(&mut self) -> Option<Self::Item> {
    if let Some(err) = self.failed.take() {
      return Some(Err(err));
    }
    let scan = self.scan.as_mut()?;
    if let Some(err) = self.ctx.err() {
      return self.finish(err);
    }
    if let Err(err) = scan.cursor.status() {
      return self.finish(err);
    }
    let key = match scan.cursor.key() {
      Some(real_key) => self.prefix.remove(real_key),
      None => {
        self.scan = None;
        return None;
      }
    };
    scan.cursor.next();
    Some(Ok(key))
  }
}

impl FusedIterator for KeyIter {}

#[cfg(test)]
mod tests {
  use std::{
    collections::HashSet,
    path::Path,
    thread,
    time::Duration,
  };

  use super::*;

  fn open_kv(dir: &Path) -> Kv {
    let _ = env_logger::builder().is_test(true).try_init();
    Kv::open(Options::new(dir)).unwrap()
  }

  fn put(kv: &Kv, key: &str, data: &str, replace: bool) -> Result<()> {
    kv.put(PutOptions {
      key: Bytes::copy_from_slice(key.as_bytes()),
      data: Bytes::copy_from_slice(data.as_bytes()),
      replace,
    })
  }

  fn list_all(kv: &Kv, start: &str) -> Vec<Bytes> {
    kv.list(&Context::background(), start.as_bytes())
      .collect::<Result<Vec<_>>>()
      .unwrap()
  }

  #[test]
  fn test_basic_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_kv(dir.path());
    let ctx = Context::background();

    put(&kv, "k1", "v1", false).unwrap();
    assert_eq!(kv.get(b"k1").unwrap(), Bytes::from("v1"));

    assert_eq!(
      put(&kv, "k1", "v2", false),
      Err(Errors::KeyExists(Bytes::from("k1")))
    );
    assert_eq!(kv.get(b"k1").unwrap(), Bytes::from("v1"));

    put(&kv, "k1", "v2", true).unwrap();
    assert_eq!(kv.get(b"k1").unwrap(), Bytes::from("v2"));

    kv.delete(b"k1").unwrap();
    assert_eq!(kv.get(b"k1"), Err(Errors::KeyNotFound(Bytes::from("k1"))));
    assert_eq!(kv.len(&ctx).unwrap(), 0);
    assert!(kv.is_empty(&ctx).unwrap());
  }

  #[test]
  fn test_missing_and_empty_keys() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_kv(dir.path());

    assert!(kv.get(b"nope").unwrap_err().is_not_found());
    assert_eq!(kv.delete(b"nope"), Err(Errors::KeyNotFound(Bytes::from("nope"))));
    assert_eq!(kv.get(b""), Err(Errors::KeyNotFound(Bytes::new())));
    assert_eq!(kv.delete(b""), Err(Errors::KeyNotFound(Bytes::new())));
    assert_eq!(put(&kv, "", "v", true), Err(Errors::KeyIsEmpty));
  }

  #[test]
  fn test_has() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_kv(dir.path());
    put(&kv, "a", "1", false).unwrap();
    put(&kv, "c", "3", false).unwrap();

    let got = kv.has(["a", "b", "c", ""]).unwrap();
    let want: KeySet = [Bytes::from("a"), Bytes::from("c")].into_iter().collect();
    assert_eq!(got, want);
    assert!(got.contains(&Bytes::from("a")));
    assert!(kv.has(Vec::<&[u8]>::new()).unwrap().is_empty());
  }

  #[test]
  fn test_prefix_isolation() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_kv(dir.path());
    let a = Kv::new(kv.mon.clone(), Prefix::from("a:"));
    let b = Kv::new(kv.mon.clone(), Prefix::from("b:"));
    let ctx = Context::background();

    put(&a, "x", "from a", false).unwrap();
    assert!(b.get(b"x").unwrap_err().is_not_found());
    put(&b, "x", "from b", false).unwrap();
    put(&b, "y", "from b", false).unwrap();

    assert_eq!(a.get(b"x").unwrap(), Bytes::from("from a"));
    assert_eq!(list_all(&a, ""), vec![Bytes::from("x")]);
    assert_eq!(list_all(&b, ""), vec![Bytes::from("x"), Bytes::from("y")]);
    assert_eq!(a.len(&ctx).unwrap(), 1);
    assert_eq!(b.len(&ctx).unwrap(), 2);

    // the unscoped view sees physical keys
    assert_eq!(kv.get(b"a:x").unwrap(), Bytes::from("from a"));
    assert_eq!(kv.len(&ctx).unwrap(), 3);
  }

  #[test]
  fn test_list_order_and_start() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_kv(dir.path());
    for key in ["m", "b", "z", "a", "q"] {
      put(&kv, key, "v", false).unwrap();
    }

    let all: Vec<Bytes> = ["a", "b", "m", "q", "z"].into_iter().map(Bytes::from).collect();
    assert_eq!(list_all(&kv, ""), all);
    assert_eq!(list_all(&kv, "c"), all[2..].to_vec());
    assert_eq!(list_all(&kv, "q"), all[3..].to_vec());
    assert!(list_all(&kv, "zz").is_empty());
  }

  #[test]
  fn test_list_stop_early() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_kv(dir.path());
    for i in 0..10 {
      put(&kv, &format!("key-{}", i), "v", false).unwrap();
    }

    let mut keys = kv.list(&Context::background(), b"");
    assert_eq!(keys.next(), Some(Ok(Bytes::from("key-0"))));
    assert_eq!(keys.next(), Some(Ok(Bytes::from("key-1"))));
    keys.stop();
    assert_eq!(keys.next(), None);
    assert_eq!(keys.next(), None);

    let mut seen = Vec::new();
    kv.scan(&Context::background(), b"key-5", |key| {
      seen.push(key);
      seen.len() < 3
    })
    .unwrap();
    assert_eq!(
      seen,
      vec![Bytes::from("key-5"), Bytes::from("key-6"), Bytes::from("key-7")]
    );
  }

  #[test]
  fn test_list_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_kv(dir.path());
    for i in 0..100 {
      put(&kv, &format!("key-{:03}", i), "v", false).unwrap();
    }

    let ctx = Context::background().with_timeout(Duration::from_millis(50));
    let mut seen = 0;
    let res = kv.scan(&ctx, b"", |_| {
      seen += 1;
      thread::sleep(Duration::from_millis(5));
      true
    });
    assert_eq!(res, Err(Errors::DeadlineExceeded));
    assert!(seen < 100);

    let ctx = Context::background().with_cancel();
    let mut keys = kv.list(&ctx, b"");
    assert!(keys.next().unwrap().is_ok());
    ctx.cancel();
    assert_eq!(keys.next(), Some(Err(Errors::Cancelled)));
    assert_eq!(keys.next(), None);
  }

  #[test]
  fn test_len_after_puts_and_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_kv(dir.path());
    let ctx = Context::background();

    // keys spread over many first bytes exercise every shard
    for i in 0..600u32 {
      let key = [(i % 256) as u8, (i / 256) as u8, b'k'];
      kv.put(PutOptions {
        key: Bytes::copy_from_slice(&key),
        data: Bytes::from("v"),
        replace: false,
      })
      .unwrap();
    }
    assert_eq!(kv.len(&ctx).unwrap(), 600);

    for i in 0..150u32 {
      let key = [(i % 256) as u8, (i / 256) as u8, b'k'];
      kv.delete(&key).unwrap();
    }
    assert_eq!(kv.len(&ctx).unwrap(), 450);
  }

  #[test]
  fn test_concurrent_conflicting_puts() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_kv(dir.path());

    let values: Vec<String> = (0..8).map(|i| format!("value-{}", i)).collect();
    let handles: Vec<_> = values
      .iter()
      .cloned()
      .map(|value| {
        let kv = kv.clone();
        thread::spawn(move || {
          for _ in 0..50 {
            put(&kv, "contended", &value, true).unwrap();
          }
        })
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }

    let got = kv.get(b"contended").unwrap();
    let candidates: HashSet<Bytes> = values.into_iter().map(Bytes::from).collect();
    assert!(candidates.contains(&got));
    assert_eq!(kv.len(&Context::background()).unwrap(), 1);
  }

  #[test]
  fn test_concurrent_create_only_one_wins() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_kv(dir.path());

    let handles: Vec<_> = (0..8)
      .map(|i| {
        let kv = kv.clone();
        thread::spawn(move || put(&kv, "once", &format!("v{}", i), false))
      })
      .collect();
    let results: Vec<Result<()>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for res in results.iter().filter(|r| r.is_err()) {
      assert_eq!(res, &Err(Errors::KeyExists(Bytes::from("once"))));
    }
  }

  #[test]
  fn test_closed_view() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_kv(dir.path());
    put(&kv, "k", "v", false).unwrap();
    let other = kv.clone();

    kv.close().unwrap();
    kv.close().unwrap();
    assert!(other.is_closed());
    assert_eq!(other.get(b"k"), Err(Errors::DatabaseClosed));
    assert_eq!(put(&other, "k", "v", true), Err(Errors::DatabaseClosed));
    assert_eq!(other.delete(b"k"), Err(Errors::DatabaseClosed));
    assert_eq!(other.has(["k"]), Err(Errors::DatabaseClosed));
    assert_eq!(other.len(&Context::background()), Err(Errors::DatabaseClosed));

    let mut keys = other.list(&Context::background(), b"");
    assert_eq!(keys.next(), Some(Err(Errors::DatabaseClosed)));
    assert_eq!(keys.next(), None);
  }

  #[test]
  fn test_key_prefix_option() {
    let dir = tempfile::tempdir().unwrap();
    {
      let mut opts = Options::new(dir.path());
      opts.key_prefix = ":wibble:".to_string();
      let kv = Kv::open(opts).unwrap();
      assert_eq!(kv.prefix().as_bytes(), b":wibble:");
      put(&kv, "k", "scoped", false).unwrap();
      assert_eq!(list_all(&kv, ""), vec![Bytes::from("k")]);
      kv.close().unwrap();
    }

    let kv = open_kv(dir.path());
    assert_eq!(kv.get(b":wibble:k").unwrap(), Bytes::from("scoped"));
    assert!(kv.get(b"k").unwrap_err().is_not_found());
  }

  #[test]
  fn test_persisted_counter() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::background();
    let opts = || {
      let mut opts = Options::new(dir.path());
      opts.persist_count = true;
      opts
    };
    {
      let kv = Kv::open(opts()).unwrap();
      let inner = Kv::new(kv.mon.clone(), Prefix::from("in:"));
      put(&kv, "a", "v", false).unwrap();
      assert_eq!(kv.len(&ctx).unwrap(), 1);
      assert_eq!(inner.len(&ctx).unwrap(), 0);

      put(&kv, "b", "v", false).unwrap();
      put(&kv, "b", "v2", true).unwrap();
      assert!(put(&kv, "b", "v3", false).is_err());
      put(&inner, "x", "v", false).unwrap();
      assert!(inner.delete(b"missing").is_err());
      assert_eq!(kv.len(&ctx).unwrap(), 3);
      assert_eq!(inner.len(&ctx).unwrap(), 1);

      kv.delete(b"a").unwrap();
      assert_eq!(kv.len(&ctx).unwrap(), 2);
      kv.close().unwrap();
    }

    let kv = Kv::open(opts()).unwrap();
    let counter = kv.mon.counter(&Prefix::default()).unwrap();
    assert_eq!(counter.get(), Some(2));
    assert_eq!(kv.len(&ctx).unwrap(), 2);
    assert_eq!(sharded_count(kv.mon.db(), &Prefix::default(), &ctx).unwrap(), 2);
  }

  #[test]
  fn test_list_reads_one_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_kv(dir.path());
    put(&kv, "a", "v", false).unwrap();
    put(&kv, "b", "v", false).unwrap();

    let mut keys = kv.list(&Context::background(), b"");
    assert_eq!(keys.next(), Some(Ok(Bytes::from("a"))));

    // changes made after the listing began stay invisible to it
    put(&kv, "c", "v", false).unwrap();
    kv.delete(b"b").unwrap();
    put(&kv, "0", "v", false).unwrap();
    let rest: Vec<Result<Bytes>> = keys.collect();
    assert_eq!(rest, vec![Ok(Bytes::from("b"))]);

    assert_eq!(
      list_all(&kv, ""),
      vec![Bytes::from("0"), Bytes::from("a"), Bytes::from("c")]
    );
  }

  #[test]
  fn test_open_listing_ends_on_close() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_kv(dir.path());
    for key in ["a", "b", "c"] {
      put(&kv, key, "v", false).unwrap();
    }

    let mut keys = kv.list(&Context::background(), b"");
    assert_eq!(keys.next(), Some(Ok(Bytes::from("a"))));
    kv.close().unwrap();
    assert_eq!(keys.next(), Some(Err(Errors::DatabaseClosed)));
    assert_eq!(keys.next(), None);
  }

  #[test]
  fn test_empty_key_under_prefix() {
    for persist_count in [false, true] {
      let dir = tempfile::tempdir().unwrap();
      let mut opts = Options::new(dir.path());
      opts.persist_count = persist_count;
      let root = Kv::open(opts).unwrap();
      let kv = Kv::new(root.mon.clone(), Prefix::from("in:"));
      let ctx = Context::background();

      put(&kv, "", "bare", false).unwrap();
      put(&kv, "x", "v", false).unwrap();
      assert_eq!(kv.get(b"").unwrap(), Bytes::from("bare"));
      assert_eq!(list_all(&kv, ""), vec![Bytes::new(), Bytes::from("x")]);
      assert_eq!(kv.len(&ctx).unwrap(), 2);
      assert_eq!(root.len(&ctx).unwrap(), 2);

      kv.delete(b"").unwrap();
      assert!(kv.get(b"").unwrap_err().is_not_found());
      assert_eq!(list_all(&kv, ""), vec![Bytes::from("x")]);
      assert_eq!(kv.len(&ctx).unwrap(), 1);
      assert_eq!(
        sharded_count(kv.mon.db(), kv.prefix(), &ctx).unwrap(),
        kv.len(&ctx).unwrap()
      );
    }
  }
}
