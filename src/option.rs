use lazy_static::lazy_static;
use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use crate::errors::{Errors, Result};

lazy_static! {
  pub static ref DEFAULT_DIR_PATH: PathBuf = std::env::temp_dir().join("mux-kv");
}

const MIB: u64 = 1 << 20;

/// Settings for a [`Store`](crate::store::Store) or a single [`Kv`](crate::kv::Kv).
#[derive(Debug, Clone)]
pub struct Options {
  pub dir_path: PathBuf,

  /// Size in bytes at which the active data file is sealed and a new one started.
  pub base_table_size: u64,

  /// Reclaim every data file holding stale records when the database is closed.
  pub compact_on_close: bool,

  /// Memory budget in bytes for cached values; 0 disables the cache.
  pub index_cache_size: u64,

  pub read_only: bool,

  /// Force a sync of the active data file on every maintenance tick.
  pub auto_sync: bool,

  /// Prepended to every key, scoping access to the keys carrying it.
  pub key_prefix: String,

  /// Keep a per-prefix key count in a sidecar file instead of rescanning on every `len`.
  pub persist_count: bool,

  pub gc: GcOptions,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      dir_path: DEFAULT_DIR_PATH.clone(),
      base_table_size: 2 * MIB,
      compact_on_close: true,
      index_cache_size: 50 * MIB,
      read_only: false,
      auto_sync: false,
      key_prefix: String::new(),
      persist_count: false,
      gc: GcOptions::default(),
    }
  }
}

impl Options {
  pub fn new<P: AsRef<Path>>(dir_path: P) -> Self {
    Self {
      dir_path: dir_path.as_ref().to_path_buf(),
      ..Default::default()
    }
  }

  /// Parses an address of the form `path?name=value&...`.
  ///
  /// Recognized query parameters:
  ///
  /// * `base_size=n`: base table size in MiB (default 2)
  /// * `compact_on_close`: reclaim stale data on close (default true unless read-only)
  /// * `index_cache=m`: value cache size in MiB (default 50)
  /// * `read_only`: open the database in read-only mode (default false)
  /// * `auto_sync`: sync the active file on every maintenance tick (default false)
  /// * `key_prefix=s`: scope every key under `s` (default empty)
  /// * `persist_count`: keep a persisted key counter (default false)
  ///
  /// Values that are empty or fail to parse fall back to their defaults.
  pub fn from_address(addr: &str) -> Result<Self> {
    let (path, query) = match addr.split_once('?') {
      Some((path, query)) => (path, query),
      None => (addr, ""),
    };
    let path = path.strip_prefix("file://").unwrap_or(path);
    if path.is_empty() {
      return Err(Errors::InvalidAddress(addr.to_string()));
    }
    let params: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
      .into_owned()
      .collect();
    let lookup = |key: &str| {
      params
        .iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
    };

    let read_only = parse_bool(lookup("read_only"), false);
    let defaults = Options::default();
    Ok(Options {
      dir_path: PathBuf::from(path),
      base_table_size: parse_mib(lookup("base_size"), 2),
      compact_on_close: parse_bool(lookup("compact_on_close"), !read_only),
      index_cache_size: parse_mib(lookup("index_cache"), 50),
      read_only,
      auto_sync: parse_bool(lookup("auto_sync"), false),
      key_prefix: lookup("key_prefix").unwrap_or_default().to_string(),
      persist_count: parse_bool(lookup("persist_count"), false),
      gc: defaults.gc,
    })
  }

  pub(crate) fn engine_options(&self) -> EngineOptions {
    EngineOptions {
      dir_path: self.dir_path.clone(),
      data_file_size: self.base_table_size,
      read_only: self.read_only,
      compact_on_close: self.compact_on_close && !self.read_only,
      value_cache_size: self.index_cache_size,
      ..Default::default()
    }
  }
}

// An empty or unrecognized value keeps the default.
fn parse_bool(v: Option<&str>, dflt: bool) -> bool {
  match v {
    Some("1" | "t" | "T" | "true" | "True" | "TRUE") => true,
    Some("0" | "f" | "F" | "false" | "False" | "FALSE") => false,
    _ => dflt,
  }
}

// Sizes are given in MiB; one too large to express in bytes keeps the default.
fn parse_mib(v: Option<&str>, dflt: u64) -> u64 {
  v.and_then(|v| v.parse::<u64>().ok())
    .and_then(|n| n.checked_mul(MIB))
    .unwrap_or(dflt * MIB)
}

/// Timing and thresholds for the background value-log reclamation.
#[derive(Debug, Clone, Copy)]
pub struct GcOptions {
  /// How often the scheduler wakes up.
  pub interval: Duration,

  /// A pass runs once the on-disk size has moved this many bytes since the last pass.
  pub size_threshold: u64,

  /// A pass runs at least this often, regardless of size movement.
  pub max_interval: Duration,

  pub discard_ratio: f32,
}

impl Default for GcOptions {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(60),
      size_threshold: 512 * MIB,
      max_interval: Duration::from_secs(10 * 60),
      discard_ratio: 0.5,
    }
  }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
  pub dir_path: PathBuf,

  pub data_file_size: u64,

  pub sync_writes: bool,

  pub index_type: IndexType,

  pub mmap_at_startup: bool,

  pub read_only: bool,

  pub compact_on_close: bool,

  pub value_cache_size: u64,
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self {
      dir_path: DEFAULT_DIR_PATH.clone(),
      data_file_size: 2 * MIB,
      sync_writes: false,
      index_type: IndexType::SkipList,
      mmap_at_startup: true,
      read_only: false,
      compact_on_close: true,
      value_cache_size: 50 * MIB,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexType {
  BTree,

  SkipList,
}

#[derive(Debug, Clone, Default)]
pub struct IteratorOptions {
  /// Restricts the iterator to keys starting with these bytes.
  pub prefix: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IOManagerType {
  StandardFileIO,

  MemoryMap,
}
