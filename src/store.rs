use std::sync::Arc;

use crate::{
  errors::Result,
  kv::Kv,
  monitor::Monitor,
  option::Options,
  prefix::Prefix,
};

/// Hands out views and nested stores that share one database.
///
/// Every keyspace and sub-store gets its own prefix, derived from this
/// store's, so none of them can observe another's keys.
#[derive(Clone)]
pub struct Store {
  mon: Arc<Monitor>,
  prefix: Prefix,
}

impl Store {
  /// Opens the database described by `options`; the store is rooted at
  /// `options.key_prefix`.
  pub fn open(options: Options) -> Result<Self> {
    let prefix = Prefix::from(options.key_prefix.clone());
    let mon = Monitor::open(options)?;
    Ok(Self { mon, prefix })
  }

  /// Opens a store from an address such as `/var/lib/db?auto_sync=true`.
  /// See [`Options::from_address`].
  pub fn open_address(addr: &str) -> Result<Self> {
    Self::open(Options::from_address(addr)?)
  }

  /// A view of the keyspace `name` in this store.
  pub fn keyspace(&self, name: &str) -> Result<Kv> {
    Ok(Kv::new(self.mon.clone(), self.prefix.keyspace(name)?))
  }

  /// A nested store named `name`, sharing this store's database.
  pub fn sub(&self, name: &str) -> Result<Store> {
    Ok(Store {
      mon: self.mon.clone(),
      prefix: self.prefix.sub(name)?,
    })
  }

  pub fn prefix(&self) -> &Prefix {
    &self.prefix
  }

  pub fn monitor(&self) -> &Arc<Monitor> {
    &self.mon
  }

  pub fn is_closed(&self) -> bool {
    self.mon.is_closed()
  }

  /// Closes the database, for this store and everything derived from it.
  pub fn close(&self) -> Result<()> {
    self.mon.close()
  }
}
