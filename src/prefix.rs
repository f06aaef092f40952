use bytes::Bytes;
use derive_more::{Deref, From};

use crate::errors::{Errors, Result};

/// Terminates a keyspace name inside a prefix.
pub const KEYSPACE_SEP: u8 = b':';

/// Terminates a sub-store name inside a prefix.
pub const SUB_SEP: u8 = b'/';

/// Byte string scoping a slice of the physical key space.
///
/// A physical key is `prefix ++ logical key`. Derived prefixes append a name
/// and a separator that names may not contain, so sibling scopes never
/// overlap. The empty prefix covers the whole key space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deref, From)]
pub struct Prefix(Bytes);

impl Prefix {
  pub fn new(prefix: impl Into<Bytes>) -> Self {
    Self(prefix.into())
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  /// Builds the physical key of a logical key.
  pub fn add(&self, key: &[u8]) -> Vec<u8> {
    let mut real_key = Vec::with_capacity(self.0.len() + key.len());
    real_key.extend_from_slice(&self.0);
    real_key.extend_from_slice(key);
    real_key
  }

  /// Recovers the logical key of a physical key. A key outside the prefix is
  /// returned unchanged.
  pub fn remove(&self, real_key: &[u8]) -> Bytes {
    let key = real_key.strip_prefix(self.0.as_ref()).unwrap_or(real_key);
    Bytes::copy_from_slice(key)
  }

  /// Prefix of the keyspace `name` directly under this one.
  pub fn keyspace(&self, name: &str) -> Result<Prefix> {
    self.derive(name, KEYSPACE_SEP)
  }

  /// Prefix of the sub-store `name` directly under this one.
  pub fn sub(&self, name: &str) -> Result<Prefix> {
    self.derive(name, SUB_SEP)
  }

  fn derive(&self, name: &str, sep: u8) -> Result<Prefix> {
    check_name(name)?;
    let mut prefix = self.add(name.as_bytes());
    prefix.push(sep);
    Ok(Prefix(Bytes::from(prefix)))
  }
}

impl From<&str> for Prefix {
  fn from(s: &str) -> Self {
    Prefix(Bytes::copy_from_slice(s.as_bytes()))
  }
}

impl From<String> for Prefix {
  fn from(s: String) -> Self {
    Prefix(Bytes::from(s))
  }
}

fn check_name(name: &str) -> Result<()> {
  if name.is_empty() || name.bytes().any(|b| b == KEYSPACE_SEP || b == SUB_SEP) {
    return Err(Errors::InvalidScopeName(name.to_string()));
  }
  Ok(())
}
