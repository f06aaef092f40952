use log::trace;

use crate::errors::{Errors, Result};

/// Runs `op` until it returns something other than [`Errors::TxnConflict`].
///
/// Each attempt is expected to open and commit its own transaction, so a
/// retry always starts from a fresh read timestamp. There is no backoff and
/// no attempt limit: a conflict means some other commit landed, so the
/// workload as a whole made progress.
pub fn retry_on_conflict<T, F>(mut op: F) -> Result<T>
where
  F: FnMut() -> Result<T>,
{
  let mut attempt = 0u64;
  loop {
    match op() {
      Err(Errors::TxnConflict) => {
        attempt += 1;
        trace!("transaction conflict, retrying (attempt {})", attempt);
      }
      res => return res,
    }
  }
}
