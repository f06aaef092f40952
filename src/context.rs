use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::errors::Errors;

/// Cancellation and deadline signal threaded through scans.
///
/// Cloning a `Context` shares the same signal. Derived contexts observe their
/// parent: cancelling a parent, or its deadline passing, is seen by every
/// descendant, but never the other way round.
#[derive(Clone, Debug)]
pub struct Context {
  token: CancellationToken,
  deadline: Option<Instant>,
}

impl Default for Context {
  fn default() -> Self {
    Self {
      token: CancellationToken::new(),
      deadline: None,
    }
  }
}

impl Context {
  /// A context that is never cancelled and has no deadline.
  pub fn background() -> Self {
    Self::default()
  }

  pub fn with_cancel(&self) -> Self {
    Self {
      token: self.token.child_token(),
      deadline: self.deadline,
    }
  }

  pub fn with_timeout(&self, timeout: Duration) -> Self {
    self.with_deadline(Instant::now() + timeout)
  }

  /// Derives a context ending at `deadline`, or at the parent's, whichever is earlier.
  pub fn with_deadline(&self, deadline: Instant) -> Self {
    Self {
      token: self.token.child_token(),
      deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
    }
  }

  pub fn cancel(&self) {
    self.token.cancel();
  }

  pub fn deadline(&self) -> Option<Instant> {
    self.deadline
  }

  /// The underlying token, for waiting on cancellation from async code.
  pub fn token(&self) -> &CancellationToken {
    &self.token
  }

  /// Reports why the context is done, or `None` while it is still live.
  pub fn err(&self) -> Option<Errors> {
    if self.token.is_cancelled() {
      return Some(Errors::Cancelled);
    }
    match self.deadline {
      Some(deadline) if Instant::now() >= deadline => Some(Errors::DeadlineExceeded),
      _ => None,
    }
  }

  pub fn is_done(&self) -> bool {
    self.err().is_some()
  }
}
