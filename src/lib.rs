//! Mux-KV: many isolated key-value views multiplexed over one embedded,
//! log-structured database.
//!
//! A [`Store`] owns one database through a shared [`Monitor`](monitor::Monitor)
//! and hands out [`Kv`] views, each confined to its own key prefix. Mutations
//! run in optimistic transactions that are retried on conflict, listings are
//! cancellable through a [`Context`], and a background thread reclaims stale
//! space in the value log while the database is in use.
//!
//! # Features
//!
//! * Prefix-scoped keyspaces and nested sub-stores over a single database
//! * Put and delete with automatic retry of conflicting transactions
//! * Ordered, cancellable key listings with deadlines
//! * Parallel sharded key counts, with an optional persisted counter
//! * Background value-log garbage collection and idempotent shutdown
//!
//! # Basic Usage
//!
//! ```
//! use bytes::Bytes;
//! use mux_kv::{context::Context, kv::PutOptions, option::Options, store::Store};
//!
//! let dir = std::env::temp_dir().join("mux-kv-doc");
//! let store = Store::open(Options::new(&dir)).expect("failed to open store");
//! let users = store.keyspace("users").expect("invalid keyspace name");
//!
//! users
//!   .put(PutOptions {
//!     key: Bytes::from("alice"),
//!     data: Bytes::from("admin"),
//!     replace: true,
//!   })
//!   .expect("failed to put");
//! assert_eq!(users.get(b"alice").unwrap(), Bytes::from("admin"));
//!
//! let keys: Vec<Bytes> = users
//!   .list(&Context::background(), b"")
//!   .collect::<Result<_, _>>()
//!   .expect("failed to list");
//! assert_eq!(keys, vec![Bytes::from("alice")]);
//!
//! users.delete(b"alice").expect("failed to delete");
//! store.close().expect("failed to close");
//! # std::fs::remove_dir_all(&dir).ok();
//! ```

mod data;

mod fio;
mod index;

pub mod context;
pub mod counter;
pub mod db;
pub mod errors;
pub mod iterator;
pub mod kv;
pub mod merge;
pub mod monitor;
pub mod option;
pub mod prefix;
pub mod retry;
pub mod store;
pub mod txn;
pub mod util;

pub use context::Context;
pub use errors::{Errors, Result};
pub use kv::{KeyIter, KeySet, Kv, PutOptions};
pub use option::Options;
pub use prefix::Prefix;
pub use store::Store;
