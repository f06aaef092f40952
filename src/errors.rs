use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum Errors {
  #[error("key not found: {0:?}")]
  KeyNotFound(Bytes),

  #[error("key already exists: {0:?}")]
  KeyExists(Bytes),

  #[error("the key is empty")]
  KeyIsEmpty,

  #[error("database is closed")]
  DatabaseClosed,

  #[error("transaction conflict, please retry")]
  TxnConflict,

  #[error("exceed the max number of writes in one transaction")]
  TxnTooBig,

  #[error("operation cancelled")]
  Cancelled,

  #[error("deadline exceeded")]
  DeadlineExceeded,

  #[error("database is opened in read-only mode")]
  ReadOnly,

  #[error("value log GC attempt didn't result in any cleanup")]
  NoRewrite,

  #[error("value log GC is already running")]
  ValueLogGcInProgress,

  #[error("not enough disk space to rewrite a data file")]
  NoEnoughSpaceForGc,

  #[error("invalid scope name: {0:?}")]
  InvalidScopeName(String),

  #[error("invalid address: {0}")]
  InvalidAddress(String),

  #[error("failed to read from data file")]
  FailedToReadFromDataFile,

  #[error("failed to write to data file")]
  FailedToWriteToDataFile,

  #[error("failed to sync data file")]
  FailedToSyncDataFile,

  #[error("failed to open data file")]
  FailedToOpenDataFile,

  #[error("failed to remove data file")]
  FailedToRemoveDataFile,

  #[error("data file is not found")]
  DataFileNotFound,

  #[error("the database dir path is empty")]
  DirPathIsEmpty,

  #[error("the data file size must be greater than 0")]
  DataFileSizeTooSmall,

  #[error("failed to create the database directory")]
  FailedToCreateDatabaseDir,

  #[error("failed to read the database directory")]
  FailedToReadDatabaseDir,

  #[error("the database directory does not exist")]
  DatabaseDirNotFound,

  #[error("the database directory maybe corrupted")]
  DataDirectoryCorrupted,

  #[error("read data file eof")]
  ReadDataFileEOF,

  #[error("invalid crc value, log record maybe corrupted")]
  InvalidLogRecordCrc,

  #[error("the database directory is used by another process")]
  DatabaseIsUsing,

  #[error("failed to persist the key counter")]
  FailedToPersistCounter,
}

impl Errors {
  pub fn is_not_found(&self) -> bool {
    matches!(self, Errors::KeyNotFound(_))
  }

  pub fn is_conflict(&self) -> bool {
    matches!(self, Errors::TxnConflict)
  }

  /// Reports whether the error came from a cancelled or expired [`Context`](crate::context::Context).
  pub fn is_cancellation(&self) -> bool {
    matches!(self, Errors::Cancelled | Errors::DeadlineExceeded)
  }
}

pub type Result<T> = std::result::Result<T, Errors>;
