use bytes::{Buf, BufMut, BytesMut};
use prost::{
  encoding::{decode_varint, encode_varint},
  length_delimiter_len,
};

/// Kind of an entry appended to a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecordType {
  Normal = 1,

  Deleted = 2,

  /// Closes a committed transaction; records of a sequence without it are discarded on replay.
  TxnFinished = 3,
}

impl LogRecordType {
  pub fn from_u8(v: u8) -> Option<Self> {
    match v {
      1 => Some(LogRecordType::Normal),
      2 => Some(LogRecordType::Deleted),
      3 => Some(LogRecordType::TxnFinished),
      _ => None,
    }
  }
}

/// On disk: `type | key size | value size | key | value | crc`, sizes as varints,
/// crc32 little-endian over everything before it.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
  pub key: Vec<u8>,
  pub value: Vec<u8>,
  pub rec_type: LogRecordType,
}

impl LogRecord {
  pub fn encode(&self) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(self.encoded_len());
    buf.put_u8(self.rec_type as u8);
    encode_varint(self.key.len() as u64, &mut buf);
    encode_varint(self.value.len() as u64, &mut buf);
    buf.extend_from_slice(&self.key);
    buf.extend_from_slice(&self.value);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf);
    buf.put_u32_le(hasher.finalize());
    buf.to_vec()
  }

  pub fn encoded_len(&self) -> usize {
    1 + length_delimiter_len(self.key.len())
      + length_delimiter_len(self.value.len())
      + self.key.len()
      + self.value.len()
      + 4
  }
}

/// Where a record lives: data file, byte offset and encoded size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogRecordPos {
  pub file_id: u32,
  pub offset: u64,
  pub size: u32,
}

pub struct ReadLogRecord {
  pub record: LogRecord,
  pub size: u64,
}

/// A record read during replay, held until its transaction is known to be finished.
pub struct TransactionRecord {
  pub record: LogRecord,
  pub pos: LogRecordPos,
}

/// Decoded fixed part of a record: type, key size, value size and header length.
pub(crate) struct RecordHeader {
  pub rec_type: u8,
  pub key_size: usize,
  pub value_size: usize,
  pub header_size: usize,
}

pub(crate) fn decode_header(buf: &[u8]) -> Option<RecordHeader> {
  let mut cursor = buf;
  if !cursor.has_remaining() {
    return None;
  }
  let rec_type = cursor.get_u8();
  let key_size = decode_varint(&mut cursor).ok()? as usize;
  let value_size = decode_varint(&mut cursor).ok()? as usize;
  Some(RecordHeader {
    rec_type,
    key_size,
    value_size,
    header_size: buf.len() - cursor.remaining(),
  })
}

pub fn max_log_record_header_size() -> usize {
  std::mem::size_of::<u8>() + length_delimiter_len(u32::MAX as usize) * 2
}
