use std::path::{Path, PathBuf};

use log::warn;
use parking_lot::RwLock;

use crate::{
  errors::{Errors, Result},
  fio::{new_io_manager, IOManager},
  option::IOManagerType,
};

use super::log_record::{
  decode_header, max_log_record_header_size, LogRecord, LogRecordType, ReadLogRecord,
};

pub const DATA_FILE_NAME_SUFFIX: &str = ".data";

pub struct DataFile {
  file_id: u32,
  write_off: RwLock<u64>,
  io_manager: Box<dyn IOManager>,
}

impl DataFile {
  pub fn new<P>(dir_path: P, file_id: u32, io_type: IOManagerType) -> Result<DataFile>
  where
    P: AsRef<Path>,
  {
    let file_name = get_data_file_name(&dir_path, file_id);
    let io_manager = new_io_manager(file_name, io_type)?;
    Ok(DataFile {
      file_id,
      write_off: RwLock::new(0),
      io_manager,
    })
  }

  pub fn file_size(&self) -> u64 {
    self.io_manager.size()
  }

  pub fn get_write_off(&self) -> u64 {
    *self.write_off.read()
  }

  pub fn set_write_off(&self, offset: u64) {
    *self.write_off.write() = offset;
  }

  pub fn get_file_id(&self) -> u32 {
    self.file_id
  }

  /// Reads the record starting at `offset`.
  ///
  /// A zeroed or truncated tail reads as [`Errors::ReadDataFileEOF`], so a torn
  /// final write ends replay instead of failing it.
  pub fn read_log_record(&self, offset: u64) -> Result<ReadLogRecord> {
    let file_size = self.file_size();
    if offset >= file_size {
      return Err(Errors::ReadDataFileEOF);
    }

    let header_bytes = (max_log_record_header_size() as u64).min(file_size - offset) as usize;
    let mut header_buf = vec![0u8; header_bytes];
    self.io_manager.read(&mut header_buf, offset)?;

    let header = match decode_header(&header_buf) {
      Some(header) => header,
      None => {
        warn!("torn record header in file {} at {}", self.file_id, offset);
        return Err(Errors::ReadDataFileEOF);
      }
    };
    if header.key_size == 0 && header.value_size == 0 {
      return Err(Errors::ReadDataFileEOF);
    }
    let rec_type = LogRecordType::from_u8(header.rec_type).ok_or(Errors::DataDirectoryCorrupted)?;

    let body_size = header.key_size + header.value_size + 4;
    let total_size = (header.header_size + body_size) as u64;
    if offset + total_size > file_size {
      warn!("torn record body in file {} at {}", self.file_id, offset);
      return Err(Errors::ReadDataFileEOF);
    }

    let mut body = vec![0u8; body_size];
    self
      .io_manager
      .read(&mut body, offset + header.header_size as u64)?;

    let crc_at = header.key_size + header.value_size;
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&body[crc_at..]);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header_buf[..header.header_size]);
    hasher.update(&body[..crc_at]);
    if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
      return Err(Errors::InvalidLogRecordCrc);
    }

    body.truncate(crc_at);
    let value = body.split_off(header.key_size);
    Ok(ReadLogRecord {
      record: LogRecord {
        key: body,
        value,
        rec_type,
      },
      size: total_size,
    })
  }

  pub fn write(&self, buf: &[u8]) -> Result<usize> {
    let n_bytes = self.io_manager.write(buf)?;
    *self.write_off.write() += n_bytes as u64;
    Ok(n_bytes)
  }

  pub fn sync(&self) -> Result<()> {
    self.io_manager.sync()
  }

  /// Drops everything past `size`, such as a torn final write.
  pub fn truncate(&self, size: u64) -> Result<()> {
    self.io_manager.truncate(size)?;
    *self.write_off.write() = size;
    Ok(())
  }

  pub fn set_io_manager<P>(&mut self, dir_path: P, io_type: IOManagerType) -> Result<()>
  where
    P: AsRef<Path>,
  {
    self.io_manager = new_io_manager(get_data_file_name(dir_path, self.file_id), io_type)?;
    Ok(())
  }
}

pub fn get_data_file_name<P>(dir_path: P, file_id: u32) -> PathBuf
where
  P: AsRef<Path>,
{
  let name = format!("{:09}{}", file_id, DATA_FILE_NAME_SUFFIX);
  dir_path.as_ref().join(name)
}
