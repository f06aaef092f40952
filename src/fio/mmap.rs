use std::{fs::OpenOptions, path::Path};

use log::error;
use memmap2::Mmap;

use crate::errors::{Errors, Result};

use super::IOManager;

/// Read-only memory map of a data file, used to speed up index loading at startup.
pub struct MMapIO {
  // None for an empty file, which cannot be mapped on every platform.
  map: Option<Mmap>,
}

impl MMapIO {
  pub fn new<P>(file_name: P) -> Result<Self>
  where
    P: AsRef<Path>,
  {
    let file = match OpenOptions::new()
      .create(true)
      .read(true)
      .append(true)
      .open(file_name.as_ref())
    {
      Ok(file) => file,
      Err(e) => {
        error!("failed to open data file {}: {}", file_name.as_ref().display(), e);
        return Err(Errors::FailedToOpenDataFile);
      }
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if len == 0 {
      return Ok(MMapIO { map: None });
    }
    match unsafe { Mmap::map(&file) } {
      Ok(map) => Ok(MMapIO { map: Some(map) }),
      Err(e) => {
        error!("failed to map data file: {}", e);
        Err(Errors::FailedToOpenDataFile)
      }
    }
  }
}

impl IOManager for MMapIO {
  fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
    let data: &[u8] = self.map.as_deref().unwrap_or(&[]);
    let end = offset + buf.len() as u64;
    if end > data.len() as u64 {
      return Err(Errors::ReadDataFileEOF);
    }
    let val = &data[offset as usize..end as usize];
    buf.copy_from_slice(val);
    Ok(val.len())
  }

  fn write(&self, _buf: &[u8]) -> Result<usize> {
    Err(Errors::ReadOnly)
  }

  fn sync(&self) -> Result<()> {
    Ok(())
  }

  fn size(&self) -> u64 {
    self.map.as_ref().map(|m| m.len() as u64).unwrap_or(0)
  }

  fn truncate(&self, _size: u64) -> Result<()> {
    Err(Errors::ReadOnly)
  }
}
