use std::{fs, io::Write, path::Path};

use log::error;

use crate::errors::{Errors, Result};

/// Total size in bytes of everything under `dir_path`, 0 if it cannot be read.
pub fn dir_disk_size<P>(dir_path: P) -> u64
where
  P: AsRef<Path>,
{
  fs_extra::dir::get_size(dir_path).unwrap_or(0)
}

pub fn available_disk_space<P>(dir_path: P) -> u64
where
  P: AsRef<Path>,
{
  fs2::available_space(dir_path).unwrap_or(0)
}

/// Replaces the contents of `path` by writing a sibling temp file and renaming it over.
pub fn write_atomic<P>(path: P, contents: &[u8]) -> Result<()>
where
  P: AsRef<Path>,
{
  let path = path.as_ref();
  let mut tmp_name = path.as_os_str().to_owned();
  tmp_name.push(".tmp");
  let tmp_path = Path::new(&tmp_name);

  let res = fs::File::create(tmp_path)
    .and_then(|mut f| {
      f.write_all(contents)?;
      f.sync_all()
    })
    .and_then(|_| fs::rename(tmp_path, path));
  if let Err(e) = res {
    error!("failed to write {}: {}", path.display(), e);
    let _ = fs::remove_file(tmp_path);
    return Err(Errors::FailedToPersistCounter);
  }
  Ok(())
}
