//! On-disk layout of the namespace.
//!
//! Each virtual directory is a real directory under the store root holding a
//! `.dirProperties` JSON record. Every non-directory child is a JSON file
//! named after the child. The physical directory listing is the source of
//! truth for which children exist.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, error, warn};

use crate::error::{Result, VfsError};
use crate::path::{self, DIR_RECORD};
use crate::record::InodeRecord;


#[derive(Debug)]
pub enum RecordRead {
    Found(InodeRecord),
    /// Nothing on disk, or a directory with no record inside it.
    Absent { physical_dir: bool },
    /// A record exists but cannot be parsed.
    Corrupt { physical_dir: bool, error: String },
}

#[derive(Debug, Clone)]
pub struct DiskStore {
    base: PathBuf,
}

impl DiskStore {
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(DiskStore { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn real_path(&self, path: &str) -> PathBuf {
        let rel = path.trim_start_matches('/');
        if rel.is_empty() {
            self.base.clone()
        } else {
            self.base.join(rel)
        }
    }

    fn record_file(&self, path: &str, is_dir: bool) -> PathBuf {
        let real = self.real_path(path);
        if is_dir { real.join(DIR_RECORD) } else { real }
    }

    pub fn is_physical_dir(&self, path: &str) -> bool {
        self.real_path(path).is_dir()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.real_path(path).exists()
    }

    pub fn read_record(&self, path: &str) -> Result<RecordRead> {
        let real = self.real_path(path);
        let physical_dir = real.is_dir();
        let file = self.record_file(path, physical_dir);
        let data = match fs::read(&file) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(RecordRead::Absent { physical_dir });
            }
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<InodeRecord>(&data) {
            Ok(record) => {
                if physical_dir != record.is_directory() {
                    warn!("record type of {path} does not match its physical layout");
                    return Ok(RecordRead::Corrupt {
                        physical_dir,
                        error: "record type does not match physical layout".to_string(),
                    });
                }
                Ok(RecordRead::Found(record))
            }
            Err(e) => Ok(RecordRead::Corrupt {
                physical_dir,
                error: e.to_string(),
            }),
        }
    }

    /// Writes through a temp file so a crash never leaves half a record.
    pub fn write_record(&self, path: &str, record: &InodeRecord) -> Result<()> {
        let file = self.record_file(path, record.is_directory());
        if let Some(dir) = file.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = temp_file_for(&file);
        {
            let mut out = fs::File::create(&tmp)?;
            serde_json::to_writer_pretty(&mut out, record)?;
            out.write_all(b"\n")?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &file)?;
        debug!("wrote record for {path}");
        Ok(())
    }

    /// Removes only the record file, leaving any physical directory alone.
    pub fn delete_record(&self, path: &str) -> Result<()> {
        let real = self.real_path(path);
        let file = self.record_file(path, real.is_dir());
        match fs::remove_file(&file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the record(s) for `path`, recursively for directories.
    pub fn delete(&self, path: &str) -> Result<()> {
        let real = self.real_path(path);
        let res = if real.is_dir() {
            fs::remove_dir_all(&real)
        } else {
            fs::remove_file(&real)
        };
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                error!("unable to delete {path} from disk: {e}");
                Err(e.into())
            }
        }
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.real_path(from);
        let dst = self.real_path(to);
        if let Some(dir) = dst.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::rename(&src, &dst).map_err(|e| {
            error!("unable to move {from} to {to} on disk: {e}");
            VfsError::from(e)
        })
    }

    /// Physical children of a directory, excluding the record file and any
    /// leftover temp files.
    pub fn list_children(&self, path: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.real_path(path))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if path::is_reserved_name(&name) {
                continue;
            }
            names.push(name);
        }
        Ok(names)
    }
}

/// `.dirProperties.<name>.tmp` next to `file`, a name no child can take.
fn temp_file_for(file: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(DIR_RECORD);
    name.push(".");
    if let Some(base) = file.file_name() {
        name.push(base);
    }
    name.push(".tmp");
    file.with_file_name(name)
}
