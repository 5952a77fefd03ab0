//! Backing File
//!
//! Whole-page positional I/O against one table file or one log file.
//!
//! ## Responsibilities
//! - Read and write exactly one page at `index * PAGE_SIZE`
//! - Treat a short read or write as an error, never retry partial I/O
//! - Reopen the handle and retry once when the OS interrupts a call
//! - fsync on request

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::{AtlasError, Result};

use super::PAGE_SIZE;

/// A file addressed in whole pages
pub struct PageFile {
    path: PathBuf,
    file: RwLock<File>,
}

impl PageFile {
    /// Open (creating if needed) a page file
    pub fn open(path: &Path) -> Result<Self> {
        let file = Self::open_handle(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
        })
    }

    fn open_handle(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read page `index` into `buf` (exactly PAGE_SIZE bytes)
    pub fn read_page(&self, index: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let done = self.with_retry(|file| read_full_at(file, buf, index * PAGE_SIZE as u64))?;
        if done != PAGE_SIZE {
            return Err(AtlasError::ShortIo {
                op: "read",
                page: index,
                done,
                expected: PAGE_SIZE,
            });
        }
        Ok(())
    }

    /// Write `buf` (exactly PAGE_SIZE bytes) as page `index`
    pub fn write_page(&self, index: u64, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let done = self.with_retry(|file| write_full_at(file, buf, index * PAGE_SIZE as u64))?;
        if done != PAGE_SIZE {
            return Err(AtlasError::ShortIo {
                op: "write",
                page: index,
                done,
                expected: PAGE_SIZE,
            });
        }
        Ok(())
    }

    /// Flush file contents and metadata to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file.read().sync_all()?;
        Ok(())
    }

    /// File size in bytes
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.read().metadata()?.len())
    }

    /// Number of whole pages in the file
    pub fn page_count(&self) -> Result<u64> {
        Ok(self.size()? / PAGE_SIZE as u64)
    }

    /// Run `op` once; if the OS interrupted it, reopen the handle and run it again.
    fn with_retry<F>(&self, mut op: F) -> Result<usize>
    where
        F: FnMut(&File) -> io::Result<usize>,
    {
        let first = {
            let file = self.file.read();
            op(&*file)
        };
        match first {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                tracing::warn!(path = %self.path.display(), "page I/O interrupted, reopening handle");
                let mut file = self.file.write();
                *file = Self::open_handle(&self.path)?;
                Ok(op(&*file)?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Positional I/O helpers
// =============================================================================

/// Read until `buf` is full or EOF; returns bytes read.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let n = read_at(file, &mut buf[done..], offset + done as u64)?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}

/// Write until all of `buf` is written or the OS accepts nothing; returns bytes written.
fn write_full_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let n = write_at(file, &buf[done..], offset + done as u64)?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read_page() {
        let temp = TempDir::new().unwrap();
        let file = PageFile::open(&temp.path().join("t")).unwrap();

        let mut page = vec![0u8; PAGE_SIZE];
        page[0] = 1;
        page[PAGE_SIZE - 1] = 2;
        file.write_page(3, &page).unwrap();

        let mut back = vec![0u8; PAGE_SIZE];
        file.read_page(3, &mut back).unwrap();
        assert_eq!(back, page);
        assert_eq!(file.page_count().unwrap(), 4);
    }

    #[test]
    fn test_short_read_is_an_error() {
        let temp = TempDir::new().unwrap();
        let file = PageFile::open(&temp.path().join("t")).unwrap();
        let mut buf = vec![0u8; PAGE_SIZE];

        let err = file.read_page(0, &mut buf).unwrap_err();
        assert!(matches!(err, AtlasError::ShortIo { op: "read", page: 0, done: 0, .. }));
    }
}
