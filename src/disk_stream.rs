//! Fixed-size random-access I/O over the database file with fsync.
//!
//! Kept as its own thin module (rather than folded into `PageManager`) so
//! the page manager never touches `std::fs` directly — mirrors the
//! teacher's `RawPage::sync_to_file`/`read_from_file` (`page/page.rs`),
//! generalized into a stream type that owns the file handle.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::Result;

pub struct DiskStream {
    file: File,
    page_size: u32,
}

impl DiskStream {
    pub fn open(path: &Path, page_size: u32, read_only: bool) -> Result<DiskStream> {
        let file = OpenOptions::new()
            .create(!read_only)
            .read(true)
            .write(!read_only)
            .open(path)?;
        Ok(DiskStream { file, page_size })
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of whole pages currently backing the file.
    pub fn page_count(&self) -> Result<u32> {
        Ok((self.len()? / self.page_size as u64) as u32)
    }

    pub fn set_page_count(&mut self, count: u32) -> Result<()> {
        self.file.set_len(count as u64 * self.page_size as u64)?;
        Ok(())
    }

    /// `page_id` is 1-based (spec.md §6: offsets are `(page_id - 1) * page_size`);
    /// `page_id == 0` must never reach here.
    fn offset_of(&self, page_id: u32) -> u64 {
        debug_assert!(page_id > 0, "page_id 0 is reserved for \"no page\"");
        (page_id as u64 - 1) * self.page_size as u64
    }

    pub fn read_page(&mut self, page_id: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size as usize);
        let offset = self.offset_of(page_id);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    pub fn write_page(&mut self, page_id: u32, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size as usize);
        let offset = self.offset_of(page_id);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    pub fn sync_all(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn write_then_read_page_round_trips() {
        let tmp = NamedTempFile::new().unwrap();
        let mut stream = DiskStream::open(tmp.path(), 4096, false).unwrap();
        stream.set_page_count(2).unwrap();

        let mut page = vec![0u8; 4096];
        page[0] = 0xAB;
        page[4095] = 0xCD;
        stream.write_page(1, &page).unwrap();

        let mut out = vec![0u8; 4096];
        stream.read_page(1, &mut out).unwrap();
        assert_eq!(page, out);
    }

    #[test]
    fn page_count_reflects_file_size() {
        let tmp = NamedTempFile::new().unwrap();
        let mut stream = DiskStream::open(tmp.path(), 4096, false).unwrap();
        assert_eq!(stream.page_count().unwrap(), 0);
        stream.set_page_count(4).unwrap();
        assert_eq!(stream.page_count().unwrap(), 4);
    }
}
