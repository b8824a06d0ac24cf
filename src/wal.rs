//! Write-ahead log: an append-only sequence of `{ page_id, page_image, crc32 }`
//! frames, fsynced before the corresponding main-file write (spec.md §4.2,
//! §5's WAL ordering rule). Frame shape is grounded on the teacher's
//! `journal/journal.rs::FrameHeader` (page id + salts + checksum); the
//! CRC32-per-frame integrity check follows the from-scratch WAL in
//! `omendb-omen/src/wal.rs` (`crc32fast::Hasher` over each entry), since the
//! teacher's journal uses a 64-bit checksum over the whole file rather than
//! per-frame CRC32.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};

use crate::disk_stream::DiskStream;
use crate::error::Result;
use crate::page::Page;

const WAL_MAGIC: u32 = 0x5657_414C; // "VWAL"
const WAL_HEADER_SIZE: u64 = 16;

fn frame_size(page_size: u32) -> u64 {
    4 + page_size as u64 + 4
}

pub struct WriteAheadLog {
    path: PathBuf,
    page_size: u32,
    file: File,
    pending: BTreeMap<u32, Vec<u8>>,
}

impl WriteAheadLog {
    pub fn open(path: &Path, page_size: u32) -> Result<WriteAheadLog> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        let mut wal = WriteAheadLog {
            path: path.to_path_buf(),
            page_size,
            file,
            pending: BTreeMap::new(),
        };

        if wal.file.metadata()?.len() < WAL_HEADER_SIZE {
            wal.write_header()?;
        }

        Ok(wal)
    }

    fn write_header(&mut self) -> Result<()> {
        let mut buf = vec![0u8; WAL_HEADER_SIZE as usize];
        BigEndian::write_u32(&mut buf[0..4], WAL_MAGIC);
        BigEndian::write_u32(&mut buf[4..8], self.page_size);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Stages a page image in memory. A later `append_page` for the same
    /// `page_id` overwrites the earlier image (last writer wins within a
    /// commit) until the next `flush_log`.
    pub fn append_page(&mut self, page: &Page) {
        self.pending.insert(page.page_id, page.to_bytes(self.page_size));
    }

    /// Writes every pending frame to disk and fsyncs the WAL file. No-op if
    /// nothing is pending. Does not clear pending images from memory view
    /// until `truncate` is called, so a caller may re-flush idempotently.
    pub fn flush_log(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        self.file.seek(SeekFrom::End(0))?;
        for (page_id, image) in &self.pending {
            let mut frame = Vec::with_capacity(frame_size(self.page_size) as usize);
            frame.extend_from_slice(&page_id.to_be_bytes());
            frame.extend_from_slice(image);
            let crc = crc32fast::hash(&frame);
            frame.extend_from_slice(&crc.to_be_bytes());
            self.file.write_all(&frame)?;
        }
        self.file.sync_all()?;
        Ok(())
    }

    /// `flush_log`, apply every dirty page to the main file via `disk`
    /// (fsyncing it), then `truncate`. On any failure the WAL is left
    /// intact so replay can restore the pending images on next open.
    pub fn synchronize(&mut self, dirty_pages: &[Page], disk: &mut DiskStream) -> Result<()> {
        if dirty_pages.is_empty() {
            return Ok(());
        }
        for page in dirty_pages {
            self.append_page(page);
        }
        self.flush_log()?;

        for page in dirty_pages {
            disk.write_page(page.page_id, &page.to_bytes(self.page_size))?;
        }
        disk.sync_all()?;

        self.truncate()?;
        Ok(())
    }

    /// Resets the WAL to zero pending frames and fsyncs.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(WAL_HEADER_SIZE)?;
        self.file.sync_all()?;
        self.pending.clear();
        Ok(())
    }

    pub fn has_frames(&self) -> Result<bool> {
        Ok(self.file.metadata()?.len() > WAL_HEADER_SIZE)
    }

    /// Reads every well-formed frame (in file order) and writes its page
    /// image to `disk`, then fsyncs `disk` and truncates the WAL. Stops
    /// cleanly (without erroring) the moment a short read or a checksum
    /// mismatch is hit, tolerating a truncated/corrupt trailing frame left
    /// by a crash mid-append.
    pub fn replay(&mut self, disk: &mut DiskStream) -> Result<usize> {
        let len = self.file.metadata()?.len();
        if len <= WAL_HEADER_SIZE {
            return Ok(0);
        }

        self.file.seek(SeekFrom::Start(WAL_HEADER_SIZE))?;
        let fsize = frame_size(self.page_size) as usize;
        let mut buf = vec![0u8; fsize];
        let mut applied = 0usize;

        loop {
            match self.file.read_exact(&mut buf) {
                Ok(()) => {}
                Err(_) => break, // short/truncated trailing frame: stop cleanly
            }

            let page_id = BigEndian::read_u32(&buf[0..4]);
            let image = &buf[4..4 + self.page_size as usize];
            let stored_crc = BigEndian::read_u32(&buf[4 + self.page_size as usize..]);
            let actual_crc = crc32fast::hash(&buf[..4 + self.page_size as usize]);

            if stored_crc != actual_crc {
                break; // corrupt trailing frame: stop cleanly, don't abort open
            }

            disk.write_page(page_id, image)?;
            applied += 1;
        }

        disk.sync_all()?;
        self.truncate()?;
        Ok(applied)
    }
}

/// When journaling is disabled, the WAL file must not exist. Called by the
/// engine on open; a locked/unremovable file is tolerated (best-effort).
pub fn remove_stale_wal(path: &Path) {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageType;
    use tempfile::tempdir;

    fn test_page(id: u32, page_size: u32, byte: u8) -> Page {
        let mut p = Page::new(id, page_size, PageType::Data);
        p.payload[0] = byte;
        p
    }

    #[test]
    fn flush_and_replay_round_trip() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("t.db");
        let wal_path = dir.path().join("t.wal");

        let page_size = 4096;
        let mut disk = DiskStream::open(&db_path, page_size, false).unwrap();
        disk.set_page_count(4).unwrap();

        let mut wal = WriteAheadLog::open(&wal_path, page_size).unwrap();
        let pages = vec![test_page(1, page_size, 0xAA), test_page(2, page_size, 0xBB)];
        wal.synchronize(&pages, &mut disk).unwrap();

        assert!(!wal.has_frames().unwrap());

        let mut buf = vec![0u8; page_size as usize];
        disk.read_page(1, &mut buf).unwrap();
        assert_eq!(buf[0], 0xAA);
        disk.read_page(2, &mut buf).unwrap();
        assert_eq!(buf[0], 0xBB);
    }

    #[test]
    fn replay_tolerates_truncated_trailing_frame() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("t.db");
        let wal_path = dir.path().join("t.wal");

        let page_size = 4096;
        let mut disk = DiskStream::open(&db_path, page_size, false).unwrap();
        disk.set_page_count(4).unwrap();

        let mut wal = WriteAheadLog::open(&wal_path, page_size).unwrap();
        wal.append_page(&test_page(1, page_size, 0x11));
        wal.flush_log().unwrap();

        // simulate a crash mid-append of a second frame: append a short,
        // truncated tail that doesn't even fill one full frame.
        {
            let mut f = OpenOptions::new().append(true).open(&wal_path).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }

        let applied = wal.replay(&mut disk).unwrap();
        assert_eq!(applied, 1);

        let mut buf = vec![0u8; page_size as usize];
        disk.read_page(1, &mut buf).unwrap();
        assert_eq!(buf[0], 0x11);

        assert!(!wal.has_frames().unwrap());
    }

    #[test]
    fn remove_stale_wal_deletes_existing_file() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("t.wal");
        std::fs::write(&wal_path, b"stale").unwrap();
        remove_stale_wal(&wal_path);
        assert!(!wal_path.exists());
    }
}
