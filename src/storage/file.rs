// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Direct-I/O page files.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::mem::ManuallyDrop;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::path::Path;

use tracing::error;

use super::{PageIndex, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::io::IoRing;

/// A page file opened either for reading (optionally bypassing the OS page
/// cache) or for append-only writing.
///
/// Block reads follow one contract everywhere: either the requested size is
/// delivered, or end-of-file was reached after fewer bytes, or the
/// underlying error is returned. Buffer and offset alignment are the
/// caller's responsibility in direct mode; frame buffers satisfy both.
pub struct DataFile {
    file: ManuallyDrop<File>,
}

impl DataFile {
    /// Opens for reading, with `O_DIRECT` when `direct` is set. `O_NOATIME`
    /// keeps scans from dirtying inodes.
    pub fn open_read(path: &Path, direct: bool) -> Result<Self> {
        let mut flags = libc::O_NOATIME;
        if direct {
            flags |= libc::O_DIRECT;
        }
        let file = OpenOptions::new().read(true).custom_flags(flags).open(path)?;
        Ok(DataFile {
            file: ManuallyDrop::new(file),
        })
    }

    /// Creates (truncating) an append-only file. Appends from multiple
    /// threads rely on `O_APPEND` for their atomicity.
    pub fn create_append(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .custom_flags(libc::O_APPEND)
            .mode(0o600)
            .open(path)?;
        Ok(DataFile {
            file: ManuallyDrop::new(file),
        })
    }

    /// File length from the inode.
    pub fn read_size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Synchronously reads the page at `page_index` into `buffer`, which
    /// must span exactly one page.
    pub fn read_page(&self, page_index: PageIndex, buffer: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buffer.len(), PAGE_SIZE);
        self.read_block(buffer, page_index * PAGE_SIZE as u64)?;
        Ok(())
    }

    /// Reads `buffer.len()` bytes at `offset`, retrying partial reads.
    /// Returns the number of bytes read, which is only short of the request
    /// when end-of-file was reached.
    pub fn read_block(&self, buffer: &mut [u8], offset: u64) -> Result<usize> {
        let mut total = 0;
        while total < buffer.len() {
            let bytes_read = self.file.read_at(&mut buffer[total..], offset + total as u64)?;
            if bytes_read == 0 {
                break;
            }
            total += bytes_read;
        }
        Ok(total)
    }

    /// Like [`read_page`](Self::read_page), but suspends on `ring` instead
    /// of blocking the thread.
    pub async fn async_read_page(
        &self,
        ring: &IoRing,
        page_index: PageIndex,
        buffer: &mut [u8],
    ) -> Result<()> {
        debug_assert_eq!(buffer.len(), PAGE_SIZE);
        self.async_read_block(ring, buffer, page_index * PAGE_SIZE as u64)
            .await?;
        Ok(())
    }

    /// Like [`read_block`](Self::read_block) with the same short-read
    /// contract, awaiting each completion on `ring`.
    pub async fn async_read_block(
        &self,
        ring: &IoRing,
        buffer: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        let fd = self.raw_fd();
        let mut total = 0;
        while total < buffer.len() {
            let bytes_read = ring
                .read(fd, &mut buffer[total..], offset + total as u64)
                .await?;
            if bytes_read == 0 {
                break;
            }
            total += bytes_read;
        }
        Ok(total)
    }

    /// Appends whole pages; `data` must be a multiple of the page size.
    pub fn append_pages(&self, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len() % PAGE_SIZE, 0);
        self.append_block(data)
    }

    /// Appends `data` with a single `write`. A short write is unrecoverable
    /// because other threads may be appending concurrently.
    pub fn append_block(&self, data: &[u8]) -> Result<()> {
        let written = (&*self.file).write(data)?;
        if written != data.len() {
            return Err(Error::ShortWrite {
                written,
                expected: data.len(),
            });
        }
        Ok(())
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Drop for DataFile {
    fn drop(&mut self) {
        // std::fs::File swallows close(2) failures; report them instead.
        let file = unsafe { ManuallyDrop::take(&mut self.file) };
        let fd = file.into_raw_fd();
        if unsafe { libc::close(fd) } == -1 {
            error!(
                "failed to close data file: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FrameBuffer;

    fn scratch_file(name: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    #[test]
    fn pages_round_trip_bytewise() {
        let (_dir, path) = scratch_file("pages.dat");
        let mut frames = FrameBuffer::zeroed(2);
        for (index, byte) in frames.bytes_mut().iter_mut().enumerate() {
            *byte = (index % 251) as u8;
        }

        let writer = DataFile::create_append(&path).unwrap();
        writer.append_pages(frames.page_range_mut(0, 2)).unwrap();
        drop(writer);

        let reader = DataFile::open_read(&path, false).unwrap();
        assert_eq!(reader.read_size().unwrap(), 2 * PAGE_SIZE as u64);
        let mut readback = FrameBuffer::zeroed(1);
        for page in 0..2 {
            reader.read_page(page, readback.page_bytes_mut(0)).unwrap();
            assert_eq!(readback.page_bytes(0), frames.page_bytes(page as usize));
        }
    }

    #[test]
    fn empty_file_reads_nothing_and_leaves_buffer_untouched() {
        let (_dir, path) = scratch_file("empty.dat");
        drop(DataFile::create_append(&path).unwrap());

        let reader = DataFile::open_read(&path, false).unwrap();
        assert_eq!(reader.read_size().unwrap(), 0);

        let mut frame = FrameBuffer::zeroed(1);
        frame.page_bytes_mut(0).fill(0x5A);
        reader.read_page(0, frame.page_bytes_mut(0)).unwrap();
        assert!(frame.page_bytes(0).iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn read_block_reports_eof_with_a_short_count() {
        let (_dir, path) = scratch_file("short.dat");
        let writer = DataFile::create_append(&path).unwrap();
        writer.append_block(&[7u8; 100]).unwrap();
        drop(writer);

        let reader = DataFile::open_read(&path, false).unwrap();
        let mut buffer = vec![0u8; 256];
        let read = reader.read_block(&mut buffer, 0).unwrap();
        assert_eq!(read, 100);
        assert!(buffer[..100].iter().all(|&b| b == 7));
        assert!(buffer[100..].iter().all(|&b| b == 0));
    }
}
