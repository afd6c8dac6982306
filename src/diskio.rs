// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Aligned, timed sector I/O against shared block devices.
//!
//! Every operation reads or writes whole sectors at a byte offset on a file
//! opened for direct I/O, and completes within a caller-supplied io_timeout.
//! Three outcomes are distinguished: success, I/O error (fail fast), and
//! [`Error::AioTimeout`]. On a timeout the operation is abandoned but the
//! underlying kernel request may still be in flight, so the buffer must not
//! be freed: the blocking task keeps ownership and drops it whenever the
//! syscall finally returns. No buffering, no caching.

use std::alloc::{self, Layout};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// One disk location a lease lives at: a path and a byte offset into it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncDisk {
    pub path: PathBuf,
    pub offset: u64,
    #[serde(skip)]
    file: Option<Arc<File>>,
}

impl SyncDisk {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            file: None,
        }
    }

    /// Opens the disk for read/write. With `direct` the file is opened
    /// `O_DIRECT`, which requires sector-aligned buffers, offsets and
    /// lengths on every operation.
    pub fn open(&mut self, direct: bool) -> Result<(), Error> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        if direct {
            opts.custom_flags(libc::O_DIRECT);
        }
        let file = opts.open(&self.path).map_err(|err| {
            warn!("open {} failed: {err}", self.path.display());
            Error::Io(format!("open {}: {err}", self.path.display()))
        })?;
        self.file = Some(Arc::new(file));
        Ok(())
    }

    pub fn close(&mut self) {
        self.file = None;
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn file(&self) -> Result<Arc<File>, Error> {
        self.file
            .clone()
            .ok_or_else(|| Error::Io(format!("disk {} not open", self.path.display())))
    }
}

fn page_size() -> usize {
    // sysconf cannot fail for _SC_PAGESIZE
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Page-aligned byte buffer for direct I/O.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// the buffer is plain bytes; the pointer is uniquely owned
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    /// Allocates a zeroed page-aligned buffer of `len` bytes.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        assert!(len > 0, "zero-length io buffer");
        let layout = Layout::from_size_align(len, page_size()).expect("io buffer layout");
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).expect("io buffer allocation failed");
        Self { ptr, len, layout }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

fn pread_all(file: &File, buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    let fd = file.as_raw_fd();
    let mut done = 0usize;
    while done < buf.len() {
        let rest = &mut buf[done..];
        let rv = unsafe {
            libc::pread64(
                fd,
                rest.as_mut_ptr().cast(),
                rest.len(),
                offset as libc::off64_t,
            )
        };
        if rv < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rv == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short read",
            ));
        }
        done += rv as usize;
        offset += rv as u64;
    }
    Ok(())
}

fn pwrite_all(file: &File, buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    let fd = file.as_raw_fd();
    let mut done = 0usize;
    while done < buf.len() {
        let rest = &buf[done..];
        let rv = unsafe {
            libc::pwrite64(
                fd,
                rest.as_ptr().cast(),
                rest.len(),
                offset as libc::off64_t,
            )
        };
        if rv < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rv == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "short write",
            ));
        }
        done += rv as usize;
        offset += rv as u64;
    }
    Ok(())
}

/// Reads `buf.len()` bytes at absolute byte `offset` into `buf`, returning
/// the buffer on success. On timeout the buffer stays with the abandoned
/// blocking task.
pub async fn read_iobuf(
    disk: &SyncDisk,
    offset: u64,
    mut buf: AlignedBuf,
    io_timeout: Duration,
) -> Result<AlignedBuf, Error> {
    let file = disk.file()?;
    let handle = tokio::task::spawn_blocking(move || {
        let res = pread_all(&file, buf.as_mut_slice(), offset);
        (res, buf)
    });
    match tokio::time::timeout(io_timeout, handle).await {
        Err(_) => {
            debug!("read_iobuf timeout offset {offset}");
            Err(Error::AioTimeout)
        }
        Ok(Err(join)) => Err(Error::Io(format!("read task: {join}"))),
        Ok(Ok((Ok(()), buf))) => Ok(buf),
        Ok(Ok((Err(err), _buf))) => Err(Error::Io(format!("read: {err}"))),
    }
}

/// Writes `buf` at absolute byte `offset`. On timeout the buffer stays with
/// the abandoned blocking task.
pub async fn write_iobuf(
    disk: &SyncDisk,
    offset: u64,
    buf: AlignedBuf,
    io_timeout: Duration,
) -> Result<(), Error> {
    let file = disk.file()?;
    let handle = tokio::task::spawn_blocking(move || {
        let res = pwrite_all(&file, buf.as_slice(), offset);
        (res, buf)
    });
    match tokio::time::timeout(io_timeout, handle).await {
        Err(_) => {
            debug!("write_iobuf timeout offset {offset}");
            Err(Error::AioTimeout)
        }
        Ok(Err(join)) => Err(Error::Io(format!("write task: {join}"))),
        Ok(Ok((Ok(()), _buf))) => Ok(()),
        Ok(Ok((Err(err), _buf))) => Err(Error::Io(format!("write: {err}"))),
    }
}

/// Reads `count` whole sectors starting at sector `sector_nr` of the disk's
/// lease area.
pub async fn read_sectors(
    disk: &SyncDisk,
    sector_size: u32,
    sector_nr: u64,
    count: u64,
    io_timeout: Duration,
) -> Result<AlignedBuf, Error> {
    let len = (count * u64::from(sector_size)) as usize;
    let buf = AlignedBuf::zeroed(len);
    let offset = disk.offset + sector_nr * u64::from(sector_size);
    read_iobuf(disk, offset, buf, io_timeout).await
}

/// Writes one whole sector at sector `sector_nr` of the disk's lease area.
/// `data` is copied into the front of a zeroed sector.
pub async fn write_sector(
    disk: &SyncDisk,
    sector_size: u32,
    sector_nr: u64,
    data: &[u8],
    io_timeout: Duration,
) -> Result<(), Error> {
    assert!(data.len() <= sector_size as usize, "record exceeds sector");
    let mut buf = AlignedBuf::zeroed(sector_size as usize);
    buf.as_mut_slice()[..data.len()].copy_from_slice(data);
    let offset = disk.offset + sector_nr * u64::from(sector_size);
    write_iobuf(disk, offset, buf, io_timeout).await
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// A plain (non-direct) temp file sized for one lease area.
    pub fn temp_disk(tag: &str, len: u64) -> SyncDisk {
        let path = std::env::temp_dir().join(format!(
            "lodestone-{tag}-{}-{}",
            std::process::id(),
            crate::monotime()
        ));
        let file = File::create(&path).unwrap();
        file.set_len(len).unwrap();
        let mut disk = SyncDisk::new(path, 0);
        disk.open(false).unwrap();
        disk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IO: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn sector_round_trip() {
        let disk = test_util::temp_disk("diskio-rt", 8 * 512);
        let payload = vec![0xA5u8; 100];
        write_sector(&disk, 512, 3, &payload, IO).await.unwrap();

        let buf = read_sectors(&disk, 512, 3, 1, IO).await.unwrap();
        assert_eq!(&buf.as_slice()[..100], &payload[..]);
        // rest of the sector is zeroed
        assert!(buf.as_slice()[100..].iter().all(|&b| b == 0));
        std::fs::remove_file(&disk.path).unwrap();
    }

    #[tokio::test]
    async fn multi_sector_read() {
        let disk = test_util::temp_disk("diskio-multi", 8 * 512);
        write_sector(&disk, 512, 0, &[1u8; 8], IO).await.unwrap();
        write_sector(&disk, 512, 2, &[2u8; 8], IO).await.unwrap();

        let buf = read_sectors(&disk, 512, 0, 4, IO).await.unwrap();
        assert_eq!(buf.len(), 4 * 512);
        assert_eq!(buf.as_slice()[0], 1);
        assert_eq!(buf.as_slice()[2 * 512], 2);
        assert_eq!(buf.as_slice()[512], 0);
        std::fs::remove_file(&disk.path).unwrap();
    }

    #[tokio::test]
    async fn unopened_disk_errors() {
        let disk = SyncDisk::new("/nonexistent/lodestone", 0);
        let res = read_sectors(&disk, 512, 0, 1, IO).await;
        assert!(matches!(res, Err(Error::Io(_))));
    }

    #[test]
    fn aligned_buf_is_aligned() {
        let buf = AlignedBuf::zeroed(4096);
        assert_eq!(buf.as_slice().as_ptr() as usize % page_size(), 0);
        assert_eq!(buf.len(), 4096);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }
}
