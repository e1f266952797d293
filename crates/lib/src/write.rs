//! Raw copy of the payload onto the partition, bypassing the page cache.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;

use camino::Utf8Path;
use configdrive_utils::QuotedPath;
use rustix::fs::OFlags;
use static_assertions::const_assert_eq;

use crate::error::ConfigDriveError;
use crate::payload::Payload;

/// Size of each write.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Buffer address and length alignment for `O_DIRECT`. This is the largest
/// logical block size in practical use, so it satisfies 512-byte devices too.
const DIRECT_IO_ALIGN: usize = 4096;

const_assert_eq!(CHUNK_SIZE % DIRECT_IO_ALIGN, 0);

/// How the image is copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOptions {
    /// Open the destination with `O_DIRECT`.
    pub direct_io: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { direct_io: true }
    }
}

/// A heap buffer whose usable region starts on an `align` boundary.
struct AlignedBuf {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBuf {
    fn new(len: usize, align: usize) -> Self {
        // The allocation is never resized, so the offset stays valid.
        let storage = vec![0u8; len + align];
        let offset = storage.as_ptr().align_offset(align);
        debug_assert!(offset < align);
        Self {
            storage,
            offset,
            len,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }
}

/// Copy exactly `payload.len()` bytes from the payload to the start of `dest`,
/// in [`CHUNK_SIZE`] pieces. Returns the number of bytes written.
pub fn write_image(
    payload: &Payload,
    dest: &Utf8Path,
    opts: &WriteOptions,
) -> Result<u64, ConfigDriveError> {
    let len = payload.len();
    let fail = |offset: Option<u64>, source: std::io::Error| ConfigDriveError::Write {
        src: payload.path().to_owned(),
        destination: dest.to_owned(),
        offset,
        source,
    };

    let mut src = File::open(payload.path()).map_err(|e| fail(None, e))?;
    let mut flags = 0;
    if opts.direct_io {
        flags |= libc::O_DIRECT;
    }
    // No truncation; for a block device that is meaningless anyway
    let mut dst = OpenOptions::new()
        .write(true)
        .custom_flags(flags)
        .open(dest)
        .map_err(|e| fail(None, e))?;

    tracing::info!(
        "Writing configdrive contents in {} to {}",
        QuotedPath::new(payload.path()),
        QuotedPath::new(dest)
    );
    let mut buf = AlignedBuf::new(CHUNK_SIZE, DIRECT_IO_ALIGN);
    let buf = buf.as_mut_slice();
    let mut direct = opts.direct_io;
    let mut offset = 0u64;
    while offset < len {
        let n = (len - offset).min(CHUNK_SIZE as u64) as usize;
        let chunk = &mut buf[..n];
        src.read_exact(chunk).map_err(|e| fail(Some(offset), e))?;
        // Only possible for the final chunk; O_DIRECT can't write a
        // partial block, so finish that one through the page cache.
        if direct && n % DIRECT_IO_ALIGN != 0 {
            let fl = rustix::fs::fcntl_getfl(&dst).map_err(|e| fail(Some(offset), e.into()))?;
            rustix::fs::fcntl_setfl(&dst, fl - OFlags::DIRECT)
                .map_err(|e| fail(Some(offset), e.into()))?;
            direct = false;
            tracing::debug!("Disabled O_DIRECT for trailing {n} bytes");
        }
        dst.write_all(chunk).map_err(|e| fail(Some(offset), e))?;
        offset += n as u64;
    }
    dst.sync_all().map_err(|e| fail(Some(offset), e))?;
    tracing::debug!("Wrote {offset} bytes to {dest}");
    Ok(offset)
}
