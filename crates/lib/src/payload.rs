//! Validation of the two inputs: the config drive payload and the
//! target block device.
//!
//! Both are represented by types that can only be constructed after
//! validation succeeded, so nothing further down can touch a device
//! that was not checked.

use std::io::{BufRead, Read};
use std::os::unix::fs::FileTypeExt;

use anyhow::Context;
use base64::prelude::*;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::error::ConfigDriveError;

/// Upper bound for a decompressed payload.
pub const MAX_UNPACKED_SIZE: u64 = 64 * 1024 * 1024;

/// A config drive image on local storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    path: Utf8PathBuf,
    len: u64,
}

impl Payload {
    /// Validate that `path` is a regular file and record its size.
    pub fn open(path: &Utf8Path) -> Result<Self, ConfigDriveError> {
        let not_a_file = || {
            ConfigDriveError::usage(format!("{path} (CONFIGDRIVE) is not a regular file"))
        };
        // Follows symlinks; a link to an image is fine.
        let meta = std::fs::metadata(path).map_err(|_| not_a_file())?;
        if !meta.file_type().is_file() {
            return Err(not_a_file());
        }
        // Make sure we can actually read it before anything else happens
        std::fs::File::open(path).map_err(|e| {
            ConfigDriveError::usage(format!("{path} (CONFIGDRIVE) is not readable: {e}"))
        })?;
        Ok(Self {
            path: path.to_owned(),
            len: meta.len(),
        })
    }

    /// Path to the image.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Size in bytes, as read when the payload was opened.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the image is zero bytes long.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A validated block-special device node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    path: Utf8PathBuf,
}

impl BlockDevice {
    /// Validate that `path` names an existing block device.
    pub fn open(path: &Utf8Path) -> Result<Self, ConfigDriveError> {
        let is_blockdev = std::fs::metadata(path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false);
        if !is_blockdev {
            return Err(ConfigDriveError::usage(format!(
                "{path} (DEVICE) is not a block device"
            )));
        }
        Ok(Self {
            path: path.to_owned(),
        })
    }

    /// Wrap a path without checking it; for driving the protocol against
    /// a fake device.
    #[cfg(test)]
    pub(crate) fn new_unchecked(path: &str) -> Self {
        Self { path: path.into() }
    }

    /// Path to the device node.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

/// A payload decompressed into a private temporary file, which is
/// removed again when this is dropped.
#[derive(Debug)]
pub struct UnpackedPayload {
    // Held for its drop
    _tmpf: tempfile::NamedTempFile,
    payload: Payload,
}

impl UnpackedPayload {
    /// The decompressed image.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }
}

/// Decompress a gzip-compressed payload. The result may be at most
/// `limit` bytes.
#[context("Unpacking {}", compressed.path())]
pub fn unpack_gzip(compressed: &Payload, limit: u64) -> anyhow::Result<UnpackedPayload> {
    let src = std::fs::File::open(compressed.path())?;
    gunzip_to_tempfile(std::io::BufReader::new(src), compressed.path(), limit)
}

/// Decode a base64-encoded, gzip-compressed payload, the form in which
/// the provisioning agent receives config drives. ASCII whitespace in the
/// encoded text is ignored. The result may be at most `limit` bytes.
#[context("Decoding {}", encoded.path())]
pub fn unpack_encoded(encoded: &Payload, limit: u64) -> anyhow::Result<UnpackedPayload> {
    let mut text = std::fs::read(encoded.path())?;
    text.retain(|b| !b.is_ascii_whitespace());
    let compressed = BASE64_STANDARD
        .decode(&text)
        .context("Invalid base64 data")?;
    gunzip_to_tempfile(compressed.as_slice(), encoded.path(), limit)
}

fn gunzip_to_tempfile(
    src: impl BufRead,
    origin: &Utf8Path,
    limit: u64,
) -> anyhow::Result<UnpackedPayload> {
    let mut decoder = flate2::bufread::GzDecoder::new(src).take(limit + 1);
    let mut tmpf = tempfile::Builder::new()
        .prefix("configdrive")
        .tempfile()
        .context("Creating temporary file")?;
    tracing::debug!("Writing configdrive to {}", tmpf.path().display());
    let size = std::io::copy(&mut decoder, tmpf.as_file_mut()).context("Decompressing")?;
    if size > limit {
        return Err(ConfigDriveError::TooLarge {
            path: origin.to_owned(),
            size,
            limit,
            what: "an unpacked config drive".into(),
        }
        .into());
    }
    tmpf.as_file().sync_all()?;
    let path = Utf8Path::from_path(tmpf.path())
        .ok_or_else(|| anyhow::anyhow!("Non-UTF8 temporary path {}", tmpf.path().display()))?;
    let payload = Payload::open(path)?;
    Ok(UnpackedPayload {
        _tmpf: tmpf,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn utf8(p: &std::path::Path) -> &Utf8Path {
        Utf8Path::from_path(p).unwrap()
    }

    fn encode(data: &[u8]) -> Vec<u8> {
        // Wrapped like base64(1) output
        let text = BASE64_STANDARD.encode(gzip(data));
        let lines: Vec<&str> = text
            .as_bytes()
            .chunks(76)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect();
        format!("{}\n", lines.join("\n")).into_bytes()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_payload_regular_file() -> anyhow::Result<()> {
        let td = tempfile::tempdir()?;
        let p = td.path().join("configdrive");
        std::fs::write(&p, b"somedata")?;
        let payload = Payload::open(utf8(&p))?;
        assert_eq!(payload.len(), 8);
        assert!(!payload.is_empty());
        assert_eq!(payload.path(), utf8(&p));
        Ok(())
    }

    #[test]
    fn test_payload_invalid() -> anyhow::Result<()> {
        let td = tempfile::tempdir()?;
        let missing = td.path().join("nonexistent");
        let cases = [utf8(&missing), utf8(td.path()), Utf8Path::new("/dev/null")];
        for case in cases {
            match Payload::open(case) {
                Err(ConfigDriveError::Usage(msg)) => {
                    assert_eq!(msg, format!("{case} (CONFIGDRIVE) is not a regular file"))
                }
                o => panic!("Unexpected result for {case}: {o:?}"),
            }
        }
        Ok(())
    }

    #[test]
    fn test_not_a_blockdev() -> anyhow::Result<()> {
        let td = tempfile::tempdir()?;
        let f = td.path().join("disk.img");
        std::fs::write(&f, b"")?;
        let missing = td.path().join("nonexistent");
        // A regular file, a directory, a character device, nothing at all
        let cases = [
            utf8(&f),
            utf8(td.path()),
            Utf8Path::new("/dev/null"),
            utf8(&missing),
        ];
        for case in cases {
            match BlockDevice::open(case) {
                Err(ConfigDriveError::Usage(msg)) => {
                    assert_eq!(msg, format!("{case} (DEVICE) is not a block device"))
                }
                o => panic!("Unexpected result for {case}: {o:?}"),
            }
        }
        Ok(())
    }

    #[test]
    fn test_unpack_gzip() -> anyhow::Result<()> {
        let td = tempfile::tempdir()?;
        let p = td.path().join("configdrive.gz");
        let data: Vec<u8> = (0..200_000u32).map(|v| (v % 251) as u8).collect();
        std::fs::write(&p, gzip(&data))?;
        let compressed = Payload::open(utf8(&p))?;
        let unpacked = unpack_gzip(&compressed, MAX_UNPACKED_SIZE)?;
        assert_eq!(unpacked.payload().len(), data.len() as u64);
        assert_eq!(std::fs::read(unpacked.payload().path())?, data);
        let tmppath = unpacked.payload().path().to_owned();
        drop(unpacked);
        assert!(!tmppath.exists());
        Ok(())
    }

    #[test]
    fn test_unpack_too_large() -> anyhow::Result<()> {
        let td = tempfile::tempdir()?;
        let p = td.path().join("configdrive.gz");
        std::fs::write(&p, gzip(&[0u8; 4097]))?;
        let compressed = Payload::open(utf8(&p))?;
        let err = unpack_gzip(&compressed, 4096).unwrap_err();
        match err.downcast_ref::<ConfigDriveError>() {
            Some(ConfigDriveError::TooLarge { size, limit, .. }) => {
                assert_eq!(*size, 4097);
                assert_eq!(*limit, 4096);
            }
            o => panic!("Unexpected error {o:?}"),
        }
        // Exactly at the limit is fine
        std::fs::write(&p, gzip(&[0u8; 4096]))?;
        let compressed = Payload::open(utf8(&p))?;
        assert_eq!(unpack_gzip(&compressed, 4096)?.payload().len(), 4096);
        Ok(())
    }

    #[test]
    fn test_unpack_not_gzip() -> anyhow::Result<()> {
        let td = tempfile::tempdir()?;
        let p = td.path().join("configdrive");
        std::fs::write(&p, b"this is not gzip data at all")?;
        let compressed = Payload::open(utf8(&p))?;
        assert!(unpack_gzip(&compressed, MAX_UNPACKED_SIZE).is_err());
        Ok(())
    }

    #[test]
    fn test_unpack_encoded() -> anyhow::Result<()> {
        let td = tempfile::tempdir()?;
        let p = td.path().join("configdrive.b64");
        let data: Vec<u8> = (0..100_000u32).map(|v| (v % 247) as u8).collect();
        std::fs::write(&p, encode(&data))?;
        let encoded = Payload::open(utf8(&p))?;
        let unpacked = unpack_encoded(&encoded, MAX_UNPACKED_SIZE)?;
        assert_eq!(std::fs::read(unpacked.payload().path())?, data);
        Ok(())
    }

    #[test]
    fn test_unpack_encoded_invalid() -> anyhow::Result<()> {
        let td = tempfile::tempdir()?;
        let p = td.path().join("configdrive.b64");
        std::fs::write(&p, b"not*base64!")?;
        let encoded = Payload::open(utf8(&p))?;
        let err = unpack_encoded(&encoded, MAX_UNPACKED_SIZE).unwrap_err();
        assert!(format!("{err:#}").contains("Invalid base64 data"), "{err:#}");
        // Valid base64, but not gzip
        std::fs::write(&p, BASE64_STANDARD.encode(b"plain text"))?;
        let encoded = Payload::open(utf8(&p))?;
        assert!(unpack_encoded(&encoded, MAX_UNPACKED_SIZE).is_err());
        Ok(())
    }

    #[test]
    fn test_unpack_encoded_too_large() -> anyhow::Result<()> {
        let td = tempfile::tempdir()?;
        let p = td.path().join("configdrive.b64");
        std::fs::write(&p, encode(&[0u8; 8193]))?;
        let encoded = Payload::open(utf8(&p))?;
        let err = unpack_encoded(&encoded, 8192).unwrap_err();
        match err.downcast_ref::<ConfigDriveError>() {
            Some(ConfigDriveError::TooLarge { path, size, limit, .. }) => {
                assert_eq!(path, encoded.path());
                assert_eq!(*size, 8193);
                assert_eq!(*limit, 8192);
            }
            o => panic!("Unexpected error {o:?}"),
        }
        Ok(())
    }
}
