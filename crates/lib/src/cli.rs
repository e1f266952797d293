//! # Command line interface
//!
//! `configdrive-to-disk CONFIGDRIVE DEVICE`

use std::ffi::OsString;

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;

use crate::allocate::{SizePolicy, DEFAULT_FIXED_SIZE_MIB};
use crate::configdrive::{self, Options};
use crate::error::ConfigDriveError;
use crate::ops::HostDisk;
use crate::payload::{self, BlockDevice, Payload};
use crate::write::WriteOptions;

/// Name used for the binary and as the prefix of log lines.
pub const TOOL_NAME: &str = "configdrive-to-disk";

/// Write a config drive image to the last partition of a block device.
///
/// An existing partition whose filesystem is labelled `config-2` is
/// overwritten; otherwise a new partition is created at the end of the
/// device.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = TOOL_NAME, version)]
pub struct Opts {
    /// Path to the config drive image
    #[clap(value_name = "CONFIGDRIVE")]
    pub configdrive: Utf8PathBuf,

    /// Target block device, e.g. /dev/sda
    #[clap(value_name = "DEVICE")]
    pub device: Utf8PathBuf,

    /// Create new partitions with a fixed size instead of sizing them to
    /// the image. Accepts suffixes such as M, MiB or G; without a value,
    /// 64MiB is used.
    #[clap(long, value_name = "SIZE", num_args = 0..=1, require_equals = true,
        value_parser = parse_fixed_size)]
    pub fixed_size: Option<Option<u64>>,

    /// The image is gzip-compressed
    #[clap(long)]
    pub gzip: bool,

    /// The image is gzip-compressed and then base64-encoded
    #[clap(long, conflicts_with = "gzip")]
    pub encoded: bool,

    /// Write through the page cache instead of using O_DIRECT
    #[clap(long)]
    pub no_direct_io: bool,
}

fn parse_fixed_size(s: &str) -> Result<u64> {
    let v = crate::blockdev::parse_size_mib(s)?;
    anyhow::ensure!(v > 0, "Size must be at least 1MiB");
    Ok(v)
}

impl Opts {
    /// The run configuration described by these options.
    pub fn options(&self) -> Options {
        let size_policy = match self.fixed_size {
            Some(mib) => SizePolicy::Fixed(mib.unwrap_or(DEFAULT_FIXED_SIZE_MIB)),
            None => SizePolicy::Payload,
        };
        Options {
            size_policy,
            write: WriteOptions {
                direct_io: !self.no_direct_io,
            },
        }
    }
}

/// Parse the provided arguments; help and version output are handled
/// here and yield `None`.
fn parse_args<I, T>(args: I) -> Result<Option<Opts>>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match Opts::try_parse_from(args) {
        Ok(opts) => Ok(Some(opts)),
        Err(e) if !e.use_stderr() => {
            e.print()?;
            Ok(None)
        }
        Err(e) => {
            let msg = e.to_string();
            let msg = msg.strip_prefix("error: ").unwrap_or(&msg).trim_end();
            Err(ConfigDriveError::usage(msg).into())
        }
    }
}

/// Parse the provided arguments and execute.
pub fn run_from_iter<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match parse_args(args)? {
        Some(opts) => run_from_opts(opts),
        None => Ok(()),
    }
}

/// Validate the inputs and write the config drive.
pub fn run_from_opts(opts: Opts) -> Result<()> {
    let span = tracing::info_span!(TOOL_NAME);
    let _guard = span.enter();
    tracing::trace!("{opts:?}");

    let payload = Payload::open(&opts.configdrive)?;
    let device = BlockDevice::open(&opts.device)?;
    let unpacked = if opts.encoded {
        Some(payload::unpack_encoded(&payload, payload::MAX_UNPACKED_SIZE)?)
    } else if opts.gzip {
        Some(payload::unpack_gzip(&payload, payload::MAX_UNPACKED_SIZE)?)
    } else {
        None
    };
    let payload = unpacked.as_ref().map(|u| u.payload()).unwrap_or(&payload);

    configdrive::write_configdrive(&mut HostDisk, payload, &device, &opts.options())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Opts {
        parse_args(std::iter::once(TOOL_NAME).chain(args.iter().copied()))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_parse_defaults() {
        let opts = parse(&["/tmp/configdrive", "/dev/sda"]);
        assert_eq!(opts.configdrive, "/tmp/configdrive");
        assert_eq!(opts.device, "/dev/sda");
        assert_eq!(opts.options(), Options::default());
    }

    #[test]
    fn test_parse_fixed_size() {
        let opts = parse(&["--fixed-size", "/tmp/configdrive", "/dev/sda"]);
        assert_eq!(opts.fixed_size, Some(None));
        assert_eq!(
            opts.options().size_policy,
            SizePolicy::Fixed(DEFAULT_FIXED_SIZE_MIB)
        );
        let opts = parse(&["--fixed-size=1G", "/tmp/configdrive", "/dev/sda"]);
        assert_eq!(opts.fixed_size, Some(Some(1024)));
        assert_eq!(opts.options().size_policy, SizePolicy::Fixed(1024));
        let opts = parse(&["--fixed-size=64M", "/tmp/configdrive", "/dev/sda"]);
        assert_eq!(
            opts.options().size_policy,
            SizePolicy::Fixed(DEFAULT_FIXED_SIZE_MIB)
        );
        let opts = parse(&["--gzip", "--no-direct-io", "/tmp/cd.gz", "/dev/vdb"]);
        assert!(opts.gzip);
        assert!(!opts.options().write.direct_io);
        let opts = parse(&["--encoded", "/tmp/cd.b64", "/dev/vdb"]);
        assert!(opts.encoded);
        assert!(!opts.gzip);
    }

    #[test]
    fn test_parse_invalid() {
        let cases: &[&[&str]] = &[
            &[],
            &["/tmp/configdrive"],
            &["/tmp/configdrive", "/dev/sda", "extra"],
            &["--fixed-size=0", "/tmp/configdrive", "/dev/sda"],
            &["--fixed-size=lots", "/tmp/configdrive", "/dev/sda"],
            &["--gzip", "--encoded", "/tmp/configdrive", "/dev/sda"],
        ];
        for case in cases {
            let args = std::iter::once(TOOL_NAME).chain(case.iter().copied());
            let e = parse_args(args).unwrap_err();
            assert!(
                matches!(
                    e.downcast_ref::<ConfigDriveError>(),
                    Some(ConfigDriveError::Usage(_))
                ),
                "{case:?}: {e}"
            );
        }
    }

    #[test]
    fn test_help() {
        assert!(parse_args([TOOL_NAME, "--help"]).unwrap().is_none());
    }

    #[test]
    fn test_invalid_inputs_rejected() -> Result<()> {
        let td = tempfile::tempdir()?;
        let cd = td.path().join("configdrive");
        std::fs::write(&cd, b"data")?;
        let cd = cd.to_str().unwrap();
        let missing = td.path().join("missing");
        let missing = missing.to_str().unwrap();
        for (args, expected) in [
            (
                [TOOL_NAME, missing, "/dev/null"],
                format!("{missing} (CONFIGDRIVE) is not a regular file"),
            ),
            (
                [TOOL_NAME, cd, "/dev/null"],
                "/dev/null (DEVICE) is not a block device".to_string(),
            ),
            (
                [TOOL_NAME, cd, cd],
                format!("{cd} (DEVICE) is not a block device"),
            ),
        ] {
            let e = run_from_iter(args).unwrap_err();
            match e.downcast_ref::<ConfigDriveError>() {
                Some(ConfigDriveError::Usage(msg)) => assert_eq!(msg, &expected),
                o => panic!("Unexpected error {o:?}"),
            }
        }
        Ok(())
    }
}
