//! The error type surfaced to the command line entrypoint.

use camino::Utf8PathBuf;

/// An error boxed from the `anyhow` chains of the lower layers.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Every way a run can fail. Each of these terminates the run; a rescan
/// problem is not an error and is carried in [`crate::probe::RescanOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigDriveError {
    /// Invalid arguments; nothing on the device has been touched.
    #[error("{0}")]
    Usage(String),

    /// The payload does not fit where it is supposed to go.
    #[error("{path}: {size} bytes exceeds the {limit} byte limit for {what}")]
    TooLarge {
        /// The offending payload
        path: Utf8PathBuf,
        /// Its size
        size: u64,
        /// The size available
        limit: u64,
        /// What imposes the limit
        what: String,
    },

    /// Inspecting the existing partitions failed.
    #[error("Failed to inspect partitions of {device}")]
    Probe {
        /// The target device
        device: Utf8PathBuf,
        /// Underlying error
        #[source]
        source: BoxedError,
    },

    /// Creating the config drive partition, or finding it afterwards, failed.
    #[error("Failed to allocate a {size_mib}MiB config drive partition on {device}")]
    Allocation {
        /// The target device
        device: Utf8PathBuf,
        /// The requested partition size
        size_mib: u64,
        /// Underlying error
        #[source]
        source: BoxedError,
    },

    /// Copying the payload to the partition failed.
    #[error("Failed to write {src} to {destination}{}", fmt_offset(.offset))]
    Write {
        /// The payload
        src: Utf8PathBuf,
        /// The partition node
        destination: Utf8PathBuf,
        /// Byte offset of the failed operation, when known
        offset: Option<u64>,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

fn fmt_offset(offset: &Option<u64>) -> String {
    offset
        .map(|o| format!(" at byte offset {o}"))
        .unwrap_or_default()
}

impl ConfigDriveError {
    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    pub(crate) fn allocation(
        device: impl Into<Utf8PathBuf>,
        size_mib: u64,
        source: anyhow::Error,
    ) -> Self {
        Self::Allocation {
            device: device.into(),
            size_mib,
            source: source.into(),
        }
    }

    pub(crate) fn probe(device: impl Into<Utf8PathBuf>, source: anyhow::Error) -> Self {
        Self::Probe {
            device: device.into(),
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = ConfigDriveError::Write {
            src: "/tmp/configdrive".into(),
            destination: "/dev/sda4".into(),
            offset: Some(65536),
            source: std::io::Error::other("disk on fire"),
        };
        assert_eq!(
            e.to_string(),
            "Failed to write /tmp/configdrive to /dev/sda4 at byte offset 65536"
        );
        let e = ConfigDriveError::Write {
            src: "/tmp/configdrive".into(),
            destination: "/dev/sda4".into(),
            offset: None,
            source: std::io::Error::other("disk on fire"),
        };
        assert_eq!(
            e.to_string(),
            "Failed to write /tmp/configdrive to /dev/sda4"
        );
    }

    #[test]
    fn test_chain() {
        let e = ConfigDriveError::allocation(
            "/dev/sda",
            67,
            anyhow::anyhow!("No space left").context("Running parted"),
        );
        let e = anyhow::Error::from(e);
        assert_eq!(
            format!("{e:#}"),
            "Failed to allocate a 67MiB config drive partition on /dev/sda: Running parted: No space left"
        );
    }
}
