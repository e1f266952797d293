//! The operations the protocol needs from the host: rescanning and
//! listing partitions, creating one, and copying the image.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::blockdev::{self, PartitionTable};
use crate::error::ConfigDriveError;
use crate::payload::Payload;
use crate::write::WriteOptions;

/// A partition carrying a filesystem label, as found by [`DiskOps::find_labeled`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledPartition {
    /// The partition's device node
    pub node: Utf8PathBuf,
    /// Size in bytes
    pub size: u64,
}

/// Everything done to the target device goes through here.
pub trait DiskOps {
    /// The primary partition table rescan mechanism.
    fn rescan_primary(&mut self, dev: &Utf8Path) -> Result<()>;

    /// The secondary partition table rescan mechanism.
    fn rescan_secondary(&mut self, dev: &Utf8Path) -> Result<()>;

    /// Wait for device events triggered by a rescan to be processed.
    fn settle(&mut self) -> Result<()>;

    /// Find a partition of `dev` whose filesystem carries `label`.
    fn find_labeled(&mut self, dev: &Utf8Path, label: &str) -> Result<Option<LabeledPartition>>;

    /// Read the partition table of `dev`.
    fn partition_table(&mut self, dev: &Utf8Path) -> Result<PartitionTable>;

    /// Create a primary partition of `size_mib` MiB ending at the end of `dev`.
    fn create_partition(&mut self, dev: &Utf8Path, size_mib: u64) -> Result<()>;

    /// Copy the payload to the start of `dest`.
    fn write_image(
        &mut self,
        payload: &Payload,
        dest: &Utf8Path,
        opts: &WriteOptions,
    ) -> Result<(), ConfigDriveError>;
}

/// Filesystem type hint handed to parted; it only influences the
/// partition type, no filesystem is created.
const PARTITION_FS_HINT: &str = "ext2";

/// [`DiskOps`] backed by the util-linux, parted and udev tools on this host.
#[derive(Debug, Default)]
pub struct HostDisk;

impl DiskOps for HostDisk {
    fn rescan_primary(&mut self, dev: &Utf8Path) -> Result<()> {
        blockdev::partx_update(dev)
    }

    fn rescan_secondary(&mut self, dev: &Utf8Path) -> Result<()> {
        blockdev::partprobe(dev)
    }

    fn settle(&mut self) -> Result<()> {
        blockdev::udev_settle()
    }

    fn find_labeled(&mut self, dev: &Utf8Path, label: &str) -> Result<Option<LabeledPartition>> {
        let device = blockdev::list_dev(dev)?;
        Ok(device
            .find_child_by_label(label)
            .map(|part| LabeledPartition {
                node: part.path().into(),
                size: part.size,
            }))
    }

    fn partition_table(&mut self, dev: &Utf8Path) -> Result<PartitionTable> {
        blockdev::partitions_of(dev)
    }

    fn create_partition(&mut self, dev: &Utf8Path, size_mib: u64) -> Result<()> {
        blockdev::create_partition_at_end(dev, PARTITION_FS_HINT, size_mib)
    }

    fn write_image(
        &mut self,
        payload: &Payload,
        dest: &Utf8Path,
        opts: &WriteOptions,
    ) -> Result<(), ConfigDriveError> {
        crate::write::write_image(payload, dest, opts).map(|_| ())
    }
}
