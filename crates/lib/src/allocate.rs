//! Creating the config drive partition at the end of the device.

use anyhow::anyhow;
use camino::{Utf8Path, Utf8PathBuf};

use crate::blockdev::{Partition, PartitionTable, MIB};
use crate::error::ConfigDriveError;
use crate::ops::DiskOps;
use crate::payload::Payload;
use crate::probe;

/// Partition size used by [`SizePolicy::Fixed`] unless overridden.
pub const DEFAULT_FIXED_SIZE_MIB: u64 = 64;

/// How large a newly created config drive partition is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SizePolicy {
    /// Just large enough for the payload.
    #[default]
    Payload,
    /// A fixed number of MiB, regardless of the payload.
    Fixed(u64),
}

/// Whole MiB needed for `bytes`, always rounding up; at least 1.
pub fn size_mib_for_payload(bytes: u64) -> u64 {
    bytes / MIB + 1
}

impl SizePolicy {
    /// Partition size in MiB for a payload of `bytes`.
    pub fn size_mib(&self, bytes: u64) -> u64 {
        match *self {
            SizePolicy::Payload => size_mib_for_payload(bytes),
            SizePolicy::Fixed(mib) => mib,
        }
    }

    /// Reject a payload that can't fit a partition created under this policy.
    pub fn check(&self, payload: &Payload) -> Result<(), ConfigDriveError> {
        match *self {
            SizePolicy::Payload => Ok(()),
            SizePolicy::Fixed(mib) => {
                let limit = mib.saturating_mul(MIB);
                if payload.len() > limit {
                    return Err(ConfigDriveError::TooLarge {
                        path: payload.path().to_owned(),
                        size: payload.len(),
                        limit,
                        what: format!("a fixed {mib}MiB partition"),
                    });
                }
                Ok(())
            }
        }
    }
}

/// Pick the partition that was just created, comparing the table from
/// before creation with the one after it.
///
/// A single new node identifies it directly. Otherwise, the last
/// non-empty entry in table order is assumed to be the new one, which
/// is only correct if nothing else changed the table in the meantime.
pub fn resolve_new_partition<'a>(
    before: &PartitionTable,
    after: &'a PartitionTable,
) -> Option<&'a Partition> {
    match after.added_since(before).as_slice() {
        [new] => Some(*new),
        added => {
            tracing::warn!(
                "Expected one new partition on {}, found {}; using the last one",
                after.path(),
                added.len()
            );
            after.last_non_empty()
        }
    }
}

/// Create a `size_mib` MiB partition at the end of `dev` and return its node.
pub fn allocate(
    ops: &mut impl DiskOps,
    dev: &Utf8Path,
    size_mib: u64,
) -> Result<Utf8PathBuf, ConfigDriveError> {
    let err = |e| ConfigDriveError::allocation(dev, size_mib, e);
    let before = ops.partition_table(dev).map_err(err)?;
    if let Some(node) = probe::possible_residue(&before) {
        tracing::warn!(
            "{node} ends at the end of {dev} but has no config drive label; \
             it may be left over from an earlier failed run"
        );
    }

    tracing::info!("Adding configdrive partition of {size_mib}MiB to {dev}");
    ops.create_partition(dev, size_mib).map_err(err)?;

    // parted notifies the kernel itself, but make sure the node exists
    // before we go looking for it.
    probe::rescan(ops, dev);
    let after = ops.partition_table(dev).map_err(err)?;
    let part = resolve_new_partition(&before, &after)
        .ok_or_else(|| err(anyhow!("No partition found after creating one")))?;
    tracing::debug!("Created {} at sector {}", part.node, part.start);
    Ok(part.path().to_owned())
}
