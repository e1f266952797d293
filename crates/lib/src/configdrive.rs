//! # Writing a config drive to a block device
//!
//! The sequence is:
//!
//! - Validate the inputs; this happens when building [`Payload`] and
//!   [`BlockDevice`], so by the time we get here nothing is left to check.
//! - Rescan the partition table and look for a partition labelled
//!   `config-2`. If there is one, it is overwritten in place.
//! - Otherwise create a partition at the end of the device, sized
//!   according to the [`SizePolicy`], and find its node.
//! - Copy the payload onto the partition.
//!
//! Any failure ends the run. A partition created by a run that later
//! fails is left behind without a label; the next run can't recognize
//! it and will allocate another one.

use camino::{Utf8Path, Utf8PathBuf};

use crate::allocate::{self, SizePolicy};
use crate::error::ConfigDriveError;
use crate::ops::DiskOps;
use crate::payload::{BlockDevice, Payload};
use crate::probe;
use crate::write::WriteOptions;

/// Knobs for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    /// Size of a newly created partition
    pub size_policy: SizePolicy,
    /// How the image is copied
    pub write: WriteOptions,
}

/// Where the payload was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A config drive partition that already existed
    Existing(Utf8PathBuf),
    /// A partition created by this run
    Created {
        /// The new partition's node
        node: Utf8PathBuf,
        /// Its requested size
        size_mib: u64,
    },
}

impl Target {
    /// The partition device node.
    pub fn path(&self) -> &Utf8Path {
        match self {
            Target::Existing(node) => node,
            Target::Created { node, .. } => node,
        }
    }
}

/// Write `payload` onto the config drive partition of `device`, creating
/// that partition if necessary.
pub fn write_configdrive(
    ops: &mut impl DiskOps,
    payload: &Payload,
    device: &BlockDevice,
    opts: &Options,
) -> Result<Target, ConfigDriveError> {
    opts.size_policy.check(payload)?;
    let dev = device.path();

    probe::rescan(ops, dev);
    let target = match probe::find_existing(ops, dev)? {
        Some(existing) => {
            if payload.len() > existing.size {
                return Err(ConfigDriveError::TooLarge {
                    path: payload.path().to_owned(),
                    size: payload.len(),
                    limit: existing.size,
                    what: format!("existing config drive {}", existing.node),
                });
            }
            Target::Existing(existing.node)
        }
        None => {
            let size_mib = opts.size_policy.size_mib(payload.len());
            let node = allocate::allocate(ops, dev, size_mib)?;
            Target::Created { node, size_mib }
        }
    };

    ops.write_image(payload, target.path(), &opts.write)?;
    tracing::info!("{dev} imaged successfully!");
    Ok(target)
}
