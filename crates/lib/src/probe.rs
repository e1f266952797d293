//! Finding an existing config drive partition.

use camino::Utf8Path;

use crate::blockdev::{PartitionTable, MIB};
use crate::error::ConfigDriveError;
use crate::ops::{DiskOps, LabeledPartition};

/// The filesystem label identifying a config drive.
pub const CONFIG_DRIVE_LABEL: &str = "config-2";

/// A rescan mechanism that failed. Never fatal: the worst outcome is a
/// stale view of the partition table.
#[derive(Debug)]
pub struct ProbeWarning {
    /// Which mechanism failed
    pub mechanism: &'static str,
    /// Why
    pub error: anyhow::Error,
}

/// Result of asking the kernel to re-read the partition table.
#[derive(Debug)]
pub enum RescanOutcome {
    /// Both mechanisms succeeded.
    Refreshed,
    /// The primary mechanism worked, the secondary did not.
    SecondaryFailed(ProbeWarning),
    /// The primary mechanism failed and the secondary took over.
    FellBack(ProbeWarning),
    /// Neither mechanism worked; partitions may not be visible.
    Stale {
        /// Failure of the primary mechanism
        primary: ProbeWarning,
        /// Failure of the secondary mechanism
        secondary: ProbeWarning,
    },
}

impl RescanOutcome {
    /// All failures encountered.
    pub fn warnings(&self) -> Vec<&ProbeWarning> {
        match self {
            RescanOutcome::Refreshed => Vec::new(),
            RescanOutcome::SecondaryFailed(w) | RescanOutcome::FellBack(w) => vec![w],
            RescanOutcome::Stale { primary, secondary } => vec![primary, secondary],
        }
    }

    fn log(&self, dev: &Utf8Path) {
        for w in self.warnings() {
            tracing::warn!("{} failed on {dev} (ignored): {:#}", w.mechanism, w.error);
        }
        if matches!(self, RescanOutcome::Stale { .. }) {
            tracing::warn!("Partition table of {dev} may be stale");
        }
    }
}

/// Make freshly written partitions visible: `partx -u`, then `partprobe`
/// (also the fallback when `partx` fails), then wait for udev.
pub fn rescan(ops: &mut impl DiskOps, dev: &Utf8Path) -> RescanOutcome {
    let warn = |mechanism, error| ProbeWarning { mechanism, error };
    let primary = ops.rescan_primary(dev).map_err(|e| warn("partx", e));
    let secondary = ops.rescan_secondary(dev).map_err(|e| warn("partprobe", e));
    let outcome = match (primary, secondary) {
        (Ok(()), Ok(())) => RescanOutcome::Refreshed,
        (Ok(()), Err(s)) => RescanOutcome::SecondaryFailed(s),
        (Err(p), Ok(())) => RescanOutcome::FellBack(p),
        (Err(primary), Err(secondary)) => RescanOutcome::Stale { primary, secondary },
    };
    outcome.log(dev);
    if let Err(e) = ops.settle() {
        tracing::warn!("{e:#}");
    }
    outcome
}

/// Look for an existing config drive partition on `dev`.
pub fn find_existing(
    ops: &mut impl DiskOps,
    dev: &Utf8Path,
) -> Result<Option<LabeledPartition>, ConfigDriveError> {
    let found = ops
        .find_labeled(dev, CONFIG_DRIVE_LABEL)
        .map_err(|e| ConfigDriveError::probe(dev, e))?;
    if let Some(part) = found.as_ref() {
        tracing::info!("Existing configdrive found on {dev} at {}", part.node);
    }
    Ok(found)
}

/// Whether the last partition looks like one we created in an earlier run
/// that failed before the image was written: unlabelled (the caller knows
/// nothing is labelled) and flush with the end of the disk.
///
/// This can't be told apart from a real data partition, so it is only
/// ever reported.
pub fn possible_residue(table: &PartitionTable) -> Option<&str> {
    let lastlba = table.lastlba?;
    let last = table.last_non_empty()?;
    // parted aligns the start, and may leave up to one alignment unit at the end
    let slack = MIB / table.sector_size();
    (last.end() + slack > lastlba).then_some(last.node.as_str())
}

#[cfg(test)]
mod tests {
    use crate::blockdev::{Partition, PartitionType};

    use super::*;

    fn table(parts: &[(u64, u64)]) -> PartitionTable {
        PartitionTable {
            label: PartitionType::Gpt,
            device: "/dev/vda".into(),
            sectorsize: Some(512),
            lastlba: Some(20971486),
            partitions: parts
                .iter()
                .enumerate()
                .map(|(i, &(start, size))| Partition {
                    node: format!("/dev/vda{}", i + 1),
                    start,
                    size,
                })
                .collect(),
        }
    }

    #[test]
    fn test_residue() {
        // Root filesystem only, free space after it
        assert_eq!(possible_residue(&table(&[(2048, 8388608)])), None);
        // A 64MiB partition at the very end
        assert_eq!(
            possible_residue(&table(&[(2048, 8388608), (20838400, 131072)])),
            Some("/dev/vda2")
        );
        // Root grown to fill the disk (ends at lastlba, 20971486)
        assert_eq!(
            possible_residue(&table(&[(2048, 20969439)])),
            Some("/dev/vda1")
        );
        assert_eq!(possible_residue(&table(&[])), None);
        let mut dos = table(&[(2048, 20969439)]);
        dos.lastlba = None;
        assert_eq!(possible_residue(&dos), None);
    }

    #[test]
    fn test_outcome_warnings() {
        let w = |m| ProbeWarning {
            mechanism: m,
            error: anyhow::anyhow!("oops"),
        };
        assert!(RescanOutcome::Refreshed.warnings().is_empty());
        assert_eq!(RescanOutcome::FellBack(w("partx")).warnings().len(), 1);
        let stale = RescanOutcome::Stale {
            primary: w("partx"),
            secondary: w("partprobe"),
        };
        let names: Vec<_> = stale.warnings().iter().map(|w| w.mechanism).collect();
        assert_eq!(names, ["partx", "partprobe"]);
    }
}
