use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use configdrive_utils::CommandRunExt;

/// One mebibyte; partition sizes handed to parted are expressed in this unit.
pub const MIB: u64 = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// A node in `lsblk --json` output.
#[derive(Debug, Deserialize)]
pub struct Device {
    pub name: String,
    pub children: Option<Vec<Device>>,
    pub size: u64,
    /// Filesystem label
    pub label: Option<String>,
    pub path: Option<String>,
}

impl Device {
    // Older lsblk doesn't have PATH, so we do it
    pub fn path(&self) -> String {
        self.path.clone().unwrap_or(format!("/dev/{}", &self.name))
    }

    /// Depth-first search of the children for a filesystem with the given label.
    /// The device itself is not considered.
    pub fn find_child_by_label(&self, label: &str) -> Option<&Device> {
        self.children.iter().flatten().find_map(|child| {
            if child.label.as_deref() == Some(label) {
                Some(child)
            } else {
                child.find_child_by_label(label)
            }
        })
    }
}

#[context("Listing device {dev}")]
pub fn list_dev(dev: &Utf8Path) -> Result<Device> {
    let devs: DevicesOutput = Command::new("lsblk")
        .args(["-J", "-b", "-O"])
        .arg(dev)
        .log_debug()
        .run_and_parse_json()?;
    devs.blockdevices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no device output from lsblk for {dev}"))
}

#[derive(Debug, Deserialize)]
struct SfDiskOutput {
    partitiontable: PartitionTable,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Partition {
    pub node: String,
    /// In units of the table's sector size
    pub start: u64,
    /// In units of the table's sector size
    pub size: u64,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionType {
    Dos,
    Gpt,
    /// sun, sgi and whatever else sfdisk knows about
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct PartitionTable {
    pub label: PartitionType,
    pub device: String,
    pub sectorsize: Option<u64>,
    // Only present for GPT
    pub lastlba: Option<u64>,
    #[serde(default)]
    pub partitions: Vec<Partition>,
}

impl PartitionTable {
    pub fn path(&self) -> &Utf8Path {
        self.device.as_str().into()
    }

    /// Entries that actually occupy space on the device.
    pub fn non_empty(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter().filter(|p| p.size > 0)
    }

    /// The last partition in table order, ignoring empty slots.
    pub fn last_non_empty(&self) -> Option<&Partition> {
        self.non_empty().last()
    }

    /// Non-empty partitions in this table whose node was empty or absent in `before`.
    pub fn added_since<'a>(&'a self, before: &PartitionTable) -> Vec<&'a Partition> {
        self.non_empty()
            .filter(|p| before.non_empty().all(|b| b.node != p.node))
            .collect()
    }

    /// Sector size in bytes; sfdisk omits it for some table types, where it is 512.
    pub fn sector_size(&self) -> u64 {
        self.sectorsize.unwrap_or(512)
    }
}

impl Partition {
    pub fn path(&self) -> &Utf8Path {
        self.node.as_str().into()
    }

    /// One past the last sector of this partition.
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

#[context("Listing partitions of {dev}")]
pub fn partitions_of(dev: &Utf8Path) -> Result<PartitionTable> {
    let o: SfDiskOutput = Command::new("sfdisk")
        .args(["-J", dev.as_str()])
        .log_debug()
        .run_and_parse_json()?;
    Ok(o.partitiontable)
}

/// Ask the kernel to pick up partitions added or changed on `dev`
/// using `partx --update`.
#[context("Updating kernel partition table of {dev} via partx")]
pub fn partx_update(dev: &Utf8Path) -> Result<()> {
    Command::new("partx")
        .args(["-u", dev.as_str()])
        .log_debug()
        .run_capture_stderr()
}

/// Ask the kernel to re-read the partition table of `dev` using `partprobe`.
#[context("Re-reading partition table of {dev} via partprobe")]
pub fn partprobe(dev: &Utf8Path) -> Result<()> {
    Command::new("partprobe")
        .arg(dev.as_str())
        .log_debug()
        .run_capture_stderr()
}

/// Wait for udev to finish processing queued events, so that
/// properties such as filesystem labels are current.
#[context("Waiting for udev to settle")]
pub fn udev_settle() -> Result<()> {
    Command::new("udevadm")
        .arg("settle")
        .log_debug()
        .run_capture_stderr()
}

/// Create a new primary partition of `size_mib` MiB that ends at the end of `dev`,
/// letting parted choose an optimally aligned start.
#[context("Creating {size_mib}MiB partition at the end of {dev}")]
pub fn create_partition_at_end(dev: &Utf8Path, fstype: &str, size_mib: u64) -> Result<()> {
    let start = format!("-{size_mib}MiB");
    Command::new("parted")
        .args(["-a", "optimal", "-s", "--", dev.as_str(), "mkpart", "primary"])
        .args([fstype, start.as_str(), "-0"])
        .log_debug()
        .run_capture_stderr()
}

/// A file attached as a loop device, detached again on drop.
#[derive(Debug)]
pub struct LoopbackDevice {
    pub dev: Option<Utf8PathBuf>,
}

impl LoopbackDevice {
    // Create a new loopback block device targeting the provided file path.
    // Partition scanning is enabled so that partitions show up as pN nodes.
    pub fn new(path: &Path, direct_io: bool) -> Result<Self> {
        let direct_io = if direct_io { "on" } else { "off" };
        let dev = Command::new("losetup")
            .args([
                "--show",
                format!("--direct-io={direct_io}").as_str(),
                "-P",
                "--find",
            ])
            .arg(path)
            .log_debug()
            .run_get_string()?;
        let dev = Utf8PathBuf::from(dev.trim());
        tracing::debug!("Allocated loopback {dev}");
        Ok(Self { dev: Some(dev) })
    }

    // Access the path to the loopback block device.
    pub fn path(&self) -> &Utf8Path {
        // SAFETY: The option cannot be destructured until we are dropped
        self.dev.as_deref().unwrap()
    }

    // Detach the device, at most once.
    fn impl_close(&mut self) -> Result<()> {
        let Some(dev) = self.dev.take() else {
            tracing::trace!("loopback device already deallocated");
            return Ok(());
        };
        Command::new("losetup")
            .args(["-d", dev.as_str()])
            .run_capture_stderr()
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        // Best effort
        let _ = self.impl_close();
    }
}

/// Parse a string into mibibytes
pub fn parse_size_mib(mut s: &str) -> Result<u64> {
    let suffixes = [
        ("MiB", 1u64),
        ("M", 1u64),
        ("GiB", 1024),
        ("G", 1024),
        ("TiB", 1024 * 1024),
        ("T", 1024 * 1024),
    ];
    let mut mul = 1u64;
    for (suffix, imul) in suffixes {
        if let Some((sv, rest)) = s.rsplit_once(suffix) {
            if !rest.is_empty() {
                anyhow::bail!("Trailing text after size: {rest}");
            }
            s = sv;
            mul = imul;
            break;
        }
    }
    let v = s
        .trim()
        .parse::<u64>()
        .with_context(|| format!("Parsing size {s:?}"))?;
    v.checked_mul(mul)
        .ok_or_else(|| anyhow!("Size overflows: {s}"))
}
