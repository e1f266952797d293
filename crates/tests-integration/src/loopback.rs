use std::io::Read;

use anyhow::{ensure, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use configdrive_blockdev::{partitions_of, LoopbackDevice, PartitionTable, MIB};
use fn_error_context::context;
use libtest_mimic::Trial;
use xshell::{cmd, Shell};

/// Size of the fake disks
const DISK_SIZE: u64 = 256 * MIB;

/// A sparse disk image attached as a loop device with an "OS" already on it:
/// a GPT with a single root partition and free space after it.
struct TestDisk {
    // Dropped before the backing file
    loopdev: LoopbackDevice,
    _td: tempfile::TempDir,
}

impl TestDisk {
    #[context("Creating test disk")]
    fn new(sh: &Shell) -> Result<Self> {
        let td = tempfile::tempdir()?;
        let img = td.path().join("disk.img");
        let f = std::fs::File::create(&img)?;
        f.set_len(DISK_SIZE)?;
        drop(f);
        let loopdev = LoopbackDevice::new(&img, false)?;
        let dev = loopdev.path();
        cmd!(sh, "parted -s {dev} mklabel gpt mkpart root ext4 1MiB 128MiB").run()?;
        cmd!(sh, "partx -u {dev}").run()?;
        Ok(Self { loopdev, _td: td })
    }

    fn path(&self) -> &Utf8Path {
        self.loopdev.path()
    }

    fn table(&self) -> Result<PartitionTable> {
        partitions_of(self.path())
    }
}

fn payload(td: &tempfile::TempDir, len: usize) -> Result<(Utf8PathBuf, Vec<u8>)> {
    let data: Vec<u8> = (0..len).map(|v| (v % 241) as u8).collect();
    let p = Utf8PathBuf::try_from(td.path().join("configdrive"))?;
    std::fs::write(&p, &data)?;
    Ok((p, data))
}

fn read_back(node: &Utf8Path, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    std::fs::File::open(node)
        .with_context(|| format!("Opening {node}"))?
        .read_exact(&mut buf)?;
    Ok(buf)
}

/// Check that a partition of `size` sectors is the `mib` MiB partition we asked
/// parted for; it may shave off the tail to fit the backup GPT.
fn ensure_size_mib(table: &PartitionTable, size: u64, mib: u64) -> Result<()> {
    let bytes = size * table.sector_size();
    ensure!(
        bytes > (mib - 1) * MIB && bytes <= mib * MIB,
        "Expected a {mib}MiB partition, found {bytes} bytes"
    );
    Ok(())
}

fn test_allocate(tool: &Utf8Path) -> Result<()> {
    let sh = &Shell::new()?;
    let disk = TestDisk::new(sh)?;
    let dev = disk.path();
    let td = tempfile::tempdir()?;
    // 3MiB and a bit, so a 4MiB partition
    let (cd, data) = payload(&td, 3 * MIB as usize + 1234)?;

    cmd!(sh, "{tool} {cd} {dev}").run()?;

    let table = disk.table()?;
    ensure!(table.non_empty().count() == 2, "{table:?}");
    let part = table.last_non_empty().context("No partitions")?;
    ensure_size_mib(&table, part.size, 4)?;
    similar_bytes(&read_back(part.path(), data.len())?, &data)
}

fn test_existing(tool: &Utf8Path) -> Result<()> {
    let sh = &Shell::new()?;
    let disk = TestDisk::new(sh)?;
    let dev = disk.path();
    cmd!(sh, "parted -s -- {dev} mkpart primary ext2 -32MiB -0").run()?;
    cmd!(sh, "partx -u {dev}").run()?;
    let existing = disk
        .table()?
        .last_non_empty()
        .context("No partitions")?
        .path()
        .to_owned();
    cmd!(sh, "mkfs.ext4 -q -L config-2 {existing}").run()?;
    cmd!(sh, "udevadm settle").run()?;

    let td = tempfile::tempdir()?;
    let (cd, data) = payload(&td, 1024 * 1024)?;
    cmd!(sh, "{tool} {cd} {dev}").run()?;

    let table = disk.table()?;
    ensure!(table.non_empty().count() == 2, "{table:?}");
    similar_bytes(&read_back(&existing, data.len())?, &data)
}

fn test_fixed_size(tool: &Utf8Path) -> Result<()> {
    let sh = &Shell::new()?;
    let disk = TestDisk::new(sh)?;
    let dev = disk.path();
    let td = tempfile::tempdir()?;
    let (cd, data) = payload(&td, 4096)?;

    cmd!(sh, "{tool} --fixed-size {cd} {dev}").run()?;

    let table = disk.table()?;
    let part = table.last_non_empty().context("No partitions")?;
    ensure_size_mib(&table, part.size, 64)?;
    similar_bytes(&read_back(part.path(), data.len())?, &data)
}

fn test_not_a_blockdev(tool: &Utf8Path) -> Result<()> {
    let sh = &Shell::new()?;
    let td = tempfile::tempdir()?;
    let (cd, _) = payload(&td, 4096)?;
    let r = cmd!(sh, "{tool} {cd} {cd}").ignore_status().output()?;
    ensure!(r.status.code() == Some(1), "{:?}", r.status);
    let stderr = String::from_utf8_lossy(&r.stderr);
    ensure!(stderr.contains("(DEVICE) is not a block device"), "{stderr}");
    Ok(())
}

fn test_disk_full(tool: &Utf8Path) -> Result<()> {
    let sh = &Shell::new()?;
    let disk = TestDisk::new(sh)?;
    let dev = disk.path();
    cmd!(sh, "parted -s {dev} mkpart data ext4 128MiB 100%").run()?;
    cmd!(sh, "partx -u {dev}").run()?;
    let before = disk.table()?.non_empty().count();
    let td = tempfile::tempdir()?;
    let (cd, _) = payload(&td, 4096)?;

    let r = cmd!(sh, "{tool} {cd} {dev}").ignore_status().output()?;
    ensure!(r.status.code() == Some(1), "{:?}", r.status);
    let stderr = String::from_utf8_lossy(&r.stderr);
    ensure!(stderr.contains("Failed to allocate"), "{stderr}");
    ensure!(disk.table()?.non_empty().count() == before);
    Ok(())
}

pub(crate) fn run(tool: &Utf8Path, testargs: libtest_mimic::Arguments) -> Result<()> {
    // Just leak the path so we get a static reference as required by the test framework
    let tool: &'static Utf8Path = Utf8Path::new(String::from(tool.as_str()).leak());

    let tests = [
        Trial::test("allocates and writes a new partition", move || {
            Ok(test_allocate(tool)?)
        }),
        Trial::test("overwrites an existing config drive", move || {
            Ok(test_existing(tool)?)
        }),
        Trial::test("fixed size partition", move || Ok(test_fixed_size(tool)?)),
        Trial::test("rejects a regular file as the device", move || {
            Ok(test_not_a_blockdev(tool)?)
        }),
        Trial::test("fails when the disk is full", move || {
            Ok(test_disk_full(tool)?)
        }),
    ];

    libtest_mimic::run(&testargs, tests.into()).exit()
}

fn similar_bytes(found: &[u8], expected: &[u8]) -> Result<()> {
    ensure!(found.len() == expected.len(), "Length mismatch");
    if let Some(pos) = found.iter().zip(expected).position(|(a, b)| a != b) {
        anyhow::bail!("Content differs at byte offset {pos}");
    }
    Ok(())
}
