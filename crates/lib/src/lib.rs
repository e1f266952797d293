//! # Writing config drives to block devices
//!
//! A config drive is a small filesystem image carrying instance metadata,
//! read by a freshly provisioned machine on first boot. This crate puts one
//! onto the last partition of a disk that has just been imaged with an
//! operating system, reusing an existing `config-2` partition when there
//! is one.

mod allocate;
pub mod cli;
mod configdrive;
mod error;
mod ops;
mod payload;
mod probe;
mod write;

pub use allocate::{size_mib_for_payload, SizePolicy, DEFAULT_FIXED_SIZE_MIB};
pub use configdrive::{write_configdrive, Options, Target};
pub use error::ConfigDriveError;
pub use ops::{DiskOps, HostDisk, LabeledPartition};
pub use payload::{unpack_encoded, unpack_gzip, BlockDevice, Payload, UnpackedPayload, MAX_UNPACKED_SIZE};
pub use probe::{rescan, ProbeWarning, RescanOutcome, CONFIG_DRIVE_LABEL};
pub use write::{write_image, WriteOptions, CHUNK_SIZE};

// Re-export blockdev crate for internal use
pub(crate) use configdrive_blockdev as blockdev;
