//! Device and pool constants.
//!
//! # Design Decisions
//!
//! The sector size is fixed at 512 bytes: removable mass-storage drives are
//! formatted FAT with 512-byte sectors, and the partial writer's offset math
//! relies on the filesystem's minimum and maximum sector size being equal to
//! the device write unit. The binder re-asserts this against the mounted
//! volume's geometry at runtime.
//!
//! All structural invariants are verified at compile time via `const`
//! assertions.

use std::time::Duration;

/// Block-device write unit in bytes. Also the FAT volume's only legal
/// sector size; [`crate::partial_file::PartialFile`] refuses volumes that
/// disagree.
pub const SECTOR_SIZE: usize = 512;

/// Number of sector buffers in the pool, i.e. the maximum number of writes
/// that may be producer-held or in flight at once.
///
/// Must be strictly smaller than the width of the pool's `u64` slot mask so
/// the bits at and above `POOL_SLOTS` can be kept permanently set and the
/// lowest-clear-bit scan can never select a nonexistent slot.
pub const POOL_SLOTS: usize = 32;

/// Upper bound on any single wait for a sector buffer or for in-flight
/// writes to drain. Mirrors the mass-storage read/write timeout of the
/// block-device layer; a wait that exceeds it is reported as a write
/// failure rather than blocking the producer forever.
pub const DEVICE_RW_TIMEOUT: Duration = Duration::from_secs(10);

/// Width of the textual progress bar emitted when the valid percentage
/// changes.
pub const PROGRESS_BAR_WIDTH: usize = 40;

const _: () = {
    assert!(SECTOR_SIZE.is_power_of_two());
    assert!(SECTOR_SIZE == 512, "FAT removable media use 512-byte sectors");

    assert!(POOL_SLOTS > 0);
    assert!(
        POOL_SLOTS < u64::BITS as usize,
        "slot mask must have spare high bits"
    );

    assert!(PROGRESS_BAR_WIDTH > 0);
};
