//! Resumable partial-file writer for FAT-formatted removable drives.
//!
//! Accepts an unordered, possibly sparse stream of byte ranges destined for
//! a single pre-allocated file and commits them with raw sector writes,
//! bypassing the filesystem on the data path. Tracks which bytes are
//! durable so an interrupted download can resume without refetching them.
//!
//! Entry points: [`PartialFile::create`] and [`PartialFile::open`], over
//! implementations of the [`Volume`] and [`BlockDevice`] seams.

pub mod constants;
pub mod device;
pub mod partial_file;
pub mod pool;
pub mod test_utils;
pub mod valid_range;
pub mod volume;

// Re-exports for convenient access
pub use device::{BlockDevice, SubmitError, WriteStatus};
pub use partial_file::{OpenError, Options, PartialFile};
pub use pool::{PooledSector, SectorPool, SectorWrite};
pub use valid_range::{State, ValidPart};
pub use volume::{AllocError, FileLock, Volume, VolumeFile, VolumeGeometry};
