//! Filesystem trait seam and FAT volume geometry.
//!
//! The writer bypasses the filesystem on the data path, but leans on it for
//! everything around the data path: creating and sizing the backing file,
//! probing that it occupies one contiguous run of clusters, translating the
//! first cluster into an absolute sector number, and holding a read-only
//! handle that pins the allocation in place. These narrow traits are all
//! the writer consumes; a FAT driver implements them on real hardware and
//! the test suite substitutes an in-memory volume.

use std::io;

use thiserror::Error;

/// Geometry of a mounted FAT volume, captured once at bind time.
#[derive(Clone, Copy, Debug)]
pub struct VolumeGeometry {
    /// Smallest sector size the filesystem driver was built for.
    pub sector_size_min: usize,
    /// Largest sector size the filesystem driver was built for.
    pub sector_size_max: usize,
    /// Absolute LBA where the volume's data area (cluster 2) begins.
    pub data_area_lba: u64,
    /// Sectors per allocation cluster.
    pub cluster_sectors: u32,
    /// Logical unit of the drive on the mass-storage bus.
    pub lun: u8,
}

impl VolumeGeometry {
    /// Absolute LBA of the first sector of `cluster`.
    ///
    /// The classical FAT layout: cluster numbering starts at 2, directly at
    /// the data area base.
    ///
    /// # Panics
    ///
    /// Panics when `cluster < 2` (reserved FAT entries are not addressable
    /// data).
    pub fn first_lba_of_cluster(&self, cluster: u32) -> u64 {
        assert!(cluster >= 2, "FAT data clusters start at 2");
        assert!(self.cluster_sectors > 0);
        self.data_area_lba + self.cluster_sectors as u64 * (cluster as u64 - 2)
    }
}

/// Why a contiguous pre-allocation failed.
#[derive(Debug, Error)]
pub enum AllocError {
    /// The volume has too few free clusters.
    #[error("volume out of space")]
    Full,
    /// Any other filesystem failure.
    #[error("allocation failed: {0}")]
    Io(#[from] io::Error),
}

/// Path-level operations of the mounted volume.
pub trait Volume {
    type File: VolumeFile;
    type Lock: FileLock;

    fn geometry(&self) -> VolumeGeometry;

    /// Opens `path` for writing, truncating or creating it.
    fn create(&self, path: &str) -> io::Result<Self::File>;

    /// Opens an existing `path` for reading and writing, without
    /// truncation.
    fn open_rw(&self, path: &str) -> io::Result<Self::File>;

    fn remove(&self, path: &str) -> io::Result<()>;

    /// Reopens `path` read-only as a lock handle that pins the file's
    /// clusters for the handle's lifetime.
    ///
    /// Callers close their read-write handle first, so there is a window in
    /// which another actor may delete and recreate the path; the runtime
    /// offers no atomic reopen of the same inode. [`FileLock::poke`] is the
    /// mitigation on every submission.
    fn lock(&self, path: &str) -> io::Result<Self::Lock>;
}

/// The filesystem-level file object behind an open handle.
pub trait VolumeFile {
    /// Eagerly allocates `size` bytes as one contiguous cluster run.
    /// Sectors are committed now, not on first write.
    fn allocate_contiguous(&mut self, size: u64) -> Result<(), AllocError>;

    /// Probes whether the file occupies consecutively numbered clusters.
    fn is_contiguous(&self) -> io::Result<bool>;

    /// Current file size in bytes, authoritative for `State::total_size`.
    fn size(&self) -> u64;

    /// First cluster of the file's allocation chain.
    fn first_cluster(&self) -> u32;
}

/// Read-only handle pinning a file's allocation in place.
pub trait FileLock {
    /// Revalidates the handle with a read-position operation (the rewind
    /// form, since position queries may shortcut without touching the
    /// medium).
    ///
    /// Returns `false` when the handle no longer refers to a live file: it
    /// was unlinked, or the drive was swapped for another bearing the same
    /// path. Raw sector writes must not be issued past a failed poke.
    fn poke(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_two_is_data_area_base() {
        let geometry = VolumeGeometry {
            sector_size_min: 512,
            sector_size_max: 512,
            data_area_lba: 2048,
            cluster_sectors: 8,
            lun: 0,
        };
        assert_eq!(geometry.first_lba_of_cluster(2), 2048);
        assert_eq!(geometry.first_lba_of_cluster(3), 2056);
        assert_eq!(geometry.first_lba_of_cluster(10), 2048 + 8 * 8);
    }

    #[test]
    #[should_panic(expected = "FAT data clusters start at 2")]
    fn reserved_cluster_panics() {
        let geometry = VolumeGeometry {
            sector_size_min: 512,
            sector_size_max: 512,
            data_area_lba: 2048,
            cluster_sectors: 8,
            lun: 0,
        };
        let _ = geometry.first_lba_of_cluster(1);
    }
}
