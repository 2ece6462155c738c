//! Simulated volume and block device backing the test suite.
//!
//! [`SimVolume`] models just enough of a FAT volume for the binder:
//! path-addressed files with eager contiguous cluster allocation, a
//! contiguity flag, and generation-checked lock handles. [`SimDevice`]
//! models the mass-storage queue: immediate completion by default, with
//! switches to stall completions, fail them, or reject submissions
//! outright. [`SimDisk`] is the shared sector array both sides observe.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::constants::SECTOR_SIZE;
use crate::device::{BlockDevice, SubmitError, WriteStatus};
use crate::pool::SectorWrite;
use crate::volume::{AllocError, FileLock, Volume, VolumeFile, VolumeGeometry};

pub fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
}

pub fn proptest_cases(default: u32) -> u32 {
    env_u32("PROPTEST_CASES").unwrap_or(default)
}

/// In-memory sector array. Unwritten sectors read as zero, like freshly
/// cleared space.
pub struct SimDisk {
    sectors: Mutex<HashMap<u64, [u8; SECTOR_SIZE]>>,
}

impl SimDisk {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sectors: Mutex::new(HashMap::new()),
        })
    }

    pub fn read_sector(&self, lba: u64) -> [u8; SECTOR_SIZE] {
        self.sectors
            .lock()
            .unwrap()
            .get(&lba)
            .copied()
            .unwrap_or([0u8; SECTOR_SIZE])
    }

    /// Reads `len` bytes at byte `offset` of a file whose first sector is
    /// `first_lba`.
    pub fn read_range(&self, first_lba: u64, offset: u64, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut pos = offset;
        while out.len() < len {
            let sector = self.read_sector(first_lba + pos / SECTOR_SIZE as u64);
            let sector_offset = (pos % SECTOR_SIZE as u64) as usize;
            let n = (len - out.len()).min(SECTOR_SIZE - sector_offset);
            out.extend_from_slice(&sector[sector_offset..sector_offset + n]);
            pos += n as u64;
        }
        out
    }

    fn write_sector(&self, lba: u64, data: &[u8]) {
        assert_eq!(data.len(), SECTOR_SIZE);
        let mut sector = [0u8; SECTOR_SIZE];
        sector.copy_from_slice(data);
        self.sectors.lock().unwrap().insert(lba, sector);
    }
}

/// Block-device double with fault injection.
pub struct SimDevice {
    disk: Arc<SimDisk>,
    stalled: AtomicBool,
    reject_submissions: AtomicBool,
    fail_completions: AtomicBool,
    pending: Mutex<Vec<SectorWrite>>,
    submitted: AtomicU64,
}

impl SimDevice {
    pub fn new(disk: Arc<SimDisk>) -> Arc<Self> {
        Arc::new(Self {
            disk,
            stalled: AtomicBool::new(false),
            reject_submissions: AtomicBool::new(false),
            fail_completions: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            submitted: AtomicU64::new(0),
        })
    }

    /// Accepted writes queue up instead of completing.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Release);
    }

    /// `submit` starts returning errors without consuming slots for long.
    pub fn set_reject_submissions(&self, reject: bool) {
        self.reject_submissions.store(reject, Ordering::Release);
    }

    /// Queued and future completions report [`WriteStatus::Failed`].
    pub fn set_fail_completions(&self, fail: bool) {
        self.fail_completions.store(fail, Ordering::Release);
    }

    /// Resolves every queued write, in submission order.
    pub fn complete_pending(&self) {
        let writes: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
        for write in writes {
            self.commit(write);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn submitted_count(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    fn commit(&self, write: SectorWrite) {
        if self.fail_completions.load(Ordering::Acquire) {
            write.complete(WriteStatus::Failed);
            return;
        }
        self.disk.write_sector(write.lba(), write.data());
        write.complete(WriteStatus::Ok);
    }
}

impl BlockDevice for SimDevice {
    fn submit(&self, write: SectorWrite) -> Result<(), SubmitError> {
        if self.reject_submissions.load(Ordering::Acquire) {
            // Dropping the unresolved write releases its pool slot.
            return Err(SubmitError);
        }
        self.submitted.fetch_add(1, Ordering::AcqRel);
        if self.stalled.load(Ordering::Acquire) {
            self.pending.lock().unwrap().push(write);
        } else {
            self.commit(write);
        }
        Ok(())
    }
}

struct SimFileEntry {
    /// Generation stamp; a delete+recreate under the same path changes it,
    /// which is exactly what stale lock handles must detect.
    id: u64,
    first_cluster: u32,
    size: u64,
    contiguous: bool,
}

struct SimVolumeState {
    files: HashMap<String, SimFileEntry>,
    next_cluster: u32,
    next_id: u64,
    free_clusters: u32,
    fail_contiguity_probe: bool,
    cluster_bytes: u64,
}

/// Minimal FAT-shaped volume: eager contiguous allocation from a bump
/// cluster allocator, with knobs for the binder's failure paths.
pub struct SimVolume {
    geometry: VolumeGeometry,
    state: Arc<Mutex<SimVolumeState>>,
}

impl SimVolume {
    pub fn new(data_area_lba: u64, cluster_sectors: u32, free_clusters: u32) -> Self {
        let geometry = VolumeGeometry {
            sector_size_min: SECTOR_SIZE,
            sector_size_max: SECTOR_SIZE,
            data_area_lba,
            cluster_sectors,
            lun: 0,
        };
        Self {
            geometry,
            state: Arc::new(Mutex::new(SimVolumeState {
                files: HashMap::new(),
                next_cluster: 2,
                next_id: 1,
                free_clusters,
                fail_contiguity_probe: false,
                cluster_bytes: cluster_sectors as u64 * SECTOR_SIZE as u64,
            })),
        }
    }

    /// Marks an existing file as fragmented.
    pub fn set_contiguous(&self, path: &str, contiguous: bool) {
        let mut state = self.state.lock().unwrap();
        state
            .files
            .get_mut(path)
            .expect("no such file")
            .contiguous = contiguous;
    }

    pub fn set_fail_contiguity_probe(&self, fail: bool) {
        self.state.lock().unwrap().fail_contiguity_probe = fail;
    }
}

impl Volume for SimVolume {
    type File = SimFile;
    type Lock = SimLock;

    fn geometry(&self) -> VolumeGeometry {
        self.geometry
    }

    fn create(&self, path: &str) -> io::Result<SimFile> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.files.insert(
            path.to_string(),
            SimFileEntry {
                id,
                first_cluster: 0,
                size: 0,
                contiguous: true,
            },
        );
        Ok(SimFile {
            path: path.to_string(),
            state: Arc::clone(&self.state),
        })
    }

    fn open_rw(&self, path: &str) -> io::Result<SimFile> {
        let state = self.state.lock().unwrap();
        if !state.files.contains_key(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
        }
        Ok(SimFile {
            path: path.to_string(),
            state: Arc::clone(&self.state),
        })
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))
    }

    fn lock(&self, path: &str) -> io::Result<SimLock> {
        let state = self.state.lock().unwrap();
        let entry = state
            .files
            .get(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))?;
        Ok(SimLock {
            path: path.to_string(),
            id: entry.id,
            state: Arc::clone(&self.state),
        })
    }
}

pub struct SimFile {
    path: String,
    state: Arc<Mutex<SimVolumeState>>,
}

impl VolumeFile for SimFile {
    fn allocate_contiguous(&mut self, size: u64) -> Result<(), AllocError> {
        let mut state = self.state.lock().unwrap();
        let clusters = size.div_ceil(state.cluster_bytes) as u32;
        if clusters > state.free_clusters {
            return Err(AllocError::Full);
        }
        state.free_clusters -= clusters;
        let first_cluster = state.next_cluster;
        state.next_cluster += clusters;
        let entry = state.files.get_mut(&self.path).expect("file entry missing");
        entry.first_cluster = first_cluster;
        entry.size = size;
        Ok(())
    }

    fn is_contiguous(&self) -> io::Result<bool> {
        let state = self.state.lock().unwrap();
        if state.fail_contiguity_probe {
            return Err(io::Error::other("probe failed"));
        }
        Ok(state.files[&self.path].contiguous)
    }

    fn size(&self) -> u64 {
        self.state.lock().unwrap().files[&self.path].size
    }

    fn first_cluster(&self) -> u32 {
        self.state.lock().unwrap().files[&self.path].first_cluster
    }
}

pub struct SimLock {
    path: String,
    id: u64,
    state: Arc<Mutex<SimVolumeState>>,
}

impl FileLock for SimLock {
    fn poke(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .files
            .get(&self.path)
            .is_some_and(|entry| entry.id == self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_reads_zero_when_unwritten() {
        let disk = SimDisk::new();
        assert_eq!(disk.read_sector(5), [0u8; SECTOR_SIZE]);
    }

    #[test]
    fn disk_range_spans_sectors() {
        let disk = SimDisk::new();
        disk.write_sector(10, &[0xAA; SECTOR_SIZE]);
        disk.write_sector(11, &[0xBB; SECTOR_SIZE]);
        let range = disk.read_range(10, 500, 24);
        assert!(range[..12].iter().all(|&b| b == 0xAA));
        assert!(range[12..].iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn allocation_consumes_clusters() {
        let volume = SimVolume::new(64, 8, 2);
        let mut file = volume.create("/a.bin").unwrap();
        file.allocate_contiguous(4096).unwrap();
        assert_eq!(file.first_cluster(), 2);
        assert_eq!(file.size(), 4096);

        let mut second = volume.create("/b.bin").unwrap();
        second.allocate_contiguous(4096).unwrap();
        assert_eq!(second.first_cluster(), 3);

        let mut third = volume.create("/c.bin").unwrap();
        assert!(matches!(
            third.allocate_contiguous(1),
            Err(AllocError::Full)
        ));
    }

    #[test]
    fn lock_goes_stale_on_remove_and_recreate() {
        let volume = SimVolume::new(64, 8, 8);
        let mut file = volume.create("/a.bin").unwrap();
        file.allocate_contiguous(512).unwrap();
        drop(file);

        let lock = volume.lock("/a.bin").unwrap();
        assert!(lock.poke());

        volume.remove("/a.bin").unwrap();
        assert!(!lock.poke());

        let _file = volume.create("/a.bin").unwrap();
        assert!(!lock.poke(), "recreated file has a new generation");
    }
}
