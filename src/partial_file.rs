//! Partial-file writer: an unordered, possibly sparse stream of byte ranges
//! committed to one contiguous on-disk file through raw sector writes.
//!
//! The filesystem is used once, at bind time, to allocate the extent and
//! translate its first cluster into a sector address; the data path then
//! goes straight to the block device. That shortcut is what makes resumable
//! downloads cheap on this hardware, and it is also why the writer holds a
//! read-only lock handle for its whole lifetime and revalidates it before
//! every submission; nothing else stops the filesystem from giving those
//! sectors to somebody else.
//!
//! # Concurrency
//!
//! One producer thread owns the [`PartialFile`] and is the sole caller of
//! [`seek`](PartialFile::seek), [`write`](PartialFile::write),
//! [`sync`](PartialFile::sync) and drop. Device completions run on
//! arbitrary contexts and touch only the buffer pool and its sticky error
//! flag. `write` reports "queued or on-device", not durable; `sync` is the
//! durability barrier.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::constants::{DEVICE_RW_TIMEOUT, SECTOR_SIZE};
use crate::device::BlockDevice;
use crate::pool::{PooledSector, SectorPool};
use crate::valid_range::{State, ValidPart};
use crate::volume::{AllocError, FileLock, Volume, VolumeFile};

/// Factory configuration, in the spirit of the storage engine's open
/// options: everything the binder needs, with the pool timeout defaulting
/// to the device RW timeout.
pub struct Options<'a, V, D> {
    pub volume: &'a V,
    pub device: Arc<D>,
    pub path: &'a str,
    pub pool_timeout: Duration,
}

impl<'a, V, D> Options<'a, V, D> {
    pub fn new(volume: &'a V, device: Arc<D>, path: &'a str) -> Self {
        Self {
            volume,
            device,
            path,
            pool_timeout: DEVICE_RW_TIMEOUT,
        }
    }
}

/// Human-readable binder failures, shown to the user by the upper layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OpenError {
    #[error("Failed to write to location")]
    CreateFailed,
    #[error("USB drive full")]
    DriveFull,
    #[error("Failed to open file")]
    OpenFailed,
    #[error("Failed to check file contiguity")]
    ContiguityProbeFailed,
    #[error("File is not contiguous")]
    NotContiguous,
    #[error("Can't lock file in place")]
    LockFailed,
}

/// Writer over one contiguous file extent. See the module docs.
pub struct PartialFile<V: Volume, D: BlockDevice> {
    pool: SectorPool,
    device: Arc<D>,
    /// Absolute sector of byte 0 of the file.
    first_lba: u64,
    /// Partially filled buffer for the sector containing `current_offset`,
    /// if any.
    current_sector: Option<PooledSector>,
    /// Byte position of the next write.
    current_offset: u64,
    state: State,
    last_progress_percent: Option<u8>,
    /// Held read-only for the writer's lifetime so the filesystem cannot
    /// reallocate the extent. Dropped last, after the in-flight drain.
    lock: V::Lock,
}

impl<V: Volume, D: BlockDevice> std::fmt::Debug for PartialFile<V, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartialFile").finish_non_exhaustive()
    }
}

impl<V: Volume, D: BlockDevice> PartialFile<V, D> {
    /// Creates `path` with an eager contiguous allocation of `size` bytes
    /// and binds a writer over it with a fresh [`State`].
    ///
    /// On any failure after the file was created, the path is removed
    /// again so a half-prepared file never survives.
    pub fn create(opts: Options<'_, V, D>, size: u64) -> Result<Self, OpenError> {
        assert!(size > 0);

        let mut file = match opts.volume.create(opts.path) {
            Ok(file) => file,
            Err(err) => {
                log::error!("failed to create {}: {err}", opts.path);
                return Err(OpenError::CreateFailed);
            }
        };

        if let Err(err) = file.allocate_contiguous(size) {
            log::error!("failed to allocate {size} bytes for {}: {err}", opts.path);
            drop(file);
            let _ = opts.volume.remove(opts.path);
            return Err(match err {
                AllocError::Full => OpenError::DriveFull,
                AllocError::Io(_) => OpenError::CreateFailed,
            });
        }

        Self::bind(opts, file, State::new(size))
    }

    /// Binds a writer over an existing file using a previously persisted
    /// `state`. No truncation, no allocation; `state.total_size` is
    /// overwritten from the on-disk size, which is authoritative.
    pub fn open(opts: Options<'_, V, D>, state: State) -> Result<Self, OpenError> {
        let file = match opts.volume.open_rw(opts.path) {
            Ok(file) => file,
            Err(err) => {
                log::error!("failed to open {}: {err}", opts.path);
                return Err(OpenError::OpenFailed);
            }
        };
        Self::bind(opts, file, state)
    }

    /// Common binder: contiguity check, cluster-to-LBA translation, and the
    /// swap from the read-write handle to the read-only lock.
    fn bind(opts: Options<'_, V, D>, file: V::File, mut state: State) -> Result<Self, OpenError> {
        let geometry = opts.volume.geometry();
        // The offset math below assumes the filesystem and the device agree
        // on the write unit.
        assert!(geometry.sector_size_min == SECTOR_SIZE);
        assert!(geometry.sector_size_max == SECTOR_SIZE);

        match file.is_contiguous() {
            Ok(true) => {}
            Ok(false) => return Err(OpenError::NotContiguous),
            Err(err) => {
                log::error!("contiguity probe failed for {}: {err}", opts.path);
                return Err(OpenError::ContiguityProbeFailed);
            }
        }

        state.total_size = file.size();
        assert!(state.total_size > 0);
        state.assert_invariants();

        let first_lba = geometry.first_lba_of_cluster(file.first_cluster());

        // The read-write handle must be closed before the read-only lock
        // can be taken. Another actor may delete and recreate the path in
        // this window (the runtime has no atomic reopen-same-inode), which
        // is why every submission pokes the lock instead of trusting it.
        drop(file);
        let lock = match opts.volume.lock(opts.path) {
            Ok(lock) => lock,
            Err(err) => {
                log::error!("failed to lock {}: {err}", opts.path);
                return Err(OpenError::LockFailed);
            }
        };

        Ok(Self {
            pool: SectorPool::new(geometry.lun, opts.pool_timeout),
            device: opts.device,
            first_lba,
            current_sector: None,
            current_offset: 0,
            state,
            last_progress_percent: None,
            lock,
        })
    }

    /// Sector containing `offset`, except that the position exactly at the
    /// end of the file maps one past the last sector: "at EOF" must never
    /// alias the last sector's start.
    fn sector_nbr(&self, offset: u64) -> u64 {
        let mut sector = self.first_lba + offset / SECTOR_SIZE as u64;
        if offset >= self.state.total_size {
            sector += 1;
        }
        sector
    }

    /// File offset of the first byte of `sector_nbr`.
    fn offset_of(&self, sector_nbr: u64) -> u64 {
        assert!(sector_nbr >= self.first_lba);
        (sector_nbr - self.first_lba) * SECTOR_SIZE as u64
    }

    /// Repositions the writer. A seek within the sector currently being
    /// filled keeps the partial buffer; any other seek discards it, losing
    /// the uncommitted bytes the caller chose to abandon.
    ///
    /// Never blocks and never fails on in-range offsets.
    ///
    /// # Panics
    ///
    /// Panics when `offset > total_size`.
    pub fn seek(&mut self, offset: u64) -> bool {
        assert!(offset <= self.state.total_size, "seek past end of file");

        let new_sector = self.sector_nbr(offset);
        if let Some(current) = &self.current_sector {
            if current.sector_nbr() == new_sector {
                self.current_offset = offset;
                return true;
            }
            log::warn!(
                "discarding buffered data for sector {}",
                current.sector_nbr()
            );
        }

        self.current_offset = offset;
        self.current_sector = None;
        true
    }

    /// Appends `data` at `current_offset`, advancing it; full sectors are
    /// submitted to the device as they fill.
    ///
    /// Returns `false` when a prior completion failed, when no buffer
    /// could be acquired within the pool timeout, or when a submission was
    /// not issued. `true` means queued or on-device; call
    /// [`sync`](Self::sync) for durability.
    ///
    /// # Panics
    ///
    /// Panics when the write would cross `total_size`: the caller's size
    /// accounting is broken and there is no safe continuation.
    pub fn write(&mut self, mut data: &[u8]) -> bool {
        if self.pool.write_failed() {
            return false;
        }
        assert!(
            self.current_offset + data.len() as u64 <= self.state.total_size,
            "write past end of file: {} + {} > {}",
            self.current_offset,
            data.len(),
            self.state.total_size,
        );

        while !data.is_empty() {
            let mut sector = match self.current_sector.take() {
                Some(sector) => sector,
                None => {
                    let sector_nbr = self.sector_nbr(self.current_offset);
                    let Some(mut sector) = self.pool.acquire() else {
                        log::error!("no free sector buffer within the device timeout");
                        return false;
                    };
                    sector.set_sector_nbr(sector_nbr);
                    sector
                }
            };

            let sector_offset = (self.current_offset % SECTOR_SIZE as u64) as usize;
            let room = SECTOR_SIZE - sector_offset;
            let n = data.len().min(room);
            sector.data_mut()[sector_offset..sector_offset + n].copy_from_slice(&data[..n]);
            log::debug!(
                "buffered {n} bytes for sector {} at offset {sector_offset}",
                sector.sector_nbr()
            );

            let next_offset = self.current_offset + n as u64;
            if self.sector_nbr(next_offset) != sector.sector_nbr() {
                // Sector full; ownership moves to the device.
                if !self.submit_sector(sector) {
                    return false;
                }
            } else {
                self.current_sector = Some(sector);
            }

            self.current_offset = next_offset;
            data = &data[n..];
        }

        true
    }

    /// Hands one filled sector to the block device and, on success, records
    /// its range as valid.
    fn submit_sector(&mut self, sector: PooledSector) -> bool {
        log::debug!("sending sector {} to the block device", sector.sector_nbr());

        // The medium may have been swapped, or the file unlinked, since
        // bind time. Raw sector writes bypass every filesystem check, so
        // revalidate the lock handle before each one.
        if !self.lock.poke() {
            log::error!(
                "file lock is stale, dropping sector {}",
                sector.sector_nbr()
            );
            return false;
        }

        let start = self.offset_of(sector.sector_nbr());
        let end = (start + SECTOR_SIZE as u64).min(self.state.total_size);

        if self.device.submit(sector.into_write()).is_err() {
            log::error!("block device rejected the sector write");
            return false;
        }

        // Recorded at submission time: the state tracks intent to be
        // durable. A later completion failure latches the sticky error and
        // the caller discards the state.
        self.extend_valid_part(ValidPart::new(start, end));
        true
    }

    /// Durability barrier. On `true`, every byte written before the call is
    /// on the device and the writer can keep appending from the same
    /// offset with the same partial contents.
    ///
    /// A held partial sector cannot be submitted as-is and then reused,
    /// because the device write unit is a whole sector. It is copied into a second
    /// buffer, the original is submitted (its zero fill covers the unfilled
    /// remainder), and the copy is retained as the current sector.
    pub fn sync(&mut self) -> bool {
        let mut avoid = 0;
        if let Some(current) = self.current_sector.take() {
            avoid = 1;
            let Some(mut retained) = self.pool.acquire() else {
                self.current_sector = Some(current);
                return false;
            };
            retained.data_mut().copy_from_slice(current.data());
            retained.set_sector_nbr(current.sector_nbr());

            let submitted = self.submit_sector(current);
            self.current_sector = Some(retained);
            if !submitted {
                log::error!("failed to flush partial sector");
                return false;
            }
        }

        if !self.pool.sync(avoid) {
            return false;
        }
        !self.pool.write_failed()
    }

    fn extend_valid_part(&mut self, part: ValidPart) {
        self.state.extend(part);
        let percent = self.state.percent_valid();
        if self.last_progress_percent != Some(percent) {
            log::info!("progress: {} {percent:3}%", self.state.progress_bar());
            self.last_progress_percent = Some(percent);
        }
    }

    /// `true` when the first `bytes` bytes are valid.
    pub fn has_valid_head(&self, bytes: u64) -> bool {
        self.state.has_valid_head(bytes)
    }

    /// `true` when the last `bytes` bytes are valid.
    pub fn has_valid_tail(&self, bytes: u64) -> bool {
        self.state.has_valid_tail(bytes)
    }

    /// Progress record for the upper layer to persist. Untrustworthy after
    /// a failed `write` or `sync`; the caller discards it before resuming.
    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn total_size(&self) -> u64 {
        self.state.total_size
    }

    /// Byte position of the next write.
    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }
}

impl<V: Volume, D: BlockDevice> Drop for PartialFile<V, D> {
    fn drop(&mut self) {
        // The partial buffer holds incomplete content; flushing it here
        // would clobber the unwritten half of the on-disk sector.
        self.current_sector = None;
        // Completions borrow pool slots; drain them before the lock handle
        // goes away and the sectors can be reallocated.
        let _ = self.pool.sync(0);
    }
}
