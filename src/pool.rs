//! Bounded pool of sector buffers shared between the producer and the
//! block-device completion context.
//!
//! # Design
//!
//! The pool pre-allocates [`POOL_SLOTS`] buffers of [`SECTOR_SIZE`] bytes.
//! A single `u64` mask records which slots are lent out: bit *i* set means
//! slot *i* is either held by the producer or in flight on the device. Bits
//! at and above `POOL_SLOTS` are permanently set, so the lowest-clear-bit
//! scan (`trailing_ones`) can never select a nonexistent slot and "pool
//! exhausted" is simply `mask == u64::MAX`. The mask collapses slot choice,
//! in-flight counting and release identification into single-word bit
//! operations.
//!
//! # Ownership
//!
//! Buffer ownership is sequential, never shared:
//!
//! - [`SectorPool::acquire`] moves a zeroed buffer out of its slot into a
//!   [`PooledSector`] held by the producer;
//! - [`PooledSector::into_write`] moves it into a [`SectorWrite`] owned by
//!   the block device while the transfer is in flight;
//! - [`SectorWrite::complete`] (or dropping either guard) moves it back
//!   into the slot and clears the bit.
//!
//! The mutex guards only the mask and the slot array; buffer bytes travel
//! with whichever guard currently owns them.
//!
//! # Blocking
//!
//! Only the producer blocks, in [`SectorPool::acquire`] and
//! [`SectorPool::sync`], bounded per wait by the pool timeout. The condvar
//! is notified once per release; every woken waiter re-scans the mask, so a
//! single binary signal is sufficient even under concurrent releases.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::constants::{POOL_SLOTS, SECTOR_SIZE};
use crate::device::WriteStatus;

/// One device write unit.
pub type SectorBuf = [u8; SECTOR_SIZE];

/// Mask bits that do not correspond to a slot; kept set forever.
const UNADDRESSABLE: u64 = !0u64 << POOL_SLOTS;

/// Mask value when every slot is lent out.
const ALL_LENT: u64 = u64::MAX;

struct Slots {
    mask: u64,
    /// `None` exactly while the slot's bit is set (buffer moved out).
    bufs: [Option<Box<SectorBuf>>; POOL_SLOTS],
}

impl Slots {
    /// Number of slots currently lent out (producer-held + in flight).
    fn lent(&self) -> u32 {
        (self.mask & !UNADDRESSABLE).count_ones()
    }
}

struct Shared {
    slots: Mutex<Slots>,
    released: Condvar,
    /// Latched by any failed completion; read by the producer on the next
    /// `write` or `sync`. The only writer state a completion context may
    /// touch besides the slots.
    write_error: AtomicBool,
}

impl Shared {
    fn release(&self, slot: usize, buf: Box<SectorBuf>) {
        let mut slots = self.slots.lock().expect("pool mutex poisoned");
        assert!(slots.mask & (1 << slot) != 0, "release of a free slot");
        assert!(slots.bufs[slot].is_none());
        slots.mask &= !(1 << slot);
        slots.bufs[slot] = Some(buf);
        self.released.notify_one();
    }
}

/// Fixed-capacity sector buffer pool. See the module docs for the
/// ownership protocol.
pub struct SectorPool {
    shared: Arc<Shared>,
    lun: u8,
    timeout: Duration,
}

impl SectorPool {
    pub fn new(lun: u8, timeout: Duration) -> Self {
        assert!(!timeout.is_zero());
        Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(Slots {
                    mask: UNADDRESSABLE,
                    bufs: core::array::from_fn(|_| Some(Box::new([0u8; SECTOR_SIZE]))),
                }),
                released: Condvar::new(),
                write_error: AtomicBool::new(false),
            }),
            lun,
            timeout,
        }
    }

    /// Borrows the lowest free slot, blocking while the pool is exhausted.
    ///
    /// Returns `None` when no slot frees up within the pool timeout; the
    /// producer surfaces that as a write failure. The buffer is zeroed on
    /// every acquire; partially filled sectors are flushed with this zero
    /// fill past the payload.
    pub fn acquire(&self) -> Option<PooledSector> {
        let mut slots = self.shared.slots.lock().expect("pool mutex poisoned");
        while slots.mask == ALL_LENT {
            let (guard, wait) = self
                .shared
                .released
                .wait_timeout(slots, self.timeout)
                .expect("pool mutex poisoned");
            slots = guard;
            // Each release re-arms the wait, matching the signal-per-release
            // discipline of the device layer's own timeouts.
            if wait.timed_out() && slots.mask == ALL_LENT {
                return None;
            }
        }

        let slot = slots.mask.trailing_ones() as usize;
        assert!(slot < POOL_SLOTS);
        slots.mask |= 1 << slot;
        let mut buf = slots.bufs[slot].take().expect("free slot without buffer");
        drop(slots);

        buf.fill(0);
        Some(PooledSector {
            shared: Arc::clone(&self.shared),
            slot,
            lun: self.lun,
            sector_nbr: 0,
            buf: Some(buf),
        })
    }

    /// Waits until at most `avoid` slots are lent out.
    ///
    /// `avoid == 0` means fully drained: every buffer is back in the pool
    /// and no completion callback can fire afterwards. `avoid == 1` is the
    /// flush-with-retention path, where the producer keeps one partial
    /// buffer while all submitted writes drain.
    ///
    /// Returns `false` when a wait expires before the target is reached.
    pub fn sync(&self, avoid: u32) -> bool {
        assert!(avoid as usize <= POOL_SLOTS);
        let mut slots = self.shared.slots.lock().expect("pool mutex poisoned");
        while slots.lent() > avoid {
            let (guard, wait) = self
                .shared
                .released
                .wait_timeout(slots, self.timeout)
                .expect("pool mutex poisoned");
            slots = guard;
            if wait.timed_out() && slots.lent() > avoid {
                return false;
            }
        }
        true
    }

    /// `true` once any completion reported failure. Sticky.
    pub fn write_failed(&self) -> bool {
        self.shared.write_error.load(Ordering::Acquire)
    }

    /// Number of slots currently lent out. Observability for assertions
    /// and tests.
    pub fn lent(&self) -> u32 {
        self.shared.slots.lock().expect("pool mutex poisoned").lent()
    }
}

/// A pool buffer held by the producer, being filled for one target sector.
///
/// Dropping it releases the slot without submitting: the discard path for
/// seeks away from a partial sector and for writer teardown.
pub struct PooledSector {
    shared: Arc<Shared>,
    slot: usize,
    lun: u8,
    sector_nbr: u64,
    /// `Some` until moved into a [`SectorWrite`] or released by drop.
    buf: Option<Box<SectorBuf>>,
}

impl PooledSector {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Target sector, stamped by the writer right after acquire.
    pub fn sector_nbr(&self) -> u64 {
        self.sector_nbr
    }

    pub fn set_sector_nbr(&mut self, sector_nbr: u64) {
        self.sector_nbr = sector_nbr;
    }

    pub fn data(&self) -> &[u8] {
        &self.buf.as_ref().expect("buffer present until consumed")[..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf.as_mut().expect("buffer present until consumed")[..]
    }

    /// Converts the filled buffer into a device request. Slot ownership
    /// transfers to the request; it returns to the pool at completion.
    pub fn into_write(mut self) -> SectorWrite {
        let buf = self.buf.take().expect("buffer present until consumed");
        SectorWrite {
            lun: self.lun,
            lba: self.sector_nbr,
            payload: Some(Payload {
                shared: Arc::clone(&self.shared),
                slot: self.slot,
                buf,
            }),
        }
    }
}

impl Drop for PooledSector {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.shared.release(self.slot, buf);
        }
    }
}

struct Payload {
    shared: Arc<Shared>,
    slot: usize,
    buf: Box<SectorBuf>,
}

/// A prepared single-sector write travelling through the block device.
///
/// Carries the logical unit, the target LBA, the sector payload and the
/// pool slot it was lent from. The device resolves it exactly once:
/// [`complete`](Self::complete) from its completion context, or drop for a
/// request it never issued.
pub struct SectorWrite {
    lun: u8,
    lba: u64,
    /// `Some` until the write is resolved.
    payload: Option<Payload>,
}

impl SectorWrite {
    pub fn lun(&self) -> u8 {
        self.lun
    }

    /// Target sector number on the device.
    pub fn lba(&self) -> u64 {
        self.lba
    }

    /// Always 1: the writer submits sector-sized units.
    pub fn sector_count(&self) -> u32 {
        1
    }

    pub fn data(&self) -> &[u8] {
        &self.payload.as_ref().expect("payload present until resolved").buf[..]
    }

    /// Pool slot index carried for completion accounting.
    pub fn slot(&self) -> usize {
        self.payload.as_ref().expect("payload present until resolved").slot
    }

    /// Resolves the write from the device's completion context.
    ///
    /// May run on any thread. Latches the pool's sticky error on a non-OK
    /// status, then releases the slot; it must not touch any other writer
    /// state.
    pub fn complete(mut self, status: WriteStatus) {
        let payload = self.payload.take().expect("write completed twice");
        if status != WriteStatus::Ok {
            log::error!("failed to write sector {}", self.lba);
            payload.shared.write_error.store(true, Ordering::Release);
        }
        payload.shared.release(payload.slot, payload.buf);
    }
}

impl Drop for SectorWrite {
    /// A write dropped unresolved was never issued (rejected submission or
    /// device teardown): the slot returns to the pool and no error is
    /// latched; the submitter already observed the failure synchronously.
    fn drop(&mut self) {
        if let Some(payload) = self.payload.take() {
            payload.shared.release(payload.slot, payload.buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn pool() -> SectorPool {
        SectorPool::new(0, Duration::from_millis(50))
    }

    #[test]
    fn acquire_zeroes_and_release_recycles() {
        let pool = pool();
        let mut sector = pool.acquire().unwrap();
        assert!(sector.data().iter().all(|&b| b == 0));
        sector.data_mut().fill(0xAB);
        let slot = sector.slot();
        drop(sector);
        assert_eq!(pool.lent(), 0);

        let again = pool.acquire().unwrap();
        assert_eq!(again.slot(), slot, "lowest slot is reused first");
        assert!(again.data().iter().all(|&b| b == 0), "buffer re-zeroed");
    }

    #[test]
    fn lowest_free_slot_is_chosen() {
        let pool = pool();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        assert_eq!((a.slot(), b.slot(), c.slot()), (0, 1, 2));
        drop(b);
        let d = pool.acquire().unwrap();
        assert_eq!(d.slot(), 1);
        drop(a);
        drop(c);
    }

    #[test]
    fn lent_accounting() {
        let pool = pool();
        let held: Vec<_> = (0..8).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.lent(), 8);
        let writes: Vec<_> = held.into_iter().map(PooledSector::into_write).collect();
        assert_eq!(pool.lent(), 8, "in-flight writes still count as lent");
        for write in writes {
            write.complete(WriteStatus::Ok);
        }
        assert_eq!(pool.lent(), 0);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let pool = pool();
        let held: Vec<_> = (0..POOL_SLOTS).map(|_| pool.acquire().unwrap()).collect();
        let start = Instant::now();
        assert!(pool.acquire().is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
        drop(held);
    }

    #[test]
    fn acquire_wakes_on_concurrent_release() {
        let pool = SectorPool::new(0, Duration::from_secs(5));
        let held: Vec<_> = (0..POOL_SLOTS).map(|_| pool.acquire().unwrap()).collect();
        let writes: Vec<_> = held.into_iter().map(PooledSector::into_write).collect();

        let completer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            for write in writes {
                write.complete(WriteStatus::Ok);
            }
        });

        assert!(pool.acquire().is_some());
        completer.join().unwrap();
    }

    #[test]
    fn sync_zero_waits_for_full_drain() {
        let pool = SectorPool::new(0, Duration::from_secs(5));
        let writes: Vec<_> = (0..4)
            .map(|_| pool.acquire().unwrap().into_write())
            .collect();

        let completer = thread::spawn(move || {
            for write in writes {
                thread::sleep(Duration::from_millis(5));
                write.complete(WriteStatus::Ok);
            }
        });

        assert!(pool.sync(0));
        assert_eq!(pool.lent(), 0);
        completer.join().unwrap();
    }

    #[test]
    fn sync_avoid_one_tolerates_the_retained_buffer() {
        let pool = pool();
        let retained = pool.acquire().unwrap();
        assert!(pool.sync(1));
        assert!(!pool.sync(0), "retained buffer never drains");
        drop(retained);
        assert!(pool.sync(0));
    }

    #[test]
    fn sync_on_idle_pool_returns_immediately() {
        let pool = pool();
        let start = Instant::now();
        assert!(pool.sync(0));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn failed_completion_latches_error() {
        let pool = pool();
        assert!(!pool.write_failed());
        let write = pool.acquire().unwrap().into_write();
        write.complete(WriteStatus::Failed);
        assert!(pool.write_failed());
        assert_eq!(pool.lent(), 0, "slot released even on failure");

        let write = pool.acquire().unwrap().into_write();
        write.complete(WriteStatus::Ok);
        assert!(pool.write_failed(), "error flag is sticky");
    }

    #[test]
    fn dropped_write_releases_without_latching() {
        let pool = pool();
        let write = pool.acquire().unwrap().into_write();
        drop(write);
        assert_eq!(pool.lent(), 0);
        assert!(!pool.write_failed());
    }

    #[test]
    fn write_carries_stamp_and_payload() {
        let pool = pool();
        let mut sector = pool.acquire().unwrap();
        sector.set_sector_nbr(777);
        sector.data_mut()[0] = 0x42;
        let write = sector.into_write();
        assert_eq!(write.lba(), 777);
        assert_eq!(write.lun(), 0);
        assert_eq!(write.sector_count(), 1);
        assert_eq!(write.data()[0], 0x42);
        write.complete(WriteStatus::Ok);
    }

    #[test]
    fn completion_from_other_thread() {
        let pool = SectorPool::new(0, Duration::from_secs(5));
        let write = pool.acquire().unwrap().into_write();
        thread::spawn(move || write.complete(WriteStatus::Ok))
            .join()
            .unwrap();
        assert_eq!(pool.lent(), 0);
    }
}
