//! Block-device trait for sector-write submission.
//!
//! The writer needs exactly one thing from the mass-storage layer: accept a
//! prepared single-sector write and report its completion later. Capturing
//! that as a trait keeps the data path testable: the suite drives the
//! writer against a simulated device with stalls and fault injection
//! without touching the writer's logic.

use thiserror::Error;

use crate::pool::SectorWrite;

/// Final status of a submitted sector write, delivered at completion time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    /// The sector is on the device.
    Ok,
    /// The transfer failed; the bytes may or may not have reached the
    /// device and the file's progress state is no longer trustworthy.
    Failed,
}

/// The device refused to enqueue the request.
#[derive(Debug, Error)]
#[error("block device rejected the submission")]
pub struct SubmitError;

/// Asynchronous single-sector write queue of a mass-storage device.
///
/// Implementations must:
///
/// - process accepted submissions in FIFO order;
/// - eventually resolve every accepted [`SectorWrite`], either by calling
///   [`SectorWrite::complete`] (on any thread; completion contexts only
///   touch the buffer pool and its sticky error flag) or by dropping it,
///   which returns the buffer to the pool without writing;
/// - not block in `submit`.
pub trait BlockDevice: Send + Sync {
    /// Enqueues a prepared sector write.
    ///
    /// On `Err` the request was consumed without being issued; its pool
    /// slot is released and no data was transferred.
    fn submit(&self, write: SectorWrite) -> Result<(), SubmitError>;
}
