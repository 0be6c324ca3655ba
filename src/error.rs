use crate::backup::storage::FsError;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the NAND subsystem and the backup engine.
///
/// Hardware-reported errors and ECC failures are not errors in this sense: they are logged and
/// reported as status values, the way the controller reports them.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Write or erase below the minimum protected page. Never reaches the hardware.
    #[error("NAND page {0:#x} is protected")]
    Protected(u32),

    /// Page number outside of the device
    #[error("NAND page {0:#x} out of range")]
    OutOfRange(u32),

    /// A request was submitted while another one is still outstanding
    #[error("previous NAND request is not done yet")]
    Busy,

    /// A staging or spare buffer does not meet the controller's DMA alignment
    #[error("buffer {addr:#010x} is not aligned to {align} bytes")]
    MisalignedBuffer { addr: u32, align: u32 },

    /// The key block stored in a backup does not belong to this console
    #[error("backup key material does not match this console")]
    KeyMismatch,

    /// The retry policy gave up on a storage operation
    #[error("storage still failing after {tries} attempts: {source}")]
    RetriesExhausted { tries: u64, source: FsError },

    /// A storage operation failed outside of the retried paths (e.g. the initial open)
    #[error("storage error: {0}")]
    Storage(#[from] FsError),

    /// A request record could not be decoded
    #[error("malformed request: {0}")]
    Decode(String),
}
