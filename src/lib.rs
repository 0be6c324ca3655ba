//! Low-level NAND support for the Starlet I/O processor.
//!
//! The subsystem owns the NAND flash controller: it programs the controller registers, completes
//! operations from the controller interrupt, corrects single-bit errors with the
//! controller-computed ECC, serves requests from other firmware components, and can back the
//! whole device up to (and restore it from) an external filesystem.

pub mod backup;
pub mod ecc;
pub mod error;
pub mod ipc;
pub mod irq;
pub mod nand;
pub mod util;

pub use error::{Error, Result};
