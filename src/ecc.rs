//! Single-bit error correction using the ECC computed by the NAND controller.
//!
//! The controller splits each 2048-byte page into four 512-byte sub-pages. When a page is read
//! with ECC enabled, the ECC buffer holds the stored ECC words (from the spare area, at offset
//! 0x30) followed by the ECC words the controller computed over the data it just read (at
//! offset 0x40). All ECC words are big-endian.

use crate::nand::{ECC_BUFFER_SIZE, PAGE_SIZE};

/// Bytes covered by one ECC word
pub const SUBPAGE_SIZE: usize = 512;

const SUBPAGES: usize = PAGE_SIZE / SUBPAGE_SIZE;
const ECC_STORED_OFFSET: usize = 0x30;
const ECC_CALC_OFFSET: usize = 0x40;

/// Stored ECC of a page that was never programmed
const ECC_ERASED: u32 = 0xFFFF_FFFF;

/// The result of running [correct] over a page
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EccOutcome {
    /// Every sub-page was clean (or erased)
    Ok,

    /// At least one single-bit error was found and fixed
    Corrected,

    /// At least one sub-page has an error that can't be fixed
    Uncorrectable,
}

impl EccOutcome {
    /// The status value reported to other firmware components
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Corrected => 1,
            Self::Uncorrectable => -1,
        }
    }
}

/// Read the `index`th big-endian ECC word starting at `offset`
fn ecc_word(ecc: &[u8], offset: usize, index: usize) -> u32 {
    let start = offset + index * 4;
    u32::from_be_bytes([ecc[start], ecc[start + 1], ecc[start + 2], ecc[start + 3]])
}

/// Check (and where possible, repair) a page against its ECC.
///
/// `data` must be one full page and `ecc` must hold at least [ECC_BUFFER_SIZE] bytes, as laid
/// out by the controller after a read with ECC enabled. Fixed bits are flipped in place.
pub fn correct(pageno: u32, data: &mut [u8], ecc: &[u8]) -> EccOutcome {
    assert_eq!(data.len(), PAGE_SIZE, "data is not page-sized");
    assert!(ecc.len() >= ECC_BUFFER_SIZE, "ECC buffer too small");

    let mut uncorrectable = 0;
    let mut corrected = 0;

    for (i, subpage) in data.chunks_exact_mut(SUBPAGE_SIZE).enumerate() {
        let stored = ecc_word(ecc, ECC_STORED_OFFSET, i);
        let syndrome = stored ^ ecc_word(ecc, ECC_CALC_OFFSET, i);

        // Don't try to correct unformatted pages (all FF)
        if stored == ECC_ERASED || syndrome == 0 {
            continue;
        }

        if (syndrome.wrapping_sub(1) & syndrome) == 0 {
            // Single-bit error in the ECC itself
            corrected += 1;
            continue;
        }

        // Byteswap and extract odd and even halves
        let even = (syndrome >> 24) | ((syndrome >> 8) & 0xf00);
        let odd = ((syndrome << 8) & 0xf00) | ((syndrome >> 8) & 0x0ff);
        if (even ^ odd) != 0xfff {
            uncorrectable += 1;
        } else {
            subpage[(odd >> 3) as usize] ^= 1 << (odd & 7);
            corrected += 1;
        }
    }

    if uncorrectable != 0 || corrected != 0 {
        log::info!(
            "ECC stats for NAND page {pageno:#x}: {uncorrectable} uncorrectable, {corrected} corrected"
        );
    }

    if uncorrectable != 0 {
        EccOutcome::Uncorrectable
    } else if corrected != 0 {
        EccOutcome::Corrected
    } else {
        EccOutcome::Ok
    }
}

/// Compute the ECC word the controller generates for one sub-page.
///
/// This is a Hamming code over the 4096 bit addresses of the sub-page: the "odd" half is the
/// parity of every address bit over all set data bits, and the "even" half is the same over the
/// complemented addresses. A single flipped data bit therefore yields an odd syndrome equal to
/// its bit address and an even syndrome equal to the complement.
pub fn calculate(subpage: &[u8]) -> u32 {
    assert_eq!(subpage.len(), SUBPAGE_SIZE, "data is not subpage-sized");

    let mut odd: u32 = 0;
    let mut even: u32 = 0;
    for (index, &byte) in subpage.iter().enumerate() {
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                let addr = ((index as u32) << 3) | bit;
                odd ^= addr;
                even ^= !addr & 0xfff;
            }
        }
    }

    ((even & 0xff) << 24) | (((even >> 8) & 0xf) << 16) | ((odd & 0xff) << 8) | ((odd >> 8) & 0xf)
}

/// Fill in the stored ECC words of a spare area for the given page data
pub fn fill_spare(data: &[u8], spare: &mut [u8]) {
    assert_eq!(data.len(), PAGE_SIZE, "data is not page-sized");

    for (i, subpage) in data.chunks_exact(SUBPAGE_SIZE).enumerate() {
        let offset = ECC_STORED_OFFSET + i * 4;
        spare[offset..offset + 4].copy_from_slice(&calculate(subpage).to_be_bytes());
    }
}

/// Fill in the computed ECC words, as the controller does after a read
pub fn fill_computed(data: &[u8], ecc: &mut [u8]) {
    assert_eq!(data.len(), PAGE_SIZE, "data is not page-sized");

    for (i, subpage) in data.chunks_exact(SUBPAGE_SIZE).enumerate().take(SUBPAGES) {
        let offset = ECC_CALC_OFFSET + i * 4;
        ecc[offset..offset + 4].copy_from_slice(&calculate(subpage).to_be_bytes());
    }
}
