//! Whole-device backup to, and restore from, an external filesystem.
//!
//! A backup image is the raw content of a range of pages, each page stored as its 2048 data
//! bytes followed by its 64 spare bytes, followed by a [footer] holding the key material of the
//! console it was taken from. Restoring refuses images taken from a different console.

pub mod footer;
pub mod storage;

use crate::ecc::EccOutcome;
use crate::error::{Error, Result};
use crate::nand::{Hardware, Nand, NandLayout, PAGE_SIZE, PAGE_SPARE_SIZE};
use footer::{KeySource, KEY_OFFSET, OTP_SIZE};
use storage::{FsError, OpenMode, ResilientFile, RetryPolicy, Storage, StorageFile};

use std::path::Path;

/// Bytes each page takes up in an image
pub const RAW_PAGE_SIZE: u64 = (PAGE_SIZE + PAGE_SPARE_SIZE) as u64;

/// Name of the file, next to the image, that holds only the footer
pub const KEYS_FILE_NAME: &str = "keys.bin";

/// The pages a backup covers, and the page offset (bank select) to access them with
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BackupRange {
    pub start: u32,
    pub end: u32,
    pub addr0: u32,
}

impl BackupRange {
    /// The whole device
    pub fn full(layout: NandLayout) -> Self {
        Self::span(0, layout.max_page())
    }

    /// One bank of a dual-bank device; `None` for anything but bank 0 or 1
    pub fn bank(layout: NandLayout, bank: u32) -> Option<Self> {
        let max = layout.max_page();
        match bank {
            0 => Some(BackupRange {
                start: max,
                end: max * 2,
                addr0: 0,
            }),
            1 => Some(BackupRange {
                start: 0,
                end: max,
                addr0: 1,
            }),
            _ => None,
        }
    }

    pub fn span(start: u32, end: u32) -> Self {
        BackupRange {
            start,
            end,
            addr0: 0,
        }
    }

    /// Where `pageno` is stored in the image
    pub fn offset(&self, pageno: u32) -> u64 {
        u64::from(pageno - self.start) * RAW_PAGE_SIZE
    }

    /// Refuse ranges that end before they start
    fn check(&self) -> Result<()> {
        if self.start > self.end {
            return Err(Error::OutOfRange(self.start));
        }
        Ok(())
    }

    /// How many erase blocks (or parts of one) the range touches
    pub fn blocks(&self, pages_per_block: u32) -> u32 {
        if self.end <= self.start {
            return 0;
        }
        (self.end - 1) / pages_per_block - self.start / pages_per_block + 1
    }
}

/// What a dump found along the way
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct DumpReport {
    pub pages: u32,

    /// Pages whose ECC could not repair them; they are in the image as read
    pub bad_pages: Vec<u32>,

    /// Whether the companion keys file could be written
    pub keys_written: bool,
}

/// The backup engine.
///
/// Drives the page primitives of a [Nand] synchronously, so the interrupt thread must be
/// running.
pub struct Backup<'a, H, S> {
    nand: &'a Nand<H>,
    storage: S,
    keys: &'a dyn KeySource,
    policy: RetryPolicy,
}

impl<'a, H: Hardware, S: Storage> Backup<'a, H, S> {
    pub fn new(nand: &'a Nand<H>, storage: S, keys: &'a dyn KeySource) -> Self {
        Backup {
            nand,
            storage,
            keys,
            policy: RetryPolicy::default(),
        }
    }

    /// Set how storage failures are retried
    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Dump `range` to `path`, then write the companion keys file next to it.
    ///
    /// Pages are read with ECC correction; uncorrectable pages are reported and dumped anyway.
    /// Storage failures restart the current block, from its first page.
    pub fn dump(&mut self, range: BackupRange, path: &Path) -> Result<DumpReport> {
        range.check()?;
        let nand = self.nand;
        let ppb = nand.layout().pages_per_block;
        log::info!(
            "NAND dump of pages {:#x}..{:#x} to {} started",
            range.start,
            range.end,
            path.display()
        );

        let rpt = howudoin::new()
            .label("Dumping NAND blocks")
            .set_len(u64::from(range.blocks(ppb)));

        let mut report = DumpReport::default();
        let mut file =
            ResilientFile::open(&mut self.storage, path, OpenMode::CreateWrite, self.policy)?;
        let mut data = vec![0u8; PAGE_SIZE];
        let mut spare = [0u8; PAGE_SPARE_SIZE];
        let mut bad_pages = Vec::new();

        let mut block_start = range.start;
        while block_start < range.end {
            let block_end = ((block_start / ppb + 1) * ppb).min(range.end);

            file.attempt(range.offset(block_start), |out| {
                bad_pages.clear();
                for pageno in block_start..block_end {
                    let outcome = nand.read_corrected(pageno, range.addr0, &mut data, &mut spare);
                    if outcome == EccOutcome::Uncorrectable {
                        bad_pages.push(pageno);
                    }

                    if out.write(&data)? != PAGE_SIZE || out.write(&spare)? != PAGE_SPARE_SIZE {
                        return Err(FsError::ShortTransfer);
                    }
                }
                out.sync()?;
                Ok(range.offset(block_end) - range.offset(block_start))
            })?;

            for &pageno in &bad_pages {
                log::warn!("bad NAND page found: {pageno:#x} (from block {})", pageno / ppb);
                rpt.add_info(format!("Bad NAND page {pageno:#x}"));
            }
            report.bad_pages.append(&mut bad_pages);
            report.pages += block_end - block_start;

            rpt.inc();
            block_start = block_end;
        }

        log::info!("Writing footer");
        let footer = footer::build(self.keys);
        file.write_all(&footer)?;
        file.close()?;
        rpt.close();

        let keys_path = path.with_file_name(KEYS_FILE_NAME);
        report.keys_written = match self.write_keys(&keys_path, &footer) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{}: could not write keys: {e}", keys_path.display());
                false
            }
        };

        Ok(report)
    }

    fn write_keys(&mut self, path: &Path, footer: &[u8]) -> Result<()> {
        let mut file =
            ResilientFile::open(&mut self.storage, path, OpenMode::CreateWrite, self.policy)?;
        file.write_all(footer)?;
        file.close()
    }

    /// Restore `range` from the image at `path`.
    ///
    /// The image's key block is compared against this console's before anything is changed.
    /// Pages below the minimum protected page are skipped. Blocks are erased as they are
    /// reached, then every page is programmed verbatim, without ECC correction.
    ///
    /// Only pages the subsystem may write can be restored, so the range must lie within the
    /// device (which rules out bank 0 of a dual-bank chip).
    pub fn restore(&mut self, range: BackupRange, path: &Path) -> Result<()> {
        range.check()?;
        let nand = self.nand;
        let layout = nand.layout();
        if range.end > layout.max_page() {
            return Err(Error::OutOfRange(range.end));
        }
        let ppb = layout.pages_per_block;
        let mut file = ResilientFile::open(&mut self.storage, path, OpenMode::Read, self.policy)?;

        log::info!("Checking {} against this console's OTP", path.display());
        file.seek(range.offset(range.end) + KEY_OFFSET as u64)?;
        let mut stored = [0u8; OTP_SIZE];
        file.read_exact(&mut stored)?;
        if stored != self.keys.otp() {
            log::error!("{}: not this console's NAND dump", path.display());
            return Err(Error::KeyMismatch);
        }

        let first = range.start.max(nand.min_page());
        if first >= range.end {
            return file.close();
        }

        let rpt = howudoin::new()
            .label("Restoring NAND blocks")
            .set_len(u64::from(BackupRange { start: first, ..range }.blocks(ppb)));

        let mut data = vec![0u8; PAGE_SIZE];
        let mut spare = [0u8; PAGE_SPARE_SIZE];
        file.seek(range.offset(first))?;
        for pageno in first..range.end {
            file.read_exact(&mut data)?;
            file.read_exact(&mut spare)?;

            if pageno % ppb == 0 {
                nand.erase_block_sync(pageno, range.addr0)?;
            }
            nand.program_page(pageno, range.addr0, &data, &spare)?;

            if (pageno + 1) % ppb == 0 || pageno + 1 == range.end {
                rpt.inc();
            }
        }

        file.close()?;
        rpt.close();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::footer::KeyMaterial;
    use super::storage::MemStorage;
    use super::*;
    use crate::irq;
    use crate::nand::sim::SimController;
    use crate::nand::{NandConfig, DEFAULT_MIN_PAGE};

    use std::sync::Arc;

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 16,
        pages_per_block: 64,
    };

    fn keys(seed: u8) -> KeyMaterial {
        KeyMaterial {
            console_id: 0x0403_ac68,
            otp: [seed; OTP_SIZE],
            seeprom: [0xA5; footer::SEEPROM_SIZE],
        }
    }

    fn page_pattern(pageno: u32) -> Vec<u8> {
        (0..PAGE_SIZE)
            .map(|i| (i as u32 ^ pageno.wrapping_mul(31)) as u8)
            .collect()
    }

    /// A NAND with its interrupt thread running, and every page programmed with a pattern
    fn setup() -> anyhow::Result<(Arc<Nand<SimController>>, SimController)> {
        let (hw, line) = SimController::new(TEST_LAYOUT);
        let sim = hw.clone();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let config = NandConfig {
            layout: TEST_LAYOUT,
            ..Default::default()
        };
        let nand = Arc::new(Nand::initialize(hw, config, tx)?);
        irq::spawn(nand.clone(), line)?;

        for pageno in 0..TEST_LAYOUT.max_page() {
            sim.load_page_with_ecc(pageno, &page_pattern(pageno));
        }
        Ok((nand, sim))
    }

    #[test]
    fn test_ranges() {
        let full = BackupRange::full(TEST_LAYOUT);
        assert_eq!(full, BackupRange::span(0, 1024));
        assert_eq!(full.offset(3), 3 * 2112);
        assert_eq!(full.blocks(64), 16);

        let bank0 = BackupRange::bank(TEST_LAYOUT, 0).unwrap();
        assert_eq!((bank0.start, bank0.end, bank0.addr0), (1024, 2048, 0));
        assert_eq!(bank0.offset(1024), 0);
        let bank1 = BackupRange::bank(TEST_LAYOUT, 1).unwrap();
        assert_eq!((bank1.start, bank1.end, bank1.addr0), (0, 1024, 1));
        assert_eq!(BackupRange::bank(TEST_LAYOUT, 2), None);

        assert_eq!(BackupRange::span(60, 130).blocks(64), 3);
        assert_eq!(BackupRange::span(5, 5).blocks(64), 0);
    }

    #[test]
    fn test_dump_restore_round_trip() -> anyhow::Result<()> {
        let (nand, sim) = setup()?;
        let keys = keys(0x11);
        let storage = MemStorage::new();
        let path = Path::new("/backup/nand.bin");

        // A correctable error gets repaired in the image
        sim.flip_bit(0x300, 100, 4);

        let range = BackupRange::full(TEST_LAYOUT);
        let mut backup = Backup::new(&nand, storage.clone(), &keys);
        let report = backup.dump(range, path)?;
        assert_eq!(report.pages, 1024);
        assert!(report.bad_pages.is_empty());
        assert!(report.keys_written);

        let image = storage.file(path).unwrap();
        assert_eq!(image.len() as u64, 1024 * RAW_PAGE_SIZE + footer::FOOTER_SIZE as u64);
        let at = range.offset(0x300) as usize;
        assert_eq!(image[at..at + PAGE_SIZE], page_pattern(0x300)[..]);
        assert_eq!(
            storage.file("/backup/keys.bin").unwrap(),
            image[image.len() - footer::FOOTER_SIZE..]
        );

        // Scribble over the whole device, then bring it back
        for pageno in 0..TEST_LAYOUT.max_page() {
            sim.load_page(pageno, &[0u8; PAGE_SIZE], &[0u8; PAGE_SPARE_SIZE]);
        }
        let programs = sim.programs();
        backup.restore(range, path)?;
        assert_eq!(sim.programs() - programs, (1024 - DEFAULT_MIN_PAGE) as usize);

        for pageno in 0..DEFAULT_MIN_PAGE {
            assert!(sim.page(pageno).0.iter().all(|&x| x == 0));
        }
        for pageno in DEFAULT_MIN_PAGE..TEST_LAYOUT.max_page() {
            let (data, spare) = sim.page(pageno);
            assert_eq!(data, page_pattern(pageno), "page {pageno:#x}");
            let at = range.offset(pageno) as usize + PAGE_SIZE;
            assert_eq!(spare, image[at..at + PAGE_SPARE_SIZE]);
        }
        Ok(())
    }

    #[test]
    fn test_bad_pages_reported() -> anyhow::Result<()> {
        let (nand, sim) = setup()?;
        let keys = keys(0x22);

        // Two flips in one sub-page can't be corrected
        sim.flip_bit(0x250, 10, 1);
        sim.flip_bit(0x250, 20, 3);

        let mut backup = Backup::new(&nand, MemStorage::new(), &keys);
        let report = backup.dump(BackupRange::span(0x240, 0x280), Path::new("/nand.bin"))?;
        assert_eq!(report.pages, 0x40);
        assert_eq!(report.bad_pages, [0x250]);
        Ok(())
    }

    #[test]
    fn test_restore_key_mismatch() -> anyhow::Result<()> {
        let (nand, sim) = setup()?;
        let storage = MemStorage::new();
        let path = Path::new("/nand.bin");
        let range = BackupRange::span(0x200, 0x300);

        let theirs = keys(0x33);
        Backup::new(&nand, storage.clone(), &theirs).dump(range, path)?;

        let ours = keys(0x44);
        let (programs, erases) = (sim.programs(), sim.erases());
        assert_eq!(
            Backup::new(&nand, storage, &ours).restore(range, path),
            Err(Error::KeyMismatch)
        );
        assert_eq!(sim.programs(), programs);
        assert_eq!(sim.erases(), erases);
        Ok(())
    }

    #[test]
    fn test_dump_survives_storage_faults() -> anyhow::Result<()> {
        let (nand, _sim) = setup()?;
        let keys = keys(0x55);
        let range = BackupRange::span(0x200, 0x300);
        let path = Path::new("/nand.bin");

        let clean = MemStorage::new();
        Backup::new(&nand, clean.clone(), &keys).dump(range, path)?;

        let flaky = MemStorage::new();
        flaky.fail_writes(3);
        let report = Backup::new(&nand, flaky.clone(), &keys).dump(range, path)?;
        assert!(report.keys_written);
        assert_eq!(flaky.reinits(), 3);
        assert_eq!(flaky.file(path), clean.file(path));
        Ok(())
    }

    #[test]
    fn test_dump_rewinds_mid_block() -> anyhow::Result<()> {
        let (nand, _sim) = setup()?;
        let keys = keys(0x5a);
        let range = BackupRange::span(0x200, 0x300);
        let path = Path::new("/nand.bin");

        let clean = MemStorage::new();
        Backup::new(&nand, clean.clone(), &keys).dump(range, path)?;

        // Each page is two writes, so this tears the spare of page 50 of the first block
        let flaky = MemStorage::new();
        flaky.fail_write_after(101);
        let report = Backup::new(&nand, flaky.clone(), &keys).dump(range, path)?;
        assert_eq!(flaky.reinits(), 1);
        assert_eq!(report.pages, 0x100);
        assert!(report.bad_pages.is_empty());
        assert_eq!(flaky.file(path), clean.file(path));
        Ok(())
    }

    #[test]
    fn test_restore_rejects_bad_ranges() -> anyhow::Result<()> {
        let (nand, sim) = setup()?;
        let keys = keys(0x77);
        let storage = MemStorage::new();
        let path = Path::new("/nand.bin");
        let mut backup = Backup::new(&nand, storage.clone(), &keys);

        let bank0 = BackupRange::bank(TEST_LAYOUT, 0).unwrap();
        backup.dump(bank0, path)?;
        let (programs, erases) = (sim.programs(), sim.erases());
        assert_eq!(backup.restore(bank0, path), Err(Error::OutOfRange(2048)));
        assert_eq!(sim.programs(), programs);
        assert_eq!(sim.erases(), erases);

        let backwards = BackupRange::span(5, 3);
        assert_eq!(backup.restore(backwards, path), Err(Error::OutOfRange(5)));
        assert_eq!(backup.dump(backwards, path), Err(Error::OutOfRange(5)));
        Ok(())
    }

    #[test]
    fn test_bounded_policy_exhausted() -> anyhow::Result<()> {
        let (nand, _sim) = setup()?;
        let keys = keys(0x66);
        let storage = MemStorage::new();
        storage.fail_writes(usize::MAX);

        let result = Backup::new(&nand, storage, &keys)
            .policy(RetryPolicy::bounded(1))
            .dump(BackupRange::span(0x200, 0x240), Path::new("/nand.bin"));
        assert_eq!(
            result,
            Err(Error::RetriesExhausted {
                tries: 2,
                source: FsError::ShortTransfer
            })
        );
        Ok(())
    }
}
