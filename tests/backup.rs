//! Backing up to and restoring from a directory on the host, through the public API only.

use starlet_nand::backup::footer::{self, KeyMaterial, FOOTER_SIZE, OTP_SIZE, SEEPROM_SIZE};
use starlet_nand::backup::storage::{HostStorage, Storage};
use starlet_nand::backup::{Backup, BackupRange, RAW_PAGE_SIZE};
use starlet_nand::irq;
use starlet_nand::nand::sim::SimController;
use starlet_nand::nand::{Nand, NandConfig, NandLayout, DEFAULT_MIN_PAGE, PAGE_SIZE};
use starlet_nand::Error;

use pretty_assertions::assert_eq;
use std::fs;
use std::path::Path;
use std::sync::Arc;

const LAYOUT: NandLayout = NandLayout {
    blocks: 16,
    pages_per_block: 64,
};

fn console(otp: u8) -> KeyMaterial {
    KeyMaterial {
        console_id: 0x0badcafe,
        otp: [otp; OTP_SIZE],
        seeprom: [0x42; SEEPROM_SIZE],
    }
}

fn start() -> anyhow::Result<(Arc<Nand<SimController>>, SimController)> {
    let (hw, line) = SimController::new(LAYOUT);
    let sim = hw.clone();
    let (tx, _rx) = crossbeam_channel::unbounded();
    let config = NandConfig {
        layout: LAYOUT,
        ..Default::default()
    };
    let nand = Arc::new(Nand::initialize(hw, config, tx)?);
    irq::spawn(nand.clone(), line)?;
    Ok((nand, sim))
}

#[test]
fn test_host_round_trip() -> anyhow::Result<()> {
    let (nand, sim) = start()?;
    for pageno in 0..LAYOUT.max_page() {
        sim.load_page_with_ecc(pageno, &vec![pageno as u8; PAGE_SIZE]);
    }

    let sd = tempfile::tempdir()?;
    fs::create_dir(sd.path().join("backups"))?;
    let mut storage = HostStorage::new(sd.path());
    storage.mount()?;

    let keys = console(0x77);
    let range = BackupRange::full(LAYOUT);
    let image_path = Path::new("/backups/nand.bin");
    let mut backup = Backup::new(&nand, storage, &keys);
    let report = backup.dump(range, image_path)?;
    assert!(report.bad_pages.is_empty());
    assert!(report.keys_written);

    let image = fs::read(sd.path().join("backups/nand.bin"))?;
    assert_eq!(
        image.len() as u64,
        u64::from(LAYOUT.max_page()) * RAW_PAGE_SIZE + FOOTER_SIZE as u64
    );
    let keys_bin = fs::read(sd.path().join("backups/keys.bin"))?;
    assert_eq!(keys_bin, image[image.len() - FOOTER_SIZE..]);
    assert_eq!(footer::parse(&keys_bin)?, keys);

    // Wipe everything writable, then restore
    for pageno in DEFAULT_MIN_PAGE..LAYOUT.max_page() {
        sim.load_page(pageno, &[0; PAGE_SIZE], &[0; 64]);
    }
    backup.restore(range, image_path)?;
    for pageno in DEFAULT_MIN_PAGE..LAYOUT.max_page() {
        assert!(
            sim.page(pageno).0.iter().all(|&x| x == pageno as u8),
            "page {pageno:#x} not restored"
        );
    }
    Ok(())
}

#[test]
fn test_host_foreign_backup_refused() -> anyhow::Result<()> {
    let (nand, sim) = start()?;
    let sd = tempfile::tempdir()?;
    let mut storage = HostStorage::new(sd.path());
    storage.mount()?;

    let range = BackupRange::span(DEFAULT_MIN_PAGE, DEFAULT_MIN_PAGE + 64);
    let theirs = console(1);
    Backup::new(&nand, storage.clone(), &theirs).dump(range, Path::new("nand.bin"))?;

    let ours = console(2);
    let programs = sim.programs();
    let result = Backup::new(&nand, storage, &ours).restore(range, Path::new("nand.bin"));
    assert_eq!(result, Err(Error::KeyMismatch));
    assert_eq!(sim.programs(), programs);
    Ok(())
}

#[test]
fn test_host_missing_image() -> anyhow::Result<()> {
    let (nand, _sim) = start()?;
    let sd = tempfile::tempdir()?;
    let mut storage = HostStorage::new(sd.path());
    storage.mount()?;

    let keys = console(3);
    let result = Backup::new(&nand, storage, &keys)
        .restore(BackupRange::full(LAYOUT), Path::new("missing.bin"));
    assert!(matches!(result, Err(Error::Storage(_))));
    Ok(())
}
