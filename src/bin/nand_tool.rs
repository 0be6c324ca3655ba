//! A tool for exercising the NAND subsystem against a simulated controller.
//!
//! The NAND contents come from (and optionally go back to) a raw image file, and a host
//! directory stands in for the SD card that backups are written to.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::Receiver;

use std::fs::{self, File};
use std::num::ParseIntError;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use starlet_nand::{
    backup::{
        footer::{self, KeyMaterial, OTP_SIZE, SEEPROM_SIZE},
        storage::{HostStorage, RetryPolicy, Storage},
        Backup, BackupRange,
    },
    ecc::EccOutcome,
    ipc::{Command as IpcCommand, Reply, Request},
    irq,
    nand::{sim::SimController, Hardware, Nand, NandConfig, NandLayout, PAGE_SIZE, PAGE_SPARE_SIZE},
};

/// Accept page numbers in decimal or (with a `0x` prefix) hex
fn parse_number(s: &str) -> Result<u32, ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

#[derive(Args, Debug)]
struct NandOptions {
    /// Layout of the NAND to simulate
    #[clap(long, default_value = "4096x64")]
    sim_layout: NandLayout,

    /// Path to the NAND image to use
    #[clap(long)]
    sim_path: Option<PathBuf>,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

/// A running NAND subsystem
struct Device {
    nand: Arc<Nand<SimController>>,
    sim: SimController,
    replies: Receiver<Reply>,
}

impl NandOptions {
    fn open(&self) -> Result<Device> {
        let (sim, line) = SimController::new(self.sim_layout);
        if let Some(path) = &self.sim_path {
            sim.load(&mut File::open(path).context(path.display().to_string())?)?;
        }

        let (tx, replies) = crossbeam_channel::unbounded();
        let config = NandConfig {
            layout: self.sim_layout,
            ..Default::default()
        };
        let nand = Arc::new(Nand::initialize(sim.clone(), config, tx)?);
        irq::spawn(nand.clone(), line)?;

        Ok(Device { nand, sim, replies })
    }

    fn cleanup(&self, device: Device) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                device.sim.save(&mut File::create(path)?)?;
            }
        }

        Ok(())
    }
}

#[derive(Args, Debug)]
struct StorageOptions {
    /// Directory standing in for the root of the SD card
    #[clap(long, default_value = ".")]
    sd_root: PathBuf,

    /// Give up on a storage operation after this many retries (default: never)
    #[clap(long)]
    retries: Option<usize>,

    /// A `keys.bin` holding this console's key material
    #[clap(long)]
    keys: Option<PathBuf>,
}

impl StorageOptions {
    fn keys(&self) -> Result<KeyMaterial> {
        match &self.keys {
            Some(path) => {
                let contents = fs::read(path).context(path.display().to_string())?;
                Ok(footer::parse(&contents)?)
            }
            None => {
                log::warn!("No --keys given, using blank key material");
                Ok(KeyMaterial {
                    console_id: 0,
                    otp: [0; OTP_SIZE],
                    seeprom: [0; SEEPROM_SIZE],
                })
            }
        }
    }

    fn sd_card(&self) -> Result<HostStorage> {
        let mut sd = HostStorage::new(&self.sd_root);
        sd.mount()
            .with_context(|| format!("mounting {}", self.sd_root.display()))?;
        Ok(sd)
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            delay: Duration::from_millis(100),
            max_retries: self.retries,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the chip ID and status
    Info,

    /// Back up the NAND to a file on the SD card, with a keys.bin next to it
    Dump {
        /// Path of the image, relative to the SD card root
        path: PathBuf,

        /// Dump only one bank of a dual-bank chip
        #[clap(long)]
        bank: Option<u32>,
    },

    /// Restore the NAND from a full backup taken on this console
    Restore {
        /// Path of the image, relative to the SD card root
        path: PathBuf,
    },

    /// Read one page, with ECC correction, and print it
    ReadPage {
        #[clap(value_parser = parse_number)]
        page: u32,
    },

    /// Check the ECC of every page; this is a read-only operation
    Scan,

    /// Print the minimum writable page, after setting it if a value is given
    MinPage {
        #[clap(value_parser = parse_number)]
        value: Option<u32>,
    },
}

fn hexdump(bytes: &[u8]) {
    for (i, line) in bytes.chunks(32).enumerate() {
        let hex: String = line.iter().map(|x| format!("{x:02x}")).collect();
        println!("{:04x}: {hex}", i * 32);
    }
}

impl Command {
    fn execute(self, device: &Device, storage: &StorageOptions) -> Result<()> {
        let nand = &*device.nand;
        let layout = nand.layout();

        match self {
            Command::Info => {
                let dst = nand.staging().data;
                let mut info = [0u8; 8];

                nand.get_id(dst);
                nand.wait();
                nand.with_hardware(|hw| hw.mem_read(dst, &mut info));
                println!("Chip ID: {:02x?}", &info[..5]);

                nand.get_status(dst);
                nand.wait();
                nand.with_hardware(|hw| hw.mem_read(dst, &mut info[..1]));
                println!("Status:  {:02x}", info[0]);
                println!(
                    "Layout:  {} blocks of {} pages, min page {:#x}",
                    layout.blocks,
                    layout.pages_per_block,
                    nand.min_page()
                );
            }

            Command::Dump { path, bank } => {
                let range = match bank {
                    Some(bank) => BackupRange::bank(layout, bank)
                        .ok_or_else(|| anyhow::anyhow!("no such bank: {bank}"))?,
                    None => BackupRange::full(layout),
                };
                let keys = storage.keys()?;
                let mut backup = Backup::new(nand, storage.sd_card()?, &keys)
                    .policy(storage.policy());

                let report = backup.dump(range, &path)?;
                println!("Dumped {} pages", report.pages);
                for page in &report.bad_pages {
                    println!("  bad page: {page:#x}");
                }
                if !report.keys_written {
                    println!("Writing keys.bin failed");
                }
            }

            Command::Restore { path } => {
                let range = BackupRange::full(layout);
                let keys = storage.keys()?;
                Backup::new(nand, storage.sd_card()?, &keys)
                    .policy(storage.policy())
                    .restore(range, &path)?;
                println!("Restored pages {:#x}..{:#x}", nand.min_page().max(range.start), range.end);
            }

            Command::ReadPage { page } => {
                anyhow::ensure!(page < layout.max_page(), "page {page:#x} out of range");
                let mut data = vec![0u8; PAGE_SIZE];
                let mut spare = [0u8; PAGE_SPARE_SIZE];
                let outcome = nand.read_corrected(page, 0, &mut data, &mut spare);
                println!("Page {page:#x}: {outcome:?}");
                hexdump(&data);
                println!("Spare:");
                hexdump(&spare);
            }

            Command::Scan => {
                let rpt = howudoin::new()
                    .label("Scanning pages")
                    .set_len(u64::from(layout.max_page()));

                let mut data = vec![0u8; PAGE_SIZE];
                let mut spare = [0u8; PAGE_SPARE_SIZE];
                let (mut corrected, mut bad) = (Vec::new(), Vec::new());
                for page in 0..layout.max_page() {
                    match nand.read_corrected(page, 0, &mut data, &mut spare) {
                        EccOutcome::Ok => (),
                        EccOutcome::Corrected => corrected.push(page),
                        EccOutcome::Uncorrectable => bad.push(page),
                    }
                    rpt.inc();
                }
                rpt.close();

                println!("{} corrected, {} uncorrectable", corrected.len(), bad.len());
                for page in bad {
                    println!("  bad page: {page:#x}");
                }
            }

            Command::MinPage { value } => {
                let mut tag = 0;
                let mut request = |command: IpcCommand| -> Result<Reply> {
                    tag += 1;
                    nand.dispatch(Request {
                        code: 1,
                        tag,
                        command,
                    });
                    Ok(device.replies.recv_timeout(Duration::from_secs(1))?)
                };

                if let Some(value) = value {
                    let reply = request(IpcCommand::SetMinPage(value))?;
                    anyhow::ensure!(reply.status == 0, "minimum page {value:#x} refused");
                }
                let reply = request(IpcCommand::GetMinPage)?;
                println!("Minimum writable page: {:#x}", reply.value.unwrap_or_default());
            }
        }

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    /// Where backups go
    #[clap(flatten)]
    storage: StorageOptions,

    /// The command to run against this NAND
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    let device = args.nand.open()?;
    let result = args.cmd.execute(&device, &args.storage);

    howudoin::disable();
    thread::sleep(Duration::from_millis(10)); // Give howudoin time to shut down

    result?;
    args.nand.cleanup(device)?;
    Ok(())
}
