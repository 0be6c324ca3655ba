//! The NAND subsystem context and its page primitives.
//!
//! A [Nand] is constructed once per controller and shared between the foreground (which issues
//! operations) and the interrupt thread (which completes them). Only one hardware operation may
//! be outstanding at a time.

use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::ecc::{self, EccOutcome};
use crate::error::{Error, Result};
use crate::ipc::{PendingRequest, Reply, ReplySink};
use crate::irq::Completion;

mod completion;
mod dispatch;
pub mod regs;
pub mod sim;

pub use regs::{Bridge, Reg};

pub const PAGE_SIZE: usize = 2048;
pub const PAGE_SPARE_SIZE: usize = 64;
/// Spare area plus the 16 bytes of ECC the controller computes on reads
pub const ECC_BUFFER_SIZE: usize = PAGE_SPARE_SIZE + 16;
pub const ECC_BUFFER_ALLOC: usize = PAGE_SPARE_SIZE + 32;
/// Pages per erase block
pub const BLOCK_SIZE: u32 = 64;
pub const NAND_MAX_PAGE: u32 = 0x40000;

/// Pages below this are protected by default (boot1 and boot2)
pub const DEFAULT_MIN_PAGE: u32 = 0x200;

/// An address in the controller's DMA-visible memory
pub type BusAddr = u32;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the size of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
}

impl NandLayout {
    /// Total number of pages; valid page numbers are `0..max_page()`
    pub fn max_page(&self) -> u32 {
        self.blocks * self.pages_per_block
    }
}

impl Default for NandLayout {
    fn default() -> Self {
        NandLayout {
            blocks: NAND_MAX_PAGE / BLOCK_SIZE,
            pages_per_block: BLOCK_SIZE,
        }
    }
}

/// Parse strings like "BLOCKSxPAGES"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block]: [&str; 2] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block: u32 = pages_per_block.parse()?;
        anyhow::ensure!(
            pages_per_block.is_power_of_two(),
            "pages per block must be a power of two"
        );

        Ok(NandLayout {
            blocks,
            pages_per_block,
        })
    }
}

/// Access to the NAND controller and the memory it does DMA to.
///
/// This is everything the subsystem needs from the SoC: the controller registers, the bus
/// bridge and data cache maintenance around DMA, and CPU access to DMA-visible memory.
pub trait Hardware: Send {
    fn read32(&mut self, reg: Reg) -> u32;
    fn write32(&mut self, reg: Reg, value: u32);

    /// Drain writes buffered in a bus bridge
    fn flush_from(&mut self, bridge: Bridge);
    /// Make a bus bridge see everything written so far
    fn flush_to(&mut self, bridge: Bridge);

    /// Write back the data cache over a range
    fn dc_flush(&mut self, addr: BusAddr, len: usize);
    /// Drop the data cache over a range
    fn dc_invalidate(&mut self, addr: BusAddr, len: usize);

    fn mem_read(&mut self, addr: BusAddr, buf: &mut [u8]);
    fn mem_write(&mut self, addr: BusAddr, data: &[u8]);
}

/// The subsystem's own DMA buffers, reserved for its whole lifetime
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StagingBuffers {
    /// [PAGE_SIZE] bytes, 32-byte aligned
    pub data: BusAddr,

    /// [ECC_BUFFER_ALLOC] bytes, 128-byte aligned
    pub spare: BusAddr,
}

impl StagingBuffers {
    fn validate(&self) -> Result<()> {
        if self.data % 32 != 0 {
            return Err(Error::MisalignedBuffer {
                addr: self.data,
                align: 32,
            });
        }
        regs::check_spare_alignment(self.spare)
    }
}

impl Default for StagingBuffers {
    fn default() -> Self {
        StagingBuffers {
            data: 0x1000,
            spare: 0x1800,
        }
    }
}

/// Construction-time parameters of the subsystem
#[derive(Debug, Copy, Clone, Default)]
pub struct NandConfig {
    pub layout: NandLayout,
    pub staging: StagingBuffers,
}

/// Host-side copy of a page, used while correcting it
struct Scratch {
    data: [u8; PAGE_SIZE],
    ecc: [u8; ECC_BUFFER_ALLOC],
}

/// Everything the foreground and the interrupt handler share
struct State<H> {
    hw: H,
    layout: NandLayout,
    staging: StagingBuffers,
    pending: Option<PendingRequest>,
    min_page: u32,
    last_page_read: u32,
    scratch: Box<Scratch>,
}

impl<H> State<H> {
    /// Is `pageno` allowed to be written or erased?
    fn check_writable(&self, pageno: u32) -> Result<()> {
        if pageno < self.min_page || pageno >= self.layout.max_page() {
            return Err(Error::Protected(pageno));
        }
        Ok(())
    }
}

/// The NAND subsystem: one per controller
pub struct Nand<H> {
    state: Mutex<State<H>>,
    completion: Completion,
    replies: Box<dyn ReplySink>,
}

impl<H: Hardware> Nand<H> {
    /// Set up the subsystem and reset the controller.
    ///
    /// Replies to requests accepted by [Nand::dispatch] are posted to `replies`.
    pub fn initialize(
        mut hw: H,
        config: NandConfig,
        replies: impl ReplySink + 'static,
    ) -> Result<Self> {
        config.staging.validate()?;
        regs::reset(&mut hw);

        let state = State {
            hw,
            layout: config.layout,
            staging: config.staging,
            pending: None,
            min_page: DEFAULT_MIN_PAGE,
            last_page_read: 0,
            scratch: Box::new(Scratch {
                data: [0; PAGE_SIZE],
                ecc: [0; ECC_BUFFER_ALLOC],
            }),
        };

        Ok(Self {
            state: Mutex::new(state),
            completion: Completion::default(),
            replies: Box::new(replies),
        })
    }

    /// Enter the critical section shared with the interrupt handler
    fn state(&self) -> MutexGuard<'_, State<H>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn post(&self, reply: Reply) {
        self.replies.post(reply);
    }

    pub fn layout(&self) -> NandLayout {
        self.state().layout
    }

    pub fn staging(&self) -> StagingBuffers {
        self.state().staging
    }

    /// The lowest page that may be written or erased
    pub fn min_page(&self) -> u32 {
        self.state().min_page
    }

    /// Is a dispatched request still waiting for its completion?
    pub fn is_pending(&self) -> bool {
        self.state().pending.is_some()
    }

    /// Run `f` with exclusive access to the hardware
    pub fn with_hardware<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        f(&mut self.state().hw)
    }

    /// Reset the flash chip, synchronously
    pub fn reset(&self) {
        regs::reset(&mut self.state().hw);
    }

    /// Start reading the chip ID into `dst`; completes with an interrupt
    pub fn get_id(&self, dst: BusAddr) {
        self.completion.clear();
        regs::issue_get_id(&mut self.state().hw, dst);
    }

    /// Start reading the chip status into `dst`; completes with an interrupt
    pub fn get_status(&self, dst: BusAddr) {
        self.completion.clear();
        regs::issue_get_status(&mut self.state().hw, dst);
    }

    /// Start reading a page; completes with an interrupt.
    ///
    /// `addr0` goes to the page offset register, which the backup engine uses to select a bank.
    pub fn read_page(
        &self,
        pageno: u32,
        data: Option<BusAddr>,
        spare: Option<BusAddr>,
        addr0: u32,
    ) {
        self.completion.clear();
        let mut state = self.state();
        state.last_page_read = pageno;
        regs::issue_read(&mut state.hw, pageno, data, spare, addr0);
    }

    /// Start programming a page; completes with an interrupt.
    ///
    /// Pages below [Nand::min_page] (or past the end of the device) are refused with
    /// [Error::Protected] and the hardware is not touched.
    pub fn write_page(
        &self,
        pageno: u32,
        data: Option<BusAddr>,
        spare: Option<BusAddr>,
        addr0: u32,
    ) -> Result<()> {
        self.completion.clear();
        log::debug!("nand_write_page({pageno}, {data:?}, {spare:?})");
        let mut state = self.state();
        if let Err(e) = state.check_writable(pageno) {
            log::error!("nand_write to page {pageno} forbidden");
            return Err(e);
        }
        regs::issue_write(&mut state.hw, pageno, data, spare, addr0);
        Ok(())
    }

    /// Start erasing the block containing `pageno`; completes with an interrupt.
    ///
    /// Protected exactly like [Nand::write_page].
    pub fn erase_block(&self, pageno: u32, addr0: u32) -> Result<()> {
        self.completion.clear();
        log::debug!("nand_erase_block({pageno})");
        let mut state = self.state();
        if let Err(e) = state.check_writable(pageno) {
            log::error!("nand_erase to page {pageno} forbidden");
            return Err(e);
        }
        regs::issue_erase(&mut state.hw, pageno, addr0);
        Ok(())
    }

    /// Block until the interrupt for the last issued operation has been handled
    pub fn wait(&self) {
        self.completion.wait();
    }

    /// Read a page through the staging buffers, wait for it, and correct it.
    ///
    /// `data` receives [PAGE_SIZE] bytes and `spare` receives [PAGE_SPARE_SIZE] bytes.
    pub fn read_corrected(
        &self,
        pageno: u32,
        addr0: u32,
        data: &mut [u8],
        spare: &mut [u8],
    ) -> EccOutcome {
        let staging = self.staging();
        self.read_page(pageno, Some(staging.data), Some(staging.spare), addr0);
        self.wait();

        let mut state = self.state();
        let State { hw, scratch, .. } = &mut *state;
        hw.mem_read(staging.data, &mut scratch.data);
        hw.mem_read(staging.spare, &mut scratch.ecc);

        let outcome = ecc::correct(pageno, &mut scratch.data, &scratch.ecc);
        data.copy_from_slice(&scratch.data);
        spare.copy_from_slice(&scratch.ecc[..PAGE_SPARE_SIZE]);
        outcome
    }

    /// Program a page through the staging buffers and wait for it
    pub fn program_page(&self, pageno: u32, addr0: u32, data: &[u8], spare: &[u8]) -> Result<()> {
        let staging = self.staging();
        self.with_hardware(|hw| {
            hw.mem_write(staging.data, data);
            hw.mem_write(staging.spare, spare);
        });
        self.write_page(pageno, Some(staging.data), Some(staging.spare), addr0)?;
        self.wait();
        Ok(())
    }

    /// Erase a block and wait for it
    pub fn erase_block_sync(&self, pageno: u32, addr0: u32) -> Result<()> {
        self.erase_block(pageno, addr0)?;
        self.wait();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::irq;
    use crate::nand::sim::SimController;

    use std::sync::Arc;

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 16,
        pages_per_block: 64,
    };

    #[test]
    fn test_layout_parse() -> anyhow::Result<()> {
        let layout: NandLayout = "16x64".parse()?;
        assert_eq!(layout, TEST_LAYOUT);
        assert_eq!(layout.max_page(), 1024);
        assert!("16x63".parse::<NandLayout>().is_err());
        assert!("16".parse::<NandLayout>().is_err());
        assert_eq!(NandLayout::default().max_page(), NAND_MAX_PAGE);
        Ok(())
    }

    #[test]
    fn test_misaligned_staging_rejected() {
        let (hw, _line) = SimController::new(TEST_LAYOUT);
        let (tx, _rx) = crossbeam_channel::unbounded();
        let config = NandConfig {
            layout: TEST_LAYOUT,
            staging: StagingBuffers {
                data: 0x1000,
                spare: 0x1840,
            },
        };
        assert!(matches!(
            Nand::initialize(hw, config, tx),
            Err(Error::MisalignedBuffer { addr: 0x1840, .. })
        ));
    }

    #[test]
    fn test_write_protection() -> anyhow::Result<()> {
        let (hw, line) = SimController::new(TEST_LAYOUT);
        let sim = hw.clone();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let config = NandConfig {
            layout: TEST_LAYOUT,
            ..Default::default()
        };
        let nand = Arc::new(Nand::initialize(hw, config, tx)?);
        let _irq = irq::spawn(nand.clone(), line)?;

        let data = [0x5Au8; PAGE_SIZE];
        let spare = [0xFFu8; PAGE_SPARE_SIZE];

        let programs = sim.programs();
        assert_eq!(
            nand.program_page(DEFAULT_MIN_PAGE - 1, 0, &data, &spare),
            Err(Error::Protected(DEFAULT_MIN_PAGE - 1))
        );
        assert_eq!(
            nand.erase_block(0, 0),
            Err(Error::Protected(0))
        );
        assert_eq!(
            nand.erase_block(TEST_LAYOUT.max_page(), 0),
            Err(Error::Protected(TEST_LAYOUT.max_page()))
        );
        assert_eq!(sim.programs(), programs);

        nand.program_page(DEFAULT_MIN_PAGE, 0, &data, &spare)?;
        assert_eq!(sim.programs(), programs + 1);
        assert_eq!(sim.page(DEFAULT_MIN_PAGE).0, data);

        Ok(())
    }

    #[test]
    fn test_read_corrected() -> anyhow::Result<()> {
        let (hw, line) = SimController::new(TEST_LAYOUT);
        let sim = hw.clone();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let config = NandConfig {
            layout: TEST_LAYOUT,
            ..Default::default()
        };
        let nand = Arc::new(Nand::initialize(hw, config, tx)?);
        let _irq = irq::spawn(nand.clone(), line)?;

        let original: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        sim.load_page_with_ecc(700, &original);
        sim.flip_bit(700, 1000, 6);

        let mut data = [0u8; PAGE_SIZE];
        let mut spare = [0u8; PAGE_SPARE_SIZE];
        assert_eq!(
            nand.read_corrected(700, 0, &mut data, &mut spare),
            EccOutcome::Corrected
        );
        assert_eq!(data[..], original[..]);
        assert_eq!(spare[..], sim.page(700).1[..]);

        // An erased page passes untouched
        assert_eq!(
            nand.read_corrected(701, 0, &mut data, &mut spare),
            EccOutcome::Ok
        );
        assert!(data.is_erased());

        Ok(())
    }
}
