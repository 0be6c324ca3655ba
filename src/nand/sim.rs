//! A simulated NAND controller with an in-memory flash array, for testing purposes.
//!
//! The simulation works at the register level: commands are executed as soon as a command word
//! with the busy bit is written, DMA goes to and from a simulated bus memory, and commands with
//! [CommandFlags::IRQ] raise the interrupt line afterwards.

use super::regs::{
    CommandFlags, NAND_BUSY_MASK, NAND_CHIPID, NAND_ERASE_POST, NAND_ERASE_PRE, NAND_ERROR,
    NAND_GETSTATUS, NAND_INFO_SIZE, NAND_READ_POST, NAND_READ_PRE, NAND_RESET, NAND_WRITE_POST,
    NAND_WRITE_PRE,
};
use super::{
    Bridge, BusAddr, Hardware, NandLayout, Reg, ECC_BUFFER_SIZE, PAGE_SIZE, PAGE_SPARE_SIZE,
};
use crate::ecc;
use crate::irq::Irq;

use crossbeam_channel::{Receiver, Sender};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Bytes of each page as stored: data followed by spare
const RAW_PAGE_SIZE: usize = PAGE_SIZE + PAGE_SPARE_SIZE;

/// Size of the simulated bus memory
pub const SIM_MEMORY_SIZE: usize = 0x10000;

/// ID bytes returned by CHIPID (Samsung K9F4G08U0A)
pub const CHIP_ID: [u8; 5] = [0xec, 0xdc, 0x10, 0x95, 0x54];

/// How many of the most recent register writes are kept for inspection
pub const REGISTER_LOG_SIZE: usize = 1024;

/// First status byte: ready, not write-protected
pub const STATUS_READY: u8 = 0xe0;

#[derive(Debug)]
struct SimState {
    layout: NandLayout,

    /// All pages, [RAW_PAGE_SIZE] bytes each
    flash: Vec<u8>,

    /// DMA-visible memory
    memory: Vec<u8>,

    /// Current value of every register
    cmd: u32,
    conf: u32,
    addr0: u32,
    addr1: u32,
    data_ptr: BusAddr,
    ecc_ptr: BusAddr,

    /// Page latched by a WRITE_PRE, waiting for WRITE_POST
    write_latch: Vec<u8>,

    /// The most recent register writes, oldest first
    log: VecDeque<(Reg, u32)>,

    fail_next: bool,
    programs: usize,
    erases: usize,
}

/// A simulated NAND controller.
///
/// Clones share the same controller, so a test can keep a handle for inspection and fault
/// injection while the subsystem owns another.
#[derive(Debug, Clone)]
pub struct SimController {
    state: Arc<Mutex<SimState>>,
    irq: Sender<Irq>,
}

impl SimController {
    /// Create an erased device with the specified layout, and the receiving end of its
    /// interrupt line
    pub fn new(layout: NandLayout) -> (Self, Receiver<Irq>) {
        let pages = layout.max_page() as usize;
        let state = SimState {
            layout,
            flash: vec![0xFF; pages * RAW_PAGE_SIZE],
            memory: vec![0; SIM_MEMORY_SIZE],
            cmd: 0,
            conf: 0,
            addr0: 0,
            addr1: 0,
            data_ptr: 0,
            ecc_ptr: 0,
            write_latch: vec![0xFF; RAW_PAGE_SIZE],
            log: VecDeque::with_capacity(REGISTER_LOG_SIZE),
            fail_next: false,
            programs: 0,
            erases: 0,
        };

        let (irq, line) = crossbeam_channel::unbounded();
        let controller = Self {
            state: Arc::new(Mutex::new(state)),
            irq,
        };
        (controller, line)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialize the flash contents from a raw image of `(data, spare)` pairs
    pub fn load<R: Read>(&self, read: &mut R) -> anyhow::Result<()> {
        let mut state = self.lock();
        read.read_exact(&mut state.flash)?;
        Ok(())
    }

    /// Write the flash contents out as a raw image of `(data, spare)` pairs
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let state = self.lock();
        write.write_all(&state.flash)?;
        Ok(())
    }

    /// The `(data, spare)` contents of a page
    pub fn page(&self, pageno: u32) -> (Vec<u8>, Vec<u8>) {
        let state = self.lock();
        let raw = state.raw_page(pageno);
        (raw[..PAGE_SIZE].to_vec(), raw[PAGE_SIZE..].to_vec())
    }

    /// Overwrite a page, bypassing the controller
    pub fn load_page(&self, pageno: u32, data: &[u8], spare: &[u8]) {
        let mut state = self.lock();
        let raw = state.raw_page_mut(pageno);
        raw[..PAGE_SIZE].copy_from_slice(data);
        raw[PAGE_SIZE..].copy_from_slice(spare);
    }

    /// Overwrite a page with `data` and a spare area holding its correct ECC
    pub fn load_page_with_ecc(&self, pageno: u32, data: &[u8]) {
        let mut spare = [0xFFu8; PAGE_SPARE_SIZE];
        ecc::fill_spare(data, &mut spare);
        self.load_page(pageno, data, &spare);
    }

    /// Flip one bit of a page's data, as a worn-out cell would
    pub fn flip_bit(&self, pageno: u32, byte: usize, bit: u8) {
        self.lock().raw_page_mut(pageno)[byte] ^= 1 << bit;
    }

    /// Make the next command that raises an interrupt fail with the error bit
    pub fn fail_next_command(&self) {
        self.lock().fail_next = true;
    }

    /// How many pages have been programmed
    pub fn programs(&self) -> usize {
        self.lock().programs
    }

    /// How many blocks have been erased
    pub fn erases(&self) -> usize {
        self.lock().erases
    }

    /// The last (up to [REGISTER_LOG_SIZE]) register writes
    pub fn register_writes(&self) -> Vec<(Reg, u32)> {
        self.lock().log.iter().copied().collect()
    }

    /// The command words (with the busy bit) among the last register writes
    pub fn commands(&self) -> Vec<u32> {
        self.lock()
            .log
            .iter()
            .filter(|&&(reg, value)| reg == Reg::Cmd && value & NAND_BUSY_MASK != 0)
            .map(|&(_, value)| value)
            .collect()
    }

    /// Copy simulated memory into `buf`
    pub fn mem_slice(&self, addr: BusAddr, buf: &mut [u8]) {
        let state = self.lock();
        buf.copy_from_slice(state.memory_range(addr, buf.len()));
    }

    /// Copy `data` into simulated memory
    pub fn mem_load(&self, addr: BusAddr, data: &[u8]) {
        let mut state = self.lock();
        state.memory_range_mut(addr, data.len()).copy_from_slice(data);
    }

    /// Fill a range of simulated memory
    pub fn mem_fill(&self, addr: BusAddr, len: usize, value: u8) {
        self.lock().memory_range_mut(addr, len).fill(value);
    }
}

impl SimState {
    fn in_range(&self, pageno: u32) -> bool {
        pageno < self.layout.max_page()
    }

    fn raw_page(&self, pageno: u32) -> &[u8] {
        let begin = pageno as usize * RAW_PAGE_SIZE;
        &self.flash[begin..begin + RAW_PAGE_SIZE]
    }

    fn raw_page_mut(&mut self, pageno: u32) -> &mut [u8] {
        let begin = pageno as usize * RAW_PAGE_SIZE;
        &mut self.flash[begin..begin + RAW_PAGE_SIZE]
    }

    fn memory_range(&self, addr: BusAddr, len: usize) -> &[u8] {
        &self.memory[addr as usize..addr as usize + len]
    }

    fn memory_range_mut(&mut self, addr: BusAddr, len: usize) -> &mut [u8] {
        &mut self.memory[addr as usize..addr as usize + len]
    }

    /// Run a command word. Returns whether it succeeded.
    fn execute(&mut self, cmd: u32) -> bool {
        let opcode = (cmd >> 16) & 0xff;
        let flags = CommandFlags::from_bits_truncate(cmd);
        let num_bytes = (cmd & 0xfff) as usize;

        match opcode {
            NAND_RESET => {
                self.write_latch.fill(0xFF);
                true
            }
            NAND_CHIPID | NAND_GETSTATUS => {
                let mut info = [0u8; NAND_INFO_SIZE];
                if opcode == NAND_CHIPID {
                    info[..CHIP_ID.len()].copy_from_slice(&CHIP_ID);
                } else {
                    info[0] = STATUS_READY;
                }
                let len = num_bytes.min(NAND_INFO_SIZE);
                let dst = self.data_ptr;
                self.memory_range_mut(dst, len).copy_from_slice(&info[..len]);
                true
            }
            NAND_READ_PRE | NAND_WRITE_PRE if !self.in_range(self.addr1) => false,
            NAND_READ_PRE | NAND_ERASE_PRE => true,
            NAND_READ_POST => self.read_post(flags),
            NAND_WRITE_PRE => {
                let (data, spare) = (self.data_ptr, self.ecc_ptr);
                let mut latch = std::mem::take(&mut self.write_latch);
                latch[..PAGE_SIZE].copy_from_slice(self.memory_range(data, PAGE_SIZE));
                latch[PAGE_SIZE..].copy_from_slice(self.memory_range(spare, PAGE_SPARE_SIZE));
                self.write_latch = latch;
                true
            }
            NAND_WRITE_POST => {
                let pageno = self.addr1;
                if !self.in_range(pageno) {
                    return false;
                }
                let latch = std::mem::take(&mut self.write_latch);
                // Programming can only clear bits
                for (cell, bit) in self.raw_page_mut(pageno).iter_mut().zip(&latch) {
                    *cell &= bit;
                }
                self.write_latch = latch;
                self.write_latch.fill(0xFF);
                self.programs += 1;
                true
            }
            NAND_ERASE_POST => {
                if !self.in_range(self.addr1) {
                    return false;
                }
                let ppb = self.layout.pages_per_block;
                let first = self.addr1 & !(ppb - 1);
                for pageno in first..first + ppb {
                    self.raw_page_mut(pageno).fill(0xFF);
                }
                self.erases += 1;
                true
            }
            _ => false,
        }
    }

    /// DMA a page into memory, with the controller-computed ECC after the spare area
    fn read_post(&mut self, flags: CommandFlags) -> bool {
        let pageno = self.addr1;
        let (data_ptr, ecc_ptr) = (self.data_ptr, self.ecc_ptr);

        // Nonexistent rows float high
        let in_range = self.in_range(pageno);
        let raw = if in_range {
            self.raw_page(pageno).to_vec()
        } else {
            vec![0xFF; RAW_PAGE_SIZE]
        };
        let (data, spare) = raw.split_at(PAGE_SIZE);
        self.memory_range_mut(data_ptr, PAGE_SIZE).copy_from_slice(data);

        let ecc_len = if flags.contains(CommandFlags::ECC) {
            ECC_BUFFER_SIZE
        } else {
            PAGE_SPARE_SIZE
        };
        let ecc_buf = self.memory_range_mut(ecc_ptr, ecc_len);
        ecc_buf[..PAGE_SPARE_SIZE].copy_from_slice(spare);
        if flags.contains(CommandFlags::ECC) {
            ecc::fill_computed(data, ecc_buf);
        }
        in_range
    }
}

impl Hardware for SimController {
    fn read32(&mut self, reg: Reg) -> u32 {
        let state = self.lock();
        match reg {
            Reg::Cmd => state.cmd,
            Reg::Conf => state.conf,
            Reg::Addr0 => state.addr0,
            Reg::Addr1 => state.addr1,
            Reg::Data => state.data_ptr,
            Reg::Ecc => state.ecc_ptr,
        }
    }

    fn write32(&mut self, reg: Reg, value: u32) {
        let mut state = self.lock();
        if state.log.len() == REGISTER_LOG_SIZE {
            state.log.pop_front();
        }
        state.log.push_back((reg, value));

        match reg {
            Reg::Conf => state.conf = value,
            Reg::Addr0 => state.addr0 = value,
            Reg::Addr1 => state.addr1 = value,
            Reg::Data => state.data_ptr = value,
            Reg::Ecc => state.ecc_ptr = value,
            Reg::Cmd => {
                if value & NAND_BUSY_MASK == 0 {
                    state.cmd = value;
                    return;
                }

                let flags = CommandFlags::from_bits_truncate(value);
                let raises_irq = flags.contains(CommandFlags::IRQ);
                let fail = raises_irq && std::mem::take(&mut state.fail_next);
                let ok = !fail && state.execute(value);

                state.cmd = value & !(NAND_BUSY_MASK | NAND_ERROR);
                if !ok {
                    state.cmd |= NAND_ERROR;
                }
                drop(state);

                if raises_irq {
                    // Nobody listening means nobody is interested in completions
                    let _ = self.irq.send(Irq);
                }
            }
        }
    }

    fn flush_from(&mut self, _bridge: Bridge) {}
    fn flush_to(&mut self, _bridge: Bridge) {}
    fn dc_flush(&mut self, _addr: BusAddr, _len: usize) {}
    fn dc_invalidate(&mut self, _addr: BusAddr, _len: usize) {}

    fn mem_read(&mut self, addr: BusAddr, buf: &mut [u8]) {
        self.mem_slice(addr, buf);
    }

    fn mem_write(&mut self, addr: BusAddr, data: &[u8]) {
        self.mem_load(addr, data);
    }
}
