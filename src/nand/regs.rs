//! Register-level protocol of the NAND flash controller.
//!
//! Every operation is a sequence of address, DMA and command register writes. Commands with
//! [CommandFlags::IRQ] complete asynchronously through the controller interrupt; the rest are
//! waited on with [busy_wait].

use super::{BusAddr, Hardware, PAGE_SIZE, PAGE_SPARE_SIZE};
use crate::error::{Error, Result};

use bitflags::bitflags;

/// Controller registers, by offset from the controller base
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Reg {
    Cmd = 0x00,
    Conf = 0x04,
    Addr0 = 0x08,
    Addr1 = 0x0c,
    Data = 0x10,
    Ecc = 0x14,
}

/// Bus bridges that must be flushed around DMA
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Bridge {
    /// The NAND controller's side of the bus
    Nand,

    /// The CPU's side of the bus
    Starlet,
}

pub const NAND_RESET: u32 = 0xff;
pub const NAND_CHIPID: u32 = 0x90;
pub const NAND_GETSTATUS: u32 = 0x70;
pub const NAND_ERASE_PRE: u32 = 0x60;
pub const NAND_ERASE_POST: u32 = 0xd0;
pub const NAND_READ_PRE: u32 = 0x00;
pub const NAND_READ_POST: u32 = 0x30;
pub const NAND_WRITE_PRE: u32 = 0x80;
pub const NAND_WRITE_POST: u32 = 0x10;

/// Set in the command register while the controller is working on a command
pub const NAND_BUSY_MASK: u32 = 0x8000_0000;
/// Set in the command register when the last command failed
pub const NAND_ERROR: u32 = 0x2000_0000;

/// Enable value for the configuration register
pub const NAND_CONF_ENABLE: u32 = 0x0800_0000;
/// Timing parameters for the 512MB flash chips
pub const NAND_CONF_TIMINGS: u32 = 0x4b3e_0e7f;

/// Length of the chip ID and status payloads
pub const NAND_INFO_SIZE: usize = 0x40;

/// Spare (ECC) DMA buffers must be aligned to this, or the ECC bytes get corrupted
pub const SPARE_ALIGN: u32 = 128;

/// Transfer length for a full page plus its spare area
const PAGE_TRANSFER: u32 = (PAGE_SIZE + PAGE_SPARE_SIZE) as u32;

bitflags! {
    /// Flag bits of a command word
    pub struct CommandFlags: u32 {
        /// Raise the controller interrupt when the command completes
        const IRQ  = 0x4000_0000;
        /// Wait for the flash to become ready
        const WAIT = 0x0000_8000;
        /// DMA from memory to the flash
        const WR   = 0x0000_4000;
        /// DMA from the flash to memory
        const RD   = 0x0000_2000;
        /// Compute ECC over the transfer
        const ECC  = 0x0000_1000;
    }
}

/// Compose a command word
pub fn command_word(opcode: u32, chip_mask: u32, flags: CommandFlags, num_bytes: u32) -> u32 {
    NAND_BUSY_MASK | (chip_mask << 24) | (opcode << 16) | flags.bits() | num_bytes
}

/// Issue a command. The command register is cleared twice first, so the controller always sees
/// a fresh command.
pub fn send_command<H: Hardware>(
    hw: &mut H,
    opcode: u32,
    chip_mask: u32,
    flags: CommandFlags,
    num_bytes: u32,
) {
    let cmd = command_word(opcode, chip_mask, flags, num_bytes);
    log::debug!("send_command({opcode:#x}, {chip_mask:#x}, {flags:?}, {num_bytes:#x}) -> {cmd:#010x}");

    hw.write32(Reg::Cmd, 0x7fff_ffff);
    hw.write32(Reg::Cmd, 0);
    hw.write32(Reg::Cmd, cmd);
}

/// Program the address registers; `None` leaves a register as it is
pub fn set_address<H: Hardware>(hw: &mut H, page_off: Option<u32>, pageno: Option<u32>) {
    if let Some(page_off) = page_off {
        hw.write32(Reg::Addr0, page_off);
    }
    if let Some(pageno) = pageno {
        hw.write32(Reg::Addr1, pageno);
    }
}

/// Check that `addr` can be used as the spare (ECC) DMA buffer
pub fn check_spare_alignment(addr: BusAddr) -> Result<()> {
    if addr % SPARE_ALIGN != 0 {
        return Err(Error::MisalignedBuffer {
            addr,
            align: SPARE_ALIGN,
        });
    }
    Ok(())
}

/// Program the DMA pointers; `None` leaves a channel as it is.
///
/// A misaligned spare pointer is programmed anyway. The controller doesn't fault on it, it
/// silently corrupts the ECC bytes, so callers that care should use [check_spare_alignment]
/// first.
pub fn setup_dma<H: Hardware>(hw: &mut H, data: Option<BusAddr>, spare: Option<BusAddr>) {
    if let Some(data) = data {
        hw.write32(Reg::Data, data);
    }
    if let Some(spare) = spare {
        if let Err(e) = check_spare_alignment(spare) {
            log::warn!("NAND: spare buffer {e}, data will be corrupted");
        }
        hw.write32(Reg::Ecc, spare);
    }
}

/// Spin until the controller is idle, then make its DMA writes visible to the CPU.
///
/// A reported error is only logged; verifying the data is left to the ECC check.
pub fn busy_wait<H: Hardware>(hw: &mut H) {
    while hw.read32(Reg::Cmd) & NAND_BUSY_MASK != 0 {
        std::hint::spin_loop();
    }
    if hw.read32(Reg::Cmd) & NAND_ERROR != 0 {
        log::error!("NAND: Error on wait");
    }
    hw.flush_from(Bridge::Nand);
    hw.flush_to(Bridge::Starlet);
}

/// Reset the flash and (re)configure the controller
pub fn reset<H: Hardware>(hw: &mut H) {
    log::debug!("nand_reset()");
    send_command(hw, NAND_RESET, 0, CommandFlags::WAIT, 0);
    busy_wait(hw);
    hw.write32(Reg::Conf, NAND_CONF_ENABLE);
    hw.write32(Reg::Conf, NAND_CONF_TIMINGS);
}

/// Start reading the chip ID into `dst`
pub fn issue_get_id<H: Hardware>(hw: &mut H, dst: BusAddr) {
    set_address(hw, Some(0), Some(0));
    hw.dc_invalidate(dst, NAND_INFO_SIZE);
    setup_dma(hw, Some(dst), None);
    send_command(
        hw,
        NAND_CHIPID,
        1,
        CommandFlags::IRQ | CommandFlags::RD,
        NAND_INFO_SIZE as u32,
    );
}

/// Start reading the chip status into `dst`
pub fn issue_get_status<H: Hardware>(hw: &mut H, dst: BusAddr) {
    hw.mem_write(dst, &[0]);
    hw.dc_invalidate(dst, NAND_INFO_SIZE);
    setup_dma(hw, Some(dst), None);
    send_command(
        hw,
        NAND_GETSTATUS,
        0,
        CommandFlags::IRQ | CommandFlags::RD,
        NAND_INFO_SIZE as u32,
    );
}

/// Start reading a page into the given buffers
pub fn issue_read<H: Hardware>(
    hw: &mut H,
    pageno: u32,
    data: Option<BusAddr>,
    spare: Option<BusAddr>,
    addr0: u32,
) {
    set_address(hw, Some(addr0), Some(pageno));
    send_command(hw, NAND_READ_PRE, 0x1f, CommandFlags::empty(), 0);

    if let Some(data) = data {
        hw.dc_invalidate(data, PAGE_SIZE);
    }
    if let Some(spare) = spare {
        hw.dc_invalidate(spare, super::ECC_BUFFER_SIZE);
    }

    busy_wait(hw);
    setup_dma(hw, data, spare);
    send_command(
        hw,
        NAND_READ_POST,
        0,
        CommandFlags::IRQ | CommandFlags::WAIT | CommandFlags::RD | CommandFlags::ECC,
        PAGE_TRANSFER,
    );
}

/// Start programming a page from the given buffers. No protection checks happen here.
pub fn issue_write<H: Hardware>(
    hw: &mut H,
    pageno: u32,
    data: Option<BusAddr>,
    spare: Option<BusAddr>,
    addr0: u32,
) {
    if let Some(data) = data {
        hw.dc_flush(data, PAGE_SIZE);
    }
    if let Some(spare) = spare {
        hw.dc_flush(spare, PAGE_SPARE_SIZE);
    }
    hw.flush_to(Bridge::Nand);

    set_address(hw, Some(addr0), Some(pageno));
    setup_dma(hw, data, spare);
    send_command(hw, NAND_WRITE_PRE, 0x1f, CommandFlags::WR, PAGE_TRANSFER);
    busy_wait(hw);
    send_command(
        hw,
        NAND_WRITE_POST,
        0,
        CommandFlags::IRQ | CommandFlags::WAIT,
        0,
    );
}

/// Start erasing the block containing `pageno`. No protection checks happen here.
pub fn issue_erase<H: Hardware>(hw: &mut H, pageno: u32, addr0: u32) {
    set_address(hw, Some(addr0), Some(pageno));
    send_command(hw, NAND_ERASE_PRE, 0x1c, CommandFlags::empty(), 0);
    busy_wait(hw);
    send_command(
        hw,
        NAND_ERASE_POST,
        0,
        CommandFlags::IRQ | CommandFlags::WAIT,
        0,
    );
}
