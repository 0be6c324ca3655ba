//! Interrupt-side completion of NAND operations.

use super::regs::{self, NAND_INFO_SIZE};
use super::{Bridge, Hardware, Nand, Reg, State, PAGE_SIZE, PAGE_SPARE_SIZE};
use crate::ecc;
use crate::ipc::{Command, Reply};

impl<H: Hardware> Nand<H> {
    /// The controller interrupt handler.
    ///
    /// Finishes the pending request (if any), posts its reply, and only then clears it, so no
    /// new request can be accepted before the reply is out. Finally wakes [Nand::wait].
    pub fn irq(&self) {
        let mut state = self.state();
        let mut status = 0;
        if state.hw.read32(Reg::Cmd) & regs::NAND_ERROR != 0 {
            log::error!("NAND: Error on IRQ");
            status = -1;
        }

        // Buffers must not be touched before this
        state.hw.flush_from(Bridge::Nand);
        state.hw.flush_to(Bridge::Starlet);

        if let Some(request) = state.pending.take() {
            let value = complete(&mut state, request.command);
            self.post(Reply {
                code: request.code,
                tag: request.tag,
                status,
                value,
            });
        }

        drop(state);
        self.completion.signal();
    }
}

/// Post-process the payload of a finished command. Returns the reply value, if any.
fn complete<H: Hardware>(state: &mut State<H>, command: Command) -> Option<u32> {
    let State {
        hw,
        staging,
        scratch,
        last_page_read,
        ..
    } = state;

    match command {
        Command::GetId { dst } | Command::GetStatus { dst } => {
            let payload = &mut scratch.data[..NAND_INFO_SIZE];
            hw.mem_read(staging.data, payload);
            hw.mem_write(dst, payload);
            hw.dc_flush(dst, NAND_INFO_SIZE);
            None
        }
        Command::Read { data, spare, .. } => {
            hw.mem_read(staging.data, &mut scratch.data);
            hw.mem_read(staging.spare, &mut scratch.ecc);
            let outcome = ecc::correct(*last_page_read, &mut scratch.data, &scratch.ecc);
            hw.mem_write(staging.data, &scratch.data);

            if let Some(data) = data {
                hw.mem_write(data, &scratch.data);
                hw.dc_flush(data, PAGE_SIZE);
            }
            if let Some(spare) = spare {
                hw.mem_write(spare, &scratch.ecc[..PAGE_SPARE_SIZE]);
                hw.dc_flush(spare, PAGE_SPARE_SIZE);
            }
            Some(outcome.code() as u32)
        }
        // Nothing to do after a write or erase
        Command::Write { .. } | Command::Erase { .. } => None,
        other => {
            log::warn!("Got IRQ for unknown NAND req {}", other.opcode());
            None
        }
    }
}
