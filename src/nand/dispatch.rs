//! The request dispatcher: accepts requests from other firmware components and starts them.

use super::{regs, Hardware, Nand, State, DEFAULT_MIN_PAGE, PAGE_SIZE, PAGE_SPARE_SIZE};
use crate::error::{Error, Result};
use crate::ipc::{Command, IpcRequest, Reply, Request};

impl<H: Hardware> Nand<H> {
    /// Decode a raw request record and dispatch it.
    ///
    /// Records that don't decode are answered with an error reply.
    pub fn handle_ipc(&self, raw: IpcRequest) {
        match Request::try_from(raw) {
            Ok(request) => self.dispatch(request),
            Err(e) => {
                log::error!("IPC: bad NAND request {:04x}: {e}", raw.req);
                self.post(Reply::error(raw.code, raw.tag));
            }
        }
    }

    /// Start a request.
    ///
    /// Requests arriving while another one is pending are rejected with an error reply. Reads,
    /// writes, erases, and ID/status queries complete later, in [Nand::irq]; everything else is
    /// answered immediately.
    ///
    /// A write or erase of a protected page is logged and dropped **without any reply**. This
    /// is the only rejection that posts nothing; requesters see it as a reply that never comes.
    pub fn dispatch(&self, request: Request) {
        let Request { code, tag, .. } = request;
        match self.start(request) {
            // Completes in the interrupt handler
            Ok(None) => (),
            Ok(Some(reply)) => self.post(reply),
            Err(Error::Protected(page)) => {
                log::error!("nand_{} to page {page} forbidden", verb(request.command));
            }
            Err(e) => {
                log::error!("NAND: {e}");
                self.post(Reply::error(code, tag));
            }
        }
    }

    /// Validate a request and program the hardware for it. Returns the reply if the request
    /// has already been completed.
    fn start(&self, request: Request) -> Result<Option<Reply>> {
        let Request { code, tag, command } = request;
        let mut state = self.state();

        if state.pending.is_some() {
            return Err(Error::Busy);
        }

        match command {
            Command::Reset => {
                regs::reset(&mut state.hw);
                return Ok(Some(Reply::ok(code, tag)));
            }

            Command::GetId { .. } => {
                let staging = state.staging.data;
                state.pending = Some(request.into());
                self.completion.clear();
                regs::issue_get_id(&mut state.hw, staging);
            }

            Command::GetStatus { .. } => {
                let staging = state.staging.data;
                state.pending = Some(request.into());
                self.completion.clear();
                regs::issue_get_status(&mut state.hw, staging);
            }

            Command::Read { page, .. } => {
                if page >= state.layout.max_page() {
                    return Err(Error::OutOfRange(page));
                }
                let staging = state.staging;
                state.pending = Some(request.into());
                state.last_page_read = page;
                self.completion.clear();
                regs::issue_read(
                    &mut state.hw,
                    page,
                    Some(staging.data),
                    Some(staging.spare),
                    0,
                );
            }

            Command::Write { page, data, spare } => {
                state.check_writable(page)?;
                stage_write(&mut state, data, spare);
                let staging = state.staging;
                state.pending = Some(request.into());
                self.completion.clear();
                regs::issue_write(
                    &mut state.hw,
                    page,
                    Some(staging.data),
                    Some(staging.spare),
                    0,
                );
            }

            Command::Erase { page } => {
                state.check_writable(page)?;
                state.pending = Some(request.into());
                self.completion.clear();
                regs::issue_erase(&mut state.hw, page, 0);
            }

            // Only for those reflashing boot1/boot2 onto blank or corrupted chips. Callers must
            // read the value back with GetMinPage, do their writes, and then restore
            // DEFAULT_MIN_PAGE as soon as possible.
            Command::SetMinPage(new_min_page) => {
                if new_min_page > DEFAULT_MIN_PAGE {
                    log::warn!("Ignoring strange NAND_SETMINPAGE request: {new_min_page}");
                    return Ok(Some(Reply::error(code, tag)));
                }
                log::warn!("Setting minimum allowed NAND page to {new_min_page}");
                state.min_page = new_min_page;
                return Ok(Some(Reply::ok(code, tag)));
            }

            Command::GetMinPage => {
                return Ok(Some(Reply::ok(code, tag).value(state.min_page)));
            }
        }

        Ok(None)
    }
}

fn verb(command: Command) -> &'static str {
    match command {
        Command::Erase { .. } => "erase",
        _ => "write",
    }
}

/// Copy the requester's buffers into the staging buffers; DMA only ever reads from those
fn stage_write<H: Hardware>(state: &mut State<H>, data: u32, spare: u32) {
    let State {
        hw,
        staging,
        scratch,
        ..
    } = state;

    hw.dc_invalidate(data, PAGE_SIZE);
    hw.dc_invalidate(spare, PAGE_SPARE_SIZE);

    hw.mem_read(data, &mut scratch.data);
    hw.mem_write(staging.data, &scratch.data);

    let spare_bytes = &mut scratch.ecc[..PAGE_SPARE_SIZE];
    hw.mem_read(spare, spare_bytes);
    hw.mem_write(staging.spare, spare_bytes);
}
