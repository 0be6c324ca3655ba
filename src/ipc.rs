//! The request/reply protocol through which other firmware components use the NAND.
//!
//! A request record is nine big-endian words: the reply code and tag chosen by the requester,
//! the NAND request number, and up to six arguments. Pointer arguments are bus addresses;
//! `0xFFFFFFFF` means "no buffer".

use crate::error::{Error, Result};
use crate::nand::BusAddr;

use deku::prelude::*;

pub const IPC_NAND_RESET: u32 = 0x0000;
pub const IPC_NAND_GETID: u32 = 0x0001;
pub const IPC_NAND_READ: u32 = 0x0002;
pub const IPC_NAND_WRITE: u32 = 0x0003;
pub const IPC_NAND_ERASE: u32 = 0x0004;
pub const IPC_NAND_STATUS: u32 = 0x0005;
pub const IPC_NAND_SETMINPAGE: u32 = 0x0006;
pub const IPC_NAND_GETMINPAGE: u32 = 0x0007;

/// Marks an absent pointer argument
const NO_BUFFER: u32 = 0xFFFF_FFFF;

/// A request record exactly as it appears on the wire
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct IpcRequest {
    pub code: u32,
    pub tag: u32,
    pub req: u32,
    pub args: [u32; 6],
}

impl IpcRequest {
    pub const SIZE: usize = 36;

    /// Parse a record from a byte slice
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (_, request) =
            Self::from_bytes((bytes, 0)).map_err(|e| Error::Decode(e.to_string()))?;
        Ok(request)
    }

    /// Serialize the record
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.to_bytes().map_err(|e| Error::Decode(e.to_string()))
    }
}

/// The operations the NAND subsystem serves
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Command {
    Reset,
    GetId {
        dst: BusAddr,
    },
    GetStatus {
        dst: BusAddr,
    },
    Read {
        page: u32,
        data: Option<BusAddr>,
        spare: Option<BusAddr>,
    },
    Write {
        page: u32,
        data: BusAddr,
        spare: BusAddr,
    },
    Erase {
        page: u32,
    },
    SetMinPage(u32),
    GetMinPage,
}

impl Command {
    /// The wire request number of this command
    pub fn opcode(&self) -> u32 {
        match self {
            Self::Reset => IPC_NAND_RESET,
            Self::GetId { .. } => IPC_NAND_GETID,
            Self::GetStatus { .. } => IPC_NAND_STATUS,
            Self::Read { .. } => IPC_NAND_READ,
            Self::Write { .. } => IPC_NAND_WRITE,
            Self::Erase { .. } => IPC_NAND_ERASE,
            Self::SetMinPage(_) => IPC_NAND_SETMINPAGE,
            Self::GetMinPage => IPC_NAND_GETMINPAGE,
        }
    }
}

fn buffer(arg: u32) -> Option<BusAddr> {
    Some(arg).filter(|&x| x != NO_BUFFER)
}

fn required_buffer(arg: u32, what: &str) -> Result<BusAddr> {
    buffer(arg).ok_or_else(|| Error::Decode(format!("{what} buffer is required")))
}

/// A decoded request
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Request {
    pub code: u32,
    pub tag: u32,
    pub command: Command,
}

impl TryFrom<IpcRequest> for Request {
    type Error = Error;

    fn try_from(value: IpcRequest) -> Result<Self> {
        let IpcRequest {
            code,
            tag,
            req,
            args,
        } = value;

        let command = match req {
            IPC_NAND_RESET => Command::Reset,
            IPC_NAND_GETID => Command::GetId {
                dst: required_buffer(args[0], "ID")?,
            },
            IPC_NAND_STATUS => Command::GetStatus {
                dst: required_buffer(args[0], "status")?,
            },
            IPC_NAND_READ => Command::Read {
                page: args[0],
                data: buffer(args[1]),
                spare: buffer(args[2]),
            },
            IPC_NAND_WRITE => Command::Write {
                page: args[0],
                data: required_buffer(args[1], "data")?,
                spare: required_buffer(args[2], "spare")?,
            },
            IPC_NAND_ERASE => Command::Erase { page: args[0] },
            IPC_NAND_SETMINPAGE => Command::SetMinPage(args[0]),
            IPC_NAND_GETMINPAGE => Command::GetMinPage,
            other => return Err(Error::Decode(format!("unknown NAND request {other:04x}"))),
        };

        Ok(Request { code, tag, command })
    }
}

impl From<Request> for IpcRequest {
    fn from(value: Request) -> Self {
        let Request { code, tag, command } = value;
        let mut args = [0; 6];
        match command {
            Command::Reset | Command::GetMinPage => (),
            Command::GetId { dst } | Command::GetStatus { dst } => args[0] = dst,
            Command::Read { page, data, spare } => {
                args[..3].copy_from_slice(&[
                    page,
                    data.unwrap_or(NO_BUFFER),
                    spare.unwrap_or(NO_BUFFER),
                ]);
            }
            Command::Write { page, data, spare } => {
                args[..3].copy_from_slice(&[page, data, spare]);
            }
            Command::Erase { page } | Command::SetMinPage(page) => args[0] = page,
        }

        IpcRequest {
            code,
            tag,
            req: command.opcode(),
            args,
        }
    }
}

/// The request the subsystem is currently working on. At most one exists at a time.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PendingRequest {
    pub code: u32,
    pub tag: u32,
    pub command: Command,
}

impl From<Request> for PendingRequest {
    fn from(value: Request) -> Self {
        let Request { code, tag, command } = value;
        PendingRequest { code, tag, command }
    }
}

/// A reply posted back to the requester
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Reply {
    pub code: u32,
    pub tag: u32,

    /// 0 on success, negative on failure
    pub status: i32,

    /// Operation-specific result: the ECC outcome of a read, or the minimum page
    pub value: Option<u32>,
}

impl Reply {
    pub fn ok(code: u32, tag: u32) -> Self {
        Reply {
            code,
            tag,
            status: 0,
            value: None,
        }
    }

    pub fn error(code: u32, tag: u32) -> Self {
        Reply {
            code,
            tag,
            status: -1,
            value: None,
        }
    }

    pub fn value(mut self, value: u32) -> Self {
        self.value = Some(value);
        self
    }
}

/// The transport that carries replies back to requesters
pub trait ReplySink: Send + Sync {
    fn post(&self, reply: Reply);
}

impl ReplySink for crossbeam_channel::Sender<Reply> {
    fn post(&self, reply: Reply) {
        if self.send(reply).is_err() {
            log::warn!("IPC: reply {reply:?} dropped, nobody is listening");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_decode_read() -> anyhow::Result<()> {
        let mut bytes = Vec::new();
        for word in [0x1234u32, 7, IPC_NAND_READ, 0x300, 0x4000, NO_BUFFER, 0, 0, 0] {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        assert_eq!(bytes.len(), IpcRequest::SIZE);

        let request: Request = IpcRequest::decode(&bytes)?.try_into()?;
        assert_eq!(
            request,
            Request {
                code: 0x1234,
                tag: 7,
                command: Command::Read {
                    page: 0x300,
                    data: Some(0x4000),
                    spare: None
                },
            }
        );

        assert_eq!(IpcRequest::from(request).encode()?, bytes);
        Ok(())
    }

    #[test]
    fn test_decode_rejects() -> anyhow::Result<()> {
        let unknown = IpcRequest {
            req: 0x42,
            ..Default::default()
        };
        assert!(matches!(Request::try_from(unknown), Err(Error::Decode(_))));

        let write_without_data = IpcRequest {
            req: IPC_NAND_WRITE,
            args: [0x300, NO_BUFFER, 0x5000, 0, 0, 0],
            ..Default::default()
        };
        assert!(Request::try_from(write_without_data).is_err());

        assert!(IpcRequest::decode(&[0u8; 8]).is_err());
        Ok(())
    }
}
