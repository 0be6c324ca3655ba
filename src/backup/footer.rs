//! The key-material footer appended to every backup image.
//!
//! ```text
//!   0x000  identity line, NUL-padded       256 bytes
//!   0x100  OTP key block                   128 bytes
//!   0x180  zero padding                    128 bytes
//!   0x200  SEEPROM contents                256 bytes
//!   0x300  zero padding                    256 bytes
//! ```

use crate::error::{Error, Result};

use bytes::{BufMut, BytesMut};

pub const FOOTER_SIZE: usize = 1024;

/// Where the OTP block lives within the footer
pub const KEY_OFFSET: usize = 0x100;

pub const OTP_SIZE: usize = 128;
pub const SEEPROM_SIZE: usize = 256;

const IDENTITY_SIZE: usize = 0x100;
const SEEPROM_OFFSET: usize = 0x200;

/// The console-unique secrets a backup is tied to
pub trait KeySource {
    fn console_id(&self) -> u32;
    fn otp(&self) -> [u8; OTP_SIZE];
    fn seeprom(&self) -> [u8; SEEPROM_SIZE];
}

/// Key material held in memory
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KeyMaterial {
    pub console_id: u32,
    pub otp: [u8; OTP_SIZE],
    pub seeprom: [u8; SEEPROM_SIZE],
}

impl KeySource for KeyMaterial {
    fn console_id(&self) -> u32 {
        self.console_id
    }

    fn otp(&self) -> [u8; OTP_SIZE] {
        self.otp
    }

    fn seeprom(&self) -> [u8; SEEPROM_SIZE] {
        self.seeprom
    }
}

/// Build the footer for the console described by `keys`
pub fn build<K: KeySource + ?Sized>(keys: &K) -> BytesMut {
    let mut footer = BytesMut::with_capacity(FOOTER_SIZE);

    let identity = format!("BackupMii v1, ConsoleID: {:08x}\n", keys.console_id());
    footer.put_slice(identity.as_bytes());
    footer.put_bytes(0, IDENTITY_SIZE - identity.len());

    footer.put_slice(&keys.otp());
    footer.put_bytes(0, SEEPROM_OFFSET - KEY_OFFSET - OTP_SIZE);
    footer.put_slice(&keys.seeprom());
    footer.put_bytes(0, FOOTER_SIZE - SEEPROM_OFFSET - SEEPROM_SIZE);

    footer
}

/// Recover the key material from a footer (e.g. a `keys.bin` file)
pub fn parse(footer: &[u8]) -> Result<KeyMaterial> {
    if footer.len() < FOOTER_SIZE {
        return Err(Error::Decode(format!(
            "footer is {} bytes, expected {FOOTER_SIZE}",
            footer.len()
        )));
    }

    let identity = &footer[..IDENTITY_SIZE];
    let identity = &identity[..identity.iter().position(|&x| x == 0).unwrap_or(IDENTITY_SIZE)];
    let console_id = std::str::from_utf8(identity)
        .ok()
        .and_then(|line| line.trim_end().strip_prefix("BackupMii v1, ConsoleID: "))
        .and_then(|id| u32::from_str_radix(id, 16).ok())
        .ok_or_else(|| Error::Decode("footer has no console identity".to_owned()))?;

    let mut otp = [0u8; OTP_SIZE];
    otp.copy_from_slice(&footer[KEY_OFFSET..KEY_OFFSET + OTP_SIZE]);
    let mut seeprom = [0u8; SEEPROM_SIZE];
    seeprom.copy_from_slice(&footer[SEEPROM_OFFSET..SEEPROM_OFFSET + SEEPROM_SIZE]);

    Ok(KeyMaterial {
        console_id,
        otp,
        seeprom,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_keys() -> KeyMaterial {
        let mut otp = [0u8; OTP_SIZE];
        otp.iter_mut().enumerate().for_each(|(i, x)| *x = i as u8);
        KeyMaterial {
            console_id: 0x0403_ac68,
            otp,
            seeprom: [0x5a; SEEPROM_SIZE],
        }
    }

    #[test]
    fn test_footer_layout() -> anyhow::Result<()> {
        let keys = test_keys();
        let footer = build(&keys);
        assert_eq!(footer.len(), FOOTER_SIZE);

        let identity = b"BackupMii v1, ConsoleID: 0403ac68\n";
        assert_eq!(&footer[..identity.len()], identity);
        assert!(footer[identity.len()..KEY_OFFSET].iter().all(|&x| x == 0));
        assert_eq!(footer[KEY_OFFSET..KEY_OFFSET + OTP_SIZE], keys.otp);
        assert!(footer[0x180..0x200].iter().all(|&x| x == 0));
        assert_eq!(footer[0x200..0x300], keys.seeprom);
        assert!(footer[0x300..].iter().all(|&x| x == 0));

        assert_eq!(parse(&footer)?, keys);
        Ok(())
    }

    #[test]
    fn test_parse_rejects() {
        assert!(parse(&[0u8; 100]).is_err());
        assert!(parse(&[0u8; FOOTER_SIZE]).is_err());
    }
}
