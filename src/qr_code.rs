//! QR-code login payload codec
//!
//! Binary layout of the payload shown by the device that initiates a
//! cross-device login (MSC4108):
//!
//! ```text
//! "MATRIX" | version (0x02) | mode | public key (32) | u16 len | rendezvous URL
//!                                   [ mode 0x04 only: u16 len | server name ]
//! ```
//!
//! Lengths are big-endian. Mode `0x03` is shown by a new device asking to be
//! signed in; mode `0x04` is shown by an already signed-in device and carries
//! the name of its homeserver.

use thiserror::Error;
use url::Url;

const PREFIX: &[u8] = b"MATRIX";
const VERSION: u8 = 0x02;
const MODE_LOGIN: u8 = 0x03;
const MODE_RECIPROCATE: u8 = 0x04;
const PUBLIC_KEY_LEN: usize = 32;

/// Failure to decode a scanned payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QrDecodeError {
    #[error("missing MATRIX prefix")]
    InvalidPrefix,
    #[error("unsupported version {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("unknown mode {0:#04x}")]
    UnknownMode(u8),
    #[error("payload truncated")]
    Truncated,
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid rendezvous URL: {0}")]
    InvalidUrl(String),
    #[error("string field of {0} bytes exceeds the length prefix")]
    FieldTooLong(usize),
}

/// Which device shows the code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrCodeMode {
    /// A new device that wants to be signed in
    Login,
    /// A signed-in device offering to sign in another one
    Reciprocate { server_name: String },
}

/// Decoded QR login payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrCodeData {
    public_key: [u8; PUBLIC_KEY_LEN],
    rendezvous_url: Url,
    mode: QrCodeMode,
}

impl QrCodeData {
    pub fn new(public_key: [u8; PUBLIC_KEY_LEN], rendezvous_url: Url, mode: QrCodeMode) -> Self {
        Self {
            public_key,
            rendezvous_url,
            mode,
        }
    }

    /// Decode a scanned payload
    ///
    /// # Errors
    ///
    /// Returns a [`QrDecodeError`] for any deviation from the layout,
    /// including trailing bytes.
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, QrDecodeError> {
        let mut reader = Reader { bytes, pos: 0 };

        if reader.take(PREFIX.len())? != PREFIX {
            return Err(QrDecodeError::InvalidPrefix);
        }

        let version = reader.byte()?;
        if version != VERSION {
            return Err(QrDecodeError::UnsupportedVersion(version));
        }

        let mode_byte = reader.byte()?;
        if mode_byte != MODE_LOGIN && mode_byte != MODE_RECIPROCATE {
            return Err(QrDecodeError::UnknownMode(mode_byte));
        }

        let mut public_key = [0u8; PUBLIC_KEY_LEN];
        public_key.copy_from_slice(reader.take(PUBLIC_KEY_LEN)?);

        let url = reader.string()?;
        let rendezvous_url =
            Url::parse(url).map_err(|e| QrDecodeError::InvalidUrl(e.to_string()))?;

        let mode = if mode_byte == MODE_RECIPROCATE {
            QrCodeMode::Reciprocate {
                server_name: reader.string()?.to_string(),
            }
        } else {
            QrCodeMode::Login
        };

        let remaining = bytes.len() - reader.pos;
        if remaining > 0 {
            return Err(QrDecodeError::TrailingBytes(remaining));
        }

        Ok(Self {
            public_key,
            rendezvous_url,
            mode,
        })
    }

    /// Encode the payload
    ///
    /// # Errors
    ///
    /// Returns [`QrDecodeError::FieldTooLong`] when the rendezvous URL or the
    /// server name does not fit a `u16` length prefix.
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, QrDecodeError> {
        let mut out = Vec::with_capacity(64 + self.rendezvous_url.as_str().len());
        out.extend_from_slice(PREFIX);
        out.push(VERSION);
        out.push(match self.mode {
            QrCodeMode::Login => MODE_LOGIN,
            QrCodeMode::Reciprocate { .. } => MODE_RECIPROCATE,
        });
        out.extend_from_slice(&self.public_key);
        write_string(&mut out, self.rendezvous_url.as_str())?;
        if let QrCodeMode::Reciprocate { server_name } = &self.mode {
            write_string(&mut out, server_name)?;
        }
        Ok(out)
    }

    /// Homeserver of the signed-in device, for reciprocate codes only
    pub fn server_name(&self) -> Option<&str> {
        match &self.mode {
            QrCodeMode::Reciprocate { server_name } => Some(server_name),
            QrCodeMode::Login => None,
        }
    }

    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public_key
    }

    pub fn rendezvous_url(&self) -> &Url {
        &self.rendezvous_url
    }

    pub fn mode(&self) -> &QrCodeMode {
        &self.mode
    }
}

fn write_string(out: &mut Vec<u8>, value: &str) -> std::result::Result<(), QrDecodeError> {
    let len = u16::try_from(value.len()).map_err(|_| QrDecodeError::FieldTooLong(value.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> std::result::Result<&'a [u8], QrDecodeError> {
        let end = self.pos.checked_add(len).ok_or(QrDecodeError::Truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or(QrDecodeError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> std::result::Result<u8, QrDecodeError> {
        Ok(self.take(1)?[0])
    }

    fn string(&mut self) -> std::result::Result<&'a str, QrDecodeError> {
        let len_bytes = self.take(2)?;
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        std::str::from_utf8(self.take(len)?).map_err(|_| QrDecodeError::InvalidUtf8)
    }
}
