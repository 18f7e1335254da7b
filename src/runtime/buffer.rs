//! Buffer - the single owned byte type used across the runtime
//!
//! Every component that moves bytes (file contents, descriptor snapshots,
//! request bodies, socket chunks) uses [`Buffer`]. Conversions to and from
//! text are explicit and always name an [`Encoding`].
//!
//! Supported encodings:
//! - utf8 / utf-8
//! - hex
//! - base64 / base64url
//! - latin1 / binary / ascii
//! - utf16le / ucs2

use base64::{
    Engine,
    engine::general_purpose::{STANDARD as BASE64_STANDARD, URL_SAFE_NO_PAD as BASE64_URL},
};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while converting between text and bytes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Unknown encoding: {0}")]
    UnknownEncoding(String),

    #[error("Invalid hex string: {0}")]
    InvalidHex(String),

    #[error("Invalid base64: {0}")]
    InvalidBase64(String),
}

/// Result type for buffer conversions
pub type BufferResult<T> = Result<T, BufferError>;

/// Text encodings understood by [`Buffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Hex,
    Base64,
    Base64Url,
    Latin1,
    Utf16Le,
}

impl FromStr for Encoding {
    type Err = BufferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "hex" => Ok(Encoding::Hex),
            "base64" => Ok(Encoding::Base64),
            "base64url" => Ok(Encoding::Base64Url),
            "ascii" | "latin1" | "binary" => Ok(Encoding::Latin1),
            "utf16le" | "utf-16le" | "ucs2" | "ucs-2" => Ok(Encoding::Utf16Le),
            _ => Err(BufferError::UnknownEncoding(s.to_string())),
        }
    }
}

/// Owned, contiguous bytes
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Buffer(Vec<u8>);

impl Buffer {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    /// Decode `text` using `encoding` (Buffer.from(string, encoding))
    pub fn from_encoded(text: &str, encoding: Encoding) -> BufferResult<Self> {
        let bytes = match encoding {
            Encoding::Utf8 => text.as_bytes().to_vec(),
            Encoding::Latin1 => text.chars().map(|c| (c as u32 & 0xFF) as u8).collect(),
            Encoding::Hex => hex::decode(text.trim())
                .map_err(|e| BufferError::InvalidHex(e.to_string()))?,
            Encoding::Base64 => BASE64_STANDARD
                .decode(text.trim())
                .map_err(|e| BufferError::InvalidBase64(e.to_string()))?,
            Encoding::Base64Url => BASE64_URL
                .decode(text.trim().trim_end_matches('='))
                .map_err(|e| BufferError::InvalidBase64(e.to_string()))?,
            Encoding::Utf16Le => text
                .encode_utf16()
                .flat_map(|unit| unit.to_le_bytes())
                .collect(),
        };
        Ok(Self(bytes))
    }

    /// Encode the bytes as text (buf.toString(encoding))
    ///
    /// Invalid UTF-8 sequences are replaced, matching Node's decoder.
    pub fn to_encoded(&self, encoding: Encoding) -> String {
        match encoding {
            Encoding::Utf8 => String::from_utf8_lossy(&self.0).into_owned(),
            Encoding::Latin1 => self.0.iter().map(|&b| b as char).collect(),
            Encoding::Hex => hex::encode(&self.0),
            Encoding::Base64 => BASE64_STANDARD.encode(&self.0),
            Encoding::Base64Url => BASE64_URL.encode(&self.0),
            Encoding::Utf16Le => {
                let units: Vec<u16> = self
                    .0
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16_lossy(&units)
            }
        }
    }

    /// Lossy UTF-8 view, the common case
    pub fn to_text(&self) -> String {
        self.to_encoded(Encoding::Utf8)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }

    pub fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }

    /// Resize to `len`, zero-filling when growing
    pub fn resize(&mut self, len: usize) {
        self.0.resize(len, 0);
    }

    /// Buffer.concat
    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a Buffer>) -> Self {
        let mut out = Vec::new();
        for part in parts {
            out.extend_from_slice(&part.0);
        }
        Self(out)
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Buffer {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Buffer {
    fn from(bytes: &[u8; N]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for Buffer {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

impl From<String> for Buffer {
    fn from(text: String) -> Self {
        Self(text.into_bytes())
    }
}

impl From<Buffer> for Vec<u8> {
    fn from(buffer: Buffer) -> Self {
        buffer.0
    }
}

impl fmt::Debug for Buffer {
    // Same shape as Node's inspect output: <Buffer 68 69 ...>
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MAX_SHOWN: usize = 50;
        write!(f, "<Buffer")?;
        for byte in self.0.iter().take(MAX_SHOWN) {
            write!(f, " {:02x}", byte)?;
        }
        if self.0.len() > MAX_SHOWN {
            write!(f, " ... {} more bytes", self.0.len() - MAX_SHOWN)?;
        }
        write!(f, ">")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_names() {
        assert_eq!("UTF-8".parse::<Encoding>(), Ok(Encoding::Utf8));
        assert_eq!("binary".parse::<Encoding>(), Ok(Encoding::Latin1));
        assert_eq!("ucs2".parse::<Encoding>(), Ok(Encoding::Utf16Le));
        assert!(matches!(
            "ebcdic".parse::<Encoding>(),
            Err(BufferError::UnknownEncoding(_))
        ));
    }

    #[test]
    fn test_text_conversions() {
        let buf = Buffer::from("hello");
        assert_eq!(buf.to_encoded(Encoding::Hex), "68656c6c6f");
        assert_eq!(buf.to_encoded(Encoding::Base64), "aGVsbG8=");
        assert_eq!(buf.to_encoded(Encoding::Base64Url), "aGVsbG8");
        assert_eq!(
            Buffer::from_encoded("68656c6c6f", Encoding::Hex).unwrap(),
            buf
        );
        assert_eq!(
            Buffer::from_encoded("aGVsbG8=", Encoding::Base64).unwrap(),
            buf
        );
        assert_eq!(Buffer::from_encoded("aGVsbG8", Encoding::Base64Url).unwrap(), buf);
    }

    #[test]
    fn test_invalid_input() {
        assert!(matches!(
            Buffer::from_encoded("zz", Encoding::Hex),
            Err(BufferError::InvalidHex(_))
        ));
        assert!(matches!(
            Buffer::from_encoded("!!!", Encoding::Base64),
            Err(BufferError::InvalidBase64(_))
        ));
    }

    #[test]
    fn test_utf16_and_latin1() {
        let buf = Buffer::from_encoded("hi", Encoding::Utf16Le).unwrap();
        assert_eq!(buf.as_slice(), &[b'h', 0, b'i', 0]);
        assert_eq!(buf.to_encoded(Encoding::Utf16Le), "hi");

        let latin = Buffer::from(vec![0xe9]);
        assert_eq!(latin.to_encoded(Encoding::Latin1), "é");
    }

    #[test]
    fn test_concat_and_debug() {
        let joined = Buffer::concat([&Buffer::from("ab"), &Buffer::from("c")]);
        assert_eq!(joined.to_text(), "abc");
        assert_eq!(format!("{:?}", joined), "<Buffer 61 62 63>");
    }
}
