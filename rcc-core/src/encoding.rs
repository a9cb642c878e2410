//! Text encodings used for frame payloads.
//!
//! The instrument speaks UTF-16LE by default; UTF-8 and ASCII are
//! selectable per connection. Decoding is lossy and never fails.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RccError;

/// Character encoding applied to payload text on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TextEncoding {
    #[default]
    #[serde(rename = "utf-16le", alias = "utf-16", alias = "unicode")]
    Utf16Le,
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
    #[serde(rename = "ascii")]
    Ascii,
}

impl TextEncoding {
    /// Encode `text` into payload bytes.
    ///
    /// Characters outside the ASCII range become `?` under [`TextEncoding::Ascii`].
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            Self::Utf16Le => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
            Self::Utf8 => text.as_bytes().to_vec(),
            Self::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
        }
    }

    /// Decode payload bytes into text, replacing anything undecodable.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Self::Utf16Le => {
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                let mut text = String::from_utf16_lossy(&units);
                if bytes.len() % 2 == 1 {
                    text.push(char::REPLACEMENT_CHARACTER);
                }
                text
            }
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Ascii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { '?' })
                .collect(),
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Utf16Le => write!(f, "utf-16le"),
            Self::Utf8 => write!(f, "utf-8"),
            Self::Ascii => write!(f, "ascii"),
        }
    }
}

impl FromStr for TextEncoding {
    type Err = RccError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf-16le" | "utf-16" | "utf16" | "unicode" => Ok(Self::Utf16Le),
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "ascii" => Ok(Self::Ascii),
            other => Err(RccError::Config(format!("unknown encoding: {other}"))),
        }
    }
}
