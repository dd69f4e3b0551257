//! Normalization of producer text fields that may arrive base64 or hex encoded.
//!
//! Producers are inconsistent about how they ship utterance text in
//! `audio_data`: some base64 it, some hex it, some send it as-is. Decoding is
//! attempted in a fixed order (base64, then hex, then plain) and the first
//! candidate that yields printable UTF-8 wins. Short alphanumeric strings can
//! be valid under more than one encoding; the order is the tie-break.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use data_encoding::HEXLOWER_PERMISSIVE;
use serde::{Deserialize, Serialize};

/// How a raw field was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingMethod {
    Plain,
    Base64,
    Hex,
}

/// Result of decoding a raw producer field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    pub method: EncodingMethod,
}

impl Decoded {
    fn plain(raw: &str) -> Self {
        Self {
            text: raw.to_string(),
            method: EncodingMethod::Plain,
        }
    }
}

/// Decode a raw text field. Never fails: undecodable input comes back
/// unchanged and tagged [`EncodingMethod::Plain`].
pub fn decode(raw: &str) -> Decoded {
    if let Some(text) = try_base64(raw) {
        return Decoded {
            text,
            method: EncodingMethod::Base64,
        };
    }

    if let Some(text) = try_hex(raw) {
        return Decoded {
            text,
            method: EncodingMethod::Hex,
        };
    }

    Decoded::plain(raw)
}

/// Decode arbitrary bytes. Invalid UTF-8 sequences are replaced before the
/// text policy runs, so this is total as well.
pub fn decode_bytes(raw: &[u8]) -> Decoded {
    decode(&String::from_utf8_lossy(raw))
}

fn try_base64(raw: &str) -> Option<String> {
    if raw.is_empty() || raw.len() % 4 != 0 || !is_base64_alphabet(raw) {
        return None;
    }
    let bytes = STANDARD.decode(raw).ok()?;
    printable_utf8(bytes)
}

fn try_hex(raw: &str) -> Option<String> {
    if raw.is_empty() || raw.len() % 2 != 0 || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let bytes = HEXLOWER_PERMISSIVE.decode(raw.as_bytes()).ok()?;
    printable_utf8(bytes)
}

/// Base64 alphabet with at most two `=` and only as trailing padding.
fn is_base64_alphabet(raw: &str) -> bool {
    let body = raw.trim_end_matches('=');
    if raw.len() - body.len() > 2 {
        return false;
    }
    body.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/')
}

fn printable_utf8(bytes: Vec<u8>) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8(bytes).ok()?;
    let printable = text
        .chars()
        .all(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'));
    printable.then_some(text)
}
