//! Line encoding for outgoing text and display decoding for received bytes.
//!
//! Outgoing lines are turned into bytes according to a [`LineEnding`] policy.
//! Received bytes are decoded lossily as UTF-8, optionally stripped of
//! ANSI/CSI escape sequences, and optionally re-rendered as hex pairs.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

/// Pattern for CSI sequences, either `ESC [` or the single-byte `0x9B` introducer.
const ANSI_ESCAPE_PATTERN: &str = r"(\x{9B}|\x{1B}\[)[0-?]*[ -/]*[@-~]";

/// Terminator or encoding applied to an outgoing line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum LineEnding {
    /// Append `\n`.
    Lf,
    /// Append `\r`.
    Cr,
    /// Append `\r\n`.
    #[default]
    CrLf,
    /// Append `\n\r`.
    LfCr,
    /// Send the text as typed.
    None,
    /// Interpret the text as hex digits; no terminator.
    Hex,
}

impl LineEnding {
    /// All policies, in menu order.
    pub const ALL: [Self; 6] = [
        Self::Lf,
        Self::Cr,
        Self::CrLf,
        Self::LfCr,
        Self::None,
        Self::Hex,
    ];

    /// Terminator appended to the text, or `None` in hex mode.
    pub fn terminator(self) -> Option<&'static str> {
        match self {
            Self::Lf => Some("\n"),
            Self::Cr => Some("\r"),
            Self::CrLf => Some("\r\n"),
            Self::LfCr => Some("\n\r"),
            Self::None => Some(""),
            Self::Hex => None,
        }
    }

    /// Short name used on the command line and in config files.
    pub fn name(self) -> &'static str {
        match self {
            Self::Lf => "lf",
            Self::Cr => "cr",
            Self::CrLf => "crlf",
            Self::LfCr => "lfcr",
            Self::None => "none",
            Self::Hex => "hex",
        }
    }
}

impl fmt::Display for LineEnding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LineEnding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|ending| ending.name() == lower)
            .ok_or_else(|| {
                Error::Config(format!(
                    "unknown line ending '{s}' (expected one of: lf, cr, crlf, lfcr, none, hex)"
                ))
            })
    }
}

/// Encode a typed line into the bytes to transmit.
///
/// In [`LineEnding::Hex`] mode whitespace is ignored and the remaining digits
/// must form whole bytes.
pub fn encode(text: &str, policy: LineEnding) -> Result<Vec<u8>> {
    match policy.terminator() {
        Some(terminator) => {
            let mut bytes = Vec::with_capacity(text.len() + terminator.len());
            bytes.extend_from_slice(text.as_bytes());
            bytes.extend_from_slice(terminator.as_bytes());
            Ok(bytes)
        },
        None => {
            let digits: String = text.split_whitespace().collect();
            if digits.chars().count() % 2 != 0 {
                return Err(Error::InvalidHex(
                    "hex encoded values must be a multiple of 2".to_string(),
                ));
            }
            hex::decode(&digits).map_err(|e| Error::InvalidHex(e.to_string()))
        },
    }
}

fn ansi_escape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Static pattern, cannot fail to compile.
    RE.get_or_init(|| Regex::new(ANSI_ESCAPE_PATTERN).expect("valid escape pattern"))
}

/// Remove ANSI/CSI escape sequences from `text`.
///
/// Removal repeats until nothing matches, so sequences that only form after
/// an inner one is removed are stripped as well.
pub fn strip_escape_codes(text: &str) -> String {
    let re = ansi_escape();
    let mut current = text.to_string();
    loop {
        let next = re.replace_all(&current, "");
        if next == current {
            return current;
        }
        current = next.into_owned();
    }
}

/// Render the UTF-8 bytes of `text` as space-separated hex pairs with a trailing space.
pub fn to_hex_display(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 3);
    for byte in text.as_bytes() {
        out.push_str(&hex::encode([*byte]));
        out.push(' ');
    }
    out
}

fn render(text: String, strip_escapes: bool, hex_display: bool) -> String {
    let text = if strip_escapes {
        strip_escape_codes(&text)
    } else {
        text
    };
    if hex_display {
        to_hex_display(&text)
    } else {
        text
    }
}

/// Decode received bytes for display.
///
/// Invalid UTF-8 is replaced with `U+FFFD`. Escape stripping happens before
/// hex rendering. With stripping on, a stray `0x9B` byte is read as the C1
/// CSI introducer so 8-bit sequences are removed too.
pub fn decode_for_display(bytes: &[u8], strip_escapes: bool, hex_display: bool) -> String {
    let mut buffer = bytes.to_vec();
    let mut text = drain_utf8(&mut buffer, strip_escapes);
    if !buffer.is_empty() {
        text.push(char::REPLACEMENT_CHARACTER);
    }
    render(text, strip_escapes, hex_display)
}

/// Take the complete characters off the front of `buffer`.
///
/// A partial character at the end stays in `buffer` for the next chunk.
/// Bytes that can never become valid UTF-8 are replaced with `U+FFFD`.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    drain_utf8(buffer, false)
}

fn drain_utf8(buffer: &mut Vec<u8>, c1_csi: bool) -> String {
    let mut text = String::with_capacity(buffer.len());
    let mut pos = 0;
    while pos < buffer.len() {
        let rest = &buffer[pos..];
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                text.push_str(valid);
                pos = buffer.len();
            },
            Err(err) => {
                let good = err.valid_up_to();
                text.push_str(std::str::from_utf8(&rest[..good]).unwrap_or_default());
                pos += good;
                let Some(bad) = err.error_len() else {
                    break;
                };
                let replacement = if c1_csi && bad == 1 && buffer[pos] == 0x9B {
                    '\u{9B}'
                } else {
                    char::REPLACEMENT_CHARACTER
                };
                text.push(replacement);
                pos += bad;
            },
        }
    }
    buffer.drain(..pos);
    text
}

/// Streaming display decoder.
///
/// Same output as [`decode_for_display`], except that a multi-byte character
/// split across two reads is held back until its remaining bytes arrive.
#[derive(Debug, Default)]
pub struct DisplayDecoder {
    pending: Vec<u8>,
}

impl DisplayDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next received chunk.
    pub fn decode(&mut self, chunk: &[u8], strip_escapes: bool, hex_display: bool) -> String {
        self.pending
            .extend_from_slice(chunk);
        let text = drain_utf8(&mut self.pending, strip_escapes);
        if text.is_empty() {
            return text;
        }
        render(text, strip_escapes, hex_display)
    }

    /// Emit whatever is still buffered, replacing the incomplete sequence.
    pub fn flush(&mut self, strip_escapes: bool, hex_display: bool) -> String {
        if self
            .pending
            .is_empty()
        {
            return String::new();
        }
        let bytes = std::mem::take(&mut self.pending);
        decode_for_display(&bytes, strip_escapes, hex_display)
    }

    /// Number of bytes waiting for the rest of a character.
    pub fn pending_len(&self) -> usize {
        self.pending
            .len()
    }
}
