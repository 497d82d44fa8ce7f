use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Size of the on-disk header. Rows start right after it.
pub const HEADER_SIZE: u64 = 64;

pub const MIN_ROW_SIZE: u64 = 128;
pub const MAX_ROW_SIZE: u64 = 65536;
pub const MAX_SKEW_MS: i64 = 86_400_000;

const SIGNATURE: &str = "fDB";
const VERSION: u32 = 1;

/// The 64-byte file header: a JSON object in bytes `0..63`, NUL padded, with
/// a terminating `\n` at byte 63.
///
/// ```text
/// {"sig":"fDB","ver":1,"row_size":<R>,"skew_ms":<S>}<NUL...><LF>
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    row_size: u64,
    skew_ms: i64,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct HeaderRepr {
    sig: String,
    ver: u32,
    row_size: u64,
    skew_ms: i64,
}

impl Header {
    /// Build a header for a new database. Rejects out-of-range configuration
    /// with `InvalidInput`.
    pub fn new(row_size: u64, skew_ms: i64) -> Result<Self> {
        if !(MIN_ROW_SIZE..=MAX_ROW_SIZE).contains(&row_size) {
            return Err(Error::invalid_input(format!(
                "row_size {row_size} out of range {MIN_ROW_SIZE}..={MAX_ROW_SIZE}"
            )));
        }
        if !(0..=MAX_SKEW_MS).contains(&skew_ms) {
            return Err(Error::invalid_input(format!(
                "skew_ms {skew_ms} out of range 0..={MAX_SKEW_MS}"
            )));
        }
        Ok(Self { row_size, skew_ms })
    }

    pub fn row_size(&self) -> u64 {
        self.row_size
    }

    pub fn skew_ms(&self) -> i64 {
        self.skew_ms
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let repr = HeaderRepr {
            sig: SIGNATURE.to_owned(),
            ver: VERSION,
            row_size: self.row_size,
            skew_ms: self.skew_ms,
        };
        let json = serde_json::to_vec(&repr).expect("header serialization is infallible");
        assert!(json.len() < HEADER_SIZE as usize - 1, "header json overflow");

        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[..json.len()].copy_from_slice(&json);
        buf[HEADER_SIZE as usize - 1] = b'\n';
        buf
    }

    /// Decode and validate a stored header. Every violation is
    /// `CorruptDatabase`: a file with a bad header is not a database.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != HEADER_SIZE as usize {
            return Err(Error::corrupt(format!(
                "header must be {HEADER_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        if buf[HEADER_SIZE as usize - 1] != b'\n' {
            return Err(Error::corrupt("header does not end with LF"));
        }

        let body = &buf[..HEADER_SIZE as usize - 1];
        let json_end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
        if body[json_end..].iter().any(|b| *b != 0) {
            return Err(Error::corrupt("non-NUL bytes in header padding"));
        }

        let repr: HeaderRepr = serde_json::from_slice(&body[..json_end])
            .map_err(|e| Error::corrupt(format!("header json: {e}")))?;

        if repr.sig != SIGNATURE {
            return Err(Error::corrupt(format!("bad signature {:?}", repr.sig)));
        }
        if repr.ver != VERSION {
            return Err(Error::corrupt(format!("unsupported version {}", repr.ver)));
        }
        if !(MIN_ROW_SIZE..=MAX_ROW_SIZE).contains(&repr.row_size) {
            return Err(Error::corrupt(format!("row_size {} out of range", repr.row_size)));
        }
        if !(0..=MAX_SKEW_MS).contains(&repr.skew_ms) {
            return Err(Error::corrupt(format!("skew_ms {} out of range", repr.skew_ms)));
        }

        Ok(Self {
            row_size: repr.row_size,
            skew_ms: repr.skew_ms,
        })
    }
}
