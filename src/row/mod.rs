use uuid::Uuid;

use crate::error::{Error, Result};
use crate::key;

pub mod checksum;
pub mod control;

pub use control::{EndControl, StartControl};

/// First byte of every row.
pub const ROW_START: u8 = 0x1F;
/// Last byte of every row.
pub const ROW_END: u8 = 0x0A;

/// Frame overhead outside the payload: start sentinel, start control, end
/// control (2), parity, reserved byte, end sentinel.
const FRAME_OVERHEAD: usize = 7;

pub fn payload_capacity(row_size: u64) -> usize {
    row_size as usize - FRAME_OVERHEAD
}

/// Largest value that fits a DataRow after the encoded key.
pub fn max_value_len(row_size: u64) -> usize {
    payload_capacity(row_size) - key::ENCODED_KEY_LEN
}

/// A decoded row. Row kinds are a tagged variant, not a hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    Data(DataRow),
    Null(NullRow),
    Checksum(ChecksumRow),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    pub start: StartControl,
    pub end: EndControl,
    /// `None` for a voided row: a slot completed by crash recovery whose key
    /// bytes were lost. Voided rows are always rollback-terminated.
    pub key: Option<Uuid>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullRow {
    pub key: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumRow {
    pub crc: u32,
}

impl Row {
    /// Decode one complete row. `buf` must be exactly the database row size.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        verify_frame(buf)?;
        let r = buf.len();
        let start = StartControl::from_byte(buf[1])?;
        let end = EndControl::from_bytes([buf[r - 5], buf[r - 4]])?;
        let payload = &buf[2..r - 5];

        match start {
            StartControl::Checksum => {
                if end != EndControl::ChecksumSeal {
                    return Err(Error::corrupt("checksum row without CS terminator"));
                }
                let crc = checksum::decode_payload(&payload[..checksum::ENCODED_CRC_LEN])?;
                Ok(Row::Checksum(ChecksumRow { crc }))
            }
            StartControl::TransactionStart | StartControl::Continuation => match end {
                EndControl::ChecksumSeal => {
                    Err(Error::corrupt("CS terminator on a non-checksum row"))
                }
                EndControl::NullRow => {
                    if start != StartControl::TransactionStart {
                        return Err(Error::corrupt("null row must open its transaction"));
                    }
                    let key = key::decode(&payload[..key::ENCODED_KEY_LEN])?;
                    Ok(Row::Null(NullRow { key }))
                }
                _ => {
                    let key = match key::decode(&payload[..key::ENCODED_KEY_LEN]) {
                        Ok(k) => Some(k),
                        // The payload of this slot was lost mid-write and the
                        // slot was closed by recovery; only a rolled-back row
                        // may carry an unreadable key.
                        Err(_) if end.rollback_target().is_some() => None,
                        Err(e) => return Err(e),
                    };
                    let value = match key {
                        Some(_) => trim_padding(&payload[key::ENCODED_KEY_LEN..]).to_vec(),
                        None => Vec::new(),
                    };
                    Ok(Row::Data(DataRow {
                        start,
                        end,
                        key,
                        value,
                    }))
                }
            },
        }
    }

    pub fn start(&self) -> StartControl {
        match self {
            Row::Data(d) => d.start,
            Row::Null(_) => StartControl::TransactionStart,
            Row::Checksum(_) => StartControl::Checksum,
        }
    }

    pub fn end(&self) -> EndControl {
        match self {
            Row::Data(d) => d.end,
            Row::Null(_) => EndControl::NullRow,
            Row::Checksum(_) => EndControl::ChecksumSeal,
        }
    }

    pub fn key(&self) -> Option<&Uuid> {
        match self {
            Row::Data(d) => d.key.as_ref(),
            Row::Null(n) => Some(&n.key),
            Row::Checksum(_) => None,
        }
    }

    /// Timestamp of the key, for DataRows and NullRows.
    pub fn timestamp_ms(&self) -> Option<i64> {
        self.key().map(key::timestamp_ms)
    }

    pub fn is_checksum(&self) -> bool {
        matches!(self, Row::Checksum(_))
    }
}

/// Sentinel and parity validation shared by decode and the checksum block
/// sweep. The parity byte at `R-3` is the XOR of all bytes before it, so the
/// XOR over `[0, R-2)` of a well-formed row is zero.
pub fn verify_frame(buf: &[u8]) -> Result<()> {
    let r = buf.len();
    if buf[0] != ROW_START {
        return Err(Error::corrupt(format!(
            "bad row start sentinel {:#04x}",
            buf[0]
        )));
    }
    if buf[r - 1] != ROW_END {
        return Err(Error::corrupt(format!(
            "bad row end sentinel {:#04x}",
            buf[r - 1]
        )));
    }
    let parity = buf[..r - 2].iter().fold(0u8, |acc, b| acc ^ b);
    if parity != 0 {
        return Err(Error::corrupt("row parity mismatch"));
    }
    Ok(())
}

/// The two bytes appended when a row is opened: start sentinel plus start
/// control. Everything else is appended when the end control is known.
pub fn head(start: StartControl) -> [u8; 2] {
    [ROW_START, start.as_byte()]
}

/// Build a complete row image from its parts.
pub fn encode_row(row_size: u64, start: StartControl, payload: &[u8], end: EndControl) -> Vec<u8> {
    let r = row_size as usize;
    assert!(payload.len() <= payload_capacity(row_size), "payload overflow");

    let mut buf = vec![0u8; r];
    buf[0] = ROW_START;
    buf[1] = start.as_byte();
    buf[2..2 + payload.len()].copy_from_slice(payload);
    seal_frame(&mut buf, end);
    buf
}

/// Build a complete row image for a DataRow.
pub fn encode_data_row(
    row_size: u64,
    start: StartControl,
    key: &Uuid,
    value: &[u8],
    end: EndControl,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(key::ENCODED_KEY_LEN + value.len());
    payload.extend_from_slice(&key::encode(key));
    payload.extend_from_slice(value);
    encode_row(row_size, start, &payload, end)
}

/// Build a complete NullRow image at the given timestamp.
pub fn encode_null_row(row_size: u64, ts_ms: i64) -> Vec<u8> {
    let null = key::null_key(ts_ms);
    let payload = key::encode(&null);
    encode_row(
        row_size,
        StartControl::TransactionStart,
        &payload,
        EndControl::NullRow,
    )
}

/// Rebuild a complete row image over a partial fragment already on disk,
/// closing it with `end`. The fragment is NUL filled up to the end control;
/// only bytes past `prefix.len()` need to be appended, so nothing on disk is
/// rewritten. `resolved_start` supplies the start control when the fragment
/// is too short to carry one.
pub fn complete_row(
    row_size: u64,
    prefix: &[u8],
    resolved_start: Option<StartControl>,
    end: EndControl,
) -> Result<Vec<u8>> {
    let r = row_size as usize;
    if prefix.is_empty() || prefix.len() > r - 5 {
        return Err(Error::corrupt(format!(
            "partial row of {} bytes cannot be completed",
            prefix.len()
        )));
    }
    if prefix[0] != ROW_START {
        return Err(Error::corrupt("partial row lost its start sentinel"));
    }
    if prefix.len() >= 2 {
        StartControl::from_byte(prefix[1])?;
    }

    let mut buf = vec![0u8; r];
    buf[..prefix.len()].copy_from_slice(prefix);
    if prefix.len() < 2 {
        let start =
            resolved_start.ok_or_else(|| Error::corrupt("partial row with unknowable start"))?;
        buf[1] = start.as_byte();
    }
    seal_frame(&mut buf, end);
    Ok(buf)
}

fn seal_frame(buf: &mut [u8], end: EndControl) {
    let r = buf.len();
    buf[r - 5..r - 3].copy_from_slice(&end.as_bytes());
    buf[r - 3] = buf[..r - 3].iter().fold(0u8, |acc, b| acc ^ b);
    buf[r - 2] = 0;
    buf[r - 1] = ROW_END;
}

fn trim_padding(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| *b != 0)
        .map(|p| p + 1)
        .unwrap_or(0);
    &bytes[..end]
}
