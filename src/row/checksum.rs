use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::{Error, Result};

use super::{encode_row, verify_frame, EndControl, StartControl};

/// On-disk length of the base64-encoded CRC32.
pub const ENCODED_CRC_LEN: usize = 8;

/// Number of complete DataRows + NullRows between two ChecksumRows.
pub const CHECKSUM_INTERVAL: u64 = 10_000;

pub fn encode_payload(crc: u32) -> [u8; ENCODED_CRC_LEN] {
    let mut out = [0u8; ENCODED_CRC_LEN];
    let n = STANDARD
        .encode_slice(crc.to_be_bytes(), &mut out)
        .expect("4 bytes encode to 8");
    debug_assert_eq!(n, ENCODED_CRC_LEN);
    out
}

pub fn decode_payload(bytes: &[u8]) -> Result<u32> {
    let raw = STANDARD
        .decode(bytes)
        .map_err(|e| Error::corrupt(format!("checksum base64: {e}")))?;
    let raw: [u8; 4] = raw
        .try_into()
        .map_err(|_| Error::corrupt("checksum payload length"))?;
    Ok(u32::from_be_bytes(raw))
}

/// Build a complete ChecksumRow image sealing a block with `crc`.
pub fn encode_checksum_row(row_size: u64, crc: u32) -> Vec<u8> {
    encode_row(
        row_size,
        StartControl::Checksum,
        &encode_payload(crc),
        EndControl::ChecksumSeal,
    )
}

/// IEEE CRC32 over a block of row images. The LRC parity of every row must
/// verify before its bytes are folded in; a mismatch means the block cannot
/// be sealed.
#[derive(Default)]
pub struct BlockChecksum {
    hasher: crc32fast::Hasher,
}

impl BlockChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, row: &[u8]) -> Result<()> {
        verify_frame(row)?;
        self.hasher.update(row);
        Ok(())
    }

    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::key::key_at;
    use crate::row::{encode_data_row, Row};

    #[test]
    fn payload_round_trip() {
        for crc in [0u32, 1, 0xdead_beef, u32::MAX] {
            assert_eq!(decode_payload(&encode_payload(crc)).unwrap(), crc);
        }
    }

    #[test]
    fn checksum_row_round_trip() {
        let buf = encode_checksum_row(256, 0xdead_beef);
        match Row::decode(&buf).unwrap() {
            Row::Checksum(c) => assert_eq!(c.crc, 0xdead_beef),
            other => panic!("unexpected row {other:?}"),
        }
    }

    #[test]
    fn block_checksum_rejects_damaged_rows() {
        let row = encode_data_row(
            256,
            StartControl::TransactionStart,
            &key_at(1, 1),
            b"{}",
            EndControl::Commit,
        );

        let mut block = BlockChecksum::new();
        block.update(&row).unwrap();
        let crc = block.finalize();

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&row);
        assert_eq!(crc, hasher.finalize());

        let mut damaged = row.clone();
        damaged[40] ^= 0xff;
        let mut block = BlockChecksum::new();
        assert!(block.update(&damaged).is_err());
    }
}
