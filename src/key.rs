use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use uuid::Uuid;

use crate::error::{Error, Result};

/// On-disk length of a base64-encoded 128-bit key.
pub const ENCODED_KEY_LEN: usize = 24;

/// Reject anything that is not a usable UUIDv7 key.
pub fn validate(key: &Uuid) -> Result<()> {
    if key.is_nil() {
        return Err(Error::invalid_input("nil key"));
    }
    if key.get_version_num() != 7 {
        return Err(Error::invalid_input(format!(
            "key {key} is not a UUIDv7 (version {})",
            key.get_version_num()
        )));
    }
    Ok(())
}

/// Unix-millisecond timestamp carried in the high 48 bits of a UUIDv7.
pub fn timestamp_ms(key: &Uuid) -> i64 {
    let b = key.as_bytes();
    ((b[0] as i64) << 40)
        | ((b[1] as i64) << 32)
        | ((b[2] as i64) << 24)
        | ((b[3] as i64) << 16)
        | ((b[4] as i64) << 8)
        | (b[5] as i64)
}

/// The key reserved for NullRows: a UUIDv7 at `ts_ms` whose random portion is
/// all zero.
pub fn null_key(ts_ms: i64) -> Uuid {
    let mut b = [0u8; 16];
    b[0] = (ts_ms >> 40) as u8;
    b[1] = (ts_ms >> 32) as u8;
    b[2] = (ts_ms >> 24) as u8;
    b[3] = (ts_ms >> 16) as u8;
    b[4] = (ts_ms >> 8) as u8;
    b[5] = ts_ms as u8;
    b[6] = 0x70;
    b[8] = 0x80;
    Uuid::from_bytes(b)
}

/// True when the random portion of the key is all zero (the NullRow key
/// shape), ignoring the timestamp.
pub fn is_null_random(key: &Uuid) -> bool {
    let b = key.as_bytes();
    b[6] == 0x70 && b[7] == 0 && b[8] == 0x80 && b[9..].iter().all(|x| *x == 0)
}

pub fn encode(key: &Uuid) -> [u8; ENCODED_KEY_LEN] {
    let mut out = [0u8; ENCODED_KEY_LEN];
    let n = STANDARD
        .encode_slice(key.as_bytes(), &mut out)
        .expect("16 bytes encode to 24");
    debug_assert_eq!(n, ENCODED_KEY_LEN);
    out
}

pub fn decode(bytes: &[u8]) -> Result<Uuid> {
    if bytes.len() != ENCODED_KEY_LEN {
        return Err(Error::corrupt(format!(
            "encoded key must be {ENCODED_KEY_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let raw = STANDARD
        .decode(bytes)
        .map_err(|e| Error::corrupt(format!("key base64: {e}")))?;
    Uuid::from_slice(&raw).map_err(|e| Error::corrupt(format!("key length: {e}")))
}

/// Current wall clock in Unix milliseconds.
pub fn unix_ms_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) fn key_at(ts_ms: i64, seed: u8) -> Uuid {
    let mut b = *null_key(ts_ms).as_bytes();
    b[15] = seed;
    b[7] = seed.wrapping_mul(31);
    Uuid::from_bytes(b)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timestamp_round_trip() {
        let key = null_key(1000);
        assert_eq!(timestamp_ms(&key), 1000);
        assert_eq!(key.get_version_num(), 7);
        assert!(is_null_random(&key));

        let key = key_at(0x0000_7fff_ffff_ffff >> 16, 3);
        assert_eq!(timestamp_ms(&key), 0x0000_7fff_ffff_ffff >> 16);
        assert!(!is_null_random(&key));
    }

    #[test]
    fn encode_decode() {
        let key = key_at(123_456, 7);
        let enc = encode(&key);
        assert_eq!(enc.len(), ENCODED_KEY_LEN);
        assert_eq!(decode(&enc).unwrap(), key);
        assert!(decode(&[0u8; ENCODED_KEY_LEN]).is_err());
    }

    #[test]
    fn validation() {
        assert!(validate(&Uuid::nil()).is_err());
        assert!(validate(&Uuid::new_v4()).is_err());
        assert!(validate(&key_at(1, 1)).is_ok());
    }
}
