//! Exchange disk header codec

use super::ExchangeError;

pub const SIGNATURE: [u8; 4] = *b"mvbd";

pub const HEADER_SIZE: usize = 16;

const FLAG_UNLOCKED: i32 = 0;
const FLAG_LOCKED: i32 = 1;

/// Wrapping i32 sum of every payload byte taken as unsigned
pub fn checksum(payload: &[u8]) -> i32 {
    payload
        .iter()
        .fold(0i32, |sum, byte| sum.wrapping_add(i32::from(*byte)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeHeader {
    pub signature: [u8; 4],
    pub flag: i32,
    pub checksum: i32,
    pub length: i32,
}

impl ExchangeHeader {
    /// Unlocked header describing a payload
    pub fn new(checksum: i32, length: i32) -> Self {
        Self {
            signature: SIGNATURE,
            flag: FLAG_UNLOCKED,
            checksum,
            length,
        }
    }

    /// Same header with the write-in-progress flag set
    pub fn locked(&self) -> Self {
        Self {
            flag: FLAG_LOCKED,
            ..*self
        }
    }

    pub fn is_locked(&self) -> bool {
        self.flag != FLAG_UNLOCKED
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(&self.signature);
        raw[4..8].copy_from_slice(&self.flag.to_be_bytes());
        raw[8..12].copy_from_slice(&self.checksum.to_be_bytes());
        raw[12..16].copy_from_slice(&self.length.to_be_bytes());
        raw
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, ExchangeError> {
        if raw.len() < HEADER_SIZE {
            return Err(ExchangeError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short exchange header",
            )));
        }

        let signature = [raw[0], raw[1], raw[2], raw[3]];
        if signature != SIGNATURE {
            return Err(ExchangeError::BadSignature(signature));
        }

        Ok(Self {
            signature,
            flag: read_i32(&raw[4..8]),
            checksum: read_i32(&raw[8..12]),
            length: read_i32(&raw[12..16]),
        })
    }
}

fn read_i32(raw: &[u8]) -> i32 {
    i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_big_endian() {
        let header = ExchangeHeader::new(0x01020304, 0x00000A0B).locked();
        let raw = header.to_bytes();

        assert_eq!(&raw[0..4], b"mvbd");
        assert_eq!(&raw[4..8], &[0, 0, 0, 1]);
        assert_eq!(&raw[8..12], &[1, 2, 3, 4]);
        assert_eq!(&raw[12..16], &[0, 0, 0x0A, 0x0B]);
        assert_eq!(ExchangeHeader::from_bytes(&raw).unwrap(), header);
    }

    #[test]
    fn test_checksum_wraps_on_overflow() {
        assert_eq!(checksum(b""), 0);
        assert_eq!(checksum(&[0xFF, 0x01]), 256);

        // large enough to pass i32::MAX
        let payload = vec![0xFFu8; 8_421_505];
        let expected = (0xFFu64 * payload.len() as u64) as u32 as i32;
        assert!(expected < 0);
        assert_eq!(checksum(&payload), expected);
    }

    #[test]
    fn test_short_header_rejected() {
        assert!(ExchangeHeader::from_bytes(b"mvbd").is_err());
    }
}
