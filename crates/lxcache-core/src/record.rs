//! On-disk record framing.
//!
//! Expiring records start with two little-endian `u32` words (expiry epoch,
//! creation epoch) so a reader can reject stale entries without touching
//! the payload. Persistent records carry no header at all.

use thiserror::Error;

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    /// `[expires_at][created_at][payload]`
    Expiring,
    /// `[payload]`, purged explicitly.
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub expires_at: u32,
    pub created_at: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record shorter than its {HEADER_LEN}-byte header ({0} bytes)")]
    Truncated(usize),
}

impl RecordHeader {
    pub fn new(created_at: u32, ttl_secs: u32) -> Self {
        Self {
            expires_at: created_at.saturating_add(ttl_secs),
            created_at,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.expires_at.to_le_bytes());
        out[4..].copy_from_slice(&self.created_at.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.len() < HEADER_LEN {
            return Err(RecordError::Truncated(bytes.len()));
        }
        let mut expires = [0u8; 4];
        let mut created = [0u8; 4];
        expires.copy_from_slice(&bytes[..4]);
        created.copy_from_slice(&bytes[4..HEADER_LEN]);
        Ok(Self {
            expires_at: u32::from_le_bytes(expires),
            created_at: u32::from_le_bytes(created),
        })
    }

    pub fn is_expired(&self, now: u32) -> bool {
        now > self.expires_at
    }
}

/// A decoded record. `header` is `None` for persistent records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub header: Option<RecordHeader>,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn split(layout: RecordLayout, mut bytes: Vec<u8>) -> Result<Self, RecordError> {
        match layout {
            RecordLayout::Persistent => Ok(Self {
                header: None,
                payload: bytes,
            }),
            RecordLayout::Expiring => {
                let header = RecordHeader::decode(&bytes)?;
                let payload = bytes.split_off(HEADER_LEN);
                Ok(Self {
                    header: Some(header),
                    payload,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_little_endian() {
        let header = RecordHeader {
            expires_at: 0x0102_0304,
            created_at: 0x0A0B_0C0D,
        };
        assert_eq!(
            header.encode(),
            [0x04, 0x03, 0x02, 0x01, 0x0D, 0x0C, 0x0B, 0x0A]
        );
    }

    #[test]
    fn short_header_is_truncated() {
        assert_eq!(
            RecordHeader::decode(&[1, 2, 3]),
            Err(RecordError::Truncated(3))
        );
    }

    #[test]
    fn split_expiring_record() {
        let header = RecordHeader::new(100, 50);
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(b"<html>");
        let record = Record::split(RecordLayout::Expiring, bytes).expect("split");
        assert_eq!(record.header, Some(header));
        assert_eq!(record.payload, b"<html>");
    }

    #[test]
    fn expiry_is_strictly_after() {
        let header = RecordHeader::new(100, 10);
        assert!(!header.is_expired(110));
        assert!(header.is_expired(111));
    }

    #[test]
    fn ttl_saturates() {
        assert_eq!(RecordHeader::new(u32::MAX - 1, 10).expires_at, u32::MAX);
    }
}
