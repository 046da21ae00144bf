//! Recovery log records and their on-disk framing

use crate::tsdb::WriteRequest;
use crate::{RelayError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Bytes of framing around header and payload
const FRAME_OVERHEAD: usize = 4 + 4 + 4;

/// Largest length prefix trusted when reading a log
pub const MAX_RECORD: usize = crate::config::MAX_RECOVERY_RECORD;

/// Write parameters stored alongside each payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub database: String,
    pub retention_policy: String,
    pub precision: String,
}

/// One buffered write destined for an unavailable member
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub header: RecordHeader,
    /// Line-protocol body, uncompressed
    pub body: Bytes,
}

impl Record {
    pub fn from_request(request: &WriteRequest) -> Self {
        Self {
            header: RecordHeader {
                database: request.database.clone(),
                retention_policy: request.retention_policy.clone(),
                precision: request.precision.clone(),
            },
            body: request.body.clone(),
        }
    }

    pub fn into_request(self) -> WriteRequest {
        WriteRequest::new(self.header.database, self.body)
            .with_retention_policy(self.header.retention_policy)
            .with_precision(self.header.precision)
    }

    /// Serialize with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: record length (excluding this field)
    /// - 4 bytes: header length
    /// - N bytes: bincode header
    /// - M bytes: lz4 payload (size prepended)
    /// - 4 bytes: CRC32 of everything after the length prefix
    pub fn encode(&self) -> Result<Bytes> {
        let header = bincode::serialize(&self.header)
            .map_err(|e| RelayError::Internal(format!("encode record header: {}", e)))?;
        let payload = lz4_flex::compress_prepend_size(&self.body);

        let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + header.len() + payload.len());
        buf.put_u32_le(0);
        buf.put_u32_le(header.len() as u32);
        buf.put_slice(&header);
        buf.put_slice(&payload);

        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);

        if buf.len() - 4 > MAX_RECORD {
            return Err(RelayError::BadRequest(format!(
                "write of {} bytes is too large to buffer for recovery",
                self.body.len()
            )));
        }
        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());
        Ok(buf.freeze())
    }

    /// Decode one record from the front of `data`
    ///
    /// Returns `Ok(None)` when `data` ends before the record does (a torn
    /// tail), otherwise the record and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<Option<(Self, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }
        let len = (&data[..4]).get_u32_le() as usize;
        if len < FRAME_OVERHEAD - 4 {
            return Err(RelayError::Corruption(format!("record length {} too short", len)));
        }
        if len > MAX_RECORD {
            return Err(RelayError::Corruption(format!("record length {} exceeds {}", len, MAX_RECORD)));
        }
        if data.len() < 4 + len {
            return Ok(None);
        }
        let body = &data[4..4 + len];
        let (content, trailer) = body.split_at(len - 4);

        let expected = (&trailer[..]).get_u32_le();
        let actual = crc32fast::hash(content);
        if expected != actual {
            return Err(RelayError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = content;
        let header_len = cursor.get_u32_le() as usize;
        if header_len > cursor.len() {
            return Err(RelayError::Corruption("record header overruns frame".into()));
        }
        let header: RecordHeader = bincode::deserialize(&cursor[..header_len])
            .map_err(|e| RelayError::Corruption(format!("record header: {}", e)))?;
        let payload = lz4_flex::decompress_size_prepended(&cursor[header_len..])
            .map_err(|e| RelayError::Corruption(format!("record payload: {}", e)))?;

        Ok(Some((
            Self {
                header,
                body: Bytes::from(payload),
            },
            4 + len,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Record {
        Record::from_request(
            &WriteRequest::new("sharded", "treasures,type=gold value=100 1\n")
                .with_retention_policy("autogen")
                .with_precision("ns"),
        )
    }

    #[test]
    fn test_record_framing() {
        let encoded = record().encode().unwrap();
        let (decoded, used) = Record::decode(&encoded).unwrap().unwrap();
        assert_eq!(used, encoded.len());
        assert_eq!(decoded, record());

        let request = decoded.into_request();
        assert_eq!(request.database, "sharded");
        assert_eq!(request.retention_policy, "autogen");
    }

    #[test]
    fn test_torn_tail_is_incomplete() {
        let encoded = record().encode().unwrap();
        assert!(Record::decode(&encoded[..encoded.len() - 3]).unwrap().is_none());
        assert!(Record::decode(&encoded[..2]).unwrap().is_none());
    }

    #[test]
    fn test_length_prefix_is_bounded() {
        let mut frame = vec![0u8; 16];
        frame[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(Record::decode(&frame), Err(RelayError::Corruption(_))));
    }

    #[test]
    fn test_checksum_validation() {
        let mut encoded = record().encode().unwrap().to_vec();
        encoded[10] ^= 0xFF;
        let result = Record::decode(&encoded);
        assert!(matches!(result, Err(RelayError::ChecksumMismatch { .. })));
    }
}
