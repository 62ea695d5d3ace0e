//! Journal record codec
//!
//! Record format (big-endian):
//! ```text
//! +----------+---------+-------------+------------------------+--------+
//! | Sequence | OpCode  | Payload len | Payload                | CRC32C |
//! | 8B       | 4B      | 4B          | created_at (8B) + body | 4B     |
//! +----------+---------+-------------+------------------------+--------+
//! ```
//!
//! The CRC covers everything before it. Segment files start with a
//! 16-byte header: magic `MJNL`, format version, reserved, first sequence.
//!
//! The same record encoding is used on the replication wire, so a batch of
//! pulled entries is simply a concatenation of records.

use super::JournalEntry;
use bytes::Bytes;
use meridian_common::checksum::{ChecksumCalculator, verify_crc32c};
use meridian_common::{ConsistencyKind, Error, Result, SequenceId};
use std::io::{self, Read};

/// Segment file magic
pub const SEGMENT_MAGIC: [u8; 4] = *b"MJNL";

/// Segment format version written by this build
pub const SEGMENT_VERSION: u16 = 1;

/// Segment header size (magic + version + reserved + first sequence)
pub const SEGMENT_HEADER_SIZE: usize = 16;

/// Record header size (sequence + op code + payload length)
pub const RECORD_HEADER_SIZE: usize = 16;

/// Trailing checksum size
pub const RECORD_TRAILER_SIZE: usize = 4;

/// The timestamp leading every payload
const TIMESTAMP_SIZE: usize = 8;

/// Upper bound on a single payload; anything larger is treated as corrupt
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Largest operation body that fits a payload
pub const MAX_BODY_SIZE: usize = MAX_PAYLOAD_SIZE - TIMESTAMP_SIZE;

/// Size of a record with an empty body
pub const MIN_RECORD_SIZE: usize = RECORD_HEADER_SIZE + TIMESTAMP_SIZE + RECORD_TRAILER_SIZE;

/// Why a record could not be decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// The buffer ends inside the record (torn write or short read)
    Incomplete,
    /// A complete record whose checksum does not match
    Corrupt {
        /// Sequence id as read from the (untrusted) header
        header_sequence: SequenceId,
        /// Encoded size, so a scanner can step over it
        len: usize,
    },
    /// Structurally invalid record
    Malformed(String),
}

impl RecordError {
    /// Convert into a consistency error at the sequence the reader expected
    #[must_use]
    pub fn into_error(self, expected: SequenceId) -> Error {
        let kind = match self {
            Self::Incomplete => ConsistencyKind::Malformed("truncated record".into()),
            Self::Corrupt { .. } => ConsistencyKind::ChecksumMismatch,
            Self::Malformed(msg) => ConsistencyKind::Malformed(msg),
        };
        Error::consistency(expected, kind)
    }
}

/// Encoded size of an entry
#[must_use]
pub fn encoded_len(entry: &JournalEntry) -> usize {
    RECORD_HEADER_SIZE + TIMESTAMP_SIZE + entry.payload.len() + RECORD_TRAILER_SIZE
}

/// Append the encoded record for `entry` to `buf`.
///
/// Appends reject bodies over [`MAX_BODY_SIZE`] first; should one get here
/// anyway its length is written saturated, which no decoder accepts.
pub fn encode_record(entry: &JournalEntry, buf: &mut Vec<u8>) {
    let start = buf.len();
    let payload_len = TIMESTAMP_SIZE + entry.payload.len();
    debug_assert!(payload_len <= MAX_PAYLOAD_SIZE);
    buf.reserve(encoded_len(entry));

    buf.extend_from_slice(&entry.sequence_id.to_be_bytes());
    buf.extend_from_slice(&entry.op_code.to_be_bytes());
    buf.extend_from_slice(&u32::try_from(payload_len).unwrap_or(u32::MAX).to_be_bytes());
    buf.extend_from_slice(&entry.created_at.to_be_bytes());
    buf.extend_from_slice(&entry.payload);

    let mut crc = ChecksumCalculator::new();
    crc.update(&buf[start..]);
    buf.extend_from_slice(&crc.finalize().to_be_bytes());
}

/// Encode a batch of entries back to back
#[must_use]
pub fn encode_batch(entries: &[JournalEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entries.iter().map(encoded_len).sum());
    for entry in entries {
        encode_record(entry, &mut buf);
    }
    buf
}

struct Header {
    sequence_id: SequenceId,
    op_code: u32,
    payload_len: usize,
}

fn parse_header(data: &[u8]) -> std::result::Result<Header, RecordError> {
    let sequence_id = u64::from_be_bytes(take(data, 0)?);
    let op_code = u32::from_be_bytes(take(data, 8)?);
    let payload_len = u32::from_be_bytes(take(data, 12)?) as usize;
    if payload_len < TIMESTAMP_SIZE {
        return Err(RecordError::Malformed(format!(
            "payload length {payload_len} shorter than timestamp"
        )));
    }
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(RecordError::Malformed(format!(
            "payload length {payload_len} exceeds limit"
        )));
    }
    Ok(Header {
        sequence_id,
        op_code,
        payload_len,
    })
}

fn take<const N: usize>(data: &[u8], at: usize) -> std::result::Result<[u8; N], RecordError> {
    data.get(at..at + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(RecordError::Incomplete)
}

/// Decode one record from the front of `data`.
///
/// Returns the entry and the number of bytes consumed.
pub fn decode_record(data: &[u8]) -> std::result::Result<(JournalEntry, usize), RecordError> {
    let header = parse_header(data)?;
    let body_end = RECORD_HEADER_SIZE + header.payload_len;
    let total = body_end + RECORD_TRAILER_SIZE;
    if data.len() < total {
        return Err(RecordError::Incomplete);
    }

    let stored_crc = u32::from_be_bytes(take(data, body_end)?);
    if !verify_crc32c(&data[..body_end], stored_crc) {
        return Err(RecordError::Corrupt {
            header_sequence: header.sequence_id,
            len: total,
        });
    }

    let created_at = u64::from_be_bytes(take(data, RECORD_HEADER_SIZE)?);
    let payload = Bytes::copy_from_slice(&data[RECORD_HEADER_SIZE + TIMESTAMP_SIZE..body_end]);
    Ok((
        JournalEntry {
            sequence_id: header.sequence_id,
            op_code: header.op_code,
            created_at,
            payload,
        },
        total,
    ))
}

/// Decode a concatenation of records. Any leftover or corrupt bytes are an
/// error; `first` is the sequence the batch is expected to start at.
pub fn decode_batch(mut data: &[u8], first: SequenceId) -> Result<Vec<JournalEntry>> {
    let mut entries = Vec::new();
    let mut expected = first;
    while !data.is_empty() {
        let (entry, used) = decode_record(data).map_err(|e| e.into_error(expected))?;
        entries.push(entry);
        data = &data[used..];
        expected += 1;
    }
    Ok(entries)
}

/// Read one record from a stream.
///
/// `Ok(None)` means a clean end of stream. Records whose header sequence is
/// below `skip_below` are stepped over without verifying their body.
pub fn read_record<R: Read>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    skip_below: SequenceId,
) -> io::Result<Option<std::result::Result<JournalEntry, RecordError>>> {
    buf.clear();
    buf.resize(RECORD_HEADER_SIZE, 0);
    match read_full(reader, buf)? {
        0 => return Ok(None),
        n if n < RECORD_HEADER_SIZE => return Ok(Some(Err(RecordError::Incomplete))),
        _ => {}
    }

    let header = match parse_header(buf) {
        Ok(h) => h,
        Err(e) => return Ok(Some(Err(e))),
    };
    let rest = header.payload_len + RECORD_TRAILER_SIZE;

    if header.sequence_id < skip_below {
        let skipped = io::copy(&mut reader.by_ref().take(rest as u64), &mut io::sink())?;
        if skipped < rest as u64 {
            return Ok(Some(Err(RecordError::Incomplete)));
        }
        return Ok(Some(Ok(JournalEntry {
            sequence_id: header.sequence_id,
            op_code: header.op_code,
            created_at: 0,
            payload: Bytes::new(),
        })));
    }

    buf.resize(RECORD_HEADER_SIZE + rest, 0);
    let n = read_full(reader, &mut buf[RECORD_HEADER_SIZE..])?;
    if n < rest {
        return Ok(Some(Err(RecordError::Incomplete)));
    }
    Ok(Some(decode_record(buf).map(|(entry, _)| entry)))
}

/// Fill `buf` as far as the stream allows; returns bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Segment file header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    pub version: u16,
    pub first_sequence: SequenceId,
}

impl SegmentHeader {
    #[must_use]
    pub const fn new(first_sequence: SequenceId) -> Self {
        Self {
            version: SEGMENT_VERSION,
            first_sequence,
        }
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut out = [0u8; SEGMENT_HEADER_SIZE];
        out[0..4].copy_from_slice(&SEGMENT_MAGIC);
        out[4..6].copy_from_slice(&self.version.to_be_bytes());
        out[8..16].copy_from_slice(&self.first_sequence.to_be_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < SEGMENT_HEADER_SIZE || data[0..4] != SEGMENT_MAGIC {
            return Err(Error::consistency(
                0,
                ConsistencyKind::Malformed("invalid segment header".into()),
            ));
        }
        let version = u16::from_be_bytes([data[4], data[5]]);
        if version > SEGMENT_VERSION {
            return Err(Error::VersionSkew {
                found: version,
                supported: SEGMENT_VERSION,
            });
        }
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&data[8..16]);
        Ok(Self {
            version,
            first_sequence: u64::from_be_bytes(seq),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Operation;
    use std::io::Cursor;

    fn entry(seq: u64) -> JournalEntry {
        JournalEntry::new(seq, &Operation::create_table(1, format!("t{seq}")), 42).unwrap()
    }

    #[test]
    fn test_record_layout() {
        let e = entry(7);
        let mut buf = Vec::new();
        encode_record(&e, &mut buf);

        assert_eq!(buf.len(), encoded_len(&e));
        assert_eq!(&buf[0..8], &7u64.to_be_bytes());
        assert_eq!(&buf[8..12], &200u32.to_be_bytes());

        let (decoded, used) = decode_record(&buf).unwrap();
        assert_eq!(decoded, e);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn test_corrupt_and_torn_records() {
        let mut buf = Vec::new();
        encode_record(&entry(3), &mut buf);

        assert_eq!(
            decode_record(&buf[..buf.len() - 1]).unwrap_err(),
            RecordError::Incomplete
        );

        let len = buf.len();
        buf[RECORD_HEADER_SIZE + 9] ^= 0xFF;
        assert_eq!(
            decode_record(&buf).unwrap_err(),
            RecordError::Corrupt {
                header_sequence: 3,
                len
            }
        );
        assert!(matches!(
            RecordError::Corrupt {
                header_sequence: 3,
                len
            }
            .into_error(3),
            Error::Consistency {
                sequence: 3,
                kind: ConsistencyKind::ChecksumMismatch
            }
        ));
    }

    #[test]
    fn test_batch_and_stream() {
        let entries: Vec<_> = (1..=3).map(entry).collect();
        let wire = encode_batch(&entries);
        assert_eq!(decode_batch(&wire, 1).unwrap(), entries);

        let mut cursor = Cursor::new(&wire);
        let mut buf = Vec::new();
        // first record is stepped over
        let skipped = read_record(&mut cursor, &mut buf, 2).unwrap().unwrap().unwrap();
        assert_eq!(skipped.sequence_id, 1);
        assert!(skipped.payload.is_empty());
        let second = read_record(&mut cursor, &mut buf, 2).unwrap().unwrap().unwrap();
        assert_eq!(second, entries[1]);
        let third = read_record(&mut cursor, &mut buf, 2).unwrap().unwrap().unwrap();
        assert_eq!(third, entries[2]);
        assert!(read_record(&mut cursor, &mut buf, 2).unwrap().is_none());
    }

    #[test]
    fn test_segment_header() {
        let header = SegmentHeader::new(1_001);
        let parsed = SegmentHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);

        let mut bytes = header.to_bytes();
        bytes[5] = 9;
        assert!(matches!(
            SegmentHeader::from_bytes(&bytes),
            Err(Error::VersionSkew { found: 9, .. })
        ));
        assert!(SegmentHeader::from_bytes(b"garbage garbage!").is_err());
    }
}
