//! Checkpoint image format
//!
//! ```text
//! +-------+---------+--------+------------+--------------+----------+------+--------+
//! | Magic | Version | Up to  | Created at | Entity count | Body len | Body | CRC32C |
//! | 4B    | 2B      | 8B     | 8B         | 8B           | 8B       | var  | 4B     |
//! +-------+---------+--------+------------+--------------+----------+------+--------+
//! ```
//!
//! Integers are big-endian, the body is the bincode-encoded state and the
//! CRC covers everything before it. The same bytes are served to followers
//! that fell behind the leader's retained journal.

use crate::state::MetadataState;
use meridian_common::checksum::{ChecksumCalculator, verify_crc32c};
use meridian_common::{Error, Result, SequenceId};
use serde::Serialize;

/// Image magic
pub const IMAGE_MAGIC: [u8; 4] = *b"MCKP";

/// Image format version written by this build
pub const IMAGE_FORMAT_VERSION: u16 = 1;

/// Fixed header size
pub const IMAGE_HEADER_SIZE: usize = 4 + 2 + 8 + 8 + 8 + 8;

const CRC_SIZE: usize = 4;

/// Image header
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ImageHeader {
    pub format_version: u16,
    /// Last sequence id reflected in the image
    pub up_to_sequence: SequenceId,
    /// Unix milliseconds when the image was taken
    pub created_at: u64,
    pub entity_count: u64,
    pub body_len: u64,
}

impl ImageHeader {
    fn to_bytes(self) -> [u8; IMAGE_HEADER_SIZE] {
        let mut out = [0u8; IMAGE_HEADER_SIZE];
        out[0..4].copy_from_slice(&IMAGE_MAGIC);
        out[4..6].copy_from_slice(&self.format_version.to_be_bytes());
        out[6..14].copy_from_slice(&self.up_to_sequence.to_be_bytes());
        out[14..22].copy_from_slice(&self.created_at.to_be_bytes());
        out[22..30].copy_from_slice(&self.entity_count.to_be_bytes());
        out[30..38].copy_from_slice(&self.body_len.to_be_bytes());
        out
    }

    /// Parse and check a header
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < IMAGE_HEADER_SIZE {
            return Err(Error::checkpoint("image shorter than its header"));
        }
        if data[0..4] != IMAGE_MAGIC {
            return Err(Error::checkpoint("invalid image magic"));
        }
        let format_version = u16::from_be_bytes([data[4], data[5]]);
        if format_version > IMAGE_FORMAT_VERSION {
            return Err(Error::VersionSkew {
                found: format_version,
                supported: IMAGE_FORMAT_VERSION,
            });
        }
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[at..at + 8]);
            u64::from_be_bytes(b)
        };
        Ok(Self {
            format_version,
            up_to_sequence: u64_at(6),
            created_at: u64_at(14),
            entity_count: u64_at(22),
            body_len: u64_at(30),
        })
    }
}

/// Serialize a state into an image
pub fn encode_image(state: &MetadataState, created_at: u64) -> Result<Vec<u8>> {
    let body = bincode::serialize(state)?;
    let header = ImageHeader {
        format_version: IMAGE_FORMAT_VERSION,
        up_to_sequence: state.last_applied(),
        created_at,
        entity_count: state.stats().total() as u64,
        body_len: body.len() as u64,
    };

    let mut out = Vec::with_capacity(IMAGE_HEADER_SIZE + body.len() + CRC_SIZE);
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&body);

    let mut crc = ChecksumCalculator::new();
    crc.update(&out);
    out.extend_from_slice(&crc.finalize().to_be_bytes());
    Ok(out)
}

/// Verify and deserialize an image
pub fn decode_image(data: &[u8]) -> Result<(ImageHeader, MetadataState)> {
    let header = ImageHeader::from_bytes(data)?;
    let body_len = usize::try_from(header.body_len)
        .map_err(|_| Error::checkpoint("image body length out of range"))?;
    let (body_end, total) = IMAGE_HEADER_SIZE
        .checked_add(body_len)
        .and_then(|end| Some((end, end.checked_add(CRC_SIZE)?)))
        .ok_or_else(|| Error::checkpoint("image body length out of range"))?;
    if data.len() != total {
        return Err(Error::checkpoint(format!(
            "image is {} bytes, header describes {}",
            data.len(),
            total
        )));
    }

    let stored = u32::from_be_bytes([
        data[body_end],
        data[body_end + 1],
        data[body_end + 2],
        data[body_end + 3],
    ]);
    if !verify_crc32c(&data[..body_end], stored) {
        return Err(Error::checkpoint("image checksum mismatch"));
    }

    let state: MetadataState = bincode::deserialize(&data[IMAGE_HEADER_SIZE..body_end])
        .map_err(|e| Error::checkpoint(format!("undecodable image body: {e}")))?;
    if state.last_applied() != header.up_to_sequence {
        return Err(Error::checkpoint(format!(
            "image header covers {} but body covers {}",
            header.up_to_sequence,
            state.last_applied()
        )));
    }
    Ok((header, state))
}
