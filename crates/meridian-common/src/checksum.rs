//! Checksum utilities for Meridian
//!
//! Journal records and checkpoint images are both protected by CRC32C.

/// Streaming CRC32C calculator
///
/// Lets writers checksum a record or image while it is being assembled
/// instead of hashing the finished buffer a second time.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChecksumCalculator {
    crc32c: u32,
}

impl ChecksumCalculator {
    /// Create a new calculator
    #[must_use]
    pub const fn new() -> Self {
        Self { crc32c: 0 }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.crc32c = crc32c::crc32c_append(self.crc32c, data);
    }

    /// Return the checksum of everything fed so far
    #[must_use]
    pub const fn finalize(self) -> u32 {
        self.crc32c
    }

    /// Reset the calculator for reuse
    pub fn reset(&mut self) {
        self.crc32c = 0;
    }
}

/// Quick CRC32C verification
#[inline]
#[must_use]
pub fn verify_crc32c(data: &[u8], expected: u32) -> bool {
    crc32c::crc32c(data) == expected
}

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}
