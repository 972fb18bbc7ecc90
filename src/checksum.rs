// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! CRC32C checksums used to protect transaction log records (see `transaction_log`).

/// A 32-bit CRC32C (Castagnoli) checksum.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Checksum(u32);

impl Checksum {
    /// Wraps a raw checksum value.
    #[must_use]
    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw 32-bit integer.
    #[must_use]
    pub fn into_u32(self) -> u32 {
        self.0
    }

    /// Computes the checksum of a byte slice.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(crc32c::crc32c(bytes))
    }

    pub(crate) fn check(&self, expected: Self) -> crate::Result<()> {
        if self.0 == expected.0 {
            Ok(())
        } else {
            Err(crate::Error::InvalidChecksum {
                expected,
                got: *self,
            })
        }
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// A running CRC32C hasher that can be fed in pieces, used while encoding a
/// transaction record so the checksum can be appended without a second pass.
#[derive(Default)]
pub struct ChecksumBuilder {
    state: u32,
}

impl ChecksumBuilder {
    /// Creates a fresh, empty checksum builder.
    #[must_use]
    pub fn new() -> Self {
        Self { state: 0 }
    }

    /// Feeds more bytes into the running checksum.
    pub fn update(&mut self, bytes: &[u8]) {
        self.state = crc32c::crc32c_append(self.state, bytes);
    }

    /// Finalizes the checksum.
    #[must_use]
    pub fn finish(&self) -> Checksum {
        Checksum(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_incremental() {
        let whole = Checksum::of(b"hello world");

        let mut builder = ChecksumBuilder::new();
        builder.update(b"hello ");
        builder.update(b"world");

        assert_eq!(whole, builder.finish());
    }

    #[test]
    fn checksum_detects_corruption() {
        let a = Checksum::of(b"abc");
        let b = Checksum::of(b"abd");
        assert!(a.check(a).is_ok());
        assert!(a.check(b).is_err());
    }
}
