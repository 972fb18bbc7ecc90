// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::io::{Read, Write};

/// Error during serialization.
#[derive(Debug)]
pub enum EncodeError {
    /// I/O error.
    Io(std::io::Error),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "EncodeError({e})"),
        }
    }
}

impl From<std::io::Error> for EncodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::error::Error for EncodeError {}

/// Error during deserialization.
#[derive(Debug)]
pub enum DecodeError {
    /// I/O error.
    Io(std::io::Error),
    /// Record header did not match the expected tag set.
    InvalidTag(u8),
    /// A length-prefixed string was not valid UTF-8.
    InvalidUtf8,
    /// The record's trailing checksum did not match.
    ChecksumMismatch,
    /// The stream ended before a full record could be read.
    UnexpectedEof,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "DecodeError::Io({e})"),
            Self::InvalidTag(t) => write!(f, "DecodeError::InvalidTag({t})"),
            Self::InvalidUtf8 => write!(f, "DecodeError::InvalidUtf8"),
            Self::ChecksumMismatch => write!(f, "DecodeError::ChecksumMismatch"),
            Self::UnexpectedEof => write!(f, "DecodeError::UnexpectedEof"),
        }
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::UnexpectedEof
        } else {
            Self::Io(value)
        }
    }
}

impl std::error::Error for DecodeError {}

/// Trait implemented by wire types that serialize into the transaction log.
pub trait Encode {
    /// Serializes `self` into `writer`.
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    /// Serializes `self` into a freshly allocated vector.
    fn encode_into_vec(&self) -> Vec<u8> {
        let mut v = vec![];
        self.encode_into(&mut v).expect("writing to a Vec cannot fail");
        v
    }
}

/// Trait implemented by wire types that deserialize from the transaction log.
pub trait Decode: Sized {
    /// Deserializes `Self` from `reader`.
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError>;
}

/// Writes a length-prefixed UTF-8 string: `u32` length followed by raw bytes.
pub fn write_string<W: Write>(writer: &mut W, s: &str) -> Result<(), EncodeError> {
    use byteorder::{LittleEndian, WriteBytesExt};
    writer.write_u32::<LittleEndian>(s.len() as u32)?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

/// Reads a length-prefixed UTF-8 string written by [`write_string`].
pub fn read_string<R: Read>(reader: &mut R) -> Result<String, DecodeError> {
    use byteorder::{LittleEndian, ReadBytesExt};
    let len = reader.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| DecodeError::InvalidUtf8)
}

/// Writes a length-prefixed array of `u64`s.
pub fn write_u64_array<W: Write>(writer: &mut W, items: &[u64]) -> Result<(), EncodeError> {
    use byteorder::{LittleEndian, WriteBytesExt};
    writer.write_u32::<LittleEndian>(items.len() as u32)?;
    for item in items {
        writer.write_u64::<LittleEndian>(*item)?;
    }
    Ok(())
}

/// Reads a length-prefixed array of `u64`s written by [`write_u64_array`].
pub fn read_u64_array<R: Read>(reader: &mut R) -> Result<Vec<u64>, DecodeError> {
    use byteorder::{LittleEndian, ReadBytesExt};
    let len = reader.read_u32::<LittleEndian>()? as usize;
    let mut items = Vec::with_capacity(len);
    for _ in 0..len {
        items.push(reader.read_u64::<LittleEndian>()?);
    }
    Ok(items)
}
