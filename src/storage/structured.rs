//! Structured file I/O for binary data serialization.
//!
//! This module provides efficient binary serialization for index data
//! structures: fixed-width little-endian integers, variable-length integers,
//! zig-zag signed values, length-prefixed byte strings and delta-compressed
//! id runs. Every file carries a crc32 footer written on close and verified
//! by readers.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, XystonError};
use crate::storage::{StorageInput, StorageOutput};
use crate::util::varint::{zigzag_decode, zigzag_encode};

/// A structured file writer for binary data.
pub struct StructWriter<W: StorageOutput> {
    writer: W,
    hasher: crc32fast::Hasher,
    position: u64,
}

impl<W: StorageOutput> StructWriter<W> {
    /// Create a new structured file writer.
    pub fn new(writer: W) -> Self {
        StructWriter {
            writer,
            hasher: crc32fast::Hasher::new(),
            position: 0,
        }
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.writer.write_u8(value)?;
        self.hasher.update(&[value]);
        self.position += 1;
        Ok(())
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.writer.write_u32::<LittleEndian>(value)?;
        self.hasher.update(&value.to_le_bytes());
        self.position += 4;
        Ok(())
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.writer.write_u64::<LittleEndian>(value)?;
        self.hasher.update(&value.to_le_bytes());
        self.position += 8;
        Ok(())
    }

    /// Write a variable-length integer.
    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        let mut val = value;
        loop {
            let mut byte = (val & 0x7F) as u8;
            val >>= 7;
            if val != 0 {
                byte |= 0x80;
            }
            self.writer.write_u8(byte)?;
            self.hasher.update(&[byte]);
            self.position += 1;
            if val == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Write a zig-zag encoded signed integer.
    pub fn write_zigzag(&mut self, value: i64) -> Result<()> {
        self.write_varint(zigzag_encode(value))
    }

    /// Write a string with length prefix.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Write raw bytes with length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.write_raw(value)
    }

    /// Write raw bytes without length prefix.
    pub fn write_raw(&mut self, value: &[u8]) -> Result<()> {
        self.writer.write_all(value)?;
        self.hasher.update(value);
        self.position += value.len() as u64;
        Ok(())
    }

    /// Write a compressed integer run using delta encoding.
    ///
    /// The values must be sorted ascending.
    pub fn write_delta_u32s<I: IntoIterator<Item = u32>>(&mut self, values: I) -> Result<()> {
        let mut previous = 0u32;
        for value in values {
            let delta = value.wrapping_sub(previous);
            self.write_varint(delta as u64)?;
            previous = value;
        }
        Ok(())
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Write the checksum footer, flush and close the writer.
    pub fn close(mut self) -> Result<()> {
        let checksum = self.hasher.clone().finalize();
        self.writer.write_u32::<LittleEndian>(checksum)?;
        self.writer.flush_output()?;
        self.writer.close()?;
        Ok(())
    }
}

/// A structured file reader for binary data.
pub struct StructReader<R: StorageInput> {
    reader: R,
    hasher: crc32fast::Hasher,
    position: u64,
    file_size: u64,
}

impl<R: StorageInput> StructReader<R> {
    /// Create a new structured file reader.
    pub fn new(reader: R) -> Result<Self> {
        let file_size = reader.size()?;
        Ok(StructReader {
            reader,
            hasher: crc32fast::Hasher::new(),
            position: 0,
            file_size,
        })
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> Result<u8> {
        let value = self.reader.read_u8()?;
        self.hasher.update(&[value]);
        self.position += 1;
        Ok(value)
    }

    /// Read a u32 value (little-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self.reader.read_u32::<LittleEndian>()?;
        self.hasher.update(&value.to_le_bytes());
        self.position += 4;
        Ok(value)
    }

    /// Read a u64 value (little-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        let value = self.reader.read_u64::<LittleEndian>()?;
        self.hasher.update(&value.to_le_bytes());
        self.position += 8;
        Ok(value)
    }

    /// Read a variable-length integer.
    pub fn read_varint(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0;

        loop {
            if shift >= 64 {
                return Err(XystonError::serialization("VarInt overflow"));
            }
            let byte = self.reader.read_u8()?;
            self.hasher.update(&[byte]);
            self.position += 1;

            result |= ((byte & 0x7F) as u64) << shift;
            if (byte & 0x80) == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Read a zig-zag encoded signed integer.
    pub fn read_zigzag(&mut self) -> Result<i64> {
        Ok(zigzag_decode(self.read_varint()?))
    }

    /// Read a length-prefixed string.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes)
            .map_err(|e| XystonError::serialization(format!("invalid utf-8: {e}")))
    }

    /// Read length-prefixed bytes.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_varint()? as usize;
        self.read_raw(len)
    }

    /// Read exactly `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        self.hasher.update(&buf);
        self.position += len as u64;
        Ok(buf)
    }

    /// Read a delta-compressed run of `count` sorted u32 values.
    pub fn read_delta_u32s(&mut self, count: usize) -> Result<Vec<u32>> {
        let mut values = Vec::with_capacity(count);
        let mut previous = 0u32;
        for _ in 0..count {
            let delta = self.read_varint()? as u32;
            previous = previous.wrapping_add(delta);
            values.push(previous);
        }
        Ok(values)
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes remaining before the checksum footer.
    pub fn remaining(&self) -> u64 {
        self.file_size.saturating_sub(self.position + 4)
    }

    /// Read the checksum footer and verify it against the bytes read so far.
    pub fn expect_checksum(mut self) -> Result<()> {
        let expected = self.reader.read_u32::<LittleEndian>()?;
        let actual = self.hasher.finalize();
        if expected != actual {
            return Err(XystonError::serialization(format!(
                "checksum mismatch: expected {expected:#x}, computed {actual:#x}"
            )));
        }
        Ok(())
    }
}
