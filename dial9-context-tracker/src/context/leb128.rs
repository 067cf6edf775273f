//! Integer codecs used by the persisted context blob.
//!
//! ## LEB128
//! Unsigned, little-endian groups of 7 bits. Every byte except the last has
//! the continuation bit (0x80) set. A `u64` takes 1 to 10 bytes.
//!
//! ## Group varint
//! Each value is stored as its minimal number of raw big-endian bytes (1-8,
//! zero takes one byte). The byte count lives in a separate size bitmap:
//! 3 bits per value holding `size - 1`, packed MSB first, so every 8 values
//! share 3 bitmap bytes:
//!
//! ```text
//! byte 0: [111 222 33]
//! byte 1: [3 444 555 6]
//! byte 2: [66 777 888]
//! ```

use std::io::{self, Read, Write};

pub const MAX_VARINT_LEN: usize = 10;

const BITS_PER_SIZE: usize = 3;

/// Number of bytes [`put_varint`] writes for `value`.
pub fn varint_size(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

pub fn put_varint(w: &mut impl Write, mut value: u64) -> io::Result<usize> {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let mut len = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[len] = byte;
            len += 1;
            break;
        }
        buf[len] = byte | 0x80;
        len += 1;
    }
    w.write_all(&buf[..len])?;
    Ok(len)
}

pub fn read_varint(r: &mut impl Read) -> io::Result<u64> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte)?;
        let payload = (byte[0] & 0x7f) as u64;
        let shift = 7 * i as u32;
        if i == MAX_VARINT_LEN - 1 && payload > 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "varint overflows 64 bits",
            ));
        }
        value |= payload << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "varint longer than 10 bytes",
    ))
}

/// Minimal number of big-endian bytes holding `value`, between 1 and 8.
pub fn long_size(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(8).max(1)
}

/// Bytes of size bitmap needed for `count` group-varint values.
pub fn bitmap_len(count: usize) -> usize {
    (count * BITS_PER_SIZE).div_ceil(8)
}

/// Accumulates group-varint values into a data region and a size bitmap.
#[derive(Debug, Default, Clone)]
pub struct GroupVarintWriter {
    data: Vec<u8>,
    bitmap: Vec<u8>,
    count: usize,
}

impl GroupVarintWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, value: u64) {
        let size = long_size(value);
        self.data
            .extend_from_slice(&value.to_be_bytes()[8 - size..]);
        self.store_size(size);
        self.count += 1;
    }

    fn store_size(&mut self, size: usize) {
        let class = (size - 1) as u8;
        let first_bit = self.count * BITS_PER_SIZE;
        self.bitmap.resize(bitmap_len(self.count + 1), 0);
        for k in 0..BITS_PER_SIZE {
            if class & (0b100 >> k) != 0 {
                let bit = first_bit + k;
                self.bitmap[bit / 8] |= 0x80 >> (bit % 8);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    /// Data plus bitmap bytes after appending `values`, without appending them.
    pub fn encoded_len_with(&self, values: &[u64]) -> usize {
        let data: usize = values.iter().map(|&v| long_size(v)).sum();
        self.data.len() + data + bitmap_len(self.count + values.len())
    }

    pub fn encoded_len(&self) -> usize {
        self.data.len() + self.bitmap.len()
    }
}

/// Reads values back from a data region and its size bitmap.
#[derive(Debug)]
pub struct GroupVarintReader<'a> {
    data: &'a [u8],
    bitmap: &'a [u8],
    index: usize,
}

impl<'a> GroupVarintReader<'a> {
    pub fn new(data: &'a [u8], bitmap: &'a [u8]) -> Self {
        Self {
            data,
            bitmap,
            index: 0,
        }
    }

    fn size_at(&self, index: usize) -> io::Result<usize> {
        let first_bit = index * BITS_PER_SIZE;
        let mut class = 0usize;
        for k in 0..BITS_PER_SIZE {
            let bit = first_bit + k;
            let byte = self.bitmap.get(bit / 8).ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "size bitmap exhausted")
            })?;
            class = (class << 1) | ((byte >> (7 - bit % 8)) & 1) as usize;
        }
        Ok(class + 1)
    }

    pub fn read(&mut self) -> io::Result<u64> {
        let size = self.size_at(self.index)?;
        if self.data.len() < size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "group varint data exhausted",
            ));
        }
        let (bytes, rest) = self.data.split_at(size);
        let mut buf = [0u8; 8];
        buf[8 - size..].copy_from_slice(bytes);
        self.data = rest;
        self.index += 1;
        Ok(u64::from_be_bytes(buf))
    }

    /// Bytes of the data region not consumed yet.
    pub fn remaining(&self) -> usize {
        self.data.len()
    }
}
