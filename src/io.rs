
//! Low level byte input and output.
//! Every multi-byte value on the wire is little-endian.

pub use std::io::{Read, Write};

use crate::error::{Result, UnitResult};
use lebe::prelude::*;

/// Extension trait for primitive types that are read and written little-endian.
pub trait Data: Sized + Default + Clone {

    /// Number of bytes this value occupies on the wire.
    const BYTE_SIZE: usize = std::mem::size_of::<Self>();

    /// Read this value from the byte stream.
    fn read(read: &mut impl Read) -> Result<Self>;

    /// Write this value to the byte stream.
    fn write(self, write: &mut impl Write) -> UnitResult;

    /// Read a slice worth of values from the byte stream.
    fn read_slice(read: &mut impl Read, slice: &mut [Self]) -> UnitResult;

    /// Write a slice of values to the byte stream.
    fn write_slice(write: &mut impl Write, slice: &[Self]) -> UnitResult;
}

macro_rules! implement_data_for_primitive {
    ($kind: ident) => {
        impl Data for $kind {
            #[inline]
            fn read(read: &mut impl Read) -> Result<Self> {
                Ok(read.read_from_little_endian()?)
            }

            #[inline]
            fn write(self, write: &mut impl Write) -> UnitResult {
                write.write_as_little_endian(&self)?;
                Ok(())
            }

            #[inline]
            fn read_slice(read: &mut impl Read, slice: &mut [Self]) -> UnitResult {
                read.read_from_little_endian_into(slice)?;
                Ok(())
            }

            #[inline]
            fn write_slice(write: &mut impl Write, slice: &[Self]) -> UnitResult {
                write.write_as_little_endian(slice)?;
                Ok(())
            }
        }
    };
}

implement_data_for_primitive!(u8);
implement_data_for_primitive!(u16);
implement_data_for_primitive!(u32);
implement_data_for_primitive!(i32);
implement_data_for_primitive!(u64);

/// Read one little-endian `u32` out of a byte slice.
/// Panics in debug mode if fewer than four bytes remain.
#[inline]
pub fn u32_from_le_bytes(bytes: &[u8], byte_offset: usize) -> u32 {
    let word: [u8; 4] = bytes[byte_offset .. byte_offset + 4]
        .try_into().expect("sliced exactly four bytes");

    u32::from_le_bytes(word)
}

/// Read one little-endian `u16` out of a byte slice.
#[inline]
pub fn u16_from_le_bytes(bytes: &[u8], byte_offset: usize) -> u16 {
    let short: [u8; 2] = bytes[byte_offset .. byte_offset + 2]
        .try_into().expect("sliced exactly two bytes");

    u16::from_le_bytes(short)
}

/// Reinterpret a little-endian byte stream as 32-bit words.
/// The length of the input must be a multiple of four.
pub fn words_from_le_bytes(bytes: &[u8]) -> Vec<u32> {
    debug_assert_eq!(bytes.len() % 4, 0, "byte count is not a whole number of words");

    bytes.chunks_exact(4)
        .map(|chunk| u32::from_le_bytes(chunk.try_into().expect("chunked exactly four bytes")))
        .collect()
}

/// Serialize 32-bit words to a little-endian byte stream.
pub fn words_to_le_bytes(words: &[u32], bytes: &mut Vec<u8>) {
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
}

use std::convert::TryInto;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_words(){
        let words = [ 0_u32, 1, 0xdead_beef, u32::MAX, 0x0102_0304 ];

        let mut bytes = Vec::new();
        words_to_le_bytes(&words, &mut bytes);
        assert_eq!(bytes.len(), words.len() * 4);
        assert_eq!(&bytes[8..12], &[ 0xef, 0xbe, 0xad, 0xde ]);

        assert_eq!(words_from_le_bytes(&bytes), words);
        assert_eq!(u32_from_le_bytes(&bytes, 4), 1);
        assert_eq!(u16_from_le_bytes(&bytes, 8), 0xbeef);
    }
}
