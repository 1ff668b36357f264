
//! The wire format.
//!
//! Every multi-byte field is little-endian, packed into 32-bit words;
//! bit fields fill from the least significant bit upwards. Every block
//! packet occupies a whole number of words.
//!
//! A wire packet is a sequence of block packets, usually opened by one
//! sequence header. The first header word of both kinds shares the
//! `sequence` and `extended` bits, so a parser can dispatch on them
//! before knowing which kind it holds.

use crate::config::{
    ChromaSiting, ChromaSubsampling, ColorDescription, ColorPrimaries,
    TransferFunction, YcbcrRange, YcbcrTransform,
};
use crate::error::{Error, Result};

use bit_field::BitField;

/// Size of both header kinds on the wire.
pub const HEADER_BYTES: usize = 8;

/// Size of both header kinds, in words.
pub const HEADER_WORDS: usize = HEADER_BYTES / 4;

/// The frame sequence number wraps at eight.
pub const SEQUENCE_COUNT_MASK: u8 = 0x7;

/// The extended-header code announcing a new frame.
pub const START_OF_FRAME: u32 = 0;

/// Each fine block splits into eight 4×2 sub-blocks.
pub const SUB_BLOCKS_PER_FINE_BLOCK: usize = 8;

/// Coefficients per 4×2 sub-block, one bit each in a plane byte.
pub const COEFFICIENTS_PER_SUB_BLOCK: usize = 8;

/// Wire size of one `(sub_mask, q_byte)` fine block code.
pub const FINE_CODE_BYTES: usize = 3;

/// Deepest plane drop rate control may choose; drop counts are
/// the 15 candidates `0 ..= 14` described by the block statistics.
pub const MAX_PLANE_DROP: u32 = 14;

/// Was the packet at this first header word an extended (sequence) header?
#[inline]
pub fn word_is_extended(first_word: u32) -> bool {
    first_word.get_bit(31)
}

/// The sequence number of the packet at this first header word,
/// identical for both header kinds.
#[inline]
pub fn word_sequence(first_word: u32) -> u8 {
    first_word.get_bits(28 .. 31) as u8
}

/// Whether a newly observed sequence number is out of order
/// relative to the last adopted one: a backwards delta,
/// `(sequence - last) mod 8` in `(4, 7]`, is stale.
#[inline]
pub fn sequence_is_stale(last: u8, observed: u8) -> bool {
    (observed.wrapping_sub(last) & SEQUENCE_COUNT_MASK) > 4
}

/// The eight-byte header opening every block packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {

    /// One bit per fine block of the coarse block that carries data,
    /// bit `4*y + x`, truncated at band edges.
    pub ballot: u16,

    /// Length of this block packet in words, header included. 12 bits.
    pub payload_words: u16,

    /// Frame sequence number modulo eight.
    pub sequence: u8,

    /// The base quantizer code of the owning band.
    pub quant_code: u8,

    /// Global coarse block index. 24 bits.
    pub block_index: u32,
}

impl BlockHeader {

    /// Largest representable payload length in words.
    pub const MAX_PAYLOAD_WORDS: u16 = (1 << 12) - 1;

    /// Pack into the two little-endian wire words. The extended bit stays zero.
    pub fn pack(&self) -> [u32; 2] {
        debug_assert!(self.payload_words <= Self::MAX_PAYLOAD_WORDS);
        debug_assert!(self.block_index < 1 << 24);

        let mut first = 0_u32;
        first.set_bits(0 .. 16, u32::from(self.ballot));
        first.set_bits(16 .. 28, u32::from(self.payload_words));
        first.set_bits(28 .. 31, u32::from(self.sequence & SEQUENCE_COUNT_MASK));
        first.set_bit(31, false);

        let mut second = 0_u32;
        second.set_bits(0 .. 8, u32::from(self.quant_code));
        second.set_bits(8 .. 32, self.block_index);

        [ first, second ]
    }

    /// Unpack from the two wire words of a non-extended packet.
    pub fn unpack(words: [u32; 2]) -> Self {
        debug_assert!(!word_is_extended(words[0]), "not a block header");

        BlockHeader {
            ballot: words[0].get_bits(0 .. 16) as u16,
            payload_words: words[0].get_bits(16 .. 28) as u16,
            sequence: word_sequence(words[0]),
            quant_code: words[1].get_bits(0 .. 8) as u8,
            block_index: words[1].get_bits(8 .. 32),
        }
    }
}

/// The eight-byte extended header opening every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceHeader {

    /// Frame width in luma samples. Stored minus one in 14 bits.
    pub width: usize,

    /// Frame height in luma samples. Stored minus one in 14 bits.
    pub height: usize,

    /// Frame sequence number modulo eight.
    pub sequence: u8,

    /// Number of non-empty coarse blocks in this frame. 24 bits.
    pub total_blocks: u32,

    /// Extended header code, [`START_OF_FRAME`]. 2 bits.
    pub code: u32,

    /// Chroma subsampling of the frame.
    pub chroma: ChromaSubsampling,

    /// Colour metadata flags.
    pub color: ColorDescription,
}

impl SequenceHeader {

    /// Pack into the two little-endian wire words. The extended bit is set.
    pub fn pack(&self) -> [u32; 2] {
        debug_assert!(self.width >= 1 && self.width <= 1 << 14);
        debug_assert!(self.height >= 1 && self.height <= 1 << 14);
        debug_assert!(self.total_blocks < 1 << 24);

        let mut first = 0_u32;
        first.set_bits(0 .. 14, (self.width - 1) as u32);
        first.set_bits(14 .. 28, (self.height - 1) as u32);
        first.set_bits(28 .. 31, u32::from(self.sequence & SEQUENCE_COUNT_MASK));
        first.set_bit(31, true);

        let mut second = 0_u32;
        second.set_bits(0 .. 24, self.total_blocks);
        second.set_bits(24 .. 26, self.code);
        second.set_bit(26, self.chroma.to_wire() != 0);
        second.set_bit(27, self.color.primaries == ColorPrimaries::Bt2020);
        second.set_bit(28, self.color.transfer == TransferFunction::Pq);
        second.set_bit(29, self.color.transform == YcbcrTransform::Bt2020);
        second.set_bit(30, self.color.range == YcbcrRange::Limited);
        second.set_bit(31, self.color.siting == ChromaSiting::Left);

        [ first, second ]
    }

    /// Unpack from the two wire words of an extended packet.
    pub fn unpack(words: [u32; 2]) -> Self {
        debug_assert!(word_is_extended(words[0]), "not a sequence header");

        SequenceHeader {
            width: words[0].get_bits(0 .. 14) as usize + 1,
            height: words[0].get_bits(14 .. 28) as usize + 1,
            sequence: word_sequence(words[0]),
            total_blocks: words[1].get_bits(0 .. 24),
            code: words[1].get_bits(24 .. 26),
            chroma: ChromaSubsampling::from_wire(words[1].get_bit(26) as u32),
            color: ColorDescription {
                primaries: if words[1].get_bit(27) { ColorPrimaries::Bt2020 } else { ColorPrimaries::Bt709 },
                transfer: if words[1].get_bit(28) { TransferFunction::Pq } else { TransferFunction::Bt709 },
                transform: if words[1].get_bit(29) { YcbcrTransform::Bt2020 } else { YcbcrTransform::Bt709 },
                range: if words[1].get_bit(30) { YcbcrRange::Limited } else { YcbcrRange::Full },
                siting: if words[1].get_bit(31) { ChromaSiting::Left } else { ChromaSiting::Center },
            },
        }
    }
}

/// The three-byte code every significant fine block contributes:
/// a 16-bit `sub_mask` holding two extra-plane bits per 4×2 sub-block,
/// and a `q_byte` holding the coarse block's plane drop in the low nibble
/// and this fine block's plane floor in the high nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FineBlockCode {

    /// Two bits per sub-block: encoded planes above the floor.
    pub sub_mask: u16,

    /// Plane drop (low nibble) and plane floor (high nibble).
    pub q_byte: u8,
}

impl FineBlockCode {

    /// Combine drop, floor and per-sub-block extras into a wire code.
    pub fn new(plane_drop: u32, plane_floor: u32, extra_planes: [u32; SUB_BLOCKS_PER_FINE_BLOCK]) -> Self {
        debug_assert!(plane_drop <= MAX_PLANE_DROP);
        debug_assert!(plane_floor <= 0xf);

        let mut sub_mask = 0_u16;
        for (sub, &extra) in extra_planes.iter().enumerate() {
            debug_assert!(extra <= 3);
            sub_mask |= (extra as u16 & 0x3) << (2 * sub);
        }

        FineBlockCode {
            sub_mask,
            q_byte: ((plane_floor << 4) | plane_drop) as u8,
        }
    }

    /// The plane drop Δq chosen by rate control for the owning coarse block.
    #[inline]
    pub fn plane_drop(&self) -> u32 {
        u32::from(self.q_byte) & 0xf
    }

    /// The number of planes every in-bounds sub-block carries at least.
    #[inline]
    pub fn plane_floor(&self) -> u32 {
        u32::from(self.q_byte) >> 4
    }

    /// The extra planes of one sub-block, `0 ..= 3`.
    #[inline]
    pub fn extra_planes(&self, sub: usize) -> u32 {
        (u32::from(self.sub_mask) >> (2 * sub)) & 0x3
    }

    /// The number of encoded planes of one sub-block.
    #[inline]
    pub fn sub_block_planes(&self, sub: usize) -> u32 {
        self.plane_floor() + self.extra_planes(sub)
    }

    /// Total plane bytes this fine block contributes, given which
    /// of its sub-blocks are inside the band.
    pub fn plane_byte_count(&self, in_bounds_mask: u8) -> usize {
        (0 .. SUB_BLOCKS_PER_FINE_BLOCK)
            .filter(|&sub| in_bounds_mask & (1 << sub) != 0)
            .map(|sub| self.sub_block_planes(sub) as usize)
            .sum()
    }

    /// Append the three wire bytes.
    pub fn write(&self, bytes: &mut Vec<u8>) {
        bytes.extend_from_slice(&self.sub_mask.to_le_bytes());
        bytes.push(self.q_byte);
    }

    /// Read the three wire bytes at the offset.
    pub fn read(bytes: &[u8], byte_offset: usize) -> Self {
        FineBlockCode {
            sub_mask: crate::io::u16_from_le_bytes(bytes, byte_offset),
            q_byte: bytes[byte_offset + 2],
        }
    }
}

/// The plane coordinate of coefficient `index` of sub-block `sub`
/// within its 8×8 fine block. Sub-blocks tile the fine block two across
/// and four down; coefficients are row-major within the 4×2 region.
#[inline]
pub fn sub_block_coefficient(sub: usize, index: usize) -> (usize, usize) {
    let x = (sub % 2) * 4 + index % 4;
    let y = (sub / 2) * 2 + index / 4;
    (x, y)
}

/// One byte out of a little-endian word buffer.
#[inline]
pub(crate) fn byte_from_words(words: &[u32], byte_index: usize) -> u8 {
    (words[byte_index / 4] >> (8 * (byte_index % 4))) as u8
}

/// A fine block code out of a little-endian word buffer.
#[inline]
pub(crate) fn fine_code_from_words(words: &[u32], byte_offset: usize) -> FineBlockCode {
    FineBlockCode {
        sub_mask: u16::from(byte_from_words(words, byte_offset))
            | u16::from(byte_from_words(words, byte_offset + 1)) << 8,
        q_byte: byte_from_words(words, byte_offset + 2),
    }
}

use crate::buffers::{
    coarse_ballot_mask, fine_block_valid_size, in_bounds_sub_blocks,
    WaveletBuffers, FINE_BLOCKS_PER_COARSE,
};

/// Structurally validate one block packet against the session geometry.
///
/// The slice must hold exactly the packet. Checks, in order: a sane header,
/// a known block index, a ballot restricted to covered fine blocks, no
/// extra-plane bits on out-of-bounds sub-blocks, one consistent plane drop,
/// and a plane and sign count that adds up to exactly `payload_words`.
pub(crate) fn check_block_packet(words: &[u32], buffers: &WaveletBuffers) -> Result<BlockHeader> {
    if words.len() < HEADER_WORDS || words.len() > BlockHeader::MAX_PAYLOAD_WORDS as usize {
        return Err(Error::malformed("block packet size"));
    }

    if word_is_extended(words[0]) {
        return Err(Error::malformed("extended header where a block packet was expected"));
    }

    let header = BlockHeader::unpack([ words[0], words[1] ]);

    if header.payload_words as usize != words.len() {
        return Err(Error::malformed("payload length does not match the block header"));
    }

    if header.block_index as usize >= buffers.block_count_32x32() {
        return Err(Error::malformed("block index out of bounds"));
    }

    if !crate::quant::quant_code_is_valid(header.quant_code) {
        return Err(Error::malformed("quant code out of range"));
    }

    let mapping = *buffers.coarse_to_fine(header.block_index as usize);
    let home = *buffers.coarse_home(header.block_index as usize);
    let dimensions = buffers.band_dimensions(home.band.level);

    if header.ballot == 0 {
        return Err(Error::malformed("block packet without any fine blocks"));
    }

    if header.ballot & !coarse_ballot_mask(&mapping) != 0 {
        return Err(Error::malformed("ballot bit beyond the band edge"));
    }

    let fine_count = header.ballot.count_ones() as usize;
    let total_bytes = words.len() * 4;
    let planes_start = HEADER_BYTES + fine_count * FINE_CODE_BYTES;

    if planes_start > total_bytes {
        return Err(Error::malformed("payload too small for its fine block codes"));
    }

    let mut plane_drop = None;
    let mut plane_cursor = planes_start;
    let mut sign_count = 0_usize;

    for (slot, bit) in (0 .. 16).filter(|&bit| header.ballot & 1 << bit != 0).enumerate() {
        let code = fine_code_from_words(words, HEADER_BYTES + slot * FINE_CODE_BYTES);

        if code.plane_drop() > MAX_PLANE_DROP {
            return Err(Error::malformed("plane drop out of range"));
        }

        match plane_drop {
            None => plane_drop = Some(code.plane_drop()),
            Some(drop) if drop != code.plane_drop() =>
                return Err(Error::malformed("inconsistent plane drop within a block")),
            _ => {}
        }

        let band_fine_x = home.x * FINE_BLOCKS_PER_COARSE + bit % 4;
        let band_fine_y = home.y * FINE_BLOCKS_PER_COARSE + bit / 4;
        let (valid_width, valid_height) = fine_block_valid_size(dimensions, band_fine_x, band_fine_y);
        let in_bounds_mask = in_bounds_sub_blocks(valid_width, valid_height);

        for sub in 0 .. SUB_BLOCKS_PER_FINE_BLOCK {
            if in_bounds_mask & 1 << sub == 0 && code.extra_planes(sub) != 0 {
                return Err(Error::malformed("extra planes on an out-of-bounds sub-block"));
            }
        }

        for sub in 0 .. SUB_BLOCKS_PER_FINE_BLOCK {
            if in_bounds_mask & 1 << sub == 0 { continue; }

            let planes = code.sub_block_planes(sub) as usize;
            if plane_cursor + planes > total_bytes {
                return Err(Error::malformed("plane bytes exceed the block packet"));
            }

            let mut significance = 0_u8;
            for plane in 0 .. planes {
                significance |= byte_from_words(words, plane_cursor + plane);
            }

            sign_count += significance.count_ones() as usize;
            plane_cursor += planes;
        }
    }

    let content_bytes = plane_cursor + (sign_count + 7) / 8;
    if crate::math::div_ceil(content_bytes, 4) != words.len() {
        return Err(Error::malformed("plane accounting does not match payload_words"));
    }

    Ok(header)
}

/// Writes single bits, least significant bit of each byte first.
/// Used for the tightly packed sign bits.
#[derive(Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    bit_count: usize,
}

impl BitWriter {

    /// An empty bit stream.
    pub fn new() -> Self { Self::default() }

    /// Append one bit.
    #[inline]
    pub fn push(&mut self, bit: bool) {
        let bit_in_byte = self.bit_count % 8;
        if bit_in_byte == 0 { self.bytes.push(0); }

        if bit {
            *self.bytes.last_mut().expect("pushed a byte above") |= 1 << bit_in_byte;
        }

        self.bit_count += 1;
    }

    /// Number of bits appended so far.
    pub fn bit_count(&self) -> usize { self.bit_count }

    /// The accumulated bytes, the last one padded with zero bits.
    pub fn into_bytes(self) -> Vec<u8> { self.bytes }
}

/// Reads single bits, least significant bit of each byte first.
#[derive(Debug)]
pub struct BitReader<'bytes> {
    bytes: &'bytes [u8],
    position: usize,
}

impl<'bytes> BitReader<'bytes> {

    /// Read bits from the start of the given bytes.
    pub fn new(bytes: &'bytes [u8]) -> Self {
        BitReader { bytes, position: 0 }
    }

    /// Consume one bit. Fails past the end of the bytes.
    #[inline]
    pub fn pop(&mut self) -> Result<bool> {
        let byte = self.bytes.get(self.position / 8)
            .ok_or_else(|| Error::malformed("sign bits exceed the block packet"))?;

        let bit = byte & (1 << (self.position % 8)) != 0;
        self.position += 1;
        Ok(bit)
    }
}
