
//! The dequantizer.
//!
//! Walks every coded band and rebuilds its coefficient plane from the
//! staged block packets: parse the significance planes, restore the
//! magnitudes at the block's plane drop, apply the signs, and scale by the
//! block's quantizer. Blocks that never arrived decode to zero
//! coefficients, which is what makes partial frames well defined.

use crate::bitstream::{
    sub_block_coefficient, BitReader, BlockHeader, FineBlockCode,
    COEFFICIENTS_PER_SUB_BLOCK, FINE_CODE_BYTES, HEADER_BYTES, SUB_BLOCKS_PER_FINE_BLOCK,
};
use crate::buffers::{
    fine_block_valid_size, in_bounds_sub_blocks, WaveletBuffers,
    COARSE_BLOCK_SIZE, FINE_BLOCKS_PER_COARSE, FINE_BLOCK_SIZE,
};
use crate::device::Device;
use crate::io::words_to_le_bytes;
use crate::quant::{decode_quant, reconstruct_magnitude};

use super::MISSING_BLOCK;

use rayon::prelude::*;

/// Rebuild the coefficient planes of all coded bands from the staged
/// payload. One strip of coarse block rows is one parallel work item.
pub(crate) fn dequant_pass(
    device: &Device,
    buffers: &mut WaveletBuffers,
    dequant_offset: &[u32],
    payload: &[u32],
) {
    let bands = buffers.coded_bands().to_vec();

    for band in bands {
        let info = *buffers.band_blocks(band);
        let dimensions = buffers.band_dimensions(band.level);
        let store = buffers.storage_rounding(band.level);

        let plane = buffers.plane_mut(band);
        let width = dimensions.0;

        device.dispatch(|| {
            plane.samples_mut()
                .par_chunks_mut(width * COARSE_BLOCK_SIZE)
                .enumerate()
                .for_each(|(block_y, strip)| {
                    let mut packet_bytes = Vec::new();

                    for block_x in 0 .. info.block_stride_32x32 {
                        let block = info.block_offset_32x32
                            + block_y * info.block_stride_32x32 + block_x;

                        dequant_block(
                            strip, width, dimensions,
                            block_x, block_y,
                            dequant_offset[block], payload,
                            store, &mut packet_bytes,
                        );
                    }
                });
        });
    }
}

/// Rebuild the coefficients of one coarse block inside its strip of plane
/// rows. The staged packet was validated at ingest, so this pass never
/// fails; anything it cannot read decodes to zero.
fn dequant_block(
    strip: &mut [f32],
    width: usize,
    dimensions: (usize, usize),
    block_x: usize,
    block_y: usize,
    offset: u32,
    payload: &[u32],
    store: fn(f32) -> f32,
    packet_bytes: &mut Vec<u8>,
) {
    let strip_rows = strip.len() / width;
    let base_x = block_x * COARSE_BLOCK_SIZE;
    let valid_width = (dimensions.0 - base_x).min(COARSE_BLOCK_SIZE);

    for row in strip.chunks_exact_mut(width) {
        for sample in &mut row[base_x .. base_x + valid_width] {
            *sample = 0.0;
        }
    }

    if offset == MISSING_BLOCK { return; }

    let words = &payload[offset as usize ..];
    if words.len() < crate::bitstream::HEADER_WORDS { return; }

    let header = BlockHeader::unpack([ words[0], words[1] ]);
    let payload_words = header.payload_words as usize;
    if payload_words > words.len() { return; }

    packet_bytes.clear();
    words_to_le_bytes(&words[.. payload_words], packet_bytes);

    let step = decode_quant(header.quant_code);
    let fine_count = header.ballot.count_ones() as usize;

    // plane bytes follow the fine block codes; the sign bits follow
    // all plane bytes, in the order coefficients became significant
    let codes: Vec<(usize, FineBlockCode)> = (0 .. 16)
        .filter(|&bit| header.ballot & 1 << bit != 0)
        .enumerate()
        .map(|(slot, bit)| (
            bit,
            FineBlockCode::read(packet_bytes, HEADER_BYTES + slot * FINE_CODE_BYTES),
        ))
        .collect();
    debug_assert_eq!(codes.len(), fine_count);

    let mut plane_byte_total = 0;
    for &(bit, code) in &codes {
        let in_bounds_mask = fine_in_bounds_mask(dimensions, block_x, block_y, bit);
        plane_byte_total += code.plane_byte_count(in_bounds_mask);
    }

    let codes_end = HEADER_BYTES + fine_count * FINE_CODE_BYTES;
    let sign_region = &packet_bytes[(codes_end + plane_byte_total).min(packet_bytes.len()) ..];
    let mut signs = BitReader::new(sign_region);
    let mut plane_cursor = codes_end;

    for &(bit, code) in &codes {
        let fine_x = bit % 4;
        let fine_y = bit / 4;
        let in_bounds_mask = fine_in_bounds_mask(dimensions, block_x, block_y, bit);
        let drop = code.plane_drop();

        for sub in 0 .. SUB_BLOCKS_PER_FINE_BLOCK {
            if in_bounds_mask & 1 << sub == 0 { continue; }

            let planes = code.sub_block_planes(sub);
            if planes == 0 { continue; }

            let mut kept = [0_u32; COEFFICIENTS_PER_SUB_BLOCK];
            let mut negative = [false; COEFFICIENTS_PER_SUB_BLOCK];
            let mut significant = [false; COEFFICIENTS_PER_SUB_BLOCK];

            for _plane in 0 .. planes {
                let byte = packet_bytes.get(plane_cursor).copied().unwrap_or(0);
                plane_cursor += 1;

                for coefficient in 0 .. COEFFICIENTS_PER_SUB_BLOCK {
                    kept[coefficient] <<= 1;

                    if byte & 1 << coefficient != 0 {
                        kept[coefficient] |= 1;

                        if !significant[coefficient] {
                            significant[coefficient] = true;
                            negative[coefficient] = signs.pop().unwrap_or(false);
                        }
                    }
                }
            }

            for coefficient in 0 .. COEFFICIENTS_PER_SUB_BLOCK {
                if kept[coefficient] == 0 { continue; }

                let (sub_x, sub_y) = sub_block_coefficient(sub, coefficient);
                let x = base_x + fine_x * FINE_BLOCK_SIZE + sub_x;
                let y = fine_y * FINE_BLOCK_SIZE + sub_y;

                if x >= dimensions.0 || y >= strip_rows { continue; }

                let magnitude = reconstruct_magnitude(kept[coefficient], drop) as f32 * step;
                let value = if negative[coefficient] { -magnitude } else { magnitude };
                strip[y * width + x] = store(value);
            }
        }
    }
}

/// The in-bounds sub-block mask of the fine block at ballot bit `bit`
/// of the coarse block at `(block_x, block_y)`.
fn fine_in_bounds_mask(
    dimensions: (usize, usize),
    block_x: usize,
    block_y: usize,
    bit: usize,
) -> u8 {
    let band_fine_x = block_x * FINE_BLOCKS_PER_COARSE + bit % 4;
    let band_fine_y = block_y * FINE_BLOCKS_PER_COARSE + bit / 4;
    let (valid_width, valid_height) = fine_block_valid_size(dimensions, band_fine_x, band_fine_y);
    in_bounds_sub_blocks(valid_width, valid_height)
}
