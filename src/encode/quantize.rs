
//! The quantizer pass.
//!
//! Slices every coded band into 8×8 fine blocks, quantizes the coefficients
//! against the band's base step, and emits the raw significance
//! representation (magnitudes and signs) that the block packer later
//! serializes. Alongside, it collects the per-block statistics that drive
//! rate control: for each of the fifteen plane-drop candidates, the squared
//! error and the exact encoding cost in bits.

use crate::bitstream::{FINE_CODE_BYTES, SUB_BLOCKS_PER_FINE_BLOCK, COEFFICIENTS_PER_SUB_BLOCK, sub_block_coefficient};
use crate::buffers::{
    fine_block_valid_size, in_bounds_sub_blocks, WaveletBuffers,
    FINE_BLOCK_SIZE,
};
use crate::device::Device;
use crate::math::bit_width;
use crate::quant;

use half::f16;
use rayon::prelude::*;

/// Coefficients per fine block.
pub const FINE_BLOCK_COEFFICIENTS: usize = FINE_BLOCK_SIZE * FINE_BLOCK_SIZE;

/// Number of plane-drop candidates rate control chooses between.
pub const PLANE_DROP_CANDIDATES: usize = crate::bitstream::MAX_PLANE_DROP as usize + 1;

/// The raw significance representation of one quantized fine block,
/// staged between the quantizer and the block packer.
#[derive(Debug, Clone, Copy)]
pub struct FineBlockStaging {

    /// Quantized magnitude per coefficient, row-major.
    /// Coefficients beyond the band edge stay zero.
    pub magnitudes: [u32; FINE_BLOCK_COEFFICIENTS],

    /// One sign bit per coefficient, row-major, set when negative.
    pub signs: u64,
}

impl Default for FineBlockStaging {
    fn default() -> Self {
        FineBlockStaging { magnitudes: [0; FINE_BLOCK_COEFFICIENTS], signs: 0 }
    }
}

/// The rate and distortion of one plane-drop candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuantStats {

    /// Squared coefficient error, as half-float bits, saturating.
    pub square_error_fp16: u16,

    /// Exact cost of the fine block at this drop, in bits.
    pub encode_cost_bits: u16,
}

/// Per-fine-block statistics, the input to rate control.
#[derive(Debug, Clone, Copy)]
pub struct BlockStats {

    /// Significance planes of the largest magnitude in the block.
    pub num_planes: u32,

    /// One entry per plane-drop candidate `0 ..= 14`.
    pub stats: [QuantStats; PLANE_DROP_CANDIDATES],
}

impl Default for BlockStats {
    fn default() -> Self {
        BlockStats { num_planes: 0, stats: [QuantStats::default(); PLANE_DROP_CANDIDATES] }
    }
}

/// The plane floor of a fine block whose deepest sub-block needs
/// `max_need` planes: sub-blocks can only signal three extra planes.
#[inline]
pub(crate) fn plane_floor_for(max_need: u32) -> u32 {
    max_need.saturating_sub(3)
}

/// Cost in bits of one fine block at the given plane drop:
/// the three code bytes, one byte per encoded plane of each in-bounds
/// sub-block, and one sign bit per significant coefficient.
/// Returns zero when the drop leaves no significant coefficient.
pub(crate) fn fine_block_cost_bits(
    needs: &[u32; SUB_BLOCKS_PER_FINE_BLOCK],
    significant_counts: &[u32; SUB_BLOCKS_PER_FINE_BLOCK],
    in_bounds_mask: u8,
    plane_drop: u32,
) -> u32 {
    let max_need = needs.iter().map(|&need| need.saturating_sub(plane_drop)).max()
        .expect("fine blocks always have sub-blocks");

    if max_need == 0 { return 0; }
    let floor = plane_floor_for(max_need);

    let mut bits = (FINE_CODE_BYTES * 8) as u32;

    for sub in 0 .. SUB_BLOCKS_PER_FINE_BLOCK {
        if in_bounds_mask & (1 << sub) == 0 { continue; }

        let need = needs[sub].saturating_sub(plane_drop);
        bits += 8 * floor.max(need);
        bits += significant_counts[sub];
    }

    bits
}

/// Run the quantizer over every coded band,
/// filling the staging and statistics arrays.
pub(crate) fn quantize_pass(
    device: &Device,
    buffers: &WaveletBuffers,
    staging: &mut [FineBlockStaging],
    stats: &mut [BlockStats],
) {
    for &band in buffers.coded_bands() {
        let info = *buffers.band_blocks(band);
        let dimensions = buffers.band_dimensions(band.level);
        let plane = buffers.plane(band);

        let step = quant::band_step(band);
        let inverse_step = 1.0 / step;

        let blocks_x = info.block_stride_8x8;
        let blocks_y = crate::math::div_ceil(dimensions.1, FINE_BLOCK_SIZE);
        let block_count = blocks_x * blocks_y;

        let band_staging = &mut staging[info.block_offset_8x8 .. info.block_offset_8x8 + block_count];
        let band_stats = &mut stats[info.block_offset_8x8 .. info.block_offset_8x8 + block_count];

        device.dispatch(|| {
            band_staging.par_iter_mut()
                .zip(band_stats.par_iter_mut())
                .enumerate()
                .for_each(|(index, (staging, stats))| {
                    let fine_x = index % blocks_x;
                    let fine_y = index / blocks_x;

                    quantize_fine_block(
                        plane, dimensions, fine_x, fine_y,
                        step, inverse_step,
                        staging, stats,
                    );
                });
        });
    }
}

fn quantize_fine_block(
    plane: &crate::buffers::Plane,
    dimensions: (usize, usize),
    fine_x: usize, fine_y: usize,
    step: f32, inverse_step: f32,
    staging: &mut FineBlockStaging,
    stats: &mut BlockStats,
) {
    let (valid_width, valid_height) = fine_block_valid_size(dimensions, fine_x, fine_y);
    let in_bounds_mask = in_bounds_sub_blocks(valid_width, valid_height);

    let base_x = fine_x * FINE_BLOCK_SIZE;
    let base_y = fine_y * FINE_BLOCK_SIZE;

    let mut coefficients = [0.0_f32; FINE_BLOCK_COEFFICIENTS];
    *staging = FineBlockStaging::default();

    for y in 0 .. valid_height {
        for x in 0 .. valid_width {
            let coefficient = plane.get(base_x + x, base_y + y);
            let (magnitude, negative) = quant::quantize(coefficient, inverse_step);

            let index = y * FINE_BLOCK_SIZE + x;
            coefficients[index] = coefficient;
            staging.magnitudes[index] = magnitude;
            if negative { staging.signs |= 1 << index; }
        }
    }

    // per-sub-block plane needs, per drop candidate
    let mut needs = [0_u32; SUB_BLOCKS_PER_FINE_BLOCK];
    for sub in 0 .. SUB_BLOCKS_PER_FINE_BLOCK {
        for coefficient in 0 .. COEFFICIENTS_PER_SUB_BLOCK {
            let (x, y) = sub_block_coefficient(sub, coefficient);
            needs[sub] = needs[sub].max(bit_width(staging.magnitudes[y * FINE_BLOCK_SIZE + x]));
        }
    }

    stats.num_planes = needs.iter().copied().max().unwrap_or(0);

    for drop in 0 .. PLANE_DROP_CANDIDATES as u32 {
        let mut square_error = 0.0_f32;
        let mut significant_counts = [0_u32; SUB_BLOCKS_PER_FINE_BLOCK];

        for sub in 0 .. SUB_BLOCKS_PER_FINE_BLOCK {
            for coefficient in 0 .. COEFFICIENTS_PER_SUB_BLOCK {
                let (x, y) = sub_block_coefficient(sub, coefficient);
                if x >= valid_width || y >= valid_height { continue; }

                let index = y * FINE_BLOCK_SIZE + x;
                let kept = staging.magnitudes[index] >> drop;
                if kept != 0 { significant_counts[sub] += 1; }

                let reconstructed = quant::reconstruct_magnitude(kept, drop) as f32 * step;
                let reconstructed = if staging.signs & (1 << index) != 0 { -reconstructed } else { reconstructed };

                let error = coefficients[index] - reconstructed;
                square_error += error * error;
            }
        }

        let cost = fine_block_cost_bits(&needs, &significant_counts, in_bounds_mask, drop);

        stats.stats[drop as usize] = QuantStats {
            square_error_fp16: f16::from_f32(square_error.min(f16::MAX.to_f32())).to_bits(),
            encode_cost_bits: cost.min(u16::MAX as u32) as u16,
        };
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buffers::{BandRef, Plane};
    use crate::config::{ChromaSubsampling, CodecConfig};

    fn quantized_session() -> (WaveletBuffers, Vec<FineBlockStaging>, Vec<BlockStats>) {
        let device = Device::software().unwrap();
        let config = CodecConfig::new(128, 128, ChromaSubsampling::Chroma444);
        let mut buffers = WaveletBuffers::new(config).unwrap();

        // place a lone spike in the finest luma HH band
        let band = BandRef { component: 0, level: 0, band: 3 };
        buffers.plane_mut(band).set(10, 3, 0.25);

        let mut staging = vec![FineBlockStaging::default(); buffers.block_count_8x8()];
        let mut stats = vec![BlockStats::default(); buffers.block_count_8x8()];
        quantize_pass(&device, &buffers, &mut staging, &mut stats);

        (buffers, staging, stats)
    }

    #[test]
    fn lone_spike_is_quantized(){
        let (buffers, staging, stats) = quantized_session();

        let band = BandRef { component: 0, level: 0, band: 3 };
        let info = buffers.band_blocks(band);

        // the spike lands in fine block (1, 0) at local position (2, 3)
        let fine = info.block_offset_8x8 + 1;
        assert_eq!(staging[fine].magnitudes[3 * 8 + 2], 16); // 0.25 * 64
        assert_eq!(staging[fine].signs, 0);

        assert_eq!(stats[fine].num_planes, 5);

        // everything else in that band is empty
        let untouched = info.block_offset_8x8;
        assert_eq!(stats[untouched].num_planes, 0);
        assert_eq!(stats[untouched].stats[0], QuantStats::default());
    }

    #[test]
    fn cost_decreases_with_deeper_drops(){
        let (buffers, _, stats) = quantized_session();

        let band = BandRef { component: 0, level: 0, band: 3 };
        let fine = buffers.band_blocks(band).block_offset_8x8 + 1;

        let costs: Vec<u16> = stats[fine].stats.iter().map(|entry| entry.encode_cost_bits).collect();
        assert!(costs.windows(2).all(|pair| pair[1] <= pair[0]), "{:?}", costs);

        // dropping all five planes silences the block entirely
        assert_ne!(costs[4], 0);
        assert_eq!(costs[5], 0);

        // distortion only grows
        let errors: Vec<f32> = stats[fine].stats.iter()
            .map(|entry| f16::from_bits(entry.square_error_fp16).to_f32())
            .collect();
        assert!(errors.windows(2).all(|pair| pair[1] >= pair[0]), "{:?}", errors);
    }

    #[test]
    fn cost_model_matches_hand_computation(){
        // one sub-block with a single magnitude-1 coefficient:
        // three code bytes, one plane byte, one sign bit
        let mut needs = [0_u32; SUB_BLOCKS_PER_FINE_BLOCK];
        let mut significant = [0_u32; SUB_BLOCKS_PER_FINE_BLOCK];
        needs[0] = 1;
        significant[0] = 1;

        assert_eq!(fine_block_cost_bits(&needs, &significant, 0xff, 0), 24 + 8 + 1);
        assert_eq!(fine_block_cost_bits(&needs, &significant, 0xff, 1), 0);

        // a deep sub-block raises the floor for every in-bounds sub-block
        let mut needs = [0_u32; SUB_BLOCKS_PER_FINE_BLOCK];
        needs[2] = 9;
        let significant = [1_u32; SUB_BLOCKS_PER_FINE_BLOCK];
        let floor = 6;

        assert_eq!(
            fine_block_cost_bits(&needs, &significant, 0xff, 0),
            24 + 8 * (9 + 7 * floor) + 8
        );

        // out-of-bounds sub-blocks cost nothing
        assert_eq!(
            fine_block_cost_bits(&needs, &significant, 0b0000_0100, 0),
            24 + 8 * 9 + 1
        );
    }
}
