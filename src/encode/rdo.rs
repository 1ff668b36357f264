
//! Rate-distortion optimization.
//!
//! Chooses an additional plane drop Δq for every coarse block such that the
//! total packed size fits the frame's byte budget, while minimizing the
//! psychovisually weighted distortion. The analyze pass scores every
//! candidate drop of every block into a bucket array; the resolve pass
//! admits buckets from best to worst until the required savings are reached.

use crate::bitstream::{HEADER_BYTES, MAX_PLANE_DROP};
use crate::buffers::WaveletBuffers;
use crate::device::Device;
use crate::math::div_ceil;
use crate::quant::rdo_distortion_scale;

use super::quantize::BlockStats;

use half::f16;
use rayon::prelude::*;

/// Number of score buckets.
pub const NUM_RDO_BUCKETS: usize = 128;

/// The coarse block space is split into this many subdivisions
/// so parallel writers never contend on a bucket.
pub const BLOCK_SPACE_SUBDIVISION: usize = 16;

/// Score of an operation whose cost-to-distortion ratio is one.
const SCORE_BIAS: f32 = 64.0;

/// Score resolution: buckets per doubling of the ratio.
const SCORE_SCALE: f32 = 4.0;

/// One candidate decision: deepen `block_offset` (relative to its
/// subdivision) to the plane drop `quant`, saving `block_saving` words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RdoOperation {

    /// The plane drop this operation moves the block to.
    pub quant: u8,

    /// Block index relative to the owning subdivision.
    pub block_offset: u16,

    /// Words saved relative to the previously scored drop.
    pub block_saving: u16,
}

/// Blocks per subdivision, rounded up to a power of two
/// so the subdivision of a block index is a shift.
pub(crate) fn block_count_per_subdivision(block_count: usize) -> usize {
    div_ceil(block_count.max(1), BLOCK_SPACE_SUBDIVISION).next_power_of_two()
}

/// The flat bucket array. One frame's worth of candidate operations,
/// grouped by score bucket and block-space subdivision.
#[derive(Debug)]
pub struct RdoBuckets {
    per_subdivision: usize,

    // both indexed [subdivision][bucket], subdivision-major
    // so every subdivision is one contiguous parallel work item
    counts: Vec<u32>,
    operations: Vec<RdoOperation>,
}

impl RdoBuckets {

    /// Size the bucket array for a session's coarse block count.
    pub fn new(block_count: usize) -> Self {
        let per_subdivision = block_count_per_subdivision(block_count);

        RdoBuckets {
            per_subdivision,
            counts: vec![0; BLOCK_SPACE_SUBDIVISION * NUM_RDO_BUCKETS],
            operations: vec![
                RdoOperation::default();
                BLOCK_SPACE_SUBDIVISION * NUM_RDO_BUCKETS * per_subdivision
            ],
        }
    }

    /// Blocks covered by each subdivision.
    pub fn per_subdivision(&self) -> usize { self.per_subdivision }

    fn clear(&mut self) {
        for count in &mut self.counts { *count = 0; }
    }

    fn bucket(&self, subdivision: usize, bucket: usize) -> &[RdoOperation] {
        let count = self.counts[subdivision * NUM_RDO_BUCKETS + bucket] as usize;
        let start = (subdivision * NUM_RDO_BUCKETS + bucket) * self.per_subdivision;
        &self.operations[start .. start + count]
    }
}

/// A mutable view of one subdivision's buckets,
/// handed to exactly one parallel writer.
struct SubdivisionBuckets<'buckets> {
    per_subdivision: usize,
    counts: &'buckets mut [u32],
    operations: &'buckets mut [RdoOperation],
}

impl SubdivisionBuckets<'_> {

    /// Append an operation to a bucket.
    /// A full bucket drops the operation; that only costs savings.
    fn push(&mut self, bucket: usize, operation: RdoOperation) {
        let count = self.counts[bucket] as usize;
        if count >= self.per_subdivision {
            log::trace!("rdo bucket {} overflowed, dropping operation", bucket);
            return;
        }

        self.operations[bucket * self.per_subdivision + count] = operation;
        self.counts[bucket] += 1;
    }
}

/// Score every meaningful plane-drop candidate of every coarse block into
/// the buckets. Returns the total frame cost in words at zero drop.
pub(crate) fn analyze_pass(
    device: &Device,
    buffers: &WaveletBuffers,
    stats: &[BlockStats],
    buckets: &mut RdoBuckets,
) -> u64 {
    buckets.clear();

    let per_subdivision = buckets.per_subdivision;
    let block_count = buffers.block_count_32x32();

    let counts = buckets.counts.chunks_mut(NUM_RDO_BUCKETS);
    let operations = buckets.operations.chunks_mut(NUM_RDO_BUCKETS * per_subdivision);

    device.dispatch(|| {
        counts.zip(operations)
            .enumerate()
            .par_bridge()
            .map(|(subdivision, (counts, operations))| {
                let mut view = SubdivisionBuckets { per_subdivision, counts, operations };
                let first_block = subdivision * per_subdivision;
                let last_block = (first_block + per_subdivision).min(block_count);

                let mut base_words = 0_u64;
                for block in first_block .. last_block {
                    base_words += analyze_block(buffers, stats, block, &mut view);
                }

                base_words
            })
            .sum()
    })
}

/// Cost of one coarse block at one drop, in whole words including its header.
fn block_cost_words(
    buffers: &WaveletBuffers,
    stats: &[BlockStats],
    block: usize,
    drop: usize,
) -> u32 {
    let mapping = buffers.coarse_to_fine(block);

    let mut bits = 0_u32;
    for fine_y in 0 .. mapping.block_height_8x8 {
        for fine_x in 0 .. mapping.block_width_8x8 {
            let fine = mapping.block_offset_8x8 + fine_y * mapping.block_stride_8x8 + fine_x;
            bits += u32::from(stats[fine].stats[drop].encode_cost_bits);
        }
    }

    if bits == 0 { 0 } else { div_ceil(HEADER_BYTES * 8 + bits as usize, 32) as u32 }
}

/// Weighted distortion of one coarse block at one drop.
fn block_distortion(
    buffers: &WaveletBuffers,
    stats: &[BlockStats],
    block: usize,
    drop: usize,
) -> f32 {
    let mapping = buffers.coarse_to_fine(block);
    let scale = rdo_distortion_scale(buffers.config(), buffers.coarse_home(block).band);

    let mut distortion = 0.0_f32;
    for fine_y in 0 .. mapping.block_height_8x8 {
        for fine_x in 0 .. mapping.block_width_8x8 {
            let fine = mapping.block_offset_8x8 + fine_y * mapping.block_stride_8x8 + fine_x;
            distortion += f16::from_bits(stats[fine].stats[drop].square_error_fp16).to_f32();
        }
    }

    distortion * scale
}

fn analyze_block(
    buffers: &WaveletBuffers,
    stats: &[BlockStats],
    block: usize,
    buckets: &mut SubdivisionBuckets<'_>,
) -> u64 {
    let base_words = block_cost_words(buffers, stats, block, 0);
    if base_words == 0 { return 0; }

    let block_offset = (block % buckets.per_subdivision) as u16;

    let mut last_words = base_words;
    let mut last_distortion = block_distortion(buffers, stats, block, 0);
    let mut last_score = NUM_RDO_BUCKETS as i32;

    for drop in 1 ..= MAX_PLANE_DROP as usize {
        let words = block_cost_words(buffers, stats, block, drop);
        let saving = last_words - words;
        if saving == 0 { continue; }

        let distortion = block_distortion(buffers, stats, block, drop);
        let added_distortion = (distortion - last_distortion).max(1e-10);

        let ratio = (saving * 32) as f32 / added_distortion;
        let score = (SCORE_BIAS + (SCORE_SCALE * ratio.log2()).round()) as i32;

        // scores strictly fall with deeper drops: admitting buckets from
        // best to worst then always applies a prefix of a block's drops,
        // and no bucket ever holds more than one operation per block.
        // the lowest buckets stay reserved for the drops still to come,
        // so clamping can never stack a block's operations
        let reserved = MAX_PLANE_DROP as i32 - drop as i32;
        let score = score.clamp(0, (NUM_RDO_BUCKETS - 1) as i32)
            .min(last_score - 1)
            .max(reserved);

        buckets.push(score as usize, RdoOperation {
            quant: drop as u8,
            block_offset,
            block_saving: saving as u16,
        });

        last_words = words;
        last_distortion = distortion;
        last_score = score;

        if words == 0 { break; }
    }

    u64::from(base_words)
}

/// Admit operations from the best bucket downwards until the frame fits the
/// budget, writing each admitted block's plane drop into `plane_drops`.
/// The byte budget excludes the sequence header.
pub(crate) fn resolve_pass(
    device: &Device,
    buckets: &RdoBuckets,
    total_base_words: u64,
    target_size: usize,
    plane_drops: &mut [u8],
) {
    for drop in plane_drops.iter_mut() { *drop = 0; }

    let budget_words = (target_size.saturating_sub(HEADER_BYTES) / 4) as u64;
    if total_base_words <= budget_words { return; }
    let mut required_savings = total_base_words - budget_words;

    device.dispatch(|| {
        for bucket in (0 .. NUM_RDO_BUCKETS).rev() {
            for subdivision in 0 .. BLOCK_SPACE_SUBDIVISION {
                for operation in buckets.bucket(subdivision, bucket) {
                    let block = subdivision * buckets.per_subdivision + usize::from(operation.block_offset);

                    plane_drops[block] = plane_drops[block].max(operation.quant);

                    if required_savings <= u64::from(operation.block_saving) { return; }
                    required_savings -= u64::from(operation.block_saving);
                }
            }
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buffers::{BandRef, WaveletBuffers};
    use crate::config::{ChromaSubsampling, CodecConfig};
    use crate::encode::quantize::{quantize_pass, BlockStats, FineBlockStaging};

    fn analyzed_session(fill: impl Fn(usize, usize) -> f32)
        -> (WaveletBuffers, Vec<BlockStats>, RdoBuckets, u64)
    {
        let device = Device::software().unwrap();
        let config = CodecConfig::new(128, 128, ChromaSubsampling::Chroma420);
        let mut buffers = WaveletBuffers::new(config).unwrap();

        let band = BandRef { component: 0, level: 0, band: 1 };
        let (width, height) = buffers.band_dimensions(0);
        for y in 0 .. height {
            for x in 0 .. width {
                buffers.plane_mut(band).set(x, y, fill(x, y));
            }
        }

        let mut staging = vec![FineBlockStaging::default(); buffers.block_count_8x8()];
        let mut stats = vec![BlockStats::default(); buffers.block_count_8x8()];
        quantize_pass(&device, &buffers, &mut staging, &mut stats);

        let mut buckets = RdoBuckets::new(buffers.block_count_32x32());
        let base_words = analyze_pass(&device, &buffers, &stats, &mut buckets);

        (buffers, stats, buckets, base_words)
    }

    #[test]
    fn subdivision_sizing(){
        assert_eq!(block_count_per_subdivision(16), 1);
        assert_eq!(block_count_per_subdivision(17), 2);
        assert_eq!(block_count_per_subdivision(1000), 64);
        assert_eq!(block_count_per_subdivision(1), 1);
    }

    #[test]
    fn empty_frame_needs_no_operations(){
        let (buffers, _, _, base_words) = analyzed_session(|_, _| 0.0);
        assert_eq!(base_words, 0);

        let device = Device::software().unwrap();
        let buckets = RdoBuckets::new(buffers.block_count_32x32());
        let mut drops = vec![0_u8; buffers.block_count_32x32()];
        resolve_pass(&device, &buckets, 0, 100, &mut drops);
        assert!(drops.iter().all(|&drop| drop == 0));
    }

    #[test]
    fn generous_budget_drops_nothing(){
        let (buffers, _, buckets, base_words) =
            analyzed_session(|x, y| ((x * 7 + y * 13) % 32) as f32 / 128.0);

        assert!(base_words > 0);

        let device = Device::software().unwrap();
        let mut drops = vec![0_u8; buffers.block_count_32x32()];
        resolve_pass(&device, &buckets, base_words, base_words as usize * 4 + HEADER_BYTES, &mut drops);
        assert!(drops.iter().all(|&drop| drop == 0));
    }

    #[test]
    fn starved_budget_deepens_blocks(){
        let (buffers, stats, buckets, base_words) =
            analyzed_session(|x, y| ((x * 7 + y * 13) % 32) as f32 / 128.0);

        let device = Device::software().unwrap();
        let mut drops = vec![0_u8; buffers.block_count_32x32()];
        let target = (base_words as usize * 4) / 3;
        resolve_pass(&device, &buckets, base_words, target, &mut drops);

        assert!(drops.iter().any(|&drop| drop > 0), "starved budget must deepen some block");

        // the achieved size honors the budget
        let achieved: u64 = (0 .. buffers.block_count_32x32())
            .map(|block| u64::from(block_cost_words(&buffers, &stats, block, drops[block] as usize)))
            .sum();

        assert!(
            achieved * 4 + HEADER_BYTES as u64 <= target as u64 + 4,
            "achieved {} words for a {} byte budget", achieved, target
        );
    }
}
