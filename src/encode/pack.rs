
//! The block packer.
//!
//! Serializes every coarse block into its wire packet using the plane drop
//! rate control chose for it, and records the per-block meta index the
//! CPU packetizer reads back. Block output ranges are laid out in global
//! index order, so the produced bitstream is reproducible.

use crate::bitstream::{
    sub_block_coefficient, BitWriter, BlockHeader, FineBlockCode,
    COEFFICIENTS_PER_SUB_BLOCK, HEADER_BYTES, SUB_BLOCKS_PER_FINE_BLOCK,
};
use crate::buffers::{
    coarse_ballot_mask, fine_block_valid_size, in_bounds_sub_blocks,
    WaveletBuffers, FINE_BLOCKS_PER_COARSE, FINE_BLOCK_SIZE,
};
use crate::device::Device;
use crate::error::{usize_to_u32, Error, UnitResult};
use crate::math::{bit_width, div_ceil};
use crate::quant::band_quant_code;

use super::quantize::{plane_floor_for, BlockStats, FineBlockStaging};
use super::BitstreamPacket;

use rayon::prelude::*;
use smallvec::SmallVec;

/// Serialize all coarse blocks. `meta` receives one entry per coarse block;
/// `bitstream` receives the packed words at the offsets recorded in `meta`.
pub(crate) fn pack_pass(
    device: &Device,
    buffers: &WaveletBuffers,
    staging: &[FineBlockStaging],
    stats: &[BlockStats],
    plane_drops: &[u8],
    sequence: u8,
    meta: &mut [BitstreamPacket],
    bitstream: &mut [u32],
) -> UnitResult {
    let block_count = buffers.block_count_32x32();
    debug_assert_eq!(meta.len(), block_count);

    // lay out the output ranges in block index order
    let mut offset = 0_usize;
    for block in 0 .. block_count {
        let words = block_packet_words(buffers, stats, plane_drops, block);

        meta[block] = BitstreamPacket {
            offset_u32: usize_to_u32(offset, "bitstream offset")?,
            num_words: usize_to_u32(words, "block packet size")?,
        };

        offset += words;
    }

    if offset > bitstream.len() {
        return Err(Error::configuration("bitstream buffer too small for this frame"));
    }

    // hand every block its own output range and fill them in parallel
    let mut ranges: Vec<(usize, &mut [u32])> = Vec::with_capacity(block_count);
    let mut remaining = &mut bitstream[.. offset];
    for block in 0 .. block_count {
        let words = meta[block].num_words as usize;
        let (packet, rest) = std::mem::take(&mut remaining).split_at_mut(words);
        remaining = rest;
        if words != 0 { ranges.push((block, packet)); }
    }

    device.dispatch(|| {
        ranges.into_par_iter().for_each(|(block, packet)| {
            pack_block(buffers, staging, plane_drops, sequence, block, packet);
        });
    });

    Ok(())
}

/// Wire size of one coarse block in words, zero when it carries no data.
/// This agrees bit for bit with what [`pack_block`] emits, because both
/// derive from the same per-fine-block cost model.
fn block_packet_words(
    buffers: &WaveletBuffers,
    stats: &[BlockStats],
    plane_drops: &[u8],
    block: usize,
) -> usize {
    let mapping = buffers.coarse_to_fine(block);
    let drop = plane_drops[block] as usize;

    let mut bits = 0_usize;
    for fine_y in 0 .. mapping.block_height_8x8 {
        for fine_x in 0 .. mapping.block_width_8x8 {
            let fine = mapping.block_offset_8x8 + fine_y * mapping.block_stride_8x8 + fine_x;
            bits += usize::from(stats[fine].stats[drop].encode_cost_bits);
        }
    }

    if bits == 0 { 0 } else { div_ceil(HEADER_BYTES * 8 + bits, 32) }
}

fn pack_block(
    buffers: &WaveletBuffers,
    staging: &[FineBlockStaging],
    plane_drops: &[u8],
    sequence: u8,
    block: usize,
    packet: &mut [u32],
) {
    let mapping = buffers.coarse_to_fine(block);
    let home = buffers.coarse_home(block);
    let dimensions = buffers.band_dimensions(home.band.level);
    let drop = u32::from(plane_drops[block]);

    let mut ballot = 0_u16;
    let mut codes = Vec::<u8>::new();
    let mut plane_bytes = Vec::<u8>::new();
    let mut signs = BitWriter::new();

    for fine_y in 0 .. mapping.block_height_8x8 {
        for fine_x in 0 .. mapping.block_width_8x8 {
            let fine = mapping.block_offset_8x8 + fine_y * mapping.block_stride_8x8 + fine_x;
            let stage = &staging[fine];

            let band_fine_x = home.x * FINE_BLOCKS_PER_COARSE + fine_x;
            let band_fine_y = home.y * FINE_BLOCKS_PER_COARSE + fine_y;
            let (valid_width, valid_height) = fine_block_valid_size(dimensions, band_fine_x, band_fine_y);
            let in_bounds_mask = in_bounds_sub_blocks(valid_width, valid_height);

            let mut needs = [0_u32; SUB_BLOCKS_PER_FINE_BLOCK];
            for sub in 0 .. SUB_BLOCKS_PER_FINE_BLOCK {
                for coefficient in 0 .. COEFFICIENTS_PER_SUB_BLOCK {
                    let (x, y) = sub_block_coefficient(sub, coefficient);
                    let kept = stage.magnitudes[y * FINE_BLOCK_SIZE + x] >> drop;
                    needs[sub] = needs[sub].max(bit_width(kept));
                }
            }

            let max_need = needs.iter().copied().max().unwrap_or(0);
            if max_need == 0 { continue; }

            ballot |= 1 << (FINE_BLOCKS_PER_COARSE * fine_y + fine_x);

            let floor = plane_floor_for(max_need);
            let mut extras = [0_u32; SUB_BLOCKS_PER_FINE_BLOCK];
            for sub in 0 .. SUB_BLOCKS_PER_FINE_BLOCK {
                if in_bounds_mask & (1 << sub) != 0 {
                    extras[sub] = needs[sub].saturating_sub(floor).min(3);
                }
            }

            let code = FineBlockCode::new(drop, floor, extras);
            code.write(&mut codes);

            // plane bytes per active sub-block, most significant plane
            // first, with the sign of every newly significant coefficient
            for sub in 0 .. SUB_BLOCKS_PER_FINE_BLOCK {
                if in_bounds_mask & (1 << sub) == 0 { continue; }

                let planes = code.sub_block_planes(sub);
                if planes == 0 { continue; }

                let mut kept = [0_u32; COEFFICIENTS_PER_SUB_BLOCK];
                for coefficient in 0 .. COEFFICIENTS_PER_SUB_BLOCK {
                    let (x, y) = sub_block_coefficient(sub, coefficient);
                    kept[coefficient] = stage.magnitudes[y * FINE_BLOCK_SIZE + x] >> drop;
                }

                let mut significant = [false; COEFFICIENTS_PER_SUB_BLOCK];
                for plane in (0 .. planes).rev() {
                    let mut byte = 0_u8;

                    for coefficient in 0 .. COEFFICIENTS_PER_SUB_BLOCK {
                        if kept[coefficient] & (1 << plane) == 0 { continue; }
                        byte |= 1 << coefficient;

                        if !significant[coefficient] {
                            significant[coefficient] = true;

                            let (x, y) = sub_block_coefficient(sub, coefficient);
                            let negative = stage.signs & (1 << (y * FINE_BLOCK_SIZE + x)) != 0;
                            signs.push(negative);
                        }
                    }

                    plane_bytes.push(byte);
                }
            }
        }
    }

    debug_assert_ne!(ballot, 0, "empty blocks have no packet range");
    debug_assert_eq!(ballot & !coarse_ballot_mask(mapping), 0);

    let header = BlockHeader {
        ballot,
        payload_words: packet.len() as u16,
        sequence,
        quant_code: band_quant_code(home.band),
        block_index: block as u32,
    };

    // assemble the packet: header, codes, plane bytes, signs, zero padding
    let sign_bytes = signs.into_bytes();
    let mut bytes: SmallVec<[u8; 256]> = SmallVec::new();
    for word in header.pack() { bytes.extend_from_slice(&word.to_le_bytes()); }
    bytes.extend_from_slice(&codes);
    bytes.extend_from_slice(&plane_bytes);
    bytes.extend_from_slice(&sign_bytes);

    debug_assert_eq!(
        div_ceil(bytes.len(), 4), packet.len(),
        "size model and emitted packet disagree for block {}", block
    );
    bytes.resize(packet.len() * 4, 0);

    for (word, chunk) in packet.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_le_bytes([ chunk[0], chunk[1], chunk[2], chunk[3] ]);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bitstream::word_is_extended;
    use crate::buffers::BandRef;
    use crate::config::{ChromaSubsampling, CodecConfig};
    use crate::encode::quantize::quantize_pass;

    fn packed_session(spike: f32) -> (WaveletBuffers, Vec<BitstreamPacket>, Vec<u32>) {
        let device = Device::software().unwrap();
        let config = CodecConfig::new(128, 128, ChromaSubsampling::Chroma444);
        let mut buffers = WaveletBuffers::new(config).unwrap();

        let band = BandRef { component: 0, level: 0, band: 3 };
        buffers.plane_mut(band).set(10, 3, spike);

        let mut staging = vec![FineBlockStaging::default(); buffers.block_count_8x8()];
        let mut stats = vec![BlockStats::default(); buffers.block_count_8x8()];
        quantize_pass(&device, &buffers, &mut staging, &mut stats);

        let drops = vec![0_u8; buffers.block_count_32x32()];
        let mut meta = vec![BitstreamPacket::default(); buffers.block_count_32x32()];
        let mut bitstream = vec![0_u32; 4096];

        pack_pass(
            &device, &buffers, &staging, &stats, &drops,
            1, &mut meta, &mut bitstream,
        ).unwrap();

        (buffers, meta, bitstream)
    }

    #[test]
    fn lone_spike_packs_one_block(){
        let (buffers, meta, bitstream) = packed_session(-0.25);

        let occupied: Vec<usize> = (0 .. meta.len())
            .filter(|&block| meta[block].num_words != 0)
            .collect();

        let band = BandRef { component: 0, level: 0, band: 3 };
        let expected_block = buffers.band_blocks(band).block_offset_32x32;
        assert_eq!(occupied, vec![ expected_block ]);

        let words = &bitstream[.. meta[expected_block].num_words as usize];
        assert!(!word_is_extended(words[0]));

        let header = BlockHeader::unpack([ words[0], words[1] ]);
        assert_eq!(header.block_index, expected_block as u32);
        assert_eq!(header.sequence, 1);
        assert_eq!(header.ballot, 1 << 1); // fine block (1, 0) of the coarse block
        assert_eq!(header.payload_words as usize, words.len());

        // header, one code, the plane floor of two bytes on all eight
        // sub-blocks plus three extra on the spike's, one sign bit:
        // 8 + 3 + 19 + 1 bytes, padded to 8 words
        assert_eq!(words.len(), 8);

        let code = FineBlockCode::read(&words_to_bytes(words), 8);
        assert_eq!(code.plane_drop(), 0);
        assert_eq!(code.plane_floor(), 2); // five planes in the deepest sub-block, minus three extra

        // local (2, 3) lives in sub-block (3 / 2) * 2 + 2 / 4 = 2
        assert_eq!(code.extra_planes(2), 3);
        assert_eq!(code.plane_byte_count(0xff), 19);
    }

    #[test]
    fn zero_frame_packs_nothing(){
        let (_, meta, _) = packed_session(0.0);
        assert!(meta.iter().all(|entry| entry.num_words == 0));
    }

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        let mut bytes = Vec::new();
        crate::io::words_to_le_bytes(words, &mut bytes);
        bytes
    }
}
