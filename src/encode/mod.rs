
//! The encoder session: forward transform, quantization, rate control,
//! block packing, and the CPU-side packetizer that turns the readback
//! buffers into MTU-sized wire packets.

pub mod quantize;
pub mod rdo;
pub mod pack;

use crate::bitstream::{
    check_block_packet, BlockHeader, SequenceHeader,
    HEADER_BYTES, SEQUENCE_COUNT_MASK, START_OF_FRAME,
};
use crate::buffers::{Plane, WaveletBuffers};
use crate::config::{ChromaSubsampling, CodecConfig};
use crate::device::{CommandBuffer, Device, REQUIRED_SUBGROUP_OPERATIONS};
use crate::error::{Error, Result, UnitResult};
use crate::quant::band_quant_code;
use crate::transform::forward::{forward_dwt, mirror_extend};
use crate::transform::LiftScratch;

use self::quantize::{BlockStats, FineBlockStaging};
use self::rdo::RdoBuckets;

/// One entry of the per-block meta index the block packer writes:
/// where a coarse block's packet sits in the bitstream buffer.
/// A `num_words` of zero marks a block without any coded data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BitstreamPacket {

    /// Word offset of the block packet in the bitstream buffer.
    pub offset_u32: u32,

    /// Size of the block packet in words, zero when empty.
    pub num_words: u32,
}

/// Where `encode` puts its results, and the rate budget it solves for.
#[derive(Debug)]
pub struct BitstreamBuffers<'buffers> {

    /// Receives one [`BitstreamPacket`] per coarse block.
    pub meta: &'buffers mut [BitstreamPacket],

    /// Receives the packed block bitstream.
    pub bitstream: &'buffers mut [u32],

    /// The byte budget for the whole frame, sequence header included.
    pub target_size: usize,
}

/// One wire packet produced by [`Encoder::packetize`]:
/// a byte range of the packetized output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {

    /// Byte offset into the packetized output.
    pub offset: usize,

    /// Packet length in bytes.
    pub size: usize,
}

/// An encoder session for one frame geometry.
/// Owns all plane images and per-frame scratch, which are allocated
/// once and reused across frames.
#[derive(Debug)]
pub struct Encoder {
    buffers: WaveletBuffers,
    extended_inputs: Vec<Plane>,
    lift: LiftScratch,
    staging: Vec<FineBlockStaging>,
    stats: Vec<BlockStats>,
    buckets: RdoBuckets,
    plane_drops: Vec<u8>,
    sequence_count: u8,
}

impl Encoder {

    /// Create an encoder session, verifying the device capability contract.
    pub fn init(device: &Device, config: CodecConfig) -> Result<Self> {
        let caps = device.caps();

        if !caps.supports_subgroup_operations(REQUIRED_SUBGROUP_OPERATIONS) {
            return Err(Error::unsupported("missing subgroup operations"));
        }

        if !caps.half_float {
            return Err(Error::unsupported("no half float support"));
        }

        if crate::device::SUBGROUP_WIDTHS.iter().all(|&width| !caps.supports_subgroup_size(width)) {
            return Err(Error::unsupported("no usable subgroup width"));
        }

        let buffers = WaveletBuffers::new(config)?;
        let (aligned_width, aligned_height) = (buffers.aligned_width(), buffers.aligned_height());

        let extended_inputs = (0 .. crate::buffers::NUM_COMPONENTS)
            .map(|component| {
                if component != 0 && config.chroma == ChromaSubsampling::Chroma420 {
                    Plane::new(aligned_width / 2, aligned_height / 2)
                }
                else {
                    Plane::new(aligned_width, aligned_height)
                }
            })
            .collect();

        Ok(Encoder {
            lift: LiftScratch::new(aligned_width, aligned_height),
            staging: vec![FineBlockStaging::default(); buffers.block_count_8x8()],
            stats: vec![BlockStats::default(); buffers.block_count_8x8()],
            buckets: RdoBuckets::new(buffers.block_count_32x32()),
            plane_drops: vec![0; buffers.block_count_32x32()],
            extended_inputs,
            buffers,
            sequence_count: 0,
        })
    }

    /// Number of coarse blocks of this session, the length of the meta index.
    pub fn block_count_32x32(&self) -> usize {
        self.buffers.block_count_32x32()
    }

    /// Required size of the meta readback buffer in bytes:
    /// one eight-byte record per coarse block.
    pub fn get_meta_required_size(&self) -> usize {
        self.buffers.block_count_32x32() * std::mem::size_of::<BitstreamPacket>()
    }

    /// Worst-case size of the bitstream buffer in bytes, a conservative
    /// bound independent of frame content.
    pub fn get_bitstream_required_size(&self) -> usize {
        // per fine block: code bytes, 18 plane bytes on all eight
        // sub-blocks, fully packed signs; per coarse block: header, padding
        self.buffers.block_count_8x8() * (3 + 8 * 18 + 8)
            + self.buffers.block_count_32x32() * (HEADER_BYTES + 3)
    }

    /// Encode one frame. The input planes must match the configured
    /// dimensions; chroma planes have half resolution for 4:2:0.
    /// After this returns, `output.meta` and `output.bitstream` hold the
    /// readback data that [`Encoder::packetize`] consumes.
    pub fn encode(
        &mut self,
        commands: &CommandBuffer<'_>,
        inputs: [&Plane; 3],
        output: BitstreamBuffers<'_>,
    ) -> UnitResult {
        let device = commands.device();
        let config = *self.buffers.config();

        for (component, input) in inputs.iter().enumerate() {
            if (input.width(), input.height()) != config.plane_dimensions(component) {
                return Err(Error::configuration("input plane dimensions do not match the session"));
            }
        }

        if output.meta.len() != self.buffers.block_count_32x32() {
            return Err(Error::configuration("meta buffer does not hold one entry per block"));
        }

        self.sequence_count = (self.sequence_count + 1) & SEQUENCE_COUNT_MASK;

        commands.begin_region("dwt");
        commands.select_subgroup_size(&[ 16, 32, 64, 128 ])?;
        for (component, input) in inputs.iter().enumerate() {
            mirror_extend(input, &mut self.extended_inputs[component]);
        }
        forward_dwt(device, &mut self.buffers, &self.extended_inputs, &mut self.lift);
        commands.end_region();

        commands.begin_region("quantize");
        commands.select_subgroup_size(&[ 64, 16, 32 ])?;
        quantize::quantize_pass(device, &self.buffers, &mut self.staging, &mut self.stats);
        commands.end_region();

        commands.begin_region("analyze rate control");
        commands.select_subgroup_size(&[ 16, 32, 64 ])?;
        let total_base_words = rdo::analyze_pass(device, &self.buffers, &self.stats, &mut self.buckets);
        commands.end_region();

        commands.begin_region("resolve rate control");
        commands.select_subgroup_size(&[ 64, 16, 32 ])?;
        rdo::resolve_pass(device, &self.buckets, total_base_words, output.target_size, &mut self.plane_drops);
        commands.end_region();

        commands.begin_region("block packing");
        commands.select_subgroup_size(&[ 16, 32, 64 ])?;
        pack::pack_pass(
            device, &self.buffers, &self.staging, &self.stats, &self.plane_drops,
            self.sequence_count, output.meta, output.bitstream,
        )?;
        commands.end_region();

        Ok(())
    }

    /// How many wire packets [`Encoder::packetize`] will produce for the
    /// given per-packet byte boundary.
    pub fn compute_num_packets(&self, meta: &[BitstreamPacket], packet_boundary: usize) -> usize {
        let mut num_packets = 0;
        let mut size_in_packet = HEADER_BYTES; // the sequence header opens the first packet

        for entry in meta {
            let packet_size = entry.num_words as usize * 4;
            if packet_size == 0 { continue; }

            if size_in_packet + packet_size > packet_boundary {
                num_packets += 1;
                size_in_packet = 0;
            }

            size_in_packet += packet_size;
        }

        if size_in_packet > 0 { num_packets += 1; }
        num_packets
    }

    /// Validate one block packet of the readback buffers before
    /// transmission. Logs the specific mismatch and returns false
    /// when the packet must not be sent.
    pub fn validate_bitstream(
        &self,
        bitstream: &[u32],
        meta: &[BitstreamPacket],
        block_index: usize,
    ) -> bool {
        let entry = &meta[block_index];
        if entry.num_words == 0 { return true; }

        let start = entry.offset_u32 as usize;
        let end = start + entry.num_words as usize;
        if end > bitstream.len() {
            log::error!("block {}: meta range {}..{} exceeds the bitstream", block_index, start, end);
            return false;
        }

        let words = &bitstream[start .. end];
        let header = match check_block_packet(words, &self.buffers) {
            Ok(header) => header,
            Err(error) => {
                log::error!("block {}: {}", block_index, error);
                return false;
            }
        };

        if header.block_index as usize != block_index {
            log::error!(
                "mismatch in block index. header: {}, meta: {}",
                header.block_index, block_index
            );
            return false;
        }

        if header.payload_words != entry.num_words as u16 {
            log::error!(
                "mismatch in payload words, header: {}, meta: {}",
                header.payload_words, entry.num_words
            );
            return false;
        }

        let band = self.buffers.coarse_home(block_index).band;
        if header.quant_code != band_quant_code(band) {
            log::error!(
                "block {}: quant code {} does not match the band quantizer",
                block_index, header.quant_code
            );
            return false;
        }

        true
    }

    /// Group the frame's block packets into wire packets of at most
    /// `packet_boundary` bytes, opening with the sequence header.
    /// Every block is structurally validated before transmission;
    /// a validation failure produces no wire output.
    pub fn packetize(
        &self,
        packet_boundary: usize,
        output: &mut [u8],
        meta: &[BitstreamPacket],
        bitstream: &[u32],
    ) -> Result<Vec<Packet>> {
        for block_index in 0 .. meta.len() {
            if !self.validate_bitstream(bitstream, meta, block_index) {
                return Err(Error::malformed("a block packet failed validation"));
            }
        }

        let total_blocks = meta.iter().filter(|entry| entry.num_words != 0).count();
        let total_bytes = HEADER_BYTES + meta.iter()
            .map(|entry| entry.num_words as usize * 4)
            .sum::<usize>();

        if total_bytes > output.len() {
            return Err(Error::configuration("packetize output buffer too small"));
        }

        let config = self.buffers.config();
        let sequence_header = SequenceHeader {
            width: config.width,
            height: config.height,
            sequence: self.sequence_count,
            total_blocks: total_blocks as u32,
            code: START_OF_FRAME,
            chroma: config.chroma,
            color: config.color,
        };

        let mut packets = Vec::new();
        let mut output_offset = 0;
        let mut packet_offset = 0;
        let mut size_in_packet = 0;

        for (index, word) in sequence_header.pack().iter().enumerate() {
            output[index * 4 .. index * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        output_offset += HEADER_BYTES;
        size_in_packet += HEADER_BYTES;

        for entry in meta {
            let packet_size = entry.num_words as usize * 4;
            if packet_size == 0 { continue; }

            if size_in_packet + packet_size > packet_boundary {
                packets.push(Packet { offset: packet_offset, size: size_in_packet });
                size_in_packet = 0;
                packet_offset = output_offset;
            }

            let words = &bitstream[entry.offset_u32 as usize ..][.. entry.num_words as usize];
            for (index, word) in words.iter().enumerate() {
                let at = output_offset + index * 4;
                output[at .. at + 4].copy_from_slice(&word.to_le_bytes());
            }

            output_offset += packet_size;
            size_in_packet += packet_size;
        }

        if size_in_packet > 0 {
            packets.push(Packet { offset: packet_offset, size: size_in_packet });
        }

        Ok(packets)
    }

    /// Log per-band rates and per-plane entropy of an encoded frame.
    /// Purely observational.
    pub fn report_stats(&self, meta: &[BitstreamPacket], bitstream: &[u32]) {
        const MAX_PLANES: usize = 19;
        let mut plane_histogram = vec![[0_u64; 256]; MAX_PLANES];
        let mut total_plane_bytes = [0_u64; MAX_PLANES];

        let mut total_words = 0_u64;
        let mut total_pixels = 0_u64;

        static COMPONENTS: [&str; 3] = [ "Y", "Cb", "Cr" ];
        static BANDS: [&str; 4] = [ "LL", "HL", "LH", "HH" ];

        for &band in self.buffers.coded_bands() {
            let info = self.buffers.band_blocks(band);
            let (band_width, band_height) = self.buffers.band_dimensions(band.level);

            let blocks_x = info.block_stride_32x32;
            let blocks_y = crate::math::div_ceil(band_height, crate::buffers::COARSE_BLOCK_SIZE);

            let mut words = 0_u64;
            for block_y in 0 .. blocks_y {
                for block_x in 0 .. blocks_x {
                    let block = info.block_offset_32x32 + block_y * blocks_x + block_x;
                    let entry = &meta[block];
                    if entry.num_words == 0 { continue; }

                    words += u64::from(entry.num_words);

                    let packet = &bitstream[entry.offset_u32 as usize ..][.. entry.num_words as usize];
                    histogram_block_planes(&self.buffers, packet, &mut plane_histogram, &mut total_plane_bytes);
                }
            }

            let bits_per_pixel = (words as f64 * 32.0) / (band_width * band_height) as f64;
            log::info!(
                "{}: decomposition level {}, band {}: {:.3} bpp",
                COMPONENTS[band.component], band.level, BANDS[band.band], bits_per_pixel
            );

            total_words += words;
            if band.component == 0 {
                total_pixels += (band_width * band_height) as u64;
            }
        }

        for plane in 0 .. MAX_PLANES {
            if total_plane_bytes[plane] == 0 { continue; }

            let mut entropy = 0.0_f64;
            for &count in &plane_histogram[plane] {
                if count != 0 {
                    let probability = count as f64 / total_plane_bytes[plane] as f64;
                    entropy -= probability * probability.log2();
                }
            }

            log::info!("    plane {} entropy: {:.3} %", plane, 100.0 * entropy / 8.0);
            log::info!("    plane {} bytes: {}", plane, total_plane_bytes[plane]);
        }

        log::info!("overall: {:.3} bpp", (total_words as f64 * 32.0) / total_pixels as f64);
    }
}

/// Accumulate the plane-byte histogram of one block packet,
/// indexed by plane position from the most significant plane down.
fn histogram_block_planes(
    buffers: &WaveletBuffers,
    words: &[u32],
    histogram: &mut [[u64; 256]],
    totals: &mut [u64],
) {
    use crate::bitstream::{byte_from_words, fine_code_from_words, FINE_CODE_BYTES, SUB_BLOCKS_PER_FINE_BLOCK};
    use crate::buffers::{fine_block_valid_size, in_bounds_sub_blocks, FINE_BLOCKS_PER_COARSE};

    let header = BlockHeader::unpack([ words[0], words[1] ]);
    let mapping = buffers.coarse_home(header.block_index as usize);
    let dimensions = buffers.band_dimensions(mapping.band.level);

    let fine_count = header.ballot.count_ones() as usize;
    let mut cursor = HEADER_BYTES + fine_count * FINE_CODE_BYTES;

    for (slot, bit) in (0 .. 16).filter(|&bit| header.ballot & 1 << bit != 0).enumerate() {
        let code = fine_code_from_words(words, HEADER_BYTES + slot * FINE_CODE_BYTES);

        let band_fine_x = mapping.x * FINE_BLOCKS_PER_COARSE + bit % 4;
        let band_fine_y = mapping.y * FINE_BLOCKS_PER_COARSE + bit / 4;
        let (valid_width, valid_height) = fine_block_valid_size(dimensions, band_fine_x, band_fine_y);
        let in_bounds_mask = in_bounds_sub_blocks(valid_width, valid_height);

        for sub in 0 .. SUB_BLOCKS_PER_FINE_BLOCK {
            if in_bounds_mask & 1 << sub == 0 { continue; }

            let planes = code.sub_block_planes(sub) as usize;
            for plane in 0 .. planes {
                let byte = byte_from_words(words, cursor + plane);
                histogram[plane.min(histogram.len() - 1)][byte as usize] += 1;
                totals[plane.min(totals.len() - 1)] += 1;
            }

            cursor += planes;
        }
    }
}
