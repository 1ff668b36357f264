
//! The decoder session: packet ingest with sequence tracking and loss
//! tolerance, dequantization, and the inverse transform back to planes.

pub mod ingest;
pub mod dequant;

use crate::buffers::{Plane, WaveletBuffers};
use crate::config::CodecConfig;
use crate::device::{subgroup, CommandBuffer, Device, PayloadAccess};
use crate::error::{Error, Result, UnitResult};
use crate::transform::inverse::inverse_dwt;
use crate::transform::LiftScratch;

/// Marks a coarse block that no packet has delivered yet.
pub(crate) const MISSING_BLOCK: u32 = u32::MAX;

/// The subgroup operation classes the decoder passes use.
/// The decoder is more lenient than the encoder.
const REQUIRED_SUBGROUP_OPERATIONS: u32 =
    subgroup::BASIC | subgroup::VOTE | subgroup::BALLOT;

/// Where the decoder stands between frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {

    /// No sequence adopted yet.
    Init,

    /// Blocks of the current sequence are arriving.
    SequenceAdopted,

    /// Every announced block arrived; decoding yields the full frame.
    ReadyFull,

    /// More than half of the announced blocks arrived; decoding is
    /// possible if the caller accepts a partial frame.
    ReadyPartial,

    /// The current sequence was decoded; a new sequence must start first.
    Decoded,
}

/// A decoder session for one frame geometry.
/// Owns the band planes, the staging vectors that wire packets land in,
/// and the reconstruction scratch. Staging vectors grow monotonically
/// and are cleared, not shrunk, at every new sequence.
#[derive(Debug)]
pub struct Decoder {
    pub(crate) buffers: WaveletBuffers,
    lift: LiftScratch,
    reconstructions: Vec<Plane>,

    /// Word offset of each delivered coarse block in `payload`,
    /// [`MISSING_BLOCK`] where nothing arrived.
    pub(crate) dequant_offset: Vec<u32>,

    /// Delivered block packets, appended back to back.
    pub(crate) payload: Vec<u32>,

    pub(crate) decoded_blocks: usize,
    pub(crate) total_blocks_in_sequence: usize,
    pub(crate) last_sequence: Option<u8>,
    pub(crate) decoded_frame_for_current_sequence: bool,
}

impl Decoder {

    /// Create a decoder session, verifying the device capability contract.
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

        match caps.payload_access()? {
            PayloadAccess::Storage8Bit => {}
            PayloadAccess::TexelBuffer =>
                log::info!("no 8-bit storage, reading payloads through texel buffer views"),
        }

        let buffers = WaveletBuffers::new(config)?;
        let (aligned_width, aligned_height) = (buffers.aligned_width(), buffers.aligned_height());

        let mut decoder = Decoder {
            lift: LiftScratch::new(aligned_width, aligned_height),
            reconstructions: (0 .. crate::buffers::NUM_COMPONENTS)
                .map(|component| {
                    if buffers.component_has_level(component, 0) {
                        Plane::new(aligned_width, aligned_height)
                    }
                    else {
                        Plane::new(aligned_width / 2, aligned_height / 2)
                    }
                })
                .collect(),

            dequant_offset: vec![MISSING_BLOCK; buffers.block_count_32x32()],
            payload: Vec::with_capacity(1024 * 1024),
            decoded_blocks: 0,
            total_blocks_in_sequence: buffers.block_count_32x32(),
            last_sequence: None,
            decoded_frame_for_current_sequence: false,
            buffers,
        };

        decoder.clear();
        Ok(decoder)
    }

    /// Reset all sequence state, forgetting any staged blocks.
    pub fn clear(&mut self) {
        for offset in &mut self.dequant_offset { *offset = MISSING_BLOCK; }
        self.payload.clear();
        self.decoded_blocks = 0;
        self.total_blocks_in_sequence = self.buffers.block_count_32x32();
        self.decoded_frame_for_current_sequence = false;
    }

    /// Number of coarse blocks of this session.
    pub fn block_count_32x32(&self) -> usize {
        self.buffers.block_count_32x32()
    }

    /// Blocks of the current sequence that have been delivered.
    pub fn decoded_blocks(&self) -> usize {
        self.decoded_blocks
    }

    /// Where the decoder stands between frames.
    pub fn state(&self) -> DecodeState {
        if self.last_sequence.is_none() {
            DecodeState::Init
        }
        else if self.decoded_frame_for_current_sequence {
            DecodeState::Decoded
        }
        else if self.decoded_blocks >= self.total_blocks_in_sequence {
            DecodeState::ReadyFull
        }
        else if self.decoded_blocks > self.total_blocks_in_sequence / 2 {
            DecodeState::ReadyPartial
        }
        else {
            DecodeState::SequenceAdopted
        }
    }

    /// Whether a decode issued now would succeed.
    ///
    /// A full frame is always accepted. With `allow_partial_frame`, more
    /// than half of the announced blocks must have arrived, otherwise the
    /// frame is assumed to be complete garbage. A sequence that was already
    /// decoded is never decoded again.
    pub fn decode_is_ready(&self, allow_partial_frame: bool) -> bool {
        if self.decoded_frame_for_current_sequence {
            return false;
        }

        if self.decoded_blocks < self.total_blocks_in_sequence {
            if !allow_partial_frame || self.decoded_blocks <= self.total_blocks_in_sequence / 2 {
                return false;
            }
        }

        true
    }

    /// Decode the staged frame into the three output planes, which must
    /// match the configured dimensions. Missing blocks decode to zero
    /// coefficients. After this, the sequence counts as consumed.
    pub fn decode(
        &mut self,
        commands: &CommandBuffer<'_>,
        outputs: &mut [Plane],
    ) -> UnitResult {
        if !self.decode_is_ready(true) {
            return Err(Error::configuration("no decodable frame staged"));
        }

        let config = *self.buffers.config();
        if outputs.len() != crate::buffers::NUM_COMPONENTS {
            return Err(Error::configuration("expected three output planes"));
        }

        for (component, output) in outputs.iter().enumerate() {
            if (output.width(), output.height()) != config.plane_dimensions(component) {
                return Err(Error::configuration("output plane dimensions do not match the session"));
            }
        }

        let device = commands.device();

        commands.begin_region("decode uploads");
        // the software queue reads the staging vectors in place
        commands.end_region();

        commands.begin_region("dequantize");
        commands.select_subgroup_size(&[ 32, 64, 16, 128 ])?;
        dequant::dequant_pass(device, &mut self.buffers, &self.dequant_offset, &self.payload);
        commands.end_region();

        commands.begin_region("inverse dwt");
        commands.select_subgroup_size(&[ 16, 32, 64, 128 ])?;
        inverse_dwt(device, &mut self.buffers, &mut self.reconstructions, &mut self.lift);
        commands.end_region();

        for (component, output) in outputs.iter_mut().enumerate() {
            let (width, height) = config.plane_dimensions(component);
            let source = &self.reconstructions[component];

            for y in 0 .. height {
                output.row_mut(y).copy_from_slice(&source.row(y)[.. width]);
            }
        }

        self.decoded_frame_for_current_sequence = true;
        Ok(())
    }

    /// Adopt a new sequence number, dropping all staged state.
    pub(crate) fn adopt_sequence(&mut self, sequence: u8) {
        if self.last_sequence != Some(sequence) {
            self.clear();
            self.last_sequence = Some(sequence);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ChromaSubsampling;
    use crate::device::DeviceCaps;

    #[test]
    fn capability_gating(){
        let config = CodecConfig::new(128, 128, ChromaSubsampling::Chroma444);

        let device = Device::software().unwrap();
        assert!(Decoder::init(&device, config).is_ok());

        let mut caps = DeviceCaps::software();
        caps.half_float = false;
        let device = Device::with_caps(caps).unwrap();
        assert!(matches!(Decoder::init(&device, config), Err(Error::Unsupported(_))));

        let mut caps = DeviceCaps::software();
        caps.subgroup_operations = subgroup::BASIC;
        let device = Device::with_caps(caps).unwrap();
        assert!(Decoder::init(&device, config).is_err());

        // the texel buffer fallback still initializes
        let mut caps = DeviceCaps::software();
        caps.storage_8bit = false;
        let device = Device::with_caps(caps).unwrap();
        assert!(Decoder::init(&device, config).is_ok());

        caps.max_texel_buffer_elements = 1 << 16;
        let device = Device::with_caps(caps).unwrap();
        assert!(Decoder::init(&device, config).is_err());
    }

    #[test]
    fn fresh_decoder_is_not_ready(){
        let device = Device::software().unwrap();
        let config = CodecConfig::new(128, 128, ChromaSubsampling::Chroma444);
        let decoder = Decoder::init(&device, config).unwrap();

        assert_eq!(decoder.state(), DecodeState::Init);
        assert!(!decoder.decode_is_ready(false));
        assert!(!decoder.decode_is_ready(true));
    }
}
