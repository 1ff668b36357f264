
//! Session configuration: frame geometry, chroma subsampling,
//! compute precision, and colour metadata carried in the sequence header.

use crate::error::{Error, Result, UnitResult};

/// How the two chroma components are sampled relative to luma.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChromaSubsampling {

    /// Chroma planes have half the resolution of the luma plane
    /// in both dimensions. The top decomposition level is luma-only.
    Chroma420,

    /// All three planes have full resolution.
    Chroma444,
}

impl ChromaSubsampling {

    /// The single-bit wire encoding used in the sequence header.
    pub fn to_wire(self) -> u32 {
        match self {
            ChromaSubsampling::Chroma420 => 0,
            ChromaSubsampling::Chroma444 => 1,
        }
    }

    /// Decode the single-bit wire encoding used in the sequence header.
    pub fn from_wire(bit: u32) -> Self {
        if bit == 0 { ChromaSubsampling::Chroma420 } else { ChromaSubsampling::Chroma444 }
    }
}

/// Compute precision of the wavelet band storage.
///
/// Lower precision halves bandwidth on real hardware; on the arithmetic level
/// it rounds every stored band coefficient through binary16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {

    /// All decomposition levels store half-float coefficients.
    Fp16,

    /// The two finest levels store half floats,
    /// the coarse levels keep full precision.
    /// Bandwidth in the coarse levels is trivial, so this is usually the best trade.
    Mixed,

    /// Everything stays at full 32-bit float precision.
    Fp32,
}

impl Default for Precision {
    fn default() -> Self { Precision::Mixed }
}

impl Precision {

    /// The number of fine decomposition levels that store half floats.
    pub(crate) fn half_float_levels(self) -> usize {
        match self {
            Precision::Fp16 => crate::buffers::DECOMPOSITION_LEVELS,
            Precision::Mixed => 2,
            Precision::Fp32 => 0,
        }
    }
}

/// Parses the numeric precision levels 0, 1 and 2.
/// Front ends use this for the `PYROWAVE_PRECISION` environment variable.
impl std::str::FromStr for Precision {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        match text.trim() {
            "0" => Ok(Precision::Fp16),
            "1" => Ok(Precision::Mixed),
            "2" => Ok(Precision::Fp32),
            _ => Err(Error::configuration("precision must be in range [0, 2]")),
        }
    }
}

/// Colour primaries signalled in the sequence header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorPrimaries {
    /// ITU-R BT.709.
    Bt709,
    /// ITU-R BT.2020.
    Bt2020,
}

/// Transfer function signalled in the sequence header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferFunction {
    /// ITU-R BT.709.
    Bt709,
    /// SMPTE ST 2084 perceptual quantizer.
    Pq,
}

/// The RGB to YCbCr matrix signalled in the sequence header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum YcbcrTransform {
    /// ITU-R BT.709.
    Bt709,
    /// ITU-R BT.2020 non-constant luminance.
    Bt2020,
}

/// Quantization range signalled in the sequence header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum YcbcrRange {
    /// Codes use the full range of the sample type.
    Full,
    /// Codes use the limited broadcast range.
    Limited,
}

/// Chroma sample position signalled in the sequence header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChromaSiting {
    /// Chroma samples sit between luma samples.
    Center,
    /// Chroma samples are co-sited with the left luma column.
    Left,
}

/// Colour metadata for one video stream.
/// Does not influence compression, only the signalled sequence header bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorDescription {

    /// Colour primaries of the stream.
    pub primaries: ColorPrimaries,

    /// Transfer function of the stream.
    pub transfer: TransferFunction,

    /// YCbCr matrix of the stream.
    pub transform: YcbcrTransform,

    /// Quantization range of the stream.
    pub range: YcbcrRange,

    /// Chroma sample position of the stream.
    pub siting: ChromaSiting,
}

impl Default for ColorDescription {
    fn default() -> Self {
        ColorDescription {
            primaries: ColorPrimaries::Bt709,
            transfer: TransferFunction::Bt709,
            transform: YcbcrTransform::Bt709,
            range: YcbcrRange::Limited,
            siting: ChromaSiting::Center,
        }
    }
}

/// Everything needed to set up an encoder or decoder session.
///
/// Plane samples are zero-centred floats:
/// 8-bit video maps code value `v` to `(v - 128) / 255`,
/// so a neutral grey frame is the all-zero signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodecConfig {

    /// Frame width in luma samples. At least 128.
    pub width: usize,

    /// Frame height in luma samples. At least 128.
    pub height: usize,

    /// Chroma subsampling of the three input planes.
    pub chroma: ChromaSubsampling,

    /// Band storage precision.
    pub precision: Precision,

    /// Colour metadata signalled in the sequence header.
    pub color: ColorDescription,

    /// Display density assumed by the psychovisual model, in dots per inch.
    pub dpi: f32,

    /// Viewing distance assumed by the psychovisual model, in meters.
    /// The default of one meter is a compromise between
    /// couch gaming and desktop viewing.
    pub viewing_distance: f32,
}

impl CodecConfig {

    /// A session configuration with the default psychovisual model,
    /// default precision and BT.709 colour metadata.
    pub fn new(width: usize, height: usize, chroma: ChromaSubsampling) -> Self {
        CodecConfig {
            width, height, chroma,
            precision: Precision::default(),
            color: ColorDescription::default(),
            dpi: 96.0,
            viewing_distance: 1.0,
        }
    }

    /// Returns an error where the configuration cannot be encoded.
    pub fn validate(&self) -> UnitResult {
        let max_dimension = 1 << 14; // the sequence header stores dimensions in 14 bits

        if self.width < crate::buffers::MINIMUM_IMAGE_SIZE
            || self.height < crate::buffers::MINIMUM_IMAGE_SIZE
        {
            return Err(Error::configuration("frame dimensions below the minimum image size"));
        }

        if self.width > max_dimension || self.height > max_dimension {
            return Err(Error::configuration("frame dimensions exceed the 14 bit header field"));
        }

        if self.chroma == ChromaSubsampling::Chroma420
            && (self.width % 2 != 0 || self.height % 2 != 0)
        {
            return Err(Error::configuration("4:2:0 subsampling requires even frame dimensions"));
        }

        if !(self.dpi > 0.0) || !(self.viewing_distance > 0.0) {
            return Err(Error::configuration("psychovisual model parameters must be positive"));
        }

        Ok(())
    }

    /// The dimensions of the plane for one component:
    /// chroma planes have half resolution for 4:2:0.
    pub fn plane_dimensions(&self, component: usize) -> (usize, usize) {
        match self.chroma {
            ChromaSubsampling::Chroma420 if component != 0 =>
                (self.width / 2, self.height / 2),

            _ => (self.width, self.height),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn validation(){
        assert!(CodecConfig::new(128, 128, ChromaSubsampling::Chroma444).validate().is_ok());
        assert!(CodecConfig::new(1920, 1080, ChromaSubsampling::Chroma420).validate().is_ok());

        // too small
        assert!(CodecConfig::new(64, 1080, ChromaSubsampling::Chroma444).validate().is_err());

        // exceeds the 14 bit header field
        assert!(CodecConfig::new(32768, 1080, ChromaSubsampling::Chroma444).validate().is_err());

        // odd dimensions cannot be subsampled
        assert!(CodecConfig::new(1921, 1080, ChromaSubsampling::Chroma420).validate().is_err());
        assert!(CodecConfig::new(1921, 1080, ChromaSubsampling::Chroma444).validate().is_ok());
    }

    #[test]
    fn precision_parsing(){
        assert_eq!("0".parse::<Precision>().unwrap(), Precision::Fp16);
        assert_eq!("1".parse::<Precision>().unwrap(), Precision::Mixed);
        assert_eq!("2".parse::<Precision>().unwrap(), Precision::Fp32);
        assert!("3".parse::<Precision>().is_err());
        assert!("".parse::<Precision>().is_err());
    }

    #[test]
    fn plane_dimensions(){
        let config = CodecConfig::new(1920, 1088, ChromaSubsampling::Chroma420);
        assert_eq!(config.plane_dimensions(0), (1920, 1088));
        assert_eq!(config.plane_dimensions(1), (960, 544));

        let config = CodecConfig::new(1920, 1088, ChromaSubsampling::Chroma444);
        assert_eq!(config.plane_dimensions(2), (1920, 1088));
    }
}
