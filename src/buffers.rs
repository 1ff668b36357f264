
//! The wavelet plane store.
//!
//! Owns the band coefficient planes for all decomposition levels and
//! computes the block-index geometry that every downstream pass works in:
//! the fine 8×8 grid (quantization and statistics) and the coarse 32×32 grid
//! (rate-distortion decisions and packet blocks). Both the encoder and the
//! decoder embed this store.

use crate::config::{ChromaSubsampling, CodecConfig};
use crate::error::Result;
use crate::math::{align, div_ceil};

use half::f16;

/// Number of wavelet decomposition levels.
pub const DECOMPOSITION_LEVELS: usize = 5;

/// Plane dimensions are aligned up to this multiple.
pub const ALIGNMENT: usize = 1 << DECOMPOSITION_LEVELS;

/// If the final decomposition band is too small,
/// the mirroring will break since it starts double mirroring.
pub const MINIMUM_IMAGE_SIZE: usize = 4 << DECOMPOSITION_LEVELS;

/// Y, Cb and Cr.
pub const NUM_COMPONENTS: usize = 3;

/// LL, HL, LH and HH.
pub const BANDS_PER_LEVEL: usize = 4;

/// Edge length of a fine block, the unit of quantization and statistics.
pub const FINE_BLOCK_SIZE: usize = 8;

/// Edge length of a coarse block, the unit of RDO decisions and packet blocks.
pub const COARSE_BLOCK_SIZE: usize = 32;

/// Fine blocks per coarse block edge.
pub const FINE_BLOCKS_PER_COARSE: usize = COARSE_BLOCK_SIZE / FINE_BLOCK_SIZE;

/// A single two-dimensional array of coefficients, stored row by row.
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Plane {

    /// Allocate a zero-filled plane.
    pub fn new(width: usize, height: usize) -> Self {
        Plane { width, height, data: vec![0.0; width * height] }
    }

    /// Width of this plane.
    #[inline]
    pub fn width(&self) -> usize { self.width }

    /// Height of this plane.
    #[inline]
    pub fn height(&self) -> usize { self.height }

    /// Sample the coefficient at the coordinate.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Overwrite the coefficient at the coordinate.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        self.data[y * self.width + x] = value;
    }

    /// One row of coefficients.
    #[inline]
    pub fn row(&self, y: usize) -> &[f32] {
        &self.data[y * self.width .. (y + 1) * self.width]
    }

    /// One mutable row of coefficients.
    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [f32] {
        &mut self.data[y * self.width .. (y + 1) * self.width]
    }

    /// All coefficients, row by row.
    #[inline]
    pub fn samples(&self) -> &[f32] { &self.data }

    /// All coefficients, row by row, mutable.
    #[inline]
    pub fn samples_mut(&mut self) -> &mut [f32] { &mut self.data }

    /// Reset every coefficient to zero.
    pub fn clear(&mut self) {
        for sample in &mut self.data { *sample = 0.0; }
    }
}

/// Identifies one frequency band: component, decomposition level, band index.
/// Band indices are 0 = LL, 1 = HL, 2 = LH, 3 = HH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BandRef {

    /// Component index: 0 = Y, 1 = Cb, 2 = Cr.
    pub component: usize,

    /// Decomposition level, 0 is the finest.
    pub level: usize,

    /// Band index within the level.
    pub band: usize,
}

/// Where a band's blocks live in the two global grids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandBlockInfo {

    /// Global index of this band's first fine block.
    pub block_offset_8x8: usize,

    /// Fine blocks per row within this band.
    pub block_stride_8x8: usize,

    /// Global index of this band's first coarse block.
    pub block_offset_32x32: usize,

    /// Coarse blocks per row within this band.
    pub block_stride_32x32: usize,
}

/// Maps one coarse block to the fine blocks it covers.
/// Blocks at band edges cover fewer than 4×4 fine blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoarseToFine {

    /// Global index of the top-left covered fine block.
    pub block_offset_8x8: usize,

    /// Fine blocks per row within the owning band.
    pub block_stride_8x8: usize,

    /// Covered fine blocks per row, 1 ..= 4.
    pub block_width_8x8: usize,

    /// Covered fine block rows, 1 ..= 4.
    pub block_height_8x8: usize,
}

/// Reverse lookup from a global coarse block index
/// to the band that owns it and its position in that band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoarseBlockHome {

    /// The band owning this coarse block.
    pub band: BandRef,

    /// Coarse block column within the band.
    pub x: usize,

    /// Coarse block row within the band.
    pub y: usize,
}

/// Owns all band planes of a session and the block geometry derived from the
/// frame dimensions. Allocated once per `(width, height, chroma)` session.
#[derive(Debug)]
pub struct WaveletBuffers {
    config: CodecConfig,
    aligned_width: usize,
    aligned_height: usize,

    // indexed [component][level][band], flattened
    planes: Vec<Plane>,

    block_meta: [[[BandBlockInfo; BANDS_PER_LEVEL]; DECOMPOSITION_LEVELS]; NUM_COMPONENTS],
    coarse_to_fine: Vec<CoarseToFine>,
    coarse_home: Vec<CoarseBlockHome>,
    coded_bands: Vec<BandRef>,

    block_count_8x8: usize,
    block_count_32x32: usize,
}

impl WaveletBuffers {

    /// Validate the configuration, allocate all band planes
    /// and enumerate the global block grids.
    pub fn new(config: CodecConfig) -> Result<Self> {
        config.validate()?;

        let aligned_width = align(config.width, ALIGNMENT).max(MINIMUM_IMAGE_SIZE);
        let aligned_height = align(config.height, ALIGNMENT).max(MINIMUM_IMAGE_SIZE);

        let mut buffers = WaveletBuffers {
            config, aligned_width, aligned_height,
            planes: Vec::new(),
            block_meta: Default::default(),
            coarse_to_fine: Vec::new(),
            coarse_home: Vec::new(),
            coded_bands: Vec::new(),
            block_count_8x8: 0,
            block_count_32x32: 0,
        };

        buffers.allocate_planes();
        buffers.init_block_meta();
        Ok(buffers)
    }

    /// The configuration this store was built for.
    pub fn config(&self) -> &CodecConfig { &self.config }

    /// Frame width aligned up for the decomposition.
    pub fn aligned_width(&self) -> usize { self.aligned_width }

    /// Frame height aligned up for the decomposition.
    pub fn aligned_height(&self) -> usize { self.aligned_height }

    /// Total number of fine blocks across all coded bands.
    pub fn block_count_8x8(&self) -> usize { self.block_count_8x8 }

    /// Total number of coarse blocks across all coded bands.
    pub fn block_count_32x32(&self) -> usize { self.block_count_32x32 }

    /// Resolution of every band at the given level.
    pub fn band_dimensions(&self, level: usize) -> (usize, usize) {
        (self.aligned_width >> (level + 1), self.aligned_height >> (level + 1))
    }

    /// Whether this component participates in the given level.
    /// For 4:2:0 the top level is luma-only.
    pub fn component_has_level(&self, component: usize, level: usize) -> bool {
        level != 0 || component == 0 || self.config.chroma != ChromaSubsampling::Chroma420
    }

    /// All coded bands in global index order: levels from coarse to fine,
    /// components within a level, bands {LL, HL, LH, HH} within a component.
    /// Only the coarsest level codes its LL band.
    pub fn coded_bands(&self) -> &[BandRef] { &self.coded_bands }

    /// Block placement of one band within the global grids.
    pub fn band_blocks(&self, band: BandRef) -> &BandBlockInfo {
        &self.block_meta[band.component][band.level][band.band]
    }

    /// Fine block coverage of one coarse block.
    pub fn coarse_to_fine(&self, coarse_index: usize) -> &CoarseToFine {
        &self.coarse_to_fine[coarse_index]
    }

    /// The band owning a coarse block and the block's position in it.
    pub fn coarse_home(&self, coarse_index: usize) -> &CoarseBlockHome {
        &self.coarse_home[coarse_index]
    }

    /// The coefficient plane of one band.
    pub fn plane(&self, band: BandRef) -> &Plane {
        &self.planes[Self::plane_index(band)]
    }

    /// The mutable coefficient plane of one band.
    pub fn plane_mut(&mut self, band: BandRef) -> &mut Plane {
        &mut self.planes[Self::plane_index(band)]
    }

    /// Whether coefficients stored at this level
    /// are rounded through half-float precision.
    pub fn level_stores_half_floats(&self, level: usize) -> bool {
        level < self.config.precision.half_float_levels()
    }

    /// Round a coefficient the way the band storage of this level would.
    #[inline]
    pub fn storage_rounding(&self, level: usize) -> fn(f32) -> f32 {
        if self.level_stores_half_floats(level) {
            |value| f16::from_f32(value).to_f32()
        }
        else {
            |value| value
        }
    }

    /// Borrow the previous level's LL plane together with
    /// the four mutable band planes of this level. Needs `level >= 1`.
    pub(crate) fn forward_level_io(&mut self, component: usize, level: usize)
        -> (&Plane, &mut [Plane])
    {
        debug_assert!(level >= 1);
        let bands_start = Self::plane_index(BandRef { component, level, band: 0 });
        let ll_index = Self::plane_index(BandRef { component, level: level - 1, band: 0 });

        let (before, after) = self.planes.split_at_mut(bands_start);
        (&before[ll_index], &mut after[.. BANDS_PER_LEVEL])
    }

    /// Borrow the previous level's mutable LL plane together with
    /// the four band planes of this level. Needs `level >= 1`.
    pub(crate) fn inverse_level_io(&mut self, component: usize, level: usize)
        -> (&mut Plane, &[Plane])
    {
        debug_assert!(level >= 1);
        let bands_start = Self::plane_index(BandRef { component, level, band: 0 });
        let ll_index = Self::plane_index(BandRef { component, level: level - 1, band: 0 });

        let (before, after) = self.planes.split_at_mut(bands_start);
        (&mut before[ll_index], &after[.. BANDS_PER_LEVEL])
    }

    /// The four mutable band planes of one level.
    pub(crate) fn level_bands_mut(&mut self, component: usize, level: usize) -> &mut [Plane] {
        let bands_start = Self::plane_index(BandRef { component, level, band: 0 });
        &mut self.planes[bands_start .. bands_start + BANDS_PER_LEVEL]
    }

    /// Reset every band plane to zero.
    pub fn clear_planes(&mut self) {
        for plane in &mut self.planes { plane.clear(); }
    }

    #[inline]
    fn plane_index(band: BandRef) -> usize {
        (band.component * DECOMPOSITION_LEVELS + band.level) * BANDS_PER_LEVEL + band.band
    }

    fn allocate_planes(&mut self) {
        for component in 0 .. NUM_COMPONENTS {
            for level in 0 .. DECOMPOSITION_LEVELS {
                let (width, height) = self.band_dimensions(level);

                for _band in 0 .. BANDS_PER_LEVEL {
                    // uncoded top-level chroma stays empty
                    if self.component_has_level(component, level) {
                        self.planes.push(Plane::new(width, height));
                    }
                    else {
                        self.planes.push(Plane::new(0, 0));
                    }
                }
            }
        }
    }

    fn init_block_meta(&mut self) {
        for level in (0 .. DECOMPOSITION_LEVELS).rev() {
            for component in 0 .. NUM_COMPONENTS {
                if !self.component_has_level(component, level) { continue; }

                let first_band = if level == DECOMPOSITION_LEVELS - 1 { 0 } else { 1 };
                for band in first_band .. BANDS_PER_LEVEL {
                    let (band_width, band_height) = self.band_dimensions(level);

                    let blocks_x_8x8 = div_ceil(band_width, FINE_BLOCK_SIZE);
                    let blocks_y_8x8 = div_ceil(band_height, FINE_BLOCK_SIZE);
                    let blocks_x_32x32 = div_ceil(band_width, COARSE_BLOCK_SIZE);

                    let band_ref = BandRef { component, level, band };
                    self.block_meta[component][level][band] = BandBlockInfo {
                        block_offset_8x8: self.block_count_8x8,
                        block_stride_8x8: blocks_x_8x8,
                        block_offset_32x32: self.block_count_32x32,
                        block_stride_32x32: blocks_x_32x32,
                    };

                    self.coded_bands.push(band_ref);
                    self.accumulate_block_mapping(band_ref, blocks_x_8x8, blocks_y_8x8);
                }
            }
        }
    }

    fn accumulate_block_mapping(&mut self, band: BandRef, blocks_x_8x8: usize, blocks_y_8x8: usize) {
        let blocks_x_32x32 = div_ceil(blocks_x_8x8, FINE_BLOCKS_PER_COARSE);
        let blocks_y_32x32 = div_ceil(blocks_y_8x8, FINE_BLOCKS_PER_COARSE);

        for y in 0 .. blocks_y_32x32 {
            for x in 0 .. blocks_x_32x32 {
                self.coarse_to_fine.push(CoarseToFine {
                    block_offset_8x8: self.block_count_8x8
                        + FINE_BLOCKS_PER_COARSE * y * blocks_x_8x8
                        + FINE_BLOCKS_PER_COARSE * x,

                    block_stride_8x8: blocks_x_8x8,
                    block_width_8x8: (blocks_x_8x8 - FINE_BLOCKS_PER_COARSE * x).min(FINE_BLOCKS_PER_COARSE),
                    block_height_8x8: (blocks_y_8x8 - FINE_BLOCKS_PER_COARSE * y).min(FINE_BLOCKS_PER_COARSE),
                });

                self.coarse_home.push(CoarseBlockHome { band, x, y });
                self.block_count_32x32 += 1;
            }
        }

        self.block_count_8x8 += blocks_x_8x8 * blocks_y_8x8;
    }
}

/// How many of the 8×8 coefficients of a fine block are inside the band:
/// returns the valid width and height, each in `1 ..= 8`.
/// Coefficients beyond the band resolution are never coded.
#[inline]
pub fn fine_block_valid_size(
    band_dimensions: (usize, usize),
    fine_x: usize, fine_y: usize,
) -> (usize, usize) {
    let (band_width, band_height) = band_dimensions;
    let valid_width = (band_width - fine_x * FINE_BLOCK_SIZE).min(FINE_BLOCK_SIZE);
    let valid_height = (band_height - fine_y * FINE_BLOCK_SIZE).min(FINE_BLOCK_SIZE);
    (valid_width, valid_height)
}

/// Bit mask of the 4×2 sub-blocks of a fine block that contain
/// at least one in-bounds coefficient. Sub-block `s` covers columns
/// `4·(s%2) ..` and rows `2·(s/2) ..`; bit `s` marks it in-bounds.
#[inline]
pub fn in_bounds_sub_blocks(valid_width: usize, valid_height: usize) -> u8 {
    let mut mask = 0_u8;

    for sub in 0 .. crate::bitstream::SUB_BLOCKS_PER_FINE_BLOCK {
        let sub_x = (sub % 2) * 4;
        let sub_y = (sub / 2) * 2;

        if sub_x < valid_width && sub_y < valid_height {
            mask |= 1 << sub;
        }
    }

    mask
}

/// The ballot bits a coarse block may legally set:
/// one bit per covered fine block, bit `4·y + x`.
#[inline]
pub fn coarse_ballot_mask(mapping: &CoarseToFine) -> u16 {
    let mut mask = 0_u16;

    for y in 0 .. mapping.block_height_8x8 {
        for x in 0 .. mapping.block_width_8x8 {
            mask |= 1 << (FINE_BLOCKS_PER_COARSE * y + x);
        }
    }

    mask
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::CodecConfig;

    fn buffers(width: usize, height: usize, chroma: ChromaSubsampling) -> WaveletBuffers {
        WaveletBuffers::new(CodecConfig::new(width, height, chroma)).unwrap()
    }

    #[test]
    fn alignment(){
        let store = buffers(1920, 1080, ChromaSubsampling::Chroma420);
        assert_eq!(store.aligned_width(), 1920);
        assert_eq!(store.aligned_height(), 1088);

        let store = buffers(130, 129, ChromaSubsampling::Chroma444);
        assert_eq!(store.aligned_width(), 160);
        assert_eq!(store.aligned_height(), 160);

        // never below the minimum image size
        let store = buffers(128, 128, ChromaSubsampling::Chroma444);
        assert_eq!(store.aligned_width(), 128);
        assert_eq!(store.band_dimensions(DECOMPOSITION_LEVELS - 1), (4, 4));
    }

    #[test]
    fn coded_band_order(){
        let store = buffers(128, 128, ChromaSubsampling::Chroma444);
        let bands = store.coded_bands();

        // coarsest level first, with its LL band
        assert_eq!(bands[0], BandRef { component: 0, level: 4, band: 0 });
        assert_eq!(bands[1], BandRef { component: 0, level: 4, band: 1 });
        assert_eq!(bands[4], BandRef { component: 1, level: 4, band: 0 });

        // finer levels skip LL
        assert!(bands.iter().all(|band| band.level == DECOMPOSITION_LEVELS - 1 || band.band != 0));

        // 4:4:4 codes chroma on every level: 3 components * (4 + 4 * 3) bands
        assert_eq!(bands.len(), 3 * (4 + 4 * 3));

        // 4:2:0 drops the top chroma level
        let store = buffers(128, 128, ChromaSubsampling::Chroma420);
        assert_eq!(store.coded_bands().len(), 3 * (4 + 4 * 3) - 2 * 3);
    }

    #[test]
    fn global_indices_are_contiguous(){
        for chroma in [ ChromaSubsampling::Chroma420, ChromaSubsampling::Chroma444 ] {
            let store = buffers(1280, 720, chroma);

            let mut expected_coarse = 0;
            let mut expected_fine = 0;

            for &band in store.coded_bands() {
                let info = store.band_blocks(band);
                assert_eq!(info.block_offset_32x32, expected_coarse, "coarse offset of {:?}", band);
                assert_eq!(info.block_offset_8x8, expected_fine, "fine offset of {:?}", band);

                let (band_width, band_height) = store.band_dimensions(band.level);
                let blocks_x = div_ceil(band_width, FINE_BLOCK_SIZE);
                let blocks_y = div_ceil(band_height, FINE_BLOCK_SIZE);

                expected_fine += blocks_x * blocks_y;
                expected_coarse += div_ceil(blocks_x, 4) * div_ceil(blocks_y, 4);
            }

            assert_eq!(store.block_count_32x32(), expected_coarse);
            assert_eq!(store.block_count_8x8(), expected_fine);
            assert_eq!(store.coarse_to_fine.len(), expected_coarse);
            assert_eq!(store.coarse_home.len(), expected_coarse);
        }
    }

    #[test]
    fn coarse_mapping_covers_band_edges(){
        let store = buffers(1280, 720, ChromaSubsampling::Chroma420);

        // 720 aligns to 736; level 0 bands are 640x368, so 80x46 fine blocks
        let (band_width, band_height) = store.band_dimensions(0);
        assert_eq!((band_width, band_height), (640, 368));

        let band = BandRef { component: 0, level: 0, band: 3 };
        let info = store.band_blocks(band);
        assert_eq!(info.block_stride_8x8, 80);
        assert_eq!(info.block_stride_32x32, 20);

        // the bottom coarse row only covers 46 - 44 = 2 fine rows
        let last_row_block = info.block_offset_32x32 + 11 * info.block_stride_32x32;
        let mapping = store.coarse_to_fine(last_row_block);
        assert_eq!(mapping.block_width_8x8, 4);
        assert_eq!(mapping.block_height_8x8, 2);
        assert_eq!(coarse_ballot_mask(mapping), 0x00ff);

        assert_eq!(store.coarse_home(last_row_block).band, band);
        assert_eq!(store.coarse_home(last_row_block).y, 11);
    }

    #[test]
    fn sub_block_bounds(){
        assert_eq!(in_bounds_sub_blocks(8, 8), 0xff);
        assert_eq!(in_bounds_sub_blocks(4, 8), 0b0101_0101);
        assert_eq!(in_bounds_sub_blocks(5, 8), 0xff);
        assert_eq!(in_bounds_sub_blocks(8, 2), 0b0000_0011);
        assert_eq!(in_bounds_sub_blocks(1, 1), 0b0000_0001);

        assert_eq!(fine_block_valid_size((640, 368), 79, 45), (8, 8));
        assert_eq!(fine_block_valid_size((5, 5), 0, 0), (5, 5));
    }

    #[test]
    fn half_float_level_selection(){
        let mut config = CodecConfig::new(128, 128, ChromaSubsampling::Chroma444);

        config.precision = crate::config::Precision::Mixed;
        let store = WaveletBuffers::new(config).unwrap();
        assert!(store.level_stores_half_floats(0));
        assert!(store.level_stores_half_floats(1));
        assert!(!store.level_stores_half_floats(2));

        config.precision = crate::config::Precision::Fp32;
        let store = WaveletBuffers::new(config).unwrap();
        assert!(!store.level_stores_half_floats(0));

        config.precision = crate::config::Precision::Fp16;
        let store = WaveletBuffers::new(config).unwrap();
        assert!(store.level_stores_half_floats(DECOMPOSITION_LEVELS - 1));
    }
}
