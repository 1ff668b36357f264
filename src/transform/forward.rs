
//! The forward transform: three sampled input planes
//! become band images for all five decomposition levels.

use crate::buffers::{Plane, WaveletBuffers, DECOMPOSITION_LEVELS, NUM_COMPONENTS};
use crate::config::ChromaSubsampling;
use crate::device::Device;

use super::{forward_lift_line, LiftScratch};

use rayon::prelude::*;

/// Fill the destination with the source plane, extending it to the
/// destination resolution by mirror-repeat, the addressing rule of the
/// level-0 sampler. The destination must not be smaller than the source.
pub fn mirror_extend(source: &Plane, destination: &mut Plane) {
    debug_assert!(destination.width() >= source.width());
    debug_assert!(destination.height() >= source.height());

    let mirror = |index: usize, size: usize| {
        let period = 2 * size;
        let phase = index % period;
        if phase < size { phase } else { period - 1 - phase }
    };

    for y in 0 .. destination.height() {
        let source_y = mirror(y, source.height());

        for x in 0 .. destination.width() {
            let value = source.get(mirror(x, source.width()), source_y);
            destination.set(x, y, value);
        }
    }
}

/// Decompose one input plane into the four bands of one level.
/// The band planes must have exactly half the input resolution.
pub(crate) fn forward_level(
    device: &Device,
    input: &Plane,
    bands: &mut [Plane],
    store: fn(f32) -> f32,
    scratch: &mut LiftScratch,
) {
    let (full_width, full_height) = (input.width(), input.height());
    let (half_width, half_height) = (full_width / 2, full_height / 2);
    debug_assert!(bands.iter().all(|band|
        band.width() == half_width && band.height() == half_height));

    let work = &mut scratch.work[.. full_width * full_height];
    work.copy_from_slice(input.samples());

    // horizontal pass, one worker per row
    device.dispatch(|| {
        work.par_chunks_mut(full_width).for_each_init(
            || vec![0.0; full_width],
            |split, row| forward_lift_line(row, split),
        );
    });

    // vertical pass along strided columns
    for x in 0 .. full_width {
        let column = &mut scratch.column[.. full_height];
        for y in 0 .. full_height {
            column[y] = work[y * full_width + x];
        }

        forward_lift_line(column, &mut scratch.split);

        for y in 0 .. full_height {
            work[y * full_width + x] = column[y];
        }
    }

    // the four quadrants are the four bands
    let (top, bottom) = bands.split_at_mut(2);
    let (ll, hl) = top.split_at_mut(1);
    let (lh, hh) = bottom.split_at_mut(1);

    for y in 0 .. half_height {
        let low_row = &work[y * full_width ..][.. full_width];
        let high_row = &work[(y + half_height) * full_width ..][.. full_width];

        for x in 0 .. half_width {
            ll[0].set(x, y, store(low_row[x]));
            hl[0].set(x, y, store(low_row[x + half_width]));
            lh[0].set(x, y, store(high_row[x]));
            hh[0].set(x, y, store(high_row[x + half_width]));
        }
    }
}

/// Run the full five-level decomposition for all components.
///
/// The inputs are the mirror-extended planes at aligned resolution
/// (half of it for 4:2:0 chroma). Level 0 and the 4:2:0 chroma entry level
/// consume them directly; every other level reads the previous level's LL.
pub fn forward_dwt(
    device: &Device,
    buffers: &mut WaveletBuffers,
    extended_inputs: &[Plane],
    scratch: &mut LiftScratch,
) {
    let chroma = buffers.config().chroma;

    for level in 0 .. DECOMPOSITION_LEVELS {
        for component in 0 .. NUM_COMPONENTS {
            if !buffers.component_has_level(component, level) { continue; }

            let store = buffers.storage_rounding(level);

            let consumes_input_plane = level == 0
                || (component != 0 && level == 1 && chroma == ChromaSubsampling::Chroma420);

            if consumes_input_plane {
                let input = &extended_inputs[component];
                let bands = buffers.level_bands_mut(component, level);
                forward_level(device, input, bands, store, scratch);
            }
            else {
                let (previous_ll, bands) = buffers.forward_level_io(component, level);
                forward_level(device, previous_ll, bands, store, scratch);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buffers::BandRef;
    use crate::config::CodecConfig;

    #[test]
    fn mirror_extension(){
        let mut source = Plane::new(3, 2);
        for y in 0 .. 2 {
            for x in 0 .. 3 {
                source.set(x, y, (y * 3 + x) as f32);
            }
        }

        let mut extended = Plane::new(6, 4);
        mirror_extend(&source, &mut extended);

        // left to right: 0 1 2 | 2 1 0
        assert_eq!(extended.row(0), &[ 0.0, 1.0, 2.0, 2.0, 1.0, 0.0 ]);

        // top to bottom at x=1: 1 4 | 4 1
        assert_eq!(extended.get(1, 2), 4.0);
        assert_eq!(extended.get(1, 3), 1.0);
    }

    #[test]
    fn zero_input_decomposes_to_zero(){
        let device = Device::software().unwrap();
        let config = CodecConfig::new(128, 128, ChromaSubsampling::Chroma444);
        let mut buffers = WaveletBuffers::new(config).unwrap();

        let inputs: Vec<Plane> = (0 .. 3).map(|_| Plane::new(128, 128)).collect();
        let mut scratch = LiftScratch::new(128, 128);
        forward_dwt(&device, &mut buffers, &inputs, &mut scratch);

        for &band in buffers.coded_bands() {
            let plane = buffers.plane(band);
            assert!(
                plane.samples().iter().all(|&value| value == 0.0),
                "zero input must decompose to zero coefficients in {:?}", band
            );
        }
    }

    #[test]
    fn detail_bands_of_smooth_content_are_small(){
        let device = Device::software().unwrap();
        let config = CodecConfig::new(128, 128, ChromaSubsampling::Chroma444);
        let mut buffers = WaveletBuffers::new(config).unwrap();

        // slow horizontal ramp
        let mut inputs: Vec<Plane> = (0 .. 3).map(|_| Plane::new(128, 128)).collect();
        for y in 0 .. 128 {
            for x in 0 .. 128 {
                inputs[0].set(x, y, x as f32 / 512.0);
            }
        }

        let mut scratch = LiftScratch::new(128, 128);
        forward_dwt(&device, &mut buffers, &inputs, &mut scratch);

        // vertical detail of a horizontal ramp is zero away from mirror seams
        let lh = buffers.plane(BandRef { component: 0, level: 0, band: 2 });
        let max_detail = lh.samples().iter().fold(0.0_f32, |max, &v| max.max(v.abs()));
        assert!(max_detail < 1e-3, "vertical detail too large: {}", max_detail);
    }
}
