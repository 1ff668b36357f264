
//! The inverse transform: five levels of band images
//! are folded back into the three component planes.

use crate::buffers::{Plane, WaveletBuffers, DECOMPOSITION_LEVELS, NUM_COMPONENTS};
use crate::config::ChromaSubsampling;
use crate::device::Device;

use super::{inverse_lift_line, LiftScratch};

use rayon::prelude::*;

/// Recombine the four bands of one level into the plane of the next finer
/// level. The output plane must have exactly twice the band resolution.
pub(crate) fn inverse_level(
    device: &Device,
    bands: &[Plane],
    output: &mut Plane,
    store: fn(f32) -> f32,
    scratch: &mut LiftScratch,
) {
    let (full_width, full_height) = (output.width(), output.height());
    let (half_width, half_height) = (full_width / 2, full_height / 2);
    debug_assert!(bands.iter().all(|band|
        band.width() == half_width && band.height() == half_height));

    let work = &mut scratch.work[.. full_width * full_height];

    // place the four bands back into their quadrants
    for y in 0 .. half_height {
        let (low_rows, high_rows) = work.split_at_mut(half_height * full_width);
        let low_row = &mut low_rows[y * full_width ..][.. full_width];
        let high_row = &mut high_rows[y * full_width ..][.. full_width];

        for x in 0 .. half_width {
            low_row[x] = bands[0].get(x, y);
            low_row[x + half_width] = bands[1].get(x, y);
            high_row[x] = bands[2].get(x, y);
            high_row[x + half_width] = bands[3].get(x, y);
        }
    }

    // vertical pass along strided columns
    for x in 0 .. full_width {
        let column = &mut scratch.column[.. full_height];
        for y in 0 .. full_height {
            column[y] = work[y * full_width + x];
        }

        inverse_lift_line(column, &mut scratch.split);

        for y in 0 .. full_height {
            work[y * full_width + x] = column[y];
        }
    }

    // horizontal pass, one worker per row
    device.dispatch(|| {
        work.par_chunks_mut(full_width).for_each_init(
            || vec![0.0; full_width],
            |split, row| inverse_lift_line(row, split),
        );
    });

    for y in 0 .. full_height {
        let row = &work[y * full_width ..][.. full_width];
        for x in 0 .. full_width {
            output.set(x, y, store(row[x]));
        }
    }
}

/// Walk the levels from coarse to fine, recombining bands into each finer
/// LL. At level 0 (level 1 for 4:2:0 chroma) the result lands in the
/// caller-supplied reconstruction planes at aligned resolution.
pub fn inverse_dwt(
    device: &Device,
    buffers: &mut WaveletBuffers,
    reconstructions: &mut [Plane],
    scratch: &mut LiftScratch,
) {
    let chroma = buffers.config().chroma;

    for level in (0 .. DECOMPOSITION_LEVELS).rev() {
        for component in 0 .. NUM_COMPONENTS {
            if !buffers.component_has_level(component, level) { continue; }

            let produces_output_plane = level == 0
                || (component != 0 && level == 1 && chroma == ChromaSubsampling::Chroma420);

            if produces_output_plane {
                let output = &mut reconstructions[component];
                let bands = buffers.level_bands_mut(component, level);
                inverse_level(device, bands, output, |value| value, scratch);
            }
            else {
                let store = buffers.storage_rounding(level - 1);
                let (previous_ll, bands) = buffers.inverse_level_io(component, level);
                inverse_level(device, bands, previous_ll, store, scratch);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transform::forward::{forward_dwt, mirror_extend};
    use crate::config::CodecConfig;

    /// With no quantization in between, analysis followed by synthesis
    /// must reproduce the input up to float rounding.
    #[test]
    fn roundtrip_without_quantization(){
        let device = Device::software().unwrap();
        let mut config = CodecConfig::new(160, 128, ChromaSubsampling::Chroma444);
        config.precision = crate::config::Precision::Fp32;

        let mut buffers = WaveletBuffers::new(config).unwrap();
        let (aligned_width, aligned_height) = (buffers.aligned_width(), buffers.aligned_height());

        let mut source = Plane::new(160, 128);
        for y in 0 .. 128 {
            for x in 0 .. 160 {
                let value = ((x * 31 + y * 17) % 255) as f32 / 255.0 - 0.5;
                source.set(x, y, value);
            }
        }

        let mut extended = vec![
            Plane::new(aligned_width, aligned_height),
            Plane::new(aligned_width, aligned_height),
            Plane::new(aligned_width, aligned_height),
        ];
        mirror_extend(&source, &mut extended[0]);

        let mut scratch = LiftScratch::new(aligned_width, aligned_height);
        forward_dwt(&device, &mut buffers, &extended, &mut scratch);

        let mut restored = vec![
            Plane::new(aligned_width, aligned_height),
            Plane::new(aligned_width, aligned_height),
            Plane::new(aligned_width, aligned_height),
        ];
        inverse_dwt(&device, &mut buffers, &mut restored, &mut scratch);

        let mut worst = 0.0_f32;
        for y in 0 .. 128 {
            for x in 0 .. 160 {
                worst = worst.max((restored[0].get(x, y) - source.get(x, y)).abs());
            }
        }

        assert!(worst < 1e-4, "synthesis deviates from input by {}", worst);
    }
}
