
//! Quantizer step encoding and the psychovisual quantization model.
//!
//! Each band gets a base step from a noise-power-normalized resolution
//! model; rate control later deepens individual blocks by dropping
//! significance planes. The rate-distortion weighting follows the
//! Mannos-Sakrison contrast sensitivity function.

use crate::buffers::{BandRef, DECOMPOSITION_LEVELS};
use crate::config::CodecConfig;

/// Largest exponent a quant code can carry.
pub const MAX_QUANT_EXPONENT: u32 = 20;

/// Most significance planes a quantized magnitude can occupy.
/// The band quantizers are chosen such that this is never reached
/// for inputs in the nominal sample range.
pub const MAX_SIGNIFICANCE_PLANES: u32 = 15;

/// Decode a quant code `(e << 3) | m` into its step size
/// `(8 + m) * 2^(20 - e) / 2^23`, a custom float formulation
/// for steps in the `(0, 2)` range.
#[inline]
pub fn decode_quant(code: u8) -> f32 {
    let exponent = (u32::from(code) >> 3).min(MAX_QUANT_EXPONENT);
    let mantissa = u32::from(code) & 0x7;

    ((8 + mantissa) << (MAX_QUANT_EXPONENT - exponent)) as f32 / ((1_u32 << 23) as f32)
}

/// Encode a step size into a quant code, rounding the reconstructed
/// step down so it never exceeds the requested step.
#[inline]
pub fn encode_quant(step: f32) -> u8 {
    debug_assert!(step > 0.0 && step < 2.0, "quant step {} out of range", step);

    let bits = step.to_bits();
    let exponent = ((bits >> 23) & 0xff) as i32 - 127;
    let mantissa = (bits >> 20) & 0x7;

    let exponent = (-exponent).clamp(0, MAX_QUANT_EXPONENT as i32) as u32;
    ((exponent << 3) | mantissa) as u8
}

/// Whether a quant code can appear in a valid bitstream.
#[inline]
pub fn quant_code_is_valid(code: u8) -> bool {
    u32::from(code) >> 3 <= MAX_QUANT_EXPONENT
}

/// The initial quantization resolution aims for a flat spectrum with noise
/// power normalization. The low-pass gain of CDF 9/7 is 6 dB (one bit), so
/// every decomposition level adds a bit; chroma starts one level late and
/// gives one back.
pub fn noise_power_normalized_resolution(band: BandRef) -> f32 {
    let mut bits = 6;

    if band.band == 0 { bits += 2; }
    else if band.band < 3 { bits += 1; }

    bits += band.level as i32;

    if band.component != 0 { bits -= 1; }

    (1_u32 << bits) as f32
}

/// The quantization resolution actually used for a band.
/// Half-float range is limited, so the resolution is capped at 512.
pub fn quant_resolution(band: BandRef) -> f32 {
    noise_power_normalized_resolution(band).min(512.0)
}

/// The wire code of a band's base quantizer.
pub fn band_quant_code(band: BandRef) -> u8 {
    encode_quant(1.0 / quant_resolution(band))
}

/// The effective base step of a band, after the code round trip.
pub fn band_step(band: BandRef) -> f32 {
    decode_quant(band_quant_code(band))
}

/// The quant-scale exponent carried per fine block in its `q_byte`.
/// Band resolutions are powers of two, so this always fits a nibble.
pub fn band_quant_exponent(band: BandRef) -> u8 {
    let code = band_quant_code(band);
    debug_assert_eq!(code & 0x7, 0, "band steps are exact powers of two");
    code >> 3
}

/// The per-band weight that converts squared coefficient error into the
/// psychovisual distortion the rate-distortion solver minimizes.
///
/// Distortion in lower frequency bands results in more noise power after
/// synthesis filtering; scaling by the normalized resolution keeps the
/// result uniform across bands. The weight scales power, not amplitude.
pub fn rdo_distortion_scale(config: &CodecConfig, band: BandRef) -> f32 {
    let horizontal_midpoint: f32 = if band.band & 1 != 0 { 0.75 } else { 0.25 };
    let vertical_midpoint: f32 = if band.band & 2 != 0 { 0.75 } else { 0.25 };

    let cpd_nyquist = 0.34 * config.viewing_distance * config.dpi;

    let normalized_frequency =
        (horizontal_midpoint * horizontal_midpoint + vertical_midpoint * vertical_midpoint).sqrt();

    // don't allow a situation where the LL band is quantized hard
    let cpd = (normalized_frequency * cpd_nyquist * (-(band.level as f32)).exp2()).max(8.0);

    let mut csf = 2.6 * (0.0192 + 0.114 * cpd) * (-(0.114 * cpd).powf(1.1)).exp();

    // heavily discount chroma quality
    if band.component != 0 && band.level != DECOMPOSITION_LEVELS - 1 {
        csf *= 0.4;
    }

    let weighted_resolution = csf * noise_power_normalized_resolution(band);
    weighted_resolution * weighted_resolution
}

/// Quantize a coefficient against a step, yielding magnitude and sign.
/// The magnitude saturates at what the significance planes can hold.
#[inline]
pub(crate) fn quantize(coefficient: f32, inverse_step: f32) -> (u32, bool) {
    let scaled = coefficient * inverse_step;
    let magnitude = (scaled.abs() + 0.5) as u32;
    (magnitude.min((1 << MAX_SIGNIFICANCE_PLANES) - 1), scaled < 0.0)
}

/// Reconstruct a magnitude whose `plane_drop` least significant planes were
/// dropped, placing the result in the middle of the dropped interval.
#[inline]
pub(crate) fn reconstruct_magnitude(kept: u32, plane_drop: u32) -> u32 {
    if kept == 0 {
        0
    }
    else if plane_drop == 0 {
        kept
    }
    else {
        (kept << plane_drop) + (1 << (plane_drop - 1))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn code_roundtrip(){
        for code in 0 .. 64_u8 {
            let step = decode_quant(code);
            assert!(step > 0.0 && step < 2.0);
            assert_eq!(encode_quant(step), code, "code {} did not roundtrip", code);
        }

        // the full exponent range decodes monotonically within an exponent
        for code in 0 .. 8 * (MAX_QUANT_EXPONENT as u8 + 1) {
            assert!(quant_code_is_valid(code));
            let step = decode_quant(code);
            assert_eq!(encode_quant(step), code);
        }

        assert!(!quant_code_is_valid(0xff));
    }

    #[test]
    fn encoding_never_overshoots(){
        for requested in [ 1.9_f32, 1.0, 0.7, 0.1, 1.0 / 64.0, 1.0 / 300.0, 1.0 / 512.0, 0.00001 ] {
            let reconstructed = decode_quant(encode_quant(requested));
            assert!(
                reconstructed <= requested,
                "reconstructed step {} exceeds requested {}", reconstructed, requested
            );
        }
    }

    #[test]
    fn band_resolutions(){
        let band = |component, level, band| BandRef { component, level, band };

        // the finest luma HH band has the baseline six bits
        assert_eq!(quant_resolution(band(0, 0, 3)), 64.0);

        // LL gains two bits, one per level, capped at 512 for half floats
        assert_eq!(noise_power_normalized_resolution(band(0, 4, 0)), 4096.0);
        assert_eq!(quant_resolution(band(0, 4, 0)), 512.0);

        // chroma gives one bit back
        assert_eq!(quant_resolution(band(1, 1, 3)), 64.0);

        // steps are exact reciprocals of the resolution
        assert_eq!(band_step(band(0, 0, 3)), 1.0 / 64.0);
        assert_eq!(band_step(band(0, 4, 0)), 1.0 / 512.0);

        // the exponent always fits the q_byte nibble
        for component in 0 .. 3 {
            for level in 0 .. DECOMPOSITION_LEVELS {
                for band_index in 0 .. 4 {
                    let exponent = band_quant_exponent(band(component, level, band_index));
                    assert!(exponent <= 0xf, "exponent {} does not fit a nibble", exponent);
                }
            }
        }
    }

    #[test]
    fn distortion_weights(){
        let config = CodecConfig::new(1920, 1080, crate::config::ChromaSubsampling::Chroma420);
        let band = |component, level, band| BandRef { component, level, band };

        // all weights are positive and finite
        for level in 0 .. DECOMPOSITION_LEVELS {
            for band_index in 0 .. 4 {
                let weight = rdo_distortion_scale(&config, band(0, level, band_index));
                assert!(weight.is_finite() && weight > 0.0);
            }
        }

        // chroma is discounted except at the coarsest level
        let luma = rdo_distortion_scale(&config, band(0, 2, 3));
        let chroma = rdo_distortion_scale(&config, band(1, 2, 3));
        assert!(chroma < luma);

        let luma_top = rdo_distortion_scale(&config, band(0, 4, 3));
        let chroma_top = rdo_distortion_scale(&config, band(1, 4, 3));
        let undiscounted_ratio = chroma_top / luma_top;
        assert!((undiscounted_ratio - 0.25).abs() < 0.01); // only the resolution bit differs
    }

    #[test]
    fn magnitude_reconstruction(){
        assert_eq!(reconstruct_magnitude(0, 0), 0);
        assert_eq!(reconstruct_magnitude(0, 5), 0);
        assert_eq!(reconstruct_magnitude(7, 0), 7);
        assert_eq!(reconstruct_magnitude(1, 1), 2 + 1);
        assert_eq!(reconstruct_magnitude(3, 2), 12 + 2);

        let (magnitude, negative) = quantize(-0.5, 64.0);
        assert_eq!(magnitude, 32);
        assert!(negative);

        let (magnitude, negative) = quantize(0.026, 64.0);
        assert_eq!(magnitude, 2);
        assert!(!negative);
    }
}
