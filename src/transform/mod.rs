
//! The Cohen-Daubechies-Feauveau 9/7 wavelet transform,
//! implemented as the classic four-step lifting scheme:
//! predict, update, predict, update, then scaling.
//!
//! Boundaries use whole-sample symmetric extension, which preserves the
//! even/odd parity of the signal and therefore inverts exactly.

pub mod forward;
pub mod inverse;

pub(crate) const ALPHA: f32 = -1.586_134_342_059_924;
pub(crate) const BETA: f32 = -0.052_980_118_572_961;
pub(crate) const GAMMA: f32 = 0.882_911_075_530_934;
pub(crate) const DELTA: f32 = 0.443_506_852_043_971;

/// Scale factor of the low-pass half. The high-pass half scales by its inverse.
pub(crate) const K: f32 = 1.230_174_104_914_001;
pub(crate) const INV_K: f32 = 1.0 / K;

/// Scratch buffers for the lifting passes,
/// allocated once per session and reused every frame.
#[derive(Debug)]
pub struct LiftScratch {
    pub(crate) work: Vec<f32>,
    pub(crate) column: Vec<f32>,
    pub(crate) split: Vec<f32>,
}

impl LiftScratch {

    /// Allocate scratch for planes up to the given size.
    pub fn new(max_width: usize, max_height: usize) -> Self {
        let max_line = max_width.max(max_height);

        LiftScratch {
            work: vec![0.0; max_width * max_height],
            column: vec![0.0; max_line],
            split: vec![0.0; max_line],
        }
    }
}

/// Symmetric extension of a low-pass (even sample) index.
#[inline]
fn reflect_low(index: usize, half: usize) -> usize {
    if index >= half { 2 * half - 1 - index } else { index }
}

/// Symmetric extension of a high-pass (odd sample) index,
/// where the incoming index may be one below zero.
#[inline]
fn reflect_high_below(index: usize) -> usize {
    // called with i, meaning i - 1: zero reflects onto d[0]
    index.max(1) - 1
}

/// Forward-lift one interleaved line of even length into `[low | high]` halves.
/// `split` must be at least as long as the line.
pub(crate) fn forward_lift_line(line: &mut [f32], split: &mut [f32]) {
    let length = line.len();
    debug_assert!(length >= 4 && length % 2 == 0, "lines must have even length");

    let half = length / 2;
    let (low, high) = split[.. length].split_at_mut(half);

    for index in 0 .. half {
        low[index] = line[2 * index];
        high[index] = line[2 * index + 1];
    }

    for index in 0 .. half {
        high[index] += ALPHA * (low[index] + low[reflect_low(index + 1, half)]);
    }

    for index in 0 .. half {
        low[index] += BETA * (high[reflect_high_below(index)] + high[index]);
    }

    for index in 0 .. half {
        high[index] += GAMMA * (low[index] + low[reflect_low(index + 1, half)]);
    }

    for index in 0 .. half {
        low[index] += DELTA * (high[reflect_high_below(index)] + high[index]);
    }

    for index in 0 .. half {
        low[index] *= K;
        high[index] *= INV_K;
    }

    line.copy_from_slice(&split[.. length]);
}

/// Exactly undo [`forward_lift_line`]: takes `[low | high]` halves,
/// leaves the interleaved line. `split` must be at least as long as the line.
pub(crate) fn inverse_lift_line(line: &mut [f32], split: &mut [f32]) {
    let length = line.len();
    debug_assert!(length >= 4 && length % 2 == 0, "lines must have even length");

    let half = length / 2;
    let (low, high) = line.split_at_mut(half);

    for index in 0 .. half {
        low[index] *= INV_K;
        high[index] *= K;
    }

    for index in 0 .. half {
        low[index] -= DELTA * (high[reflect_high_below(index)] + high[index]);
    }

    for index in 0 .. half {
        high[index] -= GAMMA * (low[index] + low[reflect_low(index + 1, half)]);
    }

    for index in 0 .. half {
        low[index] -= BETA * (high[reflect_high_below(index)] + high[index]);
    }

    for index in 0 .. half {
        high[index] -= ALPHA * (low[index] + low[reflect_low(index + 1, half)]);
    }

    for index in 0 .. half {
        split[2 * index] = low[index];
        split[2 * index + 1] = high[index];
    }

    line.copy_from_slice(&split[.. length]);
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip_line(samples: &[f32]) {
        let mut line = samples.to_vec();
        let mut split = vec![0.0; line.len()];

        forward_lift_line(&mut line, &mut split);
        inverse_lift_line(&mut line, &mut split);

        for (original, restored) in samples.iter().zip(&line) {
            assert!(
                (original - restored).abs() < 1e-4,
                "lifting roundtrip failed: {} became {}", original, restored
            );
        }
    }

    #[test]
    fn roundtrip_small_lines(){
        roundtrip_line(&[ 1.0, 2.0, 3.0, 4.0 ]);
        roundtrip_line(&[ 0.5, -0.5, 0.25, -0.125, 0.0, 0.375, -0.25, 0.125 ]);

        let ramp: Vec<f32> = (0 .. 64).map(|index| index as f32 / 64.0 - 0.5).collect();
        roundtrip_line(&ramp);

        let noisy: Vec<f32> = (0 .. 128)
            .map(|index| ((index * 2654435761_usize) % 255) as f32 / 255.0 - 0.5)
            .collect();
        roundtrip_line(&noisy);
    }

    #[test]
    fn constant_signal_has_no_detail(){
        let mut line = vec![ 0.25; 32 ];
        let mut split = vec![0.0; 32];
        forward_lift_line(&mut line, &mut split);

        let (low, high) = line.split_at(16);

        // the high-pass filter sums to zero, the low-pass gains K twice
        for &detail in high {
            assert!(detail.abs() < 1e-6, "detail of a constant should vanish, got {}", detail);
        }

        for &smooth in low {
            assert!((smooth - 0.25 * K * K).abs() < 1e-5, "unexpected low-pass gain: {}", smooth);
        }
    }

    #[test]
    fn zero_stays_zero(){
        let mut line = vec![ 0.0; 16 ];
        let mut split = vec![0.0; 16];

        forward_lift_line(&mut line, &mut split);
        assert!(line.iter().all(|&sample| sample == 0.0));

        inverse_lift_line(&mut line, &mut split);
        assert!(line.iter().all(|&sample| sample == 0.0));
    }
}
