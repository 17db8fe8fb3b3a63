//! Decimation accumulator: running min/max/mean/std over a window of samples.
//!
//! The variance arithmetic (`compute_std`) clamps a theoretically-zero
//! variance that floating point rounding can drive slightly negative before
//! taking the square root.

use crate::wide::WideAccumulator;

/// One (x, y) sample: a signed 32-bit pair, one per monitored device.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct Sample {
    pub x: i32,
    pub y: i32,
}

impl Sample {
    pub fn new(x: i32, y: i32) -> Self {
        Sample { x, y }
    }
}

/// `(min, max, mean, std)` for both channels of one decimation window.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DecimatedSample {
    pub min: Sample,
    pub max: Sample,
    pub mean: Sample,
    pub std: Sample,
}

#[derive(Clone, Copy, Debug)]
pub struct DecimationAccumulator {
    min_x: i32,
    max_x: i32,
    min_y: i32,
    max_y: i32,
    sum_x: i64,
    sum_y: i64,
    sum_sq_x: WideAccumulator,
    sum_sq_y: WideAccumulator,
}

impl Default for DecimationAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl DecimationAccumulator {
    pub fn new() -> Self {
        DecimationAccumulator {
            min_x: i32::max_value(),
            max_x: i32::min_value(),
            min_y: i32::max_value(),
            max_y: i32::min_value(),
            sum_x: 0,
            sum_y: 0,
            sum_sq_x: WideAccumulator::new(),
            sum_sq_y: WideAccumulator::new(),
        }
    }

    pub fn accum(&mut self, sample: Sample) {
        let Sample { x, y } = sample;
        if x < self.min_x {
            self.min_x = x;
        }
        if x > self.max_x {
            self.max_x = x;
        }
        if y < self.min_y {
            self.min_y = y;
        }
        if y > self.max_y {
            self.max_y = y;
        }
        self.sum_x += i64::from(x);
        self.sum_y += i64::from(y);
        self.sum_sq_x.add_u64((i64::from(x) * i64::from(x)) as u64);
        self.sum_sq_y.add_u64((i64::from(y) * i64::from(y)) as u64);
    }

    /// Folds `other` into `self`, as the transform folds D1 partial results
    /// into the long-lived D2 accumulator.
    pub fn merge(&mut self, other: &DecimationAccumulator) {
        if other.min_x < self.min_x {
            self.min_x = other.min_x;
        }
        if other.max_x > self.max_x {
            self.max_x = other.max_x;
        }
        if other.min_y < self.min_y {
            self.min_y = other.min_y;
        }
        if other.max_y > self.max_y {
            self.max_y = other.max_y;
        }
        self.sum_x += other.sum_x;
        self.sum_y += other.sum_y;
        self.sum_sq_x.add_u128(other.sum_sq_x);
        self.sum_sq_y.add_u128(other.sum_sq_y);
    }

    /// Combines two accumulators without mutating either, for property tests
    /// that want `merge` as a pure binary operation.
    pub fn merged(mut self, other: &DecimationAccumulator) -> Self {
        self.merge(other);
        self
    }

    /// Writes extrema/mean/std into `out`, dividing sums by `2^log2_n`.
    pub fn finalize(&self, log2_n: u32, out: &mut DecimatedSample) {
        out.min = Sample::new(self.min_x, self.min_y);
        out.max = Sample::new(self.max_x, self.max_y);
        out.mean = Sample::new(
            (self.sum_x >> log2_n) as i32,
            (self.sum_y >> log2_n) as i32,
        );
        out.std = Sample::new(
            compute_std(self.sum_sq_x, self.sum_x, log2_n),
            compute_std(self.sum_sq_y, self.sum_y, log2_n),
        );
    }
}

/// `var = (sum_sq >> shift) - mean^2`, clamped to zero before the square
/// root: rounding error can otherwise leave a theoretically-zero variance
/// slightly negative.
fn compute_std(sum_sq: WideAccumulator, sum: i64, shift: u32) -> i32 {
    let mean = sum as f64 / f64::from(1u32 << shift);
    let var = sum_sq.shr_to_u64(shift) as f64 - mean * mean;
    if var > 0.0 {
        var.sqrt() as i32
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decimates_worked_example() {
        // S2: column [1,2,3,4,5,6,7,8], D1=3 (8 samples -> 1 window).
        let mut acc = DecimationAccumulator::new();
        for v in 1..=8 {
            acc.accum(Sample::new(v, v));
        }
        let mut out = DecimatedSample::default();
        acc.finalize(3, &mut out);
        assert_eq!(out.min.x, 1);
        assert_eq!(out.max.x, 8);
        assert_eq!(out.mean.x, 4);
        assert_eq!(out.std.x, 2);
    }

    #[test]
    fn merge_matches_accumulating_both_directly() {
        let mut a = DecimationAccumulator::new();
        a.accum(Sample::new(1, -1));
        a.accum(Sample::new(2, -2));

        let mut b = DecimationAccumulator::new();
        b.accum(Sample::new(3, -3));
        b.accum(Sample::new(4, -4));

        let merged = a.merged(&b);

        let mut direct = DecimationAccumulator::new();
        for v in &[1, 2, 3, 4] {
            direct.accum(Sample::new(*v, -*v));
        }

        let mut out_merged = DecimatedSample::default();
        merged.finalize(2, &mut out_merged);
        let mut out_direct = DecimatedSample::default();
        direct.finalize(2, &mut out_direct);

        assert_eq!(out_merged, out_direct);
    }

    #[test]
    fn std_is_never_negative_and_clamps_near_zero_variance() {
        let mut acc = DecimationAccumulator::new();
        // Constant signal: true variance is exactly zero, but floating point
        // rounding in the sum-of-squares formulation can nudge it negative.
        for _ in 0..1024 {
            acc.accum(Sample::new(1000, -1000));
        }
        let mut out = DecimatedSample::default();
        acc.finalize(10, &mut out);
        assert_eq!(out.std.x, 0);
        assert_eq!(out.std.y, 0);
    }

    #[test]
    fn std_tracks_true_variance_for_random_populations() {
        use rand::Rng;

        // I-3: for populations of up to 2^20 signed 32-bit samples, finalize
        // must produce a non-negative std within 2^-20 relative error of the
        // true variance. Exercise that across several random populations
        // rather than one hand-picked one.
        let mut rng = rand::thread_rng();
        for n_log2 in 4..=14u32 {
            let n = 1usize << n_log2;
            let values: Vec<i64> = (0..n).map(|_| i64::from(rng.gen_range(-10_000, 10_000))).collect();

            let mut acc = DecimationAccumulator::new();
            for &v in &values {
                acc.accum(Sample::new(v as i32, 0));
            }

            let mean = values.iter().sum::<i64>() as f64 / n as f64;
            let true_var = values
                .iter()
                .map(|&v| (v as f64 - mean) * (v as f64 - mean))
                .sum::<f64>()
                / n as f64;

            let mut out = DecimatedSample::default();
            acc.finalize(n_log2, &mut out);
            assert!(out.std.x >= 0);

            if true_var > 0.0 {
                let measured = f64::from(out.std.x) * f64::from(out.std.x);
                let relative_error = (measured - true_var).abs() / true_var;
                assert!(
                    relative_error < 1.0 / f64::from(1u32 << 20),
                    "n_log2={}: relative error {} too large",
                    n_log2,
                    relative_error
                );
            }
        }
    }

    #[test]
    fn std_tracks_true_variance_within_tolerance() {
        let mut acc = DecimationAccumulator::new();
        let n_log2 = 10u32;
        let n = 1u32 << n_log2;
        let values: Vec<i64> = (0..n as i64).map(|i| i - i64::from(n / 2)).collect();
        for &v in &values {
            acc.accum(Sample::new(v as i32, 0));
        }
        let mean = values.iter().sum::<i64>() as f64 / f64::from(n);
        let true_var = values
            .iter()
            .map(|&v| (v as f64 - mean) * (v as f64 - mean))
            .sum::<f64>()
            / f64::from(n);

        let mut out = DecimatedSample::default();
        acc.finalize(n_log2, &mut out);
        let measured = f64::from(out.std.x) * f64::from(out.std.x);
        assert!((measured - true_var).abs() / true_var < f64::from(1u32) / f64::from(1u32 << 10));
    }
}
