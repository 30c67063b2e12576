use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::Float;

/// Seeded generator when a seed is given, otherwise one drawn from entropy.
pub fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Draws from a normal distribution, resampling anything further than two
/// standard deviations from the mean.
pub fn truncated_normal<R: Rng + ?Sized>(rng: &mut R, mean: Float, std: Float) -> Float {
    let Ok(normal) = Normal::new(mean, std) else {
        return mean;
    };

    loop {
        let value = normal.sample(rng);
        if (value - mean).abs() <= 2.0 * std {
            return value;
        }
    }
}

pub fn zeros(n: usize) -> Vec<Float> {
    vec![0.0; n]
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinMax {
    pub min_value: Float,
    pub min_index: usize,
    pub max_value: Float,
    pub max_index: usize,
    pub diff_value: Float,
}

// return max and min of a given non-empty array.
pub fn maxmin(values: &[Float]) -> Option<MinMax> {
    if values.is_empty() {
        return None;
    }

    let mut maxv = values[0];
    let mut minv = values[0];
    let mut maxi = 0;
    let mut mini = 0;
    for (i, value) in values.iter().copied().enumerate() {
        if value > maxv {
            maxv = value;
            maxi = i;
        }
        if value < minv {
            minv = value;
            mini = i;
        }
    }
    Some(MinMax {
        min_value: minv,
        min_index: mini,
        max_value: maxv,
        max_index: maxi,
        diff_value: maxv - minv,
    })
}

/// Index of the first maximum, 0 for an empty slice.
pub fn argmax(values: &[Float]) -> usize {
    maxmin(values).map(|m| m.max_index).unwrap_or(0)
}

pub fn l2_norm(values: &[Float]) -> Float {
    values.iter().map(|v| v * v).sum::<Float>().sqrt()
}
