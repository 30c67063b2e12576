use crate::{utils::argmax, vol::Vol, Float};

/// Fraction of pixels whose most likely class matches the label's.
pub fn accuracy(probs: &Vol, labels: &Vol) -> Float {
    let depth = probs.depth().max(1);
    let mut pixels = 0usize;
    let mut correct = 0usize;
    for (p, y) in probs.w.chunks(depth).zip(labels.w.chunks(depth)) {
        pixels += 1;
        if argmax(p) == argmax(y) {
            correct += 1;
        }
    }

    if pixels == 0 {
        return 0.0;
    }
    correct as Float / pixels as Float
}

/// Percentage of misclassified pixels.
pub fn error_rate(probs: &Vol, labels: &Vol) -> Float {
    error_rate_from_accuracy(accuracy(probs, labels))
}

pub fn error_rate_from_accuracy(accuracy: Float) -> Float {
    100.0 - 100.0 * accuracy
}

/// -mean(y * log(clip(p, 1e-10, 1))) over every pixel and class.
pub fn cross_entropy(probs: &Vol, labels: &Vol) -> Float {
    if probs.w.is_empty() {
        return 0.0;
    }

    let total: Float = probs
        .w
        .iter()
        .zip(&labels.w)
        .map(|(p, y)| y * p.clamp(1e-10, 1.0).ln())
        .sum();
    -total / probs.w.len() as Float
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accuracy_and_error_rate() {
        let probs = Vol::from_data(4, 1, 2, vec![0.9, 0.1, 0.2, 0.8, 0.6, 0.4, 0.3, 0.7]).unwrap();
        let labels = Vol::from_data(4, 1, 2, vec![1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0]).unwrap();
        assert!((accuracy(&probs, &labels) - 0.75).abs() < 1e-6);
        assert!((error_rate(&probs, &labels) - 25.0).abs() < 1e-4);
    }

    #[test]
    fn cross_entropy_clips_zero_probabilities() {
        let probs = Vol::from_data(1, 1, 2, vec![0.0, 1.0]).unwrap();
        let labels = Vol::from_data(1, 1, 2, vec![1.0, 0.0]).unwrap();
        let ce = cross_entropy(&probs, &labels);
        assert!(ce.is_finite());
        assert!((ce - (1e-10 as Float).ln().abs() / 2.0).abs() < 1e-3);
    }
}
