// Pixel-wise softmax shared by the costs and by prediction. Every pixel of a
// [sy, sx, n_class] map is an independent classifier over its depth column:
// exponentiate and normalize so the column sums to 1.

use crate::{vol::Vol, Float};

/// Softmax of one depth column, computed carefully to not blow up.
pub fn softmax_into(logits: &[Float], out: &mut [Float]) {
    let amax = logits.iter().copied().fold(Float::NEG_INFINITY, Float::max);

    let mut esum = 0.0;
    for (e, a) in out.iter_mut().zip(logits) {
        *e = (a - amax).exp();
        esum += *e;
    }

    for e in out.iter_mut() {
        *e /= esum;
    }
}

/// `log(softmax(logits))` without ever taking the log of zero.
pub fn log_softmax_into(logits: &[Float], out: &mut [Float]) {
    let amax = logits.iter().copied().fold(Float::NEG_INFINITY, Float::max);
    let log_sum = logits
        .iter()
        .map(|a| (a - amax).exp())
        .sum::<Float>()
        .ln();

    for (o, a) in out.iter_mut().zip(logits) {
        *o = a - amax - log_sum;
    }
}

pub struct PixelSoftmax;

impl PixelSoftmax {
    pub fn forward(logits: &Vol, probs: &mut Vol) {
        probs.ensure_shape(logits.shape());

        let depth = logits.depth().max(1);
        for (column, out) in logits.w.chunks(depth).zip(probs.w.chunks_mut(depth)) {
            softmax_into(column, out);
        }
    }

    /// Turns the gradient wrt the probabilities (`probs.dw`) into the gradient
    /// wrt the logits, overwriting `logits.dw`:
    /// dz_k = p_k * (dp_k - sum_c p_c dp_c)
    pub fn backward(logits: &mut Vol, probs: &Vol) {
        let depth = probs.depth().max(1);
        for ((dz, p), dp) in logits
            .dw
            .chunks_mut(depth)
            .zip(probs.w.chunks(depth))
            .zip(probs.dw.chunks(depth))
        {
            let dot: Float = p.iter().zip(dp).map(|(p, g)| p * g).sum();
            for k in 0..dz.len() {
                dz[k] = p[k] * (dp[k] - dot);
            }
        }
    }
}
