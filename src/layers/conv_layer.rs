//! Valid (unpadded) convolution with stride one, the workhorse of both the
//! contracting and the expanding path. Dropout is applied to the raw
//! convolution output, before the bias is added.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    vol::{Shape, Vol},
    Float,
};

use super::{filter_details, LayerDetails, NetLayer};

pub struct ConvLayer {
    name: String,
    out_depth: usize,
    sx: usize,
    in_depth: usize,

    keep_prob: Float,
    dropout: bool,
    // scale applied to each output during the last training pass; 0 marks a dropped unit
    mask: Vec<Float>,
    masked: bool,
    rng: StdRng,

    filters: Vec<Vol>,
    biases: Vol,
}

impl ConvLayer {
    pub fn builder(
        name: impl Into<String>,
        filters: usize,
        sx: usize,
        in_depth: usize,
    ) -> ConvLayerBuilder {
        ConvLayerBuilder::new(name.into(), filters, sx, in_depth)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn out_depth(&self) -> usize {
        self.out_depth
    }

    /// Keep probability used on training passes. Ignored when dropout is off.
    pub fn set_keep_prob(&mut self, keep_prob: Float) {
        self.keep_prob = keep_prob;
    }
}

pub struct ConvLayerBuilder {
    name: String,
    out_depth: usize,
    sx: usize,
    in_depth: usize,

    std: Float,
    bias: Float,
    dropout: bool,
}

impl ConvLayerBuilder {
    fn new(name: String, filters: usize, sx: usize, in_depth: usize) -> Self {
        Self {
            // required
            name,
            out_depth: filters,
            sx,
            in_depth,

            // optional
            std: 0.1,
            bias: 0.1,
            dropout: false,
        }
    }

    /// standard deviation of the truncated normal used for the filters
    ///
    /// default: 0.1
    pub fn std(mut self, value: Float) -> Self {
        self.std = value;
        self
    }

    /// default: 0.1
    pub fn bias(mut self, value: Float) -> Self {
        self.bias = value;
        self
    }

    /// apply dropout to the convolution output on training passes
    ///
    /// default: false
    pub fn dropout(mut self, value: bool) -> Self {
        self.dropout = value;
        self
    }

    pub fn build(self, rng: &mut StdRng) -> ConvLayer {
        let filters = (0..self.out_depth)
            .map(|_| Vol::truncated_normal(self.sx, self.sx, self.in_depth, self.std, rng))
            .collect();
        ConvLayer {
            name: self.name,
            out_depth: self.out_depth,
            sx: self.sx,
            in_depth: self.in_depth,
            keep_prob: 1.0,
            dropout: self.dropout,
            mask: Vec::new(),
            masked: false,
            rng: StdRng::seed_from_u64(rng.gen()),
            filters,
            biases: Vol::with_constant(1, 1, self.out_depth, self.bias),
        }
    }
}

impl NetLayer for ConvLayer {
    fn forward(&mut self, in_act: &Vol, out_act: &mut Vol, is_training: bool) {
        debug_assert_eq!(in_act.depth(), self.in_depth, "{}: input depth", self.name);

        let shape = self.out_shape(in_act.shape());
        out_act.ensure_shape(shape);

        self.masked = is_training && self.dropout && self.keep_prob < 1.0;
        if self.masked {
            self.mask.resize(shape.len(), 0.0);
        }

        let v_sx = in_act.sx();
        let v_depth = in_act.depth();

        for d in 0..self.out_depth {
            let f = &self.filters[d];

            for ay in 0..shape.sy {
                for ax in 0..shape.sx {
                    // convolve with the window whose top-left corner is (ax, ay)
                    let mut a = 0.0;

                    for fy in 0..f.sy() {
                        for fx in 0..f.sx() {
                            let v_index = ((v_sx * (ay + fy)) + ax + fx) * v_depth;
                            let f_index = ((f.sx() * fy) + fx) * f.depth();

                            for fd in 0..f.depth() {
                                a += f.w[f_index + fd] * in_act.w[v_index + fd];
                            }
                        }
                    }

                    let n = ((shape.sx * ay) + ax) * self.out_depth + d;
                    if self.masked {
                        let scale = if self.rng.gen::<Float>() < self.keep_prob {
                            1.0 / self.keep_prob
                        } else {
                            0.0
                        };
                        self.mask[n] = scale;
                        a *= scale;
                    }

                    out_act.w[n] = a + self.biases.w[d];
                }
            }
        }
    }

    fn backward(&mut self, in_act: &mut Vol, out_act: &Vol) {
        let v = in_act;

        debug_assert_eq!(
            v.w.len(),
            v.dw.len(),
            "weight arrays should have the same length"
        );

        v.dw.fill(0.0); // zero out gradient wrt bottom data, we're about to fill it

        let v_sx = v.sx();
        let v_depth = v.depth();
        let out_sx = out_act.sx();

        for d in 0..self.out_depth {
            let f = &mut self.filters[d];

            for ay in 0..out_act.sy() {
                for ax in 0..out_sx {
                    let n = ((out_sx * ay) + ax) * self.out_depth + d;

                    // gradient from above, from chain rule
                    let chain_grad = out_act.dw[n];
                    self.biases.dw[d] += chain_grad;

                    let chain_grad = if self.masked {
                        chain_grad * self.mask[n]
                    } else {
                        chain_grad
                    };
                    if chain_grad == 0.0 {
                        continue;
                    }

                    for fy in 0..f.sy() {
                        for fx in 0..f.sx() {
                            let ix1 = ((v_sx * (ay + fy)) + ax + fx) * v_depth;
                            let ix2 = ((f.sx() * fy) + fx) * f.depth();

                            for fd in 0..f.depth() {
                                f.dw[ix2 + fd] += v.w[ix1 + fd] * chain_grad;
                                v.dw[ix1 + fd] += f.w[ix2 + fd] * chain_grad;
                            }
                        }
                    }
                }
            }
        }
    }

    fn params_and_grads(&mut self) -> Vec<LayerDetails<'_>> {
        filter_details(&self.name, &mut self.filters, &mut self.biases)
    }

    fn out_shape(&self, input: Shape) -> Shape {
        let valid = |size: usize| {
            if size >= self.sx {
                size - self.sx + 1
            } else {
                0
            }
        };
        Shape::new(valid(input.sx), valid(input.sy), self.out_depth)
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::utils::make_rng;

    fn random_vol(rng: &mut StdRng, sx: usize, sy: usize, depth: usize) -> Vol {
        let w = (0..sx * sy * depth).map(|_| rng.gen_range(-1.0..1.0)).collect();
        Vol::from_data(sx, sy, depth, w).unwrap()
    }

    // loss = sum(out * r) so d loss / d out = r
    fn linear_loss(out: &Vol, r: &[Float]) -> Float {
        out.w.iter().zip(r).map(|(a, b)| a * b).sum()
    }

    #[test]
    fn valid_convolution_shrinks_by_filter_minus_one() {
        let mut rng = make_rng(Some(1));
        let layer = ConvLayer::builder("c", 4, 3, 2).build(&mut rng);
        assert_eq!(layer.out_shape(Shape::new(10, 7, 2)), Shape::new(8, 5, 4));
    }

    #[test]
    fn constant_filter_sums_window() {
        let mut rng = make_rng(Some(1));
        let mut layer = ConvLayer::builder("c", 1, 2, 1).bias(0.5).build(&mut rng);
        for mut p in layer.params_and_grads() {
            if p.name.contains("weights") {
                p.params.fill(1.0);
            }
        }

        let input = Vol::from_data(3, 2, 1, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let mut out = Vol::zeros(1, 1, 1);
        layer.forward(&input, &mut out, false);

        assert_eq!(out.shape(), Shape::new(2, 1, 1));
        assert_eq!(out.w, vec![1.0 + 2.0 + 4.0 + 5.0 + 0.5, 2.0 + 3.0 + 5.0 + 6.0 + 0.5]);
    }

    #[test]
    fn compute_correct_gradient_at_data() {
        let mut rng = make_rng(Some(3));
        let mut layer = ConvLayer::builder("c", 3, 3, 2).std(0.5).build(&mut rng);
        let mut x = random_vol(&mut rng, 6, 5, 2);
        let mut out = Vol::zeros(1, 1, 1);

        layer.forward(&x, &mut out, false);
        let r: Vec<Float> = (0..out.w.len()).map(|_| rng.gen_range(-1.0..1.0)).collect();
        out.dw.copy_from_slice(&r);
        layer.backward(&mut x, &out);

        let delta = 1e-2;
        for i in 0..x.w.len() {
            let analytic = x.dw[i];
            let old = x.w[i];

            x.w[i] = old + delta;
            layer.forward(&x, &mut out, false);
            let c0 = linear_loss(&out, &r);

            x.w[i] = old - delta;
            layer.forward(&x, &mut out, false);
            let c1 = linear_loss(&out, &r);

            x.w[i] = old;
            let numeric = (c0 - c1) / (2.0 * delta);
            assert!(
                (analytic - numeric).abs() < 1e-3,
                "{i}: numeric {numeric}, analytic {analytic}"
            );
        }
    }

    #[test]
    fn dropout_only_on_training_passes() {
        let mut rng = make_rng(Some(5));
        let mut layer = ConvLayer::builder("c", 8, 1, 1)
            .bias(0.0)
            .dropout(true)
            .build(&mut rng);
        layer.set_keep_prob(0.5);

        let x = Vol::with_constant(8, 8, 1, 1.0);
        let mut eval = Vol::zeros(1, 1, 1);
        layer.forward(&x, &mut eval, false);
        assert!(eval.w.iter().all(|v| *v != 0.0));

        let mut train = Vol::zeros(1, 1, 1);
        layer.forward(&x, &mut train, true);
        let dropped = train.w.iter().filter(|v| **v == 0.0).count();
        assert!(dropped > 0 && dropped < train.w.len());
        for (t, e) in train.w.iter().zip(&eval.w) {
            assert!(*t == 0.0 || (t - 2.0 * e).abs() < 1e-5);
        }
    }
}
