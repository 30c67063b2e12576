//! Transpose convolution ("up-convolution") whose kernel equals its stride, so
//! every input pixel paints its own non-overlapping `sx` by `sx` block of the
//! output and the spatial size grows by exactly `sx`.

use rand::rngs::StdRng;

use crate::{
    vol::{Shape, Vol},
    Float,
};

use super::{filter_details, LayerDetails, NetLayer};

pub struct DeconvLayer {
    name: String,
    out_depth: usize,
    sx: usize,
    in_depth: usize,

    // one filter per output channel, each sx * sx * in_depth
    filters: Vec<Vol>,
    biases: Vol,
}

impl DeconvLayer {
    pub fn new(
        name: impl Into<String>,
        out_depth: usize,
        sx: usize,
        in_depth: usize,
        std: Float,
        rng: &mut StdRng,
    ) -> Self {
        let filters = (0..out_depth)
            .map(|_| Vol::truncated_normal(sx, sx, in_depth, std, rng))
            .collect();
        Self {
            name: name.into(),
            out_depth,
            sx,
            in_depth,
            filters,
            biases: Vol::with_constant(1, 1, out_depth, 0.1),
        }
    }
}

impl NetLayer for DeconvLayer {
    fn forward(&mut self, in_act: &Vol, out_act: &mut Vol, _is_training: bool) {
        debug_assert_eq!(in_act.depth(), self.in_depth, "{}: input depth", self.name);

        let shape = self.out_shape(in_act.shape());
        out_act.ensure_shape(shape);

        for y in 0..in_act.sy() {
            for x in 0..in_act.sx() {
                for d in 0..self.out_depth {
                    let f = &self.filters[d];

                    for fy in 0..self.sx {
                        for fx in 0..self.sx {
                            let mut a = self.biases.w[d];
                            for fd in 0..self.in_depth {
                                a += f.get(fx, fy, fd) * in_act.get(x, y, fd);
                            }
                            out_act.set(x * self.sx + fx, y * self.sx + fy, d, a);
                        }
                    }
                }
            }
        }
    }

    fn backward(&mut self, in_act: &mut Vol, out_act: &Vol) {
        let v = in_act;
        v.dw.fill(0.0);

        for y in 0..v.sy() {
            for x in 0..v.sx() {
                for d in 0..self.out_depth {
                    let f = &mut self.filters[d];

                    for fy in 0..self.sx {
                        for fx in 0..self.sx {
                            let chain_grad = out_act.get_gradiant(x * self.sx + fx, y * self.sx + fy, d);
                            self.biases.dw[d] += chain_grad;

                            for fd in 0..self.in_depth {
                                f.add_gradiant(fx, fy, fd, v.get(x, y, fd) * chain_grad);
                                v.add_gradiant(x, y, fd, f.get(fx, fy, fd) * chain_grad);
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
        Shape::new(input.sx * self.sx, input.sy * self.sx, self.out_depth)
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::utils::make_rng;

    #[test]
    fn doubles_spatial_size_and_sets_depth() {
        let mut rng = make_rng(Some(2));
        let layer = DeconvLayer::new("d", 4, 2, 8, 0.1, &mut rng);
        assert_eq!(layer.out_shape(Shape::new(13, 9, 8)), Shape::new(26, 18, 4));
    }

    #[test]
    fn compute_correct_gradient_at_data() {
        let mut rng = make_rng(Some(11));
        let mut layer = DeconvLayer::new("d", 2, 2, 3, 0.5, &mut rng);
        let w = (0..3 * 2 * 3).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let mut x = Vol::from_data(3, 2, 3, w).unwrap();
        let mut out = Vol::zeros(1, 1, 1);

        layer.forward(&x, &mut out, false);
        let r: Vec<Float> = (0..out.w.len()).map(|_| rng.gen_range(-1.0..1.0)).collect();
        out.dw.copy_from_slice(&r);
        layer.backward(&mut x, &out);

        let loss = |out: &Vol| -> Float { out.w.iter().zip(&r).map(|(a, b)| a * b).sum() };
        let delta = 1e-2;
        for i in 0..x.w.len() {
            let analytic = x.dw[i];
            let old = x.w[i];

            x.w[i] = old + delta;
            layer.forward(&x, &mut out, false);
            let c0 = loss(&out);

            x.w[i] = old - delta;
            layer.forward(&x, &mut out, false);
            let c1 = loss(&out);

            x.w[i] = old;
            let numeric = (c0 - c1) / (2.0 * delta);
            assert!(
                (analytic - numeric).abs() < 1e-3,
                "{i}: numeric {numeric}, analytic {analytic}"
            );
        }
    }
}
