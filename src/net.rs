use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{Result, UnetError},
    layers::{ConvLayer, CropConcatLayer, DeconvLayer, LayerDetails, NetLayer, PoolLayer, ReluLayer},
    vol::{Shape, Vol},
    Float,
};

/// Architecture of a U-Net. Fixes every parameter shape and, through
/// [`NetworkSpec::offset`], how much smaller the output map is than the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkSpec {
    /// number of channels in the input image
    pub channels: usize,
    /// number of output labels
    pub n_class: usize,
    /// number of resolution levels
    pub layers: usize,
    /// number of features in the first level, doubled on every level below
    pub features_root: usize,
    pub filter_size: usize,
    pub pool_size: usize,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            channels: 1,
            n_class: 2,
            layers: 3,
            features_root: 16,
            filter_size: 3,
            pool_size: 2,
        }
    }
}

impl NetworkSpec {
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.channels == 0 {
            errors.push("channels must be greater than 0".to_string());
        }
        if self.n_class == 0 {
            errors.push("n_class must be greater than 0".to_string());
        }
        if self.layers == 0 {
            errors.push("layers must be greater than 0".to_string());
        }
        if self.features_root == 0 {
            errors.push("features_root must be greater than 0".to_string());
        }
        if self.filter_size == 0 {
            errors.push("filter_size must be greater than 0".to_string());
        }
        if self.layers > 1 && self.pool_size < 2 {
            errors.push("pool_size must be at least 2 when layers > 1".to_string());
        }

        if !errors.is_empty() {
            return Err(UnetError::validation(errors));
        }
        Ok(())
    }

    /// Spatial shrinkage of one pair of valid convolutions.
    fn conv_shrink(&self) -> usize {
        2 * (self.filter_size - 1)
    }

    /// Follows one spatial dimension through the whole net: each valid
    /// convolution removes `filter_size - 1`, pooling divides by `pool_size`
    /// (rounding down), each up-convolution multiplies by it. `None` once a
    /// stage would be empty.
    pub fn output_size(&self, input: usize) -> Option<usize> {
        let shrink = self.conv_shrink();
        let mut size = input;

        for layer in 0..self.layers {
            size = size.checked_sub(shrink).filter(|s| *s > 0)?;
            if layer < self.layers - 1 {
                size /= self.pool_size;
                if size == 0 {
                    return None;
                }
            }
        }

        for _ in 1..self.layers {
            size = (size * self.pool_size)
                .checked_sub(shrink)
                .filter(|s| *s > 0)?;
        }

        Some(size)
    }

    /// Input size that lands exactly on a bottom map of `bottom` pixels with
    /// every pooling division exact.
    fn exact_input_for_bottom(&self, bottom: usize) -> usize {
        let shrink = self.conv_shrink();
        let mut size = bottom + shrink;
        for _ in 1..self.layers {
            size = size * self.pool_size + shrink;
        }
        size
    }

    /// Smallest input size with a non-empty output.
    pub fn min_input_size(&self) -> usize {
        let mut bottom = 1;
        loop {
            let input = self.exact_input_for_bottom(bottom);
            if self.output_size(input).is_some() {
                return input;
            }
            bottom += 1;
        }
    }

    /// Difference between input and output size for inputs whose pooling
    /// divisions are exact. Depends only on layers, filter_size and pool_size.
    pub fn offset(&self) -> usize {
        let input = self.min_input_size();
        match self.output_size(input) {
            Some(output) => input - output,
            None => input,
        }
    }

    /// Output shape for an `sx` by `sy` input.
    pub fn output_shape(&self, sx: usize, sy: usize) -> Result<Shape> {
        match (self.output_size(sx), self.output_size(sy)) {
            (Some(out_sx), Some(out_sy)) => Ok(Shape::new(out_sx, out_sy, self.n_class)),
            _ => Err(UnetError::shape(format!(
                "a {sy}x{sx} input is too small for this network, it needs at least {0}x{0}",
                self.min_input_size()
            ))),
        }
    }
}

/// One level of the contracting path: two valid convolutions with ReLU, then
/// max pooling on every level except the deepest.
struct DownStage {
    conv1: ConvLayer,
    conv1_out: Vol,
    relu1_out: Vol,
    conv2: ConvLayer,
    conv2_out: Vol,
    // pre-pool activation, reused by the skip connection
    skip: Vol,
    pool: Option<PoolLayer>,
    pooled: Vol,
}

impl DownStage {
    fn output(&self) -> &Vol {
        if self.pool.is_some() {
            &self.pooled
        } else {
            &self.skip
        }
    }

    fn forward(&mut self, input: &Vol, is_training: bool) {
        let mut relu = ReluLayer::new();
        self.conv1.forward(input, &mut self.conv1_out, is_training);
        relu.forward(&self.conv1_out, &mut self.relu1_out, is_training);
        self.conv2.forward(&self.relu1_out, &mut self.conv2_out, is_training);
        relu.forward(&self.conv2_out, &mut self.skip, is_training);
        if let Some(pool) = &mut self.pool {
            pool.forward(&self.skip, &mut self.pooled, is_training);
        }
    }

    /// Expects the gradient of the stage output to be in place already
    /// (`pooled.dw`, or `skip.dw` on the deepest level). `skip_grad` is what
    /// the matching up stage sends back through the skip connection.
    fn backward(&mut self, input: &mut Vol, skip_grad: Option<&Vol>) {
        let mut relu = ReluLayer::new();
        if let Some(pool) = &mut self.pool {
            pool.backward(&mut self.skip, &self.pooled);
        }
        if let Some(grad) = skip_grad {
            for (g, s) in self.skip.dw.iter_mut().zip(&grad.dw) {
                *g += s;
            }
        }
        relu.backward(&mut self.conv2_out, &self.skip);
        self.conv2.backward(&mut self.relu1_out, &self.conv2_out);
        relu.backward(&mut self.conv1_out, &self.relu1_out);
        self.conv1.backward(input, &self.conv1_out);
    }
}

/// One level of the expanding path: up-convolution with ReLU, crop-and-concat
/// with the skip connection, two valid convolutions with ReLU.
struct UpStage {
    deconv: DeconvLayer,
    deconv_out: Vol,
    up: Vol,
    concat: CropConcatLayer,
    merged: Vol,
    conv1: ConvLayer,
    conv1_out: Vol,
    relu1_out: Vol,
    conv2: ConvLayer,
    conv2_out: Vol,
    out: Vol,
    skip_grad: Vol,
}

impl UpStage {
    fn forward(&mut self, in_node: &Vol, skip: &Vol, is_training: bool) -> Result<()> {
        let mut relu = ReluLayer::new();
        self.deconv.forward(in_node, &mut self.deconv_out, is_training);
        relu.forward(&self.deconv_out, &mut self.up, is_training);
        self.concat.forward(skip, &self.up, &mut self.merged)?;
        self.conv1.forward(&self.merged, &mut self.conv1_out, is_training);
        relu.forward(&self.conv1_out, &mut self.relu1_out, is_training);
        self.conv2.forward(&self.relu1_out, &mut self.conv2_out, is_training);
        relu.forward(&self.conv2_out, &mut self.out, is_training);
        Ok(())
    }

    fn backward(&mut self, in_node: &mut Vol, skip: &Vol) {
        let mut relu = ReluLayer::new();
        relu.backward(&mut self.conv2_out, &self.out);
        self.conv2.backward(&mut self.relu1_out, &self.conv2_out);
        relu.backward(&mut self.conv1_out, &self.relu1_out);
        self.conv1.backward(&mut self.merged, &self.conv1_out);
        self.skip_grad.ensure_shape(skip.shape());
        self.concat
            .backward(&mut self.skip_grad, &mut self.up, &self.merged);
        relu.backward(&mut self.deconv_out, &self.up);
        self.deconv.backward(in_node, &self.deconv_out);
    }
}

/// The assembled encoder-decoder graph.
pub struct Net {
    spec: NetworkSpec,
    offset: usize,
    keep_prob: Float,

    input: Vol,
    down: Vec<DownStage>,
    // deepest level first
    up: Vec<UpStage>,
    head: ConvLayer,
    head_out: Vol,
    output: Vol,
}

impl Net {
    pub fn new(spec: &NetworkSpec, rng: &mut StdRng) -> Result<Self> {
        spec.validate()?;

        info!(
            "Layers {}, features {}, filter size {fs}x{fs}, pool size: {ps}x{ps}",
            spec.layers,
            spec.features_root,
            fs = spec.filter_size,
            ps = spec.pool_size
        );

        let weight_std = |features: usize| -> Float {
            (2.0 / (spec.filter_size * spec.filter_size * features) as Float).sqrt()
        };

        let mut down = Vec::with_capacity(spec.layers);
        let mut stddev = 0.0;
        for layer in 0..spec.layers {
            let features = (1 << layer) * spec.features_root;
            stddev = weight_std(features);
            let in_depth = if layer == 0 {
                spec.channels
            } else {
                features / 2
            };

            let name = format!("down_{layer}");
            down.push(DownStage {
                conv1: ConvLayer::builder(format!("{name}/conv1"), features, spec.filter_size, in_depth)
                    .std(stddev)
                    .dropout(true)
                    .build(rng),
                conv1_out: Vol::zeros(0, 0, features),
                relu1_out: Vol::zeros(0, 0, features),
                conv2: ConvLayer::builder(format!("{name}/conv2"), features, spec.filter_size, features)
                    .std(stddev)
                    .dropout(true)
                    .build(rng),
                conv2_out: Vol::zeros(0, 0, features),
                skip: Vol::zeros(0, 0, features),
                pool: (layer < spec.layers - 1).then(|| PoolLayer::new(spec.pool_size)),
                pooled: Vol::zeros(0, 0, features),
            });
        }

        let mut up = Vec::with_capacity(spec.layers.saturating_sub(1));
        for layer in (0..spec.layers - 1).rev() {
            let features = (1 << (layer + 1)) * spec.features_root;
            stddev = weight_std(features);
            let half = features / 2;

            let name = format!("up_{layer}");
            up.push(UpStage {
                deconv: DeconvLayer::new(
                    format!("{name}/deconv"),
                    half,
                    spec.pool_size,
                    features,
                    stddev,
                    rng,
                ),
                deconv_out: Vol::zeros(0, 0, half),
                up: Vol::zeros(0, 0, half),
                concat: CropConcatLayer::new(),
                merged: Vol::zeros(0, 0, features),
                conv1: ConvLayer::builder(format!("{name}/conv1"), half, spec.filter_size, features)
                    .std(stddev)
                    .dropout(true)
                    .build(rng),
                conv1_out: Vol::zeros(0, 0, half),
                relu1_out: Vol::zeros(0, 0, half),
                conv2: ConvLayer::builder(format!("{name}/conv2"), half, spec.filter_size, half)
                    .std(stddev)
                    .dropout(true)
                    .build(rng),
                conv2_out: Vol::zeros(0, 0, half),
                out: Vol::zeros(0, 0, half),
                skip_grad: Vol::zeros(0, 0, half),
            });
        }

        // 1x1 output map, never dropped out
        let head = ConvLayer::builder("output", spec.n_class, 1, spec.features_root)
            .std(stddev)
            .build(rng);

        Ok(Self {
            spec: *spec,
            offset: spec.offset(),
            keep_prob: 1.0,
            input: Vol::zeros(0, 0, spec.channels),
            down,
            up,
            head,
            head_out: Vol::zeros(0, 0, spec.n_class),
            output: Vol::zeros(0, 0, spec.n_class),
        })
    }

    pub fn spec(&self) -> &NetworkSpec {
        &self.spec
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Raw output map of the last forward pass (ReLU-activated logits).
    pub fn output(&self) -> &Vol {
        &self.output
    }

    fn set_keep_prob(&mut self, keep_prob: Float) {
        if self.keep_prob == keep_prob {
            return;
        }
        self.keep_prob = keep_prob;
        for stage in &mut self.down {
            stage.conv1.set_keep_prob(keep_prob);
            stage.conv2.set_keep_prob(keep_prob);
        }
        for stage in &mut self.up {
            stage.conv1.set_keep_prob(keep_prob);
            stage.conv2.set_keep_prob(keep_prob);
        }
    }

    /// Runs the graph on `x`. A keep probability below 1 turns on dropout.
    pub fn forward(&mut self, x: &Vol, keep_prob: Float) -> Result<&Vol> {
        if x.depth() != self.spec.channels {
            return Err(UnetError::shape(format!(
                "input has {} channels, the network expects {}",
                x.depth(),
                self.spec.channels
            )));
        }
        self.spec.output_shape(x.sx(), x.sy())?;

        self.set_keep_prob(keep_prob);
        let is_training = keep_prob < 1.0;

        let Net {
            input,
            down,
            up,
            head,
            head_out,
            output,
            ..
        } = &mut *self;

        input.copy_from(x);

        for i in 0..down.len() {
            let (before, rest) = down.split_at_mut(i);
            let src = match before.last() {
                Some(prev) => prev.output(),
                None => &*input,
            };
            rest[0].forward(src, is_training);
        }

        let deepest = down.len() - 1;
        for j in 0..up.len() {
            let layer = up.len() - 1 - j;
            let (done, rest) = up.split_at_mut(j);
            let in_node = match done.last() {
                Some(prev) => &prev.out,
                None => &down[deepest].skip,
            };
            rest[0].forward(in_node, &down[layer].skip, is_training)?;
        }

        let last = match up.last() {
            Some(stage) => &stage.out,
            None => &down[deepest].skip,
        };
        head.forward(last, head_out, false);
        ReluLayer::new().forward(head_out, output, false);

        Ok(&self.output)
    }

    /// Backpropagates `output_grad` (gradient wrt the output map of the last
    /// forward pass), accumulating into every parameter gradient.
    pub fn backward(&mut self, output_grad: &[Float]) -> Result<()> {
        if output_grad.len() != self.output.w.len() {
            return Err(UnetError::shape(format!(
                "gradient has {} values, the output map has {}",
                output_grad.len(),
                self.output.w.len()
            )));
        }

        let Net {
            input,
            down,
            up,
            head,
            head_out,
            output,
            ..
        } = &mut *self;

        output.dw.copy_from_slice(output_grad);
        ReluLayer::new().backward(head_out, output);

        let deepest = down.len() - 1;
        let (upper, bottom) = down.split_at_mut(deepest);
        let bottom = &mut bottom[0];

        let last = match up.last_mut() {
            Some(stage) => &mut stage.out,
            None => &mut bottom.skip,
        };
        head.backward(last, head_out);

        for j in (0..up.len()).rev() {
            let layer = up.len() - 1 - j;
            let (done, rest) = up.split_at_mut(j);
            let in_node = match done.last_mut() {
                Some(prev) => &mut prev.out,
                None => &mut bottom.skip,
            };
            rest[0].backward(in_node, &upper[layer].skip);
        }

        let bottom_input = match upper.last_mut() {
            Some(prev) => &mut prev.pooled,
            None => &mut *input,
        };
        bottom.backward(bottom_input, None);

        for i in (0..upper.len()).rev() {
            let skip_grad = &up[up.len() - 1 - i].skip_grad;
            let (before, rest) = upper.split_at_mut(i);
            let src = match before.last_mut() {
                Some(prev) => &mut prev.pooled,
                None => &mut *input,
            };
            rest[0].backward(src, Some(skip_grad));
        }

        Ok(())
    }

    /// Every trainable parameter, contracting path first, output map last.
    pub fn params_and_grads(&mut self) -> Vec<LayerDetails<'_>> {
        let mut result = Vec::new();
        for stage in &mut self.down {
            result.extend(stage.conv1.params_and_grads());
            result.extend(stage.conv2.params_and_grads());
        }
        for stage in &mut self.up {
            result.extend(stage.deconv.params_and_grads());
            result.extend(stage.conv1.params_and_grads());
            result.extend(stage.conv2.params_and_grads());
        }
        result.extend(self.head.params_and_grads());
        result
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::utils::make_rng;

    fn spec(layers: usize, features_root: usize) -> NetworkSpec {
        NetworkSpec {
            channels: 1,
            n_class: 2,
            layers,
            features_root,
            filter_size: 3,
            pool_size: 2,
        }
    }

    #[test]
    fn offset_for_known_depths() {
        assert_eq!(spec(1, 4).offset(), 4);
        assert_eq!(spec(2, 4).offset(), 16);
        assert_eq!(spec(3, 64).offset(), 40);
        assert_eq!(spec(3, 4).offset(), spec(3, 32).offset());
    }

    #[test]
    fn output_is_input_minus_offset() {
        for layers in 1..=4 {
            for filter_size in [3, 5] {
                let s = NetworkSpec {
                    filter_size,
                    ..spec(layers, 2)
                };
                let offset = s.offset();
                let min = s.min_input_size();
                let stride = s.pool_size.pow(layers as u32 - 1);
                for k in 0..4 {
                    let input = min + k * stride;
                    assert_eq!(
                        s.output_size(input),
                        Some(input - offset),
                        "layers {layers}, filter {filter_size}, input {input}"
                    );
                }
            }
        }
    }

    #[test]
    fn too_small_input_is_rejected() {
        let s = spec(3, 2);
        assert!(s.output_size(s.min_input_size() - 1).is_none());
        assert!(s.output_shape(8, 8).is_err());
    }

    #[test]
    fn validate_rejects_degenerate_specs() {
        assert!(spec(0, 4).validate().is_err());
        assert!(NetworkSpec { pool_size: 1, ..spec(2, 4) }.validate().is_err());
        assert!(NetworkSpec { pool_size: 1, ..spec(1, 4) }.validate().is_ok());
    }

    #[test]
    fn forward_produces_class_map_of_expected_shape() {
        let s = spec(2, 4);
        let mut net = Net::new(&s, &mut make_rng(Some(1))).unwrap();
        let out = net.forward(&Vol::zeros(64, 64, 1), 1.0).unwrap();
        assert_eq!(out.shape(), Shape::new(48, 48, 2));
        assert_eq!(net.offset(), 16);
    }

    #[test]
    fn non_square_and_odd_inputs_follow_the_size_walk() {
        let s = spec(2, 2);
        let mut net = Net::new(&s, &mut make_rng(Some(1))).unwrap();
        let out = net.forward(&Vol::zeros(25, 21, 1), 1.0).unwrap();
        let expected = s.output_shape(25, 21).unwrap();
        assert_eq!(out.shape(), expected);
    }

    #[test]
    fn parameter_names_are_stable_and_unique() {
        let s = spec(2, 2);
        let mut net = Net::new(&s, &mut make_rng(Some(1))).unwrap();
        let names: Vec<String> = net.params_and_grads().into_iter().map(|p| p.name).collect();

        assert_eq!(names.first().map(String::as_str), Some("down_0/conv1/weights/0"));
        assert_eq!(names.last().map(String::as_str), Some("output/biases"));
        assert!(names.iter().any(|n| n == "up_0/deconv/weights/1"));

        let mut sorted = names.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), names.len());
    }

    #[test]
    fn same_seed_same_parameters() {
        let s = spec(2, 2);
        let mut a = Net::new(&s, &mut make_rng(Some(9))).unwrap();
        let mut b = Net::new(&s, &mut make_rng(Some(9))).unwrap();
        for (pa, pb) in a.params_and_grads().iter().zip(b.params_and_grads().iter()) {
            assert_eq!(pa.params, pb.params);
        }
    }

    #[test]
    fn backward_reaches_the_output_map() {
        let s = spec(2, 2);
        let mut net = Net::new(&s, &mut make_rng(Some(4))).unwrap();
        // strictly positive head so the final ReLU passes every gradient
        for mut p in net.params_and_grads() {
            if p.name.starts_with("output/") {
                p.params.fill(1.0);
            }
        }

        let x = Vol::from_data(20, 20, 1, (0..400).map(|i| (i % 7) as Float / 7.0).collect()).unwrap();
        let n = net.forward(&x, 1.0).unwrap().w.len();
        net.backward(&vec![1.0; n]).unwrap();

        let grads: Vec<(String, Vec<Float>)> = net
            .params_and_grads()
            .into_iter()
            .map(|p| (p.name, p.grads.to_vec()))
            .collect();
        assert!(grads.iter().all(|(_, g)| g.iter().all(|v| v.is_finite())));

        let head_bias = &grads.iter().find(|(name, _)| name == "output/biases").unwrap().1;
        let pixels = (n / s.n_class) as Float;
        assert!(head_bias.iter().all(|g| (*g - pixels).abs() < 1e-3));
    }

    #[test]
    fn rejects_wrong_channel_count() {
        let mut net = Net::new(&spec(2, 2), &mut make_rng(Some(1))).unwrap();
        assert!(net.forward(&Vol::zeros(20, 20, 3), 1.0).is_err());
    }

    fn nudge(net: &mut Net, layer: usize, index: usize, delta: Float) {
        net.params_and_grads()[layer].params[index] += delta;
    }

    // loss = sum(out * r), accumulated in f64 so the central difference
    // is not swamped by rounding
    fn linear_loss(net: &mut Net, x: &Vol, r: &[Float]) -> f64 {
        let out = net.forward(x, 1.0).unwrap();
        out.w.iter().zip(r).map(|(a, b)| f64::from(*a) * f64::from(*b)).sum()
    }

    fn check_full_gradient(layers: usize, size: usize) {
        let s = spec(layers, 2);
        let mut rng = make_rng(Some(12));
        let mut net = Net::new(&s, &mut rng).unwrap();
        let x = Vol::from_data(
            size,
            size,
            1,
            (0..size * size).map(|_| rng.gen_range(0.0..1.0)).collect(),
        )
        .unwrap();

        let n = net.forward(&x, 1.0).unwrap().w.len();
        let r: Vec<Float> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        net.backward(&r).unwrap();
        let analytic: Vec<(String, Vec<Float>)> = net
            .params_and_grads()
            .into_iter()
            .map(|p| (p.name, p.grads.to_vec()))
            .collect();

        let delta = 1e-2;
        let mut diff = 0.0;
        let mut norm = 0.0;
        for (layer, (name, grads)) in analytic.iter().enumerate() {
            let stride = (grads.len() / 5).max(1);
            for i in (0..grads.len()).step_by(stride) {
                nudge(&mut net, layer, i, delta);
                let c0 = linear_loss(&mut net, &x, &r);
                nudge(&mut net, layer, i, -2.0 * delta);
                let c1 = linear_loss(&mut net, &x, &r);
                nudge(&mut net, layer, i, delta);

                let numeric = (c0 - c1) / (2.0 * f64::from(delta));
                let a = f64::from(grads[i]);
                assert!(a.is_finite(), "{name}[{i}] is not finite");
                diff += (a - numeric).powi(2);
                norm += a.powi(2).max(numeric.powi(2));
            }
        }

        assert!(norm > 0.0);
        let relative = (diff / norm).sqrt();
        assert!(relative < 2e-2, "relative gradient error {relative}");
    }

    #[test]
    fn gradient_matches_finite_differences_two_levels() {
        check_full_gradient(2, 20);
    }

    #[test]
    fn gradient_matches_finite_differences_three_levels() {
        check_full_gradient(3, 44);
    }
}
