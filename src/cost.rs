//! Scalar objectives over a [sy, sx, n_class] logit map and its one-hot labels.
//!
//! Every objective sees the map flattened to `sx * sy` pixels, each a
//! categorical distribution over the depth column. `evaluate` reports the loss
//! and, when asked, writes d loss / d logits into `logits.dw`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, UnetError},
    layers::{log_softmax_into, LayerDetails, PixelSoftmax},
    metrics,
    vol::Vol,
    Float,
};

const DICE_EPS: Float = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostKind {
    CrossEntropy,
    WeightedCrossEntropy,
    DiceCoefficient,
}

impl Default for CostKind {
    fn default() -> Self {
        Self::CrossEntropy
    }
}

impl fmt::Display for CostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CrossEntropy => "cross_entropy",
            Self::WeightedCrossEntropy => "weighted_cross_entropy",
            Self::DiceCoefficient => "dice_coefficient",
        };
        f.write_str(name)
    }
}

impl FromStr for CostKind {
    type Err = UnetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cross_entropy" => Ok(Self::CrossEntropy),
            "weighted_cross_entropy" => Ok(Self::WeightedCrossEntropy),
            "dice_coefficient" => Ok(Self::DiceCoefficient),
            other => Err(UnetError::config(format!("unknown cost function: {other:?}"))),
        }
    }
}

/// A single weight broadcast to every class, or one weight per class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClassWeights {
    Scalar(Float),
    PerClass(Vec<Float>),
}

impl ClassWeights {
    fn expand(&self, n_class: usize, name: &str) -> Result<Vec<Float>> {
        match self {
            Self::Scalar(w) => Ok(vec![*w; n_class]),
            Self::PerClass(ws) if ws.len() == n_class => Ok(ws.clone()),
            Self::PerClass(ws) => Err(UnetError::config(format!(
                "{name} has {} entries but there are {n_class} classes",
                ws.len()
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CostKwargs {
    /// weight of the foreground class (class 0)
    #[serde(default)]
    pub fore_weights: Option<ClassWeights>,
    /// weights of the remaining classes
    #[serde(default)]
    pub back_weights: Option<ClassWeights>,
    /// coefficient of the L2 penalty over every trainable parameter
    #[serde(default)]
    pub regularizer: Option<Float>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostOutput {
    pub loss: Float,
    pub cross_entropy: Float,
    pub accuracy: Float,
}

#[derive(Debug, Clone)]
enum Objective {
    CrossEntropy,
    // per-class weight, class 0 from the fore weights, the rest from the back weights
    Weighted(Vec<Float>),
    Dice,
}

#[derive(Debug, Clone)]
pub struct Cost {
    kind: CostKind,
    n_class: usize,
    objective: Objective,
    regularizer: Option<Float>,

    probs: Vol,
    log_probs: Vec<Float>,
}

impl Cost {
    pub fn new(kind: CostKind, kwargs: &CostKwargs, n_class: usize) -> Result<Self> {
        if n_class == 0 {
            return Err(UnetError::config("n_class must be greater than 0"));
        }

        let mut kind = kind;
        // class weights on plain cross entropy switch to the weighted form
        if kind == CostKind::CrossEntropy && kwargs.fore_weights.is_some() {
            kind = CostKind::WeightedCrossEntropy;
        }

        let objective = match kind {
            CostKind::CrossEntropy => Objective::CrossEntropy,
            CostKind::WeightedCrossEntropy => {
                let fore = match &kwargs.fore_weights {
                    Some(w) => w.expand(n_class, "fore_weights")?,
                    None => vec![1.0; n_class],
                };
                let mut weights = match &kwargs.back_weights {
                    Some(w) => w.expand(n_class, "back_weights")?,
                    None => vec![1.0; n_class],
                };
                weights[0] = fore[0];
                Objective::Weighted(weights)
            }
            CostKind::DiceCoefficient => Objective::Dice,
        };

        if kind == CostKind::DiceCoefficient
            && (kwargs.fore_weights.is_some() || kwargs.back_weights.is_some())
        {
            return Err(UnetError::config(
                "class weights are not supported by dice_coefficient",
            ));
        }

        if let Some(r) = kwargs.regularizer {
            if !r.is_finite() || r < 0.0 {
                return Err(UnetError::config(format!(
                    "regularizer must be a non-negative number, got {r}"
                )));
            }
        }

        Ok(Self {
            kind,
            n_class,
            objective,
            regularizer: kwargs.regularizer,
            probs: Vol::zeros(0, 0, n_class),
            log_probs: Vec::new(),
        })
    }

    /// The objective actually in use.
    pub fn kind(&self) -> CostKind {
        self.kind
    }

    /// Pixel-wise softmax of the logits seen by the last `evaluate` call.
    pub fn probabilities(&self) -> &Vol {
        &self.probs
    }

    /// Loss, clipped cross entropy and accuracy of `logits` against `labels`.
    /// With `with_grad` the gradient of the loss lands in `logits.dw`.
    pub fn evaluate(&mut self, logits: &mut Vol, labels: &Vol, with_grad: bool) -> Result<CostOutput> {
        if logits.shape() != labels.shape() {
            return Err(UnetError::shape(format!(
                "logits are {} but labels are {}",
                logits.shape(),
                labels.shape()
            )));
        }
        if logits.depth() != self.n_class {
            return Err(UnetError::shape(format!(
                "expected {} classes, the logits have {}",
                self.n_class,
                logits.depth()
            )));
        }

        PixelSoftmax::forward(logits, &mut self.probs);

        let Cost {
            objective,
            probs,
            log_probs,
            ..
        } = &mut *self;
        let loss = match objective {
            Objective::CrossEntropy => {
                weighted_cross_entropy(logits, labels, probs, log_probs, None, with_grad)
            }
            Objective::Weighted(weights) => {
                weighted_cross_entropy(logits, labels, probs, log_probs, Some(weights.as_slice()), with_grad)
            }
            Objective::Dice => dice(logits, labels, probs, with_grad),
        };

        Ok(CostOutput {
            loss,
            cross_entropy: metrics::cross_entropy(&self.probs, labels),
            accuracy: metrics::accuracy(&self.probs, labels),
        })
    }

    /// `regularizer * sum(p^2)` over every parameter, zero without a regularizer.
    pub fn penalty(&self, params: &[LayerDetails<'_>]) -> Float {
        let Some(coef) = self.regularizer else {
            return 0.0;
        };
        let squares: Float = params
            .iter()
            .flat_map(|p| p.params.iter())
            .map(|w| w * w)
            .sum();
        coef * squares
    }

    /// Adds the gradient of [`Cost::penalty`] to every parameter gradient and
    /// returns the penalty.
    pub fn regularize(&self, params: &mut [LayerDetails<'_>]) -> Float {
        let Some(coef) = self.regularizer else {
            return 0.0;
        };

        for p in params.iter_mut() {
            for (w, g) in p.params.iter().zip(p.grads.iter_mut()) {
                *g += 2.0 * coef * w;
            }
        }
        self.penalty(params)
    }
}

// -mean over pixels of sum_k a_k log p_k, a_k = w_k y_k
// d/dz_j = (p_j * sum_k a_k - a_j) / N
fn weighted_cross_entropy(
    logits: &mut Vol,
    labels: &Vol,
    probs: &Vol,
    log_probs: &mut Vec<Float>,
    weights: Option<&[Float]>,
    with_grad: bool,
) -> Float {
    let depth = logits.depth();
    let pixels = (logits.w.len() / depth).max(1);
    let norm = pixels as Float;
    log_probs.resize(depth, 0.0);

    let weight = |k: usize| weights.map_or(1.0, |w| w[k]);

    let mut total = 0.0;
    for (i, (z, y)) in logits
        .w
        .chunks(depth)
        .zip(labels.w.chunks(depth))
        .enumerate()
    {
        log_softmax_into(z, log_probs);

        let mut a_sum = 0.0;
        for k in 0..depth {
            let a = weight(k) * y[k];
            total -= a * log_probs[k];
            a_sum += a;
        }

        if with_grad {
            let p = &probs.w[i * depth..(i + 1) * depth];
            let dz = &mut logits.dw[i * depth..(i + 1) * depth];
            for k in 0..depth {
                dz[k] = (p[k] * a_sum - weight(k) * y[k]) / norm;
            }
        }
    }

    total / norm
}

// -2 I / U with I = sum p y, U = eps + sum p + sum y
fn dice(logits: &mut Vol, labels: &Vol, probs: &mut Vol, with_grad: bool) -> Float {
    let intersection: Float = probs.w.iter().zip(&labels.w).map(|(p, y)| p * y).sum();
    let union = DICE_EPS + probs.w.iter().sum::<Float>() + labels.w.iter().sum::<Float>();

    if with_grad {
        let u2 = union * union;
        for (dp, y) in probs.dw.iter_mut().zip(&labels.w) {
            *dp = -2.0 * (y * union - intersection) / u2;
        }
        PixelSoftmax::backward(logits, probs);
    }

    -2.0 * intersection / union
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::utils::make_rng;

    fn one_hot(sx: usize, sy: usize, n_class: usize, class_of: impl Fn(usize) -> usize) -> Vol {
        let mut v = Vol::zeros(sx, sy, n_class);
        for i in 0..sx * sy {
            v.w[i * n_class + class_of(i)] = 1.0;
        }
        v
    }

    fn random_logits(seed: u64, sx: usize, sy: usize, n_class: usize) -> Vol {
        let mut rng = make_rng(Some(seed));
        let w = (0..sx * sy * n_class).map(|_| rng.gen_range(-2.0..2.0)).collect();
        Vol::from_data(sx, sy, n_class, w).unwrap()
    }

    #[test]
    fn unknown_kind_is_a_config_error() {
        let err = "focal".parse::<CostKind>().unwrap_err();
        assert!(matches!(err, UnetError::Config(_)));
        assert_eq!("dice_coefficient".parse::<CostKind>().unwrap(), CostKind::DiceCoefficient);
    }

    #[test]
    fn kwargs_reject_unknown_keys() {
        let err = serde_json::from_str::<CostKwargs>(r#"{"class_weights": [1, 2]}"#);
        assert!(err.is_err());

        let kwargs: CostKwargs = serde_json::from_str(r#"{"fore_weights": 0.5, "back_weights": [1, 3]}"#).unwrap();
        assert_eq!(kwargs.fore_weights, Some(ClassWeights::Scalar(0.5)));
        assert_eq!(kwargs.back_weights, Some(ClassWeights::PerClass(vec![1.0, 3.0])));
    }

    #[test]
    fn fore_weights_promote_cross_entropy_to_weighted() {
        let kwargs = CostKwargs {
            fore_weights: Some(ClassWeights::Scalar(1.0)),
            ..Default::default()
        };
        let cost = Cost::new(CostKind::CrossEntropy, &kwargs, 2).unwrap();
        assert_eq!(cost.kind(), CostKind::WeightedCrossEntropy);
    }

    #[test]
    fn mismatched_weight_length_is_rejected() {
        let kwargs = CostKwargs {
            back_weights: Some(ClassWeights::PerClass(vec![1.0, 2.0])),
            ..Default::default()
        };
        assert!(Cost::new(CostKind::WeightedCrossEntropy, &kwargs, 3).is_err());
    }

    #[test]
    fn weighted_with_unit_weights_equals_plain() {
        let labels = one_hot(5, 4, 3, |i| i % 3);
        let mut a = random_logits(1, 5, 4, 3);
        let mut b = a.clone();

        let mut plain = Cost::new(CostKind::CrossEntropy, &CostKwargs::default(), 3).unwrap();
        let kwargs = CostKwargs {
            fore_weights: Some(ClassWeights::Scalar(1.0)),
            back_weights: Some(ClassWeights::PerClass(vec![1.0; 3])),
            regularizer: None,
        };
        let mut weighted = Cost::new(CostKind::WeightedCrossEntropy, &kwargs, 3).unwrap();

        let pa = plain.evaluate(&mut a, &labels, true).unwrap();
        let pb = weighted.evaluate(&mut b, &labels, true).unwrap();
        assert!((pa.loss - pb.loss).abs() < 1e-6);
        for (ga, gb) in a.dw.iter().zip(&b.dw) {
            assert!((ga - gb).abs() < 1e-7);
        }
    }

    #[test]
    fn class_weight_scales_only_its_pixels() {
        let labels = one_hot(4, 1, 2, |i| usize::from(i >= 2));
        let logits = random_logits(2, 4, 1, 2);

        let mut plain = Cost::new(CostKind::CrossEntropy, &CostKwargs::default(), 2).unwrap();
        let base = plain.evaluate(&mut logits.clone(), &labels, false).unwrap();

        let kwargs = CostKwargs {
            fore_weights: Some(ClassWeights::Scalar(1.0)),
            back_weights: Some(ClassWeights::PerClass(vec![1.0, 3.0])),
            regularizer: None,
        };
        let mut weighted = Cost::new(CostKind::WeightedCrossEntropy, &kwargs, 2).unwrap();
        let out = weighted.evaluate(&mut logits.clone(), &labels, false).unwrap();

        // -mean(log p) split by class
        let mut lp = [0.0; 2];
        let mut fore = 0.0;
        let mut back = 0.0;
        for (i, z) in logits.w.chunks(2).enumerate() {
            log_softmax_into(z, &mut lp);
            if i < 2 {
                fore -= lp[0];
            } else {
                back -= lp[1];
            }
        }
        assert!((base.loss - (fore + back) / 4.0).abs() < 1e-5);
        assert!((out.loss - (fore + 3.0 * back) / 4.0).abs() < 1e-5);
    }

    #[test]
    fn fore_weight_scales_class_zero_pixels() {
        let labels = one_hot(4, 1, 2, |i| usize::from(i >= 2));
        let logits = random_logits(5, 4, 1, 2);

        let kwargs = CostKwargs {
            fore_weights: Some(ClassWeights::Scalar(2.0)),
            ..Default::default()
        };
        let mut cost = Cost::new(CostKind::WeightedCrossEntropy, &kwargs, 2).unwrap();
        let out = cost.evaluate(&mut logits.clone(), &labels, false).unwrap();

        let mut lp = [0.0; 2];
        let mut expected = 0.0;
        for (i, z) in logits.w.chunks(2).enumerate() {
            log_softmax_into(z, &mut lp);
            expected -= if i < 2 { 2.0 * lp[0] } else { lp[1] };
        }
        assert!((out.loss - expected / 4.0).abs() < 1e-5);
    }

    #[test]
    fn dice_is_bounded_and_minimal_on_perfect_match() {
        let labels = one_hot(6, 6, 2, |i| usize::from(i % 4 == 0));
        let mut cost = Cost::new(CostKind::DiceCoefficient, &CostKwargs::default(), 2).unwrap();

        let mut random = random_logits(3, 6, 6, 2);
        let out = cost.evaluate(&mut random, &labels, false).unwrap();
        assert!(out.loss <= 0.0 && out.loss >= -2.0);

        // confident logits reproduce the labels
        let mut perfect = Vol::from_data(6, 6, 2, labels.w.iter().map(|y| 40.0 * y).collect()).unwrap();
        let out = cost.evaluate(&mut perfect, &labels, false).unwrap();
        assert!((out.loss + 1.0).abs() < 1e-3, "{}", out.loss);
        assert!((out.accuracy - 1.0).abs() < 1e-6);
    }

    #[test]
    fn gradients_match_finite_differences() {
        let labels = one_hot(3, 3, 3, |i| (i * 2) % 3);
        let kinds = [
            (CostKind::CrossEntropy, CostKwargs::default()),
            (
                CostKind::WeightedCrossEntropy,
                CostKwargs {
                    fore_weights: Some(ClassWeights::Scalar(0.3)),
                    back_weights: Some(ClassWeights::PerClass(vec![1.0, 2.0, 0.5])),
                    regularizer: None,
                },
            ),
            (CostKind::DiceCoefficient, CostKwargs::default()),
        ];

        for (kind, kwargs) in kinds {
            let mut cost = Cost::new(kind, &kwargs, 3).unwrap();
            let mut logits = random_logits(4, 3, 3, 3);
            cost.evaluate(&mut logits, &labels, true).unwrap();
            let analytic = logits.dw.clone();

            let delta = 1e-2;
            for i in 0..logits.w.len() {
                let old = logits.w[i];
                logits.w[i] = old + delta;
                let c0 = cost.evaluate(&mut logits, &labels, false).unwrap().loss;
                logits.w[i] = old - delta;
                let c1 = cost.evaluate(&mut logits, &labels, false).unwrap().loss;
                logits.w[i] = old;

                let numeric = (c0 - c1) / (2.0 * delta);
                assert!(
                    (analytic[i] - numeric).abs() < 1e-3,
                    "{kind} {i}: numeric {numeric}, analytic {}",
                    analytic[i]
                );
            }
        }
    }

    #[test]
    fn regularizer_adds_scaled_square_norm() {
        let kwargs = CostKwargs {
            regularizer: Some(0.5),
            ..Default::default()
        };
        let cost = Cost::new(CostKind::CrossEntropy, &kwargs, 2).unwrap();

        let mut w = vec![1.0, -2.0];
        let mut g = vec![0.0, 0.0];
        let mut params = vec![LayerDetails {
            name: "p".to_string(),
            params: &mut w,
            grads: &mut g,
        }];
        let penalty = cost.regularize(&mut params);
        assert!((penalty - 2.5).abs() < 1e-6);
        assert_eq!(g, vec![1.0, -2.0]);
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let mut cost = Cost::new(CostKind::CrossEntropy, &CostKwargs::default(), 2).unwrap();
        let mut logits = Vol::zeros(4, 4, 2);
        assert!(cost.evaluate(&mut logits, &Vol::zeros(3, 4, 2), false).is_err());
    }
}
