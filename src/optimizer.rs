use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, UnetError},
    layers::LayerDetails,
    utils::zeros,
    Float,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Momentum,
    Adam,
}

impl Default for OptimizerKind {
    fn default() -> Self {
        Self::Momentum
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Momentum => f.write_str("momentum"),
            Self::Adam => f.write_str("adam"),
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = UnetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "momentum" => Ok(Self::Momentum),
            "adam" => Ok(Self::Adam),
            other => Err(UnetError::config(format!("unknown optimizer: {other:?}"))),
        }
    }
}

/// Optimizer options. Which keys are allowed depends on the optimizer kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptKwargs {
    #[serde(default)]
    pub learning_rate: Option<Float>,
    /// global steps at which the momentum learning rate changes
    #[serde(default)]
    pub learning_rate_step: Option<Vec<usize>>,
    /// one more value than there are steps
    #[serde(default)]
    pub learning_rate_value: Option<Vec<Float>>,
    #[serde(default)]
    pub momentum: Option<Float>,
}

const DEFAULT_MOMENTUM: Float = 0.2;
const DEFAULT_ADAM_RATE: Float = 0.001;

#[derive(Debug, Clone, PartialEq)]
pub enum LearningRateSchedule {
    Constant(Float),
    /// `values[i]` where `i` is the number of boundaries already reached
    PiecewiseConstant {
        boundaries: Vec<usize>,
        values: Vec<Float>,
    },
}

impl LearningRateSchedule {
    pub fn piecewise(boundaries: Vec<usize>, values: Vec<Float>) -> Result<Self> {
        let mut errors = Vec::new();
        if values.len() != boundaries.len() + 1 {
            errors.push(format!(
                "learning_rate_value needs {} entries for {} steps, got {}",
                boundaries.len() + 1,
                boundaries.len(),
                values.len()
            ));
        }
        if boundaries.windows(2).any(|w| w[0] >= w[1]) {
            errors.push("learning_rate_step must be strictly increasing".to_string());
        }
        if values.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            errors.push("learning rates must be positive".to_string());
        }

        if !errors.is_empty() {
            return Err(UnetError::validation(errors));
        }
        Ok(Self::PiecewiseConstant { boundaries, values })
    }

    pub fn rate(&self, step: usize) -> Float {
        match self {
            Self::Constant(rate) => *rate,
            Self::PiecewiseConstant { boundaries, values } => {
                let reached = boundaries.iter().filter(|b| **b <= step).count();
                values[reached]
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Method {
    Momentum { momentum: Float },
    Adam { eps: Float, beta1: Float, beta2: Float },
}

/// Applies accumulated parameter gradients, then clears them.
pub struct Optimizer {
    method: Method,
    schedule: LearningRateSchedule,

    /// update counter
    k: usize,

    // momentum accumulator, or adam's first moment
    gsum: Vec<Vec<Float>>,

    // adam's second moment
    xsum: Vec<Vec<Float>>,
}

impl Optimizer {
    /// Resolves the optimizer eagerly so bad options fail before training.
    pub fn new(kind: OptimizerKind, kwargs: &OptKwargs) -> Result<Self> {
        let mut errors = Vec::new();

        let (method, schedule) = match kind {
            OptimizerKind::Momentum => {
                let momentum = kwargs.momentum.unwrap_or(DEFAULT_MOMENTUM);
                if !(0.0..1.0).contains(&momentum) {
                    errors.push(format!("momentum must be in [0, 1), got {momentum}"));
                }

                let has_schedule =
                    kwargs.learning_rate_step.is_some() || kwargs.learning_rate_value.is_some();
                let schedule = match (kwargs.learning_rate, has_schedule) {
                    (Some(_), true) => {
                        errors.push(
                            "learning_rate cannot be combined with learning_rate_step/learning_rate_value"
                                .to_string(),
                        );
                        None
                    }
                    (Some(rate), false) => Some(LearningRateSchedule::Constant(rate)),
                    (None, _) => {
                        let boundaries = kwargs
                            .learning_rate_step
                            .clone()
                            .unwrap_or_else(|| vec![100_000]);
                        let values = kwargs
                            .learning_rate_value
                            .clone()
                            .unwrap_or_else(|| vec![0.01, 0.001]);
                        match LearningRateSchedule::piecewise(boundaries, values) {
                            Ok(schedule) => Some(schedule),
                            Err(err) => {
                                errors.push(err.to_string());
                                None
                            }
                        }
                    }
                };
                (Method::Momentum { momentum }, schedule)
            }
            OptimizerKind::Adam => {
                for (key, present) in [
                    ("learning_rate_step", kwargs.learning_rate_step.is_some()),
                    ("learning_rate_value", kwargs.learning_rate_value.is_some()),
                    ("momentum", kwargs.momentum.is_some()),
                ] {
                    if present {
                        errors.push(format!("{key} is not used by the adam optimizer"));
                    }
                }
                let rate = kwargs.learning_rate.unwrap_or(DEFAULT_ADAM_RATE);
                (
                    Method::Adam {
                        eps: 1e-8,
                        beta1: 0.9,
                        beta2: 0.999,
                    },
                    Some(LearningRateSchedule::Constant(rate)),
                )
            }
        };

        if let Some(LearningRateSchedule::Constant(rate)) = &schedule {
            if !rate.is_finite() || *rate <= 0.0 {
                errors.push(format!("learning_rate must be positive, got {rate}"));
            }
        }

        match schedule {
            Some(schedule) if errors.is_empty() => Ok(Self {
                method,
                schedule,
                k: 0,
                gsum: Vec::new(),
                xsum: Vec::new(),
            }),
            _ => Err(UnetError::validation(errors)),
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn schedule(&self) -> &LearningRateSchedule {
        &self.schedule
    }

    pub fn learning_rate(&self, global_step: usize) -> Float {
        self.schedule.rate(global_step)
    }

    /// Number of updates applied so far.
    pub fn iterations(&self) -> usize {
        self.k
    }

    pub fn update(&mut self, pg_list: &mut [LayerDetails<'_>], learning_rate: Float) {
        // initialize accumulators once, on the first update
        if self.gsum.is_empty() {
            for pg in pg_list.iter() {
                self.gsum.push(zeros(pg.params.len()));
                if matches!(self.method, Method::Adam { .. }) {
                    self.xsum.push(zeros(pg.params.len()));
                } else {
                    // conserve memory
                    self.xsum.push(Vec::new());
                }
            }
        }

        self.k += 1;

        let lr_t = match self.method {
            Method::Adam { beta1, beta2, .. } => {
                let t = self.k as i32;
                learning_rate * (1.0 - beta2.powi(t)).sqrt() / (1.0 - beta1.powi(t))
            }
            Method::Momentum { .. } => learning_rate,
        };

        for (i, pg) in pg_list.iter_mut().enumerate() {
            let gsumi = &mut self.gsum[i];
            let xsumi = &mut self.xsum[i];

            for j in 0..pg.params.len() {
                let gij = pg.grads[j];

                match self.method {
                    Method::Adam { eps, beta1, beta2 } => {
                        gsumi[j] = gsumi[j] * beta1 + (1.0 - beta1) * gij; // biased first moment
                        xsumi[j] = xsumi[j] * beta2 + (1.0 - beta2) * gij * gij; // biased second moment
                        pg.params[j] -= lr_t * gsumi[j] / (xsumi[j].sqrt() + eps);
                    }
                    Method::Momentum { momentum } => {
                        gsumi[j] = momentum * gsumi[j] + gij;
                        pg.params[j] -= lr_t * gsumi[j];
                    }
                }
                pg.grads[j] = 0.0;
            }
        }
    }
}
