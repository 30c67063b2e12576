use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use tracing::{debug, info};

use crate::{
    checkpoint,
    cost::{Cost, CostKind, CostKwargs},
    error::{Result, UnetError},
    layers::PixelSoftmax,
    metrics,
    net::{Net, NetworkSpec},
    optimizer::Optimizer,
    sample::Sample,
    utils::make_rng,
    vol::{Shape, Vol},
    Float,
};

/// Outcome of an inference pass against a labelled sample.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// per-pixel class probabilities
    pub prediction: Vol,
    /// label cropped to the prediction
    pub label: Vol,
    pub loss: Float,
    pub cross_entropy: Float,
    pub accuracy: Float,
    pub error_rate: Float,
}

#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub loss: Float,
    pub cross_entropy: Float,
    pub accuracy: Float,
    /// parameter gradients of this step, in `params_and_grads` order, when requested
    pub gradients: Option<Vec<Vec<Float>>>,
}

struct ModelState {
    net: Net,
    cost: Cost,
    // scratch copy of the output map, receives the loss gradient
    logits: Vol,
    probs: Vol,

    // parameters were trained, restored or explicitly accepted
    initialized: bool,
}

/// A U-Net together with its loss. All access to the parameters goes through
/// an internal lock, so predict, train-step, save and restore never overlap.
pub struct Unet {
    spec: NetworkSpec,
    offset: usize,
    restore_dir: Option<PathBuf>,
    state: Mutex<ModelState>,
}

pub struct UnetBuilder {
    spec: NetworkSpec,
    cost_kind: CostKind,
    cost_kwargs: CostKwargs,
    restore_dir: Option<PathBuf>,
    seed: Option<u64>,
}

impl UnetBuilder {
    fn new(spec: NetworkSpec) -> Self {
        Self {
            spec,
            cost_kind: CostKind::CrossEntropy,
            cost_kwargs: CostKwargs::default(),
            restore_dir: None,
            seed: None,
        }
    }

    /// default: plain cross entropy without class weights or regularizer
    pub fn cost(mut self, kind: CostKind, kwargs: CostKwargs) -> Self {
        self.cost_kind = kind;
        self.cost_kwargs = kwargs;
        self
    }

    /// directory searched for the newest checkpoint by `predict`
    pub fn restore_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.restore_dir = Some(dir.into());
        self
    }

    /// seed for the weight initialization and dropout masks
    ///
    /// default: drawn from entropy
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<Unet> {
        let cost = Cost::new(self.cost_kind, &self.cost_kwargs, self.spec.n_class)?;
        let mut rng = make_rng(self.seed);
        let net = Net::new(&self.spec, &mut rng)?;

        Ok(Unet {
            spec: self.spec,
            offset: net.offset(),
            restore_dir: self.restore_dir,
            state: Mutex::new(ModelState {
                net,
                cost,
                logits: Vol::zeros(0, 0, self.spec.n_class),
                probs: Vol::zeros(0, 0, self.spec.n_class),
                initialized: false,
            }),
        })
    }
}

impl Unet {
    pub fn builder(spec: NetworkSpec) -> UnetBuilder {
        UnetBuilder::new(spec)
    }

    pub fn spec(&self) -> &NetworkSpec {
        &self.spec
    }

    /// Input size minus output size.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn output_shape(&self, sx: usize, sy: usize) -> Result<Shape> {
        self.spec.output_shape(sx, sy)
    }

    pub fn restore_dir(&self) -> Option<&Path> {
        self.restore_dir.as_deref()
    }

    pub fn cost_kind(&self) -> Result<CostKind> {
        Ok(self.lock()?.cost.kind())
    }

    fn lock(&self) -> Result<MutexGuard<'_, ModelState>> {
        self.state
            .lock()
            .map_err(|_| UnetError::state("model lock poisoned by a panic"))
    }

    /// Accepts the freshly drawn random parameters as a starting point for
    /// training.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.lock()?.initialized)
    }

    fn label_for(&self, sample: &Sample) -> Result<Vol> {
        let shape = self.output_shape(sample.image.sx(), sample.image.sy())?;
        sample.label.crop_center(shape.sx, shape.sy)
    }

    /// Per-pixel class probabilities for `image`, with dropout off.
    ///
    /// A model that was never trained, restored or initialized first loads
    /// the newest checkpoint of the restore directory. Parameters already
    /// live in this process are used as they are. Fails when there is nothing
    /// to predict with.
    pub fn predict(&self, image: &Vol) -> Result<Vol> {
        let mut guard = self.lock()?;
        let state = &mut *guard;

        if !state.initialized {
            if let Some(dir) = &self.restore_dir {
                if let Some(path) = checkpoint::latest(dir)? {
                    restore_into(state, &path)?;
                }
            }
        }

        if !state.initialized {
            return Err(UnetError::state(match &self.restore_dir {
                Some(dir) => format!("no checkpoint found in {}", dir.display()),
                None => "no restore directory set and the model was never trained".to_string(),
            }));
        }

        let output = state.net.forward(image, 1.0)?;
        PixelSoftmax::forward(output, &mut state.probs);
        Ok(state.probs.clone())
    }

    /// Inference plus loss and metrics on a labelled sample, dropout off.
    pub fn evaluate(&self, sample: &Sample) -> Result<Evaluation> {
        let label = self.label_for(sample)?;
        let mut guard = self.lock()?;
        let state = &mut *guard;
        if !state.initialized {
            return Err(UnetError::state("evaluate called before initialize or restore"));
        }

        state.net.forward(&sample.image, 1.0)?;
        state.logits.copy_from(state.net.output());
        let out = state.cost.evaluate(&mut state.logits, &label, false)?;
        let penalty = state.cost.penalty(&state.net.params_and_grads());

        Ok(Evaluation {
            prediction: state.cost.probabilities().clone(),
            label,
            loss: out.loss + penalty,
            cross_entropy: out.cross_entropy,
            accuracy: out.accuracy,
            error_rate: metrics::error_rate_from_accuracy(out.accuracy),
        })
    }

    /// One forward pass with dropout, backpropagation and parameter update.
    pub fn train_step(
        &self,
        sample: &Sample,
        keep_prob: Float,
        optimizer: &mut Optimizer,
        learning_rate: Float,
        capture_gradients: bool,
    ) -> Result<StepOutput> {
        let label = self.label_for(sample)?;
        let mut guard = self.lock()?;
        let state = &mut *guard;

        state.net.forward(&sample.image, keep_prob)?;
        state.logits.copy_from(state.net.output());
        let out = state.cost.evaluate(&mut state.logits, &label, true)?;
        state.net.backward(&state.logits.dw)?;

        let mut params = state.net.params_and_grads();
        let penalty = state.cost.regularize(&mut params);
        let gradients =
            capture_gradients.then(|| params.iter().map(|p| p.grads.to_vec()).collect());
        optimizer.update(&mut params, learning_rate);

        state.initialized = true;

        Ok(StepOutput {
            loss: out.loss + penalty,
            cross_entropy: out.cross_entropy,
            accuracy: out.accuracy,
            gradients,
        })
    }

    /// Writes `<dir>/model.ckpt-<epoch>` and returns its path.
    pub fn save(&self, dir: &Path, epoch: usize) -> Result<PathBuf> {
        let mut guard = self.lock()?;
        let path = checkpoint::save(&mut guard.net, dir, epoch)?;
        debug!("Model saved in file: {}", path.display());
        Ok(path)
    }

    pub fn restore(&self, path: &Path) -> Result<()> {
        let mut guard = self.lock()?;
        restore_into(&mut guard, path)
    }

    /// Restores the newest checkpoint of `dir`. Fails when there is none.
    pub fn restore_latest(&self, dir: &Path) -> Result<PathBuf> {
        let path = checkpoint::latest(dir)?
            .ok_or_else(|| UnetError::state(format!("no checkpoint found in {}", dir.display())))?;
        self.restore(&path)?;
        Ok(path)
    }
}

fn restore_into(state: &mut ModelState, path: &Path) -> Result<()> {
    checkpoint::restore(&mut state.net, path)?;
    state.initialized = true;
    info!("Model restored from file: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{OptKwargs, OptimizerKind};

    fn tiny() -> Unet {
        let spec = NetworkSpec {
            channels: 1,
            n_class: 2,
            layers: 2,
            features_root: 2,
            filter_size: 3,
            pool_size: 2,
        };
        Unet::builder(spec).seed(3).build().unwrap()
    }

    fn striped_sample(size: usize) -> Sample {
        let image = Vol::from_data(
            size,
            size,
            1,
            (0..size * size).map(|i| ((i % size) / 4 % 2) as Float).collect(),
        )
        .unwrap();
        let mut label = Vol::zeros(size, size, 2);
        for (i, v) in image.w.iter().enumerate() {
            label.w[i * 2 + usize::from(*v > 0.5)] = 1.0;
        }
        Sample::new(image, label)
    }

    #[test]
    fn predict_without_checkpoint_is_a_state_error() {
        let unet = tiny();
        let err = unet.predict(&Vol::zeros(20, 20, 1)).unwrap_err();
        assert!(matches!(err, UnetError::State(_)));
    }

    #[test]
    fn evaluate_crops_label_to_output() {
        let unet = tiny();
        unet.initialize().unwrap();
        let eval = unet.evaluate(&striped_sample(28)).unwrap();
        let out = unet.output_shape(28, 28).unwrap();
        assert_eq!(eval.prediction.shape(), out);
        assert_eq!(eval.label.shape(), out);
        assert!(eval.loss.is_finite());
        assert!((eval.error_rate - (100.0 - 100.0 * eval.accuracy)).abs() < 1e-4);
    }

    #[test]
    fn training_reduces_loss() {
        let unet = tiny();
        let sample = striped_sample(28);
        let mut opt = Optimizer::new(
            OptimizerKind::Adam,
            &OptKwargs {
                learning_rate: Some(0.01),
                ..Default::default()
            },
        )
        .unwrap();

        unet.initialize().unwrap();
        let before = unet.evaluate(&sample).unwrap().loss;
        for _ in 0..30 {
            unet.train_step(&sample, 1.0, &mut opt, 0.01, false).unwrap();
        }
        let after = unet.evaluate(&sample).unwrap().loss;
        assert!(after < before, "loss went from {before} to {after}");
    }

    #[test]
    fn train_step_can_capture_gradients() {
        let unet = tiny();
        let mut opt = Optimizer::new(OptimizerKind::Momentum, &OptKwargs::default()).unwrap();
        let step = unet
            .train_step(&striped_sample(20), 0.75, &mut opt, 0.01, true)
            .unwrap();
        let grads = step.gradients.unwrap();
        assert!(!grads.is_empty());
        assert!(grads.iter().flatten().all(|g| g.is_finite()));
    }

    #[test]
    fn predict_keeps_parameters_trained_in_process() {
        let old = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let sample = striped_sample(28);

        let stale = tiny();
        stale.initialize().unwrap();
        stale.save(old.path(), 0).unwrap();

        let spec = *stale.spec();
        let unet = Unet::builder(spec).restore_dir(old.path()).seed(4).build().unwrap();
        let mut opt = Optimizer::new(OptimizerKind::Adam, &OptKwargs::default()).unwrap();
        for _ in 0..5 {
            unet.train_step(&sample, 1.0, &mut opt, 0.001, false).unwrap();
        }
        let trained = unet.predict(&sample.image).unwrap();
        unet.save(elsewhere.path(), 0).unwrap();

        let after_save = unet.predict(&sample.image).unwrap();
        assert_eq!(after_save.w, trained.w);
        assert_ne!(after_save.w, stale.predict(&sample.image).unwrap().w);
    }
}
