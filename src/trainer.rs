use std::{
    fs, io,
    path::{Path, PathBuf},
};

use rand::{rngs::StdRng, Rng};
use tracing::{debug, error, info};

use crate::{
    checkpoint::CHECKPOINT_PREFIX,
    error::{Result, UnetError},
    model::{Evaluation, Unet},
    optimizer::{OptKwargs, Optimizer, OptimizerKind},
    sample::{Sample, SampleSource},
    utils::{l2_norm, make_rng},
    visualize, Float,
};

/// Options of a single `train` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainOptions {
    /// optimization steps per epoch
    pub training_iters: usize,
    pub epochs: usize,
    /// keep probability of the dropout layers
    pub dropout: Float,
    /// continue from the newest checkpoint instead of starting over
    pub restore: bool,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            training_iters: 10,
            epochs: 100,
            dropout: 0.75,
            restore: false,
        }
    }
}

/// Counters of the running `train` call. Never restored from checkpoints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingState {
    pub epoch: usize,
    pub global_step: usize,
    pub learning_rate: Float,
    /// running mean of the parameter gradients, with gradient tracking on
    pub avg_gradients: Option<Vec<Vec<Float>>>,
    /// L2 norm of each entry of `avg_gradients`
    pub norm_gradients: Vec<Float>,
}

impl TrainingState {
    // avg <- avg * (1 - 1/(step+1)) + g / (step+1)
    fn update_avg_gradients(&mut self, gradients: Vec<Vec<Float>>, step: usize) {
        let w = 1.0 / (step as Float + 1.0);
        let avg = self.avg_gradients.get_or_insert_with(|| {
            gradients.iter().map(|g| vec![0.0; g.len()]).collect()
        });

        for (a, g) in avg.iter_mut().zip(&gradients) {
            for (a, g) in a.iter_mut().zip(g) {
                *a = *a * (1.0 - w) + g * w;
            }
        }
        self.norm_gradients = avg.iter().map(|a| l2_norm(a)).collect();
    }
}

/// Drives the optimization of a [`Unet`]: samples training data, applies
/// updates, verifies after every epoch and writes a checkpoint per epoch.
pub struct Trainer<'unet> {
    unet: &'unet Unet,
    optimizer: Optimizer,

    norm_grads: bool,
    prediction_path: PathBuf,
    restore_dir: Option<PathBuf>,
    display_step: Option<usize>,
    rng: StdRng,

    state: TrainingState,
}

impl<'unet> Trainer<'unet> {
    pub fn builder(unet: &Unet) -> TrainerBuilder<'_> {
        TrainerBuilder::new(unet)
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn prediction_path(&self) -> &Path {
        &self.prediction_path
    }

    /// Runs the whole optimization and returns the path of the last
    /// checkpoint. With zero epochs nothing happens and `<output>/model.ckpt`
    /// is returned.
    pub fn train(
        &mut self,
        output_path: &Path,
        train: &dyn SampleSource,
        verification: &dyn SampleSource,
        options: &TrainOptions,
    ) -> Result<PathBuf> {
        let save_path = output_path.join(CHECKPOINT_PREFIX);
        if options.epochs == 0 {
            return Ok(save_path);
        }

        let mut errors = Vec::new();
        if options.training_iters == 0 {
            errors.push("training_iters must be greater than 0".to_string());
        }
        if !(options.dropout > 0.0 && options.dropout <= 1.0) {
            errors.push(format!("dropout must be in (0, 1], got {}", options.dropout));
        }
        if train.is_empty() {
            errors.push("no training samples".to_string());
        }
        if verification.is_empty() {
            errors.push("no verification samples".to_string());
        }
        if !errors.is_empty() {
            return Err(UnetError::validation(errors));
        }

        self.state = TrainingState::default();
        self.initialize(output_path, options.restore)
            .inspect_err(|err| {
                error!(epoch = 0, step = 0, "initializing the run failed: {err}")
            })?;

        info!("Start optimization");

        self.store_prediction(verification, "_init")
            .inspect_err(|err| error!(epoch = 0, step = 0, "initial verification failed: {err}"))?;

        let mut last_path = save_path;
        for epoch in 0..options.epochs {
            self.state.epoch = epoch;

            let mut total_loss = 0.0;
            for step in (epoch * options.training_iters)..((epoch + 1) * options.training_iters) {
                let loss = self
                    .train_iteration(step, train, options.dropout)
                    .inspect_err(|err| error!(epoch, step, "training step failed: {err}"))?;
                total_loss += loss;
            }

            self.output_epoch_stats(epoch, total_loss, options.training_iters);

            self.store_prediction(verification, &format!("epoch_{epoch}"))
                .inspect_err(|err| error!(epoch, "verification failed: {err}"))?;

            last_path = self
                .unet
                .save(output_path, epoch)
                .inspect_err(|err| error!(epoch, "saving checkpoint failed: {err}"))?;
        }

        info!("Optimization Finished!");
        Ok(last_path)
    }

    fn initialize(&self, output_path: &Path, restore: bool) -> Result<()> {
        if !restore {
            for dir in [self.prediction_path.as_path(), output_path] {
                info!("Removing '{}'", dir.display());
                match fs::remove_dir_all(dir) {
                    Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
                    _ => {}
                }
            }
        }

        for dir in [self.prediction_path.as_path(), output_path] {
            if !dir.exists() {
                info!("Allocating '{}'", dir.display());
                fs::create_dir_all(dir)?;
            }
        }

        if restore {
            let dir = self.restore_dir.as_deref().unwrap_or(output_path);
            self.unet.restore_latest(dir)?;
        } else {
            self.unet.initialize()?;
        }
        Ok(())
    }

    /// Draws a sample with a 1-based index and checks it against the network.
    fn draw(&mut self, source: &dyn SampleSource) -> Result<(usize, Sample)> {
        let index = self.rng.gen_range(1..=source.len());
        let sample = source.load(index)?;
        let spec = self.unet.spec();
        sample.validate(index, spec.channels, spec.n_class)?;
        Ok((index, sample))
    }

    fn train_iteration(&mut self, step: usize, train: &dyn SampleSource, dropout: Float) -> Result<Float> {
        let (index, sample) = self.draw(train)?;

        self.state.learning_rate = self.optimizer.learning_rate(self.state.global_step);
        let out = self
            .unet
            .train_step(
                &sample,
                dropout,
                &mut self.optimizer,
                self.state.learning_rate,
                self.norm_grads,
            )
            .map_err(|err| as_data_error(err, index))?;

        if let Some(gradients) = out.gradients {
            self.state.update_avg_gradients(gradients, step);
        }

        if let Some(display_step) = self.display_step {
            if step % display_step == 0 {
                self.output_minibatch_stats(step, &sample, index)?;
            }
        }

        self.state.global_step += 1;
        Ok(out.loss)
    }

    fn output_minibatch_stats(&self, step: usize, sample: &Sample, index: usize) -> Result<()> {
        let eval = self
            .unet
            .evaluate(sample)
            .map_err(|err| as_data_error(err, index))?;
        info!(
            "Iter {}, Minibatch Loss= {:.4}, Training Accuracy= {:.4}, Minibatch error= {:.1}%",
            step, eval.loss, eval.accuracy, eval.error_rate
        );
        Ok(())
    }

    fn output_epoch_stats(&self, epoch: usize, total_loss: Float, training_iters: usize) {
        info!(
            "Epoch {}, learning rate: {:.8}, Average loss: {:.12}",
            epoch,
            self.state.learning_rate,
            total_loss / training_iters as Float
        );
    }

    fn store_prediction(&mut self, verification: &dyn SampleSource, name: &str) -> Result<Evaluation> {
        let (index, sample) = self.draw(verification)?;
        let eval = self
            .unet
            .evaluate(&sample)
            .map_err(|err| as_data_error(err, index))?;

        info!("Verification loss= {:.4}", eval.loss);
        debug!("Verification error= {:.1}%", eval.error_rate);

        visualize::save_class_images(
            &self.prediction_path,
            name,
            &sample.image,
            &eval.label,
            &eval.prediction,
        )?;
        Ok(eval)
    }
}

// a sample the network cannot digest is a data problem of that sample
fn as_data_error(err: UnetError, index: usize) -> UnetError {
    match err {
        UnetError::Shape(reason) => UnetError::data(index, reason),
        other => other,
    }
}

pub struct TrainerBuilder<'unet> {
    unet: &'unet Unet,

    optimizer_kind: OptimizerKind,
    opt_kwargs: OptKwargs,
    norm_grads: bool,
    prediction_path: PathBuf,
    restore_dir: Option<PathBuf>,
    display_step: Option<usize>,
    seed: Option<u64>,
}

impl<'unet> TrainerBuilder<'unet> {
    fn new(unet: &'unet Unet) -> Self {
        Self {
            unet,

            optimizer_kind: OptimizerKind::Momentum,
            opt_kwargs: OptKwargs::default(),
            norm_grads: false,
            prediction_path: PathBuf::from("prediction"),
            restore_dir: unet.restore_dir().map(Path::to_path_buf),
            display_step: None,
            seed: None,
        }
    }

    pub fn optimizer(mut self, kind: OptimizerKind, kwargs: OptKwargs) -> Self {
        self.optimizer_kind = kind;
        self.opt_kwargs = kwargs;
        self
    }

    /// track the running mean of the gradients and its norms
    ///
    /// default: false
    pub fn norm_grads(mut self, value: bool) -> Self {
        self.norm_grads = value;
        self
    }

    /// directory receiving the verification images
    ///
    /// default: "prediction"
    pub fn prediction_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.prediction_path = path.into();
        self
    }

    /// where `restore` looks for checkpoints
    ///
    /// default: the model's restore directory, else the output path
    pub fn restore_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.restore_dir = Some(path.into());
        self
    }

    /// log minibatch statistics every `value` steps
    pub fn display_step(mut self, value: usize) -> Self {
        self.display_step = Some(value);
        self
    }

    /// seed for sample selection
    pub fn seed(mut self, value: u64) -> Self {
        self.seed = Some(value);
        self
    }

    pub fn build(self) -> Result<Trainer<'unet>> {
        if self.display_step == Some(0) {
            return Err(UnetError::config("display_step must be greater than 0"));
        }
        let optimizer = Optimizer::new(self.optimizer_kind, &self.opt_kwargs)?;

        Ok(Trainer {
            unet: self.unet,
            optimizer,
            norm_grads: self.norm_grads,
            prediction_path: self.prediction_path,
            restore_dir: self.restore_dir,
            display_step: self.display_step,
            rng: make_rng(self.seed),
            state: TrainingState::default(),
        })
    }
}
