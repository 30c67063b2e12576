use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    cost::{Cost, CostKind, CostKwargs},
    error::{Result, UnetError},
    model::Unet,
    net::NetworkSpec,
    optimizer::{Optimizer, OptKwargs, OptimizerKind},
    sample::{FileSource, SampleFormat},
    trainer::{TrainOptions, Trainer},
    Float,
};

/// Everything a training or prediction run needs, read from one JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    // network
    pub channels: usize,
    pub n_class: usize,
    pub layers: usize,
    pub features_root: usize,
    pub filter_size: usize,
    pub pool_size: usize,

    // loss
    pub cost_kind: CostKind,
    pub cost_kwargs: CostKwargs,

    // optimization
    pub optimizer_kind: OptimizerKind,
    pub opt_kwargs: OptKwargs,
    pub training_iters: usize,
    pub epochs: usize,
    /// keep probability of the dropout layers while training
    pub dropout: Float,
    pub restore: bool,
    pub norm_grads: bool,
    pub display_step: Option<usize>,
    pub seed: Option<u64>,

    // paths
    pub output_path: PathBuf,
    pub prediction_path: PathBuf,
    /// checkpoint directory used to restore; defaults to `output_path`
    pub restore_dir: Option<PathBuf>,
    pub data_path: PathBuf,

    // samples
    pub train_count: usize,
    pub verification_count: usize,
    pub sample_format: SampleFormat,
    pub train_image_stem: String,
    pub train_label_stem: String,
    pub verification_image_stem: String,
    pub verification_label_stem: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        let spec = NetworkSpec::default();
        Self {
            channels: spec.channels,
            n_class: spec.n_class,
            layers: spec.layers,
            features_root: spec.features_root,
            filter_size: spec.filter_size,
            pool_size: spec.pool_size,
            cost_kind: CostKind::CrossEntropy,
            cost_kwargs: CostKwargs::default(),
            optimizer_kind: OptimizerKind::Momentum,
            opt_kwargs: OptKwargs::default(),
            training_iters: 10,
            epochs: 100,
            dropout: 0.75,
            restore: false,
            norm_grads: false,
            display_step: None,
            seed: None,
            output_path: PathBuf::from("unet_trained"),
            prediction_path: PathBuf::from("prediction"),
            restore_dir: None,
            data_path: PathBuf::from("data"),
            train_count: 0,
            verification_count: 0,
            sample_format: SampleFormat::Json,
            train_image_stem: "train_image".to_string(),
            train_label_stem: "train_label".to_string(),
            verification_image_stem: "val_image".to_string(),
            verification_label_stem: "val_label".to_string(),
        }
    }
}

impl RunConfig {
    /// Reads and validates a config file. Relative paths inside it are taken
    /// relative to the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|err| UnetError::config(format!("{}: {err}", path.display())))?;
        let mut config: RunConfig = serde_json::from_str(&contents)
            .map_err(|err| UnetError::config(format!("{}: {err}", path.display())))?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;
        Ok(config)
    }

    fn apply_base_path(&mut self, base_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base_dir.join(&*p);
            }
        };
        resolve(&mut self.output_path);
        resolve(&mut self.prediction_path);
        resolve(&mut self.data_path);
        if let Some(dir) = self.restore_dir.as_mut() {
            resolve(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if let Err(UnetError::Config(message)) = self.network_spec().validate() {
            errors.push(message);
        }
        if self.training_iters == 0 {
            errors.push("training_iters must be greater than 0".to_string());
        }
        if !(self.dropout > 0.0 && self.dropout <= 1.0) {
            errors.push(format!("dropout must be in (0, 1], got {}", self.dropout));
        }
        if self.display_step == Some(0) {
            errors.push("display_step must be greater than 0".to_string());
        }
        if let Err(UnetError::Config(message)) =
            Optimizer::new(self.optimizer_kind, &self.opt_kwargs)
        {
            errors.push(message);
        }
        if let Err(UnetError::Config(message)) =
            Cost::new(self.cost_kind, &self.cost_kwargs, self.n_class)
        {
            errors.push(message);
        }

        if !errors.is_empty() {
            return Err(UnetError::validation(errors));
        }
        Ok(())
    }

    pub fn network_spec(&self) -> NetworkSpec {
        NetworkSpec {
            channels: self.channels,
            n_class: self.n_class,
            layers: self.layers,
            features_root: self.features_root,
            filter_size: self.filter_size,
            pool_size: self.pool_size,
        }
    }

    pub fn restore_dir(&self) -> &Path {
        self.restore_dir.as_deref().unwrap_or(self.output_path.as_path())
    }

    pub fn build_model(&self) -> Result<Unet> {
        let mut builder = Unet::builder(self.network_spec())
            .cost(self.cost_kind, self.cost_kwargs.clone())
            .restore_dir(self.restore_dir());
        if let Some(seed) = self.seed {
            builder = builder.seed(seed);
        }
        builder.build()
    }

    pub fn build_trainer<'a>(&self, unet: &'a Unet) -> Result<Trainer<'a>> {
        let mut builder = Trainer::builder(unet)
            .optimizer(self.optimizer_kind, self.opt_kwargs.clone())
            .norm_grads(self.norm_grads)
            .prediction_path(&self.prediction_path)
            .restore_dir(self.restore_dir());
        if let Some(step) = self.display_step {
            builder = builder.display_step(step);
        }
        if let Some(seed) = self.seed {
            builder = builder.seed(seed);
        }
        builder.build()
    }

    pub fn train_options(&self) -> TrainOptions {
        TrainOptions {
            training_iters: self.training_iters,
            epochs: self.epochs,
            dropout: self.dropout,
            restore: self.restore,
        }
    }

    pub fn train_source(&self) -> FileSource {
        FileSource::new(
            &self.data_path,
            &self.train_image_stem,
            &self.train_label_stem,
            self.train_count,
            self.sample_format,
        )
    }

    pub fn verification_source(&self) -> FileSource {
        FileSource::new(
            &self.data_path,
            &self.verification_image_stem,
            &self.verification_label_stem,
            self.verification_count,
            self.sample_format,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RunConfig {
        RunConfig {
            train_count: 4,
            verification_count: 2,
            ..Default::default()
        }
    }

    #[test]
    fn default_run_settings() {
        let config = RunConfig::default();
        assert_eq!(config.training_iters, 10);
        assert_eq!(config.epochs, 100);
        assert_eq!(config.dropout, 0.75);
        assert_eq!(config.optimizer_kind, OptimizerKind::Momentum);
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn collects_every_problem() {
        let config = RunConfig {
            layers: 0,
            dropout: 0.0,
            training_iters: 0,
            ..valid()
        };
        let Err(UnetError::Config(message)) = config.validate() else {
            panic!("expected a config error");
        };
        assert!(message.contains("layers"));
        assert!(message.contains("dropout"));
        assert!(message.contains("training_iters"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_json::from_str::<RunConfig>(r#"{"layers": 2, "batch_size": 4}"#);
        assert!(err.is_err());
        let err = serde_json::from_str::<RunConfig>(r#"{"cost_kind": "focal"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: RunConfig = serde_json::from_str(
            r#"{"layers": 2, "optimizer_kind": "adam", "opt_kwargs": {"learning_rate": 0.0005}}"#,
        )
        .unwrap();
        assert_eq!(config.layers, 2);
        assert_eq!(config.features_root, 16);
        assert_eq!(config.opt_kwargs.learning_rate, Some(0.0005));
    }

    #[test]
    fn optimizer_keys_are_checked_against_kind() {
        let config = RunConfig {
            optimizer_kind: OptimizerKind::Adam,
            opt_kwargs: OptKwargs {
                learning_rate_step: Some(vec![10]),
                ..Default::default()
            },
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_paths_follow_config_file() {
        let mut config = valid();
        config.apply_base_path(Path::new("/runs/a"));
        assert_eq!(config.output_path, PathBuf::from("/runs/a/unet_trained"));
        assert_eq!(config.restore_dir(), Path::new("/runs/a/unet_trained"));
    }
}
