pub mod checkpoint;
pub mod config;
pub mod cost;
pub mod error;
pub mod layers;
pub mod metrics;
pub mod model;
pub mod net;
pub mod optimizer;
pub mod sample;
pub mod trainer;
pub mod utils;
pub mod visualize;
pub mod vol;

pub use config::RunConfig;
pub use cost::{ClassWeights, Cost, CostKind, CostKwargs, CostOutput};
pub use error::{Result, UnetError};
pub use model::{Evaluation, StepOutput, Unet, UnetBuilder};
pub use net::{Net, NetworkSpec};
pub use optimizer::{LearningRateSchedule, OptKwargs, Optimizer, OptimizerKind};
pub use sample::{FileSource, MemorySource, Sample, SampleFormat, SampleSource};
pub use trainer::{TrainOptions, Trainer, TrainerBuilder, TrainingState};
pub use vol::{Shape, Vol};

pub type Float = f32;
