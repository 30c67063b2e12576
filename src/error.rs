use std::path::PathBuf;

pub type Result<T, E = UnetError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum UnetError {
    /// Rejected before any training step runs: unknown loss or optimizer,
    /// malformed schedule, invalid network spec, unknown config keys.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A sample could not be loaded or does not fit the network.
    #[error("sample {index}: {reason}")]
    Data { index: usize, reason: String },

    #[error("model not initialized: {0}")]
    State(String),

    #[error("checkpoint {}: {reason}", path.display())]
    Checkpoint { path: PathBuf, reason: String },

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image: {0}")]
    Image(#[from] image::ImageError),
}

impl UnetError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn data(index: usize, reason: impl Into<String>) -> Self {
        Self::Data {
            index,
            reason: reason.into(),
        }
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }

    pub fn checkpoint(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Checkpoint {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape(message.into())
    }

    /// Collapses a list of validation problems into one configuration error.
    pub fn validation(messages: Vec<String>) -> Self {
        Self::Config(messages.join("; "))
    }
}
