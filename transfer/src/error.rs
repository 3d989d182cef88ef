use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use image::ImageError;
use machine_learning::MlErr;
use safetensors::SafeTensorError;

/// The result type used in the entire transfer crate.
pub type Result<T> = std::result::Result<T, TransferErr>;

/// Everything that can stop a transfer run.
#[derive(Debug)]
pub enum TransferErr {
    Io(io::Error),
    Ml(MlErr),
    Safetensors(SafeTensorError),
    Json(serde_json::Error),
    Image(ImageError),
    InvalidConfig(String),
    InvalidCheckpoint(String),
    Dataset(String),
    StaleCapture {
        layer: usize,
        captured: Option<u64>,
        current: u64,
    },
}

impl From<io::Error> for TransferErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<MlErr> for TransferErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}

impl From<SafeTensorError> for TransferErr {
    fn from(value: SafeTensorError) -> Self {
        Self::Safetensors(value)
    }
}

impl From<serde_json::Error> for TransferErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<ImageError> for TransferErr {
    fn from(value: ImageError) -> Self {
        Self::Image(value)
    }
}

impl From<ndarray::ShapeError> for TransferErr {
    fn from(value: ndarray::ShapeError) -> Self {
        Self::Ml(MlErr::Shape(value))
    }
}

impl Display for TransferErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferErr::Io(e) => write!(f, "io error: {e}"),
            TransferErr::Ml(e) => write!(f, "model error: {e}"),
            TransferErr::Safetensors(e) => write!(f, "checkpoint encoding error: {e}"),
            TransferErr::Json(e) => write!(f, "checkpoint metadata error: {e}"),
            TransferErr::Image(e) => write!(f, "image error: {e}"),
            TransferErr::InvalidConfig(e) => write!(f, "invalid config: {e}"),
            TransferErr::InvalidCheckpoint(e) => write!(f, "invalid checkpoint: {e}"),
            TransferErr::Dataset(e) => write!(f, "dataset error: {e}"),
            TransferErr::StaleCapture {
                layer,
                captured: Some(captured),
                current,
            } => write!(
                f,
                "activation capture of norm layer {layer} comes from pass {captured}, expected a training pass {current}"
            ),
            TransferErr::StaleCapture {
                layer,
                captured: None,
                current,
            } => write!(
                f,
                "norm layer {layer} has no activation capture for pass {current}"
            ),
        }
    }
}

impl Error for TransferErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TransferErr::Io(e) => Some(e),
            TransferErr::Ml(e) => Some(e),
            TransferErr::Safetensors(e) => Some(e),
            TransferErr::Json(e) => Some(e),
            TransferErr::Image(e) => Some(e),
            _ => None,
        }
    }
}
