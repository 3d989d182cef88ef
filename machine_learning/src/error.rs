use std::{
    error::Error,
    fmt::{self, Display},
};

use ndarray::ShapeError;
use rand_distr::{NormalError, uniform::Error as UniformError};

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    SizeMismatch {
        a: &'static str,
        b: &'static str,
        got: usize,
        expected: usize,
    },
    Shape(ShapeError),
    BackwardBeforeForward {
        layer: &'static str,
    },
    LabelOutOfRange {
        label: usize,
        classes: usize,
    },
    InvalidDistribution(String),
    HooksAlreadyInstalled,
}

impl From<ShapeError> for MlErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<NormalError> for MlErr {
    fn from(value: NormalError) -> Self {
        Self::InvalidDistribution(value.to_string())
    }
}

impl From<UniformError> for MlErr {
    fn from(value: UniformError) -> Self {
        Self::InvalidDistribution(value.to_string())
    }
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MlErr::SizeMismatch {
                a,
                b,
                got,
                expected,
            } => {
                format!(
                    "There's a size mismatch between {a} and {b}, got {got} and expected {expected}"
                )
            }
            MlErr::Shape(e) => format!("Invalid tensor shape: {e}"),
            MlErr::BackwardBeforeForward { layer } => {
                format!("Called backward on a {layer} layer without a training forward pass")
            }
            MlErr::LabelOutOfRange { label, classes } => {
                format!("Label {label} is out of range for a model with {classes} classes")
            }
            MlErr::InvalidDistribution(e) => format!("Invalid weight distribution: {e}"),
            MlErr::HooksAlreadyInstalled => {
                "Forward hooks were already installed on this model".to_string()
            }
        };

        write!(f, "{s}")
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::Shape(e) => Some(e),
            _ => None,
        }
    }
}
