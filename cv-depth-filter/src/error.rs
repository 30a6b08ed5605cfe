use crate::FrameKey;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DepthFilterError {
    #[error("frame {0:?} is not in the map data")]
    UnknownFrame(FrameKey),
    #[error("depth prior must be finite and positive, got mean {mean} and minimum {min}")]
    InvalidDepthPrior { mean: f64, min: f64 },
}

pub type Result<T> = std::result::Result<T, DepthFilterError>;
