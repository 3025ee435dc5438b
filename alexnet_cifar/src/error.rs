//! Error type shared by the network, the loss, the data pipeline and the
//! training loop. Every variant is fatal for the current run.

use thiserror::Error;

use crate::trainer::Phase;

#[derive(Debug, Error)]
pub enum Error {
    #[error("shape mismatch in {stage}: expected {expected}, got {actual:?}")]
    ShapeMismatch {
        stage: String,
        expected: String,
        actual: Vec<usize>,
    },

    #[error("invalid label {label} for sample {index}: labels must lie in [0, {num_classes})")]
    InvalidLabel {
        label: usize,
        index: usize,
        num_classes: usize,
    },

    #[error("non-finite {quantity} in {stage}")]
    NumericalInstability { stage: String, quantity: &'static str },

    #[error("{phase} failed at epoch {epoch}, batch {batch}")]
    Batch {
        phase: Phase,
        epoch: usize,
        batch: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("{operation} is not allowed during {phase}")]
    InvalidPhase { operation: &'static str, phase: Phase },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Attaches the loop position at which the error surfaced.
    pub fn at_batch(self, phase: Phase, epoch: usize, batch: usize) -> Self {
        Error::Batch {
            phase,
            epoch,
            batch,
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping loop position wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Batch { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
