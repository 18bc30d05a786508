//! Error type shared by loading, installation and fusion

use burn_ipadapter_convert::IpAdapterLoadError;

use crate::patch::BlockPosition;

/// Errors raised by the IP-Adapter
///
/// All of them are configuration or caller errors; none is transient.
#[derive(Debug, thiserror::Error)]
pub enum IpAdapterError {
    /// Checkpoint weights disagree with the topology table or with each other
    #[error("Shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Host model has no usable cross-attention layer where one is expected
    #[error("Unsupported topology at {position}: {reason}")]
    UnsupportedTopology {
        position: BlockPosition,
        reason: String,
    },

    /// Fusion was called with a batch that is not a cond/uncond pair
    #[error("Batch size {batch} is odd; expected unconditioned and conditioned halves")]
    BatchSizeContractViolation { batch: usize },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] IpAdapterLoadError),

    #[error("Preprocess error: {0}")]
    Preprocess(String),
}

impl IpAdapterError {
    pub(crate) fn shape_mismatch(
        what: impl Into<String>,
        expected: &[usize],
        actual: &[usize],
    ) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
