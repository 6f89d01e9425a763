//! Error taxonomy shared by every fallible operation in the engine.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate's public API.
pub type TrainingResult<T> = Result<T, TrainingError>;

/// Every way a training run can fail or be interrupted.
///
/// Variants are grouped by how a caller should react: [`TrainingError::InvalidConfig`]
/// and [`TrainingError::AllocationFailure`] are fatal to construction;
/// [`TrainingError::NonFiniteGradient`] and [`TrainingError::NonFiniteLoss`] are
/// recoverable (the optimizer step for that epoch is skipped, training continues);
/// [`TrainingError::Cancelled`] is not a failure so much as a deliberate stop.
#[derive(Debug, Error)]
pub enum TrainingError {
    /// A [`crate::config::TrainingConfig`] failed validation before any allocation happened.
    #[error("invalid training configuration: {0}")]
    InvalidConfig(String),

    /// A parameter, gradient, or scratch buffer could not be allocated.
    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    /// A kernel received operands whose shapes do not agree.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A gradient segment contained a NaN or infinite value. The offending
    /// epoch's optimizer step is skipped; training may continue.
    #[error("non-finite gradient encountered at step {step} ({detail})")]
    NonFiniteGradient { step: u64, detail: String },

    /// The scalar loss for a batch was NaN or infinite.
    #[error("non-finite loss encountered at step {step}")]
    NonFiniteLoss { step: u64 },

    /// A worker sphere poisoned itself (typically after an allocation
    /// failure) and the epoch was aborted before the optimizer step ran.
    #[error("training aborted: {0}")]
    TrainingAborted(String),

    /// `TrainingHandle::cancel` was invoked; the epoch returned before
    /// applying its optimizer step.
    #[error("training cancelled")]
    Cancelled,

    /// `Model::save`/`Model::load` hit a filesystem or format error.
    #[error("io error at {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The on-disk model format did not match the shape constants of the
    /// config (or vice versa) it was being loaded into.
    #[error("model format error: {0}")]
    FormatError(String),
}

impl TrainingError {
    /// True for errors that do not indicate a bug or permanent loss of
    /// training state — the caller may reasonably retry the epoch.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TrainingError::NonFiniteGradient { .. } | TrainingError::NonFiniteLoss { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_finite_variants_are_recoverable() {
        let e = TrainingError::NonFiniteGradient {
            step: 3,
            detail: "segment 2".into(),
        };
        assert!(e.is_recoverable());
        let e = TrainingError::NonFiniteLoss { step: 3 };
        assert!(e.is_recoverable());
    }

    #[test]
    fn structural_errors_are_not_recoverable() {
        assert!(!TrainingError::InvalidConfig("bad".into()).is_recoverable());
        assert!(!TrainingError::Cancelled.is_recoverable());
        assert!(!TrainingError::TrainingAborted("poisoned".into()).is_recoverable());
    }

    #[test]
    fn display_messages_are_human_readable() {
        let e = TrainingError::ShapeMismatch("expected [4,4], got [4,5]".into());
        assert_eq!(
            e.to_string(),
            "shape mismatch: expected [4,4], got [4,5]"
        );
    }
}
