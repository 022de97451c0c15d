//! Error types for the tweak engine.

use thiserror::Error;

use crate::engine::FitState;

pub type TweakResult<T> = Result<T, TweakError>;

/// Errors reported by correspondence construction and the fit stages.
///
/// `Underdetermined` and `Numerical` are raised at a stage boundary; the
/// engine's model is left exactly as it was before the failing stage.
#[derive(Debug, Error)]
pub enum TweakError {
    /// Inconsistent inputs: mismatched sequence lengths, out-of-range
    /// correspondence indices, negative weights, a requested polynomial order
    /// above [`MAX_ORDER`](crate::sip::MAX_ORDER), or an empty correspondence
    /// set. Reported before any fitting is attempted.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Fewer usable (non-zero-weight, projectable) correspondences than the
    /// number of free parameters in the requested stage.
    #[error(
        "{stage} fit is underdetermined: {usable} usable correspondences \
         for {required} free parameters"
    )]
    Underdetermined {
        stage: FitState,
        usable: usize,
        required: usize,
    },

    /// The least-squares solve failed: singular or ill-conditioned design
    /// matrix, or a singular CD matrix.
    #[error("{stage} fit failed numerically with {usable} usable correspondences: {message}")]
    Numerical {
        stage: FitState,
        usable: usize,
        message: String,
    },
}

impl TweakError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn underdetermined(stage: FitState, usable: usize, required: usize) -> Self {
        Self::Underdetermined {
            stage,
            usable,
            required,
        }
    }

    pub fn numerical(stage: FitState, usable: usize, message: impl Into<String>) -> Self {
        Self::Numerical {
            stage,
            usable,
            message: message.into(),
        }
    }
}
