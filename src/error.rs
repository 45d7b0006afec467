use thiserror::Error;

/// Errors surfaced by the measurement algorithms.
///
/// Recoverable per-pixel and per-candidate conditions (a postage stamp that
/// would fall off its parent image, a zero-variance pixel) are absorbed where
/// they occur and never reach the caller.
#[derive(Error, Debug)]
pub enum MeasError {
    /// A precondition on an argument was violated, e.g. an empty kernel
    /// basis list or a duplicate factory registration.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A lookup by name failed, e.g. an unknown PSF variety or mask plane.
    #[error("not found: {0}")]
    NotFound(String),

    /// A computation left its valid range, e.g. a kernel fit whose model
    /// norm is zero.
    #[error("range error: {0}")]
    Range(String),

    /// A rectangle or position fell outside the image it refers to.
    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    /// A quantity left its mathematical domain, e.g. a non-positive
    /// normalizer in a PSF moment.
    #[error("domain error: {0}")]
    Domain(String),
}

impl MeasError {
    /// Annotate the error message with the position of the object that was
    /// being measured when it occurred.
    pub fn at_position(self, x: f64, y: f64) -> MeasError {
        let ctx = format!("object at ({:.2}, {:.2})", x, y);
        match self {
            MeasError::InvalidArgument(m) => MeasError::InvalidArgument(format!("{}: {}", ctx, m)),
            MeasError::NotFound(m) => MeasError::NotFound(format!("{}: {}", ctx, m)),
            MeasError::Range(m) => MeasError::Range(format!("{}: {}", ctx, m)),
            MeasError::OutOfBounds(m) => MeasError::OutOfBounds(format!("{}: {}", ctx, m)),
            MeasError::Domain(m) => MeasError::Domain(format!("{}: {}", ctx, m)),
        }
    }
}

pub type Result<T> = std::result::Result<T, MeasError>;
