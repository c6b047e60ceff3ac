//! Error types shared across the broker crates

/// Result type for shared helpers
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the shared helpers
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The system random number generator failed
    #[error("secure random generation failed")]
    Entropy,
}
