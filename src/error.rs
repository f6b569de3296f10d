use thiserror::Error;

/// Reasons a [`Config`](struct.Config.html) cannot build a queue.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// The initial bucket count is zero.
    #[error("initial size must be at least one bucket")]
    ZeroSize,
    /// The initial bucket count is not a power of two.
    #[error("initial size {0} is not a power of two")]
    NotPowerOfTwo(u32),
    /// The initial bucket count exceeds the addressable range.
    #[error("initial size {0} exceeds the maximum of {1} buckets")]
    TooLarge(u32, u32),
    /// The bucket width is zero, negative, infinite or NaN.
    #[error("bucket width {0} is not a positive finite number")]
    BadWidth(f64),
}
