//! Queue construction parameters.

use tracing::debug;

use crate::cursor::CursorPolicy;
use crate::error::ConfigError;
use crate::queue::Queue;
use crate::table::MAX_CAPACITY;

/// Parameters of a [`Queue`].
///
/// # Examples
///
/// ```
/// use nbqueue::{Config, CursorPolicy};
///
/// let queue = Config {
///     init_size: 16,
///     bucket_width: 0.5,
///     cursor: CursorPolicy::Basic,
///     ..Config::default()
/// }
/// .build::<String>()
/// .unwrap();
/// assert_eq!(queue.capacity(), 16);
/// ```
///
/// [`Queue`]: struct.Queue.html
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Config {
    /// Number of buckets the table starts with. Must be a power of two.
    pub init_size: u32,
    /// Time span covered by one bucket.
    pub bucket_width: f64,
    /// Whether enqueuers help migrate staged events after an expansion. Otherwise only the
    /// expanding dequeuers do.
    pub collaborative_drain: bool,
    /// How enqueuers move the cursor back.
    pub cursor: CursorPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            init_size: 64,
            bucket_width: 1.0,
            collaborative_drain: false,
            cursor: CursorPolicy::default(),
        }
    }
}

impl Config {
    /// Checks the parameters without building anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.init_size == 0 {
            return Err(ConfigError::ZeroSize);
        }
        if !self.init_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo(self.init_size));
        }
        if self.init_size > MAX_CAPACITY {
            return Err(ConfigError::TooLarge(self.init_size, MAX_CAPACITY));
        }
        if !self.bucket_width.is_finite() || self.bucket_width <= 0.0 {
            return Err(ConfigError::BadWidth(self.bucket_width));
        }
        Ok(())
    }

    /// Builds an empty queue.
    pub fn build<T>(&self) -> Result<Queue<T>, ConfigError> {
        self.validate()?;
        debug!(
            init_size = self.init_size,
            bucket_width = self.bucket_width,
            collaborative = self.collaborative_drain,
            cursor = ?self.cursor,
            "creating queue"
        );
        Ok(Queue::with_config(self))
    }
}
