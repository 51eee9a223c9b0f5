pub mod byob;
pub mod chunk;
pub mod deferred;
pub mod error;
pub mod lock;
pub mod pipe;
pub mod queue;
pub mod readable;
pub mod reader;
pub mod transform;
pub mod writable;
pub mod writer;

// Re-export main types
pub use byob::*;
pub use chunk::*;
pub use deferred::{Deferred, DeferredFuture, forward, forward_future};
pub use error::*;
pub use lock::*;
pub use pipe::*;
pub use queue::*;
pub use readable::*;
pub use reader::*;
pub use transform::*;
pub use writable::*;
pub use writer::*;

use crate::platform::BoxedStrategy;

pub type StreamResult<T> = Result<T, StreamError>;

/// Chunk sizing and high-water mark used to compute `desired_size`.
pub trait QueuingStrategy {
    /// Return the size of the chunk
    fn size(&self, chunk: &Chunk) -> usize;
    /// Return high water mark (desired max queue size)
    fn high_water_mark(&self) -> usize;
}

/// Count-based strategy
#[derive(Clone)]
pub struct CountQueuingStrategy {
    high_water_mark: usize,
}

impl CountQueuingStrategy {
    pub const fn new(high_water_mark: usize) -> Self {
        Self { high_water_mark }
    }
}

impl QueuingStrategy for CountQueuingStrategy {
    fn size(&self, _chunk: &Chunk) -> usize {
        1
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

/// Byte length strategy
#[derive(Clone)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: usize,
}

impl ByteLengthQueuingStrategy {
    pub const fn new(high_water_mark: usize) -> Self {
        Self { high_water_mark }
    }
}

impl QueuingStrategy for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &Chunk) -> usize {
        chunk.len()
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

/// Which built-in strategy a [`StreamConfig`] selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum StrategyKind {
    #[default]
    Count,
    ByteLength,
}

/// Declarative stream configuration, loadable by hosts from their own
/// config files when the `serde` feature is on.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StreamConfig {
    pub high_water_mark: usize,
    pub strategy: StrategyKind,
    /// Size of the view allocated for default reads on a byte stream.
    pub auto_allocate_chunk_size: Option<usize>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 1,
            strategy: StrategyKind::Count,
            auto_allocate_chunk_size: None,
        }
    }
}

impl StreamConfig {
    pub(crate) fn boxed_strategy(&self) -> BoxedStrategy {
        match self.strategy {
            StrategyKind::Count => Box::new(CountQueuingStrategy::new(self.high_water_mark)),
            StrategyKind::ByteLength => {
                Box::new(ByteLengthQueuingStrategy::new(self.high_water_mark))
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_strategy_counts_chunks() {
        let strategy = CountQueuingStrategy::new(3);
        assert_eq!(strategy.size(&Chunk::from("abcdef")), 1);
        assert_eq!(strategy.high_water_mark(), 3);
    }

    #[test]
    fn byte_strategy_measures_visible_bytes() {
        let strategy = ByteLengthQueuingStrategy::new(16);
        let mut chunk = Chunk::from("abcdef");
        chunk.advance(2);
        assert_eq!(strategy.size(&chunk), 4);
    }

    #[test]
    fn config_builds_matching_strategy() {
        let config = StreamConfig {
            high_water_mark: 64,
            strategy: StrategyKind::ByteLength,
            auto_allocate_chunk_size: Some(16),
        };
        let strategy = config.boxed_strategy();
        assert_eq!(strategy.high_water_mark(), 64);
        assert_eq!(strategy.size(&Chunk::from("abc")), 3);
    }
}
