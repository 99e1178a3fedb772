//! Error types for the lifting pipeline.

/// A recoverable failure confined to one execution path.
///
/// The path that raised it is discarded; the run continues with the
/// remaining paths.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PathError {
    #[error("Symbolic stack grew past {max} entries ({size})")]
    StackSizeOverflow { size: usize, max: usize },

    #[error("Popped an empty symbolic stack")]
    StackUnderflow,

    #[error("Memory slice could not be extended: {0}")]
    MemoryLengthExtend(String),

    #[error("Memory request could not be resolved: {0}")]
    MemoryUnresolvable(String),
}
