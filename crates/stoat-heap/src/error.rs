//! Heap error types

use thiserror::Error;

/// Errors reported when adopting a serialized heap image.
///
/// Allocation exhaustion is not an error: `alloc` and the typed
/// constructors return `None` once the failure handler declines.
/// Structural misuse (invalid positions, current-heap violations) is a
/// programming error and panics.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeapError {
    /// The image does not start with the heap magic number.
    #[error("invalid heap image: bad magic number")]
    BadMagic,

    /// The header's root references a position outside the used region.
    #[error("invalid heap image: root position {0:#x} out of range")]
    BadRootPosition(u32),

    /// A block header describes a block extending past the used region,
    /// or a block still carries a forwarding address.
    #[error("invalid heap image: corrupt block at {pos:#x}")]
    CorruptBlock {
        /// Position of the offending block header.
        pos: u32,
    },
}

/// Result type for heap operations
pub type HeapResult<T> = Result<T, HeapError>;
