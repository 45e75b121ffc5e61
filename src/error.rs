//! The repository-level error taxonomy: every sub-crate's error type folded
//! into one enum via `#[from]`, plus the facade's own lifecycle errors.
//! Mirrors the teacher's `toka-kernel::KernelError`, which does the same
//! folding over its auth/bus/storage seams.

/// Errors raised by [`crate::Repository`] operations.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// An operation is not valid in the repository's current lifecycle
    /// state, e.g. mutating configuration while `Running`.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// The builder was missing a required dependency (journal, clock, lock
    /// provider, or index engine) when `build()` was called.
    #[error("repository not fully configured: {0}")]
    NotConfigured(String),
    /// Configuration could not be parsed.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    /// A journal operation failed.
    #[error("journal error: {0}")]
    Storage(#[from] aeon_store_core::StorageError),
    /// A layout could not be derived.
    #[error("layout error: {0}")]
    Layout(#[from] aeon_layout::LayoutError),
    /// The codec could not encode or decode a value.
    #[error("codec error: {0}")]
    Codec(#[from] aeon_codec::CodecError),
    /// An index engine operation failed.
    #[error("index error: {0}")]
    Index(#[from] aeon_index::IndexError),
    /// A published command failed; see [`aeon_consumer::ConsumerError`] for
    /// the specific kind.
    #[error("command failed: {0}")]
    Consumer(#[from] aeon_consumer::ConsumerError),
}
