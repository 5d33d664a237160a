//! Error taxonomy for package extraction.
//!
//! Every failure in this crate is terminal for the given input: the
//! decoder operates on already-available bytes, so there is no
//! transient/retryable class. Errors carry enough context (entry name,
//! chunk index, archive position) to diagnose without re-running.

use thiserror::Error;

/// Errors produced while decoding an installer package.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// The outer container header or table of contents is invalid.
    #[error("malformed container: {0}")]
    MalformedContainer(String),

    /// The chunked payload stream has a bad magic tag or violates a
    /// chunk-size invariant.
    #[error("malformed chunk stream: {0}")]
    MalformedStream(String),

    /// A specific chunk's compressed frame could not be inflated to its
    /// declared size.
    #[error("chunk {chunk}: decompression failed: {reason}")]
    Decompression {
        /// Zero-based index of the failing chunk within the stream.
        chunk: u64,
        /// Human-readable cause.
        reason: String,
    },

    /// Required content was not found: no Payload entry, or no
    /// recognizable primary descriptor.
    #[error("missing content: {0}")]
    MissingContent(String),

    /// A container entry declares a per-entry encoding this
    /// implementation does not recognize.
    #[error("entry `{entry}`: unsupported encoding `{encoding}`")]
    UnsupportedEncoding {
        /// Archive-relative path of the entry.
        entry: String,
        /// The encoding label from the table of contents.
        encoding: String,
    },

    /// An invalid glob pattern was passed to an entry lookup.
    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// An underlying I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A network failure while fetching a remote package.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
