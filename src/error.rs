use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced while orchestrating a benchmark session.
///
/// Only the configuration-class variants ([`Error::UnknownTask`],
/// [`Error::Template`], [`Error::Io`], [`Error::UnknownEndpoint`]) abort a
/// search: they indicate a mistake that would make every subsequent trial
/// fail identically. Cache errors are returned by [`TrialCache`](crate::TrialCache)
/// but downgraded to warnings by the runner, which falls back to re-running
/// the trial. A failing trial itself is never an error; it degrades to a
/// recorded throughput of zero.
#[derive(Debug, Error)]
pub enum Error {
    /// The configured template identifier matched none of the recognized
    /// task categories.
    #[error("unrecognized benchmark template {0:?}")]
    UnknownTask(String),

    /// The load-test script template failed to parse or render.
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// A file outside the trial cache (template source, rendered script)
    /// could not be read or written.
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        /// Path of the file the operation failed on.
        path: PathBuf,
        /// The underlying i/o error.
        source: std::io::Error,
    },

    /// The durable trial cache could not be read or written.
    #[error("cache i/o on {}: {source}", .path.display())]
    CacheIo {
        /// Path of the cache entry the operation failed on.
        path: PathBuf,
        /// The underlying i/o error.
        source: std::io::Error,
    },

    /// A cache entry exists but does not parse as a trial result.
    #[error("malformed trial result at {}: {source}", .path.display())]
    CacheFormat {
        /// Path of the offending cache entry.
        path: PathBuf,
        /// The underlying deserialization error.
        source: serde_json::Error,
    },

    /// The metadata adapter has no snapshot for the requested endpoint.
    #[error("no endpoint metadata for {0:?}")]
    UnknownEndpoint(String),
}
