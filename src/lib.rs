//! Find the number of concurrent virtual users at which an inference
//! endpoint's throughput stops improving.
//!
//! Load-testing an inference endpoint answers one question per run: at this
//! many concurrent virtual users (VUs), how many requests per second does
//! the endpoint sustain? The interesting question is the derived one: what
//! is the smallest VU count beyond which adding load buys you (almost)
//! nothing? Each trial is expensive (it occupies the endpoint exclusively
//! for its full configured duration), so the search has to be frugal.
//!
//! This crate provides one answer: exponential expansion followed by binary
//! refinement. The VU count is doubled as long as each step improves
//! throughput by at least 2%. The first step that does not marks the
//! plateau's neighborhood, and the range between the last two probed counts
//! is then bisected until the bounds meet. Every trial is fingerprinted by a
//! [`TrialKey`] and memoized in a durable [`TrialCache`], so identical
//! trials run the external load generator at most once, whether they recur
//! within one search, across searches, or across process restarts.
//!
//! The pieces compose at two seams. [`PlateauSearcher`] is a pure feedback
//! iterator: it yields candidate VU counts and consumes observed
//! throughputs, and knows nothing about how trials run. [`TrialRunner`] is
//! the measurement seam: [`K6Runner`] implements it by rendering a k6 script
//! and invoking the generator as a subprocess, and any
//! `FnMut(usize) -> Result<f64, Error>` implements it for simulation and
//! tests. [`find_optimal_vus`] drives the two together, strictly one trial
//! at a time.
//!
//! Failure handling is deliberately lopsided. A trial that crashes or leaves
//! no result file is recorded as zero throughput and the search moves on; a
//! misconfiguration (unrecognized template, unreadable template file) aborts
//! the session immediately, because every subsequent trial would fail the
//! same way. See [`Error`] for the taxonomy.
//!
//! # Examples
//!
//! ```rust
//! use plateau::{find_optimal_vus, Error};
//!
//! // A stand-in endpoint that saturates at 100 req/s once 25 VUs are
//! // offered. Real searches drive a `K6Runner` instead.
//! let mut runner = |vus: usize| -> Result<f64, Error> {
//!     Ok(f64::min(vus as f64 * 4.0, 100.0))
//! };
//!
//! let outcome = find_optimal_vus(&mut runner, 256, 1)?;
//! assert_eq!(outcome.optimal.throughput, 100.0);
//! // every probed VU count is in the history, in probe order
//! assert_eq!(outcome.history[0].vus, 1);
//! # Ok::<(), Error>(())
//! ```
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod cache;
mod config;
mod endpoint;
mod error;
mod runner;
mod search;

pub use crate::cache::{TrialCache, TrialKey, TrialResult};
pub use crate::config::{BenchmarkConfig, Task};
pub use crate::endpoint::{EndpointDescriptor, EndpointMetadata, StaticMetadata};
pub use crate::error::Error;
pub use crate::runner::{K6Runner, TrialRunner};
pub use crate::search::{
    find_optimal_vus, Observation, PlateauSearcher, SearchOutcome, SearchPhase,
};
