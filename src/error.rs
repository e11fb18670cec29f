//! Error types surfaced by the beam's public operations.
//!
//! Five of the six status kinds the design calls out — `aborted`,
//! `would-block`, `timed-out`, `resource-exhausted`, `read-error` — are
//! genuine failures and become variants of `BeamError`. The sixth,
//! end-of-stream, is not: it is a beam operating exactly as intended, so
//! [`crate::Beam::receive`] reports it as `Ok(RecvOutcome::Eof)` rather
//! than an error a caller has to unwrap past.

use std::io;

/// Errors surfaced by [`crate::Beam`] operations.
#[derive(Debug, thiserror::Error)]
pub enum BeamError {
    /// The peer called `abort`, or the receiver closed while the sender
    /// was trying to send. Sticky: once observed, it dominates all
    /// subsequent calls on this beam.
    #[error("beam aborted")]
    Aborted,

    /// Non-blocking mode was requested and the precondition (space to
    /// send, data to receive, an empty buffer to wait on) was not met.
    #[error("operation would block")]
    WouldBlock,

    /// Blocking mode was requested, a timeout was configured, and it
    /// elapsed before the precondition was met.
    #[error("operation timed out")]
    TimedOut,

    /// Allocating or rebinding (`setaside`) a bucket's backing storage
    /// failed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A bucket read failed while resolving an unknown length or
    /// materialising a bucket as a heap copy. Propagated verbatim from
    /// the underlying I/O.
    #[error("bucket read error: {0}")]
    ReadError(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, BeamError>;
