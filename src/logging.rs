//! Ambient logging shim.
//!
//! The beam's own logic never decides *whether* to log, only *that*
//! something happened; whether that turns into a structured `logwise`
//! record or a plain line on stderr is a compile-time feature choice,
//! mirroring how the teacher crate splits `logwise` logging from a bare
//! `eprintln!` fallback (see its own `src/logging.rs`).
//!
//! Two levels are used by the beam core: `warn` for the defensive,
//! "should not happen but the beam tolerates it" cases (an emitted proxy
//! whose sender bucket cannot be found in the hold list), and `trace` for
//! the per-call start/end lines the original gates behind
//! `H2_BEAM_LOG`/`APLOG_TRACE2`.

#[cfg(feature = "logwise")]
pub fn warn(msg: &str) {
    logwise::warn_sync!("{msg}", msg = msg);
}

#[cfg(not(feature = "logwise"))]
pub fn warn(msg: &str) {
    eprintln!("[beam] warning: {}", msg);
}

#[cfg(feature = "logwise")]
pub fn trace(msg: &str) {
    logwise::debug_sync!("{msg}", msg = msg);
}

#[cfg(not(feature = "logwise"))]
pub fn trace(msg: &str) {
    let _ = msg;
    // Trace-level beam lifecycle messages are only emitted with the
    // `logwise` feature; the plain fallback stays quiet to match the
    // volume a caller gets from the teacher's own stderr shim.
}
