//! Arena identity: the Rust-native stand-in for APR's pool/allocator.
//!
//! The source this crate generalises ties every bucket to an `apr_pool_t`
//! and forbids reading a bucket's payload from a thread that does not own
//! its pool (except for heap buckets, which are pool-agnostic once
//! allocated). Rust has no pool concept — allocation is global — so there
//! is nothing to literally port. What the invariant actually needs is a
//! comparable, cloneable token identifying "which side this payload is
//! currently bound to", so that `setaside` (rebind) is a real state
//! transition and the invariant is something a test can assert on rather
//! than take on faith. `ArenaId` is that token.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ARENA: AtomicU64 = AtomicU64::new(1);

/// Identifies a logical allocation context (sender-side or receiver-side)
/// that a bucket's payload is currently bound to.
///
/// Two arenas are equal only if they were handed out by the same
/// `ArenaId::new()` call graph (`fresh()` never repeats within a
/// process). Heap buckets do not consult this at all; file/mmap buckets
/// use it to decide whether a `setaside` is required before the owning
/// thread may read them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaId(u64);

impl ArenaId {
    /// Mints a fresh, globally unique arena identity.
    pub fn fresh() -> Self {
        ArenaId(NEXT_ARENA.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ArenaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "arena#{}", self.0)
    }
}
