//! Receiver-side proxy (C3): the emitted-notification half of deferred
//! cleanup.
//!
//! When a sender bucket is handed to a receiver, the receiver gets a
//! [`Proxy`] rather than the sender's own `Bucket` value. The proxy
//! shares the same underlying payload (an `Arc` clone, or a rebound file
//! handle) but carries a weak back-pointer to the beam and the id of the
//! sender-side bucket it shadows. Dropping the last proxy for a given
//! sender bucket is what actually allows that bucket to leave the beam's
//! hold list — see `Beam::emitted` in `beam.rs`. This is the Rust
//! rendering of the original's `h2_beam_emitted()` callback, triggered
//! here by `Drop` instead of an explicit free call.

use crate::arena::ArenaId;
use crate::beam::BeamCore;
use crate::bucket::FileBucket;
use std::sync::{Arc, Weak};

#[derive(Debug)]
pub(crate) enum ProxyPayload {
    Heap(Arc<[u8]>, usize, usize),
    Mmap(Arc<Vec<u8>>, usize, usize),
    File(FileBucket),
}

/// A receiver-side stand-in for a bucket the sender is still holding.
///
/// Reading a proxy's bytes never blocks and never touches the sender's
/// thread: the payload was already shared (an `Arc` clone) or rebound (a
/// file handle) at the moment the proxy was created. What a proxy defers
/// is not data access but *cleanup* — the sender's own copy of the
/// bucket cannot be recycled until every proxy of it has dropped.
pub struct Proxy {
    pub(crate) target_id: u64,
    arena: ArenaId,
    len: usize,
    payload: ProxyPayload,
    beam: Weak<BeamCore>,
}

impl Proxy {
    pub(crate) fn new(
        target_id: u64,
        arena: ArenaId,
        len: usize,
        payload: ProxyPayload,
        beam: Weak<BeamCore>,
    ) -> Self {
        Proxy { target_id, arena, len, payload, beam }
    }

    pub fn length(&self) -> usize {
        self.len
    }

    pub(crate) fn arena(&self) -> ArenaId {
        self.arena
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            ProxyPayload::Heap(d, start, len) => Some(&d[*start..*start + *len]),
            ProxyPayload::Mmap(d, start, len) => Some(&d[*start..*start + *len]),
            ProxyPayload::File(_) => None,
        }
    }

    pub fn file_bucket(&self) -> Option<&FileBucket> {
        match &self.payload {
            ProxyPayload::File(f) => Some(f),
            _ => None,
        }
    }

    pub(crate) fn mem_used(&self) -> usize {
        match &self.payload {
            ProxyPayload::File(_) | ProxyPayload::Mmap(..) => 0,
            ProxyPayload::Heap(_, _, len) => *len,
        }
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("target_id", &self.target_id)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if let Some(beam) = self.beam.upgrade() {
            beam.emitted(self.target_id);
        }
    }
}
