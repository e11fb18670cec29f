//! A thread-to-thread bucket pipe with bounded buffering, blocking and
//! non-blocking backpressure, and deferred cleanup of zero-copy
//! transfers.
//!
//! A [`Beam`] moves [`Bucket`]s — heap buffers, file regions, mapped
//! memory regions, or metadata markers — from a sending thread to a
//! receiving thread without requiring either side to copy data it
//! doesn't have to. A receiver that gets a zero-copy bucket gets it
//! wrapped in a proxy; the sender's own copy of that bucket is not
//! released until every proxy referencing it has dropped, even if the
//! two threads observe that at very different times.
//!
//! ```
//! use beam::{Beam, BlockingMode, Bucket, Brigade, ArenaId, RecvOutcome, Side};
//!
//! let beam = Beam::new(1 << 16);
//! let arena = ArenaId::fresh();
//!
//! let mut out = Brigade::new();
//! out.push_back(Bucket::heap(arena, b"hello".to_vec()));
//! beam.send(&mut out, BlockingMode::Blocking).unwrap();
//! beam.close(Side::Sender).unwrap();
//!
//! let mut inbox = Brigade::new();
//! match beam.receive(&mut inbox, BlockingMode::Blocking, None).unwrap() {
//!     RecvOutcome::Data { transferred, .. } => assert_eq!(transferred, 1),
//!     RecvOutcome::Eof => unreachable!(),
//! }
//! ```

mod arena;
mod beam;
mod brigade;
mod bucket;
mod converter;
mod error;
mod list;
mod logging;
mod proxy;

pub use arena::ArenaId;
pub use beam::{ArenaBinder, Beam, BlockingMode, RecvOutcome, Side};
pub use brigade::Brigade;
pub use bucket::{Bucket, FileBucket, MetadataKind};
pub use converter::{register_bucket_converter, ConverterFn};
pub use error::{BeamError, Result};
pub use proxy::Proxy;
