//! Bucket beamer registry (C5): a process-wide receive-time extension
//! point.
//!
//! The source lets a module register a "bucket beamer" — a callback
//! consulted whenever `receive` is about to wrap a data bucket in a
//! proxy, giving the module a chance to produce a different receiver
//! bucket instead (`h2_register_bucket_beamer`, backed by a static array
//! walked once per candidate bucket). The beam's own [`Bucket`] set is
//! closed (a handful of variants, no unknown third-party bucket types
//! reach it),
//! so this hook exists purely to let a caller teach `receive` an
//! alternative strategy for some class of zero-copy-eligible bucket — a
//! file-handle throttling policy is the motivating case upstream —
//! without the beam's core ever needing to know that policy exists.
//!
//! Registration only ever happens at process start, well off any hot
//! path, so a plain [`OnceLock`]-guarded `Mutex<Vec<_>>` is a better fit
//! than porting the teacher's own non-blocking one-shot primitive, which
//! earns its complexity only where initialization races a hot path.

use crate::beam::Beam;
use crate::bucket::Bucket;
use std::sync::{Arc, Mutex, OnceLock};

/// A registered conversion attempt: given the beam and the sender bucket
/// `receive` is about to proxy, try to produce a receiver-side
/// replacement. Returns `None` to decline, leaving the next registered
/// converter (or the beam's own proxying) to handle it.
pub type ConverterFn = Arc<dyn Fn(&Beam, &Bucket) -> Option<Bucket> + Send + Sync>;

fn registry() -> &'static Mutex<Vec<ConverterFn>> {
    static REGISTRY: OnceLock<Mutex<Vec<ConverterFn>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Registers a bucket converter for the lifetime of the process.
/// Converters are consulted in registration order by [`try_convert`];
/// the first one to return `Some` wins.
pub fn register_bucket_converter(f: impl Fn(&Beam, &Bucket) -> Option<Bucket> + Send + Sync + 'static) {
    registry().lock().unwrap().push(Arc::new(f));
}

/// Offers `bucket` to every registered converter in turn, returning the
/// first successful conversion. Called by [`crate::Beam::receive`] just
/// before it would otherwise wrap `bucket` in a [`crate::Proxy`].
pub(crate) fn try_convert(beam: &Beam, bucket: &Bucket) -> Option<Bucket> {
    let converters = registry().lock().unwrap();
    for conv in converters.iter() {
        if let Some(converted) = conv(beam, bucket) {
            return Some(converted);
        }
    }
    None
}

/// Drops every registered converter. Exposed for test isolation between
/// cases that populate the registry; not meant for production use, since
/// the registry is otherwise append-only for the life of the process —
/// mirroring the source's own pool-cleanup-only reset.
#[cfg(test)]
pub(crate) fn clear_for_test() {
    registry().lock().unwrap().clear();
}
