//! Bucket abstraction (C1): a uniform handle to a data fragment.
//!
//! A [`Bucket`] is a tagged variant over the handful of payload shapes the
//! beam needs to move between threads: an owned in-memory buffer, a file
//! region, a mapped-memory region, a payload-less metadata marker, and a
//! receiver-side [`Proxy`] shadowing a sender bucket still held by the
//! beam. One struct with an enum payload, rather than a trait-object
//! hierarchy, keeps the "capability trait {length, read, split, setaside,
//! drop}" the design calls for to a handful of inherent methods — Proxy
//! is simply another tag whose `Drop` runs the emitted protocol
//! (`proxy.rs`).

use crate::arena::ArenaId;
use crate::error::BeamError;
use crate::proxy::Proxy;
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_BUCKET_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn fresh_bucket_id() -> u64 {
    NEXT_BUCKET_ID.fetch_add(1, Ordering::Relaxed)
}

/// The recognised metadata marker kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataKind {
    /// End of stream. Exactly one is ever emitted per beam, by the
    /// receiver, once the sender has closed and all data has drained.
    EndOfStream,
    /// A flush request with no payload.
    Flush,
    /// An out-of-band error report.
    Error { status: i32, detail: String },
}

/// A file region that may be transferred by rebinding its handle instead
/// of being read, provided the beam holds the only reference to it.
#[derive(Debug, Clone)]
pub struct FileBucket {
    pub(crate) file: Arc<std::fs::File>,
    pub(crate) offset: u64,
    pub(crate) len: u64,
    /// Mirrors `apr_bucket_file_enable_mmap(ng, 0)`: a receiver-side file
    /// bucket created from a beamed sender bucket disables any mmap
    /// fast-path a downstream reader might otherwise take, since the
    /// underlying file may still be written to by something else.
    pub(crate) mmap_disabled: bool,
}

impl FileBucket {
    pub fn new(file: std::fs::File, offset: u64, len: u64) -> Self {
        FileBucket { file: Arc::new(file), offset, len, mmap_disabled: false }
    }

    /// True once a beam has rebound this bucket for a receiver and
    /// disabled its mmap fast path (see [`FileBucket::new`] doc).
    pub fn mmap_disabled(&self) -> bool {
        self.mmap_disabled
    }

    fn can_beam(&self, copy_files: bool) -> bool {
        !copy_files && Arc::strong_count(&self.file) == 1
    }

    fn read_range(&self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.len as usize];
        self.file.read_exact_at(&mut buf, self.offset)?;
        Ok(buf)
    }
}

pub(crate) enum BucketPayload {
    Heap(Arc<[u8]>),
    Mmap(Arc<Vec<u8>>),
    File(FileBucket),
    Metadata(MetadataKind),
    Proxy(Proxy),
    /// A generic, not-yet-materialised source bucket whose length is not
    /// known up front — the `apr_bucket_read`-to-resolve-length case in
    /// §4.4's append algorithm. Only ever appears in a brigade a sender
    /// is about to hand to `Beam::send`; never stored in a beam's
    /// internal lists and never received.
    Unresolved(Box<dyn Read + Send>),
}

impl std::fmt::Debug for BucketPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BucketPayload::Heap(d) => f.debug_tuple("Heap").field(&d.len()).finish(),
            BucketPayload::Mmap(d) => f.debug_tuple("Mmap").field(&d.len()).finish(),
            BucketPayload::File(fb) => f.debug_tuple("File").field(fb).finish(),
            BucketPayload::Metadata(k) => f.debug_tuple("Metadata").field(k).finish(),
            BucketPayload::Proxy(p) => f.debug_tuple("Proxy").field(p).finish(),
            BucketPayload::Unresolved(_) => f.write_str("Unresolved(..)"),
        }
    }
}

/// A typed fragment of data or a metadata marker: the unit of transfer
/// through a [`crate::Beam`].
#[derive(Debug)]
pub struct Bucket {
    pub(crate) id: u64,
    pub(crate) arena: ArenaId,
    pub(crate) start: usize,
    pub(crate) len: usize,
    pub(crate) payload: BucketPayload,
}

impl Bucket {
    fn new(arena: ArenaId, start: usize, len: usize, payload: BucketPayload) -> Self {
        Bucket { id: fresh_bucket_id(), arena, start, len, payload }
    }

    /// An owned, thread-agnostic in-memory buffer.
    pub fn heap(arena: ArenaId, data: Vec<u8>) -> Self {
        let len = data.len();
        Bucket::new(arena, 0, len, BucketPayload::Heap(Arc::from(data.into_boxed_slice())))
    }

    /// A file region. Zero-copy transfer requires `file`'s `Arc` to be
    /// uniquely held (see [`FileBucket::can_beam`]).
    pub fn file(arena: ArenaId, file: std::fs::File, offset: u64, len: u64) -> Self {
        Bucket::new(arena, 0, len as usize, BucketPayload::File(FileBucket::new(file, offset, len)))
    }

    /// A mapped-memory region, transfer-equivalent to a file bucket.
    pub fn mmap(arena: ArenaId, data: Vec<u8>) -> Self {
        let len = data.len();
        Bucket::new(arena, 0, len, BucketPayload::Mmap(Arc::new(data)))
    }

    /// A payload-less control marker.
    pub fn metadata(arena: ArenaId, kind: MetadataKind) -> Self {
        Bucket::new(arena, 0, 0, BucketPayload::Metadata(kind))
    }

    pub fn eos(arena: ArenaId) -> Self {
        Bucket::metadata(arena, MetadataKind::EndOfStream)
    }

    pub fn flush(arena: ArenaId) -> Self {
        Bucket::metadata(arena, MetadataKind::Flush)
    }

    /// A bucket whose length must be resolved by reading before it can
    /// be enqueued, e.g. one sourced from a pipe or socket.
    pub fn from_reader(arena: ArenaId, reader: impl Read + Send + 'static) -> Self {
        Bucket::new(arena, 0, 0, BucketPayload::Unresolved(Box::new(reader)))
    }

    pub(crate) fn from_proxy(proxy: Proxy) -> Self {
        let len = proxy.length();
        Bucket::new(proxy.arena(), 0, len, BucketPayload::Proxy(proxy))
    }

    /// `length() -> size | unknown`. `None` means the payload has not
    /// been materialised yet and must be read to find out.
    pub fn length(&self) -> Option<usize> {
        match &self.payload {
            BucketPayload::Unresolved(_) => None,
            _ => Some(self.len),
        }
    }

    pub fn is_metadata(&self) -> bool {
        matches!(self.payload, BucketPayload::Metadata(_))
    }

    pub fn metadata_kind(&self) -> Option<&MetadataKind> {
        match &self.payload {
            BucketPayload::Metadata(k) => Some(k),
            _ => None,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.payload, BucketPayload::File(_))
    }

    pub fn is_mmap(&self) -> bool {
        matches!(self.payload, BucketPayload::Mmap(_))
    }

    pub fn is_heap(&self) -> bool {
        matches!(self.payload, BucketPayload::Heap(_))
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self.payload, BucketPayload::Proxy(_))
    }

    pub(crate) fn file_bucket(&self) -> Option<&FileBucket> {
        match &self.payload {
            BucketPayload::File(f) => Some(f),
            _ => None,
        }
    }

    /// Exposes this bucket's shared mmap buffer (and its window into it)
    /// so a beam can clone the `Arc` into a receiver-side proxy without
    /// copying bytes.
    pub(crate) fn mmap_arc(&self) -> Option<(Arc<Vec<u8>>, usize, usize)> {
        match &self.payload {
            BucketPayload::Mmap(d) => Some((d.clone(), self.start, self.len)),
            _ => None,
        }
    }

    /// Exposes this bucket's shared heap buffer (and its window into it)
    /// so a beam can clone the `Arc` into a receiver-side proxy without
    /// copying bytes.
    pub(crate) fn heap_arc(&self) -> Option<(Arc<[u8]>, usize, usize)> {
        match &self.payload {
            BucketPayload::Heap(d) => Some((d.clone(), self.start, self.len)),
            _ => None,
        }
    }

    /// Bytes never count against `max_buf_size` and are reported as zero
    /// memory under `tx_mem_limits`: true for file and mmap buckets
    /// (their payload lives once, on the sender side) once they are
    /// beamable, and always for a receiver-side proxy of one.
    pub(crate) fn mem_used(&self) -> usize {
        match &self.payload {
            BucketPayload::File(_) | BucketPayload::Mmap(_) => 0,
            BucketPayload::Proxy(p) => p.mem_used(),
            BucketPayload::Unresolved(_) => 0,
            BucketPayload::Heap(_) | BucketPayload::Metadata(_) => self.len,
        }
    }

    /// `read(blocking) -> (bytes, len) | pending | error`. Only legal on
    /// the bucket's owning thread, except for Heap buckets, which are
    /// thread-agnostic. Resolves `Unresolved` buckets by reading to end.
    pub fn read(&mut self) -> Result<&[u8], BeamError> {
        if let BucketPayload::Unresolved(reader) = &mut self.payload {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            self.len = buf.len();
            self.payload = BucketPayload::Heap(Arc::from(buf.into_boxed_slice()));
        }
        self.as_bytes().ok_or_else(|| {
            BeamError::ResourceExhausted("bucket payload is not directly readable".into())
        })
    }

    /// Direct byte access for payloads that live in memory. `None` for
    /// file buckets (use [`FileBucket::read_range`]-style access through
    /// the beam instead) and for metadata.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            BucketPayload::Heap(d) => Some(&d[self.start..self.start + self.len]),
            BucketPayload::Mmap(d) => Some(&d[self.start..self.start + self.len]),
            BucketPayload::Proxy(p) => p.as_bytes(),
            _ => None,
        }
    }

    /// Materialises the bucket's bytes if they are not already resolved,
    /// reading a file range or an unresolved source into a private copy.
    pub(crate) fn read_bytes_owned(&mut self) -> Result<Vec<u8>, BeamError> {
        match &self.payload {
            BucketPayload::File(f) => Ok(f.read_range()?),
            BucketPayload::Unresolved(_) => Ok(self.read()?.to_vec()),
            _ => Ok(self.as_bytes().unwrap_or(&[]).to_vec()),
        }
    }

    /// `split(at) -> bucket`: splits off the trailing `self.len - at`
    /// bytes into a new bucket, shrinking `self` to `at` bytes.
    pub(crate) fn split_off(&mut self, at: usize) -> Bucket {
        assert!(at <= self.len, "split point beyond bucket length");
        let tail_len = self.len - at;
        let payload = match &self.payload {
            BucketPayload::Heap(d) => BucketPayload::Heap(d.clone()),
            BucketPayload::Mmap(d) => BucketPayload::Mmap(d.clone()),
            BucketPayload::File(f) => BucketPayload::File(FileBucket {
                file: f.file.clone(),
                offset: f.offset + at as u64,
                len: tail_len as u64,
                mmap_disabled: f.mmap_disabled,
            }),
            BucketPayload::Metadata(_) | BucketPayload::Unresolved(_) | BucketPayload::Proxy(_) => {
                unreachable!("metadata, unresolved and proxy buckets are never split")
            }
        };
        let tail_start = if matches!(self.payload, BucketPayload::File(_)) { 0 } else { self.start + at };
        let tail = Bucket::new(self.arena, tail_start, tail_len, payload);
        self.len = at;
        tail
    }

    /// `setaside(arena)`: rebind this bucket's lifetime to `arena`.
    pub(crate) fn setaside(&mut self, arena: ArenaId) {
        self.arena = arena;
    }

    /// Whether this (file/mmap) bucket can be beamed zero-copy: the
    /// source refuses to beam buckets with shared ownership, since
    /// zero-copy transfer requires exclusive control so the beam can
    /// rebind the handle to the receiver's arena.
    pub(crate) fn can_beam(&self, copy_files: bool) -> bool {
        match &self.payload {
            BucketPayload::File(f) => f.can_beam(copy_files),
            BucketPayload::Mmap(d) => !copy_files && Arc::strong_count(d) == 1,
            _ => false,
        }
    }
}
