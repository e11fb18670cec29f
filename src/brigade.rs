//! Public bucket queue: the caller-facing equivalent of an
//! `apr_bucket_brigade`, used both to hand buckets to [`crate::Beam::send`]
//! and to receive them back out of [`crate::Beam::receive`].

use crate::bucket::Bucket;
use std::collections::VecDeque;

/// An ordered run of [`Bucket`]s.
#[derive(Default)]
pub struct Brigade {
    items: VecDeque<Bucket>,
}

impl Brigade {
    pub fn new() -> Self {
        Brigade { items: VecDeque::new() }
    }

    pub fn push_back(&mut self, bucket: Bucket) {
        self.items.push_back(bucket);
    }

    /// Puts `bucket` back at the head of the queue. Used by
    /// [`crate::Beam::send`] to return the unsent remainder of a bucket
    /// it had to split to respect the buffer bound.
    pub fn push_front(&mut self, bucket: Bucket) {
        self.items.push_front(bucket);
    }

    pub fn pop_front(&mut self) -> Option<Bucket> {
        self.items.pop_front()
    }

    pub fn front(&self) -> Option<&Bucket> {
        self.items.front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bucket> {
        self.items.iter()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Bucket> + '_ {
        self.items.drain(..)
    }

    /// True if the brigade ends in an end-of-stream marker.
    pub fn has_eos(&self) -> bool {
        self.items.iter().any(|b| matches!(b.metadata_kind(), Some(crate::bucket::MetadataKind::EndOfStream)))
    }
}

impl FromIterator<Bucket> for Brigade {
    fn from_iter<T: IntoIterator<Item = Bucket>>(iter: T) -> Self {
        Brigade { items: iter.into_iter().collect() }
    }
}

impl IntoIterator for Brigade {
    type Item = Bucket;
    type IntoIter = std::collections::vec_deque::IntoIter<Bucket>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}
