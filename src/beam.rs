//! The beam itself (C4): a bounded, thread-safe bucket pipe.
//!
//! One [`std::sync::Mutex`] guards all shared bookkeeping (the three
//! bucket lists, the closed/aborted flags, the configured limits, the
//! running counters) and one [`std::sync::Condvar`] wakes whichever side
//! is waiting on it — directly mirroring the single mutex/single
//! condition variable the source uses (`beam->lock`, `beam->change`).
//! Registered callbacks (`on_consumed`, `on_was_empty`, `on_send_block`)
//! are stored behind their own small mutexes and are always invoked with
//! the main lock released, so a callback is free to call back into the
//! beam without deadlocking.

use crate::arena::ArenaId;
use crate::brigade::Brigade;
use crate::bucket::{Bucket, MetadataKind};
use crate::converter;
use crate::error::{BeamError, Result};
use crate::list::BucketList;
use crate::logging;
use crate::proxy::{Proxy, ProxyPayload};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

static NEXT_BEAM_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// Which end of a beam an operation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Sender,
    Receiver,
}

/// Whether `send`/`receive`/`wait_empty` may block the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingMode {
    Blocking,
    NonBlocking,
}

/// The outcome of a successful [`Beam::receive`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// At least one bucket was appended to the destination brigade.
    Data {
        /// How many buckets were appended this call.
        transferred: usize,
        /// Whether the sender side has closed. A receiver may still see
        /// more data after observing this set — closing only latches
        /// once the beam is also fully drained, at which point
        /// `receive` starts returning [`RecvOutcome::Eof`] instead.
        closed: bool,
    },
    /// The sender closed and every bucket it ever sent has been
    /// delivered and drained. Terminal: every subsequent `receive` on
    /// this beam returns `Eof` again.
    Eof,
}

type Callback0 = Mutex<Option<Arc<dyn Fn() + Send + Sync>>>;
type CallbackLen = Mutex<Option<Arc<dyn Fn(usize) + Send + Sync>>>;

pub(crate) struct BeamCore {
    id: u64,
    sender_arena: ArenaId,
    receiver_arena: ArenaId,
    state: Mutex<BeamState>,
    change: Condvar,
    torn_down: AtomicBool,
    on_consumed_event: Callback0,
    on_consumed_bytes: CallbackLen,
    on_was_empty: Callback0,
    on_send_block: Callback0,
}

struct BeamState {
    send_list: BucketList,
    hold_list: BucketList,
    purge_list: BucketList,
    recv_buffer: BucketList,
    max_buf_size: usize,
    copy_files: bool,
    tx_mem_limits: bool,
    timeout: Option<Duration>,
    closed: bool,
    aborted: bool,
    close_sent: bool,
    sent_bytes: u64,
    received_bytes: u64,
    cons_bytes_reported: u64,
}

impl BeamState {
    /// Matches the source's `buffer_is_empty`: data not yet handed to
    /// the receiver. Buckets awaiting proxy release in `hold_list` do
    /// not count — they have already left the pipe from the receiver's
    /// point of view.
    fn is_empty(&self) -> bool {
        self.send_list.is_empty() && self.recv_buffer.is_empty()
    }

    /// Remaining room under `max_buf_size`, zero-copy-aware (file/mmap
    /// payloads have no buffering footprint). `usize::MAX` stands in for
    /// "unbounded" when `max_buf_size == 0`.
    fn space_left(&self) -> usize {
        if self.max_buf_size == 0 {
            usize::MAX
        } else {
            self.max_buf_size.saturating_sub(self.send_list.mem_used())
        }
    }
}

/// A thread-to-thread pipe of [`Bucket`]s with bounded buffering and
/// deferred, reference-counted cleanup of zero-copy transfers.
///
/// A `Beam` is a cheap handle (`Arc` underneath): clone it and give one
/// clone to the sending thread, one to the receiving thread. Both ends
/// call methods on the same `Beam` value; there is no separate "sender
/// half" / "receiver half" type, matching the source's single
/// `h2_bucket_beam` structure used from both directions.
#[derive(Clone)]
pub struct Beam(Arc<BeamCore>);

impl Beam {
    /// Creates a new beam. `max_buf_size` of `0` means unbounded
    /// buffering (backpressure is never applied).
    pub fn new(max_buf_size: usize) -> Self {
        let core = BeamCore {
            id: NEXT_BEAM_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            sender_arena: ArenaId::fresh(),
            receiver_arena: ArenaId::fresh(),
            state: Mutex::new(BeamState {
                send_list: BucketList::new(),
                hold_list: BucketList::new(),
                purge_list: BucketList::new(),
                recv_buffer: BucketList::new(),
                max_buf_size,
                copy_files: false,
                tx_mem_limits: true,
                timeout: None,
                closed: false,
                aborted: false,
                close_sent: false,
                sent_bytes: 0,
                received_bytes: 0,
                cons_bytes_reported: 0,
            }),
            change: Condvar::new(),
            torn_down: AtomicBool::new(false),
            on_consumed_event: Mutex::new(None),
            on_consumed_bytes: Mutex::new(None),
            on_was_empty: Mutex::new(None),
            on_send_block: Mutex::new(None),
        };
        Beam(Arc::new(core))
    }

    fn lock(&self) -> MutexGuard<'_, BeamState> {
        self.0.state.lock().unwrap()
    }

    pub fn buffer_size_set(&self, max_buf_size: usize) {
        self.lock().max_buf_size = max_buf_size;
        self.0.change.notify_all();
    }

    pub fn buffer_size_get(&self) -> usize {
        self.lock().max_buf_size
    }

    /// Forces every zero-copy-eligible bucket to be read and copied
    /// instead of beamed by reference. A receiver that cannot tolerate a
    /// rebound file handle outliving the sender's own use of it sets
    /// this before the first `send`.
    pub fn set_copy_files(&self, copy: bool) {
        self.lock().copy_files = copy;
    }

    /// Governs how `receive`'s `max_bytes` budget weighs zero-copy
    /// buckets when deciding where to split an over-full batch: `true`
    /// (the default) counts a proxy or rebound file/mmap bucket as zero
    /// bytes, since its payload lives once, on the sender side.
    pub fn set_tx_mem_limits(&self, enabled: bool) {
        self.lock().tx_mem_limits = enabled;
    }

    pub fn timeout_set(&self, timeout: Option<Duration>) {
        self.lock().timeout = timeout;
    }

    /// Registers the pair of consumption callbacks. `event` fires from
    /// `receive` whenever new buckets were just handed to the receiver;
    /// `bytes` fires from `report_consumption` with the number of newly
    /// received bytes since it was last called. Both run with no lock
    /// held.
    pub fn on_consumed(
        &self,
        event: impl Fn() + Send + Sync + 'static,
        bytes: impl Fn(usize) + Send + Sync + 'static,
    ) {
        *self.0.on_consumed_event.lock().unwrap() = Some(Arc::new(event));
        *self.0.on_consumed_bytes.lock().unwrap() = Some(Arc::new(bytes));
    }

    /// Registers a callback invoked when a `send` call arrives at an
    /// empty, previously-drained beam — a hint the sender can use to
    /// wake a previously-idle receiver event loop. Invoked with no lock
    /// held.
    pub fn on_was_empty(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.0.on_was_empty.lock().unwrap() = Some(Arc::new(f));
    }

    /// Registers a callback invoked when a blocking `send` is about to
    /// wait for buffer space. Invoked with no lock held.
    pub fn on_send_block(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.0.on_send_block.lock().unwrap() = Some(Arc::new(f));
    }

    /// Appends buckets from `brigade` to the beam, in order, up to the
    /// configured buffer size, blocking (or not, per `mode`) whenever
    /// the bound is exhausted. Buckets the call could not fit because of
    /// a non-blocking would-block are left in `brigade`. Returns the
    /// number of buckets actually appended.
    pub fn send(&self, brigade: &mut Brigade, mode: BlockingMode) -> Result<usize> {
        logging::trace("start send");
        let mut guard = self.lock();
        self.purge_sent(&mut guard);

        if guard.aborted {
            Self::move_all_to_hold(&mut guard, brigade);
            return Err(BeamError::Aborted);
        }
        if guard.closed {
            // Buckets sent after the sender has already closed are
            // silently discarded rather than delivered: see the open
            // question in the design notes about EOS not implying
            // `closed` on its own.
            Self::move_all_to_hold(&mut guard, brigade);
            return Ok(0);
        }

        let mut was_empty = guard.is_empty();
        let mut space_left = guard.space_left();
        let mut sent = 0usize;
        let mut outcome: Result<()> = Ok(());

        loop {
            if brigade.front().is_none() {
                break;
            }
            if space_left == 0 {
                self.purge_sent(&mut guard);
                if was_empty && !guard.is_empty() {
                    drop(guard);
                    self.invoke0(&self.0.on_was_empty);
                    guard = self.lock();
                }
                match self.wait_not_full(guard, mode) {
                    Ok((g, left)) => {
                        guard = g;
                        space_left = left;
                        // The original's `h2_beam_send` recomputes
                        // `was_empty` right after every `wait_not_full`
                        // resume; without this, a send that blocks more
                        // than once in the same call would re-fire
                        // `on_was_empty` on a later stall even though it
                        // already fired once.
                        was_empty = guard.is_empty();
                        continue;
                    }
                    Err(e) => {
                        guard = self.lock();
                        outcome = Err(e);
                        break;
                    }
                }
            }
            let bucket = brigade.pop_front().expect("front() just confirmed a bucket");
            match self.append_bucket(&mut guard, bucket, &mut space_left, brigade) {
                Ok(()) => sent += 1,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        let ended_empty = guard.is_empty();
        drop(guard);
        self.0.change.notify_all();
        if was_empty && !ended_empty {
            self.invoke0(&self.0.on_was_empty);
        }
        self.report_consumption();
        logging::trace("end send");
        outcome.map(|_| sent)
    }

    /// `append_bucket`: the per-bucket half of the send algorithm. See
    /// §4.4 of the design for the case split this mirrors.
    fn append_bucket(
        &self,
        guard: &mut MutexGuard<'_, BeamState>,
        mut bucket: Bucket,
        space_left: &mut usize,
        brigade: &mut Brigade,
    ) -> Result<()> {
        if guard.aborted {
            return Err(BeamError::Aborted);
        }
        if bucket.is_metadata() {
            bucket.setaside(self.0.sender_arena);
            guard.send_list.push_back(bucket);
            return Ok(());
        }

        let can_beam;
        let check_len;
        if bucket.is_file() || bucket.is_mmap() {
            can_beam = bucket.can_beam(guard.copy_files);
            check_len = !can_beam;
        } else {
            can_beam = false;
            if bucket.length().is_none() {
                bucket.read()?;
            }
            check_len = true;
        }

        if check_len {
            let len = bucket.length().unwrap_or(0);
            if len > *space_left {
                let tail = bucket.split_off(*space_left);
                brigade.push_front(tail);
            }
            *space_left = space_left.saturating_sub(bucket.length().unwrap_or(0));
        }

        if bucket.length().unwrap_or(0) == 0 {
            return Ok(());
        }

        if bucket.is_heap() {
            bucket.setaside(self.0.sender_arena);
        } else if can_beam {
            // File/Mmap beamed zero-copy: rebinding just relabels the
            // arena the bucket is considered to live in.
            bucket.setaside(self.0.sender_arena);
        } else {
            let bytes = bucket.read_bytes_owned()?;
            bucket = Bucket::heap(self.0.sender_arena, bytes);
        }

        guard.sent_bytes += bucket.length().unwrap_or(0) as u64;
        guard.send_list.push_back(bucket);
        Ok(())
    }

    fn move_all_to_hold(guard: &mut MutexGuard<'_, BeamState>, brigade: &mut Brigade) {
        while let Some(b) = brigade.pop_front() {
            guard.hold_list.push_back(b);
        }
    }

    /// Takes whatever buckets are currently available — up to
    /// `max_bytes` if given — converting zero-copy-eligible data buckets
    /// into receiver-side proxies and leaving a shadow entry in the hold
    /// list until each proxy drops. Any overrun past `max_bytes` is kept
    /// in an internal carry buffer and delivered on the next call.
    pub fn receive(
        &self,
        dest: &mut Brigade,
        mode: BlockingMode,
        max_bytes: Option<usize>,
    ) -> Result<RecvOutcome> {
        logging::trace("start receive");
        let mut guard = self.lock();
        loop {
            if guard.aborted {
                let overshoot = std::mem::take(&mut guard.recv_buffer);
                drop(guard);
                drop(overshoot);
                return Err(BeamError::Aborted);
            }

            let budget = max_bytes.unwrap_or(usize::MAX);
            let mut remain: i64 = budget as i64;
            let mut new_buckets: Vec<Bucket> = Vec::new();
            let mut moved_from_sender = 0usize;

            // Drain whatever overran a previous call first.
            while remain >= 0 {
                let Some(front_len) = guard.recv_buffer.front().map(|b| b.length().unwrap_or(0)) else {
                    break;
                };
                if front_len > 0 && remain <= 0 {
                    break;
                }
                let b = guard.recv_buffer.pop_front().expect("front() just confirmed an entry");
                remain -= b.length().unwrap_or(0) as i64;
                new_buckets.push(b);
            }

            let copy_files = guard.copy_files;
            let tx_mem_limits = guard.tx_mem_limits;
            while remain >= 0 {
                let Some(front_len) = guard.send_list.front().map(|b| b.length().unwrap_or(0)) else {
                    break;
                };
                if front_len > 0 && remain <= 0 {
                    break;
                }
                let bucket = guard.send_list.pop_front().expect("front() just confirmed an entry");
                let credit = bucket.length().unwrap_or(0);
                let received = self.convert_for_receiver(&mut guard, bucket, copy_files)?;
                if !received.is_metadata() {
                    guard.received_bytes += credit as u64;
                }
                // A zero-copy receiver bucket's payload lives once, on the
                // sender side, so with `tx_mem_limits` it does not eat
                // into this call's `max_bytes` budget — only the bytes a
                // receiver actually has to hold in its own memory do.
                let weight = if tx_mem_limits && received.is_proxy() { 0 } else { received.length().unwrap_or(credit) };
                remain -= weight as i64;
                new_buckets.push(received);
                moved_from_sender += 1;
            }

            if remain < 0 {
                if let Some(last) = new_buckets.pop() {
                    let overrun = (-remain) as usize;
                    let len = last.length().unwrap_or(0);
                    if !last.is_metadata() && !last.is_proxy() && len > overrun {
                        let mut head = last;
                        let tail = head.split_off(len - overrun);
                        new_buckets.push(head);
                        guard.recv_buffer.push_front(tail);
                    } else {
                        // Not splittable (metadata, or a proxy we cannot
                        // safely cut in two): defer the whole bucket.
                        guard.recv_buffer.push_front(last);
                    }
                }
            }

            if guard.closed && guard.send_list.is_empty() && guard.recv_buffer.is_empty() && !guard.close_sent {
                new_buckets.push(Bucket::eos(self.0.receiver_arena));
                guard.close_sent = true;
            }

            let transferred = new_buckets.len();
            let closed = guard.closed;
            drop(guard);

            if transferred > 0 {
                for b in new_buckets {
                    dest.push_back(b);
                }
                self.0.change.notify_all();
                if moved_from_sender > 0 {
                    self.invoke0(&self.0.on_consumed_event);
                }
                logging::trace("end receive");
                return Ok(RecvOutcome::Data { transferred, closed });
            } else if closed {
                logging::trace("end receive");
                return Ok(RecvOutcome::Eof);
            } else if mode == BlockingMode::NonBlocking {
                return Err(BeamError::WouldBlock);
            } else {
                guard = self.wait_not_empty(self.lock(), mode)?;
            }
        }
    }

    /// Converts a just-dequeued sender bucket into whatever the receiver
    /// should see: a fresh copy for metadata, or — for heap, file, and
    /// mmap data alike — the registered extension hook's result if one
    /// claims the bucket, else a [`Proxy`] that defers freeing the
    /// sender's copy until every proxy of it has dropped.
    fn convert_for_receiver(
        &self,
        guard: &mut MutexGuard<'_, BeamState>,
        mut bucket: Bucket,
        copy_files: bool,
    ) -> Result<Bucket> {
        if bucket.is_metadata() {
            let kind = bucket.metadata_kind().cloned().expect("is_metadata implies metadata_kind");
            if matches!(kind, MetadataKind::EndOfStream) {
                guard.close_sent = true;
            }
            // The sender's own metadata bucket is parked in `hold_list`
            // too, not just data buckets: `extract_upto` sweeps it up
            // once a later data bucket's proxy drops, which is what lets
            // a dropped-out-of-order data proxy carry any metadata ahead
            // of it to `purge_list` in the same walk.
            bucket.setaside(self.0.sender_arena);
            guard.hold_list.push_back(bucket);
            return Ok(Bucket::metadata(self.0.receiver_arena, kind));
        }
        // Heap data carries no ownership conflict the way a file handle
        // or mmap region does, so it is always beamable: the receiver
        // gets a proxy over the same `Arc`, and the sender's own copy
        // sits in `hold_list` until that proxy drops, exactly like a
        // zero-copy file or mmap bucket.
        if bucket.is_heap() {
            if let Some(converted) = converter::try_convert(self, &bucket) {
                return Ok(converted);
            }
            let target_id = bucket.id;
            let arena = self.0.receiver_arena;
            let (data, start, len) = bucket.heap_arc().expect("is_heap implies heap_arc");
            let proxy = Proxy::new(target_id, arena, len, ProxyPayload::Heap(data, start, len), Arc::downgrade(&self.0));
            bucket.setaside(self.0.sender_arena);
            guard.hold_list.push_back(bucket);
            return Ok(Bucket::from_proxy(proxy));
        }
        if bucket.can_beam(copy_files) {
            if let Some(converted) = converter::try_convert(self, &bucket) {
                return Ok(converted);
            }
            let target_id = bucket.id;
            let arena = self.0.receiver_arena;
            let len = bucket.length().unwrap_or(0);
            let payload = if bucket.is_file() {
                let mut fb = bucket.file_bucket().expect("is_file implies file_bucket").clone();
                fb.mmap_disabled = true;
                ProxyPayload::File(fb)
            } else {
                let (data, start, len) = bucket.mmap_arc().expect("is_mmap implies mmap_arc");
                ProxyPayload::Mmap(data, start, len)
            };
            let proxy = Proxy::new(target_id, arena, len, payload, Arc::downgrade(&self.0));
            bucket.setaside(self.0.sender_arena);
            guard.hold_list.push_back(bucket);
            Ok(Bucket::from_proxy(proxy))
        } else {
            let bytes = bucket.read_bytes_owned()?;
            Ok(Bucket::heap(self.0.receiver_arena, bytes))
        }
    }

    /// Closes one end of the beam. Closing the sender side signals
    /// end-of-stream once all buffered data drains; closing the
    /// receiver side is equivalent to an abort — it is the only way a
    /// receiver can refuse further data — and so this call returns
    /// [`BeamError::Aborted`] in that case, matching the observable
    /// behaviour rather than reporting a misleadingly plain success.
    pub fn close(&self, side: Side) -> Result<()> {
        let mut guard = self.lock();
        match side {
            Side::Sender => {
                guard.closed = true;
                self.purge_sent(&mut guard);
                drop(guard);
                self.report_consumption();
                let mut g = self.lock();
                let was_empty = g.is_empty();
                drop(g);
                self.0.change.notify_all();
                if was_empty {
                    self.invoke0(&self.0.on_was_empty);
                }
                Ok(())
            }
            Side::Receiver => {
                let overshoot = std::mem::take(&mut guard.recv_buffer);
                guard.aborted = true;
                drop(guard);
                drop(overshoot);
                self.0.change.notify_all();
                Err(BeamError::Aborted)
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Aborts the beam: both send and receive fail with `Aborted` from
    /// this point on. Sticky. Buckets already delivered to a receiver
    /// (and their proxies) are unaffected; they still clean up normally
    /// when the last proxy drops.
    pub fn abort(&self, side: Side) {
        let mut guard = self.lock();
        guard.aborted = true;
        match side {
            Side::Sender => {
                let was_empty = guard.is_empty();
                *self.0.on_consumed_bytes.lock().unwrap() = None;
                *self.0.on_consumed_event.lock().unwrap() = None;
                self.purge_sent(&mut guard);
                guard.send_list.drain().for_each(drop);
                drop(guard);
                self.0.change.notify_all();
                if was_empty {
                    self.invoke0(&self.0.on_was_empty);
                }
                self.report_consumption();
            }
            Side::Receiver => {
                let overshoot = std::mem::take(&mut guard.recv_buffer);
                drop(guard);
                drop(overshoot);
                self.0.change.notify_all();
            }
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    /// Blocks until every bucket ever sent has been handed to the
    /// receiver (buffered data drained; buckets still awaiting proxy
    /// release in `hold_list` do not block this).
    pub fn wait_empty(&self, mode: BlockingMode) -> Result<()> {
        let guard = self.lock();
        self.wait_until_empty(guard, mode).map(drop)
    }

    /// Raw bytes currently queued in `send_list`, not yet handed to the
    /// receiver. Unlike [`Beam::mem_used`], this counts a file or mmap
    /// bucket at its real size.
    pub fn buffered(&self) -> usize {
        self.lock().send_list.total_len()
    }

    /// Zero-copy-aware memory footprint of `send_list`: the same metric
    /// backpressure is computed against.
    pub fn mem_used(&self) -> usize {
        self.lock().send_list.mem_used()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn sent_bytes(&self) -> u64 {
        self.lock().sent_bytes
    }

    pub fn received_bytes(&self) -> u64 {
        self.lock().received_bytes
    }

    /// Fires the bytes-consumed callback, if registered, with however
    /// many bytes have been received since the last call. Invoked
    /// automatically at the end of `send`, `close`, and `abort`; exposed
    /// so a caller can also request an out-of-band report. Returns
    /// whether the callback actually fired.
    pub fn report_consumption(&self) -> bool {
        let guard = self.lock();
        let delta = guard.received_bytes.saturating_sub(guard.cons_bytes_reported);
        drop(guard);
        if delta == 0 {
            return false;
        }
        let cb = self.0.on_consumed_bytes.lock().unwrap().clone();
        let fired = cb.is_some();
        if let Some(cb) = cb {
            cb(delta as usize);
        }
        self.lock().cons_bytes_reported += delta;
        fired
    }

    /// Creates a new binding that, when dropped, tears the beam down as
    /// if the arena that owns it had just been destroyed: every live
    /// proxy's reference to this beam goes dangling, and all three
    /// bucket lists are purged. Teardown is idempotent — whichever
    /// binder (or the beam's own final drop) gets there first runs it;
    /// later ones are no-ops. This is the Rust rendering of the source's
    /// `pool_register`/`pool_kill` pre-cleanup pairing for a beam that
    /// may be rebound to more than one arena over its life.
    pub fn bind_arena(&self) -> ArenaBinder {
        ArenaBinder(self.0.clone())
    }

    /// Runs the same teardown as dropping the last [`ArenaBinder`],
    /// immediately. Mirrors the source's explicit `h2_beam_destroy`.
    pub fn destroy(&self) {
        self.0.teardown();
    }

    fn purge_sent(&self, guard: &mut MutexGuard<'_, BeamState>) {
        guard.purge_list.drain().for_each(drop);
    }

    fn invoke0(&self, slot: &Callback0) {
        let cb = slot.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb();
        }
    }

    fn wait_not_full<'a>(
        &self,
        mut guard: MutexGuard<'a, BeamState>,
        mode: BlockingMode,
    ) -> Result<(MutexGuard<'a, BeamState>, usize)> {
        let deadline = guard.timeout.map(|t| Instant::now() + t);
        loop {
            if guard.aborted {
                return Err(BeamError::Aborted);
            }
            let left = guard.space_left();
            if left > 0 {
                return Ok((guard, left));
            }
            if mode == BlockingMode::NonBlocking {
                return Err(BeamError::WouldBlock);
            }
            drop(guard);
            self.invoke0(&self.0.on_send_block);
            guard = self.lock();
            if guard.aborted {
                return Err(BeamError::Aborted);
            }
            if guard.space_left() > 0 {
                return Ok((guard, guard.space_left()));
            }
            guard = match deadline {
                Some(dl) => {
                    let remaining = dl.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(BeamError::TimedOut);
                    }
                    let (g, wr) = self.0.change.wait_timeout(guard, remaining).unwrap();
                    if wr.timed_out() && g.space_left() == 0 {
                        return Err(BeamError::TimedOut);
                    }
                    g
                }
                None => self.0.change.wait(guard).unwrap(),
            };
        }
    }

    fn wait_not_empty<'a>(
        &self,
        mut guard: MutexGuard<'a, BeamState>,
        mode: BlockingMode,
    ) -> Result<MutexGuard<'a, BeamState>> {
        let deadline = guard.timeout.map(|t| Instant::now() + t);
        loop {
            if guard.aborted {
                return Err(BeamError::Aborted);
            }
            if !guard.is_empty() || guard.closed {
                return Ok(guard);
            }
            if mode == BlockingMode::NonBlocking {
                return Err(BeamError::WouldBlock);
            }
            guard = match deadline {
                Some(dl) => {
                    let remaining = dl.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(BeamError::TimedOut);
                    }
                    let (g, wr) = self.0.change.wait_timeout(guard, remaining).unwrap();
                    if wr.timed_out() && g.is_empty() && !g.closed {
                        return Err(BeamError::TimedOut);
                    }
                    g
                }
                None => self.0.change.wait(guard).unwrap(),
            };
        }
    }

    fn wait_until_empty<'a>(
        &self,
        mut guard: MutexGuard<'a, BeamState>,
        mode: BlockingMode,
    ) -> Result<MutexGuard<'a, BeamState>> {
        let deadline = guard.timeout.map(|t| Instant::now() + t);
        loop {
            if guard.is_empty() {
                return Ok(guard);
            }
            if guard.aborted {
                return Err(BeamError::Aborted);
            }
            if mode == BlockingMode::NonBlocking {
                return Err(BeamError::WouldBlock);
            }
            guard = match deadline {
                Some(dl) => {
                    let remaining = dl.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(BeamError::TimedOut);
                    }
                    let (g, wr) = self.0.change.wait_timeout(guard, remaining).unwrap();
                    if wr.timed_out() && !g.is_empty() {
                        return Err(BeamError::TimedOut);
                    }
                    g
                }
                None => self.0.change.wait(guard).unwrap(),
            };
        }
    }
}

impl BeamCore {
    /// Called from `Proxy::drop`: the sender bucket shadowed by
    /// `target_id` has had its last outstanding proxy dropped. It (and
    /// any metadata queued ahead of it in the hold list) may now leave
    /// for the purge list; actually freeing purge-list entries is left
    /// to the sender thread's next call, since only it may safely touch
    /// a sender-owned bucket's backing storage. Mirrors
    /// `h2_beam_emitted`.
    pub(crate) fn emitted(&self, target_id: u64) {
        if self.torn_down.load(Ordering::Acquire) {
            return;
        }
        let mut guard = self.state.lock().unwrap();
        match guard.hold_list.extract_upto(target_id) {
            Some(removed) => {
                for b in removed {
                    guard.purge_list.push_back(b);
                }
            }
            None => {
                logging::warn("emitted proxy had no matching hold-list entry");
            }
        }
        drop(guard);
        self.change.notify_all();
    }

    /// The actual teardown: purges every list, drops any carried-over
    /// receive buffer, and disables the consumption-bytes callback
    /// (matching the source's pool-cleanup disabling `cons_io_cb`
    /// before its context can be freed out from under it). Idempotent.
    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut guard = self.state.lock().unwrap();
        guard.purge_list.drain().for_each(drop);
        guard.send_list.drain().for_each(drop);
        guard.hold_list.drain().for_each(drop);
        let recv_buffer = std::mem::take(&mut guard.recv_buffer);
        drop(guard);
        drop(recv_buffer);
        self.change.notify_all();
        *self.on_consumed_bytes.lock().unwrap() = None;
        *self.on_consumed_event.lock().unwrap() = None;
    }
}

impl Drop for BeamCore {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// A binding of a [`Beam`] to some allocation arena; dropping it tears
/// the beam down as if that arena had just been destroyed. See
/// [`Beam::bind_arena`].
pub struct ArenaBinder(Arc<BeamCore>);

impl Drop for ArenaBinder {
    fn drop(&mut self) {
        self.0.teardown();
    }
}

impl std::fmt::Debug for Beam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.lock();
        f.debug_struct("Beam")
            .field("id", &self.0.id)
            .field("buffered", &guard.send_list.total_len())
            .field("closed", &guard.closed)
            .field("aborted", &guard.aborted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::MetadataKind;
    use std::os::unix::fs::FileExt;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn collect_bytes(brigade: &Brigade) -> Vec<u8> {
        let mut out = Vec::new();
        for b in brigade.iter() {
            if let Some(bytes) = b.as_bytes() {
                out.extend_from_slice(bytes);
            }
        }
        out
    }

    #[test]
    fn simple_transfer() {
        let beam = Beam::new(1024);
        let arena = ArenaId::fresh();

        let mut out = Brigade::new();
        out.push_back(Bucket::heap(arena, vec![1u8; 100]));
        out.push_back(Bucket::heap(arena, vec![2u8; 200]));
        out.push_back(Bucket::heap(arena, vec![3u8; 300]));
        beam.send(&mut out, BlockingMode::Blocking).unwrap();
        assert!(out.is_empty());
        beam.close(Side::Sender).unwrap();

        let mut inbox = Brigade::new();
        match beam.receive(&mut inbox, BlockingMode::Blocking, None).unwrap() {
            RecvOutcome::Data { transferred, closed } => {
                assert_eq!(transferred, 4); // 3 data buckets + auto EOS
                assert!(closed);
            }
            RecvOutcome::Eof => panic!("expected data before eof"),
        }
        assert_eq!(collect_bytes(&inbox).len(), 600);
        assert!(inbox.has_eos());

        let mut inbox2 = Brigade::new();
        match beam.receive(&mut inbox2, BlockingMode::Blocking, None).unwrap() {
            RecvOutcome::Eof => {}
            other => panic!("expected eof, got {other:?}"),
        }
        assert_eq!(beam.buffered(), 0);
        assert_eq!(beam.sent_bytes(), 600);
        assert!(beam.received_bytes() <= beam.sent_bytes());
    }

    #[test]
    fn backpressure_splits_across_drains() {
        let beam = Beam::new(100);
        let arena = ArenaId::fresh();
        let blocked = Arc::new(AtomicUsize::new(0));
        let blocked_cb = blocked.clone();
        beam.on_send_block(move || {
            blocked_cb.fetch_add(1, Ordering::SeqCst);
        });

        let sender_beam = beam.clone();
        let sender = thread::spawn(move || {
            let mut out = Brigade::new();
            out.push_back(Bucket::heap(arena, vec![9u8; 250]));
            sender_beam.send(&mut out, BlockingMode::Blocking)
        });

        let mut sizes = Vec::new();
        for _ in 0..3 {
            let mut inbox = Brigade::new();
            beam.receive(&mut inbox, BlockingMode::Blocking, Some(100)).unwrap();
            sizes.push(collect_bytes(&inbox).len());
        }

        sender.join().unwrap().unwrap();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert!(blocked.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn non_blocking_receive_on_empty_beam_would_block() {
        let beam = Beam::new(0);
        let mut inbox = Brigade::new();
        let err = beam.receive(&mut inbox, BlockingMode::NonBlocking, None).unwrap_err();
        assert!(matches!(err, BeamError::WouldBlock));
        assert!(inbox.is_empty());
    }

    #[test]
    fn abort_mid_flight_stops_both_sides() {
        let beam = Beam::new(0);
        beam.set_tx_mem_limits(false);
        let arena = ArenaId::fresh();

        let mut out = Brigade::new();
        for _ in 0..5 {
            out.push_back(Bucket::heap(arena, vec![7u8; 100]));
        }
        beam.send(&mut out, BlockingMode::Blocking).unwrap();

        let mut inbox = Brigade::new();
        match beam.receive(&mut inbox, BlockingMode::Blocking, Some(200)).unwrap() {
            RecvOutcome::Data { transferred, .. } => assert_eq!(transferred, 2),
            RecvOutcome::Eof => panic!("expected data"),
        }
        assert_eq!(collect_bytes(&inbox).len(), 200);

        beam.abort(Side::Receiver);

        let mut more_out = Brigade::new();
        more_out.push_back(Bucket::heap(arena, vec![1u8; 10]));
        let send_err = beam.send(&mut more_out, BlockingMode::Blocking).unwrap_err();
        assert!(matches!(send_err, BeamError::Aborted));

        let mut leftover = Brigade::new();
        let recv_err = beam.receive(&mut leftover, BlockingMode::Blocking, None).unwrap_err();
        assert!(matches!(recv_err, BeamError::Aborted));

        assert!(beam.lock().recv_buffer.is_empty());
    }

    static TEST_FILE_COUNTER: AtomicUsize = AtomicUsize::new(0);

    #[test]
    fn file_zero_copy_then_proxy_release() {
        let n = TEST_FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("beam_test_{}_{n}.bin", std::process::id()));
        let total: u64 = 10 * 1024 * 1024;
        {
            let f = std::fs::File::create(&path).unwrap();
            f.set_len(total).unwrap();
        }

        let beam = Beam::new(0);
        beam.set_copy_files(false);
        let arena = ArenaId::fresh();
        let file = std::fs::File::open(&path).unwrap();

        let mut out = Brigade::new();
        out.push_back(Bucket::file(arena, file, 0, total));
        beam.send(&mut out, BlockingMode::Blocking).unwrap();
        assert_eq!(beam.mem_used(), 0);

        let mut inbox = Brigade::new();
        beam.receive(&mut inbox, BlockingMode::Blocking, None).unwrap();
        assert_eq!(beam.mem_used(), 0);

        let received = inbox.pop_front().unwrap();
        assert!(received.is_proxy());
        assert_eq!(received.length(), Some(total as usize));

        // Read 3 MiB directly off the rebound handle to confirm the
        // zero-copy transfer actually shares the same file.
        let fb = {
            let crate::bucket::BucketPayload::Proxy(p) = &received.payload else {
                panic!("expected a proxy bucket")
            };
            p.file_bucket().unwrap().clone()
        };
        let mut buf = vec![0u8; 3 * 1024 * 1024];
        fb.file.read_exact_at(&mut buf, fb.offset).unwrap();

        assert_eq!(beam.lock().hold_list.len(), 1);
        drop(received);
        drop(inbox);
        assert_eq!(beam.lock().hold_list.len(), 0);
        assert_eq!(beam.lock().purge_list.len(), 1);

        let mut next_out = Brigade::new();
        next_out.push_back(Bucket::heap(arena, vec![0u8; 1]));
        beam.send(&mut next_out, BlockingMode::Blocking).unwrap();
        assert_eq!(beam.lock().purge_list.len(), 0);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn out_of_order_proxy_drop_respects_metadata_order() {
        let beam = Beam::new(0);
        let arena = ArenaId::fresh();

        let mut out = Brigade::new();
        out.push_back(Bucket::heap(arena, vec![b'A'; 10]));
        out.push_back(Bucket::metadata(arena, MetadataKind::Flush));
        out.push_back(Bucket::heap(arena, vec![b'B'; 10]));
        beam.send(&mut out, BlockingMode::Blocking).unwrap();

        let mut inbox = Brigade::new();
        beam.receive(&mut inbox, BlockingMode::Blocking, None).unwrap();
        assert_eq!(beam.lock().hold_list.len(), 3);

        let mut items: Vec<_> = inbox.drain().collect();
        let proxy_b = items.pop().unwrap();
        let meta_copy = items.pop().unwrap();
        let proxy_a = items.pop().unwrap();
        assert!(proxy_a.is_proxy());
        assert!(meta_copy.is_metadata());
        assert!(proxy_b.is_proxy());

        drop(proxy_b);
        assert_eq!(beam.lock().hold_list.len(), 1); // only A remains
        assert_eq!(beam.lock().purge_list.len(), 2); // M and B

        drop(proxy_a);
        assert_eq!(beam.lock().hold_list.len(), 0);
        assert_eq!(beam.lock().purge_list.len(), 3);

        drop(meta_copy);
    }

    #[test]
    fn metadata_ordering_is_preserved() {
        let beam = Beam::new(0);
        let arena = ArenaId::fresh();

        let mut out = Brigade::new();
        out.push_back(Bucket::flush(arena));
        out.push_back(Bucket::heap(arena, b"x".to_vec()));
        out.push_back(Bucket::flush(arena));
        beam.send(&mut out, BlockingMode::Blocking).unwrap();

        let mut inbox = Brigade::new();
        beam.receive(&mut inbox, BlockingMode::Blocking, None).unwrap();
        let kinds: Vec<bool> = inbox.iter().map(|b| b.is_metadata()).collect();
        assert_eq!(kinds, vec![true, false, true]);
    }

    #[test]
    fn sent_bytes_never_exceeds_max_buf_size_in_flight() {
        let beam = Beam::new(50);
        let arena = ArenaId::fresh();
        let sender_beam = beam.clone();
        let sender = thread::spawn(move || {
            let mut out = Brigade::new();
            out.push_back(Bucket::heap(arena, vec![1u8; 130]));
            let sent = sender_beam.send(&mut out, BlockingMode::Blocking)?;
            sender_beam.close(Side::Sender)?;
            Ok::<usize, BeamError>(sent)
        });

        loop {
            assert!(beam.mem_used() <= 50);
            let mut inbox = Brigade::new();
            match beam.receive(&mut inbox, BlockingMode::Blocking, Some(50)) {
                Ok(RecvOutcome::Data { .. }) => continue,
                Ok(RecvOutcome::Eof) => break,
                Err(_) => break,
            }
        }
        sender.join().unwrap().unwrap();
    }

    #[test]
    fn arena_binder_teardown_detaches_live_proxy() {
        let beam = Beam::new(0);
        let arena = ArenaId::fresh();

        let mut out = Brigade::new();
        out.push_back(Bucket::heap(arena, vec![5u8; 10]));
        beam.send(&mut out, BlockingMode::Blocking).unwrap();

        let mut inbox = Brigade::new();
        beam.receive(&mut inbox, BlockingMode::Blocking, None).unwrap();
        let proxy = inbox.pop_front().unwrap();
        assert!(proxy.is_proxy());
        assert_eq!(beam.lock().hold_list.len(), 1);

        // Tearing the beam down while a proxy is still outstanding must
        // purge every list immediately rather than wait for that proxy
        // to drop.
        let binder = beam.bind_arena();
        drop(binder);
        assert_eq!(beam.lock().hold_list.len(), 0);
        assert_eq!(beam.lock().purge_list.len(), 0);

        // The late proxy drop's `emitted()` call must become a no-op
        // instead of panicking or re-purging anything.
        drop(proxy);
        assert_eq!(beam.lock().hold_list.len(), 0);
        assert_eq!(beam.lock().purge_list.len(), 0);

        // Teardown is idempotent: a second binder, or an explicit
        // `destroy()`, after the first one already ran is a no-op too.
        let second_binder = beam.bind_arena();
        drop(second_binder);
        beam.destroy();
    }
}
