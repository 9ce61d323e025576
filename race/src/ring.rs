//! Submission and completion rings shared with an external consumer.
//!
//! The layout follows the usual shape of an asynchronous submission interface: a descriptor
//! array, an index array the consumer dereferences to find the next descriptor, and a separate
//! array of completion records. Every cursor has a single writer and only ever moves forward
//! (wrapping modulo the ring size):
//!
//! | cursor            | writer   |
//! |-------------------|----------|
//! | submission tail   | producer |
//! | submission head   | consumer |
//! | completion tail   | consumer |
//! | completion head   | producer |
//!
//! Descriptors stay in shared storage until the consumer completes them. The consumer reads
//! their fields in place (it never takes a private copy), which is exactly what
//! [RingChannel::mutate_submitted] relies on.
//!
//! Completions may be posted in any order. The submission head only advances over the
//! contiguous run of completed slots, so a slot is never handed back to the producer while an
//! earlier fetched descriptor is still being processed.

use crate::{trap::RegionId, Error};
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};
use tracing::{debug, trace};

/// Largest submission ring that can be requested.
pub const MAX_ENTRIES: u32 = 4096;

/// Classification field of a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Kind(pub u8);

impl Kind {
    pub const NOP: Kind = Kind(0);
    pub const SEND: Kind = Kind(9);
    pub const RECV: Kind = Kind(10);

    /// Whether processing this kind may have to wait on its endpoint (and is therefore
    /// handed off to a worker context by consumers that punt blocking work).
    pub fn may_block(&self) -> bool {
        *self == Kind::RECV
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Kind::NOP => f.write_str("nop"),
            Kind::SEND => f.write_str("send"),
            Kind::RECV => f.write_str("recv"),
            Kind(other) => write!(f, "kind({other})"),
        }
    }
}

impl FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nop" => Ok(Kind::NOP),
            "send" | "sendmsg" => Ok(Kind::SEND),
            "recv" | "recvmsg" => Ok(Kind::RECV),
            other => other
                .parse::<u8>()
                .map(Kind)
                .map_err(|_| format!("unknown kind: {s}")),
        }
    }
}

/// Opaque endpoint handle the consumer acts on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Endpoint(pub i32);

/// Location of a descriptor's auxiliary data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AuxRef {
    pub region: RegionId,
    pub offset: u32,
    pub len: u32,
}

/// A request as written by the producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Descriptor {
    pub kind: Kind,
    pub endpoint: Endpoint,
    pub auxiliary: AuxRef,
}

/// Identity assigned to a descriptor on submission and echoed in its completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SubmissionId(pub u64);

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result posted by the consumer for one descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CompletionRecord {
    pub id: SubmissionId,
    /// Non-negative on success (usually a byte count), negative errno otherwise.
    pub result: i32,
    pub flags: u32,
}

impl CompletionRecord {
    pub fn is_success(&self) -> bool {
        self.result >= 0
    }
}

/// Configuration for a [RingChannel].
#[derive(Clone, Debug)]
pub struct Config {
    /// Requested submission capacity. Rounded up to the next power of two.
    ///
    /// The completion ring is twice as large.
    pub entries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self { entries: 16 }
    }
}

/// Wakes a party waiting for the other side of the ring to make progress.
///
/// Waiters snapshot the generation before checking shared state, so a ring that happens
/// between the check and the wait is never missed.
#[derive(Default)]
pub struct Doorbell {
    generation: Mutex<u64>,
    rung: Condvar,
}

impl Doorbell {
    pub fn generation(&self) -> u64 {
        *self.generation.lock().expect("doorbell poisoned")
    }

    pub fn ring(&self) {
        let mut generation = self.generation.lock().expect("doorbell poisoned");
        *generation = generation.wrapping_add(1);
        self.rung.notify_all();
    }

    /// Wait until the generation moves past `seen`. Returns false on timeout.
    pub fn wait(&self, seen: u64, timeout: Option<Duration>) -> bool {
        let generation = self.generation.lock().expect("doorbell poisoned");
        match timeout {
            Some(timeout) => {
                let (_generation, result) = self
                    .rung
                    .wait_timeout_while(generation, timeout, |generation| *generation == seen)
                    .expect("doorbell poisoned");
                !result.timed_out()
            }
            None => {
                let _generation = self
                    .rung
                    .wait_while(generation, |generation| *generation == seen)
                    .expect("doorbell poisoned");
                true
            }
        }
    }
}

#[derive(Default)]
struct Slot {
    kind: AtomicU8,
    endpoint: AtomicI32,
    region: AtomicU64,
    offset: AtomicU32,
    len: AtomicU32,
    user_data: AtomicU64,
    // Set by the consumer on completion, cleared when the head moves past the slot.
    done: AtomicBool,
}

#[derive(Default)]
struct Cqe {
    user_data: AtomicU64,
    result: AtomicI32,
    flags: AtomicU32,
}

impl Cqe {
    fn load(&self) -> CompletionRecord {
        CompletionRecord {
            id: SubmissionId(self.user_data.load(Ordering::Relaxed)),
            result: self.result.load(Ordering::Relaxed),
            flags: self.flags.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    sq_entries: u32,
    sq_mask: u32,
    sq_head: AtomicU32,
    sq_tail: AtomicU32,
    sq_array: Box<[AtomicU32]>,
    sqes: Box<[Slot]>,

    cq_entries: u32,
    cq_mask: u32,
    cq_head: AtomicU32,
    cq_tail: AtomicU32,
    cqes: Box<[Cqe]>,

    completed: Doorbell,
    reaped: Doorbell,
    closed: AtomicBool,
}

impl Shared {
    fn cq_full(&self) -> bool {
        let tail = self.cq_tail.load(Ordering::Relaxed);
        let head = self.cq_head.load(Ordering::Acquire);
        tail.wrapping_sub(head) >= self.cq_entries
    }
}

/// Producer side of the ring.
pub struct RingChannel {
    shared: Arc<Shared>,
    next_id: u64,
    // Submission id -> descriptor slot, until the completion is reaped.
    in_flight: HashMap<SubmissionId, u32>,
    // Most recently reaped records, at most `cq_entries` of them.
    reaped: VecDeque<CompletionRecord>,
}

impl RingChannel {
    /// Create a ring and the [Consumer] that drains it.
    pub fn new(cfg: Config) -> Result<(Self, Consumer), Error> {
        if cfg.entries == 0 || cfg.entries > MAX_ENTRIES {
            return Err(Error::InvalidConfig("entries must be in 1..=4096"));
        }
        let sq_entries = cfg.entries.next_power_of_two();
        let cq_entries = sq_entries * 2;
        let shared = Arc::new(Shared {
            sq_entries,
            sq_mask: sq_entries - 1,
            sq_head: AtomicU32::new(0),
            sq_tail: AtomicU32::new(0),
            sq_array: (0..sq_entries).map(|_| AtomicU32::new(0)).collect(),
            sqes: (0..sq_entries).map(|_| Slot::default()).collect(),
            cq_entries,
            cq_mask: cq_entries - 1,
            cq_head: AtomicU32::new(0),
            cq_tail: AtomicU32::new(0),
            cqes: (0..cq_entries).map(|_| Cqe::default()).collect(),
            completed: Doorbell::default(),
            reaped: Doorbell::default(),
            closed: AtomicBool::new(false),
        });
        debug!(sq_entries, cq_entries, "created ring");
        let consumer = Consumer {
            shared: shared.clone(),
            fetched: 0,
        };
        Ok((
            Self {
                shared,
                next_id: 0,
                in_flight: HashMap::new(),
                reaped: VecDeque::new(),
            },
            consumer,
        ))
    }

    /// Submission capacity (after rounding).
    pub fn capacity(&self) -> u32 {
        self.shared.sq_entries
    }

    /// Number of descriptors submitted but not yet completed by the consumer.
    pub fn pending(&self) -> u32 {
        let tail = self.shared.sq_tail.load(Ordering::Relaxed);
        let head = self.shared.sq_head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    /// Number of descriptors submitted and not yet reaped with [RingChannel::poll_completion].
    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    /// Write `descriptor` into the next submission slot and publish it.
    ///
    /// Waking the consumer is left to the transport.
    pub fn submit(&mut self, descriptor: Descriptor) -> Result<SubmissionId, Error> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let tail = shared.sq_tail.load(Ordering::Relaxed);
        let head = shared.sq_head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= shared.sq_entries {
            return Err(Error::ChannelFull);
        }

        let id = SubmissionId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);

        let index = tail & shared.sq_mask;
        let slot = &shared.sqes[index as usize];
        slot.kind.store(descriptor.kind.0, Ordering::Relaxed);
        slot.endpoint.store(descriptor.endpoint.0, Ordering::Relaxed);
        slot.region
            .store(descriptor.auxiliary.region.0, Ordering::Relaxed);
        slot.offset
            .store(descriptor.auxiliary.offset, Ordering::Relaxed);
        slot.len.store(descriptor.auxiliary.len, Ordering::Relaxed);
        slot.user_data.store(id.0, Ordering::Relaxed);
        shared.sq_array[index as usize].store(index, Ordering::Relaxed);
        shared.sq_tail.store(tail.wrapping_add(1), Ordering::Release);

        self.in_flight.insert(id, index);
        debug!(%id, kind = %descriptor.kind, slot = index, "submitted descriptor");
        Ok(id)
    }

    /// Overwrite the kind of a descriptor the consumer has not completed yet.
    ///
    /// Returns the kind that was replaced. Fails with [Error::AlreadyConsumed] if a completion
    /// for `id` has been posted (whether or not it was reaped) and with
    /// [Error::UnknownSubmission] if `id` was never issued by this ring.
    ///
    /// # Safety
    ///
    /// The slot is shared with the consumer without any copy barrier or lock. The caller must
    /// know the consumer is parked (typically on an unpopulated trap region referenced by this
    /// descriptor) so that the overwrite lands between the consumer's reads of the field
    /// rather than racing an arbitrary one. The write itself is atomic, but the consumer will
    /// act on whichever value it observes.
    pub unsafe fn mutate_submitted(
        &self,
        id: SubmissionId,
        kind: Kind,
    ) -> Result<Kind, Error> {
        let Some(index) = self.in_flight.get(&id) else {
            // Issued ids leave the in-flight set only once their completion is reaped
            if id.0 < self.next_id {
                return Err(Error::AlreadyConsumed(id));
            }
            return Err(Error::UnknownSubmission(id));
        };
        if self.consumer_result_for(id).is_some() {
            return Err(Error::AlreadyConsumed(id));
        }
        let previous = self.shared.sqes[*index as usize]
            .kind
            .swap(kind.0, Ordering::AcqRel);
        let previous = Kind(previous);
        debug!(%id, from = %previous, to = %kind, "mutated submitted descriptor");
        Ok(previous)
    }

    /// Look for a completion of `id`, without consuming it.
    ///
    /// Covers records still in the completion ring and the most recently reaped ones (as many
    /// as the completion ring holds).
    pub fn consumer_result_for(&self, id: SubmissionId) -> Option<CompletionRecord> {
        if let Some(record) = self.reaped.iter().find(|record| record.id == id) {
            return Some(*record);
        }
        let shared = &self.shared;
        let head = shared.cq_head.load(Ordering::Relaxed);
        let tail = shared.cq_tail.load(Ordering::Acquire);
        let mut cursor = head;
        while cursor != tail {
            let record = shared.cqes[(cursor & shared.cq_mask) as usize].load();
            if record.id == id {
                return Some(record);
            }
            cursor = cursor.wrapping_add(1);
        }
        None
    }

    /// Take the next completion record, waiting at most `timeout` for one to be posted.
    pub fn poll_completion(&mut self, timeout: Duration) -> Result<CompletionRecord, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.shared.completed.generation();
            if let Some(record) = self.reap() {
                return Ok(record);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            self.shared.completed.wait(seen, Some(remaining));
        }
    }

    fn reap(&mut self) -> Option<CompletionRecord> {
        let shared = &self.shared;
        let head = shared.cq_head.load(Ordering::Relaxed);
        let tail = shared.cq_tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let record = shared.cqes[(head & shared.cq_mask) as usize].load();
        shared.cq_head.store(head.wrapping_add(1), Ordering::Release);
        shared.reaped.ring();
        self.in_flight.remove(&record.id);
        if self.reaped.len() == shared.cq_entries as usize {
            self.reaped.pop_front();
        }
        self.reaped.push_back(record);
        trace!(id = %record.id, result = record.result, "reaped completion");
        Some(record)
    }
}

impl Drop for RingChannel {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.reaped.ring();
    }
}

/// Consumer side of the ring.
pub struct Consumer {
    shared: Arc<Shared>,
    // Private fetch cursor. The shared head only advances on completion so that slots stay
    // valid while their descriptors are processed.
    fetched: u32,
}

impl Consumer {
    /// Whether the producer side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Fetch the next published descriptor, if any.
    pub fn fetch(&mut self) -> Option<Submission> {
        let shared = &self.shared;
        let tail = shared.sq_tail.load(Ordering::Acquire);
        if self.fetched == tail {
            return None;
        }
        let index = shared.sq_array[(self.fetched & shared.sq_mask) as usize].load(Ordering::Relaxed);
        self.fetched = self.fetched.wrapping_add(1);
        Some(Submission {
            shared: shared.clone(),
            index: index & shared.sq_mask,
        })
    }

    /// Post the completion of `submission` and release its slot.
    ///
    /// If the completion ring is full nothing is posted and `submission` is handed back so the
    /// completion can be retried once the producer reaps (see [Consumer::wait_for_space]).
    pub fn complete(&mut self, submission: Submission, result: i32) -> Result<(), Full> {
        let id = submission.id();
        self.post(submission, id, result)
    }

    /// Complete `submission` under an arbitrary identity, as a faulty consumer would.
    #[cfg(test)]
    pub(crate) fn complete_as(
        &mut self,
        submission: Submission,
        id: SubmissionId,
        result: i32,
    ) -> Result<(), Full> {
        self.post(submission, id, result)
    }

    fn post(&mut self, submission: Submission, id: SubmissionId, result: i32) -> Result<(), Full> {
        let shared = &self.shared;
        if shared.cq_full() {
            return Err(Full(submission));
        }
        let tail = shared.cq_tail.load(Ordering::Relaxed);
        let cqe = &shared.cqes[(tail & shared.cq_mask) as usize];
        cqe.user_data.store(id.0, Ordering::Relaxed);
        cqe.result.store(result, Ordering::Relaxed);
        cqe.flags.store(0, Ordering::Relaxed);
        shared.cq_tail.store(tail.wrapping_add(1), Ordering::Release);

        // Release the contiguous run of completed slots starting at the head
        submission.slot().done.store(true, Ordering::Relaxed);
        let mut head = shared.sq_head.load(Ordering::Relaxed);
        while head != self.fetched {
            let index = shared.sq_array[(head & shared.sq_mask) as usize].load(Ordering::Relaxed);
            let slot = &shared.sqes[(index & shared.sq_mask) as usize];
            if !slot.done.swap(false, Ordering::Relaxed) {
                break;
            }
            head = head.wrapping_add(1);
        }
        shared.sq_head.store(head, Ordering::Release);
        shared.completed.ring();
        trace!(%id, result, "posted completion");
        Ok(())
    }

    /// Wait until the completion ring has room for another record.
    ///
    /// Returns false if `timeout` elapses without a reap or the producer side is dropped.
    pub fn wait_for_space(&self, timeout: Option<Duration>) -> bool {
        let shared = &self.shared;
        loop {
            let seen = shared.reaped.generation();
            if shared.closed.load(Ordering::Acquire) {
                return false;
            }
            if !shared.cq_full() {
                return true;
            }
            if !shared.reaped.wait(seen, timeout) {
                return false;
            }
        }
    }
}

/// Returned by [Consumer::complete] when the completion ring has no room.
pub struct Full(pub Submission);

impl Full {
    pub fn into_inner(self) -> Submission {
        self.0
    }
}

impl fmt::Debug for Full {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Full({})", self.0.id())
    }
}

/// A descriptor being processed by the consumer.
///
/// Field accessors read shared storage every time they are called: two calls to
/// [Submission::kind] are two fetches and may disagree.
pub struct Submission {
    shared: Arc<Shared>,
    index: u32,
}

impl Submission {
    fn slot(&self) -> &Slot {
        &self.shared.sqes[self.index as usize]
    }

    pub fn id(&self) -> SubmissionId {
        SubmissionId(self.slot().user_data.load(Ordering::Relaxed))
    }

    pub fn kind(&self) -> Kind {
        Kind(self.slot().kind.load(Ordering::Acquire))
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint(self.slot().endpoint.load(Ordering::Relaxed))
    }

    pub fn auxiliary(&self) -> AuxRef {
        let slot = self.slot();
        AuxRef {
            region: RegionId(slot.region.load(Ordering::Relaxed)),
            offset: slot.offset.load(Ordering::Relaxed),
            len: slot.len.load(Ordering::Relaxed),
        }
    }
}
