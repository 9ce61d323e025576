//! Drive one double-fetch race from submission to completion.
//!
//! An attempt moves through the following states:
//!
//! ```txt
//! Idle -> Submitted -> AwaitingFault -> Mutated -> Populated -> Completed
//!            |               |              |            |
//!            +---------------+--------------+------------+----> Aborted
//!                            |
//!                            +----> NotTriggered (no fault before the timeout)
//! ```
//!
//! The fault is awaited on a dedicated thread so the orchestrating sequence is never stuck in
//! [TrapRegion::wait_for_fault] itself; it only waits on the rendezvous with that thread. Every
//! exit path releases the trap (with the abort payload if the consumer is parked on it), drains
//! the outstanding completion and shuts the consumer down.

use crate::{
    payload::Payload,
    ring::{self, AuxRef, CompletionRecord, Descriptor, RingChannel, SubmissionId},
    transport::Transport,
    trap::{FaultToken, TrapHandle, TrapRegion},
    Error,
};
use futures::{channel::oneshot, executor::block_on};
use serde::Serialize;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

/// Configuration for a [Racer].
#[derive(Clone, Debug)]
pub struct Config {
    /// Ring shared with the consumer.
    pub ring: ring::Config,
    /// Size of the trap region (the auxiliary data referenced by the descriptor).
    pub region_length: usize,
    /// Arm the trap before submitting. Without it the consumer never parks and the fault wait
    /// fails immediately.
    pub arm_trap: bool,
    /// Upper bound on the wait for the consumer to touch the trap region.
    pub fault_timeout: Duration,
    /// Upper bound on the wait for the completion once the region is populated.
    pub completion_timeout: Duration,
    /// Upper bound on the wait for the completion of an attempt that did not complete normally.
    pub drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ring: ring::Config::default(),
            region_length: 4096,
            arm_trap: true,
            fault_timeout: Duration::from_secs(5),
            completion_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(1),
        }
    }
}

/// Progress of an attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Idle,
    Submitted,
    AwaitingFault,
    Mutated,
    Populated,
    Completed,
    Aborted,
    NotTriggered,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Completed | State::Aborted | State::NotTriggered)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Idle => "idle",
            State::Submitted => "submitted",
            State::AwaitingFault => "awaiting_fault",
            State::Mutated => "mutated",
            State::Populated => "populated",
            State::Completed => "completed",
            State::Aborted => "aborted",
            State::NotTriggered => "not_triggered",
        };
        f.write_str(name)
    }
}

/// The operation an attempt was performing when it failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Setup,
    Submit,
    WaitForFault,
    Mutate,
    Populate,
    Complete,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Setup => "setup",
            Step::Submit => "submit",
            Step::WaitForFault => "wait_for_fault",
            Step::Mutate => "mutate",
            Step::Populate => "populate",
            Step::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Why an attempt was aborted.
#[derive(Debug)]
pub struct Failure {
    pub step: Step,
    pub error: Error,
}

/// Monotonic counter used to order the steps of an attempt across threads.
#[derive(Debug, Default)]
pub struct Sequencer(AtomicU64);

impl Sequencer {
    /// Next sequence number (starting at 1).
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Sequence numbers and wall-clock margins recorded during an attempt.
///
/// Sequence numbers order the steps. The margins are diagnostics only: nothing in the race
/// depends on them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Timeline {
    pub submit_seq: Option<u64>,
    pub fault_seq: Option<u64>,
    pub mutate_seq: Option<u64>,
    pub populate_seq: Option<u64>,
    pub complete_seq: Option<u64>,
    /// Submission to fault observation.
    pub fault_after_us: Option<u64>,
    /// Fault observation to population (how long the consumer was held).
    pub window_us: Option<u64>,
    /// Population to completion.
    pub completion_after_us: Option<u64>,
}

fn micros(from: Instant, to: Instant) -> u64 {
    u64::try_from(to.saturating_duration_since(from).as_micros()).unwrap_or(u64::MAX)
}

/// Everything known about a finished attempt.
#[derive(Debug)]
pub struct Attempt {
    pub state: State,
    pub submission: Option<SubmissionId>,
    pub fault: Option<FaultToken>,
    pub completion: Option<CompletionRecord>,
    pub failure: Option<Failure>,
    pub timeline: Timeline,
}

impl Attempt {
    fn new() -> Self {
        Self {
            state: State::Idle,
            submission: None,
            fault: None,
            completion: None,
            failure: None,
            timeline: Timeline::default(),
        }
    }

    fn transition(&mut self, state: State) {
        debug!(from = %self.state, to = %state, "transition");
        self.state = state;
    }

    fn abort(&mut self, step: Step, error: Error) {
        warn!(%step, state = %self.state, ?error, "aborting attempt");
        self.transition(State::Aborted);
        self.failure = Some(Failure { step, error });
    }
}

/// Resources held for the lifetime of one attempt.
struct Session<H> {
    ring: RingChannel,
    handle: H,
    region: TrapRegion,
    trap: Option<TrapHandle>,
    mutated: Option<SubmissionId>,
}

/// Orchestrates a single-slot race against a [Transport].
pub struct Racer<T: Transport> {
    cfg: Config,
    transport: T,
    sequencer: Arc<Sequencer>,
}

impl<T: Transport> Racer<T> {
    pub fn new(cfg: Config, transport: T) -> Self {
        Self {
            cfg,
            transport,
            sequencer: Arc::new(Sequencer::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run one attempt with `payload`.
    ///
    /// Never panics on backend misbehavior: every failure is recorded in the returned
    /// [Attempt] along with the step that failed.
    pub fn run(&self, payload: &Payload) -> Attempt {
        let mut attempt = Attempt::new();
        let mut session = match self.setup() {
            Ok(session) => session,
            Err(err) => {
                attempt.abort(Step::Setup, err);
                return attempt;
            }
        };

        if let Err((step, err)) = self.race(&mut session, payload, &mut attempt) {
            attempt.abort(step, err);
        }
        self.release(session, payload, &mut attempt);

        info!(
            state = %attempt.state,
            submission = ?attempt.submission.map(|id| id.0),
            result = ?attempt.completion.map(|record| record.result),
            "attempt finished"
        );
        attempt
    }

    fn setup(&self) -> Result<Session<T::Handle>, Error> {
        let (ring, consumer) = RingChannel::new(self.cfg.ring.clone())?;
        let region = TrapRegion::create(self.cfg.region_length)?;
        let trap = if self.cfg.arm_trap {
            Some(region.register_trap()?)
        } else {
            None
        };
        let handle = self.transport.open(consumer)?;
        self.transport.expose(&handle, region.reader())?;
        Ok(Session {
            ring,
            handle,
            region,
            trap,
            mutated: None,
        })
    }

    fn race(
        &self,
        session: &mut Session<T::Handle>,
        payload: &Payload,
        attempt: &mut Attempt,
    ) -> Result<(), (Step, Error)> {
        // Submit the benign descriptor, pointing into the trap region
        let len = u32::try_from(session.region.len())
            .map_err(|_| (Step::Submit, Error::InvalidConfig("region too large")))?;
        let descriptor = Descriptor {
            kind: payload.benign,
            endpoint: payload.endpoint,
            auxiliary: AuxRef {
                region: session.region.id(),
                offset: 0,
                len,
            },
        };
        let id = session
            .ring
            .submit(descriptor)
            .map_err(|err| (Step::Submit, err))?;
        let submitted_at = Instant::now();
        attempt.submission = Some(id);
        attempt.timeline.submit_seq = Some(self.sequencer.next());
        attempt.transition(State::Submitted);
        self.transport
            .notify_pending(&session.handle)
            .map_err(|err| (Step::Submit, err))?;

        // Wait for the consumer to park on the region
        let (tx, rx) = oneshot::channel();
        let region = session.region.clone();
        let sequencer = self.sequencer.clone();
        let timeout = self.cfg.fault_timeout;
        let waiter = thread::Builder::new()
            .name("fault-waiter".into())
            .spawn(move || {
                let result = region
                    .wait_for_fault(timeout)
                    .map(|token| (token, sequencer.next(), Instant::now()));
                let _ = tx.send(result);
            })
            .map_err(|err| (Step::WaitForFault, Error::Spawn(err)))?;
        attempt.transition(State::AwaitingFault);
        let observed = block_on(rx);
        if waiter.join().is_err() {
            warn!("fault waiter panicked");
        }
        let (token, fault_seq, faulted_at) = match observed {
            Ok(Ok(observed)) => observed,
            Ok(Err(Error::NoFaultObserved)) => {
                info!(%id, timeout = ?self.cfg.fault_timeout, "consumer never touched the trap region");
                attempt.transition(State::NotTriggered);
                return Ok(());
            }
            Ok(Err(err)) => return Err((Step::WaitForFault, err)),
            Err(oneshot::Canceled) => return Err((Step::WaitForFault, Error::Closed)),
        };
        attempt.timeline.fault_seq = Some(fault_seq);
        attempt.timeline.fault_after_us = Some(micros(submitted_at, faulted_at));
        attempt.fault = Some(token.clone());

        // Swap the kind while the consumer is parked
        //
        // SAFETY: the consumer is blocked inside its read of the (still unpopulated) trap
        // region referenced by this descriptor, so it cannot reach its next read of the kind
        // until the region is populated below.
        let previous = unsafe { session.ring.mutate_submitted(id, payload.malicious) }
            .map_err(|err| (Step::Mutate, err))?;
        session.mutated = Some(id);
        attempt.timeline.mutate_seq = Some(self.sequencer.next());
        attempt.transition(State::Mutated);
        debug!(%id, from = %previous, to = %payload.malicious, "swapped kind");
        self.transport
            .notify_pending(&session.handle)
            .map_err(|err| (Step::Mutate, err))?;

        // Release the consumer with the true auxiliary data
        session
            .region
            .populate(Some(&token), &payload.bytes)
            .map_err(|err| (Step::Populate, err))?;
        let populated_at = Instant::now();
        attempt.timeline.populate_seq = Some(self.sequencer.next());
        attempt.timeline.window_us = Some(micros(faulted_at, populated_at));
        attempt.transition(State::Populated);

        // Collect the completion
        let record = session
            .ring
            .poll_completion(self.cfg.completion_timeout)
            .map_err(|err| (Step::Complete, err))?;
        attempt.completion = Some(record);
        attempt.timeline.complete_seq = Some(self.sequencer.next());
        attempt.timeline.completion_after_us = Some(micros(populated_at, Instant::now()));
        if record.id != id {
            return Err((
                Step::Complete,
                Error::IdentityMismatch {
                    submitted: id,
                    completed: record.id,
                },
            ));
        }
        attempt.transition(State::Completed);
        Ok(())
    }

    fn release(&self, mut session: Session<T::Handle>, payload: &Payload, attempt: &mut Attempt) {
        // Undo the swap if the consumer is still parked and will not see the true payload
        if let (State::Aborted, Some(id)) = (attempt.state, session.mutated) {
            if session.region.contents().is_none() {
                // SAFETY: the region is still unpopulated, so the consumer is parked exactly
                // where it was when the kind was swapped.
                match unsafe { session.ring.mutate_submitted(id, payload.benign) } {
                    Ok(_) => debug!(%id, kind = %payload.benign, "restored kind"),
                    Err(err) => warn!(%id, ?err, "unable to restore kind"),
                }
            }
        }

        // Disarm (releasing any parked reader with the abort payload)
        drop(session.trap.take());

        // Reclaim the slot
        if session.ring.outstanding() > 0 {
            match session.ring.poll_completion(self.cfg.drain_timeout) {
                Ok(record) => {
                    debug!(id = %record.id, result = record.result, "drained completion");
                    if attempt.completion.is_none() {
                        attempt.completion = Some(record);
                    }
                }
                Err(err) => warn!(?err, "unable to drain completion"),
            }
        }

        self.transport
            .withdraw(&session.handle, session.region.id());
    }
}
