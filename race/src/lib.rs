//! Orchestrate a single double-fetch race against an asynchronous submission ring.
//!
//! Asynchronous submission interfaces often read a submitted descriptor more than once: once
//! to classify its kind and again, possibly much later and on a different execution context,
//! when acting on the auxiliary data it references. If resolving that auxiliary data can be
//! delayed, the kind can be swapped between the two reads.
//!
//! This crate provides the pieces required to open and exploit that window deterministically:
//!
//! - [trap::TrapRegion]: memory whose first access blocks the reader and notifies the harness.
//! - [ring::RingChannel]: a submission/completion ring shared with an external consumer.
//! - [racer::Racer]: the state machine that submits, waits for the fault, mutates the kind in
//!   place, populates the region and collects the completion.
//! - [harness::Harness]: runs one attempt and turns it into a [harness::Report].
//!
//! The consumer is reached through the [transport::Transport] trait. [mocks] provides an
//! in-process consumer that reproduces the double-fetch behavior (and its fixed variant).
//!
//! # Ordering
//!
//! Correctness never depends on timing. The consumer blocks on the unpopulated region, the racer
//! is notified of that block, mutates the descriptor, and only then populates the region:
//!
//! ```txt
//! consumer: fetch kind ──> touch region (blocks) ······················> re-fetch kind ──> execute
//! waiter:                          └──> fault token ─┐
//! racer:    submit ─────────────────────────────────> mutate ──> populate ─┘
//! ```

use thiserror::Error;

pub mod harness;
pub mod mocks;
pub mod payload;
pub mod racer;
pub mod ring;
pub mod transport;
pub mod trap;

pub use harness::{Harness, Outcome, Report};
pub use payload::Payload;
pub use racer::Racer;
pub use ring::{CompletionRecord, Descriptor, Endpoint, Kind, RingChannel, SubmissionId};
pub use transport::Transport;
pub use trap::{FaultToken, RegionId, TrapHandle, TrapRegion};

/// Errors that can occur while preparing or running a race attempt.
#[derive(Error, Debug)]
pub enum Error {
    #[error("allocation failed: {0} bytes")]
    Allocation(usize),
    #[error("registration failed: {0}")]
    Registration(&'static str),
    #[error("channel full")]
    ChannelFull,
    #[error("already consumed: {0}")]
    AlreadyConsumed(SubmissionId),
    #[error("already populated")]
    AlreadyPopulated,
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("timeout")]
    Timeout,
    #[error("no fault observed")]
    NoFaultObserved,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("unknown submission: {0}")]
    UnknownSubmission(SubmissionId),
    #[error("fault token belongs to region {0}")]
    ForeignToken(RegionId),
    #[error("out of bounds: offset={offset} len={len} region={length}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        length: usize,
    },
    #[error("identity mismatch: submitted {submitted}, completed {completed}")]
    IdentityMismatch {
        submitted: SubmissionId,
        completed: SubmissionId,
    },
    #[error("message of {body} bytes does not fit in {len} bytes")]
    MessageTooLarge { body: usize, len: usize },
        #[error("closed")]
    Closed,
    #[error("spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}
