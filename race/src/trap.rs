//! Memory that blocks its first reader until explicitly populated.
//!
//! A [TrapRegion] starts unpopulated. Once armed with [TrapRegion::register_trap], any reader
//! that touches it through a [RegionReader] parks until [TrapRegion::populate] supplies the
//! contents. The first such access is reported (exactly once) to whoever is blocked in
//! [TrapRegion::wait_for_fault].
//!
//! An unarmed region behaves like freshly mapped anonymous memory: reads never block and
//! observe zeroes.

use crate::Error;
use bytes::Bytes;
use serde::Serialize;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    time::Duration,
};
use tracing::{debug, warn};

/// Source of region identities (only used to pair tokens and descriptors with regions).
static NEXT_REGION: AtomicU64 = AtomicU64::new(1);

/// Identity of a [TrapRegion].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RegionId(pub u64);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a region's contents have been supplied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PopulationState {
    Unpopulated,
    Populated,
}

/// Identifies the access that faulted on an armed region.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FaultToken {
    /// Region that was touched.
    pub region: RegionId,
    /// Offset of the faulting access.
    pub offset: usize,
    /// Length of the faulting access.
    pub len: usize,
}

enum Fault {
    None,
    Pending(FaultToken),
    Reported,
}

struct State {
    data: Vec<u8>,
    population: PopulationState,
    armed: bool,
    fault: Fault,
    blocked: usize,
    aborted: bool,
}

struct Shared {
    id: RegionId,
    length: usize,
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("trap state poisoned")
    }

    /// Fill an unpopulated region and wake every parked reader.
    fn fill(&self, state: &mut State, bytes: &[u8]) {
        state.data.extend_from_slice(bytes);
        state.population = PopulationState::Populated;
        state.armed = false;
        self.changed.notify_all();
    }
}

/// A region that can be armed for fault interception.
///
/// Cloning returns another reference to the same region.
#[derive(Clone)]
pub struct TrapRegion {
    shared: Arc<Shared>,
}

impl TrapRegion {
    /// Reserve an unpopulated region of `length` bytes.
    pub fn create(length: usize) -> Result<Self, Error> {
        if length == 0 {
            return Err(Error::Allocation(length));
        }
        let mut data = Vec::new();
        data.try_reserve_exact(length)
            .map_err(|_| Error::Allocation(length))?;
        let id = RegionId(NEXT_REGION.fetch_add(1, Ordering::Relaxed));
        debug!(region = %id, length, "created region");
        Ok(Self {
            shared: Arc::new(Shared {
                id,
                length,
                state: Mutex::new(State {
                    data,
                    population: PopulationState::Unpopulated,
                    armed: false,
                    fault: Fault::None,
                    blocked: 0,
                    aborted: false,
                }),
                changed: Condvar::new(),
            }),
        })
    }

    pub fn id(&self) -> RegionId {
        self.shared.id
    }

    pub fn len(&self) -> usize {
        self.shared.length
    }

    pub fn is_empty(&self) -> bool {
        self.shared.length == 0
    }

    pub fn population(&self) -> PopulationState {
        self.shared.lock().population
    }

    /// Whether the region was released with the abort payload instead of real contents.
    pub fn aborted(&self) -> bool {
        self.shared.lock().aborted
    }

    /// Contents of the region, if populated.
    pub fn contents(&self) -> Option<Bytes> {
        let state = self.shared.lock();
        match state.population {
            PopulationState::Populated => Some(Bytes::copy_from_slice(&state.data)),
            PopulationState::Unpopulated => None,
        }
    }

    /// A handle the consumer side uses to touch the region.
    pub fn reader(&self) -> RegionReader {
        RegionReader {
            shared: self.shared.clone(),
        }
    }

    /// Arm fault interception over the whole region.
    ///
    /// The returned [TrapHandle] disarms the region when dropped, releasing any parked reader
    /// with the abort payload if the region was never populated.
    pub fn register_trap(&self) -> Result<TrapHandle, Error> {
        let mut state = self.shared.lock();
        if state.armed {
            return Err(Error::Registration("already armed"));
        }
        if state.population == PopulationState::Populated {
            return Err(Error::Registration("region already populated"));
        }
        state.armed = true;
        debug!(region = %self.shared.id, "armed trap");
        Ok(TrapHandle {
            shared: self.shared.clone(),
        })
    }

    /// Block until a reader touches the unpopulated region, or `timeout` elapses.
    ///
    /// Each fault is reported once. Fails fast with [Error::Registration] if the region is not
    /// armed and with [Error::NoFaultObserved] if nothing faults in time.
    pub fn wait_for_fault(&self, timeout: Duration) -> Result<FaultToken, Error> {
        let state = self.shared.lock();
        if !state.armed {
            return Err(Error::Registration("trap not armed"));
        }
        let (mut state, _) = self
            .shared
            .changed
            .wait_timeout_while(state, timeout, |state| {
                state.armed && !matches!(state.fault, Fault::Pending(_))
            })
            .expect("trap state poisoned");
        match std::mem::replace(&mut state.fault, Fault::Reported) {
            Fault::Pending(token) => {
                debug!(region = %token.region, offset = token.offset, len = token.len, "observed fault");
                Ok(token)
            }
            previous => {
                state.fault = previous;
                if state.armed {
                    Err(Error::NoFaultObserved)
                } else {
                    Err(Error::Registration("trap disarmed while waiting"))
                }
            }
        }
    }

    /// Copy `bytes` into the region and release every parked reader.
    ///
    /// Valid exactly once per region. If `token` is provided, it must have been produced by
    /// this region.
    pub fn populate(&self, token: Option<&FaultToken>, bytes: &[u8]) -> Result<(), Error> {
        if let Some(token) = token {
            if token.region != self.shared.id {
                return Err(Error::ForeignToken(token.region));
            }
        }
        let mut state = self.shared.lock();
        if state.population == PopulationState::Populated {
            return Err(Error::AlreadyPopulated);
        }
        if bytes.len() != self.shared.length {
            return Err(Error::SizeMismatch {
                expected: self.shared.length,
                actual: bytes.len(),
            });
        }
        let blocked = state.blocked;
        self.shared.fill(&mut state, bytes);
        debug!(region = %self.shared.id, blocked, "populated region");
        Ok(())
    }
}

/// Registration of a [TrapRegion]'s fault interception.
///
/// Dropping the handle disarms the region. If a reader already touched the unpopulated region,
/// it is released with an all-zero abort payload so the consumer is never wedged.
pub struct TrapHandle {
    shared: Arc<Shared>,
}

impl TrapHandle {
    pub fn region(&self) -> RegionId {
        self.shared.id
    }

    /// Disarm the region now (equivalent to dropping the handle).
    pub fn unregister(self) {}
}

impl Drop for TrapHandle {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if state.population == PopulationState::Populated {
            return;
        }
        let touched = state.blocked > 0 || !matches!(state.fault, Fault::None);
        if touched {
            warn!(
                region = %self.shared.id,
                blocked = state.blocked,
                "releasing trap with abort payload"
            );
            let abort = vec![0u8; self.shared.length];
            state.aborted = true;
            self.shared.fill(&mut state, &abort);
        } else {
            state.armed = false;
            self.shared.changed.notify_all();
            debug!(region = %self.shared.id, "disarmed trap");
        }
    }
}

/// Consumer-side access to a [TrapRegion].
#[derive(Clone)]
pub struct RegionReader {
    shared: Arc<Shared>,
}

impl RegionReader {
    pub fn region(&self) -> RegionId {
        self.shared.id
    }

    /// Read `len` bytes at `offset`, parking while the region is armed and unpopulated.
    pub fn read(&self, offset: usize, len: usize) -> Result<Bytes, Error> {
        let length = self.shared.length;
        let end = offset.checked_add(len).filter(|end| *end <= length);
        let Some(end) = end else {
            return Err(Error::OutOfBounds {
                offset,
                len,
                length,
            });
        };

        let mut state = self.shared.lock();
        loop {
            if state.population == PopulationState::Populated {
                return Ok(Bytes::copy_from_slice(&state.data[offset..end]));
            }
            if !state.armed {
                return Ok(Bytes::from(vec![0u8; len]));
            }
            if matches!(state.fault, Fault::None) {
                state.fault = Fault::Pending(FaultToken {
                    region: self.shared.id,
                    offset,
                    len,
                });
                self.shared.changed.notify_all();
            }
            state.blocked += 1;
            state = self.shared.changed.wait(state).expect("trap state poisoned");
            state.blocked -= 1;
        }
    }
}
