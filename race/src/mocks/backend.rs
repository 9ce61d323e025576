//! A consumer that fetches the kind of a descriptor twice.
//!
//! Processing a descriptor goes as follows:
//!
//! 1. Fetch the kind and pick an execution context from it. Kinds that may block are handed to
//!    a privileged worker, everything else runs with the submitter's privileges.
//! 2. Resolve the auxiliary data (this is where a trapped region parks the consumer).
//! 3. Fetch the kind again and execute it in the context picked in step 1.
//!
//! Sending is only permitted from the worker context, so a descriptor classified as a receive
//! and executed as a send performs a privileged send. With [Config::double_fetch] disabled the
//! kind from step 1 is reused in step 3, which is how a fixed consumer behaves.

use crate::{
    ring::{AuxRef, Consumer, Doorbell, Kind, Submission, SubmissionId},
    transport::Transport,
    trap::{RegionId, RegionReader},
    Error,
};
use bytes::{Buf, Bytes};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, trace, warn};

/// How long the consumer waits for the producer to reap before rechecking for shutdown.
const SPACE_POLL: Duration = Duration::from_millis(50);

/// Configuration for a [Backend].
#[derive(Clone, Debug)]
pub struct Config {
    /// Re-read the kind after resolving auxiliary data (the vulnerable behavior).
    pub double_fetch: bool,
    /// Resolve auxiliary data at all. When false, descriptors complete without ever touching
    /// the referenced region.
    pub touch_auxiliary: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            double_fetch: true,
            touch_auxiliary: true,
        }
    }
}

/// Privileges a descriptor is executed with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Context {
    Submitter,
    Worker,
}

/// Record of one processed descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Execution {
    pub id: SubmissionId,
    /// Kind observed by the first fetch.
    pub fetched: Kind,
    /// Kind that was executed.
    pub executed: Kind,
    pub context: Context,
    pub result: i32,
}

/// In-process consumer implementing [Transport].
///
/// Cloning returns another reference to the same backend.
#[derive(Clone, Default)]
pub struct Backend {
    cfg: Arc<Config>,
    memory: Arc<Mutex<HashMap<RegionId, RegionReader>>>,
    executions: Arc<Mutex<Vec<Execution>>>,
}

impl Backend {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg: Arc::new(cfg),
            ..Default::default()
        }
    }

    /// Descriptors processed so far, in completion order.
    pub fn executions(&self) -> Vec<Execution> {
        self.executions.lock().unwrap().clone()
    }

    fn run(self, mut consumer: Consumer, doorbell: Arc<Doorbell>, stop: Arc<AtomicBool>) {
        loop {
            let seen = doorbell.generation();
            while let Some(submission) = consumer.fetch() {
                let result = self.process(&submission);
                let mut pending = submission;
                while let Err(full) = consumer.complete(pending, result) {
                    pending = full.into_inner();
                    debug!(id = %pending.id(), "completion ring full");
                    if stop.load(Ordering::Acquire) || consumer.is_closed() {
                        warn!(id = %pending.id(), "dropping completion on shutdown");
                        return;
                    }
                    consumer.wait_for_space(Some(SPACE_POLL));
                }
            }
            if stop.load(Ordering::Acquire) || consumer.is_closed() {
                debug!("consumer stopped");
                return;
            }
            doorbell.wait(seen, None);
        }
    }

    fn process(&self, submission: &Submission) -> i32 {
        let id = submission.id();
        let fetched = submission.kind();
        let context = if fetched.may_block() {
            Context::Worker
        } else {
            Context::Submitter
        };
        trace!(%id, kind = %fetched, ?context, "fetched descriptor");

        let (executed, result) = match self.resolve(submission.auxiliary()) {
            Err(errno) => (fetched, -errno),
            Ok(auxiliary) => {
                let executed = if self.cfg.double_fetch {
                    submission.kind()
                } else {
                    fetched
                };
                (executed, execute(executed, context, auxiliary))
            }
        };
        debug!(%id, %fetched, %executed, ?context, result, "executed descriptor");
        self.executions.lock().unwrap().push(Execution {
            id,
            fetched,
            executed,
            context,
            result,
        });
        result
    }

    /// Returns the auxiliary data (None when configured not to look at it) or an errno.
    fn resolve(&self, auxiliary: AuxRef) -> Result<Option<Bytes>, i32> {
        if !self.cfg.touch_auxiliary {
            return Ok(None);
        }
        // Do not hold the map while reading: the read may park until the region is populated
        let reader = self.memory.lock().unwrap().get(&auxiliary.region).cloned();
        let Some(reader) = reader else {
            return Err(libc::EFAULT);
        };
        reader
            .read(auxiliary.offset as usize, auxiliary.len as usize)
            .map(Some)
            .map_err(|_| libc::EFAULT)
    }
}

fn execute(kind: Kind, context: Context, auxiliary: Option<Bytes>) -> i32 {
    match kind {
        Kind::NOP => 0,
        Kind::RECV => -libc::EAGAIN,
        Kind::SEND => {
            if context != Context::Worker {
                return -libc::EPERM;
            }
            let Some(mut auxiliary) = auxiliary else {
                return 0;
            };
            if auxiliary.remaining() < super::PREFIX_LEN {
                return -libc::EINVAL;
            }
            let len = auxiliary.get_u32_le() as usize;
            if len > auxiliary.remaining() {
                return -libc::EMSGSIZE;
            }
            i32::try_from(len).unwrap_or(-libc::EMSGSIZE)
        }
        _ => -libc::EINVAL,
    }
}

/// Connection to a running [Backend] consumer thread.
pub struct Handle {
    doorbell: Arc<Doorbell>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.doorbell.ring();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("consumer panicked");
            }
        }
    }
}

impl Transport for Backend {
    type Handle = Handle;

    fn open(&self, consumer: Consumer) -> Result<Handle, Error> {
        let doorbell = Arc::new(Doorbell::default());
        let stop = Arc::new(AtomicBool::new(false));
        let backend = self.clone();
        let worker = thread::Builder::new().name("consumer".into()).spawn({
            let doorbell = doorbell.clone();
            let stop = stop.clone();
            move || backend.run(consumer, doorbell, stop)
        })?;
        Ok(Handle {
            doorbell,
            stop,
            worker: Some(worker),
        })
    }

    fn notify_pending(&self, handle: &Handle) -> Result<(), Error> {
        if handle
            .worker
            .as_ref()
            .map_or(true, |worker| worker.is_finished())
        {
            return Err(Error::Closed);
        }
        handle.doorbell.ring();
        Ok(())
    }

    fn expose(&self, _handle: &Handle, region: RegionReader) -> Result<(), Error> {
        self.memory.lock().unwrap().insert(region.region(), region);
        Ok(())
    }

    fn withdraw(&self, _handle: &Handle, region: RegionId) {
        self.memory.lock().unwrap().remove(&region);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use crate::{
        mocks::message,
        ring::{self, Descriptor, Endpoint, RingChannel},
        trap::TrapRegion,
    };

    fn submit(backend: &Backend, kind: Kind, region: &TrapRegion, expose: bool) -> i32 {
        let (mut ring, consumer) = RingChannel::new(ring::Config::default()).unwrap();
        let handle = backend.open(consumer).unwrap();
        if expose {
            backend.expose(&handle, region.reader()).unwrap();
        }
        let id = ring
            .submit(Descriptor {
                kind,
                endpoint: Endpoint(3),
                auxiliary: AuxRef {
                    region: region.id(),
                    offset: 0,
                    len: region.len() as u32,
                },
            })
            .unwrap();
        backend.notify_pending(&handle).unwrap();
        let record = ring.poll_completion(Duration::from_secs(10)).unwrap();
        assert_eq!(record.id, id);
        record.result
    }

    fn populated(body: &[u8]) -> TrapRegion {
        let region = TrapRegion::create(64).unwrap();
        region.populate(None, &message(body, 64).unwrap()).unwrap();
        region
    }

    #[test_traced]
    fn test_send_requires_worker() {
        let backend = Backend::new(Config::default());
        let result = submit(&backend, Kind::SEND, &populated(b"hi"), true);
        assert_eq!(result, -libc::EPERM);
        let executions = backend.executions();
        assert_eq!(executions[0].context, Context::Submitter);
        assert_eq!(executions[0].executed, Kind::SEND);
    }

    #[test_traced]
    fn test_recv_would_block() {
        let backend = Backend::new(Config::default());
        let result = submit(&backend, Kind::RECV, &populated(b"hi"), true);
        assert_eq!(result, -libc::EAGAIN);
        assert_eq!(backend.executions()[0].context, Context::Worker);
    }

    #[test_traced]
    fn test_unmapped_region() {
        let backend = Backend::new(Config::default());
        let result = submit(&backend, Kind::RECV, &populated(b"hi"), false);
        assert_eq!(result, -libc::EFAULT);
    }

    #[test_traced]
    fn test_unknown_kind() {
        let backend = Backend::new(Config::default());
        let result = submit(&backend, Kind(200), &populated(b"hi"), true);
        assert_eq!(result, -libc::EINVAL);
    }

    #[test_traced]
    fn test_nop_skips_auxiliary() {
        let backend = Backend::new(Config {
            touch_auxiliary: false,
            ..Default::default()
        });
        let region = TrapRegion::create(64).unwrap();
        let _trap = region.register_trap().unwrap();
        let result = submit(&backend, Kind::NOP, &region, true);
        assert_eq!(result, 0);
        assert!(matches!(
            region.wait_for_fault(Duration::from_millis(10)),
            Err(Error::NoFaultObserved)
        ));
    }

    #[test_traced]
    fn test_execute_send() {
        assert_eq!(
            execute(Kind::SEND, Context::Worker, Some(message(b"hello", 64).unwrap())),
            5
        );
        assert_eq!(
            execute(Kind::SEND, Context::Worker, Some(Bytes::from_static(&[1, 0]))),
            -libc::EINVAL
        );
        assert_eq!(
            execute(
                Kind::SEND,
                Context::Worker,
                Some(Bytes::from_static(&[9, 0, 0, 0, 1]))
            ),
            -libc::EMSGSIZE
        );
        assert_eq!(execute(Kind::SEND, Context::Worker, None), 0);
        assert_eq!(execute(Kind::SEND, Context::Submitter, None), -libc::EPERM);
    }

    #[test_traced]
    fn test_completion_retried_when_ring_full() {
        let backend = Backend::new(Config {
            touch_auxiliary: false,
            ..Default::default()
        });
        // One submission slot, two completion slots
        let (mut ring, consumer) = RingChannel::new(ring::Config { entries: 1 }).unwrap();
        let handle = backend.open(consumer).unwrap();
        let descriptor = Descriptor {
            kind: Kind::NOP,
            endpoint: Endpoint(3),
            auxiliary: AuxRef {
                region: RegionId(0),
                offset: 0,
                len: 0,
            },
        };
        let mut ids = Vec::new();
        for _ in 0..3 {
            while ring.pending() > 0 {
                thread::yield_now();
            }
            ids.push(ring.submit(descriptor).unwrap());
            backend.notify_pending(&handle).unwrap();
        }

        // The third completion waits for room instead of being dropped
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ring.pending(), 1);
        for id in ids {
            let record = ring.poll_completion(Duration::from_secs(10)).unwrap();
            assert_eq!((record.id, record.result), (id, 0));
        }
        assert_eq!(ring.pending(), 0);
        assert_eq!(backend.executions().len(), 3);
    }

    #[test_traced]
    fn test_notify_after_shutdown() {
        let backend = Backend::new(Config::default());
        let (ring, consumer) = RingChannel::new(ring::Config::default()).unwrap();
        let handle = backend.open(consumer).unwrap();
        drop(ring);
        handle.doorbell.ring();
        while !handle.worker.as_ref().unwrap().is_finished() {
            thread::yield_now();
        }
        assert!(matches!(
            backend.notify_pending(&handle),
            Err(Error::Closed)
        ));
    }
}
