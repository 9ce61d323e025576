//! Boundary between the racer and the asynchronous consumer it targets.

use crate::{
    ring::Consumer,
    trap::{RegionId, RegionReader},
    Error,
};

/// Interface that any consumer backend must implement to be raced.
///
/// The racer owns the producer side of the ring and hands the [Consumer] side to
/// [Transport::open]. Completions travel back through the ring itself, so there is no
/// separate result channel: the producer looks them up with
/// [crate::RingChannel::consumer_result_for] and reaps them with
/// [crate::RingChannel::poll_completion].
pub trait Transport {
    /// Running connection to the consumer. Dropping it shuts the consumer down.
    type Handle;

    /// Bring up the consumer on the given ring.
    fn open(&self, consumer: Consumer) -> Result<Self::Handle, Error>;

    /// Wake the consumer after descriptors were published or modified.
    fn notify_pending(&self, handle: &Self::Handle) -> Result<(), Error>;

    /// Make a region addressable by the consumer.
    ///
    /// Backends that share an address space with the producer have nothing to do here.
    fn expose(&self, _handle: &Self::Handle, _region: RegionReader) -> Result<(), Error> {
        Ok(())
    }

    /// Undo [Transport::expose].
    fn withdraw(&self, _handle: &Self::Handle, _region: RegionId) {}
}
