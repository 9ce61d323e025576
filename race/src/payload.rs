//! Data supplied by whoever builds the privileged request.

use crate::ring::{Endpoint, Kind};
use bytes::Bytes;

/// The two kinds that race and the true auxiliary data.
///
/// The racer treats all of it as opaque: it never inspects `bytes` beyond checking that it fills
/// the trap region exactly.
#[derive(Clone, Debug)]
pub struct Payload {
    /// Kind the descriptor is submitted (and classified) as.
    pub benign: Kind,
    /// Kind swapped in while the consumer is parked on the auxiliary data.
    pub malicious: Kind,
    /// Endpoint the request targets.
    pub endpoint: Endpoint,
    /// Contents of the trap region, released to the consumer after the swap.
    pub bytes: Bytes,
}

impl Payload {
    pub fn new(benign: Kind, malicious: Kind, endpoint: Endpoint, bytes: impl Into<Bytes>) -> Self {
        Self {
            benign,
            malicious,
            endpoint,
            bytes: bytes.into(),
        }
    }

    /// A receive swapped for a send, over `len` zero bytes.
    pub fn zeroed(endpoint: Endpoint, len: usize) -> Self {
        Self::new(Kind::RECV, Kind::SEND, endpoint, vec![0u8; len])
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
