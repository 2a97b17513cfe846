//! Bootstrap endpoint pool with rotate-on-failure semantics.
//!
//! The pool holds every configured endpoint for the lifetime of the client.
//! There is no eviction and no health tracking: the head of the list is only
//! a preference, and a failed head is rotated to the tail so the next attempt
//! lands elsewhere. The list is shuffled once at construction to spread the
//! initial load of a fleet of clients across the bootstrap set.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use rand::Rng;
use rand::seq::SliceRandom;

use crate::error::Error;

/// A single `host:port` HTTP target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Parses a `"host:port"` bootstrap entry.
    pub(crate) fn parse(s: &str) -> Result<Self, Error> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidArgument(format!("bootstrap entry {s:?} is not host:port")))?;
        if host.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "bootstrap entry {s:?} has an empty host"
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidArgument(format!("bootstrap entry {s:?} has an invalid port")))?;
        Ok(Endpoint {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Ordered endpoint list with a rotating head.
///
/// Rotation preserves the multiset of endpoints; only their order changes.
pub(crate) struct EndpointPool {
    endpoints: Mutex<VecDeque<Endpoint>>,
}

impl EndpointPool {
    /// Builds a pool from an already-shuffled, non-empty endpoint list.
    pub(crate) fn new(endpoints: Vec<Endpoint>) -> Self {
        debug_assert!(!endpoints.is_empty());
        EndpointPool {
            endpoints: Mutex::new(endpoints.into()),
        }
    }

    /// Current head of the pool.
    pub(crate) fn current(&self) -> Endpoint {
        self.endpoints
            .lock()
            .front()
            .expect("endpoint pool is never empty")
            .clone()
    }

    /// Number of configured endpoints. Doubles as the retry budget.
    pub(crate) fn len(&self) -> usize {
        self.endpoints.lock().len()
    }

    /// Moves the head to the tail, but only if the head still equals
    /// `failed`.
    ///
    /// Callers snapshot `current()` before an attempt and pass that snapshot
    /// back on failure. When two attempts fail against the same endpoint
    /// concurrently, the guard makes the second call a no-op instead of
    /// rotating a healthy endpoint out of the head position.
    pub(crate) fn rotate_past(&self, failed: &Endpoint) {
        let mut endpoints = self.endpoints.lock();
        if endpoints.front() == Some(failed) {
            endpoints.rotate_left(1);
        }
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<Endpoint> {
        self.endpoints.lock().iter().cloned().collect()
    }
}

/// Shuffles the bootstrap list in place with the supplied RNG.
///
/// Construction passes a thread RNG; tests inject a seeded one to pin the
/// initial ordering.
pub(crate) fn shuffle_endpoints<R: Rng>(endpoints: &mut [Endpoint], rng: &mut R) {
    endpoints.shuffle(rng);
}
