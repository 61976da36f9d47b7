//! Listeners that turn accepted connections into served endpoints.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use wave_rpc::RpcEndpoint;

pub mod stdio;
#[cfg(unix)]
pub mod unix;
pub mod ws;

/// Caps the number of concurrently served connections of one listener.
#[derive(Clone, Debug)]
pub struct ConnectionLimit {
    active: Arc<AtomicUsize>,
    max: usize,
}

impl ConnectionLimit {
    pub fn new(max: usize) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    /// Reserve a slot, or `None` when the listener is at capacity.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        let mut current = self.active.load(Ordering::Relaxed);
        loop {
            if current >= self.max {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(ConnectionGuard {
                        active: self.active.clone(),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// Releases its slot when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Hold the connection slot until the endpoint closes or the server stops.
pub(crate) async fn run_connection(
    endpoint: RpcEndpoint,
    mut shutdown: watch::Receiver<bool>,
    _guard: ConnectionGuard,
) {
    tokio::select! {
        _ = endpoint.closed() => {}
        _ = shutdown.wait_for(|stop| *stop) => {
            debug!(endpoint = %endpoint.name(), "closing connection for shutdown");
            endpoint.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_enforced_and_released() {
        let limit = ConnectionLimit::new(2);
        let a = limit.try_acquire().unwrap();
        let _b = limit.try_acquire().unwrap();
        assert!(limit.try_acquire().is_none());
        assert_eq!(limit.active(), 2);

        drop(a);
        assert_eq!(limit.active(), 1);
        assert!(limit.try_acquire().is_some());
    }

    #[test]
    fn zero_limit_rejects_everything() {
        assert!(ConnectionLimit::new(0).try_acquire().is_none());
    }
}
