//! Connection and pool capabilities.
//!
//! The engine consumes broker connections through [`Connection`] and gets
//! them from a [`Pool`]. [`FixedPool`] is a minimal pool over a fixed set of
//! connections.

use crate::error::{PoolError, Result};
use crate::packet::ControlPacket;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

/// Identifies one physical broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A physical broker connection.
///
/// `recv` is only ever called by the connection's dispatch loop; `send`
/// may be called concurrently from any task.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Stable id of this connection.
    fn id(&self) -> ConnectionId;

    /// Send a control packet.
    async fn send(&self, packet: ControlPacket) -> Result<()>;

    /// Receive the next control packet. An error ends the dispatch loop.
    async fn recv(&self) -> Result<ControlPacket>;
}

/// A pool of broker connections.
#[async_trait]
pub trait Pool: Send + Sync {
    /// Check out a connection, waiting at most `timeout`.
    async fn checkout(&self, timeout: Duration) -> std::result::Result<Arc<dyn Connection>, PoolError>;

    /// Return a checked-out connection.
    fn release(&self, conn: Arc<dyn Connection>);

    /// Number of distinct connections the pool can hand out.
    fn capacity(&self) -> usize;
}

/// Pool over a fixed set of connections, checked out in FIFO order.
pub struct FixedPool {
    connections: Vec<Arc<dyn Connection>>,
    idle: Mutex<VecDeque<Arc<dyn Connection>>>,
    available: Semaphore,
}

impl FixedPool {
    /// Create a pool holding `connections`.
    pub fn new(connections: Vec<Arc<dyn Connection>>) -> Self {
        Self {
            idle: Mutex::new(connections.iter().cloned().collect()),
            available: Semaphore::new(connections.len()),
            connections,
        }
    }

    /// Every connection owned by the pool, checked out or not.
    pub fn connections(&self) -> &[Arc<dyn Connection>] {
        &self.connections
    }

    /// Number of connections currently idle.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Close the pool; pending and future checkouts fail with `PoolError::Closed`.
    pub fn close(&self) {
        self.available.close();
    }
}

#[async_trait]
impl Pool for FixedPool {
    async fn checkout(&self, timeout: Duration) -> std::result::Result<Arc<dyn Connection>, PoolError> {
        let permit = match tokio::time::timeout(timeout, self.available.acquire()).await {
            Err(_) => return Err(PoolError::Exhausted { timeout }),
            Ok(Err(_)) => return Err(PoolError::Closed),
            Ok(Ok(permit)) => permit,
        };
        permit.forget();

        let conn = self.idle.lock().pop_front().ok_or(PoolError::Closed)?;
        debug!(connection = %conn.id(), "checked out connection");
        Ok(conn)
    }

    fn release(&self, conn: Arc<dyn Connection>) {
        debug!(connection = %conn.id(), "released connection");
        self.idle.lock().push_back(conn);
        self.available.add_permits(1);
    }

    fn capacity(&self) -> usize {
        self.connections.len()
    }
}

impl fmt::Debug for FixedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FixedPool {{ capacity: {}, idle: {} }}",
            self.connections.len(),
            self.idle()
        )
    }
}
