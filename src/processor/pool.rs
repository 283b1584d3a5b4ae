use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::transport::{BoxedStream, Endpoint};

/// Response heads from a processor are small; anything larger is malformed
pub const RESPONSE_HEAD_CAPACITY: usize = 1024;

const BODY_CAPACITY: usize = 256;
const DRAIN_SCRATCH: usize = 512;

/// An open processor connection plus the scratch space one exchange needs
pub struct PooledConnection {
    pub stream: BoxedStream,
    pub head: Vec<u8>,
    pub body: Vec<u8>,
    pub digits: [u8; 20],
    pub drain: [u8; DRAIN_SCRATCH],
}

impl PooledConnection {
    async fn dial(endpoint: &Endpoint) -> io::Result<Self> {
        Ok(Self {
            stream: endpoint.connect().await?,
            head: Vec::with_capacity(RESPONSE_HEAD_CAPACITY),
            body: Vec::with_capacity(BODY_CAPACITY),
            digits: [0; 20],
            drain: [0; DRAIN_SCRATCH],
        })
    }
}

/// Fixed-size pool of persistent connections to one processor
pub struct ConnectionPool {
    endpoint: Endpoint,
    size: usize,
    borrow_timeout: Duration,
    idle_tx: mpsc::Sender<PooledConnection>,
    idle_rx: Mutex<mpsc::Receiver<PooledConnection>>,
}

impl ConnectionPool {
    pub fn new(endpoint: Endpoint, size: usize, borrow_timeout: Duration) -> Arc<Self> {
        let (idle_tx, idle_rx) = mpsc::channel(size.max(1));
        Arc::new(Self {
            endpoint,
            size,
            borrow_timeout,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
        })
    }

    /// Dial up to `size` connections. Failures are logged and the pool is
    /// left to fill lazily from `borrow`.
    pub async fn warm_up(&self) -> usize {
        let dials = (0..self.size).map(|_| PooledConnection::dial(&self.endpoint));
        let mut opened = 0;
        let mut last_error = None;

        for result in join_all(dials).await {
            match result {
                Ok(conn) => {
                    if self.idle_tx.try_send(conn).is_ok() {
                        opened += 1;
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            None => info!("✅ Warmed {} connections to {}", opened, self.endpoint),
            Some(e) => warn!(
                "⚠️  Warmed {}/{} connections to {} (last error: {})",
                opened, self.size, self.endpoint, e
            ),
        }
        opened
    }

    /// Lease an idle connection, or dial a new one when none frees up within
    /// the borrow timeout.
    pub async fn borrow(self: &Arc<Self>) -> io::Result<Lease> {
        let idle = tokio::time::timeout(self.borrow_timeout, async {
            self.idle_rx.lock().await.recv().await
        })
        .await;

        let conn = match idle {
            Ok(Some(conn)) => conn,
            _ => PooledConnection::dial(&self.endpoint).await?,
        };

        Ok(Lease {
            conn,
            guard: ReplaceOnDrop {
                pool: Arc::clone(self),
                armed: true,
            },
        })
    }

    fn give_back(&self, conn: PooledConnection) {
        if self.idle_tx.try_send(conn).is_err() {
            debug!("Pool for {} is full, closing surplus connection", self.endpoint);
        }
    }

    /// Swap a broken connection for a freshly dialed one in the background
    fn replace(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = Arc::clone(self);
        runtime.spawn(async move {
            match PooledConnection::dial(&pool.endpoint).await {
                Ok(conn) => pool.give_back(conn),
                Err(e) => debug!("Replacement dial to {} failed: {}", pool.endpoint, e),
            }
        });
    }

    #[cfg(test)]
    pub fn idle_count(&self) -> usize {
        self.idle_tx.max_capacity() - self.idle_tx.capacity()
    }
}

/// Exclusive use of one pooled connection.
///
/// The connection goes back to the pool only through `release`, after a
/// complete exchange. A lease dropped any other way closes its connection and
/// has a replacement dialed.
pub struct Lease {
    conn: PooledConnection,
    guard: ReplaceOnDrop,
}

impl Lease {
    /// Return the connection, its stream positioned at a request boundary
    pub fn release(self) {
        let Lease { conn, mut guard } = self;
        guard.armed = false;
        guard.pool.give_back(conn);
    }
}

impl Deref for Lease {
    type Target = PooledConnection;

    fn deref(&self) -> &PooledConnection {
        &self.conn
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut PooledConnection {
        &mut self.conn
    }
}

struct ReplaceOnDrop {
    pool: Arc<ConnectionPool>,
    armed: bool,
}

impl Drop for ReplaceOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.pool.replace();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::Tcp(listener.local_addr().unwrap().to_string());
        (listener, endpoint)
    }

    fn accept_forever(listener: TcpListener) {
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
    }

    #[tokio::test]
    async fn test_warm_up_fills_pool() {
        let (listener, endpoint) = listener().await;
        accept_forever(listener);

        let pool = ConnectionPool::new(endpoint, 4, Duration::from_millis(5));
        assert_eq!(pool.warm_up().await, 4);
        assert_eq!(pool.idle_count(), 4);
    }

    #[tokio::test]
    async fn test_released_lease_returns_to_pool() {
        let (listener, endpoint) = listener().await;
        accept_forever(listener);

        let pool = ConnectionPool::new(endpoint, 2, Duration::from_millis(5));
        let lease = pool.borrow().await.unwrap();
        assert_eq!(pool.idle_count(), 0);

        lease.release();
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_lease_is_replaced() {
        let (listener, endpoint) = listener().await;
        accept_forever(listener);

        let pool = ConnectionPool::new(endpoint, 2, Duration::from_millis(5));
        let lease = pool.borrow().await.unwrap();
        drop(lease);

        // The broken connection is gone; a fresh one is dialed in the background
        for _ in 0..100 {
            if pool.idle_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_borrow_dials_when_pool_is_empty() {
        let (listener, endpoint) = listener().await;
        accept_forever(listener);

        let pool = ConnectionPool::new(endpoint, 1, Duration::from_millis(5));
        let first = pool.borrow().await.unwrap();
        let second = pool.borrow().await.unwrap();

        first.release();
        second.release();
        // Only one fits back
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_borrow_fails_when_processor_is_unreachable() {
        let (listener, endpoint) = listener().await;
        drop(listener);

        let pool = ConnectionPool::new(endpoint, 1, Duration::from_millis(5));
        assert_eq!(pool.warm_up().await, 0);
        assert!(pool.borrow().await.is_err());
    }
}
