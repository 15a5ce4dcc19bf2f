use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use strand_core::error::ConnectError;
use strand_core::traits::{Connection, Connector};

/// Connection handed out by [`MockConnector`].
pub struct MockConnection {
    pub id: usize,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    open: Arc<AtomicUsize>,
}

impl MockConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl Connection for MockConnection {
    fn is_healthy(&self) -> bool {
        !self.is_closed()
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Connector that fails according to a script, then succeeds forever.
pub struct MockConnector {
    script: Mutex<VecDeque<ConnectError>>,
    attempts: AtomicUsize,
    open: Arc<AtomicUsize>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Self::scripted(Vec::new())
    }

    pub fn scripted(failures: Vec<ConnectError>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(failures.into()),
            attempts: AtomicUsize::new(0),
            open: Arc::new(AtomicUsize::new(0)),
            connections: Mutex::new(Vec::new()),
        })
    }

    /// `n` transient failures before connecting.
    pub fn flaky(n: usize) -> Arc<Self> {
        Self::scripted(
            (0..n)
                .map(|i| ConnectError::Transient(format!("refused #{}", i + 1)))
                .collect(),
        )
    }

    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Connections established so far.
    pub fn established(&self) -> usize {
        self.connections.lock().len()
    }

    /// Established and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }
}

impl Connector for MockConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>, ConnectError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.script.lock().pop_front() {
                return Err(err);
            }
            let mut connections = self.connections.lock();
            let conn = Arc::new(MockConnection {
                id: connections.len(),
                closed: AtomicBool::new(false),
                close_calls: AtomicUsize::new(0),
                open: self.open.clone(),
            });
            self.open.fetch_add(1, Ordering::SeqCst);
            connections.push(conn.clone());
            let conn: Arc<dyn Connection> = conn;
            Ok(conn)
        })
    }
}
