//! Connection registry
//!
//! Observational bookkeeping of live sockets. One registry tracks hijacked
//! client connections, another tracks dialed upstream connections; the two
//! are separate because a tunnel's client socket exists before (and sometimes
//! without) its upstream socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Identity of a tracked connection. Never reused within a process.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

fn next_conn_id() -> ConnId {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Which side of the tunnel a registry tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    /// Hijacked client-facing connections
    Client,
    /// Dialed upstream connections
    Server,
}

impl RegistryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

/// Metadata for one live socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    /// Logical destination (host:port)
    pub target_host: String,
    /// Remote socket address, empty when it could not be determined
    pub peer_address: String,
    /// When the connection was hijacked or dialed
    pub established_at: DateTime<Utc>,
}

impl ConnectionRecord {
    pub fn new(target_host: impl Into<String>, peer_address: impl Into<String>) -> Self {
        Self {
            target_host: target_host.into(),
            peer_address: peer_address.into(),
            established_at: Utc::now(),
        }
    }

    /// How long the connection has been open at `now`
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.established_at).to_std().unwrap_or_default()
    }
}

/// Result of one summarization pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrySummary {
    pub total: usize,
    pub long_lived: usize,
}

/// Thread-safe map of live connections guarded by a single read-write lock
#[derive(Clone)]
pub struct ConnectionRegistry {
    kind: RegistryKind,
    conns: Arc<RwLock<HashMap<ConnId, ConnectionRecord>>>,
}

impl ConnectionRegistry {
    pub fn new(kind: RegistryKind) -> Self {
        Self {
            kind,
            conns: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn kind(&self) -> RegistryKind {
        self.kind
    }

    pub fn register(&self, id: ConnId, record: ConnectionRecord) {
        self.conns.write().insert(id, record);
    }

    /// Removes a connection. Unknown ids are ignored.
    pub fn deregister(&self, id: ConnId) -> Option<ConnectionRecord> {
        self.conns.write().remove(&id)
    }

    /// Registers a new connection and returns the guard that closes and
    /// deregisters it when dropped.
    pub fn track(&self, record: ConnectionRecord) -> ConnectionGuard {
        let id = next_conn_id();
        trace!(
            registry = self.kind.as_str(),
            conn_id = id,
            target = %record.target_host,
            peer = %record.peer_address,
            "Registering connection"
        );
        self.register(id, record);

        let (closer, _) = watch::channel(false);
        ConnectionGuard {
            registry: self.clone(),
            id,
            closer,
        }
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.conns.read().contains_key(&id)
    }

    pub fn get(&self, id: ConnId) -> Option<ConnectionRecord> {
        self.conns.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }

    /// Logs the age of every live connection and the registry total.
    ///
    /// Connections older than `long_lived` are logged at debug level, the
    /// rest at trace level.
    pub fn summarize(&self, now: DateTime<Utc>, long_lived: Duration) -> RegistrySummary {
        let conns = self.conns.read();
        let mut summary = RegistrySummary {
            total: conns.len(),
            long_lived: 0,
        };

        for record in conns.values() {
            let age = record.age(now);
            if age > long_lived {
                summary.long_lived += 1;
                match self.kind {
                    RegistryKind::Server => debug!(
                        "Connection to {} via {} lasted for {:?}",
                        record.target_host, record.peer_address, age
                    ),
                    RegistryKind::Client => debug!(
                        "Client connection to {} from {} lasted for {:?}",
                        record.target_host, record.peer_address, age
                    ),
                }
            } else {
                match self.kind {
                    RegistryKind::Server => trace!(
                        "Connection to {} via {} lasted for {:?}",
                        record.target_host, record.peer_address, age
                    ),
                    RegistryKind::Client => trace!(
                        "Client connection to {} from {} lasted for {:?}",
                        record.target_host, record.peer_address, age
                    ),
                }
            }
        }

        debug!(
            registry = self.kind.as_str(),
            total = summary.total,
            long_lived = summary.long_lived,
            "{} {} connections in total",
            summary.total,
            self.kind.as_str()
        );

        summary
    }
}

/// Scoped ownership of a registered connection.
///
/// Dropping the guard signals every holder of the connection to close it and
/// removes the registry entry; this runs on every exit path.
pub struct ConnectionGuard {
    registry: ConnectionRegistry,
    id: ConnId,
    closer: watch::Sender<bool>,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Signal observed by tasks that own halves of the connection
    pub fn close_signal(&self) -> CloseSignal {
        CloseSignal {
            rx: self.closer.subscribe(),
        }
    }

    /// Asks every holder to close the connection now.
    pub fn close(&self) {
        self.closer.send_replace(true);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.close();
        self.registry.deregister(self.id);
        trace!(
            registry = self.registry.kind.as_str(),
            conn_id = self.id,
            "Deregistered connection"
        );
    }
}

/// Receiving side of a connection's close request
#[derive(Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<bool>,
}

impl CloseSignal {
    /// Resolves once the owning guard has closed or been dropped.
    pub async fn closed(&mut self) {
        let _ = self.rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }
}
