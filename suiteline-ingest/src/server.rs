//! Suite ingestion server: one session task per connection.
//!
//! Architecture:
//! ```text
//! runner A ──┐                     ┌── Session (A) ──┐
//!            ├── accept ─ Acceptor ┤                 ├── DocumentStore ── ChangeBus ──► watchers
//! runner B ──┘   (TCP)    (TLS?)   └── Session (B) ──┘        ▲
//!                                                             │ detach / reconnect
//!                                          Detachment ────────┘ (+ sweeper task)
//! ```
//!
//! Shutdown flips a `watch` channel. The accept loop stops, every session
//! drops its connection (detaching unfinished suites), and `serve` returns
//! once all of them have exited.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use suiteline_store::DocumentStore;

use crate::protocol::PROTOCOL_VERSION;
use crate::session::{Session, SessionConfig, SessionEnd, StoreHandle};
use crate::tracker::Detachment;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Protocol version required in `hello`
    pub protocol_version: i64,
    /// Deadline for each store call made by a session
    pub op_timeout: Duration,
    /// How long a detached suite may be reconnected
    pub reconnect_ttl: Duration,
    /// Period of the in-memory detachment sweep
    pub sweep_interval: Duration,
    /// Longest accepted request line
    pub max_line_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7070".to_string(),
            protocol_version: PROTOCOL_VERSION,
            op_timeout: Duration::from_secs(10),
            reconnect_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            max_line_bytes: 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port and short timers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            op_timeout: Duration::from_secs(5),
            reconnect_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_millis(50),
            max_line_bytes: 64 * 1024,
            ..Self::default()
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            protocol_version: self.protocol_version,
            reconnect_ttl: self.reconnect_ttl,
            max_line_bytes: self.max_line_bytes,
        }
    }
}

/// Server statistics: lock-free, read via [`ServerStats::snapshot`].
#[derive(Debug, Default)]
pub struct ServerStats {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub requests: AtomicU64,
    pub finished_sessions: AtomicU64,
    pub detached_sessions: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub requests: u64,
    pub finished_sessions: u64,
    pub detached_sessions: u64,
}

impl ServerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            finished_sessions: self.finished_sessions.load(Ordering::Relaxed),
            detached_sessions: self.detached_sessions.load(Ordering::Relaxed),
        }
    }
}

/// Wraps an accepted TCP stream before the session sees it.
///
/// TLS termination plugs in here; [`PlainAcceptor`] passes TCP through.
pub trait Acceptor: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&self, stream: TcpStream) -> BoxFuture<'static, io::Result<Self::Stream>>;
}

/// Unencrypted TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainAcceptor;

impl Acceptor for PlainAcceptor {
    type Stream = TcpStream;

    fn accept(&self, stream: TcpStream) -> BoxFuture<'static, io::Result<TcpStream>> {
        Box::pin(async move {
            stream.set_nodelay(true)?;
            Ok(stream)
        })
    }
}

/// The ingestion server.
pub struct IngestServer<A: Acceptor = PlainAcceptor> {
    config: ServerConfig,
    store: Arc<DocumentStore>,
    detachment: Detachment,
    acceptor: Arc<A>,
    stats: Arc<ServerStats>,
}

impl IngestServer<PlainAcceptor> {
    pub fn new(config: ServerConfig, store: Arc<DocumentStore>) -> Self {
        Self::with_acceptor(config, store, PlainAcceptor)
    }
}

impl<A: Acceptor> IngestServer<A> {
    pub fn with_acceptor(config: ServerConfig, store: Arc<DocumentStore>, acceptor: A) -> Self {
        Self {
            config,
            store,
            detachment: Detachment::default(),
            acceptor: Arc::new(acceptor),
            stats: Arc::new(ServerStats::default()),
        }
    }

    /// Choose how detached suites are tracked.
    pub fn with_detachment(mut self, detachment: Detachment) -> Self {
        self.detachment = detachment;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    /// Bind `config.bind_addr` and serve until `shutdown` flips.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve an already bound listener until `shutdown` flips, then wait for
    /// every session to exit.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        log::info!("Ingest server listening on {}", listener.local_addr()?);

        let sweeper = self.detachment.tracker().map(|tracker| {
            tracker
                .clone()
                .spawn_sweeper(self.config.sweep_interval, shutdown.clone())
        });

        let mut workers = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    workers.spawn(self.worker(stream, addr, shutdown.clone()));
                }
                _ = shutdown.changed() => break,
            }

            // Reap finished workers
            while let Some(joined) = workers.try_join_next() {
                if let Err(e) = joined {
                    log::error!("Connection worker panicked: {e}");
                }
            }
        }

        log::info!("Ingest server shutting down, waiting for {} connections", workers.len());
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                log::error!("Connection worker panicked: {e}");
            }
        }
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        log::info!("Ingest server stopped");
        Ok(())
    }

    fn worker(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let acceptor = self.acceptor.clone();
        let stats = self.stats.clone();
        let session = Session::new(
            StoreHandle::new(self.store.clone(), self.config.op_timeout),
            self.detachment.clone(),
            self.config.session_config(),
        );

        async move {
            let conn_id = Uuid::new_v4();
            stats.total_connections.fetch_add(1, Ordering::Relaxed);
            stats.active_connections.fetch_add(1, Ordering::Relaxed);
            log::info!("Connection {conn_id} from {addr}");

            match acceptor.accept(stream).await {
                Ok(stream) => match session.run(stream, shutdown, stats.clone()).await {
                    Ok(SessionEnd::Finished) => {
                        stats.finished_sessions.fetch_add(1, Ordering::Relaxed);
                        log::info!("Connection {conn_id} finished its suite");
                    }
                    Ok(SessionEnd::Disconnected) => {
                        log::info!("Connection {conn_id} closed");
                    }
                    Err(e) => log::error!("Connection {conn_id} from {addr} failed: {e}"),
                },
                Err(e) => log::error!("Handshake with {addr} failed: {e}"),
            }

            stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
