//! TCP server for handler protocol sessions.
//!
//! The acceptor filters peers by the IP allowlist and spawns one task per
//! accepted connection. Each session reads commands, hands them to the
//! shared dispatcher and writes one response line per command. When a
//! session ends for any reason, the DUT held by its peer is released.

use crate::dispatch::Dispatcher;
use crate::protocol;
use bytes::BytesMut;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Listen backlog
const BACKLOG: i32 = 128;

/// Set of live connections
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, SocketAddr>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: SocketAddr) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, peer);
        id
    }

    pub fn remove(&self, id: u64) -> Option<SocketAddr> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn len(&self) -> usize {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Sets the shutdown flag seen by the acceptor and every session
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Process signals that stop the server: ctrl-c, and SIGTERM on unix
pub struct ShutdownSignal {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    /// Install the signal handlers
    pub fn new() -> io::Result<Self> {
        Ok(ShutdownSignal {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?,
        })
    }

    /// Wait for the next stop signal and return its name
    pub async fn recv(&mut self) -> io::Result<&'static str> {
        #[cfg(unix)]
        {
            tokio::select! {
                ctrl_c = tokio::signal::ctrl_c() => ctrl_c.map(|()| "SIGINT"),
                _ = self.terminate.recv() => Ok("SIGTERM"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.map(|()| "ctrl-c")
        }
    }
}

/// Server instance
pub struct Server {
    allow_list: HashSet<IpAddr>,
    dispatcher: Arc<Dispatcher>,
    connections: Arc<ConnectionRegistry>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Server {
    /// Create a new server instance
    pub fn new(allow_list: &[IpAddr], dispatcher: Arc<Dispatcher>) -> Self {
        let (shutdown, _) = watch::channel(false);

        Server {
            allow_list: allow_list.iter().map(|ip| ip.to_canonical()).collect(),
            dispatcher,
            connections: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown),
        }
    }

    /// Bind the listening socket
    pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(BACKLOG)?;

        let listener = TcpListener::from_std(socket.into())?;
        info!(address = %addr, "Server listening");
        Ok(listener)
    }

    /// Accept connections until shutdown, then wait for every session to
    /// finish its cleanup.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let mut sessions = JoinSet::new();

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => continue,

                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    reap(joined);
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let ip = addr.ip().to_canonical();
                        if !self.allow_list.contains(&ip) {
                            warn!(peer = %addr, "Rejected connection from address not in allowlist");
                            drop(stream);
                            continue;
                        }

                        let id = self.connections.register(addr);
                        info!(peer = %addr, id, live = self.connections.len(), "Connection accepted");

                        let dispatcher = Arc::clone(&self.dispatcher);
                        let connections = Arc::clone(&self.connections);
                        let shutdown = self.shutdown.subscribe();
                        sessions.spawn(async move {
                            run_session(stream, id, addr, dispatcher, connections, shutdown).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        drop(listener);
        info!(sessions = sessions.len(), "Stopped accepting, closing sessions");

        while let Some(joined) = sessions.join_next().await {
            reap(joined);
        }

        info!(
            results = self.dispatcher.results_logged(),
            "Sessions closed, writing lot summary"
        );
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::task::spawn_blocking(move || dispatcher.flush_summary())
            .await
            .map_err(io::Error::other)?;
        Ok(())
    }
}

fn reap(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Session task panicked");
        }
    }
}

/// Registry removal and DUT release for one session. Runs on drop, so a
/// session task that panics still gives its DUT back.
struct SessionGuard {
    id: u64,
    peer: IpAddr,
    dispatcher: Arc<Dispatcher>,
    connections: Arc<ConnectionRegistry>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let addr = self.connections.remove(self.id);
        self.dispatcher.release_peer(self.peer);
        info!(
            peer = ?addr,
            id = self.id,
            live = self.connections.len(),
            "Connection closed"
        );
    }
}

/// Drive one connection and clean up after it
async fn run_session(
    stream: TcpStream,
    id: u64,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    connections: Arc<ConnectionRegistry>,
    shutdown: watch::Receiver<bool>,
) {
    let peer = addr.ip().to_canonical();
    let guard = SessionGuard {
        id,
        peer,
        dispatcher,
        connections,
    };

    match handle_connection(stream, peer, &guard.dispatcher, shutdown).await {
        Ok(()) => debug!(peer = %addr, "Session closed"),
        Err(e) => warn!(peer = %addr, error = %e, "Session I/O error"),
    }
}

/// Handle a single client connection.
///
/// Returns when the peer closes, a read or write fails, or the shutdown
/// flag is set.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: IpAddr,
    dispatcher: &Dispatcher,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        if *shutdown.borrow_and_update() {
            trace!(%peer, "Session closed by shutdown");
            return Ok(());
        }

        buffer.clear();
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }

            read = stream.read_buf(&mut buffer) => {
                if read? == 0 {
                    trace!(%peer, "Connection closed by client");
                    return Ok(());
                }

                let text = String::from_utf8_lossy(&buffer);
                for command in protocol::split_commands(&text) {
                    trace!(%peer, command, "Received");
                    let mut response = dispatcher.dispatch(command, peer);
                    if response.is_empty() {
                        continue;
                    }
                    response.push('\n');
                    stream.write_all(response.as_bytes()).await?;
                }
            }
        }
    }
}
