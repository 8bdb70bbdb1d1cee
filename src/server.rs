//! Connection multiplexer.
//!
//! A single task owns the listening socket and every accepted connection.
//! Each connection's reply write and next frame read run in its own future;
//! all of them are polled from the one loop, so a peer that stalls in either
//! direction never blocks the others. Dispatch runs inline, one request at a time.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::ChannelError;
use crate::transport::{FrameCodec, Request};

/// Pending connections queued by the kernel before `accept`.
const LISTEN_BACKLOG: u32 = 32;

/// Server loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Address to bind. Port `0` picks an ephemeral port.
    pub addr: SocketAddr,

    /// Identifier stamped on every response.
    pub origin: String,

    /// Stop the whole server after this long without any activity.
    pub server_idle_timeout: Option<Duration>,

    /// Close a connection that delivers no complete frame for this long.
    pub connection_idle_timeout: Option<Duration>,

    /// Default bound on a single command handler call.
    pub handler_timeout: Duration,

    /// Close a connection whose peer does not drain a reply within this long.
    pub write_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 31337)),
            origin: "sockpuppet".into(),
            server_idle_timeout: Some(Duration::from_secs(180)),
            connection_idle_timeout: Some(Duration::from_secs(60)),
            handler_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A request asked the server to terminate.
    Exit,
    /// No activity within the server idle timeout.
    IdleTimeout,
}

type ConnectionId = u64;

/// Bookkeeping for one accepted connection.
#[derive(Debug)]
struct ConnectionState {
    peer: SocketAddr,
    accepted_at: Instant,
    frames: u64,
}

enum ReadOutcome {
    Frame(Request),
    Idle,
    /// The previous reply was not drained within `write_timeout`.
    Stalled,
    Failed(ChannelError),
}

type PendingRead = Pin<Box<dyn Future<Output = (ConnectionId, TcpStream, ReadOutcome)> + Send>>;

/// Single-task accept/read/dispatch/reply loop.
pub struct Multiplexer {
    listener: TcpListener,
    local_addr: SocketAddr,
    codec: FrameCodec,
    dispatcher: Arc<Dispatcher>,
    options: ServerOptions,
    connections: HashMap<ConnectionId, ConnectionState>,
    reads: FuturesUnordered<PendingRead>,
    next_id: ConnectionId,
    terminate: Arc<AtomicBool>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Create, configure, bind and listen on the server socket.
    pub fn bind(
        options: ServerOptions,
        codec: FrameCodec,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self, ChannelError> {
        let socket = if options.addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(ChannelError::Connection)?;

        socket.set_reuseaddr(true).map_err(ChannelError::Connection)?;
        socket.set_keepalive(true).map_err(ChannelError::Connection)?;
        socket.bind(options.addr).map_err(ChannelError::Connection)?;
        let listener = socket.listen(LISTEN_BACKLOG).map_err(ChannelError::Connection)?;
        let local_addr = listener.local_addr().map_err(ChannelError::Connection)?;

        info!(addr = %local_addr, "Listening");

        Ok(Self {
            listener,
            local_addr,
            codec,
            dispatcher,
            options,
            connections: HashMap::new(),
            reads: FuturesUnordered::new(),
            next_id: 0,
            terminate: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Share the termination flag with an outside observer.
    #[must_use]
    pub fn with_terminate_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.terminate = flag;
        self
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn terminate_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminate)
    }

    /// Run until an exit request, the server idle timeout, or an accept failure.
    ///
    /// The listener and all connections are closed when this returns.
    pub async fn run(mut self) -> Result<StopReason, ChannelError> {
        let mut last_activity = Instant::now();

        let reason = loop {
            if self.terminate.load(Ordering::Acquire) {
                info!("Exit requested, leaving loop");
                break StopReason::Exit;
            }

            let idle_deadline = self
                .options
                .server_idle_timeout
                .map(|limit| tokio::time::Instant::from_std(last_activity + limit));

            tokio::select! {
                accepted = self.listener.accept() => {
                    last_activity = Instant::now();
                    match accepted {
                        Ok((stream, peer)) => self.register(stream, peer),
                        Err(e) => {
                            error!(error = %e, "accept() failed, terminating");
                            self.terminate.store(true, Ordering::Release);
                            self.close_all();
                            return Err(ChannelError::Connection(e));
                        }
                    }
                }
                Some((id, stream, outcome)) = self.reads.next(), if !self.reads.is_empty() => {
                    last_activity = Instant::now();
                    self.on_read(id, stream, outcome).await;
                }
                () = idle_sleep(idle_deadline) => {
                    error!(idle = ?self.options.server_idle_timeout, "Server idle timeout, terminating");
                    break StopReason::IdleTimeout;
                }
            }
        };

        self.close_all();
        info!(addr = %self.local_addr, reason = ?reason, "Closing listener");
        Ok(reason)
    }

    fn register(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;

        info!(conn = id, peer = %peer, "New incoming connection");
        self.connections.insert(
            id,
            ConnectionState {
                peer,
                accepted_at: Instant::now(),
                frames: 0,
            },
        );
        self.schedule(id, stream, None);
    }

    /// Queue the connection's next step: flush `reply` if any, then read one frame.
    fn schedule(&self, id: ConnectionId, mut stream: TcpStream, reply: Option<Vec<u8>>) {
        let codec = self.codec.clone();
        let idle = self.options.connection_idle_timeout;
        let write_timeout = self.options.write_timeout;

        self.reads.push(Box::pin(async move {
            if let Some(frame) = reply {
                match tokio::time::timeout(write_timeout, write_frame(&mut stream, &frame)).await {
                    Ok(Ok(())) => debug!(conn = id, bytes = frame.len(), "Response sent"),
                    Ok(Err(e)) => return (id, stream, ReadOutcome::Failed(e.into())),
                    Err(_) => return (id, stream, ReadOutcome::Stalled),
                }
            }

            let decoded = match idle {
                Some(limit) => {
                    tokio::time::timeout(limit, codec.decode::<Request, _>(&mut stream)).await
                }
                None => Ok(codec.decode::<Request, _>(&mut stream).await),
            };
            let outcome = match decoded {
                Ok(Ok(request)) => ReadOutcome::Frame(request),
                Ok(Err(e)) => ReadOutcome::Failed(e),
                Err(_) => ReadOutcome::Idle,
            };
            (id, stream, outcome)
        }));
    }

    async fn on_read(&mut self, id: ConnectionId, mut stream: TcpStream, outcome: ReadOutcome) {
        let request = match outcome {
            ReadOutcome::Frame(request) => request,
            ReadOutcome::Idle => {
                info!(conn = id, "Connection idle, closing");
                self.close(id);
                return;
            }
            ReadOutcome::Stalled => {
                warn!(conn = id, timeout = ?self.options.write_timeout, "Peer not reading replies, closing");
                self.close(id);
                return;
            }
            ReadOutcome::Failed(e) if e.is_connection_closed() => {
                info!(conn = id, "Connection closed");
                self.close(id);
                return;
            }
            ReadOutcome::Failed(e) => {
                warn!(conn = id, error = %e, "Dropping connection");
                self.close(id);
                return;
            }
        };

        if let Some(state) = self.connections.get_mut(&id) {
            state.frames += 1;
        }
        info!(
            conn = id,
            kind = ?request.command(),
            request_id = %request.id,
            origin = %request.origin,
            "Request received"
        );

        let dispatch = self.dispatcher.handle(&request).await;
        if dispatch.terminate {
            self.terminate.store(true, Ordering::Release);
        }

        let frame = match self.codec.encode(&dispatch.response) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(conn = id, error = %e, "Failed to encode response, closing");
                self.close(id);
                return;
            }
        };

        if !dispatch.terminate {
            self.schedule(id, stream, Some(frame));
            return;
        }

        // The loop exits before polling this connection again.
        match tokio::time::timeout(self.options.write_timeout, write_frame(&mut stream, &frame)).await {
            Ok(Ok(())) => debug!(conn = id, bytes = frame.len(), "Response sent"),
            Ok(Err(e)) => warn!(conn = id, error = %e, "send() failed"),
            Err(_) => warn!(conn = id, "Exit reply not drained in time"),
        }
        drop(stream);
        self.close(id);
    }

    /// Forget a connection. Its socket was already dropped by the caller.
    fn close(&mut self, id: ConnectionId) {
        if let Some(state) = self.connections.remove(&id) {
            debug!(
                conn = id,
                peer = %state.peer,
                frames = state.frames,
                open_for = ?state.accepted_at.elapsed(),
                "Connection removed"
            );
        }
    }

    fn close_all(&mut self) {
        let open = self.connections.len();
        self.reads = FuturesUnordered::new();
        self.connections.clear();
        if open > 0 {
            debug!(open, "Closed remaining connections");
        }
    }
}

async fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> io::Result<()> {
    stream.write_all(frame).await?;
    stream.flush().await
}

async fn idle_sleep(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
