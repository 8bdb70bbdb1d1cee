//! Server lifecycle: start attached or detached, stop, wait.
//!
//! The multiplexer runs as one background task. Completion is published on
//! a `watch` channel so `wait()` blocks on a signal instead of polling.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::{Client, ClientOptions};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::server::{Multiplexer, ServerOptions, StopReason};
use crate::transport::{CommandKind, FrameCodec, Request};

/// Where the server loop is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Stopped,
    /// Started attached: `start` blocks until the loop exits.
    Running,
    /// Started detached: the loop runs independently of the caller.
    Detached,
}

/// Snapshot published on every lifecycle transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerState {
    pub phase: Phase,
    /// Bound address while running (or of the last run).
    pub local_addr: Option<SocketAddr>,
    /// Why the last run ended. `None` while running or after a failure.
    pub stop_reason: Option<StopReason>,
}

struct Shared {
    /// Written only by the loop.
    terminate: Arc<AtomicBool>,
    state: watch::Sender<ServerState>,
}

/// Marks the server stopped when the loop task ends, including on panic.
struct MarkStopped {
    shared: Arc<Shared>,
    reason: Option<StopReason>,
}

impl Drop for MarkStopped {
    fn drop(&mut self) {
        let reason = self.reason;
        self.shared.state.send_modify(|state| {
            state.phase = Phase::Stopped;
            state.stop_reason = reason;
        });
    }
}

/// Owns the server configuration and controls the loop's lifecycle.
pub struct Server {
    options: ServerOptions,
    codec: FrameCodec,
    dispatcher: Arc<Dispatcher>,
    client_options: ClientOptions,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("options", &self.options)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Server {
    pub fn new(options: ServerOptions, codec: FrameCodec, dispatcher: Dispatcher) -> Self {
        let (state, _) = watch::channel(ServerState::default());
        let dispatcher = dispatcher.with_handler_timeout(options.handler_timeout);
        Self {
            options,
            codec,
            dispatcher: Arc::new(dispatcher),
            client_options: ClientOptions::default(),
            shared: Arc::new(Shared {
                terminate: Arc::new(AtomicBool::new(false)),
                state,
            }),
            task: Mutex::new(None),
        }
    }

    /// Build a server from configuration. `dispatcher` carries the command handlers.
    pub fn from_config(config: &Config, dispatcher: Dispatcher) -> Result<Self> {
        Ok(Self::new(config.server_options(), config.codec()?, dispatcher)
            .with_client_options(config.client_options()))
    }

    /// Retry policy for the self-addressed exit request sent by `stop`.
    #[must_use]
    pub fn with_client_options(mut self, options: ClientOptions) -> Self {
        self.client_options = options;
        self
    }

    pub fn state(&self) -> ServerState {
        *self.shared.state.borrow()
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    pub fn is_stopped(&self) -> bool {
        self.phase() == Phase::Stopped
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state().local_addr
    }

    /// Whether the loop has seen a terminating request in the current run.
    pub fn terminate_requested(&self) -> bool {
        self.shared.terminate.load(Ordering::Acquire)
    }

    /// Subscribe to lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.shared.state.subscribe()
    }

    /// Bind and spawn the server loop.
    ///
    /// Attached (`detached == false`) blocks until the loop exits. Detached
    /// returns once the socket is listening; use `stop` or `wait` later.
    pub async fn start(&self, detached: bool) -> Result<()> {
        let mut task_slot = self.task.lock().await;
        anyhow::ensure!(self.is_stopped(), "Server is already running");

        let mux = Multiplexer::bind(self.options.clone(), self.codec.clone(), Arc::clone(&self.dispatcher))
            .context("Failed to start server")?
            .with_terminate_flag(Arc::clone(&self.shared.terminate));
        let local_addr = mux.local_addr();

        self.shared.terminate.store(false, Ordering::Release);
        self.shared.state.send_replace(ServerState {
            phase: if detached { Phase::Detached } else { Phase::Running },
            local_addr: Some(local_addr),
            stop_reason: None,
        });

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            let mut guard = MarkStopped { shared, reason: None };
            match mux.run().await {
                Ok(reason) => {
                    info!(reason = ?reason, "Server loop exited");
                    guard.reason = Some(reason);
                }
                Err(e) => error!(error = %e, "Server loop failed"),
            }
        });

        if detached {
            info!(addr = %local_addr, "Server started detached");
            *task_slot = Some(task);
            return Ok(());
        }

        info!(addr = %local_addr, "Server started");
        drop(task_slot);
        task.await.context("Server task panicked")?;
        Ok(())
    }

    /// Stop the server.
    ///
    /// Attached: waits for the loop to exit on its own. Detached: sends an
    /// exit request to the server's own address, then waits.
    pub async fn stop(&self) -> Result<()> {
        let state = self.state();
        match state.phase {
            Phase::Stopped => {
                debug!("Server already stopped");
                return Ok(());
            }
            Phase::Running => info!("Waiting for attached server to exit"),
            Phase::Detached => {
                let addr = state
                    .local_addr
                    .map(reachable_addr)
                    .context("Detached server has no bound address")?;
                let request = Request::new(
                    CommandKind::Exit,
                    uuid::Uuid::new_v4().to_string(),
                    self.options.origin.clone(),
                );

                info!(addr = %addr, "Sending exit request to detached server");
                let client = Client::new(addr, self.codec.clone()).with_options(self.client_options);
                if let Err(e) = client.send_request(&request).await {
                    // The loop may have exited on its own in the meantime.
                    if self.is_stopped() {
                        debug!(error = %e, "Server stopped before exit request was delivered");
                    } else {
                        return Err(e).context("Failed to send exit request");
                    }
                }
            }
        }

        self.wait().await
    }

    /// Block until the loop has exited.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        rx.wait_for(|state| state.phase == Phase::Stopped)
            .await
            .context("Server state channel closed")?;

        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Server task did not finish cleanly");
            }
        }
        Ok(())
    }
}

/// Wildcard bind addresses are not connectable; use loopback instead.
fn reachable_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port()),
        _ => addr,
    }
}
