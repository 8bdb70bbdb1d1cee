//! Request dispatch.
//!
//! Maps each [`CommandKind`] to a registered [`CommandHandler`] and builds
//! the [`Response`]. Command implementations live outside this crate and
//! plug in through the handler trait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::transport::{CommandKind, Request, Response};

/// Attribute key carrying a handler failure message.
pub const ERROR_ATTRIBUTE: &str = "error";

/// What a handler returns for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerOutput {
    /// Merged into the response attributes.
    pub attributes: HashMap<String, String>,
    /// Ask the server loop to terminate after this pass.
    pub terminate: bool,
}

impl HandlerOutput {
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// A command implementation invoked by the dispatcher.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, request: &Request) -> Result<HandlerOutput>;

    /// Upper bound on a single call. `None` uses the dispatcher default.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Outcome of dispatching one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub response: Response,
    pub terminate: bool,
}

/// Lookup table from command kind to handler.
#[derive(Clone)]
pub struct Dispatcher {
    origin: String,
    handlers: HashMap<CommandKind, Arc<dyn CommandHandler>>,
    handler_timeout: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("origin", &self.origin)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("handler_timeout", &self.handler_timeout)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            handlers: HashMap::new(),
            handler_timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Register `handler` for `kind`, replacing any previous one.
    ///
    /// `Exit` and `Unspecified` are handled by the dispatcher itself and
    /// cannot be overridden.
    #[must_use]
    pub fn with_handler(mut self, kind: CommandKind, handler: impl CommandHandler + 'static) -> Self {
        self.register(kind, Arc::new(handler));
        self
    }

    pub fn register(&mut self, kind: CommandKind, handler: Arc<dyn CommandHandler>) {
        if matches!(kind, CommandKind::Exit | CommandKind::Unspecified) {
            warn!(kind = %kind, "Ignoring handler for built-in command");
            return;
        }
        if self.handlers.insert(kind, handler).is_some() {
            info!(kind = %kind, "Replaced command handler");
        }
    }

    pub fn has_handler(&self, kind: CommandKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Handle one request. Never fails: handler errors become an `error` attribute.
    #[instrument(skip(self, request), fields(id = %request.id, origin = %request.origin))]
    pub async fn handle(&self, request: &Request) -> Dispatch {
        let mut response = Response::for_request(self.origin.clone(), request);

        let Some(kind) = request.command() else {
            debug!(kind = request.kind, "Unknown command, ignoring");
            return Dispatch {
                response,
                terminate: false,
            };
        };

        match kind {
            CommandKind::Exit => {
                info!("Exit command, terminating");
                Dispatch {
                    response,
                    terminate: true,
                }
            }
            CommandKind::Unspecified => {
                debug!("Unspecified command, ignoring");
                Dispatch {
                    response,
                    terminate: false,
                }
            }
            _ => {
                let terminate = self.run_handler(kind, request, &mut response).await;
                Dispatch {
                    response,
                    terminate,
                }
            }
        }
    }

    async fn run_handler(&self, kind: CommandKind, request: &Request, response: &mut Response) -> bool {
        let Some(handler) = self.handlers.get(&kind) else {
            debug!(kind = %kind, "No handler registered");
            return false;
        };

        let limit = handler.timeout().unwrap_or(self.handler_timeout);
        match tokio::time::timeout(limit, handler.handle(request)).await {
            Ok(Ok(output)) => {
                debug!(kind = %kind, attributes = output.attributes.len(), "Handler completed");
                response.attributes.extend(output.attributes);
                output.terminate
            }
            Ok(Err(e)) => {
                warn!(kind = %kind, error = %e, "Handler failed");
                response
                    .attributes
                    .insert(ERROR_ATTRIBUTE.into(), format!("{e:#}"));
                false
            }
            Err(_) => {
                warn!(kind = %kind, timeout = ?limit, "Handler timed out");
                response
                    .attributes
                    .insert(ERROR_ATTRIBUTE.into(), format!("handler timed out after {limit:?}"));
                false
            }
        }
    }
}
