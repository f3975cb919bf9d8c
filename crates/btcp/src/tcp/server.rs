//! TCP server: binds an endpoint and hands every accepted connection to a
//! handler as a [`Socket`].

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use btcp_core::logging::{span_names, targets};
use btcp_core::{OnceSignal, Signal, SlotId};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{Notify, watch};
use tracing::Instrument;

use super::config::{ServerConfig, endpoint};
use super::socket::{Socket, SocketId, SocketShared};
use super::state::ServerState;
use crate::error::{Result, SocketError};

type Handler = Arc<dyn Fn(Socket) + Send + Sync>;

/// Pause after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

struct ServerInner {
    state: ServerState,
    /// A bind is in flight or the accept loop is alive.
    running: bool,
    local_addr: Option<SocketAddr>,
    connections: HashMap<SocketId, Weak<SocketShared>>,
}

struct ServerEvents {
    listening: Signal<SocketAddr>,
    error: Signal<SocketError>,
    close: OnceSignal<()>,
}

struct ServerShared {
    config: ServerConfig,
    handler: Handler,
    inner: Mutex<ServerInner>,
    stop: Notify,
    bind_outcome: watch::Sender<Option<Result<SocketAddr>>>,
    events: ServerEvents,
}

impl ServerShared {
    async fn run(self: Arc<Self>, address: String) {
        let span = tracing::info_span!(
            target: targets::SERVER,
            span_names::ACCEPT_LOOP,
            %address
        );
        async move {
            let listener = match bind(&address, self.config.backlog).await {
                Ok(listener) => listener,
                Err(err) => return self.on_bind_failed(err),
            };
            let local_addr = match listener.local_addr() {
                Ok(addr) => addr,
                Err(err) => return self.on_bind_failed(SocketError::bind(&address, &err)),
            };
            if !self.on_listening(local_addr) {
                drop(listener);
                return self.on_closed();
            }

            loop {
                tokio::select! {
                    biased;

                    _ = self.stop.notified() => break,

                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => self.dispatch(stream, peer),
                        Err(err) => self.on_accept_failed(&err).await,
                    },
                }
            }

            // The endpoint is released before anyone hears about it.
            drop(listener);
            self.on_closed();
        }
        .instrument(span)
        .await
    }

    fn on_bind_failed(&self, err: SocketError) {
        tracing::warn!(target: targets::SERVER, error = %err, "bind failed");
        let closed = {
            let mut inner = self.inner.lock();
            inner.running = false;
            if inner.state == ServerState::Closing {
                inner.state = ServerState::Closed;
                true
            } else {
                inner.state = ServerState::Idle;
                false
            }
        };
        self.events.error.emit(err.clone());
        self.bind_outcome.send_replace(Some(Err(err)));
        if closed {
            let _ = self.events.close.emit(());
        }
    }

    /// Returns `false` if `close()` won the race against the bind.
    fn on_listening(&self, local_addr: SocketAddr) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state != ServerState::Idle {
                return false;
            }
            inner.state = ServerState::Listening;
            inner.local_addr = Some(local_addr);
        }
        tracing::info!(target: targets::SERVER, %local_addr, "server listening");
        self.bind_outcome.send_replace(Some(Ok(local_addr)));
        self.events.listening.emit(local_addr);
        true
    }

    fn on_closed(&self) {
        {
            let mut inner = self.inner.lock();
            inner.state = ServerState::Closed;
            inner.running = false;
            inner.local_addr = None;
        }
        tracing::info!(target: targets::SERVER, "server closed");
        let _ = self.events.close.emit(());
        self.events.listening.disconnect_all();
        self.events.error.disconnect_all();
    }

    /// Report an accept failure, then pause before accepting again. Errors
    /// such as `EMFILE` persist until a descriptor is freed.
    async fn on_accept_failed(&self, err: &io::Error) {
        let err = SocketError::transport(err);
        tracing::warn!(target: targets::SERVER, error = %err, "accept failed");
        self.events.error.emit(err);
        tokio::time::sleep(ACCEPT_BACKOFF).await;
    }

    fn dispatch(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if self.inner.lock().state != ServerState::Listening {
            return;
        }

        let socket = Socket::from_accepted(stream, self.config.socket.clone());
        let id = socket.id();
        self.inner
            .lock()
            .connections
            .insert(id, socket.downgrade());

        let registry = Arc::downgrade(self);
        socket.on_close(move |_| {
            if let Some(server) = registry.upgrade() {
                server.inner.lock().connections.remove(&id);
            }
        });

        tracing::debug!(target: targets::SERVER, socket = %id, %peer, "accepted connection");
        (self.handler)(socket);
    }
}

async fn bind(address: &str, backlog: u32) -> Result<TcpListener> {
    let to_bind_error = |err: io::Error| SocketError::bind(address, &err);

    let resolved = tokio::net::lookup_host(address)
        .await
        .map_err(to_bind_error)?
        .next()
        .ok_or_else(|| {
            to_bind_error(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "address resolved to nothing",
            ))
        })?;

    let socket = if resolved.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(to_bind_error)?;
    socket.set_reuseaddr(true).map_err(to_bind_error)?;
    socket.bind(resolved).map_err(to_bind_error)?;
    socket.listen(backlog).map_err(to_bind_error)
}

/// A TCP server.
///
/// Every accepted connection is handed to the handler as an open [`Socket`].
/// Closing the server stops accepting and releases the endpoint; sockets it
/// already accepted are unaffected.
///
/// # Events
///
/// - `listening`: the endpoint is bound and accepting
/// - `error`: a bind or accept failure
/// - `close`: the endpoint is released (latched)
///
/// # Example
///
/// ```ignore
/// let server = btcp::create_server(|socket| {
///     let echo = socket.clone();
///     socket
///         .on_data(move |chunk| {
///             let _ = echo.write(chunk.clone());
///         })
///         .ok();
/// });
///
/// server.listen(12000)?;
/// let addr = server.listening().await?;
/// println!("listening on {addr}");
/// ```
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// Create a server with default configuration.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(Socket) + Send + Sync + 'static,
    {
        Self::with_config(ServerConfig::default(), handler)
    }

    /// Create a server with the given configuration.
    pub fn with_config<F>(config: ServerConfig, handler: F) -> Self
    where
        F: Fn(Socket) + Send + Sync + 'static,
    {
        let (bind_outcome, _) = watch::channel(None);
        Self {
            shared: Arc::new(ServerShared {
                config,
                handler: Arc::new(handler),
                inner: Mutex::new(ServerInner {
                    state: ServerState::Idle,
                    running: false,
                    local_addr: None,
                    connections: HashMap::new(),
                }),
                stop: Notify::new(),
                bind_outcome,
                events: ServerEvents {
                    listening: Signal::new(),
                    error: Signal::new(),
                    close: OnceSignal::new(),
                },
            }),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Get the current server state.
    pub fn state(&self) -> ServerState {
        self.shared.inner.lock().state
    }

    /// Check if the server is listening.
    pub fn is_listening(&self) -> bool {
        self.shared.inner.lock().state == ServerState::Listening
    }

    /// Get the bound address while listening.
    ///
    /// Useful after listening on port 0 to learn the assigned port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.inner.lock().local_addr
    }

    /// Start listening on `port` at the configured bind address.
    ///
    /// Returns once the bind has been started; the outcome arrives as a
    /// `listening` or `error` event and through [`listening`](Self::listening).
    /// Must be called within a Tokio runtime.
    pub fn listen(&self, port: u16) -> Result<()> {
        let address = self.shared.config.bind_address.clone();
        self.listen_on(port, address)
    }

    /// Start listening on `address:port`.
    pub fn listen_on(&self, port: u16, address: impl AsRef<str>) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state != ServerState::Idle || inner.running {
                let state = if inner.running && inner.state == ServerState::Idle {
                    "binding".to_string()
                } else {
                    inner.state.to_string()
                };
                return Err(SocketError::invalid_state("listen", state));
            }
            inner.running = true;
        }

        let address = endpoint(address.as_ref(), port);
        tracing::debug!(target: targets::SERVER, %address, "binding");
        self.shared.bind_outcome.send_replace(None);
        tokio::spawn(self.shared.clone().run(address));
        Ok(())
    }

    /// Wait for the outcome of the last [`listen`](Self::listen) call.
    ///
    /// Resolves to the bound address, or to the bind error.
    pub async fn listening(&self) -> Result<SocketAddr> {
        let mut outcome = self.shared.bind_outcome.subscribe();
        {
            let inner = self.shared.inner.lock();
            if inner.state == ServerState::Idle
                && !inner.running
                && outcome.borrow().is_none()
            {
                return Err(SocketError::invalid_state("wait for listening", inner.state));
            }
        }

        let settled = outcome
            .wait_for(Option::is_some)
            .await
            .map(|value| value.clone());
        match settled {
            Ok(Some(result)) => result,
            Ok(None) | Err(_) => Err(SocketError::invalid_state("wait for listening", self.state())),
        }
    }

    /// Stop accepting, release the endpoint and wait for the `close` event.
    ///
    /// Connections already accepted stay open. Closing an idle server moves it
    /// straight to [`ServerState::Closed`]; closing again just waits.
    pub async fn close(&self) {
        let closed = self.shared.events.close.wait();
        let emit_now = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                ServerState::Idle if !inner.running => {
                    inner.state = ServerState::Closed;
                    true
                }
                ServerState::Idle | ServerState::Listening => {
                    inner.state = ServerState::Closing;
                    self.shared.stop.notify_one();
                    false
                }
                ServerState::Closing | ServerState::Closed => false,
            }
        };
        if emit_now {
            tracing::info!(target: targets::SERVER, "server closed before listening");
            let _ = self.shared.events.close.emit(());
        }
        closed.await
    }

    /// Get the number of accepted connections that are still open.
    pub fn connection_count(&self) -> usize {
        self.shared
            .inner
            .lock()
            .connections
            .values()
            .filter(|socket| socket.strong_count() > 0)
            .count()
    }

    /// Get the IDs of accepted connections that are still open.
    pub fn connections(&self) -> Vec<SocketId> {
        let inner = self.shared.inner.lock();
        let mut ids: Vec<SocketId> = inner
            .connections
            .iter()
            .filter(|(_, socket)| socket.strong_count() > 0)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Get an accepted connection by ID.
    pub fn get_connection(&self, id: SocketId) -> Option<Socket> {
        self.shared
            .inner
            .lock()
            .connections
            .get(&id)
            .and_then(Weak::upgrade)
            .map(Socket::from_shared)
    }

    /// Register a slot for the `listening` event.
    pub fn on_listening<F>(&self, slot: F) -> SlotId
    where
        F: Fn(&SocketAddr) + Send + Sync + 'static,
    {
        self.shared.events.listening.connect(slot)
    }

    /// Register a slot for the `error` event.
    pub fn on_error<F>(&self, slot: F) -> SlotId
    where
        F: Fn(&SocketError) + Send + Sync + 'static,
    {
        self.shared.events.error.connect(slot)
    }

    /// Register a slot for the `close` event.
    pub fn on_close<F>(&self, slot: F) -> SlotId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.events.close.connect(move |_| slot())
    }

    /// Remove a slot registered with any of the `on_*` methods.
    pub fn remove_listener(&self, id: SlotId) -> bool {
        let events = &self.shared.events;
        events.listening.disconnect(id) || events.error.disconnect(id) || events.close.disconnect(id)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Server")
            .field("state", &inner.state)
            .field("local_addr", &inner.local_addr)
            .field("connections", &inner.connections.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(Server: Send, Sync, Clone);
