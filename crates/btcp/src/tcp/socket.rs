//! The socket type: one TCP byte stream with half-close and two ways to read.

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::Waker;

use btcp_core::logging::targets;
use btcp_core::{OnceSignal, Signal, SlotId};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio_stream::StreamExt;

use super::chunks::Chunks;
use super::config::{SocketConfig, endpoint};
use super::driver::{self, Command};
use super::state::{SocketEvent, SocketState};
use crate::error::{Result, SocketError};

/// Unique identifier for a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sock-{}", self.0)
    }
}

/// Which consumption style owns the read queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConsumerMode {
    Unattached,
    Callbacks,
    Iteration,
}

pub(crate) struct SocketInner {
    pub(crate) state: SocketState,
    pub(crate) read_buffer: VecDeque<Bytes>,
    pub(crate) mode: ConsumerMode,
    /// The parked pull, tagged with the id of the `Chunks` that parked it.
    pub(crate) waiter: Option<(u64, Waker)>,
    /// Failure not yet reported to an iteration consumer.
    pub(crate) failure: Option<SocketError>,
    pub(crate) local_ended: bool,
    pub(crate) destroyed: bool,
    pub(crate) closed: bool,
    pub(crate) end_delivered: bool,
    pub(crate) needs_drain: bool,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) remote_addr: Option<SocketAddr>,
}

pub(crate) struct SocketEvents {
    pub(crate) connect: OnceSignal<()>,
    pub(crate) data: Signal<Bytes>,
    pub(crate) end: OnceSignal<()>,
    pub(crate) drain: Signal<()>,
    pub(crate) error: OnceSignal<SocketError>,
    pub(crate) close: OnceSignal<bool>,
}

/// State shared between socket handles and the socket's driver task.
///
/// Only the driver emits `data`, `end`, `drain`, `error` and `close`, so the
/// notifications of one socket are totally ordered. The lock is never held
/// while a slot runs.
pub(crate) struct SocketShared {
    pub(crate) id: SocketId,
    pub(crate) config: SocketConfig,
    pub(crate) inner: Mutex<SocketInner>,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    /// Set by `destroy()`; stops the driver.
    pub(crate) cancel: Notify,
    /// Asks the driver to re-dispatch the read queue.
    pub(crate) wake: Notify,
    pub(crate) pending_bytes: AtomicUsize,
    pub(crate) bytes_read: AtomicU64,
    pub(crate) bytes_written: AtomicU64,
    pub(crate) events: SocketEvents,
}

impl SocketShared {
    fn new(
        config: SocketConfig,
        state: SocketState,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Command>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            id: SocketId::new(),
            config,
            inner: Mutex::new(SocketInner {
                state,
                read_buffer: VecDeque::new(),
                mode: ConsumerMode::Unattached,
                waiter: None,
                failure: None,
                local_ended: false,
                destroyed: false,
                closed: false,
                end_delivered: false,
                needs_drain: false,
                local_addr: None,
                remote_addr: None,
            }),
            commands,
            cancel: Notify::new(),
            wake: Notify::new(),
            pending_bytes: AtomicUsize::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            events: SocketEvents {
                connect: OnceSignal::new(),
                data: Signal::new(),
                end: OnceSignal::new(),
                drain: Signal::new(),
                error: OnceSignal::new(),
                close: OnceSignal::new(),
            },
        });
        (shared, command_rx)
    }

    fn set_state(&self, inner: &mut SocketInner, next: SocketState) {
        if inner.state != next {
            tracing::debug!(
                target: targets::SOCKET,
                socket = %self.id,
                from = %inner.state,
                to = %next,
                "socket state change"
            );
            inner.state = next;
        }
    }

    fn apply(&self, inner: &mut SocketInner, event: SocketEvent) -> bool {
        match inner.state.on(event) {
            Some(next) => {
                self.set_state(inner, next);
                true
            }
            None => false,
        }
    }

    /// Record a freshly established transport. Returns `false` if the socket
    /// was destroyed while connecting.
    pub(crate) fn on_connected(&self, stream: &TcpStream) -> bool {
        {
            let mut inner = self.inner.lock();
            if !self.apply(&mut inner, SocketEvent::Connected) {
                return false;
            }
            inner.local_addr = stream.local_addr().ok();
            inner.remote_addr = stream.peer_addr().ok();
        }
        let _ = self.events.connect.emit(());
        true
    }

    pub(crate) fn on_chunk(&self, chunk: Bytes) {
        self.bytes_read
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        tracing::trace!(target: targets::SOCKET, socket = %self.id, len = chunk.len(), "chunk received");
        self.inner.lock().read_buffer.push_back(chunk);
        self.dispatch();
    }

    pub(crate) fn on_remote_end(&self) {
        tracing::debug!(target: targets::SOCKET, socket = %self.id, "peer ended its write side");
        {
            let mut inner = self.inner.lock();
            self.apply(&mut inner, SocketEvent::RemoteEnd);
        }
        self.dispatch();
    }

    pub(crate) fn on_flushed(&self, len: usize) {
        self.bytes_written.fetch_add(len as u64, Ordering::Relaxed);
        let remaining = self
            .pending_bytes
            .fetch_sub(len, Ordering::AcqRel)
            .saturating_sub(len);
        if remaining == 0 {
            let drained = std::mem::take(&mut self.inner.lock().needs_drain);
            if drained {
                self.events.drain.emit(());
            }
        }
    }

    /// Whether every received chunk has been handed to a consumer.
    pub(crate) fn is_drained(&self) -> bool {
        self.inner.lock().read_buffer.is_empty()
    }

    /// Hand queued chunks to the active consumer, then deliver `end` once the
    /// peer's end-of-stream has been reached and nothing is left queued.
    pub(crate) fn dispatch(&self) {
        let chunks: Vec<Bytes> = {
            let mut inner = self.inner.lock();
            match inner.mode {
                ConsumerMode::Callbacks => inner.read_buffer.drain(..).collect(),
                ConsumerMode::Iteration => {
                    if let Some((_, waker)) = inner.waiter.take() {
                        waker.wake();
                    }
                    Vec::new()
                }
                ConsumerMode::Unattached => Vec::new(),
            }
        };
        for chunk in chunks {
            self.events.data.emit(chunk);
        }

        let deliver_end = {
            let mut inner = self.inner.lock();
            let reached = !inner.state.is_readable()
                && inner.read_buffer.is_empty()
                && !inner.end_delivered
                && !inner.destroyed
                && inner.failure.is_none();
            if reached {
                inner.end_delivered = true;
                if !self.config.allow_half_open
                    && inner.state == SocketState::RemoteClosed
                    && self.commands.send(Command::End).is_ok()
                {
                    inner.local_ended = true;
                    self.apply(&mut inner, SocketEvent::LocalEnd);
                }
            }
            reached
        };
        if deliver_end {
            let _ = self.events.end.emit(());
        }
    }

    /// Terminal transition: runs once, on the driver, after the transport has
    /// been dropped.
    pub(crate) fn finish(&self, failure: Option<SocketError>) {
        let had_error = failure.is_some();
        let waiter = {
            let mut inner = self.inner.lock();
            self.set_state(&mut inner, SocketState::Closed);
            inner.closed = true;
            if had_error {
                inner.read_buffer.clear();
                inner.failure = failure.clone();
            }
            inner.waiter.take()
        };
        self.pending_bytes.store(0, Ordering::Release);
        if let Some((_, waker)) = waiter {
            waker.wake();
        }

        if let Some(err) = failure {
            tracing::warn!(target: targets::SOCKET, socket = %self.id, error = %err, "socket failed");
            let _ = self.events.error.emit(err);
        }
        tracing::debug!(target: targets::SOCKET, socket = %self.id, had_error, "socket closed");
        let _ = self.events.close.emit(had_error);

        // Slots often capture a handle to their own socket; dropping them
        // here breaks that cycle.
        let events = &self.events;
        events.connect.disconnect_all();
        events.data.disconnect_all();
        events.end.disconnect_all();
        events.drain.disconnect_all();
        events.error.disconnect_all();
        events.close.disconnect_all();
    }
}

/// A TCP byte stream.
///
/// A socket comes either from [`connect`](super::connect) (starting in
/// [`SocketState::Connecting`]) or from a [`Server`](super::Server)'s accept
/// loop (starting in [`SocketState::Open`]). Handles are cheap to clone and
/// all refer to the same connection; the transport itself is owned by a
/// driver task and released exactly once, when the socket closes.
///
/// # Reading
///
/// Incoming bytes can be consumed in exactly one of two ways per socket:
///
/// - callbacks registered with [`on_data`](Self::on_data), or
/// - a [`Chunks`] stream obtained from [`chunks`](Self::chunks).
///
/// The first consumer attached picks the style; attaching the other one
/// afterwards fails with [`SocketError::ConsumerConflict`]. Bytes received
/// before any consumer is attached are kept and handed to the first one.
///
/// # Events
///
/// - `connect`: the transport is established (latched)
/// - `data`: a chunk was received
/// - `end`: the peer ended its write side and every chunk was delivered (latched)
/// - `drain`: the write queue emptied after `write` returned `false`
/// - `error`: a transport failure, always followed by `close` (latched)
/// - `close`: the socket is fully closed; always the last event (latched)
///
/// Latched events invoke slots registered after the fact immediately.
///
/// # Example
///
/// ```ignore
/// use tokio_stream::StreamExt;
///
/// let socket = btcp::connect(12000);
/// socket.connected().await?;
///
/// socket.write("hello world")?;
/// socket.end()?;
///
/// let mut chunks = socket.chunks()?;
/// while let Some(chunk) = chunks.next().await {
///     println!("{:?}", chunk?);
/// }
/// ```
#[derive(Clone)]
pub struct Socket {
    shared: Arc<SocketShared>,
}

impl Socket {
    /// Dial `host:port` with the given configuration.
    ///
    /// Returns immediately in [`SocketState::Connecting`]. Failures are
    /// reported through [`connected`](Self::connected) and the `error` and
    /// `close` events. Must be called within a Tokio runtime.
    pub fn connect_with_config(config: SocketConfig, port: u16, host: impl AsRef<str>) -> Self {
        let (shared, command_rx) = SocketShared::new(config, SocketState::Connecting);
        let address = endpoint(host.as_ref(), port);
        tracing::debug!(target: targets::SOCKET, socket = %shared.id, %address, "connecting");
        tokio::spawn(driver::run_outbound(shared.clone(), command_rx, address));
        Self { shared }
    }

    pub(crate) fn from_accepted(stream: TcpStream, config: SocketConfig) -> Self {
        let (shared, command_rx) = SocketShared::new(config, SocketState::Open);
        {
            let mut inner = shared.inner.lock();
            inner.local_addr = stream.local_addr().ok();
            inner.remote_addr = stream.peer_addr().ok();
        }
        let _ = shared.events.connect.emit(());
        tokio::spawn(driver::run_accepted(shared.clone(), command_rx, stream));
        Self { shared }
    }

    pub(crate) fn from_shared(shared: Arc<SocketShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<SocketShared> {
        Arc::downgrade(&self.shared)
    }

    /// Get the unique socket ID.
    pub fn id(&self) -> SocketId {
        self.shared.id
    }

    /// Get the current state.
    pub fn state(&self) -> SocketState {
        self.shared.inner.lock().state
    }

    /// Get the configuration this socket was created with.
    pub fn config(&self) -> &SocketConfig {
        &self.shared.config
    }

    /// Get the local socket address, once connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.inner.lock().local_addr
    }

    /// Get the peer socket address, once connected.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.inner.lock().remote_addr
    }

    /// Total bytes received from the peer.
    pub fn bytes_read(&self) -> u64 {
        self.shared.bytes_read.load(Ordering::Relaxed)
    }

    /// Total bytes accepted by the transport.
    pub fn bytes_written(&self) -> u64 {
        self.shared.bytes_written.load(Ordering::Relaxed)
    }

    /// Bytes queued by `write` and not yet accepted by the transport.
    pub fn pending_bytes(&self) -> usize {
        self.shared.pending_bytes.load(Ordering::Acquire)
    }

    /// Whether [`destroy`](Self::destroy) was called.
    pub fn is_destroyed(&self) -> bool {
        self.shared.inner.lock().destroyed
    }

    /// Queue bytes for transmission.
    ///
    /// Returns `Ok(true)` while the queued byte count is below the configured
    /// high-water mark, `Ok(false)` once it is not; a `drain` event follows
    /// when the queue empties. Writes issued while connecting are sent once
    /// the connection is established.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<bool> {
        let data = data.into();
        let high_water_mark = self.shared.config.high_water_mark;
        let mut inner = self.shared.inner.lock();
        if !inner.state.is_writable() {
            return Err(SocketError::invalid_state("write", inner.state));
        }
        if data.is_empty() {
            return Ok(self.pending_bytes() < high_water_mark);
        }

        let len = data.len();
        let pending = self.shared.pending_bytes.fetch_add(len, Ordering::AcqRel) + len;
        if self.shared.commands.send(Command::Write(data)).is_err() {
            self.shared.pending_bytes.fetch_sub(len, Ordering::AcqRel);
            return Err(SocketError::invalid_state("write", SocketState::Closed));
        }

        let below = pending < high_water_mark;
        if !below {
            inner.needs_drain = true;
        }
        Ok(below)
    }

    /// Half-close: flush queued writes, then end our write side.
    ///
    /// The read side stays open until the peer ends too. Calling `end` again
    /// has no further effect.
    pub fn end(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        if inner.local_ended {
            return Ok(());
        }
        let Some(next) = inner.state.on(SocketEvent::LocalEnd) else {
            return Err(SocketError::invalid_state("end", inner.state));
        };
        self.shared
            .commands
            .send(Command::End)
            .map_err(|_| SocketError::invalid_state("end", SocketState::Closed))?;
        inner.local_ended = true;
        self.shared.set_state(&mut inner, next);
        Ok(())
    }

    /// Close immediately, discarding unread and unsent bytes.
    ///
    /// The `close` event is emitted afterwards by the socket's driver, never
    /// from inside this call. Calling `destroy` on a closed socket does
    /// nothing.
    pub fn destroy(&self) {
        let waiter = {
            let mut inner = self.shared.inner.lock();
            if inner.destroyed || inner.closed {
                return;
            }
            inner.destroyed = true;
            inner.read_buffer.clear();
            self.shared.apply(&mut inner, SocketEvent::Abort);
            inner.waiter.take()
        };
        tracing::debug!(target: targets::SOCKET, socket = %self.shared.id, "destroying socket");
        if let Some((_, waker)) = waiter {
            waker.wake();
        }
        self.shared.cancel.notify_one();
    }

    /// Wait until the connection is established.
    ///
    /// Resolves to the connect error if dialing failed, or to
    /// [`SocketError::InvalidState`] if the socket was destroyed first.
    pub async fn connected(&self) -> Result<()> {
        let connect = self.shared.events.connect.wait();
        let close = self.shared.events.close.wait();
        tokio::select! {
            biased;
            () = connect => Ok(()),
            _ = close => Err(self
                .shared
                .events
                .error
                .value()
                .unwrap_or_else(|| SocketError::invalid_state("connect", SocketState::Closed))),
        }
    }

    /// Wait for the `close` event. Resolves to `true` if the socket closed
    /// because of an error.
    pub fn closed(&self) -> impl Future<Output = bool> + Send + 'static {
        self.shared.events.close.wait()
    }

    /// Register a slot for the `connect` event.
    pub fn on_connect<F>(&self, slot: F) -> SlotId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.events.connect.connect(move |_| slot())
    }

    /// Register a slot for the `data` event, selecting callback consumption.
    ///
    /// Fails with [`SocketError::ConsumerConflict`] if a [`Chunks`] stream
    /// was already attached.
    pub fn on_data<F>(&self, slot: F) -> Result<SlotId>
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        self.attach_data(slot, false)
    }

    /// Like [`on_data`](Self::on_data), but the slot only sees one chunk.
    pub fn once_data<F>(&self, slot: F) -> Result<SlotId>
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        self.attach_data(slot, true)
    }

    fn attach_data<F>(&self, slot: F, once: bool) -> Result<SlotId>
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        let id = {
            let mut inner = self.shared.inner.lock();
            if inner.mode == ConsumerMode::Iteration {
                return Err(SocketError::ConsumerConflict(
                    "an iteration consumer is attached to this socket",
                ));
            }
            inner.mode = ConsumerMode::Callbacks;
            if once {
                self.shared.events.data.connect_once(slot)
            } else {
                self.shared.events.data.connect(slot)
            }
        };
        // Chunks that arrived before the first consumer are delivered by the driver.
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Register a slot for the `end` event.
    pub fn on_end<F>(&self, slot: F) -> SlotId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.events.end.connect(move |_| slot())
    }

    /// Register a slot for the `drain` event.
    pub fn on_drain<F>(&self, slot: F) -> SlotId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.events.drain.connect(move |_| slot())
    }

    /// Register a slot for the `error` event.
    pub fn on_error<F>(&self, slot: F) -> SlotId
    where
        F: Fn(&SocketError) + Send + Sync + 'static,
    {
        self.shared.events.error.connect(slot)
    }

    /// Register a slot for the `close` event. The argument is `true` if the
    /// socket closed because of an error.
    pub fn on_close<F>(&self, slot: F) -> SlotId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.shared.events.close.connect(move |&had_error| slot(had_error))
    }

    /// Remove a slot registered with any of the `on_*` methods.
    pub fn remove_listener(&self, id: SlotId) -> bool {
        let events = &self.shared.events;
        events.data.disconnect(id)
            || events.connect.disconnect(id)
            || events.end.disconnect(id)
            || events.drain.disconnect(id)
            || events.error.disconnect(id)
            || events.close.disconnect(id)
    }

    /// Consume incoming bytes as a stream of chunks, selecting iteration.
    ///
    /// Chunks already received are yielded first. The stream ends once the
    /// peer's end-of-stream is reached or the socket is destroyed, and does
    /// not restart: a later call after the end yields nothing. Fails with
    /// [`SocketError::ConsumerConflict`] if data callbacks are attached, and
    /// with [`SocketError::InvalidState`] after [`destroy`](Self::destroy).
    pub fn chunks(&self) -> Result<Chunks> {
        let mut inner = self.shared.inner.lock();
        if inner.mode == ConsumerMode::Callbacks {
            return Err(SocketError::ConsumerConflict(
                "data callbacks are attached to this socket",
            ));
        }
        if inner.destroyed {
            return Err(SocketError::invalid_state("read", inner.state));
        }
        inner.mode = ConsumerMode::Iteration;
        Ok(Chunks::new(self.shared.clone()))
    }

    /// Read until the peer's end-of-stream and return everything received.
    pub async fn read_all(&self) -> Result<BytesMut> {
        let mut chunks = self.chunks()?;
        let mut received = BytesMut::new();
        while let Some(chunk) = chunks.next().await {
            received.extend_from_slice(&chunk?);
        }
        Ok(received)
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Socket")
            .field("id", &self.shared.id)
            .field("state", &inner.state)
            .field("local_addr", &inner.local_addr)
            .field("remote_addr", &inner.remote_addr)
            .field("buffered_chunks", &inner.read_buffer.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(Socket: Send, Sync, Clone);
