//! State enums for sockets and servers.

/// Lifecycle of a socket, including half-close.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SocketState {
    /// Dialing the peer.
    #[default]
    Connecting,
    /// Established; both directions usable.
    Open,
    /// We sent our end-of-stream; still reading.
    LocalClosed,
    /// The peer sent its end-of-stream; we may still write.
    RemoteClosed,
    /// Terminal. The transport is released or about to be.
    Closed,
}

/// Events that move a socket between states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SocketEvent {
    /// The transport confirmed the connection.
    Connected,
    /// The application ended its write side.
    LocalEnd,
    /// The peer ended its write side.
    RemoteEnd,
    /// Connect failure, transport error, or `destroy()`.
    Abort,
}

impl SocketState {
    /// The state reached by applying `event`, or `None` if the event is not
    /// valid in this state.
    pub(crate) fn on(self, event: SocketEvent) -> Option<SocketState> {
        use SocketEvent as E;
        use SocketState as S;

        match (self, event) {
            (S::Connecting, E::Connected) => Some(S::Open),
            (S::Connecting, E::Abort) => Some(S::Closed),
            (S::Connecting, E::LocalEnd | E::RemoteEnd) => None,

            (S::Open, E::LocalEnd) => Some(S::LocalClosed),
            (S::Open, E::RemoteEnd) => Some(S::RemoteClosed),
            (S::Open, E::Abort) => Some(S::Closed),
            (S::Open, E::Connected) => None,

            (S::LocalClosed, E::RemoteEnd | E::Abort) => Some(S::Closed),
            (S::LocalClosed, E::Connected | E::LocalEnd) => None,

            (S::RemoteClosed, E::LocalEnd | E::Abort) => Some(S::Closed),
            (S::RemoteClosed, E::Connected | E::RemoteEnd) => None,

            (S::Closed, _) => None,
        }
    }

    /// Whether `write` is accepted. Writes issued while connecting are queued.
    pub fn is_writable(self) -> bool {
        matches!(self, Self::Connecting | Self::Open | Self::RemoteClosed)
    }

    /// Whether more bytes may still arrive from the peer.
    pub fn is_readable(self) -> bool {
        matches!(self, Self::Connecting | Self::Open | Self::LocalClosed)
    }
}

impl std::fmt::Display for SocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Open => write!(f, "Open"),
            Self::LocalClosed => write!(f, "LocalClosed"),
            Self::RemoteClosed => write!(f, "RemoteClosed"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Lifecycle of a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ServerState {
    /// Not listening. A failed bind also returns the server here.
    #[default]
    Idle,
    /// Accepting connections.
    Listening,
    /// `close()` was called; the accept loop is winding down.
    Closing,
    /// The endpoint is released. Terminal.
    Closed,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Listening => write!(f, "Listening"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}
