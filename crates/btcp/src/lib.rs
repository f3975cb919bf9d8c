//! TCP byte streams for async Rust.
//!
//! btcp wraps Tokio's TCP types in an event-driven API:
//!
//! - **Sockets** with an explicit lifecycle including half-close
//!   ([`SocketState`]): end your write side and keep reading, or the reverse
//! - **Servers** that hand every accepted connection to a handler
//! - **Two ways to read**: `data` callbacks, or a [`Chunks`] stream. Bytes
//!   received before either is attached are kept, and each byte is delivered
//!   exactly once
//! - **Typed events** (`connect`, `data`, `end`, `drain`, `error`, `close`)
//!   built on [`btcp_core`] signals
//!
//! # Example
//!
//! ```ignore
//! use btcp::{connect, create_server};
//!
//! let server = create_server(|socket| {
//!     let echo = socket.clone();
//!     let _ = socket.on_data(move |chunk| {
//!         let _ = echo.write(chunk.clone());
//!     });
//! });
//! server.listen(0)?;
//! let port = server.listening().await?.port();
//!
//! let client = connect(port);
//! client.write("hello world")?;
//! client.end()?;
//! assert_eq!(&client.read_all().await?[..], b"hello world");
//! ```
//!
//! # Logging
//!
//! btcp logs through `tracing` under the targets in
//! [`btcp_core::logging::targets`]; install a subscriber to see them.

mod error;
pub mod tcp;

pub use btcp_core::SlotId;
pub use error::{Result, SocketError};
pub use tcp::{
    Chunks, Server, ServerConfig, ServerState, Socket, SocketConfig, SocketId, SocketState,
    connect, connect_to, create_server,
};
