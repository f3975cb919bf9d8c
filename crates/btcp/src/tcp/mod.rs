//! TCP sockets and servers with event and stream consumption.
//!
//! This module provides:
//! - **Socket**: one TCP byte stream with half-close
//! - **Server**: accepts connections and hands each one to a handler
//! - **Chunks**: pull-style consumption of a socket's incoming bytes
//!
//! # Echo Server Example
//!
//! ```ignore
//! use btcp::tcp::create_server;
//!
//! let server = create_server(|socket| {
//!     let echo = socket.clone();
//!     let _ = socket.on_data(move |chunk| {
//!         let _ = echo.write(chunk.clone());
//!     });
//! });
//!
//! server.listen(12000)?;
//! server.listening().await?;
//! ```
//!
//! # Client Example
//!
//! ```ignore
//! use btcp::tcp::connect;
//!
//! let socket = connect(12000);
//! socket.on_close(|had_error| println!("closed, had_error = {had_error}"));
//!
//! socket.write("hello world")?;
//! socket.end()?;
//!
//! let reply = socket.read_all().await?;
//! ```

mod chunks;
mod config;
mod driver;
mod server;
mod socket;
mod state;

pub use chunks::Chunks;
pub use config::{DEFAULT_BIND_ADDRESS, DEFAULT_CONNECT_HOST, ServerConfig, SocketConfig};
pub use server::Server;
pub use socket::{Socket, SocketId};
pub use state::{ServerState, SocketState};

/// Create a server with default configuration.
///
/// The handler runs once per accepted connection, on the server's accept
/// task, and receives the connection as an open [`Socket`].
pub fn create_server<F>(handler: F) -> Server
where
    F: Fn(Socket) + Send + Sync + 'static,
{
    Server::new(handler)
}

/// Connect to `port` on [`DEFAULT_CONNECT_HOST`].
pub fn connect(port: u16) -> Socket {
    connect_to(port, DEFAULT_CONNECT_HOST)
}

/// Connect to `host:port` with default socket configuration.
pub fn connect_to(port: u16, host: impl AsRef<str>) -> Socket {
    Socket::connect_with_config(SocketConfig::default(), port, host)
}
