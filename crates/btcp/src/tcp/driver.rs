//! The per-socket driver task.
//!
//! Each socket is driven by exactly one task, which owns the transport,
//! performs every read and write, and emits every notification for that
//! socket. Socket handles talk to it through a command channel and two
//! `Notify`s. Reads, the write in progress and cancellation are polled
//! together, so neither direction waits on the other.

use std::io;
use std::sync::Arc;

use btcp_core::logging::{span_names, targets};
use bytes::{Buf, Bytes};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::Instrument;

use super::config::SocketConfig;
use super::socket::SocketShared;
use crate::error::SocketError;

/// Command sent from socket handles to the driver.
pub(crate) enum Command {
    /// Transmit these bytes, in order.
    Write(Bytes),
    /// Flush, then end our write side.
    End,
}

/// Dial `address`, then drive the resulting connection until it closes.
pub(crate) async fn run_outbound(
    shared: Arc<SocketShared>,
    commands: mpsc::UnboundedReceiver<Command>,
    address: String,
) {
    let span = tracing::debug_span!(
        target: targets::SOCKET,
        span_names::SOCKET_DRIVER,
        socket = %shared.id,
        peer = %address
    );
    async move {
        let dialed = tokio::select! {
            biased;
            _ = shared.cancel.notified() => {
                shared.finish(None);
                return;
            }
            result = dial(&shared.config, &address) => result,
        };

        match dialed {
            Ok(stream) if shared.on_connected(&stream) => drive(&shared, stream, commands).await,
            // Destroyed while the dial was in flight.
            Ok(_) => shared.finish(None),
            Err(err) => shared.finish(Some(err)),
        }
    }
    .instrument(span)
    .await
}

/// Drive a connection produced by a server's accept loop.
pub(crate) async fn run_accepted(
    shared: Arc<SocketShared>,
    commands: mpsc::UnboundedReceiver<Command>,
    stream: TcpStream,
) {
    let span = tracing::debug_span!(
        target: targets::SOCKET,
        span_names::SOCKET_DRIVER,
        socket = %shared.id,
        peer = ?stream.peer_addr().ok()
    );
    drive(&shared, stream, commands).instrument(span).await
}

async fn dial(config: &SocketConfig, address: &str) -> Result<TcpStream, SocketError> {
    let attempt = TcpStream::connect(address);
    let result = match config.connect_timeout {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .unwrap_or_else(|_| {
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection timed out",
                ))
            }),
        None => attempt.await,
    };
    result.map_err(|err| SocketError::connect(address, &err))
}

async fn drive(
    shared: &SocketShared,
    stream: TcpStream,
    commands: mpsc::UnboundedReceiver<Command>,
) {
    let failure = pump(shared, stream, commands).await;
    shared.finish(failure);
}

/// Progress made by the write half in one step.
enum WriteStep {
    Wrote(usize),
    Shutdown,
}

/// Write part of `outgoing`, or end the write side once nothing is queued.
async fn write_step(writer: &mut OwnedWriteHalf, outgoing: Option<&Bytes>) -> io::Result<WriteStep> {
    match outgoing {
        Some(data) => writer.write(data).await.map(WriteStep::Wrote),
        None => writer.shutdown().await.map(|()| WriteStep::Shutdown),
    }
}

/// Move bytes until both directions are finished and every received chunk
/// has been consumed, or until the socket is destroyed or fails.
///
/// A blocked write never stalls reads or `destroy()`: the write in progress is
/// one branch of the same `select!`. The transport halves are dropped when
/// this returns.
async fn pump(
    shared: &SocketShared,
    stream: TcpStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
) -> Option<SocketError> {
    if let Err(err) = stream.set_nodelay(shared.config.no_delay) {
        tracing::warn!(target: targets::SOCKET, error = %err, "failed to set TCP_NODELAY");
    }

    let (mut reader, mut writer) = stream.into_split();
    let mut buffer = vec![0u8; shared.config.read_buffer_size];
    let mut read_open = true;
    let mut write_open = true;
    // The command being written; its front is the next byte to send.
    let mut outgoing: Option<Bytes> = None;
    let mut ending = false;

    loop {
        if !read_open && !write_open && shared.is_drained() {
            return None;
        }

        tokio::select! {
            biased;

            _ = shared.cancel.notified() => {
                tracing::debug!(target: targets::SOCKET, "driver cancelled");
                return None;
            }

            _ = shared.wake.notified() => shared.dispatch(),

            step = write_step(&mut writer, outgoing.as_ref()), if outgoing.is_some() || ending => {
                match step {
                    Ok(WriteStep::Wrote(0)) => {
                        let err = io::Error::new(io::ErrorKind::WriteZero, "transport accepted no bytes");
                        return Some(SocketError::transport(&err));
                    }
                    Ok(WriteStep::Wrote(n)) => {
                        let finished = match outgoing.as_mut() {
                            Some(data) => {
                                data.advance(n);
                                data.is_empty()
                            }
                            None => true,
                        };
                        if finished {
                            outgoing = None;
                        }
                        shared.on_flushed(n);
                    }
                    Ok(WriteStep::Shutdown) => {
                        ending = false;
                        write_open = false;
                        tracing::debug!(target: targets::SOCKET, "write side ended");
                    }
                    Err(err) => return Some(SocketError::transport(&err)),
                }
            }

            command = commands.recv(), if write_open && outgoing.is_none() && !ending => {
                match command {
                    Some(Command::Write(data)) => outgoing = Some(data),
                    Some(Command::End) => ending = true,
                    None => return None,
                }
            }

            result = reader.read(&mut buffer), if read_open => {
                match result {
                    Ok(0) => {
                        read_open = false;
                        shared.on_remote_end();
                    }
                    Ok(n) => shared.on_chunk(Bytes::copy_from_slice(&buffer[..n])),
                    Err(err) => return Some(SocketError::transport(&err)),
                }
            }
        }
    }
}
