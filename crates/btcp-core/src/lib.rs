//! Core event primitives for btcp.
//!
//! This crate provides the building blocks the `btcp` transport uses to
//! deliver notifications:
//!
//! - **Signal**: a repeatable event with ordered slots (`data`, `drain`, ...)
//! - **OnceSignal**: a latched, fire-at-most-once event (`connect`, `close`, ...)
//! - **Logging**: tracing target and span names
//!
//! # Example
//!
//! ```
//! use btcp_core::{OnceSignal, Signal};
//!
//! let data = Signal::<Vec<u8>>::new();
//! let closed = OnceSignal::<bool>::new();
//!
//! data.connect(|chunk| println!("{} bytes", chunk.len()));
//! closed.connect(|had_error| println!("closed, had_error = {had_error}"));
//!
//! data.emit(b"hello".to_vec());
//! closed.emit(false).unwrap();
//! ```

mod error;
pub mod logging;
pub mod signal;

pub use error::SignalError;
pub use signal::{OnceSignal, Signal, SlotId};
