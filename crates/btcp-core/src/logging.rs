//! Logging facilities for btcp.
//!
//! btcp uses the `tracing` crate for instrumentation and never installs a
//! subscriber itself. To see logs, install one in your application:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("btcp=debug")
//!     .init();
//! ```
//!
//! The constants below name the targets and spans btcp emits, so filters can
//! be written against them instead of against module paths.

/// Span names used throughout btcp for tracing.
pub mod span_names {
    /// Per-socket driver task span.
    pub const SOCKET_DRIVER: &str = "btcp::socket_driver";
    /// Server accept loop span.
    pub const ACCEPT_LOOP: &str = "btcp::accept_loop";
}

/// Target names for log filtering.
pub mod targets {
    /// Core crate target.
    pub const CORE: &str = "btcp_core";
    /// Signal/slot system target.
    pub const SIGNAL: &str = "btcp_core::signal";
    /// Socket lifecycle and data flow.
    pub const SOCKET: &str = "btcp::socket";
    /// Server lifecycle and accept loop.
    pub const SERVER: &str = "btcp::server";
}
