//! Networking runtime for the benchmark.
//!
//! Readiness-based I/O with mio (epoll on Linux, kqueue on macOS). The
//! runtime owns sockets and the mux framing; sessions only ever see the
//! [`Transport`](crate::transport::Transport) trait.
//!
//! - `frame`: mux wire format
//! - `connection`: `Transport` implementation over a socket
//! - `event_loop`: server workers and the client network thread

mod connection;
mod event_loop;
pub mod frame;

pub use event_loop::{run_client, run_server};
