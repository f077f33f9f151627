//! Stdio side of the bridge.
//!
//! Everything between an HTTP request and a tool process lives here:
//! - `framer`: [`Decoder`](tokio_util::codec::Decoder) splitting unframed
//!   stdout into JSON values, and the newline encoder for stdin.
//! - `launcher`: process launching behind the [`ProcessLauncher`] seam.
//! - `stdio`: reader, writer, stderr and exit-monitor tasks.
//! - `correlator`: id-keyed pending table with per-request timeouts.
//! - `handshake`: the tool-initiated `initialize` exchange.
//! - `connection`: one live process as a request/response channel.
//! - `registry`: at most one live connection per target.

pub mod connection;
pub mod correlator;
pub mod framer;
pub mod handshake;
pub mod launcher;
pub mod registry;
pub mod stdio;

pub use connection::ProcessConnection;
pub use correlator::{Correlator, PendingResponse, RequestId};
pub use framer::JsonObjectCodec;
pub use launcher::{ContainerLauncher, ProcessExit, ProcessHandle, ProcessLauncher};
pub use registry::{ConnectionRegistry, ConnectionSnapshot, ConnectionState};
