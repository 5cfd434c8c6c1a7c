//! byte-driven websocket endpoint core
//!
//! two cooperating state machines that accept input one byte at a time:
//! a handshake header parser and a frame receive machine, sharing a
//! per-connection state record. the transport may fragment input
//! arbitrarily; feeding the same bytes in any split produces the same
//! callbacks and the same final state.
//!
//! several historical draft revisions are framed, with their
//! incompatible wire formats: 0 (hixie-76 sentinel framing), 4 (sha1
//! rolling frame masks), 5 and 6 (nonce masks), and 7, 8 and 13
//! (rfc 6455 framing). sockets, tls and the event loop stay outside;
//! the embedder pumps received bytes in and supplies a frame sink plus
//! hook implementations for everything coming back out.
//!
//! ```
//! use ws_endpoint::{Connection, PumpFlow, Role};
//! # use ws_endpoint::{frame::WriteKind, hooks::*, WsError};
//! # struct Sink;
//! # impl FrameSink for Sink {
//! #     fn write(&mut self, _b: &mut [u8], n: usize, _k: WriteKind) -> Result<usize, WsError> {
//! #         Ok(n)
//! #     }
//! # }
//! # struct Hooks;
//! # impl TransportHooks for Hooks {}
//! # impl HttpHooks for Hooks {}
//! # impl DataHooks for Hooks {}
//! # impl PollHooks for Hooks {}
//! # fn main() -> Result<(), WsError> {
//! let mut conn = Connection::new(0, Role::Server);
//! let mut sink = Sink;
//! let mut hooks = Hooks;
//! // feed whatever the socket produced, as often as it produces it
//! let flow = conn.pump(&mut sink, &mut hooks, Some(&b"GET /chat HTTP/1.1\r\n"[..]))?;
//! assert_eq!(flow, PumpFlow::Consumed);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// connection record, frame receive machine and packet pump
pub mod connection;
/// websocket error definitions
pub mod errors;
/// frame model and wire encoding
pub mod frame;
/// opening handshake byte parser
pub mod handshake;
/// seams to the embedder: sinks, hooks, extensions
pub mod hooks;
/// xor keystreams for payload unmasking
pub mod mask;
/// revision registry and handshake crypto helpers
pub mod protocol;

pub use connection::{ConnConfig, Connection, Phase, PumpFlow, MAX_USER_RX_BUFFER};
pub use errors::{ProtocolError, WsError};
pub use frame::{FrameHeader, OpCode, WriteKind, POST_PADDING, PRE_PADDING};
pub use handshake::{HandshakeParser, HeaderSet, Token};
pub use hooks::{
    DataHooks, Extension, FrameSink, HttpHooks, PollHooks, PollMode, SessionHooks, TransportHooks,
};

/// which side of the connection this endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// accepted the connection
    Server,
    /// initiated the connection
    Client,
}
