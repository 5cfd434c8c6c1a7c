//! seams between the endpoint core and its embedder
//!
//! the core never touches a socket or a poll set itself. everything it
//! needs from the outside world comes through these traits: an outbound
//! [`FrameSink`] for the control echoes it originates, hook traits (one
//! per callback family) for events it surfaces, and [`Extension`] for
//! per-frame payload interception. every hook defaults to a no-op, so
//! embedders implement only what they care about. a hook returning
//! `Err` tears the connection down.

use bytes::BytesMut;

use crate::errors::WsError;
use crate::frame::WriteKind;
use crate::handshake::HeaderSet;

/// poll interest kinds mirrored through the poll hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// readable interest
    Readable,
    /// writable interest
    Writable,
}

/// outbound frame writer
///
/// `buf` carries the payload at `PRE_PADDING..PRE_PADDING + len`, with
/// `POST_PADDING` spare bytes behind it, so implementations can frame
/// small payloads in place (see
/// [`encode_in_place`](crate::frame::encode_in_place)). implementations
/// must not re-enter the pump
pub trait FrameSink {
    /// emit one frame, or raw bytes for [`WriteKind::Http`]
    fn write(&mut self, buf: &mut [u8], len: usize, kind: WriteKind) -> Result<usize, WsError>;
}

/// connection lifecycle hooks
pub trait TransportHooks {
    /// server side handshake finished, frames may flow
    fn established(&mut self, fields: &HeaderSet) -> Result<(), WsError> {
        let _ = fields;
        Ok(())
    }

    /// client side handshake finished
    fn client_established(&mut self, fields: &HeaderSet) -> Result<(), WsError> {
        let _ = fields;
        Ok(())
    }

    /// the transport can accept another outbound frame (server side);
    /// raised by the embedder's write plumbing, never by the core
    fn server_writeable(&mut self) -> Result<(), WsError> {
        Ok(())
    }

    /// the transport can accept another outbound frame (client side)
    fn client_writeable(&mut self) -> Result<(), WsError> {
        Ok(())
    }

    /// a payload broadcast across the protocol's connections
    fn broadcast(&mut self, payload: &[u8]) -> Result<(), WsError> {
        let _ = payload;
        Ok(())
    }
}

/// plain http and connection admission hooks
pub trait HttpHooks {
    /// a complete non-upgrade request arrived; the embedder decides
    /// whether to serve a file or drop the peer
    fn http_request(&mut self, uri: &[u8], fields: &HeaderSet) -> Result<(), WsError> {
        let _ = (uri, fields);
        Ok(())
    }

    /// the embedder finished serving a file for an earlier request
    fn http_file_completion(&mut self) -> Result<(), WsError> {
        Ok(())
    }

    /// a transport connection was accepted; raised by the embedder
    /// before any bytes flow, an `Err` refuses the peer
    fn filter_network_connection(&mut self) -> Result<(), WsError> {
        Ok(())
    }

    /// the upgrade request is fully parsed; an `Err` rejects it before
    /// the connection is established
    fn filter_protocol_connection(&mut self, fields: &HeaderSet) -> Result<(), WsError> {
        let _ = fields;
        Ok(())
    }
}

/// user payload delivery hooks
pub trait DataHooks {
    /// a received chunk on a server side connection
    fn receive(&mut self, payload: &mut BytesMut) -> Result<(), WsError> {
        let _ = payload;
        Ok(())
    }

    /// a received chunk on a client side connection
    fn client_receive(&mut self, payload: &mut BytesMut) -> Result<(), WsError> {
        let _ = payload;
        Ok(())
    }
}

/// external poll set mirroring hooks
///
/// embedders that run their own event loop mirror fd interest through
/// these; the core raises the mode changes its flow control makes, and
/// the embedder's accept/close paths raise add and del themselves
pub trait PollHooks {
    /// a connection's fd should join the poll set
    fn add_poll_fd(&mut self) {}

    /// a connection's fd should leave the poll set
    fn del_poll_fd(&mut self) {}

    /// interest in `mode` should be asserted
    fn set_mode_poll_fd(&mut self, mode: PollMode) {
        let _ = mode;
    }

    /// interest in `mode` should be withdrawn
    fn clear_mode_poll_fd(&mut self, mode: PollMode) {
        let _ = mode;
    }
}

/// everything a connection needs from its embedder, in one bound
pub trait SessionHooks: TransportHooks + HttpHooks + DataHooks + PollHooks {}

impl<T: TransportHooks + HttpHooks + DataHooks + PollHooks> SessionHooks for T {}

/// per-frame payload interception, called in registration order
pub trait Extension {
    /// inspect or rewrite a data chunk before user delivery; an `Err`
    /// tears the connection down
    fn payload_rx(&mut self, payload: &mut BytesMut) -> Result<(), WsError> {
        let _ = payload;
        Ok(())
    }

    /// a frame with an opcode the core does not understand; return
    /// `Ok(true)` to claim it
    fn extended_payload_rx(&mut self, opcode: u8, payload: &mut BytesMut) -> Result<bool, WsError> {
        let _ = (opcode, payload);
        Ok(false)
    }
}
