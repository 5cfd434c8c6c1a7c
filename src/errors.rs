use thiserror::Error;

/// errors during handshake, frame receive and pump
#[derive(Debug, Error)]
pub enum WsError {
    /// io error bubbled up from a frame sink
    #[error("io error {0:?}")]
    IOError(Box<dyn std::error::Error + Send + Sync>),
    /// the opening handshake could not be completed
    #[error("{0}")]
    HandShakeFailed(String),
    /// wire framing violation, connection must close without a close frame
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
    /// the peer closed, or acknowledged our close
    #[error("connection closed by peer")]
    ConnectionClosed,
    /// a hook asked for this connection to be torn down
    #[error("hook requested connection termination")]
    Terminated,
    /// the frame header does not fit the buffer headroom
    #[error("header too large for in-place framing")]
    HeadroomExceeded,
}

impl From<std::io::Error> for WsError {
    fn from(e: std::io::Error) -> Self {
        WsError::IOError(Box::new(e))
    }
}

/// errors while decoding frames from wire bytes
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// opcode nibble outside the pre-v7 opcode space
    #[error("invalid opcode {0}")]
    InvalidOpcode(u8),
    /// length byte carries the reserved high bit before v7
    #[error("reserved bit set in length byte {0:b}")]
    ReservedBitsSet(u8),
    /// bit 63 of a 64 bit payload length must be zero
    #[error("64 bit length high bit set")]
    LengthHighBitSet,
    /// control frame asked for an extended length
    #[error("control frame is too big, length code {0}")]
    ControlFrameTooBig(u8),
}
