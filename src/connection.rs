use bytes::BytesMut;
use tracing::{debug, error, trace, warn};

use crate::errors::{ProtocolError, WsError};
use crate::frame::{remap_legacy_opcode, FrameHeader, OpCode, PaddedBuf, WriteKind};
use crate::handshake::{HandshakeParser, HeaderSet, Token};
use crate::hooks::{Extension, FrameSink, PollMode, SessionHooks};
use crate::mask::{derive_rolling_key, Keystream};
use crate::protocol::revision_supported;
use crate::Role;

/// ceiling at which an accumulating payload is spilled to the user
/// even though the frame has more to come
pub const MAX_USER_RX_BUFFER: usize = 4096;

/// connection lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// still consuming the opening http exchange
    HandshakeParsing,
    /// framing is live in both directions
    Established,
    /// we sent a close and are waiting for the peer's acknowledgement
    AwaitingCloseAck,
    /// the peer closed first and we already echoed it
    ReturnedCloseAlready,
}

/// frame receive sub-state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    New,
    /// saw 0xff on a hixie-76 stream, a 0x00 completes the close
    LegacyCloseSeen,
    /// hixie-76 text body, runs until the 0xff terminator
    LegacyText,
    /// hixie-76 binary length prefix; nothing emits these frames, the
    /// state only exists so the stream stalls rather than misparses
    #[allow(dead_code)]
    LegacyLength,
    /// collecting byte 1..=3 of the draft 4..6 frame nonce
    MaskNonce(u8),
    HdrByte1,
    HdrLen,
    HdrLen16Hi,
    HdrLen16Lo,
    /// 64 bit length, counting the remaining bytes 8 down to 1
    HdrLen64(u8),
    /// collecting byte 1..=4 of the v7+ mask key
    CollectMask(u8),
    Payload,
}

/// pump outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpFlow {
    /// every input byte reached the state machines
    Consumed,
    /// the consumer is not ready; leftover bytes were captured and a
    /// new rxflow state is in force
    Throttled,
}

/// per-connection tuning
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnConfig {
    /// skip mask derivation and unmasking entirely; for test rigs
    /// that send unmasked client frames
    pub defeat_client_mask: bool,
}

#[derive(Debug)]
struct RxFlow {
    buf: BytesMut,
    pos: usize,
}

/// per-peer connection state record
///
/// owns both byte-driven state machines and every buffer they touch.
/// the record is single-threaded by contract: at most one thread pumps
/// a given connection at a time, and the sink it writes control echoes
/// through must not re-enter the pump
pub struct Connection {
    revision: u8,
    role: Role,
    config: ConnConfig,
    phase: Phase,
    parser: HandshakeParser,
    handshake_dispatched: bool,
    rx_state: RxState,
    frame: FrameHeader,
    nonce: [u8; 4],
    all_zero_nonce: bool,
    keystream: Keystream,
    session_mask_key: [u8; 20],
    remaining: u64,
    rx: PaddedBuf,
    rxflow: Option<RxFlow>,
    rx_ready: bool,
    pings_outstanding: i32,
    extensions: Vec<Box<dyn Extension>>,
}

impl Connection {
    /// record for a freshly accepted transport connection, handshake
    /// still to come
    ///
    /// servers usually pass revision 0 here; the revision the peer
    /// actually speaks is adopted from its version header when the
    /// handshake completes
    pub fn new(revision: u8, role: Role) -> Self {
        Self::with_config(revision, role, ConnConfig::default())
    }

    /// like [`new`](Self::new) with explicit tuning
    pub fn with_config(revision: u8, role: Role, config: ConnConfig) -> Self {
        Self {
            revision,
            role,
            config,
            phase: Phase::HandshakeParsing,
            parser: HandshakeParser::new(role, revision),
            handshake_dispatched: false,
            rx_state: RxState::New,
            frame: FrameHeader::default(),
            nonce: [0; 4],
            all_zero_nonce: false,
            keystream: Keystream::Identity,
            session_mask_key: [0; 20],
            remaining: 0,
            rx: PaddedBuf::with_capacity(MAX_USER_RX_BUFFER),
            rxflow: None,
            rx_ready: true,
            pings_outstanding: 0,
            extensions: Vec::new(),
        }
    }

    /// record for a connection whose handshake already happened
    /// elsewhere; framing starts with the first pumped byte
    pub fn after_handshake(revision: u8, role: Role) -> Self {
        let mut conn = Self::new(revision, role);
        conn.phase = Phase::Established;
        conn.handshake_dispatched = true;
        conn
    }

    /// draft revision in force
    pub fn revision(&self) -> u8 {
        self.revision
    }

    /// current lifecycle phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// header slots captured during the handshake
    pub fn handshake_fields(&self) -> &HeaderSet {
        self.parser.fields()
    }

    /// header of the frame currently being received
    pub fn frame(&self) -> &FrameHeader {
        &self.frame
    }

    /// payload bytes still to come before the current frame completes
    pub fn remaining_payload(&self) -> u64 {
        self.remaining
    }

    /// pings sent that have not seen their pong yet
    pub fn pings_outstanding(&self) -> i32 {
        self.pings_outstanding
    }

    /// register a payload extension; hooks run in registration order
    pub fn register_extension(&mut self, ext: Box<dyn Extension>) {
        self.extensions.push(ext);
    }

    /// install the draft 4 connection masking key computed at
    /// handshake time; frame keys are derived from it
    pub fn set_session_mask_key(&mut self, key: [u8; 20]) {
        self.session_mask_key = key;
    }

    /// mirror of the poll set's readable interest for this connection;
    /// the embedder clears it to assert back-pressure
    pub fn set_rx_ready(&mut self, ready: bool) {
        self.rx_ready = ready;
    }

    /// whether the consumer currently accepts bytes
    pub fn rx_ready(&self) -> bool {
        self.rx_ready
    }

    /// whether captured bytes are waiting behind back-pressure
    pub fn has_rxflow(&self) -> bool {
        self.rxflow.is_some()
    }

    /// note that our side sent a close frame and now awaits the ack
    pub fn mark_close_sent(&mut self) {
        self.phase = Phase::AwaitingCloseAck;
    }

    /// note that our side sent a ping
    pub fn note_ping_sent(&mut self) {
        self.pings_outstanding += 1;
    }

    /// feed a received tcp segment, or drain the captured rxflow
    /// buffer when `input` is `None`
    ///
    /// bytes go to the handshake parser or the frame machine one at a
    /// time depending on phase. before each byte the consumer-ready
    /// bit is honored: when clear, the remainder is captured and
    /// [`PumpFlow::Throttled`] tells the caller a new rxflow state is
    /// in force. fatal results mean the connection must be dropped
    pub fn pump<W, H>(
        &mut self,
        sink: &mut W,
        hooks: &mut H,
        input: Option<&[u8]>,
    ) -> Result<PumpFlow, WsError>
    where
        W: FrameSink,
        H: SessionHooks,
    {
        match input {
            Some(bytes) => {
                let had_spill = self.rxflow.is_some();
                if had_spill {
                    error!("pump fed fresh input while an rxflow buffer is pending, data loss");
                }
                self.run(sink, hooks, bytes, 0, had_spill)
            }
            None => {
                let Some(flow) = self.rxflow.take() else {
                    return Ok(PumpFlow::Consumed);
                };
                debug!(
                    len = flow.buf.len(),
                    pos = flow.pos,
                    "draining stored rxflow buffer"
                );
                // act as if the consumer already allows input again
                self.rx_ready = true;
                hooks.set_mode_poll_fd(PollMode::Readable);
                let buf = flow.buf;
                self.run(sink, hooks, &buf, flow.pos, true)
            }
        }
    }

    fn run<W, H>(
        &mut self,
        sink: &mut W,
        hooks: &mut H,
        bytes: &[u8],
        start: usize,
        had_spill: bool,
    ) -> Result<PumpFlow, WsError>
    where
        W: FrameSink,
        H: SessionHooks,
    {
        let mut n = start;
        while n < bytes.len() {
            if !self.rx_ready {
                match self.rxflow.as_mut() {
                    Some(flow) => {
                        debug!("re-using rxflow input buffer");
                        flow.pos = n;
                    }
                    None => {
                        debug!(len = bytes.len() - n, "new rxflow input buffer");
                        self.rxflow = Some(RxFlow {
                            buf: BytesMut::from(&bytes[n..]),
                            pos: 0,
                        });
                    }
                }
                return Ok(PumpFlow::Throttled);
            }
            self.feed_byte(sink, hooks, bytes[n])?;
            n += 1;
        }
        if had_spill {
            debug!("rxflow buffer drained, clearing");
            self.rxflow = None;
            self.rx_ready = false;
            hooks.clear_mode_poll_fd(PollMode::Readable);
        }
        Ok(PumpFlow::Consumed)
    }

    fn feed_byte<W, H>(&mut self, sink: &mut W, hooks: &mut H, c: u8) -> Result<(), WsError>
    where
        W: FrameSink,
        H: SessionHooks,
    {
        if self.phase == Phase::HandshakeParsing {
            self.parser.feed(c);
            if self.parser.is_complete() && !self.handshake_dispatched {
                self.handshake_dispatched = true;
                self.dispatch_handshake(hooks)?;
            }
            return Ok(());
        }
        self.rx_byte(sink, hooks, c)
    }

    fn dispatch_handshake<H>(&mut self, hooks: &mut H) -> Result<(), WsError>
    where
        H: SessionHooks,
    {
        if self.parser.fields().len(Token::Upgrade) == 0 {
            // plain http request, hand it to the embedder to serve
            let fields = self.parser.fields();
            let uri = fields.get(Token::GetUri).unwrap_or_default();
            return hooks.http_request(uri, fields);
        }
        match self.role {
            Role::Server => {
                hooks.filter_protocol_connection(self.parser.fields())?;
                // the peer's version header names the draft in force
                let version = self.parser.fields().version();
                if version > 0 {
                    let adopted = version.clamp(0, 255) as u8;
                    if !revision_supported(adopted) {
                        warn!(revision = adopted, "peer requested a revision we cannot frame");
                    }
                    self.revision = adopted;
                }
                self.phase = Phase::Established;
                hooks.established(self.parser.fields())
            }
            Role::Client => {
                self.phase = Phase::Established;
                hooks.client_established(self.parser.fields())
            }
        }
    }

    fn rx_byte<W, H>(&mut self, sink: &mut W, hooks: &mut H, c: u8) -> Result<(), WsError>
    where
        W: FrameSink,
        H: SessionHooks,
    {
        match self.rx_state {
            RxState::New => {
                if !revision_supported(self.revision) {
                    warn!(revision = self.revision, "refusing byte for unknown revision");
                    return Ok(());
                }
                match self.revision {
                    0 => {
                        // hixie-76 sentinel framing
                        if c == 0xff {
                            self.rx_state = RxState::LegacyCloseSeen;
                        }
                        if c == 0 {
                            self.rx_state = RxState::LegacyText;
                            self.rx.clear();
                        }
                        Ok(())
                    }
                    4..=6 => {
                        self.all_zero_nonce = c == 0;
                        self.nonce[0] = c;
                        self.rx_state = RxState::MaskNonce(1);
                        Ok(())
                    }
                    _ => {
                        // v7 and up, no prepended frame nonce any more
                        self.all_zero_nonce = true;
                        self.first_header_byte(c)
                    }
                }
            }
            RxState::MaskNonce(i) => {
                self.nonce[i as usize] = c;
                if c != 0 {
                    self.all_zero_nonce = false;
                }
                if i < 3 {
                    self.rx_state = RxState::MaskNonce(i + 1);
                } else {
                    self.finish_nonce();
                }
                Ok(())
            }
            RxState::HdrByte1 => self.first_header_byte(c),
            RxState::HdrLen => {
                let c = self.premask(c);
                if c & 0x80 != 0 && self.revision < 7 {
                    warn!("reserved length bit set before v7");
                    return Err(ProtocolError::ReservedBitsSet(c).into());
                }
                self.frame.masked = c & 0x80 != 0;
                match c & 0x7f {
                    126 => {
                        self.control_length_guard(126)?;
                        self.rx_state = RxState::HdrLen16Hi;
                        Ok(())
                    }
                    127 => {
                        self.control_length_guard(127)?;
                        self.rx_state = RxState::HdrLen64(8);
                        Ok(())
                    }
                    len => {
                        self.frame.payload_len = u64::from(len);
                        self.begin_payload(sink, hooks)
                    }
                }
            }
            RxState::HdrLen16Hi => {
                let c = self.premask(c);
                self.frame.payload_len = u64::from(c) << 8;
                self.rx_state = RxState::HdrLen16Lo;
                Ok(())
            }
            RxState::HdrLen16Lo => {
                let c = self.premask(c);
                self.frame.payload_len |= u64::from(c);
                self.begin_payload(sink, hooks)
            }
            RxState::HdrLen64(i) => {
                let c = self.premask(c);
                if i == 8 {
                    if c & 0x80 != 0 {
                        warn!("bit 63 of a 64 bit length must be zero");
                        return Err(ProtocolError::LengthHighBitSet.into());
                    }
                    self.frame.payload_len = 0;
                }
                self.frame.payload_len |= u64::from(c) << ((i - 1) * 8);
                if i > 1 {
                    self.rx_state = RxState::HdrLen64(i - 1);
                    Ok(())
                } else {
                    self.begin_payload(sink, hooks)
                }
            }
            RxState::CollectMask(i) => {
                self.nonce[(i - 1) as usize] = c;
                if c != 0 {
                    self.all_zero_nonce = false;
                }
                if i < 4 {
                    self.rx_state = RxState::CollectMask(i + 1);
                    return Ok(());
                }
                self.keystream = if self.config.defeat_client_mask {
                    Keystream::Identity
                } else {
                    Keystream::Nonce {
                        key: self.nonce,
                        idx: 0,
                    }
                };
                self.start_payload(sink, hooks)
            }
            RxState::Payload => {
                let b = if self.revision < 4 || (self.all_zero_nonce && self.revision >= 5) {
                    c
                } else {
                    self.keystream.apply(c)
                };
                self.rx.push(b);
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.rx_state = RxState::New;
                    return self.spill(sink, hooks);
                }
                if self.rx.fill() == MAX_USER_RX_BUFFER {
                    // built-in buffer limit, hand up what we have and
                    // keep collecting the rest of the frame
                    return self.spill(sink, hooks);
                }
                Ok(())
            }
            RxState::LegacyText => {
                if c == 0xff {
                    self.rx_state = RxState::New;
                    return self.deliver(hooks);
                }
                self.rx.push(c);
                if self.rx.fill() == MAX_USER_RX_BUFFER {
                    return self.deliver(hooks);
                }
                Ok(())
            }
            RxState::LegacyCloseSeen => {
                if c != 0 {
                    return Ok(());
                }
                debug!("peer is requesting a v76 close, sending ack");
                let mut ack = PaddedBuf::with_capacity(2);
                ack.extend_from_slice(&[0xff, 0x00]);
                if let Err(e) = sink.write(ack.for_sink(), 2, WriteKind::Http) {
                    warn!("error writing v76 close ack: {e}");
                }
                // the ack is out, parent closes the socket
                Err(WsError::ConnectionClosed)
            }
            RxState::LegacyLength => Ok(()),
        }
    }

    /// the keystream covers the header bytes themselves before v7
    fn premask(&mut self, c: u8) -> u8 {
        if self.revision < 7 {
            self.keystream.apply(c)
        } else {
            c
        }
    }

    /// end of the draft 4..6 frame nonce: fix the frame keystream
    fn finish_nonce(&mut self) {
        self.rx_state = RxState::HdrByte1;
        if self.config.defeat_client_mask {
            self.keystream = Keystream::Identity;
            return;
        }
        if self.revision > 4 {
            self.keystream = Keystream::Nonce {
                key: self.nonce,
                idx: 0,
            };
            return;
        }
        // draft 4 recirculates a sha1 of the frame nonce and the
        // connection masking key, one hash per incoming frame
        let key = derive_rolling_key(&self.nonce, &self.session_mask_key);
        self.keystream = Keystream::Rolling { key, idx: 0 };
    }

    fn first_header_byte(&mut self, c: u8) -> Result<(), WsError> {
        let c = self.premask(c);
        if self.revision < 7 {
            self.frame.opcode = remap_legacy_opcode(c & 0xf).map_err(|e| {
                warn!("reserved opcodes are not usable before v7");
                e
            })?;
        } else {
            self.frame.opcode = c & 0xf;
        }
        self.frame.rsv = c & 0x70;
        self.frame.fin = c & 0x80 != 0;
        self.rx_state = RxState::HdrLen;
        Ok(())
    }

    /// control frames may not ask for extended lengths
    fn control_length_guard(&self, code: u8) -> Result<(), WsError> {
        if self.frame.opcode & 8 != 0 {
            warn!("control frame asking for extended length");
            return Err(ProtocolError::ControlFrameTooBig(code).into());
        }
        Ok(())
    }

    fn begin_payload<W, H>(&mut self, sink: &mut W, hooks: &mut H) -> Result<(), WsError>
    where
        W: FrameSink,
        H: SessionHooks,
    {
        self.remaining = self.frame.payload_len;
        if self.frame.masked {
            self.rx_state = RxState::CollectMask(1);
            return Ok(());
        }
        self.start_payload(sink, hooks)
    }

    fn start_payload<W, H>(&mut self, sink: &mut W, hooks: &mut H) -> Result<(), WsError>
    where
        W: FrameSink,
        H: SessionHooks,
    {
        self.rx_state = RxState::Payload;
        if self.remaining == 0 {
            // empty frame, nothing more arrives for it
            self.rx_state = RxState::New;
            return self.spill(sink, hooks);
        }
        Ok(())
    }

    /// a complete (sub-)payload is ready: service control frames here,
    /// hand real data up to the user callback
    fn spill<W, H>(&mut self, sink: &mut W, hooks: &mut H) -> Result<(), WsError>
    where
        W: FrameSink,
        H: SessionHooks,
    {
        trace!(opcode = self.frame.opcode, len = self.rx.fill(), "spill");
        match OpCode::from_u8(self.frame.opcode) {
            Some(OpCode::Close) => {
                if self.phase == Phase::AwaitingCloseAck {
                    // the peer is acknowledging our close, finish ours
                    debug!("seen close ack");
                    return Err(WsError::ConnectionClosed);
                }
                debug!("peer close, echoing the payload back");
                let fill = self.rx.fill();
                if let Err(e) = sink.write(self.rx.for_sink(), fill, WriteKind::Close) {
                    debug!("write of close ack failed: {e}");
                }
                self.rx.clear();
                self.phase = Phase::ReturnedCloseAlready;
                Err(WsError::ConnectionClosed)
            }
            Some(OpCode::Ping) => {
                debug!(len = self.rx.fill(), "received ping, sending pong");
                let fill = self.rx.fill();
                if let Err(e) = sink.write(self.rx.for_sink(), fill, WriteKind::Pong) {
                    debug!("write of pong failed: {e}");
                }
                self.rx.clear();
                Ok(())
            }
            Some(OpCode::Pong) => {
                self.pings_outstanding -= 1;
                self.rx.clear();
                Ok(())
            }
            Some(OpCode::Continue | OpCode::Text | OpCode::Binary) => self.deliver_data(hooks),
            None => self.offer_extensions(hooks),
        }
    }

    /// run the extension chain, then the user data callback
    fn deliver_data<H>(&mut self, hooks: &mut H) -> Result<(), WsError>
    where
        H: SessionHooks,
    {
        let mut chunk = self.rx.take();
        for ext in &mut self.extensions {
            if let Err(e) = ext.payload_rx(&mut chunk) {
                warn!("extension failed to handle payload: {e}");
                return Err(e);
            }
        }
        if chunk.is_empty() {
            return Ok(());
        }
        match self.role {
            Role::Server => hooks.receive(&mut chunk),
            Role::Client => hooks.client_receive(&mut chunk),
        }
    }

    /// an opcode the core does not understand: let the extensions
    /// have a look, otherwise drop the frame
    fn offer_extensions<H>(&mut self, _hooks: &mut H) -> Result<(), WsError>
    where
        H: SessionHooks,
    {
        debug!(opcode = self.frame.opcode, "passing opcode up to extensions");
        let mut chunk = self.rx.take();
        let mut handled = false;
        for ext in &mut self.extensions {
            if ext.extended_payload_rx(self.frame.opcode, &mut chunk)? {
                handled = true;
            }
        }
        if !handled {
            debug!(
                opcode = self.frame.opcode,
                "unhandled extended opcode, dropping frame"
            );
        }
        Ok(())
    }

    /// hixie-76 text delivery, no opcode dispatch involved
    fn deliver<H>(&mut self, hooks: &mut H) -> Result<(), WsError>
    where
        H: SessionHooks,
    {
        let mut chunk = self.rx.take();
        match self.role {
            Role::Server => hooks.receive(&mut chunk),
            Role::Client => hooks.client_receive(&mut chunk),
        }
    }
}
