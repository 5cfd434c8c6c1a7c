use bytes::{BufMut, BytesMut};
use tracing::{debug, trace};

use crate::Role;

/// identities of the headers the parser knows, order significant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// request line target, also fed by unknown methods
    GetUri,
    /// `Host`
    Host,
    /// `Connection`
    Connection,
    /// legacy `Sec-WebSocket-Key1`
    Key1,
    /// legacy `Sec-WebSocket-Key2`
    Key2,
    /// `Sec-WebSocket-Protocol`
    Protocol,
    /// `Upgrade`
    Upgrade,
    /// `Origin`
    Origin,
    /// legacy `Sec-WebSocket-Draft`
    Draft,
    /// the post-header challenge payload of the hixie drafts
    Challenge,
    /// `Sec-WebSocket-Key`
    Key,
    /// `Sec-WebSocket-Version`
    Version,
    /// `Sec-WebSocket-Origin`, folded onto [`Token::Origin`] on match
    SwOrigin,
    /// `Sec-WebSocket-Extensions`
    Extensions,
    /// `Sec-WebSocket-Accept`
    Accept,
    /// legacy `Sec-WebSocket-Nonce`
    Nonce,
    /// response status line remainder
    Http,
    /// multiplexing url slot, never matched from the wire
    MuxUrl,
}

/// number of header slots a connection carries
pub const TOKEN_COUNT: usize = 18;

const TOKENS: [Token; TOKEN_COUNT] = [
    Token::GetUri,
    Token::Host,
    Token::Connection,
    Token::Key1,
    Token::Key2,
    Token::Protocol,
    Token::Upgrade,
    Token::Origin,
    Token::Draft,
    Token::Challenge,
    Token::Key,
    Token::Version,
    Token::SwOrigin,
    Token::Extensions,
    Token::Accept,
    Token::Nonce,
    Token::Http,
    Token::MuxUrl,
];

/// literal names matched case-insensitively against incoming bytes;
/// the bare crlf entry doubles as the end-of-headers detector
const TOKEN_NAMES: [&[u8]; TOKEN_COUNT] = [
    b"GET ",
    b"Host:",
    b"Connection:",
    b"Sec-WebSocket-Key1:",
    b"Sec-WebSocket-Key2:",
    b"Sec-WebSocket-Protocol:",
    b"Upgrade:",
    b"Origin:",
    b"Sec-WebSocket-Draft:",
    b"\x0d\x0a",
    b"Sec-WebSocket-Key:",
    b"Sec-WebSocket-Version:",
    b"Sec-WebSocket-Origin:",
    b"Sec-WebSocket-Extensions:",
    b"Sec-WebSocket-Accept:",
    b"Sec-WebSocket-Nonce:",
    b"HTTP/1.1 ",
    b"",
];

const NAME_BUFFER_LEN: usize = 64;
const INITIAL_HDR_ALLOC: usize = 256;
const MAX_HEADER_LEN: usize = 1024;
const OVERSIZE_SENTINEL: &[u8] = b"!!! Length exceeded maximum supported !!!";

/// per-connection header slots, one owned buffer per known token
#[derive(Debug)]
pub struct HeaderSet {
    slots: [Option<BytesMut>; TOKEN_COUNT],
}

impl Default for HeaderSet {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }
}

impl HeaderSet {
    /// stored value for a token, `None` while the header is unseen
    pub fn get(&self, token: Token) -> Option<&[u8]> {
        self.slots[token as usize].as_deref()
    }

    /// stored value length, zero when the header is unseen
    pub fn len(&self, token: Token) -> usize {
        self.get(token).map(<[u8]>::len).unwrap_or_default()
    }

    /// whether nothing has been captured yet
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// the `Sec-WebSocket-Version` value as an integer
    ///
    /// leading ascii digits only, junk tail ignored, zero when absent
    pub fn version(&self) -> i32 {
        let Some(value) = self.get(Token::Version) else {
            return 0;
        };
        let mut n: i32 = 0;
        for &b in value {
            if !b.is_ascii_digit() {
                break;
            }
            n = n.saturating_mul(10).saturating_add(i32::from(b - b'0'));
        }
        n
    }

    fn slot_mut(&mut self, token: Token) -> &mut Option<BytesMut> {
        &mut self.slots[token as usize]
    }

    fn open(&mut self, token: Token) -> &mut BytesMut {
        self.slots[token as usize]
            .get_or_insert_with(|| BytesMut::with_capacity(INITIAL_HDR_ALLOC))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    NamePart,
    Collecting(Token),
    Skipping,
    SkippingSawCr,
    Complete,
}

/// byte-wise parser for the opening http upgrade exchange
///
/// consumes exactly one byte per call and never reads ahead, so the
/// transport may fragment the handshake arbitrarily. known header
/// names are matched case-insensitively against a fixed table; values
/// accumulate into per-header buffers up to a ceiling, past which the
/// slot is demoted to a sentinel string and the rest of the line is
/// dropped
#[derive(Debug)]
pub struct HandshakeParser {
    state: ParserState,
    name_buf: [u8; NAME_BUFFER_LEN],
    name_len: usize,
    fields: HeaderSet,
    role: Role,
    revision: u8,
}

impl HandshakeParser {
    /// parser for one side of a fresh connection
    ///
    /// `revision` is the draft the endpoint itself speaks; it matters
    /// on the client side, where the reply carries no version header
    pub fn new(role: Role, revision: u8) -> Self {
        Self {
            state: ParserState::NamePart,
            name_buf: [0; NAME_BUFFER_LEN],
            name_len: 0,
            fields: HeaderSet::default(),
            role,
            revision,
        }
    }

    /// whether enough of the handshake has arrived
    pub fn is_complete(&self) -> bool {
        self.state == ParserState::Complete
    }

    /// captured header slots
    pub fn fields(&self) -> &HeaderSet {
        &self.fields
    }

    /// consume one handshake byte
    pub fn feed(&mut self, c: u8) {
        match self.state {
            ParserState::Collecting(token) => self.collect_value(token, c),
            ParserState::NamePart => self.match_name(c),
            ParserState::Skipping => {
                if c == b'\r' {
                    self.state = ParserState::SkippingSawCr;
                }
            }
            ParserState::SkippingSawCr => {
                self.state = if c == b'\n' {
                    ParserState::NamePart
                } else {
                    ParserState::Skipping
                };
                self.name_len = 0;
            }
            ParserState::Complete => trace!("handshake already complete, byte ignored"),
        }
    }

    fn collect_value(&mut self, token: Token, c: u8) {
        let value = self.fields.open(token);

        // leading spaces vanish while the value is still empty
        if value.is_empty() && c == b' ' {
            return;
        }

        // the request target ends at the first space
        if token == Token::GetUri && c == b' ' {
            self.state = ParserState::Skipping;
            return;
        }

        if value.len() == MAX_HEADER_LEN {
            debug!("header value over {MAX_HEADER_LEN} bytes, demoting to sentinel");
            value.clear();
            value.extend_from_slice(OVERSIZE_SENTINEL);
            self.state = ParserState::Skipping;
            return;
        }

        if token != Token::Challenge && c == b'\r' {
            self.state = ParserState::SkippingSawCr;
            return;
        }

        value.put_u8(c);

        if token == Token::Challenge {
            self.challenge_progress();
        }
    }

    /// per-revision end of handshake management while the challenge
    /// slot is collecting
    fn challenge_progress(&mut self) {
        let have_version = self.fields.len(Token::Version) > 0;
        let version = self.fields.version();
        let got = self.fields.len(Token::Challenge);

        // hixie-76 carries no version header: the server waits for an
        // 8 byte challenge, the client for a 16 byte one
        if !have_version && self.role == Role::Server && got != 8 {
            return;
        }
        if !have_version && self.role == Role::Client && got != 16 {
            return;
        }

        // drafts up to 03 kept the version header and the 8 byte payload
        if have_version && version < 4 && got != 8 {
            return;
        }

        // no payload challenge from draft 01 on
        if have_version && version > 0 {
            *self.fields.slot_mut(Token::Challenge) = None;
        }

        trace!("handshake complete");
        self.state = ParserState::Complete;
    }

    fn match_name(&mut self, c: u8) {
        if self.name_len == NAME_BUFFER_LEN {
            // name bigger than anything we can match, skip the line
            self.state = ParserState::Skipping;
            return;
        }
        self.name_buf[self.name_len] = c;
        self.name_len += 1;
        let name = &self.name_buf[..self.name_len];

        let mut matched = None;
        for (n, literal) in TOKEN_NAMES.iter().enumerate() {
            if literal.len() != self.name_len {
                continue;
            }
            if !literal.eq_ignore_ascii_case(name) {
                continue;
            }
            matched = Some(TOKENS[n]);
            break;
        }

        if let Some(mut token) = matched {
            trace!(?token, "known header");

            // protocol equivalent of origin, some stacks send it
            if token == Token::SwOrigin {
                token = Token::Origin;
            }

            self.state = ParserState::Collecting(token);
            // slot creation is idempotent, a re-seen header appends
            self.fields.open(token);

            if token == Token::Challenge {
                self.headers_ended();
            }
            return;
        }

        // a colon means the name is one we do not know
        if c == b':' {
            debug!("skipping unknown header");
            self.state = ParserState::Skipping;
            return;
        }

        // a space with no target captured yet is an unknown http
        // method; keep the request target anyway
        if c == b' ' && self.fields.len(Token::GetUri) == 0 {
            debug!("unknown method");
            self.state = ParserState::Collecting(Token::GetUri);
            self.fields.open(Token::GetUri);
        }
    }

    /// a bare crlf matched in name position: the header block is over
    fn headers_ended(&mut self) {
        // no upgrade header, these are plain http headers
        if self.fields.len(Token::Upgrade) == 0 {
            debug!("headers ended without upgrade, plain http request");
            self.state = ParserState::Complete;
            return;
        }

        // draft 04 and up carry no payload after the header block
        if self.fields.len(Token::Version) > 0 && self.fields.version() >= 4 {
            trace!("04 header completed");
            self.state = ParserState::Complete;
            *self.fields.slot_mut(Token::Challenge) = None;
            return;
        }

        // client side: the reply has no version header but the draft
        // in force is already known
        if self.revision >= 4 {
            trace!("04 header completed");
            self.state = ParserState::Complete;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut HandshakeParser, bytes: &[u8]) {
        for &c in bytes {
            parser.feed(c);
        }
    }

    fn server_parser() -> HandshakeParser {
        HandshakeParser::new(Role::Server, 0)
    }

    const V13_REQUEST: &[u8] = b"GET /chat HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
        Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    #[test]
    fn v13_request_completes_with_slots_populated() {
        let mut parser = server_parser();
        feed_all(&mut parser, V13_REQUEST);
        assert!(parser.is_complete());

        let fields = parser.fields();
        assert_eq!(fields.get(Token::GetUri).unwrap(), b"/chat");
        assert_eq!(fields.get(Token::Host).unwrap(), b"x");
        assert_eq!(fields.get(Token::Upgrade).unwrap(), b"websocket");
        assert_eq!(fields.get(Token::Connection).unwrap(), b"Upgrade");
        assert_eq!(
            fields.get(Token::Key).unwrap(),
            b"dGhlIHNhbXBsZSBub25jZQ=="
        );
        assert_eq!(fields.version(), 13);
        assert_eq!(fields.len(Token::Challenge), 0);
    }

    #[test]
    fn name_matching_is_case_insensitive() {
        for request in [
            &b"GET / HTTP/1.1\r\nhost: a\r\n"[..],
            &b"GET / HTTP/1.1\r\nHOST: a\r\n"[..],
            &b"GET / HTTP/1.1\r\nHoSt: a\r\n"[..],
        ] {
            let mut parser = server_parser();
            feed_all(&mut parser, request);
            assert_eq!(parser.fields().get(Token::Host).unwrap(), b"a");
        }
    }

    #[test]
    fn repeated_headers_append_to_one_slot() {
        let mut parser = server_parser();
        feed_all(&mut parser, b"GET / HTTP/1.1\r\nHost: x\r\nHost: y\r\n");
        assert_eq!(parser.fields().get(Token::Host).unwrap(), b"xy");
    }

    #[test]
    fn leading_spaces_are_swallowed() {
        let mut parser = server_parser();
        feed_all(&mut parser, b"GET / HTTP/1.1\r\nHost:     spaced\r\n");
        assert_eq!(parser.fields().get(Token::Host).unwrap(), b"spaced");
    }

    #[test]
    fn unknown_headers_are_skipped() {
        let mut parser = server_parser();
        feed_all(
            &mut parser,
            b"GET / HTTP/1.1\r\nX-Custom: nope\r\nHost: kept\r\n",
        );
        assert_eq!(parser.fields().get(Token::Host).unwrap(), b"kept");
    }

    #[test]
    fn sec_websocket_origin_folds_onto_origin() {
        let mut parser = server_parser();
        feed_all(
            &mut parser,
            b"GET / HTTP/1.1\r\nSec-WebSocket-Origin: http://a\r\n",
        );
        assert_eq!(parser.fields().get(Token::Origin).unwrap(), b"http://a");
    }

    #[test]
    fn unknown_method_still_captures_the_target() {
        let mut parser = server_parser();
        feed_all(&mut parser, b"POST /form HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(parser.fields().get(Token::GetUri).unwrap(), b"/form");
    }

    #[test]
    fn oversize_value_demotes_to_sentinel() {
        let mut parser = server_parser();
        feed_all(&mut parser, b"GET / HTTP/1.1\r\nHost: ");
        for _ in 0..MAX_HEADER_LEN + 10 {
            parser.feed(b'a');
        }
        feed_all(&mut parser, b"\r\nUpgrade: websocket\r\n");
        let fields = parser.fields();
        assert_eq!(fields.get(Token::Host).unwrap(), OVERSIZE_SENTINEL);
        // parsing keeps going after the demotion
        assert_eq!(fields.get(Token::Upgrade).unwrap(), b"websocket");
    }

    #[test]
    fn plain_http_request_completes_at_header_end() {
        let mut parser = server_parser();
        feed_all(&mut parser, b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(parser.is_complete());
        assert_eq!(parser.fields().len(Token::Upgrade), 0);
    }

    #[test]
    fn v76_server_challenge_is_eight_bytes() {
        let mut parser = server_parser();
        feed_all(
            &mut parser,
            b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: WebSocket\r\n\
              Sec-WebSocket-Key1: 4 @1  46546xW%0l 1 5\r\n\
              Sec-WebSocket-Key2: 12998 5 Y3 1  .P00\r\n\r\n",
        );
        assert!(!parser.is_complete());
        feed_all(&mut parser, b"1234567");
        assert!(!parser.is_complete());
        parser.feed(b'8');
        assert!(parser.is_complete());
        assert_eq!(parser.fields().get(Token::Challenge).unwrap(), b"12345678");
    }

    #[test]
    fn v76_client_challenge_is_sixteen_bytes() {
        let mut parser = HandshakeParser::new(Role::Client, 0);
        feed_all(
            &mut parser,
            b"HTTP/1.1 101 WebSocket Protocol Handshake\r\n\
              Upgrade: WebSocket\r\nConnection: Upgrade\r\n\r\n",
        );
        assert!(!parser.is_complete());
        feed_all(&mut parser, &[0xaa; 15]);
        assert!(!parser.is_complete());
        parser.feed(0xbb);
        assert!(parser.is_complete());
        assert_eq!(parser.fields().len(Token::Challenge), 16);
    }

    #[test]
    fn client_side_completes_without_version_header() {
        let mut parser = HandshakeParser::new(Role::Client, 13);
        feed_all(
            &mut parser,
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n",
        );
        assert!(parser.is_complete());
        assert_eq!(
            parser.fields().get(Token::Http).unwrap(),
            b"101 Switching Protocols"
        );
        assert_eq!(
            parser.fields().get(Token::Accept).unwrap(),
            b"s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn bytes_after_completion_are_ignored() {
        let mut parser = server_parser();
        feed_all(&mut parser, V13_REQUEST);
        assert!(parser.is_complete());
        feed_all(&mut parser, b"garbage after the handshake");
        assert!(parser.is_complete());
        assert_eq!(parser.fields().get(Token::Host).unwrap(), b"x");
    }

    #[test]
    fn oversized_name_skips_the_line() {
        let mut parser = server_parser();
        feed_all(&mut parser, b"GET / HTTP/1.1\r\n");
        for _ in 0..100 {
            parser.feed(b'A');
        }
        feed_all(&mut parser, b": v\r\nHost: ok\r\n");
        assert_eq!(parser.fields().get(Token::Host).unwrap(), b"ok");
    }
}
