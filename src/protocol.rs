use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::errors::WsError;
use crate::handshake::{HeaderSet, Token};

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// protocol revisions accepted on the wire
pub const SUPPORTED_REVISIONS: [u8; 7] = [0, 4, 5, 6, 7, 8, 13];

/// whether a draft revision number is one this endpoint can frame
pub fn revision_supported(revision: u8) -> bool {
    matches!(revision, 0 | 4..=8 | 13)
}

/// generate a random `Sec-WebSocket-Key` value for a client handshake
pub fn gen_key() -> String {
    let r: [u8; 16] = rand::random();
    BASE64.encode(r)
}

/// compute the `Sec-WebSocket-Accept` value for a handshake key
pub fn cal_accept_key(source: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(source);
    sha1.update(GUID);
    BASE64.encode(sha1.finalize())
}

/// assemble the 101 reply for a completed server-side upgrade
///
/// echoes the first offered subprotocol name back if the client sent
/// any; whether that protocol is acceptable is the caller's decision
pub fn upgrade_response(fields: &HeaderSet) -> Result<Vec<u8>, WsError> {
    let key = fields
        .get(Token::Key)
        .ok_or_else(|| WsError::HandShakeFailed("missing sec-websocket-key".into()))?;
    let accept = cal_accept_key(key);

    let mut builder = http::Response::builder()
        .status(http::StatusCode::SWITCHING_PROTOCOLS)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Accept", accept);
    if let Some(protocols) = fields.get(Token::Protocol) {
        let first = protocols
            .split(|&c| c == b',')
            .next()
            .unwrap_or(protocols);
        let name = String::from_utf8_lossy(first).trim().to_string();
        if !name.is_empty() {
            builder = builder.header("Sec-WebSocket-Protocol", name);
        }
    }
    let resp = builder
        .body(())
        .map_err(|e| WsError::HandShakeFailed(e.to_string()))?;

    let mut lines = vec![format!("{:?} {}", resp.version(), resp.status())];
    resp.headers().iter().for_each(|(k, v)| {
        lines.push(format!("{}: {}", k, v.to_str().unwrap_or_default()))
    });
    lines.push("\r\n".to_string());
    Ok(lines.join("\r\n").into_bytes())
}
