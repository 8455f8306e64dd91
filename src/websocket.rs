//! Hand-written WebSocket wire codec (RFC 6455 subset)
//!
//! Covers the opening handshake and single, unfragmented text frames.
//! Control frames (ping/pong/close) and continuation frames are not
//! supported; a close frame is treated as end of stream.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

use crate::error::{AppError, ProtocolError};

/// Fixed GUID appended to the client key before hashing
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const OPCODE_CONTINUATION: u8 = 0x0;
pub const OPCODE_TEXT: u8 = 0x1;
pub const OPCODE_CLOSE: u8 = 0x8;

/// FIN bit plus text opcode
const FIN_TEXT: u8 = 0x80 | OPCODE_TEXT;

/// Upper bound on the size of the HTTP upgrade request
pub const MAX_HANDSHAKE_BYTES: usize = 8 * 1024;

/// Compute `Sec-WebSocket-Accept` for a client `Sec-WebSocket-Key`
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Parsed HTTP upgrade request
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub path: String,
    pub key: String,
}

/// Read the HTTP upgrade request up to the blank line that ends it
pub async fn read_handshake<R>(reader: &mut R) -> Result<HandshakeRequest, AppError>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0usize;
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let remaining = MAX_HANDSHAKE_BYTES.saturating_sub(consumed) as u64;
        if remaining == 0 {
            return Err(handshake_error("request headers too large"));
        }
        let n = (&mut *reader).take(remaining).read_line(&mut line).await?;
        if n == 0 {
            return Err(handshake_error("connection closed during handshake"));
        }
        consumed += n;
        if !line.ends_with('\n') {
            return Err(handshake_error("request headers too large"));
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        if line.is_empty() {
            break;
        }
        lines.push(line);
    }
    parse_handshake(&lines)
}

fn parse_handshake(lines: &[String]) -> Result<HandshakeRequest, AppError> {
    let (request_line, header_lines) = lines
        .split_first()
        .ok_or_else(|| handshake_error("empty request"))?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");
    let version = parts.next().unwrap_or("");
    if method != "GET" || !version.starts_with("HTTP/1.1") {
        return Err(handshake_error("expected 'GET <path> HTTP/1.1'"));
    }

    let mut headers = HashMap::new();
    for line in header_lines {
        let Some((name, value)) = line.split_once(':') else {
            return Err(handshake_error("malformed header line"));
        };
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    let upgrade = headers.get("upgrade").map(String::as_str).unwrap_or("");
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(handshake_error("missing 'Upgrade: websocket'"));
    }
    let key = headers
        .get("sec-websocket-key")
        .filter(|k| !k.is_empty())
        .cloned()
        .ok_or_else(|| handshake_error("missing Sec-WebSocket-Key"))?;

    Ok(HandshakeRequest {
        path: path.to_string(),
        key,
    })
}

fn handshake_error(reason: &str) -> AppError {
    ProtocolError::Handshake(reason.to_string()).into()
}

/// `101 Switching Protocols` response for an accepted upgrade
pub fn handshake_response(client_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(client_key)
    )
}

/// `400 Bad Request` response for a rejected upgrade
pub fn handshake_rejection(reason: &str) -> String {
    format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        reason.len(),
        reason
    )
}

/// One decoded frame (payload already unmasked)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Interpret the frame as a complete text message
    ///
    /// Returns `Ok(None)` for a close frame.
    pub fn into_text(self) -> Result<Option<String>, ProtocolError> {
        match self.opcode {
            OPCODE_CLOSE => Ok(None),
            OPCODE_CONTINUATION => Err(ProtocolError::Fragmented),
            OPCODE_TEXT if !self.fin => Err(ProtocolError::Fragmented),
            OPCODE_TEXT => String::from_utf8(self.payload)
                .map(Some)
                .map_err(|_| ProtocolError::InvalidUtf8),
            other => Err(ProtocolError::UnsupportedOpcode(other)),
        }
    }
}

/// Read one frame
///
/// Returns `Ok(None)` if the stream ends cleanly before the first byte.
/// Payloads longer than `max_len` are refused before any of their bytes
/// are read.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Frame>, AppError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 1];
    if reader.read(&mut head).await? == 0 {
        return Ok(None);
    }
    let fin = head[0] & 0x80 != 0;
    let opcode = head[0] & 0x0F;

    let second = reader.read_u8().await?;
    let masked = second & 0x80 != 0;
    let len = match second & 0x7F {
        126 => u64::from(reader.read_u16().await?),
        127 => reader.read_u64().await?,
        short => u64::from(short),
    };
    if len > max_len as u64 {
        return Err(ProtocolError::FrameTooLarge {
            len,
            limit: max_len,
        }
        .into());
    }

    let mask = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key).await?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    Ok(Some(Frame {
        fin,
        opcode,
        payload,
    }))
}

/// XOR each byte with `key[i mod 4]` (masking and unmasking are the same)
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encode a server-to-client text frame (final, unmasked)
pub fn encode_text_frame(payload: &[u8]) -> Vec<u8> {
    encode_frame(FIN_TEXT, payload, None)
}

/// Encode a frame with an explicit first byte and optional mask key
pub fn encode_frame(first_byte: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(first_byte);

    let len = payload.len();
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(payload),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_rfc6455_accept_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[tokio::test]
    async fn test_frame_length_boundaries() {
        for len in [0usize, 125, 126, 65535, 65536] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let bytes = encode_text_frame(&payload);
            let mut reader = bytes.as_slice();
            let frame = read_frame(&mut reader, 1 << 20).await.unwrap().unwrap();
            assert!(frame.fin);
            assert_eq!(frame.opcode, OPCODE_TEXT);
            assert_eq!(frame.payload, payload, "length {len}");
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_length_header_tiers() {
        assert_eq!(encode_text_frame(&[0; 125])[1], 125);
        let mid = encode_text_frame(&[0; 126]);
        assert_eq!(&mid[1..4], &[126, 0x00, 0x7E]);
        let big = encode_text_frame(&vec![0; 65536]);
        assert_eq!(big[1], 127);
        assert_eq!(&big[2..10], &65536u64.to_be_bytes());
    }

    #[tokio::test]
    async fn test_masked_client_frame() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let bytes = encode_frame(0x81, b"Hello", Some(key));
        // RFC 6455 section 5.7 masked "Hello"
        assert_eq!(
            bytes,
            vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
        let mut reader = bytes.as_slice();
        let frame = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(frame.into_text().unwrap().as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn test_oversized_frame_refused() {
        let bytes = encode_text_frame(&[b'x'; 300]);
        let mut reader = bytes.as_slice();
        let err = read_frame(&mut reader, 200).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Protocol(ProtocolError::FrameTooLarge { len: 300, limit: 200 })
        ));
    }

    #[tokio::test]
    async fn test_clean_eof_and_truncated_frame() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty, 10).await.unwrap().is_none());

        let bytes = encode_text_frame(b"abcdef");
        let mut truncated = &bytes[..4];
        assert!(matches!(
            read_frame(&mut truncated, 10).await,
            Err(AppError::Io(_))
        ));
    }

    #[test]
    fn test_unsupported_frames() {
        let frame = |fin, opcode| Frame {
            fin,
            opcode,
            payload: Vec::new(),
        };
        assert_eq!(frame(true, OPCODE_CLOSE).into_text(), Ok(None));
        assert_eq!(
            frame(false, OPCODE_TEXT).into_text(),
            Err(ProtocolError::Fragmented)
        );
        assert_eq!(
            frame(true, OPCODE_CONTINUATION).into_text(),
            Err(ProtocolError::Fragmented)
        );
        assert_eq!(
            frame(true, 0x9).into_text(),
            Err(ProtocolError::UnsupportedOpcode(0x9))
        );
    }

    #[tokio::test]
    async fn test_read_handshake() {
        let request = "GET /chat HTTP/1.1\r\n\
                       Host: server.example.com\r\n\
                       Upgrade: websocket\r\n\
                       Connection: Upgrade\r\n\
                       Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                       Sec-WebSocket-Version: 13\r\n\r\n";
        let mut reader = BufReader::new(request.as_bytes());
        let parsed = read_handshake(&mut reader).await.unwrap();
        assert_eq!(parsed.path, "/chat");
        assert_eq!(parsed.key, "dGhlIHNhbXBsZSBub25jZQ==");

        let response = handshake_response(&parsed.key);
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_handshake_requires_upgrade() {
        let request = "GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut reader = BufReader::new(request.as_bytes());
        assert!(matches!(
            read_handshake(&mut reader).await,
            Err(AppError::Protocol(ProtocolError::Handshake(_)))
        ));
    }
}
