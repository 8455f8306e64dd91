//! WebSocket connection handler
//!
//! Performs the HTTP upgrade handshake by hand, then exchanges single-frame
//! text messages carrying `WsMessage` JSON. After the handshake the
//! connection follows the same login and session flow as the text socket.
//! File transfer is not offered over this binding: offers addressed to a
//! WebSocket session are refused with FILE_ERROR.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::handler::{serve, EnvelopeSource};
use crate::message::Envelope;
use crate::server::ServerContext;
use crate::types::Transport;
use crate::websocket::{self, encode_text_frame};
use crate::ws_message::WsMessage;

/// Text frames decoded into envelopes
pub(crate) struct FrameSource<R> {
    reader: R,
    max_frame_len: usize,
}

impl<R> FrameSource<R> {
    pub(crate) fn new(reader: R, max_frame_len: usize) -> Self {
        Self {
            reader,
            max_frame_len,
        }
    }
}

impl<R: AsyncRead + Unpin> EnvelopeSource for FrameSource<R> {
    async fn next_envelope(&mut self) -> Result<Option<Envelope>, AppError> {
        let Some(frame) = websocket::read_frame(&mut self.reader, self.max_frame_len).await? else {
            return Ok(None);
        };
        // A close frame ends the session like EOF does
        let Some(text) = frame.into_text()? else {
            return Ok(None);
        };
        let envelope = WsMessage::parse(&text)?.into_envelope()?;
        Ok(Some(envelope))
    }
}

/// Encode each queued envelope as one text frame
pub(crate) async fn write_frames<W>(mut writer: W, mut outbound: mpsc::Receiver<Envelope>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = outbound.recv().await {
        let text = match WsMessage::from(&envelope).to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!("Cannot encode {} for websocket: {}", envelope.kind, e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(&encode_text_frame(text.as_bytes())).await {
            debug!("Websocket write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Handle a new connection on the WebSocket listener
pub async fn handle_ws_connection(stream: TcpStream, ctx: ServerContext) -> Result<(), AppError> {
    let origin = stream
        .peer_addr()
        .map(|a| format!("ws://{}", a))
        .unwrap_or_else(|_| "ws://unknown".to_string());
    debug!("New WebSocket connection from {}", origin);

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = match websocket::read_handshake(&mut reader).await {
        Ok(request) => request,
        Err(e) => {
            let reason = e.to_string();
            let _ = write_half
                .write_all(websocket::handshake_rejection(&reason).as_bytes())
                .await;
            return Err(e);
        }
    };
    write_half
        .write_all(websocket::handshake_response(&request.key).as_bytes())
        .await?;
    debug!("WebSocket upgrade for {} on {}", origin, request.path);

    let (outbound, outbound_rx) = mpsc::channel(ctx.config.outbound_capacity);
    let writer = tokio::spawn(write_frames(write_half, outbound_rx));
    // Bytes the handshake reader buffered past the headers stay in `reader`
    let source = FrameSource::new(reader, ctx.config.max_frame_len);

    serve(source, outbound, writer, ctx, origin, Transport::WebSocket).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::message::MessageType;
    use crate::websocket::{encode_frame, OPCODE_CLOSE};

    fn client_frame(text: &str) -> Vec<u8> {
        encode_frame(0x81, text.as_bytes(), Some([1, 2, 3, 4]))
    }

    #[tokio::test]
    async fn test_frame_source_decodes_messages() {
        let mut input = client_frame(r#"{"type":"LOGIN","sender":"alice"}"#);
        input.extend(client_frame(
            r#"{"type":"PRIVATE","content":"say \"hi\"","targetUser":"bob"}"#,
        ));
        input.extend(encode_frame(0x80 | OPCODE_CLOSE, &[], Some([0; 4])));

        let mut source = FrameSource::new(input.as_slice(), 1024);
        let login = source.next_envelope().await.unwrap().unwrap();
        assert_eq!(login.kind, MessageType::Login);
        assert_eq!(login.sender, "alice");

        let private = source.next_envelope().await.unwrap().unwrap();
        assert_eq!(private.receiver(), Some("bob"));
        assert_eq!(private.content_str(), "say \"hi\"");

        assert!(source.next_envelope().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_source_rejects_bad_payload() {
        let input = client_frame(r#"{"type":"BROADCAST","content":1}"#);
        let mut source = FrameSource::new(input.as_slice(), 1024);
        assert!(matches!(
            source.next_envelope().await,
            Err(AppError::Protocol(ProtocolError::MalformedPayload(_)))
        ));
    }

    #[tokio::test]
    async fn test_frame_source_refuses_oversized_frame() {
        let input = client_frame(&"x".repeat(200));
        let mut source = FrameSource::new(input.as_slice(), 100);
        assert!(matches!(
            source.next_envelope().await,
            Err(AppError::Protocol(ProtocolError::FrameTooLarge { len: 200, .. }))
        ));
    }

    #[tokio::test]
    async fn test_write_frames() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Envelope::broadcast("alice", "hi")).await.unwrap();
        drop(tx);

        let mut out = Vec::new();
        write_frames(&mut out, rx).await;
        assert_eq!(out[0], 0x81);
        let json: serde_json::Value = serde_json::from_slice(&out[2..]).unwrap();
        assert_eq!(json["type"], "BROADCAST");
        assert_eq!(json["sender"], "alice");
        assert_eq!(json["content"], "hi");
    }
}
