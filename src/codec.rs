//! Text-socket envelope codec
//!
//! One envelope per line. Fields are joined by `|||` in a fixed order:
//!
//! `type|||sender|||receiver|||content|||timestamp|||filename|||fileSize|||fileId`
//!
//! Absent optional fields are written as empty strings, never omitted.
//! At least the first five fields must be present when decoding.
//!
//! Escaping: inside a field `\` is written `\\`, `|` is written `\|`,
//! LF is written `\n` and CR is written `\r`. Any other escape is
//! rejected, and so is an unescaped `|` that is not part of a delimiter,
//! so every line has exactly one reading.

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AppError, ProtocolError};
use crate::message::{Envelope, MessageType};
use crate::types::FileId;

pub const FIELD_DELIMITER: &str = "|||";

/// Leading fields every line must carry (type through timestamp)
pub const MIN_FIELDS: usize = 5;

pub const FIELD_COUNT: usize = 8;

/// Encode an envelope as a single line (without the trailing newline)
pub fn encode(envelope: &Envelope) -> String {
    let timestamp = envelope
        .timestamp()
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    let file_size = envelope.file_size.map(|s| s.to_string()).unwrap_or_default();
    let file_id = envelope.file_id.map(|id| id.to_string()).unwrap_or_default();

    let fields = [
        envelope.kind.as_str(),
        envelope.sender.as_str(),
        envelope.receiver.as_deref().unwrap_or(""),
        envelope.content.as_deref().unwrap_or(""),
        timestamp.as_str(),
        envelope.filename.as_deref().unwrap_or(""),
        file_size.as_str(),
        file_id.as_str(),
    ];

    let mut line = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            line.push_str(FIELD_DELIMITER);
        }
        escape_into(field, &mut line);
    }
    line
}

/// Decode one line (without its line terminator) into an envelope
pub fn decode(line: &str) -> Result<Envelope, ProtocolError> {
    let fields = split_fields(line)?;
    if fields.len() < MIN_FIELDS {
        return Err(ProtocolError::MissingFields {
            expected: MIN_FIELDS,
            actual: fields.len(),
        });
    }
    if fields.len() > FIELD_COUNT {
        return Err(ProtocolError::TooManyFields {
            expected: FIELD_COUNT,
            actual: fields.len(),
        });
    }

    let field = |i: usize| fields.get(i).map(String::as_str).unwrap_or("");
    let optional = |i: usize| Some(field(i).to_string()).filter(|s| !s.is_empty());

    let kind: MessageType = field(0).parse()?;
    let timestamp = parse_timestamp(field(4))?;

    let mut envelope = Envelope::with_timestamp(kind, field(1), timestamp);
    envelope.receiver = optional(2);
    envelope.content = optional(3);
    envelope.filename = optional(5);
    envelope.file_size = match field(6) {
        "" => None,
        raw => Some(raw.parse::<u64>().map_err(|e| ProtocolError::InvalidField {
            field: "fileSize",
            reason: e.to_string(),
        })?),
    };
    envelope.file_id = match field(7) {
        "" => None,
        raw => Some(raw.parse::<FileId>().map_err(|e| ProtocolError::InvalidField {
            field: "fileId",
            reason: e.to_string(),
        })?),
    };
    Ok(envelope)
}

/// An empty timestamp is stamped on arrival
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ProtocolError> {
    if raw.is_empty() {
        return Ok(Utc::now());
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ProtocolError::InvalidField {
            field: "timestamp",
            reason: e.to_string(),
        })
}

fn escape_into(field: &str, out: &mut String) {
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\|"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
}

fn split_fields(line: &str) -> Result<Vec<String>, ProtocolError> {
    let mut fields = Vec::with_capacity(FIELD_COUNT);
    let mut current = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('\\') => current.push('\\'),
                Some('|') => current.push('|'),
                Some('n') => current.push('\n'),
                Some('r') => current.push('\r'),
                _ => return Err(ProtocolError::InvalidEscape),
            },
            '|' => {
                // The only legal unescaped pipes are full delimiters
                if chars.next() != Some('|') || chars.next() != Some('|') {
                    return Err(ProtocolError::InvalidEscape);
                }
                fields.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    fields.push(current);
    Ok(fields)
}

/// Read one line, bounded by `max_line` bytes
///
/// Returns `Ok(None)` on a clean end of stream. An over-long line leaves
/// the stream desynchronized, so it is reported as a fatal error. Blank
/// lines are skipped.
pub async fn read_line<R>(reader: &mut R, max_line: usize) -> Result<Option<String>, AppError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = String::new();
        let n = (&mut *reader)
            .take(max_line as u64 + 1)
            .read_line(&mut line)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') && n > max_line {
            return Err(ProtocolError::LineTooLong(max_line).into());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if !trimmed.is_empty() {
            return Ok(Some(trimmed.to_string()));
        }
    }
}

/// Read and decode one envelope; decoding errors are returned as errors
pub async fn read_envelope<R>(reader: &mut R, max_line: usize) -> Result<Option<Envelope>, AppError>
where
    R: AsyncBufRead + Unpin,
{
    match read_line(reader, max_line).await? {
        Some(line) => Ok(Some(decode(&line)?)),
        None => Ok(None),
    }
}

pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = encode(envelope);
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_encode_keeps_empty_fields() {
        let env = Envelope::broadcast("alice", "hi");
        let line = encode(&env);
        let parts: Vec<&str> = line.split(FIELD_DELIMITER).collect();
        assert_eq!(parts.len(), FIELD_COUNT);
        assert_eq!(parts[0], "BROADCAST");
        assert_eq!(parts[1], "alice");
        assert_eq!(parts[2], "");
        assert_eq!(parts[3], "hi");
        assert_eq!(parts[5], "");
    }

    #[test]
    fn test_roundtrip_with_hostile_content() {
        let id = FileId::new();
        let env = Envelope::new(MessageType::FileMetadata, "alice")
            .to("bob")
            .with_content("a|||b\\n\nline|two\r")
            .with_file("re|port.pdf", 4096)
            .with_file_id(id);
        let line = encode(&env);
        assert!(!line.contains('\n'));
        let decoded = decode(&line).unwrap();
        assert_eq!(decoded.content.as_deref(), Some("a|||b\\n\nline|two\r"));
        assert_eq!(decoded.filename.as_deref(), Some("re|port.pdf"));
        assert_eq!(decoded.file_size, Some(4096));
        assert_eq!(decoded.file_id, Some(id));
        assert_eq!(decoded.receiver.as_deref(), Some("bob"));
        assert_eq!(
            decoded.timestamp().timestamp_millis(),
            env.timestamp().timestamp_millis()
        );
    }

    #[test]
    fn test_minimum_fields() {
        let env = decode(&["PING", "alice", "", "", ""].join(FIELD_DELIMITER)).unwrap();
        assert_eq!(env.kind, MessageType::Ping);
        assert_eq!(env.sender, "alice");
        assert!(env.receiver.is_none());
        assert!(env.file_id.is_none());

        assert_eq!(
            decode("PING|||alice|||"),
            Err(ProtocolError::MissingFields {
                expected: MIN_FIELDS,
                actual: 3
            })
        );
    }

    #[test]
    fn test_rejects_malformed() {
        let line = |fields: &[&str]| fields.join(FIELD_DELIMITER);

        assert!(matches!(
            decode(&line(&["NOPE", "a", "", "", ""])),
            Err(ProtocolError::UnknownType(_))
        ));
        assert_eq!(
            decode(&line(&["BROADCAST", "a|b", "", "", ""])),
            Err(ProtocolError::InvalidEscape)
        );
        assert_eq!(
            decode(&line(&["BROADCAST", "a\\x", "", "", ""])),
            Err(ProtocolError::InvalidEscape)
        );
        assert!(matches!(
            decode(&line(&["FILE_METADATA", "a", "b", "", "", "f", "big", ""])),
            Err(ProtocolError::InvalidField { field: "fileSize", .. })
        ));
        assert!(matches!(
            decode(&line(&["BROADCAST", "a", "", "", "yesterday"])),
            Err(ProtocolError::InvalidField { field: "timestamp", .. })
        ));
        assert!(matches!(
            decode(&line(&["BROADCAST", "a", "", "", "", "", "", "", "x"])),
            Err(ProtocolError::TooManyFields { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_envelopes_from_stream() {
        let first = encode(&Envelope::broadcast("alice", "one"));
        let second = encode(&Envelope::broadcast("bob", "two"));
        let data = format!("{first}\r\n\n{second}\n");
        let mut reader = BufReader::new(data.as_bytes());

        let a = read_envelope(&mut reader, 1024).await.unwrap().unwrap();
        let b = read_envelope(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(a.content_str(), "one");
        assert_eq!(b.sender, "bob");
        assert!(read_envelope(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_line_limit() {
        let data = format!("{}\n", "x".repeat(64));
        let mut reader = BufReader::new(data.as_bytes());
        let err = read_line(&mut reader, 16).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Protocol(ProtocolError::LineTooLong(16))
        ));
    }
}
