//! Streaming parser for inbound server frames.
//!
//! The decoder accumulates reader-supplied bytes in an internal buffer and
//! yields at most one frame per call, leaving unconsumed bytes for the next
//! invocation. A `MSG`/`HMSG` control line and its payload may arrive in any
//! number of pieces; truncated input is reported as "need more", never as an
//! error.

use crate::error::ProtocolError;
use crate::headers::HeaderBlock;
use crate::types::{Message, ServerInfo};
use crate::MAX_CONTROL_LINE;
use bytes::{Buf, BytesMut};

/// A frame received from the server.
#[derive(Debug, Clone)]
pub enum ServerFrame {
    /// Server information, sent at connect time and on topology changes.
    Info(ServerInfo),
    /// A message for subscription `sid`.
    Msg { sid: u64, message: Message },
    Ping,
    Pong,
    /// Acknowledgement in verbose mode.
    Ok,
    /// Server-reported error.
    Err(String),
}

/// Arguments parsed from a `MSG`/`HMSG` control line, retained while the
/// payload is still in flight.
#[derive(Debug)]
struct PendingMsg {
    subject: String,
    sid: u64,
    reply: Option<String>,
    header_len: usize,
    total_len: usize,
}

#[derive(Debug)]
enum DecodeState {
    ControlLine,
    Payload(PendingMsg),
}

/// Incremental frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    state: DecodeState,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            state: DecodeState::ControlLine,
        }
    }

    /// Appends freshly read bytes to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discards buffered bytes and parse state. Used on transport teardown.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = DecodeState::ControlLine;
    }

    /// Attempts to decode the next frame.
    ///
    /// Returns `Ok(Some(frame))` when a complete frame is available,
    /// `Ok(None)` when more bytes are needed, or `Err` on malformed input.
    pub fn decode(&mut self) -> Result<Option<ServerFrame>, ProtocolError> {
        loop {
            match &self.state {
                DecodeState::ControlLine => {
                    let Some(line_end) = find_crlf(&self.buffer) else {
                        if self.buffer.len() > MAX_CONTROL_LINE {
                            return Err(ProtocolError::ControlLineTooLong {
                                len: self.buffer.len(),
                                max: MAX_CONTROL_LINE,
                            });
                        }
                        return Ok(None);
                    };
                    let line = self.buffer.split_to(line_end + 2);
                    let line = std::str::from_utf8(&line[..line_end])
                        .map_err(|_| ProtocolError::InvalidUtf8)?;
                    match self.parse_control_line(line)? {
                        Some(frame) => return Ok(Some(frame)),
                        // MSG/HMSG: state advanced to Payload, keep going.
                        None => continue,
                    }
                }
                DecodeState::Payload(pending) => {
                    // Payload plus trailing CRLF.
                    let needed = pending.total_len + 2;
                    if self.buffer.len() < needed {
                        return Ok(None);
                    }
                    let DecodeState::Payload(pending) =
                        std::mem::replace(&mut self.state, DecodeState::ControlLine)
                    else {
                        unreachable!()
                    };
                    let mut body = self.buffer.split_to(pending.total_len);
                    let terminator = self.buffer.split_to(2);
                    if &terminator[..] != b"\r\n" {
                        return Err(ProtocolError::BadPayloadTerminator);
                    }
                    return Ok(Some(self.assemble_msg(pending, &mut body)?));
                }
            }
        }
    }

    fn parse_control_line(&mut self, line: &str) -> Result<Option<ServerFrame>, ProtocolError> {
        let (verb, args) = match line.split_once(char::is_whitespace) {
            Some((verb, args)) => (verb, args.trim()),
            None => (line, ""),
        };

        if verb.eq_ignore_ascii_case("MSG") {
            self.state = DecodeState::Payload(parse_msg_args(args, false)?);
            return Ok(None);
        }
        if verb.eq_ignore_ascii_case("HMSG") {
            self.state = DecodeState::Payload(parse_msg_args(args, true)?);
            return Ok(None);
        }
        if verb.eq_ignore_ascii_case("PING") {
            return Ok(Some(ServerFrame::Ping));
        }
        if verb.eq_ignore_ascii_case("PONG") {
            return Ok(Some(ServerFrame::Pong));
        }
        if verb.eq_ignore_ascii_case("+OK") {
            return Ok(Some(ServerFrame::Ok));
        }
        if verb.eq_ignore_ascii_case("-ERR") {
            let reason = args.trim_matches('\'').to_string();
            return Ok(Some(ServerFrame::Err(reason)));
        }
        if verb.eq_ignore_ascii_case("INFO") {
            let info: ServerInfo = serde_json::from_str(args)?;
            return Ok(Some(ServerFrame::Info(info)));
        }
        Err(ProtocolError::UnknownVerb(verb.to_string()))
    }

    fn assemble_msg(
        &self,
        pending: PendingMsg,
        body: &mut BytesMut,
    ) -> Result<ServerFrame, ProtocolError> {
        let length = pending.subject.len()
            + pending.reply.as_deref().map_or(0, str::len)
            + pending.total_len;

        let (headers, status, description) = if pending.header_len > 0 {
            let block = HeaderBlock::parse(&body[..pending.header_len])?;
            body.advance(pending.header_len);
            (Some(block.headers), block.status, block.description)
        } else {
            (None, None, None)
        };

        Ok(ServerFrame::Msg {
            sid: pending.sid,
            message: Message {
                subject: pending.subject,
                reply: pending.reply,
                headers,
                status,
                description,
                payload: body.split().freeze(),
                length,
            },
        })
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_msg_args(args: &str, with_headers: bool) -> Result<PendingMsg, ProtocolError> {
    let bad = || ProtocolError::BadControlLine(args.to_string());
    let mut parts = args.split_ascii_whitespace();

    let subject = parts.next().ok_or_else(bad)?.to_string();
    let sid: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;

    let rest: Vec<&str> = parts.collect();
    let trailing = if with_headers { 2 } else { 1 };
    let reply = match rest.len().checked_sub(trailing) {
        Some(0) => None,
        Some(1) => Some(rest[0].to_string()),
        _ => return Err(bad()),
    };

    let lengths = &rest[rest.len() - trailing..];
    let (header_len, total_len) = if with_headers {
        let header_len: usize = lengths[0].parse().map_err(|_| bad())?;
        let total_len: usize = lengths[1].parse().map_err(|_| bad())?;
        if header_len > total_len {
            return Err(bad());
        }
        (header_len, total_len)
    } else {
        (0, lengths[0].parse().map_err(|_| bad())?)
    };
    if total_len > crate::MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: total_len,
            max: crate::MAX_FRAME_SIZE,
        });
    }

    Ok(PendingMsg {
        subject,
        sid,
        reply,
        header_len,
        total_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut FrameDecoder) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_simple_verbs() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"PING\r\nPONG\r\n+OK\r\n-ERR 'Stale Connection'\r\n");
        let frames = decode_all(&mut decoder);
        assert!(matches!(frames[0], ServerFrame::Ping));
        assert!(matches!(frames[1], ServerFrame::Pong));
        assert!(matches!(frames[2], ServerFrame::Ok));
        match &frames[3] {
            ServerFrame::Err(reason) => assert_eq!(reason, "Stale Connection"),
            other => panic!("expected -ERR, got {other:?}"),
        }
    }

    #[test]
    fn test_info_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"INFO {\"server_id\":\"S\",\"max_payload\":2048}\r\n");
        match decode_all(&mut decoder).remove(0) {
            ServerFrame::Info(info) => {
                assert_eq!(info.server_id, "S");
                assert_eq!(info.max_payload, 2048);
            }
            other => panic!("expected INFO, got {other:?}"),
        }
    }

    #[test]
    fn test_msg_with_reply() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"MSG foo.bar 9 _REPLY.x 5\r\nhello\r\n");
        match decode_all(&mut decoder).remove(0) {
            ServerFrame::Msg { sid, message } => {
                assert_eq!(sid, 9);
                assert_eq!(message.subject, "foo.bar");
                assert_eq!(message.reply.as_deref(), Some("_REPLY.x"));
                assert_eq!(&message.payload[..], b"hello");
                assert_eq!(message.length, "foo.bar".len() + "_REPLY.x".len() + 5);
            }
            other => panic!("expected MSG, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_payload_is_valid() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"MSG foo 1 0\r\n\r\n");
        match decode_all(&mut decoder).remove(0) {
            ServerFrame::Msg { message, .. } => {
                assert!(message.payload.is_empty());
                assert!(message.headers.is_none());
            }
            other => panic!("expected MSG, got {other:?}"),
        }
    }

    #[test]
    fn test_hmsg_with_status() {
        let mut decoder = FrameDecoder::new();
        let headers = b"NATS/1.0 100 Idle Heartbeat\r\n\r\n";
        let mut wire = format!("HMSG sub 3 {} {}\r\n", headers.len(), headers.len()).into_bytes();
        wire.extend_from_slice(headers);
        wire.extend_from_slice(b"\r\n");
        decoder.extend(&wire);
        match decode_all(&mut decoder).remove(0) {
            ServerFrame::Msg { message, .. } => {
                assert!(message.is_status());
                assert_eq!(message.status, Some(crate::StatusCode::IDLE_HEARTBEAT));
                assert_eq!(message.description.as_deref(), Some("Idle Heartbeat"));
            }
            other => panic!("expected HMSG, got {other:?}"),
        }
    }

    #[test]
    fn test_hmsg_with_headers_and_payload() {
        let mut decoder = FrameDecoder::new();
        let headers = b"NATS/1.0\r\nX-Key: v\r\n\r\n";
        let total = headers.len() + 4;
        let mut wire = format!("HMSG s 1 {} {}\r\n", headers.len(), total).into_bytes();
        wire.extend_from_slice(headers);
        wire.extend_from_slice(b"body\r\n");
        decoder.extend(&wire);
        match decode_all(&mut decoder).remove(0) {
            ServerFrame::Msg { message, .. } => {
                assert_eq!(&message.payload[..], b"body");
                assert_eq!(message.headers.unwrap().get("X-Key"), Some("v"));
                assert!(message.status.is_none());
            }
            other => panic!("expected HMSG, got {other:?}"),
        }
    }

    #[test]
    fn test_split_idempotence() {
        // Feeding the same byte stream in any split yields the same frames.
        let wire = b"PING\r\nMSG foo 2 11\r\nhello world\r\nINFO {\"proto\":1}\r\nPONG\r\n";
        let mut whole = FrameDecoder::new();
        whole.extend(wire);
        let expected = decode_all(&mut whole);

        for split in 1..wire.len() {
            let mut decoder = FrameDecoder::new();
            decoder.extend(&wire[..split]);
            let mut frames = decode_all(&mut decoder);
            decoder.extend(&wire[split..]);
            frames.extend(decode_all(&mut decoder));
            assert_eq!(frames.len(), expected.len(), "split at {split}");
            for (got, want) in frames.iter().zip(&expected) {
                assert_eq!(format!("{got:?}"), format!("{want:?}"), "split at {split}");
            }
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let wire = b"MSG a.b 7 _R.t 3\r\nxyz\r\n";
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in wire.iter() {
            decoder.extend(std::slice::from_ref(byte));
            frames.extend(decode_all(&mut decoder));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_unknown_verb() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"BOGUS stuff\r\n");
        assert!(matches!(
            decoder.decode(),
            Err(ProtocolError::UnknownVerb(_))
        ));
    }

    #[test]
    fn test_bad_length() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"MSG foo 1 nope\r\n");
        assert!(matches!(
            decoder.decode(),
            Err(ProtocolError::BadControlLine(_))
        ));
    }

    #[test]
    fn test_header_len_exceeding_total() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"HMSG foo 1 10 5\r\n");
        assert!(matches!(
            decoder.decode(),
            Err(ProtocolError::BadControlLine(_))
        ));
    }

    #[test]
    fn test_missing_payload_terminator() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"MSG foo 1 3\r\nabcXX");
        assert!(matches!(
            decoder.decode(),
            Err(ProtocolError::BadPayloadTerminator)
        ));
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut decoder = FrameDecoder::new();
        let line = format!("MSG foo 1 {}\r\n", crate::MAX_FRAME_SIZE + 1);
        decoder.extend(line.as_bytes());
        assert!(matches!(
            decoder.decode(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_control_line_flood() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&vec![b'A'; MAX_CONTROL_LINE + 1]);
        assert!(matches!(
            decoder.decode(),
            Err(ProtocolError::ControlLineTooLong { .. })
        ));
    }

    #[test]
    fn test_clear_resets_state() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"MSG foo 1 100\r\npartial");
        assert!(decoder.decode().unwrap().is_none());
        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
        decoder.extend(b"PING\r\n");
        assert!(matches!(decoder.decode(), Ok(Some(ServerFrame::Ping))));
    }
}
