//! Encoder for outbound client frames.
//!
//! Frames are formatted directly into a caller-supplied `BytesMut` so many
//! frames can be batched into one buffered write.

use crate::error::ProtocolError;
use crate::headers::HeaderMap;
use crate::types::ConnectInfo;
use bytes::{BufMut, Bytes, BytesMut};

/// A frame sent to the server.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Connect(ConnectInfo),
    Publish {
        subject: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    },
    Subscribe {
        sid: u64,
        subject: String,
        queue_group: Option<String>,
    },
    Unsubscribe {
        sid: u64,
        max_msgs: Option<u64>,
    },
    Ping,
    Pong,
}

/// Formats `frame` into `buf`.
pub fn encode(frame: &ClientFrame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    match frame {
        ClientFrame::Connect(info) => {
            let body = serde_json::to_vec(info)?;
            buf.reserve(body.len() + 12);
            buf.put_slice(b"CONNECT ");
            buf.put_slice(&body);
            buf.put_slice(b"\r\n");
        }
        ClientFrame::Publish {
            subject,
            reply,
            headers,
            payload,
        } => match headers {
            None => {
                buf.reserve(subject.len() + payload.len() + 32);
                buf.put_slice(b"PUB ");
                buf.put_slice(subject.as_bytes());
                buf.put_u8(b' ');
                if let Some(reply) = reply {
                    buf.put_slice(reply.as_bytes());
                    buf.put_u8(b' ');
                }
                put_len(buf, payload.len());
                buf.put_slice(b"\r\n");
                buf.put_slice(payload);
                buf.put_slice(b"\r\n");
            }
            Some(headers) => {
                let header_len = headers.encoded_len();
                buf.reserve(subject.len() + header_len + payload.len() + 40);
                buf.put_slice(b"HPUB ");
                buf.put_slice(subject.as_bytes());
                buf.put_u8(b' ');
                if let Some(reply) = reply {
                    buf.put_slice(reply.as_bytes());
                    buf.put_u8(b' ');
                }
                put_len(buf, header_len);
                buf.put_u8(b' ');
                put_len(buf, header_len + payload.len());
                buf.put_slice(b"\r\n");
                headers.encode(buf);
                buf.put_slice(payload);
                buf.put_slice(b"\r\n");
            }
        },
        ClientFrame::Subscribe {
            sid,
            subject,
            queue_group,
        } => {
            buf.reserve(subject.len() + 32);
            buf.put_slice(b"SUB ");
            buf.put_slice(subject.as_bytes());
            buf.put_u8(b' ');
            if let Some(group) = queue_group {
                buf.put_slice(group.as_bytes());
                buf.put_u8(b' ');
            }
            put_len(buf, *sid as usize);
            buf.put_slice(b"\r\n");
        }
        ClientFrame::Unsubscribe { sid, max_msgs } => {
            buf.reserve(32);
            buf.put_slice(b"UNSUB ");
            put_len(buf, *sid as usize);
            if let Some(max) = max_msgs {
                buf.put_u8(b' ');
                put_len(buf, *max as usize);
            }
            buf.put_slice(b"\r\n");
        }
        ClientFrame::Ping => buf.put_slice(b"PING\r\n"),
        ClientFrame::Pong => buf.put_slice(b"PONG\r\n"),
    }
    Ok(())
}

fn put_len(buf: &mut BytesMut, value: usize) {
    use std::fmt::Write;
    // Writing integers into a BytesMut cannot fail.
    let _ = write!(buf, "{value}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{FrameDecoder, ServerFrame};

    fn encoded(frame: &ClientFrame) -> BytesMut {
        let mut buf = BytesMut::new();
        encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_pub_without_reply() {
        let buf = encoded(&ClientFrame::Publish {
            subject: "foo".into(),
            reply: None,
            headers: None,
            payload: Bytes::from_static(b"hello"),
        });
        assert_eq!(&buf[..], b"PUB foo 5\r\nhello\r\n");
    }

    #[test]
    fn test_pub_with_reply_and_empty_payload() {
        let buf = encoded(&ClientFrame::Publish {
            subject: "foo".into(),
            reply: Some("_R.1".into()),
            headers: None,
            payload: Bytes::new(),
        });
        assert_eq!(&buf[..], b"PUB foo _R.1 0\r\n\r\n");
    }

    #[test]
    fn test_hpub_layout() {
        let mut headers = HeaderMap::new();
        headers.insert("K", "v");
        let buf = encoded(&ClientFrame::Publish {
            subject: "s".into(),
            reply: None,
            headers: Some(headers.clone()),
            payload: Bytes::from_static(b"xy"),
        });
        let header_len = headers.encoded_len();
        let expected = format!("HPUB s {} {}\r\nNATS/1.0\r\nK: v\r\n\r\nxy\r\n",
            header_len, header_len + 2);
        assert_eq!(&buf[..], expected.as_bytes());
    }

    #[test]
    fn test_sub_and_unsub() {
        let buf = encoded(&ClientFrame::Subscribe {
            sid: 12,
            subject: "orders.*".into(),
            queue_group: Some("workers".into()),
        });
        assert_eq!(&buf[..], b"SUB orders.* workers 12\r\n");

        let buf = encoded(&ClientFrame::Unsubscribe {
            sid: 12,
            max_msgs: Some(3),
        });
        assert_eq!(&buf[..], b"UNSUB 12 3\r\n");

        let buf = encoded(&ClientFrame::Unsubscribe {
            sid: 12,
            max_msgs: None,
        });
        assert_eq!(&buf[..], b"UNSUB 12\r\n");
    }

    #[test]
    fn test_connect_is_single_json_line() {
        let buf = encoded(&ClientFrame::Connect(ConnectInfo::default()));
        assert!(buf.starts_with(b"CONNECT {"));
        assert!(buf.ends_with(b"}\r\n"));
        assert_eq!(buf.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn test_encode_decode_roundtrip_via_loopback() {
        // A published frame, echoed back by a broker as MSG, reproduces the
        // original payload byte for byte.
        let payload = Bytes::from_static(b"\x00\x01binary\xffdata");
        let buf = encoded(&ClientFrame::Publish {
            subject: "t".into(),
            reply: None,
            headers: None,
            payload: payload.clone(),
        });
        // Rewrite "PUB t 16" as the matching inbound "MSG t 1 16".
        let line_end = buf.windows(2).position(|w| w == b"\r\n").unwrap();
        let line = std::str::from_utf8(&buf[..line_end]).unwrap();
        let len = line.rsplit(' ').next().unwrap();
        let mut wire = format!("MSG t 1 {len}\r\n").into_bytes();
        wire.extend_from_slice(&buf[line_end + 2..]);

        let mut decoder = FrameDecoder::new();
        decoder.extend(&wire);
        match decoder.decode().unwrap().unwrap() {
            ServerFrame::Msg { message, .. } => assert_eq!(message.payload, payload),
            other => panic!("expected MSG, got {other:?}"),
        }
    }
}
