//! Command writer: the outbound half of the connection.
//!
//! Producers enqueue whole frames on a bounded queue and block when it is
//! full; the supervisor task drains the queue, encodes frames into a write
//! buffer and flushes it in batches. A frame is either fully enqueued or not
//! at all, so canceling a blocked producer leaves no torn frames behind.
//! Frames still queued when the transport is swapped are written to the next
//! transport; a partially-written buffer at the swap boundary is discarded.

use crate::error::ClientError;
use crate::transport::Transport;
use bytes::{Bytes, BytesMut};
use nimbus_protocol::{encode, ClientFrame, HeaderMap};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;

/// Commands sent from client handles to the supervisor task.
#[derive(Debug)]
pub(crate) enum Command {
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
    /// Round-trip barrier: resolved when the matching `PONG` arrives.
    Flush {
        done: oneshot::Sender<Result<(), ClientError>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Batched frame writer with a small pool of recycled buffers.
#[derive(Debug)]
pub(crate) struct FrameWriter {
    active: BytesMut,
    pool: Vec<BytesMut>,
    pool_limit: usize,
}

impl FrameWriter {
    pub(crate) fn new(pool_limit: usize) -> Self {
        Self {
            active: BytesMut::with_capacity(8192),
            pool: Vec::new(),
            pool_limit,
        }
    }

    /// Encodes one frame into the pending batch.
    pub(crate) fn push(&mut self, frame: &ClientFrame) -> Result<(), ClientError> {
        if self.active.capacity() == 0 {
            self.active = self
                .pool
                .pop()
                .unwrap_or_else(|| BytesMut::with_capacity(8192));
        }
        encode(frame, &mut self.active)?;
        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Writes the pending batch to the transport and recycles the buffer.
    pub(crate) async fn flush(&mut self, transport: &mut Transport) -> std::io::Result<()> {
        if self.active.is_empty() {
            return Ok(());
        }
        let mut chunk = self.active.split();
        transport.write_all(&chunk).await?;
        transport.flush().await?;
        chunk.clear();
        if self.pool.len() < self.pool_limit {
            self.pool.push(chunk);
        }
        Ok(())
    }

    /// Drops pending bytes. Called at the transport swap boundary, where a
    /// partially-written batch must not leak onto the next transport.
    pub(crate) fn discard(&mut self) {
        self.active.clear();
    }

    #[cfg(test)]
    pub(crate) fn pending_bytes(&self) -> &[u8] {
        &self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_batches_frames() {
        let mut writer = FrameWriter::new(4);
        writer.push(&ClientFrame::Ping).unwrap();
        writer
            .push(&ClientFrame::Subscribe {
                sid: 1,
                subject: "a".into(),
                queue_group: None,
            })
            .unwrap();
        assert!(!writer.is_empty());
        assert_eq!(&writer.active[..], b"PING\r\nSUB a 1\r\n");
    }

    #[test]
    fn test_discard_drops_partial_batch() {
        let mut writer = FrameWriter::new(4);
        writer.push(&ClientFrame::Ping).unwrap();
        writer.discard();
        assert!(writer.is_empty());
    }

    #[tokio::test]
    async fn test_flush_writes_and_recycles() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), client);
        let (mut server, _) = accepted.unwrap();
        let mut transport = Transport::Plain {
            stream: connected.unwrap(),
        };

        let mut writer = FrameWriter::new(4);
        writer.push(&ClientFrame::Ping).unwrap();
        writer.flush(&mut transport).await.unwrap();
        assert!(writer.is_empty());
        assert_eq!(writer.pool.len(), 1);

        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING\r\n");
    }
}
