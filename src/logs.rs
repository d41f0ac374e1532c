//! Tagged fan-in of worker output streams

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::trace;

/// One chunk from a registered source stream.
#[derive(Debug, Clone)]
pub struct LogChunk {
    /// Tag the source was registered under, e.g. `worker.3`
    pub tag: String,
    pub data: Bytes,
}

/// Fan-in over any number of byte streams. Each chunk is re-emitted with
/// the tag its source was registered under; nothing is buffered beyond
/// the channel itself.
pub struct AggregateStream {
    tx: mpsc::UnboundedSender<LogChunk>,
    rx: Mutex<mpsc::UnboundedReceiver<LogChunk>>,
}

impl AggregateStream {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Register a source stream; a pump task forwards its chunks until EOF.
    pub fn add<R>(&self, mut source: R, tag: String)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(8 * 1024);
            loop {
                match source.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        trace!(tag = %tag, bytes = n, "worker output");
                        let data = buf.split().freeze();
                        if tx.send(LogChunk {
                            tag: tag.clone(),
                            data,
                        })
                        .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Receive the next tagged chunk.
    pub async fn recv(&self) -> Option<LogChunk> {
        self.rx.lock().await.recv().await
    }
}

impl Default for AggregateStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_chunks_arrive_tagged() {
        let aggregate = AggregateStream::new();
        aggregate.add(&b"out"[..], "worker.0".to_string());

        let chunk = tokio::time::timeout(Duration::from_secs(1), aggregate.recv())
            .await
            .expect("chunk in time")
            .expect("chunk");
        assert_eq!(chunk.tag, "worker.0");
        assert_eq!(&chunk.data[..], b"out");
    }

    #[tokio::test]
    async fn test_interleaves_multiple_sources() {
        let aggregate = AggregateStream::new();
        aggregate.add(&b"a"[..], "worker.0".to_string());
        aggregate.add(&b"b"[..], "worker.1".to_string());

        let mut tags = Vec::new();
        for _ in 0..2 {
            let chunk = tokio::time::timeout(Duration::from_secs(1), aggregate.recv())
                .await
                .expect("chunk in time")
                .expect("chunk");
            tags.push(chunk.tag);
        }
        tags.sort();
        assert_eq!(tags, vec!["worker.0", "worker.1"]);
    }
}
