//! Adapters between byte streams and frames

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::frame::{Frame, FrameDirection, FrameFactory};
use crate::processor::{FrameProcessor, ProcessorBase};

/// Turns lines of a byte stream into Text frames.
///
/// Frames arriving through `process_frame` pass straight through, so a reader
/// can sit at the head of a pipeline and still relay upstream traffic.
pub struct ReaderProcessor {
    base: ProcessorBase,
}

impl ReaderProcessor {
    pub fn new(name: impl Into<String>, frames: &FrameFactory) -> Self {
        Self {
            base: ProcessorBase::new(name, frames),
        }
    }

    /// Push one Text frame per line downstream, then End once the stream is exhausted.
    ///
    /// A read error stops reading and is returned without emitting End.
    pub async fn read_from<R>(&self, reader: R) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut lines = reader.lines();
        let mut count = 0usize;
        while let Some(line) = lines.next_line().await? {
            count += 1;
            let frame = self.base.frames().text(line);
            self.base.push_downstream(frame).await;
        }

        debug!("[{}] Stream exhausted after {} lines", self.base.name(), count);
        let end = self.base.frames().end();
        self.base.push_downstream(end).await;
        Ok(())
    }
}

#[async_trait]
impl FrameProcessor for ReaderProcessor {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }
}

/// Writes the payload of downstream Text and Bytes frames to a byte sink, one per line.
///
/// Written frames are consumed. Everything else, and all upstream traffic,
/// is forwarded. A failed write is reported upstream as a non-fatal Error.
pub struct WriterProcessor<W> {
    base: ProcessorBase,
    writer: Mutex<W>,
}

impl<W> WriterProcessor<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(name: impl Into<String>, frames: &FrameFactory, writer: W) -> Self {
        Self {
            base: ProcessorBase::new(name, frames),
            writer: Mutex::new(writer),
        }
    }

    async fn write_line(&self, payload: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(payload).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }
}

#[async_trait]
impl<W> FrameProcessor for WriterProcessor<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        self.base.process_frame(&frame).await;

        if direction == FrameDirection::Upstream {
            self.base.push_frame(frame, direction).await;
            return;
        }

        let result = match &frame {
            Frame::Text { text, .. } => self.write_line(text.as_bytes()).await,
            Frame::Bytes { data, .. } => self.write_line(data).await,
            _ => {
                self.base.push_frame(frame, direction).await;
                return;
            }
        };

        if let Err(e) = result {
            warn!("[{}] Write failed for {}: {}", self.base.name(), frame, e);
            self.base.push_error(Arc::new(e), false).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;

    use crate::frame::FrameType;
    use crate::processor::link_processors;
    use crate::test_utils::FrameRecorder;

    #[tokio::test]
    async fn test_reader_pushes_lines_then_end() {
        let frames = FrameFactory::new();
        let reader = Arc::new(ReaderProcessor::new("reader", &frames));
        let recorder = FrameRecorder::new(&frames);
        link_processors(&[reader.clone(), recorder.clone()]);

        reader
            .read_from(&b"first\nsecond\nthird"[..])
            .await
            .unwrap();

        assert_eq!(recorder.texts(), vec!["first", "second", "third"]);
        assert_eq!(recorder.types().last(), Some(&FrameType::End));
    }

    #[tokio::test]
    async fn test_reader_empty_stream_only_ends() {
        let frames = FrameFactory::new();
        let reader = Arc::new(ReaderProcessor::new("reader", &frames));
        let recorder = FrameRecorder::new(&frames);
        link_processors(&[reader.clone(), recorder.clone()]);

        reader.read_from(&b""[..]).await.unwrap();
        assert_eq!(recorder.types(), vec![FrameType::End]);
    }

    #[tokio::test]
    async fn test_writer_consumes_payload_frames() {
        let frames = FrameFactory::new();
        let (client, mut server) = tokio::io::duplex(1024);
        let writer = Arc::new(WriterProcessor::new("writer", &frames, client));
        let recorder = FrameRecorder::new(&frames);
        link_processors(&[writer.clone(), recorder.clone()]);

        writer
            .process_frame(frames.text("hello"), FrameDirection::Downstream)
            .await;
        writer
            .process_frame(frames.bytes(b"raw".to_vec()), FrameDirection::Downstream)
            .await;
        writer
            .process_frame(frames.end(), FrameDirection::Downstream)
            .await;

        let mut buf = vec![0u8; 10];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello\nraw\n");
        assert_eq!(recorder.types(), vec![FrameType::End]);
    }

    #[tokio::test]
    async fn test_writer_failure_becomes_upstream_error() {
        let frames = FrameFactory::new();
        let (client, server) = tokio::io::duplex(64);
        drop(server);

        let head = FrameRecorder::named("head", &frames);
        let writer = Arc::new(WriterProcessor::new("writer", &frames, client));
        link_processors(&[head.clone(), writer.clone()]);

        writer
            .process_frame(frames.text("lost"), FrameDirection::Downstream)
            .await;

        let received = head.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, FrameDirection::Upstream);
        assert!(matches!(received[0].0, Frame::Error { fatal: false, .. }));
    }

    #[tokio::test]
    async fn test_writer_passes_upstream_text() {
        let frames = FrameFactory::new();
        let (client, _server) = tokio::io::duplex(64);
        let head = FrameRecorder::named("head", &frames);
        let writer = Arc::new(WriterProcessor::new("writer", &frames, client));
        link_processors(&[head.clone(), writer.clone()]);

        writer
            .process_frame(frames.text("reply"), FrameDirection::Upstream)
            .await;
        assert_eq!(head.texts(), vec!["reply"]);
    }
}
