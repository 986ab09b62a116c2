//! Tests for the stream abstraction layer

use super::*;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Shared record of everything a mock writer was given.
#[derive(Debug, Clone, Default)]
pub struct WriteLog(Arc<Mutex<Vec<Bytes>>>);

impl WriteLog {
    pub fn snapshot(&self) -> Vec<Bytes> {
        self.0.lock().unwrap().clone()
    }

    fn push(&self, data: Bytes) {
        self.0.lock().unwrap().push(data);
    }
}

/// Mock reader scripted with chunk results.
///
/// Chunks are appended to an internal buffer exactly like a real stream,
/// so min/max read semantics behave the same as the TCP reader.
#[derive(Debug)]
pub struct MockReader {
    buffer: BytesMut,
    script: VecDeque<TransportResult<Bytes>>,
}

impl MockReader {
    pub fn new(script: Vec<TransportResult<Bytes>>) -> Self {
        Self {
            buffer: BytesMut::new(),
            script: script.into(),
        }
    }
}

#[async_trait]
impl StreamReader for MockReader {
    async fn read(&mut self, min_len: usize, max_len: usize) -> TransportResult<Bytes> {
        while self.buffer.len() < min_len {
            match self.script.pop_front() {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e),
                None => return Err(TransportError::ConnectionClosed),
            }
        }
        let take = self.buffer.len().min(max_len);
        Ok(self.buffer.split_to(take).freeze())
    }
}

/// Mock writer recording writes into a shared log.
#[derive(Debug)]
pub struct MockWriter {
    pub log: WriteLog,
}

impl MockWriter {
    pub fn new(log: WriteLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl StreamWriter for MockWriter {
    async fn write(&mut self, data: Bytes) -> TransportResult<()> {
        self.log.push(data);
        Ok(())
    }
}

#[cfg(test)]
mod test_mock {
    use super::*;

    #[tokio::test]
    async fn test_mock_reader_accumulates_chunks() {
        let mut reader = MockReader::new(vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"cd")),
            Ok(Bytes::from_static(b"ef")),
        ]);

        let data = reader.read(5, 6).await.unwrap();
        assert_eq!(data.as_ref(), b"abcdef");
    }

    #[tokio::test]
    async fn test_mock_reader_respects_max_len() {
        let mut reader = MockReader::new(vec![Ok(Bytes::from_static(b"0123456789"))]);

        let first = reader.read(1, 4).await.unwrap();
        assert_eq!(first.as_ref(), b"0123");
        let rest = reader.read(6, 6).await.unwrap();
        assert_eq!(rest.as_ref(), b"456789");
    }

    #[tokio::test]
    async fn test_mock_reader_exhausted_script_closes() {
        let mut reader = MockReader::new(vec![Ok(Bytes::from_static(b"ab"))]);

        let result = reader.read(4, 4).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_mock_reader_scripted_error() {
        let mut reader = MockReader::new(vec![
            Ok(Bytes::from_static(b"ok")),
            Err(TransportError::Cancelled),
        ]);

        assert_eq!(reader.read(2, 2).await.unwrap().as_ref(), b"ok");
        assert!(matches!(
            reader.read(1, 1).await,
            Err(TransportError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_mock_writer_records() {
        let log = WriteLog::default();
        let mut writer = MockWriter::new(log.clone());

        writer.write(Bytes::from_static(b"one")).await.unwrap();
        writer.write(Bytes::from_static(b"two")).await.unwrap();

        let written = log.snapshot();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].as_ref(), b"one");
        assert_eq!(written[1].as_ref(), b"two");
    }

    #[tokio::test]
    async fn test_event_channel_preserves_order() {
        let (tx, mut rx) = event_channel();

        tx.emit(TransportEvent::Connecting);
        tx.emit(TransportEvent::Connected);
        tx.emit(TransportEvent::Disconnected);

        assert_eq!(rx.recv().await, Some(TransportEvent::Connecting));
        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));
        assert_eq!(rx.recv().await, Some(TransportEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_event_emit_after_receiver_dropped() {
        let (tx, rx) = event_channel();
        drop(rx);

        // Must not panic
        tx.emit(TransportEvent::Failed("gone".to_string()));
    }
}
