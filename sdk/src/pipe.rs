//! Bounded producer/consumer handoff.
//!
//! One side of a pipeline (encoding, extraction) runs on a blocking
//! execution context while the other side (the HTTP body, the download
//! loop) is async. The two are connected by a bounded channel of byte
//! chunks so they overlap instead of buffering the whole payload, and a
//! slow consumer backpressures the producer. A producer failure is
//! forwarded through the channel as an error item rather than dropped, so
//! the consumer can never deadlock on a half-written pipe.

use {
    bytes::Bytes,
    futures::Stream,
    std::io::{self, Read, Write},
    tokio::sync::mpsc,
    tokio_stream::wrappers::ReceiverStream,
};

/// Creates a bounded pipe holding at most `capacity` in-flight chunks.
pub fn bounded(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            current: Bytes::new(),
        },
    )
}

/// Write end of the pipe. The blocking [`Write`] impl must only be used
/// from a blocking context (`spawn_blocking` or a plain thread).
pub struct PipeWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl PipeWriter {
    /// Forwards a failure to the consumer and closes the pipe.
    pub fn fail(self, err: io::Error) {
        let _ = self.tx.blocking_send(Err(err));
    }

    /// Async counterpart of [`Write::write`], for feeding the pipe from an
    /// async context.
    pub async fn send(&self, chunk: Bytes) -> io::Result<()> {
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe consumer dropped"))
    }

    /// Async counterpart of [`PipeWriter::fail`].
    pub async fn fail_async(self, err: io::Error) {
        let _ = self.tx.send(Err(err)).await;
    }

    /// Detaches a handle that can still error the pipe after the writer
    /// itself has been handed off to an encoder. Dropping the handle
    /// without calling [`PipeFailHandle::fail`] leaves the pipe untouched.
    pub fn fail_handle(&self) -> PipeFailHandle {
        PipeFailHandle {
            tx: self.tx.clone(),
        }
    }
}

/// See [`PipeWriter::fail_handle`]. The pipe only reports end of input
/// once the writer and every handle are gone.
pub struct PipeFailHandle {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl PipeFailHandle {
    pub fn fail(self, err: io::Error) {
        let _ = self.tx.blocking_send(Err(err));
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe consumer dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read end of the pipe. The blocking [`Read`] impl must only be used from
/// a blocking context; [`PipeReader::into_stream`] provides the async view
/// for a streaming HTTP body.
pub struct PipeReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl PipeReader {
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> {
        ReceiverStream::new(self.rx)
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.current.is_empty() {
                let len = self.current.len().min(buf.len());
                buf[..len].copy_from_slice(&self.current[..len]);
                self.current = self.current.split_off(len);
                return Ok(len);
            }
            match self.rx.blocking_recv() {
                None => return Ok(0),
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(err)) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::thread};

    #[test]
    fn transfers_all_bytes() {
        let (mut writer, mut reader) = bounded(4);
        let producer = thread::spawn(move || {
            for index in 0..100u8 {
                writer.write_all(&[index; 1000]).unwrap();
            }
        });
        let mut output = Vec::new();
        reader.read_to_end(&mut output).unwrap();
        producer.join().unwrap();
        assert_eq!(output.len(), 100_000);
        assert!(output[..1000].iter().all(|&b| b == 0));
        assert!(output[99_000..].iter().all(|&b| b == 99));
    }

    #[test]
    fn producer_failure_reaches_consumer() {
        let (mut writer, mut reader) = bounded(4);
        let producer = thread::spawn(move || {
            writer.write_all(b"partial").unwrap();
            writer.fail(io::Error::new(io::ErrorKind::InvalidData, "encode failed"));
        });
        let mut output = Vec::new();
        let err = reader.read_to_end(&mut output).unwrap_err();
        producer.join().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(output, b"partial");
    }

    #[test]
    fn fail_handle_errors_the_consumer_after_writer_is_gone() {
        let (writer, mut reader) = bounded(4);
        let handle = writer.fail_handle();
        let producer = thread::spawn(move || {
            let mut writer = writer;
            writer.write_all(b"partial").unwrap();
            // The writer is consumed the way an encoder's finish chain
            // would consume it; only the handle is left to report failure.
            drop(writer);
            handle.fail(io::Error::other("encode failed"));
        });
        let mut output = Vec::new();
        let err = reader.read_to_end(&mut output).unwrap_err();
        producer.join().unwrap();
        assert_eq!(err.to_string(), "encode failed");
        assert_eq!(output, b"partial");
    }

    #[test]
    fn dropped_consumer_breaks_producer() {
        let (mut writer, reader) = bounded(1);
        drop(reader);
        let err = writer.write_all(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
