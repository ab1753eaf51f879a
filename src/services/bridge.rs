//! Bounded byte pipe between a blocking transform producer and an async
//! consumer.
//!
//! The producer runs on the blocking pool and writes through [`BridgeWriter`]
//! (`std::io::Write`). The consumer reads [`BridgeReader`] (`AsyncRead`).
//! One window of `buffer_size` bytes may sit in the channel while the next
//! one is being filled, so memory stays bounded no matter how large the
//! object is.

use crate::error::{IngestError, IngestResult};
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::io::{self, Write};
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

enum Frame {
    Data(Bytes),
    Done,
    Failed(IngestError),
}

/// Write side handed to the producer closure.
pub struct BridgeWriter {
    tx: mpsc::Sender<Frame>,
    pending: BytesMut,
    window: usize,
    cancel: Option<CancellationToken>,
    bytes_written: u64,
}

impl BridgeWriter {
    fn new(tx: mpsc::Sender<Frame>, window: usize, cancel: Option<CancellationToken>) -> Self {
        let window = window.max(1);
        Self {
            tx,
            pending: BytesMut::with_capacity(window),
            window,
            cancel,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn check_open(&self) -> io::Result<()> {
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(cancelled_error());
        }
        if self.tx.is_closed() {
            return Err(reader_closed_error());
        }
        Ok(())
    }

    fn send(&self, frame: Frame) -> io::Result<()> {
        self.tx
            .blocking_send(frame)
            .map_err(|_| reader_closed_error())
    }

    fn send_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk = self.pending.split().freeze();
        tracing::trace!(bytes = chunk.len(), "bridge window");
        self.send(Frame::Data(chunk))
    }

    fn finish(mut self) -> IngestResult<()> {
        self.send_pending()?;
        self.send(Frame::Done)?;
        Ok(())
    }

    fn fail(self, err: &IngestError) {
        // The reader may already be gone; nothing left to tell it then.
        let _ = self.send(Frame::Failed(err.clone()));
    }
}

impl Write for BridgeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        let mut rest = data;
        while !rest.is_empty() {
            let room = self.window - self.pending.len();
            let take = room.min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() >= self.window {
                self.send_pending()?;
            }
        }
        self.bytes_written += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check_open()?;
        self.send_pending()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Open,
    Finished,
    Failed,
}

/// Read side consumed by the uploader.
///
/// EOF is reported only after the producer signalled a clean finish and every
/// buffered byte was handed out. A producer that stops without finishing
/// (error, panic, cancellation) surfaces as a read error.
pub struct BridgeReader {
    rx: mpsc::Receiver<Frame>,
    current: Bytes,
    state: ReadState,
    cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
}

impl BridgeReader {
    fn new(rx: mpsc::Receiver<Frame>, cancel: Option<CancellationToken>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
            state: ReadState::Open,
            cancelled: cancel.map(|c| Box::pin(c.cancelled_owned())),
        }
    }

    fn fail(&mut self, err: io::Error) -> Poll<io::Result<()>> {
        self.state = ReadState::Failed;
        self.rx.close();
        Poll::Ready(Err(err))
    }
}

impl AsyncRead for BridgeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.current.is_empty() {
                let n = this.current.len().min(buf.remaining());
                buf.put_slice(&this.current.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match this.state {
                ReadState::Finished => return Poll::Ready(Ok(())),
                ReadState::Failed => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "stream bridge already failed",
                    )));
                }
                ReadState::Open => {}
            }

            if let Some(cancelled) = this.cancelled.as_mut() {
                if cancelled.as_mut().poll(cx).is_ready() {
                    return this.fail(cancelled_error());
                }
            }

            match ready!(this.rx.poll_recv(cx)) {
                Some(Frame::Data(chunk)) => this.current = chunk,
                Some(Frame::Done) => this.state = ReadState::Finished,
                Some(Frame::Failed(err)) => return this.fail(err.into_io()),
                None => {
                    return this.fail(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "producer stopped before completing the stream",
                    ));
                }
            }
        }
    }
}

/// Join handle of the producer task.
pub struct ProducerHandle {
    task: JoinHandle<IngestResult<u64>>,
}

impl ProducerHandle {
    /// Waits for the producer and returns the number of bytes it wrote.
    pub async fn join(self) -> IngestResult<u64> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(IngestError::Io(io::Error::other(
                "transform producer panicked",
            ))),
            Err(e) => Err(IngestError::Io(io::Error::other(format!(
                "transform producer did not complete: {}",
                e
            )))),
        }
    }
}

/// Runs `produce` on the blocking pool and returns the read side of the pipe.
///
/// The write side is closed on every exit path: `Done` after a clean return,
/// `Failed` after an error, and a bare channel close when the producer panics.
pub fn spawn<F>(
    buffer_size: usize,
    cancel: Option<CancellationToken>,
    produce: F,
) -> (BridgeReader, ProducerHandle)
where
    F: FnOnce(&mut BridgeWriter) -> IngestResult<()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    let reader = BridgeReader::new(rx, cancel.clone());

    let task = tokio::task::spawn_blocking(move || {
        let mut writer = BridgeWriter::new(tx, buffer_size, cancel);
        match produce(&mut writer) {
            Ok(()) => {
                let written = writer.bytes_written();
                writer.finish()?;
                Ok(written)
            }
            Err(err) => {
                writer.fail(&err);
                Err(err)
            }
        }
    });

    (reader, ProducerHandle { task })
}

fn reader_closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream bridge reader closed")
}

fn cancelled_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "transfer cancelled")
}

/// True when the error only says the consumer went away.
pub fn is_consumer_gone(err: &IngestError) -> bool {
    matches!(
        err,
        IngestError::Io(e) if matches!(
            e.kind(),
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionAborted
        )
    )
}
