//! Length-prefixed frame I/O over an ordered byte stream.
//!
//! Reading happens on exactly one task through [`FrameReader`]. Writing is
//! funnelled through a [`FrameSender`] into [`write_loop`], which owns the
//! write half, so frames from concurrent calls never interleave mid-frame.

use bytes::{Buf, BytesMut};
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::FrameError;
use crate::frame::Frame;
use crate::status::Status;

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Buffered writes are pushed to the socket once they reach this size even if
/// more frames are queued.
const WRITE_FLUSH_THRESHOLD: usize = 64 * 1024;

pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    max_frame_size: usize,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            max_frame_size,
        }
    }

    /// Read the next complete frame.
    ///
    /// Cancel safe: bytes already read stay buffered for the next call.
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf, self.max_frame_size)? {
                return Ok(frame);
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(if self.buf.is_empty() {
                    FrameError::Closed
                } else {
                    FrameError::Truncated
                });
            }
        }
    }
}

pub struct FrameWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
        }
    }

    /// Queue a frame, writing through once enough bytes have accumulated.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        frame.encode(&mut self.buf)?;
        if self.buf.len() >= WRITE_FLUSH_THRESHOLD {
            self.write_buffered().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), FrameError> {
        self.write_buffered().await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush everything and close the write direction of the byte stream.
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }

    async fn write_buffered(&mut self) -> Result<(), FrameError> {
        while self.buf.has_remaining() {
            let n = self.inner.write(&self.buf).await?;
            if n == 0 {
                return Err(FrameError::Io(std::io::ErrorKind::WriteZero.into()));
            }
            self.buf.advance(n);
        }
        Ok(())
    }
}

/// Cloneable handle used by every call to hand frames to the writer task.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Frame>,
}

impl FrameSender {
    /// Queue a frame for writing.
    ///
    /// Fails with `UNAVAILABLE` once the writer task has stopped.
    pub fn send(&self, frame: Frame) -> Result<(), Status> {
        self.tx
            .send(frame)
            .map_err(|_| Status::unavailable("connection writer has stopped"))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub fn channel() -> (FrameSender, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FrameSender { tx }, rx)
}

/// Drain queued frames into `writer` until `closing` resolves or every
/// sender is gone.
///
/// Frames queued before shutdown are still written, then the write side of
/// the stream is shut down so the peer observes end of stream.
pub async fn write_loop<W, F>(
    mut writer: FrameWriter<W>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    closing: F,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    tokio::pin!(closing);

    loop {
        tokio::select! {
            biased;
            _ = &mut closing => break,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    writer.write_frame(&frame).await?;
                    if rx.is_empty() {
                        writer.flush().await?;
                    }
                }
                None => break,
            },
        }
    }

    while let Ok(frame) = rx.try_recv() {
        writer.write_frame(&frame).await?;
    }
    writer.shutdown().await
}
