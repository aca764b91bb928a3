use std::{
  io,
  pin::Pin,
  task::{Context, Poll, ready},
};

use bytes::Bytes;
use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::Message;

/// A bidirectional byte stream carried over a control plane tunnel.
pub trait Tunnel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Tunnel for T {}

pub type BoxedTunnel = Box<dyn Tunnel>;

/// Adapts a websocket into [AsyncRead] / [AsyncWrite] so tunnel
/// consumers can treat it like any other socket. Binary frames carry
/// the payload, control frames are handled inline.
pub struct WsByteStream<S> {
  inner: S,
  /// Bytes of the current frame not yet handed to the reader.
  leftover: Bytes,
}

impl<S> WsByteStream<S> {
  pub fn new(inner: S) -> WsByteStream<S> {
    WsByteStream {
      inner,
      leftover: Bytes::new(),
    }
  }
}

fn into_io_error(
  e: tokio_tungstenite::tungstenite::Error,
) -> io::Error {
  io::Error::other(e)
}

impl<S> AsyncRead for WsByteStream<S>
where
  S: Stream<
      Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
    > + Unpin,
{
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    loop {
      if !self.leftover.is_empty() {
        let take = self.leftover.len().min(buf.remaining());
        buf.put_slice(&self.leftover.split_to(take));
        return Poll::Ready(Ok(()));
      }
      match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
        Some(Ok(Message::Binary(bytes))) => {
          self.leftover = bytes;
        }
        Some(Ok(Message::Text(text))) => {
          self.leftover = Bytes::from(text.as_bytes().to_vec());
        }
        Some(Ok(Message::Close(_))) | None => {
          return Poll::Ready(Ok(()));
        }
        // Ping / pong handled by tungstenite itself.
        Some(Ok(_)) => continue,
        Some(Err(e)) => {
          return Poll::Ready(Err(into_io_error(e)));
        }
      }
    }
  }
}

impl<S> AsyncWrite for WsByteStream<S>
where
  S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
    + Unpin,
{
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    ready!(Pin::new(&mut self.inner).poll_ready(cx))
      .map_err(into_io_error)?;
    Pin::new(&mut self.inner)
      .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
      .map_err(into_io_error)?;
    Poll::Ready(Ok(buf.len()))
  }

  fn poll_flush(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner)
      .poll_flush(cx)
      .map_err(into_io_error)
  }

  fn poll_shutdown(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner)
      .poll_close(cx)
      .map_err(into_io_error)
  }
}

#[cfg(test)]
mod tests {
  use futures::StreamExt;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::*;

  /// In memory Sink + Stream of websocket messages.
  struct Loopback {
    tx: futures::channel::mpsc::UnboundedSender<Message>,
    rx: futures::channel::mpsc::UnboundedReceiver<Message>,
  }

  impl Stream for Loopback {
    type Item =
      Result<Message, tokio_tungstenite::tungstenite::Error>;
    fn poll_next(
      mut self: Pin<&mut Self>,
      cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
      self.rx.poll_next_unpin(cx).map(|m| m.map(Ok))
    }
  }

  impl Sink<Message> for Loopback {
    type Error = tokio_tungstenite::tungstenite::Error;
    fn poll_ready(
      self: Pin<&mut Self>,
      _: &mut Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
      Poll::Ready(Ok(()))
    }
    fn start_send(
      self: Pin<&mut Self>,
      item: Message,
    ) -> Result<(), Self::Error> {
      self.tx.unbounded_send(item).ok();
      Ok(())
    }
    fn poll_flush(
      self: Pin<&mut Self>,
      _: &mut Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
      Poll::Ready(Ok(()))
    }
    fn poll_close(
      self: Pin<&mut Self>,
      _: &mut Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
      Poll::Ready(Ok(()))
    }
  }

  #[tokio::test]
  async fn frames_round_trip_as_bytes() {
    let (tx, rx) = futures::channel::mpsc::unbounded();
    let mut stream = WsByteStream::new(Loopback { tx, rx });

    stream.write_all(b"hello tunnel").await.unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
    let mut rest = [0u8; 7];
    stream.read_exact(&mut rest).await.unwrap();
    assert_eq!(&rest, b" tunnel");
  }

  #[tokio::test]
  async fn close_frame_reads_as_eof() {
    let (tx, rx) = futures::channel::mpsc::unbounded();
    tx.unbounded_send(Message::Close(None)).unwrap();
    let mut stream = WsByteStream::new(Loopback { tx, rx });
    let mut buf = Vec::new();
    let n = stream.read_to_end(&mut buf).await.unwrap();
    assert_eq!(n, 0);
  }
}
