//! Frame-based I/O over a duplex byte stream.
//!
//! A [`Transport`] owns a read half and a write half, drives a [`Framer`]
//! over the read half in a background task, and exposes inbound activity
//! as a stream of [`TransportEvent`]s. It has no notion of procedures,
//! callbacks, or peer state — that belongs to [`crate::peer::Peer`], which
//! is the sole consumer of a `Transport`.

use crate::error::Error;
use crate::framer::{self, Framer};
use crate::wire::{self, WireValue};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Inbound activity delivered by a [`Transport`]'s background read task.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete, decoded message arrived.
    Message(WireValue),
    /// The output sink has drained after `send` last reported back-pressure.
    Drain,
    /// The peer half of the duplex finished reading everything and closed
    /// cleanly (a frame never arrived mid-stream).
    Disconnect(Option<Error>),
}

/// Default size, in bytes, of outstanding unflushed writes after which
/// [`Transport::send`] starts reporting back-pressure via its `bool`
/// return value. The protocol treats this purely as an advisory signal;
/// nothing in this crate enforces it.
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;

/// Frame-based transport over any `AsyncRead + AsyncWrite` duplex stream.
///
/// Read side: a spawned task repeatedly reads chunks off the stream,
/// feeds them through a [`Framer`], decodes each resulting frame as a
/// [`WireValue`], and forwards it as a [`TransportEvent`]. Write side:
/// [`Transport::send`] encodes, frames, and writes synchronously against
/// the shared, buffered writer.
pub struct Transport<W> {
    writer: Mutex<BufWriter<W>>,
    events: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    outstanding: std::sync::atomic::AtomicUsize,
    signalled_backpressure: std::sync::atomic::AtomicBool,
}

impl<W> Transport<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a duplex stream's halves as a `Transport` and spawn its read
    /// loop. `reader` and `writer` may be the split halves of a single
    /// stream (e.g. `tokio::net::TcpStream`) or two independent halves
    /// (e.g. `tokio::io::duplex`).
    pub fn new<R>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(reader, tx.clone()));
        Self {
            writer: Mutex::new(BufWriter::new(writer)),
            events: Mutex::new(rx),
            event_tx: tx,
            outstanding: std::sync::atomic::AtomicUsize::new(0),
            signalled_backpressure: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Wait for the next inbound event. The read task always delivers a
    /// terminal [`TransportEvent::Disconnect`] before it exits; `recv`
    /// only returns `None` on a subsequent call, once the channel itself
    /// has closed.
    pub async fn recv(&self) -> Option<TransportEvent> {
        self.events.lock().await.recv().await
    }

    /// Encode, frame, and write `value`. Returns `true` if the transport's
    /// outbound buffer is below its high-water mark (the caller may keep
    /// sending without waiting), `false` if the caller should pause.
    #[tracing::instrument(skip(self, value))]
    pub async fn send(&self, value: &WireValue) -> Result<bool, Error> {
        let payload = wire::encode(value).map_err(|e| Error::Serialization(e.to_string()))?;
        let frame = framer::encode_frame(&payload);
        let frame_len = frame.len();

        let before = self
            .outstanding
            .fetch_add(frame_len, std::sync::atomic::Ordering::SeqCst)
            + frame_len;
        let below_high_water = before < DEFAULT_HIGH_WATER_MARK;
        if !below_high_water {
            self.signalled_backpressure
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        drop(writer);

        debug!(bytes = frame_len, "wrote frame");
        let after = self
            .outstanding
            .fetch_sub(frame_len, std::sync::atomic::Ordering::SeqCst)
            - frame_len;
        if after < DEFAULT_HIGH_WATER_MARK
            && self
                .signalled_backpressure
                .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            let _ = self.event_tx.send(TransportEvent::Drain);
        }

        Ok(below_high_water)
    }

    /// Flush the underlying writer without sending a new frame.
    pub async fn flush(&self) -> Result<(), Error> {
        self.writer.lock().await.flush().await?;
        Ok(())
    }
}

async fn read_loop<R>(mut reader: R, tx: mpsc::UnboundedSender<TransportEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut framer = Framer::new();
    let mut chunk = BytesMut::with_capacity(4 * 1024);

    loop {
        chunk.clear();
        chunk.resize(4 * 1024, 0);
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                let _ = tx.send(TransportEvent::Disconnect(None));
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "transport read failed");
                let _ = tx.send(TransportEvent::Disconnect(Some(Error::from(e))));
                return;
            }
        };

        framer.push(&chunk[..n]);
        while let Some(frame) = framer.next_frame() {
            match wire::decode(&frame) {
                Ok(value) => {
                    if tx.send(TransportEvent::Message(value)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "dropping malformed frame");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_message_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);

        let client_transport = Transport::new(client_r, client_w);
        let server_transport = Transport::new(server_r, server_w);

        client_transport
            .send(&WireValue::Str("hello".into()))
            .await
            .unwrap();

        match server_transport.recv().await {
            Some(TransportEvent::Message(WireValue::Str(s))) => assert_eq!(s, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_past_high_water_mark_eventually_drains() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);

        let client_transport = Transport::new(client_r, client_w);
        let _server_transport = Transport::new(server_r, server_w);

        let big = WireValue::Bytes(vec![0u8; DEFAULT_HIGH_WATER_MARK + 1]);
        let below_high_water = client_transport.send(&big).await.unwrap();
        assert!(!below_high_water);

        let small = WireValue::Str("ping".into());
        client_transport.send(&small).await.unwrap();

        match client_transport.recv().await {
            Some(TransportEvent::Drain) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_close_delivers_disconnect() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);

        let server_transport = Transport::new(server_r, server_w);
        drop(Transport::new(client_r, client_w));

        match server_transport.recv().await {
            Some(TransportEvent::Disconnect(None)) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
