//! Serial↔TCP bridge for one serial mapping.
//!
//! A [`Bridge`] owns an exclusive handle to one serial device and a TCP
//! listener on a loopback port that the forwarding client points at. Bytes
//! are relayed verbatim in both directions — no framing, no handshake, a
//! single 4 KiB in-flight chunk per direction (latency over throughput).
//!
//! A serial line is a single physical channel, so the bridge enforces **at
//! most one session per device**: while a session is active, additional TCP
//! clients are accepted and immediately closed rather than queued.
//!
//! Relay I/O errors are session-scoped — they end the current session and
//! the listener keeps accepting the next client. Only a failure to open the
//! device or bind the listener fails [`Bridge::start`] itself.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Error;
use crate::events::{Event, EventSender};

/// Per-direction relay chunk size.
const RELAY_CHUNK: usize = 4096;

/// Bound on how long `stop` waits for the relay task to wind down.
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// A running bridge: serial handle, listener, and relay task.
#[derive(Debug)]
pub struct Bridge {
    /// Device path this bridge exclusively claims.
    pub device: String,
    /// Loopback port the listener is bound to.
    pub local_port: u16,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Bridge {
    /// Open the serial device, bind the local listener, and start relaying.
    ///
    /// The device is opened first so an unavailable or claimed device fails
    /// fast without consuming the port.
    pub async fn start(
        device: &str,
        baud: u32,
        bind: &str,
        local_port: u16,
        events: EventSender,
    ) -> Result<Self, Error> {
        let mut serial = tokio_serial::new(device, baud)
            .open_native_async()
            .map_err(|e| Error::DeviceUnavailable(format!("{device}: {e}")))?;
        #[cfg(unix)]
        if let Err(e) = serial.set_exclusive(true) {
            warn!("Bridge {device}: could not set exclusive mode: {e}");
        }

        let listener = TcpListener::bind((bind, local_port)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                Error::PortConflict(local_port)
            } else {
                Error::Io(e)
            }
        })?;

        info!("Bridge {device}: listening on {bind}:{local_port} at {baud} baud");
        Ok(Self::spawn(device.to_string(), serial, listener, events))
    }

    /// Start the accept/relay loop over an already-opened device stream.
    pub(crate) fn spawn<S>(device: String, serial: S, listener: TcpListener, events: EventSender) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let local_port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or_default();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_bridge(
            device.clone(),
            serial,
            listener,
            cancel.clone(),
            events,
        ));
        Self {
            device,
            local_port,
            cancel,
            task: Some(task),
        }
    }

    /// Close the listener and the serial handle, ending any in-flight
    /// session. Idempotent; the relay task is joined with a bound.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(STOP_TIMEOUT, task).await.is_err() {
                warn!(
                    "Bridge {}: relay task did not stop within {STOP_TIMEOUT:?}, aborting",
                    self.device
                );
                abort.abort();
            }
        }
        info!("Bridge {}: stopped", self.device);
    }
}

/// Accept loop. Owns the serial stream for the bridge's whole lifetime so a
/// failed session never drops the device handle.
async fn run_bridge<S>(
    device: String,
    mut serial: S,
    listener: TcpListener,
    cancel: CancellationToken,
    events: EventSender,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let (mut stream, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Bridge {device}: accept failed: {e}");
                    continue;
                }
            },
        };

        info!("Bridge {device}: client {peer} connected");
        let _ = events.send(Event::Log {
            line: format!("bridge {device}: client {peer} connected"),
        });

        let session = relay(&mut serial, &mut stream);
        tokio::pin!(session);
        let done = loop {
            tokio::select! {
                res = &mut session => break res,
                () = cancel.cancelled() => return,
                accepted = listener.accept() => {
                    // Single physical channel: refuse, don't queue.
                    if let Ok((refused, extra)) = accepted {
                        warn!("Bridge {device}: refusing {extra}, serial line busy");
                        let _ = events.send(Event::Log {
                            line: format!("bridge {device}: refused {extra} (session active)"),
                        });
                        drop(refused);
                    }
                }
            }
        };

        match done {
            Ok(()) => {
                info!("Bridge {device}: client {peer} disconnected");
                let _ = events.send(Event::Log {
                    line: format!("bridge {device}: client {peer} disconnected"),
                });
            }
            Err(e) => {
                // Session-scoped fault: log it and wait for the next client.
                warn!("Bridge {device}: session with {peer} ended: {e}");
                let _ = events.send(Event::Log {
                    line: format!("bridge {device}: session with {peer} ended: {e}"),
                });
            }
        }
    }
}

/// Relay bytes between two duplex streams until either side reaches EOF or
/// errors. The two directions run concurrently; whichever ends first tears
/// the other down. Neither stream is consumed — both are borrowed for the
/// session and stay usable (or droppable) by the caller afterwards.
async fn relay<A, B>(a: &mut A, b: &mut B) -> std::io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut read_a, mut write_a) = tokio::io::split(a);
    let (mut read_b, mut write_b) = tokio::io::split(b);
    tokio::select! {
        res = copy_chunks(&mut read_a, &mut write_b) => res,
        res = copy_chunks(&mut read_b, &mut write_a) => res,
    }
}

/// One-direction copy loop: single in-flight chunk, flush after every write
/// so bytes reach the wire (or the device) immediately.
async fn copy_chunks<R, W>(reader: &mut R, writer: &mut W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; RELAY_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use tokio::io::duplex;
    use tokio::net::TcpStream;

    async fn connect(port: u16) -> TcpStream {
        TcpStream::connect(("127.0.0.1", port)).await.unwrap()
    }

    #[tokio::test]
    async fn relay_round_trips_bytes_in_order() {
        let (mut left_far, mut left_near) = duplex(64);
        let (mut right_far, mut right_near) = duplex(64);

        let session =
            tokio::spawn(async move { relay(&mut left_near, &mut right_near).await.unwrap() });

        left_far.write_all(b"to the device").await.unwrap();
        let mut buf = [0u8; 13];
        right_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to the device");

        right_far.write_all(b"and back").await.unwrap();
        let mut buf = [0u8; 8];
        left_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"and back");

        // EOF on one side ends the session
        drop(left_far);
        session.await.unwrap();
    }

    /// Megabyte-scale stream with write sizes that never align with the
    /// relay chunk, exercising partial reads in both directions at once.
    #[tokio::test]
    async fn relay_preserves_large_interleaved_streams() {
        let (left_far, mut left_near) = duplex(1024);
        let (right_far, mut right_near) = duplex(1024);

        let session = tokio::spawn(async move {
            let _ = relay(&mut left_near, &mut right_near).await;
        });

        const TOTAL: usize = 3 * 1024 * 1024;
        let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
        let reverse: Vec<u8> = (0..TOTAL).map(|i| (i % 239) as u8).collect();

        let (mut left_read, mut left_write) = tokio::io::split(left_far);
        let (mut right_read, mut right_write) = tokio::io::split(right_far);

        let fwd = payload.clone();
        let writer_a = tokio::spawn(async move {
            for chunk in fwd.chunks(7001) {
                left_write.write_all(chunk).await.unwrap();
            }
            left_write.flush().await.unwrap();
        });
        let rev = reverse.clone();
        let writer_b = tokio::spawn(async move {
            for chunk in rev.chunks(5003) {
                right_write.write_all(chunk).await.unwrap();
            }
            right_write.flush().await.unwrap();
        });

        let reader_a = tokio::spawn(async move {
            let mut got = vec![0u8; TOTAL];
            right_read.read_exact(&mut got).await.unwrap();
            got
        });
        let reader_b = tokio::spawn(async move {
            let mut got = vec![0u8; TOTAL];
            left_read.read_exact(&mut got).await.unwrap();
            got
        });

        writer_a.await.unwrap();
        writer_b.await.unwrap();
        assert_eq!(reader_a.await.unwrap(), payload);
        assert_eq!(reader_b.await.unwrap(), reverse);
        session.abort();
    }

    #[tokio::test]
    async fn second_client_is_refused_and_first_session_survives() {
        let (mut device_far, device_near) = duplex(1024);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (events, _rx) = events::channel();
        let mut bridge = Bridge::spawn("virtual".into(), device_near, listener, events);
        let port = bridge.local_port;

        let mut first = connect(port).await;
        first.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        device_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // Second client gets closed immediately, not queued.
        let mut second = connect(port).await;
        let mut scratch = [0u8; 8];
        match second.read(&mut scratch).await {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("second client unexpectedly received {n} bytes"),
        }

        // First session is unaffected.
        device_far.write_all(b"pong").await.unwrap();
        first.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        bridge.stop().await;
    }

    #[tokio::test]
    async fn next_client_is_served_after_disconnect() {
        let (mut device_far, device_near) = duplex(1024);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (events, _rx) = events::channel();
        let mut bridge = Bridge::spawn("virtual".into(), device_near, listener, events);
        let port = bridge.local_port;

        {
            let mut first = connect(port).await;
            first.write_all(b"one").await.unwrap();
            let mut buf = [0u8; 3];
            device_far.read_exact(&mut buf).await.unwrap();
        }

        // After the first client goes away the serial handle survives and
        // the next client is relayed normally.
        let mut second = connect(port).await;
        second.write_all(b"two").await.unwrap();
        let mut buf = [0u8; 3];
        device_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");

        bridge.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_the_listener() {
        let (_device_far, device_near) = duplex(64);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (events, _rx) = events::channel();
        let mut bridge = Bridge::spawn("virtual".into(), device_near, listener, events);
        let port = bridge.local_port;

        bridge.stop().await;
        // stop is idempotent
        bridge.stop().await;

        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn start_fails_fast_on_missing_device() {
        let (events, _rx) = events::channel();
        let err = Bridge::start("/dev/portgate-test-does-not-exist", 9600, "127.0.0.1", 0, events)
            .await
            .unwrap_err();
        match err {
            Error::DeviceUnavailable(msg) => assert!(msg.contains("portgate-test-does-not-exist")),
            other => panic!("expected DeviceUnavailable, got {other}"),
        }
    }
}
