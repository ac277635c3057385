//! Notification protocol handler for the Tokio runtime.

use bytes::BytesMut;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use super::command::{self, Command};
use super::message::Notification;
use crate::config::Config;

/// Initial capacity for the request line and the notification buffer.
const LINE_CAPACITY: usize = 128;

/// Per-connection knobs, copied into every handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Pause between two notifications.
    pub interval: Duration,
    /// Upper bound on the request line, terminator included.
    pub max_request_line: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_request_line: 1024,
        }
    }
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.interval,
            max_request_line: config.max_request_line,
        }
    }
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The first line was not `START`; the farewell was sent.
    Rejected,
    /// A write failed, usually because the client went away.
    PeerGone,
    /// The server asked every handler to stop.
    Shutdown,
}

/// Handle a notification protocol connection.
///
/// Reads one request line, then either says goodbye or streams
/// notifications until a write fails or `shutdown` fires. A failed read is
/// not fatal: whatever arrived before the error is still classified, which
/// in practice lands on the farewell path.
///
/// The stream is dropped, and so closed, when this returns.
pub async fn handle_connection<S>(
    stream: S,
    settings: Settings,
    mut shutdown: broadcast::Receiver<()>,
) -> Outcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = Vec::with_capacity(LINE_CAPACITY);
    let mut limited = (&mut reader).take(settings.max_request_line);

    tokio::select! {
        result = limited.read_until(b'\n', &mut line) => {
            match result {
                Ok(0) => warn!("Connection closed before a request line"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, partial = line.len(), "Failed to read request line"),
            }
        }
        _ = shutdown.recv() => return Outcome::Shutdown,
    }

    debug!(request = ?String::from_utf8_lossy(&line), "Request line");

    // Anything buffered past the request line is dropped with the reader.
    let mut stream = reader.into_inner();

    if Command::parse(&line) != Command::Start {
        if let Err(e) = send(&mut stream, command::response_goodbye()).await {
            trace!(error = %e, "Failed to send farewell");
        }
        return Outcome::Rejected;
    }

    if let Err(e) = send(&mut stream, command::response_started()).await {
        trace!(error = %e, "Failed to send acknowledgement");
        return Outcome::PeerGone;
    }

    debug!(interval_ms = settings.interval.as_millis() as u64, "Streaming notifications");
    push_loop(&mut stream, settings.interval, &mut shutdown).await
}

/// Write one notification per `interval` until a write fails or shutdown.
async fn push_loop<W>(
    stream: &mut W,
    interval: Duration,
    shutdown: &mut broadcast::Receiver<()>,
) -> Outcome
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(LINE_CAPACITY);

    loop {
        tokio::select! {
            result = write_notification(&mut *stream, &mut buf) => {
                if let Err(e) = result {
                    trace!(error = %e, "Notification write failed");
                    return Outcome::PeerGone;
                }
            }
            _ = shutdown.recv() => return Outcome::Shutdown,
        }

        trace!("Notification sent");

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.recv() => return Outcome::Shutdown,
        }
    }
}

/// Stamp, encode and write a single notification line.
async fn write_notification<W>(stream: &mut W, buf: &mut BytesMut) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    buf.clear();
    Notification::current_time().encode(buf)?;
    send(stream, buf).await
}

async fn send<W>(stream: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(bytes).await?;
    stream.flush().await
}
