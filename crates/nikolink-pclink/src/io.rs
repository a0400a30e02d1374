//! Link IO task: exclusive owner of the transport.
//!
//! One tokio task owns the `Transport` for its whole life. The command
//! scheduler is the only writer -- its frames arrive on an mpsc channel --
//! and the task is the only reader, accumulating bytes into CR-terminated
//! lines that are decoded (Windows-1252), stripped, and handed to the
//! listener.
//!
//! The task also owns the reconnect policy: when the link drops (or the
//! read side goes silent past the idle timeout), it closes the transport,
//! emits `Disconnected`, and -- when it was built from a connection string
//! rather than an injected transport -- reconnects with exponential
//! backoff capped at 60 s, replaying the handshake and emitting
//! `Connected` so the refresh machinery can run.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nikolink_core::error::{Error, Result};
use nikolink_core::events::BusEvent;
use nikolink_core::transport::Transport;

use crate::handshake;
use crate::protocol;

/// Maximum accumulated bytes without a CR before the buffer is reset.
/// Bus lines are tens of characters; 4096 is generous headroom.
const MAX_LINE: usize = 4096;

/// A frame the scheduler wants on the wire. The CR terminator is appended
/// here, at the last moment before the transport.
pub(crate) struct WriteRequest {
    pub line: String,
    pub done: oneshot::Sender<Result<()>>,
}

/// Re-opens the transport after a connection loss.
pub(crate) type LinkFactory =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = Result<Box<dyn Transport>>> + Send>> + Send + Sync>;

/// Timing knobs of the link task.
#[derive(Debug, Clone)]
pub(crate) struct LinkSettings {
    /// Poll interval for the idle read.
    pub read_poll: Duration,
    /// Silence on the read side longer than this closes the link.
    pub idle_timeout: Duration,
    /// Settle delay between handshake frames.
    pub handshake_settle: Duration,
    /// First reconnect delay.
    pub initial_backoff: Duration,
    /// Backoff cap.
    pub max_backoff: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings {
            read_poll: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(120),
            handshake_settle: handshake::DEFAULT_SETTLE,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Run the link task until cancellation or an unrecoverable loss.
pub(crate) async fn run_link(
    transport: Box<dyn Transport>,
    factory: Option<LinkFactory>,
    settings: LinkSettings,
    mut write_rx: mpsc::Receiver<WriteRequest>,
    line_tx: mpsc::Sender<String>,
    event_tx: broadcast::Sender<BusEvent>,
    cancel: CancellationToken,
) {
    let mut transport = transport;

    loop {
        let outcome = serve(&mut *transport, &settings, &mut write_rx, &line_tx, &cancel).await;
        let _ = transport.close().await;

        match outcome {
            ServeEnd::Shutdown => {
                debug!("link task shutting down");
                return;
            }
            ServeEnd::Lost(e) => {
                warn!(error = %e, "link lost");
                let _ = event_tx.send(BusEvent::Disconnected);
            }
        }

        let Some(factory) = factory.as_ref() else {
            // Injected transport: nothing to reconnect to. Keep failing
            // writes so callers see the loss instead of hanging.
            fail_writes_until_closed(&mut write_rx, &cancel).await;
            return;
        };

        match reconnect(factory, &settings, &mut write_rx, &event_tx, &cancel).await {
            Some(t) => transport = t,
            None => return,
        }
    }
}

enum ServeEnd {
    Shutdown,
    Lost(Error),
}

/// Serve one connected session: writes from the scheduler, reads into
/// CR-delimited lines.
async fn serve(
    transport: &mut dyn Transport,
    settings: &LinkSettings,
    write_rx: &mut mpsc::Receiver<WriteRequest>,
    line_tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
) -> ServeEnd {
    let mut acc: Vec<u8> = Vec::new();
    let mut buf = [0u8; 256];
    let mut last_rx = tokio::time::Instant::now();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                return ServeEnd::Shutdown;
            }

            req = write_rx.recv() => {
                match req {
                    None => return ServeEnd::Shutdown,
                    Some(WriteRequest { line, done }) => {
                        let mut bytes = line.into_bytes();
                        bytes.push(b'\r');
                        match transport.send(&bytes).await {
                            Ok(()) => {
                                let _ = done.send(Ok(()));
                            }
                            Err(e) if is_fatal(&e) => {
                                let _ = done.send(Err(Error::TransportLost));
                                return ServeEnd::Lost(e);
                            }
                            Err(e) => {
                                warn!(error = %e, "write failed");
                                let _ = done.send(Err(e));
                            }
                        }
                    }
                }
            }

            result = transport.receive(&mut buf, settings.read_poll) => {
                match result {
                    Ok(0) => {}
                    Ok(n) => {
                        last_rx = tokio::time::Instant::now();
                        acc.extend_from_slice(&buf[..n]);
                        if acc.len() > MAX_LINE {
                            warn!(len = acc.len(), "read buffer overflow, resetting");
                            acc.clear();
                        }
                        for line in drain_lines(&mut acc) {
                            if line_tx.send(line).await.is_err() {
                                return ServeEnd::Shutdown;
                            }
                        }
                    }
                    Err(Error::Timeout) => {
                        if last_rx.elapsed() > settings.idle_timeout {
                            return ServeEnd::Lost(Error::TransportLost);
                        }
                    }
                    Err(e) => {
                        return ServeEnd::Lost(e);
                    }
                }
            }
        }
    }
}

/// Whether a transport error ends the session.
fn is_fatal(e: &Error) -> bool {
    matches!(e, Error::TransportLost | Error::NotConnected | Error::Io(_))
}

/// Split complete CR-terminated lines out of the accumulator, decoding
/// and stripping each. Incomplete data stays for the next read.
fn drain_lines(acc: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = acc.iter().position(|&b| b == b'\r') {
        let raw: Vec<u8> = acc.drain(..=pos).collect();
        let line = protocol::decode_cp1252(&raw[..raw.len() - 1]);
        let line = line.trim();
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    lines
}

/// Reconnect with exponential backoff, failing writes while down.
/// Returns `None` on cancellation or when every channel is gone.
async fn reconnect(
    factory: &LinkFactory,
    settings: &LinkSettings,
    write_rx: &mut mpsc::Receiver<WriteRequest>,
    event_tx: &broadcast::Sender<BusEvent>,
    cancel: &CancellationToken,
) -> Option<Box<dyn Transport>> {
    let mut attempt: u32 = 1;
    let mut backoff = settings.initial_backoff;

    loop {
        let _ = event_tx.send(BusEvent::Reconnecting { attempt });
        info!(attempt, backoff_s = backoff.as_secs(), "reconnecting");

        if !wait_failing_writes(backoff, write_rx, cancel).await {
            return None;
        }

        match factory().await {
            Ok(mut transport) => {
                match handshake::perform(&mut *transport, settings.handshake_settle).await {
                    Ok(()) => {
                        info!(attempt, "reconnected");
                        let _ = event_tx.send(BusEvent::Connected);
                        return Some(transport);
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "handshake failed after reconnect");
                        let _ = transport.close().await;
                    }
                }
            }
            Err(e) => {
                warn!(attempt, error = %e, "reconnect attempt failed");
            }
        }

        attempt += 1;
        backoff = (backoff * 2).min(settings.max_backoff);
    }
}

/// Sleep for `period` while answering any write request with
/// `TransportUnavailable`. Returns `false` on cancellation.
async fn wait_failing_writes(
    period: Duration,
    write_rx: &mut mpsc::Receiver<WriteRequest>,
    cancel: &CancellationToken,
) -> bool {
    let deadline = tokio::time::Instant::now() + period;
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return false,

            _ = tokio::time::sleep_until(deadline) => return true,

            req = write_rx.recv() => {
                match req {
                    None => return false,
                    Some(WriteRequest { done, .. }) => {
                        let _ = done.send(Err(Error::TransportUnavailable(
                            "reconnecting".into(),
                        )));
                    }
                }
            }
        }
    }
}

/// Terminal state for injected transports: fail writes until shutdown.
async fn fail_writes_until_closed(
    write_rx: &mut mpsc::Receiver<WriteRequest>,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            req = write_rx.recv() => {
                match req {
                    None => return,
                    Some(WriteRequest { done, .. }) => {
                        let _ = done.send(Err(Error::NotConnected));
                    }
                }
            }
        }
    }
}
