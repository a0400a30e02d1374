//! Command scheduler: a single FIFO with pacing, ACK/answer correlation,
//! and bounded retry.
//!
//! The scheduler worker is the only component that writes to the
//! transport. Its contract:
//!
//! - **Pacing**: at least [`COMMAND_PACING`] between the end of one
//!   command and the start of the next. Inside one command, a short
//!   [`ACK_SETTLE_DELAY`] passes between the write and watching the read
//!   stream for the ACK.
//! - **Correlation**: a correlated command installs its expected ACK and
//!   answer signals before the write, then consumes the response lane
//!   until both arrive or the ACK window closes.
//! - **Retry**: up to [`MAX_ATTEMPTS`] transmissions. A missing ACK, a
//!   missing answer, or a CRC-8 reject on a frame that otherwise matched
//!   the awaited answer all count as a failed attempt. Exhaustion fails
//!   the command; later queue items still run.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nikolink_core::error::{Error, Result};
use nikolink_core::events::BusEvent;
use nikolink_core::types::{Group, ModuleAddress};

use crate::commands::{self, CorrelationSignals};
use crate::io::WriteRequest;
use crate::protocol;
use crate::state::StateCache;

/// Minimum gap between consecutive commands on the bus.
pub const COMMAND_PACING: Duration = Duration::from_millis(300);

/// Delay between writing a frame and watching for its ACK.
pub const ACK_SETTLE_DELAY: Duration = Duration::from_millis(80);

/// Three-strike retransmission policy.
pub const MAX_ATTEMPTS: u32 = 3;

/// Default window for the ACK + answer of one attempt.
pub const DEFAULT_ACK_WINDOW: Duration = Duration::from_secs(15);

/// Default wait for each individual response line.
pub const DEFAULT_ANSWER_TIMEOUT: Duration = Duration::from_secs(5);

/// Scheduler timing knobs, adjustable through the builder.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub pacing: Duration,
    pub ack_settle: Duration,
    pub ack_window: Duration,
    pub answer_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            pacing: COMMAND_PACING,
            ack_settle: ACK_SETTLE_DELAY,
            ack_window: DEFAULT_ACK_WINDOW,
            answer_timeout: DEFAULT_ANSWER_TIMEOUT,
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

/// What a queued command expects back from the bus.
pub(crate) enum Correlate {
    /// Fire-and-forget (button actions, handshake-style frames).
    None,
    /// Await the ACK token and the matching answer.
    Expect {
        signals: CorrelationSignals,
        /// Apply the answered 6 bytes to this cache slot on success
        /// (write commands: the acknowledged-state path).
        apply: Option<(ModuleAddress, Group)>,
    },
}

/// A record in the scheduler queue.
pub(crate) struct BusCommand {
    pub frame: String,
    pub correlate: Correlate,
    pub reply: Option<oneshot::Sender<Result<Option<[u8; 6]>>>>,
}

/// Cloneable producer handle onto the command queue.
#[derive(Clone)]
pub(crate) struct SchedulerHandle {
    cmd_tx: mpsc::Sender<BusCommand>,
}

impl SchedulerHandle {
    /// Queue a frame with no correlation and return once it is on the wire.
    pub async fn send_raw(&self, frame: String) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let cmd = BusCommand {
            frame,
            correlate: Correlate::None,
            reply: Some(tx),
        };
        self.cmd_tx.send(cmd).await.map_err(|_| Error::NotConnected)?;
        rx.await.map_err(|_| Error::NotConnected)?.map(|_| ())
    }

    /// Queue a correlated command and await its answered state bytes.
    pub async fn transact(
        &self,
        frame: String,
        signals: CorrelationSignals,
        apply: Option<(ModuleAddress, Group)>,
    ) -> Result<[u8; 6]> {
        let (tx, rx) = oneshot::channel();
        let cmd = BusCommand {
            frame,
            correlate: Correlate::Expect { signals, apply },
            reply: Some(tx),
        };
        self.cmd_tx.send(cmd).await.map_err(|_| Error::NotConnected)?;
        let state = rx.await.map_err(|_| Error::NotConnected)??;
        state.ok_or(Error::AnswerTimeout)
    }

    /// Read one group's state off the bus.
    pub async fn read_group(&self, addr: ModuleAddress, group: Group) -> Result<[u8; 6]> {
        let frame = commands::read_command(addr, group);
        let signals = commands::correlation_signals(&frame, addr);
        self.transact(frame, signals, None).await
    }

    /// Write one group's state to the bus and await the acknowledged
    /// answer. The answered bytes land in the cache.
    pub async fn write_group(
        &self,
        addr: ModuleAddress,
        group: Group,
        values: [u8; 6],
    ) -> Result<()> {
        let frame = commands::write_command(addr, group, values);
        let signals = commands::correlation_signals(&frame, addr);
        self.transact(frame, signals, Some((addr, group))).await?;
        Ok(())
    }
}

/// Spawn-side constructor: the handle plus the receiving end the worker
/// consumes.
pub(crate) fn command_queue(depth: usize) -> (SchedulerHandle, mpsc::Receiver<BusCommand>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(depth);
    (SchedulerHandle { cmd_tx }, cmd_rx)
}

/// The scheduler worker loop.
pub(crate) async fn run(
    settings: SchedulerSettings,
    mut cmd_rx: mpsc::Receiver<BusCommand>,
    mut response_rx: mpsc::Receiver<String>,
    write_tx: mpsc::Sender<WriteRequest>,
    cache: Arc<StateCache>,
    event_tx: broadcast::Sender<BusEvent>,
    cancel: CancellationToken,
) {
    debug!("command scheduler running");
    loop {
        let cmd = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };

        // Stale responses from earlier traffic must not satisfy this
        // command's correlation.
        while response_rx.try_recv().is_ok() {}

        let result = execute(&settings, &cmd, &mut response_rx, &write_tx).await;

        if let (Correlate::Expect { apply: Some((addr, group)), .. }, Ok(Some(state))) =
            (&cmd.correlate, &result)
        {
            match cache.apply_group(*addr, *group, *state) {
                Ok(()) => {
                    let _ = event_tx.send(BusEvent::Refreshed { module: *addr });
                }
                Err(e) => warn!(module = %addr, error = %e, "cache apply failed"),
            }
        }

        if let Some(reply) = cmd.reply {
            let _ = reply.send(result);
        }

        tokio::time::sleep(settings.pacing).await;
    }

    // Fail anything still queued so callers do not hang on shutdown.
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        if let Some(reply) = cmd.reply {
            let _ = reply.send(Err(Error::NotConnected));
        }
    }
    debug!("command scheduler stopped");
}

/// Transmit one command, retrying per the three-strike policy.
async fn execute(
    settings: &SchedulerSettings,
    cmd: &BusCommand,
    response_rx: &mut mpsc::Receiver<String>,
    write_tx: &mpsc::Sender<WriteRequest>,
) -> Result<Option<[u8; 6]>> {
    let Correlate::Expect { signals, .. } = &cmd.correlate else {
        write_line(write_tx, &cmd.frame).await?;
        return Ok(None);
    };

    let mut last_failure = Error::AckTimeout;

    for attempt in 1..=settings.max_attempts {
        if attempt > 1 {
            debug!(attempt, frame = %cmd.frame, "retransmitting");
            tokio::time::sleep(settings.pacing).await;
        }

        write_line(write_tx, &cmd.frame).await?;
        tokio::time::sleep(settings.ack_settle).await;

        match await_correlation(settings, signals, response_rx).await {
            Ok(state) => return Ok(Some(state)),
            Err(e @ (Error::TransportLost | Error::NotConnected)) => return Err(e),
            Err(e) => {
                debug!(attempt, error = %e, "attempt failed");
                last_failure = e;
            }
        }
    }

    warn!(
        frame = %cmd.frame,
        attempts = settings.max_attempts,
        last = %last_failure,
        "command retries exhausted"
    );
    Err(Error::RetriesExhausted)
}

/// Consume response lines until the ACK and the answer both arrive.
async fn await_correlation(
    settings: &SchedulerSettings,
    signals: &CorrelationSignals,
    response_rx: &mut mpsc::Receiver<String>,
) -> Result<[u8; 6]> {
    let deadline = tokio::time::Instant::now() + settings.ack_window;
    let mut ack = false;
    let mut state: Option<[u8; 6]> = None;

    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        let wait = settings.answer_timeout.min(deadline - now);

        let line = match tokio::time::timeout(wait, response_rx.recv()).await {
            Ok(Some(line)) => line,
            Ok(None) => return Err(Error::TransportLost),
            Err(_) => break,
        };

        if line.contains(&signals.ack) {
            debug!(line = %line, "ACK received");
            ack = true;
        }

        if line.contains(&signals.answer) {
            match extract_state(&line, signals) {
                Ok(s) => {
                    debug!(line = %line, "answer received");
                    state = Some(s);
                }
                Err(e) => {
                    // A frame that matched the awaited answer but failed
                    // validation counts as a failed attempt.
                    warn!(line = %line, error = %e, "matched answer rejected");
                    return Err(e);
                }
            }
        }

        if ack {
            if let Some(state) = state {
                return Ok(state);
            }
        }
    }

    Err(if ack { Error::AnswerTimeout } else { Error::AckTimeout })
}

/// Pull the 6 state bytes out of a line matching the answer signal.
///
/// `$1C` read answers are full `$` frames and pass through the validator
/// (CRC-8 enforced); `$0EFF` write answers are matched by offset only, as
/// upstream clients have always done.
fn extract_state(line: &str, signals: &CorrelationSignals) -> Result<[u8; 6]> {
    if signals.answer.starts_with(commands::FEEDBACK_ANSWER_PREFIX) {
        let frame = protocol::validate_frame(line)?;
        commands::parse_feedback_answer(&frame)
            .map(|(_, state)| state)
            .ok_or(Error::AnswerTimeout)
    } else {
        commands::extract_answer_state(line, &signals.answer).ok_or(Error::AnswerTimeout)
    }
}

/// Hand a frame to the link task and wait for it to hit the wire.
async fn write_line(write_tx: &mpsc::Sender<WriteRequest>, frame: &str) -> Result<()> {
    let (done, done_rx) = oneshot::channel();
    write_tx
        .send(WriteRequest {
            line: frame.to_string(),
            done,
        })
        .await
        .map_err(|_| Error::NotConnected)?;
    done_rx.await.map_err(|_| Error::TransportLost)?
}
