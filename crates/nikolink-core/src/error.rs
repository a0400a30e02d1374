//! Error types for nikolink.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, framing-layer, and
//! command-layer errors are all captured here.

/// Reason a received `$` frame was rejected by the validator.
///
/// Rejected frames are logged and dropped; they are never surfaced to the
/// caller of a command because they are unsolicited input. A reject on a
/// frame that matched an awaited answer counts as a failed attempt and
/// triggers a retransmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRejectReason {
    /// The two length characters after `$` are not valid hexadecimal.
    NonHexLength,
    /// The frame's character count does not match its declared length.
    LengthMismatch,
    /// The trailing CRC-8 does not match the frame's ASCII prefix.
    Crc8Mismatch,
}

impl std::fmt::Display for FrameRejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FrameRejectReason::NonHexLength => "non-hex length field",
            FrameRejectReason::LengthMismatch => "length mismatch",
            FrameRejectReason::Crc8Mismatch => "CRC-8 mismatch",
        };
        write!(f, "{s}")
    }
}

/// The error type for all nikolink operations.
///
/// Variants cover the full range of failure modes encountered when talking
/// to a Nikobus installation: physical transport failures, frame rejects,
/// correlation timeouts, and bad arguments from the host.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The link could not be opened (bad port, refused connection).
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The link dropped mid-session. In-flight commands complete with this
    /// error; the engine reconnects with backoff if it owns the link.
    #[error("transport lost")]
    TransportLost,

    /// No connection has been established, or the engine was shut down.
    #[error("not connected")]
    NotConnected,

    /// A received `$` frame failed validation and was dropped.
    #[error("frame rejected: {0}")]
    FrameRejected(FrameRejectReason),

    /// A transport read or write did not complete within its deadline.
    ///
    /// This is the benign polling signal used by the engine's read loop;
    /// command-level correlation timeouts are [`Error::AckTimeout`] and
    /// [`Error::AnswerTimeout`].
    #[error("timeout waiting for data")]
    Timeout,

    /// No ACK echo arrived within the ACK window.
    #[error("timeout waiting for command ACK")]
    AckTimeout,

    /// The ACK arrived but no matching answer frame did.
    #[error("timeout waiting for command answer")]
    AnswerTimeout,

    /// A command was retransmitted the maximum number of times without a
    /// correlated ACK + answer.
    #[error("command retries exhausted")]
    RetriesExhausted,

    /// A command referenced a module address that is not in the configuration.
    #[error("unknown module: {0}")]
    UnknownModule(String),

    /// A bad argument from the caller (channel, brightness, or position out
    /// of range). Raised synchronously at call time.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
