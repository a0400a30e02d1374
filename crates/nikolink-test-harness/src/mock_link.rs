//! Mock transport for deterministic testing of the protocol engine.
//!
//! [`MockLink`] implements the [`Transport`] trait; its paired
//! [`MockBus`] handle stays with the test and plays the part of the
//! installation: it scripts responses to expected command frames,
//! injects unsolicited traffic (button repeats, feedback answers), and
//! records every byte the engine transmits.
//!
//! # Example
//!
//! ```
//! use nikolink_test_harness::MockLink;
//!
//! let (link, bus) = MockLink::pair();
//! // When the engine sends this frame, answer with an ACK and a state answer.
//! bus.expect(
//!     "$10120747402BFC",
//!     &["$0512", "$1C074700FF0000000000CCAEA3"],
//! );
//! // A wall button being held:
//! bus.inject("#N4ECB1A");
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use nikolink_core::error::{Error, Result};
use nikolink_core::transport::Transport;

/// A scripted request/response pair.
#[derive(Debug, Clone)]
struct Expectation {
    /// The exact line the engine is expected to send.
    request: String,
    /// Lines delivered to the engine when the request is observed.
    responses: Vec<String>,
}

#[derive(Debug, Default)]
struct Shared {
    /// Bytes waiting to be `receive()`d by the engine.
    rx: Mutex<VecDeque<u8>>,
    /// Complete CR-terminated lines the engine has sent.
    sent: Mutex<Vec<String>>,
    /// Raw byte capture of everything sent.
    raw_sent: Mutex<Vec<u8>>,
    /// Bytes sent since the last CR.
    sent_partial: Mutex<Vec<u8>>,
    /// Scripted request/response pairs; first match wins and is consumed.
    expectations: Mutex<VecDeque<Expectation>>,
    connected: AtomicBool,
    /// Simulated link loss, distinct from an orderly close.
    lost: AtomicBool,
}

/// The engine-side half: a [`Transport`] implementation.
pub struct MockLink {
    shared: Arc<Shared>,
    rx_notify: Arc<Notify>,
    sent_notify: Arc<Notify>,
}

/// The test-side half: scripts the bus and observes the engine.
#[derive(Clone)]
pub struct MockBus {
    shared: Arc<Shared>,
    rx_notify: Arc<Notify>,
    sent_notify: Arc<Notify>,
}

impl MockLink {
    /// Create a connected link/bus pair.
    pub fn pair() -> (MockLink, MockBus) {
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(true),
            ..Default::default()
        });
        let rx_notify = Arc::new(Notify::new());
        let sent_notify = Arc::new(Notify::new());
        (
            MockLink {
                shared: shared.clone(),
                rx_notify: rx_notify.clone(),
                sent_notify: sent_notify.clone(),
            },
            MockBus {
                shared,
                rx_notify,
                sent_notify,
            },
        )
    }
}

impl MockBus {
    /// Script a response: when the engine sends `request` (one line,
    /// without the CR), deliver each of `responses` as a CR-terminated
    /// line. Expectations are consumed; script the same request twice to
    /// answer a retransmission.
    pub fn expect(&self, request: &str, responses: &[&str]) {
        self.shared
            .expectations
            .lock()
            .unwrap()
            .push_back(Expectation {
                request: request.to_string(),
                responses: responses.iter().map(|s| s.to_string()).collect(),
            });
    }

    /// Deliver an unsolicited line to the engine (button repeat,
    /// feedback-module answer, noise).
    pub fn inject(&self, line: &str) {
        let mut rx = self.shared.rx.lock().unwrap();
        rx.extend(line.as_bytes());
        rx.push_back(b'\r');
        drop(rx);
        self.rx_notify.notify_waiters();
    }

    /// Deliver raw bytes with no CR appended (partial frames, garbage).
    pub fn inject_raw(&self, bytes: &[u8]) {
        self.shared.rx.lock().unwrap().extend(bytes);
        self.rx_notify.notify_waiters();
    }

    /// All complete lines the engine has sent, in order.
    pub fn sent_lines(&self) -> Vec<String> {
        self.shared.sent.lock().unwrap().clone()
    }

    /// The exact byte stream the engine has transmitted.
    pub fn raw_sent(&self) -> Vec<u8> {
        self.shared.raw_sent.lock().unwrap().clone()
    }

    /// Number of scripted expectations not yet consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.shared.expectations.lock().unwrap().len()
    }

    /// Simulate the link dropping mid-session.
    pub fn drop_link(&self) {
        self.shared.lost.store(true, Ordering::SeqCst);
        self.rx_notify.notify_waiters();
    }

    /// Wait until the engine has sent `line`, or time out.
    pub async fn wait_for_sent(&self, line: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.sent_lines().iter().any(|l| l == line) {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = tokio::time::timeout(deadline - now, self.sent_notify.notified()).await;
        }
    }

    /// Wait until the engine has sent at least `count` lines.
    pub async fn wait_for_sent_count(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.sent_lines().len() >= count {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = tokio::time::timeout(deadline - now, self.sent_notify.notified()).await;
        }
    }
}

#[async_trait]
impl Transport for MockLink {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.shared.lost.load(Ordering::SeqCst) {
            return Err(Error::TransportLost);
        }
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }

        self.shared.raw_sent.lock().unwrap().extend_from_slice(data);

        // Split the byte stream on CR into complete lines, matching them
        // against the script as they complete.
        let mut completed = Vec::new();
        {
            let mut partial = self.shared.sent_partial.lock().unwrap();
            for &byte in data {
                if byte == b'\r' {
                    let line = String::from_utf8_lossy(&partial).to_string();
                    partial.clear();
                    completed.push(line);
                } else {
                    partial.push(byte);
                }
            }
        }

        for line in completed {
            self.shared.sent.lock().unwrap().push(line.clone());

            let responses = {
                let mut expectations = self.shared.expectations.lock().unwrap();
                match expectations.iter().position(|e| e.request == line) {
                    Some(at) => expectations.remove(at).map(|e| e.responses),
                    None => None,
                }
            };
            if let Some(responses) = responses {
                let mut rx = self.shared.rx.lock().unwrap();
                for response in responses {
                    rx.extend(response.as_bytes());
                    rx.push_back(b'\r');
                }
                drop(rx);
                self.rx_notify.notify_waiters();
            }
        }

        self.sent_notify.notify_waiters();
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.shared.lost.load(Ordering::SeqCst) {
                return Err(Error::TransportLost);
            }
            if !self.shared.connected.load(Ordering::SeqCst) {
                return Err(Error::NotConnected);
            }

            {
                let mut rx = self.shared.rx.lock().unwrap();
                if !rx.is_empty() {
                    let n = rx.len().min(buf.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = rx.pop_front().expect("checked non-empty");
                    }
                    return Ok(n);
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let _ = tokio::time::timeout(deadline - now, self.rx_notify.notified()).await;
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.rx_notify.notify_waiters();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
            && !self.shared.lost.load(Ordering::SeqCst)
    }
}
