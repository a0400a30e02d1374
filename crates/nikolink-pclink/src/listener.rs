//! Listener: routes CR-delimited lines into their four lanes.
//!
//! One line at a time, in arrival order:
//!
//! | Line                      | Route                                        |
//! |---------------------------|----------------------------------------------|
//! | contains `#N`             | button FSM (6 hex chars after `#N`)          |
//! | `$0510$2E…` / `$0522$1E…` | inventory collector                          |
//! | `$0512` / `$0517`         | group hint for the next `$1C` answer, then the response lane |
//! | `$1C…`                    | validate, apply to the state cache, emit `refreshed`, then the response lane |
//! | `$18…`                    | interface reports its own address; logged    |
//! | anything else             | response lane for scheduler correlation      |
//!
//! The feedback answer does not encode which group it describes; the
//! group is inferred from the refresh command observed immediately
//! before. That inference is racy when two refreshes are in flight, which
//! is why the engine keeps at most one outstanding refresh per module.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nikolink_core::events::BusEvent;
use nikolink_core::types::{ButtonAddress, Group};

use crate::commands;
use crate::discovery;
use crate::protocol;
use crate::state::StateCache;

/// Routing state and output lanes of the listener.
pub(crate) struct Listener {
    pub cache: Arc<StateCache>,
    pub event_tx: broadcast::Sender<BusEvent>,
    pub button_tx: mpsc::Sender<ButtonAddress>,
    pub response_tx: mpsc::Sender<String>,
    pub inventory_tx: mpsc::Sender<String>,
    /// Which group the next `$1C` answer describes.
    group_hint: Group,
}

impl Listener {
    pub fn new(
        cache: Arc<StateCache>,
        event_tx: broadcast::Sender<BusEvent>,
        button_tx: mpsc::Sender<ButtonAddress>,
        response_tx: mpsc::Sender<String>,
        inventory_tx: mpsc::Sender<String>,
    ) -> Self {
        Listener {
            cache,
            event_tx,
            button_tx,
            response_tx,
            inventory_tx,
            group_hint: Group::One,
        }
    }

    /// Route one stripped line.
    pub async fn dispatch(&mut self, line: &str) {
        if let Some(address) = protocol::button_address_in(line) {
            debug!(%address, "button frame");
            let _ = self.button_tx.send(address).await;
            return;
        }

        if discovery::is_inventory_response(line) {
            debug!(line, "inventory response");
            let _ = self.inventory_tx.send(line.to_string()).await;
            return;
        }

        if line.starts_with(commands::REFRESH_ACK_GROUP1) {
            self.group_hint = Group::One;
            self.forward_response(line);
            return;
        }
        if line.starts_with(commands::REFRESH_ACK_GROUP2) {
            self.group_hint = Group::Two;
            self.forward_response(line);
            return;
        }

        if line.starts_with(commands::FEEDBACK_ANSWER_PREFIX) {
            self.handle_feedback_answer(line).await;
            return;
        }

        if line.starts_with(commands::CONTROLLER_ADDRESS_PREFIX) {
            debug!(address = line.get(3..7).unwrap_or(""), "interface address");
            return;
        }

        debug!(line, "forwarding to response lane");
        self.forward_response(line);
    }

    /// Hand a line to the scheduler's correlation lane.
    ///
    /// Non-blocking: when nothing is awaiting correlation the lane fills
    /// with Feedback-Module chatter, and dropping stale lines is exactly
    /// what the scheduler's own pre-command drain would do. Blocking here
    /// would back up the read path all the way to the transport.
    fn forward_response(&self, line: &str) {
        if let Err(e) = self.response_tx.try_send(line.to_string()) {
            debug!(line, error = %e, "response lane full, dropping");
        }
    }

    /// Validate a `$1C` answer, mirror it into the cache under the hinted
    /// group, and emit `refreshed` exactly once. The raw line still goes
    /// to the response lane so a pending read can correlate on it.
    async fn handle_feedback_answer(&mut self, line: &str) {
        match protocol::validate_frame(line) {
            Ok(frame) => {
                if let Some((module, state)) = commands::parse_feedback_answer(&frame) {
                    match self.cache.apply_group(module, self.group_hint, state) {
                        Ok(()) => {
                            debug!(%module, group = %self.group_hint, "state refreshed");
                            let _ = self.event_tx.send(BusEvent::Refreshed { module });
                        }
                        Err(e) => {
                            // Answers for modules outside the config are
                            // normal when a Feedback Module polls the
                            // whole installation.
                            debug!(%module, error = %e, "feedback answer for unknown module");
                        }
                    }
                }
                self.forward_response(line);
            }
            Err(e) => {
                warn!(line, error = %e, "dropping invalid feedback frame");
            }
        }
    }
}

/// Consume lines from the link task until shutdown.
pub(crate) async fn run(
    mut listener: Listener,
    mut line_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    debug!("listener running");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = line_rx.recv() => match line {
                Some(line) => listener.dispatch(&line).await,
                None => break,
            },
        }
    }
    debug!("listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use nikolink_core::config::{BusConfig, ModuleRegistry};
    use nikolink_core::types::ModuleAddress;

    struct Harness {
        listener: Listener,
        cache: Arc<StateCache>,
        event_rx: broadcast::Receiver<BusEvent>,
        button_rx: mpsc::Receiver<ButtonAddress>,
        response_rx: mpsc::Receiver<String>,
        inventory_rx: mpsc::Receiver<String>,
    }

    fn harness() -> Harness {
        let config: BusConfig = serde_json::from_str(
            r#"{"modules": [{"type": "switch", "address": "4707", "channels": [
                {"description": "1"}, {"description": "2"}, {"description": "3"},
                {"description": "4"}, {"description": "5"}, {"description": "6"},
                {"description": "7"}, {"description": "8"}, {"description": "9"},
                {"description": "10"}, {"description": "11"}, {"description": "12"}
            ]}]}"#,
        )
        .unwrap();
        let cache = Arc::new(StateCache::new(&ModuleRegistry::new(&config)));
        let (event_tx, event_rx) = broadcast::channel(32);
        let (button_tx, button_rx) = mpsc::channel(32);
        let (response_tx, response_rx) = mpsc::channel(32);
        let (inventory_tx, inventory_rx) = mpsc::channel(32);

        Harness {
            listener: Listener::new(
                cache.clone(),
                event_tx,
                button_tx,
                response_tx,
                inventory_tx,
            ),
            cache,
            event_rx,
            button_rx,
            response_rx,
            inventory_rx,
        }
    }

    fn addr(s: &str) -> ModuleAddress {
        ModuleAddress::from_hex(s).unwrap()
    }

    #[tokio::test]
    async fn button_frames_reach_the_button_lane() {
        let mut h = harness();
        h.listener.dispatch("#N4ECB1A").await;

        let address = h.button_rx.recv().await.unwrap();
        assert_eq!(address, ButtonAddress::from_hex("4ECB1A").unwrap());
        assert!(h.response_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn feedback_answer_updates_cache_after_group1_hint() {
        let mut h = harness();

        h.listener.dispatch("$0512").await;
        h.listener.dispatch("$1C074700FF0000000000CCAEA3").await;

        assert_eq!(h.cache.channel(addr("4707"), 1).unwrap(), 0xFF);
        for channel in 2..=6 {
            assert_eq!(h.cache.channel(addr("4707"), channel).unwrap(), 0x00);
        }

        // refreshed fires exactly once.
        match h.event_rx.try_recv().unwrap() {
            BusEvent::Refreshed { module } => assert_eq!(module, addr("4707")),
            other => panic!("expected Refreshed, got {other:?}"),
        }
        assert!(h.event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn group2_hint_routes_bytes_to_the_upper_half() {
        let mut h = harness();

        h.listener.dispatch("$0517").await;
        h.listener.dispatch("$1C074700FF0000000000CCAEA3").await;

        assert_eq!(h.cache.channel(addr("4707"), 7).unwrap(), 0xFF);
        assert_eq!(h.cache.channel(addr("4707"), 1).unwrap(), 0x00);
    }

    #[tokio::test]
    async fn acks_and_answers_reach_the_response_lane() {
        let mut h = harness();

        h.listener.dispatch("$0512").await;
        h.listener.dispatch("$1C074700FF0000000000CCAEA3").await;
        h.listener.dispatch("$0515").await;
        h.listener.dispatch("$0EFF074700FF0000000000").await;

        assert_eq!(h.response_rx.recv().await.unwrap(), "$0512");
        assert_eq!(
            h.response_rx.recv().await.unwrap(),
            "$1C074700FF0000000000CCAEA3"
        );
        assert_eq!(h.response_rx.recv().await.unwrap(), "$0515");
        assert_eq!(
            h.response_rx.recv().await.unwrap(),
            "$0EFF074700FF0000000000"
        );
    }

    #[tokio::test]
    async fn invalid_feedback_frame_is_dropped_entirely() {
        let mut h = harness();

        // Corrupted CRC-8: no cache update, no event, not forwarded.
        h.listener.dispatch("$1C074700FF0000000000CCAE00").await;

        assert_eq!(h.cache.channel(addr("4707"), 1).unwrap(), 0x00);
        assert!(h.event_rx.try_recv().is_err());
        assert!(h.response_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn feedback_answer_for_unknown_module_is_tolerated() {
        let mut h = harness();

        h.listener.dispatch("$1CA5C900000080000000F8908F").await;

        // No event, but the line still reaches the response lane.
        assert!(h.event_rx.try_recv().is_err());
        assert_eq!(
            h.response_rx.recv().await.unwrap(),
            "$1CA5C900000080000000F8908F"
        );
    }

    #[tokio::test]
    async fn inventory_responses_take_their_own_lane() {
        let mut h = harness();

        h.listener
            .dispatch("$0522$1E000177C958022BFF112233")
            .await;

        assert_eq!(
            h.inventory_rx.recv().await.unwrap(),
            "$0522$1E000177C958022BFF112233"
        );
        assert!(h.response_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn controller_address_is_consumed_silently() {
        let mut h = harness();
        h.listener.dispatch("$18A5C9").await;
        assert!(h.response_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_lines_go_to_the_response_lane() {
        let mut h = harness();
        h.listener.dispatch("$0E??").await;
        assert_eq!(h.response_rx.recv().await.unwrap(), "$0E??");
    }
}
