//! Button press lifecycle machine.
//!
//! The bus repeats `#NAAAAAA` for as long as a physical button is held.
//! Per address, the machine turns that repetition into a press cycle:
//!
//! - first frame: `pressed` with a fresh `press_id`; hold-timer
//!   milestones armed at 1 s, 2 s, and 3 s (`timer_1..3` while held);
//! - release is declared when no repeat arrives within the release
//!   window (a heuristic -- the bus has no release frame);
//! - on release: `released` with the measured duration, then exactly one
//!   of `short`/`long` against the configurable threshold, then one
//!   whole-second bucket event (`pressed_0..3`);
//! - afterwards each impacted module from the configuration is refreshed
//!   (dimmers after a settle delay so the ramp has finished) and
//!   `button_operation` is emitted per completed refresh.
//!
//! A repeated `pressed` for the same address within the debounce window
//! after a release is suppressed. Unconfigured addresses emit
//! `button_discovered` so the host can extend its config file.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nikolink_core::config::ModuleRegistry;
use nikolink_core::events::{BusEvent, ButtonEvent, ButtonOperation, PressState};
use nikolink_core::types::{ButtonAddress, ModuleKind};

use crate::scheduler::SchedulerHandle;

/// Hold-timer milestones, in seconds.
const TIMER_MILESTONES: u8 = 3;

/// Largest whole-second bucket reported on release.
const MAX_BUCKET: u8 = 3;

/// Button machine timing knobs.
#[derive(Debug, Clone)]
pub struct ButtonSettings {
    /// Press duration at or beyond which a release classifies as long.
    pub long_press_threshold: Duration,
    /// Silence after the last repeat that declares a release.
    pub release_window: Duration,
    /// Duplicate `pressed` suppression after a release.
    pub press_debounce: Duration,
    /// Wait before refreshing a dimmer module, so the ramp has settled.
    pub dimmer_settle: Duration,
    /// Poll interval of the release watcher.
    pub poll: Duration,
}

impl Default for ButtonSettings {
    fn default() -> Self {
        ButtonSettings {
            long_press_threshold: Duration::from_millis(500),
            release_window: Duration::from_millis(400),
            press_debounce: Duration::from_millis(100),
            dimmer_settle: Duration::from_secs(1),
            poll: Duration::from_millis(50),
        }
    }
}

/// Shared context of the button machine.
pub(crate) struct ButtonEngine {
    pub registry: Arc<ModuleRegistry>,
    pub scheduler: SchedulerHandle,
    pub event_tx: broadcast::Sender<BusEvent>,
    pub settings: ButtonSettings,
    pub press_seq: AtomicU64,
}

impl ButtonEngine {
    /// Build a lifecycle event with module/channel resolved from config
    /// when the button maps to exactly one impacted module.
    fn observation(&self, address: ButtonAddress, press_id: u64, state: PressState) -> ButtonEvent {
        let mut event = ButtonEvent {
            address,
            module_address: None,
            channel: None,
            ts: Utc::now(),
            press_id,
            state,
            duration_s: None,
            bucket: None,
            threshold_s: None,
        };
        if let Some(cfg) = self.registry.button(address) {
            if let [single] = cfg.impacted_modules.as_slice() {
                event.module_address = Some(single.address);
                event.channel = single.channel;
            }
        }
        event
    }
}

/// Run the button machine until shutdown.
pub(crate) async fn run(
    engine: ButtonEngine,
    mut button_rx: mpsc::Receiver<ButtonAddress>,
    cancel: CancellationToken,
) {
    let engine = Arc::new(engine);
    let mut active: HashMap<ButtonAddress, Arc<Mutex<Instant>>> = HashMap::new();
    let mut last_release: HashMap<ButtonAddress, Instant> = HashMap::new();
    let (done_tx, mut done_rx) = mpsc::channel::<ButtonAddress>(32);

    debug!("button machine running");
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            released = done_rx.recv() => {
                if let Some(address) = released {
                    active.remove(&address);
                    last_release.insert(address, Instant::now());
                }
            }

            frame = button_rx.recv() => {
                let Some(address) = frame else { break };

                if let Some(last_seen) = active.get(&address) {
                    // The bus repeating the address while held.
                    *last_seen.lock().expect("press clock poisoned") = Instant::now();
                    continue;
                }

                if let Some(at) = last_release.get(&address) {
                    if at.elapsed() < engine.settings.press_debounce {
                        debug!(%address, "suppressing duplicate press");
                        continue;
                    }
                }

                let press_id = engine.press_seq.fetch_add(1, Ordering::Relaxed);
                let last_seen = Arc::new(Mutex::new(Instant::now()));
                active.insert(address, last_seen.clone());

                debug!(%address, press_id, "press cycle started");
                let _ = engine.event_tx.send(BusEvent::ButtonPressed(
                    engine.observation(address, press_id, PressState::Pressed),
                ));

                tokio::spawn(watch_cycle(
                    engine.clone(),
                    address,
                    press_id,
                    last_seen,
                    done_tx.clone(),
                ));
            }
        }
    }
    debug!("button machine stopped");
}

/// Watch one press cycle: fire hold milestones, declare the release, and
/// run the post-release refresh.
async fn watch_cycle(
    engine: Arc<ButtonEngine>,
    address: ButtonAddress,
    press_id: u64,
    last_seen: Arc<Mutex<Instant>>,
    done_tx: mpsc::Sender<ButtonAddress>,
) {
    let start = Instant::now();
    let mut fired: u8 = 0;

    loop {
        tokio::time::sleep(engine.settings.poll).await;

        let last = *last_seen.lock().expect("press clock poisoned");
        if last.elapsed() >= engine.settings.release_window {
            break;
        }

        let held = start.elapsed();
        while fired < TIMER_MILESTONES && held >= Duration::from_secs(u64::from(fired) + 1) {
            fired += 1;
            let mut event = engine.observation(address, press_id, PressState::Timer);
            event.threshold_s = Some(fired);
            let _ = engine.event_tx.send(BusEvent::ButtonTimer(event));
        }
    }

    let released_at = *last_seen.lock().expect("press clock poisoned");
    let duration = released_at.saturating_duration_since(start);
    let duration_s = duration.as_secs_f64();

    // The cycle record dies here; frames from now on are a new press.
    let _ = done_tx.send(address).await;

    debug!(%address, press_id, duration_s, "release detected");

    let mut released = engine.observation(address, press_id, PressState::Released);
    released.duration_s = Some(duration_s);
    let _ = engine
        .event_tx
        .send(BusEvent::ButtonReleased(released.clone()));

    if duration < engine.settings.long_press_threshold {
        let _ = engine
            .event_tx
            .send(BusEvent::ShortButtonPressed(released.clone()));
    } else {
        let _ = engine
            .event_tx
            .send(BusEvent::LongButtonPressed(released.clone()));
    }

    let mut bucketed = released;
    bucketed.bucket = Some((duration_s as u8).min(MAX_BUCKET));
    let _ = engine.event_tx.send(BusEvent::ButtonPressedBucket(bucketed));

    refresh_impacted(&engine, address, press_id).await;
}

/// Refresh every module this button impacts, then report the operations.
async fn refresh_impacted(engine: &ButtonEngine, address: ButtonAddress, press_id: u64) {
    let Some(cfg) = engine.registry.button(address) else {
        debug!(%address, "button not in configuration");
        let _ = engine.event_tx.send(BusEvent::ButtonDiscovered { address });
        return;
    };

    for impacted in &cfg.impacted_modules {
        let kind = engine
            .registry
            .module(impacted.address)
            .map(|m| m.kind)
            .ok();
        if kind == Some(ModuleKind::Dimmer) {
            // Dimmer ramps keep moving after the release; read too early
            // and the cache mirrors a transient level.
            tokio::time::sleep(engine.settings.dimmer_settle).await;
        }

        match engine
            .scheduler
            .read_group(impacted.address, impacted.group)
            .await
        {
            Ok(_) => {
                let _ = engine.event_tx.send(BusEvent::ButtonOperation(ButtonOperation {
                    button: address,
                    module: impacted.address,
                    group: impacted.group,
                    operation_time_s: cfg.operation_time,
                    press_id,
                    ts: Utc::now(),
                }));
            }
            Err(e) => {
                warn!(
                    %address,
                    module = %impacted.address,
                    group = %impacted.group,
                    error = %e,
                    "post-press refresh failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nikolink_core::config::BusConfig;
    use nikolink_core::types::Group;

    use crate::scheduler::{self, BusCommand, Correlate};

    fn fast_settings() -> ButtonSettings {
        ButtonSettings {
            long_press_threshold: Duration::from_millis(150),
            release_window: Duration::from_millis(120),
            press_debounce: Duration::from_millis(300),
            dimmer_settle: Duration::from_millis(10),
            poll: Duration::from_millis(20),
        }
    }

    fn registry(json: &str) -> Arc<ModuleRegistry> {
        let config: BusConfig = serde_json::from_str(json).unwrap();
        Arc::new(ModuleRegistry::new(&config))
    }

    /// Scheduler stub that answers every correlated command with a fixed
    /// group state and records what was asked.
    fn stub_scheduler(
        state: [u8; 6],
    ) -> (SchedulerHandle, mpsc::UnboundedReceiver<String>) {
        let (handle, mut cmd_rx) = scheduler::command_queue(32);
        let (asked_tx, asked_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(BusCommand { frame, correlate, reply }) = cmd_rx.recv().await {
                let _ = asked_tx.send(frame);
                if let Some(reply) = reply {
                    let result = match correlate {
                        Correlate::None => Ok(None),
                        Correlate::Expect { .. } => Ok(Some(state)),
                    };
                    let _ = reply.send(result);
                }
            }
        });
        (handle, asked_rx)
    }

    struct Harness {
        button_tx: mpsc::Sender<ButtonAddress>,
        event_rx: broadcast::Receiver<BusEvent>,
        asked_rx: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    }

    fn spawn_machine(registry: Arc<ModuleRegistry>, settings: ButtonSettings) -> Harness {
        let (scheduler, asked_rx) = stub_scheduler([0xFF, 0, 0, 0, 0, 0]);
        let (event_tx, event_rx) = broadcast::channel(64);
        let (button_tx, button_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let engine = ButtonEngine {
            registry,
            scheduler,
            event_tx,
            settings,
            press_seq: AtomicU64::new(1),
        };
        tokio::spawn(run(engine, button_rx, cancel.clone()));

        Harness {
            button_tx,
            event_rx,
            asked_rx,
            cancel,
        }
    }

    fn button(s: &str) -> ButtonAddress {
        ButtonAddress::from_hex(s).unwrap()
    }

    async fn next_event(rx: &mut broadcast::Receiver<BusEvent>) -> BusEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn tap_emits_pressed_released_short_and_bucket_zero() {
        let mut h = spawn_machine(registry("{}"), fast_settings());

        h.button_tx.send(button("4ECB1A")).await.unwrap();

        match next_event(&mut h.event_rx).await {
            BusEvent::ButtonPressed(ev) => {
                assert_eq!(ev.address, button("4ECB1A"));
                assert_eq!(ev.state, PressState::Pressed);
                assert!(ev.duration_s.is_none());
            }
            other => panic!("expected ButtonPressed, got {other:?}"),
        }

        match next_event(&mut h.event_rx).await {
            BusEvent::ButtonReleased(ev) => {
                let duration = ev.duration_s.unwrap();
                assert!(duration < 0.15, "tap duration was {duration}");
            }
            other => panic!("expected ButtonReleased, got {other:?}"),
        }

        assert!(matches!(
            next_event(&mut h.event_rx).await,
            BusEvent::ShortButtonPressed(_)
        ));

        match next_event(&mut h.event_rx).await {
            BusEvent::ButtonPressedBucket(ev) => assert_eq!(ev.bucket, Some(0)),
            other => panic!("expected ButtonPressedBucket, got {other:?}"),
        }

        // Unconfigured address: discovery notification, no refresh.
        assert!(matches!(
            next_event(&mut h.event_rx).await,
            BusEvent::ButtonDiscovered { .. }
        ));

        h.cancel.cancel();
    }

    #[tokio::test]
    async fn held_press_fires_timer_1_then_classifies_long() {
        let mut h = spawn_machine(registry("{}"), fast_settings());
        let address = button("4ECB1A");

        // Repeat the frame every 60 ms for ~1.2 s, as the bus would.
        let feeder = h.button_tx.clone();
        let hold = tokio::spawn(async move {
            let until = Instant::now() + Duration::from_millis(1200);
            while Instant::now() < until {
                feeder.send(address).await.unwrap();
                tokio::time::sleep(Duration::from_millis(60)).await;
            }
        });

        assert!(matches!(
            next_event(&mut h.event_rx).await,
            BusEvent::ButtonPressed(_)
        ));

        match next_event(&mut h.event_rx).await {
            BusEvent::ButtonTimer(ev) => assert_eq!(ev.threshold_s, Some(1)),
            other => panic!("expected ButtonTimer, got {other:?}"),
        }

        hold.await.unwrap();

        match next_event(&mut h.event_rx).await {
            BusEvent::ButtonReleased(ev) => {
                let duration = ev.duration_s.unwrap();
                assert!((1.0..2.0).contains(&duration), "duration was {duration}");
            }
            other => panic!("expected ButtonReleased, got {other:?}"),
        }

        assert!(matches!(
            next_event(&mut h.event_rx).await,
            BusEvent::LongButtonPressed(_)
        ));

        match next_event(&mut h.event_rx).await {
            BusEvent::ButtonPressedBucket(ev) => assert_eq!(ev.bucket, Some(1)),
            other => panic!("expected ButtonPressedBucket, got {other:?}"),
        }

        h.cancel.cancel();
    }

    #[tokio::test]
    async fn configured_button_refreshes_impacted_module() {
        let reg = registry(
            r#"{
                "modules": [{"type": "switch", "address": "4707", "channels": [
                    {"description": "1"}, {"description": "2"}, {"description": "3"},
                    {"description": "4"}, {"description": "5"}, {"description": "6"}
                ]}],
                "buttons": [{
                    "address": "4ECB1A",
                    "impacted_module": [{"address": "4707", "group": "1"}],
                    "operation_time": "12"
                }]
            }"#,
        );
        let mut h = spawn_machine(reg, fast_settings());

        h.button_tx.send(button("4ECB1A")).await.unwrap();

        // pressed carries the single impacted module.
        match next_event(&mut h.event_rx).await {
            BusEvent::ButtonPressed(ev) => {
                assert_eq!(ev.module_address.unwrap().to_string(), "4707");
            }
            other => panic!("expected ButtonPressed, got {other:?}"),
        }

        // Skip released/short/bucket.
        let mut operation = None;
        for _ in 0..4 {
            if let BusEvent::ButtonOperation(op) = next_event(&mut h.event_rx).await {
                operation = Some(op);
                break;
            }
        }
        let op = operation.expect("no ButtonOperation event");
        assert_eq!(op.module.to_string(), "4707");
        assert_eq!(op.group, Group::One);
        assert_eq!(op.operation_time_s, Some(12.0));

        // The refresh was a group-1 read of 4707.
        let asked = h.asked_rx.recv().await.unwrap();
        assert_eq!(asked, "$10120747402BFC");

        h.cancel.cancel();
    }

    #[tokio::test]
    async fn duplicate_press_within_debounce_is_suppressed() {
        let mut h = spawn_machine(registry("{}"), fast_settings());
        let address = button("4ECB1A");

        h.button_tx.send(address).await.unwrap();

        // First cycle: pressed ... discovered.
        assert!(matches!(
            next_event(&mut h.event_rx).await,
            BusEvent::ButtonPressed(_)
        ));
        loop {
            if matches!(
                next_event(&mut h.event_rx).await,
                BusEvent::ButtonDiscovered { .. }
            ) {
                break;
            }
        }

        // Immediately press again: inside the debounce window.
        h.button_tx.send(address).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            h.event_rx.try_recv().is_err(),
            "debounced press emitted an event"
        );

        // After the window a new cycle starts normally.
        tokio::time::sleep(Duration::from_millis(250)).await;
        h.button_tx.send(address).await.unwrap();
        assert!(matches!(
            next_event(&mut h.event_rx).await,
            BusEvent::ButtonPressed(_)
        ));

        h.cancel.cancel();
    }

    #[tokio::test]
    async fn press_ids_are_unique_per_cycle() {
        let mut h = spawn_machine(
            registry("{}"),
            ButtonSettings {
                press_debounce: Duration::from_millis(1),
                ..fast_settings()
            },
        );
        let address = button("4ECB1A");

        h.button_tx.send(address).await.unwrap();
        let first = match next_event(&mut h.event_rx).await {
            BusEvent::ButtonPressed(ev) => ev.press_id,
            other => panic!("expected ButtonPressed, got {other:?}"),
        };
        loop {
            if matches!(
                next_event(&mut h.event_rx).await,
                BusEvent::ButtonDiscovered { .. }
            ) {
                break;
            }
        }

        h.button_tx.send(address).await.unwrap();
        let second = match next_event(&mut h.event_rx).await {
            BusEvent::ButtonPressed(ev) => ev.press_id,
            other => panic!("expected ButtonPressed, got {other:?}"),
        };

        assert_ne!(first, second);

        h.cancel.cancel();
    }
}
