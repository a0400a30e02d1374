//! The gateway facade: the verbs a home-automation host calls.
//!
//! Every verb is a composition over the engine's parts: argument
//! validation against the configuration, an optimistic cache write for an
//! immediately consistent host view, then the paced group command on the
//! bus. If the bus ultimately rejects a write, a refresh of the module is
//! scheduled so the cache reconverges on reality.
//!
//! Channels configured with `led_on` / `led_off` wall buttons are driven
//! by pressing the button (`#N…#E1`) instead of a group write; the module
//! then acts exactly as if a person had pressed it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nikolink_core::config::{ModuleRegistry, SceneChannel};
use nikolink_core::error::{Error, Result};
use nikolink_core::events::BusEvent;
use nikolink_core::types::{
    ButtonAddress, CoverMotion, Group, ModuleAddress, ModuleKind, OutputState,
};

use crate::cover::{self, CoverRuntime};
use crate::discovery::{self, DiscoveredDevice, SweepKind};
use crate::protocol;
use crate::scheduler::SchedulerHandle;
use crate::state::StateCache;

/// Shared engine context handed to every background task.
pub(crate) struct EngineCtx {
    pub registry: Arc<ModuleRegistry>,
    pub cache: Arc<StateCache>,
    pub scheduler: SchedulerHandle,
    pub event_tx: broadcast::Sender<BusEvent>,
    pub covers: Arc<CoverRuntime>,
    pub discovered: Mutex<Vec<DiscoveredDevice>>,
}

impl EngineCtx {
    /// Optimistic write of one channel followed by the group command.
    pub async fn set_state(
        self: &Arc<Self>,
        module: ModuleAddress,
        channel: u8,
        value: u8,
    ) -> Result<()> {
        self.cache.set_channel(module, channel, value)?;
        let group = Group::of_channel(channel);
        let values = self.cache.group(module, group)?;

        match self.scheduler.write_group(module, group, values).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(%module, channel, error = %e, "write failed, scheduling reconcile");
                self.spawn_reconcile(module);
                Err(e)
            }
        }
    }

    /// Read every group of one module; answers land in the cache through
    /// the listener.
    pub async fn refresh_module(&self, module: ModuleAddress) -> Result<()> {
        let groups = self.registry.module(module)?.groups();
        for &group in groups {
            self.scheduler.read_group(module, group).await?;
        }
        Ok(())
    }

    /// Best-effort refresh of the whole installation.
    pub async fn refresh_all(&self) {
        let modules: Vec<ModuleAddress> = self.registry.modules().map(|m| m.address).collect();
        debug!(count = modules.len(), "refreshing all modules");
        for module in modules {
            if let Err(e) = self.refresh_module(module).await {
                warn!(%module, error = %e, "refresh failed");
            }
        }
    }

    /// The cache disagrees with the bus after a failed write; re-read.
    fn spawn_reconcile(self: &Arc<Self>, module: ModuleAddress) {
        let ctx = self.clone();
        tokio::spawn(async move {
            if let Err(e) = ctx.refresh_module(module).await {
                warn!(%module, error = %e, "reconcile refresh failed");
            }
        });
    }
}

/// Live connection to a Nikobus installation.
///
/// Built by [`GatewayBuilder`](crate::builder::GatewayBuilder). Cloneable
/// handles are not provided; wrap it in an `Arc` if several host
/// components need it.
pub struct Gateway {
    ctx: Arc<EngineCtx>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub(crate) fn new(
        ctx: Arc<EngineCtx>,
        cancel: CancellationToken,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Gateway {
            ctx,
            cancel,
            tasks: Mutex::new(tasks),
        }
    }

    /// Subscribe to bus events.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.ctx.event_tx.subscribe()
    }

    // -- synchronous state readers ---------------------------------------

    /// Full 12-byte output snapshot of a module.
    pub fn output_state(&self, module: ModuleAddress) -> Result<OutputState> {
        self.ctx.cache.snapshot(module)
    }

    /// Whether a switch channel is on.
    pub fn switch_is_on(&self, module: ModuleAddress, channel: u8) -> Result<bool> {
        self.ctx
            .registry
            .channel_of_kind(module, channel, ModuleKind::Switch)?;
        Ok(self.ctx.cache.channel(module, channel)? == 0xFF)
    }

    /// Brightness of a dimmer channel (0 = off, 0xFF = full).
    pub fn dimmer_brightness(&self, module: ModuleAddress, channel: u8) -> Result<u8> {
        self.ctx
            .registry
            .channel_of_kind(module, channel, ModuleKind::Dimmer)?;
        self.ctx.cache.channel(module, channel)
    }

    /// Motion state of a cover channel.
    pub fn cover_motion(&self, module: ModuleAddress, channel: u8) -> Result<CoverMotion> {
        self.ctx
            .registry
            .channel_of_kind(module, channel, ModuleKind::Roller)?;
        self.ctx
            .covers
            .motion(module, channel)
            .ok_or_else(|| Error::UnknownModule(module.to_string()))
    }

    /// Estimated cover position (0 = closed, 100 = open).
    pub fn cover_position(&self, module: ModuleAddress, channel: u8) -> Result<u8> {
        self.ctx
            .registry
            .channel_of_kind(module, channel, ModuleKind::Roller)?;
        self.ctx
            .covers
            .position(module, channel)
            .ok_or_else(|| Error::UnknownModule(module.to_string()))
    }

    /// Devices found by inventory sweeps so far.
    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.ctx.discovered.lock().expect("discovery list poisoned").clone()
    }

    // -- switches --------------------------------------------------------

    /// Turn a relay channel on.
    pub async fn turn_on_switch(&self, module: ModuleAddress, channel: u8) -> Result<()> {
        let cfg = self
            .ctx
            .registry
            .channel_of_kind(module, channel, ModuleKind::Switch)?
            .clone();
        if let Some(led) = cfg.led_on {
            self.press_virtual_button(led).await?;
            self.ctx.cache.set_channel(module, channel, 0xFF)?;
            return Ok(());
        }
        self.ctx.set_state(module, channel, 0xFF).await
    }

    /// Turn a relay channel off.
    pub async fn turn_off_switch(&self, module: ModuleAddress, channel: u8) -> Result<()> {
        let cfg = self
            .ctx
            .registry
            .channel_of_kind(module, channel, ModuleKind::Switch)?
            .clone();
        if let Some(led) = cfg.led_off {
            self.press_virtual_button(led).await?;
            self.ctx.cache.set_channel(module, channel, 0x00)?;
            return Ok(());
        }
        self.ctx.set_state(module, channel, 0x00).await
    }

    // -- dimmers ---------------------------------------------------------

    /// Set a dimmer channel's brightness; 0 turns it off.
    pub async fn set_dimmer(
        &self,
        module: ModuleAddress,
        channel: u8,
        brightness: u8,
    ) -> Result<()> {
        let cfg = self
            .ctx
            .registry
            .channel_of_kind(module, channel, ModuleKind::Dimmer)?
            .clone();
        let current = self.ctx.cache.channel(module, channel)?;

        // A dimmer that is fully off needs its wall button pressed before
        // it accepts a level; same on the way out.
        if brightness > 0 && current == 0 {
            if let Some(led) = cfg.led_on {
                self.press_virtual_button(led).await?;
            }
        }
        if brightness == 0 && current != 0 {
            if let Some(led) = cfg.led_off {
                self.press_virtual_button(led).await?;
            }
        }

        self.ctx.set_state(module, channel, brightness).await
    }

    // -- covers ----------------------------------------------------------

    /// Start opening a cover channel.
    pub async fn open_cover(&self, module: ModuleAddress, channel: u8) -> Result<()> {
        self.move_cover(module, channel, CoverMotion::Opening).await
    }

    /// Start closing a cover channel.
    pub async fn close_cover(&self, module: ModuleAddress, channel: u8) -> Result<()> {
        self.move_cover(module, channel, CoverMotion::Closing).await
    }

    /// Stop a cover channel and freeze its position estimate.
    pub async fn stop_cover(&self, module: ModuleAddress, channel: u8) -> Result<()> {
        let cfg = self
            .ctx
            .registry
            .channel_of_kind(module, channel, ModuleKind::Roller)?
            .clone();
        let was = self
            .ctx
            .covers
            .motion(module, channel)
            .unwrap_or(CoverMotion::Stopped);
        self.ctx
            .covers
            .on_command(module, channel, CoverMotion::Stopped);

        // Pressing the direction's own button stops a moving shutter.
        let led = match was {
            CoverMotion::Opening => cfg.led_on,
            CoverMotion::Closing => cfg.led_off,
            CoverMotion::Stopped => None,
        };
        if let Some(led) = led {
            self.press_virtual_button(led).await?;
            self.ctx.cache.set_channel(module, channel, 0x00)?;
            return Ok(());
        }
        self.ctx.set_state(module, channel, 0x00).await
    }

    /// Drive a cover to a target position (0 = closed, 100 = open).
    ///
    /// The movement command goes out immediately; a stop is scheduled
    /// after `|target - current| / 100 * operation_time`.
    pub async fn set_cover_position(
        &self,
        module: ModuleAddress,
        channel: u8,
        target: u8,
    ) -> Result<()> {
        if target > 100 {
            return Err(Error::InvalidArgument(format!(
                "position {target} out of range 0..=100"
            )));
        }
        self.ctx
            .registry
            .channel_of_kind(module, channel, ModuleKind::Roller)?;

        let current = self
            .ctx
            .covers
            .position(module, channel)
            .ok_or_else(|| Error::UnknownModule(module.to_string()))?;
        if current == target {
            debug!(%module, channel, target, "cover already at target");
            return Ok(());
        }

        let travel = self
            .ctx
            .covers
            .duration_s(module, channel)
            .unwrap_or(nikolink_core::config::DEFAULT_OPERATION_TIME_S);
        let span = (f64::from(target) - f64::from(current)).abs() / 100.0 * travel;
        let motion = if target > current {
            CoverMotion::Opening
        } else {
            CoverMotion::Closing
        };

        let issued_at = tokio::time::Instant::now();
        self.move_cover(module, channel, motion).await?;

        let after = Duration::from_secs_f64(span).saturating_sub(issued_at.elapsed());
        cover::schedule_stop(
            self.ctx.scheduler.clone(),
            self.ctx.cache.clone(),
            self.ctx.covers.clone(),
            module,
            channel,
            after,
            self.cancel.clone(),
        );
        Ok(())
    }

    /// Restore a known cover position (e.g. persisted by the host).
    pub fn calibrate_cover(
        &self,
        module: ModuleAddress,
        channel: u8,
        position: u8,
    ) -> Result<()> {
        if position > 100 {
            return Err(Error::InvalidArgument(format!(
                "position {position} out of range 0..=100"
            )));
        }
        self.ctx
            .registry
            .channel_of_kind(module, channel, ModuleKind::Roller)?;
        self.ctx.covers.calibrate(module, channel, f64::from(position));
        Ok(())
    }

    async fn move_cover(
        &self,
        module: ModuleAddress,
        channel: u8,
        motion: CoverMotion,
    ) -> Result<()> {
        let cfg = self
            .ctx
            .registry
            .channel_of_kind(module, channel, ModuleKind::Roller)?
            .clone();
        self.ctx.covers.on_command(module, channel, motion);

        let led = match motion {
            CoverMotion::Opening => cfg.led_on,
            CoverMotion::Closing => cfg.led_off,
            CoverMotion::Stopped => None,
        };
        if let Some(led) = led {
            self.press_virtual_button(led).await?;
            self.ctx.cache.set_channel(module, channel, motion.as_byte())?;
            return Ok(());
        }
        self.ctx.set_state(module, channel, motion.as_byte()).await
    }

    // -- refresh / buttons / scenes / inventory --------------------------

    /// Read all groups of one module off the bus.
    pub async fn refresh_module(&self, module: ModuleAddress) -> Result<()> {
        self.ctx.refresh_module(module).await
    }

    /// Refresh every configured module.
    pub async fn refresh_all(&self) {
        self.ctx.refresh_all().await;
    }

    /// Simulate a wall-button press (`#NAAAAAA` + execute marker).
    pub async fn press_virtual_button(&self, address: ButtonAddress) -> Result<()> {
        self.ctx
            .scheduler
            .send_raw(protocol::virtual_button_sequence(address))
            .await
    }

    /// Activate a configured scene by id.
    pub async fn activate_scene(&self, id: &str) -> Result<()> {
        let scene = self
            .ctx
            .registry
            .scene(id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown scene: {id}")))?
            .clone();
        self.apply_channel_states(&scene.channels).await
    }

    /// Apply a set of channel states, coalescing into one group write per
    /// affected module group (group 1 before group 2).
    pub async fn apply_channel_states(&self, channels: &[SceneChannel]) -> Result<()> {
        // Validate everything before touching the cache.
        for entry in channels {
            self.ctx.registry.channel(entry.module, entry.channel)?;
        }

        let mut touched: BTreeMap<(ModuleAddress, u8), Group> = BTreeMap::new();
        for entry in channels {
            self.ctx
                .cache
                .set_channel(entry.module, entry.channel, entry.state)?;
            let group = Group::of_channel(entry.channel);
            touched.insert((entry.module, group.first_channel()), group);
        }

        for ((module, _), group) in touched {
            let values = self.ctx.cache.group(module, group)?;
            if let Err(e) = self.ctx.scheduler.write_group(module, group, values).await {
                warn!(%module, group = %group, error = %e, "scene write failed");
                self.ctx.spawn_reconcile(module);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Start an inventory sweep of one module. Runs in the background;
    /// results accumulate in [`discovered_devices`](Self::discovered_devices).
    pub fn query_inventory(&self, module: ModuleAddress) -> Result<()> {
        let kind = match self.ctx.registry.module(module)?.kind {
            ModuleKind::Dimmer => SweepKind::Dimmer,
            _ => SweepKind::Module,
        };
        let frames = discovery::sweep_frames(module, kind);
        let scheduler = self.ctx.scheduler.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            for frame in frames {
                if cancel.is_cancelled() {
                    break;
                }
                if let Err(e) = scheduler.send_raw(frame).await {
                    warn!(error = %e, "inventory sweep aborted");
                    break;
                }
            }
        });
        Ok(())
    }

    /// Stop all engine tasks. In-flight commands fail with
    /// `NotConnected`; timers are cancelled.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().expect("task list poisoned");
            guard.drain(..).collect()
        };
        for mut task in tasks {
            if tokio::time::timeout(Duration::from_secs(1), &mut task).await.is_err() {
                warn!("engine task did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use nikolink_core::config::BusConfig;
    use nikolink_test_harness::{MockBus, MockLink};

    use crate::builder::GatewayBuilder;

    fn addr(s: &str) -> ModuleAddress {
        ModuleAddress::from_hex(s).unwrap()
    }

    fn test_config() -> BusConfig {
        serde_json::from_str(
            r#"{
                "modules": [
                    {"type": "switch", "address": "4707", "channels": [
                        {"description": "c1"}, {"description": "c2"}, {"description": "c3"},
                        {"description": "c4"}, {"description": "c5"}, {"description": "c6"},
                        {"description": "c7"}, {"description": "c8"}, {"description": "c9"},
                        {"description": "c10"}, {"description": "c11"}, {"description": "c12"}
                    ]},
                    {"type": "dimmer", "address": "C9A5", "channels": [
                        {"description": "d1"}, {"description": "d2"}, {"description": "d3"},
                        {"description": "d4"}, {"description": "d5"}, {"description": "d6"},
                        {"description": "d7"}, {"description": "d8"}, {"description": "d9"},
                        {"description": "d10"}, {"description": "d11"}, {"description": "d12"}
                    ]},
                    {"type": "roller", "address": "9105", "channels": [
                        {"description": "shutter", "operation_time": "2"},
                        {"description": "awning", "operation_time": "2",
                         "led_on": "AABB01", "led_off": "AABB02"}
                    ]}
                ],
                "buttons": [
                    {"address": "4ECB1A",
                     "impacted_module": [{"address": "4707", "group": "1"}]}
                ],
                "scenes": [
                    {"id": "evening", "channels": [
                        {"module_id": "4707", "channel": 1, "state": 255},
                        {"module_id": "4707", "channel": 7, "state": 255}
                    ]}
                ]
            }"#,
        )
        .unwrap()
    }

    async fn build_gateway() -> (Gateway, MockBus) {
        let (link, bus) = MockLink::pair();
        let gateway = GatewayBuilder::new(test_config())
            .command_pacing(Duration::from_millis(10))
            .ack_settle(Duration::from_millis(2))
            .ack_window(Duration::from_millis(400))
            .answer_timeout(Duration::from_millis(150))
            .handshake_settle(Duration::from_millis(2))
            .release_window(Duration::from_millis(120))
            .long_press_threshold(Duration::from_millis(150))
            .dimmer_settle(Duration::from_millis(10))
            .no_periodic_refresh()
            .build_with_link(Box::new(link))
            .await
            .unwrap();
        (gateway, bus)
    }

    const HANDSHAKE_BYTES: &[u8] = b"++++\rATH0\rATZ\r$10110000B8CF9D\r";

    #[tokio::test]
    async fn handshake_is_the_only_startup_traffic() {
        let (gateway, bus) = build_gateway().await;

        // Nothing but the fixed handshake until the first API call.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bus.raw_sent(), HANDSHAKE_BYTES);

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn turn_on_switch_emits_the_group1_write() {
        let (gateway, bus) = build_gateway().await;
        bus.expect(
            "$1E150747FF0000000000FF8C3D0A",
            &["$0515", "$0EFF074700FF0000000000"],
        );

        gateway.turn_on_switch(addr("4707"), 1).await.unwrap();

        assert!(gateway.switch_is_on(addr("4707"), 1).unwrap());
        assert!(bus
            .sent_lines()
            .contains(&"$1E150747FF0000000000FF8C3D0A".to_string()));
        assert_eq!(bus.remaining_expectations(), 0);

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn set_dimmer_targets_group2_with_trailer() {
        let (gateway, bus) = build_gateway().await;
        bus.expect(
            "$1E16A5C9000080000000FF07EAE2",
            &["$0516", "$0EFFA5C900000080000000"],
        );

        gateway.set_dimmer(addr("C9A5"), 9, 0x80).await.unwrap();

        assert_eq!(gateway.dimmer_brightness(addr("C9A5"), 9).unwrap(), 0x80);

        // The frame that went out is a valid 0x16 write with the 0xFF trailer.
        let frame = bus
            .sent_lines()
            .into_iter()
            .find(|l| l.starts_with("$1E16"))
            .expect("no group-2 write sent");
        let valid = protocol::validate_frame(&frame).unwrap();
        assert_eq!(valid.func_code(), 0x16);
        assert_eq!(valid.address(), Some(addr("C9A5")));
        assert_eq!(valid.args()[2], 0x80);
        assert_eq!(valid.args()[6], 0xFF);

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn feedback_answer_updates_cache_and_fires_refreshed_once() {
        let (gateway, bus) = build_gateway().await;
        let mut events = gateway.subscribe();

        bus.inject("$0512");
        bus.inject("$1C074700FF0000000000CCAEA3");

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no event")
            .unwrap();
        match event {
            BusEvent::Refreshed { module } => assert_eq!(module, addr("4707")),
            other => panic!("expected Refreshed, got {other:?}"),
        }

        assert!(gateway.switch_is_on(addr("4707"), 1).unwrap());
        for channel in 2..=6 {
            assert!(!gateway.switch_is_on(addr("4707"), channel).unwrap());
        }

        // Exactly one refreshed per answer.
        assert!(events.try_recv().is_err());

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn refresh_module_reads_both_groups_of_a_12_channel_module() {
        let (gateway, bus) = build_gateway().await;
        bus.expect("$10120747402BFC", &["$0512", "$1C074700FF0000000000CCAEA3"]);
        bus.expect("$10170747ABDBF7", &["$0517", "$1C074700000000000000981112"]);

        gateway.refresh_module(addr("4707")).await.unwrap();

        assert!(gateway.switch_is_on(addr("4707"), 1).unwrap());
        assert!(!gateway.switch_is_on(addr("4707"), 7).unwrap());
        assert_eq!(bus.remaining_expectations(), 0);

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn button_press_cycle_refreshes_the_impacted_module() {
        let (gateway, bus) = build_gateway().await;
        let mut events = gateway.subscribe();

        bus.expect("$10120747402BFC", &["$0512", "$1C074700FF0000000000CCAEA3"]);

        // One repeat; release declared after the window.
        bus.inject("#N4ECB1A");

        let mut saw_pressed = false;
        let mut saw_released = false;
        let mut saw_short = false;
        let mut saw_operation = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);

        while tokio::time::Instant::now() < deadline {
            let remaining = deadline - tokio::time::Instant::now();
            let Ok(Ok(event)) = tokio::time::timeout(remaining, events.recv()).await else {
                break;
            };
            match event {
                BusEvent::ButtonPressed(ev) => {
                    assert!(!saw_released, "pressed after released");
                    assert_eq!(ev.module_address, Some(addr("4707")));
                    saw_pressed = true;
                }
                BusEvent::ButtonReleased(_) => {
                    assert!(saw_pressed);
                    saw_released = true;
                }
                BusEvent::ShortButtonPressed(_) => {
                    assert!(saw_released);
                    saw_short = true;
                }
                BusEvent::ButtonOperation(op) => {
                    assert!(saw_released, "operation before release");
                    assert_eq!(op.module, addr("4707"));
                    assert_eq!(op.group, Group::One);
                    saw_operation = true;
                    break;
                }
                _ => {}
            }
        }

        assert!(saw_pressed && saw_released && saw_short && saw_operation);
        // The post-release refresh answer landed in the cache.
        assert!(gateway.switch_is_on(addr("4707"), 1).unwrap());

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn set_cover_position_opens_then_stops_near_target() {
        let (gateway, bus) = build_gateway().await;

        bus.expect(
            "$1E150591010000000000FFE1640B",
            &["$0515", "$0EFF059100010000000000"],
        );
        bus.expect(
            "$1E150591000000000000FF5905D6",
            &["$0515", "$0EFF059100000000000000"],
        );

        gateway.calibrate_cover(addr("9105"), 1, 0).unwrap();
        // 2 s travel time, target 50 %: stop expected after ~1 s.
        gateway
            .set_cover_position(addr("9105"), 1, 50)
            .await
            .unwrap();
        assert_eq!(gateway.cover_motion(addr("9105"), 1).unwrap(), CoverMotion::Opening);

        assert!(
            bus.wait_for_sent("$1E150591000000000000FF5905D6", Duration::from_secs(3))
                .await,
            "stop command never sent"
        );
        // Allow the stop transaction to finish.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let position = gateway.cover_position(addr("9105"), 1).unwrap();
        assert!(
            (40..=60).contains(&position),
            "expected ~50, got {position}"
        );
        assert_eq!(
            gateway.cover_motion(addr("9105"), 1).unwrap(),
            CoverMotion::Stopped
        );

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn led_mapped_cover_presses_buttons_instead_of_writing() {
        let (gateway, bus) = build_gateway().await;

        // Channel 2 has led_on/led_off: open presses AABB01.
        gateway.open_cover(addr("9105"), 2).await.unwrap();

        assert!(bus.wait_for_sent("#NAABB01", Duration::from_secs(2)).await);
        assert!(bus.wait_for_sent("#E1", Duration::from_secs(2)).await);
        assert!(
            !bus.sent_lines().iter().any(|l| l.starts_with("$1E15")),
            "group write sent despite LED mapping"
        );
        assert_eq!(
            gateway.cover_motion(addr("9105"), 2).unwrap(),
            CoverMotion::Opening
        );

        // Stopping while opening presses the same direction button.
        gateway.stop_cover(addr("9105"), 2).await.unwrap();
        let presses = bus
            .sent_lines()
            .iter()
            .filter(|l| *l == "#NAABB01")
            .count();
        assert_eq!(presses, 2);

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn scene_coalesces_into_one_write_per_group() {
        let (gateway, bus) = build_gateway().await;

        bus.expect(
            "$1E150747FF0000000000FF8C3D0A",
            &["$0515", "$0EFF074700FF0000000000"],
        );
        let group2 = crate::commands::write_command(
            addr("4707"),
            Group::Two,
            [0xFF, 0, 0, 0, 0, 0],
        );
        bus.expect(&group2, &["$0516", "$0EFF074700FF0000000000"]);

        gateway.activate_scene("evening").await.unwrap();

        let sent = bus.sent_lines();
        let g1_at = sent
            .iter()
            .position(|l| l == "$1E150747FF0000000000FF8C3D0A")
            .expect("group 1 write missing");
        let g2_at = sent.iter().position(|l| l == &group2).expect("group 2 write missing");
        assert!(g1_at < g2_at, "group 1 must precede group 2");

        assert!(gateway.switch_is_on(addr("4707"), 1).unwrap());
        assert!(gateway.switch_is_on(addr("4707"), 7).unwrap());

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn press_virtual_button_sends_the_two_token_sequence() {
        let (gateway, bus) = build_gateway().await;

        gateway
            .press_virtual_button(ButtonAddress::from_hex("4ECB1A").unwrap())
            .await
            .unwrap();

        let sent = bus.sent_lines();
        let n_at = sent.iter().position(|l| l == "#N4ECB1A").expect("#N missing");
        let e_at = sent.iter().position(|l| l == "#E1").expect("#E1 missing");
        assert_eq!(e_at, n_at + 1);

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn config_errors_are_synchronous() {
        let (gateway, _bus) = build_gateway().await;

        // Unknown module.
        assert!(matches!(
            gateway.turn_on_switch(addr("BEEF"), 1).await,
            Err(Error::UnknownModule(_))
        ));
        // Channel out of range.
        assert!(matches!(
            gateway.turn_on_switch(addr("4707"), 13).await,
            Err(Error::InvalidArgument(_))
        ));
        // Kind mismatch.
        assert!(matches!(
            gateway.set_dimmer(addr("4707"), 1, 10).await,
            Err(Error::InvalidArgument(_))
        ));
        // Position out of range.
        assert!(matches!(
            gateway.set_cover_position(addr("9105"), 1, 101).await,
            Err(Error::InvalidArgument(_))
        ));

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn failed_write_schedules_a_reconcile_refresh() {
        let (gateway, bus) = build_gateway().await;

        // No scripted ACK/answer: the write exhausts its retries, then
        // the reconcile read goes out.
        let result = gateway.turn_on_switch(addr("4707"), 1).await;
        assert!(matches!(result, Err(Error::RetriesExhausted)));

        assert!(
            bus.wait_for_sent("$10120747402BFC", Duration::from_secs(5)).await,
            "reconcile refresh never sent"
        );

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn inventory_sweep_collects_announced_devices() {
        let (gateway, bus) = build_gateway().await;

        gateway.query_inventory(addr("4707")).unwrap();
        bus.inject("$0510$2E00000000000001000000A5C900");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let devices = gateway.discovered_devices();
            if !devices.is_empty() {
                assert_eq!(devices[0].address, "C9A5");
                assert_eq!(devices[0].type_code, 0x01);
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "device never collected"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        gateway.shutdown().await;
    }
}
