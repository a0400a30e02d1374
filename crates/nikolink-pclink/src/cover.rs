//! Time-based cover position estimation.
//!
//! Roller modules report only motion (stopped / opening / closing), never
//! position. Position is estimated from a monotonic clock and the
//! configured travel time: while moving, the position advances by
//! `elapsed / operation_time * 100` percent, clamped to [0, 100], with
//! 100 meaning fully open.
//!
//! The estimator is driven from three directions:
//! - facade verbs (`open` / `close` / `stop` / `set_position`) transition
//!   it directly alongside the write command;
//! - feedback answers reconcile it -- a `0x00` channel byte stops it, a
//!   `0x01`/`0x02` byte starts it (wall-button movement the host never
//!   commanded);
//! - a button's own `operation_time` schedules an explicit stop after
//!   that duration, regardless of the channel's travel time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use nikolink_core::config::ModuleRegistry;
use nikolink_core::events::BusEvent;
use nikolink_core::types::{CoverMotion, Group, ModuleAddress, ModuleKind};

use crate::scheduler::SchedulerHandle;
use crate::state::StateCache;

/// Estimates one cover channel's position from elapsed travel time.
#[derive(Debug)]
pub struct PositionEstimator {
    duration_s: f64,
    start: Option<Instant>,
    direction: Option<CoverMotion>,
    position: f64,
}

impl PositionEstimator {
    /// A new estimator; `start_position` is a percentage, 100 = open.
    pub fn new(duration_s: f64, start_position: f64) -> Self {
        PositionEstimator {
            duration_s: duration_s.max(f64::EPSILON),
            start: None,
            direction: None,
            position: start_position.clamp(0.0, 100.0),
        }
    }

    /// Begin travel. A start while already moving locks in the progress
    /// so far and restarts from there.
    pub fn start(&mut self, motion: CoverMotion) {
        if motion == CoverMotion::Stopped {
            self.stop();
            return;
        }
        if self.start.is_some() {
            if self.direction == Some(motion) {
                return;
            }
            self.stop();
        }
        self.direction = Some(motion);
        self.start = Some(Instant::now());
    }

    /// Stop travel and lock in the computed position.
    pub fn stop(&mut self) {
        self.position = self.position_f();
        self.start = None;
        self.direction = None;
    }

    /// Whether the estimator currently tracks movement.
    pub fn is_moving(&self) -> bool {
        self.start.is_some()
    }

    /// The motion the estimator is tracking.
    pub fn motion(&self) -> CoverMotion {
        self.direction.unwrap_or(CoverMotion::Stopped)
    }

    /// Override the known position (host-side restore / calibration).
    pub fn set_position(&mut self, position: f64) {
        self.position = position.clamp(0.0, 100.0);
    }

    /// Current position as an integer percentage.
    pub fn position(&self) -> u8 {
        self.position_f().round() as u8
    }

    /// Travel time for a full 0 -> 100 % run.
    pub fn duration_s(&self) -> f64 {
        self.duration_s
    }

    fn position_f(&self) -> f64 {
        let (Some(start), Some(direction)) = (self.start, self.direction) else {
            return self.position;
        };
        let progress = start.elapsed().as_secs_f64() / self.duration_s * 100.0;
        match direction {
            CoverMotion::Opening => (self.position + progress).min(100.0),
            CoverMotion::Closing => (self.position - progress).max(0.0),
            CoverMotion::Stopped => self.position,
        }
    }
}

/// One tracked roller channel.
struct CoverChannel {
    estimator: PositionEstimator,
    /// Pending scheduled stop (position target or button travel time).
    stop_guard: Option<AbortHandle>,
}

/// All roller channels of the installation.
pub(crate) struct CoverRuntime {
    channels: Mutex<HashMap<(ModuleAddress, u8), CoverChannel>>,
}

impl CoverRuntime {
    /// Build one estimator per configured roller channel.
    pub fn new(registry: &ModuleRegistry) -> Self {
        let mut channels = HashMap::new();
        for module in registry.modules() {
            if module.kind != ModuleKind::Roller {
                continue;
            }
            for channel in 1..=module.channel_count() {
                let duration = registry.operation_time(module.address, channel);
                channels.insert(
                    (module.address, channel),
                    CoverChannel {
                        estimator: PositionEstimator::new(duration, 100.0),
                        stop_guard: None,
                    },
                );
            }
        }
        CoverRuntime {
            channels: Mutex::new(channels),
        }
    }

    fn with_channel<R>(
        &self,
        module: ModuleAddress,
        channel: u8,
        f: impl FnOnce(&mut CoverChannel) -> R,
    ) -> Option<R> {
        let mut map = self.channels.lock().expect("cover runtime poisoned");
        map.get_mut(&(module, channel)).map(f)
    }

    /// Estimated position, if the channel is a tracked roller.
    pub fn position(&self, module: ModuleAddress, channel: u8) -> Option<u8> {
        self.with_channel(module, channel, |c| c.estimator.position())
    }

    /// Tracked motion state.
    pub fn motion(&self, module: ModuleAddress, channel: u8) -> Option<CoverMotion> {
        self.with_channel(module, channel, |c| c.estimator.motion())
    }

    /// Travel time of the channel.
    pub fn duration_s(&self, module: ModuleAddress, channel: u8) -> Option<f64> {
        self.with_channel(module, channel, |c| c.estimator.duration_s())
    }

    /// Host-side position restore.
    pub fn calibrate(&self, module: ModuleAddress, channel: u8, position: f64) {
        self.with_channel(module, channel, |c| c.estimator.set_position(position));
    }

    /// Transition for a command issued through the facade. Any pending
    /// scheduled stop is cancelled; set-position re-arms one afterwards.
    pub fn on_command(&self, module: ModuleAddress, channel: u8, motion: CoverMotion) {
        self.with_channel(module, channel, |c| {
            if let Some(guard) = c.stop_guard.take() {
                guard.abort();
            }
            match motion {
                CoverMotion::Stopped => c.estimator.stop(),
                moving => c.estimator.start(moving),
            }
        });
    }

    /// Arm a scheduled stop for the channel.
    pub fn arm_stop(&self, module: ModuleAddress, channel: u8, guard: AbortHandle) {
        self.with_channel(module, channel, |c| {
            if let Some(old) = c.stop_guard.replace(guard) {
                old.abort();
            }
        });
    }

    /// Reconcile one channel against a feedback answer byte.
    fn on_feedback(&self, module: ModuleAddress, channel: u8, motion: CoverMotion) {
        self.with_channel(module, channel, |c| {
            if c.estimator.motion() == motion {
                return;
            }
            match motion {
                CoverMotion::Stopped => {
                    debug!(%module, channel, "feedback: cover stopped");
                    if let Some(guard) = c.stop_guard.take() {
                        guard.abort();
                    }
                    c.estimator.stop();
                }
                moving => {
                    debug!(%module, channel, motion = %moving, "feedback: cover moving");
                    c.estimator.start(moving);
                }
            }
        });
    }

    /// Channels of one module currently tracked as moving.
    fn moving_channels(&self, module: ModuleAddress, group: Group) -> Vec<u8> {
        let map = self.channels.lock().expect("cover runtime poisoned");
        map.iter()
            .filter(|((addr, ch), c)| {
                *addr == module && Group::of_channel(*ch) == group && c.estimator.is_moving()
            })
            .map(|((_, ch), _)| *ch)
            .collect()
    }
}

/// Stop one cover channel: freeze the estimator, mirror the cache, and
/// put the stop command on the bus. Shared by the facade verb, scheduled
/// position stops, and button travel-time stops.
pub(crate) async fn issue_stop(
    scheduler: &SchedulerHandle,
    cache: &StateCache,
    covers: &CoverRuntime,
    module: ModuleAddress,
    channel: u8,
) {
    covers.on_command(module, channel, CoverMotion::Stopped);

    if let Err(e) = cache.set_channel(module, channel, CoverMotion::Stopped.as_byte()) {
        warn!(%module, channel, error = %e, "stop: cache write failed");
        return;
    }
    let group = Group::of_channel(channel);
    let values = match cache.group(module, group) {
        Ok(values) => values,
        Err(e) => {
            warn!(%module, channel, error = %e, "stop: cache read failed");
            return;
        }
    };
    if let Err(e) = scheduler.write_group(module, group, values).await {
        warn!(%module, channel, error = %e, "stop command failed");
    }
}

/// Arm a stop `after` from now for one channel. The timer dies with the
/// engine's cancellation token.
pub(crate) fn schedule_stop(
    scheduler: SchedulerHandle,
    cache: Arc<StateCache>,
    covers: Arc<CoverRuntime>,
    module: ModuleAddress,
    channel: u8,
    after: Duration,
    cancel: CancellationToken,
) {
    let covers_for_task = covers.clone();
    let task = tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(after) => {
                issue_stop(&scheduler, &cache, &covers_for_task, module, channel).await;
            }
        }
    });
    covers.arm_stop(module, channel, task.abort_handle());
}

/// Watch bus events and keep the estimators honest.
///
/// Feedback answers reconcile positions with wall-button activity; a
/// button operation that carries its own travel time schedules the stop
/// the wall button implies.
pub(crate) async fn run_monitor(
    registry: Arc<ModuleRegistry>,
    cache: Arc<StateCache>,
    covers: Arc<CoverRuntime>,
    scheduler: SchedulerHandle,
    mut event_rx: broadcast::Receiver<BusEvent>,
    cancel: CancellationToken,
) {
    debug!("cover monitor running");
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = event_rx.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "cover monitor lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        match event {
            BusEvent::Refreshed { module } => {
                let is_roller = registry
                    .module(module)
                    .map(|m| m.kind == ModuleKind::Roller)
                    .unwrap_or(false);
                if !is_roller {
                    continue;
                }
                let Ok(snapshot) = cache.snapshot(module) else {
                    continue;
                };
                let count = registry
                    .module(module)
                    .map(|m| m.channel_count())
                    .unwrap_or(0);
                for channel in 1..=count {
                    let motion = CoverMotion::from_byte(snapshot.channel(channel));
                    covers.on_feedback(module, channel, motion);
                }
            }

            BusEvent::ButtonOperation(op) => {
                let Some(travel) = op.operation_time_s else {
                    continue;
                };
                if travel <= 0.0 {
                    continue;
                }
                for channel in covers.moving_channels(op.module, op.group) {
                    debug!(
                        module = %op.module,
                        channel,
                        travel_s = travel,
                        "arming button travel-time stop"
                    );
                    schedule_stop(
                        scheduler.clone(),
                        cache.clone(),
                        covers.clone(),
                        op.module,
                        channel,
                        Duration::from_secs_f64(travel),
                        cancel.clone(),
                    );
                }
            }

            _ => {}
        }
    }
    debug!("cover monitor stopped");
}
