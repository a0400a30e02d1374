//! GatewayBuilder -- fluent builder for constructing [`Gateway`] instances.
//!
//! Separates configuration from construction so that callers can set up
//! timings and behaviour switches before the link is opened. The builder
//! performs the handshake and spawns the engine's background tasks.
//!
//! # Example
//!
//! ```no_run
//! use nikolink_pclink::builder::GatewayBuilder;
//! use nikolink_core::BusConfig;
//!
//! # async fn example(config: BusConfig) -> nikolink_core::Result<()> {
//! let gateway = GatewayBuilder::new(config)
//!     .connection_string("/dev/ttyUSB0")
//!     .has_feedback_module(true)
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nikolink_core::config::{BusConfig, ModuleRegistry};
use nikolink_core::error::{Error, Result};
use nikolink_core::events::BusEvent;
use nikolink_core::transport::Transport;

use crate::button::{self, ButtonEngine, ButtonSettings};
use crate::cover::{self, CoverRuntime};
use crate::discovery;
use crate::gateway::{EngineCtx, Gateway};
use crate::handshake;
use crate::io::{self, LinkFactory, LinkSettings};
use crate::listener::{self, Listener};
use crate::scheduler::{self, SchedulerSettings};
use crate::state::StateCache;

/// Default interval of the polling refresh loop (no Feedback Module).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(120);

/// Fluent builder for [`Gateway`].
///
/// All timings default to the values the bus was characterised with; the
/// usual reasons to touch them are tests (shorter windows) and unusually
/// slow bridges (longer ones).
pub struct GatewayBuilder {
    config: BusConfig,
    connection: Option<String>,
    has_feedback_module: bool,
    refresh_interval: Duration,
    periodic_refresh: bool,
    scheduler: SchedulerSettings,
    buttons: ButtonSettings,
    link: LinkSettings,
    event_capacity: usize,
}

impl GatewayBuilder {
    /// Create a builder over a parsed bus configuration.
    pub fn new(config: BusConfig) -> Self {
        GatewayBuilder {
            config,
            connection: None,
            has_feedback_module: false,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            periodic_refresh: true,
            scheduler: SchedulerSettings::default(),
            buttons: ButtonSettings::default(),
            link: LinkSettings::default(),
            event_capacity: 256,
        }
    }

    /// Where to reach the PC-Link: a serial device path or `host:port`.
    pub fn connection_string(mut self, connection: &str) -> Self {
        self.connection = Some(connection.to_string());
        self
    }

    /// Declare that the installation has a Feedback Module. The module
    /// pushes `$1C` answers by itself, so the polling refresh loop is
    /// disabled.
    pub fn has_feedback_module(mut self, present: bool) -> Self {
        self.has_feedback_module = present;
        self
    }

    /// Interval of the polling refresh loop (default 120 s).
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Disable the polling refresh loop entirely.
    pub fn no_periodic_refresh(mut self) -> Self {
        self.periodic_refresh = false;
        self
    }

    /// Minimum gap between commands on the bus (default 300 ms).
    pub fn command_pacing(mut self, pacing: Duration) -> Self {
        self.scheduler.pacing = pacing;
        self
    }

    /// Delay between a write and watching for its ACK (default 80 ms).
    pub fn ack_settle(mut self, settle: Duration) -> Self {
        self.scheduler.ack_settle = settle;
        self
    }

    /// Window for one attempt's ACK + answer (default 15 s).
    pub fn ack_window(mut self, window: Duration) -> Self {
        self.scheduler.ack_window = window;
        self
    }

    /// Wait for each individual response line (default 5 s).
    pub fn answer_timeout(mut self, timeout: Duration) -> Self {
        self.scheduler.answer_timeout = timeout;
        self
    }

    /// Transmissions per command before giving up (default 3).
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.scheduler.max_attempts = attempts;
        self
    }

    /// Press duration separating short from long presses (default 500 ms).
    pub fn long_press_threshold(mut self, threshold: Duration) -> Self {
        self.buttons.long_press_threshold = threshold;
        self
    }

    /// Repeat-absence window that declares a button release (default 400 ms).
    pub fn release_window(mut self, window: Duration) -> Self {
        self.buttons.release_window = window;
        self
    }

    /// Duplicate-press suppression after a release (default 100 ms).
    pub fn press_debounce(mut self, debounce: Duration) -> Self {
        self.buttons.press_debounce = debounce;
        self
    }

    /// Settle delay before refreshing a dimmer after a press (default 1 s).
    pub fn dimmer_settle(mut self, settle: Duration) -> Self {
        self.buttons.dimmer_settle = settle;
        self
    }

    /// Settle delay between handshake frames (default 100 ms).
    pub fn handshake_settle(mut self, settle: Duration) -> Self {
        self.link.handshake_settle = settle;
        self
    }

    /// Read-side silence that closes the link (default 120 s).
    pub fn read_idle_timeout(mut self, timeout: Duration) -> Self {
        self.link.idle_timeout = timeout;
        self
    }

    /// Capacity of the event broadcast channel (default 256).
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Open the link from the connection string, with automatic
    /// reconnection on loss.
    pub async fn build(self) -> Result<Gateway> {
        let connection = self.connection.clone().ok_or_else(|| {
            Error::InvalidArgument("no connection string configured".into())
        })?;

        let transport = nikolink_transport::open_link(&connection).await?;
        let factory: LinkFactory = Box::new(move || {
            let connection = connection.clone();
            Box::pin(async move { nikolink_transport::open_link(&connection).await })
        });
        self.build_internal(transport, Some(factory)).await
    }

    /// Build over a caller-provided transport.
    ///
    /// This is the primary entry point for testing (pass a `MockLink`
    /// from `nikolink-test-harness`). Reconnection is not available; a
    /// lost link stays lost.
    pub async fn build_with_link(self, transport: Box<dyn Transport>) -> Result<Gateway> {
        self.build_internal(transport, None).await
    }

    async fn build_internal(
        self,
        mut transport: Box<dyn Transport>,
        factory: Option<LinkFactory>,
    ) -> Result<Gateway> {
        handshake::perform(&mut *transport, self.link.handshake_settle).await?;

        let registry = Arc::new(ModuleRegistry::new(&self.config));
        let cache = Arc::new(StateCache::new(&registry));
        let covers = Arc::new(CoverRuntime::new(&registry));
        let (event_tx, _) = broadcast::channel(self.event_capacity);
        let (scheduler_handle, cmd_rx) = scheduler::command_queue(64);

        let (write_tx, write_rx) = mpsc::channel(32);
        let (line_tx, line_rx) = mpsc::channel(256);
        let (button_tx, button_rx) = mpsc::channel(64);
        let (response_tx, response_rx) = mpsc::channel(256);
        let (inventory_tx, inventory_rx) = mpsc::channel(256);

        let cancel = CancellationToken::new();
        let ctx = Arc::new(EngineCtx {
            registry: registry.clone(),
            cache: cache.clone(),
            scheduler: scheduler_handle.clone(),
            event_tx: event_tx.clone(),
            covers: covers.clone(),
            discovered: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(io::run_link(
            transport,
            factory,
            self.link.clone(),
            write_rx,
            line_tx,
            event_tx.clone(),
            cancel.clone(),
        )));

        let listener = Listener::new(
            cache.clone(),
            event_tx.clone(),
            button_tx,
            response_tx,
            inventory_tx,
        );
        tasks.push(tokio::spawn(listener::run(listener, line_rx, cancel.clone())));

        tasks.push(tokio::spawn(scheduler::run(
            self.scheduler.clone(),
            cmd_rx,
            response_rx,
            write_tx,
            cache.clone(),
            event_tx.clone(),
            cancel.clone(),
        )));

        let engine = ButtonEngine {
            registry: registry.clone(),
            scheduler: scheduler_handle.clone(),
            event_tx: event_tx.clone(),
            settings: self.buttons.clone(),
            press_seq: AtomicU64::new(1),
        };
        tasks.push(tokio::spawn(button::run(engine, button_rx, cancel.clone())));

        tasks.push(tokio::spawn(cover::run_monitor(
            registry.clone(),
            cache.clone(),
            covers,
            scheduler_handle,
            event_tx.subscribe(),
            cancel.clone(),
        )));

        tasks.push(tokio::spawn(run_inventory_collector(
            ctx.clone(),
            inventory_rx,
            cancel.clone(),
        )));

        tasks.push(tokio::spawn(run_reconnect_refresh(
            ctx.clone(),
            event_tx.subscribe(),
            cancel.clone(),
        )));

        if self.periodic_refresh && !self.has_feedback_module {
            tasks.push(tokio::spawn(run_periodic_refresh(
                ctx.clone(),
                self.refresh_interval,
                cancel.clone(),
            )));
        } else {
            debug!(
                has_feedback_module = self.has_feedback_module,
                "polling refresh disabled"
            );
        }

        info!(
            modules = registry.modules().count(),
            has_feedback_module = self.has_feedback_module,
            "gateway running"
        );
        Ok(Gateway::new(ctx, cancel, tasks))
    }
}

/// Poll every module's state on a fixed interval. Only runs when no
/// Feedback Module does that job on the bus itself.
async fn run_periodic_refresh(
    ctx: Arc<EngineCtx>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => ctx.refresh_all().await,
        }
    }
}

/// Refresh the installation after every reconnect: writes are not
/// replayed across a link loss, so the mirror must be re-read.
async fn run_reconnect_refresh(
    ctx: Arc<EngineCtx>,
    mut event_rx: broadcast::Receiver<BusEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = event_rx.recv() => match event {
                Ok(BusEvent::Connected) => {
                    info!("reconnected, refreshing all modules");
                    ctx.refresh_all().await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Collect devices announced during inventory sweeps.
async fn run_inventory_collector(
    ctx: Arc<EngineCtx>,
    mut inventory_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = inventory_rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        if let Some(device) = discovery::parse_device_announcement(&line) {
            let mut devices = ctx.discovered.lock().expect("discovery list poisoned");
            if devices.iter().all(|d| d.address != device.address) {
                info!(
                    address = %device.address,
                    type_code = device.type_code,
                    name = device.device_type.map(|t| t.name).unwrap_or("Unknown"),
                    "device discovered"
                );
                devices.push(device);
            }
        } else {
            warn!(line, "unparsed inventory response");
        }
    }
}
