// nikolink test application -- CLI tool for exercising the PC-Link engine
// against a real installation or a mock transport.
//
// Usage:
//   nikolink-test-app --connection /dev/ttyUSB0 --config nikobus_config.json switch on 4707 1
//   nikolink-test-app --connection 192.168.1.50:9999 --config cfg.json dimmer set C9A5 9 128
//   nikolink-test-app --connection /dev/ttyUSB0 --config cfg.json cover position 9105 1 50
//   nikolink-test-app --connection /dev/ttyUSB0 --config cfg.json refresh 4707
//   nikolink-test-app --connection /dev/ttyUSB0 monitor --duration 60
//   nikolink-test-app --mock --config cfg.json switch on 4707 1

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use nikolink::{BusConfig, BusEvent, Gateway, GatewayBuilder, ModuleAddress};
use nikolink_test_harness::MockLink;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// nikolink test application -- exercises the engine from the command line.
#[derive(Parser)]
#[command(name = "nikolink-test-app", version, about)]
struct Cli {
    /// Connection string: a serial device path (/dev/ttyUSB0, COM3) or a
    /// host:port of a serial-over-TCP bridge.
    #[arg(long)]
    connection: Option<String>,

    /// Path to the bus configuration JSON (modules, buttons, scenes).
    #[arg(long)]
    config: Option<String>,

    /// The installation has a Feedback Module (disables polling refresh).
    #[arg(long)]
    feedback_module: bool,

    /// Use a mock transport instead of real hardware.
    /// Useful for verifying CLI parsing and builder wiring.
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Relay output control.
    Switch {
        #[command(subcommand)]
        action: SwitchAction,
    },
    /// Dimmer output control.
    Dimmer {
        #[command(subcommand)]
        action: DimmerAction,
    },
    /// Roller shutter control.
    Cover {
        #[command(subcommand)]
        action: CoverAction,
    },
    /// Read a module's state off the bus and print it.
    Refresh {
        /// Module address (4 hex chars).
        address: String,
    },
    /// Simulate a wall-button press.
    Press {
        /// Button address (6 hex chars).
        address: String,
    },
    /// Activate a configured scene.
    Scene {
        /// Scene id from the configuration.
        id: String,
    },
    /// Watch bus events.
    Monitor {
        /// How long to monitor, in seconds.
        #[arg(long, default_value_t = 60)]
        duration: u64,
    },
    /// Sweep a module's inventory and print discovered devices.
    Inventory {
        /// Module address (4 hex chars).
        address: String,
        /// How long to wait for responses, in seconds.
        #[arg(long, default_value_t = 90)]
        wait: u64,
    },
}

#[derive(Subcommand)]
enum SwitchAction {
    On { address: String, channel: u8 },
    Off { address: String, channel: u8 },
    Get { address: String, channel: u8 },
}

#[derive(Subcommand)]
enum DimmerAction {
    Set {
        address: String,
        channel: u8,
        brightness: u8,
    },
    Get {
        address: String,
        channel: u8,
    },
}

#[derive(Subcommand)]
enum CoverAction {
    Open { address: String, channel: u8 },
    Close { address: String, channel: u8 },
    Stop { address: String, channel: u8 },
    Position {
        address: String,
        channel: u8,
        target: u8,
    },
    Get { address: String, channel: u8 },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nikolink=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {path}"))?;
            serde_json::from_str::<BusConfig>(&text)
                .with_context(|| format!("parsing config file {path}"))?
        }
        None => BusConfig::default(),
    };

    let builder = GatewayBuilder::new(config).has_feedback_module(cli.feedback_module);

    let gateway = if cli.mock {
        let (link, _bus) = MockLink::pair();
        builder
            .no_periodic_refresh()
            .build_with_link(Box::new(link))
            .await?
    } else {
        let Some(connection) = &cli.connection else {
            bail!("--connection is required unless --mock is given");
        };
        builder.connection_string(connection).build().await?
    };

    let result = run_command(&gateway, cli.command).await;
    gateway.shutdown().await;
    result
}

async fn run_command(gateway: &Gateway, command: Command) -> Result<()> {
    match command {
        Command::Switch { action } => match action {
            SwitchAction::On { address, channel } => {
                gateway.turn_on_switch(module(&address)?, channel).await?;
                println!("switch {address}:{channel} on");
            }
            SwitchAction::Off { address, channel } => {
                gateway.turn_off_switch(module(&address)?, channel).await?;
                println!("switch {address}:{channel} off");
            }
            SwitchAction::Get { address, channel } => {
                let on = gateway.switch_is_on(module(&address)?, channel)?;
                println!("switch {address}:{channel} is {}", if on { "on" } else { "off" });
            }
        },

        Command::Dimmer { action } => match action {
            DimmerAction::Set {
                address,
                channel,
                brightness,
            } => {
                gateway
                    .set_dimmer(module(&address)?, channel, brightness)
                    .await?;
                println!("dimmer {address}:{channel} set to {brightness}");
            }
            DimmerAction::Get { address, channel } => {
                let level = gateway.dimmer_brightness(module(&address)?, channel)?;
                println!("dimmer {address}:{channel} at {level}");
            }
        },

        Command::Cover { action } => match action {
            CoverAction::Open { address, channel } => {
                gateway.open_cover(module(&address)?, channel).await?;
                println!("cover {address}:{channel} opening");
            }
            CoverAction::Close { address, channel } => {
                gateway.close_cover(module(&address)?, channel).await?;
                println!("cover {address}:{channel} closing");
            }
            CoverAction::Stop { address, channel } => {
                gateway.stop_cover(module(&address)?, channel).await?;
                println!("cover {address}:{channel} stopped");
            }
            CoverAction::Position {
                address,
                channel,
                target,
            } => {
                let addr = module(&address)?;
                gateway.set_cover_position(addr, channel, target).await?;
                println!("cover {address}:{channel} heading to {target} %");
            }
            CoverAction::Get { address, channel } => {
                let addr = module(&address)?;
                let position = gateway.cover_position(addr, channel)?;
                let motion = gateway.cover_motion(addr, channel)?;
                println!("cover {address}:{channel} at {position} % ({motion})");
            }
        },

        Command::Refresh { address } => {
            let addr = module(&address)?;
            gateway.refresh_module(addr).await?;
            let state = gateway.output_state(addr)?;
            let hex: String = state.bytes().iter().map(|b| format!("{b:02X}")).collect();
            println!("module {address}: {hex}");
        }

        Command::Press { address } => {
            let button = address
                .parse()
                .with_context(|| format!("invalid button address {address}"))?;
            gateway.press_virtual_button(button).await?;
            println!("pressed {address}");
        }

        Command::Scene { id } => {
            gateway.activate_scene(&id).await?;
            println!("scene {id} activated");
        }

        Command::Monitor { duration } => {
            let mut events = gateway.subscribe();
            let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
            println!("monitoring for {duration}s...");

            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, events.recv()).await {
                    Ok(Ok(event)) => print_event(&event),
                    Ok(Err(_)) | Err(_) => break,
                }
            }
        }

        Command::Inventory { address, wait } => {
            gateway.query_inventory(module(&address)?)?;
            println!("sweeping {address} for {wait}s...");
            tokio::time::sleep(Duration::from_secs(wait)).await;

            let devices = gateway.discovered_devices();
            if devices.is_empty() {
                println!("no devices discovered");
            }
            for device in devices {
                match device.device_type {
                    Some(t) => println!(
                        "{}  type {:02X}  {} ({}, {} channels)",
                        device.address, device.type_code, t.name, t.model, t.channels
                    ),
                    None => println!(
                        "{}  type {:02X}  (unknown device type)",
                        device.address, device.type_code
                    ),
                }
            }
        }
    }
    Ok(())
}

fn module(address: &str) -> Result<ModuleAddress> {
    address
        .parse()
        .with_context(|| format!("invalid module address {address}"))
}

fn print_event(event: &BusEvent) {
    match event {
        BusEvent::ButtonPressed(ev) => println!("pressed   {}", ev.address),
        BusEvent::ButtonReleased(ev) => println!(
            "released  {} after {:.2}s",
            ev.address,
            ev.duration_s.unwrap_or(0.0)
        ),
        BusEvent::ShortButtonPressed(ev) => println!("short     {}", ev.address),
        BusEvent::LongButtonPressed(ev) => println!("long      {}", ev.address),
        BusEvent::ButtonTimer(ev) => println!(
            "timer_{}   {}",
            ev.threshold_s.unwrap_or(0),
            ev.address
        ),
        BusEvent::ButtonPressedBucket(ev) => println!(
            "pressed_{} {}",
            ev.bucket.unwrap_or(0),
            ev.address
        ),
        BusEvent::ButtonOperation(op) => println!(
            "operation {} -> {} group {}",
            op.button, op.module, op.group
        ),
        BusEvent::ButtonDiscovered { address } => println!("discovered {address}"),
        BusEvent::Refreshed { module } => println!("refreshed {module}"),
        BusEvent::Connected => println!("connected"),
        BusEvent::Disconnected => println!("disconnected"),
        BusEvent::Reconnecting { attempt } => println!("reconnecting (attempt {attempt})"),
    }
}
