//! Monitor real-time bus activity.
//!
//! Demonstrates subscribing to the gateway event stream and printing all
//! events as they arrive: button presses with their hold milestones and
//! short/long classification, module state refreshes, and connection
//! changes. Useful for mapping out which wall button carries which
//! address before writing a configuration file.
//!
//! # Usage
//!
//! ```sh
//! cargo run -p nikolink --example monitor_bus -- /dev/ttyUSB0
//! ```

use std::time::Duration;

use nikolink::{BusConfig, BusEvent, GatewayBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nikolink=info".into()),
        )
        .init();

    let connection = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyUSB0".to_string());

    println!("Connecting to PC-Link on {connection}...");

    // An empty config is fine for monitoring: every observed button shows
    // up as a ButtonDiscovered event.
    let gateway = GatewayBuilder::new(BusConfig::default())
        .connection_string(&connection)
        .no_periodic_refresh()
        .build()
        .await?;

    println!("Connected. Monitoring for 120 seconds...");
    println!("(Press wall buttons to generate events)\n");

    let mut events = gateway.subscribe();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
    let start = tokio::time::Instant::now();

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) => {
                let elapsed = start.elapsed();
                let ts = format!("{:>6}.{:03}s", elapsed.as_secs(), elapsed.subsec_millis());

                match event {
                    BusEvent::ButtonPressed(ev) => {
                        println!("{ts} ButtonPressed      {} (press {})", ev.address, ev.press_id);
                    }
                    BusEvent::ButtonTimer(ev) => {
                        println!(
                            "{ts} ButtonTimer        {} held {}s",
                            ev.address,
                            ev.threshold_s.unwrap_or(0)
                        );
                    }
                    BusEvent::ButtonReleased(ev) => {
                        println!(
                            "{ts} ButtonReleased     {} after {:.2}s",
                            ev.address,
                            ev.duration_s.unwrap_or(0.0)
                        );
                    }
                    BusEvent::ShortButtonPressed(ev) => {
                        println!("{ts} ShortButtonPressed {}", ev.address);
                    }
                    BusEvent::LongButtonPressed(ev) => {
                        println!("{ts} LongButtonPressed  {}", ev.address);
                    }
                    BusEvent::ButtonPressedBucket(ev) => {
                        println!(
                            "{ts} ButtonPressed_{}    {}",
                            ev.bucket.unwrap_or(0),
                            ev.address
                        );
                    }
                    BusEvent::ButtonOperation(op) => {
                        println!(
                            "{ts} ButtonOperation    {} -> module {} group {}",
                            op.button, op.module, op.group
                        );
                    }
                    BusEvent::ButtonDiscovered { address } => {
                        println!("{ts} ButtonDiscovered   {address}  (not in config)");
                    }
                    BusEvent::Refreshed { module } => {
                        println!("{ts} Refreshed          module {module}");
                    }
                    BusEvent::Connected => println!("{ts} Connected"),
                    BusEvent::Disconnected => println!("{ts} Disconnected"),
                    BusEvent::Reconnecting { attempt } => {
                        println!("{ts} Reconnecting       attempt {attempt}");
                    }
                }
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(n))) => {
                println!("(missed {n} events due to lag)");
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => break,
            Err(_) => break,
        }
    }

    println!("\nMonitoring complete.");
    gateway.shutdown().await;
    Ok(())
}
