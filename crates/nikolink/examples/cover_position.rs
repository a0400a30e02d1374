//! Drive a roller shutter to a target position.
//!
//! Shows the time-based position estimation: the shutter is calibrated by
//! a full open, driven to 50 %, and its estimated position printed while
//! it travels.
//!
//! # Usage
//!
//! ```sh
//! cargo run -p nikolink --example cover_position -- /dev/ttyUSB0
//! ```

use std::time::Duration;

use nikolink::{BusConfig, GatewayBuilder, ModuleAddress};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let connection = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyUSB0".to_string());

    // One roller module with a 25 s shutter on channel 1.
    let config: BusConfig = serde_json::from_str(
        r#"{
            "modules": [
                {"type": "roller", "address": "9105", "channels": [
                    {"description": "Living room shutter", "operation_time": "25"}
                ]}
            ]
        }"#,
    )?;

    let gateway = GatewayBuilder::new(config)
        .connection_string(&connection)
        .build()
        .await?;

    let module: ModuleAddress = "9105".parse()?;

    // Full open first so the estimator has a known reference.
    println!("Opening fully to calibrate...");
    gateway.open_cover(module, 1).await?;
    tokio::time::sleep(Duration::from_secs(26)).await;
    gateway.stop_cover(module, 1).await?;
    gateway.calibrate_cover(module, 1, 100)?;

    println!("Driving to 50 %...");
    gateway.set_cover_position(module, 1, 50).await?;

    loop {
        let position = gateway.cover_position(module, 1)?;
        let motion = gateway.cover_motion(module, 1)?;
        println!("position {position:>3} %  ({motion})");
        if motion == nikolink::CoverMotion::Stopped {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    println!("Done.");
    gateway.shutdown().await;
    Ok(())
}
