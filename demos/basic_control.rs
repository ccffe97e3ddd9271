use pitpat::{Mode, PitPatTreadmill, Result, SpeedUnit};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🏃‍♂️ PitPat Basic Control Example");
    info!("Searching for PitPat devices...");

    let treadmill = PitPatTreadmill::new();

    if let Err(e) = treadmill.connect().await {
        error!("❌ Failed to connect to device: {}", e);
        return Err(e);
    }
    info!("✅ Connected, mode: {}", treadmill.mode());

    // Commands go out on the next heartbeat
    info!("▶️ Starting belt...");
    treadmill.start();

    while treadmill.mode() != Mode::Running {
        if !treadmill.is_connected() {
            error!("❌ Device went away while starting");
            return Ok(());
        }
        sleep(Duration::from_millis(200)).await;
    }
    info!("✅ Belt running");

    info!("⚡ Setting speed to 3.0 km/h...");
    treadmill.set_speed(3.0, SpeedUnit::Kilometers)?;
    sleep(Duration::from_secs(10)).await;

    info!("⚡ Setting speed to 2.5 mph...");
    treadmill.set_speed_mph(2.5)?;
    sleep(Duration::from_secs(10)).await;

    let state = treadmill.state();
    info!("📊 Current Status:");
    info!("  Speed: {:.2} km/h ({:.2} mph)", state.speed_kph, state.speed_mph);
    info!("  Distance: {:.3} km", state.distance_km);
    info!("  Steps: {}", state.steps);

    info!("⏸️ Pausing...");
    treadmill.pause();
    sleep(Duration::from_secs(5)).await;

    info!("⏹️ Stopping...");
    treadmill.stop();
    sleep(Duration::from_secs(2)).await;

    let state = treadmill.state();
    info!("📊 Final Status:");
    info!("  Mode: {}", treadmill.mode());
    info!("  Calories: {} kcal", state.kilocalories);
    info!("  Duration: {} s", state.duration);

    info!("🎉 Basic control example completed!");
    Ok(())
}
