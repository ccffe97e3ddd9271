use pitpat::{PitPatTreadmill, Result};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📊 PitPat Status Monitor Example");

    let treadmill = PitPatTreadmill::new();
    let mut updates = treadmill.subscribe();

    if let Err(e) = treadmill.connect().await {
        error!("❌ Failed to connect to device: {}", e);
        return Err(e);
    }

    info!("🔍 Printing every state change, press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => {
                let Some(snapshot) = update else { break };

                if !snapshot.is_connected() {
                    warn!("Device disconnected");
                    break;
                }

                let state = snapshot.state;
                let minutes = state.duration / 60;
                let seconds = state.duration % 60;

                println!("\n📊 {} ({minutes:02}:{seconds:02})", snapshot.mode);
                println!("┌─────────────────────────────────────────┐");
                println!(
                    "│ Speed: {:5.2} km/h  {:5.2} mph           │",
                    state.speed_kph, state.speed_mph
                );
                println!(
                    "│ Distance: {:6.3} km  {:6.3} mi         │",
                    state.distance_km, state.distance_mi
                );
                println!("│ Steps: {:12}                     │", state.steps);
                println!("│ Energy: {:8} kcal                  │", state.kilocalories);
                println!("└─────────────────────────────────────────┘");
            }
        }
    }

    info!("👋 Monitoring stopped");
    Ok(())
}
