use solarman_bridge::prelude::*;

#[tokio::main]
async fn main() {
    let cancel = CancellationToken::new();

    // Handle Ctrl+C
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        ctrl_c.cancel();
    });

    if let Err(e) = solarman_bridge::app(cancel).await {
        // logging may not be up yet if the config failed to load
        eprintln!("solarman-bridge: {:#}", e);
        std::process::exit(255);
    }
}
