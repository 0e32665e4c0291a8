use anyhow::Context;
use s0_smartmeter::http_api;
use s0_smartmeter::{ConfigStore, MeterCoordinator, RuntimeSettings, SimulatedPort, SystemClock};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    info!("Starting S0 smartmeter");
    let settings = RuntimeSettings::from_env()?;
    let store = Arc::new(ConfigStore::load(&settings.config_path));

    // No memory-mapped port on a hosted target; the inputs live in a
    // simulated port that the simulation mode drives.
    let port = Arc::new(SimulatedPort::new());
    let clock = Arc::new(SystemClock::new());

    let mut coordinator = MeterCoordinator::start(&settings, store, port.clone(), clock);
    if settings.simulate {
        let started = coordinator.start_simulation(port);
        info!("{} simulated meter(s) running", started);
    }

    server_context(settings.http_listen, http_api::router(coordinator.app_state())).await
}

async fn server_context(socket_addr: SocketAddr, app: axum::Router) -> anyhow::Result<()> {
    info!("Starting up server on {socket_addr}");
    let listener = TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("failed to bind {socket_addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}
