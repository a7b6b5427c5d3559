pub mod config;
pub mod detection;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::{ClientConfig, PeerConfig, RelayConfig};
pub use error::{Error, Result};
pub use metrics::{MetricsCollector, PerformanceMetrics};
pub use peer::{open_peer, Negotiator, NegotiationState, PeerEvent, PeerSession};
pub use session::{Session, SessionRegistry};
pub use signaling::{Relay, RelayServer, Role, SignalingClient, SignalingMessage};

use tracing::info;

/// Запускает relay и держит его до Ctrl-C
pub async fn run(config: RelayConfig) -> Result<()> {
    let server = RelayServer::bind(&config).await?;
    let handle = server.spawn()?;
    info!("Relay ready at {}", handle.url());

    tokio::signal::ctrl_c().await?;
    info!(sessions = handle.relay().session_count(), "Shutting down relay");
    handle.shutdown().await;
    Ok(())
}
