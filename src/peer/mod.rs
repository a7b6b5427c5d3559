pub mod connection;
pub mod ice;
pub mod media;
pub mod negotiator;
pub mod state;
pub mod transport;
pub mod types;

use crate::config::{ClientConfig, PeerConfig};
use crate::error::Result;
use crate::signaling::{Role, SignalingClient};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use connection::{WebRtcTransport, WebRtcTransportFactory};
pub use media::{CaptureHints, Facing, LocalMedia, MediaCapture, MediaTrack, RemoteMedia, TrackKind};
pub use negotiator::{Disposition, IgnoreReason, Negotiator, PeerEvent};
pub use state::{ConnectivityState, NegotiationState, PeerStatus};
pub use transport::{PeerTransport, TransportEvent, TransportEvents, TransportFactory};
pub use types::{IceCandidate, SdpKind, SdpPayload, ServerConfig, SessionDescription};

/// Участник сессии: негоциатор, его signaling клиент и цикл обработки
pub struct PeerSession {
    pub negotiator: Arc<Negotiator>,
    pub client: Arc<SignalingClient>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
    pub driver: JoinHandle<()>,
}

/// Собирает участника поверх WebRTC транспорта. `start()` вызывает владелец.
pub fn open_peer(
    role: Role,
    session_id: &str,
    client_config: ClientConfig,
    peer_config: PeerConfig,
    capture: Option<Arc<dyn MediaCapture>>,
) -> Result<PeerSession> {
    peer_config.validate()?;
    let hints = peer_config.capture.clone();
    let factory = Arc::new(WebRtcTransportFactory::new(peer_config));
    open_peer_with(role, session_id, client_config, factory, capture, hints)
}

/// То же с произвольной фабрикой транспорта
pub fn open_peer_with(
    role: Role,
    session_id: &str,
    client_config: ClientConfig,
    factory: Arc<dyn TransportFactory>,
    capture: Option<Arc<dyn MediaCapture>>,
    hints: CaptureHints,
) -> Result<PeerSession> {
    client_config.validate()?;

    let client = Arc::new(SignalingClient::new(client_config, session_id, role));
    let (signals_tx, signals_rx) = mpsc::unbounded_channel();
    client.on_message(move |message| {
        let _ = signals_tx.send(message);
    });

    let (negotiator, events) = Negotiator::new(
        role,
        session_id,
        Arc::clone(&client) as Arc<dyn crate::signaling::Signaling>,
        factory,
        capture,
        hints,
    );
    let driver = negotiator.spawn(signals_rx);

    Ok(PeerSession {
        negotiator,
        client,
        events,
        driver,
    })
}
