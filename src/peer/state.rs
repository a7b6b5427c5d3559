use crate::peer::ice::PendingCandidates;
use crate::peer::media::{LocalMedia, RemoteMedia};
use crate::peer::transport::PeerTransport;
use crate::peer::types::{IceCandidate, SdpPayload};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Фаза согласования
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    Idle,
    AwaitingPeer,
    Offering,
    Answering,
    Connected,
    /// Конечное состояние
    Disconnected,
    Failed,
}

impl NegotiationState {
    /// Идёт обмен description
    pub fn is_negotiating(self) -> bool {
        matches!(self, NegotiationState::Offering | NegotiationState::Answering)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::AwaitingPeer => "awaiting-peer",
            NegotiationState::Offering => "offering",
            NegotiationState::Answering => "answering",
            NegotiationState::Connected => "connected",
            NegotiationState::Disconnected => "disconnected",
            NegotiationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Состояние транспорта, пересылается владельцу как есть
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectivityState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
            RTCPeerConnectionState::Connected => ConnectivityState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectivityState::Failed,
            RTCPeerConnectionState::Closed => ConnectivityState::Closed,
            _ => ConnectivityState::New,
        }
    }
}

/// Две независимые оси статуса
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStatus {
    pub negotiation: NegotiationState,
    pub connectivity: ConnectivityState,
}

/// Состояние одного участника; мьютекс не удерживается через `.await`
pub(crate) struct PeerState {
    pub state: NegotiationState,
    pub connectivity: ConnectivityState,
    /// Поколение транспорта, растёт при каждом `start()`
    pub generation: u64,
    pub transport: Option<Arc<dyn PeerTransport>>,
    pub connection_id: Option<String>,
    pub local_description: Option<SdpPayload>,
    pub remote_descriptions: u32,
    /// Транспорт сообщил connected в текущем поколении
    pub transport_connected: bool,
    /// Кандидаты, полученные до установки remote description
    pub pending: PendingCandidates,
    /// Локальные кандидаты текущего соединения
    pub local_candidates: Vec<IceCandidate>,
    pub local_media: Option<Box<dyn LocalMedia>>,
    pub remote_media: Option<RemoteMedia>,
}

impl PeerState {
    pub fn new() -> Self {
        Self {
            state: NegotiationState::Idle,
            connectivity: ConnectivityState::New,
            generation: 0,
            transport: None,
            connection_id: None,
            local_description: None,
            remote_descriptions: 0,
            transport_connected: false,
            pending: PendingCandidates::default(),
            local_candidates: Vec::new(),
            local_media: None,
            remote_media: None,
        }
    }

    /// Сброс перед новым обменом description
    pub fn reset_exchange(&mut self) {
        self.connectivity = ConnectivityState::New;
        self.connection_id = None;
        self.local_description = None;
        self.remote_descriptions = 0;
        self.transport_connected = false;
        self.pending.clear();
        self.local_candidates.clear();
        self.remote_media = None;
    }

    /// Результат await всё ещё относится к текущему обмену
    pub fn is_current(&self, generation: u64, expected: NegotiationState) -> bool {
        self.generation == generation && self.state == expected
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            negotiation: self.state,
            connectivity: self.connectivity,
        }
    }
}
