//! Граница между согласованием и примитивом связности.
//! Согласование управляет транспортом, но не реализует его.

use crate::error::Result;
use crate::peer::media::{MediaTrack, RemoteMedia};
use crate::peer::state::ConnectivityState;
use crate::peer::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Асинхронные события транспорта
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Локальный кандидат готов к отправке
    Candidate(IceCandidate),
    StateChanged(ConnectivityState),
    /// Пришёл входящий трек
    Track(RemoteMedia),
}

/// Канал событий одного поколения транспорта
#[derive(Debug, Clone)]
pub struct TransportEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportEvents {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Создаёт offer и устанавливает его как local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Создаёт answer и устанавливает его как local description
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn add_track(&self, track: &MediaTrack) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Создаёт новый транспорт для каждого запуска согласования
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn PeerTransport>>;
}
