pub mod client;
pub mod protocol;
pub mod relay;

use crate::error::Result;
use async_trait::async_trait;

pub use client::{backoff_delay, ClientStatus, SignalingClient};
pub use protocol::{MessageKind, Role, SignalingMessage};
pub use relay::{Relay, RelayHandle, RelayOutcome, RelayServer};

/// Шина сообщений согласования со стороны участника
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Открыть соединение (или повторить `join`, если оно уже открыто)
    async fn connect(&self) -> Result<()>;

    /// Отправка без гарантии доставки; `false`, если сообщение отброшено
    fn send(&self, message: SignalingMessage) -> bool;

    async fn close(&self);
}
