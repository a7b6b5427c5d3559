//! Ошибки relay, signaling клиента и согласования

/// Result с ошибкой крейта
pub type Result<T> = std::result::Result<T, Error>;

/// Ошибки пересылки и согласования сессии
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Не удалось открыть signaling сокет
    #[error("Signaling connect failed: {0}")]
    Connect(String),

    /// Сбой signaling сокета после открытия
    #[error("Signaling transport error: {0}")]
    Transport(String),

    /// Ошибка создания/применения description или кандидата
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Некорректный signaling фрейм
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Устройство захвата недоступно или запрещено
    #[error("Media capture error: {0}")]
    Capture(String),

    /// Операция недопустима в текущем состоянии
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Некорректная конфигурация
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Ошибка движка детекции
    #[error("Detection error: {0}")]
    Detection(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Ошибки, после которых клиент переподключается сам
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connect(_) | Error::Transport(_) | Error::WebSocket(_) | Error::Io(_)
        )
    }

    /// Ошибки, переводящие согласование в `failed`
    pub fn is_negotiation_error(&self) -> bool {
        matches!(self, Error::Negotiation(_) | Error::WebRtc(_))
    }
}
