// Конфигурация приложения
// Логирование по умолчанию включено только в режиме разработки, RUST_LOG всегда имеет приоритет

use crate::error::{Error, Result};
use crate::peer::media::CaptureHints;
use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

/// Адрес relay по умолчанию
pub const DEFAULT_RELAY_ADDR: &str = "0.0.0.0:8787";

/// URL relay по умолчанию для клиентов
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8787";

/// Базовая задержка переподключения
pub const RECONNECT_BASE: Duration = Duration::from_secs(1);

/// Верхняя граница задержки переподключения
pub const RECONNECT_CAP: Duration = Duration::from_secs(10);

/// Число попыток переподключения до остановки
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Настройки relay
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8787)),
        }
    }
}

/// Настройки signaling клиента
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub url: String,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub max_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RELAY_URL.to_string(),
            reconnect_base_ms: RECONNECT_BASE.as_millis() as u64,
            reconnect_cap_ms: RECONNECT_CAP.as_millis() as u64,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_cap_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(Error::InvalidConfig(format!(
                "relay url must use ws:// or wss://, got '{}'",
                self.url
            )));
        }
        if self.reconnect_cap_ms < self.reconnect_base_ms {
            return Err(Error::InvalidConfig(
                "reconnect cap must not be below the base delay".into(),
            ));
        }
        Ok(())
    }
}

/// Настройки участника: ICE серверы и параметры захвата
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PeerConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub capture: CaptureHints,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            capture: CaptureHints::default(),
        }
    }
}

impl PeerConfig {
    /// Валидация ICE серверов
    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "ICE server '{}' has an empty url",
                    server.id
                )));
            }

            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(Error::InvalidConfig(format!(
                    "TURN server '{}' requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }
}

/// Дефолтные STUN серверы
pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}
