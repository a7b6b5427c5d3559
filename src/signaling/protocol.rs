//! Формат сообщений relay: один JSON объект на WebSocket фрейм
//!
//! ```json
//! { "type": "offer", "sessionId": "abc", "role": "sender", "data": { ... } }
//! ```

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Роль участника сессии
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Join,
    Ready,
    Offer,
    Answer,
    #[serde(alias = "ice-candidate")]
    Candidate,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Join => "join",
            MessageKind::Ready => "ready",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::Candidate => "candidate",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Сообщение signaling. `data` непрозрачно для relay и принадлежит слою согласования.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub session_id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl SignalingMessage {
    pub fn new(kind: MessageKind, session_id: &str, role: Role) -> Self {
        Self {
            kind,
            session_id: session_id.to_string(),
            role,
            data: None,
        }
    }

    pub fn join(session_id: &str, role: Role) -> Self {
        Self::new(MessageKind::Join, session_id, role)
    }

    /// Уведомление отправителю: получатель в сессии
    pub fn ready(session_id: &str) -> Self {
        Self::new(MessageKind::Ready, session_id, Role::Receiver)
    }

    /// Сообщение с сериализуемой полезной нагрузкой
    pub fn with_payload<T: Serialize>(
        kind: MessageKind,
        session_id: &str,
        role: Role,
        payload: &T,
    ) -> Result<Self> {
        Ok(Self {
            data: Some(serde_json::to_value(payload)?),
            ..Self::new(kind, session_id, role)
        })
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("invalid signaling message: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Разбор `data` в тип слоя согласования
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| Error::Protocol(format!("{} message without data", self.kind)))?;
        serde_json::from_value(data)
            .map_err(|e| Error::Protocol(format!("invalid {} payload: {}", self.kind, e)))
    }
}
