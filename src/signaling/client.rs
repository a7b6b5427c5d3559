//! WebSocket signaling клиент участника
//!
//! `connect()` открывает сокет и сразу отправляет `join`. Исходящей очереди нет:
//! пока сокет закрыт, `send()` отбрасывает сообщения. При неожиданном закрытии
//! клиент переподключается с линейно растущей задержкой, ограниченной сверху,
//! не более `max_attempts` раз; после этого статус `Exhausted` окончателен.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::signaling::protocol::{Role, SignalingMessage};
use crate::signaling::Signaling;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Обработчик входящих сообщений, вызывается синхронно в порядке прихода
pub type MessageHandler = Arc<dyn Fn(SignalingMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Idle,
    Connecting,
    Open,
    Reconnecting { attempt: u32 },
    /// Попытки исчерпаны, клиент нужно пересоздать
    Exhausted,
    /// Закрыт владельцем
    Closed,
}

/// Задержка перед попыткой `attempt` (с 1): base × attempt, не больше cap
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt).min(cap)
}

struct Shared {
    config: ClientConfig,
    session_id: String,
    role: Role,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    handler: Mutex<Option<MessageHandler>>,
    status: watch::Sender<ClientStatus>,
    closed: AtomicBool,
    generation: AtomicU64,
    shutdown: Notify,
    /// Запущена задача переподключения (не больше одной)
    supervising: AtomicBool,
    /// Сериализует вызовы `connect()`
    connect_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    fn set_status(&self, status: ClientStatus) {
        self.status.send_replace(status);
    }

    fn outbound(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<Message>>> {
        self.outbound.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn rejoin(&self) -> Result<()> {
        let join = self.join_frame()?;
        if let Some(tx) = self.outbound().as_ref() {
            let _ = tx.send(join);
        }
        Ok(())
    }

    fn join_frame(&self) -> Result<Message> {
        Ok(Message::Text(
            SignalingMessage::join(&self.session_id, self.role).to_json()?,
        ))
    }

    fn dispatch(&self, text: &str) {
        let message = match SignalingMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    error = %e,
                    "skipping unreadable signaling frame"
                );
                return;
            }
        };

        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match handler {
            Some(handler) => handler(message),
            None => debug!(kind = %message.kind, "no signaling handler registered"),
        }
    }
}

pub struct SignalingClient {
    shared: Arc<Shared>,
}

impl SignalingClient {
    pub fn new(config: ClientConfig, session_id: &str, role: Role) -> Self {
        let (status, _) = watch::channel(ClientStatus::Idle);
        Self {
            shared: Arc::new(Shared {
                config,
                session_id: session_id.to_string(),
                role,
                outbound: Mutex::new(None),
                handler: Mutex::new(None),
                status,
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                shutdown: Notify::new(),
                supervising: AtomicBool::new(false),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Регистрирует единственный обработчик входящих сообщений (заменяя прежний)
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(SignalingMessage) + Send + Sync + 'static,
    {
        *self.shared.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(handler));
    }

    pub fn status(&self) -> ClientStatus {
        *self.shared.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.shared
            .outbound()
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Открывает сокет и отправляет `join`. Если сокет уже открыт, только
    /// повторяет `join`; во время переподключения ждёт его исхода.
    pub async fn connect(&self) -> Result<()> {
        let _serial = self.shared.connect_lock.lock().await;

        if self.shared.supervising.load(Ordering::SeqCst) {
            let mut status = self.subscribe();
            let settled = *status
                .wait_for(|s| !matches!(s, ClientStatus::Reconnecting { .. }))
                .await
                .map_err(|_| Error::InvalidState("signaling client dropped".into()))?;
            debug!(
                session_id = %self.shared.session_id,
                ?settled,
                "connect joined running supervisor"
            );
        }

        match self.status() {
            ClientStatus::Exhausted | ClientStatus::Closed => {
                return Err(Error::InvalidState(
                    "signaling client is terminal, create a new one".into(),
                ))
            }
            _ => {}
        }

        if self.shared.supervising.load(Ordering::SeqCst) {
            // сокетом владеет supervisor; при обрыве он сам повторит join
            return self.shared.rejoin();
        }

        self.shared.set_status(ClientStatus::Connecting);
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        if let Err(e) = open_socket(&self.shared, closed_tx.clone()).await {
            let status = if self.shared.is_closed() {
                ClientStatus::Closed
            } else {
                ClientStatus::Idle
            };
            self.shared.set_status(status);
            return Err(e);
        }

        self.shared.supervising.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            supervise(Arc::clone(&shared), closed_tx, closed_rx).await;
            shared.supervising.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    /// Отправка без очереди: при закрытом сокете сообщение теряется
    pub fn send(&self, message: SignalingMessage) -> bool {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!(kind = %message.kind, error = %e, "failed to encode signaling message");
                return false;
            }
        };

        let sent = self
            .shared
            .outbound()
            .as_ref()
            .map(|tx| tx.send(Message::Text(text)).is_ok())
            .unwrap_or(false);

        if !sent {
            warn!(
                session_id = %self.shared.session_id,
                kind = %message.kind,
                "signaling not open, dropping message"
            );
        }
        sent
    }

    /// Закрытие владельцем; переподключения не будет
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // drop отправителя завершает writer, он закрывает сокет
        self.shared.outbound().take();
        self.shared.set_status(ClientStatus::Closed);
        self.shared.shutdown.notify_waiters();
        info!(
            session_id = %self.shared.session_id,
            role = %self.shared.role,
            "signaling client closed"
        );
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Signaling for SignalingClient {
    async fn connect(&self) -> Result<()> {
        SignalingClient::connect(self).await
    }

    fn send(&self, message: SignalingMessage) -> bool {
        SignalingClient::send(self, message)
    }

    async fn close(&self) {
        SignalingClient::close(self)
    }
}

/// Открывает сокет, ставит `join` первым фреймом и запускает reader/writer.
/// Reader по завершении сообщает поколение сокета в `closed_tx`.
async fn open_socket(shared: &Arc<Shared>, closed_tx: mpsc::UnboundedSender<u64>) -> Result<()> {
    let url = shared.config.url.as_str();
    debug!(url, session_id = %shared.session_id, "opening signaling socket");

    let (mut ws, _) = connect_async(url)
        .await
        .map_err(|e| Error::Connect(format!("{}: {}", url, e)))?;

    // close() во время рукопожатия: сокет не должен ожить
    if shared.is_closed() {
        let _ = ws.close(None).await;
        return Err(Error::InvalidState("client closed while connecting".into()));
    }
    let (mut write, mut read) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    tx.send(shared.join_frame()?)
        .map_err(|_| Error::Transport("writer queue closed".into()))?;

    // проверка и установка под одним замком с close()
    let generation = {
        let mut outbound = shared.outbound();
        if shared.is_closed() {
            return Err(Error::InvalidState("client closed while connecting".into()));
        }
        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *outbound = Some(tx);
        shared.set_status(ClientStatus::Open);
        generation
    };
    info!(url, session_id = %shared.session_id, role = %shared.role, "signaling connected");

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write.send(frame).await {
                debug!("signaling writer stopped: {}", e);
                break;
            }
        }
        let _ = write.close().await;
    });

    let reader_shared = Arc::clone(shared);
    tokio::spawn(async move {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => reader_shared.dispatch(&text),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("signaling read error: {}", e);
                    break;
                }
            }
        }
        let _ = closed_tx.send(generation);
    });

    Ok(())
}

/// Следит за закрытием сокетов и переподключается
async fn supervise(
    shared: Arc<Shared>,
    closed_tx: mpsc::UnboundedSender<u64>,
    mut closed_rx: mpsc::UnboundedReceiver<u64>,
) {
    loop {
        let shutdown = shared.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        if shared.is_closed() {
            return;
        }

        let generation = tokio::select! {
            generation = closed_rx.recv() => match generation {
                Some(generation) => generation,
                None => return,
            },
            _ = &mut shutdown => return,
        };

        // закрылся уже заменённый сокет
        if generation != shared.generation.load(Ordering::SeqCst) {
            continue;
        }
        shared.outbound().take();

        if shared.is_closed() {
            shared.set_status(ClientStatus::Closed);
            return;
        }

        warn!(session_id = %shared.session_id, role = %shared.role, "signaling connection lost");
        if !reconnect(&shared, &closed_tx).await {
            return;
        }
    }
}

async fn reconnect(shared: &Arc<Shared>, closed_tx: &mpsc::UnboundedSender<u64>) -> bool {
    let base = shared.config.reconnect_base();
    let cap = shared.config.reconnect_cap();

    for attempt in 1..=shared.config.max_attempts {
        let delay = backoff_delay(base, cap, attempt);
        shared.set_status(ClientStatus::Reconnecting { attempt });
        info!(
            session_id = %shared.session_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling signaling reconnect"
        );

        let shutdown = shared.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        if shared.is_closed() {
            shared.set_status(ClientStatus::Closed);
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = &mut shutdown => {
                shared.set_status(ClientStatus::Closed);
                return false;
            }
        }

        match open_socket(shared, closed_tx.clone()).await {
            Ok(()) if shared.is_closed() => {
                // close() успел после установки; writer закроет сокет
                shared.outbound().take();
                shared.set_status(ClientStatus::Closed);
                return false;
            }
            Ok(()) => {
                info!(session_id = %shared.session_id, attempt, "signaling reconnected");
                return true;
            }
            Err(_) if shared.is_closed() => {
                shared.set_status(ClientStatus::Closed);
                return false;
            }
            Err(e) => warn!(
                session_id = %shared.session_id,
                attempt,
                error = %e,
                "reconnect attempt failed"
            ),
        }
    }

    shared.set_status(ClientStatus::Exhausted);
    error!(
        session_id = %shared.session_id,
        attempts = shared.config.max_attempts,
        "signaling reconnect attempts exhausted"
    );
    false
}
