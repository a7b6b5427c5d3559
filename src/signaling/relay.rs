//! Signaling relay
//!
//! Держит по одному WebSocket соединению на участника, привязывает его к слоту
//! сессии по `join` и пересылает остальные сообщения противоположному слоту.
//! Доставка best-effort: если пира нет или его соединение закрыто, сообщение
//! молча отбрасывается.

use crate::config::RelayConfig;
use crate::error::Result;
use crate::session::SessionRegistry;
use crate::signaling::protocol::{MessageKind, Role, SignalingMessage};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

pub type ConnId = u64;

/// Handle соединения в реестре: id и очередь исходящих фреймов
#[derive(Debug, Clone)]
pub struct ConnHandle {
    id: ConnId,
    tx: mpsc::UnboundedSender<Message>,
}

impl ConnHandle {
    pub fn new(id: ConnId, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Writer соединения ещё жив
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    fn deliver(&self, frame: Message) -> bool {
        self.tx.send(frame).is_ok()
    }
}

impl PartialEq for ConnHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnHandle {}

/// Фаза соединения на стороне relay: connecting → joined → relaying → closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Joined { session_id: String, role: Role },
    Relaying { session_id: String, role: Role },
    Closed,
}

/// Состояние одного соединения, которым владеет его задача
#[derive(Debug)]
pub struct RelayConnection {
    handle: ConnHandle,
    phase: ConnectionPhase,
}

impl RelayConnection {
    pub fn id(&self) -> ConnId {
        self.handle.id
    }

    pub fn handle(&self) -> &ConnHandle {
        &self.handle
    }

    pub fn phase(&self) -> &ConnectionPhase {
        &self.phase
    }

    fn binding(&self) -> Option<(&str, Role)> {
        match &self.phase {
            ConnectionPhase::Joined { session_id, role }
            | ConnectionPhase::Relaying { session_id, role } => Some((session_id.as_str(), *role)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Соединение ещё не прислало join
    NotJoined,
    /// sessionId сообщения не совпадает с привязкой соединения
    SessionMismatch,
    /// Противоположный слот пуст
    PeerAbsent,
    /// Соединение пира закрыто
    PeerClosed,
    /// Слот занят другим соединением после повторного join
    Displaced,
    /// Соединение уже закрыто
    Closed,
}

/// Решение relay по одному входящему фрейму
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Joined { paired: bool },
    Forwarded,
    Dropped(DropReason),
    Malformed,
}

/// Ядро relay: реестр сессий под одним мьютексом
#[derive(Debug, Default)]
pub struct Relay {
    registry: Mutex<SessionRegistry<ConnHandle>>,
    next_id: AtomicU64,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, SessionRegistry<ConnHandle>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Регистрирует новое соединение в фазе connecting
    pub fn open_connection(&self, tx: mpsc::UnboundedSender<Message>) -> RelayConnection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        RelayConnection {
            handle: ConnHandle::new(id, tx),
            phase: ConnectionPhase::Connecting,
        }
    }

    /// Обработка одного текстового фрейма соединения
    pub fn handle_frame(&self, conn: &mut RelayConnection, text: &str) -> RelayOutcome {
        if conn.phase == ConnectionPhase::Closed {
            return RelayOutcome::Dropped(DropReason::Closed);
        }

        let message = match SignalingMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(conn_id = conn.id(), error = %e, "discarding malformed signaling frame");
                return RelayOutcome::Malformed;
            }
        };

        debug!(
            conn_id = conn.id(),
            kind = %message.kind,
            session_id = %message.session_id,
            role = %message.role,
            "relay frame"
        );

        match message.kind {
            MessageKind::Join => self.join(conn, &message),
            _ => self.forward(conn, &message, text),
        }
    }

    fn join(&self, conn: &mut RelayConnection, message: &SignalingMessage) -> RelayOutcome {
        let mut registry = self.registry();

        // join в другую сессию освобождает прежнюю
        if let Some((previous, _)) = conn.binding() {
            if previous != message.session_id {
                registry.unbind(&conn.handle);
            }
        }

        if let Some(replaced) = registry.bind(&message.session_id, message.role, conn.handle.clone())
        {
            if replaced != conn.handle {
                info!(
                    session_id = %message.session_id,
                    role = %message.role,
                    replaced = replaced.id(),
                    conn_id = conn.id(),
                    "slot rebound to newer connection"
                );
            }
        }

        conn.phase = ConnectionPhase::Joined {
            session_id: message.session_id.clone(),
            role: message.role,
        };

        let paired = registry
            .get(&message.session_id)
            .map(|s| s.is_paired())
            .unwrap_or(false);

        info!(
            session_id = %message.session_id,
            role = %message.role,
            conn_id = conn.id(),
            paired,
            "participant joined"
        );

        if paired {
            if let Some(sender) = registry.slot(&message.session_id, Role::Sender) {
                match SignalingMessage::ready(&message.session_id).to_json() {
                    Ok(ready) if sender.is_open() => {
                        sender.deliver(Message::Text(ready));
                    }
                    Ok(_) => {
                        debug!(
                            session_id = %message.session_id,
                            "sender closed, ready not sent"
                        );
                    }
                    Err(e) => error!(error = %e, "failed to encode ready"),
                }
            }
        }

        RelayOutcome::Joined { paired }
    }

    fn forward(
        &self,
        conn: &mut RelayConnection,
        message: &SignalingMessage,
        text: &str,
    ) -> RelayOutcome {
        let Some((session_id, role)) = conn.binding().map(|(s, r)| (s.to_string(), r)) else {
            debug!(
                conn_id = conn.id(),
                kind = %message.kind,
                "dropping message from unjoined connection"
            );
            return RelayOutcome::Dropped(DropReason::NotJoined);
        };

        if message.session_id != session_id {
            debug!(
                conn_id = conn.id(),
                joined = %session_id,
                claimed = %message.session_id,
                "dropping message for foreign session"
            );
            return RelayOutcome::Dropped(DropReason::SessionMismatch);
        }

        let registry = self.registry();
        if registry.slot(&session_id, role) != Some(&conn.handle) {
            debug!(
                conn_id = conn.id(),
                session_id = %session_id,
                role = %role,
                "connection displaced from its slot, dropping"
            );
            return RelayOutcome::Dropped(DropReason::Displaced);
        }

        let Some(peer) = registry.peer_of(&session_id, role) else {
            debug!(session_id = %session_id, kind = %message.kind, "no peer bound, dropping");
            return RelayOutcome::Dropped(DropReason::PeerAbsent);
        };

        if !peer.is_open() || !peer.deliver(Message::Text(text.to_string())) {
            debug!(
                session_id = %session_id,
                kind = %message.kind,
                "peer connection closed, dropping"
            );
            return RelayOutcome::Dropped(DropReason::PeerClosed);
        }

        conn.phase = ConnectionPhase::Relaying { session_id, role };
        RelayOutcome::Forwarded
    }

    /// Закрытие соединения: освобождение слотов и удаление пустых сессий
    pub fn close_connection(&self, conn: &mut RelayConnection) -> Vec<String> {
        if conn.phase == ConnectionPhase::Closed {
            return Vec::new();
        }
        conn.phase = ConnectionPhase::Closed;

        let pruned = self.registry().unbind(&conn.handle);
        for session_id in &pruned {
            info!(session_id = %session_id, "session pruned");
        }
        pruned
    }

    /// Принудительно закрывает соединение участника. Клиент увидит закрытие и
    /// переподключится.
    pub fn evict(&self, session_id: &str, role: Role) -> bool {
        let registry = self.registry();
        match registry.slot(session_id, role) {
            Some(handle) => {
                info!(session_id, role = %role, conn_id = handle.id(), "evicting participant");
                handle.deliver(Message::Close(None))
            }
            None => false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.registry().len()
    }

    /// Id соединения в слоте роли
    pub fn slot(&self, session_id: &str, role: Role) -> Option<ConnId> {
        self.registry().slot(session_id, role).map(|h| h.id())
    }
}

/// WebSocket сервер relay
pub struct RelayServer {
    listener: TcpListener,
    relay: Arc<Relay>,
}

impl RelayServer {
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        Ok(Self {
            listener,
            relay: Arc::new(Relay::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    /// Запускает accept loop в фоне
    pub fn spawn(self) -> Result<RelayHandle> {
        let addr = self.local_addr()?;
        let relay = Arc::clone(&self.relay);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let shutdown = shutdown_tx.clone();

        info!("Signaling relay listening on ws://{}", addr);

        let task = tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            loop {
                tokio::select! {
                    result = self.listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                debug!("Accepted connection from {}", peer_addr);
                                let relay = Arc::clone(&self.relay);
                                let shutdown_rx = shutdown.subscribe();
                                tokio::spawn(async move {
                                    let served =
                                        handle_connection(stream, relay, shutdown_rx).await;
                                    if let Err(e) = served {
                                        warn!(
                                            "Relay connection error from {}: {}",
                                            peer_addr, e
                                        );
                                    }
                                });
                            }
                            Err(e) => error!("Failed to accept connection: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Signaling relay received shutdown signal");
                        break;
                    }
                }
            }
        });

        Ok(RelayHandle {
            addr,
            relay,
            shutdown_tx,
            task,
        })
    }
}

/// Управление запущенным relay
pub struct RelayHandle {
    addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    /// Останавливает accept loop и закрывает все соединения
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            warn!("Relay accept loop ended abnormally: {}", e);
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    relay: Arc<Relay>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    // единственный writer на соединение сохраняет порядок доставки
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let mut conn = relay.open_connection(tx);
    let conn_id = conn.id();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let closing = matches!(frame, Message::Close(_));
            if let Err(e) = write.send(frame).await {
                debug!(conn_id, "relay writer stopped: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    relay.handle_frame(&mut conn, &text);
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!(conn_id, "discarding binary frame");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn_id, "relay read error: {}", e);
                    break;
                }
            },
            _ = shutdown.recv() => {
                conn.handle().deliver(Message::Close(None));
                break;
            }
        }
    }

    relay.close_connection(&mut conn);
    drop(conn);
    let _ = writer.await;
    debug!(conn_id, "relay connection closed");
    Ok(())
}
