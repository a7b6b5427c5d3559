//! Машина состояний согласования одного участника
//!
//! `idle → awaiting-peer → offering|answering → connected`, из любого
//! состояния `disconnect()` ведёт в `disconnected`. Любое входящее сообщение
//! получает `Disposition`: оно либо продвигает состояние, либо явно
//! классифицируется как игнорируемое.

use crate::error::{Error, Result};
use crate::peer::ice::analyze_candidates;
use crate::peer::media::{CaptureHints, LocalMedia, MediaCapture, MediaTrack, RemoteMedia};
use crate::peer::state::{ConnectivityState, NegotiationState, PeerState, PeerStatus};
use crate::peer::transport::{PeerTransport, TransportEvent, TransportEvents, TransportFactory};
use crate::peer::types::{IceCandidate, SdpKind, SdpPayload};
use crate::signaling::protocol::{MessageKind, Role, SignalingMessage};
use crate::signaling::Signaling;
use crate::utils::random_id;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// События для владельца негоциатора
#[derive(Debug, Clone)]
pub enum PeerEvent {
    State(NegotiationState),
    Connectivity(ConnectivityState),
    RemoteMedia(RemoteMedia),
    LocalMedia(Vec<MediaTrack>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Повтор offer/answer/ready во время согласования или после него
    Duplicate,
    /// Относится к прошлому обмену или прошлому транспорту
    Stale,
    /// Сообщение не предназначено этой роли
    WrongRole,
    /// Не ожидается в текущем состоянии
    Unexpected,
    /// Негоциатор уже отключён
    Terminated,
    Malformed,
    /// Кандидат отвергнут транспортом после установления соединения
    Rejected,
}

/// Итог обработки одного входящего сообщения или события транспорта
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    Buffered,
    /// Результат пришёл после `disconnect()` или смены поколения
    Discarded,
    /// Ошибка применения перевела согласование в `failed`
    Failed,
    Ignored(IgnoreReason),
}

pub struct Negotiator {
    role: Role,
    session_id: String,
    signaling: Arc<dyn Signaling>,
    factory: Arc<dyn TransportFactory>,
    capture: Option<Arc<dyn MediaCapture>>,
    hints: CaptureHints,
    inner: Mutex<PeerState>,
    events: mpsc::UnboundedSender<PeerEvent>,
    transport_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    transport_rx: Mutex<Option<mpsc::UnboundedReceiver<(u64, TransportEvent)>>>,
    shutdown: Notify,
}

impl Negotiator {
    pub fn new(
        role: Role,
        session_id: &str,
        signaling: Arc<dyn Signaling>,
        factory: Arc<dyn TransportFactory>,
        capture: Option<Arc<dyn MediaCapture>>,
        hints: CaptureHints,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        let negotiator = Arc::new(Self {
            role,
            session_id: session_id.to_string(),
            signaling,
            factory,
            capture,
            hints,
            inner: Mutex::new(PeerState::new()),
            events,
            transport_tx,
            transport_rx: Mutex::new(Some(transport_rx)),
            shutdown: Notify::new(),
        });
        (negotiator, events_rx)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> NegotiationState {
        self.lock().state
    }

    pub fn status(&self) -> PeerStatus {
        self.lock().status()
    }

    /// Поколение текущего транспорта; растёт с каждым `start()`
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// ID текущего обмена (выбирается стороной offer)
    pub fn connection_id(&self) -> Option<String> {
        self.lock().connection_id.clone()
    }

    pub fn local_description(&self) -> Option<SdpPayload> {
        self.lock().local_description.clone()
    }

    pub fn remote_media(&self) -> Option<RemoteMedia> {
        self.lock().remote_media.clone()
    }

    pub fn pending_candidates(&self) -> usize {
        self.lock().pending.len()
    }

    fn lock(&self) -> MutexGuard<'_, PeerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: PeerEvent) {
        // владелец мог перестать слушать, это не ошибка
        let _ = self.events.send(event);
    }

    fn set_state(&self, st: &mut PeerState, next: NegotiationState) {
        if st.state != next {
            debug!(
                session_id = %self.session_id,
                role = %self.role,
                from = %st.state,
                to = %next,
                "negotiation state"
            );
            st.state = next;
            self.emit(PeerEvent::State(next));
        }
    }

    fn send<T: Serialize>(&self, kind: MessageKind, payload: &T) -> bool {
        match SignalingMessage::with_payload(kind, &self.session_id, self.role, payload) {
            Ok(message) => self.signaling.send(message),
            Err(e) => {
                error!(kind = %kind, error = %e, "failed to encode negotiation payload");
                false
            }
        }
    }

    /// Запуск (или перезапуск после `failed`) обмена описаниями.
    ///
    /// Отправитель открывает захват; при ошибке состояние не меняется и
    /// возвращается `Error::Capture`. Затем создаётся транспорт нового
    /// поколения, добавляются исходящие треки и подключается signaling.
    pub async fn start(&self) -> Result<()> {
        let previous = self.lock().state;
        if !matches!(previous, NegotiationState::Idle | NegotiationState::Failed) {
            return Err(Error::InvalidState(format!(
                "cannot start negotiation from {}",
                previous
            )));
        }

        let media = match self.role {
            Role::Sender => Some(self.open_capture().await?),
            Role::Receiver => None,
        };
        let tracks = media.as_ref().map(|m| m.tracks()).unwrap_or_default();

        let generation = {
            let mut st = self.lock();
            st.generation += 1;
            st.generation
        };

        let transport = match self
            .factory
            .create(TransportEvents::new(generation, self.transport_tx.clone()))
            .await
        {
            Ok(transport) => transport,
            Err(e) => {
                release(media, None).await;
                return Err(e);
            }
        };

        for track in &tracks {
            if let Err(e) = transport.add_track(track).await {
                release(media, Some(transport)).await;
                return Err(e);
            }
        }

        let installed = {
            let mut st = self.lock();
            if st.state != previous || st.generation != generation {
                Err(media)
            } else {
                let old_transport = st.transport.replace(Arc::clone(&transport));
                let old_media = std::mem::replace(&mut st.local_media, media);
                st.reset_exchange();
                self.set_state(&mut st, NegotiationState::AwaitingPeer);
                Ok((old_media, old_transport))
            }
        };

        match installed {
            Ok((old_media, old_transport)) => release(old_media, old_transport).await,
            Err(media) => {
                // disconnect() или другой start() успели раньше
                debug!(
                    session_id = %self.session_id,
                    generation,
                    "start superseded, discarding transport"
                );
                release(media, Some(transport)).await;
                return Err(Error::InvalidState(
                    "negotiator state changed during start".into(),
                ));
            }
        }

        if !tracks.is_empty() {
            self.emit(PeerEvent::LocalMedia(tracks));
        }
        info!(session_id = %self.session_id, role = %self.role, generation, "negotiation started");

        if let Err(e) = self.signaling.connect().await {
            warn!(
                session_id = %self.session_id,
                error = %e,
                "signaling connect failed, reverting start"
            );
            let rollback = {
                let mut st = self.lock();
                if st.is_current(generation, NegotiationState::AwaitingPeer) {
                    let transport = st.transport.take();
                    let media = st.local_media.take();
                    self.set_state(&mut st, previous);
                    Some((media, transport))
                } else {
                    None
                }
            };
            if let Some((media, transport)) = rollback {
                release(media, transport).await;
            }
            return Err(e);
        }
        Ok(())
    }

    async fn open_capture(&self) -> Result<Box<dyn LocalMedia>> {
        let capture = self
            .capture
            .as_ref()
            .ok_or_else(|| Error::Capture("no capture device available".into()))?;

        capture.open(&self.hints).await.map_err(|e| match e {
            Error::Capture(_) => e,
            other => Error::Capture(other.to_string()),
        })
    }

    /// Разбор входящего сигнального сообщения
    pub async fn handle_signal(&self, message: SignalingMessage) -> Disposition {
        let kind = message.kind;
        let disposition = self.classify_signal(message).await;
        debug!(
            session_id = %self.session_id,
            role = %self.role,
            kind = %kind,
            ?disposition,
            "signal handled"
        );
        disposition
    }

    async fn classify_signal(&self, message: SignalingMessage) -> Disposition {
        if message.session_id != self.session_id {
            return Disposition::Ignored(IgnoreReason::Stale);
        }
        if self.lock().state == NegotiationState::Disconnected {
            return Disposition::Ignored(IgnoreReason::Terminated);
        }
        if message.role == self.role {
            return Disposition::Ignored(IgnoreReason::WrongRole);
        }

        match (message.kind, self.role) {
            (MessageKind::Join, _) => Disposition::Ignored(IgnoreReason::Unexpected),
            (MessageKind::Ready, Role::Sender) => self.on_ready().await,
            (MessageKind::Offer, Role::Receiver) => self.on_offer(&message).await,
            (MessageKind::Answer, Role::Sender) => self.on_answer(&message).await,
            (MessageKind::Candidate, _) => self.on_candidate(&message).await,
            _ => Disposition::Ignored(IgnoreReason::WrongRole),
        }
    }

    /// Готовность получателя: отправитель создаёт offer
    async fn on_ready(&self) -> Disposition {
        let (generation, transport) = {
            let mut st = self.lock();
            match st.state {
                NegotiationState::AwaitingPeer => {}
                NegotiationState::Offering | NegotiationState::Connected => {
                    return Disposition::Ignored(IgnoreReason::Duplicate)
                }
                _ => return Disposition::Ignored(IgnoreReason::Unexpected),
            }
            let Some(transport) = st.transport.clone() else {
                return Disposition::Ignored(IgnoreReason::Unexpected);
            };
            self.set_state(&mut st, NegotiationState::Offering);
            (st.generation, transport)
        };

        let offer = transport.create_offer().await;

        let stored = {
            let mut st = self.lock();
            if !st.is_current(generation, NegotiationState::Offering) {
                return Disposition::Discarded;
            }
            offer.map(|sdp| {
                let payload = SdpPayload::new(sdp, random_id());
                st.connection_id = Some(payload.id.clone());
                st.local_description = Some(payload.clone());
                payload
            })
        };
        let payload = match stored {
            Ok(payload) => payload,
            Err(e) => return self.fail(generation, e).await,
        };

        info!(session_id = %self.session_id, connection_id = %payload.id, "sending offer");
        self.send(MessageKind::Offer, &payload);
        Disposition::Applied
    }

    /// Offer от отправителя: получатель применяет его и отвечает
    async fn on_offer(&self, message: &SignalingMessage) -> Disposition {
        let payload = match message.payload::<SdpPayload>() {
            Ok(payload) if payload.sdp.kind == SdpKind::Offer => payload,
            Ok(_) => return Disposition::Ignored(IgnoreReason::Malformed),
            Err(e) => {
                warn!(error = %e, "malformed offer");
                return Disposition::Ignored(IgnoreReason::Malformed);
            }
        };

        let (generation, transport) = {
            let mut st = self.lock();
            match st.state {
                NegotiationState::AwaitingPeer => {}
                NegotiationState::Answering | NegotiationState::Connected => {
                    return Disposition::Ignored(IgnoreReason::Duplicate)
                }
                _ => return Disposition::Ignored(IgnoreReason::Unexpected),
            }
            let Some(transport) = st.transport.clone() else {
                return Disposition::Ignored(IgnoreReason::Unexpected);
            };
            st.connection_id = Some(payload.id.clone());
            self.set_state(&mut st, NegotiationState::Answering);
            (st.generation, transport)
        };

        if let Some(outcome) = self
            .apply_remote(generation, NegotiationState::Answering, &transport, payload.clone())
            .await
        {
            return outcome;
        }

        let answer = transport.create_answer().await;

        let stored = {
            let mut st = self.lock();
            if !st.is_current(generation, NegotiationState::Answering) {
                return Disposition::Discarded;
            }
            answer.map(|sdp| {
                let reply = SdpPayload::new(sdp, payload.id.clone());
                st.local_description = Some(reply.clone());
                reply
            })
        };
        let reply = match stored {
            Ok(reply) => reply,
            Err(e) => return self.fail(generation, e).await,
        };

        info!(session_id = %self.session_id, connection_id = %reply.id, "sending answer");
        self.send(MessageKind::Answer, &reply);

        self.check_connected(&mut self.lock());
        Disposition::Applied
    }

    /// Answer от получателя завершает обмен описаниями у отправителя
    async fn on_answer(&self, message: &SignalingMessage) -> Disposition {
        let payload = match message.payload::<SdpPayload>() {
            Ok(payload) if payload.sdp.kind == SdpKind::Answer => payload,
            Ok(_) => return Disposition::Ignored(IgnoreReason::Malformed),
            Err(e) => {
                warn!(error = %e, "malformed answer");
                return Disposition::Ignored(IgnoreReason::Malformed);
            }
        };

        let (generation, transport) = {
            let st = self.lock();
            match st.state {
                NegotiationState::Offering if st.remote_descriptions == 0 => {}
                NegotiationState::Offering | NegotiationState::Connected => {
                    return Disposition::Ignored(IgnoreReason::Duplicate)
                }
                _ => return Disposition::Ignored(IgnoreReason::Unexpected),
            }
            // answer на offer, который ещё не отправлен, или на прошлый offer
            if st.connection_id.as_deref() != Some(payload.id.as_str()) {
                return Disposition::Ignored(IgnoreReason::Stale);
            }
            let Some(transport) = st.transport.clone() else {
                return Disposition::Ignored(IgnoreReason::Unexpected);
            };
            (st.generation, transport)
        };

        if let Some(outcome) = self
            .apply_remote(generation, NegotiationState::Offering, &transport, payload)
            .await
        {
            return outcome;
        }

        self.check_connected(&mut self.lock());
        Disposition::Applied
    }

    /// Применяет remote description и затем буфер кандидатов в порядке прихода.
    /// `None` означает успех, иначе итог обработки сообщения.
    async fn apply_remote(
        &self,
        generation: u64,
        expected: NegotiationState,
        transport: &Arc<dyn PeerTransport>,
        payload: SdpPayload,
    ) -> Option<Disposition> {
        let connection_id = payload.id;
        let applied = transport.set_remote_description(payload.sdp).await;

        let drained = {
            let mut st = self.lock();
            if !st.is_current(generation, expected) {
                return Some(Disposition::Discarded);
            }
            applied.map(|()| {
                st.remote_descriptions += 1;
                st.pending.drain()
            })
        };
        let pending = match drained {
            Ok(pending) => pending,
            Err(e) => return Some(self.fail(generation, e).await),
        };

        if !pending.is_empty() {
            debug!(count = pending.len(), "applying buffered candidates");
        }
        for candidate in pending {
            if !candidate.connection_id.is_empty() && candidate.connection_id != connection_id {
                debug!(
                    candidate = %candidate.candidate,
                    "skipping candidate of a previous exchange"
                );
                continue;
            }
            let result = transport.add_ice_candidate(candidate).await;
            if !self.lock().is_current(generation, expected) {
                return Some(Disposition::Discarded);
            }
            if let Err(e) = result {
                return Some(self.fail(generation, e).await);
            }
        }
        None
    }

    /// Кандидат пира: буферизуется до remote description, затем применяется
    async fn on_candidate(&self, message: &SignalingMessage) -> Disposition {
        let candidate = match message.payload::<IceCandidate>() {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(error = %e, "malformed candidate");
                return Disposition::Ignored(IgnoreReason::Malformed);
            }
        };

        let (generation, state, transport) = {
            let mut st = self.lock();
            match st.state {
                NegotiationState::AwaitingPeer
                | NegotiationState::Offering
                | NegotiationState::Answering
                | NegotiationState::Connected => {}
                NegotiationState::Failed => return Disposition::Ignored(IgnoreReason::Stale),
                _ => return Disposition::Ignored(IgnoreReason::Unexpected),
            }

            if let Some(id) = st.connection_id.as_deref() {
                if !candidate.connection_id.is_empty() && candidate.connection_id != id {
                    return Disposition::Ignored(IgnoreReason::Stale);
                }
            }

            if st.remote_descriptions == 0 {
                st.pending.push(candidate);
                return Disposition::Buffered;
            }
            let Some(transport) = st.transport.clone() else {
                return Disposition::Ignored(IgnoreReason::Unexpected);
            };
            (st.generation, st.state, transport)
        };

        let result = transport.add_ice_candidate(candidate).await;

        let current = {
            let st = self.lock();
            st.generation == generation && st.state != NegotiationState::Disconnected
        };
        if !current {
            return Disposition::Discarded;
        }

        match result {
            Ok(()) => Disposition::Applied,
            Err(e) if state == NegotiationState::Connected => {
                warn!(session_id = %self.session_id, error = %e, "remote candidate rejected");
                Disposition::Ignored(IgnoreReason::Rejected)
            }
            Err(e) => self.fail(generation, e).await,
        }
    }

    /// Событие транспорта поколения `generation`
    pub async fn handle_transport_event(
        &self,
        generation: u64,
        event: TransportEvent,
    ) -> Disposition {
        match self.apply_transport_event(generation, event) {
            Ok(disposition) => disposition,
            Err(e) => self.fail(generation, e).await,
        }
    }

    /// `Err` означает, что событие переводит согласование в `failed`
    fn apply_transport_event(&self, generation: u64, event: TransportEvent) -> Result<Disposition> {
        let mut st = self.lock();
        if st.state == NegotiationState::Disconnected {
            return Ok(Disposition::Ignored(IgnoreReason::Terminated));
        }
        if generation != st.generation || st.transport.is_none() {
            debug!(generation, current = st.generation, "stale transport event");
            return Ok(Disposition::Ignored(IgnoreReason::Stale));
        }

        match event {
            TransportEvent::Candidate(mut candidate) => {
                if st.state == NegotiationState::Failed {
                    return Ok(Disposition::Ignored(IgnoreReason::Stale));
                }
                candidate.connection_id = st.connection_id.clone().unwrap_or_default();
                st.local_candidates.push(candidate.clone());
                drop(st);
                self.send(MessageKind::Candidate, &candidate);
                Ok(Disposition::Applied)
            }
            TransportEvent::StateChanged(connectivity) => {
                st.connectivity = connectivity;
                self.emit(PeerEvent::Connectivity(connectivity));

                match connectivity {
                    ConnectivityState::Connected => {
                        st.transport_connected = true;
                        self.check_connected(&mut st);
                        Ok(Disposition::Applied)
                    }
                    ConnectivityState::Failed if st.state != NegotiationState::Connected => Err(
                        Error::Negotiation("transport failed before connecting".into()),
                    ),
                    _ => Ok(Disposition::Applied),
                }
            }
            TransportEvent::Track(media) => {
                if self.role != Role::Receiver {
                    debug!(track = ?media.track, "sender ignores inbound track");
                    return Ok(Disposition::Ignored(IgnoreReason::WrongRole));
                }
                st.remote_media = Some(media.clone());
                drop(st);
                self.emit(PeerEvent::RemoteMedia(media));
                Ok(Disposition::Applied)
            }
        }
    }

    /// `connected` ⇔ применён ровно один remote description и транспорт connected
    fn check_connected(&self, st: &mut PeerState) -> bool {
        if st.state.is_negotiating() && st.remote_descriptions == 1 && st.transport_connected {
            self.set_state(st, NegotiationState::Connected);
            analyze_candidates(&st.local_candidates);
            info!(
                session_id = %self.session_id,
                role = %self.role,
                connection_id = st.connection_id.as_deref().unwrap_or_default(),
                "peer connected"
            );
            return true;
        }
        false
    }

    /// Ошибка до `connected` переводит в `failed`; повтора нет
    async fn fail(&self, generation: u64, error: Error) -> Disposition {
        let transport = {
            let mut st = self.lock();
            let live = matches!(
                st.state,
                NegotiationState::AwaitingPeer | NegotiationState::Offering | NegotiationState::Answering
            );
            if st.generation != generation || !live {
                return Disposition::Discarded;
            }
            error!(
                session_id = %self.session_id,
                role = %self.role,
                state = %st.state,
                error = %error,
                "negotiation failed"
            );
            st.pending.clear();
            st.transport_connected = false;
            self.set_state(&mut st, NegotiationState::Failed);
            st.transport.take()
        };

        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                debug!(error = %e, "closing failed transport");
            }
        }
        Disposition::Failed
    }

    /// Окончательное отключение; допустимо из любого состояния
    pub async fn disconnect(&self) {
        let (transport, media) = {
            let mut st = self.lock();
            if st.state == NegotiationState::Disconnected {
                return;
            }
            self.set_state(&mut st, NegotiationState::Disconnected);
            st.pending.clear();
            st.remote_media = None;
            st.transport_connected = false;
            (st.transport.take(), st.local_media.take())
        };

        release(media, transport).await;
        self.signaling.close().await;
        self.shutdown.notify_one();
        info!(session_id = %self.session_id, role = %self.role, "negotiator disconnected");
    }

    /// Цикл обработки: сигнальные сообщения и события транспорта по одному
    pub fn spawn(
        self: &Arc<Self>,
        mut signals: mpsc::UnboundedReceiver<SignalingMessage>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let transport_rx = this
            .transport_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        tokio::spawn(async move {
            let Some(mut transport_rx) = transport_rx else {
                warn!(session_id = %this.session_id, "negotiator driver already running");
                return;
            };

            loop {
                tokio::select! {
                    biased;
                    _ = this.shutdown.notified() => break,
                    message = signals.recv() => match message {
                        Some(message) => {
                            this.handle_signal(message).await;
                        }
                        None => break,
                    },
                    event = transport_rx.recv() => match event {
                        Some((generation, event)) => {
                            this.handle_transport_event(generation, event).await;
                        }
                        None => break,
                    },
                }
            }
            debug!(session_id = %this.session_id, role = %this.role, "negotiator driver stopped");
        })
    }
}

/// Останавливает захват и закрывает транспорт
async fn release(media: Option<Box<dyn LocalMedia>>, transport: Option<Arc<dyn PeerTransport>>) {
    if let Some(media) = media {
        media.stop();
    }
    if let Some(transport) = transport {
        if let Err(e) = transport.close().await {
            debug!(error = %e, "transport close failed");
        }
    }
}
