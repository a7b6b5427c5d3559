//! Общие заглушки для интеграционных тестов: транспорт, захват, signaling
#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use ssc_pair::error::{Error, Result};
use ssc_pair::peer::{
    CaptureHints, ConnectivityState, IceCandidate, LocalMedia, MediaCapture, MediaTrack,
    NegotiationState, PeerEvent, PeerTransport, SdpKind, SessionDescription, TrackKind,
    TransportEvent, TransportEvents, TransportFactory,
};
use ssc_pair::signaling::{MessageKind, Signaling, SignalingMessage};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn host_candidate(n: u32) -> String {
    format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000 typ host")
}

#[derive(Default)]
pub struct FakeOptions {
    /// set_remote_description возвращает ошибку
    pub fail_remote: AtomicBool,
    /// после remote description транспорт сообщает connecting → connected
    pub auto_connect: AtomicBool,
    /// после local description транспорт выдаёт один host кандидат
    pub emit_candidates: AtomicBool,
    /// create_offer ждёт этого уведомления
    pub offer_gate: Mutex<Option<Arc<Notify>>>,
}

pub struct FakeTransport {
    events: TransportEvents,
    fail_remote: bool,
    auto_connect: bool,
    emit_candidates: bool,
    offer_gate: Option<Arc<Notify>>,
    pub offers: AtomicUsize,
    pub answers: AtomicUsize,
    pub remote: Mutex<Vec<SdpKind>>,
    pub candidates: Mutex<Vec<String>>,
    pub tracks: Mutex<Vec<MediaTrack>>,
    pub closed: AtomicBool,
}

impl FakeTransport {
    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    pub fn emit(&self, event: TransportEvent) {
        self.events.emit(event);
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn local_candidate(&self) {
        if self.emit_candidates {
            self.emit(TransportEvent::Candidate(IceCandidate {
                candidate: host_candidate(self.generation() as u32),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                connection_id: String::new(),
            }));
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        if let Some(gate) = &self.offer_gate {
            gate.notified().await;
        }
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        self.local_candidate();
        Ok(SessionDescription::offer(format!("v=0 offer {n}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let n = self.answers.fetch_add(1, Ordering::SeqCst) + 1;
        self.local_candidate();
        Ok(SessionDescription::answer(format!("v=0 answer {n}")))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if self.fail_remote {
            return Err(Error::Negotiation("remote description rejected".into()));
        }
        self.remote.lock().unwrap().push(description.kind);
        if self.auto_connect {
            self.emit(TransportEvent::StateChanged(ConnectivityState::Connecting));
            self.emit(TransportEvent::StateChanged(ConnectivityState::Connected));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.candidates.lock().unwrap().push(candidate.candidate);
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<()> {
        self.tracks.lock().unwrap().push(track.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFactory {
    pub options: FakeOptions,
    created: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn auto_connecting() -> Arc<Self> {
        let factory = Self::default();
        factory.options.auto_connect.store(true, Ordering::SeqCst);
        factory.options.emit_candidates.store(true, Ordering::SeqCst);
        Arc::new(factory)
    }

    pub fn set_fail_remote(&self, fail: bool) {
        self.options.fail_remote.store(fail, Ordering::SeqCst);
    }

    pub fn gate_offers(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.options.offer_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<FakeTransport> {
        Arc::clone(self.created.lock().unwrap().last().expect("no transport created"))
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn PeerTransport>> {
        let transport = Arc::new(FakeTransport {
            events,
            fail_remote: self.options.fail_remote.load(Ordering::SeqCst),
            auto_connect: self.options.auto_connect.load(Ordering::SeqCst),
            emit_candidates: self.options.emit_candidates.load(Ordering::SeqCst),
            offer_gate: self.options.offer_gate.lock().unwrap().clone(),
            offers: AtomicUsize::new(0),
            answers: AtomicUsize::new(0),
            remote: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.created.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }
}

pub struct FakeMedia {
    stopped: Arc<AtomicBool>,
}

impl LocalMedia for FakeMedia {
    fn tracks(&self) -> Vec<MediaTrack> {
        vec![
            MediaTrack {
                id: "audio".into(),
                stream_id: "camera".into(),
                kind: TrackKind::Audio,
            },
            MediaTrack {
                id: "video".into(),
                stream_id: "camera".into(),
                kind: TrackKind::Video,
            },
        ]
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeCapture {
    pub deny: AtomicBool,
    pub opened: AtomicUsize,
    pub stopped: Arc<AtomicBool>,
}

impl FakeCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn denied() -> Arc<Self> {
        let capture = Self::default();
        capture.deny.store(true, Ordering::SeqCst);
        Arc::new(capture)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn open(&self, _hints: &CaptureHints) -> Result<Box<dyn LocalMedia>> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(Error::Capture("permission denied".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
        Ok(Box::new(FakeMedia {
            stopped: Arc::clone(&self.stopped),
        }))
    }
}

/// Signaling без сети: запоминает отправленное
#[derive(Default)]
pub struct RecordingSignaling {
    pub sent: Mutex<Vec<SignalingMessage>>,
    pub connects: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub closed: AtomicBool,
}

impl RecordingSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent_of(&self, kind: MessageKind) -> Vec<SignalingMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Signaling for RecordingSignaling {
    async fn connect(&self) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Connect("relay unreachable".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, message: SignalingMessage) -> bool {
        self.sent.lock().unwrap().push(message);
        true
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Ждёт событие состояния `state`, пропуская остальные
pub async fn wait_for_state(
    events: &mut mpsc::UnboundedReceiver<PeerEvent>,
    state: NegotiationState,
) {
    let found = tokio::time::timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if let PeerEvent::State(s) = event {
                if s == state {
                    return true;
                }
            }
        }
        false
    })
    .await;
    assert!(matches!(found, Ok(true)), "state {state} never reached");
}

/// Опрос условия до истечения `WAIT`
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Ограничивает тестовое ожидание по времени
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("operation timed out")
}

/// WS-сервер, отвечающий на рукопожатие с задержкой `delay`; считает `join`
pub async fn slow_handshake_server(delay: Duration) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let joins = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&joins);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(frame)) = ws.next().await {
                    let Message::Text(text) = frame else { continue };
                    if let Ok(message) = SignalingMessage::from_json(&text) {
                        if message.kind == MessageKind::Join {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            });
        }
    });
    (url, joins)
}
