#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use voice_mesh::config::{CallConfig, IceServer};
use voice_mesh::media::{CaptureHandle, CapturedStream, LocalStream, LocalTrack, MediaDevice};
use voice_mesh::signaling::{RelayChannel, RelayConnector};
use voice_mesh::transport::{
    IceCandidate, PeerTransport, SessionDescription, TransportEvents, TransportFactory,
};
use voice_mesh::{
    Backends, CallEvent, CallSessionController, MediaError, ParticipantId, TransportError,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ---- relay ----

pub struct FakeRelay {
    local_id: String,
    opened: AtomicUsize,
    sent: Arc<Mutex<Vec<Value>>>,
    inbound: Mutex<Option<mpsc::Sender<String>>>,
}

impl FakeRelay {
    pub fn new(local_id: &str) -> Arc<Self> {
        Arc::new(Self {
            local_id: local_id.to_owned(),
            opened: AtomicUsize::new(0),
            sent: Arc::new(Mutex::new(Vec::new())),
            inbound: Mutex::new(None),
        })
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Delivers one server frame to the client.
    pub fn push(&self, frame: Value) {
        let inbound = self.inbound.lock().unwrap();
        inbound
            .as_ref()
            .expect("relay not connected")
            .try_send(frame.to_string())
            .unwrap();
    }

    pub fn roster(&self, ids: &[&str]) {
        self.push(serde_json::json!({"event": "all-users", "data": ids}));
    }

    pub fn joined(&self, id: &str) {
        self.push(serde_json::json!({"event": "user-joined", "data": id}));
    }

    pub fn left(&self, id: &str) {
        self.push(serde_json::json!({"event": "user-left", "data": id}));
    }

    pub fn count(&self, n: u32) {
        self.push(serde_json::json!({"event": "user-count", "data": n}));
    }

    pub fn offer(&self, from: &str, sdp: &str) {
        self.signal(from, serde_json::json!({"sdp": {"type": "offer", "sdp": sdp}}));
    }

    pub fn answer(&self, from: &str, sdp: &str) {
        self.signal(from, serde_json::json!({"sdp": {"type": "answer", "sdp": sdp}}));
    }

    pub fn candidate(&self, from: &str, candidate: &str) {
        self.signal(
            from,
            serde_json::json!({"candidate": {"candidate": candidate, "sdpMid": "0", "sdpMLineIndex": 0}}),
        );
    }

    pub fn signal(&self, from: &str, data: Value) {
        self.push(serde_json::json!({"event": "signal", "data": {"from": from, "data": data}}));
    }

    /// Drops the server side; the client sees the connection end.
    pub fn disconnect(&self) {
        self.inbound.lock().unwrap().take();
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_events(&self, event: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|frame| frame["event"] == event)
            .map(|frame| frame["data"].clone())
            .collect()
    }

    /// `(to, kind)` of every signal sent, kind being offer/answer/candidate.
    pub fn signals(&self) -> Vec<(String, String)> {
        self.sent_events("signal")
            .into_iter()
            .map(|data| {
                let to = data["to"].as_str().unwrap_or_default().to_owned();
                let kind = if let Some(kind) = data["data"]["sdp"]["type"].as_str() {
                    kind.to_owned()
                } else if data["data"].get("candidate").is_some() {
                    "candidate".to_owned()
                } else {
                    "unknown".to_owned()
                };
                (to, kind)
            })
            .collect()
    }

    pub fn signals_to(&self, to: &str, kind: &str) -> usize {
        self.signals()
            .iter()
            .filter(|(t, k)| t == to && k == kind)
            .count()
    }
}

pub struct FakeRelayConnector(pub Arc<FakeRelay>);

#[async_trait]
impl RelayConnector for FakeRelayConnector {
    async fn open(&self, _url: &str) -> anyhow::Result<RelayChannel> {
        let relay = &self.0;
        relay.opened.fetch_add(1, Ordering::SeqCst);

        let (in_tx, in_rx) = mpsc::channel(256);
        in_tx
            .send(serde_json::json!({"event": "welcome", "data": relay.local_id}).to_string())
            .await?;
        *relay.inbound.lock().unwrap() = Some(in_tx);

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        let sent = relay.sent.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Ok(frame) = serde_json::from_str::<Value>(&text) {
                    sent.lock().unwrap().push(frame);
                }
            }
        });

        Ok(RelayChannel {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

// ---- transports ----

pub struct FakePeer {
    pub participant: ParticipantId,
    pub events: TransportEvents,
    pub closed: AtomicBool,
    pub tracks: AtomicUsize,
    pub offers: AtomicUsize,
    pub remote_descriptions: Mutex<Vec<String>>,
    pub candidates: Mutex<Vec<String>>,
    offer_delay: Option<Duration>,
}

impl FakePeer {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn remote_descriptions(&self) -> Vec<String> {
        self.remote_descriptions.lock().unwrap().clone()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.candidates.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerTransport for FakePeer {
    async fn add_track(&self, _track: &LocalTrack) -> Result<(), TransportError> {
        self.tracks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        if let Some(delay) = self.offer_delay {
            tokio::time::sleep(delay).await;
        }
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        let json = serde_json::json!({"type": "offer", "sdp": format!("offer-{}-{}", self.participant, n)});
        Ok(SessionDescription::from_json(&json.to_string()).unwrap())
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let json = serde_json::json!({"type": "answer", "sdp": format!("answer-{}", self.participant)});
        Ok(SessionDescription::from_json(&json.to_string()).unwrap())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.remote_descriptions
            .lock()
            .unwrap()
            .push(desc.as_json().to_owned());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.candidates
            .lock()
            .unwrap()
            .push(candidate.as_json().to_owned());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeTransports {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    offer_delay: Mutex<Option<Duration>>,
    failing: AtomicBool,
}

impl FakeTransports {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delay_offers(&self, delay: Duration) {
        *self.offer_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_creation(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    pub fn all(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().unwrap().clone()
    }

    pub fn created_for(&self, id: &str) -> Vec<Arc<FakePeer>> {
        self.all()
            .into_iter()
            .filter(|p| p.participant.as_str() == id)
            .collect()
    }

    /// The most recently created transport for `id`.
    pub fn latest(&self, id: &str) -> Arc<FakePeer> {
        self.created_for(id).pop().expect("no transport for participant")
    }

    pub fn live(&self) -> usize {
        self.all().iter().filter(|p| !p.is_closed()).count()
    }
}

pub struct FakeTransportFactory(pub Arc<FakeTransports>);

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        participant: &ParticipantId,
        _ice_servers: &[IceServer],
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        if self.0.failing.load(Ordering::SeqCst) {
            return Err(TransportError::msg("no transport for you"));
        }
        let peer = Arc::new(FakePeer {
            participant: participant.clone(),
            events,
            closed: AtomicBool::new(false),
            tracks: AtomicUsize::new(0),
            offers: AtomicUsize::new(0),
            remote_descriptions: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            offer_delay: *self.0.offer_delay.lock().unwrap(),
        });
        self.0.peers.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

// ---- microphone ----

#[derive(Default)]
pub struct FakeMicrophone {
    pub opened: AtomicUsize,
    pub stopped: Arc<AtomicUsize>,
    pub fail: Mutex<Option<MediaError>>,
}

impl FakeMicrophone {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(err: MediaError) -> Arc<Self> {
        let mic = Self::default();
        *mic.fail.lock().unwrap() = Some(err);
        Arc::new(mic)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

struct StopCounter(Arc<AtomicUsize>);

impl CaptureHandle for StopCounter {
    fn stop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaDevice for FakeMicrophone {
    async fn open_microphone(&self) -> Result<CapturedStream, MediaError> {
        if let Some(err) = self.fail.lock().unwrap().clone() {
            return Err(err);
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(CapturedStream {
            stream: LocalStream::new("mic", vec![LocalTrack::new("audio", Arc::new(()))]),
            handle: Box::new(StopCounter(self.stopped.clone())),
        })
    }
}

// ---- harness ----

pub fn test_config() -> CallConfig {
    CallConfig {
        relay_url: "ws://relay.test".to_owned(),
        ice_servers: vec![],
        ..CallConfig::default()
    }
}

pub struct Harness {
    pub controller: CallSessionController,
    pub events: mpsc::UnboundedReceiver<CallEvent>,
    pub relay: Arc<FakeRelay>,
    pub transports: Arc<FakeTransports>,
    pub mic: Arc<FakeMicrophone>,
}

impl Harness {
    pub fn new(local_id: &str) -> Self {
        Self::with_mic(local_id, FakeMicrophone::new())
    }

    pub fn with_mic(local_id: &str, mic: Arc<FakeMicrophone>) -> Self {
        init_logging();
        let relay = FakeRelay::new(local_id);
        let transports = FakeTransports::new();
        let backends = Backends {
            media: mic.clone(),
            relay: Arc::new(FakeRelayConnector(relay.clone())),
            transports: Arc::new(FakeTransportFactory(transports.clone())),
        };
        let (controller, events) = CallSessionController::new(test_config(), backends);
        Self {
            controller,
            events,
            relay,
            transports,
            mic,
        }
    }

    /// Joins `room` and processes the first roster snapshot.
    pub async fn joined(local_id: &str, room: &str, others: &[&str]) -> Self {
        let mut harness = Self::new(local_id);
        harness.controller.join(room).await.unwrap();
        harness.relay.roster(others);
        harness.settle().await;
        harness
    }

    /// Runs the loop until nothing has happened for 50ms.
    pub async fn settle(&mut self) {
        loop {
            match tokio::time::timeout(Duration::from_millis(50), self.controller.next_event()).await {
                Ok(Some(event)) => self.controller.handle(event).await,
                Ok(None) | Err(_) => break,
            }
        }
    }

    pub async fn advance(&mut self, by: Duration) {
        tokio::time::advance(by).await;
        self.settle().await;
    }

    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn connected_ids(&self) -> Vec<String> {
        self.controller
            .mesh()
            .map(|mesh| {
                mesh.participants()
                    .iter()
                    .map(|id| id.as_str().to_owned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub fn pid(id: &str) -> ParticipantId {
    ParticipantId::from(id)
}
