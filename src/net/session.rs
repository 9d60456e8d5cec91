//! Peer session negotiation and lifecycle
//!
//! A [`Session`] drives one side of the connection handshake to an open,
//! bidirectional data channel, then owns that channel until teardown.
//!
//! The offering side calls [`Session::offer`]: it creates the peer
//! connection and the data channel, publishes `{offer}` under a fresh room
//! code, streams its connectivity candidates into the room as they are
//! discovered, and applies the first answer that appears. The joining side
//! calls [`Session::join`] with the code, applies the offer, publishes its
//! answer exactly once, and mirrors the candidate exchange in the other
//! direction.
//!
//! One `Session` exists per negotiation and is never reused: a new drop
//! means a new `offer`/`join` call and a new object. Everything the remote
//! side does reaches the caller through a single [`SessionEvent`] stream
//! (channel open, reassembled files, peer-initiated teardown), consumed by
//! one task, so session state is never mutated concurrently from caller
//! code.
//!
//! Neither `offer` nor `join` enforces a negotiation timeout. A caller that
//! gives up must call [`Session::destroy`]; just dropping the session leaks
//! the directory watches until the room is deleted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::net::room::RoomCode;
use crate::net::signaling::{
    DirectoryEvent, DirectoryWatch, SignalingDirectory, SignalingError,
};
use crate::net::transfer::{self, ReceivedFile, TransferEngine, TransferError};

/// Label of the single logical data channel per session.
pub const DATA_CHANNEL_LABEL: &str = "ghost-drop";

/// STUN servers used when the caller does not supply any.
const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// How many fresh codes to try before giving up on room creation.
const CODE_ALLOCATION_ATTEMPTS: u32 = 8;

/// Errors that can occur while establishing or running a session
#[derive(Error, Debug)]
pub enum SessionError {
    /// The identifier does not resolve to any room
    #[error("room {0} does not exist")]
    RoomNotFound(RoomCode),

    /// The signaling directory is unreachable or rejected a request
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// The connectivity layer failed
    #[error("connectivity failure: {0}")]
    Connectivity(#[from] webrtc::Error),

    /// Every generated room code was already taken
    #[error("no unused room code after {0} attempts")]
    CodeSpaceExhausted(u32),

    /// A room record did not have the expected shape
    #[error("malformed room record: {0}")]
    MalformedRecord(Arc<str>),
}

impl SessionError {
    fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedRecord(Arc::from(msg.into()))
    }
}

/// Events a session surfaces to its caller
///
/// Delivered on one single-consumer stream per session, in the order they
/// happened on the wire.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The data channel opened; fired once per successful negotiation
    ChannelOpen,
    /// An inbound file was fully reassembled
    FileReceived(ReceivedFile),
    /// The peer tore the session down; never fired for self-initiated
    /// teardown
    PeerDisconnected,
}

/// Stream of [`SessionEvent`]s for one session, consumed by the caller
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Lifecycle of one session, per side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake in flight; the data channel is not open yet
    Negotiating,
    /// The data channel is open in both directions
    Connected,
    /// Torn down locally or by the peer
    Closed,
}

/// Configuration for a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// ICE server URLs (STUN/TURN) handed to the connectivity layer
    pub ice_servers: Vec<String>,
    /// Data channel label; both sides see the same label
    pub channel_label: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            channel_label: DATA_CHANNEL_LABEL.to_owned(),
        }
    }
}

/// First answer wins; every later one is a duplicate.
///
/// Redundant answer writes are expected from a relay that replays state to
/// new subscribers, so acceptance has to be idempotent rather than an error.
#[derive(Debug, Default)]
struct AnswerGuard(AtomicBool);

impl AnswerGuard {
    fn try_accept(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}

/// Shared innards of a session, cloned into its handler tasks.
#[derive(Clone)]
struct Core {
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    engine: Arc<TransferEngine>,
    state: Arc<Mutex<SessionState>>,
    self_initiated: Arc<AtomicBool>,
    opened_tx: Arc<watch::Sender<bool>>,
    opened_rx: watch::Receiver<bool>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl Core {
    fn new() -> (Self, SessionEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (opened_tx, opened_rx) = watch::channel(false);

        let engine = {
            let events = events_tx.clone();
            TransferEngine::new(Arc::new(move |file| {
                let _ = events.send(SessionEvent::FileReceived(file));
            }))
        };

        let core = Self {
            channel: Arc::new(Mutex::new(None)),
            engine,
            state: Arc::new(Mutex::new(SessionState::Negotiating)),
            self_initiated: Arc::new(AtomicBool::new(false)),
            opened_tx: Arc::new(opened_tx),
            opened_rx,
            events_tx,
        };
        (core, events_rx)
    }

    /// Wires a freshly created or freshly accepted data channel into the
    /// session: open notification, inbound transfer dispatch, and teardown
    /// of reassembly state on close.
    fn install_channel(&self, channel: Arc<RTCDataChannel>) {
        *self.channel.lock() = Some(channel.clone());

        {
            let state = self.state.clone();
            let opened = self.opened_tx.clone();
            let events = self.events_tx.clone();
            let label = channel.label().to_owned();
            channel.on_open(Box::new(move || {
                let state = state.clone();
                let opened = opened.clone();
                let events = events.clone();
                let label = label.clone();
                Box::pin(async move {
                    info!(channel = %label, "data channel open");
                    *state.lock() = SessionState::Connected;
                    let _ = opened.send(true);
                    let _ = events.send(SessionEvent::ChannelOpen);
                })
            }));
        }

        {
            let engine = self.engine.clone();
            channel.on_message(Box::new(move |msg| {
                let engine = engine.clone();
                Box::pin(async move {
                    engine.handle_message(&msg);
                })
            }));
        }

        {
            let engine = self.engine.clone();
            channel.on_close(Box::new(move || {
                let engine = engine.clone();
                Box::pin(async move {
                    debug!("data channel closed");
                    engine.reset();
                })
            }));
        }
    }
}

/// Local handle to one active or pending negotiation
///
/// Constructed by [`Session::offer`] or [`Session::join`], owned by the
/// caller, and closed with [`Session::destroy`]. Events arrive on the
/// [`SessionEvents`] stream returned alongside the session.
pub struct Session {
    directory: Arc<dyn SignalingDirectory>,
    room: RoomCode,
    peer: Arc<RTCPeerConnection>,
    core: Core,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("room", &self.room)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a room and starts the offering side of the handshake.
    ///
    /// Returns as soon as the room record is published so the caller can
    /// display the code; the connection completes in the background and is
    /// announced by [`SessionEvent::ChannelOpen`] (or awaited with
    /// [`Session::wait_open`]).
    ///
    /// # Errors
    ///
    /// Fails if the directory is unreachable, if no unused room code could
    /// be allocated, or if the connectivity layer rejects the local offer.
    #[instrument(skip(directory, config))]
    pub async fn offer(
        directory: Arc<dyn SignalingDirectory>,
        config: SessionConfig,
    ) -> Result<(Self, SessionEvents), SessionError> {
        let room = allocate_room_code(directory.as_ref()).await?;
        info!(room = %room, "creating room");

        let (core, events) = Core::new();
        let peer = new_peer_connection(&config).await?;

        // The offerer owns channel creation; the joiner receives it.
        let channel = peer.create_data_channel(&config.channel_label, None).await?;
        core.install_channel(channel);

        publish_local_candidates(&peer, &directory, room.caller_candidates_path());

        let offer = peer.create_offer(None).await?;
        peer.set_local_description(offer.clone()).await?;

        let offer_value = serde_json::to_value(&offer)
            .map_err(|e| SessionError::malformed(e.to_string()))?;
        directory
            .put(&room.path(), serde_json::json!({ "offer": offer_value }))
            .await?;

        spawn_answer_watch(
            directory.watch(&room.answer_path()).await?,
            peer.clone(),
        );
        spawn_remote_candidate_watch(
            directory.watch(&room.callee_candidates_path()).await?,
            peer.clone(),
        );
        spawn_teardown_watch(
            directory.watch(&room.path()).await?,
            core.events_tx.clone(),
            core.self_initiated.clone(),
            core.state.clone(),
            core.opened_tx.clone(),
        );

        let session = Self {
            directory,
            room,
            peer,
            core,
            destroyed: AtomicBool::new(false),
        };
        Ok((session, events))
    }

    /// Joins an existing room and runs the answering side of the handshake.
    ///
    /// # Errors
    ///
    /// Fails with [`SessionError::RoomNotFound`] if the code does not resolve to a
    /// room, before any connection object is constructed.
    #[instrument(skip_all, fields(room = %code))]
    pub async fn join(
        directory: Arc<dyn SignalingDirectory>,
        code: RoomCode,
        config: SessionConfig,
    ) -> Result<(Self, SessionEvents), SessionError> {
        let record = directory
            .get(&code.path())
            .await?
            .ok_or_else(|| SessionError::RoomNotFound(code.clone()))?;
        let offer_value = record
            .get("offer")
            .cloned()
            .ok_or_else(|| SessionError::malformed("room record has no offer"))?;
        let offer: RTCSessionDescription = serde_json::from_value(offer_value)
            .map_err(|e| SessionError::malformed(e.to_string()))?;

        info!("joining room");

        let (core, events) = Core::new();
        let peer = new_peer_connection(&config).await?;

        // The remote side created the channel; adopt it when it arrives.
        {
            let core = core.clone();
            peer.on_data_channel(Box::new(move |channel| {
                let core = core.clone();
                Box::pin(async move {
                    debug!(label = %channel.label(), "remote data channel announced");
                    core.install_channel(channel);
                })
            }));
        }

        publish_local_candidates(&peer, &directory, code.callee_candidates_path());

        peer.set_remote_description(offer).await?;
        let answer = peer.create_answer(None).await?;
        peer.set_local_description(answer.clone()).await?;

        // Written exactly once; the offering side ignores any duplicate the
        // relay might replay.
        let answer_value = serde_json::to_value(&answer)
            .map_err(|e| SessionError::malformed(e.to_string()))?;
        directory.put(&code.answer_path(), answer_value).await?;

        spawn_remote_candidate_watch(
            directory.watch(&code.caller_candidates_path()).await?,
            peer.clone(),
        );
        spawn_teardown_watch(
            directory.watch(&code.path()).await?,
            core.events_tx.clone(),
            core.self_initiated.clone(),
            core.state.clone(),
            core.opened_tx.clone(),
        );

        let session = Self {
            directory,
            room: code,
            peer,
            core,
            destroyed: AtomicBool::new(false),
        };
        Ok((session, events))
    }

    /// The room code identifying this session.
    pub fn room_code(&self) -> &RoomCode {
        &self.room
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.core.state.lock()
    }

    /// Suspends until the data channel is open.
    ///
    /// No timeout is enforced; callers own their own give-up policy and
    /// must [`Session::destroy`] on abandonment. Returns immediately if the
    /// session was already torn down.
    pub async fn wait_open(&self) {
        let mut opened = self.core.opened_rx.clone();
        loop {
            if *opened.borrow() || self.state() == SessionState::Closed {
                return;
            }
            if opened.changed().await.is_err() {
                return;
            }
        }
    }

    /// Streams one file to the peer.
    ///
    /// Delegates to [`transfer::send_file`]: envelope first, then ordered
    /// chunks under backpressure. Callers sending several files must await
    /// each call before issuing the next.
    pub async fn send_file(
        &self,
        name: &str,
        mime: &str,
        data: &[u8],
    ) -> Result<(), TransferError> {
        let channel = self
            .core
            .channel
            .lock()
            .clone()
            .ok_or(TransferError::ChannelClosed)?;
        transfer::send_file(&channel, name, mime, data).await
    }

    /// Tears the session down and deletes the room.
    ///
    /// Idempotent and safe to fire from an exit handler: local handles are
    /// closed first, then the room record is deleted without depending on a
    /// response. The peer observes the deletion and reports
    /// [`SessionEvent::PeerDisconnected`]; this side, having initiated it,
    /// never does.
    #[instrument(skip(self), fields(room = %self.room))]
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Flag first: the teardown watch must see the intent before the
        // directory delete can echo back as a Removed event.
        self.core.self_initiated.store(true, Ordering::SeqCst);
        *self.core.state.lock() = SessionState::Closed;
        // Wake anyone blocked in wait_open; the state check sends them home.
        let _ = self.core.opened_tx.send(false);

        let channel = self.core.channel.lock().take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "data channel close reported an error");
            }
        }
        if let Err(e) = self.peer.close().await {
            debug!(error = %e, "peer connection close reported an error");
        }
        self.core.engine.reset();

        if let Err(e) = self.directory.delete(&self.room.path()).await {
            warn!(error = %e, "failed to delete room record");
        }
        info!("session destroyed");
    }
}

/// Draws room codes until one is unused in the directory.
///
/// The check-then-claim is not atomic (a directory-side compare-and-set
/// would close that window), but it turns the astronomically unlikely
/// collision into a regenerate instead of two peers sharing a room.
async fn allocate_room_code(
    directory: &dyn SignalingDirectory,
) -> Result<RoomCode, SessionError> {
    for _ in 0..CODE_ALLOCATION_ATTEMPTS {
        let code = RoomCode::generate();
        if directory.get(&code.path()).await?.is_none() {
            return Ok(code);
        }
        debug!(code = %code, "room code already in use; regenerating");
    }
    Err(SessionError::CodeSpaceExhausted(CODE_ALLOCATION_ATTEMPTS))
}

/// Builds a peer connection with the configured ICE servers.
async fn new_peer_connection(
    config: &SessionConfig,
) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
    let mut media = MediaEngine::default();
    let registry = register_default_interceptors(Registry::new(), &mut media)?;
    let api = APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build();

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: config.ice_servers.clone(),
            username: String::new(),
            credential: String::new(),
            ..Default::default()
        }],
        ..Default::default()
    };
    Ok(Arc::new(api.new_peer_connection(rtc_config).await?))
}

/// Streams every locally discovered candidate into the directory as it is
/// produced, trickled rather than batched. Publish failures are logged and
/// dropped: candidate delivery is fire-and-forget, and the exchange
/// tolerates missing or duplicate candidates.
fn publish_local_candidates(
    peer: &Arc<RTCPeerConnection>,
    directory: &Arc<dyn SignalingDirectory>,
    path: String,
) {
    let directory = directory.clone();
    peer.on_ice_candidate(Box::new(move |candidate| {
        let directory = directory.clone();
        let path = path.clone();
        Box::pin(async move {
            // None marks the end of gathering; nothing to publish.
            let Some(candidate) = candidate else { return };
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(e) => {
                    warn!(error = %e, "local candidate could not be serialized");
                    return;
                }
            };
            let value = match serde_json::to_value(&init) {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "local candidate could not be encoded");
                    return;
                }
            };
            if let Err(e) = directory.push(&path, value).await {
                warn!(error = %e, "failed to publish local candidate");
            }
        })
    }));
}

/// Applies the first answer observed under the room; later writes are
/// ignored without error.
fn spawn_answer_watch(mut watch: DirectoryWatch, peer: Arc<RTCPeerConnection>) {
    let guard = AnswerGuard::default();
    tokio::spawn(async move {
        while let Some(event) = watch.recv().await {
            let DirectoryEvent::Put(value) = event else { continue };
            if peer.signaling_state() != RTCSignalingState::HaveLocalOffer {
                debug!("answer observed with no local offer outstanding; ignoring");
                continue;
            }
            if !guard.try_accept() {
                debug!("ignoring duplicate answer");
                continue;
            }
            match serde_json::from_value::<RTCSessionDescription>(value) {
                Ok(answer) => {
                    if let Err(e) = peer.set_remote_description(answer).await {
                        warn!(error = %e, "failed to apply remote answer");
                    } else {
                        debug!("remote answer applied");
                    }
                }
                Err(e) => warn!(error = %e, "malformed answer record"),
            }
        }
    });
}

/// Applies each remote candidate as it arrives. Order across the two
/// candidate directions is not guaranteed and does not matter; duplicates
/// and stragglers are tolerated by the connectivity layer.
fn spawn_remote_candidate_watch(mut watch: DirectoryWatch, peer: Arc<RTCPeerConnection>) {
    tokio::spawn(async move {
        while let Some(event) = watch.recv().await {
            let DirectoryEvent::Appended(value) = event else { continue };
            let init: RTCIceCandidateInit = match serde_json::from_value(value) {
                Ok(init) => init,
                Err(e) => {
                    warn!(error = %e, "malformed candidate record; skipping");
                    continue;
                }
            };
            if let Err(e) = peer.add_ice_candidate(init).await {
                debug!(error = %e, "remote candidate not applied");
            }
        }
    });
}

/// Watches the room record for deletion.
///
/// Deletion by the peer is a remote-initiated disconnect and surfaces as
/// [`SessionEvent::PeerDisconnected`]; deletion this side triggered itself
/// (the intent flag is set before [`Session::destroy`] deletes the record)
/// must stay silent: a user who hung up should not be told the peer did.
fn spawn_teardown_watch(
    mut watch: DirectoryWatch,
    events: mpsc::UnboundedSender<SessionEvent>,
    self_initiated: Arc<AtomicBool>,
    state: Arc<Mutex<SessionState>>,
    opened: Arc<watch::Sender<bool>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = watch.recv().await {
            if !matches!(event, DirectoryEvent::Removed) {
                continue;
            }
            if self_initiated.load(Ordering::SeqCst) {
                debug!("room deleted by this side; suppressing disconnect event");
            } else {
                info!("room deleted by peer");
                *state.lock() = SessionState::Closed;
                // Release any wait_open caller stuck mid-negotiation.
                let _ = opened.send(false);
                let _ = events.send(SessionEvent::PeerDisconnected);
            }
            break;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::signaling::MemoryDirectory;

    // ==================== Answer Guard Tests ====================

    #[test]
    fn test_answer_guard_accepts_exactly_once() {
        let guard = AnswerGuard::default();
        assert!(guard.try_accept());
        assert!(!guard.try_accept());
        assert!(!guard.try_accept());
    }

    // ==================== Config Tests ====================

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.channel_label, "ghost-drop");
        assert!(!config.ice_servers.is_empty());
        assert!(config.ice_servers.iter().all(|u| u.starts_with("stun:")));
    }

    // ==================== Teardown Attribution Tests ====================

    async fn teardown_fixture(
        self_initiated: bool,
    ) -> (mpsc::UnboundedReceiver<SessionEvent>, Arc<Mutex<SessionState>>) {
        let directory = MemoryDirectory::new();
        directory
            .put("rooms/482913", serde_json::json!({"offer": "o"}))
            .await
            .unwrap();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let flag = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Mutex::new(SessionState::Connected));

        let handle = spawn_teardown_watch(
            directory.watch("rooms/482913").await.unwrap(),
            events_tx,
            flag.clone(),
            state.clone(),
            Arc::new(watch::channel(false).0),
        );

        if self_initiated {
            flag.store(true, Ordering::SeqCst);
        }
        directory.delete("rooms/482913").await.unwrap();
        handle.await.unwrap();

        (events_rx, state)
    }

    #[tokio::test]
    async fn test_peer_deletion_fires_disconnect_exactly_once() {
        let (mut events, state) = teardown_fixture(false).await;
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::PeerDisconnected)
        ));
        // Exactly once: the stream holds nothing further.
        assert!(events.try_recv().is_err());
        assert_eq!(*state.lock(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_self_deletion_suppresses_disconnect() {
        let (mut events, state) = teardown_fixture(true).await;
        assert!(events.try_recv().is_err());
        // destroy() itself moves the state; the watch must not.
        assert_eq!(*state.lock(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_teardown_watch_ignores_non_removal_events() {
        let directory = MemoryDirectory::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let flag = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Mutex::new(SessionState::Connected));

        spawn_teardown_watch(
            directory.watch("rooms/111111").await.unwrap(),
            events_tx,
            flag,
            state.clone(),
            Arc::new(watch::channel(false).0),
        );

        // Creating the record is not a teardown.
        directory
            .put("rooms/111111", serde_json::json!({"offer": "o"}))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert!(events_rx.try_recv().is_err());
        assert_eq!(*state.lock(), SessionState::Connected);
    }

    // ==================== Room Allocation Tests ====================

    #[tokio::test]
    async fn test_allocate_room_code_skips_taken_codes() {
        let directory = MemoryDirectory::new();
        // A directory with a few rooms still has ~900k free codes, so an
        // allocation must succeed and must not collide.
        for code in ["100001", "500000", "999999"] {
            directory
                .put(&format!("rooms/{code}"), serde_json::json!({"offer": "o"}))
                .await
                .unwrap();
        }
        let code = allocate_room_code(&directory).await.unwrap();
        assert!(directory.get(&code.path()).await.unwrap().is_none());
    }
}
