//! Session coordinator.
//!
//! A node owns the session listener, discovery, the peer registry and call state. One event loop
//! task applies every registry mutation: connection lifecycle, inbound control commands, discovery
//! results and timer expiries all arrive on its channel in order. API callers only read the
//! registry or queue sends through it; call state is shared through a `watch` channel and updated
//! in place with `send_if_modified`.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use p2pstream_core::{AttemptId, CallError, CallQueue, CallState, Command, Keypair, Message, PeerId};
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::{self, Connection, ConnectionError, ConnectionEvent, ConnectionId, Role};
use crate::discovery::{Discovery, DiscoveryEvent};
use crate::registry::{Directory, Registration, Registry};
use crate::transport;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("bind session listener: {0}")]
    Listen(std::io::Error),
    #[error("bind discovery socket: {0}")]
    Discovery(std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("outbound backlog to {0} is full, frame dropped")]
    Backlogged(PeerId),
}

/// Why a dial did not end in an accepted call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DialError {
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("call declined")]
    Declined,
    #[error("no answer in time")]
    TimedOut,
    #[error("peer disconnected")]
    Disconnected,
    #[error("replaced by a newer call with the same peer")]
    Superseded,
    #[error("node shut down")]
    Shutdown,
}

#[derive(Debug)]
enum NodeEvent {
    Connection(ConnectionEvent),
    Discovery(DiscoveryEvent),
    DialFinished {
        peer: PeerId,
        result: Result<PeerId, ConnectionError>,
    },
    AnswerTimeout {
        peer: PeerId,
        attempt: AttemptId,
    },
}

impl From<ConnectionEvent> for NodeEvent {
    fn from(e: ConnectionEvent) -> Self {
        NodeEvent::Connection(e)
    }
}

impl From<DiscoveryEvent> for NodeEvent {
    fn from(e: DiscoveryEvent) -> Self {
        NodeEvent::Discovery(e)
    }
}

struct Shared {
    config: Config,
    registry: Mutex<Registry>,
    calls: watch::Sender<CallQueue>,
    alias: watch::Sender<String>,
    messages: broadcast::Sender<Message>,
    stopped: AtomicBool,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send_command(&self, peer: &PeerId, command: &Command) -> bool {
        self.registry().send_text(peer, &command.to_string())
    }

    fn send_command_all(&self, command: &Command) -> usize {
        self.registry().broadcast_text(&command.to_string())
    }
}

/// Handle to a running node. Clones share the node; it stops when the last clone is dropped or on
/// [`Node::shutdown`].
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

struct Inner {
    local: PeerId,
    listen_addr: SocketAddr,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<NodeEvent>,
    directory: watch::Receiver<Directory>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        self.shared.registry().clear();
        self.shared.calls.send_if_modified(|q| {
            let pending = q.iter().next().is_some();
            *q = CallQueue::new();
            pending
        });
        info!(peer = %self.local.short(), "node stopped");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Node {
    /// Bind the session listener (and discovery, if enabled) and start the event loop.
    /// Must be called inside a tokio runtime.
    pub async fn start(config: Config) -> Result<Node, NodeError> {
        let keypair = Arc::new(Keypair::generate());
        let local = keypair.peer_id();
        let listener = transport::bind(config.transport_port)
            .await
            .map_err(NodeError::Listen)?;
        let listen_addr = listener.local_addr().map_err(NodeError::Listen)?;
        let discovery = if config.discovery {
            Some(Discovery::bind(config.discovery_port).map_err(NodeError::Discovery)?)
        } else {
            None
        };

        let registry = Registry::new(local);
        let directory = registry.subscribe();
        let (calls, _) = watch::channel(CallQueue::new());
        let (alias, _) = watch::channel(random_alias());
        let (messages, _) = broadcast::channel(config.message_queue_size.max(1));
        let shared = Arc::new(Shared {
            config,
            registry: Mutex::new(registry),
            calls,
            alias,
            messages,
            stopped: AtomicBool::new(false),
        });
        let (events, events_rx) = mpsc::unbounded_channel();

        let mut tasks = vec![tokio::spawn(accept_loop(
            listener,
            keypair.clone(),
            events.clone(),
        ))];
        if let Some(discovery) = discovery {
            let tx = events.clone();
            let port = listen_addr.port();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = discovery.run(local, port, tx).await {
                    warn!("discovery stopped: {e}");
                }
            }));
        }
        let event_loop = EventLoop {
            local,
            keypair,
            shared: shared.clone(),
            events: events.clone(),
            dialing: HashSet::new(),
        };
        tasks.push(tokio::spawn(event_loop.run(events_rx)));

        info!(peer = %local, %listen_addr, "node started");
        Ok(Node {
            inner: Arc::new(Inner {
                local,
                listen_addr,
                shared,
                events,
                directory,
                tasks: Mutex::new(tasks),
            }),
        })
    }

    pub fn id(&self) -> PeerId {
        self.inner.local
    }

    /// Address the session listener is bound to (all interfaces).
    pub fn listen_addr(&self) -> SocketAddr {
        self.inner.listen_addr
    }

    /// Chat text and video frames from peers, plus our own loopback broadcasts.
    /// Control commands never appear here.
    pub fn messages(&self) -> broadcast::Receiver<Message> {
        self.inner.shared.messages.subscribe()
    }

    pub fn call_states(&self) -> watch::Receiver<CallQueue> {
        self.inner.shared.calls.subscribe()
    }

    pub fn call_state(&self, peer: PeerId) -> CallState {
        self.inner.shared.calls.borrow().state(&peer)
    }

    /// Connected peers and their last announced aliases.
    pub fn peers(&self) -> watch::Receiver<Directory> {
        self.inner.directory.clone()
    }

    /// Our current alias.
    pub fn alias(&self) -> String {
        self.inner.shared.alias.borrow().clone()
    }

    /// Last alias `peer` announced, its ID string until it does, or empty for unknown peers.
    pub fn get_alias(&self, peer: PeerId) -> String {
        self.inner
            .directory
            .borrow()
            .get(&peer)
            .cloned()
            .unwrap_or_default()
    }

    /// Offer a candidate peer. Discovery calls this for every announcement; hosts without
    /// multicast can call it directly.
    pub fn peer_found(&self, peer: PeerId, addrs: Vec<SocketAddr>) {
        let _ = self
            .inner
            .events
            .send(DiscoveryEvent::Found { peer, addrs }.into());
    }

    /// Send `text` to every peer and echo it to our own message stream.
    pub fn broadcast(&self, text: &str) -> usize {
        self.broadcast_with(text, true)
    }

    /// Send `text` to every peer. Returns how many peers it was queued for.
    pub fn broadcast_with(&self, text: &str, loopback: bool) -> usize {
        let shared = &self.inner.shared;
        let sent = shared.registry().broadcast_text(text);
        if loopback {
            let _ = shared.messages.send(Message::Text {
                peer_id: self.inner.local,
                body: text.to_string(),
            });
        }
        sent
    }

    pub fn send_text(&self, peer: PeerId, text: &str) -> Result<(), SendError> {
        if self.inner.shared.registry().send_text(&peer, text) {
            Ok(())
        } else {
            Err(SendError::UnknownPeer(peer))
        }
    }

    /// Queue one video frame. Fails with `Backlogged` when too many frames to `peer` are already
    /// waiting.
    pub fn send_frame(&self, peer: PeerId, bytes: &[u8]) -> Result<(), SendError> {
        let registry = self.inner.shared.registry();
        if !registry.contains(&peer) {
            Err(SendError::UnknownPeer(peer))
        } else if registry.send_frame(&peer, bytes) {
            Ok(())
        } else {
            Err(SendError::Backlogged(peer))
        }
    }

    /// Call `peer` and wait for its answer, bounded by the configured dial timeout.
    pub async fn dial(&self, peer: PeerId) -> Result<(), DialError> {
        let shared = &self.inner.shared;
        if !shared.registry().contains(&peer) {
            return Err(DialError::UnknownPeer(peer));
        }
        let mut states = shared.calls.subscribe();
        let mut begun = Err(CallError::AlreadyDialing(peer));
        shared.calls.send_if_modified(|q| {
            begun = q.dial(peer);
            begun.is_ok()
        });
        let attempt = begun?;
        if !shared.send_command(&peer, &Command::Call) {
            shared.calls.send_if_modified(|q| q.abandon(peer, attempt));
            return Err(DialError::Disconnected);
        }
        info!(peer = %peer.short(), "dialing");

        let answered = async {
            loop {
                let current = states.borrow_and_update().call(&peer);
                let outcome = match current {
                    None if shared.stopped.load(Ordering::SeqCst) => Some(Err(DialError::Shutdown)),
                    None => Some(Err(DialError::Disconnected)),
                    Some(call) if call.attempt != attempt => Some(Err(DialError::Superseded)),
                    Some(call) => match call.state {
                        CallState::AnswerOk => Some(Ok(())),
                        CallState::AnswerDecline => Some(Err(DialError::Declined)),
                        _ => None,
                    },
                };
                if let Some(outcome) = outcome {
                    return outcome;
                }
                if states.changed().await.is_err() {
                    return Err(DialError::Shutdown);
                }
            }
        };
        match tokio::time::timeout(shared.config.dial_timeout(), answered).await {
            Ok(outcome) => outcome,
            Err(_) => {
                shared.calls.send_if_modified(|q| q.abandon(peer, attempt));
                debug!(peer = %peer.short(), "dial timed out");
                Err(DialError::TimedOut)
            }
        }
    }

    /// Answer an incoming call.
    pub fn answer(&self, peer: PeerId, accept: bool) -> Result<(), CallError> {
        let shared = &self.inner.shared;
        let mut reply = Err(CallError::NotDialed(peer));
        shared.calls.send_if_modified(|q| {
            reply = q.answer(peer, accept);
            reply.is_ok()
        });
        let reply = reply?;
        shared.send_command(&peer, &reply);
        Ok(())
    }

    /// Stop all tasks and close every connection. Pending dials fail with `Shutdown`.
    pub fn shutdown(&self) {
        self.inner.stop();
    }
}

fn random_alias() -> String {
    rand::thread_rng().gen::<u32>().to_string()
}

async fn accept_loop(
    listener: TcpListener,
    keypair: Arc<Keypair>,
    events: mpsc::UnboundedSender<NodeEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, from)) => {
                let _ = stream.set_nodelay(true);
                let keypair = keypair.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        connection::establish(stream, Role::Responder, keypair, None, events).await
                    {
                        debug!(%from, "inbound connection failed: {e}");
                    }
                });
            }
            Err(e) => {
                warn!("accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

struct EventLoop {
    local: PeerId,
    keypair: Arc<Keypair>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<NodeEvent>,
    /// Outbound dials in flight, so repeated announcements don't open parallel streams.
    dialing: HashSet<PeerId>,
}

impl EventLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<NodeEvent>) {
        let period = self
            .shared
            .config
            .alias_interval()
            .max(Duration::from_millis(1));
        let mut alias_tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = alias_tick.tick() => self.announce_alias(),
            }
        }
    }

    fn handle(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Connection(ConnectionEvent::Opened(conn)) => self.on_opened(conn),
            NodeEvent::Connection(ConnectionEvent::Text { peer, body }) => self.on_text(peer, body),
            NodeEvent::Connection(ConnectionEvent::Frame { peer, bytes }) => {
                self.deliver(Message::Frame {
                    peer_id: peer,
                    bytes,
                });
            }
            NodeEvent::Connection(ConnectionEvent::Closed { peer, id }) => self.on_closed(peer, id),
            NodeEvent::Discovery(DiscoveryEvent::Found { peer, addrs }) => {
                self.on_peer_found(peer, addrs)
            }
            NodeEvent::Discovery(DiscoveryEvent::Lost { peer }) => {
                debug!(peer = %peer.short(), "peer no longer announcing");
            }
            NodeEvent::DialFinished { peer, result } => {
                self.dialing.remove(&peer);
                if let Err(e) = result {
                    debug!(peer = %peer.short(), "dial failed: {e}");
                }
            }
            NodeEvent::AnswerTimeout { peer, attempt } => self.on_answer_timeout(peer, attempt),
        }
    }

    fn on_peer_found(&mut self, peer: PeerId, addrs: Vec<SocketAddr>) {
        if peer == self.local
            || self.dialing.contains(&peer)
            || self.shared.registry().contains(&peer)
        {
            return;
        }
        let Some(&addr) = addrs.first() else {
            return;
        };
        self.dialing.insert(peer);
        let keypair = self.keypair.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = match transport::connect(addr).await {
                Ok(stream) => {
                    connection::establish(stream, Role::Initiator, keypair, Some(peer), events.clone())
                        .await
                }
                Err(e) => Err(ConnectionError::Connect(e)),
            };
            let _ = events.send(NodeEvent::DialFinished { peer, result });
        });
    }

    fn on_opened(&mut self, conn: Connection) {
        let peer = conn.peer_id();
        let mut registry = self.shared.registry();
        match registry.register(conn) {
            outcome @ (Registration::Added | Registration::Replaced) => {
                info!(peer = %peer.short(), ?outcome, peers = registry.len(), "peer connected");
                registry.send_text(&peer, &Command::Who.to_string());
            }
            Registration::Rejected => {
                debug!(peer = %peer.short(), "dropping duplicate connection");
            }
        }
    }

    fn on_closed(&mut self, peer: PeerId, id: ConnectionId) {
        if !self.shared.registry().remove(&peer, id) {
            return;
        }
        info!(peer = %peer.short(), "peer disconnected");
        self.shared
            .calls
            .send_if_modified(|q| q.on_peer_disconnected(&peer));
    }

    fn on_text(&mut self, peer: PeerId, body: String) {
        match Command::parse(&body) {
            Some(Command::Who) => {
                let alias = self.shared.alias.borrow().clone();
                self.shared.send_command(&peer, &Command::Alias(alias));
            }
            Some(Command::Alias(alias)) => {
                self.shared.registry().set_alias(&peer, alias);
            }
            Some(Command::Call) => self.on_call(peer),
            Some(Command::Answer(answer)) => {
                if !self
                    .shared
                    .calls
                    .send_if_modified(|q| q.on_answer_received(peer, answer))
                {
                    debug!(peer = %peer.short(), ?answer, "ignoring answer with no pending dial");
                }
            }
            Some(Command::UnknownCall(arg)) => {
                debug!(peer = %peer.short(), %arg, "ignoring unknown call command");
            }
            None => self.deliver(Message::Text {
                peer_id: peer,
                body,
            }),
        }
    }

    fn on_call(&mut self, peer: PeerId) {
        info!(peer = %peer.short(), "incoming call");
        let events = self.events.clone();
        let wait = self.shared.config.answer_timeout();
        self.shared.calls.send_modify(|q| {
            let attempt = q.on_call_received(peer);
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                let _ = events.send(NodeEvent::AnswerTimeout { peer, attempt });
            });
        });
    }

    fn on_answer_timeout(&mut self, peer: PeerId, attempt: AttemptId) {
        let mut decline = None;
        self.shared.calls.send_if_modified(|q| {
            decline = q.on_answer_timeout(peer, attempt);
            decline.is_some()
        });
        if let Some(decline) = decline {
            info!(peer = %peer.short(), "call unanswered, declining");
            self.shared.send_command(&peer, &decline);
        }
    }

    fn announce_alias(&mut self) {
        let alias = random_alias();
        self.shared.alias.send_replace(alias.clone());
        let sent = self.shared.send_command_all(&Command::Alias(alias.clone()));
        debug!(%alias, peers = sent, "announced alias");
    }

    fn deliver(&self, message: Message) {
        // No subscribers is fine.
        let _ = self.shared.messages.send(message);
    }
}
