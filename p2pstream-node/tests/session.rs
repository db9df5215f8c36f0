//! End-to-end sessions between nodes on localhost, with discovery off and short timers.

use std::net::SocketAddr;
use std::time::Duration;

use p2pstream_core::wire::{self, TypeTag};
use p2pstream_core::{CallState, Keypair, Message, PeerId};
use p2pstream_node::connection::MAX_QUEUED_FRAMES;
use p2pstream_node::{transport, Config, DialError, Node, SendError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn config(answer_timeout_ms: u64, dial_timeout_ms: u64) -> Config {
    Config {
        discovery: false,
        answer_timeout_ms,
        dial_timeout_ms,
        alias_interval_ms: 3_600_000,
        ..Config::default()
    }
}

async fn node() -> Node {
    Node::start(config(300, 2_000)).await.unwrap()
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

async fn wait_peer(node: &Node, peer: PeerId, present: bool) {
    let mut peers = node.peers();
    timeout(WAIT, peers.wait_for(|d| d.contains_key(&peer) == present))
        .await
        .expect("peer set changed in time")
        .expect("node running");
}

async fn link(a: &Node, b: &Node) {
    a.peer_found(b.id(), vec![loopback(b.listen_addr().port())]);
    wait_peer(a, b.id(), true).await;
    wait_peer(b, a.id(), true).await;
}

async fn recv(rx: &mut broadcast::Receiver<Message>) -> Message {
    timeout(WAIT, rx.recv())
        .await
        .expect("message in time")
        .expect("stream open")
}

async fn wait_call(node: &Node, peer: PeerId, state: CallState) {
    let mut calls = node.call_states();
    timeout(WAIT, calls.wait_for(|q| q.state(&peer) == state))
        .await
        .expect("call state in time")
        .expect("node running");
}

/// A peer driven by hand: handshakes properly, then lets the test read and write records.
struct FakePeer {
    keypair: Keypair,
    listener: TcpListener,
}

impl FakePeer {
    async fn new() -> Self {
        Self {
            keypair: Keypair::generate(),
            listener: transport::bind(0).await.unwrap(),
        }
    }

    fn id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    fn addr(&self) -> SocketAddr {
        loopback(self.listener.local_addr().unwrap().port())
    }

    async fn accept(&self, expected: PeerId) -> TcpStream {
        let (mut stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .expect("dialed in time")
            .unwrap();
        let remote = transport::handshake(&mut stream, &self.keypair).await.unwrap();
        assert_eq!(remote, expected);
        stream
    }

    /// Open a session to `node` ourselves.
    async fn dial(&self, node: &Node) -> TcpStream {
        let mut stream = transport::connect(loopback(node.listen_addr().port()))
            .await
            .unwrap();
        let remote = transport::handshake(&mut stream, &self.keypair).await.unwrap();
        assert_eq!(remote, node.id());
        stream
    }
}

async fn read_frame(stream: &mut TcpStream) -> (TypeTag, Vec<u8>) {
    let record = timeout(WAIT, transport::read_record(stream))
        .await
        .expect("record in time")
        .unwrap();
    let (tag, payload) = wire::decode(&record).unwrap();
    (tag, payload.to_vec())
}

async fn read_text(stream: &mut TcpStream) -> String {
    let (tag, payload) = read_frame(stream).await;
    assert_eq!(tag, TypeTag::MESSAGE);
    String::from_utf8(payload).unwrap()
}

async fn write_text(stream: &mut TcpStream, text: &str) {
    let record = wire::encode_record(&wire::encode(TypeTag::MESSAGE, text.as_bytes())).unwrap();
    transport::write_record(stream, &record).await.unwrap();
}

#[tokio::test]
async fn broadcast_reaches_every_peer_and_loops_back_once() {
    let (a, b, c) = (node().await, node().await, node().await);
    link(&a, &b).await;
    link(&a, &c).await;
    let mut rx_a = a.messages();
    let mut rx_b = b.messages();
    let mut rx_c = c.messages();

    assert_eq!(a.broadcast("hi all"), 2);
    let expected = Message::Text {
        peer_id: a.id(),
        body: "hi all".into(),
    };
    assert_eq!(recv(&mut rx_b).await, expected);
    assert_eq!(recv(&mut rx_c).await, expected);
    assert_eq!(recv(&mut rx_a).await, expected);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test]
async fn call_and_alias_prefixes_are_never_chat() {
    let (a, b) = (node().await, node().await);
    link(&a, &b).await;
    let a_alias = a.alias();
    let mut peers = b.peers();
    timeout(WAIT, peers.wait_for(|d| d.get(&a.id()) == Some(&a_alias)))
        .await
        .unwrap()
        .unwrap();
    let mut rx_b = b.messages();

    for text in [
        "/who",
        "/alias carol",
        "/caller",
        "/call OK",
        "/call maybe",
        "/CALL ok",
        "/whoami",
        "plain",
    ] {
        a.send_text(b.id(), text).unwrap();
    }
    a.send_frame(b.id(), &[0, 0, 0, 1, 0x65]).unwrap();

    for body in ["/whoami", "plain"] {
        assert_eq!(
            recv(&mut rx_b).await,
            Message::Text {
                peer_id: a.id(),
                body: body.into()
            }
        );
    }
    assert_eq!(
        recv(&mut rx_b).await,
        Message::Frame {
            peer_id: a.id(),
            bytes: vec![0, 0, 0, 1, 0x65]
        }
    );
    // Stray or unknown answers with no dial pending change nothing.
    assert_eq!(b.call_state(a.id()), CallState::Disconnected);
    assert_eq!(b.get_alias(a.id()), "carol");
}

#[tokio::test]
async fn aliases_are_exchanged_and_last_write_wins() {
    let (a, b) = (node().await, node().await);
    link(&a, &b).await;

    // The `/who` sent on connect is answered with the current alias.
    let a_alias = a.alias();
    let mut peers = b.peers();
    timeout(WAIT, peers.wait_for(|d| d.get(&a.id()) == Some(&a_alias)))
        .await
        .unwrap()
        .unwrap();

    a.send_text(b.id(), "/alias first").unwrap();
    a.send_text(b.id(), "/alias second").unwrap();
    timeout(
        WAIT,
        peers.wait_for(|d| d.get(&a.id()).map(String::as_str) == Some("second")),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(b.get_alias(a.id()), "second");
    assert_eq!(b.get_alias(Keypair::generate().peer_id()), "");
}

#[tokio::test]
async fn new_alias_is_announced_periodically() {
    let a = Node::start(Config {
        alias_interval_ms: 100,
        ..config(300, 2_000)
    })
    .await
    .unwrap();
    let b = node().await;
    link(&a, &b).await;
    let first = a.alias();
    let placeholder = a.id().to_string();
    let mut peers = b.peers();
    let renamed = |d: &p2pstream_node::Directory| {
        d.get(&a.id())
            .is_some_and(|alias| *alias != first && *alias != placeholder)
    };
    timeout(WAIT, peers.wait_for(renamed))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn unanswered_dial_is_declined_by_callee() {
    let (a, b) = (node().await, node().await);
    link(&a, &b).await;

    assert_eq!(a.dial(b.id()).await, Err(DialError::Declined));
    assert_eq!(a.call_state(b.id()), CallState::AnswerDecline);
    assert_eq!(b.call_state(a.id()), CallState::AnswerDecline);
}

#[tokio::test]
async fn accepted_call_is_not_declined_later() {
    let a = node().await;
    let b = Node::start(config(1_000, 2_000)).await.unwrap();
    link(&a, &b).await;

    let caller = a.clone();
    let callee = b.id();
    let dial = tokio::spawn(async move { caller.dial(callee).await });
    wait_call(&b, a.id(), CallState::Dialed).await;
    b.answer(a.id(), true).unwrap();
    assert_eq!(dial.await.unwrap(), Ok(()));

    // Let the callee's answer timer fire; it must not override the accept.
    tokio::time::sleep(Duration::from_millis(1_300)).await;
    assert_eq!(b.call_state(a.id()), CallState::AnswerOk);
    assert_eq!(a.call_state(b.id()), CallState::AnswerOk);
    assert!(b.answer(a.id(), false).is_err());
}

#[tokio::test]
async fn accepted_call_puts_no_decline_on_the_wire() {
    let b = Node::start(config(300, 2_000)).await.unwrap();
    let caller = FakePeer::new().await;
    let mut stream = caller.dial(&b).await;
    wait_peer(&b, caller.id(), true).await;
    assert_eq!(read_text(&mut stream).await, "/who");

    write_text(&mut stream, "/call").await;
    wait_call(&b, caller.id(), CallState::Dialed).await;
    b.answer(caller.id(), true).unwrap();
    assert_eq!(read_text(&mut stream).await, "/call OK");

    // Nothing else arrives, well past the answer timer.
    assert!(
        timeout(Duration::from_millis(900), transport::read_record(&mut stream))
            .await
            .is_err()
    );
    assert_eq!(b.call_state(caller.id()), CallState::AnswerOk);
}

#[tokio::test]
async fn stalled_peer_drops_frames_but_still_gets_text() {
    let a = node().await;
    let fake = FakePeer::new().await;
    a.peer_found(fake.id(), vec![fake.addr()]);
    let mut stream = fake.accept(a.id()).await;
    wait_peer(&a, fake.id(), true).await;

    // The writer can't run until this test yields, so the backlog fills exactly.
    let frame = vec![0xab; 1024];
    for _ in 0..MAX_QUEUED_FRAMES {
        a.send_frame(fake.id(), &frame).unwrap();
    }
    assert_eq!(
        a.send_frame(fake.id(), &frame),
        Err(SendError::Backlogged(fake.id()))
    );
    a.send_text(fake.id(), "still here").unwrap();

    assert_eq!(read_text(&mut stream).await, "/who");
    for _ in 0..MAX_QUEUED_FRAMES {
        assert_eq!(read_frame(&mut stream).await, (TypeTag::FRAME, frame.clone()));
    }
    assert_eq!(read_text(&mut stream).await, "still here");
    // Draining the backlog makes room again.
    a.send_frame(fake.id(), &frame).unwrap();
    assert_eq!(read_frame(&mut stream).await, (TypeTag::FRAME, frame));
}

#[tokio::test]
async fn explicit_decline_fails_the_dial() {
    let a = node().await;
    let b = Node::start(config(2_000, 3_000)).await.unwrap();
    link(&a, &b).await;

    let caller = a.clone();
    let callee = b.id();
    let dial = tokio::spawn(async move { caller.dial(callee).await });
    wait_call(&b, a.id(), CallState::Dialed).await;
    b.answer(a.id(), false).unwrap();
    assert_eq!(dial.await.unwrap(), Err(DialError::Declined));
}

#[tokio::test]
async fn repeated_announcements_open_one_connection() {
    let a = Node::start(config(300, 500)).await.unwrap();
    let fake = FakePeer::new().await;
    for _ in 0..3 {
        a.peer_found(fake.id(), vec![fake.addr()]);
    }
    let mut stream = fake.accept(a.id()).await;
    assert_eq!(read_text(&mut stream).await, "/who");
    wait_peer(&a, fake.id(), true).await;

    a.peer_found(fake.id(), vec![fake.addr()]);
    assert!(timeout(Duration::from_millis(300), fake.listener.accept())
        .await
        .is_err());
    assert_eq!(a.peers().borrow().len(), 1);

    // Nobody answers: the caller gives up without sending anything else.
    assert_eq!(a.dial(fake.id()).await, Err(DialError::TimedOut));
    assert_eq!(read_text(&mut stream).await, "/call");
    assert_eq!(a.call_state(fake.id()), CallState::Disconnected);
    // A fresh dial is allowed after the timeout.
    assert_eq!(a.dial(fake.id()).await, Err(DialError::TimedOut));
}

#[tokio::test]
async fn disconnect_during_dial_fails_with_disconnected() {
    let a = Node::start(config(300, 5_000)).await.unwrap();
    let fake = FakePeer::new().await;
    a.peer_found(fake.id(), vec![fake.addr()]);
    let mut stream = fake.accept(a.id()).await;
    wait_peer(&a, fake.id(), true).await;

    let caller = a.clone();
    let callee = fake.id();
    let dial = tokio::spawn(async move { caller.dial(callee).await });
    assert_eq!(read_text(&mut stream).await, "/who");
    assert_eq!(read_text(&mut stream).await, "/call");
    drop(stream);

    assert_eq!(dial.await.unwrap(), Err(DialError::Disconnected));
    wait_peer(&a, fake.id(), false).await;
}

#[tokio::test]
async fn simultaneous_dials_converge_on_one_connection() {
    let (a, b) = (node().await, node().await);
    a.peer_found(b.id(), vec![loopback(b.listen_addr().port())]);
    b.peer_found(a.id(), vec![loopback(a.listen_addr().port())]);
    wait_peer(&a, b.id(), true).await;
    wait_peer(&b, a.id(), true).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    wait_peer(&a, b.id(), true).await;
    wait_peer(&b, a.id(), true).await;

    let mut rx_a = a.messages();
    let mut rx_b = b.messages();
    a.send_text(b.id(), "ping").unwrap();
    b.send_text(a.id(), "pong").unwrap();
    assert!(matches!(recv(&mut rx_b).await, Message::Text { body, .. } if body == "ping"));
    assert!(matches!(recv(&mut rx_a).await, Message::Text { body, .. } if body == "pong"));
}

#[tokio::test]
async fn shutdown_removes_the_peer_elsewhere() {
    let (a, b) = (node().await, node().await);
    link(&a, &b).await;
    b.shutdown();
    wait_peer(&a, b.id(), false).await;
    assert!(a.send_text(b.id(), "anyone?").is_err());
}
