//! Line console: chat on stdin, messages and call events on stdout.

use p2pstream_core::{CallQueue, CallState, Command, Message, PeerId};
use p2pstream_node::{Directory, Node};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

const HELP: &str = "commands: :peers  :call <peer>  :accept [peer]  :decline [peer]  \
                    :send <peer> <text>  :quit  (anything else is broadcast)";

#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Empty,
    Help,
    Peers,
    Call(&'a str),
    Answer { peer: Option<&'a str>, accept: bool },
    Send { peer: &'a str, text: &'a str },
    Quit,
    Say(&'a str),
    Invalid(&'a str),
}

fn parse(line: &str) -> Input<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(cmd) = line.strip_prefix(':') else {
        return Input::Say(line);
    };
    let (word, rest) = match cmd.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim()),
        None => (cmd, ""),
    };
    let arg = (!rest.is_empty()).then_some(rest);
    match (word, arg) {
        ("help", _) => Input::Help,
        ("peers", None) => Input::Peers,
        ("call", Some(peer)) => Input::Call(peer),
        ("accept", peer) => Input::Answer { peer, accept: true },
        ("decline", peer) => Input::Answer {
            peer,
            accept: false,
        },
        ("send", Some(rest)) => match rest.split_once(char::is_whitespace) {
            Some((peer, text)) => Input::Send {
                peer,
                text: text.trim_start(),
            },
            None => Input::Invalid(line),
        },
        ("quit", None) => Input::Quit,
        _ => Input::Invalid(line),
    }
}

/// Find a peer by full ID, alias, or unambiguous ID prefix.
fn resolve(directory: &Directory, query: &str) -> Option<PeerId> {
    if let Ok(id) = query.parse::<PeerId>() {
        return directory.contains_key(&id).then_some(id);
    }
    if let Some((id, _)) = directory.iter().find(|(_, alias)| alias.as_str() == query) {
        return Some(*id);
    }
    let mut matches = directory
        .keys()
        .filter(|id| id.to_string().starts_with(query));
    match (matches.next(), matches.next()) {
        (Some(id), None) => Some(*id),
        _ => None,
    }
}

fn label(node: &Node, peer: PeerId) -> String {
    let alias = node.get_alias(peer);
    if alias.is_empty() || alias == peer.to_string() {
        peer.short()
    } else {
        format!("{alias} ({})", peer.short())
    }
}

pub async fn run(node: Node) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut messages = node.messages();
    let mut calls = node.call_states();
    let mut seen = calls.borrow_and_update().clone();
    println!("p2pstream {} as {}. {HELP}", node.id(), node.alias());

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                if !handle_line(&node, &line) {
                    return Ok(());
                }
            }
            message = messages.recv() => match message {
                Ok(message) => print_message(&node, &message),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "console fell behind"),
                Err(RecvError::Closed) => return Ok(()),
            },
            changed = calls.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let now = calls.borrow_and_update().clone();
                report_calls(&node, &seen, &now);
                seen = now;
            }
        }
    }
}

/// Returns false on `:quit`.
fn handle_line(node: &Node, line: &str) -> bool {
    let directory = node.peers().borrow().clone();
    match parse(line) {
        Input::Empty => {}
        Input::Help => println!("{HELP}"),
        Input::Peers => {
            if directory.is_empty() {
                println!("no peers");
            }
            for (id, alias) in &directory {
                println!("  {id}  {alias}  [{:?}]", node.call_state(*id));
            }
        }
        Input::Call(query) => match resolve(&directory, query) {
            Some(peer) => {
                let node = node.clone();
                tokio::spawn(async move {
                    match node.dial(peer).await {
                        Ok(()) => println!("{} accepted the call", label(&node, peer)),
                        Err(e) => println!("call to {} failed: {e}", label(&node, peer)),
                    }
                });
            }
            None => println!("no such peer: {query}"),
        },
        Input::Answer { peer, accept } => {
            let target = match peer {
                Some(query) => resolve(&directory, query),
                None => ringing(&node.call_states().borrow()),
            };
            match target {
                Some(peer) => {
                    if let Err(e) = node.answer(peer, accept) {
                        println!("{e}");
                    }
                }
                None => println!("no unanswered call"),
            }
        }
        Input::Send { peer, text } => match resolve(&directory, peer) {
            Some(id) => {
                if let Err(e) = node.send_text(id, text) {
                    println!("{e}");
                }
            }
            None => println!("no such peer: {peer}"),
        },
        Input::Quit => return false,
        Input::Say(text) if Command::parse(text).is_some() => {
            println!("{text:?} is reserved for signaling; use :call, :accept or :decline");
        }
        Input::Say(text) => {
            node.broadcast(text);
        }
        Input::Invalid(line) => println!("unknown command: {line}. {HELP}"),
    }
    true
}

/// The only peer currently ringing us, if exactly one is.
fn ringing(calls: &CallQueue) -> Option<PeerId> {
    let mut dialed = calls
        .iter()
        .filter(|(_, call)| call.state == CallState::Dialed)
        .map(|(peer, _)| *peer);
    match (dialed.next(), dialed.next()) {
        (Some(peer), None) => Some(peer),
        _ => None,
    }
}

fn print_message(node: &Node, message: &Message) {
    match message {
        Message::Text { peer_id, body } => println!("<{}> {body}", label(node, *peer_id)),
        Message::Frame { peer_id, bytes } => {
            println!("[frame from {}: {} bytes]", label(node, *peer_id), bytes.len())
        }
    }
}

fn report_calls(node: &Node, before: &CallQueue, now: &CallQueue) {
    for (peer, call) in now.iter() {
        if before.call(peer) == Some(*call) {
            continue;
        }
        let who = label(node, *peer);
        match call.state {
            CallState::Dialed => println!("{who} is calling. :accept or :decline"),
            CallState::Dialing => println!("calling {who}..."),
            CallState::AnswerOk => println!("call with {who} accepted"),
            CallState::AnswerDecline => println!("call with {who} declined"),
            CallState::Disconnected => {}
        }
    }
}
