//! Call signaling state machine. Host-driven: the host feeds events in, sends whatever command
//! comes back, and runs the timers. Each dial attempt gets its own id so a timer that fires late
//! can tell whether the attempt it was armed for is still the current one.

use std::collections::HashMap;
use std::time::Duration;

use crate::command::{Answer, Command};
use crate::identity::PeerId;

/// How long a callee may leave a dial unanswered before it is declined automatically.
pub const ANSWER_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a caller waits for an answer before giving up on the attempt.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    /// We dialed the peer and wait for its answer.
    Dialing,
    /// The peer dialed us; we have not answered yet.
    Dialed,
    AnswerOk,
    AnswerDecline,
    /// No dial attempt with this peer.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call {
    pub state: CallState,
    pub attempt: AttemptId,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("already dialing {0}")]
    AlreadyDialing(PeerId),
    #[error("no unanswered call from {0}")]
    NotDialed(PeerId),
}

/// Per-peer call state. Peers without an entry are `Disconnected`.
#[derive(Debug, Clone, Default)]
pub struct CallQueue {
    calls: HashMap<PeerId, Call>,
    next_attempt: u64,
}

impl CallQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, peer: &PeerId) -> CallState {
        self.calls
            .get(peer)
            .map(|c| c.state)
            .unwrap_or(CallState::Disconnected)
    }

    pub fn call(&self, peer: &PeerId) -> Option<Call> {
        self.calls.get(peer).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &Call)> {
        self.calls.iter()
    }

    fn begin(&mut self, peer: PeerId, state: CallState) -> AttemptId {
        self.next_attempt += 1;
        let attempt = AttemptId(self.next_attempt);
        self.calls.insert(peer, Call { state, attempt });
        attempt
    }

    /// Local side starts a call. The host sends `Command::Call` and waits for the answer.
    pub fn dial(&mut self, peer: PeerId) -> Result<AttemptId, CallError> {
        if self.state(&peer) == CallState::Dialing {
            return Err(CallError::AlreadyDialing(peer));
        }
        Ok(self.begin(peer, CallState::Dialing))
    }

    /// Remote side dialed us. The host arms an answer timer for the returned attempt.
    pub fn on_call_received(&mut self, peer: PeerId) -> AttemptId {
        self.begin(peer, CallState::Dialed)
    }

    /// Local user answers an incoming call. Returns the command to send back.
    pub fn answer(&mut self, peer: PeerId, accept: bool) -> Result<Command, CallError> {
        let call = self
            .calls
            .get_mut(&peer)
            .filter(|c| c.state == CallState::Dialed)
            .ok_or(CallError::NotDialed(peer))?;
        let answer = if accept {
            call.state = CallState::AnswerOk;
            Answer::Accept
        } else {
            call.state = CallState::AnswerDecline;
            Answer::Decline
        };
        Ok(Command::Answer(answer))
    }

    /// Remote answer to our dial. Applied only while we are dialing; returns whether it was.
    pub fn on_answer_received(&mut self, peer: PeerId, answer: Answer) -> bool {
        match self.calls.get_mut(&peer) {
            Some(call) if call.state == CallState::Dialing => {
                call.state = match answer {
                    Answer::Accept => CallState::AnswerOk,
                    Answer::Decline => CallState::AnswerDecline,
                };
                true
            }
            _ => false,
        }
    }

    /// Answer timer for `attempt` expired. Declines the call iff that attempt is still unanswered;
    /// an explicit answer that got here first wins. Returns the decline to send.
    pub fn on_answer_timeout(&mut self, peer: PeerId, attempt: AttemptId) -> Option<Command> {
        let call = self.calls.get_mut(&peer)?;
        if call.attempt != attempt || call.state != CallState::Dialed {
            return None;
        }
        call.state = CallState::AnswerDecline;
        Some(Command::Answer(Answer::Decline))
    }

    /// Caller gave up waiting on `attempt`. Clears it if still pending; no message is sent.
    pub fn abandon(&mut self, peer: PeerId, attempt: AttemptId) -> bool {
        match self.calls.get(&peer) {
            Some(call) if call.attempt == attempt && call.state == CallState::Dialing => {
                self.calls.remove(&peer);
                true
            }
            _ => false,
        }
    }

    /// Peer went away: forget any attempt with it.
    pub fn on_peer_disconnected(&mut self, peer: &PeerId) -> bool {
        self.calls.remove(peer).is_some()
    }
}
