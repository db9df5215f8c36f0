//! Control commands carried as text in MESSAGE frames.
//!
//! Commands are matched by prefix: `/who` exactly, `/alias` as a plain prefix and `/call` as a
//! case-insensitive prefix. Every `/call...` text is consumed, even with an argument this side
//! does not understand. Anything else is chat.

use std::fmt;

const WHO: &str = "/who";
const ALIAS: &str = "/alias";
const CALL: &str = "/call";
const OK: &str = "OK";
const DECLINE: &str = "DECLINE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Accept,
    Decline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ask the peer for its alias.
    Who,
    /// Announce (or reply with) the sender's alias.
    Alias(String),
    /// Dial: the sender wants to start a call.
    Call,
    /// Callee's reply to a dial.
    Answer(Answer),
    /// `/call` with an argument we don't know. Consumed without effect.
    UnknownCall(String),
}

impl Command {
    /// Parse a control command. Returns `None` for chat text.
    pub fn parse(text: &str) -> Option<Command> {
        if text == WHO {
            return Some(Command::Who);
        }
        if let Some(rest) = strip_prefix_ignore_case(text, CALL) {
            return Some(match rest.trim() {
                "" => Command::Call,
                OK => Command::Answer(Answer::Accept),
                DECLINE => Command::Answer(Answer::Decline),
                other => Command::UnknownCall(other.to_string()),
            });
        }
        if let Some(rest) = text.strip_prefix(ALIAS) {
            return Some(Command::Alias(rest.trim().to_string()));
        }
        None
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &text[prefix.len()..])
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Who => f.write_str(WHO),
            Command::Alias(alias) => write!(f, "{ALIAS} {alias}"),
            Command::Call => f.write_str(CALL),
            Command::Answer(Answer::Accept) => write!(f, "{CALL} {OK}"),
            Command::Answer(Answer::Decline) => write!(f, "{CALL} {DECLINE}"),
            Command::UnknownCall(arg) => write!(f, "{CALL} {arg}"),
        }
    }
}
