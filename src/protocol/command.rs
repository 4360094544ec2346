//! Simulation command payloads
//!
//! Requests are short XML-like text messages, replies are packed big-endian
//! binary. Most requests are answered by one reply message. [`Command::Hello`]
//! has none; Peek and mission init are answered by two (see [`PeekReply`] and
//! [`InitReply`]).

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use thiserror::Error;

use super::PROTOCOL_VERSION;

/// Reply decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplyError {
    #[error("{what} reply too short: {len} bytes, need {needed}")]
    TooShort {
        what: &'static str,
        len: usize,
        needed: usize,
    },

    #[error("{what} reply is not valid UTF-8")]
    InvalidUtf8 { what: &'static str },
}

pub type ReplyResult<T> = Result<T, ReplyError>;

/// Identifies one role's episode within an experiment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub experiment_id: String,
    pub role: u32,
    pub episode: u64,
}

impl Token {
    pub fn new(experiment_id: impl Into<String>, role: u32, episode: u64) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            role,
            episode,
        }
    }

    /// Token sent alongside the mission payload, suffixed with the agent count
    pub fn with_agent_count(&self, agent_count: usize) -> String {
        format!("{}:{}", self, agent_count)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.experiment_id, self.role, self.episode)
    }
}

/// Whether step replies carry the info string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepOptions {
    #[default]
    WithInfo,
    WithoutInfo,
}

impl StepOptions {
    pub fn code(self) -> u8 {
        match self {
            StepOptions::WithInfo => 0,
            StepOptions::WithoutInfo => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(StepOptions::WithInfo),
            1 => Some(StepOptions::WithoutInfo),
            _ => None,
        }
    }
}

/// Requests understood by the simulation's command service
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Announces the client version on a fresh connection
    Hello,
    /// Asks for the current observation without acting
    Peek,
    /// Performs one action
    Step {
        options: StepOptions,
        command: String,
    },
    /// Ends the running episode
    Quit,
    /// Asks the head node for the integrated server port
    Find(String),
    /// Releases the experiment's token on the head node
    Close(String),
    /// Asks the service to exit so that it can be restarted
    Exit(String),
    /// Resets the service's episode count
    Init(String),
    /// Requests the service status text
    Status,
}

impl Command {
    /// Encode the command as a message payload
    pub fn encode(&self) -> Vec<u8> {
        let text = match self {
            Command::Hello => format!("<MalmoEnv{}/>", PROTOCOL_VERSION),
            Command::Peek => "<Peek/>".to_string(),
            Command::Step { options, command } => {
                let code = options.code();
                format!("<Step{code}>{command}</Step{code} >")
            }
            Command::Quit => "<Quit/>".to_string(),
            Command::Find(token) => format!("<Find>{}</Find>", token),
            Command::Close(token) => format!("<Close>{}</Close>", token),
            Command::Exit(token) => format!("<Exit>{}</Exit>", token),
            Command::Init(token) => format!("<Init>{}</Init>", token),
            Command::Status => "<Status/>".to_string(),
        };
        text.into_bytes()
    }

    /// Parse a command payload, as a simulation service would
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(payload).ok()?;

        if text.starts_with("<MalmoEnv") && text.ends_with("/>") {
            return Some(Command::Hello);
        }
        match text {
            "<Peek/>" => return Some(Command::Peek),
            "<Quit/>" => return Some(Command::Quit),
            "<Status/>" => return Some(Command::Status),
            _ => {}
        }

        let tagged: [(&str, fn(String) -> Command); 4] = [
            ("Find", Command::Find),
            ("Close", Command::Close),
            ("Exit", Command::Exit),
            ("Init", Command::Init),
        ];
        for (tag, build) in tagged {
            let open = format!("<{}>", tag);
            let close = format!("</{}>", tag);
            if let Some(inner) = text
                .strip_prefix(open.as_str())
                .and_then(|rest| rest.strip_suffix(close.as_str()))
            {
                return Some(build(inner.to_string()));
            }
        }

        let rest = text.strip_prefix("<Step")?;
        let code = rest.bytes().next()?.checked_sub(b'0')?;
        let options = StepOptions::from_code(code)?;
        let body = rest.get(2..)?;
        let suffix = format!("</Step{} >", code);
        let command = body.strip_suffix(suffix.as_str())?;
        Some(Command::Step {
            options,
            command: command.to_string(),
        })
    }
}

fn ensure_len(what: &'static str, buf: &[u8], needed: usize) -> ReplyResult<()> {
    if buf.len() < needed {
        return Err(ReplyError::TooShort {
            what,
            len: buf.len(),
            needed,
        });
    }
    Ok(())
}

/// Encode a status-code reply
pub fn encode_code(code: u32) -> Vec<u8> {
    code.to_be_bytes().to_vec()
}

/// Decode a status-code reply (init, quit, find, close, exit)
pub fn decode_code(what: &'static str, reply: &[u8]) -> ReplyResult<u32> {
    ensure_len(what, reply, 4)?;
    let mut buf = reply;
    Ok(buf.get_u32())
}

/// Decode a status text reply
pub fn decode_text(what: &'static str, reply: &[u8]) -> ReplyResult<String> {
    String::from_utf8(reply.to_vec()).map_err(|_| ReplyError::InvalidUtf8 { what })
}

/// Reply to [`Command::Peek`]: the observation message, then a one-byte
/// done message
#[derive(Debug, Clone, PartialEq)]
pub struct PeekReply {
    pub done: bool,
    /// Empty until the episode has begun
    pub observation: Vec<u8>,
}

impl PeekReply {
    pub fn has_begun(&self) -> bool {
        !self.observation.is_empty()
    }

    /// The two reply messages, in wire order
    pub fn encode(&self) -> [Vec<u8>; 2] {
        [self.observation.clone(), vec![self.done as u8]]
    }

    pub fn decode(observation: Vec<u8>, done: &[u8]) -> ReplyResult<Self> {
        ensure_len("peek done", done, 1)?;
        Ok(Self {
            done: done[0] as i8 == 1,
            observation,
        })
    }
}

/// Reply to a mission init: a `u32` code message, then the turn key message
#[derive(Debug, Clone, PartialEq)]
pub struct InitReply {
    pub started: bool,
    /// Empty unless the mission takes turns
    pub turn_key: String,
}

impl InitReply {
    /// The two reply messages, in wire order
    pub fn encode(&self) -> [Vec<u8>; 2] {
        [
            encode_code(self.started as u32),
            self.turn_key.clone().into_bytes(),
        ]
    }

    pub fn decode(code: &[u8], turn_key: &[u8]) -> ReplyResult<Self> {
        Ok(Self {
            started: decode_code("mission init", code)? == 1,
            turn_key: decode_text("turn key", turn_key)?,
        })
    }
}

/// Reply to [`Command::Step`]
#[derive(Debug, Clone, PartialEq)]
pub struct StepReply {
    pub reward: f64,
    pub done: bool,
    /// Whether the simulation accepted the command
    pub sent: bool,
    pub observation: Vec<u8>,
    pub info: Option<String>,
}

impl StepReply {
    /// reward(8) + done(1) + sent(1) + obs_len(4)
    const FIXED_SIZE: usize = 14;

    pub fn encode(&self) -> Vec<u8> {
        let info = self.info.as_deref().unwrap_or("");
        let mut buf =
            BytesMut::with_capacity(Self::FIXED_SIZE + self.observation.len() + 4 + info.len());
        buf.put_f64(self.reward);
        buf.put_i8(self.done as i8);
        buf.put_i8(self.sent as i8);
        buf.put_u32(self.observation.len() as u32);
        buf.put_slice(&self.observation);
        buf.put_u32(info.len() as u32);
        buf.put_slice(info.as_bytes());
        buf.to_vec()
    }

    pub fn decode(reply: &[u8], options: StepOptions) -> ReplyResult<Self> {
        ensure_len("step", reply, Self::FIXED_SIZE)?;
        let mut buf = reply;
        let reward = buf.get_f64();
        let done = buf.get_i8() == 1;
        let sent = buf.get_i8() == 1;

        let obs_len = buf.get_u32() as usize;
        ensure_len("step observation", buf, obs_len + 4)?;
        let observation = buf[..obs_len].to_vec();
        buf.advance(obs_len);

        let info_len = buf.get_u32() as usize;
        ensure_len("step info", buf, info_len)?;
        let info = match options {
            StepOptions::WithInfo => Some(decode_text("step info", &buf[..info_len])?),
            StepOptions::WithoutInfo => None,
        };

        Ok(Self {
            reward,
            done,
            sent,
            observation,
            info,
        })
    }
}
