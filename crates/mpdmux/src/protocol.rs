//! MPD text protocol framing
//!
//! Every command is answered by zero or more data lines followed by exactly
//! one terminal line: `OK` on success or `ACK [code@index] {command} message`
//! on failure. This module turns a stream of lines into [`Response`] frames
//! and parses the connect-time greeting.

use std::collections::BTreeMap;
use std::fmt;
use std::io;

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio_util::codec::LinesCodecError;

use crate::error::{AckError, ClientError};

/// Terminal success line
pub const SUCCESS: &str = "OK";

/// Every greeting starts with this
pub const GREETING_PREFIX: &str = "OK MPD";

const ACK_PREFIX: &str = "ACK ";

const CHANGED_KEY: &str = "changed";

/// Negotiated protocol version from the greeting banner
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Find the first `major.minor.patch` token in `text`
    fn find(text: &str) -> Option<Self> {
        text.split_whitespace().find_map(|token| {
            let mut parts = token.split('.');
            let major = parts.next()?.parse().ok()?;
            let minor = parts.next()?.parse().ok()?;
            let patch = parts.next()?.parse().ok()?;
            if parts.next().is_some() {
                return None;
            }
            Some(Self::new(major, minor, patch))
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Parse the banner sent right after connecting
pub fn parse_greeting(line: &str) -> Result<Version, ClientError> {
    let rest = line
        .strip_prefix(GREETING_PREFIX)
        .ok_or_else(|| ClientError::BadGreeting {
            line: line.to_string(),
        })?;

    Version::find(rest).ok_or_else(|| ClientError::UnknownVersion {
        line: line.to_string(),
    })
}

/// Parse an `ACK [code@index] {command} message` line
pub fn parse_ack(line: &str) -> Option<AckError> {
    let rest = line.strip_prefix("ACK [")?;
    let (numbers, rest) = rest.split_once("] {")?;
    let (code, command_index) = numbers.split_once('@')?;
    let (command, message) = rest.split_once('}')?;

    Some(AckError {
        code: code.parse().ok()?,
        command_index: command_index.parse().ok()?,
        command: command.to_string(),
        message: message.strip_prefix(' ').unwrap_or(message).to_string(),
    })
}

/// Quote a command argument.
///
/// ```ignore
/// assert_eq!(quote(r#"say "hi""#), r#""say \"hi\"""#);
/// ```
pub fn quote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Split a `key: value` line on the first separator
pub fn split_pair(line: &str) -> Result<(&str, &str), ClientError> {
    line.split_once(": ").ok_or_else(|| ClientError::Parse {
        line: line.to_string(),
    })
}

/// The data lines of a successful response, without the terminal `OK`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub lines: Vec<String>,
}

impl Response {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Subsystems reported by an `idle` response, in order.
    ///
    /// Empty when the idle was cancelled with `noidle`.
    pub fn changed_subsystems(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line.split_once(": ") {
            Some((CHANGED_KEY, subsystem)) => Some(subsystem),
            _ => None,
        })
    }

    /// Every line as a `(key, value)` pair
    pub fn pairs(&self) -> Result<Vec<(&str, &str)>, ClientError> {
        self.lines.iter().map(|line| split_pair(line)).collect()
    }

    pub fn to_info(&self) -> Result<Info, ClientError> {
        Info::from_lines(&self.lines)
    }
}

/// Accumulates lines until a terminal line completes the frame.
///
/// Kept outside of any future so a partially read frame survives a
/// cancelled `select!` branch.
#[derive(Debug, Default)]
pub(crate) struct FrameBuilder {
    lines: Vec<String>,
}

impl FrameBuilder {
    /// Feed one line; returns the outcome once the frame is complete
    pub(crate) fn push(&mut self, line: String) -> Option<Result<Response, ClientError>> {
        if line == SUCCESS {
            return Some(Ok(Response {
                lines: std::mem::take(&mut self.lines),
            }));
        }

        if line.starts_with(ACK_PREFIX) {
            self.lines.clear();
            return Some(match parse_ack(&line) {
                Some(ack) => Err(ack.into()),
                None => Err(ClientError::Parse { line }),
            });
        }

        self.lines.push(line);
        None
    }
}

/// Map a codec error onto the underlying I/O error
pub(crate) fn codec_io_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "line length limit exceeded")
        }
    }
}

/// Turn one item of a line stream into a line or a transport error
pub(crate) fn next_line(
    item: Option<Result<String, LinesCodecError>>,
) -> Result<String, ClientError> {
    match item {
        Some(Ok(line)) => Ok(line),
        Some(Err(e)) => Err(ClientError::ReceiveFailed(codec_io_error(e))),
        None => Err(ClientError::ConnectionClosed),
    }
}

/// Read lines until a terminal `OK`, an `ACK`, or a transport failure.
///
/// Lines after an `ACK` are not read.
pub async fn read_frame<S>(lines: &mut S) -> Result<Response, ClientError>
where
    S: Stream<Item = Result<String, LinesCodecError>> + Unpin,
{
    let mut frame = FrameBuilder::default();
    loop {
        let line = next_line(lines.next().await)?;
        if let Some(outcome) = frame.push(line) {
            return outcome;
        }
    }
}

/// Field map built from `key: value` lines; the last duplicate wins
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Info(BTreeMap<String, String>);

impl Info {
    pub fn from_lines<S: AsRef<str>>(lines: &[S]) -> Result<Self, ClientError> {
        let mut info = Self::default();
        for line in lines {
            info.add_line(line.as_ref())?;
        }
        Ok(info)
    }

    pub fn add_line(&mut self, line: &str) -> Result<(), ClientError> {
        let (key, value) = split_pair(line)?;
        self.0.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Elapsed and total seconds from the `time: <elapsed>:<total>` field.
    ///
    /// `(0, 0)` when the field is missing or malformed.
    pub fn progress(&self) -> (u32, u32) {
        let parse = |s: &str| s.trim().parse::<f64>().ok().map(|v| v as u32);
        self.get("time")
            .and_then(|t| t.split_once(':'))
            .and_then(|(elapsed, total)| Some((parse(elapsed)?, parse(total)?)))
            .unwrap_or((0, 0))
    }
}
