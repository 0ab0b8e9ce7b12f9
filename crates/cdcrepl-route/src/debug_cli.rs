//! # Debug CLI sessions
//!
//! Line-oriented admin sessions. Each session accumulates client bytes in a
//! bounded [`LineBuffer`]; every complete line goes to the
//! [`CommandExecutor`] and the reply ends with the [`PROMPT`].
//!
//! Sessions live in one registry owned by [`DebugCli`] behind a single
//! lock. Commands execute outside the lock.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

pub const PROMPT: &str = "Gateway> ";
pub const DEFAULT_LINE_LIMIT: usize = 80;

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("command line exceeds {limit} bytes")]
pub struct LineOverflow {
    pub limit: usize,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error(transparent)]
    LineOverflow(#[from] LineOverflow),
}

/// Bounded line accumulator.
///
/// Bytes are buffered until a newline; a trailing `\r` is stripped. A line
/// that grows past the limit is discarded together with the rest of the
/// chunk, and `push` reports the overflow.
#[derive(Debug, Clone)]
pub struct LineBuffer {
    buf: Vec<u8>,
    limit: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LINE_LIMIT)
    }
}

impl LineBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes of the incomplete line.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, LineOverflow> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                if self.buf.last() == Some(&b'\r') {
                    self.buf.pop();
                }
                lines.push(String::from_utf8_lossy(&self.buf).into_owned());
                self.buf.clear();
            } else if self.buf.len() >= self.limit {
                self.buf.clear();
                return Err(LineOverflow { limit: self.limit });
            } else {
                self.buf.push(byte);
            }
        }
        Ok(lines)
    }
}

/// What to do after a command ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Continue(String),
    /// Close the session
    Terminate,
}

pub trait CommandExecutor: Send + Sync {
    fn execute(&self, line: &str) -> CommandOutcome;
}

impl<F> CommandExecutor for F
where
    F: Fn(&str) -> CommandOutcome + Send + Sync,
{
    fn execute(&self, line: &str) -> CommandOutcome {
        self(line)
    }
}

/// Reply to a chunk of client input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliReply {
    /// Text for the client; ends with the prompt when a line was executed,
    /// empty while a line is still incomplete
    Output(String),
    /// The session was closed by a command
    Close,
}

#[derive(Debug)]
struct Session {
    buffer: LineBuffer,
}

pub struct DebugCli<E> {
    executor: E,
    line_limit: usize,
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl<E: CommandExecutor> DebugCli<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            line_limit: DEFAULT_LINE_LIMIT,
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_line_limit(mut self, limit: usize) -> Self {
        self.line_limit = limit;
        self
    }

    pub fn new_session(&self) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().insert(
            id,
            Session {
                buffer: LineBuffer::new(self.line_limit),
            },
        );
        debug!(session = id, "Debug CLI session opened");
        id
    }

    /// Returns `false` when the session was not registered.
    pub fn close_session(&self, id: SessionId) -> bool {
        let removed = self.sessions.lock().remove(&id).is_some();
        if removed {
            debug!(session = id, "Debug CLI session closed");
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn execute(&self, id: SessionId, bytes: &[u8]) -> Result<CliReply, CliError> {
        let lines = {
            let mut sessions = self.sessions.lock();
            let session = sessions.get_mut(&id).ok_or(CliError::UnknownSession(id))?;
            session.buffer.push(bytes).inspect_err(|e| {
                warn!(session = id, limit = e.limit, "Debug CLI line overflow");
            })?
        };
        if lines.is_empty() {
            return Ok(CliReply::Output(String::new()));
        }

        let mut output = String::new();
        for line in &lines {
            match self.executor.execute(line) {
                CommandOutcome::Continue(out) => output.push_str(&out),
                CommandOutcome::Terminate => {
                    self.close_session(id);
                    return Ok(CliReply::Close);
                }
            }
        }
        output.push_str(PROMPT);
        Ok(CliReply::Output(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(line: &str) -> CommandOutcome {
        match line {
            "quit" => CommandOutcome::Terminate,
            other => CommandOutcome::Continue(format!("{other}\n")),
        }
    }

    #[test]
    fn test_line_buffer_splits_lines() {
        let mut buffer = LineBuffer::default();
        assert_eq!(buffer.push(b"show ser").unwrap(), Vec::<String>::new());
        assert_eq!(buffer.pending(), b"show ser");
        assert_eq!(
            buffer.push(b"vers\r\nshow sessions\npart").unwrap(),
            vec!["show servers".to_string(), "show sessions".to_string()]
        );
        assert_eq!(buffer.pending(), b"part");
    }

    #[test]
    fn test_line_buffer_overflow_discards_line() {
        let mut buffer = LineBuffer::new(8);
        assert_eq!(buffer.push(b"12345678").unwrap(), Vec::<String>::new());
        assert_eq!(buffer.push(b"9"), Err(LineOverflow { limit: 8 }));
        assert!(buffer.pending().is_empty());
        assert_eq!(buffer.push(b"ok\n").unwrap(), vec!["ok".to_string()]);
    }

    #[test]
    fn test_session_registry() {
        let cli = DebugCli::new(echo);
        let a = cli.new_session();
        let b = cli.new_session();
        assert_ne!(a, b);
        assert_eq!(cli.session_count(), 2);
        assert!(cli.close_session(a));
        assert!(!cli.close_session(a));
        assert_eq!(cli.session_count(), 1);
        assert!(matches!(
            cli.execute(a, b"x\n"),
            Err(CliError::UnknownSession(id)) if id == a
        ));
    }

    #[test]
    fn test_execute_replies_with_prompt() {
        let cli = DebugCli::new(echo);
        let id = cli.new_session();
        assert_eq!(
            cli.execute(id, b"show").unwrap(),
            CliReply::Output(String::new())
        );
        assert_eq!(
            cli.execute(id, b" dcbs\nlist\n").unwrap(),
            CliReply::Output(format!("show dcbs\nlist\n{PROMPT}"))
        );
    }

    #[test]
    fn test_terminate_closes_session() {
        let cli = DebugCli::new(echo);
        let id = cli.new_session();
        assert_eq!(cli.execute(id, b"quit\n").unwrap(), CliReply::Close);
        assert_eq!(cli.session_count(), 0);
    }

    #[test]
    fn test_overflow_keeps_session() {
        let cli = DebugCli::new(echo).with_line_limit(4);
        let id = cli.new_session();
        assert!(matches!(
            cli.execute(id, b"toolong\n"),
            Err(CliError::LineOverflow(LineOverflow { limit: 4 }))
        ));
        assert_eq!(cli.session_count(), 1);
        assert_eq!(
            cli.execute(id, b"ok\n").unwrap(),
            CliReply::Output(format!("ok\n{PROMPT}"))
        );
    }
}
