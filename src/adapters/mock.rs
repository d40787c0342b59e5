//! Scripted line transport for driver tests.

use super::LineTransport;
use crate::error::{AppResult, MicroscopeError};
use std::collections::VecDeque;

/// Transport that replays canned reply lines and records everything written.
///
/// Reading past the end of the script is a protocol error, like a device that stopped
/// answering.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    replies: VecDeque<String>,
    written: Vec<String>,
}

impl ScriptedTransport {
    /// Transport that answers queries with `replies` in order.
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: replies.into_iter().map(Into::into).collect(),
            written: Vec::new(),
        }
    }

    /// Queue another reply line.
    pub fn push_reply(&mut self, reply: impl Into<String>) {
        self.replies.push_back(reply.into());
    }

    /// Lines written so far.
    pub fn written(&self) -> &[String] {
        &self.written
    }
}

impl LineTransport for ScriptedTransport {
    fn write_line(&mut self, line: &str) -> AppResult<()> {
        self.written.push(line.to_string());
        Ok(())
    }

    fn read_line(&mut self) -> AppResult<String> {
        self.replies
            .pop_front()
            .ok_or_else(|| MicroscopeError::Protocol("no reply from device".to_string()))
    }
}
