// src/messages.rs
use serde::Serialize;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Level {
    Error,
    Warning,
    Info,
}

impl Level {
    pub fn as_str(&self) -> &str {
        match self {
            Level::Error => "E",
            Level::Warning => "W",
            Level::Info => "I",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Message {
    pub level: Level,
    pub text: String,
}

/// Ordered log of user-facing messages.
///
/// Tracks whether an error was added since the flag was last taken, which is
/// what the processing loop polls for its stop-at-error check.
#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    messages: Vec<Message>,
    error_since_check: bool,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, level: Level, text: impl Into<String>) {
        if level == Level::Error {
            self.error_since_check = true;
        }
        self.messages.push(Message {
            level,
            text: text.into(),
        });
    }

    pub fn error(&mut self, text: impl Into<String>) {
        self.add(Level::Error, text);
    }

    pub fn warn(&mut self, text: impl Into<String>) {
        self.add(Level::Warning, text);
    }

    pub fn info(&mut self, text: impl Into<String>) {
        self.add(Level::Info, text);
    }

    /// Record an error value, keeping its context chain on one line.
    pub fn report(&mut self, err: &anyhow::Error) {
        self.error(format!("{:#}", err));
    }

    /// Returns whether an error was recorded since the previous call, and resets the flag.
    pub fn take_error_flag(&mut self) -> bool {
        std::mem::take(&mut self.error_since_check)
    }

    pub fn has_errors(&self) -> bool {
        self.messages.iter().any(|m| m.level == Level::Error)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop all messages and the error flag.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.error_since_check = false;
    }
}

impl fmt::Display for MessageLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut delim = "";
        for m in &self.messages {
            write!(f, "{}[{}] {}", delim, m.level.as_str(), m.text)?;
            delim = "\n";
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_flag_is_taken_once() {
        let mut log = MessageLog::new();
        log.info("started");
        assert!(!log.take_error_flag());
        log.error("bad row");
        assert!(log.take_error_flag());
        assert!(!log.take_error_flag());
        assert!(log.has_errors());
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn display_joins_lines() {
        let mut log = MessageLog::new();
        log.warn("one");
        log.error("two");
        assert_eq!(log.to_string(), "[W] one\n[E] two");
        log.clear();
        assert!(log.is_empty());
        assert!(!log.take_error_flag());
    }
}
