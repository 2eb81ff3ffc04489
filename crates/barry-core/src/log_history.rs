// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! Bounded in-memory ring of typed log messages.
//!
//! The daemon keeps its most recent messages in memory so clients can query them over the API
//! without touching any log files. Trace and no-op messages are emitted to the tracing
//! subscriber but never retained here.

use std::{collections::VecDeque, sync::Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topic matching any query (and matched by any query).
pub const TOPIC_GLOBAL: &str = ".GLOBAL";

/// Default ring capacity.
pub const DEFAULT_HISTORY_SIZE: usize = 5000;

/// Maximum retained message length; longer texts are truncated with an ellipsis.
const MAX_MESSAGE_LEN: usize = 256;

/// Severity of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    /// Verbose diagnostics; not retained in the history.
    Trace,
    /// Routine operational messages.
    Info,
    /// Something unusual that does not affect correctness.
    Warning,
    /// An operation failed.
    Error,
    /// A long-running operation completed.
    Success,
    /// A long-running operation definitively failed.
    Failure,
    /// Messages used for scheduling noise; not retained in the history.
    NoOp,
}

impl Level {
    /// Whether messages of this level are kept in the history ring.
    pub fn is_retained(self) -> bool {
        !matches!(self, Level::Trace | Level::NoOp)
    }
}

/// A single log message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// When the message was recorded.
    pub time: DateTime<Utc>,
    /// Severity.
    pub level: Level,
    /// Topic, usually a project name, or [`TOPIC_GLOBAL`].
    pub topic: String,
    /// The message text.
    pub text: String,
}

impl Message {
    /// Whether the message matches a queried topic.
    pub fn matches_topic(&self, topic: &str) -> bool {
        topic == TOPIC_GLOBAL || self.topic == TOPIC_GLOBAL || self.topic == topic
    }
}

/// Fixed-capacity ring of the most recent retained messages.
#[derive(Debug)]
pub struct LogHistory {
    max_size: usize,
    messages: Mutex<VecDeque<Message>>,
}

impl LogHistory {
    /// Creates a history retaining up to `max_size` messages.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            messages: Mutex::new(VecDeque::with_capacity(max_size.min(1024))),
        }
    }

    /// Records a message, evicting the oldest one when full.
    ///
    /// Trace and no-op messages are dropped; texts longer than 256 characters are truncated.
    pub fn push(&self, mut message: Message) {
        if !message.level.is_retained() {
            return;
        }
        if message.text.chars().count() > MAX_MESSAGE_LEN {
            message.text = message.text.chars().take(MAX_MESSAGE_LEN).collect();
            message.text.push('…');
        }

        let mut messages = self.messages.lock().expect("log history lock poisoned");
        if messages.len() == self.max_size {
            messages.pop_front();
        }
        messages.push_back(message);
    }

    /// Returns up to `max` latest messages matching `topic`, oldest first (newest last).
    pub fn search(&self, max: usize, topic: &str) -> Vec<Message> {
        let messages = self.messages.lock().expect("log history lock poisoned");
        let mut found: Vec<Message> = messages
            .iter()
            .rev()
            .filter(|message| message.matches_topic(topic))
            .take(max)
            .cloned()
            .collect();
        found.reverse();
        found
    }
}

impl Default for LogHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(level: Level, topic: &str, text: &str) -> Message {
        Message {
            time: Utc::now(),
            level,
            topic: topic.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn evicts_oldest_when_full() {
        let history = LogHistory::new(3);
        for index in 0..5 {
            history.push(message(Level::Info, "proj", &format!("msg {index}")));
        }

        let found = history.search(10, "proj");
        let texts: Vec<&str> = found.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["msg 2", "msg 3", "msg 4"]);
    }

    #[test]
    fn drops_trace_and_noop() {
        let history = LogHistory::new(10);
        history.push(message(Level::Trace, "proj", "trace"));
        history.push(message(Level::NoOp, "proj", "noop"));
        history.push(message(Level::Warning, "proj", "kept"));

        assert_eq!(history.search(10, TOPIC_GLOBAL).len(), 1);
    }

    #[test]
    fn truncates_long_messages() {
        let history = LogHistory::new(10);
        history.push(message(Level::Info, "proj", &"x".repeat(1000)));

        let found = history.search(1, "proj");
        assert_eq!(found[0].text.chars().count(), 257);
        assert!(found[0].text.ends_with('…'));
    }

    #[test]
    fn global_topic_matches_both_ways() {
        let history = LogHistory::new(10);
        history.push(message(Level::Info, TOPIC_GLOBAL, "global"));
        history.push(message(Level::Info, "proj-a", "a"));
        history.push(message(Level::Info, "proj-b", "b"));

        assert_eq!(history.search(10, TOPIC_GLOBAL).len(), 3);
        // A project query sees its own messages plus global ones.
        let texts: Vec<String> = history
            .search(10, "proj-a")
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, ["global", "a"]);
    }

    #[test]
    fn search_caps_results_at_latest() {
        let history = LogHistory::new(10);
        for index in 0..6 {
            history.push(message(Level::Info, "proj", &format!("{index}")));
        }
        let texts: Vec<String> = history
            .search(2, "proj")
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, ["4", "5"]);
    }
}
