// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! Logging facade feeding both the tracing subscriber and the in-memory history.

use std::sync::Arc;

use chrono::Utc;

use crate::log_history::{Level, LogHistory, Message, TOPIC_GLOBAL};

/// Cheaply clonable logging handle.
///
/// Every message is forwarded to the global tracing subscriber and, for retained levels,
/// recorded in the shared [`LogHistory`] under its topic.
#[derive(Debug, Clone)]
pub struct Log {
    history: Arc<LogHistory>,
}

impl Log {
    /// Creates a log writing into `history`.
    pub fn new(history: Arc<LogHistory>) -> Self {
        Self { history }
    }

    /// The underlying history, for search queries.
    pub fn history(&self) -> &Arc<LogHistory> {
        &self.history
    }

    /// Records a message at the given level.
    pub fn record(&self, level: Level, topic: &str, text: impl Into<String>) {
        let text = text.into();
        match level {
            Level::Trace => tracing::trace!(topic, "{text}"),
            Level::Info | Level::Success => tracing::info!(topic, "{text}"),
            Level::Warning => tracing::warn!(topic, "{text}"),
            Level::Error | Level::Failure => tracing::error!(topic, "{text}"),
            Level::NoOp => tracing::debug!(topic, "{text}"),
        }
        self.history.push(Message {
            time: Utc::now(),
            level,
            topic: topic.to_string(),
            text,
        });
    }

    /// Records an informational message.
    pub fn info(&self, topic: &str, text: impl Into<String>) {
        self.record(Level::Info, topic, text);
    }

    /// Records a warning.
    pub fn warning(&self, topic: &str, text: impl Into<String>) {
        self.record(Level::Warning, topic, text);
    }

    /// Records an error.
    pub fn error(&self, topic: &str, text: impl Into<String>) {
        self.record(Level::Error, topic, text);
    }

    /// Records the successful completion of a long-running operation.
    pub fn success(&self, topic: &str, text: impl Into<String>) {
        self.record(Level::Success, topic, text);
    }

    /// Records the definitive failure of a long-running operation.
    pub fn failure(&self, topic: &str, text: impl Into<String>) {
        self.record(Level::Failure, topic, text);
    }

    /// Records a trace message (tracing subscriber only, never retained).
    pub fn trace(&self, topic: &str, text: impl Into<String>) {
        self.record(Level::Trace, topic, text);
    }

    /// Records a global informational message.
    pub fn info_global(&self, text: impl Into<String>) {
        self.record(Level::Info, TOPIC_GLOBAL, text);
    }

    /// Records a global error.
    pub fn error_global(&self, text: impl Into<String>) {
        self.record(Level::Error, TOPIC_GLOBAL, text);
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new(Arc::new(LogHistory::default()))
    }
}
