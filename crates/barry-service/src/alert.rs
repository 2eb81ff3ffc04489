// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! Operator alerting.
//!
//! Delivery is fire-and-forget: the daemon never blocks on, or retries, an alert. Without an
//! `[smtp]` section in the configuration, alerts only land in the log, which keeps development
//! and test setups mail-free.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use barry_core::Log;
use lettre::{
    message::Mailbox, transport::smtp::AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
};
use serde::{Deserialize, Serialize};

/// Whether the alert reports something working or something broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Good news (daily stats, recovered states).
    Good,
    /// Bad news (failures, missing backups).
    Bad,
}

/// A single operator alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    /// Good or bad news.
    pub kind: AlertKind,
    /// Subject line.
    pub subject: String,
    /// Body.
    pub content: String,
}

/// Transport delivering alerts to the operator.
#[async_trait]
pub trait AlertSender: Send + Sync + fmt::Debug {
    /// Delivers one alert.
    async fn send(&self, alert: Alert) -> anyhow::Result<()>;
}

/// SMTP settings for the [`SmtpAlertSender`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmtpConfig {
    /// Relay host name.
    pub server: String,
    /// Relay port.
    #[serde(default = "defaults::port")]
    pub port: u16,
    /// Sender address.
    pub from: String,
    /// Recipient address.
    pub to: String,
}

/// SMTP configuration defaults.
pub mod defaults {
    /// Default SMTP relay port.
    pub fn port() -> u16 {
        25
    }
}

/// Alert sender delivering mails through an SMTP relay.
#[derive(Debug)]
pub struct SmtpAlertSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl SmtpAlertSender {
    /// Builds a sender from configuration; address parse errors are fatal at startup.
    pub fn new(config: &SmtpConfig) -> anyhow::Result<Self> {
        Ok(Self {
            transport: AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.server)
                .port(config.port)
                .build(),
            from: config.from.parse()?,
            to: config.to.parse()?,
        })
    }
}

#[async_trait]
impl AlertSender for SmtpAlertSender {
    async fn send(&self, alert: Alert) -> anyhow::Result<()> {
        let prefix = match alert.kind {
            AlertKind::Good => "[GOOD]",
            AlertKind::Bad => "[BAD]",
        };
        let email = lettre::Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(format!("{prefix} {}", alert.subject))
            .body(alert.content)?;
        self.transport.send(email).await?;
        Ok(())
    }
}

/// Alert sender that only logs; used when no SMTP relay is configured, and in tests.
#[derive(Debug, Default)]
pub struct LogAlertSender;

#[async_trait]
impl AlertSender for LogAlertSender {
    async fn send(&self, alert: Alert) -> anyhow::Result<()> {
        tracing::info!(
            kind = ?alert.kind,
            subject = %alert.subject,
            "alert (no SMTP relay configured): {}",
            alert.content
        );
        Ok(())
    }
}

/// Alert sender pushing into a channel, for assertions in tests.
#[derive(Debug, Clone)]
pub struct ChannelAlertSender {
    tx: tokio::sync::mpsc::UnboundedSender<Alert>,
}

impl ChannelAlertSender {
    /// Creates the sender and the receiving end.
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AlertSender for ChannelAlertSender {
    async fn send(&self, alert: Alert) -> anyhow::Result<()> {
        self.tx.send(alert)?;
        Ok(())
    }
}

/// Cheaply clonable fire-and-forget dispatcher in front of an [`AlertSender`].
#[derive(Debug, Clone)]
pub struct Alerter {
    sender: Arc<dyn AlertSender>,
    log: Log,
}

impl Alerter {
    /// Creates a dispatcher around `sender`.
    pub fn new(sender: Arc<dyn AlertSender>, log: Log) -> Self {
        Self { sender, log }
    }

    /// Dispatches an alert on a detached task; delivery failures are logged, never propagated.
    pub fn send(&self, alert: Alert) {
        let sender = self.sender.clone();
        let log = self.log.clone();
        tokio::spawn(async move {
            let subject = alert.subject.clone();
            if let Err(error) = sender.send(alert).await {
                log.error_global(format!("failed to deliver alert '{subject}': {error}"));
            }
        });
    }

    /// Shorthand for a bad-news alert.
    pub fn bad(&self, subject: impl Into<String>, content: impl Into<String>) {
        self.send(Alert {
            kind: AlertKind::Bad,
            subject: subject.into(),
            content: content.into(),
        });
    }

    /// Shorthand for a good-news alert.
    pub fn good(&self, subject: impl Into<String>, content: impl Into<String>) {
        self.send(Alert {
            kind: AlertKind::Good,
            subject: subject.into(),
            content: content.into(),
        });
    }
}
