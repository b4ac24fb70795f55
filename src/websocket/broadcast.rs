use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone};

use crate::config::DEFAULT_TIMESTAMP_FORMAT;

pub const SEPARATOR: &str = " ===>>> ";

/// `"<timestamp> [<sender>] ===>>> <payload>"`
pub fn format_broadcast(timestamp: &str, sender: &str, payload: &str) -> String {
    format!("{timestamp} [{sender}]{SEPARATOR}{payload}")
}

/// A text message on its way to every connection in the group.
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    sender: String,
    payload: String,
    text: Arc<str>,
}

impl BroadcastMessage {
    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// The formatted text, shared by every recipient.
    pub fn text(&self) -> Arc<str> {
        Arc::clone(&self.text)
    }
}

#[derive(Debug, Clone)]
pub struct BroadcastFormatter {
    timestamp_format: String,
}

impl BroadcastFormatter {
    /// `timestamp_format` is a chrono strftime pattern, validated when
    /// settings are loaded.
    pub fn new(timestamp_format: impl Into<String>) -> Self {
        Self {
            timestamp_format: timestamp_format.into(),
        }
    }

    pub fn format<Tz>(&self, sender: &str, payload: &str, at: &DateTime<Tz>) -> String
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let timestamp = at.format(&self.timestamp_format).to_string();
        format_broadcast(&timestamp, sender, payload)
    }

    pub fn message_at<Tz>(&self, sender: &str, payload: &str, at: &DateTime<Tz>) -> BroadcastMessage
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        BroadcastMessage {
            sender: sender.to_string(),
            payload: payload.to_string(),
            text: Arc::from(self.format(sender, payload, at)),
        }
    }

    /// Stamps with the server's local clock.
    pub fn message(&self, sender: &str, payload: &str) -> BroadcastMessage {
        self.message_at(sender, payload, &Local::now())
    }
}

impl Default for BroadcastFormatter {
    fn default() -> Self {
        Self::new(DEFAULT_TIMESTAMP_FORMAT)
    }
}
