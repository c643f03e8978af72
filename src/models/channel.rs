use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

/// Delivery medium selector carried on every notification.
///
/// Unrecognised selectors are kept as `Other` instead of failing to decode, so
/// the consumer can dead-letter them as unroutable rather than as malformed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Channel {
    Email,
    Telegram,
    Sms,
    Other(String),
}

impl Channel {
    pub fn as_str(&self) -> &str {
        match self {
            Channel::Email => "email",
            Channel::Telegram => "telegram",
            Channel::Sms => "sms",
            Channel::Other(name) => name,
        }
    }
}

impl From<String> for Channel {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "email" => Channel::Email,
            "telegram" | "chat-bot" => Channel::Telegram,
            "sms" => Channel::Sms,
            _ => Channel::Other(value),
        }
    }
}

impl From<&str> for Channel {
    fn from(value: &str) -> Self {
        Channel::from(value.to_string())
    }
}

impl From<Channel> for String {
    fn from(value: Channel) -> Self {
        value.as_str().to_string()
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}
