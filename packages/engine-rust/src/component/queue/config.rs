use std::fmt;

/// How replies to InOut requests are received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyToType {
    /// One shared, long-lived reply queue per `replyTo` name, multiplexed
    /// by correlation id.
    Exclusive,
    /// A queue provisioned per request and deleted afterwards.
    Temporary,
}

impl ReplyToType {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "exclusive" => Some(Self::Exclusive),
            "temporary" => Some(Self::Temporary),
            _ => None,
        }
    }
}

impl fmt::Display for ReplyToType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exclusive => f.write_str("Exclusive"),
            Self::Temporary => f.write_str("Temporary"),
        }
    }
}

/// Component-wide defaults for `queue:` endpoints. Endpoint options win.
#[derive(Debug, Clone)]
pub struct QueueComponentConfig {
    /// Capacity of every queue in the broker.
    pub capacity: usize,
    pub concurrent_consumers: usize,
    /// `None` uses the context's default request timeout.
    pub request_timeout_ms: Option<u64>,
    /// `None` means exclusive when a `replyTo` is configured, temporary otherwise.
    pub reply_to_type: Option<ReplyToType>,
}

impl Default for QueueComponentConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            concurrent_consumers: 1,
            request_timeout_ms: None,
            reply_to_type: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_to_type_parse() {
        assert_eq!(ReplyToType::parse("Exclusive"), Some(ReplyToType::Exclusive));
        assert_eq!(ReplyToType::parse("temporary"), Some(ReplyToType::Temporary));
        assert_eq!(ReplyToType::parse("shared"), None);
    }
}
