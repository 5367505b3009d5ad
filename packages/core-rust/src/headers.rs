//! Case-insensitive header map.

use std::collections::HashMap;

use crate::value::Value;

/// Header keys reserved by the mediation core.
///
/// Every InOut-capable transport reads these on send and echoes them on reply.
pub mod names {
    /// Correlation id linking a request to its reply.
    pub const CORRELATION_ID: &str = "MediatorCorrelationId";
    /// Destination the reply must be sent to.
    pub const REPLY_TO: &str = "MediatorReplyTo";
    /// Set on a reply when the remote chain failed; carries the error text.
    pub const FAULT: &str = "MediatorFault";
}

/// Header map with case-insensitive keys.
///
/// The spelling of the first insert is kept for iteration; later inserts
/// under a differently-cased key replace the value but not the spelling.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: HashMap<String, (String, Value)>,
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn fold(key: &str) -> String {
        key.to_ascii_lowercase()
    }

    /// Inserts a header, returning the previous value under the same
    /// (case-insensitive) key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.entries.get_mut(&Self::fold(&key)) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.insert(Self::fold(&key), (key, value));
                None
            }
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(&Self::fold(key)).map(|(_, v)| v)
    }

    /// Returns the header as a string slice when it holds a `Value::String`.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(&Self::fold(key)).map(|(_, v)| v)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&Self::fold(key))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates `(original key, value)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.values().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");
        assert_eq!(headers.get_str("content-type"), Some("text/plain"));
        assert!(headers.contains("CONTENT-TYPE"));
    }

    #[test]
    fn reinsert_with_other_case_replaces_value_keeps_spelling() {
        let mut headers = Headers::new();
        headers.insert("ReplyCode", 200_i64);
        let previous = headers.insert("replycode", 226_i64);

        assert_eq!(previous, Some(Value::Int(200)));
        assert_eq!(headers.len(), 1);
        let (key, value) = headers.iter().next().unwrap();
        assert_eq!(key, "ReplyCode");
        assert_eq!(value, &Value::Int(226));
    }

    #[test]
    fn remove_is_case_insensitive() {
        let mut headers: Headers = [(names::CORRELATION_ID, "c-1")].into_iter().collect();
        assert_eq!(
            headers.remove("mediatorcorrelationid"),
            Some(Value::from("c-1"))
        );
        assert!(headers.is_empty());
    }
}
