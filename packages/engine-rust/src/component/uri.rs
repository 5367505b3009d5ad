//! Endpoint URI parsing, normalization and option validation.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use mediator_core::MediationError;
use regex::Regex;

/// `scheme:path?query`, with an optional `//` after the colon.
fn uri_pattern() -> Result<&'static Regex, MediationError> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^([A-Za-z][A-Za-z0-9+.\-]*):(?://)?([^?]*)(?:\?(.*))?$"))
        .as_ref()
        .map_err(|e| MediationError::UnsupportedUri {
            uri: String::new(),
            reason: e.to_string(),
        })
}

/// Parsed endpoint URI.
///
/// The scheme is lowercased; options are kept sorted by key so that
/// [`normalized`](Self::normalized) is stable regardless of input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUri {
    scheme: String,
    path: String,
    options: BTreeMap<String, String>,
}

impl EndpointUri {
    /// Parses `scheme:path?key=value&...`.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedUri` when the scheme or path is missing, or an
    /// option has no key.
    pub fn parse(uri: &str) -> Result<Self, MediationError> {
        let unsupported = |reason: &str| MediationError::UnsupportedUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let captures = uri_pattern()?
            .captures(uri.trim())
            .ok_or_else(|| unsupported("expected scheme:path"))?;

        let scheme = captures
            .get(1)
            .map(|m| m.as_str().to_ascii_lowercase())
            .ok_or_else(|| unsupported("missing scheme"))?;
        let path = captures
            .get(2)
            .map(|m| m.as_str().to_string())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| unsupported("missing path"))?;

        let mut options = BTreeMap::new();
        if let Some(query) = captures.get(3) {
            for pair in query.as_str().split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                if key.is_empty() {
                    return Err(unsupported("option without a name"));
                }
                options.insert(key.to_string(), value.to_string());
            }
        }

        Ok(Self {
            scheme,
            path,
            options,
        })
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// Merges programmatic options; they override query-string values.
    #[must_use]
    pub fn with_options<K, V>(mut self, options: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in options {
            self.options.insert(k.into(), v.into());
        }
        self
    }

    /// Identity used for the endpoint cache.
    #[must_use]
    pub fn normalized(&self) -> String {
        let mut out = format!("{}:{}", self.scheme, self.path);
        let mut separator = '?';
        for (key, value) in &self.options {
            out.push(separator);
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            separator = '&';
        }
        out
    }
}

impl fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized())
    }
}

impl FromStr for EndpointUri {
    type Err = MediationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// EndpointOptions
// ---------------------------------------------------------------------------

/// Consumes the options of an endpoint URI one key at a time.
///
/// Components take every option they understand, then call
/// [`finish`](Self::finish); anything left over is an unsupported option.
#[derive(Debug)]
pub struct EndpointOptions {
    uri: String,
    remaining: BTreeMap<String, String>,
}

impl EndpointOptions {
    #[must_use]
    pub fn new(uri: &EndpointUri) -> Self {
        Self {
            uri: uri.normalized(),
            remaining: uri.options().clone(),
        }
    }

    pub fn take_string(&mut self, key: &str) -> Option<String> {
        self.remaining.remove(key)
    }

    /// Takes and parses an option.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOption` if the value does not parse as `T`.
    pub fn take_parsed<T: FromStr>(&mut self, key: &str) -> Result<Option<T>, MediationError> {
        self.take_with(key, |raw| raw.parse::<T>().ok())
    }

    /// Takes an option and maps it with `parse`; `None` from `parse` means
    /// the value is invalid.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOption` if `parse` rejects the value.
    pub fn take_with<T>(
        &mut self,
        key: &str,
        parse: impl FnOnce(&str) -> Option<T>,
    ) -> Result<Option<T>, MediationError> {
        let Some(raw) = self.remaining.remove(key) else {
            return Ok(None);
        };
        parse(&raw)
            .map(Some)
            .ok_or_else(|| MediationError::InvalidOption {
                uri: self.uri.clone(),
                option: key.to_string(),
                value: raw,
            })
    }

    /// Builds an `InvalidOption` error for a value that parsed but is out of range.
    #[must_use]
    pub fn invalid(&self, key: &str, value: impl fmt::Display) -> MediationError {
        MediationError::InvalidOption {
            uri: self.uri.clone(),
            option: key.to_string(),
            value: value.to_string(),
        }
    }

    /// # Errors
    ///
    /// Returns `UnsupportedOption` naming the first option nobody consumed.
    pub fn finish(self) -> Result<(), MediationError> {
        match self.remaining.into_keys().next() {
            Some(option) => Err(MediationError::UnsupportedOption {
                uri: self.uri,
                option,
            }),
            None => Ok(()),
        }
    }
}
