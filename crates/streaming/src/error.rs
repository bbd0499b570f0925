/// Failure of a single network attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Connection, DNS or body-read failure.
    Transport(String),
    Timeout,
    /// Non-success HTTP status.
    Status(u16),
}

impl FetchError {
    /// Whether another attempt may succeed. 4xx responses never do.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport(_) | FetchError::Timeout => true,
            FetchError::Status(status) => *status >= 500,
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Transport(msg) => write!(f, "transport error: {msg}"),
            FetchError::Timeout => write!(f, "request timed out"),
            FetchError::Status(status) => write!(f, "HTTP status {status}"),
        }
    }
}

impl std::error::Error for FetchError {}

/// Outcome of a coordinated load that did not produce a payload.
///
/// `Clone` because one failed fetch is delivered to every caller attached to
/// it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Transient failure that survived every retry.
    Network {
        url: String,
        message: String,
        attempts: u32,
    },
    /// Permanent HTTP failure; never retried.
    Http { url: String, status: u16 },
    /// The response arrived but was not the expected JSON document.
    Decode { url: String, message: String },
    /// The load was cancelled or superseded. Not a failure.
    Cancelled,
    /// The coordinator was shut down.
    Shutdown,
}

impl LoadError {
    pub fn from_fetch(url: &str, err: FetchError, attempts: u32) -> Self {
        match err {
            FetchError::Status(status) if status < 500 => LoadError::Http {
                url: url.to_string(),
                status,
            },
            other => LoadError::Network {
                url: url.to_string(),
                message: other.to_string(),
                attempts,
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, LoadError::Network { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoadError::Cancelled | LoadError::Shutdown)
    }
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Network {
                url,
                message,
                attempts,
            } => write!(f, "network error for {url} after {attempts} attempt(s): {message}"),
            LoadError::Http { url, status } => write!(f, "HTTP {status} for {url}"),
            LoadError::Decode { url, message } => write!(f, "invalid payload from {url}: {message}"),
            LoadError::Cancelled => write!(f, "load cancelled"),
            LoadError::Shutdown => write!(f, "cache coordinator is shut down"),
        }
    }
}

impl std::error::Error for LoadError {}

/// Persistent cache backend failure. Logged, never surfaced as a load failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Io(String),
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(msg) => write!(f, "cache store error: {msg}"),
            StoreError::Corrupt(msg) => write!(f, "cache store corrupt: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// A response document that is not the expected GeoJSON shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub message: String,
}

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn into_load_error(self, url: &str) -> LoadError {
        LoadError::Decode {
            url: url.to_string(),
            message: self.message,
        }
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "decode error: {}", self.message)
    }
}

impl std::error::Error for DecodeError {}

#[cfg(test)]
mod tests {
    use super::{FetchError, LoadError};

    #[test]
    fn client_errors_are_permanent() {
        assert!(!FetchError::Status(404).is_transient());
        assert!(!FetchError::Status(429).is_transient());
        assert!(FetchError::Status(503).is_transient());
        assert!(FetchError::Timeout.is_transient());
    }

    #[test]
    fn fetch_errors_map_to_taxonomy() {
        let http = LoadError::from_fetch("u", FetchError::Status(404), 1);
        assert_eq!(
            http,
            LoadError::Http {
                url: "u".into(),
                status: 404
            }
        );
        let net = LoadError::from_fetch("u", FetchError::Status(502), 4);
        assert!(net.is_transient());
        assert!(!LoadError::Cancelled.is_transient());
        assert!(LoadError::Cancelled.is_cancelled());
    }
}
