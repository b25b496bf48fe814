use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Classification of a dispatch failure.
///
/// The distinction that matters most to the cluster strategies is
/// [`ErrorKind::Biz`]: an error raised by the remote application itself is a
/// valid outcome of the call and is never retried, unlike transport-level
/// failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport failure; retriable.
    Network,
    /// Deadline exceeded; retriable.
    Timeout,
    /// Raised by the application at the remote side; never retried.
    Biz,
    /// Policy rejection.
    Forbidden,
    /// The directory produced an empty endpoint list.
    NoProvider,
    /// Invalid rule, missing extension or bad url.
    Config,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network failure",
            ErrorKind::Timeout => "deadline exceeded",
            ErrorKind::Biz => "business exception",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NoProvider => "no provider available",
            ErrorKind::Config => "configuration error",
            ErrorKind::Unknown => "unknown error",
        }
    }
}

/// The error type flowing out of [`Endpoint::invoke`](crate::endpoint::Endpoint::invoke)
/// and every cluster strategy.
#[derive(Debug, Error)]
#[error("{}, msg: {}", .kind.as_str(), .message)]
pub struct RpcError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn biz(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Biz, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn no_provider(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoProvider, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[inline]
    pub fn is_biz(&self) -> bool {
        self.kind == ErrorKind::Biz
    }
}

/// Whether an error may be transparently retried on another endpoint.
pub trait Retryable {
    fn retryable(&self) -> bool {
        false
    }
}

impl Retryable for RpcError {
    fn retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Network | ErrorKind::Timeout)
    }
}
