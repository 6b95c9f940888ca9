/// Cause of a session ending without a completed response.
///
/// `Transport` and `Upstream` arrive from the transport as terminal error
/// events and are handed to [`crate::stream::StreamHandler::on_error`].
/// `Cancelled` and `TimedOut` are only ever observed through a
/// [`crate::stream::CompletionHandle`]; no callback is issued for them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Stream cancelled by caller")]
    Cancelled,
    #[error("Stream timed out waiting for events")]
    TimedOut,
}

/// Broad error category, mirrored into replay summaries and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transport,
    RateLimit,
    ServerError,
    ClientError,
    Abandoned,
}

impl ErrorCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Transport => "transport",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::Abandoned => "abandoned",
        }
    }
}

/// Map an upstream HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        429 => ErrorCategory::RateLimit,
        500..=599 => ErrorCategory::ServerError,
        _ => ErrorCategory::ClientError,
    }
}

impl StreamError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            StreamError::Transport(_) => ErrorCategory::Transport,
            StreamError::Upstream { status, .. } => category_from_upstream_status(*status),
            StreamError::Cancelled | StreamError::TimedOut => ErrorCategory::Abandoned,
        }
    }

    /// Whether the error was reported by the transport, as opposed to the
    /// caller abandoning the session.
    #[must_use]
    pub fn is_transport_reported(&self) -> bool {
        matches!(
            self,
            StreamError::Transport(_) | StreamError::Upstream { .. }
        )
    }
}

/// Invalid reasoning/answer tag configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TagError {
    #[error("Tag name cannot be empty")]
    Empty,
    #[error("Tag name {name:?} contains invalid character {found:?}")]
    InvalidCharacter { name: String, found: char },
    #[error("Start and end tags must differ, both are {0:?}")]
    SameTags(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_categories() {
        assert_eq!(category_from_upstream_status(429), ErrorCategory::RateLimit);
        assert_eq!(category_from_upstream_status(503), ErrorCategory::ServerError);
        assert_eq!(category_from_upstream_status(400), ErrorCategory::ClientError);
    }

    #[test]
    fn abandoned_errors_are_not_transport_reported() {
        assert!(!StreamError::Cancelled.is_transport_reported());
        assert!(!StreamError::TimedOut.is_transport_reported());
        assert!(StreamError::Transport("reset".into()).is_transport_reported());
        assert_eq!(StreamError::TimedOut.category(), ErrorCategory::Abandoned);
    }

    #[test]
    fn display_includes_status() {
        let err = StreamError::Upstream {
            status: 502,
            message: "bad gateway".into(),
        };
        assert_eq!(
            err.to_string(),
            "Upstream error: status=502, message=bad gateway"
        );
    }
}
