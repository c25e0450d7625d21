use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// Boxed error type returned by subscription data handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error produced by a subscription session.
///
/// The session classifies these into retryable and fatal when deciding
/// whether to reconnect; see the crate docs for the classification rules.
#[derive(Debug)]
pub enum Error {
    /// A retry status code entry could not be parsed.
    InvalidStatusCode {
        /// The offending input, verbatim.
        input: String,
    },
    /// A configuration value is unusable. Recorded when the configurator
    /// runs and surfaced by `run`.
    Config(String),
    /// The subscription request payload has no query.
    MalformedQuery,
    /// `run` was called while the session was already running.
    AlreadyRunning,
    /// A subscription key was already registered.
    DuplicateKey(String),
    /// A subscription key is not present in the registry.
    UnknownKey(String),
    /// Dialing the endpoint or the WebSocket upgrade failed.
    Connect(tungstenite::Error),
    /// The server did not acknowledge `connection_init` in time.
    AckTimeout,
    /// The socket failed mid-session.
    Transport(tungstenite::Error),
    /// The peer closed the socket with a status code.
    CloseStatus {
        /// WebSocket close status code.
        code: u16,
        /// Close reason as sent by the peer, possibly empty.
        reason: String,
    },
    /// No server keep-alive arrived within the liveness window.
    KeepAliveTimeout(Duration),
    /// The server rejected the connection at the protocol level
    /// (`connection_error` in subscriptions-transport-ws).
    Server(String),
    /// A frame could not be decoded, or violated the protocol state.
    Protocol(String),
    /// An operation-level error for a single subscription, delivered to
    /// that subscription's handler.
    Operation(String),
    /// A data handler returned an error, terminating the session.
    Handler(BoxError),
    /// The reconnect budget was exhausted.
    RetriesExhausted {
        /// Time spent reconnecting before giving up.
        elapsed: Duration,
        /// The error observed on the final attempt.
        last: Box<Error>,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidStatusCode { input } => {
                write!(f, "invalid status code; input: {input}")
            }
            Error::Config(msg) => write!(f, "{msg}"),
            Error::MalformedQuery => write!(f, "malformed query: request payload has no query"),
            Error::AlreadyRunning => write!(f, "session is already running"),
            Error::DuplicateKey(key) => write!(f, "duplicate subscription key: {key}"),
            Error::UnknownKey(key) => write!(f, "unknown subscription key: {key}"),
            Error::Connect(e) => write!(f, "connect failed: {e}"),
            Error::AckTimeout => write!(f, "timed out waiting for connection_ack"),
            Error::Transport(e) => write!(f, "transport error: {e}"),
            Error::CloseStatus { code, reason } => {
                if reason.is_empty() {
                    write!(f, "websocket close status {code}")
                } else {
                    write!(f, "{reason}")
                }
            }
            Error::KeepAliveTimeout(window) => {
                write!(f, "no keep-alive received within {window:?}")
            }
            Error::Server(msg) => write!(f, "{msg}"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::Operation(msg) => write!(f, "{msg}"),
            Error::Handler(e) => write!(f, "{e}"),
            Error::RetriesExhausted { elapsed, last } => {
                write!(f, "reconnection gave up after {elapsed:?}: {last}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connect(e) | Error::Transport(e) => Some(e),
            Error::Handler(e) => Some(e.as_ref()),
            Error::RetriesExhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_status_displays_reason_verbatim() {
        let err = Error::CloseStatus {
            code: 4400,
            reason: "invalid x-hasura-admin-secret/x-hasura-access-key".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid x-hasura-admin-secret/x-hasura-access-key"
        );

        let bare = Error::CloseStatus {
            code: 4403,
            reason: String::new(),
        };
        assert_eq!(bare.to_string(), "websocket close status 4403");
    }

    #[test]
    fn handler_error_is_transparent() {
        let err = Error::Handler("exit".into());
        assert_eq!(err.to_string(), "exit");
    }

    #[test]
    fn invalid_status_code_message_matches_parser_contract() {
        let err = Error::InvalidStatusCode {
            input: "a".to_string(),
        };
        assert_eq!(err.to_string(), "invalid status code; input: a");
    }
}
