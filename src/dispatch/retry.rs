//! Retry policy: advance to the next endpoint only for connection-class
//! failures that occurred before any request body bytes were sent
//! upstream.

use crate::errors::DispatchError;

/// Whether the dispatcher should attempt the next endpoint after `error`,
/// given whether the upstream round-trip had already sent body bytes.
pub fn should_retry(error: &DispatchError, body_sent: bool) -> bool {
    error.is_retryable_connection_error() && !body_sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn connection_error() -> DispatchError {
        DispatchError::Connection {
            endpoint: "e1".to_string(),
            elapsed: Duration::from_millis(5),
            message: "connection refused".to_string(),
        }
    }

    #[test]
    fn retries_connection_error_with_unreplayed_body() {
        assert!(should_retry(&connection_error(), false));
    }

    #[test]
    fn never_retries_once_body_bytes_were_sent() {
        assert!(!should_retry(&connection_error(), true));
    }

    #[test]
    fn never_retries_stream_errors() {
        let err = DispatchError::Stream {
            phase: "streaming",
            elapsed: Duration::from_millis(5),
            message: "reset".to_string(),
        };
        assert!(!should_retry(&err, false));
    }

    #[test]
    fn never_retries_read_timeouts() {
        let err = DispatchError::ReadTimeout {
            endpoint: "e1".to_string(),
            elapsed: Duration::from_millis(5),
        };
        assert!(!should_retry(&err, false));
    }
}
