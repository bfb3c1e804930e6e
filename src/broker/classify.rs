// =============================================================================
// Failure classification and retry backoff for broker REST calls
// =============================================================================
//
// Maps transport errors and HTTP responses onto the engine error taxonomy so
// the client's retry loop can act mechanically. Transient failures retry up
// to three times with jittered exponential backoff (base 750 ms, factor 2).
// =============================================================================

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;

use crate::error::EngineError;

/// Maximum attempts for a retryable call (initial try + 2 retries).
pub const MAX_ATTEMPTS: u32 = 3;

/// Base delay for the first retry.
pub const BACKOFF_BASE: Duration = Duration::from_millis(750);

/// Classify a transport-level failure (no HTTP response received).
pub fn classify_request_error(err: &reqwest::Error) -> EngineError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        EngineError::Transient(err.to_string())
    } else {
        EngineError::Transient(format!("http: {err}"))
    }
}

/// Classify an HTTP response by status code and (already-parsed) body.
///
/// Business rejections carry the broker's `errorCode` / `errorMessage` fields
/// when present so callers can match specific codes such as
/// `BRACKETS_DISABLED`.
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &serde_json::Value,
) -> EngineError {
    match status {
        StatusCode::UNAUTHORIZED => EngineError::AuthExpired,
        StatusCode::TOO_MANY_REQUESTS => EngineError::RateLimited { retry_after },
        StatusCode::NOT_FOUND => EngineError::NotFound(
            body["errorMessage"]
                .as_str()
                .unwrap_or("entity not found")
                .to_string(),
        ),
        s if s.is_client_error() => EngineError::Rejected {
            code: body["errorCode"].as_str().map(str::to_string),
            message: body["errorMessage"]
                .as_str()
                .unwrap_or("request rejected")
                .to_string(),
        },
        s => EngineError::Transient(format!("server returned {s}")),
    }
}

/// Delay before retry number `attempt` (zero-based): base × 2^attempt plus
/// up to 250 ms of jitter. A server-advised delay takes precedence.
pub fn backoff_delay(attempt: u32, server_hint: Option<Duration>) -> Duration {
    if let Some(hint) = server_hint {
        return hint;
    }
    let base = BACKOFF_BASE * 2u32.saturating_pow(attempt);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    base + jitter
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_classification() {
        let empty = json!({});

        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, &empty),
            EngineError::AuthExpired
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None, &empty),
            EngineError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, &empty),
            EngineError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, None, &empty),
            EngineError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, &empty),
            EngineError::Transient(_)
        ));
    }

    #[test]
    fn rejection_carries_broker_code() {
        let body = json!({
            "errorCode": "BRACKETS_DISABLED",
            "errorMessage": "brackets not enabled for this account"
        });
        let err = classify_status(StatusCode::BAD_REQUEST, None, &body);
        assert!(err.is_brackets_disabled());
        match err {
            EngineError::Rejected { code, message } => {
                assert_eq!(code.as_deref(), Some("BRACKETS_DISABLED"));
                assert!(message.contains("not enabled"));
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn rate_limit_keeps_server_hint() {
        let hint = Duration::from_secs(7);
        match classify_status(StatusCode::TOO_MANY_REQUESTS, Some(hint), &json!({})) {
            EngineError::RateLimited { retry_after } => assert_eq!(retry_after, Some(hint)),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn backoff_grows_exponentially_with_jitter() {
        for attempt in 0..3 {
            let base = BACKOFF_BASE * 2u32.pow(attempt);
            let d = backoff_delay(attempt, None);
            assert!(d >= base, "attempt {attempt}: {d:?} < {base:?}");
            assert!(d < base + Duration::from_millis(250));
        }
        // Later attempts never back off less than earlier ones (minus jitter).
        assert!(backoff_delay(2, None) > backoff_delay(0, None));
    }

    #[test]
    fn backoff_prefers_server_hint() {
        let hint = Duration::from_secs(9);
        assert_eq!(backoff_delay(0, Some(hint)), hint);
    }
}
