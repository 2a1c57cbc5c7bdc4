use thiserror::Error;

/// Engine-wide error taxonomy.
///
/// Every error carries a kind and a short cause string. Transient and
/// throttled errors are retried locally by the component that hit them;
/// validation, auth and duplicate errors bubble straight to the caller;
/// chain-terminal errors halt the affected lifecycle step.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network timeouts, abnormal WS closes, transient RPC failures.
    #[error("transient I/O: {0}")]
    Transient(String),

    /// The rate-limiter wait was aborted by shutdown/cancellation. Distinct
    /// from a transport failure: no request was ever sent.
    #[error("rate-limit wait aborted: {0}")]
    ThrottleAborted(String),

    /// Precision, min-size, missing-field, unknown tick size. Never retried.
    #[error("validation: {0}")]
    Validation(String),

    /// Missing key, bad credentials, signature failure.
    #[error("auth: {0}")]
    Auth(String),

    /// A non-terminal order with the same fingerprint already exists. Soft
    /// error: the caller may retry once the prior command resolves.
    #[error("duplicate order in flight: {0}")]
    DuplicateInFlight(String),

    /// Upstream rejection that is expected near cycle boundaries
    /// ("trading paused", "market mismatch"); does not complete a cycle.
    #[error("fail-safe rejection: {0}")]
    FailSafe(String),

    /// On-chain receipt with status=0, or a signing failure mid-lifecycle.
    #[error("chain terminal: {0}")]
    ChainTerminal(String),

    /// Non-2xx HTTP response with the body preserved for diagnostics.
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },

    /// JSON decode failure with a body preview.
    #[error("json decode ({context}): {preview}")]
    Decode { context: String, preview: String },
}

impl EngineError {
    /// Classify an upstream rejection message. Rejections emitted around
    /// cycle boundaries are expected and must not count as completion.
    pub fn from_rejection(msg: &str) -> Self {
        let lower = msg.to_ascii_lowercase();
        if lower.contains("trading paused") || lower.contains("market mismatch") {
            EngineError::FailSafe(msg.to_string())
        } else {
            EngineError::Validation(msg.to_string())
        }
    }

    pub fn is_fail_safe(&self) -> bool {
        matches!(self, EngineError::FailSafe(_))
    }

    /// Whether a local bounded-backoff retry is appropriate.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation(_))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Transient(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Truncate a response body for inclusion in decode errors, keeping the
/// cut on a char boundary.
pub fn body_preview(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_classification() {
        assert!(EngineError::from_rejection("Trading Paused for market").is_fail_safe());
        assert!(EngineError::from_rejection("order market mismatch").is_fail_safe());

        let other = EngineError::from_rejection("invalid size");
        assert!(!other.is_fail_safe());
        assert!(other.is_validation());
    }

    #[test]
    fn preview_truncates_long_bodies() {
        let long = "x".repeat(500);
        let preview = body_preview(&long);
        assert!(preview.chars().count() <= 201);
        assert!(preview.ends_with('…'));
        assert_eq!(body_preview("short"), "short");
    }

    #[test]
    fn preview_respects_char_boundaries() {
        // Multi-byte chars straddling the cut must not panic.
        let long = "é".repeat(300);
        let preview = body_preview(&long);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn http_errors_carry_status_and_body() {
        let err = EngineError::Http {
            status: 429,
            body: "too many requests".into(),
        };
        let text = err.to_string();
        assert!(text.contains("429"));
        assert!(text.contains("too many requests"));
    }

    #[test]
    fn transient_is_retryable_and_others_are_not() {
        assert!(EngineError::Transient("timeout".into()).is_transient());
        assert!(!EngineError::Auth("bad key".into()).is_transient());
        assert!(!EngineError::ThrottleAborted("clob:order:post".into()).is_transient());
        assert!(!EngineError::ChainTerminal("status=0".into()).is_transient());
    }
}
