use fl_domain::Error;

/// Map reqwest transport failures to the shared error type. Connection
/// and timeout problems are transient; anything else is an HTTP error.
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() {
        Error::LlmTransient(mask_secrets(&e.to_string()))
    } else {
        Error::Http(mask_secrets(&e.to_string()))
    }
}

/// Classify a provider HTTP status: 429 and 5xx are retryable, 401/403
/// mean the credentials are bad, everything else is a contract failure.
pub(crate) fn status_error(provider: &str, status: reqwest::StatusCode, body: &str) -> Error {
    let detail = format!("{provider}: HTTP {status}: {}", mask_secrets(body));
    if status.as_u16() == 429 || status.is_server_error() {
        Error::LlmTransient(detail)
    } else if status.as_u16() == 401 || status.as_u16() == 403 {
        Error::LlmProtocol(format!("{provider}: invalid credentials (HTTP {status})"))
    } else {
        Error::LlmProtocol(detail)
    }
}

/// Mask substrings that look like API keys or bearer tokens in an error
/// message so raw secrets never reach logs or API responses.
pub fn mask_secrets(msg: &str) -> String {
    let mut result = msg.to_string();
    for word in msg.split(|c: char| c.is_whitespace() || c == '\'' || c == '"' || c == ',') {
        let trimmed = word.trim();
        if trimmed.len() >= 20
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            let masked = format!("{}...{}", &trimmed[..4], &trimmed[trimmed.len() - 4..]);
            result = result.replace(trimmed, &masked);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_long_tokens() {
        let msg = "auth failed for key sk-proj-abcdefghijklmnop1234";
        let masked = mask_secrets(msg);
        assert!(!masked.contains("abcdefghijklmnop"));
        assert!(masked.contains("..."));
    }

    #[test]
    fn leaves_short_words_alone() {
        assert_eq!(mask_secrets("connection refused"), "connection refused");
    }

    #[test]
    fn rate_limit_is_transient() {
        let e = status_error("openai", reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(e.is_retryable());
    }

    #[test]
    fn bad_auth_is_protocol() {
        let e = status_error("openai", reqwest::StatusCode::UNAUTHORIZED, "nope");
        assert!(!e.is_retryable());
        assert_eq!(e.kind(), "llm_protocol");
    }
}
