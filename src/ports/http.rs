use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::ports::{PortError, Provider};

const ERROR_BODY_LIMIT: usize = 300;

pub fn build_client(provider: Provider, timeout_secs: u64) -> Result<Client, PortError> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|e| PortError::permanent(provider, format!("http client init failed: {e}")))
}

pub fn classify_send_error(provider: Provider, error: &reqwest::Error) -> PortError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        PortError::transient(provider, format!("request failed: {error}"))
    } else {
        PortError::permanent(provider, format!("request failed: {error}"))
    }
}

pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

pub fn classify_status(provider: Provider, status: StatusCode, body: &str) -> PortError {
    let message = format!("HTTP {}: {}", status.as_u16(), bounded(body, ERROR_BODY_LIMIT));
    if is_transient_status(status) {
        PortError::transient(provider, message)
    } else {
        PortError::permanent(provider, message)
    }
}

/// Turns a non-success status into a classified error and decodes the body
/// otherwise.
pub fn read_json<T>(provider: Provider, response: Response) -> Result<T, PortError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(classify_status(provider, status, body.as_str()));
    }
    response
        .json::<T>()
        .map_err(|e| PortError::permanent(provider, format!("JSON decode failed: {e}")))
}

pub fn bounded(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let mut out = value.chars().take(limit).collect::<String>();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortErrorKind;

    #[test]
    fn rate_limits_and_server_errors_are_transient() {
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::REQUEST_TIMEOUT,
        ] {
            let err = classify_status(Provider::Copy, status, "busy");
            assert_eq!(err.kind, PortErrorKind::Transient, "{status}");
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        let err = classify_status(Provider::Storefront, StatusCode::UNAUTHORIZED, "bad token");
        assert_eq!(err.kind, PortErrorKind::Permanent);
        assert!(err.message.starts_with("HTTP 401"));
    }

    #[test]
    fn bounded_truncates_long_bodies() {
        let long = "x".repeat(400);
        let out = bounded(long.as_str(), 10);
        assert_eq!(out.chars().count(), 11);
        assert!(out.ends_with('…'));
        assert_eq!(bounded("short", 10), "short");
    }
}
