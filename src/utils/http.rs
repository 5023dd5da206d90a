// src/utils/http.rs

//! HTTP client utilities.
//!
//! Every registry request goes through [`send_checked`], which sorts
//! failures into transient (retry later) and permanent (give up) errors.

use std::fmt;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::{AppError, Result};
use crate::models::CrawlerConfig;

/// Create a configured asynchronous HTTP client.
pub fn create_async_client(config: &CrawlerConfig) -> Result<Client> {
    let client = Client::builder()
        .user_agent(&config.user_agent)
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;
    Ok(client)
}

/// Map a non-success status to a fetch error. Returns `None` for 2xx.
pub fn classify_status(source: impl fmt::Display, url: &str, status: StatusCode) -> Option<AppError> {
    if status.is_success() {
        return None;
    }
    let message = format!("{url} returned {status}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Some(AppError::transient(source, message))
    } else {
        Some(AppError::permanent(source, message))
    }
}

/// Map a transport failure to a fetch error.
pub fn classify_request_error(source: impl fmt::Display, err: &reqwest::Error) -> AppError {
    if err.is_decode() || err.is_builder() {
        AppError::permanent(source, err)
    } else {
        AppError::transient(source, err)
    }
}

/// Send a request and reject non-success statuses.
pub async fn send_checked(source: impl fmt::Display + Copy, request: RequestBuilder) -> Result<Response> {
    let response = request
        .send()
        .await
        .map_err(|e| classify_request_error(source, &e))?;
    let url = response.url().to_string();
    match classify_status(source, &url, response.status()) {
        Some(err) => Err(err),
        None => Ok(response),
    }
}

/// Fetch a URL as text.
pub async fn fetch_text(client: &Client, source: impl fmt::Display + Copy, url: &str) -> Result<String> {
    let response = send_checked(source, client.get(url)).await?;
    response
        .text()
        .await
        .map_err(|e| classify_request_error(source, &e))
}

/// Fetch a URL and decode it as JSON. Undecodable bodies are permanent errors.
pub async fn fetch_json<T: DeserializeOwned>(
    client: &Client,
    source: impl fmt::Display + Copy,
    url: &str,
) -> Result<T> {
    let text = fetch_text(client, source, url).await?;
    decode_json(source, url, &text)
}

/// Decode a fetched body, reporting failures as permanent.
pub fn decode_json<T: DeserializeOwned>(source: impl fmt::Display, url: &str, body: &str) -> Result<T> {
    serde_json::from_str(body)
        .map_err(|e| AppError::permanent(source, format!("undecodable response from {url}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify_status("npm", "u", StatusCode::OK).is_none());

        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(classify_status("npm", "u", status).unwrap().is_transient(), "{status}");
        }

        for status in [StatusCode::NOT_FOUND, StatusCode::GONE, StatusCode::FORBIDDEN] {
            assert!(!classify_status("npm", "u", status).unwrap().is_transient(), "{status}");
        }
    }

    #[test]
    fn test_decode_failure_is_permanent() {
        let err = decode_json::<serde_json::Value>("pypi", "https://pypi.org/x", "<html>").unwrap_err();
        assert!(matches!(err, AppError::PermanentFetch { .. }));
    }

    #[test]
    fn test_client_builds_from_config() {
        assert!(create_async_client(&CrawlerConfig::default()).is_ok());
    }
}
