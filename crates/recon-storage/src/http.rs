//! HTTP fetch helpers shared by the snapshot adapters.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

use crate::retry::{execute_with_retry, RetryDisposition, RetryError, RetryPolicy, Retryable};

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Applies to every request; a stuck call never outlives it.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            retry: RetryPolicy::http(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("cannot decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl Retryable for FetchError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Decode { .. } => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub async fn get_bytes(
        &self,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        self.send(source_id, url, |client| client.get(url).query(query))
            .await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let response = self.get_bytes(source_id, url, query).await?;
        decode_json(&response)
    }

    pub async fn post_json<B, T>(
        &self,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
        body: &B,
    ) -> Result<T, FetchError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let response = self
            .send(source_id, url, |client| client.post(url).query(query).json(body))
            .await?;
        decode_json(&response)
    }

    async fn send<R>(
        &self,
        source_id: &str,
        url: &str,
        request: R,
    ) -> Result<FetchedResponse, FetchError>
    where
        R: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Sync,
    {
        let client = &self.client;
        let request = &request;
        let span = info_span!("http_fetch", source_id, url);
        execute_with_retry(&self.retry, "http fetch", move |attempt| async move {
            debug!(attempt, "sending request");
            let resp = request(client).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        })
        .instrument(span)
        .await
        .map_err(RetryError::into_inner)
    }
}

fn decode_json<T: DeserializeOwned>(response: &FetchedResponse) -> Result<T, FetchError> {
    serde_json::from_slice(&response.body).map_err(|err| FetchError::Decode {
        url: response.final_url.clone(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn status_errors_carry_their_disposition() {
        let err = FetchError::HttpStatus {
            status: 502,
            url: "https://api.example.com".into(),
        };
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        assert_eq!(err.status(), Some(502));

        let decode = FetchError::Decode {
            url: "https://api.example.com".into(),
            message: "expected value".into(),
        };
        assert_eq!(decode.disposition(), RetryDisposition::NonRetryable);
    }

    #[test]
    fn client_builds_with_user_agent() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some("recon/0.1".into()),
            ..HttpClientConfig::default()
        });
        assert!(fetcher.is_ok());
    }
}
