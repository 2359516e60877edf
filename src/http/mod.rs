//! Device HTTP Module
//!
//! This module is the single seam between the crate and a gateway's web
//! server. Family detection and both protocol adapters go through the
//! [`HttpTransport`] trait, which makes every firmware quirk testable with a
//! scripted transport instead of a real device.
//!
//! # Overview
//!
//! - [`HttpTransport`]: `GET` and multipart `POST` against a full URL
//! - [`ReqwestTransport`]: production implementation with HTTP Basic auth
//! - [`HttpError`]: transport failures, classified so that connection
//!   resets can be retried or treated as success where the firmware
//!   closes the socket early
//! - [`HttpConfig`]: request timeout and reset retry policy
//!
//! # Example
//!
//! ```no_run
//! use gwconf::encoding::Credentials;
//! use gwconf::http::{device_url, HttpConfig, HttpTransport, ReqwestTransport};
//! use std::net::Ipv4Addr;
//!
//! # async fn demo() -> gwconf::http::Result<()> {
//! let http = ReqwestTransport::new(&HttpConfig::default(), Credentials::default())?;
//! let response = http.get(&device_url(Ipv4Addr::new(192, 168, 0, 7), "status.json")).await?;
//! println!("{}", response.text());
//! # Ok(())
//! # }
//! ```

use std::{net::Ipv4Addr, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    encoding::Credentials,
    util::{retry_async, RetryConfig},
};

/// Result type for device HTTP operations
pub type Result<T> = std::result::Result<T, HttpError>;

/// Errors talking to a gateway's web server
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    /// The device closed the connection mid-exchange
    #[error("connection reset by device")]
    ConnectionReset,
    /// Nothing is listening, typically while the device reboots
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("request timed out")]
    Timeout,
    /// The device answered with a non-success status
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
    /// The response could not be interpreted
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("HTTP error: {0}")]
    Other(String),
}

impl HttpError {
    /// Whether the error is a connection reset
    pub fn is_reset(&self) -> bool {
        matches!(self, HttpError::ConnectionReset)
    }
}

/// A buffered HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    /// Create a response
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Create a `200 OK` response
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200, body)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as text, with invalid UTF-8 replaced
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Turn a non-success status into an error
    pub fn error_for_status(self, url: &str) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(HttpError::Status {
                status: self.status,
                url: url.to_string(),
            })
        }
    }
}

/// One file part of a multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartUpload {
    /// Form field name
    pub field: String,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl MultipartUpload {
    /// An opaque `application/octet-stream` part
    pub fn octet_stream(
        field: impl Into<String>,
        file_name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            field: field.into(),
            file_name: file_name.into(),
            content_type: "application/octet-stream".to_string(),
            bytes,
        }
    }
}

/// Request/response access to a gateway's web server
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Issue a `GET`
    async fn get(&self, url: &str) -> Result<HttpResponse>;

    /// `POST` a single-part multipart form
    async fn post_multipart(&self, url: &str, upload: &MultipartUpload) -> Result<HttpResponse>;
}

/// HTTP client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-request timeout
    pub request_timeout_ms: u64,
    /// Policy for retrying connection resets
    pub retry: RetryConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
            retry: RetryConfig::default(),
        }
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Build `http://<address>/<path>`
pub fn device_url(address: Ipv4Addr, path: &str) -> String {
    format!("http://{}/{}", address, path.trim_start_matches('/'))
}

/// Build a device URL with query parameters, percent-encoded
pub fn device_url_with_query(
    address: Ipv4Addr,
    path: &str,
    params: &[(String, String)],
) -> Result<String> {
    let base = device_url(address, path);
    if params.is_empty() {
        return Ok(base);
    }
    let url = reqwest::Url::parse_with_params(&base, params)
        .map_err(|e| HttpError::Other(format!("invalid URL {}: {}", base, e)))?;
    Ok(url.to_string())
}

/// `GET` with connection resets retried according to `retry`
pub async fn get_with_retry(
    http: &dyn HttpTransport,
    retry: &RetryConfig,
    url: &str,
) -> Result<HttpResponse> {
    retry_async(retry, HttpError::is_reset, || http.get(url)).await
}

/// Multipart `POST` with connection resets retried according to `retry`
pub async fn post_with_retry(
    http: &dyn HttpTransport,
    retry: &RetryConfig,
    url: &str,
    upload: &MultipartUpload,
) -> Result<HttpResponse> {
    retry_async(retry, HttpError::is_reset, || http.post_multipart(url, upload)).await
}

/// [`HttpTransport`] over `reqwest` with HTTP Basic credentials
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    credentials: Credentials,
}

impl ReqwestTransport {
    /// Build a client with the configured timeout
    pub fn new(config: &HttpConfig, credentials: Credentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| HttpError::Other(e.to_string()))?;
        Ok(Self {
            client,
            credentials,
        })
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<HttpResponse> {
        let response = request
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .send()
            .await
            .map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(classify)?;
        Ok(HttpResponse::new(status, body))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse> {
        log::debug!("GET {}", url);
        self.execute(self.client.get(url)).await
    }

    async fn post_multipart(&self, url: &str, upload: &MultipartUpload) -> Result<HttpResponse> {
        log::debug!(
            "POST {} ({} bytes as field `{}`)",
            url,
            upload.bytes.len(),
            upload.field
        );
        let part = reqwest::multipart::Part::bytes(upload.bytes.clone())
            .file_name(upload.file_name.clone())
            .mime_str(&upload.content_type)
            .map_err(|e| HttpError::Other(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part(upload.field.clone(), part);
        self.execute(self.client.post(url).multipart(form)).await
    }
}

/// Map a `reqwest` failure onto [`HttpError`], looking through the source
/// chain for the underlying socket error
fn classify(error: reqwest::Error) -> HttpError {
    if error.is_timeout() {
        return HttpError::Timeout;
    }

    let mut source = std::error::Error::source(&error);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind;
            match io.kind() {
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof => return HttpError::ConnectionReset,
                ErrorKind::ConnectionRefused => {
                    return HttpError::ConnectionRefused(error.to_string())
                }
                ErrorKind::TimedOut => return HttpError::Timeout,
                _ => {}
            }
        }
        // hyper reports a socket closed before the response as a plain error
        if inner
            .to_string()
            .contains("connection closed before message completed")
        {
            return HttpError::ConnectionReset;
        }
        source = inner.source();
    }

    if error.is_connect() {
        HttpError::ConnectionRefused(error.to_string())
    } else {
        HttpError::Other(error.to_string())
    }
}

/// Scripted transport for tests
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::{
        collections::{HashMap, VecDeque},
        sync::Mutex,
    };

    /// Replies are scripted per URL path; the last scripted reply for a
    /// path repeats once the queue is down to one entry. Unscripted paths
    /// are refused.
    #[derive(Default)]
    pub struct ScriptedTransport {
        routes: Mutex<HashMap<String, VecDeque<Result<HttpResponse>>>>,
        requests: Mutex<Vec<String>>,
        uploads: Mutex<Vec<(String, MultipartUpload)>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(&self, path: &str, reply: Result<HttpResponse>) -> &Self {
            self.routes
                .lock()
                .unwrap()
                .entry(path.to_string())
                .or_default()
                .push_back(reply);
            self
        }

        pub fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }

        pub fn uploads(&self) -> Vec<(String, MultipartUpload)> {
            self.uploads.lock().unwrap().clone()
        }

        fn reply(&self, url: &str) -> Result<HttpResponse> {
            self.requests.lock().unwrap().push(url.to_string());
            let path = reqwest::Url::parse(url)
                .map(|u| u.path().to_string())
                .unwrap_or_default();
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(&path) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
                Some(queue) if !queue.is_empty() => queue[0].clone(),
                _ => Err(HttpError::ConnectionRefused(path)),
            }
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn get(&self, url: &str) -> Result<HttpResponse> {
            self.reply(url)
        }

        async fn post_multipart(&self, url: &str, upload: &MultipartUpload) -> Result<HttpResponse> {
            self.uploads
                .lock()
                .unwrap()
                .push((url.to_string(), upload.clone()));
            self.reply(url)
        }
    }
}
