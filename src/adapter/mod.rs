//! Protocol Adapter Module
//!
//! This module gives callers one calling convention for two gateway
//! generations that share no wire format.
//!
//! # Overview
//!
//! - [`GatewayAdapter`]: `read` / `write` / `verify` over a resource name
//! - [`Adapter`]: closed set of implementations, one per [`GatewayFamily`]
//! - [`n510`]: JSON over CGI, `blob` multipart uploads
//! - [`n720`]: update_nv parameter sets, CRC-framed flash uploads to two slots
//! - [`quirks`]: named firmware workarounds
//! - [`framing`]: CRC32 framing of flash payloads
//! - [`report`]: typed edge-report documents
//!
//! Choosing an adapter for a family that was not detected fails immediately
//! with [`AdapterError::UnknownFamily`]; nothing falls back from one family
//! to the other.
//!
//! # Example
//!
//! ```no_run
//! use gwconf::adapter::{Adapter, GatewayAdapter};
//! use gwconf::family::GatewayFamily;
//! use gwconf::http::{HttpConfig, ReqwestTransport};
//! use gwconf::encoding::Credentials;
//! use std::{net::Ipv4Addr, sync::Arc};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let http = Arc::new(ReqwestTransport::new(&HttpConfig::default(), Credentials::default())?);
//! let adapter = Adapter::for_family(GatewayFamily::N510, http, Ipv4Addr::new(192, 168, 0, 7), Default::default())?;
//! let status = adapter.read("status.json").await?;
//! println!("{:?}", status);
//! # Ok(())
//! # }
//! ```

use std::{net::Ipv4Addr, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::{
    family::GatewayFamily,
    http::{device_url_with_query, get_with_retry, HttpError, HttpTransport},
    util::RetryConfig,
};

pub mod framing;
pub mod n510;
pub mod n720;
pub mod quirks;
pub mod report;

pub use n510::N510Adapter;
pub use n720::N720Adapter;
pub use report::{EdgeReportConfig, EdgeReportGroup};

/// Result type for adapter operations
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Errors that can occur in adapter operations
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The device could not be reached or answered with an error
    #[error("HTTP: {0}")]
    Http(#[from] HttpError),
    /// No adapter exists for an undetected family
    #[error("gateway family is unknown; run detection first")]
    UnknownFamily,
    /// The operation belongs to the other family
    #[error("operation needs a {expected} gateway but this one is {actual}")]
    FamilyMismatch {
        expected: GatewayFamily,
        actual: GatewayFamily,
    },
    /// The resource returned something that is not JSON
    #[error("invalid JSON from {resource}: {message}")]
    InvalidJson { resource: String, message: String },
    /// A flash payload failed its CRC check
    #[error("CRC check failed for {resource}: {source}")]
    Crc {
        resource: String,
        #[source]
        source: framing::CrcError,
    },
    /// Every flash slot rejected the write
    #[error("flash write failed on every slot: {0:?}")]
    FlashWriteFailed(Vec<SlotOutcome>),
    /// The payload kind is not accepted by this resource
    #[error("unsupported payload for {0}")]
    UnsupportedPayload(String),
}

/// A document read from the device
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Json(Value),
    Text(String),
}

impl Document {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Document::Json(value) => Some(value),
            Document::Text(_) => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            Document::Json(value) => Some(value),
            Document::Text(_) => None,
        }
    }
}

/// What to write to a resource
#[derive(Debug, Clone, PartialEq)]
pub enum WritePayload {
    /// Query-string parameters for a CGI endpoint
    Params(Vec<(String, String)>),
    /// A structured document to persist
    Document(Value),
    /// A CSV table to persist
    Csv(String),
}

/// Outcome of one flash slot write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotOutcome {
    pub slot: String,
    /// `None` when the slot was written
    pub error: Option<String>,
}

impl SlotOutcome {
    pub fn is_written(&self) -> bool {
        self.error.is_none()
    }
}

/// How the device acknowledged a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteAck {
    /// A normal success response
    Accepted,
    /// The device reset the connection on an endpoint that does so after
    /// applying the command
    AcceptedOnReset,
    /// Flash write; at least one slot succeeded
    Flash(Vec<SlotOutcome>),
}

impl WriteAck {
    /// Whether every flash slot was written; always true for other writes
    pub fn fully_persisted(&self) -> bool {
        match self {
            WriteAck::Flash(slots) => slots.iter().all(SlotOutcome::is_written),
            _ => true,
        }
    }
}

/// Entry and key totals of a JSON document
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StructuralCounts {
    /// Array elements, at every depth
    pub entries: usize,
    /// Object keys, at every depth
    pub keys: usize,
}

impl StructuralCounts {
    /// Whether `self` holds at least as much as `expected`
    pub fn covers(&self, expected: &StructuralCounts) -> bool {
        self.entries >= expected.entries && self.keys >= expected.keys
    }
}

/// Count array entries and object keys throughout a document
pub fn count_structure(value: &Value) -> StructuralCounts {
    let mut counts = StructuralCounts::default();
    let mut stack = vec![value];
    while let Some(value) = stack.pop() {
        match value {
            Value::Array(items) => {
                counts.entries += items.len();
                stack.extend(items.iter());
            }
            Value::Object(map) => {
                counts.keys += map.len();
                stack.extend(map.values());
            }
            _ => {}
        }
    }
    counts
}

/// Result of re-reading a written document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The device holds everything that was written
    Verified,
    /// Saved, but the device holds less than was written
    Incomplete {
        expected: StructuralCounts,
        actual: StructuralCounts,
    },
}

impl VerifyOutcome {
    /// Compare a read-back document with what was written
    pub fn compare(expected: &Value, actual: &Value) -> Self {
        let expected = count_structure(expected);
        let actual = count_structure(actual);
        if actual.covers(&expected) {
            VerifyOutcome::Verified
        } else {
            VerifyOutcome::Incomplete { expected, actual }
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, VerifyOutcome::Verified)
    }
}

/// Shared capability interface of the family adapters
#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    /// Family this adapter speaks
    fn family(&self) -> GatewayFamily;

    /// Fetch a resource; `.json` resources are parsed
    async fn read(&self, resource: &str) -> Result<Document>;

    /// Write to a resource
    async fn write(&self, resource: &str, payload: WritePayload) -> Result<WriteAck>;

    /// Re-read `resource` and compare it structurally with `expected`
    async fn verify(&self, resource: &str, expected: &Value) -> Result<VerifyOutcome> {
        let document = self.read(resource).await?;
        let actual = document
            .into_json()
            .ok_or_else(|| AdapterError::InvalidJson {
                resource: resource.to_string(),
                message: "expected a JSON document".to_string(),
            })?;
        let outcome = VerifyOutcome::compare(expected, &actual);
        if let VerifyOutcome::Incomplete { expected, actual } = &outcome {
            log::warn!(
                "{} saved but not fully verified: expected {:?}, found {:?}",
                resource,
                expected,
                actual
            );
        }
        Ok(outcome)
    }
}

/// The adapter for a detected family
pub enum Adapter {
    N510(N510Adapter),
    N720(N720Adapter),
}

impl Adapter {
    /// Build the adapter for `family`; `Unknown` is refused
    pub fn for_family(
        family: GatewayFamily,
        http: Arc<dyn HttpTransport>,
        address: Ipv4Addr,
        retry: RetryConfig,
    ) -> Result<Self> {
        match family {
            GatewayFamily::N510 => Ok(Adapter::N510(N510Adapter::new(http, address, retry))),
            GatewayFamily::N720 => Ok(Adapter::N720(N720Adapter::new(http, address, retry))),
            GatewayFamily::Unknown => Err(AdapterError::UnknownFamily),
        }
    }

    /// Fail unless this adapter speaks `expected`
    pub fn expect_family(&self, expected: GatewayFamily) -> Result<&Self> {
        let actual = self.family();
        if actual == expected {
            Ok(self)
        } else {
            Err(AdapterError::FamilyMismatch { expected, actual })
        }
    }

    pub fn as_n720(&self) -> Result<&N720Adapter> {
        match self {
            Adapter::N720(adapter) => Ok(adapter),
            other => Err(AdapterError::FamilyMismatch {
                expected: GatewayFamily::N720,
                actual: other.family(),
            }),
        }
    }

    fn inner(&self) -> &dyn GatewayAdapter {
        match self {
            Adapter::N510(adapter) => adapter as &dyn GatewayAdapter,
            Adapter::N720(adapter) => adapter as &dyn GatewayAdapter,
        }
    }
}

#[async_trait]
impl GatewayAdapter for Adapter {
    fn family(&self) -> GatewayFamily {
        self.inner().family()
    }

    async fn read(&self, resource: &str) -> Result<Document> {
        self.inner().read(resource).await
    }

    async fn write(&self, resource: &str, payload: WritePayload) -> Result<WriteAck> {
        self.inner().write(resource, payload).await
    }

    async fn verify(&self, resource: &str, expected: &Value) -> Result<VerifyOutcome> {
        self.inner().verify(resource, expected).await
    }
}

/// Parse a JSON body, naming the resource in the error
pub(crate) fn parse_json(resource: &str, body: &[u8]) -> Result<Value> {
    serde_json::from_slice(body).map_err(|e| AdapterError::InvalidJson {
        resource: resource.to_string(),
        message: e.to_string(),
    })
}

/// Send a CGI parameter set.
///
/// On endpoints listed in [`quirks::is_reset_tolerant`] a single attempt is
/// made and a connection reset counts as success, since retrying would apply
/// the command twice. Other endpoints retry resets per `retry`.
pub(crate) async fn send_params(
    http: &dyn HttpTransport,
    retry: &RetryConfig,
    family: GatewayFamily,
    address: Ipv4Addr,
    resource: &str,
    params: &[(String, String)],
) -> Result<WriteAck> {
    let url = device_url_with_query(address, resource, params)?;

    if quirks::is_reset_tolerant(family, resource) {
        return match http.get(&url).await {
            Ok(response) => {
                response.error_for_status(&url)?;
                Ok(WriteAck::Accepted)
            }
            Err(HttpError::ConnectionReset) => {
                log::debug!("{} reset the connection after applying the command", resource);
                Ok(WriteAck::AcceptedOnReset)
            }
            Err(e) => Err(e.into()),
        };
    }

    get_with_retry(http, retry, &url)
        .await?
        .error_for_status(&url)?;
    Ok(WriteAck::Accepted)
}

/// Whether a resource name refers to a JSON document
pub(crate) fn is_json_resource(resource: &str) -> bool {
    resource
        .split('?')
        .next()
        .is_some_and(|path| path.ends_with(".json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::mock::ScriptedTransport;
    use serde_json::json;

    #[test]
    fn test_count_structure() {
        let doc = json!({"group": [{"name": "a", "topic": "t"}, {"name": "b"}], "v": 1});
        assert_eq!(
            count_structure(&doc),
            StructuralCounts {
                entries: 2,
                keys: 5
            }
        );
        assert_eq!(count_structure(&json!(3)), StructuralCounts::default());
    }

    #[test]
    fn test_verify_outcome_detects_capped_document() {
        let written = json!({"rules": [1, 2, 3, 4]});
        let capped = json!({"rules": [1, 2]});
        assert!(VerifyOutcome::compare(&written, &written).is_verified());
        assert_eq!(
            VerifyOutcome::compare(&written, &capped),
            VerifyOutcome::Incomplete {
                expected: StructuralCounts { entries: 4, keys: 1 },
                actual: StructuralCounts { entries: 2, keys: 1 },
            }
        );
    }

    #[test]
    fn test_adapter_selection() {
        let http: Arc<dyn HttpTransport> = Arc::new(ScriptedTransport::new());
        let address = Ipv4Addr::new(192, 168, 1, 77);

        assert!(matches!(
            Adapter::for_family(GatewayFamily::Unknown, http.clone(), address, RetryConfig::none()),
            Err(AdapterError::UnknownFamily)
        ));

        let n510 =
            Adapter::for_family(GatewayFamily::N510, http, address, RetryConfig::none()).unwrap();
        assert_eq!(n510.family(), GatewayFamily::N510);
        assert!(n510.expect_family(GatewayFamily::N510).is_ok());
        assert!(matches!(
            n510.as_n720(),
            Err(AdapterError::FamilyMismatch {
                expected: GatewayFamily::N720,
                actual: GatewayFamily::N510
            })
        ));
    }

    #[test]
    fn test_is_json_resource() {
        assert!(is_json_resource("status.json"));
        assert!(is_json_resource("report_group.json?x=1"));
        assert!(!is_json_resource("edge_report"));
    }
}
