//! Gateway Family Module
//!
//! The two gateway generations speak incompatible configuration protocols.
//! This module names them and tells them apart over HTTP.
//!
//! # Overview
//!
//! - [`GatewayFamily`]: `N510`, `N720` or `Unknown`
//! - [`FamilyDetector`]: read-only probes, N510 first, then N720
//!
//! Detection never writes to the device and never runs both probes at once.
//! Right after a reboot both probes commonly fail and the result is
//! [`GatewayFamily::Unknown`]; callers retry at a higher level.
//!
//! # Example
//!
//! ```no_run
//! use gwconf::family::{FamilyDetector, GatewayFamily};
//! use gwconf::http::{HttpConfig, ReqwestTransport};
//! use gwconf::encoding::Credentials;
//! use std::{net::Ipv4Addr, sync::Arc};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let http = Arc::new(ReqwestTransport::new(&HttpConfig::default(), Credentials::default())?);
//! let detector = FamilyDetector::new(http, Default::default());
//! let family = detector.detect(Ipv4Addr::new(192, 168, 0, 7)).await;
//! assert_ne!(family, GatewayFamily::Unknown);
//! # Ok(())
//! # }
//! ```

use std::{fmt, net::Ipv4Addr, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    http::{device_url, get_with_retry, HttpTransport},
    util::RetryConfig,
};

/// Status document served only by N510 firmware
pub const N510_PROBE_PATH: &str = "status.json";

/// Field that marks an N510 status document
pub const N510_PROBE_FIELD: &str = "modename";

/// System information document served only by N720 firmware
pub const N720_PROBE_PATH: &str = "sysinfo.json";

/// Gateway protocol generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GatewayFamily {
    /// JSON over CGI, `blob` uploads
    N510,
    /// Binary-framed CGI, CRC-prefixed flash uploads
    N720,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl GatewayFamily {
    /// Guess the family from a model code such as `USR-N510`
    pub fn from_model(model: &str) -> Self {
        let model = model.to_ascii_uppercase();
        if model.contains("N510") {
            GatewayFamily::N510
        } else if model.contains("N720") {
            GatewayFamily::N720
        } else {
            GatewayFamily::Unknown
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, GatewayFamily::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayFamily::N510 => "N510",
            GatewayFamily::N720 => "N720",
            GatewayFamily::Unknown => "unknown",
        }
    }
}

impl fmt::Display for GatewayFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies a gateway by probing family-specific documents
#[derive(Clone)]
pub struct FamilyDetector {
    http: Arc<dyn HttpTransport>,
    retry: RetryConfig,
}

impl FamilyDetector {
    /// Create a detector; `retry` applies to connection resets per probe
    pub fn new(http: Arc<dyn HttpTransport>, retry: RetryConfig) -> Self {
        Self { http, retry }
    }

    /// Probe `address`, N510 first.
    ///
    /// The N720 probe is only issued once the N510 probe has finished and
    /// failed.
    pub async fn detect(&self, address: Ipv4Addr) -> GatewayFamily {
        let family = if self.probe_n510(address).await {
            GatewayFamily::N510
        } else if self.probe_n720(address).await {
            GatewayFamily::N720
        } else {
            GatewayFamily::Unknown
        };
        log::info!("{} detected as {}", address, family);
        family
    }

    async fn probe_n510(&self, address: Ipv4Addr) -> bool {
        match self.fetch_object(address, N510_PROBE_PATH).await {
            Some(object) => object.get(N510_PROBE_FIELD).is_some(),
            None => false,
        }
    }

    async fn probe_n720(&self, address: Ipv4Addr) -> bool {
        self.fetch_object(address, N720_PROBE_PATH).await.is_some()
    }

    /// Fetch a document and return it if it is a JSON object
    async fn fetch_object(
        &self,
        address: Ipv4Addr,
        path: &str,
    ) -> Option<serde_json::Map<String, Value>> {
        let url = device_url(address, path);
        let response = match get_with_retry(self.http.as_ref(), &self.retry, &url).await {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                log::debug!("probe {} answered HTTP {}", url, response.status);
                return None;
            }
            Err(e) => {
                log::debug!("probe {} failed: {}", url, e);
                return None;
            }
        };

        match serde_json::from_slice::<Value>(&response.body) {
            Ok(Value::Object(object)) => Some(object),
            _ => {
                log::debug!("probe {} did not return a JSON object", url);
                None
            }
        }
    }
}
