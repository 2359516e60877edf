//! N720 adapter: `update_nv.cgi` parameter sets and redundant flash files.
//!
//! # Flash layout
//!
//! Persistent configuration lives in files under `/mnt/cfg`, each with a
//! backup copy. Every write targets both copies and attempts the second even
//! when the first fails. Payload rules per file type:
//!
//! - edge report JSON: `crc32_le(json) ++ json`, see [`super::framing`]
//! - CSV tables: CRLF line endings
//!
//! Uploads are multipart with the field name `c`.
//!
//! # Truncated reads
//!
//! `report_group.json` comes back with its first bytes missing on affected
//! firmware; [`super::quirks::repair_truncated`] restores it before parsing.

use std::{net::Ipv4Addr, sync::Arc};

use async_trait::async_trait;

use super::{
    framing::{prepend_crc, strip_crc},
    is_json_resource, parse_json,
    quirks::{has_truncation_bug, normalize_crlf, repair_truncated, REPORT_GROUP_HEAD},
    send_params, AdapterError, Document, EdgeReportConfig, GatewayAdapter, Result, SlotOutcome,
    WriteAck, WritePayload,
};
use crate::{
    family::GatewayFamily,
    http::{
        device_url, device_url_with_query, get_with_retry, post_with_retry, HttpTransport,
        MultipartUpload,
    },
    util::RetryConfig,
};

/// Parameter write endpoint
pub const NV_ENDPOINT: &str = "update_nv.cgi";

/// Flash file upload endpoint
pub const FLASH_UPLOAD_ENDPOINT: &str = "upload_file.cgi";

/// Flash file download endpoint
pub const FLASH_DOWNLOAD_ENDPOINT: &str = "download_file.cgi";

/// Required multipart field name for flash uploads
pub const FLASH_FIELD: &str = "c";

/// Encoding of a flash file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashFormat {
    /// JSON with a CRC32 prefix
    CrcJson,
    /// CRLF-terminated CSV
    Csv,
}

/// A persistent configuration file and its backup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashTarget {
    /// Resource name callers use
    pub resource: &'static str,
    /// Primary and backup file paths
    pub slots: [&'static str; 2],
    pub format: FlashFormat,
}

/// Edge computing report rules
pub const EDGE_REPORT: FlashTarget = FlashTarget {
    resource: "edge_report",
    slots: ["/mnt/cfg/edge.json", "/mnt/cfg/edge.bak"],
    format: FlashFormat::CrcJson,
};

/// Meter point table
pub const POINT_TABLE: FlashTarget = FlashTarget {
    resource: "point_table",
    slots: ["/mnt/cfg/point.csv", "/mnt/cfg/point.bak"],
    format: FlashFormat::Csv,
};

const FLASH_TARGETS: [FlashTarget; 2] = [EDGE_REPORT, POINT_TABLE];

/// Look up the flash file behind a resource name
pub fn flash_target(resource: &str) -> Option<FlashTarget> {
    FLASH_TARGETS
        .iter()
        .find(|target| target.resource == resource)
        .copied()
}

/// Expand a multi-valued setting into `name[0]=v0&name[1]=v1...` pairs
pub fn indexed_params<V: ToString>(name: &str, values: &[V]) -> Vec<(String, String)> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| (format!("{}[{}]", name, i), value.to_string()))
        .collect()
}

/// Adapter for N720 gateways
#[derive(Clone)]
pub struct N720Adapter {
    http: Arc<dyn HttpTransport>,
    address: Ipv4Addr,
    retry: RetryConfig,
}

impl N720Adapter {
    pub fn new(http: Arc<dyn HttpTransport>, address: Ipv4Addr, retry: RetryConfig) -> Self {
        Self {
            http,
            address,
            retry,
        }
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// Read the report groups, repairing the truncated response if needed
    pub async fn report_groups(&self) -> Result<EdgeReportConfig> {
        let resource = super::quirks::TRUNCATED_REPORT_RESOURCE;
        let value = self
            .read(resource)
            .await?
            .into_json()
            .unwrap_or_default();
        serde_json::from_value(value).map_err(|e| AdapterError::InvalidJson {
            resource: resource.to_string(),
            message: e.to_string(),
        })
    }

    /// Persist report groups to both edge report slots
    pub async fn write_report_groups(&self, config: &EdgeReportConfig) -> Result<WriteAck> {
        let document = config.to_json().map_err(|e| AdapterError::InvalidJson {
            resource: EDGE_REPORT.resource.to_string(),
            message: e.to_string(),
        })?;
        self.write(EDGE_REPORT.resource, WritePayload::Document(document))
            .await
    }

    /// Upload `bytes` to every slot of `target`
    async fn write_slots(&self, target: FlashTarget, bytes: Vec<u8>) -> Result<WriteAck> {
        let mut outcomes = Vec::with_capacity(target.slots.len());

        for slot in target.slots {
            let error = match self.upload_slot(slot, bytes.clone()).await {
                Ok(()) => None,
                Err(e) => {
                    log::warn!("flash write of {} to {} failed: {}", slot, self.address, e);
                    Some(e.to_string())
                }
            };
            outcomes.push(SlotOutcome {
                slot: slot.to_string(),
                error,
            });
        }

        if outcomes.iter().any(SlotOutcome::is_written) {
            log::info!(
                "wrote {} to {}/{} slot(s) on {}",
                target.resource,
                outcomes.iter().filter(|o| o.is_written()).count(),
                outcomes.len(),
                self.address
            );
            Ok(WriteAck::Flash(outcomes))
        } else {
            Err(AdapterError::FlashWriteFailed(outcomes))
        }
    }

    async fn upload_slot(&self, slot: &str, bytes: Vec<u8>) -> Result<()> {
        let url = device_url_with_query(
            self.address,
            FLASH_UPLOAD_ENDPOINT,
            &[("path".to_string(), slot.to_string())],
        )?;
        let file_name = slot.rsplit('/').next().unwrap_or(slot);
        let upload = MultipartUpload::octet_stream(FLASH_FIELD, file_name, bytes);
        post_with_retry(self.http.as_ref(), &self.retry, &url, &upload)
            .await?
            .error_for_status(&url)?;
        Ok(())
    }

    /// Read a flash file, falling back to the backup slot
    async fn read_flash(&self, target: FlashTarget) -> Result<Document> {
        let mut last_error = None;

        for slot in target.slots {
            match self.read_slot(target, slot).await {
                Ok(document) => return Ok(document),
                Err(e) => {
                    log::warn!("reading {} from {} failed: {}", slot, self.address, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| AdapterError::UnsupportedPayload(target.resource.to_string())))
    }

    async fn read_slot(&self, target: FlashTarget, slot: &str) -> Result<Document> {
        let url = device_url_with_query(
            self.address,
            FLASH_DOWNLOAD_ENDPOINT,
            &[("path".to_string(), slot.to_string())],
        )?;
        let response = get_with_retry(self.http.as_ref(), &self.retry, &url)
            .await?
            .error_for_status(&url)?;

        match target.format {
            FlashFormat::Csv => Ok(Document::Text(response.text())),
            FlashFormat::CrcJson => {
                let payload = match strip_crc(&response.body) {
                    Ok(payload) => payload,
                    // some builds strip the header on download
                    Err(_) if response.body.first() == Some(&b'{') => &response.body[..],
                    Err(source) => {
                        return Err(AdapterError::Crc {
                            resource: slot.to_string(),
                            source,
                        })
                    }
                };
                Ok(Document::Json(parse_json(slot, payload)?))
            }
        }
    }
}

#[async_trait]
impl GatewayAdapter for N720Adapter {
    fn family(&self) -> GatewayFamily {
        GatewayFamily::N720
    }

    async fn read(&self, resource: &str) -> Result<Document> {
        if let Some(target) = flash_target(resource) {
            return self.read_flash(target).await;
        }

        let url = device_url(self.address, resource);
        let response = get_with_retry(self.http.as_ref(), &self.retry, &url)
            .await?
            .error_for_status(&url)?;

        if has_truncation_bug(resource) {
            let repaired = repair_truncated(&response.text(), REPORT_GROUP_HEAD);
            Ok(Document::Json(parse_json(resource, repaired.as_bytes())?))
        } else if is_json_resource(resource) {
            Ok(Document::Json(parse_json(resource, &response.body)?))
        } else {
            Ok(Document::Text(response.text()))
        }
    }

    async fn write(&self, resource: &str, payload: WritePayload) -> Result<WriteAck> {
        let target = flash_target(resource);

        match (payload, target) {
            (WritePayload::Params(params), None) => {
                send_params(
                    self.http.as_ref(),
                    &self.retry,
                    GatewayFamily::N720,
                    self.address,
                    resource,
                    &params,
                )
                .await
            }
            (WritePayload::Document(document), Some(target))
                if target.format == FlashFormat::CrcJson =>
            {
                let json = serde_json::to_vec(&document).map_err(|e| {
                    AdapterError::InvalidJson {
                        resource: resource.to_string(),
                        message: e.to_string(),
                    }
                })?;
                self.write_slots(target, prepend_crc(&json)).await
            }
            (WritePayload::Csv(text), Some(target)) if target.format == FlashFormat::Csv => {
                self.write_slots(target, normalize_crlf(&text).into_bytes())
                    .await
            }
            _ => Err(AdapterError::UnsupportedPayload(resource.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapter::{framing::flash_crc, EdgeReportGroup},
        http::{mock::ScriptedTransport, HttpError, HttpResponse},
    };
    use serde_json::json;

    const ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 88);

    fn adapter(http: &Arc<ScriptedTransport>) -> N720Adapter {
        N720Adapter::new(http.clone(), ADDRESS, RetryConfig::none())
    }

    #[tokio::test]
    async fn test_truncated_report_group_repaired() {
        let http = Arc::new(ScriptedTransport::new());
        http.script(
            "/report_group.json",
            Ok(HttpResponse::ok(r#"oup":[{"name":"g1"}]"#)),
        );

        let config = adapter(&http).report_groups().await.unwrap();
        assert_eq!(config.group.len(), 1);
        assert_eq!(config.group[0].name, "g1");
    }

    #[tokio::test]
    async fn test_update_nv_reset_is_accepted_without_retry() {
        let http = Arc::new(ScriptedTransport::new());
        http.script("/update_nv.cgi", Err(HttpError::ConnectionReset));
        let adapter = N720Adapter::new(http.clone(), ADDRESS, RetryConfig::default());

        let ack = adapter
            .write(
                NV_ENDPOINT,
                WritePayload::Params(indexed_params("baud", &[9600, 19200])),
            )
            .await
            .unwrap();

        assert_eq!(ack, WriteAck::AcceptedOnReset);
        assert_eq!(
            http.requests(),
            vec!["http://192.168.1.88/update_nv.cgi?baud%5B0%5D=9600&baud%5B1%5D=19200"]
        );
    }

    #[tokio::test]
    async fn test_edge_report_written_to_both_slots_with_crc() {
        let http = Arc::new(ScriptedTransport::new());
        http.script("/upload_file.cgi", Ok(HttpResponse::ok("ok")));
        let config = EdgeReportConfig {
            group: vec![EdgeReportGroup::new("g1", "site/energy", 60).with_field("p", "pt")],
            ..Default::default()
        };

        let ack = adapter(&http).write_report_groups(&config).await.unwrap();
        assert!(ack.fully_persisted());

        let uploads = http.uploads();
        assert_eq!(uploads.len(), 2);
        assert!(uploads[0].0.contains("edge.json"));
        assert!(uploads[1].0.contains("edge.bak"));
        for (_, upload) in &uploads {
            assert_eq!(upload.field, "c");
            let (header, json) = upload.bytes.split_at(4);
            assert_eq!(header, flash_crc(json).to_le_bytes());
            let parsed: EdgeReportConfig = serde_json::from_slice(json).unwrap();
            assert_eq!(parsed, config);
        }
    }

    #[tokio::test]
    async fn test_second_slot_attempted_after_first_fails() {
        let http = Arc::new(ScriptedTransport::new());
        http.script("/upload_file.cgi", Ok(HttpResponse::new(500, "")))
            .script("/upload_file.cgi", Ok(HttpResponse::ok("ok")));

        let ack = adapter(&http)
            .write(EDGE_REPORT.resource, WritePayload::Document(json!({"group": []})))
            .await
            .unwrap();

        let WriteAck::Flash(slots) = &ack else {
            panic!("expected flash outcome, got {:?}", ack);
        };
        assert!(!slots[0].is_written());
        assert!(slots[1].is_written());
        assert!(!ack.fully_persisted());
    }

    #[tokio::test]
    async fn test_all_slots_failing_is_an_error() {
        let http = Arc::new(ScriptedTransport::new());
        let result = adapter(&http)
            .write(POINT_TABLE.resource, WritePayload::Csv("a;b\n".to_string()))
            .await;
        match result {
            Err(AdapterError::FlashWriteFailed(slots)) => assert_eq!(slots.len(), 2),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_csv_uploaded_with_crlf() {
        let http = Arc::new(ScriptedTransport::new());
        http.script("/upload_file.cgi", Ok(HttpResponse::ok("ok")));

        adapter(&http)
            .write(
                POINT_TABLE.resource,
                WritePayload::Csv("addr,alias\n1,ua\n".to_string()),
            )
            .await
            .unwrap();

        for (_, upload) in http.uploads() {
            assert_eq!(upload.bytes, b"addr,alias\r\n1,ua\r\n");
        }
    }

    #[tokio::test]
    async fn test_flash_read_falls_back_to_backup() {
        let http = Arc::new(ScriptedTransport::new());
        let mut corrupt = prepend_crc(br#"{"group":[]}"#);
        corrupt[5] ^= 0xFF;
        http.script("/download_file.cgi", Ok(HttpResponse::ok(corrupt)))
            .script(
                "/download_file.cgi",
                Ok(HttpResponse::ok(prepend_crc(br#"{"group":[{"name":"g2"}]}"#))),
            );

        let document = adapter(&http).read(EDGE_REPORT.resource).await.unwrap();
        assert_eq!(document.as_json().unwrap()["group"][0]["name"], "g2");
    }

    #[tokio::test]
    async fn test_mismatched_payload_rejected() {
        let http = Arc::new(ScriptedTransport::new());
        let result = adapter(&http)
            .write(EDGE_REPORT.resource, WritePayload::Csv("x".to_string()))
            .await;
        assert!(matches!(result, Err(AdapterError::UnsupportedPayload(_))));
        assert!(http.requests().is_empty());
    }
}
