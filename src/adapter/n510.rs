//! N510 adapter: flat JSON documents, CGI query writes, `blob` uploads.
//!
//! Structured documents are persisted with a multipart `POST` to
//! `upload.cgi?name=<resource>`. The firmware only accepts the part when it
//! is named `blob`, carries the file name `blob` and the type
//! `application/octet-stream`; any other naming is accepted with `200 OK`
//! and silently dropped. The firmware may also cap a document without
//! reporting an error, so writes should be followed by [`GatewayAdapter::verify`].

use std::{net::Ipv4Addr, sync::Arc};

use async_trait::async_trait;

use super::{
    is_json_resource, parse_json, send_params, AdapterError, Document, GatewayAdapter, Result,
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

/// Document upload endpoint
pub const UPLOAD_ENDPOINT: &str = "upload.cgi";

/// Required multipart field name
pub const UPLOAD_FIELD: &str = "blob";

/// Required multipart file name
pub const UPLOAD_FILE_NAME: &str = "blob";

/// Adapter for N510 gateways
#[derive(Clone)]
pub struct N510Adapter {
    http: Arc<dyn HttpTransport>,
    address: Ipv4Addr,
    retry: RetryConfig,
}

impl N510Adapter {
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

    async fn upload(&self, resource: &str, document: &serde_json::Value) -> Result<WriteAck> {
        let bytes = serde_json::to_vec(document).map_err(|e| AdapterError::InvalidJson {
            resource: resource.to_string(),
            message: e.to_string(),
        })?;
        let url = device_url_with_query(
            self.address,
            UPLOAD_ENDPOINT,
            &[("name".to_string(), resource.to_string())],
        )?;
        let upload = MultipartUpload::octet_stream(UPLOAD_FIELD, UPLOAD_FILE_NAME, bytes);

        post_with_retry(self.http.as_ref(), &self.retry, &url, &upload)
            .await?
            .error_for_status(&url)?;
        log::info!("uploaded {} to {}", resource, self.address);
        Ok(WriteAck::Accepted)
    }
}

#[async_trait]
impl GatewayAdapter for N510Adapter {
    fn family(&self) -> GatewayFamily {
        GatewayFamily::N510
    }

    async fn read(&self, resource: &str) -> Result<Document> {
        let url = device_url(self.address, resource);
        let response = get_with_retry(self.http.as_ref(), &self.retry, &url)
            .await?
            .error_for_status(&url)?;

        if is_json_resource(resource) {
            Ok(Document::Json(parse_json(resource, &response.body)?))
        } else {
            Ok(Document::Text(response.text()))
        }
    }

    async fn write(&self, resource: &str, payload: WritePayload) -> Result<WriteAck> {
        match payload {
            WritePayload::Params(params) => {
                send_params(
                    self.http.as_ref(),
                    &self.retry,
                    GatewayFamily::N510,
                    self.address,
                    resource,
                    &params,
                )
                .await
            }
            WritePayload::Document(document) => self.upload(resource, &document).await,
            WritePayload::Csv(_) => Err(AdapterError::FamilyMismatch {
                expected: GatewayFamily::N720,
                actual: GatewayFamily::N510,
            }),
        }
    }
}
