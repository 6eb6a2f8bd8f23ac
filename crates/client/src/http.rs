use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use common::identifier::ContentIdentifier;
use common::receipt::{KeepUntil, KeepUntilReceipt, SummaryKeepUntilReceipt};

use crate::api::{ChunkPayload, DedupStore, PutNodeResponse, ResolvedBlob, StoreError};

/// Per-chunk metadata header on `put_chunks` calls:
/// `x-cachet-chunk-{id}: {stored len}/{0|1 compressed}`.
pub const CHUNK_HEADER_PREFIX: &str = "x-cachet-chunk-";
/// Present on fetched payloads exactly when they are compressed.
pub const UNCOMPRESSED_LEN_HEADER: &str = "x-cachet-uncompressed-len";
/// Aggregated child receipts attached to a `put_node` call.
pub const SUMMARY_RECEIPT_HEADER: &str = "x-cachet-keepuntil-receipts";

/// The `DedupStore` protocol over HTTP.
pub struct HttpDedupStore {
    http: reqwest::Client,
    base: Url,
}

impl HttpDedupStore {
    pub fn new(base: Url) -> Self {
        Self::with_client(reqwest::Client::new(), base)
    }

    /// Use a preconfigured client (timeouts, proxies, auth middleware).
    pub fn with_client(http: reqwest::Client, base: Url) -> Self {
        Self { http, base }
    }

    fn endpoint(&self, path: &str) -> Result<Url, StoreError> {
        self.base
            .join(path)
            .map_err(|e| StoreError::Malformed(format!("endpoint {path}: {e}")))
    }
}

/// Connection-level failures are always worth retrying.
fn transport(e: reqwest::Error) -> StoreError {
    StoreError::Transient {
        reason: e.to_string(),
    }
}

fn classify(status: StatusCode) -> StoreError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        StoreError::Transient {
            reason: format!("status {status}"),
        }
    } else {
        StoreError::Status {
            code: status.as_u16(),
        }
    }
}

fn malformed(e: reqwest::Error) -> StoreError {
    StoreError::Malformed(e.to_string())
}

fn uncompressed_len(resp: &reqwest::Response) -> Option<u64> {
    resp.headers()
        .get(UNCOMPRESSED_LEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

#[derive(Deserialize)]
struct ReceiptMapBody {
    receipts: HashMap<ContentIdentifier, KeepUntilReceipt>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChildrenNeedActionBody {
    #[serde(default)]
    missing: Vec<ContentIdentifier>,
    #[serde(default)]
    insufficient_keep_until: Vec<ContentIdentifier>,
    #[serde(default)]
    receipts: HashMap<ContentIdentifier, KeepUntilReceipt>,
}

#[derive(Serialize)]
struct ResolveRequest<'a> {
    ids: &'a [ContentIdentifier],
}

#[async_trait]
impl DedupStore for HttpDedupStore {
    async fn put_node(
        &self,
        id: ContentIdentifier,
        bytes: Bytes,
        keep_until: KeepUntil,
        summary: Option<SummaryKeepUntilReceipt>,
    ) -> Result<PutNodeResponse, StoreError> {
        let url = self.endpoint(&format!("nodes/{id}"))?;
        let mut request = self
            .http
            .put(url)
            .query(&[("keepUntil", keep_until.to_wire_string())])
            .body(bytes);
        if let Some(summary) = summary {
            let encoded = serde_json::to_string(&summary)
                .map_err(|e| StoreError::Malformed(format!("summary receipt: {e}")))?;
            request = request.header(SUMMARY_RECEIPT_HEADER, encoded);
        }

        let resp = request.send().await.map_err(transport)?;
        match resp.status() {
            StatusCode::OK => {
                let body: ReceiptMapBody = resp.json().await.map_err(malformed)?;
                Ok(PutNodeResponse::Updated {
                    receipts: body.receipts,
                })
            }
            StatusCode::CONFLICT => {
                let body: ChildrenNeedActionBody = resp.json().await.map_err(malformed)?;
                Ok(PutNodeResponse::ChildrenNeedAction {
                    missing: body.missing,
                    insufficient_keep_until: body.insufficient_keep_until,
                    receipts: body.receipts,
                })
            }
            status => Err(classify(status)),
        }
    }

    async fn put_chunks(
        &self,
        page: Vec<(ContentIdentifier, ChunkPayload)>,
        keep_until: KeepUntil,
    ) -> Result<HashMap<ContentIdentifier, KeepUntilReceipt>, StoreError> {
        let url = self.endpoint("chunks")?;
        let mut request = self
            .http
            .put(url)
            .query(&[("keepUntil", keep_until.to_wire_string())]);

        let mut body = Vec::with_capacity(
            page.iter()
                .map(|(_, p)| p.stored_len() as usize)
                .sum::<usize>(),
        );
        for (id, payload) in &page {
            let name = format!("{CHUNK_HEADER_PREFIX}{id}");
            let value = format!(
                "{}/{}",
                payload.stored_len(),
                u8::from(payload.is_compressed())
            );
            request = request.header(name.as_str(), value.as_str());
            body.extend_from_slice(payload.wire_bytes());
        }

        let resp = request.body(body).send().await.map_err(transport)?;
        match resp.status() {
            StatusCode::OK => {
                let body: ReceiptMapBody = resp.json().await.map_err(malformed)?;
                Ok(body.receipts)
            }
            status => Err(classify(status)),
        }
    }

    async fn get(&self, id: ContentIdentifier) -> Result<Option<Bytes>, StoreError> {
        let url = self.endpoint(&format!("blobs/{id}"))?;
        let resp = self.http.get(url).send().await.map_err(transport)?;
        match resp.status() {
            StatusCode::OK => {
                let declared = uncompressed_len(&resp);
                let bytes = resp.bytes().await.map_err(transport)?;
                Ok(Some(ChunkPayload::from_wire(bytes, declared).into_raw()?))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(classify(status)),
        }
    }

    async fn resolve(
        &self,
        ids: &[ContentIdentifier],
    ) -> Result<HashMap<ContentIdentifier, ResolvedBlob>, StoreError> {
        let url = self.endpoint("urls")?;
        let resp = self
            .http
            .post(url)
            .json(&ResolveRequest { ids })
            .send()
            .await
            .map_err(transport)?;
        if resp.status() != StatusCode::OK {
            return Err(classify(resp.status()));
        }
        let urls: HashMap<ContentIdentifier, Url> = resp.json().await.map_err(malformed)?;
        Ok(urls
            .into_iter()
            .map(|(id, url)| (id, ResolvedBlob { id, url }))
            .collect())
    }

    async fn fetch(&self, blob: &ResolvedBlob) -> Result<ChunkPayload, StoreError> {
        let resp = self
            .http
            .get(blob.url.clone())
            .send()
            .await
            .map_err(transport)?;
        if !resp.status().is_success() {
            return Err(classify(resp.status()));
        }
        let declared = uncompressed_len(&resp);
        let bytes = resp.bytes().await.map_err(transport)?;
        Ok(ChunkPayload::from_wire(bytes, declared))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(classify(StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(classify(StatusCode::INTERNAL_SERVER_ERROR).is_transient());
        assert!(!classify(StatusCode::FORBIDDEN).is_transient());
        assert!(matches!(
            classify(StatusCode::GONE),
            StoreError::Status { code: 410 }
        ));
    }
}
