//! HTTP client for a Catalyst content server.
//!
//! Pointer changes are followed page by page and snapshot files are read line
//! by line, so neither is buffered whole. Dropping a returned stream stops
//! further requests and closes the open response body.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use log::{debug, warn};
use std::time::Duration;

use profile_sync_core::profiles::{
    PointerChangesFeed, RawProfileRecord, SnapshotFeed, SnapshotMetadata,
};
use profile_sync_core::Result as CoreResult;

use crate::error::{CatalystError, Result};
use crate::types::*;

/// Default timeout for JSON requests.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;

/// Client for the content endpoints of a Catalyst node.
#[derive(Debug, Clone)]
pub struct CatalystClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl CatalystClient {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Root of the Catalyst node (e.g., "https://peer.decentraland.org")
    /// * `timeout` - Per-request timeout for JSON calls. Snapshot downloads are
    ///   only bounded by the connect timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("[Catalyst] Response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("[Catalyst] Response error ({}): {}", status, preview);
    }

    /// Parse a JSON response body.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            return Err(CatalystError::api(
                status.as_u16(),
                format!("Request failed: {}", body),
            ));
        }

        serde_json::from_str(&body).map_err(|e| {
            warn!("[Catalyst] Failed to deserialize response: {}", e);
            CatalystError::from(e)
        })
    }

    /// Check the status of a response whose body is consumed as a stream.
    fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Self::log_response(status, "");
        Err(CatalystError::api(
            status.as_u16(),
            format!("Request failed with status {}", status),
        ))
    }

    fn pointer_changes_url(&self, from_timestamp: i64) -> String {
        format!(
            "{}/content/pointer-changes?entityType=profile&from={}&sortingField=local_timestamp&sortingOrder=ASC",
            self.base_url, from_timestamp
        )
    }

    /// Resolves `pagination.next`, which is either a query string relative to
    /// the pointer-changes endpoint or an absolute URL.
    fn next_page_url(&self, next: &str) -> Option<String> {
        let next = next.trim();
        if next.is_empty() {
            return None;
        }
        if next.starts_with("http://") || next.starts_with("https://") {
            return Some(next.to_string());
        }
        if next.starts_with('?') {
            return Some(format!("{}/content/pointer-changes{}", self.base_url, next));
        }
        Some(format!("{}/{}", self.base_url, next.trim_start_matches('/')))
    }

    /// Fetch one page of pointer changes.
    pub async fn get_pointer_changes_page(&self, url: &str) -> Result<PointerChangesPage> {
        debug!("[Catalyst] GET {}", url);
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// List the snapshots the node currently publishes.
    pub async fn get_snapshots(&self) -> Result<Vec<SnapshotMetadata>> {
        let url = format!("{}/content/snapshots", self.base_url);
        debug!("[Catalyst] GET {}", url);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await?;
        let entries: Vec<SnapshotEntry> = Self::parse_response(response).await?;
        Ok(entries.into_iter().map(SnapshotMetadata::from).collect())
    }

    /// Fetch the active entities with the given deployment ids.
    pub async fn get_active_entities(&self, ids: &[String]) -> Result<Vec<ActiveEntity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/content/entities/active", self.base_url);
        debug!("[Catalyst] POST {} ({} ids)", url, ids.len());
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&ActiveEntitiesRequest { ids })
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// Open the content file of snapshot `hash`.
    async fn open_snapshot(&self, hash: &str) -> Result<reqwest::Response> {
        let url = format!("{}/content/contents/{}", self.base_url, hash);
        debug!("[Catalyst] GET {}", url);
        let response = self.client.get(&url).send().await?;
        Self::check_status(response)
    }

    /// All pointer changes from `from_timestamp`, following pagination.
    pub fn pointer_changes(&self, from_timestamp: i64) -> BoxStream<'_, Result<RawProfileRecord>> {
        let first = self.pointer_changes_url(from_timestamp);
        stream::unfold(Some(first), move |next_url| async move {
            let url = next_url?;
            match self.get_pointer_changes_page(&url).await {
                Ok(page) => {
                    let next = page
                        .pagination
                        .next_page()
                        .and_then(|next| self.next_page_url(next));
                    let records: Vec<Result<RawProfileRecord>> = page
                        .deltas
                        .into_iter()
                        .map(|delta| Ok(RawProfileRecord::from(delta)))
                        .collect();
                    Some((records, next))
                }
                Err(err) => Some((vec![Err(err)], None)),
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }

    /// Records of snapshot `hash`, one per JSON line.
    pub fn snapshot_records(&self, hash: &str) -> BoxStream<'_, Result<RawProfileRecord>> {
        let hash = hash.to_string();
        stream::once(async move { self.open_snapshot(&hash).await })
            .flat_map(|opened| match opened {
                Ok(response) => ndjson_records(response.bytes_stream().boxed()).boxed(),
                Err(err) => stream::iter(vec![Err(err)]).boxed(),
            })
            .boxed()
    }
}

impl PointerChangesFeed for CatalystClient {
    fn stream_changes(&self, from_timestamp: i64) -> BoxStream<'_, CoreResult<RawProfileRecord>> {
        self.pointer_changes(from_timestamp)
            .map(|item| item.map_err(Into::into))
            .boxed()
    }
}

#[async_trait]
impl SnapshotFeed for CatalystClient {
    async fn list_snapshots(&self) -> CoreResult<Vec<SnapshotMetadata>> {
        Ok(self.get_snapshots().await?)
    }

    fn stream_snapshot(&self, hash: &str) -> BoxStream<'_, CoreResult<RawProfileRecord>> {
        self.snapshot_records(hash)
            .map(|item| item.map_err(Into::into))
            .boxed()
    }
}

/// Splits a byte stream into lines, skipping blanks and `#` header lines.
struct LineReader<S> {
    body: S,
    buffer: Vec<u8>,
    exhausted: bool,
}

impl<S, B> LineReader<S>
where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    fn new(body: S) -> Self {
        Self {
            body,
            buffer: Vec::new(),
            exhausted: false,
        }
    }

    async fn next_line(&mut self) -> Option<Result<String>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                return Some(Ok(String::from_utf8_lossy(&line).trim().to_string()));
            }
            if self.exhausted {
                if self.buffer.is_empty() {
                    return None;
                }
                let rest = std::mem::take(&mut self.buffer);
                return Some(Ok(String::from_utf8_lossy(&rest).trim().to_string()));
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(err)) => {
                    self.exhausted = true;
                    self.buffer.clear();
                    return Some(Err(CatalystError::from(err)));
                }
                None => self.exhausted = true,
            }
        }
    }

    async fn next_record(&mut self) -> Option<Result<RawProfileRecord>> {
        loop {
            let line = match self.next_line().await? {
                Ok(line) => line,
                Err(err) => return Some(Err(err)),
            };
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            return Some(
                serde_json::from_str::<SnapshotLine>(&line)
                    .map(RawProfileRecord::from)
                    .map_err(CatalystError::from),
            );
        }
    }
}

fn ndjson_records<S, B>(body: S) -> impl Stream<Item = Result<RawProfileRecord>>
where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    stream::unfold(LineReader::new(body), |mut reader| async move {
        let record = reader.next_record().await?;
        Some((record, reader))
    })
}
