//! `RemoteStore` over the HTTP API served by `nibble serve`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use nibble_core::config::StoreConfig;
use nibble_core::error::{StoreError, StoreResult};
use nibble_core::models::{ChangeEvent, ChangeRecord, Entry, EntryId, EntryPatch, NewEntry, UserId};
use nibble_core::store::{ChangeFilter, EntryQuery, ProbeOutcome, RemoteStore, Subscription};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const FEED_BUFFER: usize = 256;

#[derive(Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    poll_interval: Duration,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Change page with items left undecoded so one bad item does not sink the page.
#[derive(Deserialize)]
struct RawChangesPage {
    changes: Vec<serde_json::Value>,
    cursor: i64,
}

impl HttpStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("nibble/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.url.trim().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn changes_page(&self, user: &UserId, since: Option<i64>) -> StoreResult<RawChangesPage> {
        let mut query = vec![("user", user.as_str().to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }
        let response = send(self.request(Method::GET, "/api/changes").query(&query)).await?;
        read_json(response).await
    }

    /// Background poller feeding `tx` until the receiving side is dropped or
    /// the server stops answering.
    fn spawn_poller(
        &self,
        user: UserId,
        mut cursor: i64,
        tx: mpsc::Sender<ChangeEvent>,
    ) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    () = tokio::time::sleep(store.poll_interval) => {}
                }
                let page = match store.changes_page(&user, Some(cursor)).await {
                    Ok(page) => page,
                    // Ending the feed tells the session the store is gone.
                    Err(e @ StoreError::Network(_)) => {
                        warn!(error = %e, "change poll failed, closing feed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "change poll failed");
                        continue;
                    }
                };
                for item in page.changes {
                    match serde_json::from_value::<ChangeRecord>(item) {
                        Ok(record) => {
                            if tx.send(record.event).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping malformed change"),
                    }
                }
                cursor = cursor.max(page.cursor);
            }
            debug!(user = %user, "change poller stopped");
        })
    }
}

/// Translate a non-success status into the store error taxonomy.
fn status_error(status: StatusCode, message: String) -> StoreError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Unauthorized(message),
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::PAYLOAD_TOO_LARGE => {
            StoreError::Rejected(message)
        }
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            StoreError::Network(message)
        }
        _ => StoreError::Backend(format!("{status}: {message}")),
    }
}

fn transport_error(err: &reqwest::Error) -> StoreError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        StoreError::Network(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

async fn send(builder: RequestBuilder) -> StoreResult<Response> {
    let response = builder.send().await.map_err(|e| transport_error(&e))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.error)
        .unwrap_or(text);
    Err(status_error(status, message))
}

async fn read_json<T: DeserializeOwned>(response: Response) -> StoreResult<T> {
    let bytes = response.bytes().await.map_err(|e| transport_error(&e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl RemoteStore for HttpStore {
    async fn fetch(&self, query: &EntryQuery) -> StoreResult<Vec<Entry>> {
        let params = [
            ("user", query.user_id.as_str().to_string()),
            ("start", query.range.start.format("%Y-%m-%d").to_string()),
            ("end", query.range.end.format("%Y-%m-%d").to_string()),
        ];
        let response = send(self.request(Method::GET, "/api/entries").query(&params)).await?;
        read_json(response).await
    }

    async fn insert(&self, user: &UserId, entry: &NewEntry) -> StoreResult<Entry> {
        let response = send(
            self.request(Method::POST, "/api/entries")
                .query(&[("user", user.as_str())])
                .json(entry),
        )
        .await?;
        read_json(response).await
    }

    async fn update(&self, user: &UserId, id: &EntryId, patch: &EntryPatch) -> StoreResult<Entry> {
        let response = send(
            self.request(Method::PATCH, &format!("/api/entries/{id}"))
                .query(&[("user", user.as_str())])
                .json(patch),
        )
        .await?;
        read_json(response).await
    }

    async fn delete(&self, user: &UserId, id: &EntryId) -> StoreResult<()> {
        send(
            self.request(Method::DELETE, &format!("/api/entries/{id}"))
                .query(&[("user", user.as_str())]),
        )
        .await?;
        Ok(())
    }

    async fn subscribe(&self, filter: &ChangeFilter) -> StoreResult<Subscription> {
        // Anchor the cursor before returning so nothing written afterwards is missed.
        let start = self.changes_page(&filter.user_id, None).await?;
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        // Detached: the poller exits once the subscription's receiver is dropped.
        let _poller = self.spawn_poller(filter.user_id.clone(), start.cursor, tx);
        debug!(user = %filter.user_id, cursor = start.cursor, "change poller started");
        Ok(Subscription::from_receiver(rx))
    }

    async fn probe(&self) -> ProbeOutcome {
        match send(self.request(Method::GET, "/api/health")).await {
            Ok(_) => ProbeOutcome::Ok,
            Err(StoreError::Unauthorized(msg)) => ProbeOutcome::AuthError(msg),
            Err(e) => ProbeOutcome::NetworkError(e.to_string()),
        }
    }
}
