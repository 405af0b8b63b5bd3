//! Feishu/Lark Bitable open API client.
//!
//! Tables are addressed as `<app_token>:<table_id>`. Requests authenticate
//! with a tenant access token obtained from the app credentials and cached
//! until shortly before it expires.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use super::{filter_text, Condition, Fields, RemoteRecord, RemoteStore};
use crate::error::RemoteError;
use crate::storage::RemoteConfig;

/// Records requested per search page (API maximum).
pub const PAGE_SIZE: u32 = 500;

/// API code for a record id that does not exist.
pub const CODE_RECORD_NOT_FOUND: i64 = 1254043;

/// API codes that mean the tenant token is missing, invalid or expired.
const TOKEN_INVALID_CODES: [i64; 3] = [99991661, 99991663, 99991668];

/// Refresh the token this long before the server-side expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: String,
    #[serde(default)]
    expire: u64,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    items: Option<Vec<RemoteRecord>>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecordData {
    record: RemoteRecord,
}

/// Remote store speaking the Bitable HTTP API.
///
/// The client owns a small tokio runtime so the [`RemoteStore`] methods can
/// be called from plain threads. Do not call them from inside another
/// tokio runtime.
pub struct HttpRemoteStore {
    client: Client,
    runtime: tokio::runtime::Runtime,
    base_url: Url,
    app_id: String,
    app_secret: String,
    token: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for HttpRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemoteStore")
            .field("base_url", &self.base_url.as_str())
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

impl HttpRemoteStore {
    /// Build a client for `base_url` (e.g. `https://open.feishu.cn/open-apis`).
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client or runtime
    /// cannot be created.
    pub fn new(
        base_url: &str,
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| RemoteError::UnexpectedResponse(format!("invalid base url '{base_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(RemoteError::UnexpectedResponse(format!(
                "base url '{base_url}' cannot carry a path"
            )));
        }
        let client = Client::builder().timeout(timeout).build()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("bitable-http")
            .enable_all()
            .build()
            .map_err(|e| RemoteError::Unavailable(format!("cannot start HTTP runtime: {e}")))?;

        Ok(Self {
            client,
            runtime,
            base_url,
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            token: Mutex::new(None),
        })
    }

    /// Build from the `[remote]` config section and a resolved secret.
    ///
    /// # Errors
    /// See [`HttpRemoteStore::new`].
    pub fn from_config(config: &RemoteConfig, app_secret: &str) -> Result<Self, RemoteError> {
        Self::new(
            &config.base_url,
            config.app_id.clone(),
            app_secret,
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| RemoteError::UnexpectedResponse("base url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn records_url(&self, table: &str, tail: &[&str]) -> Result<Url, RemoteError> {
        let (app_token, table_id) = split_table(table)?;
        let mut segments = vec!["bitable", "v1", "apps", app_token, "tables", table_id, "records"];
        segments.extend_from_slice(tail);
        self.endpoint(&segments)
    }

    fn clear_token(&self) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    async fn tenant_token(&self) -> Result<String, RemoteError> {
        {
            let cached = self.token.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(token) = cached.as_ref() {
                if Instant::now() < token.expires_at {
                    return Ok(token.value.clone());
                }
            }
        }

        let url = self.endpoint(&["auth", "v3", "tenant_access_token", "internal"])?;
        let response = self
            .client
            .post(url)
            .json(&json!({ "app_id": self.app_id, "app_secret": self.app_secret }))
            .send()
            .await?;
        let status = response.status();
        let body: TokenResponse = response.json().await.map_err(|e| {
            RemoteError::Authentication(format!("token endpoint answered HTTP {status}: {e}"))
        })?;
        if body.code != 0 || body.tenant_access_token.is_empty() {
            return Err(RemoteError::Authentication(format!(
                "code {}: {}",
                body.code, body.msg
            )));
        }

        let lifetime = Duration::from_secs(body.expire).saturating_sub(TOKEN_EXPIRY_MARGIN);
        let token = CachedToken {
            value: body.tenant_access_token,
            expires_at: Instant::now() + lifetime,
        };
        tracing::debug!(expires_in = lifetime.as_secs(), "refreshed tenant access token");
        let value = token.value.clone();
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
        Ok(value)
    }

    /// Send an authenticated request and unwrap the `{code, msg, data}` envelope.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        not_found: (&str, &str),
    ) -> Result<Option<T>, RemoteError> {
        let token = self.tenant_token().await?;
        let mut request = self.client.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        let not_found_err = || RemoteError::NotFound {
            table: not_found.0.to_string(),
            record_id: not_found.1.to_string(),
        };
        if status == StatusCode::NOT_FOUND {
            return Err(not_found_err());
        }

        let text = response.text().await?;
        let envelope: Envelope<T> = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
                return Err(RemoteError::Unavailable(format!("HTTP {status}: {e}")));
            }
            Err(e) => {
                return Err(RemoteError::UnexpectedResponse(format!("HTTP {status}: {e}")));
            }
        };

        match envelope.code {
            0 => Ok(envelope.data),
            CODE_RECORD_NOT_FOUND => Err(not_found_err()),
            code if TOKEN_INVALID_CODES.contains(&code) => {
                self.clear_token();
                Err(RemoteError::Authentication(format!("code {code}: {}", envelope.msg)))
            }
            code => Err(RemoteError::Api {
                code,
                message: envelope.msg,
            }),
        }
    }

    async fn search_all(
        &self,
        table: &str,
        filter: &[Condition],
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        let body = search_body(filter);
        let mut records = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.records_url(table, &["search"])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("page_size", &PAGE_SIZE.to_string());
                if let Some(token) = &page_token {
                    query.append_pair("page_token", token);
                }
            }

            let page: SearchPage = self
                .call(Method::POST, url, Some(&body), (table, ""))
                .await?
                .ok_or_else(|| RemoteError::UnexpectedResponse("search returned no data".into()))?;
            records.extend(page.items.unwrap_or_default());

            match page.page_token.filter(|t| !t.is_empty()) {
                Some(next) if page.has_more => page_token = Some(next),
                _ => break,
            }
        }

        tracing::debug!(table, count = records.len(), "listed remote records");
        Ok(records)
    }
}

/// Split `<app_token>:<table_id>`.
fn split_table(table: &str) -> Result<(&str, &str), RemoteError> {
    match table.split_once(':') {
        Some((app, tbl)) if !app.is_empty() && !tbl.is_empty() => Ok((app, tbl)),
        _ => Err(RemoteError::InvalidTable(table.to_string())),
    }
}

/// Request body for `records/search`. Automatic fields are requested so
/// records carry `last_modified_time`.
fn search_body(filter: &[Condition]) -> Value {
    if filter.is_empty() {
        return json!({ "automatic_fields": true });
    }
    let conditions: Vec<Value> = filter
        .iter()
        .map(|c| {
            let value: Vec<String> = if c.operator.takes_value() {
                match &c.value {
                    Some(Value::Array(items)) => items.iter().map(filter_text).collect(),
                    Some(v) => vec![filter_text(v)],
                    None => Vec::new(),
                }
            } else {
                Vec::new()
            };
            json!({
                "field_name": c.field,
                "operator": c.operator.as_str(),
                "value": value,
            })
        })
        .collect();
    json!({
        "automatic_fields": true,
        "filter": { "conjunction": "and", "conditions": conditions },
    })
}

impl RemoteStore for HttpRemoteStore {
    fn list(&self, table: &str, filter: &[Condition]) -> Result<Vec<RemoteRecord>, RemoteError> {
        self.runtime.block_on(self.search_all(table, filter))
    }

    fn create(&self, table: &str, fields: &Fields) -> Result<String, RemoteError> {
        let url = self.records_url(table, &[])?;
        let body = json!({ "fields": fields });
        let data: RecordData = self
            .runtime
            .block_on(self.call(Method::POST, url, Some(&body), (table, "")))?
            .ok_or_else(|| RemoteError::UnexpectedResponse("create returned no record".into()))?;
        Ok(data.record.record_id)
    }

    fn update(&self, table: &str, record_id: &str, fields: &Fields) -> Result<(), RemoteError> {
        let url = self.records_url(table, &[record_id])?;
        let body = json!({ "fields": fields });
        self.runtime
            .block_on(self.call::<Value>(Method::PUT, url, Some(&body), (table, record_id)))?;
        Ok(())
    }

    fn delete(&self, table: &str, record_id: &str) -> Result<(), RemoteError> {
        let url = self.records_url(table, &[record_id])?;
        self.runtime
            .block_on(self.call::<Value>(Method::DELETE, url, None, (table, record_id)))?;
        Ok(())
    }

    fn ping(&self) -> Result<(), RemoteError> {
        self.runtime.block_on(self.tenant_token()).map(|_| ())
    }
}
