//! HTTP-backed network service.
//!
//! Speaks the Kinvey app-data REST protocol. The actual HTTP client is
//! abstracted via a trait to allow different implementations (reqwest,
//! hyper, etc.).

use crate::error::{ServerErrorKind, SyncError, SyncResult};
use crate::network::{DeltaResponse, FetchResponse, NetworkService};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kinvey_cache::{format_timestamp, parse_timestamp, Entity, Query, ID_FIELD};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Header carrying the time the server started handling a request.
pub const REQUEST_START_HEADER: &str = "X-Kinvey-Request-Start";

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `DELETE`
    Delete,
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL, query string included.
    pub url: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// JSON body, if any.
    pub body: Option<Vec<u8>>,
}

/// A received response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Looks up a header, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport. Errors are
/// transport failures (no response at all); HTTP error statuses are
/// returned as responses.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String>;
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    debug: Option<Value>,
}

#[derive(Deserialize)]
struct CountBody {
    count: usize,
}

#[derive(Deserialize)]
struct DeltaBody {
    changed: Vec<Value>,
    deleted: Vec<Value>,
}

/// [`NetworkService`] over the app-data REST API.
pub struct KinveyHttpService<C: HttpClient> {
    /// Base URL of the backend (e.g., "https://baas.kinvey.com").
    base_url: String,
    app_key: String,
    authorization: Option<String>,
    client: C,
}

impl<C: HttpClient> KinveyHttpService<C> {
    /// Creates a service for `app_key` at `base_url`.
    pub fn new(base_url: impl Into<String>, app_key: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app_key: app_key.into(),
            authorization: None,
            client,
        }
    }

    /// Sends `value` as the `Authorization` header on every request.
    #[must_use]
    pub fn with_authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, collection: &str) -> String {
        format!(
            "{}/appdata/{}/{}",
            self.base_url,
            urlencoding::encode(&self.app_key),
            urlencoding::encode(collection)
        )
    }

    fn entity_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}", self.collection_url(collection), urlencoding::encode(id))
    }

    async fn execute(
        &self,
        method: HttpMethod,
        url: String,
        body: Option<&Entity>,
    ) -> SyncResult<HttpResponse> {
        let mut headers = vec![("Accept".to_string(), "application/json".to_string())];
        if let Some(auth) = &self.authorization {
            headers.push(("Authorization".to_string(), auth.clone()));
        }
        let body = match body {
            Some(entity) => {
                headers.push(("Content-Type".to_string(), "application/json".to_string()));
                Some(
                    serde_json::to_vec(&entity.to_json())
                        .map_err(|e| SyncError::Protocol(format!("failed to encode entity: {e}")))?,
                )
            }
            None => None,
        };

        debug!(?method, %url, "kinvey request");
        let response = self
            .client
            .send(HttpRequest {
                method,
                url,
                headers,
                body,
            })
            .await
            .map_err(SyncError::network_retryable)?;

        if response.is_success() {
            Ok(response)
        } else {
            Err(error_from_response(&response))
        }
    }
}

/// Appends the query parameters for `query` to `url`.
fn with_query_params(url: String, query: &Query, extra: &[(&str, String)]) -> String {
    let mut params: Vec<(&str, String)> = extra.to_vec();
    if let Some(filter) = &query.filter {
        params.push(("query", filter.to_mongo().to_string()));
    }
    if !query.fields.is_empty() {
        params.push(("fields", query.fields_key()));
    }
    if let Some(sort) = query.sort_param() {
        params.push(("sort", sort));
    }
    if let Some(skip) = query.skip {
        params.push(("skip", skip.to_string()));
    }
    if let Some(limit) = query.limit {
        params.push(("limit", limit.to_string()));
    }
    if params.is_empty() {
        return url;
    }

    let encoded: Vec<String> = params
        .iter()
        .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
        .collect();
    format!("{url}?{}", encoded.join("&"))
}

fn error_from_response(response: &HttpResponse) -> SyncError {
    match serde_json::from_slice::<ErrorBody>(&response.body) {
        Ok(body) => SyncError::Server {
            kind: ServerErrorKind::from_name(&body.error),
            description: body.description,
            debug: body.debug.map(|d| match d {
                Value::String(s) => s,
                other => other.to_string(),
            }),
        },
        Err(_) if response.status >= 500 => {
            SyncError::network_retryable(format!("server responded with status {}", response.status))
        }
        Err(_) => SyncError::Protocol(format!(
            "unexpected status {} without an error body",
            response.status
        )),
    }
}

fn server_time(response: &HttpResponse) -> SyncResult<DateTime<Utc>> {
    response
        .header(REQUEST_START_HEADER)
        .and_then(parse_timestamp)
        .ok_or_else(|| SyncError::Protocol(format!("missing or invalid {REQUEST_START_HEADER} header")))
}

fn parse_json<T: for<'de> Deserialize<'de>>(response: &HttpResponse) -> SyncResult<T> {
    serde_json::from_slice(&response.body)
        .map_err(|e| SyncError::Protocol(format!("invalid response body: {e}")))
}

fn parse_entities(values: Vec<Value>) -> SyncResult<Vec<Entity>> {
    values
        .into_iter()
        .map(|value| Entity::from_json(value).map_err(SyncError::from))
        .collect()
}

fn deleted_id(value: Value) -> SyncResult<String> {
    match value {
        Value::String(id) => Ok(id),
        Value::Object(mut object) => match object.remove(ID_FIELD) {
            Some(Value::String(id)) => Ok(id),
            _ => Err(SyncError::Protocol("deleted record without _id".into())),
        },
        other => Err(SyncError::Protocol(format!("unexpected deleted entry {other}"))),
    }
}

#[async_trait]
impl<C: HttpClient> NetworkService for KinveyHttpService<C> {
    async fn fetch(&self, collection: &str, query: &Query) -> SyncResult<FetchResponse> {
        let url = with_query_params(self.collection_url(collection), query, &[]);
        let response = self.execute(HttpMethod::Get, url, None).await?;
        Ok(FetchResponse {
            server_time: server_time(&response)?,
            records: parse_entities(parse_json(&response)?)?,
        })
    }

    async fn fetch_delta(
        &self,
        collection: &str,
        query: &Query,
        since: DateTime<Utc>,
    ) -> SyncResult<DeltaResponse> {
        let url = with_query_params(
            format!("{}/_deltaset", self.collection_url(collection)),
            query,
            &[("since", format_timestamp(since))],
        );
        let response = self.execute(HttpMethod::Get, url, None).await?;
        let body: DeltaBody = parse_json(&response)?;
        Ok(DeltaResponse {
            server_time: server_time(&response)?,
            changed: parse_entities(body.changed)?,
            deleted: body
                .deleted
                .into_iter()
                .map(deleted_id)
                .collect::<SyncResult<_>>()?,
        })
    }

    async fn count(&self, collection: &str, query: &Query) -> SyncResult<usize> {
        let url = with_query_params(
            format!("{}/_count", self.collection_url(collection)),
            &query.without_window(),
            &[],
        );
        let response = self.execute(HttpMethod::Get, url, None).await?;
        Ok(parse_json::<CountBody>(&response)?.count)
    }

    async fn get(&self, collection: &str, id: &str) -> SyncResult<Entity> {
        let response = self
            .execute(HttpMethod::Get, self.entity_url(collection, id), None)
            .await?;
        Ok(Entity::from_json(parse_json(&response)?)?)
    }

    async fn create(&self, collection: &str, entity: &Entity) -> SyncResult<Entity> {
        let body = if entity.is_temporary() {
            entity.without_id()
        } else {
            entity.clone()
        };
        let response = self
            .execute(HttpMethod::Post, self.collection_url(collection), Some(&body))
            .await?;
        Ok(Entity::from_json(parse_json(&response)?)?)
    }

    async fn update(&self, collection: &str, entity: &Entity) -> SyncResult<Entity> {
        let response = self
            .execute(
                HttpMethod::Put,
                self.entity_url(collection, entity.id()),
                Some(entity),
            )
            .await?;
        Ok(Entity::from_json(parse_json(&response)?)?)
    }

    async fn delete(&self, collection: &str, id: &str) -> SyncResult<usize> {
        let response = self
            .execute(HttpMethod::Delete, self.entity_url(collection, id), None)
            .await?;
        Ok(parse_json::<CountBody>(&response)?.count)
    }

    async fn delete_matching(&self, collection: &str, query: &Query) -> SyncResult<usize> {
        let url = with_query_params(self.collection_url(collection), &query.without_window(), &[]);
        let response = self.execute(HttpMethod::Delete, url, None).await?;
        Ok(parse_json::<CountBody>(&response)?.count)
    }
}
