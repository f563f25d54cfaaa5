//! Upstream boundary: the paginated GraphQL event-search client and the
//! bearer-token exchange.
//!
//! A group fetch either returns the complete upstream view or fails as a
//! whole; partial pages are never surfaced, so the importer cannot mistake a
//! half-fetched group for a complete one.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use muster_core::{Event, EventImage, EventLifecycle, GroupRef, Host, Venue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "muster-client";

/// Events requested per upstream page.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

const GROUP_EVENTS_QUERY: &str = r#"
  query ($urlname: String!, $itemsNum: Int!, $cursor: String) {
    events: groupByUrlname(urlname: $urlname) {
      unifiedEvents(input: { first: $itemsNum, after: $cursor }) {
        count
        pageInfo {
          endCursor
          hasNextPage
        }
        edges {
          node {
            id
            title
            eventUrl
            description
            dateTime
            duration
            venue {
              name
              address
              city
              state
              postalCode
            }
            group {
              name
              urlname
            }
            host {
              name
            }
            images {
              baseUrl
              preview
            }
          }
        }
      }
    }
  }
"#;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("upstream reported no event search results for group {0}")]
    UnknownGroup(String),
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("token exchange rejected: {name}: {message}")]
    Rejected { name: String, message: String },
    #[error("token endpoint returned an unexpected payload")]
    MalformedResponse,
}

/// Exchanges long-lived credentials for a short-lived bearer token.
#[async_trait]
pub trait TokenSupplier: Send + Sync {
    async fn bearer_token(&self) -> Result<String, TokenError>;
}

/// Fetches the complete upcoming-event view for one group, bounded by the
/// look-ahead horizon.
#[async_trait]
pub trait UpstreamEvents: Send + Sync {
    async fn fetch_group_events(
        &self,
        group_url_name: &str,
        token: &str,
        horizon: DateTime<Utc>,
    ) -> Result<Vec<Event>, ClientError>;
}

/// One event as the upstream search reports it. Everything but the identity
/// and start time may be missing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub id: String,
    pub title: String,
    pub event_url: String,
    #[serde(default)]
    pub description: Option<String>,
    pub date_time: DateTime<Utc>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub venue: Option<RawVenue>,
    #[serde(default)]
    pub group: Option<RawGroup>,
    #[serde(default)]
    pub host: Option<RawHost>,
    #[serde(default)]
    pub images: Option<Vec<RawImage>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawVenue {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawGroup {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "urlname")]
    pub url_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawHost {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawImage {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub preview: Option<String>,
}

impl RawEvent {
    /// Normalize into the canonical model. Optional upstream fields become
    /// empty strings; stored records always carry the full shape.
    pub fn into_event(self) -> Event {
        let venue = self.venue.unwrap_or_default();
        let group = self.group.unwrap_or_default();
        Event {
            id: self.id,
            title: self.title,
            url: self.event_url,
            description: self.description.unwrap_or_default(),
            date_time: self.date_time,
            duration: self.duration.unwrap_or_default(),
            venue: Venue {
                name: venue.name.unwrap_or_default(),
                address: venue.address.unwrap_or_default(),
                city: venue.city.unwrap_or_default(),
                state: venue.state.unwrap_or_default(),
                postal_code: venue.postal_code.unwrap_or_default(),
            },
            group: GroupRef {
                name: group.name.unwrap_or_default(),
                url_name: group.url_name.unwrap_or_default(),
            },
            host: Host {
                name: self.host.and_then(|h| h.name).unwrap_or_default(),
            },
            images: self
                .images
                .unwrap_or_default()
                .into_iter()
                .map(|image| EventImage {
                    base_url: image.base_url.unwrap_or_default(),
                    preview: image.preview.unwrap_or_default(),
                })
                .collect(),
            lifecycle: EventLifecycle::Active,
        }
    }
}

#[derive(Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: Variables<'a>,
}

#[derive(Serialize)]
struct Variables<'a> {
    urlname: &'a str,
    #[serde(rename = "itemsNum")]
    items_num: u32,
    cursor: Option<&'a str>,
}

#[derive(Deserialize)]
struct SearchResponse {
    data: Option<SearchData>,
}

#[derive(Deserialize)]
struct SearchData {
    events: Option<GroupEvents>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupEvents {
    unified_events: UnifiedEvents,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnifiedEvents {
    #[allow(dead_code)]
    count: u64,
    page_info: PageInfo,
    edges: Vec<EventEdge>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    end_cursor: Option<String>,
    has_next_page: bool,
}

#[derive(Deserialize)]
struct EventEdge {
    node: RawEvent,
}

struct EventPage {
    events: Vec<Event>,
    end_cursor: Option<String>,
    has_next_page: bool,
}

/// Drive the page loop until upstream runs out of pages or an already-seen
/// event sits at or past the horizon. Upstream usually reports events in
/// ascending date order, which makes the cutoff tight, but correctness does
/// not depend on it: the check uses the maximum date seen so far.
async fn collect_pages<F, Fut>(
    horizon: DateTime<Utc>,
    mut fetch_page: F,
) -> Result<Vec<Event>, ClientError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<EventPage, ClientError>>,
{
    let mut events = Vec::new();
    let mut cursor: Option<String> = None;
    let mut max_seen: Option<DateTime<Utc>> = None;

    loop {
        let page = fetch_page(cursor.take()).await?;
        for event in page.events {
            max_seen = Some(max_seen.map_or(event.date_time, |m| m.max(event.date_time)));
            events.push(event);
        }
        if max_seen.is_some_and(|m| m >= horizon) {
            break;
        }
        if !page.has_next_page {
            break;
        }
        match page.end_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(events)
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub page_size: u32,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            page_size: DEFAULT_PAGE_SIZE,
            timeout: Duration::from_secs(20),
        }
    }
}

/// [`UpstreamEvents`] over the third-party GraphQL search endpoint.
#[derive(Debug)]
pub struct GraphQlEventsClient {
    config: ClientConfig,
    client: reqwest::Client,
}

impl GraphQlEventsClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, client })
    }

    async fn fetch_page(
        &self,
        group_url_name: &str,
        token: &str,
        cursor: Option<String>,
    ) -> Result<EventPage, ClientError> {
        let body = GraphQlRequest {
            query: GROUP_EVENTS_QUERY,
            variables: Variables {
                urlname: group_url_name,
                items_num: self.config.page_size,
                cursor: cursor.as_deref(),
            },
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status(status));
        }

        let payload: SearchResponse = response.json().await?;
        let group_events = payload
            .data
            .and_then(|data| data.events)
            .ok_or_else(|| ClientError::UnknownGroup(group_url_name.to_string()))?;
        let unified = group_events.unified_events;
        debug!(
            group = group_url_name,
            fetched = unified.edges.len(),
            "fetched upstream page"
        );

        Ok(EventPage {
            events: unified
                .edges
                .into_iter()
                .map(|edge| edge.node.into_event())
                .collect(),
            end_cursor: unified.page_info.end_cursor,
            has_next_page: unified.page_info.has_next_page,
        })
    }
}

#[async_trait]
impl UpstreamEvents for GraphQlEventsClient {
    async fn fetch_group_events(
        &self,
        group_url_name: &str,
        token: &str,
        horizon: DateTime<Utc>,
    ) -> Result<Vec<Event>, ClientError> {
        collect_pages(horizon, |cursor| {
            self.fetch_page(group_url_name, token, cursor)
        })
        .await
    }
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub endpoint: String,
    /// Secret form parameters posted verbatim to the token endpoint.
    pub params: Vec<(String, String)>,
    pub timeout: Duration,
}

impl TokenConfig {
    pub fn new(endpoint: impl Into<String>, params: Vec<(String, String)>) -> Self {
        Self {
            endpoint: endpoint.into(),
            params,
            timeout: Duration::from_secs(20),
        }
    }
}

/// [`TokenSupplier`] over an HTTP token endpoint that answers with either
/// `{"token": ...}` or `{"errorName": ..., "errorMessage": ...}`.
#[derive(Debug)]
pub struct HttpTokenSupplier {
    config: TokenConfig,
    client: reqwest::Client,
}

impl HttpTokenSupplier {
    pub fn new(config: TokenConfig) -> Result<Self, TokenError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl TokenSupplier for HttpTokenSupplier {
    async fn bearer_token(&self) -> Result<String, TokenError> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .form(&self.config.params)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TokenError::Status(status));
        }
        let payload: serde_json::Value = response.json().await?;
        parse_token_response(&payload)
    }
}

fn parse_token_response(payload: &serde_json::Value) -> Result<String, TokenError> {
    if let Some(token) = payload.get("token").and_then(|v| v.as_str()) {
        if !token.is_empty() {
            return Ok(token.to_string());
        }
    }
    if let Some(message) = payload.get("errorMessage").and_then(|v| v.as_str()) {
        let name = payload
            .get("errorName")
            .and_then(|v| v.as_str())
            .unwrap_or("TokenError");
        return Err(TokenError::Rejected {
            name: name.to_string(),
            message: message.to_string(),
        });
    }
    Err(TokenError::MalformedResponse)
}
