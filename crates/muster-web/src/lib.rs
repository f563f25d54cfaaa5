//! JSON read API over the event store.
//!
//! A single `GET /events` route: callers must present a configured API key
//! in the `Authorization` header and name a group; results are non-deleted
//! events of that group, ascending by date, paginated by opaque cursor.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, Utc};
use muster_core::{Clock, Event, EventImage, GroupRef, Host, SystemClock, Venue};
use muster_store::{EventQuery, EventStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "muster-web";

/// Page size when the caller does not pass `limit`.
pub const DEFAULT_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub api_keys: Vec<String>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(store: Arc<dyn EventStore>, api_keys: Vec<String>) -> Self {
        Self {
            store,
            api_keys,
            clock: Arc::new(SystemClock),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct EventsParams {
    group: Option<String>,
    before: Option<String>,
    after: Option<String>,
    limit: Option<usize>,
    cursor: Option<String>,
    /// Presence flag: only the single next event after now.
    next: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventDto {
    id: String,
    title: String,
    event_url: String,
    description: String,
    date_time: DateTime<Utc>,
    duration: String,
    venue: Venue,
    group: GroupRef,
    host: Host,
    images: Vec<EventImage>,
}

impl From<Event> for EventDto {
    fn from(event: Event) -> Self {
        Self {
            id: event.id,
            title: event.title,
            event_url: event.url,
            description: event.description,
            date_time: event.date_time,
            duration: event.duration,
            venue: event.venue,
            group: event.group,
            host: event.host,
            images: event.images,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PageInfoDto {
    next_cursor: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventsResponse {
    success: bool,
    page_info: PageInfoDto,
    events: Vec<EventDto>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/events", get(events_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("MUSTER_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<EventsParams>,
) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|key| state.api_keys.iter().any(|valid| valid == key))
        .unwrap_or(false);
    if !authorized {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "Authorization header is missing or not valid",
        );
    }

    let group = match params.group.as_deref() {
        Some(group) if !group.is_empty() => group.to_string(),
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "The `group` query string parameter is required",
            )
        }
    };

    let query = if params.next.is_some() {
        // Only the single next event after now; other bounds are ignored.
        EventQuery {
            count: 1,
            cursor: None,
            before: None,
            after: Some(state.clock.now()),
        }
    } else {
        let before = match parse_bound(params.before.as_deref()) {
            Ok(bound) => bound,
            Err(response) => return response,
        };
        let after = match parse_bound(params.after.as_deref()) {
            Ok(bound) => bound,
            Err(response) => return response,
        };
        EventQuery {
            count: params.limit.unwrap_or(DEFAULT_LIMIT).max(1),
            cursor: params.cursor.clone(),
            before,
            after,
        }
    };

    match state.store.query_group_events(&group, query).await {
        Ok((events, next_cursor)) => {
            let body = EventsResponse {
                success: true,
                page_info: PageInfoDto { next_cursor },
                events: events.into_iter().map(EventDto::from).collect(),
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err @ (StoreError::MissingGroup | StoreError::InvalidCursor)) => {
            error_response(StatusCode::BAD_REQUEST, &err.to_string())
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

fn parse_bound(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, Response> {
    match raw {
        None => Ok(None),
        Some(raw) => match parse_date_string(raw) {
            Some(date) => Ok(Some(date)),
            None => Err(error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid date `{raw}`, expected YYYYMMDD"),
            )),
        },
    }
}

/// Parse a `YYYYMMDD` bound into the UTC midnight starting that day.
pub fn parse_date_string(raw: &str) -> Option<DateTime<Utc>> {
    if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year = raw[0..4].parse().ok()?;
    let month = raw[4..6].parse().ok()?;
    let day = raw[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: message.to_string(),
        }),
    )
        .into_response()
}
