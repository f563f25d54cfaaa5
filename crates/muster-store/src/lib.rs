//! Flat-record codec and file-backed key-value tables for Muster.
//!
//! Two tables are kept: the events table (keyed by upstream event id, read
//! back through a group/date ordered query) and the append-only importer run
//! log. Batched reads and writes have hard size ceilings; oversized batches
//! are rejected outright, so callers must chunk.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use muster_core::{Event, EventImage, EventLifecycle, GroupRef, Host, RunError, RunRecord, Venue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "muster-store";

/// Ceiling on the number of keys in one batched read.
pub const MAX_BATCH_GET: usize = 100;
/// Ceiling on the number of items in one batched write.
pub const MAX_BATCH_WRITE: usize = 25;

/// A single attribute value in a flat stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attr {
    S(String),
    N(String),
    L(Vec<Attr>),
    M(BTreeMap<String, Attr>),
}

pub type AttrMap = BTreeMap<String, Attr>;

pub const ATTR_ID: &str = "Id";
pub const ATTR_TITLE: &str = "Title";
pub const ATTR_EVENT_URL: &str = "EventUrl";
pub const ATTR_DESCRIPTION: &str = "Description";
pub const ATTR_DATE_TIME: &str = "EventDateTime";
pub const ATTR_DURATION: &str = "Duration";
pub const ATTR_VENUE: &str = "Venue";
pub const ATTR_GROUP_NAME: &str = "GroupName";
pub const ATTR_GROUP_URL_NAME: &str = "GroupUrlName";
pub const ATTR_HOST_NAME: &str = "HostName";
pub const ATTR_IMAGES: &str = "Images";
pub const ATTR_DELETED_AT: &str = "DeletedAt";

const ATTR_VENUE_NAME: &str = "Name";
const ATTR_VENUE_ADDRESS: &str = "Address";
const ATTR_VENUE_CITY: &str = "City";
const ATTR_VENUE_STATE: &str = "State";
const ATTR_VENUE_POSTAL_CODE: &str = "PostalCode";
const ATTR_IMAGE_BASE_URL: &str = "BaseUrl";
const ATTR_IMAGE_PREVIEW: &str = "Preview";

const ATTR_STARTED_AT: &str = "StartedAt";
const ATTR_FINISHED_AT: &str = "FinishedAt";
const ATTR_SUCCESS_GROUPS: &str = "SuccessGroupNames";
const ATTR_FAILED_GROUPS: &str = "FailedGroupNames";
const ATTR_TOTAL_SAVED: &str = "TotalEventsSaved";
const ATTR_ERRORS: &str = "Errors";
const ATTR_ERROR_NAME: &str = "ErrorName";
const ATTR_ERROR_MESSAGE: &str = "ErrorMessage";
const ATTR_ERROR_GROUP: &str = "GroupName";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("record is missing attribute {0}")]
    MissingAttribute(&'static str),
    #[error("attribute {0} has an unexpected shape")]
    UnexpectedShape(&'static str),
    #[error("attribute {attr} is not a valid timestamp: {source}")]
    BadTimestamp {
        attr: &'static str,
        source: chrono::ParseError,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("the group parameter is required")]
    MissingGroup,
    #[error("{kind} batch of {len} items exceeds the ceiling of {max}")]
    BatchTooLarge {
        kind: &'static str,
        len: usize,
        max: usize,
    },
    #[error("invalid pagination cursor")]
    InvalidCursor,
    #[error("run log record {0} already exists")]
    DuplicateRunRecord(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("table io: {0}")]
    Io(#[from] std::io::Error),
    #[error("table serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Map an [`Event`] onto its flat stored record.
///
/// The deleted-at attribute is omitted entirely for active events so that
/// "attribute does not exist" filters keep working against old records.
pub fn encode_event(event: &Event) -> AttrMap {
    let mut venue = AttrMap::new();
    venue.insert(ATTR_VENUE_NAME.to_string(), Attr::S(event.venue.name.clone()));
    venue.insert(
        ATTR_VENUE_ADDRESS.to_string(),
        Attr::S(event.venue.address.clone()),
    );
    venue.insert(ATTR_VENUE_CITY.to_string(), Attr::S(event.venue.city.clone()));
    venue.insert(ATTR_VENUE_STATE.to_string(), Attr::S(event.venue.state.clone()));
    venue.insert(
        ATTR_VENUE_POSTAL_CODE.to_string(),
        Attr::S(event.venue.postal_code.clone()),
    );

    let images = event
        .images
        .iter()
        .map(|image| {
            let mut inner = AttrMap::new();
            inner.insert(ATTR_IMAGE_BASE_URL.to_string(), Attr::S(image.base_url.clone()));
            inner.insert(ATTR_IMAGE_PREVIEW.to_string(), Attr::S(image.preview.clone()));
            Attr::M(inner)
        })
        .collect();

    let mut map = AttrMap::new();
    map.insert(ATTR_ID.to_string(), Attr::S(event.id.clone()));
    map.insert(ATTR_TITLE.to_string(), Attr::S(event.title.clone()));
    map.insert(ATTR_EVENT_URL.to_string(), Attr::S(event.url.clone()));
    map.insert(
        ATTR_DESCRIPTION.to_string(),
        Attr::S(event.description.clone()),
    );
    map.insert(
        ATTR_DATE_TIME.to_string(),
        Attr::S(event.date_time.to_rfc3339()),
    );
    map.insert(ATTR_DURATION.to_string(), Attr::S(event.duration.clone()));
    map.insert(ATTR_VENUE.to_string(), Attr::M(venue));
    map.insert(ATTR_GROUP_NAME.to_string(), Attr::S(event.group.name.clone()));
    map.insert(
        ATTR_GROUP_URL_NAME.to_string(),
        Attr::S(event.group.url_name.clone()),
    );
    map.insert(ATTR_HOST_NAME.to_string(), Attr::S(event.host.name.clone()));
    map.insert(ATTR_IMAGES.to_string(), Attr::L(images));

    if let Some(at) = event.lifecycle.deleted_at() {
        map.insert(ATTR_DELETED_AT.to_string(), Attr::S(at.to_rfc3339()));
    }

    map
}

/// Inverse of [`encode_event`]. A missing deleted-at attribute decodes to
/// [`EventLifecycle::Active`].
pub fn decode_event(map: &AttrMap) -> Result<Event, CodecError> {
    let venue_map = take_m(map, ATTR_VENUE)?;
    let venue = Venue {
        name: take_s(venue_map, ATTR_VENUE_NAME)?,
        address: take_s(venue_map, ATTR_VENUE_ADDRESS)?,
        city: take_s(venue_map, ATTR_VENUE_CITY)?,
        state: take_s(venue_map, ATTR_VENUE_STATE)?,
        postal_code: take_s(venue_map, ATTR_VENUE_POSTAL_CODE)?,
    };

    let lifecycle = match map.get(ATTR_DELETED_AT) {
        None => EventLifecycle::Active,
        Some(_) => EventLifecycle::Deleted {
            at: take_instant(map, ATTR_DELETED_AT)?,
        },
    };

    Ok(Event {
        id: take_s(map, ATTR_ID)?,
        title: take_s(map, ATTR_TITLE)?,
        url: take_s(map, ATTR_EVENT_URL)?,
        description: take_s(map, ATTR_DESCRIPTION)?,
        date_time: take_instant(map, ATTR_DATE_TIME)?,
        duration: take_s(map, ATTR_DURATION)?,
        venue,
        group: GroupRef {
            name: take_s(map, ATTR_GROUP_NAME)?,
            url_name: take_s(map, ATTR_GROUP_URL_NAME)?,
        },
        host: Host {
            name: take_s(map, ATTR_HOST_NAME)?,
        },
        images: decode_images(map)?,
        lifecycle,
    })
}

pub fn encode_run_record(record: &RunRecord) -> AttrMap {
    let errors = record
        .errors
        .iter()
        .map(|error| {
            let mut inner = AttrMap::new();
            inner.insert(
                ATTR_ERROR_NAME.to_string(),
                Attr::S(error.error_name.clone()),
            );
            inner.insert(
                ATTR_ERROR_MESSAGE.to_string(),
                Attr::S(error.error_message.clone()),
            );
            if let Some(group) = &error.group_name {
                inner.insert(ATTR_ERROR_GROUP.to_string(), Attr::S(group.clone()));
            }
            Attr::M(inner)
        })
        .collect();

    let mut map = AttrMap::new();
    map.insert(ATTR_ID.to_string(), Attr::S(record.id.to_string()));
    map.insert(
        ATTR_STARTED_AT.to_string(),
        Attr::S(record.started_at.to_rfc3339()),
    );
    map.insert(
        ATTR_FINISHED_AT.to_string(),
        Attr::S(record.finished_at.to_rfc3339()),
    );
    map.insert(
        ATTR_SUCCESS_GROUPS.to_string(),
        Attr::L(string_list(&record.success_group_names)),
    );
    map.insert(
        ATTR_FAILED_GROUPS.to_string(),
        Attr::L(string_list(&record.failed_group_names)),
    );
    map.insert(
        ATTR_TOTAL_SAVED.to_string(),
        Attr::N(record.total_events_saved.to_string()),
    );
    map.insert(ATTR_ERRORS.to_string(), Attr::L(errors));
    map
}

pub fn decode_run_record(map: &AttrMap) -> Result<RunRecord, CodecError> {
    let id = Uuid::parse_str(&take_s(map, ATTR_ID)?)
        .map_err(|_| CodecError::UnexpectedShape(ATTR_ID))?;

    let total_events_saved = match map.get(ATTR_TOTAL_SAVED) {
        Some(Attr::N(raw)) => raw
            .parse()
            .map_err(|_| CodecError::UnexpectedShape(ATTR_TOTAL_SAVED))?,
        Some(_) => return Err(CodecError::UnexpectedShape(ATTR_TOTAL_SAVED)),
        None => return Err(CodecError::MissingAttribute(ATTR_TOTAL_SAVED)),
    };

    Ok(RunRecord {
        id,
        started_at: take_instant(map, ATTR_STARTED_AT)?,
        finished_at: take_instant(map, ATTR_FINISHED_AT)?,
        success_group_names: take_string_list(map, ATTR_SUCCESS_GROUPS)?,
        failed_group_names: take_string_list(map, ATTR_FAILED_GROUPS)?,
        total_events_saved,
        errors: decode_run_errors(map)?,
    })
}

fn string_list(values: &[String]) -> Vec<Attr> {
    values.iter().map(|v| Attr::S(v.clone())).collect()
}

fn take_s(map: &AttrMap, key: &'static str) -> Result<String, CodecError> {
    match map.get(key) {
        Some(Attr::S(value)) => Ok(value.clone()),
        Some(_) => Err(CodecError::UnexpectedShape(key)),
        None => Err(CodecError::MissingAttribute(key)),
    }
}

fn take_m<'a>(map: &'a AttrMap, key: &'static str) -> Result<&'a AttrMap, CodecError> {
    match map.get(key) {
        Some(Attr::M(inner)) => Ok(inner),
        Some(_) => Err(CodecError::UnexpectedShape(key)),
        None => Err(CodecError::MissingAttribute(key)),
    }
}

fn take_l<'a>(map: &'a AttrMap, key: &'static str) -> Result<&'a [Attr], CodecError> {
    match map.get(key) {
        Some(Attr::L(items)) => Ok(items),
        Some(_) => Err(CodecError::UnexpectedShape(key)),
        None => Err(CodecError::MissingAttribute(key)),
    }
}

fn take_instant(map: &AttrMap, key: &'static str) -> Result<DateTime<Utc>, CodecError> {
    let raw = take_s(map, key)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| CodecError::BadTimestamp { attr: key, source })
}

fn take_string_list(map: &AttrMap, key: &'static str) -> Result<Vec<String>, CodecError> {
    take_l(map, key)?
        .iter()
        .map(|item| match item {
            Attr::S(value) => Ok(value.clone()),
            _ => Err(CodecError::UnexpectedShape(key)),
        })
        .collect()
}

fn decode_images(map: &AttrMap) -> Result<Vec<EventImage>, CodecError> {
    let mut images = Vec::new();
    for item in take_l(map, ATTR_IMAGES)? {
        let Attr::M(inner) = item else {
            return Err(CodecError::UnexpectedShape(ATTR_IMAGES));
        };
        images.push(EventImage {
            base_url: take_s(inner, ATTR_IMAGE_BASE_URL)?,
            preview: take_s(inner, ATTR_IMAGE_PREVIEW)?,
        });
    }
    Ok(images)
}

fn decode_run_errors(map: &AttrMap) -> Result<Vec<RunError>, CodecError> {
    let mut errors = Vec::new();
    for item in take_l(map, ATTR_ERRORS)? {
        let Attr::M(inner) = item else {
            return Err(CodecError::UnexpectedShape(ATTR_ERRORS));
        };
        let group_name = match inner.get(ATTR_ERROR_GROUP) {
            None => None,
            Some(_) => Some(take_s(inner, ATTR_ERROR_GROUP)?),
        };
        errors.push(RunError {
            error_name: take_s(inner, ATTR_ERROR_NAME)?,
            error_message: take_s(inner, ATTR_ERROR_MESSAGE)?,
            group_name,
        });
    }
    Ok(errors)
}

/// One table persisted as a JSON snapshot file, rewritten atomically via a
/// temp-file rename on every mutation.
#[derive(Debug)]
struct TableStore {
    path: PathBuf,
    rows: Mutex<BTreeMap<String, AttrMap>>,
}

impl TableStore {
    async fn open(path: PathBuf) -> Result<Self, StoreError> {
        let rows = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            rows: Mutex::new(rows),
        })
    }

    async fn persist(&self, rows: &BTreeMap<String, AttrMap>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(rows)?;
        let temp = self.path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        fs::write(&temp, &bytes).await?;
        match fs::rename(&temp, &self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), rows = rows.len(), "persisted table");
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&temp).await;
                Err(err.into())
            }
        }
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<AttrMap>, StoreError> {
        if keys.len() > MAX_BATCH_GET {
            return Err(StoreError::BatchTooLarge {
                kind: "read",
                len: keys.len(),
                max: MAX_BATCH_GET,
            });
        }
        let rows = self.rows.lock().await;
        Ok(keys.iter().filter_map(|key| rows.get(key).cloned()).collect())
    }

    async fn put_many(&self, items: Vec<(String, AttrMap)>) -> Result<(), StoreError> {
        if items.len() > MAX_BATCH_WRITE {
            return Err(StoreError::BatchTooLarge {
                kind: "write",
                len: items.len(),
                max: MAX_BATCH_WRITE,
            });
        }
        let mut rows = self.rows.lock().await;
        for (key, item) in items {
            rows.insert(key, item);
        }
        self.persist(&rows).await
    }

    async fn insert_new(&self, key: String, item: AttrMap) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&key) {
            return Err(StoreError::DuplicateRunRecord(key));
        }
        rows.insert(key, item);
        self.persist(&rows).await
    }

    async fn page_after(
        &self,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<AttrMap>, Option<String>), StoreError> {
        if limit > MAX_BATCH_GET {
            return Err(StoreError::BatchTooLarge {
                kind: "read",
                len: limit,
                max: MAX_BATCH_GET,
            });
        }
        let rows = self.rows.lock().await;
        let range: Box<dyn Iterator<Item = (&String, &AttrMap)> + '_> = match start_after {
            Some(start) => Box::new(
                rows.range((Bound::Excluded(start.to_string()), Bound::Unbounded)),
            ),
            None => Box::new(rows.iter()),
        };

        let mut out = Vec::with_capacity(limit);
        let mut emitted_last: Option<&String> = None;
        let mut next = None;
        for (key, item) in range {
            if out.len() == limit {
                next = emitted_last.cloned();
                break;
            }
            out.push(item.clone());
            emitted_last = Some(key);
        }
        Ok((out, next))
    }

    async fn snapshot(&self) -> Vec<AttrMap> {
        let rows = self.rows.lock().await;
        rows.values().cloned().collect()
    }
}

/// Filters for the group-scoped read path. Bounds are inclusive; either may
/// be omitted.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub count: usize,
    pub cursor: Option<String>,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
}

/// Persistence seam shared by the importer and the read API.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Fetch up to [`MAX_BATCH_GET`] events by id. Absent ids are skipped.
    async fn batch_get(&self, ids: &[String]) -> Result<Vec<Event>, StoreError>;

    /// Upsert up to [`MAX_BATCH_WRITE`] events keyed by their id.
    async fn batch_put(&self, events: &[Event]) -> Result<(), StoreError>;

    /// Walk the whole events table one bounded page at a time, in primary-key
    /// order. The returned cursor resumes after the last item of the page.
    async fn scan_page(
        &self,
        start_after: Option<String>,
        limit: usize,
    ) -> Result<(Vec<Event>, Option<String>), StoreError>;

    /// Non-deleted events of one group, ascending by date, with an opaque
    /// continuation cursor. The group is mandatory.
    async fn query_group_events(
        &self,
        group_url_name: &str,
        query: EventQuery,
    ) -> Result<(Vec<Event>, Option<String>), StoreError>;

    /// Append one run-log record. Pure insert: an existing (id, started-at)
    /// key is an error, never an overwrite.
    async fn append_run_record(&self, record: &RunRecord) -> Result<(), StoreError>;
}

/// [`EventStore`] over two JSON-file tables in one data directory.
#[derive(Debug)]
pub struct FileEventStore {
    events: TableStore,
    run_log: TableStore,
}

impl FileEventStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        Ok(Self {
            events: TableStore::open(dir.join("events.json")).await?,
            run_log: TableStore::open(dir.join("importer-log.json")).await?,
        })
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    async fn batch_get(&self, ids: &[String]) -> Result<Vec<Event>, StoreError> {
        let items = self.events.get_many(ids).await?;
        let mut events = Vec::with_capacity(items.len());
        for item in &items {
            events.push(decode_event(item)?);
        }
        Ok(events)
    }

    async fn batch_put(&self, events: &[Event]) -> Result<(), StoreError> {
        let items = events
            .iter()
            .map(|event| (event.id.clone(), encode_event(event)))
            .collect();
        self.events.put_many(items).await
    }

    async fn scan_page(
        &self,
        start_after: Option<String>,
        limit: usize,
    ) -> Result<(Vec<Event>, Option<String>), StoreError> {
        let (items, next) = self.events.page_after(start_after.as_deref(), limit).await?;
        let mut events = Vec::with_capacity(items.len());
        for item in &items {
            events.push(decode_event(item)?);
        }
        Ok((events, next))
    }

    async fn query_group_events(
        &self,
        group_url_name: &str,
        query: EventQuery,
    ) -> Result<(Vec<Event>, Option<String>), StoreError> {
        if group_url_name.is_empty() {
            return Err(StoreError::MissingGroup);
        }
        let resume = match &query.cursor {
            Some(cursor) => Some(decode_cursor(cursor)?),
            None => None,
        };

        let mut events = Vec::new();
        for item in self.events.snapshot().await {
            let event = decode_event(&item)?;
            if event.group.url_name != group_url_name || !event.lifecycle.is_active() {
                continue;
            }
            if let Some(after) = query.after {
                if event.date_time < after {
                    continue;
                }
            }
            if let Some(before) = query.before {
                if event.date_time > before {
                    continue;
                }
            }
            if let Some((resume_id, resume_at)) = &resume {
                if (event.date_time, &event.id) <= (*resume_at, resume_id) {
                    continue;
                }
            }
            events.push(event);
        }
        events.sort_by(|a, b| (a.date_time, &a.id).cmp(&(b.date_time, &b.id)));

        let has_more = events.len() > query.count;
        events.truncate(query.count);
        let next_cursor = if has_more {
            events.last().map(|event| encode_cursor(&event.id, event.date_time))
        } else {
            None
        };
        Ok((events, next_cursor))
    }

    async fn append_run_record(&self, record: &RunRecord) -> Result<(), StoreError> {
        let key = format!("{}#{}", record.id, record.started_at.to_rfc3339());
        self.run_log.insert_new(key, encode_run_record(record)).await
    }
}

/// The read-path cursor encodes the last-seen (id, date-time) pair so the
/// next page resumes exactly after that item.
fn encode_cursor(id: &str, date_time: DateTime<Utc>) -> String {
    format!(
        "{}.{}",
        hex::encode(id),
        hex::encode(date_time.to_rfc3339())
    )
}

fn decode_cursor(cursor: &str) -> Result<(String, DateTime<Utc>), StoreError> {
    let (id_part, at_part) = cursor.split_once('.').ok_or(StoreError::InvalidCursor)?;
    let id = String::from_utf8(hex::decode(id_part).map_err(|_| StoreError::InvalidCursor)?)
        .map_err(|_| StoreError::InvalidCursor)?;
    let raw_at = String::from_utf8(hex::decode(at_part).map_err(|_| StoreError::InvalidCursor)?)
        .map_err(|_| StoreError::InvalidCursor)?;
    let at = DateTime::parse_from_rfc3339(&raw_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidCursor)?;
    Ok((id, at))
}
