//! Core domain model and run-log types for Muster.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "muster-core";

/// A configured source community whose events are imported as a unit.
///
/// `url_name` is the stable identifier: it parameterizes the upstream query
/// and partitions the store's group/date index. `name` is display-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub url_name: String,
}

/// The community an event belongs to, as reported upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRef {
    pub name: String,
    pub url_name: String,
}

/// Where an event takes place. Upstream may omit any of these fields;
/// stored records always carry all five (empty string when unknown).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Venue {
    pub name: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventImage {
    pub base_url: String,
    pub preview: String,
}

/// Lifecycle state of a stored event.
///
/// `Deleted` means the event stopped being reported upstream as of the run
/// that marked it; records are never physically removed. The storage
/// encoding represents this via presence/absence of a deleted-at attribute,
/// but in memory the state is explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLifecycle {
    Active,
    Deleted { at: DateTime<Utc> },
}

impl EventLifecycle {
    pub fn is_active(&self) -> bool {
        matches!(self, EventLifecycle::Active)
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        match self {
            EventLifecycle::Active => None,
            EventLifecycle::Deleted { at } => Some(*at),
        }
    }
}

/// Canonical normalized event record.
///
/// `id` is assigned by the upstream source and is globally unique across
/// groups; it is the primary key in the store. `date_time` doubles as the
/// within-group sort key and the boundary for "future" queries.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub title: String,
    pub url: String,
    pub description: String,
    pub date_time: DateTime<Utc>,
    pub duration: String,
    pub venue: Venue,
    pub group: GroupRef,
    pub host: Host,
    pub images: Vec<EventImage>,
    pub lifecycle: EventLifecycle,
}

impl Event {
    /// True when the event is still in the future relative to `now` and has
    /// not been soft-deleted. Only such events are reconciliation candidates.
    pub fn is_upcoming(&self, now: DateTime<Utc>) -> bool {
        self.lifecycle.is_active() && self.date_time > now
    }
}

/// One importer run's structured summary. Append-only, written exactly once
/// per invocation after all groups have been processed or attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success_group_names: Vec<String>,
    pub failed_group_names: Vec<String>,
    pub total_events_saved: u64,
    pub errors: Vec<RunError>,
}

/// A single captured failure, with the group it belongs to when the failure
/// was scoped to one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub error_name: String,
    pub error_message: String,
    pub group_name: Option<String>,
}

/// Time source seam so horizon and "future" cutoffs are testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Frozen clock for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
