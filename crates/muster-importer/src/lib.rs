//! The reconciliation pipeline: fetch each configured group's upcoming
//! events, diff them against previously stored future events, upsert and
//! soft-delete in bounded batches, and append one run-log record per
//! invocation.
//!
//! Groups are processed sequentially and independently; a failure in one
//! never aborts its siblings. The only fatal failure is token acquisition,
//! and even that still produces a run-log record.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Months, Utc};
use muster_client::{
    ClientConfig, GraphQlEventsClient, HttpTokenSupplier, TokenConfig, TokenSupplier,
    UpstreamEvents, DEFAULT_PAGE_SIZE,
};
use muster_core::{Clock, EventLifecycle, Group, RunError, RunRecord, SystemClock};
use muster_store::{EventStore, FileEventStore, StoreError, MAX_BATCH_GET, MAX_BATCH_WRITE};
use serde::Deserialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "muster-importer";

/// Page size for the pre-run scan of stored future events. Pinned to the
/// store's read ceiling.
const SCAN_PAGE_SIZE: usize = MAX_BATCH_GET;

/// The `groups.yaml` registry: the source communities imported each run.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupRegistry {
    pub groups: Vec<Group>,
}

#[derive(Debug, Clone)]
pub struct ImporterConfig {
    pub data_dir: PathBuf,
    pub registry_path: PathBuf,
    pub upstream_url: String,
    pub token_url: String,
    pub token_params: Vec<(String, String)>,
    pub horizon_months: u32,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub import_cron: String,
}

impl ImporterConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("MUSTER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            registry_path: std::env::var("MUSTER_GROUPS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("groups.yaml")),
            upstream_url: std::env::var("MUSTER_UPSTREAM_URL")
                .unwrap_or_else(|_| "https://api.meetup.com/gql".to_string()),
            token_url: std::env::var("MUSTER_TOKEN_URL")
                .unwrap_or_else(|_| "https://secure.meetup.com/oauth2/access".to_string()),
            token_params: parse_token_params(
                &std::env::var("MUSTER_TOKEN_PARAMS").unwrap_or_default(),
            ),
            horizon_months: std::env::var("MUSTER_HORIZON_MONTHS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(6),
            http_timeout_secs: std::env::var("MUSTER_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            scheduler_enabled: std::env::var("MUSTER_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            import_cron: std::env::var("MUSTER_IMPORT_CRON")
                .unwrap_or_else(|_| "0 0 */2 * * *".to_string()),
        }
    }
}

/// `MUSTER_TOKEN_PARAMS` holds the token endpoint's secret form parameters
/// as `key=value` pairs separated by `;`.
fn parse_token_params(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

pub async fn load_group_registry(path: &Path) -> Result<Vec<Group>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let registry: GroupRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(registry.groups)
}

/// What one group's processing contributed to the run. Outcomes are merged
/// centrally so no mutable bookkeeping is shared across group steps.
struct GroupOutcome {
    group_name: String,
    saved: u64,
    error: Option<RunError>,
}

pub struct Reconciler {
    groups: Vec<Group>,
    horizon_months: u32,
    clock: Arc<dyn Clock>,
    store: Arc<dyn EventStore>,
    upstream: Arc<dyn UpstreamEvents>,
    tokens: Arc<dyn TokenSupplier>,
}

impl Reconciler {
    pub fn new(
        groups: Vec<Group>,
        horizon_months: u32,
        clock: Arc<dyn Clock>,
        store: Arc<dyn EventStore>,
        upstream: Arc<dyn UpstreamEvents>,
        tokens: Arc<dyn TokenSupplier>,
    ) -> Self {
        Self {
            groups,
            horizon_months,
            clock,
            store,
            upstream,
            tokens,
        }
    }

    /// Execute one reconciliation run. Always produces exactly one run-log
    /// record, even when token acquisition fails before any group work.
    pub async fn run(&self) -> RunRecord {
        let started_at = self.clock.now();
        let mut errors: Vec<RunError> = Vec::new();

        let token = match self.tokens.bearer_token().await {
            Ok(token) => token,
            Err(err) => {
                error!(error = %err, "token acquisition failed; aborting run");
                let record = RunRecord {
                    id: Uuid::new_v4(),
                    started_at,
                    finished_at: self.clock.now(),
                    success_group_names: Vec::new(),
                    failed_group_names: self.groups.iter().map(|g| g.name.clone()).collect(),
                    total_events_saved: 0,
                    errors: vec![run_error("TokenAcquisition", &err, None)],
                };
                self.write_log(&record).await;
                return record;
            }
        };

        // Events known-future before this run; every id still reported by a
        // group below is struck from the set. A load failure degrades the
        // deletion pass to a no-op rather than aborting the run.
        let mut to_delete = match self.load_known_future_ids(started_at).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "failed to load known future events; skipping deletion pass");
                errors.push(run_error("LoadKnownFutureEvents", &err, None));
                HashSet::new()
            }
        };

        let horizon = started_at
            .checked_add_months(Months::new(self.horizon_months))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut success_group_names = Vec::new();
        let mut failed_group_names = Vec::new();
        let mut total_events_saved = 0u64;

        for group in &self.groups {
            let outcome = self
                .import_group(group, &token, horizon, &mut to_delete)
                .await;
            total_events_saved += outcome.saved;
            match outcome.error {
                None => success_group_names.push(outcome.group_name),
                Some(run_err) => {
                    failed_group_names.push(outcome.group_name);
                    errors.push(run_err);
                }
            }
        }

        let finished_at = self.clock.now();
        if let Err(err) = self.soft_delete(to_delete, finished_at).await {
            errors.push(run_error("ReconcileDeletions", &err, None));
        }

        let record = RunRecord {
            id: Uuid::new_v4(),
            started_at,
            finished_at,
            success_group_names,
            failed_group_names,
            total_events_saved,
            errors,
        };
        self.write_log(&record).await;
        record
    }

    async fn import_group(
        &self,
        group: &Group,
        token: &str,
        horizon: DateTime<Utc>,
        to_delete: &mut HashSet<String>,
    ) -> GroupOutcome {
        let fetched = match self
            .upstream
            .fetch_group_events(&group.url_name, token, horizon)
            .await
        {
            Ok(events) => events,
            Err(err) => {
                // No positive evidence the group's events disappeared, only
                // that the fetch failed, so its ids stay out of `to_delete`.
                warn!(group = %group.url_name, error = %err, "upstream fetch failed");
                return GroupOutcome {
                    group_name: group.name.clone(),
                    saved: 0,
                    error: Some(run_error("UpstreamFetch", &err, Some(&group.name))),
                };
            }
        };

        for event in &fetched {
            to_delete.remove(&event.id);
        }

        let mut saved = 0u64;
        for chunk in fetched.chunks(MAX_BATCH_WRITE) {
            if let Err(err) = self.store.batch_put(chunk).await {
                warn!(group = %group.url_name, error = %err, "store write failed");
                return GroupOutcome {
                    group_name: group.name.clone(),
                    saved,
                    error: Some(run_error("StoreWrite", &err, Some(&group.name))),
                };
            }
            saved += chunk.len() as u64;
        }

        info!(group = %group.url_name, fetched = fetched.len(), "imported group events");
        GroupOutcome {
            group_name: group.name.clone(),
            saved,
            error: None,
        }
    }

    /// Ids of every stored non-deleted event still in the future, across all
    /// groups found in storage — not just the ones configured this run.
    async fn load_known_future_ids(
        &self,
        now: DateTime<Utc>,
    ) -> Result<HashSet<String>, StoreError> {
        let mut ids = HashSet::new();
        let mut cursor = None;
        loop {
            let (events, next) = self.store.scan_page(cursor, SCAN_PAGE_SIZE).await?;
            for event in events {
                if event.is_upcoming(now) {
                    ids.insert(event.id);
                }
            }
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(ids)
    }

    /// Flag events that were known-future before the run but went unreported
    /// by every group this run. Reads and writes are chunked to the store's
    /// batch ceilings.
    async fn soft_delete(
        &self,
        ids: HashSet<String>,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut ids: Vec<String> = ids.into_iter().collect();
        ids.sort();
        info!(count = ids.len(), "soft-deleting events no longer reported upstream");

        for read_chunk in ids.chunks(MAX_BATCH_GET) {
            let mut events = self.store.batch_get(read_chunk).await?;
            for event in &mut events {
                event.lifecycle = EventLifecycle::Deleted { at: deleted_at };
            }
            for write_chunk in events.chunks(MAX_BATCH_WRITE) {
                self.store.batch_put(write_chunk).await?;
            }
        }
        Ok(())
    }

    async fn write_log(&self, record: &RunRecord) {
        // Reconciliation work is already committed; losing the log entry
        // must not undo it.
        if let Err(err) = self.store.append_run_record(record).await {
            error!(run_id = %record.id, error = %err, "failed to append run-log record");
        }
    }
}

pub async fn reconciler_from_config(config: &ImporterConfig) -> Result<Reconciler> {
    let groups = load_group_registry(&config.registry_path).await?;
    let store = FileEventStore::open(config.data_dir.clone())
        .await
        .context("opening event store")?;
    let upstream = GraphQlEventsClient::new(ClientConfig {
        endpoint: config.upstream_url.clone(),
        page_size: DEFAULT_PAGE_SIZE,
        timeout: Duration::from_secs(config.http_timeout_secs),
    })
    .context("building upstream client")?;
    let tokens = HttpTokenSupplier::new(TokenConfig {
        endpoint: config.token_url.clone(),
        params: config.token_params.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
    })
    .context("building token supplier")?;

    Ok(Reconciler::new(
        groups,
        config.horizon_months,
        Arc::new(SystemClock),
        Arc::new(store),
        Arc::new(upstream),
        Arc::new(tokens),
    ))
}

pub async fn run_import_once_from_env() -> Result<RunRecord> {
    let config = ImporterConfig::from_env();
    let reconciler = reconciler_from_config(&config).await?;
    Ok(reconciler.run().await)
}

/// Build the periodic-import scheduler when enabled by config. The caller
/// owns starting it and keeping the process alive.
pub async fn maybe_build_scheduler(config: &ImporterConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let reconciler = Arc::new(reconciler_from_config(config).await?);
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.import_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let reconciler = Arc::clone(&reconciler);
        Box::pin(async move {
            let record = reconciler.run().await;
            info!(
                run_id = %record.id,
                saved = record.total_events_saved,
                failed_groups = record.failed_group_names.len(),
                "scheduled import finished"
            );
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

fn run_error(name: &str, err: &dyn std::fmt::Display, group_name: Option<&str>) -> RunError {
    RunError {
        error_name: name.to_string(),
        error_message: err.to_string(),
        group_name: group_name.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use muster_client::{ClientError, TokenError};
    use muster_core::{Event, FixedClock, GroupRef, Host, Venue};
    use muster_store::EventQuery;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn group(name: &str) -> Group {
        Group {
            name: name.to_string(),
            url_name: name.to_string(),
        }
    }

    fn mk_event(id: &str, group: &str, date_time: DateTime<Utc>) -> Event {
        Event {
            id: id.to_string(),
            title: format!("Event {id}"),
            url: format!("https://example.com/events/{id}"),
            description: String::new(),
            date_time,
            duration: "2h".to_string(),
            venue: Venue::default(),
            group: GroupRef {
                name: group.to_string(),
                url_name: group.to_string(),
            },
            host: Host::default(),
            images: vec![],
            lifecycle: EventLifecycle::Active,
        }
    }

    #[derive(Default)]
    struct FakeStore {
        rows: Mutex<BTreeMap<String, Event>>,
        run_records: Mutex<Vec<RunRecord>>,
        get_batch_sizes: Mutex<Vec<usize>>,
        put_batch_sizes: Mutex<Vec<usize>>,
        fail_scan: bool,
    }

    impl FakeStore {
        fn seeded(events: Vec<Event>) -> Self {
            let store = Self::default();
            {
                let mut rows = store.rows.lock().unwrap();
                for event in events {
                    rows.insert(event.id.clone(), event);
                }
            }
            store
        }

        fn event(&self, id: &str) -> Option<Event> {
            self.rows.lock().unwrap().get(id).cloned()
        }
    }

    #[async_trait]
    impl EventStore for FakeStore {
        async fn batch_get(&self, ids: &[String]) -> Result<Vec<Event>, StoreError> {
            if ids.len() > MAX_BATCH_GET {
                return Err(StoreError::BatchTooLarge {
                    kind: "read",
                    len: ids.len(),
                    max: MAX_BATCH_GET,
                });
            }
            self.get_batch_sizes.lock().unwrap().push(ids.len());
            let rows = self.rows.lock().unwrap();
            Ok(ids.iter().filter_map(|id| rows.get(id).cloned()).collect())
        }

        async fn batch_put(&self, events: &[Event]) -> Result<(), StoreError> {
            if events.len() > MAX_BATCH_WRITE {
                return Err(StoreError::BatchTooLarge {
                    kind: "write",
                    len: events.len(),
                    max: MAX_BATCH_WRITE,
                });
            }
            self.put_batch_sizes.lock().unwrap().push(events.len());
            let mut rows = self.rows.lock().unwrap();
            for event in events {
                rows.insert(event.id.clone(), event.clone());
            }
            Ok(())
        }

        async fn scan_page(
            &self,
            start_after: Option<String>,
            limit: usize,
        ) -> Result<(Vec<Event>, Option<String>), StoreError> {
            if self.fail_scan {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "scan failed",
                )));
            }
            let rows = self.rows.lock().unwrap();
            let keys: Vec<String> = rows.keys().cloned().collect();
            let start = match &start_after {
                Some(after) => keys.iter().position(|key| key > after).unwrap_or(keys.len()),
                None => 0,
            };
            let page: Vec<Event> = keys[start..]
                .iter()
                .take(limit)
                .map(|key| rows[key].clone())
                .collect();
            let next = if start + page.len() < keys.len() {
                keys.get(start + page.len() - 1).cloned()
            } else {
                None
            };
            Ok((page, next))
        }

        async fn query_group_events(
            &self,
            _group_url_name: &str,
            _query: EventQuery,
        ) -> Result<(Vec<Event>, Option<String>), StoreError> {
            unimplemented!("the importer never uses the read path")
        }

        async fn append_run_record(&self, record: &RunRecord) -> Result<(), StoreError> {
            self.run_records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeUpstream {
        responses: BTreeMap<String, Vec<Event>>,
        failing: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl UpstreamEvents for FakeUpstream {
        async fn fetch_group_events(
            &self,
            group_url_name: &str,
            _token: &str,
            _horizon: DateTime<Utc>,
        ) -> Result<Vec<Event>, ClientError> {
            self.calls.lock().unwrap().push(group_url_name.to_string());
            if self.failing.contains(group_url_name) {
                return Err(ClientError::UnknownGroup(group_url_name.to_string()));
            }
            Ok(self
                .responses
                .get(group_url_name)
                .cloned()
                .unwrap_or_default())
        }
    }

    struct FakeTokens {
        fail: bool,
    }

    #[async_trait]
    impl TokenSupplier for FakeTokens {
        async fn bearer_token(&self) -> Result<String, TokenError> {
            if self.fail {
                Err(TokenError::Rejected {
                    name: "JsonWebTokenError".to_string(),
                    message: "invalid signature".to_string(),
                })
            } else {
                Ok("token-123".to_string())
            }
        }
    }

    fn reconciler(
        groups: Vec<Group>,
        store: Arc<FakeStore>,
        upstream: FakeUpstream,
        tokens: FakeTokens,
    ) -> Reconciler {
        Reconciler::new(
            groups,
            6,
            Arc::new(FixedClock(now())),
            store,
            Arc::new(upstream),
            Arc::new(tokens),
        )
    }

    #[tokio::test]
    async fn unreported_future_event_is_soft_deleted() {
        let store = Arc::new(FakeStore::seeded(vec![mk_event(
            "1",
            "sgfdevs",
            now() + chrono::Duration::weeks(1),
        )]));
        let mut upstream = FakeUpstream::default();
        upstream.responses.insert("sgfdevs".to_string(), vec![]);

        let record = reconciler(
            vec![group("sgfdevs")],
            Arc::clone(&store),
            upstream,
            FakeTokens { fail: false },
        )
        .run()
        .await;

        assert_eq!(record.success_group_names, vec!["sgfdevs"]);
        assert!(record.failed_group_names.is_empty());
        assert_eq!(record.total_events_saved, 0);
        assert!(record.errors.is_empty());

        let event = store.event("1").expect("event kept in store");
        assert_eq!(event.lifecycle.deleted_at(), Some(record.finished_at));
        assert_eq!(store.run_records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn new_upstream_event_is_upserted() {
        let store = Arc::new(FakeStore::default());
        let incoming = mk_event("2", "sgfdevs", now() + chrono::Duration::weeks(2));
        let mut upstream = FakeUpstream::default();
        upstream
            .responses
            .insert("sgfdevs".to_string(), vec![incoming.clone()]);

        let record = reconciler(
            vec![group("sgfdevs")],
            Arc::clone(&store),
            upstream,
            FakeTokens { fail: false },
        )
        .run()
        .await;

        assert_eq!(record.total_events_saved, 1);
        assert_eq!(record.success_group_names, vec!["sgfdevs"]);
        assert_eq!(store.event("2"), Some(incoming));
    }

    #[tokio::test]
    async fn fetch_failure_never_deletes_that_groups_events() {
        let store = Arc::new(FakeStore::seeded(vec![mk_event(
            "10",
            "open-sgf",
            now() + chrono::Duration::weeks(1),
        )]));
        let mut upstream = FakeUpstream::default();
        upstream.failing.insert("open-sgf".to_string());
        upstream.responses.insert("sgfdevs".to_string(), vec![]);

        let record = reconciler(
            vec![group("open-sgf"), group("sgfdevs")],
            Arc::clone(&store),
            upstream,
            FakeTokens { fail: false },
        )
        .run()
        .await;

        assert_eq!(record.failed_group_names, vec!["open-sgf"]);
        assert_eq!(record.success_group_names, vec!["sgfdevs"]);
        assert_eq!(record.errors.len(), 1);
        assert_eq!(record.errors[0].error_name, "UpstreamFetch");
        assert_eq!(record.errors[0].group_name.as_deref(), Some("open-sgf"));

        let event = store.event("10").expect("event kept in store");
        assert!(event.lifecycle.is_active());
    }

    #[tokio::test]
    async fn past_events_are_never_deletion_candidates() {
        let store = Arc::new(FakeStore::seeded(vec![mk_event(
            "old",
            "sgfdevs",
            now() - chrono::Duration::days(1),
        )]));
        let mut upstream = FakeUpstream::default();
        upstream.responses.insert("sgfdevs".to_string(), vec![]);

        reconciler(
            vec![group("sgfdevs")],
            Arc::clone(&store),
            upstream,
            FakeTokens { fail: false },
        )
        .run()
        .await;

        let event = store.event("old").expect("event kept in store");
        assert!(event.lifecycle.is_active());
    }

    #[tokio::test]
    async fn repeated_runs_with_unchanged_upstream_are_idempotent() {
        let store = Arc::new(FakeStore::default());
        let events: Vec<Event> = (0..3)
            .map(|i| {
                mk_event(
                    &format!("ev-{i}"),
                    "sgfdevs",
                    now() + chrono::Duration::weeks(i + 1),
                )
            })
            .collect();
        let mut upstream = FakeUpstream::default();
        upstream.responses.insert("sgfdevs".to_string(), events);

        let rec = reconciler(
            vec![group("sgfdevs")],
            Arc::clone(&store),
            upstream,
            FakeTokens { fail: false },
        );

        let first = rec.run().await;
        let rows_after_first = store.rows.lock().unwrap().clone();
        let second = rec.run().await;
        let rows_after_second = store.rows.lock().unwrap().clone();

        assert_eq!(first.total_events_saved, 3);
        assert_eq!(second.total_events_saved, 3);
        assert_eq!(rows_after_first, rows_after_second);
        assert!(rows_after_second.values().all(|e| e.lifecycle.is_active()));
        // Nothing qualified for deletion in either run.
        assert!(store.get_batch_sizes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deletions_are_chunked_to_the_batch_ceilings() {
        let events: Vec<Event> = (0..230)
            .map(|i| {
                mk_event(
                    &format!("ev-{i:03}"),
                    "sgfdevs",
                    now() + chrono::Duration::days(i % 30 + 1),
                )
            })
            .collect();
        let store = Arc::new(FakeStore::seeded(events));
        let mut upstream = FakeUpstream::default();
        upstream.responses.insert("sgfdevs".to_string(), vec![]);

        reconciler(
            vec![group("sgfdevs")],
            Arc::clone(&store),
            upstream,
            FakeTokens { fail: false },
        )
        .run()
        .await;

        let gets = store.get_batch_sizes.lock().unwrap().clone();
        let puts = store.put_batch_sizes.lock().unwrap().clone();
        assert_eq!(gets, vec![100, 100, 30]);
        assert!(puts.iter().all(|&size| size <= MAX_BATCH_WRITE));
        assert_eq!(puts.iter().sum::<usize>(), 230);

        let rows = store.rows.lock().unwrap();
        assert!(rows.values().all(|e| !e.lifecycle.is_active()));
        assert_eq!(rows.len(), 230);
    }

    #[tokio::test]
    async fn token_failure_still_writes_exactly_one_run_record() {
        let store = Arc::new(FakeStore::default());
        let upstream = FakeUpstream::default();

        let record = reconciler(
            vec![group("open-sgf"), group("sgfdevs")],
            Arc::clone(&store),
            upstream,
            FakeTokens { fail: true },
        )
        .run()
        .await;

        assert!(record.success_group_names.is_empty());
        assert_eq!(record.failed_group_names, vec!["open-sgf", "sgfdevs"]);
        assert_eq!(record.errors.len(), 1);
        assert_eq!(record.errors[0].error_name, "TokenAcquisition");
        assert_eq!(record.errors[0].group_name, None);
        assert_eq!(store.run_records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_load_failure_degrades_to_no_deletions() {
        let mut store = FakeStore::seeded(vec![mk_event(
            "keep",
            "sgfdevs",
            now() + chrono::Duration::weeks(1),
        )]);
        store.fail_scan = true;
        let store = Arc::new(store);
        let mut upstream = FakeUpstream::default();
        upstream.responses.insert("sgfdevs".to_string(), vec![]);

        let record = reconciler(
            vec![group("sgfdevs")],
            Arc::clone(&store),
            upstream,
            FakeTokens { fail: false },
        )
        .run()
        .await;

        assert_eq!(record.success_group_names, vec!["sgfdevs"]);
        assert!(record
            .errors
            .iter()
            .any(|e| e.error_name == "LoadKnownFutureEvents"));
        let event = store.event("keep").expect("event kept in store");
        assert!(event.lifecycle.is_active());
    }

    #[tokio::test]
    async fn event_moving_between_groups_is_a_plain_upsert() {
        let store = Arc::new(FakeStore::seeded(vec![mk_event(
            "mover",
            "open-sgf",
            now() + chrono::Duration::weeks(1),
        )]));
        let moved = mk_event("mover", "sgfdevs", now() + chrono::Duration::weeks(1));
        let mut upstream = FakeUpstream::default();
        upstream.responses.insert("open-sgf".to_string(), vec![]);
        upstream
            .responses
            .insert("sgfdevs".to_string(), vec![moved.clone()]);

        reconciler(
            vec![group("open-sgf"), group("sgfdevs")],
            Arc::clone(&store),
            upstream,
            FakeTokens { fail: false },
        )
        .run()
        .await;

        let event = store.event("mover").expect("event kept in store");
        assert!(event.lifecycle.is_active());
        assert_eq!(event.group.url_name, "sgfdevs");
    }

    #[test]
    fn registry_parses_groups_yaml() {
        let text = "groups:\n  - name: SGF Devs\n    url_name: sgfdevs\n  - name: Open SGF\n    url_name: open-sgf\n";
        let registry: GroupRegistry = serde_yaml::from_str(text).expect("parse");
        assert_eq!(registry.groups.len(), 2);
        assert_eq!(registry.groups[0].url_name, "sgfdevs");
    }

    #[test]
    fn token_params_parse_from_env_shape() {
        let params = parse_token_params(
            "grant_type=urn:ietf:params:oauth:grant-type:jwt-bearer;assertion=signed.jwt.value",
        );
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].0, "grant_type");
        assert_eq!(params[1], ("assertion".to_string(), "signed.jwt.value".to_string()));
        assert!(parse_token_params("").is_empty());
    }
}
