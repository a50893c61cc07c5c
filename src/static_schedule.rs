// Static timetable sources
//
// A timetable is either read from a local directory or fetched over HTTP from
// `<origin>/timetables/<stopId>-timetable.csv`. `CachedTimetables` wraps either
// one with a per-stop time-to-live.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{ArrivalsError, Result};
use crate::models::{StopId, TimetableResult};
use crate::timetable_csv::parse_timetable;

#[async_trait]
pub trait TimetableSource: Send + Sync {
    async fn load(&self, stop_id: &StopId) -> Result<TimetableResult>;
}

// ============================================================================
// Directory source
// ============================================================================

pub struct DirTimetableSource {
    dir: PathBuf,
}

impl DirTimetableSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, stop_id: &StopId) -> PathBuf {
        self.dir.join(stop_id.timetable_file_name())
    }
}

#[async_trait]
impl TimetableSource for DirTimetableSource {
    async fn load(&self, stop_id: &StopId) -> Result<TimetableResult> {
        let path = self.path_for(stop_id);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ArrivalsError::FileError(format!("Failed to read {}: {}", path.display(), e)))?;

        Ok(parse_timetable(&text))
    }
}

// ============================================================================
// HTTP source
// ============================================================================

pub struct HttpTimetableSource {
    origin: String,
    client: reqwest::Client,
}

impl HttpTimetableSource {
    pub fn new(origin: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ArrivalsError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            origin: origin.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn url_for(&self, stop_id: &StopId) -> String {
        format!("{}/timetables/{}", self.origin, stop_id.timetable_file_name())
    }
}

#[async_trait]
impl TimetableSource for HttpTimetableSource {
    async fn load(&self, stop_id: &StopId) -> Result<TimetableResult> {
        let url = self.url_for(stop_id);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(ArrivalsError::UpstreamStatus {
                status: response.status().as_u16(),
                url,
            });
        }

        let body = response.text().await?;
        Ok(parse_timetable(&body))
    }
}

// ============================================================================
// TTL cache
// ============================================================================

struct CacheEntry {
    loaded_at: Instant,
    timetable: TimetableResult,
}

/// Memoizes successful loads per stop for `ttl`. Failures are never cached so
/// the next request retries the source.
pub struct CachedTimetables<S> {
    inner: S,
    ttl: Duration,
    entries: Mutex<HashMap<StopId, CacheEntry>>,
}

impl<S: TimetableSource> CachedTimetables<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lookup(&self, stop_id: &StopId, now: Instant) -> Option<TimetableResult> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(stop_id)
            .filter(|entry| now.saturating_duration_since(entry.loaded_at) < self.ttl)
            .map(|entry| entry.timetable.clone())
    }

    fn store(&self, stop_id: &StopId, timetable: &TimetableResult, now: Instant) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|_, entry| now.saturating_duration_since(entry.loaded_at) < self.ttl);
            entries.insert(
                stop_id.clone(),
                CacheEntry {
                    loaded_at: now,
                    timetable: timetable.clone(),
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<S: TimetableSource> TimetableSource for CachedTimetables<S> {
    async fn load(&self, stop_id: &StopId) -> Result<TimetableResult> {
        if let Some(hit) = self.lookup(stop_id, Instant::now()) {
            debug!(stop_id = %stop_id, "Static timetable served from cache");
            return Ok(hit);
        }

        let timetable = self.inner.load(stop_id).await?;
        info!(stop_id = %stop_id, trips = timetable.trips().len(), "Static timetable loaded");
        self.store(stop_id, &timetable, Instant::now());
        Ok(timetable)
    }
}
