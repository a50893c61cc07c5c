// Live arrivals from the operator API
//
// Request:  POST <url>  {"stationid": 20558, "triptype": 1}
// Response: {"Issuccess": true, "data": [{"routeno", "tostationname", "arrivaltime"}, ...]}
//
// `arrivaltime` is "DD-MM-YYYY HH:MM:SS" in Indian Standard Time.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Asia::Kolkata;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ArrivalsError, Result};
use crate::models::{LineId, StopId, TimetableResult, Trip};
use crate::normalize::normalize_destination;

const ARRIVAL_TIME_FORMAT: &str = "%d-%m-%Y %H:%M:%S";
const OUTBOUND_TRIP_TYPE: u8 = 1;
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
const RETRY_PAUSE: Duration = Duration::from_millis(250);

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ArrivalsRequest {
    stationid: i64,
    triptype: u8,
}

#[derive(Debug, Deserialize)]
struct ArrivalsResponse {
    #[serde(rename = "Issuccess", default)]
    is_success: bool,
    #[serde(default)]
    data: Option<Vec<ArrivalRecord>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArrivalRecord {
    #[serde(default)]
    pub routeno: Option<String>,
    #[serde(default)]
    pub tostationname: Option<String>,
    #[serde(default)]
    pub arrivaltime: Option<String>,
}

/// Parses an operator timestamp into Indian Standard Time.
pub fn parse_arrival_time(raw: &str) -> Option<DateTime<Tz>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), ARRIVAL_TIME_FORMAT).ok()?;
    Kolkata.from_local_datetime(&naive).single()
}

// ============================================================================
// Feed client
// ============================================================================

#[async_trait]
pub trait ArrivalsFeed: Send + Sync {
    /// Raw arrival records for a stop. An empty list means the feed had
    /// nothing usable.
    async fn arrivals(&self, stop_id: &StopId) -> Result<Vec<ArrivalRecord>>;
}

pub struct HttpArrivalsFeed {
    url: String,
    client: reqwest::Client,
    retries: u32,
}

impl HttpArrivalsFeed {
    pub fn new(url: &str, timeout: Duration, retries: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ArrivalsError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: url.to_string(),
            client,
            retries,
        })
    }

    async fn post_once(&self, body: &ArrivalsRequest) -> std::result::Result<reqwest::Response, reqwest::Error> {
        self.client
            .post(&self.url)
            .header("lan", "en")
            .header("deviceType", "WEB")
            .json(body)
            .send()
            .await
    }

    async fn post(&self, body: &ArrivalsRequest) -> Result<reqwest::Response> {
        send_with_retries(self.retries, || self.post_once(body)).await
    }
}

/// Runs `send` once plus up to `retries` more times. Only connect and timeout
/// failures are retried; any response, whatever its status, is returned as is.
pub(crate) async fn send_with_retries<F, Fut>(retries: u32, mut send: F) -> Result<reqwest::Response>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
{
    let mut attempt = 0;
    loop {
        match send().await {
            Ok(response) => return Ok(response),
            Err(e) if attempt < retries && (e.is_timeout() || e.is_connect()) => {
                attempt += 1;
                warn!(attempt, error = %e, "Live feed request failed, retrying");
                tokio::time::sleep(RETRY_PAUSE).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[async_trait]
impl ArrivalsFeed for HttpArrivalsFeed {
    async fn arrivals(&self, stop_id: &StopId) -> Result<Vec<ArrivalRecord>> {
        let body = ArrivalsRequest {
            stationid: stop_id.station_id()?,
            triptype: OUTBOUND_TRIP_TYPE,
        };

        let response = self.post(&body).await?;
        if !response.status().is_success() {
            return Err(ArrivalsError::UpstreamStatus {
                status: response.status().as_u16(),
                url: self.url.clone(),
            });
        }

        let text = response.text().await?;
        decode_response(&text)
    }
}

fn decode_response(text: &str) -> Result<Vec<ArrivalRecord>> {
    let payload: ArrivalsResponse = serde_json::from_str(text)
        .map_err(|e| ArrivalsError::ParseError(format!("Invalid live feed JSON: {}", e)))?;

    if !payload.is_success {
        debug!("Live feed reported Issuccess=false");
        return Ok(Vec::new());
    }

    Ok(payload.data.unwrap_or_default())
}

// ============================================================================
// Adapter
// ============================================================================

/// Turns raw feed records into a timetable constrained by the static schedule.
pub struct LiveFeedAdapter {
    feed: Box<dyn ArrivalsFeed>,
    window: ChronoDuration,
}

impl LiveFeedAdapter {
    pub fn new(feed: Box<dyn ArrivalsFeed>, window: ChronoDuration) -> Self {
        Self { feed, window }
    }

    /// `Ok(None)` when the feed has nothing usable for this stop.
    pub async fn fetch(
        &self,
        stop_id: &StopId,
        allowed_routes: &BTreeSet<String>,
        static_towards: Option<LineId>,
        now: DateTime<Utc>,
    ) -> Result<Option<TimetableResult>> {
        let records = self.feed.arrivals(stop_id).await?;
        debug!(stop_id = %stop_id, records = records.len(), "Live feed records received");

        Ok(assemble(&records, allowed_routes, static_towards, now, self.window))
    }
}

/// Filters, resolves and orders live records.
///
/// A record survives only if its route is allowed, its timestamp parses, and
/// it arrives within `[now, now + window]`.
pub fn assemble(
    records: &[ArrivalRecord],
    allowed_routes: &BTreeSet<String>,
    static_towards: Option<LineId>,
    now: DateTime<Utc>,
    window: ChronoDuration,
) -> Option<TimetableResult> {
    let trips: Vec<Trip> = records
        .iter()
        .filter_map(|record| {
            let route = record.routeno.as_deref()?.trim();
            if !allowed_routes.contains(route) {
                return None;
            }

            let arrival = parse_arrival_time(record.arrivaltime.as_deref()?)?;
            let until = arrival.with_timezone(&Utc) - now;
            if until < ChronoDuration::zero() || until > window {
                return None;
            }

            let towards = static_towards.unwrap_or_else(|| normalize_destination(record.tostationname.as_deref()));
            Some(Trip::new(route, arrival.time(), towards))
        })
        .collect();

    if trips.is_empty() {
        return None;
    }

    let towards = static_towards
        .or_else(|| trips.first().map(|t| t.towards).filter(LineId::is_known))
        .unwrap_or_default();

    Some(TimetableResult::new(trips, towards))
}
